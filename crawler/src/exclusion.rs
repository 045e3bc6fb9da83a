//! Address exclusion.
//!
//! An address is excluded when it is private or link-local, falls inside a
//! configured or bogon network, or belongs to an excluded autonomous system.
//! Onion addresses are checked through their IPv6 surrogate. Anything that
//! cannot be interpreted is excluded.

use bitcoin_census_connection::NodeAddress;
use log::{debug, info, warn};
use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::str::FromStr;
use std::sync::RwLock;
use std::time::Duration;

/// Timeout of a single bogon feed download.
pub const BOGON_FETCH_TIMEOUT: Duration = Duration::from_secs(15);

/// Networks excluded regardless of configuration.
const PRIVATE_NETWORKS: &[&str] = &[
    "0.0.0.0/8",
    "10.0.0.0/8",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "172.16.0.0/12",
    "192.0.0.0/29",
    "192.0.0.170/31",
    "192.0.2.0/24",
    "192.168.0.0/16",
    "198.18.0.0/15",
    "198.51.100.0/24",
    "203.0.113.0/24",
    "240.0.0.0/4",
    "255.255.255.255/32",
    "::1/128",
    "::/128",
    "::ffff:0:0/96",
    "100::/64",
    "2001::/23",
    "2001:db8::/32",
    "2001:10::/28",
    "fc00::/7",
    "fe80::/10",
];

/// Address family of a [`NetworkRule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    fn bits(self) -> u8 {
        match self {
            IpFamily::V4 => 32,
            IpFamily::V6 => 128,
        }
    }

    fn of(ip: IpAddr) -> IpFamily {
        match ip {
            IpAddr::V4(_) => IpFamily::V4,
            IpAddr::V6(_) => IpFamily::V6,
        }
    }
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpFamily::V4 => write!(f, "IPv4"),
            IpFamily::V6 => write!(f, "IPv6"),
        }
    }
}

/// Error returned for an unparsable network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkRuleError(String);

impl fmt::Display for NetworkRuleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid network: {}", self.0)
    }
}

impl std::error::Error for NetworkRuleError {}

fn ip_bits(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(ip) => u32::from(ip) as u128,
        IpAddr::V6(ip) => u128::from(ip),
    }
}

/// A network as a (network, mask) pair.
///
/// An address is inside when `address & mask == network`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetworkRule {
    family: IpFamily,
    network: u128,
    mask: u128,
    prefix_len: u8,
}

impl NetworkRule {
    /// Network of `ip` with the given prefix length. Host bits are dropped.
    pub fn new(ip: IpAddr, prefix_len: u8) -> Result<Self, NetworkRuleError> {
        let family = IpFamily::of(ip);
        let bits = family.bits();
        if prefix_len > bits {
            return Err(NetworkRuleError(format!("{ip}/{prefix_len}")));
        }

        let full = match family {
            IpFamily::V4 => u32::MAX as u128,
            IpFamily::V6 => u128::MAX,
        };
        let host_bits = u32::from(bits - prefix_len);
        let mask = full.checked_shl(host_bits).map_or(0, |m| m & full);

        Ok(NetworkRule {
            family,
            network: ip_bits(ip) & mask,
            mask,
            prefix_len,
        })
    }

    pub fn family(&self) -> IpFamily {
        self.family
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        IpFamily::of(ip) == self.family && ip_bits(ip) & self.mask == self.network
    }

    fn network_ip(&self) -> IpAddr {
        match self.family {
            IpFamily::V4 => IpAddr::V4(Ipv4Addr::from(self.network as u32)),
            IpFamily::V6 => IpAddr::V6(Ipv6Addr::from(self.network)),
        }
    }
}

/// Parses `address/prefix`, or a bare address as a single host network.
impl FromStr for NetworkRule {
    type Err = NetworkRuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (ip, prefix_len) = match s.split_once('/') {
            Some((ip, len)) => (ip, Some(len)),
            None => (s, None),
        };
        let ip = ip
            .parse::<IpAddr>()
            .map_err(|_| NetworkRuleError(s.to_string()))?;
        let prefix_len = match prefix_len {
            Some(len) => len
                .parse::<u8>()
                .map_err(|_| NetworkRuleError(s.to_string()))?,
            None => IpFamily::of(ip).bits(),
        };
        NetworkRule::new(ip, prefix_len)
    }
}

impl fmt::Display for NetworkRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network_ip(), self.prefix_len)
    }
}

/// Parse a network list, one network per line.
///
/// `#` starts a comment. Lines of the wrong family or which do not parse are
/// skipped.
pub fn parse_network_list(text: &str, family: IpFamily) -> Vec<NetworkRule> {
    let mut rules = Vec::new();
    for line in text.lines() {
        let line = line.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            continue;
        }
        match line.parse::<NetworkRule>() {
            Ok(rule) if rule.family() == family => rules.push(rule),
            Ok(rule) => debug!("Skipping {rule} in {family} network list"),
            Err(e) => debug!("{e}, skipping"),
        }
    }
    rules
}

/// Parse an autonomous system number, with or without the `AS` prefix.
pub fn parse_asn(s: &str) -> Option<u32> {
    let s = s.trim();
    let digits = s
        .strip_prefix("AS")
        .or_else(|| s.strip_prefix("as"))
        .unwrap_or(s);
    digits.parse().ok()
}

/// Maps addresses to their autonomous system.
pub trait AsnLookup: Send + Sync {
    fn asn(&self, ip: IpAddr) -> Option<u32>;
}

/// [`AsnLookup`] over a MaxMind GeoLite2-ASN database.
pub struct MaxMindAsn {
    reader: maxminddb::Reader<Vec<u8>>,
}

impl MaxMindAsn {
    pub fn open(path: &Path) -> Result<Self, maxminddb::MaxMindDBError> {
        let reader = maxminddb::Reader::open_readfile(path)?;
        Ok(MaxMindAsn { reader })
    }
}

impl AsnLookup for MaxMindAsn {
    fn asn(&self, ip: IpAddr) -> Option<u32> {
        self.reader
            .lookup::<maxminddb::geoip2::Asn>(ip)
            .ok()
            .and_then(|record| record.autonomous_system_number)
    }
}

/// Decides whether an address may be crawled.
///
/// Shared by every worker. The bogon part of the network lists can be swapped
/// out while the filter is in use.
pub struct ExclusionFilter {
    private: Vec<NetworkRule>,
    configured: Vec<NetworkRule>,
    bogons: RwLock<Vec<NetworkRule>>,
    excluded_asns: HashSet<u32>,
    asn_lookup: Option<Box<dyn AsnLookup>>,
}

impl fmt::Debug for ExclusionFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExclusionFilter")
            .field("configured", &self.configured.len())
            .field("bogons", &self.bogon_count())
            .field("excluded_asns", &self.excluded_asns.len())
            .field("asn_lookup", &self.asn_lookup.is_some())
            .finish()
    }
}

impl Default for ExclusionFilter {
    fn default() -> Self {
        ExclusionFilter::new(Vec::new(), HashSet::new(), None)
    }
}

impl ExclusionFilter {
    /// Filter with statically configured networks of both families.
    pub fn new(
        configured: Vec<NetworkRule>,
        excluded_asns: HashSet<u32>,
        asn_lookup: Option<Box<dyn AsnLookup>>,
    ) -> Self {
        let private = PRIVATE_NETWORKS
            .iter()
            .filter_map(|network| network.parse().ok())
            .collect();

        ExclusionFilter {
            private,
            configured,
            bogons: RwLock::new(Vec::new()),
            excluded_asns,
            asn_lookup,
        }
    }

    /// Whether `address` must not be crawled.
    pub fn is_excluded(&self, address: &NodeAddress) -> bool {
        let ip = match address {
            NodeAddress::Onion(host) => match NodeAddress::onion_surrogate(host) {
                Some(surrogate) => IpAddr::V6(surrogate),
                None => return true,
            },
            NodeAddress::Ipv4(ip) => IpAddr::V4(*ip),
            NodeAddress::Ipv6(ip) => IpAddr::V6(*ip),
        };

        if !address.is_onion() && self.is_private(ip) {
            return true;
        }

        if self.configured.iter().any(|rule| rule.contains(ip)) {
            return true;
        }

        if self.in_bogons(ip) {
            return true;
        }

        self.in_excluded_asn(ip)
    }

    fn is_private(&self, ip: IpAddr) -> bool {
        self.private.iter().any(|rule| rule.contains(ip))
    }

    fn in_bogons(&self, ip: IpAddr) -> bool {
        match self.bogons.read() {
            Ok(bogons) => bogons.iter().any(|rule| rule.contains(ip)),
            Err(poisoned) => poisoned.into_inner().iter().any(|rule| rule.contains(ip)),
        }
    }

    fn in_excluded_asn(&self, ip: IpAddr) -> bool {
        if self.excluded_asns.is_empty() {
            return false;
        }
        self.asn_lookup
            .as_ref()
            .and_then(|lookup| lookup.asn(ip))
            .is_some_and(|asn| self.excluded_asns.contains(&asn))
    }

    /// Replace the bogon networks of one family.
    pub fn replace_bogons(&self, family: IpFamily, rules: Vec<NetworkRule>) {
        let mut bogons = match self.bogons.write() {
            Ok(bogons) => bogons,
            Err(poisoned) => poisoned.into_inner(),
        };
        bogons.retain(|rule| rule.family() != family);
        bogons.extend(rules);
    }

    pub fn bogon_count(&self) -> usize {
        match self.bogons.read() {
            Ok(bogons) => bogons.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

/// Downloads bogon feeds into an [`ExclusionFilter`].
#[derive(Debug, Clone)]
pub struct BogonFetcher {
    client: reqwest::Client,
    ipv4_urls: Vec<String>,
    ipv6_urls: Vec<String>,
}

impl BogonFetcher {
    pub fn new(ipv4_urls: Vec<String>, ipv6_urls: Vec<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(BOGON_FETCH_TIMEOUT)
            .build()?;
        Ok(BogonFetcher {
            client,
            ipv4_urls,
            ipv6_urls,
        })
    }

    /// Fetch every feed and swap the results into `filter`.
    ///
    /// A family whose feeds all fail keeps its previous bogons.
    pub async fn refresh(&self, filter: &ExclusionFilter) {
        for (family, urls) in [
            (IpFamily::V4, &self.ipv4_urls),
            (IpFamily::V6, &self.ipv6_urls),
        ] {
            if urls.is_empty() {
                continue;
            }
            if let Some(rules) = self.fetch_family(family, urls).await {
                info!("Loaded {} {family} bogon networks", rules.len());
                filter.replace_bogons(family, rules);
            }
        }
    }

    async fn fetch_family(&self, family: IpFamily, urls: &[String]) -> Option<Vec<NetworkRule>> {
        let mut rules = Vec::new();
        let mut fetched = false;
        for url in urls {
            match self.fetch(url).await {
                Ok(text) => {
                    rules.extend(parse_network_list(&text, family));
                    fetched = true;
                }
                Err(e) => warn!("Failed to fetch {family} bogons from {url}: {e}"),
            }
        }
        fetched.then_some(rules)
    }

    async fn fetch(&self, url: &str) -> Result<String, reqwest::Error> {
        self.client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await
    }
}
