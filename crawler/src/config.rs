//! Crawler configuration.
//!
//! A [`CrawlConfig`] is read from a TOML file with every option defaulted,
//! then validated once into an immutable [`CrawlSettings`] which is shared by
//! every component.
//!
//! ```toml
//! magic_number = "f9beb4d9"
//! port = 8333
//! workers = 350
//! ipv6 = true
//! exclude_ipv4_bogons = true
//! store_url = "redis://127.0.0.1:6379/0"
//! ```

use crate::exclusion::{parse_asn, NetworkRule};
use bitcoin::p2p::{Magic, ServiceFlags};
use bitcoin_census_connection::{
    ConnectionConfiguration, NodeAddress, UserAgent, DEFAULT_PROTOCOL_VERSION,
};
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Service bits assumed for seed nodes before their handshake, `NODE_NETWORK`.
pub const SEED_SERVICES: u64 = 1;

const DEFAULT_MAGIC: &str = "f9beb4d9";
const DEFAULT_PORT: u16 = 8333;
const DEFAULT_SOCKET_TIMEOUT: u64 = 15;
const DEFAULT_CRON_DELAY: u64 = 10;
const DEFAULT_SNAPSHOT_DELAY: u64 = 245;
const DEFAULT_DRAIN_GRACE: u64 = 30;
const DEFAULT_SAMPLE_INTERVAL: u64 = 5;
const DEFAULT_MAX_AGE: u64 = 86400;
const DEFAULT_PEERS_PER_NODE: usize = 1000;
const DEFAULT_IPV6_PREFIX: u8 = 64;
const DEFAULT_NODES_PER_IPV6_PREFIX: u64 = 1;
const DEFAULT_WORKERS: usize = 350;
const DEFAULT_TOR_PROXY: &str = "127.0.0.1:9050";
const DEFAULT_CRAWL_DIR: &str = "data/crawl";
const DEFAULT_STORE_URL: &str = "memory://";

const DEFAULT_SEEDERS: &[&str] = &[
    "seed.bitcoin.sipa.be",
    "dnsseed.bluematt.me",
    "seed.bitcoinstats.com",
    "seed.bitnodes.io",
    "seed.bitcoin.jonasschnelli.ch",
    "seed.btc.petertodd.net",
    "seed.bitcoin.sprovoost.nl",
    "dnsseed.emzy.de",
    "seed.bitcoin.wiz.biz",
];

const DEFAULT_BOGON_IPV4_URL: &str =
    "https://www.team-cymru.org/Services/Bogons/fullbogons-ipv4.txt";
const DEFAULT_BOGON_IPV6_URL: &str =
    "https://www.team-cymru.org/Services/Bogons/fullbogons-ipv6.txt";

/// Errors from loading or validating the configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// The file could not be read.
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The file is not valid TOML for [`CrawlConfig`].
    Parse(toml::de::Error),
    /// An option holds an unusable value.
    Invalid { option: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(option: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            option,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "Cannot read {}: {source}", path.display())
            }
            ConfigError::Parse(err) => write!(f, "Cannot parse configuration: {err}"),
            ConfigError::Invalid { option, reason } => write!(f, "Invalid {option}: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse(err) => Some(err),
            ConfigError::Invalid { .. } => None,
        }
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::Parse(err)
    }
}

/// Raw configuration as written in the file. Durations are in seconds.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CrawlConfig {
    /// Network magic as 8 hex digits.
    pub magic_number: String,
    pub port: u16,
    pub protocol_version: u32,
    pub user_agent: Option<String>,
    /// Service bits we advertise.
    pub services: u64,
    pub relay: bool,
    pub source_address: IpAddr,
    pub socket_timeout: u64,
    pub cron_delay: u64,
    /// Minimum length of an epoch.
    pub snapshot_delay: u64,
    /// Time given to in-flight attempts once the queue drained.
    pub drain_grace: u64,
    pub sample_interval: u64,
    pub max_age: u64,
    pub peers_per_node: usize,
    pub ipv6: bool,
    pub ipv6_prefix: u8,
    pub nodes_per_ipv6_prefix: u64,
    pub workers: usize,
    pub seeders: Vec<String>,
    pub onion: bool,
    pub onion_nodes: Vec<String>,
    pub tor_proxy: Option<String>,
    pub exclude_ipv4_networks: Vec<String>,
    pub exclude_ipv6_networks: Vec<String>,
    pub exclude_asns: Vec<String>,
    pub exclude_ipv4_bogons: bool,
    pub exclude_ipv6_bogons: bool,
    pub bogon_ipv4_urls: Vec<String>,
    pub bogon_ipv6_urls: Vec<String>,
    pub asn_database: Option<PathBuf>,
    pub include_checked: bool,
    pub keep_duplication: bool,
    pub crawl_dir: PathBuf,
    pub logfile: Option<PathBuf>,
    pub debug: bool,
    pub store_url: String,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        CrawlConfig {
            magic_number: DEFAULT_MAGIC.to_string(),
            port: DEFAULT_PORT,
            protocol_version: DEFAULT_PROTOCOL_VERSION,
            user_agent: None,
            services: 0,
            relay: false,
            source_address: IpAddr::from([0, 0, 0, 0]),
            socket_timeout: DEFAULT_SOCKET_TIMEOUT,
            cron_delay: DEFAULT_CRON_DELAY,
            snapshot_delay: DEFAULT_SNAPSHOT_DELAY,
            drain_grace: DEFAULT_DRAIN_GRACE,
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
            max_age: DEFAULT_MAX_AGE,
            peers_per_node: DEFAULT_PEERS_PER_NODE,
            ipv6: false,
            ipv6_prefix: DEFAULT_IPV6_PREFIX,
            nodes_per_ipv6_prefix: DEFAULT_NODES_PER_IPV6_PREFIX,
            workers: DEFAULT_WORKERS,
            seeders: DEFAULT_SEEDERS.iter().map(|s| s.to_string()).collect(),
            onion: false,
            onion_nodes: Vec::new(),
            tor_proxy: None,
            exclude_ipv4_networks: Vec::new(),
            exclude_ipv6_networks: Vec::new(),
            exclude_asns: Vec::new(),
            exclude_ipv4_bogons: false,
            exclude_ipv6_bogons: false,
            bogon_ipv4_urls: vec![DEFAULT_BOGON_IPV4_URL.to_string()],
            bogon_ipv6_urls: vec![DEFAULT_BOGON_IPV6_URL.to_string()],
            asn_database: None,
            include_checked: false,
            keep_duplication: false,
            crawl_dir: PathBuf::from(DEFAULT_CRAWL_DIR),
            logfile: None,
            debug: false,
            store_url: DEFAULT_STORE_URL.to_string(),
        }
    }
}

impl FromStr for CrawlConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(toml::from_str(s)?)
    }
}

impl CrawlConfig {
    /// Read a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        text.parse()
    }

    /// Check every option and convert it to its typed form.
    pub fn validate(&self) -> Result<CrawlSettings, ConfigError> {
        let magic = Magic::from_str(&self.magic_number)
            .map_err(|e| ConfigError::invalid("magic_number", e.to_string()))?;

        let user_agent = match &self.user_agent {
            Some(agent) => UserAgent::new(agent.clone())
                .map_err(|e| ConfigError::invalid("user_agent", e.to_string()))?,
            None => UserAgent::default(),
        };

        if self.port == 0 {
            return Err(ConfigError::invalid("port", "must not be 0"));
        }
        if self.workers == 0 {
            return Err(ConfigError::invalid("workers", "must be at least 1"));
        }
        if self.ipv6_prefix > 128 {
            return Err(ConfigError::invalid(
                "ipv6_prefix",
                format!("{} is longer than 128", self.ipv6_prefix),
            ));
        }
        for (option, value) in [
            ("socket_timeout", self.socket_timeout),
            ("cron_delay", self.cron_delay),
            ("sample_interval", self.sample_interval),
            ("max_age", self.max_age),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(option, "must be at least 1 second"));
            }
        }

        let mut excluded_networks = parse_networks(
            "exclude_ipv4_networks",
            &self.exclude_ipv4_networks,
            crate::exclusion::IpFamily::V4,
        )?;
        excluded_networks.extend(parse_networks(
            "exclude_ipv6_networks",
            &self.exclude_ipv6_networks,
            crate::exclusion::IpFamily::V6,
        )?);

        let excluded_asns = self
            .exclude_asns
            .iter()
            .map(|asn| {
                parse_asn(asn)
                    .ok_or_else(|| ConfigError::invalid("exclude_asns", format!("{asn:?}")))
            })
            .collect::<Result<HashSet<u32>, _>>()?;

        let onion_nodes = self
            .onion_nodes
            .iter()
            .map(|node| match node.parse::<NodeAddress>() {
                Ok(address) if address.is_onion() => Ok(address),
                _ => Err(ConfigError::invalid("onion_nodes", format!("{node:?}"))),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let tor_proxy = match (&self.tor_proxy, self.onion) {
            (Some(proxy), _) => Some(parse_proxy(proxy)?),
            (None, true) => Some(parse_proxy(DEFAULT_TOR_PROXY)?),
            (None, false) => None,
        };

        if !self.store_url.starts_with("memory://") && !self.store_url.starts_with("redis") {
            return Err(ConfigError::invalid(
                "store_url",
                format!("unsupported store {:?}", self.store_url),
            ));
        }

        Ok(CrawlSettings {
            magic,
            port: self.port,
            protocol_version: self.protocol_version,
            user_agent,
            services: self.services,
            relay: self.relay,
            source_address: self.source_address,
            socket_timeout: Duration::from_secs(self.socket_timeout),
            cron_delay: Duration::from_secs(self.cron_delay),
            snapshot_delay: Duration::from_secs(self.snapshot_delay),
            drain_grace: Duration::from_secs(self.drain_grace),
            sample_interval: Duration::from_secs(self.sample_interval),
            max_age: Duration::from_secs(self.max_age),
            peers_per_node: self.peers_per_node,
            ipv6: self.ipv6,
            ipv6_prefix: self.ipv6_prefix,
            nodes_per_ipv6_prefix: self.nodes_per_ipv6_prefix,
            workers: self.workers,
            seeders: self.seeders.clone(),
            onion: self.onion,
            onion_nodes,
            tor_proxy,
            excluded_networks,
            excluded_asns,
            bogon_ipv4_urls: if self.exclude_ipv4_bogons {
                self.bogon_ipv4_urls.clone()
            } else {
                Vec::new()
            },
            bogon_ipv6_urls: if self.exclude_ipv6_bogons {
                self.bogon_ipv6_urls.clone()
            } else {
                Vec::new()
            },
            asn_database: self.asn_database.clone(),
            include_checked: self.include_checked,
            keep_duplication: self.keep_duplication,
            crawl_dir: self.crawl_dir.clone(),
            logfile: self.logfile.clone(),
            debug: self.debug,
            store_url: self.store_url.clone(),
        })
    }
}

fn parse_networks(
    option: &'static str,
    networks: &[String],
    family: crate::exclusion::IpFamily,
) -> Result<Vec<NetworkRule>, ConfigError> {
    networks
        .iter()
        .map(|network| {
            let rule = network
                .parse::<NetworkRule>()
                .map_err(|e| ConfigError::invalid(option, e.to_string()))?;
            if rule.family() != family {
                return Err(ConfigError::invalid(
                    option,
                    format!("{network} is not an {family} network"),
                ));
            }
            Ok(rule)
        })
        .collect()
}

fn parse_proxy(proxy: &str) -> Result<SocketAddr, ConfigError> {
    proxy
        .parse()
        .map_err(|_| ConfigError::invalid("tor_proxy", format!("{proxy:?}")))
}

/// Validated configuration, immutable once the crawler starts.
#[derive(Debug, Clone)]
pub struct CrawlSettings {
    pub magic: Magic,
    pub port: u16,
    pub protocol_version: u32,
    pub user_agent: UserAgent,
    pub services: u64,
    pub relay: bool,
    pub source_address: IpAddr,
    pub socket_timeout: Duration,
    pub cron_delay: Duration,
    pub snapshot_delay: Duration,
    pub drain_grace: Duration,
    pub sample_interval: Duration,
    pub max_age: Duration,
    pub peers_per_node: usize,
    pub ipv6: bool,
    pub ipv6_prefix: u8,
    pub nodes_per_ipv6_prefix: u64,
    pub workers: usize,
    pub seeders: Vec<String>,
    pub onion: bool,
    pub onion_nodes: Vec<NodeAddress>,
    pub tor_proxy: Option<SocketAddr>,
    /// Statically excluded networks of both families.
    pub excluded_networks: Vec<NetworkRule>,
    pub excluded_asns: HashSet<u32>,
    /// Bogon feeds, empty when bogon exclusion is off for the family.
    pub bogon_ipv4_urls: Vec<String>,
    pub bogon_ipv6_urls: Vec<String>,
    pub asn_database: Option<PathBuf>,
    pub include_checked: bool,
    pub keep_duplication: bool,
    pub crawl_dir: PathBuf,
    pub logfile: Option<PathBuf>,
    pub debug: bool,
    pub store_url: String,
}

impl Default for CrawlSettings {
    fn default() -> Self {
        // The defaults are known to validate.
        match CrawlConfig::default().validate() {
            Ok(settings) => settings,
            Err(e) => unreachable!("default configuration is invalid: {e}"),
        }
    }
}

impl CrawlSettings {
    /// Load and validate a configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        CrawlConfig::load(path)?.validate()
    }

    /// Check the values that timers and the admission budget rely on.
    ///
    /// [`CrawlConfig::validate`] already enforces these, but settings can
    /// also be assembled by hand.
    pub fn check(&self) -> Result<(), ConfigError> {
        for (option, value) in [
            ("socket_timeout", self.socket_timeout),
            ("cron_delay", self.cron_delay),
            ("sample_interval", self.sample_interval),
            ("max_age", self.max_age),
        ] {
            if value.is_zero() {
                return Err(ConfigError::invalid(option, "must not be zero"));
            }
        }
        if self.ipv6_prefix > 128 {
            return Err(ConfigError::invalid(
                "ipv6_prefix",
                format!("{} is longer than 128", self.ipv6_prefix),
            ));
        }
        Ok(())
    }

    /// Whether the store is shared between processes.
    pub fn uses_shared_store(&self) -> bool {
        !self.store_url.starts_with("memory://")
    }

    /// Whether any bogon feed is configured.
    pub fn refreshes_bogons(&self) -> bool {
        !self.bogon_ipv4_urls.is_empty() || !self.bogon_ipv6_urls.is_empty()
    }

    /// Connection parameters for crawl attempts.
    pub fn connection_configuration(&self) -> ConnectionConfiguration {
        ConnectionConfiguration::non_listening(self.magic)
            .with_protocol_version(self.protocol_version)
            .with_user_agent(self.user_agent.clone())
            .with_services(ServiceFlags::from(self.services))
            .with_sender_address(self.source_address)
            .with_relay(self.relay)
            .with_socket_timeout(self.socket_timeout)
            .with_proxy(self.tor_proxy)
    }
}
