//! Network addresses of crawl targets and the entries of `addr` messages.

use bitcoin::p2p::address::Address;
use data_encoding::BASE32_NOPAD;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

/// OnionCat prefix used to carry onion services inside 16 byte address fields.
pub const ONION_PREFIX: [u8; 6] = [0xFD, 0x87, 0xD8, 0x7E, 0xEB, 0x43];

/// Suffix of onion service host names.
const ONION_SUFFIX: &str = ".onion";

/// Number of service id bytes which fit behind the [`ONION_PREFIX`].
const ONION_ID_LEN: usize = 10;

/// Address of a node on the network.
///
/// Ordering is only meaningful for deterministic iteration, it carries no
/// network semantics.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeAddress {
    /// IPv4 address.
    Ipv4(Ipv4Addr),
    /// IPv6 address.
    Ipv6(Ipv6Addr),
    /// Onion service host name, lowercase and including the `.onion` suffix.
    Onion(String),
}

impl NodeAddress {
    /// Returns `true` for IPv6 addresses.
    pub fn is_ipv6(&self) -> bool {
        matches!(self, NodeAddress::Ipv6(_))
    }

    /// Returns `true` for onion service addresses.
    pub fn is_onion(&self) -> bool {
        matches!(self, NodeAddress::Onion(_))
    }

    /// Returns the IP address when this is not an onion service.
    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            NodeAddress::Ipv4(ip) => Some(IpAddr::V4(*ip)),
            NodeAddress::Ipv6(ip) => Some(IpAddr::V6(*ip)),
            NodeAddress::Onion(_) => None,
        }
    }

    /// Extracts the address carried by an `addr` message entry.
    ///
    /// OnionCat mapped entries become onion host names, IPv4-mapped IPv6
    /// entries become plain IPv4.
    pub fn from_wire(address: &Address) -> NodeAddress {
        let mut bytes = [0u8; 16];
        for (i, segment) in address.address.iter().enumerate() {
            bytes[i * 2..i * 2 + 2].copy_from_slice(&segment.to_be_bytes());
        }

        if bytes[..ONION_PREFIX.len()] == ONION_PREFIX {
            let id = BASE32_NOPAD
                .encode(&bytes[ONION_PREFIX.len()..])
                .to_lowercase();
            return NodeAddress::Onion(format!("{id}{ONION_SUFFIX}"));
        }

        let ipv6 = Ipv6Addr::from(bytes);
        match ipv6.to_ipv4_mapped() {
            Some(ipv4) => NodeAddress::Ipv4(ipv4),
            None => NodeAddress::Ipv6(ipv6),
        }
    }

    /// Maps an onion host name to a deterministic IPv6 surrogate.
    ///
    /// The surrogate is the OnionCat prefix followed by the first ten bytes of
    /// the decoded service id. Returns `None` if the name is not valid base32.
    pub fn onion_surrogate(host: &str) -> Option<Ipv6Addr> {
        let id = host.strip_suffix(ONION_SUFFIX)?;
        let decoded = BASE32_NOPAD.decode(id.to_uppercase().as_bytes()).ok()?;
        if decoded.len() < ONION_ID_LEN {
            return None;
        }

        let mut bytes = [0u8; 16];
        bytes[..ONION_PREFIX.len()].copy_from_slice(&ONION_PREFIX);
        bytes[ONION_PREFIX.len()..].copy_from_slice(&decoded[..ONION_ID_LEN]);
        Some(Ipv6Addr::from(bytes))
    }

    /// Socket address for IP targets.
    pub fn socket_addr(&self, port: u16) -> Option<SocketAddr> {
        self.ip().map(|ip| SocketAddr::new(ip, port))
    }
}

impl From<Ipv4Addr> for NodeAddress {
    fn from(ip: Ipv4Addr) -> Self {
        NodeAddress::Ipv4(ip)
    }
}

impl From<IpAddr> for NodeAddress {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(ipv4) => NodeAddress::Ipv4(ipv4),
            IpAddr::V6(ipv6) => match ipv6.to_ipv4_mapped() {
                Some(ipv4) => NodeAddress::Ipv4(ipv4),
                None => NodeAddress::Ipv6(ipv6),
            },
        }
    }
}

/// Error returned when a string is neither an IP address nor an onion host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressParseError(String);

impl fmt::Display for AddressParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid node address: {}", self.0)
    }
}

impl std::error::Error for AddressParseError {}

impl FromStr for NodeAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        if let Some(id) = lower.strip_suffix(ONION_SUFFIX) {
            if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(AddressParseError(s.to_string()));
            }
            return Ok(NodeAddress::Onion(lower));
        }

        lower
            .parse::<IpAddr>()
            .map(NodeAddress::from)
            .map_err(|_| AddressParseError(s.to_string()))
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeAddress::Ipv4(ip) => write!(f, "{ip}"),
            NodeAddress::Ipv6(ip) => write!(f, "{ip}"),
            NodeAddress::Onion(host) => write!(f, "{host}"),
        }
    }
}

/// One entry of an `addr` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressEntry {
    /// Unix time the sender last saw the address.
    pub timestamp: u32,
    /// The advertised address, `None` if it could not be interpreted.
    pub address: Option<NodeAddress>,
    /// Advertised port, `0` when unknown.
    pub port: u16,
    /// Advertised service bits.
    pub services: u64,
}

impl AddressEntry {
    /// Convert a raw `addr` message entry.
    pub fn from_wire(timestamp: u32, address: &Address) -> Self {
        AddressEntry {
            timestamp,
            address: Some(NodeAddress::from_wire(address)),
            port: address.port,
            services: address.services.to_u64(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::p2p::ServiceFlags;

    #[test]
    fn test_parse_addresses() {
        assert_eq!(
            "1.2.3.4".parse::<NodeAddress>().unwrap(),
            NodeAddress::Ipv4(Ipv4Addr::new(1, 2, 3, 4))
        );
        assert!("2001:db8::1".parse::<NodeAddress>().unwrap().is_ipv6());
        assert_eq!(
            "::ffff:1.2.3.4".parse::<NodeAddress>().unwrap(),
            NodeAddress::Ipv4(Ipv4Addr::new(1, 2, 3, 4))
        );
        assert_eq!(
            "ABCDEFGHIJKLMNOP.onion".parse::<NodeAddress>().unwrap(),
            NodeAddress::Onion("abcdefghijklmnop.onion".to_string())
        );
        assert!("not-an-address".parse::<NodeAddress>().is_err());
        assert!(".onion".parse::<NodeAddress>().is_err());
        assert!("a|b.onion".parse::<NodeAddress>().is_err());
    }

    #[test]
    fn test_from_ip_addresses() {
        let ipv4 = Ipv4Addr::new(198, 51, 99, 1);
        assert_eq!(NodeAddress::from(ipv4), NodeAddress::Ipv4(ipv4));
        assert_eq!(
            NodeAddress::from(IpAddr::V6(ipv4.to_ipv6_mapped())),
            NodeAddress::Ipv4(ipv4)
        );
    }

    #[test]
    fn test_onion_wire_round_trip() {
        let host = "abcdefghijklmnop.onion";
        let surrogate = NodeAddress::onion_surrogate(host).unwrap();
        assert_eq!(surrogate.octets()[..6], ONION_PREFIX);

        let wire = Address::new(&SocketAddr::new(IpAddr::V6(surrogate), 8333), ServiceFlags::NONE);
        assert_eq!(NodeAddress::from_wire(&wire), NodeAddress::Onion(host.to_string()));
    }

    #[test]
    fn test_onion_surrogate_is_deterministic() {
        let v3 = "pg6mmjiyjmcrsslvykfwnntlaru7p5svn6y2ymmju6nubxndf4pscryd.onion";
        assert_eq!(
            NodeAddress::onion_surrogate(v3),
            NodeAddress::onion_surrogate(v3)
        );
        assert!(NodeAddress::onion_surrogate(v3).is_some());
        assert_eq!(NodeAddress::onion_surrogate("!!!!.onion"), None);
        assert_eq!(NodeAddress::onion_surrogate("abc.onion"), None);
    }

    #[test]
    fn test_wire_entry_ipv4_mapped() {
        let wire = Address::new(
            &SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 8333),
            ServiceFlags::NETWORK,
        );
        let entry = AddressEntry::from_wire(1_700_000_000, &wire);
        assert_eq!(entry.address, Some(NodeAddress::Ipv4(Ipv4Addr::new(8, 8, 8, 8))));
        assert_eq!(entry.port, 8333);
        assert_eq!(entry.services, ServiceFlags::NETWORK.to_u64());
    }
}
