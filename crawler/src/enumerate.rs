//! Turning `addr` responses into new crawl candidates.

use crate::exclusion::ExclusionFilter;
use crate::node::NodeKey;
use bitcoin_census_connection::AddressEntry;
use std::collections::BTreeSet;
use std::time::Duration;

/// Bounds applied while enumerating one node's address lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnumerationLimits {
    /// Entries last seen longer ago than this are stale.
    pub max_age: Duration,
    /// Stop after admitting this many entries.
    pub max_peers: usize,
    /// Port used for entries advertising port zero.
    pub default_port: u16,
    /// Whether onion addresses are crawled at all.
    pub include_onion: bool,
}

/// Peers admitted from one node's address lists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Enumeration {
    pub peers: BTreeSet<NodeKey>,
    /// Admitted entries, duplicates included.
    pub count: usize,
    /// Entries rejected by the exclusion filter.
    pub excluded: usize,
}

/// Enumerate the admissible peers of a set of address lists.
///
/// Entries are visited in order. An entry is skipped when its age relative
/// to `now` is negative or above the maximum age, when it carries no usable
/// address (onions count as unusable unless enabled), or when the filter
/// excludes it. Enumeration stops as soon as
/// `max_peers` entries were admitted.
///
/// Returns `None` when there were no address lists at all, which tells a node
/// that never answered apart from one that answered with nothing usable.
pub fn enumerate_peers(
    batches: &[Vec<AddressEntry>],
    now: i64,
    limits: &EnumerationLimits,
    filter: &ExclusionFilter,
) -> Option<Enumeration> {
    if batches.is_empty() {
        return None;
    }

    let max_age = i64::try_from(limits.max_age.as_secs()).unwrap_or(i64::MAX);
    let mut enumeration = Enumeration::default();
    if limits.max_peers == 0 {
        return Some(enumeration);
    }

    for entry in batches.iter().flatten() {
        let age = now - i64::from(entry.timestamp);
        if !(0..=max_age).contains(&age) {
            continue;
        }

        let Some(address) = &entry.address else {
            continue;
        };
        if address.is_onion() && !limits.include_onion {
            continue;
        }

        let port = if entry.port == 0 {
            limits.default_port
        } else {
            entry.port
        };

        if filter.is_excluded(address) {
            enumeration.excluded += 1;
            continue;
        }

        enumeration
            .peers
            .insert(NodeKey::new(address.clone(), port, entry.services));
        enumeration.count += 1;
        if enumeration.count >= limits.max_peers {
            break;
        }
    }

    Some(enumeration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin_census_connection::NodeAddress;
    use std::net::Ipv4Addr;

    const NOW: i64 = 1_700_000_000;

    fn limits(max_peers: usize) -> EnumerationLimits {
        EnumerationLimits {
            max_age: Duration::from_secs(3600),
            max_peers,
            default_port: 8333,
            include_onion: false,
        }
    }

    fn entry(last: u8, age: i64) -> AddressEntry {
        AddressEntry {
            timestamp: (NOW - age) as u32,
            address: Some(NodeAddress::Ipv4(Ipv4Addr::new(93, 184, 1, last))),
            port: 8333,
            services: 1,
        }
    }

    #[test]
    fn test_no_batches() {
        let filter = ExclusionFilter::default();
        assert_eq!(enumerate_peers(&[], NOW, &limits(10), &filter), None);

        let empty = enumerate_peers(&[Vec::new()], NOW, &limits(10), &filter).unwrap();
        assert_eq!(empty.count, 0);
        assert!(empty.peers.is_empty());
    }

    #[test]
    fn test_age_filter() {
        let filter = ExclusionFilter::default();
        let batch = vec![
            entry(1, 10),
            entry(2, 999_999_999),
            entry(3, -5),
            entry(4, 3600),
            entry(5, 3601),
            entry(6, 0),
        ];

        let result = enumerate_peers(&[batch], NOW, &limits(100), &filter).unwrap();
        let admitted: Vec<u8> = result
            .peers
            .iter()
            .map(|key| match key.address {
                NodeAddress::Ipv4(ip) => ip.octets()[3],
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(admitted, vec![1, 4, 6]);
        assert_eq!(result.count, 3);
        assert_eq!(result.excluded, 0);
    }

    #[test]
    fn test_stops_at_max_peers() {
        let filter = ExclusionFilter::default();
        let batches = vec![
            vec![entry(1, 10), entry(2, 10)],
            vec![entry(3, 10), entry(4, 10), entry(5, 10)],
        ];

        let result = enumerate_peers(&batches, NOW, &limits(3), &filter).unwrap();
        assert_eq!(result.count, 3);
        assert_eq!(result.peers.len(), 3);
        assert!(!result
            .peers
            .iter()
            .any(|key| key.address == NodeAddress::Ipv4(Ipv4Addr::new(93, 184, 1, 4))));

        let result = enumerate_peers(&batches, NOW, &limits(0), &filter).unwrap();
        assert_eq!(result.count, 0);
    }

    #[test]
    fn test_exclusions_and_defaults() {
        let filter = ExclusionFilter::default();
        let mut private = entry(1, 10);
        private.address = Some(NodeAddress::Ipv4(Ipv4Addr::new(192, 168, 0, 1)));
        let mut missing = entry(2, 10);
        missing.address = None;
        let mut portless = entry(3, 10);
        portless.port = 0;

        let result =
            enumerate_peers(&[vec![private, missing, portless]], NOW, &limits(10), &filter)
                .unwrap();
        assert_eq!(result.excluded, 1);
        assert_eq!(result.count, 1);
        let key = result.peers.iter().next().unwrap();
        assert_eq!(key.port, 8333);
    }

    #[test]
    fn test_onion_entries_need_opt_in() {
        let filter = ExclusionFilter::default();
        let mut onion = entry(1, 10);
        onion.address = Some("aaaaaaaaaaaaaaaa.onion".parse().unwrap());
        let batch = vec![onion];

        let result = enumerate_peers(&[batch.clone()], NOW, &limits(10), &filter).unwrap();
        assert_eq!(result.count, 0);
        assert_eq!(result.excluded, 0);

        let mut with_onion = limits(10);
        with_onion.include_onion = true;
        let result = enumerate_peers(&[batch], NOW, &with_onion, &filter).unwrap();
        assert_eq!(result.count, 1);
    }

    #[test]
    fn test_duplicates_count_toward_cap() {
        let filter = ExclusionFilter::default();
        let batch = vec![entry(1, 10), entry(1, 20), entry(2, 10)];

        let result = enumerate_peers(&[batch], NOW, &limits(2), &filter).unwrap();
        assert_eq!(result.count, 2);
        assert_eq!(result.peers.len(), 1);
    }
}
