//! Bootstrap candidates from DNS seeders.

use bitcoin_census_connection::NodeAddress;
use log::{debug, warn};
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::time::Duration;
use tokio::net::lookup_host;
use tokio::time::timeout;

/// Resolve every seeder, keeping IPv6 results only when `ipv6` is set.
///
/// A seeder which fails to resolve, or does not answer within `limit`,
/// contributes nothing.
pub async fn resolve_seeders(seeders: &[String], ipv6: bool, limit: Duration) -> Vec<NodeAddress> {
    let mut addresses = BTreeSet::new();

    for seeder in seeders {
        let resolved = match timeout(limit, lookup_host((seeder.as_str(), 0))).await {
            Ok(Ok(resolved)) => resolved,
            Ok(Err(e)) => {
                warn!("Failed to resolve seeder {seeder}: {e}");
                continue;
            }
            Err(_) => {
                warn!("Timed out resolving seeder {seeder}");
                continue;
            }
        };

        for socket_addr in resolved {
            let address = match socket_addr.ip() {
                IpAddr::V4(ip) => NodeAddress::Ipv4(ip),
                IpAddr::V6(ip) if ipv6 => NodeAddress::Ipv6(ip),
                IpAddr::V6(_) => continue,
            };
            debug!("{seeder}: {address}");
            addresses.insert(address);
        }
    }

    addresses.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_literal_addresses() {
        let seeders = vec!["127.0.0.1".to_string(), "::1".to_string()];

        let v4_only = resolve_seeders(&seeders, false, Duration::from_secs(5)).await;
        assert_eq!(v4_only, vec![NodeAddress::Ipv4("127.0.0.1".parse().unwrap())]);

        let both = resolve_seeders(&seeders, true, Duration::from_secs(5)).await;
        assert_eq!(both.len(), 2);
        assert!(both.contains(&NodeAddress::Ipv6("::1".parse().unwrap())));
    }

    #[tokio::test]
    async fn test_unresolvable_seeder_is_skipped() {
        let seeders = vec!["not a hostname".to_string(), "127.0.0.1".to_string()];
        let addresses = resolve_seeders(&seeders, false, Duration::from_secs(5)).await;
        assert_eq!(addresses.len(), 1);
    }
}
