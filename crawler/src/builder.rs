//! Builder pattern for assembling crawler instances.

use crate::config::{ConfigError, CrawlSettings};
use crate::connection::Connector;
use crate::crawler::Crawler;
use crate::exclusion::{AsnLookup, BogonFetcher, ExclusionFilter, MaxMindAsn};
use crate::state::CrawlState;
use crate::store::StateStore;
use std::fmt;
use std::sync::Arc;

/// Errors that can occur while assembling a crawler.
#[derive(Debug)]
pub enum CrawlerBuilderError {
    /// The settings hold a value the crawler cannot run with.
    Settings(ConfigError),
    /// The configured ASN database cannot be opened.
    AsnDatabase(maxminddb::MaxMindDBError),
    /// The HTTP client for bogon feeds cannot be created.
    Bogons(reqwest::Error),
}

impl fmt::Display for CrawlerBuilderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrawlerBuilderError::Settings(err) => write!(f, "Invalid settings: {err}"),
            CrawlerBuilderError::AsnDatabase(err) => {
                write!(f, "Cannot open ASN database: {err}")
            }
            CrawlerBuilderError::Bogons(err) => write!(f, "Cannot create bogon fetcher: {err}"),
        }
    }
}

impl std::error::Error for CrawlerBuilderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CrawlerBuilderError::Settings(err) => Some(err),
            CrawlerBuilderError::AsnDatabase(err) => Some(err),
            CrawlerBuilderError::Bogons(err) => Some(err),
        }
    }
}

/// Builder for creating a [`Crawler`] from validated settings.
///
/// # Example
///
/// ```no_run
/// # fn main() -> Result<(), bitcoin_census_crawler::CrawlerBuilderError> {
/// use bitcoin_census_crawler::{CrawlSettings, CrawlerBuilder, MemoryStore, TcpConnector};
/// use std::sync::Arc;
///
/// let settings = CrawlSettings::default();
/// let connector = TcpConnector::new(settings.connection_configuration());
/// let crawler = CrawlerBuilder::new(settings)
///     .with_bogon_fetcher(None)
///     .build(Arc::new(MemoryStore::new()), connector)?;
/// # Ok(())
/// # }
/// ```
pub struct CrawlerBuilder {
    settings: CrawlSettings,
    /// ASN source overriding the configured database.
    asn_lookup: Option<Box<dyn AsnLookup>>,
    /// Bogon fetcher overriding the configured feeds.
    bogon_fetcher: Option<Option<BogonFetcher>>,
}

impl fmt::Debug for CrawlerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrawlerBuilder")
            .field("settings", &self.settings)
            .field("asn_lookup", &self.asn_lookup.is_some())
            .field("bogon_fetcher", &self.bogon_fetcher)
            .finish()
    }
}

impl CrawlerBuilder {
    /// Create a new crawler builder.
    ///
    /// # Arguments
    ///
    /// * `settings` - The validated crawl configuration.
    ///
    /// # Returns
    ///
    /// A new `CrawlerBuilder` instance.
    pub fn new(settings: CrawlSettings) -> Self {
        CrawlerBuilder {
            settings,
            asn_lookup: None,
            bogon_fetcher: None,
        }
    }

    /// Use a custom ASN source instead of the configured database.
    ///
    /// # Arguments
    ///
    /// * `lookup` - The ASN source consulted for excluded ASNs.
    ///
    /// # Returns
    ///
    /// The builder for method chaining.
    pub fn with_asn_lookup(mut self, lookup: Box<dyn AsnLookup>) -> Self {
        self.asn_lookup = Some(lookup);
        self
    }

    /// Replace the bogon fetcher built from the configured feeds.
    ///
    /// # Arguments
    ///
    /// * `fetcher` - The fetcher to use, `None` to never refresh bogons.
    ///
    /// # Returns
    ///
    /// The builder for method chaining.
    pub fn with_bogon_fetcher(mut self, fetcher: Option<BogonFetcher>) -> Self {
        self.bogon_fetcher = Some(fetcher);
        self
    }

    /// Build the crawler over `store`, connecting through `connector`.
    ///
    /// # Returns
    ///
    /// * `Ok(Crawler)` - The assembled crawler.
    /// * `Err(CrawlerBuilderError)` - If the settings are unusable, or the ASN
    ///   database or the bogon client cannot be set up.
    pub fn build<S: StateStore, C: Connector>(
        self,
        store: Arc<S>,
        connector: C,
    ) -> Result<Crawler<S, C>, CrawlerBuilderError> {
        self.settings
            .check()
            .map_err(CrawlerBuilderError::Settings)?;

        let asn_lookup = match (self.asn_lookup, &self.settings.asn_database) {
            (Some(lookup), _) => Some(lookup),
            (None, Some(path)) => Some(Box::new(
                MaxMindAsn::open(path).map_err(CrawlerBuilderError::AsnDatabase)?,
            ) as Box<dyn AsnLookup>),
            (None, None) => None,
        };

        let bogons = match self.bogon_fetcher {
            Some(fetcher) => fetcher,
            None if self.settings.refreshes_bogons() => Some(
                BogonFetcher::new(
                    self.settings.bogon_ipv4_urls.clone(),
                    self.settings.bogon_ipv6_urls.clone(),
                )
                .map_err(CrawlerBuilderError::Bogons)?,
            ),
            None => None,
        };

        let filter = ExclusionFilter::new(
            self.settings.excluded_networks.clone(),
            self.settings.excluded_asns.clone(),
            asn_lookup,
        );

        Ok(Crawler::new(
            Arc::new(self.settings),
            CrawlState::new(store),
            connector,
            Arc::new(filter),
            bogons,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::test_utils::MockConnector;
    use crate::exclusion::NetworkRule;
    use crate::store::MemoryStore;
    use bitcoin_census_connection::NodeAddress;
    use std::collections::HashSet;
    use std::net::IpAddr;
    use std::path::PathBuf;
    use std::time::Duration;

    struct FixedAsn(u32);

    impl AsnLookup for FixedAsn {
        fn asn(&self, _ip: IpAddr) -> Option<u32> {
            Some(self.0)
        }
    }

    #[test]
    fn test_build_applies_exclusions() {
        let mut settings = CrawlSettings::default();
        settings.excluded_networks = vec!["93.184.0.0/16".parse::<NetworkRule>().unwrap()];
        settings.excluded_asns = HashSet::from([64512]);

        let crawler = CrawlerBuilder::new(settings.clone())
            .build(Arc::new(MemoryStore::new()), MockConnector::new())
            .unwrap();
        let address = |s: &str| s.parse::<NodeAddress>().unwrap();
        assert!(crawler.filter().is_excluded(&address("93.184.1.1")));
        assert!(!crawler.filter().is_excluded(&address("8.8.8.8")));

        let crawler = CrawlerBuilder::new(settings)
            .with_asn_lookup(Box::new(FixedAsn(64512)))
            .build(Arc::new(MemoryStore::new()), MockConnector::new())
            .unwrap();
        assert!(crawler.filter().is_excluded(&address("8.8.8.8")));
    }

    #[test]
    fn test_zero_intervals_rejected() {
        for settings in [
            CrawlSettings {
                cron_delay: Duration::ZERO,
                ..CrawlSettings::default()
            },
            CrawlSettings {
                sample_interval: Duration::ZERO,
                ..CrawlSettings::default()
            },
        ] {
            let result = CrawlerBuilder::new(settings)
                .build(Arc::new(MemoryStore::new()), MockConnector::new());
            assert!(matches!(
                result,
                Err(CrawlerBuilderError::Settings(ConfigError::Invalid { .. }))
            ));
        }
    }

    #[test]
    fn test_missing_asn_database() {
        let mut settings = CrawlSettings::default();
        settings.asn_database = Some(PathBuf::from("/nonexistent/GeoLite2-ASN.mmdb"));

        let result = CrawlerBuilder::new(settings)
            .build(Arc::new(MemoryStore::new()), MockConnector::new());
        assert!(matches!(result, Err(CrawlerBuilderError::AsnDatabase(_))));
    }

    #[test]
    fn test_bogon_fetcher_follows_settings() {
        let settings = CrawlSettings::default();
        let crawler = CrawlerBuilder::new(settings.clone())
            .build(Arc::new(MemoryStore::new()), MockConnector::new())
            .unwrap();
        assert!(!crawler.refreshes_bogons());

        let mut settings = settings;
        settings.bogon_ipv4_urls = vec!["http://127.0.0.1:9/bogons.txt".to_string()];
        let crawler = CrawlerBuilder::new(settings.clone())
            .build(Arc::new(MemoryStore::new()), MockConnector::new())
            .unwrap();
        assert!(crawler.refreshes_bogons());

        let crawler = CrawlerBuilder::new(settings)
            .with_bogon_fetcher(None)
            .build(Arc::new(MemoryStore::new()), MockConnector::new())
            .unwrap();
        assert!(!crawler.refreshes_bogons());
    }
}
