//! Continuous census of the bitcoin p2p network.
//!
//! A [`RoundController`] seeds a shared queue and rolls the crawl over into a
//! new epoch each time the queue drains. Any number of [`CrawlWorker`]s, in
//! this process or others attached to the same [`StateStore`], pop candidates,
//! handshake with them and feed the addresses they advertise back into the
//! queue.

mod admission;
mod builder;
mod config;
mod connection;
mod controller;
mod crawler;
mod enumerate;
mod error;
mod exclusion;
mod node;
mod seed;
mod snapshot;
mod state;
mod store;
mod worker;

pub use admission::AdmissionController;
pub use builder::{CrawlerBuilder, CrawlerBuilderError};
pub use config::{ConfigError, CrawlConfig, CrawlSettings, SEED_SERVICES};
pub use connection::{Connector, PeerConnection, TcpConnector};
pub use controller::{consensus_height, RolloverReport, RoundController, RoundState, Sampler};
pub use crawler::Crawler;
pub use enumerate::{enumerate_peers, Enumeration, EnumerationLimits};
pub use error::{CrawlError, StoreError};
pub use exclusion::{
    parse_asn, parse_network_list, AsnLookup, BogonFetcher, ExclusionFilter, IpFamily,
    MaxMindAsn, NetworkRule, NetworkRuleError,
};
pub use node::{Candidate, DiscoveryRecord, NodeKey, RecordParseError};
pub use seed::resolve_seeders;
pub use snapshot::{
    DiscoveryStats, EpochSnapshot, FileSnapshotWriter, ReachableNode, Sample, SnapshotError,
    SnapshotSink,
};
pub use state::{CrawlBatch, CrawlState, HistoryEntry, MasterState};
pub use store::{MemoryStore, Pipeline, RedisStore, StateStore, StoreOp};
pub use worker::{AttemptOutcome, CrawlWorker, Step};

// Re-exports.
pub use bitcoin_census_connection::{
    AddressEntry, ConnectionConfiguration, ConnectionError, Message, MessageKind, NodeAddress,
    PeerInfo, UserAgent,
};
