//! The crawl worker: drains the shared queue one candidate at a time.

use crate::admission::AdmissionController;
use crate::config::CrawlSettings;
use crate::connection::{Connector, PeerConnection};
use crate::enumerate::{enumerate_peers, EnumerationLimits};
use crate::error::StoreError;
use crate::exclusion::ExclusionFilter;
use crate::node::{Candidate, DiscoveryRecord, NodeKey};
use crate::state::{CrawlState, MasterState};
use crate::store::StateStore;
use bitcoin_census_connection::unix_timestamp;
use log::{debug, error, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// Pause after finding the queue empty.
const EMPTY_QUEUE_DELAY: Duration = Duration::from_secs(1);

/// What happened to one popped candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Handshake completed. `key` carries the services the node reported,
    /// `discovered` is `None` when it never answered getaddr.
    Reachable {
        key: NodeKey,
        discovered: Option<usize>,
    },
    /// Connect or handshake failed.
    Unreachable,
    /// IPv6 candidate while IPv6 crawling is off.
    Ipv6Disabled,
    /// Already attempted this epoch.
    Duplicate,
    /// The candidate's address block is over its budget.
    Throttled,
}

/// Result of one pass of the worker loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// The controller holds the crawl, nothing was popped.
    Parked,
    /// The queue was empty or held a malformed entry.
    Idle,
    Processed(AttemptOutcome),
}

/// One crawl task.
///
/// Any number of workers, in any number of processes, share a queue through
/// the [`CrawlState`]. Per node failures never leave the worker, store
/// failures always do.
pub struct CrawlWorker<S, C> {
    id: usize,
    settings: Arc<CrawlSettings>,
    state: CrawlState<S>,
    connector: C,
    filter: Arc<ExclusionFilter>,
    admission: AdmissionController,
}

impl<S: StateStore, C: Connector> CrawlWorker<S, C> {
    pub fn new(
        id: usize,
        settings: Arc<CrawlSettings>,
        state: CrawlState<S>,
        connector: C,
        filter: Arc<ExclusionFilter>,
    ) -> Self {
        let admission =
            AdmissionController::new(settings.ipv6_prefix, settings.nodes_per_ipv6_prefix);
        CrawlWorker {
            id,
            settings,
            state,
            connector,
            filter,
            admission,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Loop until the store fails.
    pub async fn run(&self) -> Result<(), StoreError> {
        debug!("Worker {} started", self.id);
        loop {
            if let Err(e) = self.step().await {
                error!("Worker {} stopping: {e}", self.id);
                return Err(e);
            }
        }
    }

    /// One pass of the loop: wait for the crawl to run, pop, process.
    pub async fn step(&self) -> Result<Step, StoreError> {
        match self.state.master_state().await {
            Ok(MasterState::Running) => {}
            Ok(MasterState::Starting) => {
                sleep(self.settings.socket_timeout).await;
                return Ok(Step::Parked);
            }
            Err(StoreError::Corrupt(e)) => {
                warn!("Worker {}: unreadable master state: {e}", self.id);
                sleep(self.settings.socket_timeout).await;
                return Ok(Step::Parked);
            }
            Err(e) => return Err(e),
        }

        let candidate = match self.state.pop_pending().await {
            Ok(Some(candidate)) => candidate,
            Ok(None) => {
                sleep(EMPTY_QUEUE_DELAY).await;
                return Ok(Step::Idle);
            }
            Err(StoreError::Corrupt(e)) => {
                warn!("Worker {}: dropped malformed queue entry: {e}", self.id);
                return Ok(Step::Idle);
            }
            Err(e) => return Err(e),
        };

        Ok(Step::Processed(self.process(candidate).await?))
    }

    /// Run a popped candidate through the gates and, if it passes, crawl it.
    pub async fn process(&self, candidate: Candidate) -> Result<AttemptOutcome, StoreError> {
        let key = &candidate.key;

        if key.address.is_ipv6() && !self.settings.ipv6 {
            return Ok(AttemptOutcome::Ipv6Disabled);
        }

        if self.state.is_attempted(key).await? {
            if self.settings.keep_duplication && candidate.parent.is_some() {
                let mut batch = self.state.batch();
                batch.mark_up(&candidate);
                batch.commit().await?;
            }
            return Ok(AttemptOutcome::Duplicate);
        }

        if !self.admission.admit(&self.state, &key.address).await? {
            debug!("{key}: address block over budget");
            return Ok(AttemptOutcome::Throttled);
        }

        self.attempt(key).await
    }

    async fn attempt(&self, key: &NodeKey) -> Result<AttemptOutcome, StoreError> {
        let mut batch = self.state.batch();
        batch.mark_attempted(key);
        batch.commit().await?;

        let start_height = match self.state.consensus_height().await {
            Ok(height) => height,
            Err(StoreError::Corrupt(e)) => {
                warn!("Unreadable consensus height, advertising 0: {e}");
                0
            }
            Err(e) => return Err(e),
        };

        let mut connection = match self.connector.connect(key, start_height).await {
            Ok(connection) => connection,
            Err(e) => {
                debug!("{key}: {e}");
                return Ok(AttemptOutcome::Unreachable);
            }
        };

        let outcome = self.converse(&mut connection, key).await;
        connection.close().await;
        outcome
    }

    async fn converse(
        &self,
        connection: &mut C::Connection,
        key: &NodeKey,
    ) -> Result<AttemptOutcome, StoreError> {
        let info = match connection.handshake().await {
            Ok(info) => info,
            Err(e) => {
                debug!("{key}: {e}");
                return Ok(AttemptOutcome::Unreachable);
            }
        };

        let batches = match connection.get_addr().await {
            Ok(()) => {
                connection
                    .collect_addresses(self.settings.socket_timeout)
                    .await
            }
            Err(e) => {
                debug!("{key}: {e}");
                Vec::new()
            }
        };

        let limits = EnumerationLimits {
            max_age: self.settings.max_age,
            max_peers: self.settings.peers_per_node,
            default_port: self.settings.port,
            include_onion: self.settings.onion,
        };
        let enumeration = enumerate_peers(&batches, unix_timestamp(), &limits, &self.filter);

        let reported = if info.services != key.services {
            debug!(
                "{key}: expected services {}, got {}",
                key.services, info.services
            );
            key.with_services(info.services)
        } else {
            key.clone()
        };

        let mut batch = self.state.batch();
        let record = match &enumeration {
            Some(enumeration) => {
                debug!(
                    "{key}: peers {} (excluded {})",
                    enumeration.count, enumeration.excluded
                );
                for peer in &enumeration.peers {
                    let candidate = if self.settings.keep_duplication {
                        Candidate::with_parent(peer.clone(), reported.clone())
                    } else {
                        Candidate::new(peer.clone())
                    };
                    batch.push_pending(&candidate).mark_discovered(peer);
                }
                DiscoveryRecord {
                    parent: reported.clone(),
                    count: enumeration.count as i64,
                    children: enumeration.peers.iter().cloned().collect(),
                }
            }
            None => DiscoveryRecord {
                parent: reported.clone(),
                count: -1,
                children: Vec::new(),
            },
        };
        batch
            .record_discovery(&record)
            .record_height(&reported, info.height, self.settings.max_age)
            .mark_attempted(&reported)
            .mark_up(&Candidate::new(reported.clone()));
        batch.commit().await?;

        Ok(AttemptOutcome::Reachable {
            key: reported,
            discovered: enumeration.map(|enumeration| enumeration.count),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::test_utils::{MockConnector, MockPeerConnection};
    use crate::store::MemoryStore;
    use bitcoin_census_connection::{AddressEntry, ConnectionError, NodeAddress};
    use std::sync::atomic::Ordering;

    fn key(s: &str, services: u64) -> NodeKey {
        NodeKey::new(s.parse::<NodeAddress>().unwrap(), 8333, services)
    }

    fn entry(address: &str, age: i64) -> AddressEntry {
        AddressEntry {
            timestamp: (unix_timestamp() - age) as u32,
            address: Some(address.parse().unwrap()),
            port: 8333,
            services: 1,
        }
    }

    fn settings() -> CrawlSettings {
        CrawlSettings {
            max_age: Duration::from_secs(3600),
            ..CrawlSettings::default()
        }
    }

    async fn running_state() -> CrawlState<MemoryStore> {
        let state = CrawlState::new(Arc::new(MemoryStore::new()));
        state.set_master_state(MasterState::Running).await.unwrap();
        state
    }

    fn worker(
        settings: CrawlSettings,
        state: &CrawlState<MemoryStore>,
        connector: &MockConnector,
    ) -> CrawlWorker<MemoryStore, MockConnector> {
        CrawlWorker::new(
            0,
            Arc::new(settings),
            state.clone(),
            connector.clone(),
            Arc::new(ExclusionFilter::default()),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_parks_until_running() {
        let state = CrawlState::new(Arc::new(MemoryStore::new()));
        let connector = MockConnector::new();
        let worker = worker(settings(), &state, &connector);
        state
            .push_pending(&Candidate::new(key("93.184.1.1", 1)))
            .await
            .unwrap();

        assert_eq!(worker.step().await.unwrap(), Step::Parked);
        assert_eq!(state.pending_count().await.unwrap(), 1);

        state.set_master_state(MasterState::Running).await.unwrap();
        assert_eq!(
            worker.step().await.unwrap(),
            Step::Processed(AttemptOutcome::Unreachable)
        );
        assert_eq!(worker.step().await.unwrap(), Step::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reachable_node() {
        let state = running_state().await;
        let connector = MockConnector::new();
        let target = key("93.184.1.1", 1);

        let mut connection = MockPeerConnection::new(800_000, 1033);
        let closed = Arc::clone(&connection.closed);
        connection.add_addr_message(vec![
            entry("93.184.1.2", 10),
            entry("93.184.1.3", 999_999_999),
            entry("192.168.1.1", 10),
        ]);
        connector.add_connection(target.clone(), connection);

        let worker = worker(settings(), &state, &connector);
        let outcome = worker.process(Candidate::new(target.clone())).await.unwrap();

        let reported = target.with_services(1033);
        assert_eq!(
            outcome,
            AttemptOutcome::Reachable {
                key: reported.clone(),
                discovered: Some(1),
            }
        );
        assert_eq!(closed.load(Ordering::SeqCst), 1);

        assert!(state.is_up(&reported).await.unwrap());
        assert!(!state.is_up(&target).await.unwrap());
        assert!(state.in_all_nodes(&target).await.unwrap());
        assert!(state.in_all_nodes(&reported).await.unwrap());
        assert_eq!(state.height_of(&reported).await.unwrap(), Some(800_000));
        assert_eq!(state.all_nodes_bis_count().await.unwrap(), 1);

        let pending = state.pending_members().await.unwrap();
        assert_eq!(pending, vec![Candidate::new(key("93.184.1.2", 1))]);

        let records = state.discovery_records().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].parent, reported);
        assert_eq!(records[0].count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_node_is_reachable_without_discovery() {
        let state = running_state().await;
        let connector = MockConnector::new();
        let target = key("93.184.1.1", 1);
        connector.add_connection(target.clone(), MockPeerConnection::new(800_000, 1));

        let worker = worker(settings(), &state, &connector);
        let outcome = worker.process(Candidate::new(target.clone())).await.unwrap();
        assert_eq!(
            outcome,
            AttemptOutcome::Reachable {
                key: target.clone(),
                discovered: None,
            }
        );

        let records = state.discovery_records().await.unwrap();
        assert_eq!(records[0].count, -1);
        assert_eq!(state.pending_count().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_are_not_retried() {
        let state = running_state().await;
        let connector = MockConnector::new();
        let refused = key("93.184.1.1", 1);
        let rejected = key("93.184.1.2", 1);

        connector.add_refusal(
            refused.clone(),
            ConnectionError::Io(std::io::ErrorKind::ConnectionRefused.into()),
        );
        let failing = MockPeerConnection::failing(ConnectionError::Timeout);
        let closed = Arc::clone(&failing.closed);
        connector.add_connection(rejected.clone(), failing);

        let worker = worker(settings(), &state, &connector);
        for target in [&refused, &rejected] {
            assert_eq!(
                worker.process(Candidate::new(target.clone())).await.unwrap(),
                AttemptOutcome::Unreachable
            );
            assert!(state.is_attempted(target).await.unwrap());
            assert!(state.in_all_nodes(target).await.unwrap());
            assert!(!state.is_up(target).await.unwrap());
        }
        assert_eq!(closed.load(Ordering::SeqCst), 1);

        assert_eq!(
            worker.process(Candidate::new(refused.clone())).await.unwrap(),
            AttemptOutcome::Duplicate
        );
        assert_eq!(connector.attempts_for(&refused), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ipv6_gates() {
        let state = running_state().await;
        let connector = MockConnector::new();
        let first = key("2001:db8::1", 1);
        let second = key("2001:db8::2", 1);

        let disabled = worker(settings(), &state, &connector);
        assert_eq!(
            disabled.process(Candidate::new(first.clone())).await.unwrap(),
            AttemptOutcome::Ipv6Disabled
        );
        assert!(connector.attempts().is_empty());

        let mut enabled = settings();
        enabled.ipv6 = true;
        enabled.ipv6_prefix = 64;
        enabled.nodes_per_ipv6_prefix = 1;
        let enabled = worker(enabled, &state, &connector);
        assert_eq!(
            enabled.process(Candidate::new(first.clone())).await.unwrap(),
            AttemptOutcome::Unreachable
        );
        assert_eq!(
            enabled.process(Candidate::new(second.clone())).await.unwrap(),
            AttemptOutcome::Throttled
        );
        assert_eq!(connector.attempts().len(), 1);
        assert_eq!(state.prefix_count("2001:db8::/64").await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_duplication_records_parent() {
        let state = running_state().await;
        let connector = MockConnector::new();
        let mut settings = settings();
        settings.keep_duplication = true;
        let worker = worker(settings, &state, &connector);

        let target = key("93.184.1.1", 1);
        let parent = key("93.184.1.9", 1);
        worker.process(Candidate::new(target.clone())).await.unwrap();

        let again = Candidate::with_parent(target.clone(), parent);
        assert_eq!(
            worker.process(again.clone()).await.unwrap(),
            AttemptOutcome::Duplicate
        );
        assert_eq!(state.up_members().await.unwrap(), vec![again]);
        assert_eq!(connector.attempts_for(&target), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_advertises_consensus_height() {
        let state = running_state().await;
        let mut batch = state.batch();
        batch.set_consensus_height(812_345);
        batch.commit().await.unwrap();

        let connector = MockConnector::new();
        let worker = worker(settings(), &state, &connector);
        let target = key("93.184.1.1", 1);
        worker.process(Candidate::new(target.clone())).await.unwrap();
        assert_eq!(connector.attempts(), vec![(target, 812_345)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_duplicates_are_bounded() {
        let state = running_state().await;
        let connector = MockConnector::new();
        let target = key("93.184.1.1", 1);
        for _ in 0..2 {
            connector.add_connection(target.clone(), MockPeerConnection::new(800_000, 1));
        }

        let first = worker(settings(), &state, &connector);
        let second = worker(settings(), &state, &connector);
        let (a, b) = tokio::join!(
            first.process(Candidate::new(target.clone())),
            second.process(Candidate::new(target.clone())),
        );
        let outcomes = [a.unwrap(), b.unwrap()];

        let connects = connector.attempts_for(&target);
        assert!((1..=2).contains(&connects));
        let duplicates = outcomes
            .iter()
            .filter(|outcome| **outcome == AttemptOutcome::Duplicate)
            .count();
        assert_eq!(duplicates, 2 - connects);
        assert_eq!(state.up_count().await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_failure_stops_worker() {
        let store = Arc::new(MemoryStore::new());
        let state = CrawlState::new(Arc::clone(&store));
        state.set_master_state(MasterState::Running).await.unwrap();
        store.set_available(false);

        let connector = MockConnector::new();
        let worker = worker(settings(), &state, &connector);
        assert!(matches!(
            worker.run().await,
            Err(StoreError::Unavailable(_))
        ));
    }
}
