//! The round controller: detects the end of a sweep and rolls the epoch over.
//!
//! While the queue holds work the controller only reports its size and samples
//! how fast `up` grows. Once the queue is empty it parks the workers, gives
//! in-flight attempts a grace period, then snapshots and clears the epoch,
//! reseeds the queue with the nodes found reachable, and lets the workers go
//! again once the epoch has lasted at least the snapshot delay.

use crate::config::CrawlSettings;
use crate::error::StoreError;
use crate::exclusion::{BogonFetcher, ExclusionFilter};
use crate::node::{Candidate, NodeKey};
use crate::snapshot::{EpochSnapshot, ReachableNode, Sample, SnapshotSink};
use crate::state::{CrawlState, HistoryEntry, MasterState};
use crate::store::StateStore;
use bitcoin_census_connection::unix_timestamp;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::time::{interval, interval_at, sleep, sleep_until, Instant, MissedTickBehavior};

/// Tracks the growth of `up` between readings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sampler {
    interval_secs: u64,
    previous: u64,
    index: u64,
    series: Vec<Sample>,
}

impl Sampler {
    pub fn new(interval_secs: u64) -> Self {
        Sampler {
            interval_secs,
            ..Sampler::default()
        }
    }

    /// Record the current size of `up`.
    pub fn record(&mut self, up_count: u64) -> Sample {
        let sample = Sample {
            index: self.index,
            newly_reachable: up_count as i64 - self.previous as i64,
        };
        self.series.push(sample);
        self.index += self.interval_secs;
        self.previous = up_count;
        sample
    }

    /// Start over, returning the series recorded so far.
    pub fn restart(&mut self) -> Vec<Sample> {
        self.previous = 0;
        self.index = 0;
        std::mem::take(&mut self.series)
    }

    pub fn series(&self) -> &[Sample] {
        &self.series
    }
}

/// Where the controller is in the epoch cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundState {
    Running,
    Draining,
    RollingOver,
}

/// Summary of one rollover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RolloverReport {
    pub timestamp: i64,
    pub reachable: usize,
    pub all_nodes: u64,
    pub all_nodes_bis: u64,
    pub consensus_height: i32,
    /// Candidates queued for the next epoch.
    pub reseeded: usize,
    /// Seconds the finished epoch lasted.
    pub elapsed: u64,
}

/// Most frequent height, ties going to the value seen first.
pub fn consensus_height(heights: &[i32]) -> Option<i32> {
    let mut counts: HashMap<i32, usize> = HashMap::new();
    for height in heights {
        *counts.entry(*height).or_default() += 1;
    }

    let mut best: Option<(i32, usize)> = None;
    for height in heights {
        let count = counts[height];
        if best.map_or(true, |(_, best_count)| count > best_count) {
            best = Some((*height, count));
        }
    }
    best.map(|(height, _)| height)
}

/// Owner of the epoch cycle. Exactly one runs per deployment.
pub struct RoundController<S, K> {
    settings: Arc<CrawlSettings>,
    state: CrawlState<S>,
    filter: Arc<ExclusionFilter>,
    bogons: Option<BogonFetcher>,
    sink: K,
    sampler: Sampler,
    round: RoundState,
    epoch_start: Instant,
}

impl<S: StateStore, K: SnapshotSink> RoundController<S, K> {
    pub fn new(
        settings: Arc<CrawlSettings>,
        state: CrawlState<S>,
        filter: Arc<ExclusionFilter>,
        bogons: Option<BogonFetcher>,
        sink: K,
    ) -> Self {
        let sampler = Sampler::new(settings.sample_interval.as_secs());
        RoundController {
            settings,
            state,
            filter,
            bogons,
            sink,
            sampler,
            round: RoundState::Running,
            epoch_start: Instant::now(),
        }
    }

    pub fn round(&self) -> RoundState {
        self.round
    }

    pub fn sampler(&self) -> &Sampler {
        &self.sampler
    }

    /// Drive epochs until `shutdown` completes or the store fails.
    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) -> Result<(), StoreError> {
        tokio::pin!(shutdown);

        let mut poll = interval(self.settings.cron_delay);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let period = self.settings.sample_interval;
        let mut sample = interval_at(Instant::now() + period, period);
        sample.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Controller shutting down");
                    return Ok(());
                }
                _ = sample.tick() => {
                    let up = self.state.up_count().await?;
                    let reading = self.sampler.record(up);
                    debug!("{} new reachable nodes", reading.newly_reachable);
                }
                _ = poll.tick() => {
                    let pending = self.state.pending_count().await?;
                    info!("Pending: {pending}");
                    if pending > 0 {
                        continue;
                    }

                    tokio::select! {
                        _ = &mut shutdown => {
                            info!("Controller shutting down during rollover");
                            return Ok(());
                        }
                        result = self.drain_and_rollover() => {
                            result?;
                        }
                    }
                    poll.reset();
                    sample.reset();
                }
            }
        }
    }

    /// Park the workers, roll the epoch over and release them again.
    pub async fn drain_and_rollover(&mut self) -> Result<RolloverReport, StoreError> {
        self.state.set_master_state(MasterState::Starting).await?;
        self.round = RoundState::Draining;
        sleep(self.settings.drain_grace).await;

        self.round = RoundState::RollingOver;
        info!("Restarting");
        let report = self.rollover().await?;

        sleep_until(self.epoch_start + self.settings.snapshot_delay).await;
        self.epoch_start = Instant::now();
        self.state.set_master_state(MasterState::Running).await?;
        self.round = RoundState::Running;
        Ok(report)
    }

    /// Snapshot the epoch, clear it and reseed the queue.
    ///
    /// Workers must already be parked.
    pub async fn rollover(&mut self) -> Result<RolloverReport, StoreError> {
        let timestamp = unix_timestamp();
        let elapsed = self.epoch_start.elapsed().as_secs();
        info!("Elapsed: {elapsed}");

        // Parent tagged entries only exist for duplicate tracking.
        let reachable_keys: Vec<NodeKey> = self
            .state
            .up_members()
            .await?
            .into_iter()
            .filter(|candidate| candidate.parent.is_none())
            .map(|candidate| candidate.key)
            .collect();
        let all_nodes = self.state.all_nodes_count().await?;
        let all_nodes_bis = self.state.all_nodes_bis_count().await?;
        let discovery = self.state.discovery_records().await?;

        let mut reachable = Vec::with_capacity(reachable_keys.len());
        for key in reachable_keys {
            let height = match self.state.height_of(&key).await {
                Ok(Some(height)) => height,
                Ok(None) => {
                    warn!("Height of {key} missing");
                    0
                }
                Err(StoreError::Corrupt(e)) => {
                    warn!("Height of {key} unreadable: {e}");
                    0
                }
                Err(e) => return Err(e),
            };
            reachable.push(ReachableNode { key, height });
        }

        let heights: Vec<i32> = reachable.iter().map(|node| node.height).collect();
        let height = consensus_height(&heights).unwrap_or(0);

        let mut reseed: Vec<NodeKey> = reachable.iter().map(|node| node.key.clone()).collect();
        if self.settings.include_checked {
            let max_age = i64::try_from(self.settings.max_age.as_secs()).unwrap_or(i64::MAX);
            for key in self
                .state
                .recently_checked(timestamp.saturating_sub(max_age), timestamp)
                .await?
            {
                if self.filter.is_excluded(&key.address) {
                    debug!("Exclude: {}", key.address);
                    continue;
                }
                reseed.push(key);
            }
        }

        let snapshot = EpochSnapshot {
            timestamp,
            reachable,
            discovery,
            samples: self.sampler.restart(),
        };
        if let Err(e) = self.sink.write(&snapshot).await {
            error!("Failed to write epoch snapshot: {e}");
        }

        let mut batch = self.state.batch();
        batch.clear_epoch();
        for key in &reseed {
            batch.push_pending(&Candidate::new(key.clone()));
        }
        batch
            .set_elapsed(elapsed)
            .record_history(HistoryEntry {
                timestamp,
                reachable: snapshot.reachable.len() as u64,
            })
            .set_consensus_height(height)
            .advance_epoch();
        batch.commit().await?;

        if let Some(bogons) = &self.bogons {
            bogons.refresh(&self.filter).await;
        }

        let report = RolloverReport {
            timestamp,
            reachable: snapshot.reachable.len(),
            all_nodes,
            all_nodes_bis,
            consensus_height: height,
            reseeded: reseed.len(),
            elapsed,
        };
        info!("Reachable nodes: {}", report.reachable);
        info!("All nodes (not only reachable): {all_nodes}");
        info!("All nodes with IPv6 (not only reachable): {all_nodes_bis}");
        info!("Height: {height}");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::DiscoveryRecord;
    use crate::snapshot::test_utils::MemorySink;
    use crate::store::MemoryStore;
    use bitcoin_census_connection::NodeAddress;
    use std::time::Duration;

    fn key(s: &str) -> NodeKey {
        NodeKey::new(s.parse::<NodeAddress>().unwrap(), 8333, 1)
    }

    fn settings() -> CrawlSettings {
        CrawlSettings {
            max_age: Duration::from_secs(3600),
            drain_grace: Duration::from_secs(30),
            snapshot_delay: Duration::from_secs(245),
            cron_delay: Duration::from_secs(10),
            sample_interval: Duration::from_secs(5),
            ..CrawlSettings::default()
        }
    }

    fn controller(
        settings: CrawlSettings,
        state: &CrawlState<MemoryStore>,
        sink: &MemorySink,
    ) -> RoundController<MemoryStore, MemorySink> {
        RoundController::new(
            Arc::new(settings),
            state.clone(),
            Arc::new(ExclusionFilter::default()),
            None,
            sink.clone(),
        )
    }

    #[test]
    fn test_consensus_height() {
        assert_eq!(
            consensus_height(&[600_000, 600_000, 600_001]),
            Some(600_000)
        );
        assert_eq!(consensus_height(&[7, 5, 5, 7]), Some(7));
        assert_eq!(consensus_height(&[1, 2, 2]), Some(2));
        assert_eq!(consensus_height(&[]), None);
    }

    #[test]
    fn test_sampler() {
        let mut sampler = Sampler::new(5);
        assert_eq!(
            sampler.record(10),
            Sample {
                index: 0,
                newly_reachable: 10
            }
        );
        sampler.record(25);
        sampler.record(25);
        assert_eq!(
            sampler.series().iter().map(|s| (s.index, s.newly_reachable)).collect::<Vec<_>>(),
            vec![(0, 10), (5, 15), (10, 0)]
        );

        assert_eq!(sampler.restart().len(), 3);
        assert!(sampler.series().is_empty());
        assert_eq!(
            sampler.record(3),
            Sample {
                index: 0,
                newly_reachable: 3
            }
        );
    }

    async fn populate(state: &CrawlState<MemoryStore>) {
        let a = key("93.184.1.1");
        let b = key("93.184.1.2");
        let c = key("93.184.1.3");
        let failed = key("93.184.1.4");

        let mut batch = state.batch();
        for reached in [&a, &b, &c] {
            batch.mark_attempted(reached).mark_up(&Candidate::new(reached.clone()));
        }
        batch
            .mark_attempted(&failed)
            .mark_up(&Candidate::with_parent(a.clone(), b.clone()))
            .mark_discovered(&key("93.184.1.5"))
            .record_height(&a, 600_000, Duration::from_secs(3600))
            .record_height(&b, 600_000, Duration::from_secs(3600))
            .record_height(&c, 600_001, Duration::from_secs(3600))
            .record_discovery(&DiscoveryRecord {
                parent: a.clone(),
                count: 1,
                children: vec![key("93.184.1.5")],
            });
        batch.commit().await.unwrap();
        state.admit_prefix("2001:db8::/64").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollover_reseeds_and_clears() {
        let state = CrawlState::new(Arc::new(MemoryStore::new()));
        populate(&state).await;

        let now = unix_timestamp();
        state.mark_checked(&key("93.184.2.1"), now - 10).await.unwrap();
        state.mark_checked(&key("93.184.2.2"), now - 7200).await.unwrap();
        state.mark_checked(&key("10.0.0.1"), now).await.unwrap();

        let sink = MemorySink::default();
        let mut settings = settings();
        settings.include_checked = true;
        let mut controller = controller(settings, &state, &sink);
        controller.sampler.record(3);

        let report = controller.rollover().await.unwrap();
        assert_eq!(report.reachable, 3);
        assert_eq!(report.all_nodes, 4);
        assert_eq!(report.all_nodes_bis, 1);
        assert_eq!(report.consensus_height, 600_000);
        assert_eq!(report.reseeded, 4);

        let mut pending: Vec<String> = state
            .pending_members()
            .await
            .unwrap()
            .into_iter()
            .map(|candidate| candidate.key.to_string())
            .collect();
        pending.sort();
        assert_eq!(
            pending,
            vec![
                "93.184.1.1-8333-1",
                "93.184.1.2-8333-1",
                "93.184.1.3-8333-1",
                "93.184.2.1-8333-1",
            ]
        );

        assert_eq!(state.up_count().await.unwrap(), 0);
        assert_eq!(state.all_nodes_count().await.unwrap(), 0);
        assert_eq!(state.all_nodes_bis_count().await.unwrap(), 0);
        assert_eq!(state.prefix_count("2001:db8::/64").await.unwrap(), 0);
        assert!(!state.is_attempted(&key("93.184.1.1")).await.unwrap());
        assert!(state.discovery_records().await.unwrap().is_empty());

        assert_eq!(state.consensus_height().await.unwrap(), 600_000);
        assert_eq!(state.epoch().await.unwrap(), 1);
        let history = state.history().await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].reachable, 3);

        let snapshots = sink.snapshots.lock().unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].reachable.len(), 3);
        assert_eq!(snapshots[0].discovery.len(), 1);
        assert_eq!(snapshots[0].samples.len(), 1);
        assert!(controller.sampler().series().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollover_without_checked_nodes() {
        let state = CrawlState::new(Arc::new(MemoryStore::new()));
        populate(&state).await;
        state
            .mark_checked(&key("93.184.2.1"), unix_timestamp())
            .await
            .unwrap();

        let sink = MemorySink::default();
        let mut controller = controller(settings(), &state, &sink);
        let report = controller.rollover().await.unwrap();
        assert_eq!(report.reseeded, 3);
        assert_eq!(state.pending_count().await.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_heights_count_as_zero() {
        let state = CrawlState::new(Arc::new(MemoryStore::new()));
        let mut batch = state.batch();
        for last in 1..=2 {
            let reached = key(&format!("93.184.1.{last}"));
            batch.mark_attempted(&reached).mark_up(&Candidate::new(reached));
        }
        batch.commit().await.unwrap();

        let sink = MemorySink::default();
        let mut controller = controller(settings(), &state, &sink);
        let report = controller.rollover().await.unwrap();
        assert_eq!(report.consensus_height, 0);
        assert!(sink.snapshots.lock().unwrap()[0]
            .reachable
            .iter()
            .all(|node| node.height == 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_and_rollover_timing() {
        let state = CrawlState::new(Arc::new(MemoryStore::new()));
        state.set_master_state(MasterState::Running).await.unwrap();
        let sink = MemorySink::default();
        let mut controller = controller(settings(), &state, &sink);

        let start = Instant::now();
        let report = controller.drain_and_rollover().await.unwrap();
        assert_eq!(report.elapsed, 30);
        // The epoch lasts at least the snapshot delay.
        assert_eq!(start.elapsed(), Duration::from_secs(245));
        assert_eq!(controller.round(), RoundState::Running);
        assert_eq!(state.master_state().await.unwrap(), MasterState::Running);

        // A long epoch is not padded any further.
        sleep(Duration::from_secs(1000)).await;
        let start = Instant::now();
        controller.drain_and_rollover().await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_waits_for_drained_queue() {
        let state = CrawlState::new(Arc::new(MemoryStore::new()));
        state.set_master_state(MasterState::Running).await.unwrap();
        state
            .push_pending(&Candidate::new(key("93.184.1.1")))
            .await
            .unwrap();
        let sink = MemorySink::default();
        let mut controller = controller(settings(), &state, &sink);

        controller
            .run(sleep(Duration::from_secs(60)))
            .await
            .unwrap();
        assert_eq!(state.epoch().await.unwrap(), 0);
        assert!(controller.sampler().series().len() >= 10);

        // Stop after the rollover released the workers, before the next poll.
        state.pop_pending().await.unwrap();
        controller
            .run(sleep(Duration::from_secs(190)))
            .await
            .unwrap();
        assert_eq!(state.epoch().await.unwrap(), 1);
        assert_eq!(state.master_state().await.unwrap(), MasterState::Running);
        assert_eq!(sink.snapshots.lock().unwrap().len(), 1);
    }
}
