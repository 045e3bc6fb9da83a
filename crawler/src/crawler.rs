//! The assembled crawler: bootstrap, controller and worker pool.

use crate::config::{CrawlSettings, SEED_SERVICES};
use crate::connection::Connector;
use crate::controller::RoundController;
use crate::error::{CrawlError, StoreError};
use crate::exclusion::{BogonFetcher, ExclusionFilter};
use crate::node::{Candidate, NodeKey};
use crate::seed::resolve_seeders;
use crate::snapshot::SnapshotSink;
use crate::state::{CrawlState, MasterState};
use crate::store::StateStore;
use crate::worker::CrawlWorker;
use bitcoin_census_connection::NodeAddress;
use log::{debug, info};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::sleep;

/// A crawler bound to one state store and one connector.
///
/// Create one with [`crate::CrawlerBuilder`].
pub struct Crawler<S, C> {
    settings: Arc<CrawlSettings>,
    state: CrawlState<S>,
    connector: C,
    filter: Arc<ExclusionFilter>,
    bogons: Option<BogonFetcher>,
}

impl<S, C> fmt::Debug for Crawler<S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Crawler")
            .field("filter", &self.filter)
            .field("bogons", &self.bogons)
            .finish_non_exhaustive()
    }
}

impl<S: StateStore, C: Connector> Crawler<S, C> {
    pub(crate) fn new(
        settings: Arc<CrawlSettings>,
        state: CrawlState<S>,
        connector: C,
        filter: Arc<ExclusionFilter>,
        bogons: Option<BogonFetcher>,
    ) -> Self {
        Crawler {
            settings,
            state,
            connector,
            filter,
            bogons,
        }
    }

    pub fn settings(&self) -> &CrawlSettings {
        &self.settings
    }

    pub fn state(&self) -> &CrawlState<S> {
        &self.state
    }

    pub fn filter(&self) -> &ExclusionFilter {
        &self.filter
    }

    pub fn refreshes_bogons(&self) -> bool {
        self.bogons.is_some()
    }

    /// Start a fresh crawl from the configured DNS seeders.
    ///
    /// Returns the number of queued candidates.
    pub async fn bootstrap(&self) -> Result<usize, StoreError> {
        let seeds = resolve_seeders(
            &self.settings.seeders,
            self.settings.ipv6,
            self.settings.socket_timeout,
        )
        .await;
        self.seed(&seeds).await
    }

    /// Start a fresh crawl from `addresses`.
    ///
    /// Clears every per-epoch key and the queue, refreshes the bogon lists,
    /// queues the admissible addresses together with the configured onion
    /// nodes, and lets the workers run.
    pub async fn seed(&self, addresses: &[NodeAddress]) -> Result<usize, StoreError> {
        self.state.set_master_state(MasterState::Starting).await?;
        info!("Removing all keys");
        let mut batch = self.state.batch();
        batch.clear_epoch().clear_pending();
        batch.commit().await?;

        self.refresh_bogons().await;

        let mut seeded = 0;
        let mut batch = self.state.batch();
        for address in addresses {
            if self.filter.is_excluded(address) {
                debug!("Exclude: {address}");
                continue;
            }
            batch.push_pending(&self.seed_candidate(address.clone()));
            seeded += 1;
        }
        if self.settings.onion {
            for address in &self.settings.onion_nodes {
                batch.push_pending(&self.seed_candidate(address.clone()));
                seeded += 1;
            }
        }
        batch.commit().await?;
        info!("Seeded {seeded} candidates");

        self.state.set_master_state(MasterState::Running).await?;
        Ok(seeded)
    }

    fn seed_candidate(&self, address: NodeAddress) -> Candidate {
        Candidate::new(NodeKey::new(address, self.settings.port, SEED_SERVICES))
    }

    async fn refresh_bogons(&self) {
        if let Some(bogons) = &self.bogons {
            bogons.refresh(&self.filter).await;
        }
    }

    /// A worker sharing this crawler's state, connector and filter.
    pub fn worker(&self, id: usize) -> CrawlWorker<S, C> {
        CrawlWorker::new(
            id,
            Arc::clone(&self.settings),
            self.state.clone(),
            self.connector.clone(),
            Arc::clone(&self.filter),
        )
    }

    /// The round controller, writing snapshots to `sink`.
    pub fn controller<K: SnapshotSink>(&self, sink: K) -> RoundController<S, K> {
        RoundController::new(
            Arc::clone(&self.settings),
            self.state.clone(),
            Arc::clone(&self.filter),
            self.bogons.clone(),
            sink,
        )
    }

    /// Run `count` workers until one of them fails.
    ///
    /// With `watch_epochs` set, the bogon lists are also refreshed whenever
    /// another process rolls the epoch over.
    pub async fn run_workers(&self, count: usize, watch_epochs: bool) -> Result<(), CrawlError> {
        let mut tasks = JoinSet::new();
        for id in 0..count {
            let worker = self.worker(id);
            tasks.spawn(async move { worker.run().await });
        }
        if watch_epochs && self.bogons.is_some() {
            let watcher = EpochWatcher {
                settings: Arc::clone(&self.settings),
                state: self.state.clone(),
                filter: Arc::clone(&self.filter),
                bogons: self.bogons.clone(),
            };
            tasks.spawn(async move { watcher.run().await });
        }
        info!("Workers: {count}");

        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tasks.abort_all();
                    return Err(e.into());
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    tasks.abort_all();
                    return Err(CrawlError::Task(e.to_string()));
                }
            }
        }
        Ok(())
    }

    /// Controller role: bootstrap, then drive epochs until `shutdown`.
    ///
    /// With `workers` above zero the worker pool runs in this process too,
    /// which is how a private in-memory store is crawled.
    pub async fn run_controller<K: SnapshotSink>(
        &self,
        sink: K,
        workers: usize,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), CrawlError> {
        self.bootstrap().await?;
        let mut controller = self.controller(sink);

        if workers == 0 {
            controller.run(shutdown).await?;
            return Ok(());
        }

        tokio::select! {
            result = controller.run(shutdown) => result?,
            result = self.run_workers(workers, false) => result?,
        }
        Ok(())
    }

    /// Worker role: run the configured number of workers until `shutdown`.
    pub async fn run_worker_pool(
        &self,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), CrawlError> {
        tokio::select! {
            _ = shutdown => {
                info!("Workers shutting down");
                Ok(())
            }
            result = self.run_workers(self.settings.workers, true) => result,
        }
    }
}

/// Refreshes the bogon lists of a worker process at each new epoch.
struct EpochWatcher<S> {
    settings: Arc<CrawlSettings>,
    state: CrawlState<S>,
    filter: Arc<ExclusionFilter>,
    bogons: Option<BogonFetcher>,
}

impl<S: StateStore> EpochWatcher<S> {
    async fn run(&self) -> Result<(), StoreError> {
        let Some(bogons) = &self.bogons else {
            return Ok(());
        };

        let mut seen = self.state.epoch().await?;
        bogons.refresh(&self.filter).await;
        loop {
            sleep(self.settings.cron_delay).await;
            let epoch = self.state.epoch().await?;
            if epoch != seen {
                debug!("Epoch {epoch} started, refreshing bogons");
                seen = epoch;
                bogons.refresh(&self.filter).await;
            }
        }
    }
}
