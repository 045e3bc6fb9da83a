//! Typed view of the per-epoch crawl state held in a [`StateStore`].
//!
//! Key layout:
//!
//! * `pending` - set of queued [`Candidate`]s.
//! * `up` - set of candidates which completed a handshake this epoch.
//! * `all_nodes` - set of every key attempted this epoch.
//! * `all_nodes_bis` - set of every key admitted from an address list.
//! * `discovery` - list of [`DiscoveryRecord`]s, one per reachable node.
//! * `node:<key>` - attempted markers.
//! * `height:<key>` - reported heights, expiring after the maximum age.
//! * `crawl:cidr:<prefix>` - admission counters.
//! * `crawl:master:state` - `starting` or `running`.
//! * `check` - scored set of keys verified by external checkers.
//! * `height`, `elapsed`, `nodes`, `crawl:epoch` - epoch bookkeeping.

use crate::error::StoreError;
use crate::node::{Candidate, DiscoveryRecord, NodeKey, RecordParseError};
use crate::store::{Pipeline, StateStore};
use log::warn;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

pub const PENDING: &str = "pending";
pub const UP: &str = "up";
pub const ALL_NODES: &str = "all_nodes";
pub const ALL_NODES_BIS: &str = "all_nodes_bis";
pub const DISCOVERY: &str = "discovery";
pub const ATTEMPTED_PREFIX: &str = "node:";
pub const HEIGHT_PREFIX: &str = "height:";
pub const CIDR_PREFIX: &str = "crawl:cidr:";
pub const MASTER_STATE: &str = "crawl:master:state";
pub const CHECKED: &str = "check";
pub const CONSENSUS_HEIGHT: &str = "height";
pub const ELAPSED: &str = "elapsed";
pub const HISTORY: &str = "nodes";
pub const EPOCH: &str = "crawl:epoch";

/// Whether workers may pop from the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterState {
    /// Bootstrap or rollover in progress, workers park.
    Starting,
    Running,
}

impl MasterState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MasterState::Starting => "starting",
            MasterState::Running => "running",
        }
    }
}

impl fmt::Display for MasterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MasterState {
    type Err = RecordParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(MasterState::Starting),
            "running" => Ok(MasterState::Running),
            other => Err(RecordParseError::UnsupportedVersion(other.to_string())),
        }
    }
}

/// One entry of the reachable-count history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryEntry {
    pub timestamp: i64,
    pub reachable: u64,
}

impl HistoryEntry {
    fn encode(&self) -> String {
        format!("1|{}|{}", self.timestamp, self.reachable)
    }

    fn decode(record: &str) -> Result<Self, RecordParseError> {
        let fields: Vec<&str> = record.split('|').collect();
        match fields.as_slice() {
            ["1", timestamp, reachable] => Ok(HistoryEntry {
                timestamp: parse_field(timestamp)?,
                reachable: parse_field(reachable)?,
            }),
            ["1", ..] => Err(RecordParseError::FieldCount {
                expected: 2,
                found: fields.len() - 1,
            }),
            [version, ..] => Err(RecordParseError::UnsupportedVersion(version.to_string())),
            [] => Err(RecordParseError::Empty),
        }
    }
}

fn parse_field<T: FromStr>(field: &str) -> Result<T, RecordParseError> {
    field
        .parse()
        .map_err(|_| RecordParseError::InvalidNumber(field.to_string()))
}

fn attempted_key(key: &NodeKey) -> String {
    format!("{ATTEMPTED_PREFIX}{}", key.encode())
}

fn height_key(key: &NodeKey) -> String {
    format!("{HEIGHT_PREFIX}{}", key.encode())
}

fn cidr_key(prefix: &str) -> String {
    format!("{CIDR_PREFIX}{prefix}")
}

/// Handle on the crawl state, cheap to clone and share between tasks.
pub struct CrawlState<S> {
    store: Arc<S>,
}

impl<S> Clone for CrawlState<S> {
    fn clone(&self) -> Self {
        CrawlState {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S> fmt::Debug for CrawlState<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrawlState").finish_non_exhaustive()
    }
}

impl<S: StateStore> CrawlState<S> {
    pub fn new(store: Arc<S>) -> Self {
        CrawlState { store }
    }

    /// The underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Start a batch of writes.
    pub fn batch(&self) -> CrawlBatch<'_, S> {
        CrawlBatch {
            state: self,
            pipeline: Pipeline::new(),
        }
    }

    /// Current master state, `Starting` until one was ever set.
    pub async fn master_state(&self) -> Result<MasterState, StoreError> {
        match self.store.get(MASTER_STATE).await? {
            Some(state) => Ok(state.parse()?),
            None => Ok(MasterState::Starting),
        }
    }

    pub async fn set_master_state(&self, state: MasterState) -> Result<(), StoreError> {
        self.store.set(MASTER_STATE, state.as_str()).await
    }

    /// Pop an arbitrary queued candidate.
    ///
    /// A malformed entry is consumed and reported as [`StoreError::Corrupt`].
    pub async fn pop_pending(&self) -> Result<Option<Candidate>, StoreError> {
        match self.store.spop(PENDING).await? {
            Some(record) => Ok(Some(Candidate::decode(&record)?)),
            None => Ok(None),
        }
    }

    pub async fn push_pending(&self, candidate: &Candidate) -> Result<bool, StoreError> {
        self.store.sadd(PENDING, &candidate.encode()).await
    }

    /// Take a specific candidate off the queue, `true` if it was queued.
    pub async fn remove_pending(&self, candidate: &Candidate) -> Result<bool, StoreError> {
        self.store.srem(PENDING, &candidate.encode()).await
    }

    pub async fn pending_count(&self) -> Result<u64, StoreError> {
        self.store.scard(PENDING).await
    }

    pub async fn up_count(&self) -> Result<u64, StoreError> {
        self.store.scard(UP).await
    }

    pub async fn all_nodes_count(&self) -> Result<u64, StoreError> {
        self.store.scard(ALL_NODES).await
    }

    pub async fn all_nodes_bis_count(&self) -> Result<u64, StoreError> {
        self.store.scard(ALL_NODES_BIS).await
    }

    pub async fn is_attempted(&self, key: &NodeKey) -> Result<bool, StoreError> {
        self.store.exists(&attempted_key(key)).await
    }

    pub async fn is_up(&self, key: &NodeKey) -> Result<bool, StoreError> {
        let members = self.store.smembers(UP).await?;
        let encoded = key.encode();
        Ok(members.iter().any(|member| *member == encoded))
    }

    pub async fn in_all_nodes(&self, key: &NodeKey) -> Result<bool, StoreError> {
        let members = self.store.smembers(ALL_NODES).await?;
        let encoded = key.encode();
        Ok(members.iter().any(|member| *member == encoded))
    }

    /// Bump the admission counter of an address block, returning the new count.
    pub async fn admit_prefix(&self, prefix: &str) -> Result<i64, StoreError> {
        self.store.incr(&cidr_key(prefix)).await
    }

    pub async fn prefix_count(&self, prefix: &str) -> Result<i64, StoreError> {
        match self.store.get(&cidr_key(prefix)).await? {
            Some(count) => Ok(parse_field(&count)?),
            None => Ok(0),
        }
    }

    /// Consensus height of the previous epoch, `0` before the first rollover.
    pub async fn consensus_height(&self) -> Result<i32, StoreError> {
        match self.store.get(CONSENSUS_HEIGHT).await? {
            Some(height) => Ok(parse_field(&height)?),
            None => Ok(0),
        }
    }

    /// Number of completed rollovers.
    pub async fn epoch(&self) -> Result<u64, StoreError> {
        match self.store.get(EPOCH).await? {
            Some(epoch) => Ok(parse_field(&epoch)?),
            None => Ok(0),
        }
    }

    pub async fn elapsed(&self) -> Result<Option<u64>, StoreError> {
        match self.store.get(ELAPSED).await? {
            Some(elapsed) => Ok(Some(parse_field(&elapsed)?)),
            None => Ok(None),
        }
    }

    /// Height reported by a reachable node, if not yet expired.
    pub async fn height_of(&self, key: &NodeKey) -> Result<Option<i32>, StoreError> {
        match self.store.get(&height_key(key)).await? {
            Some(height) => Ok(Some(parse_field(&height)?)),
            None => Ok(None),
        }
    }

    /// Every queued candidate, skipping malformed entries.
    pub async fn pending_members(&self) -> Result<Vec<Candidate>, StoreError> {
        self.decode_members(PENDING).await
    }

    /// Every reachable entry of the epoch, skipping malformed entries.
    pub async fn up_members(&self) -> Result<Vec<Candidate>, StoreError> {
        self.decode_members(UP).await
    }

    async fn decode_members(&self, key: &str) -> Result<Vec<Candidate>, StoreError> {
        let members = self.store.smembers(key).await?;
        let mut candidates = Vec::with_capacity(members.len());
        for member in members {
            match Candidate::decode(&member) {
                Ok(candidate) => candidates.push(candidate),
                Err(e) => warn!("Skipping malformed {key} entry {member:?}: {e}"),
            }
        }
        Ok(candidates)
    }

    /// The epoch's discovery records in the order they were written.
    pub async fn discovery_records(&self) -> Result<Vec<DiscoveryRecord>, StoreError> {
        let records = self.store.lrange(DISCOVERY).await?;
        let mut parsed = Vec::with_capacity(records.len());
        for record in records {
            match DiscoveryRecord::decode(&record) {
                Ok(record) => parsed.push(record),
                Err(e) => warn!("Skipping malformed discovery record {record:?}: {e}"),
            }
        }
        Ok(parsed)
    }

    /// Keys verified by external checkers with a check time in `[since, until]`.
    pub async fn recently_checked(&self, since: i64, until: i64) -> Result<Vec<NodeKey>, StoreError> {
        let members = self
            .store
            .zrange_by_score(CHECKED, since as f64, until as f64)
            .await?;
        let mut keys = Vec::with_capacity(members.len());
        for member in members {
            match NodeKey::decode(&member) {
                Ok(key) => keys.push(key),
                Err(e) => warn!("Skipping malformed checked entry {member:?}: {e}"),
            }
        }
        Ok(keys)
    }

    /// Record a check of `key` at `timestamp`.
    pub async fn mark_checked(&self, key: &NodeKey, timestamp: i64) -> Result<(), StoreError> {
        self.store
            .zadd(CHECKED, timestamp as f64, &key.encode())
            .await
    }

    /// Reachable-count history, oldest first.
    pub async fn history(&self) -> Result<Vec<HistoryEntry>, StoreError> {
        let records = self.store.lrange(HISTORY).await?;
        records
            .iter()
            .map(|record| HistoryEntry::decode(record).map_err(StoreError::from))
            .collect()
    }
}

/// A batch of typed writes, sent in one round trip by [`CrawlBatch::commit`].
pub struct CrawlBatch<'a, S> {
    state: &'a CrawlState<S>,
    pipeline: Pipeline,
}

impl<S: StateStore> CrawlBatch<'_, S> {
    pub fn push_pending(&mut self, candidate: &Candidate) -> &mut Self {
        self.pipeline.sadd(PENDING, candidate.encode());
        self
    }

    /// Set the attempted marker and count the key as attempted.
    pub fn mark_attempted(&mut self, key: &NodeKey) -> &mut Self {
        self.pipeline
            .set(attempted_key(key), "1")
            .sadd(ALL_NODES, key.encode());
        self
    }

    /// Record a reachable entry. The key itself must also be marked attempted.
    pub fn mark_up(&mut self, candidate: &Candidate) -> &mut Self {
        self.pipeline.sadd(UP, candidate.encode());
        self
    }

    /// Count a key admitted from an address list.
    pub fn mark_discovered(&mut self, key: &NodeKey) -> &mut Self {
        self.pipeline.sadd(ALL_NODES_BIS, key.encode());
        self
    }

    pub fn record_discovery(&mut self, record: &DiscoveryRecord) -> &mut Self {
        self.pipeline.rpush(DISCOVERY, record.encode());
        self
    }

    pub fn record_height(&mut self, key: &NodeKey, height: i32, ttl: Duration) -> &mut Self {
        self.pipeline.set_ex(height_key(key), height.to_string(), ttl);
        self
    }

    /// Drop every per-epoch key. The queue survives.
    pub fn clear_epoch(&mut self) -> &mut Self {
        self.pipeline
            .del(UP)
            .del(ALL_NODES)
            .del(ALL_NODES_BIS)
            .del(DISCOVERY)
            .del_prefix(ATTEMPTED_PREFIX)
            .del_prefix(CIDR_PREFIX);
        self
    }

    pub fn clear_pending(&mut self) -> &mut Self {
        self.pipeline.del(PENDING);
        self
    }

    pub fn set_master_state(&mut self, state: MasterState) -> &mut Self {
        self.pipeline.set(MASTER_STATE, state.as_str());
        self
    }

    pub fn set_consensus_height(&mut self, height: i32) -> &mut Self {
        self.pipeline.set(CONSENSUS_HEIGHT, height.to_string());
        self
    }

    pub fn set_elapsed(&mut self, seconds: u64) -> &mut Self {
        self.pipeline.set(ELAPSED, seconds.to_string());
        self
    }

    pub fn record_history(&mut self, entry: HistoryEntry) -> &mut Self {
        self.pipeline.rpush(HISTORY, entry.encode());
        self
    }

    pub fn advance_epoch(&mut self) -> &mut Self {
        self.pipeline.incr(EPOCH);
        self
    }

    pub fn len(&self) -> usize {
        self.pipeline.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipeline.is_empty()
    }

    pub async fn commit(self) -> Result<(), StoreError> {
        self.state.store.execute(self.pipeline).await
    }
}
