//! Shared state store abstraction.
//!
//! All coordination between the controller and the workers goes through a
//! [`StateStore`]. Every primitive is atomic on its own; a [`Pipeline`]
//! batches writes into one round trip without promising all-or-nothing
//! semantics.

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use crate::error::StoreError;
use std::future::Future;
use std::time::Duration;

/// One write operation of a [`Pipeline`].
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    SAdd { key: String, member: String },
    SRem { key: String, member: String },
    Set { key: String, value: String },
    SetEx {
        key: String,
        value: String,
        ttl: Duration,
    },
    Del { key: String },
    DelPrefix { prefix: String },
    Incr { key: String },
    ZAdd {
        key: String,
        score: f64,
        member: String,
    },
    RPush { key: String, value: String },
}

/// A batch of write operations sent in one round trip.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pipeline {
    ops: Vec<StoreOp>,
}

impl Pipeline {
    pub fn new() -> Self {
        Pipeline::default()
    }

    pub fn sadd(&mut self, key: &str, member: impl Into<String>) -> &mut Self {
        self.ops.push(StoreOp::SAdd {
            key: key.to_string(),
            member: member.into(),
        });
        self
    }

    pub fn srem(&mut self, key: &str, member: impl Into<String>) -> &mut Self {
        self.ops.push(StoreOp::SRem {
            key: key.to_string(),
            member: member.into(),
        });
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.ops.push(StoreOp::Set {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn set_ex(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
        ttl: Duration,
    ) -> &mut Self {
        self.ops.push(StoreOp::SetEx {
            key: key.into(),
            value: value.into(),
            ttl,
        });
        self
    }

    pub fn del(&mut self, key: &str) -> &mut Self {
        self.ops.push(StoreOp::Del {
            key: key.to_string(),
        });
        self
    }

    /// Delete every key starting with `prefix`.
    pub fn del_prefix(&mut self, prefix: &str) -> &mut Self {
        self.ops.push(StoreOp::DelPrefix {
            prefix: prefix.to_string(),
        });
        self
    }

    pub fn incr(&mut self, key: &str) -> &mut Self {
        self.ops.push(StoreOp::Incr {
            key: key.to_string(),
        });
        self
    }

    pub fn zadd(&mut self, key: &str, score: f64, member: impl Into<String>) -> &mut Self {
        self.ops.push(StoreOp::ZAdd {
            key: key.to_string(),
            score,
            member: member.into(),
        });
        self
    }

    pub fn rpush(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        self.ops.push(StoreOp::RPush {
            key: key.to_string(),
            value: value.into(),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[StoreOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<StoreOp> {
        self.ops
    }
}

/// Atomic operations over sets, strings, counters, scored sets and lists.
///
/// Implementations are shared between tasks behind an `Arc`.
pub trait StateStore: Send + Sync + 'static {
    /// Add a member to a set, `true` if it was not present.
    fn sadd(&self, key: &str, member: &str)
        -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Remove a member from a set, `true` if it was present.
    fn srem(&self, key: &str, member: &str)
        -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Remove and return an arbitrary member of a set.
    fn spop(&self, key: &str) -> impl Future<Output = Result<Option<String>, StoreError>> + Send;

    fn scard(&self, key: &str) -> impl Future<Output = Result<u64, StoreError>> + Send;

    fn smembers(&self, key: &str) -> impl Future<Output = Result<Vec<String>, StoreError>> + Send;

    fn set(&self, key: &str, value: &str) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Set a value which expires after `ttl`.
    fn set_ex(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>, StoreError>> + Send;

    fn exists(&self, key: &str) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Increment a counter, returning the new value.
    fn incr(&self, key: &str) -> impl Future<Output = Result<i64, StoreError>> + Send;

    fn del(&self, key: &str) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Delete every key starting with `prefix`, returning how many went.
    fn del_prefix(&self, prefix: &str) -> impl Future<Output = Result<u64, StoreError>> + Send;

    fn zadd(
        &self,
        key: &str,
        score: f64,
        member: &str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Members of a scored set with `min <= score <= max`.
    fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> impl Future<Output = Result<Vec<String>, StoreError>> + Send;

    fn rpush(&self, key: &str, value: &str) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// The whole list stored under `key`.
    fn lrange(&self, key: &str) -> impl Future<Output = Result<Vec<String>, StoreError>> + Send;

    /// Apply a batch of writes.
    fn execute(&self, pipeline: Pipeline) -> impl Future<Output = Result<(), StoreError>> + Send;
}
