//! [`StateStore`] on a Redis server, shared by every process of a deployment.

use super::{Pipeline, StateStore, StoreOp};
use crate::error::StoreError;
use log::debug;
use redis::aio::MultiplexedConnection;
use redis::RedisError;
use std::time::Duration;

/// Keys fetched per `SCAN` round trip.
const SCAN_BATCH: usize = 1000;

fn store_error(err: RedisError) -> StoreError {
    if err.is_io_error()
        || err.is_connection_refusal()
        || err.is_connection_dropped()
        || err.is_timeout()
    {
        StoreError::Unavailable(err.to_string())
    } else {
        StoreError::Backend(err.to_string())
    }
}

/// Redis `EX` takes whole seconds, at least one.
fn ttl_seconds(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

/// Redis backed state store.
///
/// Holds one multiplexed connection which is cloned per operation, so many
/// tasks can issue commands concurrently.
#[derive(Clone)]
pub struct RedisStore {
    connection: MultiplexedConnection,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to the server at `url`, e.g. `redis://127.0.0.1:6379/0`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(store_error)?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(store_error)?;
        debug!("Connected to state store at {url}");
        Ok(RedisStore { connection })
    }

    fn connection(&self) -> MultiplexedConnection {
        self.connection.clone()
    }

    /// Every key starting with `prefix`, gathered with `SCAN`.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut con = self.connection();
        let pattern = format!("{}*", escape_glob(prefix));
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern.as_str())
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut con)
                .await
                .map_err(store_error)?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(keys)
    }
}

/// Escape glob metacharacters so a prefix matches literally.
fn escape_glob(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

impl StateStore for RedisStore {
    async fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let added: i64 = redis::cmd("SADD")
            .arg(key)
            .arg(member)
            .query_async(&mut self.connection())
            .await
            .map_err(store_error)?;
        Ok(added > 0)
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let removed: i64 = redis::cmd("SREM")
            .arg(key)
            .arg(member)
            .query_async(&mut self.connection())
            .await
            .map_err(store_error)?;
        Ok(removed > 0)
    }

    async fn spop(&self, key: &str) -> Result<Option<String>, StoreError> {
        redis::cmd("SPOP")
            .arg(key)
            .query_async(&mut self.connection())
            .await
            .map_err(store_error)
    }

    async fn scard(&self, key: &str) -> Result<u64, StoreError> {
        redis::cmd("SCARD")
            .arg(key)
            .query_async(&mut self.connection())
            .await
            .map_err(store_error)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        redis::cmd("SMEMBERS")
            .arg(key)
            .query_async(&mut self.connection())
            .await
            .map_err(store_error)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async(&mut self.connection())
            .await
            .map_err(store_error)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_seconds(ttl))
            .query_async(&mut self.connection())
            .await
            .map_err(store_error)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut self.connection())
            .await
            .map_err(store_error)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let count: i64 = redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut self.connection())
            .await
            .map_err(store_error)?;
        Ok(count > 0)
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        redis::cmd("INCR")
            .arg(key)
            .query_async(&mut self.connection())
            .await
            .map_err(store_error)
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        redis::cmd("DEL")
            .arg(key)
            .query_async(&mut self.connection())
            .await
            .map_err(store_error)
    }

    async fn del_prefix(&self, prefix: &str) -> Result<u64, StoreError> {
        let keys = self.keys_with_prefix(prefix).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        redis::cmd("DEL")
            .arg(keys)
            .query_async(&mut self.connection())
            .await
            .map_err(store_error)
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), StoreError> {
        redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async(&mut self.connection())
            .await
            .map_err(store_error)
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<String>, StoreError> {
        redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg(min)
            .arg(max)
            .query_async(&mut self.connection())
            .await
            .map_err(store_error)
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<(), StoreError> {
        redis::cmd("RPUSH")
            .arg(key)
            .arg(value)
            .query_async(&mut self.connection())
            .await
            .map_err(store_error)
    }

    async fn lrange(&self, key: &str) -> Result<Vec<String>, StoreError> {
        redis::cmd("LRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .query_async(&mut self.connection())
            .await
            .map_err(store_error)
    }

    async fn execute(&self, pipeline: Pipeline) -> Result<(), StoreError> {
        if pipeline.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        for op in pipeline.into_ops() {
            match op {
                StoreOp::SAdd { key, member } => {
                    pipe.cmd("SADD").arg(key).arg(member).ignore();
                }
                StoreOp::SRem { key, member } => {
                    pipe.cmd("SREM").arg(key).arg(member).ignore();
                }
                StoreOp::Set { key, value } => {
                    pipe.cmd("SET").arg(key).arg(value).ignore();
                }
                StoreOp::SetEx { key, value, ttl } => {
                    pipe.cmd("SET")
                        .arg(key)
                        .arg(value)
                        .arg("EX")
                        .arg(ttl_seconds(ttl))
                        .ignore();
                }
                StoreOp::Del { key } => {
                    pipe.cmd("DEL").arg(key).ignore();
                }
                StoreOp::DelPrefix { prefix } => {
                    // Resolved up front, keys created after the scan survive.
                    let keys = self.keys_with_prefix(&prefix).await?;
                    if !keys.is_empty() {
                        pipe.cmd("DEL").arg(keys).ignore();
                    }
                }
                StoreOp::Incr { key } => {
                    pipe.cmd("INCR").arg(key).ignore();
                }
                StoreOp::ZAdd { key, score, member } => {
                    pipe.cmd("ZADD").arg(key).arg(score).arg(member).ignore();
                }
                StoreOp::RPush { key, value } => {
                    pipe.cmd("RPUSH").arg(key).arg(value).ignore();
                }
            }
        }

        pipe.query_async::<()>(&mut self.connection())
            .await
            .map_err(store_error)
    }
}
