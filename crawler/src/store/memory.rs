//! In-process [`StateStore`].
//!
//! Used by tests and by single-process deployments where the controller and
//! all workers share one address space.

use super::{Pipeline, StateStore, StoreOp};
use crate::error::StoreError;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

const WRONG_TYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";

#[derive(Debug, Clone)]
enum Value {
    Text {
        value: String,
        expires: Option<Instant>,
    },
    Set(HashSet<String>),
    Scored(HashMap<String, f64>),
    List(Vec<String>),
}

impl Value {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self, Value::Text { expires: Some(at), .. } if *at <= now)
    }
}

#[derive(Debug, Default)]
struct Entries {
    values: HashMap<String, Value>,
}

impl Entries {
    fn live(&mut self, key: &str) -> Option<&mut Value> {
        let now = Instant::now();
        if self.values.get(key).is_some_and(|v| v.is_expired(now)) {
            self.values.remove(key);
        }
        self.values.get_mut(key)
    }

    fn set_mut(&mut self, key: &str) -> Result<&mut HashSet<String>, StoreError> {
        match self
            .values
            .entry(key.to_string())
            .or_insert_with(|| Value::Set(HashSet::new()))
        {
            Value::Set(set) => Ok(set),
            _ => Err(StoreError::Backend(WRONG_TYPE.to_string())),
        }
    }

    fn sadd(&mut self, key: &str, member: &str) -> Result<bool, StoreError> {
        Ok(self.set_mut(key)?.insert(member.to_string()))
    }

    fn srem(&mut self, key: &str, member: &str) -> Result<bool, StoreError> {
        let removed = match self.live(key) {
            Some(Value::Set(set)) => set.remove(member),
            Some(_) => return Err(StoreError::Backend(WRONG_TYPE.to_string())),
            None => false,
        };
        self.drop_if_empty(key);
        Ok(removed)
    }

    fn set(&mut self, key: &str, value: &str, ttl: Option<Duration>) {
        self.values.insert(
            key.to_string(),
            Value::Text {
                value: value.to_string(),
                expires: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
    }

    fn incr(&mut self, key: &str) -> Result<i64, StoreError> {
        let next = match self.live(key) {
            Some(Value::Text { value, .. }) => value
                .parse::<i64>()
                .map_err(|_| StoreError::Backend(format!("value of {key} is not an integer")))?
                .checked_add(1)
                .ok_or_else(|| StoreError::Backend(format!("increment of {key} overflows")))?,
            Some(_) => return Err(StoreError::Backend(WRONG_TYPE.to_string())),
            None => 1,
        };
        // Counters keep any expiry they already had.
        match self.values.get_mut(key) {
            Some(Value::Text { value, .. }) => *value = next.to_string(),
            _ => self.set(key, &next.to_string(), None),
        }
        Ok(next)
    }

    fn del_prefix(&mut self, prefix: &str) -> u64 {
        let before = self.values.len();
        self.values.retain(|key, _| !key.starts_with(prefix));
        (before - self.values.len()) as u64
    }

    fn zadd(&mut self, key: &str, score: f64, member: &str) -> Result<(), StoreError> {
        match self
            .values
            .entry(key.to_string())
            .or_insert_with(|| Value::Scored(HashMap::new()))
        {
            Value::Scored(scores) => {
                scores.insert(member.to_string(), score);
                Ok(())
            }
            _ => Err(StoreError::Backend(WRONG_TYPE.to_string())),
        }
    }

    fn rpush(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        match self
            .values
            .entry(key.to_string())
            .or_insert_with(|| Value::List(Vec::new()))
        {
            Value::List(list) => {
                list.push(value.to_string());
                Ok(())
            }
            _ => Err(StoreError::Backend(WRONG_TYPE.to_string())),
        }
    }

    fn drop_if_empty(&mut self, key: &str) {
        if matches!(self.values.get(key), Some(Value::Set(set)) if set.is_empty()) {
            self.values.remove(key);
        }
    }

    fn apply(&mut self, op: StoreOp) -> Result<(), StoreError> {
        match op {
            StoreOp::SAdd { key, member } => self.sadd(&key, &member).map(|_| ()),
            StoreOp::SRem { key, member } => self.srem(&key, &member).map(|_| ()),
            StoreOp::Set { key, value } => {
                self.set(&key, &value, None);
                Ok(())
            }
            StoreOp::SetEx { key, value, ttl } => {
                self.set(&key, &value, Some(ttl));
                Ok(())
            }
            StoreOp::Del { key } => {
                self.values.remove(&key);
                Ok(())
            }
            StoreOp::DelPrefix { prefix } => {
                self.del_prefix(&prefix);
                Ok(())
            }
            StoreOp::Incr { key } => self.incr(&key).map(|_| ()),
            StoreOp::ZAdd { key, score, member } => self.zadd(&key, score, &member),
            StoreOp::RPush { key, value } => self.rpush(&key, &value),
        }
    }
}

/// [`StateStore`] backed by process memory.
///
/// Operations hold a mutex for their whole duration, so each one is atomic
/// with respect to every other.
#[derive(Debug)]
pub struct MemoryStore {
    entries: Mutex<Entries>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        MemoryStore::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            entries: Mutex::new(Entries::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the store going away (or coming back).
    ///
    /// While unavailable every operation fails with
    /// [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn entries(&self) -> Result<MutexGuard<'_, Entries>, StoreError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store disabled".to_string()));
        }
        self.entries
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }
}

impl StateStore for MemoryStore {
    async fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.entries()?.sadd(key, member)
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.entries()?.srem(key, member)
    }

    async fn spop(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut entries = self.entries()?;
        let popped = match entries.live(key) {
            Some(Value::Set(set)) => {
                let member = set.iter().next().cloned();
                if let Some(member) = &member {
                    set.remove(member);
                }
                member
            }
            Some(_) => return Err(StoreError::Backend(WRONG_TYPE.to_string())),
            None => None,
        };
        entries.drop_if_empty(key);
        Ok(popped)
    }

    async fn scard(&self, key: &str) -> Result<u64, StoreError> {
        match self.entries()?.live(key) {
            Some(Value::Set(set)) => Ok(set.len() as u64),
            Some(_) => Err(StoreError::Backend(WRONG_TYPE.to_string())),
            None => Ok(0),
        }
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        match self.entries()?.live(key) {
            Some(Value::Set(set)) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(StoreError::Backend(WRONG_TYPE.to_string())),
            None => Ok(Vec::new()),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries()?.set(key, value, None);
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.entries()?.set(key, value, Some(ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.entries()?.live(key) {
            Some(Value::Text { value, .. }) => Ok(Some(value.clone())),
            Some(_) => Err(StoreError::Backend(WRONG_TYPE.to_string())),
            None => Ok(None),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.entries()?.live(key).is_some())
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        self.entries()?.incr(key)
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.entries()?.values.remove(key);
        Ok(())
    }

    async fn del_prefix(&self, prefix: &str) -> Result<u64, StoreError> {
        Ok(self.entries()?.del_prefix(prefix))
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), StoreError> {
        self.entries()?.zadd(key, score, member)
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<String>, StoreError> {
        match self.entries()?.live(key) {
            Some(Value::Scored(scores)) => {
                let mut members: Vec<(&String, f64)> = scores
                    .iter()
                    .filter(|(_, score)| **score >= min && **score <= max)
                    .map(|(member, score)| (member, *score))
                    .collect();
                members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));
                Ok(members.into_iter().map(|(m, _)| m.clone()).collect())
            }
            Some(_) => Err(StoreError::Backend(WRONG_TYPE.to_string())),
            None => Ok(Vec::new()),
        }
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries()?.rpush(key, value)
    }

    async fn lrange(&self, key: &str) -> Result<Vec<String>, StoreError> {
        match self.entries()?.live(key) {
            Some(Value::List(list)) => Ok(list.clone()),
            Some(_) => Err(StoreError::Backend(WRONG_TYPE.to_string())),
            None => Ok(Vec::new()),
        }
    }

    async fn execute(&self, pipeline: Pipeline) -> Result<(), StoreError> {
        let mut entries = self.entries()?;
        for op in pipeline.into_ops() {
            entries.apply(op)?;
        }
        Ok(())
    }
}
