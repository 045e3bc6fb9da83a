//! Per epoch output files for offline analysis.

use crate::node::{DiscoveryRecord, NodeKey};
use chrono::{Local, TimeZone};
use log::{info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

/// zstd level for the discovery graph.
const GRAPH_COMPRESSION_LEVEL: i32 = 3;

/// One reading of the discovery rate sampler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    /// Seconds since the sampler (re)started.
    pub index: u64,
    /// Growth of `up` since the previous reading.
    pub newly_reachable: i64,
}

/// A reachable node with the height it reported, `0` when unknown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReachableNode {
    pub key: NodeKey,
    pub height: i32,
}

/// Discovery counts of one parent across the epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryStats {
    pub parent: NodeKey,
    pub max: i64,
    /// Mean of `counts`, rounded half to even.
    pub mean: i64,
    pub counts: Vec<i64>,
}

/// Everything written at the end of an epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochSnapshot {
    /// Unix time of the rollover.
    pub timestamp: i64,
    pub reachable: Vec<ReachableNode>,
    pub discovery: Vec<DiscoveryRecord>,
    pub samples: Vec<Sample>,
}

impl EpochSnapshot {
    /// Per parent discovery statistics, in order of first appearance.
    pub fn discovery_stats(&self) -> Vec<DiscoveryStats> {
        let mut order: Vec<&NodeKey> = Vec::new();
        let mut counts: BTreeMap<&NodeKey, Vec<i64>> = BTreeMap::new();
        for record in &self.discovery {
            counts
                .entry(&record.parent)
                .or_insert_with(|| {
                    order.push(&record.parent);
                    Vec::new()
                })
                .push(record.count);
        }

        order
            .into_iter()
            .filter_map(|parent| {
                let counts = counts.remove(parent)?;
                let max = counts.iter().copied().max()?;
                let sum: i64 = counts.iter().sum();
                let mean = (sum as f64 / counts.len() as f64).round_ties_even() as i64;
                Some(DiscoveryStats {
                    parent: parent.clone(),
                    max,
                    mean,
                    counts,
                })
            })
            .collect()
    }

    /// Children advertised by each parent which answered with an address list.
    pub fn discovery_graph(&self) -> BTreeMap<String, BTreeSet<String>> {
        let mut graph: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for record in self.discovery.iter().filter(|record| record.count >= 0) {
            graph
                .entry(record.parent.to_string())
                .or_default()
                .extend(record.children.iter().map(NodeKey::to_string));
        }
        graph
    }
}

/// Errors while writing snapshot files.
#[derive(Debug)]
pub enum SnapshotError {
    Io(io::Error),
    Json(serde_json::Error),
    Csv(csv::Error),
    /// The epoch timestamp has no local time representation.
    Timestamp(i64),
}

impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotError::Io(err) => write!(f, "I/O error: {err}"),
            SnapshotError::Json(err) => write!(f, "JSON error: {err}"),
            SnapshotError::Csv(err) => write!(f, "CSV error: {err}"),
            SnapshotError::Timestamp(ts) => write!(f, "Invalid epoch timestamp {ts}"),
        }
    }
}

impl std::error::Error for SnapshotError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SnapshotError::Io(err) => Some(err),
            SnapshotError::Json(err) => Some(err),
            SnapshotError::Csv(err) => Some(err),
            SnapshotError::Timestamp(_) => None,
        }
    }
}

impl From<io::Error> for SnapshotError {
    fn from(err: io::Error) -> Self {
        SnapshotError::Io(err)
    }
}

impl From<serde_json::Error> for SnapshotError {
    fn from(err: serde_json::Error) -> Self {
        SnapshotError::Json(err)
    }
}

impl From<csv::Error> for SnapshotError {
    fn from(err: csv::Error) -> Self {
        SnapshotError::Csv(err)
    }
}

/// Destination of epoch snapshots.
pub trait SnapshotSink: Send {
    fn write(
        &mut self,
        snapshot: &EpochSnapshot,
    ) -> impl std::future::Future<Output = Result<(), SnapshotError>> + Send;
}

/// Writes snapshots as files into one directory.
#[derive(Debug, Clone)]
pub struct FileSnapshotWriter {
    dir: PathBuf,
}

impl FileSnapshotWriter {
    /// Writer into `dir`, created if missing.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, SnapshotError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(FileSnapshotWriter { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Local time stamp used in file names, e.g. `20240102-13:04:05`.
    pub fn stamp(timestamp: i64) -> Result<String, SnapshotError> {
        let time = Local
            .timestamp_opt(timestamp, 0)
            .earliest()
            .ok_or(SnapshotError::Timestamp(timestamp))?;
        Ok(time.format("%Y%m%d-%H:%M:%S").to_string())
    }

    fn write_reachable(&self, stamp: &str, snapshot: &EpochSnapshot) -> Result<(), SnapshotError> {
        if snapshot.reachable.is_empty() {
            warn!("No reachable nodes, skipping reachable node snapshot");
            return Ok(());
        }

        let rows: Vec<(String, u16, u64, i32)> = snapshot
            .reachable
            .iter()
            .map(|node| {
                (
                    node.key.address.to_string(),
                    node.key.port,
                    node.key.services,
                    node.height,
                )
            })
            .collect();

        let path = self.dir.join(format!("{stamp}.json"));
        let mut writer = BufWriter::new(File::create(&path)?);
        serde_json::to_writer(&mut writer, &rows)?;
        writer.flush()?;
        info!("Wrote {}", path.display());
        Ok(())
    }

    fn write_discovery_stats(
        &self,
        stamp: &str,
        snapshot: &EpochSnapshot,
    ) -> Result<(), SnapshotError> {
        let path = self.dir.join(format!("nodes_per_getADDR_{stamp}.csv"));
        let mut writer = csv::WriterBuilder::new()
            .flexible(true)
            .has_headers(false)
            .from_path(&path)?;
        for stats in snapshot.discovery_stats() {
            let mut row = vec![
                stats.parent.to_string(),
                stats.max.to_string(),
                stats.mean.to_string(),
            ];
            row.extend(stats.counts.iter().map(i64::to_string));
            writer.write_record(&row)?;
        }
        writer.flush()?;
        info!("Wrote {}", path.display());
        Ok(())
    }

    fn write_discovery_graph(
        &self,
        stamp: &str,
        snapshot: &EpochSnapshot,
    ) -> Result<(), SnapshotError> {
        let path = self.dir.join(format!("nodes_per_getADDR_{stamp}.json.zst"));
        let mut encoder = zstd::Encoder::new(File::create(&path)?, GRAPH_COMPRESSION_LEVEL)?;
        serde_json::to_writer(&mut encoder, &snapshot.discovery_graph())?;
        encoder.finish()?.sync_all()?;
        info!("Wrote {}", path.display());
        Ok(())
    }

    fn write_samples(&self, stamp: &str, snapshot: &EpochSnapshot) -> Result<(), SnapshotError> {
        let path = self.dir.join(format!("up_nodes_per_seconds_{stamp}.csv"));
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_path(&path)?;
        for sample in &snapshot.samples {
            writer.write_record([sample.index.to_string(), sample.newly_reachable.to_string()])?;
        }
        writer.flush()?;
        info!("Wrote {}", path.display());
        Ok(())
    }

    fn write_files(&self, snapshot: &EpochSnapshot) -> Result<(), SnapshotError> {
        let stamp = Self::stamp(snapshot.timestamp)?;
        self.write_samples(&stamp, snapshot)?;
        self.write_discovery_stats(&stamp, snapshot)?;
        self.write_discovery_graph(&stamp, snapshot)?;
        self.write_reachable(&stamp, snapshot)
    }
}

impl SnapshotSink for FileSnapshotWriter {
    /// Files and compression are handled on the blocking pool.
    fn write(
        &mut self,
        snapshot: &EpochSnapshot,
    ) -> impl std::future::Future<Output = Result<(), SnapshotError>> + Send {
        let writer = self.clone();
        let snapshot = snapshot.clone();
        async move {
            tokio::task::spawn_blocking(move || writer.write_files(&snapshot))
                .await
                .map_err(|e| SnapshotError::Io(io::Error::other(e)))?
        }
    }
}

#[cfg(test)]
pub mod test_utils {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Keeps every snapshot in memory.
    #[derive(Debug, Clone, Default)]
    pub struct MemorySink {
        pub snapshots: Arc<Mutex<Vec<EpochSnapshot>>>,
    }

    impl SnapshotSink for MemorySink {
        async fn write(&mut self, snapshot: &EpochSnapshot) -> Result<(), SnapshotError> {
            self.snapshots.lock().unwrap().push(snapshot.clone());
            Ok(())
        }
    }
}
