//! Error types shared across the crawler.

use crate::builder::CrawlerBuilderError;
use crate::config::ConfigError;
use crate::node::RecordParseError;
use crate::snapshot::SnapshotError;
use std::fmt;

/// Errors from the shared state store.
///
/// Any of these is fatal for the task that hit it.
#[derive(Debug)]
pub enum StoreError {
    /// The store cannot be reached.
    Unavailable(String),
    /// The store rejected an operation.
    Backend(String),
    /// A stored value failed to parse.
    Corrupt(RecordParseError),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Unavailable(msg) => write!(f, "State store unavailable: {msg}"),
            StoreError::Backend(msg) => write!(f, "State store error: {msg}"),
            StoreError::Corrupt(err) => write!(f, "Corrupt stored record: {err}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Corrupt(err) => Some(err),
            _ => None,
        }
    }
}

impl From<RecordParseError> for StoreError {
    fn from(err: RecordParseError) -> Self {
        StoreError::Corrupt(err)
    }
}

/// Top level errors ending a controller or worker process.
#[derive(Debug)]
pub enum CrawlError {
    Config(ConfigError),
    Store(StoreError),
    Snapshot(SnapshotError),
    Builder(CrawlerBuilderError),
    /// A crawl task panicked or was torn down unexpectedly.
    Task(String),
}

impl fmt::Display for CrawlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrawlError::Config(err) => write!(f, "Configuration error: {err}"),
            CrawlError::Store(err) => write!(f, "{err}"),
            CrawlError::Snapshot(err) => write!(f, "Snapshot error: {err}"),
            CrawlError::Builder(err) => write!(f, "Cannot build crawler: {err}"),
            CrawlError::Task(msg) => write!(f, "Crawl task failed: {msg}"),
        }
    }
}

impl std::error::Error for CrawlError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CrawlError::Config(err) => Some(err),
            CrawlError::Store(err) => Some(err),
            CrawlError::Snapshot(err) => Some(err),
            CrawlError::Builder(err) => Some(err),
            CrawlError::Task(_) => None,
        }
    }
}

impl From<ConfigError> for CrawlError {
    fn from(err: ConfigError) -> Self {
        CrawlError::Config(err)
    }
}

impl From<StoreError> for CrawlError {
    fn from(err: StoreError) -> Self {
        CrawlError::Store(err)
    }
}

impl From<CrawlerBuilderError> for CrawlError {
    fn from(err: CrawlerBuilderError) -> Self {
        CrawlError::Builder(err)
    }
}

impl From<SnapshotError> for CrawlError {
    fn from(err: SnapshotError) -> Self {
        CrawlError::Snapshot(err)
    }
}
