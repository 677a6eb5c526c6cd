//! Data source contract.
//!
//! A source owns an iterator of file handlers and receives lifecycle
//! notifications about each file it yields: one `Started`, a best-effort
//! stream of `Running` progress events, and one `Done` with the outcome.
//! Notifications are delivered at most once; a notifier that returns an
//! error aborts the file's processing.

pub mod fs;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::parser::Input;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source i/o error")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),

    #[error("source operation canceled")]
    Canceled,
}

/// Why a file's processing ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneReason {
    /// Parsed and embedded successfully.
    Ok,
    /// The file itself failed to parse; the pipeline moved on.
    Error,
    /// Processing was cut short (embedder/storage failure, cancellation,
    /// or a notifier error).
    Aborted,
}

/// Emitted once when a file's processing starts.
#[derive(Debug, Clone)]
pub struct ProcessingStarted {
    /// Identifier of this processing run; identical across the Started,
    /// Running and Done events of one file.
    pub uuid: String,
    pub path: String,
    pub user_metadata: Option<serde_json::Value>,
}

/// Emitted while processing runs, at most once per parser update and at
/// least every 30 seconds while work is ongoing (best effort).
#[derive(Debug, Clone)]
pub struct ProcessingRunning {
    pub uuid: String,
    pub path: String,
    pub user_metadata: Option<serde_json::Value>,
    /// Percentage in `[0, 100]`.
    pub progress: u8,
}

/// Emitted once when a file's processing ends.
#[derive(Debug, Clone)]
pub struct ProcessingDone {
    pub uuid: String,
    pub path: String,
    pub user_metadata: Option<serde_json::Value>,
    pub reason: DoneReason,
    /// Set when `reason` is not `Ok`.
    pub error: Option<String>,
}

/// A place where files live.
#[async_trait]
pub trait Source: Send + Sync {
    /// Stable identifier of this source; used as the storage key.
    fn uuid(&self) -> &str;

    /// Opens the source for iteration.
    async fn open(&self) -> Result<Box<dyn SourceIterator>, SourceError>;

    async fn notify_started(
        &self,
        ctx: &CancellationToken,
        event: ProcessingStarted,
    ) -> Result<(), SourceError>;

    async fn notify_running(
        &self,
        ctx: &CancellationToken,
        event: ProcessingRunning,
    ) -> Result<(), SourceError>;

    async fn notify_done(
        &self,
        ctx: &CancellationToken,
        event: ProcessingDone,
    ) -> Result<(), SourceError>;
}

/// An opened source.
#[async_trait]
pub trait SourceIterator: Send {
    /// The next file, or `None` when the source is exhausted.
    async fn next(
        &mut self,
        ctx: &CancellationToken,
    ) -> Result<Option<Box<dyn FileHandler>>, SourceError>;

    async fn close(&mut self) -> Result<(), SourceError>;
}

/// One file yielded by a source.
#[async_trait]
pub trait FileHandler: Send {
    /// Source-relative path.
    fn path(&self) -> &str;

    /// Opaque content fingerprint; identical bytes produce identical ETags.
    fn etag(&self) -> &str;

    /// Arbitrary caller data, passed through to notifications unchanged.
    fn user_metadata(&self) -> Option<serde_json::Value> {
        None
    }

    /// Opens the content for streaming.
    async fn open(&mut self) -> Result<Input, SourceError>;
}
