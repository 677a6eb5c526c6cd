//! Storage abstraction: the document catalog and the vector store.
//!
//! The catalog keeps one row per `(source, path)` with the ETag and
//! processor version that produced it — that tuple is the idempotency key
//! the engine uses to skip unchanged files. Embeddings hang off their file
//! row and die with it.
//!
//! | Implementation | Backing |
//! |----------------|---------|
//! | [`pg::PgStorage`] | PostgreSQL + pgvector, cosine-distance search |
//! | [`memory::MemoryStorage`] | In-process maps, brute-force search |

pub mod memory;
pub mod pg;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Version of the processing pipeline, persisted per file.
///
/// A change in `major`, `minor` or `embeddings_model` invalidates stored
/// embeddings; a `patch` bump deliberately does not.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorVersion {
    /// Files with an older major version must be reprocessed and cannot be
    /// used in queries.
    pub major: i32,
    /// Files with an older minor version must be reprocessed but can still
    /// serve queries meanwhile.
    pub minor: i32,
    /// Reprocessing is optional across patch versions.
    pub patch: i32,
    /// Model used to generate embeddings. A different model means the
    /// stored vectors live in a different space.
    pub embeddings_model: String,
}

impl ProcessorVersion {
    /// Whether embeddings stored under `stored` are invalid under `self`.
    pub fn invalidates(&self, stored: &ProcessorVersion) -> bool {
        self.major != stored.major
            || self.minor != stored.minor
            || self.embeddings_model != stored.embeddings_model
    }
}

/// Opaque storage-issued identifier of a catalog file row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileUuid(pub String);

impl std::fmt::Display for FileUuid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A registered data source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSource {
    pub uuid: String,
}

/// Catalog row for one file of one source.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub source_uuid: String,
    pub uuid: FileUuid,
    pub path: String,
    pub etag: String,

    pub parsed: bool,
    pub parse_error: Option<String>,
    pub parse_parts_errors: String,

    /// When the row was first created.
    pub created_at: DateTime<Utc>,
    pub processor_version: ProcessorVersion,
    /// Set once processing finished; `None` marks an in-flight (or stalled)
    /// row.
    pub processing_finished: Option<DateTime<Utc>>,
}

/// A stored embedding joined with its file row.
#[derive(Debug, Clone)]
pub struct Embedding {
    pub file: FileRecord,
    pub chunk: String,
    pub vector: Vec<f32>,
}

/// Per-source counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DataSourceStatistics {
    pub files: u64,
    pub files_processed: u64,
    pub files_parse_errors: u64,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("data source does not exist in storage")]
    SourceMissing,

    #[error("file does not exist in storage data source")]
    FileMissing,

    #[error("embedding vector must not be empty")]
    EmptyVector,

    #[error("storage backend error")]
    Backend(#[from] sqlx::Error),
}

/// The eight catalog and vector-store operations.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Idempotent source upsert.
    async fn get_or_create_source(&self, source: &str) -> Result<DataSource, StorageError>;

    /// Deletes the source with all its files and embeddings.
    async fn delete_source(&self, source: &str) -> Result<(), StorageError>;

    /// Looks the file up by `(source, path)`, creating the row when absent.
    /// The boolean reports whether this call created it.
    async fn get_or_create_file(
        &self,
        source: &str,
        path: &str,
        etag: &str,
        version: &ProcessorVersion,
    ) -> Result<(FileRecord, bool), StorageError>;

    /// Deletes the file row; its embeddings cascade.
    async fn delete_file(&self, source: &str, file: &FileUuid) -> Result<(), StorageError>;

    /// Records the parse outcome and stamps `processing_finished`.
    async fn finish_file_processing(
        &self,
        source: &str,
        file: &FileUuid,
        parsed: bool,
        parse_error: &str,
        parse_parts_errors: &[String],
    ) -> Result<(), StorageError>;

    /// Stores one chunk embedding. Empty vectors are refused.
    async fn put_embedding(
        &self,
        source: &str,
        file: &FileUuid,
        chunk: &str,
        vector: &[f32],
    ) -> Result<(), StorageError>;

    /// Nearest-neighbor search, ordered by cosine distance ascending. An
    /// empty `sources` slice searches everything.
    async fn search_similar_embeddings(
        &self,
        vector: &[f32],
        sources: &[String],
        limit: u32,
    ) -> Result<Vec<Embedding>, StorageError>;

    /// Per-source counters.
    async fn source_statistics(
        &self,
        source: &str,
    ) -> Result<DataSourceStatistics, StorageError>;
}
