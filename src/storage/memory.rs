//! In-memory [`Storage`] implementation.
//!
//! Backs unit and engine tests without a database. Vector search is
//! brute-force cosine distance over every stored embedding, which keeps it
//! behaviorally identical to the pgvector backend for small data sets.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::vector;

use super::{
    DataSource, DataSourceStatistics, Embedding, FileRecord, FileUuid, ProcessorVersion, Storage,
    StorageError,
};

#[derive(Default)]
struct Inner {
    sources: HashMap<String, ()>,
    /// Keyed by `(source_uuid, path)`.
    files: HashMap<(String, String), FileRecord>,
    embeddings: Vec<StoredEmbedding>,
    next_file_id: u64,
}

struct StoredEmbedding {
    source_uuid: String,
    file_uuid: FileUuid,
    chunk: String,
    vector: Vec<f32>,
}

#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

fn cosine_distance(a: &[f32], b: &[f32]) -> f64 {
    let dot = vector::dot(a, b).unwrap_or(0.0) as f64;
    let norm_a: f64 = a.iter().map(|&x| f64::from(x) * f64::from(x)).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|&x| f64::from(x) * f64::from(x)).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    1.0 - dot / (norm_a * norm_b)
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get_or_create_source(&self, source: &str) -> Result<DataSource, StorageError> {
        let mut inner = self.inner.lock().unwrap();
        inner.sources.entry(source.to_string()).or_insert(());
        Ok(DataSource {
            uuid: source.to_string(),
        })
    }

    async fn delete_source(&self, source: &str) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.sources.remove(source).is_none() {
            return Err(StorageError::SourceMissing);
        }
        inner.files.retain(|(src, _), _| src != source);
        inner.embeddings.retain(|e| e.source_uuid != source);
        Ok(())
    }

    async fn get_or_create_file(
        &self,
        source: &str,
        path: &str,
        etag: &str,
        version: &ProcessorVersion,
    ) -> Result<(FileRecord, bool), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.sources.contains_key(source) {
            return Err(StorageError::SourceMissing);
        }

        let key = (source.to_string(), path.to_string());
        if let Some(existing) = inner.files.get(&key) {
            return Ok((existing.clone(), false));
        }

        inner.next_file_id += 1;
        let record = FileRecord {
            source_uuid: source.to_string(),
            uuid: FileUuid(inner.next_file_id.to_string()),
            path: path.to_string(),
            etag: etag.to_string(),
            parsed: false,
            parse_error: None,
            parse_parts_errors: String::new(),
            created_at: Utc::now(),
            processor_version: version.clone(),
            processing_finished: None,
        };
        inner.files.insert(key, record.clone());
        Ok((record, true))
    }

    async fn delete_file(&self, source: &str, file: &FileUuid) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        let key = inner
            .files
            .iter()
            .find(|((src, _), record)| src == source && record.uuid == *file)
            .map(|(key, _)| key.clone());

        match key {
            Some(key) => {
                inner.files.remove(&key);
                inner
                    .embeddings
                    .retain(|e| !(e.source_uuid == source && e.file_uuid == *file));
                Ok(())
            }
            None => Err(StorageError::FileMissing),
        }
    }

    async fn finish_file_processing(
        &self,
        source: &str,
        file: &FileUuid,
        parsed: bool,
        parse_error: &str,
        parse_parts_errors: &[String],
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner
            .files
            .values_mut()
            .find(|record| record.source_uuid == source && record.uuid == *file)
            .ok_or(StorageError::FileMissing)?;

        record.parsed = parsed;
        record.parse_error = if parse_error.is_empty() {
            None
        } else {
            Some(parse_error.to_string())
        };
        record.parse_parts_errors = parse_parts_errors.join("\n");
        record.processing_finished = Some(Utc::now());
        Ok(())
    }

    async fn put_embedding(
        &self,
        source: &str,
        file: &FileUuid,
        chunk: &str,
        vector: &[f32],
    ) -> Result<(), StorageError> {
        if vector.is_empty() {
            return Err(StorageError::EmptyVector);
        }

        let mut inner = self.inner.lock().unwrap();
        let file_exists = inner
            .files
            .values()
            .any(|record| record.source_uuid == source && record.uuid == *file);
        if !file_exists {
            return Err(StorageError::FileMissing);
        }

        inner.embeddings.push(StoredEmbedding {
            source_uuid: source.to_string(),
            file_uuid: file.clone(),
            chunk: chunk.to_string(),
            vector: vector.to_vec(),
        });
        Ok(())
    }

    async fn search_similar_embeddings(
        &self,
        vector: &[f32],
        sources: &[String],
        limit: u32,
    ) -> Result<Vec<Embedding>, StorageError> {
        if vector.is_empty() {
            return Err(StorageError::EmptyVector);
        }

        let inner = self.inner.lock().unwrap();
        let mut scored: Vec<(f64, Embedding)> = inner
            .embeddings
            .iter()
            .filter(|e| sources.is_empty() || sources.contains(&e.source_uuid))
            .filter_map(|e| {
                let file = inner
                    .files
                    .values()
                    .find(|record| {
                        record.source_uuid == e.source_uuid && record.uuid == e.file_uuid
                    })?
                    .clone();
                Some((
                    cosine_distance(vector, &e.vector),
                    Embedding {
                        file,
                        chunk: e.chunk.clone(),
                        vector: e.vector.clone(),
                    },
                ))
            })
            .collect();

        scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit as usize);
        Ok(scored.into_iter().map(|(_, e)| e).collect())
    }

    async fn source_statistics(
        &self,
        source: &str,
    ) -> Result<DataSourceStatistics, StorageError> {
        let inner = self.inner.lock().unwrap();
        if !inner.sources.contains_key(source) {
            return Err(StorageError::SourceMissing);
        }

        let mut stats = DataSourceStatistics::default();
        for record in inner.files.values() {
            if record.source_uuid != source {
                continue;
            }
            stats.files += 1;
            if record.processing_finished.is_some() {
                stats.files_processed += 1;
            }
            if record.parse_error.is_some() {
                stats.files_parse_errors += 1;
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::testutil::MockEmbedder;

    fn version() -> ProcessorVersion {
        ProcessorVersion {
            major: 1,
            minor: 0,
            patch: 0,
            embeddings_model: "mock".to_string(),
        }
    }

    #[tokio::test]
    async fn file_requires_source() {
        let storage = MemoryStorage::new();
        let err = storage
            .get_or_create_file("ghost", "a.txt", "etag", &version())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::SourceMissing));
    }

    #[tokio::test]
    async fn get_or_create_file_is_idempotent() {
        let storage = MemoryStorage::new();
        storage.get_or_create_source("s1").await.unwrap();

        let (first, created) = storage
            .get_or_create_file("s1", "a.txt", "etag", &version())
            .await
            .unwrap();
        assert!(created);

        let (second, created) = storage
            .get_or_create_file("s1", "a.txt", "etag", &version())
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(first.uuid, second.uuid);
    }

    #[tokio::test]
    async fn put_search_delete_round_trip() {
        let storage = MemoryStorage::new();
        let embedder = MockEmbedder::new(32);
        storage.get_or_create_source("s1").await.unwrap();
        let (file, _) = storage
            .get_or_create_file("s1", "a.txt", "etag", &version())
            .await
            .unwrap();

        let vec_a = embedder.vector_for("first chunk");
        storage
            .put_embedding("s1", &file.uuid, "first chunk", &vec_a)
            .await
            .unwrap();
        storage
            .put_embedding("s1", &file.uuid, "second chunk", &embedder.vector_for("second chunk"))
            .await
            .unwrap();

        let results = storage
            .search_similar_embeddings(&vec_a, &["s1".to_string()], 10)
            .await
            .unwrap();
        assert_eq!(results[0].file.uuid, file.uuid);
        assert_eq!(results[0].chunk, "first chunk");

        storage.delete_file("s1", &file.uuid).await.unwrap();
        let results = storage
            .search_similar_embeddings(&vec_a, &["s1".to_string()], 10)
            .await
            .unwrap();
        assert!(results.iter().all(|e| e.file.uuid != file.uuid));
    }

    #[tokio::test]
    async fn empty_vector_is_refused() {
        let storage = MemoryStorage::new();
        storage.get_or_create_source("s1").await.unwrap();
        let (file, _) = storage
            .get_or_create_file("s1", "a.txt", "etag", &version())
            .await
            .unwrap();

        let err = storage
            .put_embedding("s1", &file.uuid, "chunk", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::EmptyVector));

        let err = storage
            .search_similar_embeddings(&[], &[], 10)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::EmptyVector));
    }

    #[tokio::test]
    async fn search_respects_limit_and_source_filter() {
        let storage = MemoryStorage::new();
        let embedder = MockEmbedder::new(16);
        for source in ["s1", "s2"] {
            storage.get_or_create_source(source).await.unwrap();
            let (file, _) = storage
                .get_or_create_file(source, "a.txt", "etag", &version())
                .await
                .unwrap();
            for i in 0..8 {
                let text = format!("{source} chunk {i}");
                storage
                    .put_embedding(source, &file.uuid, &text, &embedder.vector_for(&text))
                    .await
                    .unwrap();
            }
        }

        let probe = embedder.vector_for("s1 chunk 0");
        let results = storage
            .search_similar_embeddings(&probe, &["s1".to_string()], 5)
            .await
            .unwrap();
        assert!(results.len() <= 5);
        assert!(results.iter().all(|e| e.file.source_uuid == "s1"));

        let all = storage.search_similar_embeddings(&probe, &[], 100).await.unwrap();
        assert_eq!(all.len(), 16);
    }

    #[tokio::test]
    async fn delete_source_cascades() {
        let storage = MemoryStorage::new();
        let embedder = MockEmbedder::new(16);
        storage.get_or_create_source("s1").await.unwrap();
        let (file, _) = storage
            .get_or_create_file("s1", "a.txt", "etag", &version())
            .await
            .unwrap();
        storage
            .put_embedding("s1", &file.uuid, "c", &embedder.vector_for("c"))
            .await
            .unwrap();

        storage.delete_source("s1").await.unwrap();
        assert!(matches!(
            storage.delete_source("s1").await.unwrap_err(),
            StorageError::SourceMissing
        ));
        let results = storage
            .search_similar_embeddings(&embedder.vector_for("c"), &[], 10)
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn statistics_count_outcomes() {
        let storage = MemoryStorage::new();
        storage.get_or_create_source("s1").await.unwrap();

        let (ok_file, _) = storage
            .get_or_create_file("s1", "ok.png", "e1", &version())
            .await
            .unwrap();
        storage
            .finish_file_processing("s1", &ok_file.uuid, true, "", &[])
            .await
            .unwrap();

        let (bad_file, _) = storage
            .get_or_create_file("s1", "bad.bin", "e2", &version())
            .await
            .unwrap();
        storage
            .finish_file_processing("s1", &bad_file.uuid, false, "mime type not supported", &[])
            .await
            .unwrap();

        storage
            .get_or_create_file("s1", "pending.png", "e3", &version())
            .await
            .unwrap();

        let stats = storage.source_statistics("s1").await.unwrap();
        assert_eq!(
            stats,
            DataSourceStatistics {
                files: 3,
                files_processed: 2,
                files_parse_errors: 1,
            }
        );
    }
}
