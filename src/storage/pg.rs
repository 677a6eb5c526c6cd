//! PostgreSQL + pgvector [`Storage`] backend.
//!
//! Catalog rows live in relational tables; embeddings are `vector(D)`
//! columns searched with the pgvector cosine-distance operator `<=>` over
//! an HNSW index. Table names are parameterized by schema and prefix so
//! several deployments can share one database.
//!
//! ```text
//! {schema}.{prefix}source ──< {schema}.{prefix}file ──< {schema}.{prefix}embedding
//!   source_id, uuid            file_id, path, etag,       chunk, embedding vector(D)
//!                              version, timestamps
//! ```
//!
//! Deletes cascade through the foreign keys, which is what makes
//! `DeleteFile`/`DeleteSource` atomic from the engine's point of view.

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::Row;

use super::{
    DataSource, DataSourceStatistics, Embedding, FileRecord, FileUuid, ProcessorVersion, Storage,
    StorageError,
};

#[derive(Debug, Clone)]
pub struct PgStorageConfig {
    /// Database schema holding the tables.
    pub schema: String,
    /// Table name prefix.
    pub prefix: String,
    /// Dimensionality of the `vector` column; must match the embedder.
    pub vector_dimensions: u32,
}

impl Default for PgStorageConfig {
    fn default() -> Self {
        Self {
            schema: "public".to_string(),
            prefix: "file2llm_".to_string(),
            vector_dimensions: 768,
        }
    }
}

pub struct PgStorage {
    pool: PgPool,
    config: PgStorageConfig,
    source_table: String,
    file_table: String,
    embedding_table: String,
}

impl PgStorage {
    pub fn new(pool: PgPool, config: PgStorageConfig) -> Self {
        let source_table = format!("{}.{}source", config.schema, config.prefix);
        let file_table = format!("{}.{}file", config.schema, config.prefix);
        let embedding_table = format!("{}.{}embedding", config.schema, config.prefix);
        Self {
            pool,
            config,
            source_table,
            file_table,
            embedding_table,
        }
    }

    /// Creates the extension, schema, tables and the HNSW index. Safe to
    /// run repeatedly.
    pub async fn install(&self) -> Result<(), StorageError> {
        sqlx::query("CREATE EXTENSION IF NOT EXISTS vector")
            .execute(&self.pool)
            .await?;
        sqlx::query(&format!(
            "CREATE SCHEMA IF NOT EXISTS {}",
            self.config.schema
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {source} (
                source_id BIGSERIAL PRIMARY KEY,
                uuid TEXT NOT NULL UNIQUE
            )
            "#,
            source = self.source_table
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {file} (
                file_id BIGSERIAL PRIMARY KEY,
                source_id BIGINT NOT NULL REFERENCES {source} (source_id) ON DELETE CASCADE,
                path TEXT NOT NULL,
                etag TEXT NOT NULL,
                parsed BOOLEAN NOT NULL DEFAULT FALSE,
                parse_error TEXT,
                parse_parts_errors TEXT NOT NULL DEFAULT '',
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                version_major INTEGER NOT NULL,
                version_minor INTEGER NOT NULL,
                version_patch INTEGER NOT NULL,
                version_model TEXT NOT NULL,
                processing_finished TIMESTAMPTZ,
                UNIQUE (source_id, path)
            )
            "#,
            file = self.file_table,
            source = self.source_table
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {embedding} (
                embedding_id BIGSERIAL PRIMARY KEY,
                source_id BIGINT NOT NULL REFERENCES {source} (source_id) ON DELETE CASCADE,
                file_id BIGINT NOT NULL REFERENCES {file} (file_id) ON DELETE CASCADE,
                chunk TEXT NOT NULL,
                embedding vector({dimensions}) NOT NULL
            )
            "#,
            embedding = self.embedding_table,
            source = self.source_table,
            file = self.file_table,
            dimensions = self.config.vector_dimensions
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            r#"
            CREATE INDEX IF NOT EXISTS idx_{prefix}embedding_vector
            ON {embedding}
            USING hnsw (embedding vector_cosine_ops)
            "#,
            prefix = self.config.prefix,
            embedding = self.embedding_table
        ))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Drops every table this backend created.
    pub async fn uninstall(&self) -> Result<(), StorageError> {
        for table in [
            &self.embedding_table,
            &self.file_table,
            &self.source_table,
        ] {
            sqlx::query(&format!("DROP TABLE IF EXISTS {table} CASCADE"))
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn source_id(&self, source: &str) -> Result<i64, StorageError> {
        let row = sqlx::query(&format!(
            "SELECT source_id FROM {} WHERE uuid = $1",
            self.source_table
        ))
        .bind(source)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.get::<i64, _>("source_id"))
            .ok_or(StorageError::SourceMissing)
    }

    fn file_id(file: &FileUuid) -> Result<i64, StorageError> {
        file.0.parse().map_err(|_| StorageError::FileMissing)
    }

    fn record_from_row(source: &str, row: &sqlx::postgres::PgRow) -> FileRecord {
        FileRecord {
            source_uuid: source.to_string(),
            uuid: FileUuid(row.get::<i64, _>("file_id").to_string()),
            path: row.get("path"),
            etag: row.get("etag"),
            parsed: row.get("parsed"),
            parse_error: row.get("parse_error"),
            parse_parts_errors: row.get("parse_parts_errors"),
            created_at: row.get("created_at"),
            processor_version: ProcessorVersion {
                major: row.get("version_major"),
                minor: row.get("version_minor"),
                patch: row.get("version_patch"),
                embeddings_model: row.get("version_model"),
            },
            processing_finished: row.get("processing_finished"),
        }
    }

    const FILE_COLUMNS: &'static str = "file_id, path, etag, parsed, parse_error, \
         parse_parts_errors, created_at, version_major, version_minor, version_patch, \
         version_model, processing_finished";
}

#[async_trait]
impl Storage for PgStorage {
    async fn get_or_create_source(&self, source: &str) -> Result<DataSource, StorageError> {
        sqlx::query(&format!(
            "INSERT INTO {} (uuid) VALUES ($1) ON CONFLICT (uuid) DO NOTHING",
            self.source_table
        ))
        .bind(source)
        .execute(&self.pool)
        .await?;

        Ok(DataSource {
            uuid: source.to_string(),
        })
    }

    async fn delete_source(&self, source: &str) -> Result<(), StorageError> {
        let deleted = sqlx::query(&format!(
            "DELETE FROM {} WHERE uuid = $1 RETURNING source_id",
            self.source_table
        ))
        .bind(source)
        .fetch_optional(&self.pool)
        .await?;

        match deleted {
            Some(_) => Ok(()),
            None => Err(StorageError::SourceMissing),
        }
    }

    async fn get_or_create_file(
        &self,
        source: &str,
        path: &str,
        etag: &str,
        version: &ProcessorVersion,
    ) -> Result<(FileRecord, bool), StorageError> {
        let source_id = self.source_id(source).await?;

        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO {file} (source_id, path, etag, version_major, version_minor,
                                version_patch, version_model)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (source_id, path) DO NOTHING
            RETURNING {columns}
            "#,
            file = self.file_table,
            columns = Self::FILE_COLUMNS
        ))
        .bind(source_id)
        .bind(path)
        .bind(etag)
        .bind(version.major)
        .bind(version.minor)
        .bind(version.patch)
        .bind(&version.embeddings_model)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok((Self::record_from_row(source, &row), true));
        }

        let existing = sqlx::query(&format!(
            "SELECT {columns} FROM {file} WHERE source_id = $1 AND path = $2",
            columns = Self::FILE_COLUMNS,
            file = self.file_table
        ))
        .bind(source_id)
        .bind(path)
        .fetch_one(&self.pool)
        .await?;

        Ok((Self::record_from_row(source, &existing), false))
    }

    async fn delete_file(&self, source: &str, file: &FileUuid) -> Result<(), StorageError> {
        let file_id = Self::file_id(file)?;
        let deleted = sqlx::query(&format!(
            r#"
            DELETE FROM {file} f
            USING {source} s
            WHERE s.uuid = $1 AND f.source_id = s.source_id AND f.file_id = $2
            RETURNING f.file_id
            "#,
            file = self.file_table,
            source = self.source_table
        ))
        .bind(source)
        .bind(file_id)
        .fetch_optional(&self.pool)
        .await?;

        match deleted {
            Some(_) => Ok(()),
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
        let file_id = Self::file_id(file)?;
        let updated = sqlx::query(&format!(
            r#"
            UPDATE {file} f
            SET processing_finished = NOW(),
                parsed = $3,
                parse_error = NULLIF($4, ''),
                parse_parts_errors = $5
            FROM {source} s
            WHERE s.uuid = $1 AND f.source_id = s.source_id AND f.file_id = $2
            RETURNING f.file_id
            "#,
            file = self.file_table,
            source = self.source_table
        ))
        .bind(source)
        .bind(file_id)
        .bind(parsed)
        .bind(parse_error)
        .bind(parse_parts_errors.join("\n"))
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(_) => Ok(()),
            None => Err(StorageError::FileMissing),
        }
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
        let file_id = Self::file_id(file)?;

        let result = sqlx::query(&format!(
            r#"
            INSERT INTO {embedding} (source_id, file_id, chunk, embedding)
            SELECT f.source_id, f.file_id, $3, $4
            FROM {file} f
            JOIN {source} s ON s.source_id = f.source_id
            WHERE s.uuid = $1 AND f.file_id = $2
            "#,
            embedding = self.embedding_table,
            file = self.file_table,
            source = self.source_table
        ))
        .bind(source)
        .bind(file_id)
        .bind(chunk)
        .bind(pgvector::Vector::from(vector.to_vec()))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::FileMissing);
        }
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

        let source_filter = if sources.is_empty() {
            String::new()
        } else {
            "WHERE s.uuid = ANY($3)".to_string()
        };
        let query = format!(
            r#"
            SELECT s.uuid AS source_uuid, e.chunk, e.embedding, {columns}
            FROM {embedding} e
            JOIN {source} s ON s.source_id = e.source_id
            JOIN {file} f ON f.file_id = e.file_id
            {source_filter}
            ORDER BY e.embedding <=> $1
            LIMIT $2
            "#,
            columns = Self::FILE_COLUMNS
                .split(", ")
                .map(|c| format!("f.{c}"))
                .collect::<Vec<_>>()
                .join(", "),
            embedding = self.embedding_table,
            source = self.source_table,
            file = self.file_table,
        );

        let mut db_query = sqlx::query(&query)
            .bind(pgvector::Vector::from(vector.to_vec()))
            .bind(i64::from(limit));
        if !sources.is_empty() {
            db_query = db_query.bind(sources.to_vec());
        }

        let rows = db_query.fetch_all(&self.pool).await?;
        let mut embeddings = Vec::with_capacity(rows.len());
        for row in rows {
            let source: String = row.get("source_uuid");
            embeddings.push(Embedding {
                file: Self::record_from_row(&source, &row),
                chunk: row.get("chunk"),
                vector: row.get::<pgvector::Vector, _>("embedding").to_vec(),
            });
        }
        Ok(embeddings)
    }

    async fn source_statistics(
        &self,
        source: &str,
    ) -> Result<DataSourceStatistics, StorageError> {
        let source_id = self.source_id(source).await?;
        let row = sqlx::query(&format!(
            r#"
            SELECT COUNT(*) AS files,
                   COUNT(processing_finished) AS files_processed,
                   COUNT(parse_error) AS files_parse_errors
            FROM {file}
            WHERE source_id = $1
            "#,
            file = self.file_table
        ))
        .bind(source_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(DataSourceStatistics {
            files: row.get::<i64, _>("files") as u64,
            files_processed: row.get::<i64, _>("files_processed") as u64,
            files_parse_errors: row.get::<i64, _>("files_parse_errors") as u64,
        })
    }
}
