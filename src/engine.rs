//! The indexing engine.
//!
//! Coordinates the full pipeline per file: catalog lookup → parse stream →
//! chunker → embedder → storage, with lifecycle notifications back to the
//! source. Processing is idempotent and version aware:
//!
//! 1. `get_or_create_file` keyed on `(source, path)` returns the stored
//!    row and whether it is new.
//! 2. `must_embed` is true when the row is new, its ETag changed, its
//!    processor version drifted in major/minor/model, or a previous
//!    attempt stalled (unfinished and older than 30 minutes).
//! 3. A re-embed deletes the stale row first; losing the subsequent
//!    re-create race means another worker owns the file, and this worker
//!    yields silently.
//! 4. On any early exit the rows this worker opened are deleted, so the
//!    catalog never retains half-processed files.
//!
//! Parser `Update` events for the top-level path additionally drive
//! `notify_running`; a notifier error aborts the file.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::chunker::{Chunk, Chunker};
use crate::embedder::Embedder;
use crate::parser::{ParseStream, Parser, Stage, StreamResult};
use crate::source::{
    DoneReason, FileHandler, ProcessingDone, ProcessingRunning, ProcessingStarted, Source,
    SourceIterator,
};
use crate::storage::{FileRecord, ProcessorVersion, Storage, StorageError};

/// Unfinished rows older than this are treated as crashed workers and
/// reclaimed by the next run.
const STALLED_AFTER_MINUTES: i64 = 30;

pub struct Engine {
    version: ProcessorVersion,
    sources: Vec<Arc<dyn Source>>,
    parser: Arc<dyn Parser>,
    chunker: Arc<dyn Chunker>,
    embedder: Arc<dyn Embedder>,
    storage: Arc<dyn Storage>,
}

impl Engine {
    pub fn new(
        version: ProcessorVersion,
        sources: Vec<Arc<dyn Source>>,
        parser: Arc<dyn Parser>,
        chunker: Arc<dyn Chunker>,
        embedder: Arc<dyn Embedder>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        Self {
            version,
            sources,
            parser,
            chunker,
            embedder,
            storage,
        }
    }

    /// Processes every configured source, sequentially.
    pub async fn process(&self, ctx: &CancellationToken) -> Result<()> {
        for source in &self.sources {
            let mut iterator = source
                .open()
                .await
                .context("failed to open source")?;

            let result = self.process_source(ctx, source, iterator.as_mut()).await;
            let close_result = iterator.close().await;

            result.context("failed to process source")?;
            close_result.context("error during closing source iterator")?;
        }

        Ok(())
    }

    async fn process_source(
        &self,
        ctx: &CancellationToken,
        source: &Arc<dyn Source>,
        iterator: &mut dyn SourceIterator,
    ) -> Result<()> {
        loop {
            if ctx.is_cancelled() {
                bail!("processing canceled");
            }

            let Some(handler) = iterator
                .next(ctx)
                .await
                .context("error while iterating over source files")?
            else {
                return Ok(());
            };

            self.process_file(ctx, source, handler)
                .await
                .context("failed to process file")?;
        }
    }

    async fn process_file(
        &self,
        ctx: &CancellationToken,
        source: &Arc<dyn Source>,
        mut handler: Box<dyn FileHandler>,
    ) -> Result<()> {
        let file_ctx = ctx.child_token();
        let _cancel_on_exit = file_ctx.clone().drop_guard();

        let source_uuid = source.uuid().to_string();
        self.storage
            .get_or_create_source(&source_uuid)
            .await
            .context("error during source creation in the storage")?;

        let (mut record, newly_created) = self
            .storage
            .get_or_create_file(&source_uuid, handler.path(), handler.etag(), &self.version)
            .await
            .context("error during file creation in the storage")?;

        let mut must_embed = newly_created;
        if !must_embed {
            let stalled = record.processing_finished.is_none()
                && record.created_at
                    < Utc::now() - chrono::Duration::minutes(STALLED_AFTER_MINUTES);
            must_embed = stalled
                || record.etag != handler.etag()
                || self.version.invalidates(&record.processor_version);

            if must_embed {
                match self.storage.delete_file(&source_uuid, &record.uuid).await {
                    Ok(()) => {}
                    // Another worker reclaimed the file first.
                    Err(StorageError::FileMissing) => return Ok(()),
                    Err(err) => {
                        return Err(err)
                            .context("failed to delete old file before reembedding")
                    }
                }

                let (fresh, created) = self
                    .storage
                    .get_or_create_file(
                        &source_uuid,
                        handler.path(),
                        handler.etag(),
                        &self.version,
                    )
                    .await
                    .context("error during reembedded file creation")?;
                if !created {
                    // Another worker owns the file now.
                    return Ok(());
                }
                record = fresh;
            }
        }

        if !must_embed {
            debug!(source = %source_uuid, path = %record.path, "file unchanged, skipping");
            return Ok(());
        }

        let top_path = handler.path().to_string();
        let user_metadata = handler.user_metadata();
        let processing_uuid = format!(
            "{source_uuid}-{top_path}-{}-{}",
            Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            uuid::Uuid::new_v4(),
        );

        source
            .notify_started(
                &file_ctx,
                ProcessingStarted {
                    uuid: processing_uuid.clone(),
                    path: top_path.clone(),
                    user_metadata: user_metadata.clone(),
                },
            )
            .await
            .context("failed to notify source about start of the file processing")?;

        let mut opened: HashMap<String, FileRecord> = HashMap::new();
        opened.insert(top_path.clone(), record);

        let result = self
            .run_pipeline(
                &file_ctx,
                source,
                handler.as_mut(),
                &top_path,
                &processing_uuid,
                &user_metadata,
                &mut opened,
            )
            .await;

        // Unfinished rows must not survive this worker: delete whatever is
        // still open, success or not.
        for (path, leftover) in opened.drain() {
            if let Err(err) = self.storage.delete_file(&source_uuid, &leftover.uuid).await {
                warn!(
                    source = %source_uuid,
                    path = %path,
                    error = %err,
                    "failed to delete unfinished catalog row"
                );
            }
        }

        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_pipeline(
        &self,
        ctx: &CancellationToken,
        source: &Arc<dyn Source>,
        handler: &mut dyn FileHandler,
        top_path: &str,
        processing_uuid: &str,
        user_metadata: &Option<serde_json::Value>,
        opened: &mut HashMap<String, FileRecord>,
    ) -> Result<()> {
        let source_uuid = source.uuid().to_string();
        let reader = handler
            .open()
            .await
            .context("failed to open file for reading")?;

        let parse_stream = self
            .parser
            .parse_stream(ctx.clone(), reader, top_path);

        let notifier_error: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let notifying_stream: Box<dyn ParseStream> = Box::new(RunningNotifier {
            inner: parse_stream,
            ctx: ctx.clone(),
            source: source.clone(),
            top_path: top_path.to_string(),
            processing_uuid: processing_uuid.to_string(),
            user_metadata: user_metadata.clone(),
            error: notifier_error.clone(),
        });

        let mut chunks = self.chunker.generate_chunks(ctx.clone(), notifying_stream);

        while let Some(chunk) = chunks.next().await {
            match chunk {
                Chunk::Start { path } => {
                    if path != top_path {
                        // Inner container file. No catalog row is opened
                        // for it, so its Data/End events fall through
                        // without storage writes.
                        debug!(source = %source_uuid, path = %path, "inner file started");
                    }
                }
                Chunk::Data { path, data } => {
                    let Some(record) = opened.get(&path) else {
                        continue;
                    };

                    let vector = match self.embedder.generate_embeddings(ctx, &data).await {
                        Ok(vector) => vector,
                        Err(err) => {
                            let err = anyhow::Error::from(err)
                                .context("error while generating embeddings");
                            return self
                                .abort_file(
                                    ctx,
                                    source,
                                    path == top_path,
                                    top_path,
                                    processing_uuid,
                                    user_metadata,
                                    err,
                                )
                                .await;
                        }
                    };

                    if let Err(err) = self
                        .storage
                        .put_embedding(&source_uuid, &record.uuid, &data, &vector)
                        .await
                    {
                        let err = anyhow::Error::from(err)
                            .context("failed to put embeddings in the storage");
                        return self
                            .abort_file(
                                ctx,
                                source,
                                path == top_path,
                                top_path,
                                processing_uuid,
                                user_metadata,
                                err,
                            )
                            .await;
                    }
                }
                Chunk::End { path, error } => {
                    let Some(record) = opened.get(&path) else {
                        continue;
                    };

                    let error_text = error.as_ref().map(ToString::to_string).unwrap_or_default();
                    if let Err(err) = self
                        .storage
                        .finish_file_processing(
                            &source_uuid,
                            &record.uuid,
                            error.is_none(),
                            &error_text,
                            &[],
                        )
                        .await
                    {
                        let err = anyhow::Error::from(err)
                            .context("failed to finalize file processing in storage");
                        return self
                            .abort_file(
                                ctx,
                                source,
                                path == top_path,
                                top_path,
                                processing_uuid,
                                user_metadata,
                                err,
                            )
                            .await;
                    }
                    opened.remove(&path);

                    if path == top_path {
                        let reason = if error.is_some() {
                            DoneReason::Error
                        } else {
                            DoneReason::Ok
                        };
                        source
                            .notify_done(
                                ctx,
                                ProcessingDone {
                                    uuid: processing_uuid.to_string(),
                                    path: top_path.to_string(),
                                    user_metadata: user_metadata.clone(),
                                    reason,
                                    error: error.map(|e| e.to_string()),
                                },
                            )
                            .await
                            .context(
                                "failed to notify source about end of the file processing",
                            )?;
                    }
                }
            }
        }

        let pump_error = notifier_error.lock().unwrap().take();
        if let Some(message) = pump_error {
            let err = anyhow::anyhow!("{message}")
                .context("failed to notify source about processing progress");
            return self
                .abort_file(ctx, source, true, top_path, processing_uuid, user_metadata, err)
                .await;
        }

        Ok(())
    }

    /// Sends the `Aborted` notification (when the failure concerns the
    /// top-level file) and surfaces the original error.
    #[allow(clippy::too_many_arguments)]
    async fn abort_file(
        &self,
        ctx: &CancellationToken,
        source: &Arc<dyn Source>,
        top_level: bool,
        top_path: &str,
        processing_uuid: &str,
        user_metadata: &Option<serde_json::Value>,
        error: anyhow::Error,
    ) -> Result<()> {
        if top_level {
            if let Err(notify_err) = source
                .notify_done(
                    ctx,
                    ProcessingDone {
                        uuid: processing_uuid.to_string(),
                        path: top_path.to_string(),
                        user_metadata: user_metadata.clone(),
                        reason: DoneReason::Aborted,
                        error: Some(error.to_string()),
                    },
                )
                .await
            {
                return Err(error.context(format!(
                    "failed to notify source about end of the file processing: {notify_err}"
                )));
            }
        }
        Err(error)
    }
}

/// Parse stream adapter that mirrors top-level `Update` events into
/// `notify_running` calls. A notifier error ends the stream early and is
/// reported through the shared slot.
struct RunningNotifier {
    inner: Box<dyn ParseStream>,
    ctx: CancellationToken,
    source: Arc<dyn Source>,
    top_path: String,
    processing_uuid: String,
    user_metadata: Option<serde_json::Value>,
    error: Arc<Mutex<Option<String>>>,
}

#[async_trait]
impl ParseStream for RunningNotifier {
    async fn next(&mut self) -> Option<StreamResult> {
        let event = self.inner.next().await?;

        let (path, stage, progress) = {
            let deepest = event.deepest();
            (deepest.path.clone(), deepest.stage, deepest.progress)
        };
        if path == self.top_path && stage == Stage::Update {
            let notify = self
                .source
                .notify_running(
                    &self.ctx,
                    ProcessingRunning {
                        uuid: self.processing_uuid.clone(),
                        path: self.top_path.clone(),
                        user_metadata: self.user_metadata.clone(),
                        progress,
                    },
                )
                .await;
            if let Err(err) = notify {
                *self.error.lock().unwrap() = Some(err.to_string());
                self.inner.close().await;
                return None;
            }
        }

        Some(event)
    }

    async fn close(&mut self) {
        self.inner.close().await;
    }
}
