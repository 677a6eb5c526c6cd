//! End-to-end engine tests over the in-memory storage backend.
//!
//! Exercises the full pipeline — filesystem source → composite parser
//! (mock OCR) → sliding chunker → mock embedder → storage — and the
//! engine's idempotency, version-invalidation, notification and cleanup
//! behavior.

use std::io::Cursor;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use file2llm::chunker::slide::SlideChunker;
use file2llm::embedder::testutil::MockEmbedder;
use file2llm::engine::Engine;
use file2llm::ocr::testutil::MockOcr;
use file2llm::ocr::OcrProvider;
use file2llm::parser::composite::CompositeParser;
use file2llm::source::fs::FsSource;
use file2llm::source::{
    ProcessingDone, ProcessingRunning, ProcessingStarted, Source, SourceError, SourceIterator,
};
use file2llm::storage::memory::MemoryStorage;
use file2llm::storage::{ProcessorVersion, Storage};

/// Source wrapper that records every lifecycle notification.
struct RecordingSource {
    inner: FsSource,
    events: Arc<Mutex<Vec<String>>>,
    fail_running: bool,
}

impl RecordingSource {
    fn new(inner: FsSource) -> Self {
        Self {
            inner,
            events: Arc::new(Mutex::new(Vec::new())),
            fail_running: false,
        }
    }

    fn failing_running(mut self) -> Self {
        self.fail_running = true;
        self
    }

    fn events(&self) -> Arc<Mutex<Vec<String>>> {
        self.events.clone()
    }
}

#[async_trait]
impl Source for RecordingSource {
    fn uuid(&self) -> &str {
        self.inner.uuid()
    }

    async fn open(&self) -> Result<Box<dyn SourceIterator>, SourceError> {
        self.inner.open().await
    }

    async fn notify_started(
        &self,
        _ctx: &CancellationToken,
        event: ProcessingStarted,
    ) -> Result<(), SourceError> {
        self.events
            .lock()
            .unwrap()
            .push(format!("started {}", event.path));
        Ok(())
    }

    async fn notify_running(
        &self,
        _ctx: &CancellationToken,
        event: ProcessingRunning,
    ) -> Result<(), SourceError> {
        self.events
            .lock()
            .unwrap()
            .push(format!("running {} {}", event.path, event.progress));
        if self.fail_running {
            return Err(SourceError::Other("progress listener went away".into()));
        }
        Ok(())
    }

    async fn notify_done(
        &self,
        _ctx: &CancellationToken,
        event: ProcessingDone,
    ) -> Result<(), SourceError> {
        self.events
            .lock()
            .unwrap()
            .push(format!("done {} {:?}", event.path, event.reason));
        Ok(())
    }
}

fn png_bytes() -> Vec<u8> {
    let img = image::RgbaImage::from_pixel(4, 4, image::Rgba([255, 255, 255, 255]));
    let mut out = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgba8(img)
        .write_to(&mut out, image::ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

fn version(major: i32, minor: i32, patch: i32) -> ProcessorVersion {
    ProcessorVersion {
        major,
        minor,
        patch,
        embeddings_model: "mock-embedder".to_string(),
    }
}

struct Fixture {
    source: Arc<RecordingSource>,
    embedder: Arc<MockEmbedder>,
    storage: Arc<MemoryStorage>,
    events: Arc<Mutex<Vec<String>>>,
}

impl Fixture {
    fn new(root: &std::path::Path) -> Self {
        let source = Arc::new(RecordingSource::new(
            FsSource::builder(root, "test-source").build().unwrap(),
        ));
        let events = source.events();
        Self {
            source,
            embedder: Arc::new(MockEmbedder::new(32)),
            storage: Arc::new(MemoryStorage::new()),
            events,
        }
    }

    fn engine(&self, version: ProcessorVersion) -> Engine {
        let ocr = Arc::new(MockOcr::new("hello world from ocr")) as Arc<dyn OcrProvider>;
        let parser = CompositeParser::with_default_parsers(Some(ocr));
        Engine::new(
            version,
            vec![self.source.clone() as Arc<dyn Source>],
            parser,
            Arc::new(SlideChunker::new(2, 0)),
            self.embedder.clone(),
            self.storage.clone(),
        )
    }
}

#[tokio::test]
async fn pipeline_indexes_images_and_serves_search() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.png"), png_bytes()).unwrap();
    std::fs::write(dir.path().join("b.png"), png_bytes()).unwrap();
    std::fs::write(dir.path().join("notes.txt"), "plain text, unsupported").unwrap();

    let fixture = Fixture::new(dir.path());
    let ctx = CancellationToken::new();
    fixture.engine(version(1, 0, 0)).process(&ctx).await.unwrap();

    // Every supported file produced embeddings whose chunks carry the OCR
    // text, and search finds them.
    let probe = fixture.embedder.vector_for("hello wo");
    let results = fixture
        .storage
        .search_similar_embeddings(&probe, &["test-source".to_string()], 10)
        .await
        .unwrap();
    assert!(!results.is_empty());
    assert!(results[0].chunk.to_lowercase().contains("hello"));

    // The unsupported file is recorded as a parse failure, not dropped.
    let stats = fixture.storage.source_statistics("test-source").await.unwrap();
    assert_eq!(stats.files, 3);
    assert_eq!(stats.files_processed, 3);
    assert_eq!(stats.files_parse_errors, 1);

    // Lifecycle notifications: started and done for each file, Ok for the
    // images, Error for the unsupported file.
    let events = fixture.events.lock().unwrap().clone();
    assert!(events.contains(&"started a.png".to_string()));
    assert!(events.contains(&"done a.png Ok".to_string()));
    assert!(events.contains(&"done b.png Ok".to_string()));
    assert!(events.contains(&"done notes.txt Error".to_string()));
}

#[tokio::test]
async fn second_run_embeds_nothing() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.png"), png_bytes()).unwrap();

    let fixture = Fixture::new(dir.path());
    let ctx = CancellationToken::new();

    fixture.engine(version(1, 0, 0)).process(&ctx).await.unwrap();
    let calls_after_first = fixture.embedder.calls();
    assert!(calls_after_first > 0);

    fixture.engine(version(1, 0, 0)).process(&ctx).await.unwrap();
    assert_eq!(fixture.embedder.calls(), calls_after_first);
}

#[tokio::test]
async fn major_minor_and_model_bumps_re_embed_patch_does_not() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.png"), png_bytes()).unwrap();

    let fixture = Fixture::new(dir.path());
    let ctx = CancellationToken::new();

    fixture.engine(version(1, 0, 0)).process(&ctx).await.unwrap();
    let after_first = fixture.embedder.calls();

    // Patch bump: nothing to do.
    fixture.engine(version(1, 0, 1)).process(&ctx).await.unwrap();
    assert_eq!(fixture.embedder.calls(), after_first);

    // Minor bump: everything is re-embedded.
    fixture.engine(version(1, 1, 1)).process(&ctx).await.unwrap();
    let after_minor = fixture.embedder.calls();
    assert!(after_minor > after_first);

    // Major bump: again.
    fixture.engine(version(2, 1, 1)).process(&ctx).await.unwrap();
    assert!(fixture.embedder.calls() > after_minor);
}

#[tokio::test]
async fn etag_change_re_embeds_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a.png");
    std::fs::write(&path, png_bytes()).unwrap();

    let fixture = Fixture::new(dir.path());
    let ctx = CancellationToken::new();

    fixture.engine(version(1, 0, 0)).process(&ctx).await.unwrap();
    let after_first = fixture.embedder.calls();

    // Same content: no work.
    fixture.engine(version(1, 0, 0)).process(&ctx).await.unwrap();
    assert_eq!(fixture.embedder.calls(), after_first);

    // Grow the file so its ETag changes.
    let mut grown = png_bytes();
    grown.extend_from_slice(&[0u8; 64]);
    std::fs::write(&path, grown).unwrap();

    fixture.engine(version(1, 0, 0)).process(&ctx).await.unwrap();
    assert!(fixture.embedder.calls() > after_first);
}

#[tokio::test]
async fn tar_archives_index_their_outer_file() {
    let dir = tempfile::tempdir().unwrap();
    let mut builder = tar::Builder::new(Vec::new());
    let png = png_bytes();
    let mut header = tar::Header::new_gnu();
    header.set_size(png.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, "inner.png", &png[..]).unwrap();
    std::fs::write(dir.path().join("bundle.tar"), builder.into_inner().unwrap()).unwrap();

    let fixture = Fixture::new(dir.path());
    let ctx = CancellationToken::new();
    fixture.engine(version(1, 0, 0)).process(&ctx).await.unwrap();

    // The archive itself has a finished catalog row; the inner file's
    // chunks fall through without storage writes for now.
    let stats = fixture.storage.source_statistics("test-source").await.unwrap();
    assert_eq!(stats.files, 1);
    assert_eq!(stats.files_processed, 1);
    assert_eq!(stats.files_parse_errors, 0);

    let events = fixture.events.lock().unwrap().clone();
    assert!(events.contains(&"done bundle.tar Ok".to_string()));
}

#[tokio::test]
async fn failing_embedder_aborts_and_cleans_the_catalog() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.png"), png_bytes()).unwrap();

    let source = Arc::new(RecordingSource::new(
        FsSource::builder(dir.path(), "test-source").build().unwrap(),
    ));
    let events = source.events();
    let storage = Arc::new(MemoryStorage::new());
    let ocr = Arc::new(MockOcr::new("hello")) as Arc<dyn OcrProvider>;
    let engine = Engine::new(
        version(1, 0, 0),
        vec![source as Arc<dyn Source>],
        CompositeParser::with_default_parsers(Some(ocr)),
        Arc::new(SlideChunker::new(2, 0)),
        Arc::new(MockEmbedder::new(32).failing("embedding backend down")),
        storage.clone(),
    );

    let ctx = CancellationToken::new();
    let err = engine.process(&ctx).await.unwrap_err();
    assert!(format!("{err:#}").contains("embedding"));

    // The cleanup guard removed the unfinished row.
    let stats = storage.source_statistics("test-source").await.unwrap();
    assert_eq!(stats.files, 0);

    let events = events.lock().unwrap().clone();
    assert!(events.contains(&"done a.png Aborted".to_string()));
}

#[tokio::test]
async fn notifier_error_aborts_the_file() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.png"), png_bytes()).unwrap();

    let source = Arc::new(RecordingSource::new(
        FsSource::builder(dir.path(), "test-source").build().unwrap(),
    )
    .failing_running());
    let events = source.events();
    let storage = Arc::new(MemoryStorage::new());
    let ocr = Arc::new(MockOcr::new("hello")) as Arc<dyn OcrProvider>;
    let engine = Engine::new(
        version(1, 0, 0),
        vec![source as Arc<dyn Source>],
        CompositeParser::with_default_parsers(Some(ocr)),
        Arc::new(SlideChunker::new(2, 0)),
        Arc::new(MockEmbedder::new(32)),
        storage.clone(),
    );

    let ctx = CancellationToken::new();
    let err = engine.process(&ctx).await.unwrap_err();
    assert!(format!("{err:#}").contains("progress"));

    let events = events.lock().unwrap().clone();
    assert!(events.iter().any(|e| e.starts_with("running a.png")));
    assert!(events.contains(&"done a.png Aborted".to_string()));

    let stats = storage.source_statistics("test-source").await.unwrap();
    assert_eq!(stats.files, 0);
}

#[tokio::test]
async fn cancellation_stops_processing() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.png"), png_bytes()).unwrap();

    let fixture = Fixture::new(dir.path());
    let ctx = CancellationToken::new();
    ctx.cancel();

    assert!(fixture.engine(version(1, 0, 0)).process(&ctx).await.is_err());
}
