//! Filesystem source.
//!
//! Walks a directory tree, filters entries through include/exclude glob
//! sets and yields files in deterministic (sorted) order. The ETag is a
//! digest of the file's modification time and size, which satisfies the
//! contract that byte-identical versions produce identical tags without
//! reading file contents twice.
//!
//! Lifecycle notifications are accepted and discarded; local directories
//! have nobody to notify.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use walkdir::WalkDir;

use crate::parser::Input;

use super::{
    FileHandler, ProcessingDone, ProcessingRunning, ProcessingStarted, Source, SourceError,
    SourceIterator,
};

pub struct FsSource {
    root: PathBuf,
    uuid: String,
    include: GlobSet,
    exclude: GlobSet,
    follow_symlinks: bool,
}

pub struct FsSourceBuilder {
    root: PathBuf,
    uuid: String,
    include_globs: Vec<String>,
    exclude_globs: Vec<String>,
    follow_symlinks: bool,
}

impl FsSourceBuilder {
    pub fn include_globs(mut self, globs: &[String]) -> Self {
        self.include_globs = globs.to_vec();
        self
    }

    pub fn exclude_globs(mut self, globs: &[String]) -> Self {
        self.exclude_globs.extend_from_slice(globs);
        self
    }

    pub fn follow_symlinks(mut self, follow: bool) -> Self {
        self.follow_symlinks = follow;
        self
    }

    pub fn build(self) -> Result<FsSource, SourceError> {
        Ok(FsSource {
            root: self.root,
            uuid: self.uuid,
            include: build_globset(&self.include_globs)?,
            exclude: build_globset(&self.exclude_globs)?,
            follow_symlinks: self.follow_symlinks,
        })
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet, SourceError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(
            Glob::new(pattern)
                .map_err(|e| SourceError::Other(format!("invalid glob '{pattern}': {e}")))?,
        );
    }
    builder
        .build()
        .map_err(|e| SourceError::Other(format!("failed to build glob set: {e}")))
}

impl FsSource {
    /// Starts building a source rooted at `root`. Defaults: include
    /// everything, exclude common VCS/build directories, do not follow
    /// symlinks.
    pub fn builder(root: impl Into<PathBuf>, uuid: impl Into<String>) -> FsSourceBuilder {
        FsSourceBuilder {
            root: root.into(),
            uuid: uuid.into(),
            include_globs: vec!["**/*".to_string()],
            exclude_globs: vec![
                "**/.git/**".to_string(),
                "**/target/**".to_string(),
                "**/node_modules/**".to_string(),
            ],
            follow_symlinks: false,
        }
    }

    fn scan(&self) -> Result<Vec<FsEntry>, SourceError> {
        if !self.root.exists() {
            return Err(SourceError::Other(format!(
                "source root does not exist: {}",
                self.root.display()
            )));
        }

        let mut entries = Vec::new();
        for entry in WalkDir::new(&self.root).follow_links(self.follow_symlinks) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(root = %self.root.display(), error = %err, "skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let absolute = entry.path().to_path_buf();
            let relative = absolute
                .strip_prefix(&self.root)
                .unwrap_or(&absolute)
                .to_string_lossy()
                .replace(std::path::MAIN_SEPARATOR, "/");

            if self.exclude.is_match(&relative) || !self.include.is_match(&relative) {
                continue;
            }

            let etag = file_etag(&absolute)?;
            entries.push(FsEntry {
                absolute,
                relative,
                etag,
            });
        }

        entries.sort_by(|a, b| a.relative.cmp(&b.relative));
        Ok(entries)
    }
}

/// Digest of modification time and size: an opaque token that changes
/// whenever the file content can have changed.
fn file_etag(path: &Path) -> Result<String, SourceError> {
    let metadata = std::fs::metadata(path)?;
    let modified = metadata
        .modified()?
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(modified.as_nanos().to_le_bytes());
    hasher.update(metadata.len().to_le_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

struct FsEntry {
    absolute: PathBuf,
    relative: String,
    etag: String,
}

#[async_trait]
impl Source for FsSource {
    fn uuid(&self) -> &str {
        &self.uuid
    }

    async fn open(&self) -> Result<Box<dyn SourceIterator>, SourceError> {
        let mut entries = self.scan()?;
        entries.reverse(); // pop() yields sorted order
        Ok(Box::new(FsIterator { entries }))
    }

    async fn notify_started(
        &self,
        _ctx: &CancellationToken,
        _event: ProcessingStarted,
    ) -> Result<(), SourceError> {
        Ok(())
    }

    async fn notify_running(
        &self,
        _ctx: &CancellationToken,
        _event: ProcessingRunning,
    ) -> Result<(), SourceError> {
        Ok(())
    }

    async fn notify_done(
        &self,
        _ctx: &CancellationToken,
        _event: ProcessingDone,
    ) -> Result<(), SourceError> {
        Ok(())
    }
}

struct FsIterator {
    entries: Vec<FsEntry>,
}

#[async_trait]
impl SourceIterator for FsIterator {
    async fn next(
        &mut self,
        ctx: &CancellationToken,
    ) -> Result<Option<Box<dyn FileHandler>>, SourceError> {
        if ctx.is_cancelled() {
            return Err(SourceError::Canceled);
        }

        Ok(self.entries.pop().map(|entry| {
            Box::new(FsFileHandler { entry }) as Box<dyn FileHandler>
        }))
    }

    async fn close(&mut self) -> Result<(), SourceError> {
        self.entries.clear();
        Ok(())
    }
}

struct FsFileHandler {
    entry: FsEntry,
}

#[async_trait]
impl FileHandler for FsFileHandler {
    fn path(&self) -> &str {
        &self.entry.relative
    }

    fn etag(&self) -> &str {
        &self.entry.etag
    }

    async fn open(&mut self) -> Result<Input, SourceError> {
        let file = tokio::fs::File::open(&self.entry.absolute).await?;
        Ok(Box::new(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect_paths(source: &FsSource) -> Vec<String> {
        let ctx = CancellationToken::new();
        let mut iterator = source.open().await.unwrap();
        let mut paths = Vec::new();
        while let Some(handler) = iterator.next(&ctx).await.unwrap() {
            paths.push(handler.path().to_string());
        }
        iterator.close().await.unwrap();
        paths
    }

    #[tokio::test]
    async fn walks_files_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub/.git")).unwrap();
        std::fs::write(dir.path().join("b.png"), b"b").unwrap();
        std::fs::write(dir.path().join("a.png"), b"a").unwrap();
        std::fs::write(dir.path().join("sub/c.png"), b"c").unwrap();
        std::fs::write(dir.path().join("sub/.git/ignored"), b"x").unwrap();

        let source = FsSource::builder(dir.path(), "test-source").build().unwrap();
        assert_eq!(source.uuid(), "test-source");
        assert_eq!(
            collect_paths(&source).await,
            vec!["a.png", "b.png", "sub/c.png"]
        );
    }

    #[tokio::test]
    async fn include_globs_narrow_the_walk() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("keep.png"), b"k").unwrap();
        std::fs::write(dir.path().join("drop.txt"), b"d").unwrap();

        let source = FsSource::builder(dir.path(), "s")
            .include_globs(&["**/*.png".to_string()])
            .build()
            .unwrap();
        assert_eq!(collect_paths(&source).await, vec!["keep.png"]);
    }

    #[tokio::test]
    async fn etag_is_stable_until_content_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.png");
        std::fs::write(&path, b"one").unwrap();

        let first = file_etag(&path).unwrap();
        let second = file_etag(&path).unwrap();
        assert_eq!(first, second);

        // Size change alone must change the tag.
        std::fs::write(&path, b"different length").unwrap();
        assert_ne!(file_etag(&path).unwrap(), first);
    }

    #[tokio::test]
    async fn handler_streams_file_content() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.bin"), b"payload").unwrap();

        let source = FsSource::builder(dir.path(), "s").build().unwrap();
        let ctx = CancellationToken::new();
        let mut iterator = source.open().await.unwrap();
        let mut handler = iterator.next(&ctx).await.unwrap().unwrap();

        let mut reader = handler.open().await.unwrap();
        let mut content = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut content)
            .await
            .unwrap();
        assert_eq!(content, b"payload");
    }

    #[tokio::test]
    async fn missing_root_is_an_error() {
        let source = FsSource::builder("/definitely/not/here", "s").build().unwrap();
        assert!(source.open().await.is_err());
    }
}
