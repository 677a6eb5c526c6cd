//! Bounded OCR worker pool.
//!
//! OCR engines are CPU-bound and often single-threaded internally, so the
//! pool multiplexes callers over a fixed set of workers. A counting
//! semaphore gates admission (one permit per running job) and the workers
//! themselves sit on a mutex-guarded stack, checked out LIFO so recently
//! used workers stay warm. `init` and `destroy` take every permit before
//! touching the worker list, which makes them safe to run next to in-flight
//! jobs.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{filter_text, OcrError, OcrProgress, OcrProvider};

/// Builds one pool worker. Called `size` times during [`OcrPool::init`].
pub type WorkerFactory<P> = Box<dyn Fn() -> Result<P, OcrError> + Send + Sync>;

/// A fixed-size pool of OCR workers implementing [`OcrProvider`] itself.
pub struct OcrPool<P: OcrProvider + 'static> {
    size: u32,
    factory: WorkerFactory<P>,
    permits: Arc<Semaphore>,
    workers: Arc<Mutex<Vec<Arc<P>>>>,
}

impl<P: OcrProvider + 'static> OcrPool<P> {
    pub fn new(size: u32, factory: WorkerFactory<P>) -> Self {
        Self {
            size,
            factory,
            permits: Arc::new(Semaphore::new(size as usize)),
            workers: Arc::new(Mutex::new(Vec::with_capacity(size as usize))),
        }
    }

    /// Creates the workers. Holds every permit while the list is mutated so
    /// no job can observe a half-built pool.
    pub async fn init(&self, ctx: &CancellationToken) -> Result<(), OcrError> {
        let _all = self.acquire_all(ctx).await?;

        let mut built = Vec::with_capacity(self.size as usize);
        for _ in 0..self.size {
            built.push(Arc::new((self.factory)()?));
        }

        let mut workers = self.workers.lock().expect("worker list lock poisoned");
        *workers = built;
        debug!(size = self.size, "OCR pool initialized");
        Ok(())
    }

    /// Drops all workers. Waits for in-flight jobs by taking every permit.
    pub async fn destroy(&self, ctx: &CancellationToken) -> Result<(), OcrError> {
        let _all = self.acquire_all(ctx).await?;
        self.workers
            .lock()
            .expect("worker list lock poisoned")
            .clear();
        Ok(())
    }

    async fn acquire_all(
        &self,
        ctx: &CancellationToken,
    ) -> Result<tokio::sync::OwnedSemaphorePermit, OcrError> {
        tokio::select! {
            permit = self.permits.clone().acquire_many_owned(self.size) => {
                permit.map_err(|_| OcrError::PoolNotInitialized)
            }
            _ = ctx.cancelled() => Err(OcrError::Canceled),
        }
    }

    fn checkout(workers: &Mutex<Vec<Arc<P>>>) -> Option<Arc<P>> {
        workers.lock().expect("worker list lock poisoned").pop()
    }

    fn checkin(workers: &Mutex<Vec<Arc<P>>>, worker: Arc<P>) {
        workers.lock().expect("worker list lock poisoned").push(worker);
    }
}

#[async_trait]
impl<P: OcrProvider + 'static> OcrProvider for OcrPool<P> {
    async fn ocr(&self, ctx: &CancellationToken, image: &[u8]) -> Result<String, OcrError> {
        let _permit = tokio::select! {
            permit = self.permits.clone().acquire_owned() => {
                permit.map_err(|_| OcrError::PoolNotInitialized)?
            }
            _ = ctx.cancelled() => return Err(OcrError::Canceled),
        };

        let worker = Self::checkout(&self.workers).ok_or(OcrError::PoolNotInitialized)?;
        let result = worker.ocr(ctx, image).await;
        Self::checkin(&self.workers, worker);

        result.map(|text| filter_text(&text))
    }

    fn ocr_with_progress(&self, ctx: CancellationToken, image: Vec<u8>) -> OcrProgress {
        let (sender, handle) = OcrProgress::channel();
        let permits = self.permits.clone();
        let workers = self.workers.clone();
        let size = self.size;

        tokio::spawn(async move {
            let _permit = tokio::select! {
                permit = permits.acquire_owned() => {
                    match permit {
                        Ok(p) => p,
                        Err(_) => {
                            sender.finish(Err(OcrError::PoolNotInitialized));
                            return;
                        }
                    }
                }
                _ = ctx.cancelled() => {
                    sender.finish(Err(OcrError::Canceled));
                    return;
                }
            };

            let Some(worker) = Self::checkout(&workers) else {
                sender.finish(Err(OcrError::PoolNotInitialized));
                return;
            };

            let mut inner = worker.ocr_with_progress(ctx, image);
            while let Some(percent) = inner.next_update().await {
                sender.update(percent);
            }

            // Join the final text before the worker goes back on the stack:
            // a canceled job must not leak a checked-out worker.
            let result = inner.text().await;
            Self::checkin(&workers, worker);
            debug!(pool_size = size, "OCR pool job finished");

            sender.finish(result.map(|text| filter_text(&text)));
        });

        handle
    }

    fn supports(&self, mime_type: &str) -> bool {
        self.workers
            .lock()
            .expect("worker list lock poisoned")
            .first()
            .map(|w| w.supports(mime_type))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocr::testutil::MockOcr;
    use std::time::Duration;

    fn test_pool(size: u32) -> OcrPool<MockOcr> {
        OcrPool::new(
            size,
            Box::new(|| Ok(MockOcr::new("recognized text").with_delay(Duration::from_millis(5)))),
        )
    }

    #[tokio::test]
    async fn uninitialized_pool_errors_immediately() {
        let pool = test_pool(2);
        let ctx = CancellationToken::new();
        let err = pool.ocr(&ctx, b"img").await.unwrap_err();
        assert!(matches!(err, OcrError::PoolNotInitialized));
    }

    #[tokio::test]
    async fn pool_runs_jobs_and_returns_workers() {
        let pool = test_pool(2);
        let ctx = CancellationToken::new();
        pool.init(&ctx).await.unwrap();

        for _ in 0..5 {
            let text = pool.ocr(&ctx, b"img").await.unwrap();
            assert_eq!(text, "recognized text");
        }

        // All permits must be free again after sequential runs.
        pool.destroy(&ctx).await.unwrap();
    }

    #[tokio::test]
    async fn progress_job_reports_and_completes() {
        let pool = test_pool(1);
        let ctx = CancellationToken::new();
        pool.init(&ctx).await.unwrap();

        let mut job = pool.ocr_with_progress(ctx.child_token(), b"img".to_vec());
        let mut saw_update = false;
        while let Some(p) = job.next_update().await {
            assert!(p <= 100);
            saw_update = true;
        }
        assert!(saw_update);
        assert_eq!(job.text().await.unwrap(), "recognized text");
    }

    #[tokio::test]
    async fn concurrent_jobs_are_bounded_by_pool_size() {
        let pool = Arc::new(test_pool(2));
        let ctx = CancellationToken::new();
        pool.init(&ctx).await.unwrap();

        let mut jobs = Vec::new();
        for _ in 0..8 {
            jobs.push(pool.ocr_with_progress(ctx.child_token(), b"img".to_vec()));
        }
        for job in jobs {
            assert_eq!(job.text().await.unwrap(), "recognized text");
        }
    }

    #[tokio::test]
    async fn canceled_acquire_errors() {
        let pool = test_pool(1);
        let ctx = CancellationToken::new();
        pool.init(&ctx).await.unwrap();

        let canceled = CancellationToken::new();
        canceled.cancel();
        let job = pool.ocr_with_progress(canceled, b"img".to_vec());
        // Either the acquire or the worker job observes the cancellation.
        assert!(job.text().await.is_err());
    }

    #[tokio::test]
    async fn supports_delegates_to_workers() {
        let pool = test_pool(1);
        let ctx = CancellationToken::new();
        assert!(!pool.supports("image/png"));
        pool.init(&ctx).await.unwrap();
        assert!(pool.supports("image/png"));
        assert!(!pool.supports("image/bmp"));
    }
}
