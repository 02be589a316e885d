//! Progress feed: contract, canonical wrapper, and a tracked local
//! implementation.
//!
//! Cancellation is cooperative. The caller keeps a [`TrackedProgress`] handle
//! and flips its flag; the remote side polls `is_canceled` (one secondary
//! invocation per poll) and stops at its next check. There is no hard
//! preemption.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use crate::error::Result;

/// Remote-callable contract behind a proxied progress-feed argument.
#[async_trait]
pub trait ProgressListener: Send {
    /// Start the main task with a total amount of work.
    async fn begin_task(&mut self, name: &str, total: i32) -> Result<()>;

    /// Report completed work units.
    async fn worked(&mut self, amount: i32) -> Result<()>;

    /// Name the step currently running.
    async fn sub_task(&mut self, name: &str) -> Result<()>;

    /// Mark the task finished.
    async fn done(&mut self) -> Result<()>;

    /// Set or clear the cancellation flag.
    async fn set_canceled(&mut self, canceled: bool) -> Result<()>;

    /// Observe the cancellation flag.
    async fn is_canceled(&mut self) -> Result<bool>;
}

/// Canonical proxyable progress feed.
///
/// Proxied progress parameters must be exactly this type; wrap any
/// [`ProgressListener`] implementation with [`ProgressFeed::new`].
pub struct ProgressFeed {
    inner: Box<dyn ProgressListener>,
}

impl ProgressFeed {
    pub fn new(listener: impl ProgressListener + 'static) -> Self {
        Self {
            inner: Box::new(listener),
        }
    }

    pub async fn begin_task(&mut self, name: &str, total: i32) -> Result<()> {
        self.inner.begin_task(name, total).await
    }

    pub async fn worked(&mut self, amount: i32) -> Result<()> {
        self.inner.worked(amount).await
    }

    pub async fn sub_task(&mut self, name: &str) -> Result<()> {
        self.inner.sub_task(name).await
    }

    pub async fn done(&mut self) -> Result<()> {
        self.inner.done().await
    }

    pub async fn set_canceled(&mut self, canceled: bool) -> Result<()> {
        self.inner.set_canceled(canceled).await
    }

    pub async fn is_canceled(&mut self) -> Result<bool> {
        self.inner.is_canceled().await
    }
}

#[async_trait]
impl ProgressListener for ProgressFeed {
    async fn begin_task(&mut self, name: &str, total: i32) -> Result<()> {
        self.inner.begin_task(name, total).await
    }

    async fn worked(&mut self, amount: i32) -> Result<()> {
        self.inner.worked(amount).await
    }

    async fn sub_task(&mut self, name: &str) -> Result<()> {
        self.inner.sub_task(name).await
    }

    async fn done(&mut self) -> Result<()> {
        self.inner.done().await
    }

    async fn set_canceled(&mut self, canceled: bool) -> Result<()> {
        self.inner.set_canceled(canceled).await
    }

    async fn is_canceled(&mut self) -> Result<bool> {
        self.inner.is_canceled().await
    }
}

impl std::fmt::Debug for ProgressFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ProgressFeed")
    }
}

/// Caller-side progress state: atomic counters plus the cancellation flag.
///
/// Clone the handle freely. `feed()` yields the [`ProgressFeed`] to pass into
/// a call; the handle stays behind to observe totals and cancel.
#[derive(Debug, Clone, Default)]
pub struct TrackedProgress {
    state: Arc<ProgressState>,
}

#[derive(Debug, Default)]
struct ProgressState {
    task: Mutex<String>,
    sub_task: Mutex<String>,
    total: AtomicI32,
    worked: AtomicI32,
    done: AtomicBool,
    canceled: AtomicBool,
}

impl TrackedProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// A feed reporting into this handle's shared state.
    pub fn feed(&self) -> ProgressFeed {
        ProgressFeed::new(TrackedListener {
            state: Arc::clone(&self.state),
        })
    }

    /// Request cooperative cancellation.
    pub fn cancel(&self) {
        self.state.canceled.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.state.canceled.load(Ordering::SeqCst)
    }

    pub fn task(&self) -> String {
        lock_str(&self.state.task)
    }

    pub fn sub_task(&self) -> String {
        lock_str(&self.state.sub_task)
    }

    pub fn total(&self) -> i32 {
        self.state.total.load(Ordering::SeqCst)
    }

    pub fn worked(&self) -> i32 {
        self.state.worked.load(Ordering::SeqCst)
    }

    pub fn is_done(&self) -> bool {
        self.state.done.load(Ordering::SeqCst)
    }
}

fn lock_str(value: &Mutex<String>) -> String {
    value
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

struct TrackedListener {
    state: Arc<ProgressState>,
}

#[async_trait]
impl ProgressListener for TrackedListener {
    async fn begin_task(&mut self, name: &str, total: i32) -> Result<()> {
        *self
            .state
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = name.to_string();
        self.state.total.store(total, Ordering::SeqCst);
        Ok(())
    }

    async fn worked(&mut self, amount: i32) -> Result<()> {
        self.state.worked.fetch_add(amount, Ordering::SeqCst);
        Ok(())
    }

    async fn sub_task(&mut self, name: &str) -> Result<()> {
        *self
            .state
            .sub_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = name.to_string();
        Ok(())
    }

    async fn done(&mut self) -> Result<()> {
        self.state.done.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn set_canceled(&mut self, canceled: bool) -> Result<()> {
        self.state.canceled.store(canceled, Ordering::SeqCst);
        Ok(())
    }

    async fn is_canceled(&mut self) -> Result<bool> {
        Ok(self.state.canceled.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_feed_updates_visible_through_handle() {
        let progress = TrackedProgress::new();
        let mut feed = progress.feed();

        feed.begin_task("import", 100).await.unwrap();
        feed.sub_task("concepts").await.unwrap();
        feed.worked(30).await.unwrap();
        feed.worked(20).await.unwrap();
        feed.done().await.unwrap();

        assert_eq!(progress.task(), "import");
        assert_eq!(progress.sub_task(), "concepts");
        assert_eq!(progress.total(), 100);
        assert_eq!(progress.worked(), 50);
        assert!(progress.is_done());
    }

    #[tokio::test]
    async fn test_cancellation_observed_by_feed() {
        let progress = TrackedProgress::new();
        let mut feed = progress.feed();

        assert!(!feed.is_canceled().await.unwrap());
        progress.cancel();
        assert!(feed.is_canceled().await.unwrap());

        feed.set_canceled(false).await.unwrap();
        assert!(!progress.is_canceled());
    }
}
