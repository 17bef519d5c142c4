// Test helpers for knots.
//
// - init_tracing: env-filtered subscriber writing through the test harness
// - SourceCounter: a cold source that records subscribe/unsubscribe
// - next_states / eventually: bounded waits so a broken pipeline fails the
//   test instead of hanging it

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, BoxStream};
use futures::{future, Stream, StreamExt};
use tracing_subscriber::EnvFilter;

use crate::error::Result;

/// Installs a tracing subscriber for the current test binary. Later calls
/// are no-ops. Filter with `RUST_LOG`, e.g. `RUST_LOG=knot_engine=trace`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("knot_engine=debug")),
        )
        .with_test_writer()
        .try_init();
}

// ---------------------------------------------------------------------------
// SourceCounter
// ---------------------------------------------------------------------------

/// Counts subscriptions to a cold source.
///
/// `source()` returns a stream that never yields and never ends; dropping it
/// counts as an unsubscribe.
#[derive(Clone, Default)]
pub struct SourceCounter {
    subscriptions: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
}

struct Subscribed(Arc<AtomicUsize>);

impl Drop for Subscribed {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SourceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn source<T: Send + 'static>(&self) -> BoxStream<'static, T> {
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        self.active.fetch_add(1, Ordering::SeqCst);
        let guard = Subscribed(self.active.clone());
        stream::once(async move {
            let _subscribed = guard;
            future::pending::<()>().await;
        })
        .filter_map(|()| future::ready(None::<T>))
        .boxed()
    }

    /// How many times the source was subscribed in total.
    pub fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }

    /// Subscriptions currently alive.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Waiting
// ---------------------------------------------------------------------------

/// Collects the next `n` items from a state stream, or fewer if the stream
/// ends or `timeout` elapses first.
pub async fn next_states<S, St>(stream: &mut St, n: usize, timeout: Duration) -> Vec<Result<Arc<S>>>
where
    St: Stream<Item = Result<Arc<S>>> + Unpin,
{
    let mut items = Vec::with_capacity(n);
    let collect = async {
        while items.len() < n {
            match stream.next().await {
                Some(item) => items.push(item),
                None => break,
            }
        }
    };
    let _ = tokio::time::timeout(timeout, collect).await;
    items
}

/// Polls `condition` every few milliseconds until it holds. Returns whether
/// it held before `timeout`.
pub async fn eventually<F>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let wait = async {
        loop {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(timeout, wait).await.is_ok()
}

/// Runs `future` with a deadline, panicking with `what` if it is missed.
pub async fn within<T>(timeout: Duration, what: &str, future: impl Future<Output = T>) -> T {
    match tokio::time::timeout(timeout, future).await {
        Ok(value) => value,
        Err(_) => panic!("timed out waiting for {what}"),
    }
}
