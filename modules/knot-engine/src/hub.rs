//! Multicast state channel that replays the latest state to new observers.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use futures::{Stream, StreamExt};
use parking_lot::Mutex;

use crate::error::{KnotError, Result};
use crate::lazy::Lease;
use crate::pipeline::ColdSubscription;

pub(crate) struct StateHub<S> {
    inner: Mutex<HubInner<S>>,
}

struct HubInner<S> {
    latest: Option<Arc<S>>,
    observers: Vec<UnboundedSender<Result<Arc<S>>>>,
    status: Status,
}

enum Status {
    Open,
    Failed(KnotError),
    Closed,
}

impl<S> StateHub<S> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(HubInner {
                latest: None,
                observers: Vec::new(),
                status: Status::Open,
            }),
        })
    }

    /// Registers an observer. It receives the latest state (if any) before
    /// anything published after this call.
    pub(crate) fn subscribe(&self) -> UnboundedReceiver<Result<Arc<S>>> {
        let (tx, rx) = mpsc::unbounded();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        match &inner.status {
            Status::Open => {
                if let Some(latest) = &inner.latest {
                    let _ = tx.unbounded_send(Ok(latest.clone()));
                }
                inner.observers.push(tx);
            }
            Status::Failed(err) => {
                if let Some(latest) = &inner.latest {
                    let _ = tx.unbounded_send(Ok(latest.clone()));
                }
                let _ = tx.unbounded_send(Err(err.clone()));
            }
            Status::Closed => {}
        }
        rx
    }

    pub(crate) fn publish(&self, state: Arc<S>) {
        let mut inner = self.inner.lock();
        if !matches!(inner.status, Status::Open) {
            return;
        }
        inner
            .observers
            .retain(|tx| tx.unbounded_send(Ok(state.clone())).is_ok());
        inner.latest = Some(state);
    }

    /// Delivers a terminal failure once to every observer and ends their
    /// streams. Later observers get the latest state and the same failure.
    pub(crate) fn fail(&self, err: KnotError) {
        let mut inner = self.inner.lock();
        if !matches!(inner.status, Status::Open) {
            return;
        }
        for tx in inner.observers.drain(..) {
            let _ = tx.unbounded_send(Err(err.clone()));
        }
        inner.status = Status::Failed(err);
    }

    /// Ends every observer stream without an error.
    pub(crate) fn close(&self) {
        let mut inner = self.inner.lock();
        inner.observers.clear();
        inner.status = Status::Closed;
    }

    pub(crate) fn latest(&self) -> Option<Arc<S>> {
        self.inner.lock().latest.clone()
    }
}

/// An observer of a knot's state.
///
/// Yields the current state first, then every accepted transition. A terminal
/// failure is yielded once as `Err`, after which the stream ends. Disposal of
/// the knot ends the stream without an error.
///
/// While it is alive the stream counts as an observer: cold sources stay
/// subscribed as long as at least one `StateStream` exists.
pub struct StateStream<S> {
    rx: UnboundedReceiver<Result<Arc<S>>>,
    _lease: Lease<ColdSubscription>,
}

impl<S> StateStream<S> {
    pub(crate) fn new(
        rx: UnboundedReceiver<Result<Arc<S>>>,
        lease: Lease<ColdSubscription>,
    ) -> Self {
        Self { rx, _lease: lease }
    }
}

impl<S> Stream for StateStream<S> {
    type Item = Result<Arc<S>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_next_unpin(cx)
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    fn drain<S>(rx: &mut UnboundedReceiver<Result<Arc<S>>>) -> Vec<Result<Arc<S>>> {
        let mut items = Vec::new();
        while let Ok(Some(item)) = rx.try_next() {
            items.push(item);
        }
        items
    }

    #[test]
    fn late_observer_gets_latest_only() {
        let hub = StateHub::new();
        hub.publish(Arc::new(1));
        hub.publish(Arc::new(2));

        let mut rx = hub.subscribe();
        hub.publish(Arc::new(3));

        let seen: Vec<i32> = drain(&mut rx)
            .into_iter()
            .map(|s| *s.expect("state"))
            .collect();
        assert_eq!(seen, vec![2, 3]);
    }

    #[test]
    fn failure_reaches_current_and_future_observers() {
        let hub = StateHub::new();
        let mut early = hub.subscribe();
        hub.publish(Arc::new("ready"));
        hub.fail(KnotError::UnknownChange {
            change: "Refresh".into(),
        });

        let items = drain(&mut early);
        assert_eq!(items.len(), 2);
        assert!(matches!(items[1], Err(KnotError::UnknownChange { .. })));

        let mut late = hub.subscribe();
        let items = drain(&mut late);
        assert_eq!(items.len(), 2);
        assert_eq!(*items[0].clone().expect("state"), "ready");
        assert!(items[1].is_err());
    }

    #[tokio::test]
    async fn close_ends_streams() {
        let hub = StateHub::<u8>::new();
        let mut rx = hub.subscribe();
        hub.close();
        assert!(rx.next().await.is_none());

        let mut after = hub.subscribe();
        assert!(after.next().await.is_none());
        hub.publish(Arc::new(1));
        assert!(hub.latest().is_none());
    }
}
