//! Ordered interceptor/watcher chains for the state, change and action
//! channels.
//!
//! A chain is folded over its channel in registration order, so later
//! interceptors see what earlier ones produced. `watch_on` splits the chain:
//! the segment before it keeps running where it was, everything registered
//! after it runs on the given runtime handle.

use std::sync::Arc;

use futures::channel::mpsc;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::runtime::Handle;

use crate::message::{Erased, Message};
use crate::pipeline::TaskSet;

type Interceptor<T> = Arc<dyn Fn(BoxStream<'static, T>) -> BoxStream<'static, T> + Send + Sync>;

enum Stage<T> {
    Intercept(Interceptor<T>),
    WatchOn(Handle),
}

impl<T> Clone for Stage<T> {
    fn clone(&self) -> Self {
        match self {
            Stage::Intercept(f) => Stage::Intercept(f.clone()),
            Stage::WatchOn(handle) => Stage::WatchOn(handle.clone()),
        }
    }
}

pub struct Chain<T> {
    stages: Vec<Stage<T>>,
}

impl<T> Default for Chain<T> {
    fn default() -> Self {
        Self { stages: Vec::new() }
    }
}

impl<T: Send + 'static> Chain<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a stream transformation.
    pub fn intercept(
        &mut self,
        interceptor: impl Fn(BoxStream<'static, T>) -> BoxStream<'static, T> + Send + Sync + 'static,
    ) -> &mut Self {
        self.stages.push(Stage::Intercept(Arc::new(interceptor)));
        self
    }

    /// Appends a pass-through observer.
    pub fn watch(&mut self, watcher: impl Fn(&T) + Send + Sync + 'static) -> &mut Self {
        let watcher = Arc::new(watcher);
        self.intercept(move |upstream| {
            let watcher = watcher.clone();
            upstream.inspect(move |value| watcher(value)).boxed()
        })
    }

    /// Runs every stage registered after this call on `handle`.
    pub fn watch_on(&mut self, handle: Handle) -> &mut Self {
        self.stages.push(Stage::WatchOn(handle));
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub(crate) fn append(&mut self, other: &Chain<T>) {
        self.stages.extend(other.stages.iter().cloned());
    }

    /// Folds the chain over `upstream`.
    ///
    /// Returns the resulting stream and the handle it must be driven on.
    /// Each segment ahead of a `watch_on` is driven by its own task on the
    /// segment's handle and relayed to the next one.
    pub(crate) fn apply(
        &self,
        upstream: BoxStream<'static, T>,
        base: Handle,
        tasks: &TaskSet,
    ) -> (BoxStream<'static, T>, Handle) {
        let mut stream = upstream;
        let mut driver = base;
        for stage in &self.stages {
            match stage {
                Stage::Intercept(interceptor) => stream = interceptor(stream),
                Stage::WatchOn(handle) => {
                    stream = relay(stream, &driver, tasks);
                    driver = handle.clone();
                }
            }
        }
        (stream, driver)
    }
}

impl Chain<Erased> {
    /// Appends an observer that only sees values of type `M`; everything else
    /// passes by untouched.
    pub fn watch_type<M: Message>(&mut self, watcher: impl Fn(&M) + Send + Sync + 'static) -> &mut Self {
        self.watch(move |value: &Erased| {
            if let Some(typed) = value.downcast_ref::<M>() {
                watcher(typed);
            }
        })
    }
}

/// Drives `upstream` in a task on `driver` and hands its items over through
/// an unbounded channel.
pub(crate) fn relay<T: Send + 'static>(
    upstream: BoxStream<'static, T>,
    driver: &Handle,
    tasks: &TaskSet,
) -> BoxStream<'static, T> {
    let (tx, rx) = mpsc::unbounded();
    let pump = async move {
        let mut upstream = upstream;
        while let Some(item) = upstream.next().await {
            if tx.unbounded_send(item).is_err() {
                break;
            }
        }
    };
    tasks.spawn(driver, "interceptor chain", pump);
    rx.boxed()
}
