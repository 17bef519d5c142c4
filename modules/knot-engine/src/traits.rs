//! Core traits for the knot engine.

use std::sync::Arc;

use futures::stream::BoxStream;

use crate::effect::Effect;
use crate::error::Result;

/// Pure state transitions. No I/O, no side effects.
///
/// Called once per change, never concurrently with itself. Side effects are
/// requested by returning actions in the [`Effect`]; they are resolved
/// asynchronously and come back as further changes.
pub trait Reducer<S, C, A>: Send + Sync + 'static {
    fn reduce(&self, state: &Arc<S>, change: C) -> Effect<S, A>;
}

impl<S, C, A, F> Reducer<S, C, A> for F
where
    F: Fn(&Arc<S>, C) -> Effect<S, A> + Send + Sync + 'static,
{
    fn reduce(&self, state: &Arc<S>, change: C) -> Effect<S, A> {
        self(state, change)
    }
}

/// The reducer as the pipeline sees it: dispatch may fail at runtime.
pub(crate) type DynReducer<S, C, A> =
    Arc<dyn Fn(&Arc<S>, C) -> Result<Effect<S, A>> + Send + Sync>;

/// Produces a fresh subscription to a cold source each time observers appear.
pub(crate) type ColdFactory<C> = Arc<dyn Fn() -> BoxStream<'static, C> + Send + Sync>;

pub(crate) fn lift<S, C, A, R>(reducer: R) -> DynReducer<S, C, A>
where
    S: 'static,
    C: 'static,
    A: 'static,
    R: Reducer<S, C, A>,
{
    Arc::new(move |state: &Arc<S>, change: C| Ok(reducer.reduce(state, change)))
}
