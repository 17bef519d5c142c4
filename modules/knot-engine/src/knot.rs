//! Single-pipeline knot: one state, one change type, one action type.

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use tokio::runtime::Handle;
use tracing::debug;

use crate::config::KnotConfig;
use crate::effect::Effect;
use crate::error::{KnotError, Result};
use crate::hub::StateStream;
use crate::intercept::Chain;
use crate::pipeline::{Blueprint, Core, Pipeline};
use crate::resolver::{Resolver, Strategy};
use crate::traits::{lift, ColdFactory, DynReducer, Reducer};

/// A unidirectional state container.
///
/// Changes go in through [`change`](Self::change) (or a [`ChangeSink`]),
/// eager sources and resolved actions. They are reduced one at a time into
/// the next state, which observers receive through [`state`](Self::state).
///
/// Dropping the knot disposes it.
pub struct Knot<S, C, A> {
    core: Core<S>,
    pipeline: Pipeline<C>,
    _actions: PhantomData<fn() -> A>,
}

impl<S, C, A> Knot<S, C, A>
where
    S: Send + Sync + 'static,
    C: fmt::Debug + Send + 'static,
    A: fmt::Debug + Send + 'static,
{
    pub fn builder() -> KnotBuilder<S, C, A> {
        KnotBuilder::new()
    }

    /// Enqueues a change. After disposal the change is discarded.
    pub fn change(&self, change: C) {
        self.pipeline.send(change);
    }

    /// A cloneable intake handle for producers living in other tasks or
    /// threads.
    pub fn sink(&self) -> ChangeSink<C> {
        ChangeSink {
            pipeline: self.pipeline.clone(),
        }
    }

    /// Subscribes a new observer. See [`StateStream`].
    pub fn state(&self) -> StateStream<S> {
        self.core.state()
    }

    /// Latest delivered state.
    pub fn current(&self) -> Option<Arc<S>> {
        self.core.current()
    }

    /// Number of live [`StateStream`]s.
    pub fn observers(&self) -> usize {
        self.core.observers()
    }

    /// Stops every task, unsubscribes cold sources and ends all state
    /// streams. Idempotent.
    pub fn dispose(&self) {
        self.core.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.core.is_disposed()
    }
}

impl<S, C, A> Drop for Knot<S, C, A> {
    fn drop(&mut self) {
        self.core.dispose();
    }
}

/// Cloneable, thread-safe intake of a [`Knot`].
pub struct ChangeSink<C> {
    pipeline: Pipeline<C>,
}

impl<C> Clone for ChangeSink<C> {
    fn clone(&self) -> Self {
        Self {
            pipeline: self.pipeline.clone(),
        }
    }
}

impl<C: Send + 'static> ChangeSink<C> {
    pub fn change(&self, change: C) {
        self.pipeline.send(change);
    }
}

/// Declarative assembly of a [`Knot`]. Consumed by [`build`](Self::build).
pub struct KnotBuilder<S, C, A> {
    config: KnotConfig,
    initial: Option<Arc<S>>,
    reducer: Option<DynReducer<S, C, A>>,
    sources: Vec<BoxStream<'static, C>>,
    cold_sources: Vec<ColdFactory<C>>,
    resolvers: Vec<Resolver<A, C>>,
    state_chain: Chain<Arc<S>>,
    change_chain: Chain<C>,
    action_chain: Chain<A>,
    reduce_on: Option<Handle>,
    observe_on: Option<Handle>,
}

impl<S, C, A> KnotBuilder<S, C, A>
where
    S: Send + Sync + 'static,
    C: fmt::Debug + Send + 'static,
    A: fmt::Debug + Send + 'static,
{
    fn new() -> Self {
        Self {
            config: KnotConfig::default(),
            initial: None,
            reducer: None,
            sources: Vec::new(),
            cold_sources: Vec::new(),
            resolvers: Vec::new(),
            state_chain: Chain::new(),
            change_chain: Chain::new(),
            action_chain: Chain::new(),
            reduce_on: None,
            observe_on: None,
        }
    }

    pub fn config(mut self, config: KnotConfig) -> Self {
        self.config = config;
        self
    }

    pub fn initial(mut self, state: impl Into<Arc<S>>) -> Self {
        self.initial = Some(state.into());
        self
    }

    /// Sets the reducer. It typically matches exhaustively on the change.
    pub fn reduce<F>(self, reduce: F) -> Self
    where
        F: Fn(&Arc<S>, C) -> Effect<S, A> + Send + Sync + 'static,
    {
        self.reducer(reduce)
    }

    /// Sets the reducer from a [`Reducer`] implementation.
    pub fn reducer(mut self, reducer: impl Reducer<S, C, A>) -> Self {
        self.reducer = Some(lift(reducer));
        self
    }

    /// An eager source, subscribed for the whole life of the knot.
    pub fn source<St>(mut self, source: St) -> Self
    where
        St: Stream<Item = C> + Send + 'static,
    {
        self.sources.push(source.boxed());
        self
    }

    /// A cold source, subscribed only while the knot has observers. The
    /// factory runs again for each new 0 → 1 observer transition.
    pub fn cold_source<St>(mut self, factory: impl Fn() -> St + Send + Sync + 'static) -> Self
    where
        St: Stream<Item = C> + Send + 'static,
    {
        self.cold_sources.push(Arc::new(move || factory().boxed()));
        self
    }

    /// Resolves the actions picked by `select` with one change each.
    pub fn perform<X, Fut>(
        mut self,
        strategy: Strategy,
        select: impl Fn(&A) -> Option<X> + Send + Sync + 'static,
        run: impl Fn(X) -> Fut + Send + Sync + 'static,
    ) -> Self
    where
        Fut: Future<Output = anyhow::Result<C>> + Send + 'static,
    {
        let name = format!("resolver#{}", self.resolvers.len());
        self.resolvers
            .push(Resolver::single(name, strategy, select, run));
        self
    }

    /// Resolves the actions picked by `select` with a stream of changes each.
    pub fn perform_stream<X, St>(
        mut self,
        strategy: Strategy,
        select: impl Fn(&A) -> Option<X> + Send + Sync + 'static,
        run: impl Fn(X) -> St + Send + Sync + 'static,
    ) -> Self
    where
        St: Stream<Item = anyhow::Result<C>> + Send + 'static,
    {
        let name = format!("resolver#{}", self.resolvers.len());
        self.resolvers
            .push(Resolver::streaming(name, strategy, select, run));
        self
    }

    /// Registers a prebuilt resolver.
    pub fn resolver(mut self, resolver: Resolver<A, C>) -> Self {
        self.resolvers.push(resolver);
        self
    }

    pub fn state_interceptors(mut self, configure: impl FnOnce(&mut Chain<Arc<S>>)) -> Self {
        configure(&mut self.state_chain);
        self
    }

    pub fn change_interceptors(mut self, configure: impl FnOnce(&mut Chain<C>)) -> Self {
        configure(&mut self.change_chain);
        self
    }

    pub fn action_interceptors(mut self, configure: impl FnOnce(&mut Chain<A>)) -> Self {
        configure(&mut self.action_chain);
        self
    }

    pub fn watch_state(mut self, watcher: impl Fn(&Arc<S>) + Send + Sync + 'static) -> Self {
        self.state_chain.watch(watcher);
        self
    }

    pub fn watch_change(mut self, watcher: impl Fn(&C) + Send + Sync + 'static) -> Self {
        self.change_chain.watch(watcher);
        self
    }

    pub fn watch_action(mut self, watcher: impl Fn(&A) + Send + Sync + 'static) -> Self {
        self.action_chain.watch(watcher);
        self
    }

    /// Runs reduction on `handle` instead of the runtime the knot is built on.
    pub fn reduce_on(mut self, handle: Handle) -> Self {
        self.reduce_on = Some(handle);
        self
    }

    /// Delivers state to observers from `handle`.
    pub fn observe_on(mut self, handle: Handle) -> Self {
        self.observe_on = Some(handle);
        self
    }

    /// Validates the configuration and starts the pipeline on the current
    /// tokio runtime.
    pub fn build(self) -> Result<Knot<S, C, A>> {
        let initial = self.initial.ok_or(KnotError::MissingInitialState)?;
        let reducer = self.reducer.ok_or(KnotError::MissingReducer)?;
        let base = Handle::try_current().map_err(|_| KnotError::NoRuntime)?;

        let core = Core::new(&self.config.name);
        debug!(
            knot = %self.config.name,
            sources = self.sources.len(),
            cold_sources = self.cold_sources.len(),
            resolvers = self.resolvers.len(),
            "building knot"
        );
        let blueprint = Blueprint {
            config: self.config,
            initial,
            reducer,
            sources: self.sources,
            cold_sources: self.cold_sources,
            resolvers: self.resolvers,
            state_chain: self.state_chain,
            change_chain: self.change_chain,
            action_chain: self.action_chain,
            reduce_on: self.reduce_on,
            observe_on: self.observe_on,
        };
        let pipeline = Pipeline::start(blueprint, base, &core);

        Ok(Knot {
            core,
            pipeline,
            _actions: PhantomData,
        })
    }
}
