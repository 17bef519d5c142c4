//! Composite knot: many independently registered primes over one state.
//!
//! Primes contribute reducers, resolvers, sources and interceptors into a
//! shared accumulator. `compose()` seals the accumulator exactly once and
//! starts the same pipeline a [`Knot`](crate::Knot) runs, dispatching each
//! change to the reducer registered for its concrete type.

use std::any::{self, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use futures::stream::BoxStream;
use futures::{FutureExt, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::config::KnotConfig;
use crate::effect::Effect;
use crate::error::{KnotError, Result};
use crate::hub::StateStream;
use crate::intercept::Chain;
use crate::message::{Erased, Message};
use crate::pipeline::{Blueprint, Core, Pipeline};
use crate::resolver::{Resolver, Strategy};
use crate::traits::{ColdFactory, DynReducer};

type ErasedReducer<S> = Box<dyn Fn(&Arc<S>, Erased) -> Result<Effect<S, Erased>> + Send + Sync>;

/// A bundle of registrations contributed by one module.
pub trait Delegate<S>: Send + Sync {
    fn register(&self, prime: &mut Prime<S>);
}

/// Registration surface handed to each prime before composition.
pub struct Prime<S> {
    reducers: Vec<(TypeId, &'static str, ErasedReducer<S>)>,
    duplicate: Option<&'static str>,
    sources: Vec<BoxStream<'static, Erased>>,
    cold_sources: Vec<ColdFactory<Erased>>,
    resolvers: Vec<Resolver<Erased, Erased>>,
    state_chain: Chain<Arc<S>>,
    change_chain: Chain<Erased>,
    action_chain: Chain<Erased>,
}

impl<S: Send + Sync + 'static> Prime<S> {
    pub(crate) fn new() -> Self {
        Self {
            reducers: Vec::new(),
            duplicate: None,
            sources: Vec::new(),
            cold_sources: Vec::new(),
            resolvers: Vec::new(),
            state_chain: Chain::new(),
            change_chain: Chain::new(),
            action_chain: Chain::new(),
        }
    }

    /// Registers the reducer for changes of type `T`. Only one reducer per
    /// change type is allowed across all primes of a composite knot.
    pub fn reduce<T: Message>(
        &mut self,
        reduce: impl Fn(&Arc<S>, T) -> Effect<S, Erased> + Send + Sync + 'static,
    ) -> &mut Self {
        let key = TypeId::of::<T>();
        let name = any::type_name::<T>();
        if self.reducers.iter().any(|(registered, ..)| *registered == key) {
            self.duplicate.get_or_insert(name);
            return self;
        }
        let erased: ErasedReducer<S> = Box::new(move |state: &Arc<S>, change: Erased| {
            match change.downcast::<T>() {
                Some(change) => Ok(reduce(state, change)),
                None => Err(KnotError::UnknownChange {
                    change: name.to_string(),
                }),
            }
        });
        self.reducers.push((key, name, erased));
        self
    }

    /// Resolves actions of type `T` with one change each.
    pub fn perform<T, C, Fut>(
        &mut self,
        strategy: Strategy,
        run: impl Fn(T) -> Fut + Send + Sync + 'static,
    ) -> &mut Self
    where
        T: Message + Clone,
        C: Message,
        Fut: Future<Output = anyhow::Result<C>> + Send + 'static,
    {
        self.resolvers.push(Resolver::single(
            any::type_name::<T>(),
            strategy,
            |action: &Erased| action.downcast_ref::<T>().cloned(),
            move |action: T| run(action).map(|outcome| outcome.map(Erased::new)),
        ));
        self
    }

    /// Resolves actions of type `T` with a stream of changes each.
    pub fn perform_stream<T, C, St>(
        &mut self,
        strategy: Strategy,
        run: impl Fn(T) -> St + Send + Sync + 'static,
    ) -> &mut Self
    where
        T: Message + Clone,
        C: Message,
        St: Stream<Item = anyhow::Result<C>> + Send + 'static,
    {
        self.resolvers.push(Resolver::streaming(
            any::type_name::<T>(),
            strategy,
            |action: &Erased| action.downcast_ref::<T>().cloned(),
            move |action: T| run(action).map(|outcome| outcome.map(Erased::new)),
        ));
        self
    }

    /// An eager source, subscribed as soon as the knot is composed.
    pub fn source<T, St>(&mut self, source: St) -> &mut Self
    where
        T: Message,
        St: Stream<Item = T> + Send + 'static,
    {
        self.sources.push(source.map(Erased::new).boxed());
        self
    }

    /// A cold source, subscribed only while the knot has observers.
    pub fn cold_source<T, St>(&mut self, factory: impl Fn() -> St + Send + Sync + 'static) -> &mut Self
    where
        T: Message,
        St: Stream<Item = T> + Send + 'static,
    {
        self.cold_sources
            .push(Arc::new(move || factory().map(Erased::new).boxed()));
        self
    }

    pub fn watch_state(&mut self, watcher: impl Fn(&Arc<S>) + Send + Sync + 'static) -> &mut Self {
        self.state_chain.watch(watcher);
        self
    }

    /// Observes changes of type `T`; other changes are ignored.
    pub fn watch_change<T: Message>(&mut self, watcher: impl Fn(&T) + Send + Sync + 'static) -> &mut Self {
        self.change_chain.watch_type(watcher);
        self
    }

    /// Observes actions of type `T`; other actions are ignored.
    pub fn watch_action<T: Message>(&mut self, watcher: impl Fn(&T) + Send + Sync + 'static) -> &mut Self {
        self.action_chain.watch_type(watcher);
        self
    }

    pub fn state_interceptors(&mut self, configure: impl FnOnce(&mut Chain<Arc<S>>)) -> &mut Self {
        configure(&mut self.state_chain);
        self
    }

    pub fn change_interceptors(&mut self, configure: impl FnOnce(&mut Chain<Erased>)) -> &mut Self {
        configure(&mut self.change_chain);
        self
    }

    pub fn action_interceptors(&mut self, configure: impl FnOnce(&mut Chain<Erased>)) -> &mut Self {
        configure(&mut self.action_chain);
        self
    }

    /// Merges another prime into this one, all or nothing.
    fn absorb(&mut self, other: Prime<S>) -> Result<()> {
        if let Some(change) = other.duplicate {
            return Err(KnotError::DuplicateReducer { change });
        }
        if let Some(change) = other
            .reducers
            .iter()
            .find(|(key, ..)| self.reducers.iter().any(|(existing, ..)| existing == key))
            .map(|(_, name, _)| *name)
        {
            return Err(KnotError::DuplicateReducer { change });
        }

        self.reducers.extend(other.reducers);
        self.sources.extend(other.sources);
        self.cold_sources.extend(other.cold_sources);
        self.resolvers.extend(other.resolvers);
        self.state_chain.append(&other.state_chain);
        self.change_chain.append(&other.change_chain);
        self.action_chain.append(&other.action_chain);
        Ok(())
    }
}

/// A knot assembled from independently registered primes.
///
/// Lifecycle: uncomposed (primes register, observers may attach, changes are
/// rejected) → composed (terminal; registration is rejected).
pub struct CompositeKnot<S> {
    core: Core<S>,
    config: KnotConfig,
    initial: Arc<S>,
    base: Handle,
    reduce_on: Option<Handle>,
    observe_on: Option<Handle>,
    composed: AtomicBool,
    pending: Mutex<Option<Prime<S>>>,
    pipeline: OnceLock<Pipeline<Erased>>,
}

impl<S: Send + Sync + 'static> CompositeKnot<S> {
    pub fn builder() -> CompositeBuilder<S> {
        CompositeBuilder {
            config: KnotConfig::default(),
            initial: None,
            reduce_on: None,
            observe_on: None,
            state_chain: Chain::new(),
        }
    }

    /// Registers one prime. Rejected once the knot is composed, or when the
    /// prime reduces a change type another prime already reduces.
    pub fn register_prime(&self, configure: impl FnOnce(&mut Prime<S>)) -> Result<()> {
        let mut prime = Prime::new();
        configure(&mut prime);

        let mut pending = self.pending.lock();
        let accumulated = pending.as_mut().ok_or(KnotError::AlreadyComposed)?;
        accumulated.absorb(prime)
    }

    pub fn register<D: Delegate<S> + ?Sized>(&self, delegate: &D) -> Result<()> {
        self.register_prime(|prime| delegate.register(prime))
    }

    /// Seals the registrations and starts the pipeline. Only the first call
    /// succeeds.
    pub fn compose(&self) -> Result<()> {
        // Emptiness check and flag flip share the pending lock.
        let prime = {
            let mut pending = self.pending.lock();
            match pending.as_ref() {
                None => return Err(KnotError::AlreadyComposed),
                Some(prime) if prime.reducers.is_empty() => return Err(KnotError::MissingReducer),
                Some(_) => {}
            }
            if self
                .composed
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return Err(KnotError::AlreadyComposed);
            }
            match pending.take() {
                Some(prime) => prime,
                None => return Err(KnotError::AlreadyComposed),
            }
        };

        if self.core.is_disposed() {
            warn!(knot = %self.config.name, "composed after disposal, pipeline not started");
            return Ok(());
        }

        debug!(
            knot = %self.config.name,
            reducers = prime.reducers.len(),
            resolvers = prime.resolvers.len(),
            sources = prime.sources.len(),
            cold_sources = prime.cold_sources.len(),
            "composing knot"
        );

        let table: HashMap<TypeId, ErasedReducer<S>> = prime
            .reducers
            .into_iter()
            .map(|(key, _, reduce)| (key, reduce))
            .collect();
        let reducer: DynReducer<S, Erased, Erased> =
            Arc::new(move |state: &Arc<S>, change: Erased| match table.get(&change.key()) {
                Some(reduce) => reduce(state, change),
                None => Err(KnotError::UnknownChange {
                    change: format!("{change:?}"),
                }),
            });

        let blueprint = Blueprint {
            config: self.config.clone(),
            initial: self.initial.clone(),
            reducer,
            sources: prime.sources,
            cold_sources: prime.cold_sources,
            resolvers: prime.resolvers,
            state_chain: prime.state_chain,
            change_chain: prime.change_chain,
            action_chain: prime.action_chain,
            reduce_on: self.reduce_on.clone(),
            observe_on: self.observe_on.clone(),
        };
        let pipeline = Pipeline::start(blueprint, self.base.clone(), &self.core);
        let _ = self.pipeline.set(pipeline);
        Ok(())
    }

    pub fn is_composed(&self) -> bool {
        self.pipeline.get().is_some()
    }

    /// Enqueues a change. Rejected until composition has completed; after
    /// disposal the change is discarded.
    pub fn change<T: Message>(&self, change: T) -> Result<()> {
        match self.pipeline.get() {
            Some(pipeline) => {
                pipeline.send(Erased::new(change));
                Ok(())
            }
            None if self.core.is_disposed() && self.composed.load(Ordering::SeqCst) => Ok(()),
            None => Err(KnotError::NotComposed),
        }
    }

    /// Subscribes a new observer. Observers may attach before composition;
    /// they see the initial state once the pipeline starts.
    pub fn state(&self) -> StateStream<S> {
        self.core.state()
    }

    pub fn current(&self) -> Option<Arc<S>> {
        self.core.current()
    }

    pub fn observers(&self) -> usize {
        self.core.observers()
    }

    pub fn dispose(&self) {
        self.core.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.core.is_disposed()
    }
}

impl<S> Drop for CompositeKnot<S> {
    fn drop(&mut self) {
        self.core.dispose();
    }
}

/// Assembly of a [`CompositeKnot`]: everything that is not contributed by
/// primes.
pub struct CompositeBuilder<S> {
    config: KnotConfig,
    initial: Option<Arc<S>>,
    reduce_on: Option<Handle>,
    observe_on: Option<Handle>,
    state_chain: Chain<Arc<S>>,
}

impl<S: Send + Sync + 'static> CompositeBuilder<S> {
    pub fn config(mut self, config: KnotConfig) -> Self {
        self.config = config;
        self
    }

    pub fn initial(mut self, state: impl Into<Arc<S>>) -> Self {
        self.initial = Some(state.into());
        self
    }

    pub fn reduce_on(mut self, handle: Handle) -> Self {
        self.reduce_on = Some(handle);
        self
    }

    pub fn observe_on(mut self, handle: Handle) -> Self {
        self.observe_on = Some(handle);
        self
    }

    /// State interceptors that run ahead of every prime's.
    pub fn state_interceptors(mut self, configure: impl FnOnce(&mut Chain<Arc<S>>)) -> Self {
        configure(&mut self.state_chain);
        self
    }

    pub fn watch_state(mut self, watcher: impl Fn(&Arc<S>) + Send + Sync + 'static) -> Self {
        self.state_chain.watch(watcher);
        self
    }

    pub fn build(self) -> Result<CompositeKnot<S>> {
        let initial = self.initial.ok_or(KnotError::MissingInitialState)?;
        let base = Handle::try_current().map_err(|_| KnotError::NoRuntime)?;

        let mut pending = Prime::new();
        pending.state_chain = self.state_chain;

        Ok(CompositeKnot {
            core: Core::new(&self.config.name),
            config: self.config,
            initial,
            base,
            reduce_on: self.reduce_on,
            observe_on: self.observe_on,
            composed: AtomicBool::new(false),
            pending: Mutex::new(Some(pending)),
            pipeline: OnceLock::new(),
        })
    }
}
