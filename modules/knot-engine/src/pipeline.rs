//! The running pipeline behind both knot variants.
//!
//! ```text
//! change() ─┐
//! sources ──┼─► intake ─► change chain ─► reduce ─► distinct ─► state chain ─► hub ─► observers
//! cold ─────┤                               │
//! resolvers ┘◄── dispatch ◄── action chain ◄┘
//! ```
//!
//! Every producer writes into one unbounded intake channel that has a single
//! consumer: the reducer task. That channel is what serializes concurrent
//! producers into one total order, and it is why the reducer never runs
//! concurrently with itself.

use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info_span, trace, Instrument, Span};

use crate::config::KnotConfig;
use crate::error::{KnotError, Result};
use crate::hub::{StateHub, StateStream};
use crate::intercept::{relay, Chain};
use crate::lazy::SharedLazy;
use crate::resolver::{dispatch, Resolver};
use crate::traits::{ColdFactory, DynReducer};

// ---------------------------------------------------------------------------
// Task tracking
// ---------------------------------------------------------------------------

/// Every task a pipeline spawns, so disposal and terminal failure can stop
/// them all. Tasks tracked after `abort_all` are aborted on arrival.
#[derive(Default)]
pub(crate) struct TaskSet {
    handles: Mutex<Vec<AbortHandle>>,
    closed: AtomicBool,
    fatal: Mutex<Option<UnboundedSender<KnotError>>>,
}

impl TaskSet {
    /// Panics in tasks spawned from now on are reported to `fatal`.
    pub(crate) fn report_to(&self, fatal: UnboundedSender<KnotError>) {
        *self.fatal.lock() = Some(fatal);
    }

    /// Spawns a supervised task on `driver` inside the current span.
    pub(crate) fn spawn<F>(&self, driver: &Handle, stage: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let fatal = self.fatal.lock().clone();
        self.track(driver.spawn(supervised(stage, task, fatal).in_current_span()));
    }

    pub(crate) fn track<T>(&self, task: JoinHandle<T>) {
        let mut handles = self.handles.lock();
        if self.closed.load(Ordering::SeqCst) {
            task.abort();
            return;
        }
        handles.retain(|handle| !handle.is_finished());
        handles.push(task.abort_handle());
    }

    pub(crate) fn abort_all(&self) {
        let handles = {
            let mut handles = self.handles.lock();
            self.closed.store(true, Ordering::SeqCst);
            std::mem::take(&mut *handles)
        };
        for handle in handles {
            handle.abort();
        }
    }
}

/// Runs `task`; a panic inside it becomes a terminal failure of the pipeline.
pub(crate) async fn supervised<F>(
    stage: &'static str,
    task: F,
    fatal: Option<UnboundedSender<KnotError>>,
) where
    F: Future<Output = ()>,
{
    if let Err(panic) = AssertUnwindSafe(task).catch_unwind().await {
        let err = KnotError::panicked(stage, &*panic);
        error!(error = %err, "pipeline task panicked");
        if let Some(fatal) = fatal {
            let _ = fatal.unbounded_send(err);
        }
    }
}

/// Forwards `source` into `intake` until either side is gone.
pub(crate) async fn pump<T>(mut source: BoxStream<'static, T>, intake: UnboundedSender<T>) {
    while let Some(item) = source.next().await {
        if intake.unbounded_send(item).is_err() {
            break;
        }
    }
}

// ---------------------------------------------------------------------------
// Cold sources
// ---------------------------------------------------------------------------

/// One shared subscription to all cold sources of a knot. Dropping it
/// unsubscribes every source.
pub(crate) struct ColdSubscription {
    pumps: Vec<AbortHandle>,
    span: Span,
}

impl ColdSubscription {
    fn open<C: Send + 'static>(
        factories: &[ColdFactory<C>],
        intake: &UnboundedSender<C>,
        fatal: &UnboundedSender<KnotError>,
        driver: &Handle,
        span: &Span,
    ) -> Self {
        let pumps = factories
            .iter()
            .map(|factory| {
                let source = factory();
                let task = supervised("cold source", pump(source, intake.clone()), Some(fatal.clone()));
                driver.spawn(task.instrument(span.clone())).abort_handle()
            })
            .collect::<Vec<_>>();
        if !pumps.is_empty() {
            debug!(parent: span, sources = pumps.len(), "cold sources subscribed");
        }
        Self {
            pumps,
            span: span.clone(),
        }
    }
}

impl Drop for ColdSubscription {
    fn drop(&mut self) {
        if self.pumps.is_empty() {
            return;
        }
        for pump in self.pumps.drain(..) {
            pump.abort();
        }
        debug!(parent: &self.span, "cold sources unsubscribed");
    }
}

// ---------------------------------------------------------------------------
// Core: what outlives (or precedes) the running pipeline
// ---------------------------------------------------------------------------

/// State channel, cold-source refcount and task set of one knot.
///
/// A composite knot creates its core at build time so observers can attach
/// before composition starts the pipeline.
pub(crate) struct Core<S> {
    name: String,
    hub: Arc<StateHub<S>>,
    cold: Arc<SharedLazy<ColdSubscription>>,
    tasks: Arc<TaskSet>,
    disposed: AtomicBool,
}

impl<S: Send + Sync + 'static> Core<S> {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            hub: StateHub::new(),
            cold: SharedLazy::unarmed(),
            tasks: Arc::new(TaskSet::default()),
            disposed: AtomicBool::new(false),
        }
    }

    pub(crate) fn state(&self) -> StateStream<S> {
        let rx = self.hub.subscribe();
        StateStream::new(rx, self.cold.acquire())
    }

    pub(crate) fn current(&self) -> Option<Arc<S>> {
        self.hub.latest()
    }

    pub(crate) fn observers(&self) -> usize {
        self.cold.holders()
    }
}

impl<S> Core<S> {
    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub(crate) fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.tasks.abort_all();
        self.cold.disarm();
        self.hub.close();
        debug!(knot = %self.name, "disposed");
    }
}

// ---------------------------------------------------------------------------
// Blueprint → Pipeline
// ---------------------------------------------------------------------------

/// Immutable wiring record produced by a builder or by composition.
pub(crate) struct Blueprint<S, C, A> {
    pub(crate) config: KnotConfig,
    pub(crate) initial: Arc<S>,
    pub(crate) reducer: DynReducer<S, C, A>,
    pub(crate) sources: Vec<BoxStream<'static, C>>,
    pub(crate) cold_sources: Vec<ColdFactory<C>>,
    pub(crate) resolvers: Vec<Resolver<A, C>>,
    pub(crate) state_chain: Chain<Arc<S>>,
    pub(crate) change_chain: Chain<C>,
    pub(crate) action_chain: Chain<A>,
    pub(crate) reduce_on: Option<Handle>,
    pub(crate) observe_on: Option<Handle>,
}

/// Handle to a started pipeline: the intake all changes go through.
pub(crate) struct Pipeline<C> {
    intake: UnboundedSender<C>,
}

impl<C> Clone for Pipeline<C> {
    fn clone(&self) -> Self {
        Self {
            intake: self.intake.clone(),
        }
    }
}

impl<C: Send + 'static> Pipeline<C> {
    /// Enqueues a change. Once the pipeline is torn down the change is
    /// discarded.
    pub(crate) fn send(&self, change: C) {
        if self.intake.unbounded_send(change).is_err() {
            trace!("pipeline is gone, discarding change");
        }
    }

    /// Wires the blueprint and spawns its tasks. `base` is the context used
    /// wherever the blueprint does not name one.
    pub(crate) fn start<S, A>(blueprint: Blueprint<S, C, A>, base: Handle, core: &Core<S>) -> Self
    where
        S: Send + Sync + 'static,
        C: fmt::Debug,
        A: fmt::Debug + Send + 'static,
    {
        let Blueprint {
            config,
            initial,
            reducer,
            sources,
            cold_sources,
            resolvers,
            state_chain,
            change_chain,
            action_chain,
            reduce_on,
            observe_on,
        } = blueprint;

        let span = info_span!("knot", name = %config.name);
        let _entered = span.enter();
        let tasks = &core.tasks;

        let (intake_tx, intake_rx) = mpsc::unbounded::<C>();
        let (fatal_tx, fatal_rx) = mpsc::unbounded::<KnotError>();
        let (action_tx, action_rx) = mpsc::unbounded::<A>();
        let (state_tx, state_rx) = mpsc::unbounded::<Arc<S>>();
        let (outcome_tx, outcome_rx) = oneshot::channel::<Result<()>>();
        tasks.report_to(fatal_tx.clone());

        for source in sources {
            tasks.spawn(&base, "source", pump(source, intake_tx.clone()));
        }

        // Reduction.
        let reduce_ctx = reduce_on.unwrap_or_else(|| base.clone());
        let (changes, reduce_driver) = change_chain.apply(intake_rx.boxed(), reduce_ctx, tasks);
        let reduction = Reduction {
            reducer,
            actions: action_tx,
            states: state_tx,
            trace_changes: config.trace_changes,
        };
        let reduce = async move {
            let outcome = AssertUnwindSafe(reduction.run(initial, changes, fatal_rx))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(KnotError::panicked("change chain", &*panic)));
            let _ = outcome_tx.send(outcome);
        };
        tasks.spawn(&reduce_driver, "reducer", reduce);

        // Action resolution.
        let (actions, action_driver) = action_chain.apply(action_rx.boxed(), reduce_driver.clone(), tasks);
        tasks.spawn(
            &action_driver,
            "action dispatch",
            dispatch(actions, resolvers, intake_tx.clone(), fatal_tx.clone()),
        );

        // State delivery.
        let (mut states, state_driver) = state_chain.apply(state_rx.boxed(), reduce_driver, tasks);
        let delivery_ctx = match observe_on {
            Some(observe_on) => {
                states = relay(states, &state_driver, tasks);
                observe_on
            }
            None => state_driver,
        };
        let hub = core.hub.clone();
        let cold = core.cold.clone();
        let teardown = core.tasks.clone();
        let deliver = async move {
            let delivered = AssertUnwindSafe(async {
                while let Some(state) = states.next().await {
                    hub.publish(state);
                }
            })
            .catch_unwind()
            .await;
            let failure = match delivered {
                Err(panic) => Some(KnotError::panicked("state delivery", &*panic)),
                Ok(()) => match outcome_rx.await {
                    Ok(Err(err)) => Some(err),
                    _ => None,
                },
            };
            if let Some(err) = failure {
                error!(error = %err, "pipeline terminated");
                hub.fail(err);
                cold.disarm();
                teardown.abort_all();
            }
        };
        tasks.spawn(&delivery_ctx, "state delivery", deliver);

        // Cold sources, subscribed while observers exist.
        let cold_intake = intake_tx.clone();
        let cold_span = span.clone();
        let cold_driver = base;
        core.cold.arm(move || {
            ColdSubscription::open(&cold_sources, &cold_intake, &fatal_tx, &cold_driver, &cold_span)
        });

        debug!("pipeline started");
        Self { intake: intake_tx }
    }
}

/// The reducer task: applies changes one at a time, pushes the actions of
/// each effect before its state, and suppresses states that did not change
/// identity.
struct Reduction<S, C, A> {
    reducer: DynReducer<S, C, A>,
    actions: UnboundedSender<A>,
    states: UnboundedSender<Arc<S>>,
    trace_changes: bool,
}

impl<S, C, A> Reduction<S, C, A>
where
    S: Send + Sync + 'static,
    C: fmt::Debug + Send + 'static,
    A: Send + 'static,
{
    /// Ends with `Ok` when the change stream ends, or with the first fatal
    /// error: a reducer failure or one reported by another task.
    async fn run(
        self,
        initial: Arc<S>,
        mut changes: BoxStream<'static, C>,
        mut fatal: UnboundedReceiver<KnotError>,
    ) -> Result<()> {
        let mut current = initial;
        let _ = self.states.unbounded_send(current.clone());

        loop {
            tokio::select! {
                biased;
                Some(err) = fatal.next() => return Err(err),
                next = changes.next() => {
                    let Some(change) = next else { return Ok(()) };
                    if self.trace_changes {
                        debug!(?change, "reducing change");
                    }
                    let reduced = panic::catch_unwind(AssertUnwindSafe(|| (self.reducer)(&current, change)))
                        .unwrap_or_else(|panic| Err(KnotError::panicked("reducer", &*panic)));
                    let (next, actions) = reduced?.into_parts();
                    for action in actions {
                        let _ = self.actions.unbounded_send(action);
                    }
                    if !Arc::ptr_eq(&next, &current) {
                        current = next;
                        let _ = self.states.unbounded_send(current.clone());
                    }
                }
            }
        }
    }
}
