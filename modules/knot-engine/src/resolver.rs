//! Action resolution: turning emitted actions back into changes.
//!
//! Every action coming off the action channel is offered to each resolver in
//! registration order. A resolver that accepts it returns a stream of changes
//! which is driven in its own task; those changes re-enter the pipeline
//! through the same intake as external changes. Actions nobody accepts are
//! dropped.

use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use futures::channel::mpsc::UnboundedSender;
use futures::stream::BoxStream;
use futures::{FutureExt, Stream, StreamExt};
use tokio::task::{AbortHandle, JoinSet};
use tracing::{error, trace, Instrument};

use crate::error::{panic_reason, KnotError};

/// What happens when a resolver receives an action while an earlier
/// resolution of the same resolver is still running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Every resolution runs to completion.
    #[default]
    Flatten,
    /// The new action cancels the in-flight resolution.
    Switch,
}

type Handler<A, C> =
    Arc<dyn Fn(&A) -> Option<BoxStream<'static, anyhow::Result<C>>> + Send + Sync>;

/// A registered action handler.
pub struct Resolver<A, C> {
    name: String,
    strategy: Strategy,
    handler: Handler<A, C>,
}

impl<A, C> Clone for Resolver<A, C> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            strategy: self.strategy,
            handler: self.handler.clone(),
        }
    }
}

impl<A, C> fmt::Debug for Resolver<A, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("name", &self.name)
            .field("strategy", &self.strategy)
            .finish()
    }
}

impl<A: 'static, C: Send + 'static> Resolver<A, C> {
    /// Resolver backed by a stream per accepted action. `select` picks the
    /// actions this resolver handles and extracts what `run` needs.
    pub fn streaming<X, St>(
        name: impl Into<String>,
        strategy: Strategy,
        select: impl Fn(&A) -> Option<X> + Send + Sync + 'static,
        run: impl Fn(X) -> St + Send + Sync + 'static,
    ) -> Self
    where
        St: Stream<Item = anyhow::Result<C>> + Send + 'static,
    {
        Self {
            name: name.into(),
            strategy,
            handler: Arc::new(move |action: &A| select(action).map(|input| run(input).boxed())),
        }
    }

    /// Resolver that produces exactly one change per accepted action.
    pub fn single<X, Fut>(
        name: impl Into<String>,
        strategy: Strategy,
        select: impl Fn(&A) -> Option<X> + Send + Sync + 'static,
        run: impl Fn(X) -> Fut + Send + Sync + 'static,
    ) -> Self
    where
        Fut: Future<Output = anyhow::Result<C>> + Send + 'static,
    {
        Self::streaming(name, strategy, select, move |input| run(input).into_stream())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }
}

/// Offers every action to the resolvers until the action stream ends, then
/// lets in-flight resolutions finish.
pub(crate) async fn dispatch<A, C>(
    mut actions: BoxStream<'static, A>,
    resolvers: Vec<Resolver<A, C>>,
    intake: UnboundedSender<C>,
    fatal: UnboundedSender<KnotError>,
) where
    A: fmt::Debug + Send + 'static,
    C: Send + 'static,
{
    let mut running = JoinSet::new();
    let mut in_flight: Vec<Option<AbortHandle>> = resolvers.iter().map(|_| None).collect();

    loop {
        tokio::select! {
            next = actions.next() => {
                let Some(action) = next else { break };
                let mut accepted = false;
                for (slot, resolver) in resolvers.iter().enumerate() {
                    let selected = panic::catch_unwind(AssertUnwindSafe(|| (resolver.handler)(&action)));
                    let resolution = match selected {
                        Ok(Some(resolution)) => resolution,
                        Ok(None) => continue,
                        Err(panic) => {
                            let reason = format!("select panicked: {}", panic_reason(&*panic));
                            error!(resolver = %resolver.name, %reason, "resolver failed");
                            let _ = fatal.unbounded_send(KnotError::Resolver {
                                resolver: resolver.name.clone(),
                                reason,
                            });
                            return;
                        }
                    };
                    accepted = true;
                    trace!(resolver = %resolver.name, ?action, "resolving action");

                    if resolver.strategy == Strategy::Switch {
                        if let Some(previous) = in_flight[slot].take() {
                            trace!(resolver = %resolver.name, "cancelling in-flight resolution");
                            previous.abort();
                        }
                    }
                    let task = resolve(
                        resolver.name.clone(),
                        resolution,
                        intake.clone(),
                        fatal.clone(),
                    );
                    let abort = running.spawn(task.in_current_span());
                    if resolver.strategy == Strategy::Switch {
                        in_flight[slot] = Some(abort);
                    }
                }
                if !accepted {
                    trace!(?action, "no resolver for action, dropping it");
                }
            }
            Some(_) = running.join_next(), if !running.is_empty() => {}
        }
    }

    while running.join_next().await.is_some() {}
}

async fn resolve<C: Send + 'static>(
    name: String,
    resolution: BoxStream<'static, anyhow::Result<C>>,
    intake: UnboundedSender<C>,
    fatal: UnboundedSender<KnotError>,
) {
    let forward = async {
        let mut resolution = resolution;
        while let Some(outcome) = resolution.next().await {
            match outcome {
                Ok(change) => {
                    if intake.unbounded_send(change).is_err() {
                        return;
                    }
                }
                Err(err) => {
                    error!(resolver = %name, error = %format!("{err:#}"), "resolver failed");
                    let _ = fatal.unbounded_send(KnotError::resolver(&name, &err));
                    return;
                }
            }
        }
    };

    if let Err(panic) = AssertUnwindSafe(forward).catch_unwind().await {
        let reason = format!("resolution panicked: {}", panic_reason(&*panic));
        error!(resolver = %name, %reason, "resolver failed");
        let _ = fatal.unbounded_send(KnotError::Resolver { resolver: name, reason });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use futures::channel::mpsc;
    use futures::stream;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum Action {
        Fetch(u32),
        Track,
    }

    fn fetcher(strategy: Strategy, delay_ms: u64) -> Resolver<Action, u32> {
        Resolver::single(
            "fetch",
            strategy,
            |action: &Action| match action {
                Action::Fetch(id) => Some(*id),
                Action::Track => None,
            },
            move |id| async move {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                Ok(id)
            },
        )
    }

    async fn run(resolvers: Vec<Resolver<Action, u32>>, actions: Vec<Action>) -> (Vec<u32>, Vec<KnotError>) {
        let (intake_tx, intake_rx) = mpsc::unbounded();
        let (fatal_tx, fatal_rx) = mpsc::unbounded();
        dispatch(stream::iter(actions).boxed(), resolvers, intake_tx, fatal_tx).await;
        (intake_rx.collect().await, fatal_rx.collect().await)
    }

    #[tokio::test]
    async fn flatten_lets_every_resolution_finish() {
        let (mut changes, errors) = run(
            vec![fetcher(Strategy::Flatten, 20)],
            vec![Action::Fetch(1), Action::Fetch(2), Action::Fetch(3)],
        )
        .await;
        changes.sort_unstable();
        assert_eq!(changes, vec![1, 2, 3]);
        assert!(errors.is_empty());
    }

    #[tokio::test]
    async fn switch_cancels_the_in_flight_resolution() {
        let (changes, _) = run(
            vec![fetcher(Strategy::Switch, 50)],
            vec![Action::Fetch(1), Action::Fetch(2), Action::Fetch(3)],
        )
        .await;
        assert_eq!(changes, vec![3]);
    }

    #[tokio::test]
    async fn unhandled_actions_are_dropped() {
        let (changes, errors) = run(vec![fetcher(Strategy::Flatten, 0)], vec![Action::Track]).await;
        assert!(changes.is_empty());
        assert!(errors.is_empty());
    }

    #[tokio::test]
    async fn resolvers_see_actions_in_emission_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        let recorder = Resolver::single(
            "record",
            Strategy::Flatten,
            move |action: &Action| {
                log.lock().unwrap().push(action.clone());
                None::<()>
            },
            |_| async { Ok(0) },
        );

        run(
            vec![recorder],
            vec![Action::Fetch(1), Action::Track, Action::Fetch(2)],
        )
        .await;
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Action::Fetch(1), Action::Track, Action::Fetch(2)]
        );
    }

    #[tokio::test]
    async fn failures_become_resolver_errors() {
        let failing = Resolver::<Action, u32>::single(
            "fetch",
            Strategy::Flatten,
            |_| Some(()),
            |_| async { Err(anyhow::anyhow!("timeout")) },
        );
        let (changes, errors) = run(vec![failing], vec![Action::Fetch(1)]).await;
        assert!(changes.is_empty());
        assert_eq!(
            errors,
            vec![KnotError::Resolver {
                resolver: "fetch".into(),
                reason: "timeout".into()
            }]
        );
    }

    #[tokio::test]
    async fn panicking_select_stops_dispatch() {
        let picky = Resolver::<Action, u32>::single(
            "picky",
            Strategy::Flatten,
            |action: &Action| match action {
                Action::Fetch(7) => panic!("cannot select 7"),
                Action::Fetch(id) => Some(*id),
                Action::Track => None,
            },
            |id| async move { Ok(id) },
        );
        let (changes, errors) = run(
            vec![picky],
            vec![Action::Fetch(1), Action::Fetch(7), Action::Fetch(2)],
        )
        .await;
        assert!(!changes.contains(&2));
        assert_eq!(
            errors,
            vec![KnotError::Resolver {
                resolver: "picky".into(),
                reason: "select panicked: cannot select 7".into()
            }]
        );
    }

    async fn explode(_: ()) -> anyhow::Result<u32> {
        panic!("socket closed")
    }

    #[tokio::test]
    async fn panicking_resolution_keeps_its_message() {
        let broken = Resolver::<Action, u32>::single(
            "broken",
            Strategy::Flatten,
            |_| Some(()),
            explode,
        );
        let (_, errors) = run(vec![broken], vec![Action::Fetch(1)]).await;
        assert_eq!(
            errors,
            vec![KnotError::Resolver {
                resolver: "broken".into(),
                reason: "resolution panicked: socket closed".into()
            }]
        );
    }
}
