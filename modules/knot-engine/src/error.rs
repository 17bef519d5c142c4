//! Typed errors for engine configuration, dispatch and resolution.

use std::any::Any;

use thiserror::Error;

/// Everything that can go wrong while building, composing or running a knot.
///
/// Configuration errors are returned synchronously from the offending call.
/// Dispatch and resolver errors terminate the pipeline and are delivered once
/// to every observer of the state stream, which is why the enum is `Clone`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KnotError {
    /// No initial state was configured.
    #[error("configuration error: initial state is missing")]
    MissingInitialState,

    /// No reducer was configured (or no prime registered one).
    #[error("configuration error: reducer is missing")]
    MissingReducer,

    /// Building requires a tokio runtime to spawn the pipeline onto.
    #[error("configuration error: no tokio runtime available to run the pipeline")]
    NoRuntime,

    /// A change was emitted before `compose()`.
    #[error("configuration error: change emitted before compose()")]
    NotComposed,

    /// `compose()` was called twice, or a prime was registered after it.
    #[error("configuration error: knot is already composed")]
    AlreadyComposed,

    /// Two reducers were registered for the same concrete change type.
    #[error("configuration error: reducer for {change} is already registered")]
    DuplicateReducer { change: &'static str },

    /// No reducer is registered for the concrete type of an incoming change.
    #[error("dispatch error: no reducer registered for change {change}")]
    UnknownChange { change: String },

    /// An action resolver failed instead of mapping its failure into a change.
    #[error("resolver {resolver} failed: {reason}")]
    Resolver { resolver: String, reason: String },

    /// User code running inside the pipeline (reducer, interceptor, source)
    /// panicked.
    #[error("{stage} panicked: {reason}")]
    Panicked { stage: &'static str, reason: String },
}

impl KnotError {
    /// Configuration errors are raised at the offending call, never through
    /// the state stream.
    pub fn is_config(&self) -> bool {
        !matches!(
            self,
            Self::UnknownChange { .. } | Self::Resolver { .. } | Self::Panicked { .. }
        )
    }

    pub(crate) fn resolver(resolver: &str, err: &anyhow::Error) -> Self {
        Self::Resolver {
            resolver: resolver.to_string(),
            reason: format!("{err:#}"),
        }
    }

    pub(crate) fn panicked(stage: &'static str, payload: &(dyn Any + Send)) -> Self {
        Self::Panicked {
            stage,
            reason: panic_reason(payload),
        }
    }
}

/// The message a panic was raised with, when it carried one.
pub(crate) fn panic_reason(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, KnotError>;
