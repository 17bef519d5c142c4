//! Unidirectional state engine.
//!
//! A knot owns one state value. Changes flow in from callers, sources and
//! resolved actions; a reducer turns each change into the next state plus a
//! list of actions; actions are resolved asynchronously into further
//! changes; observers receive every distinct state.
//!
//! [`Knot`] is the single-pipeline form with one change type and one action
//! type. [`CompositeKnot`] lets independent primes register reducers per
//! concrete change type and composes them into one pipeline.

pub mod composite;
pub mod config;
pub mod effect;
pub mod error;
pub mod hub;
pub mod intercept;
pub mod knot;
pub mod lazy;
pub mod message;
mod pipeline;
pub mod resolver;
pub mod traits;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use composite::{CompositeBuilder, CompositeKnot, Delegate, Prime};
pub use config::KnotConfig;
pub use effect::Effect;
pub use error::{KnotError, Result};
pub use hub::StateStream;
pub use intercept::Chain;
pub use knot::{ChangeSink, Knot, KnotBuilder};
pub use lazy::{Lease, SharedLazy};
pub use message::{Erased, Message};
pub use resolver::{Resolver, Strategy};
pub use traits::Reducer;
