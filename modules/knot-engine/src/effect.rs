//! The result of one reduction step: next state plus emitted actions.

use std::ops::Add;
use std::sync::Arc;

use crate::message::{Erased, Message};

/// Next state and the actions a reducer wants performed.
///
/// The state is always present. Actions keep the order in which they were
/// added and are pushed to the action channel in that order before the state
/// is delivered.
#[derive(Debug)]
pub struct Effect<S, A> {
    state: Arc<S>,
    actions: Vec<A>,
}

impl<S, A> Effect<S, A> {
    /// An effect without actions.
    ///
    /// Passing the `Arc` the reducer received (`state.clone()`) keeps the
    /// state identity, which suppresses a new emission downstream.
    pub fn only(state: impl Into<Arc<S>>) -> Self {
        Self {
            state: state.into(),
            actions: Vec::new(),
        }
    }

    /// Appends one action.
    pub fn with(mut self, action: A) -> Self {
        self.actions.push(action);
        self
    }

    /// Appends an action if there is one; `None` leaves the effect unchanged.
    pub fn with_maybe(self, action: Option<A>) -> Self {
        match action {
            Some(action) => self.with(action),
            None => self,
        }
    }

    /// Appends every action in iteration order.
    pub fn with_all(mut self, actions: impl IntoIterator<Item = A>) -> Self {
        self.actions.extend(actions);
        self
    }

    pub fn state(&self) -> &Arc<S> {
        &self.state
    }

    pub fn actions(&self) -> &[A] {
        &self.actions
    }

    pub fn into_parts(self) -> (Arc<S>, Vec<A>) {
        (self.state, self.actions)
    }
}

impl<S> Effect<S, Erased> {
    /// Appends a typed action to an effect of a composite knot.
    pub fn emit<T: Message>(self, action: T) -> Self {
        self.with(Erased::new(action))
    }
}

impl<S, A> Add<A> for Effect<S, A> {
    type Output = Effect<S, A>;

    fn add(self, action: A) -> Self::Output {
        self.with(action)
    }
}

impl<S, A> From<Arc<S>> for Effect<S, A> {
    fn from(state: Arc<S>) -> Self {
        Self::only(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum Action {
        Fetch,
        Track(&'static str),
    }

    #[test]
    fn combining_preserves_action_order() {
        let effect = Effect::<u32, Action>::only(1u32)
            + Action::Fetch
            + Action::Track("a")
            + Action::Track("b");

        assert_eq!(
            effect.actions(),
            &[Action::Fetch, Action::Track("a"), Action::Track("b")]
        );
    }

    #[test]
    fn combination_is_associative() {
        let left = (Effect::<u32, Action>::only(1u32) + Action::Fetch)
            .with_all([Action::Track("a"), Action::Track("b")]);
        let right = Effect::<u32, Action>::only(1u32)
            .with(Action::Fetch)
            .with(Action::Track("a"))
            .with(Action::Track("b"));

        assert_eq!(left.actions(), right.actions());
    }

    #[test]
    fn absent_action_is_a_no_op() {
        let effect = Effect::<u32, Action>::only(7u32).with_maybe(None);
        assert!(effect.actions().is_empty());
        assert_eq!(**effect.state(), 7);

        let effect = effect.with_maybe(Some(Action::Fetch));
        assert_eq!(effect.actions(), &[Action::Fetch]);
    }

    #[test]
    fn only_keeps_shared_state_identity() {
        let state = Arc::new(String::from("idle"));
        let effect = Effect::<String, Action>::only(state.clone());
        assert!(Arc::ptr_eq(effect.state(), &state));
    }

    #[test]
    fn emit_erases_typed_actions() {
        #[derive(Debug, Clone)]
        struct Fetch(u32);

        let effect = Effect::<u32, Erased>::only(0u32).emit(Fetch(3));
        let (_, actions) = effect.into_parts();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].downcast_ref::<Fetch>().map(|f| f.0), Some(3));
    }
}
