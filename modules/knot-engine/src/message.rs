//! Type-erased changes and actions for the composite engine.
//!
//! Primes register reducers and resolvers per concrete type. The composite
//! pipeline carries every change and action as an [`Erased`] envelope and
//! dispatches on the `TypeId` of the value inside it.

use std::any::{self, Any, TypeId};
use std::fmt;

/// Anything that can travel through a composite pipeline.
///
/// Implemented for every `Send + Debug + 'static` type; there is nothing to
/// implement by hand.
pub trait Message: Any + Send + fmt::Debug {
    fn key(&self) -> TypeId;
    fn type_name(&self) -> &'static str;
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

impl<T: Any + Send + fmt::Debug> Message for T {
    fn key(&self) -> TypeId {
        TypeId::of::<T>()
    }

    fn type_name(&self) -> &'static str {
        any::type_name::<T>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

/// A change or action whose concrete type is only known at runtime.
pub struct Erased {
    inner: Box<dyn Message>,
}

impl Erased {
    pub fn new<T: Message>(value: T) -> Self {
        Self {
            inner: Box::new(value),
        }
    }

    /// `TypeId` of the wrapped value (not of the box).
    pub fn key(&self) -> TypeId {
        self.inner.as_ref().key()
    }

    pub fn type_name(&self) -> &'static str {
        self.inner.as_ref().type_name()
    }

    pub fn is<T: Message>(&self) -> bool {
        self.key() == TypeId::of::<T>()
    }

    pub fn downcast_ref<T: Message>(&self) -> Option<&T> {
        self.inner.as_ref().as_any().downcast_ref::<T>()
    }

    /// Unwraps the value if it is a `T`.
    pub fn downcast<T: Message>(self) -> Option<T> {
        self.inner.into_any().downcast::<T>().ok().map(|boxed| *boxed)
    }
}

impl fmt::Debug for Erased {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.inner.as_ref(), f)
    }
}
