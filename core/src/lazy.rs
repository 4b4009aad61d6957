//! Thread-safe deferred construction.
//!
//! # Design
//! The value is published through a `OnceLock`, so every read after the
//! first successful construction is a single atomic load. The `init` mutex
//! is only taken while the slot is empty: it serializes factory runs so that
//! concurrent first callers do not all build the value.
//!
//! A failing factory is not cached. The error goes back to the caller that
//! ran it and the next `get()` tries again.

use std::sync::{Mutex, OnceLock, PoisonError};

use tracing::debug;

use crate::error::{BoxError, Result, TransportError};

/// Boxed factory, the default when the closure type cannot be named.
pub type Factory<T> = Box<dyn Fn() -> std::result::Result<T, BoxError> + Send + Sync>;

pub struct LazyValue<T, F = Factory<T>> {
    value: OnceLock<T>,
    init: Mutex<()>,
    factory: F,
}

impl<T, F> LazyValue<T, F>
where
    F: Fn() -> std::result::Result<T, BoxError>,
{
    /// `const` so a `fn`-pointer factory can back a `static`.
    pub const fn new(factory: F) -> Self {
        Self {
            value: OnceLock::new(),
            init: Mutex::new(()),
            factory,
        }
    }

    /// Return the value, constructing it on first access.
    pub fn get(&self) -> Result<&T> {
        if let Some(value) = self.value.get() {
            return Ok(value);
        }

        let _guard = self.init.lock().unwrap_or_else(PoisonError::into_inner);
        // Another caller may have finished while we waited for the guard.
        if let Some(value) = self.value.get() {
            return Ok(value);
        }

        debug!(type_name = std::any::type_name::<T>(), "constructing lazy value");
        let built = (self.factory)().map_err(TransportError::FactoryFailure)?;
        Ok(self.value.get_or_init(|| built))
    }

    pub fn get_if_ready(&self) -> Option<&T> {
        self.value.get()
    }

    pub fn is_initialized(&self) -> bool {
        self.value.get().is_some()
    }
}

impl<T> LazyValue<T> {
    pub fn boxed<F>(factory: F) -> Self
    where
        F: Fn() -> std::result::Result<T, BoxError> + Send + Sync + 'static,
    {
        LazyValue::new(Box::new(factory) as Factory<T>)
    }
}

impl<T: std::fmt::Debug, F> std::fmt::Debug for LazyValue<T, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyValue").field("value", &self.value.get()).finish()
    }
}
