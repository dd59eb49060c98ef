//! Values and bindings handed to the embedder
//!
//! Both keep their context reachable: a context is not collected while a
//! value produced by it or a bindings handle for it is alive.

use std::fmt;

use crate::context::ContextHandle;
use crate::error::{Error, Result};
use crate::liveness::ContextRef;

/// Result of a guest evaluation
#[derive(Clone)]
pub struct Value {
    value: serde_json::Value,
    context: ContextRef,
}

impl Value {
    pub(crate) fn new(value: serde_json::Value, context: ContextRef) -> Self {
        Self { value, context }
    }

    /// Context that produced the value
    pub fn context(&self) -> ContextHandle {
        self.context.handle()
    }

    /// JSON view of the value
    pub fn as_json(&self) -> &serde_json::Value {
        &self.value
    }

    /// Take the JSON value, releasing the context
    pub fn into_json(self) -> serde_json::Value {
        self.value
    }

    /// Integer value, if it is one
    pub fn as_i64(&self) -> Option<i64> {
        self.value.as_i64()
    }

    /// String value, if it is one
    pub fn as_str(&self) -> Option<&str> {
        self.value.as_str()
    }

    /// Whether the value is null
    pub fn is_null(&self) -> bool {
        self.value.is_null()
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Value")
            .field("value", &self.value)
            .field("context", &self.context.id())
            .finish()
    }
}

/// Polyglot bindings of a context
#[derive(Clone)]
pub struct Bindings {
    context: ContextRef,
}

impl Bindings {
    pub(crate) fn new(context: ContextRef) -> Self {
        Self { context }
    }

    fn check_open(&self) -> Result<()> {
        if self.context.context().is_closed() {
            return Err(Error::closed());
        }
        Ok(())
    }

    /// Read a binding
    ///
    /// # Errors
    ///
    /// Fails if the context is closed.
    pub fn get(&self, name: &str) -> Result<Option<Value>> {
        self.check_open()?;
        let value = self.context.context().bindings.lock().get(name).cloned();
        Ok(value.map(|v| Value::new(v, self.context.clone())))
    }

    /// Write a binding, returning the previous value
    ///
    /// # Errors
    ///
    /// Fails if the context is closed.
    pub fn put(&self, name: impl Into<String>, value: serde_json::Value) -> Result<Option<serde_json::Value>> {
        self.check_open()?;
        Ok(self.context.context().bindings.lock().insert(name.into(), value))
    }

    /// Remove a binding
    ///
    /// # Errors
    ///
    /// Fails if the context is closed.
    pub fn remove(&self, name: &str) -> Result<Option<serde_json::Value>> {
        self.check_open()?;
        Ok(self.context.context().bindings.lock().remove(name))
    }

    /// Names of all bindings, sorted
    ///
    /// # Errors
    ///
    /// Fails if the context is closed.
    pub fn keys(&self) -> Result<Vec<String>> {
        self.check_open()?;
        Ok(self.context.context().bindings.lock().keys().cloned().collect())
    }
}

impl fmt::Debug for Bindings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Bindings").field(&self.context.id()).finish()
    }
}
