//! Per-language environment of a context

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::context::{Context, ContextHandle, Lifecycle};
use crate::engine::{Engine, EngineInner};
use crate::error::{Error, Result};
use crate::thread::PolyglotThreadBuilder;

/// Environment a language receives for one context
///
/// Cheap to clone. Two environments are equal only if they are the same
/// allocation; patching a context hands every language a new one.
#[derive(Clone)]
pub struct Env {
    inner: Arc<EnvInner>,
}

struct EnvInner {
    language_id: String,
    context: ContextHandle,
    engine: Weak<EngineInner>,
    options: BTreeMap<String, String>,
    pre_initialization: bool,
}

impl Env {
    pub(crate) fn new(
        language_id: &str,
        context: ContextHandle,
        engine: &Arc<EngineInner>,
        options: BTreeMap<String, String>,
        pre_initialization: bool,
    ) -> Self {
        Self {
            inner: Arc::new(EnvInner {
                language_id: language_id.to_string(),
                context,
                engine: Arc::downgrade(engine),
                options,
                pre_initialization,
            }),
        }
    }

    /// Id of the language this environment belongs to
    pub fn language_id(&self) -> &str {
        &self.inner.language_id
    }

    /// Context of this environment
    pub fn context(&self) -> &ContextHandle {
        &self.inner.context
    }

    /// Options of the context
    pub fn options(&self) -> &BTreeMap<String, String> {
        &self.inner.options
    }

    /// Single option value
    pub fn option(&self, key: &str) -> Option<&str> {
        self.inner.options.get(key).map(String::as_str)
    }

    /// Whether the context is being pre-initialized
    pub fn is_pre_initialization(&self) -> bool {
        self.inner.pre_initialization
    }

    /// Whether both are the same environment
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Check for pending cancellation or interruption
    ///
    /// Guest code must call this regularly in long-running loops.
    ///
    /// # Errors
    ///
    /// Returns `Error::Cancelled` or `Error::Interrupted`.
    pub fn poll_safepoint(&self) -> Result<()> {
        self.inner.context.upgrade()?.safepoint.poll()
    }

    /// Sleep that wakes up early on cancellation or interruption
    ///
    /// # Errors
    ///
    /// Returns `Error::Cancelled` or `Error::Interrupted`.
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        self.inner.context.upgrade()?.sleep(duration)
    }

    /// Prepare a polyglot thread that runs `body` inside this context
    ///
    /// The thread does not run until [`PolyglotThreadBuilder::start`] is
    /// called.
    ///
    /// # Errors
    ///
    /// Fails while the context is being disposed.
    pub fn create_thread<F>(&self, body: F) -> Result<PolyglotThreadBuilder>
    where
        F: FnOnce(&Env) -> Result<()> + Send + 'static,
    {
        let context = self.inner.context.upgrade()?;
        context.check_thread_creation()?;
        let name = context.engine.config.polyglot_thread_name.clone();
        Ok(PolyglotThreadBuilder::new(
            Arc::downgrade(&context),
            self.clone(),
            name,
            Box::new(body),
        ))
    }

    /// Create another context on the same engine
    ///
    /// # Errors
    ///
    /// Fails while this context is being finalized or disposed.
    pub fn create_context(&self) -> Result<Context> {
        let context = self.inner.context.upgrade()?;
        if context.lifecycle() != Lifecycle::Active {
            return Err(Error::illegal_state(
                "Language contexts are finalized when embedder threads are being finalized",
            ));
        }
        let engine = self.inner.engine.upgrade().ok_or_else(Error::closed)?;
        Engine::from_inner(&engine).create_context()
    }

    /// Publish a value in the polyglot bindings of the context
    ///
    /// # Errors
    ///
    /// Fails if the context is closed.
    pub fn export_symbol(&self, name: impl Into<String>, value: serde_json::Value) -> Result<()> {
        let context = self.inner.context.upgrade()?;
        context.bindings.lock().insert(name.into(), value);
        Ok(())
    }

    /// Read a value from the polyglot bindings of the context
    ///
    /// # Errors
    ///
    /// Fails if the context is closed.
    pub fn import_symbol(&self, name: &str) -> Result<Option<serde_json::Value>> {
        let context = self.inner.context.upgrade()?;
        let value = context.bindings.lock().get(name).cloned();
        Ok(value)
    }
}

impl PartialEq for Env {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Env {}

impl fmt::Debug for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Env")
            .field("language", &self.inner.language_id)
            .field("context", &self.inner.context.id())
            .field("pre_initialization", &self.inner.pre_initialization)
            .finish()
    }
}
