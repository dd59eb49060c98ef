//! Contexts: isolated units of guest execution
//!
//! A context owns the per-language state of every language used in it, the
//! materialized slot values and the bookkeeping of the threads that entered
//! it. Its lifecycle:
//!
//! ```text
//! Uninitialized ──▶ SingleThreaded ──▶ MultiThreaded
//!       │                 │                  │
//!       └─────────────────┴──────────────────┴──▶ Closing ──▶ Closed
//! ```
//!
//! - `admission`: entering and leaving, thread admission
//! - `lifecycle`: language initialization, finalization, disposal and close
//! - `patch`: reuse of pre-initialized contexts

pub(crate) mod admission;
pub(crate) mod lifecycle;
pub(crate) mod patch;

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::ThreadId;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, ReentrantMutex, RwLock};

use crate::config::ContextConfig;
use crate::engine::{Engine, EngineInner};
use crate::error::{Error, Result};
use crate::language::{Language, LanguageHandle};
use crate::liveness::{ContextRef, EngineRef};
use crate::locals::storage::SlotStorage;
use crate::safepoint::Safepoint;
use crate::value::{Bindings, Value};

pub(crate) use admission::{EnterKind, EnteredFrame};
pub(crate) use lifecycle::{CloseMode, LanguageContext, Lifecycle};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Observable state of a context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextPhase {
    /// No thread entered yet
    Uninitialized,
    /// Exactly one thread was admitted so far
    SingleThreaded,
    /// A second distinct thread was admitted
    MultiThreaded,
    /// A thread is closing the context
    Closing,
    /// The context is closed
    Closed,
}

#[derive(Debug)]
pub(crate) struct ThreadInfo {
    pub(crate) id: ThreadId,
    pub(crate) name: String,
    /// Active entries, explicit and implicit
    pub(crate) entered: usize,
    /// Active explicit entries through a `ContextGuard`
    pub(crate) explicit: usize,
    /// Polyglot thread that completed and was disposed
    pub(crate) retired: bool,
}

#[derive(Debug)]
pub(crate) struct ContextState {
    /// Every thread ever admitted, in admission order
    pub(crate) threads: Vec<ThreadInfo>,
    pub(crate) multi_threaded: bool,
    pub(crate) closed: bool,
    pub(crate) closing_thread: Option<ThreadId>,
    /// A cancel was requested from inside; close on the outermost leave
    pub(crate) close_on_leave: bool,
    pub(crate) lifecycle: Lifecycle,
    /// Started polyglot threads that did not finish yet
    pub(crate) polyglot_running: Vec<ThreadId>,
    pub(crate) pre_initialized: bool,
}

impl ContextState {
    fn new(pre_initialized: bool) -> Self {
        Self {
            threads: Vec::new(),
            multi_threaded: false,
            closed: false,
            closing_thread: None,
            close_on_leave: false,
            lifecycle: Lifecycle::Active,
            polyglot_running: Vec::new(),
            pre_initialized,
        }
    }

    pub(crate) fn thread(&self, id: ThreadId) -> Option<&ThreadInfo> {
        self.threads.iter().find(|t| t.id == id)
    }

    pub(crate) fn thread_mut(&mut self, id: ThreadId) -> Option<&mut ThreadInfo> {
        self.threads.iter_mut().find(|t| t.id == id)
    }

    /// Whether a thread other than `me` currently executes in the context
    pub(crate) fn other_thread_active(&self, me: ThreadId) -> bool {
        self.threads.iter().any(|t| t.id != me && t.entered > 0)
    }

    pub(crate) fn any_thread_active(&self) -> bool {
        self.threads.iter().any(|t| t.entered > 0)
    }

    /// Started polyglot threads other than `me` that did not finish yet
    pub(crate) fn other_polyglot_running(&self, me: ThreadId) -> Vec<ThreadId> {
        self.polyglot_running.iter().copied().filter(|t| *t != me).collect()
    }
}

pub(crate) struct ContextInner {
    pub(crate) id: ContextId,
    pub(crate) engine: Arc<EngineInner>,
    /// Held while the context is open; taken on close
    pub(crate) engine_ref: Mutex<Option<EngineRef>>,
    pub(crate) config: RwLock<ContextConfig>,
    /// Number of live `ContextRef`s
    pub(crate) refs: AtomicUsize,
    /// Serializes thread admission and language initialization
    pub(crate) admission: ReentrantMutex<()>,
    pub(crate) state: Mutex<ContextState>,
    /// Signalled on leave, thread completion, close, cancel and interrupt
    pub(crate) changed: Condvar,
    pub(crate) safepoint: Safepoint,
    pub(crate) languages: Vec<LanguageContext>,
    pub(crate) storage: SlotStorage,
    pub(crate) bindings: Mutex<serde_json::Map<String, serde_json::Value>>,
}

impl ContextInner {
    pub(crate) fn new(
        engine: &Arc<EngineInner>,
        config: ContextConfig,
        pre_initialized: bool,
    ) -> Arc<Self> {
        let id = ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed));
        let languages = engine
            .registrations()
            .iter()
            .enumerate()
            .map(|(index, registration)| LanguageContext::new(index, registration.id()))
            .collect();
        tracing::debug!(context = %id, engine = %engine.id, pre_initialized, "context created");
        Arc::new(Self {
            id,
            engine: engine.clone(),
            engine_ref: Mutex::new(None),
            config: RwLock::new(config),
            refs: AtomicUsize::new(0),
            admission: ReentrantMutex::new(()),
            state: Mutex::new(ContextState::new(pre_initialized)),
            changed: Condvar::new(),
            safepoint: Safepoint::default(),
            languages,
            storage: SlotStorage::new(),
            bindings: Mutex::new(serde_json::Map::new()),
        })
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub(crate) fn phase(&self) -> ContextPhase {
        let state = self.state.lock();
        if state.closed {
            ContextPhase::Closed
        } else if state.closing_thread.is_some() {
            ContextPhase::Closing
        } else if state.multi_threaded {
            ContextPhase::MultiThreaded
        } else if state.threads.is_empty() {
            ContextPhase::Uninitialized
        } else {
            ContextPhase::SingleThreaded
        }
    }

    pub(crate) fn language(&self, index: usize) -> Result<&LanguageContext> {
        self.languages
            .get(index)
            .ok_or_else(|| Error::internal(format!("no language at index {index}")))
    }

    /// Languages whose context finished `initialize_context`, in dependency order
    pub(crate) fn initialized_languages(&self) -> Vec<&LanguageContext> {
        self.languages.iter().filter(|l| l.is_initialized()).collect()
    }
}

/// Handle of a context that does not keep it reachable
#[derive(Clone)]
pub struct ContextHandle {
    id: ContextId,
    inner: Weak<ContextInner>,
}

impl ContextHandle {
    pub(crate) fn new(inner: &Arc<ContextInner>) -> Self {
        Self {
            id: inner.id,
            inner: Arc::downgrade(inner),
        }
    }

    /// Context identity
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Whether the context was closed or collected
    pub fn is_closed(&self) -> bool {
        self.inner.upgrade().is_none_or(|inner| inner.is_closed())
    }

    /// Current phase; `Closed` once the context is gone
    pub fn phase(&self) -> ContextPhase {
        self.inner
            .upgrade()
            .map_or(ContextPhase::Closed, |inner| inner.phase())
    }

    pub(crate) fn upgrade(&self) -> Result<Arc<ContextInner>> {
        self.inner
            .upgrade()
            .filter(|inner| !inner.is_closed())
            .ok_or_else(Error::closed)
    }
}

impl PartialEq for ContextHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ContextHandle {}

impl fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ContextHandle").field(&self.id).finish()
    }
}

/// Embedder handle of a context
///
/// Every clone keeps the context reachable. Once the last clone and every
/// value, binding and error derived from it are dropped, the engine closes
/// the context in the background.
#[derive(Clone)]
pub struct Context {
    reference: ContextRef,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id())
            .field("phase", &self.phase())
            .finish()
    }
}

impl Context {
    pub(crate) fn from_inner(inner: &Arc<ContextInner>) -> Self {
        Self {
            reference: ContextRef::new(inner),
        }
    }

    fn inner(&self) -> &Arc<ContextInner> {
        self.reference.context()
    }

    /// Context identity
    pub fn id(&self) -> ContextId {
        self.reference.id()
    }

    /// Handle that does not keep the context reachable
    pub fn handle(&self) -> ContextHandle {
        self.reference.handle()
    }

    /// Engine of the context
    pub fn engine(&self) -> Engine {
        Engine::from_inner(&self.inner().engine)
    }

    /// Current phase
    pub fn phase(&self) -> ContextPhase {
        self.inner().phase()
    }

    /// Whether the context is closed
    pub fn is_closed(&self) -> bool {
        self.inner().is_closed()
    }

    /// Enter the context on the calling thread until the guard is dropped
    ///
    /// # Errors
    ///
    /// Fails if the context is closed or cancelled, or if a language denies
    /// access for the calling thread.
    pub fn enter(&self) -> Result<ContextGuard> {
        let frame = self.inner().enter(EnterKind::Explicit)?;
        Ok(ContextGuard { frame })
    }

    /// Initialize a language in the context
    ///
    /// Returns `false` if the language was already initialized.
    ///
    /// # Errors
    ///
    /// Fails for unknown or not permitted languages and with any error of the
    /// language's creation hooks.
    pub fn initialize(&self, language_id: &str) -> Result<bool> {
        let inner = self.inner();
        let index = inner.permitted_language(language_id)?;
        let _frame = inner.enter(EnterKind::Implicit)?;
        inner.initialize_language(index)
    }

    /// Evaluate guest source with a language
    ///
    /// # Errors
    ///
    /// Returns the language's error, bound to this context, or
    /// `Error::Cancelled` / `Error::Interrupted`.
    pub fn eval(&self, language_id: &str, source: &str) -> Result<Value> {
        let inner = self.inner();
        let result = (|| {
            let index = inner.permitted_language(language_id)?;
            let _frame = inner.enter(EnterKind::Implicit)?;
            inner.initialize_language(index)?;
            inner.safepoint.poll()?;
            inner.language(index)?.eval(source)
        })();
        match result {
            Ok(value) => Ok(Value::new(value, self.reference.clone())),
            Err(e) => Err(e.bind_context(&self.reference)),
        }
    }

    /// Look up the language instance serving this context
    ///
    /// Initializes the language if necessary.
    ///
    /// # Errors
    ///
    /// Fails if the language cannot be initialized or is not of type `L`.
    pub fn language<L: Language>(&self, language_id: &str) -> Result<LanguageHandle<L>> {
        let inner = self.inner();
        let index = inner.permitted_language(language_id)?;
        {
            let _frame = inner.enter(EnterKind::Implicit)?;
            inner.initialize_language(index)?;
        }
        let language = inner.language(index)?.instance()?.downcast::<L>()?;
        Ok(LanguageHandle::new(language, EngineRef::new(&inner.engine)))
    }

    /// Polyglot bindings shared by all languages of the context
    ///
    /// # Errors
    ///
    /// Fails if the context is closed.
    pub fn polyglot_bindings(&self) -> Result<Bindings> {
        if self.is_closed() {
            return Err(Error::closed());
        }
        Ok(Bindings::new(self.reference.clone()))
    }

    /// Interrupt all threads executing in the context
    ///
    /// Waits until no thread executes in the context. A zero timeout waits
    /// without bound.
    ///
    /// # Errors
    ///
    /// Returns `Error::InterruptTimeout` if threads are still executing after
    /// the timeout, and `Error::IllegalState` if called from a thread that
    /// executes in the context.
    pub fn interrupt(&self, timeout: Duration) -> Result<()> {
        self.inner().interrupt(timeout)
    }

    /// Close the context
    ///
    /// A calling thread that never entered the context is initialized and
    /// then disposed by every initialized language; the thread access check
    /// is not consulted for it.
    ///
    /// # Errors
    ///
    /// Fails if the context is entered on the calling thread or executing on
    /// another thread, if a polyglot thread is still running, or with any
    /// error of the finalization and disposal hooks.
    pub fn close(&self) -> Result<()> {
        self.inner().close(CloseMode::Normal)
    }

    /// Cancel all executions and close the context
    ///
    /// When called from a thread executing in the context, the context is
    /// marked cancelled and closes once that thread leaves it.
    ///
    /// # Errors
    ///
    /// Fails if executing threads do not stop within the configured cancel
    /// timeout, or with any error of the finalization and disposal hooks.
    pub fn close_cancel(&self) -> Result<()> {
        self.inner().close(CloseMode::Cancel)
    }
}

/// Explicit entry of a context on the current thread
///
/// Leaves the context when dropped.
pub struct ContextGuard {
    frame: EnteredFrame,
}

impl ContextGuard {
    /// Entered context
    pub fn context(&self) -> ContextHandle {
        self.frame.handle()
    }

    /// Leave the context
    pub fn leave(self) {
        drop(self);
    }
}

impl fmt::Debug for ContextGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ContextGuard").field(&self.frame.handle().id()).finish()
    }
}

/// Builder for a context with options
pub struct ContextBuilder {
    engine: Engine,
    config: ContextConfig,
}

impl ContextBuilder {
    pub(crate) fn new(engine: Engine) -> Self {
        Self {
            engine,
            config: ContextConfig::default(),
        }
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: ContextConfig) -> Self {
        self.config = config;
        self
    }

    /// Add an option visible to languages through `Env::options`
    pub fn option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config = self.config.with_option(key, value);
        self
    }

    /// Restrict the languages that may be used
    pub fn permitted_languages<I, S>(mut self, languages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config = self.config.with_permitted_languages(languages);
        self
    }

    /// Create the context
    ///
    /// # Errors
    ///
    /// Fails if the engine is closed.
    pub fn build(self) -> Result<Context> {
        let inner = self.engine.inner().create_context(self.config)?;
        Ok(Context::from_inner(&inner))
    }
}
