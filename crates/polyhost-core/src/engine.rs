//! Engine: language registry, context factory and reaper
//!
//! ```text
//!  EngineBuilder ──build──▶ Engine ──create_context──▶ Context
//!       │                     │
//!       │ languages (dependency order)      reaper thread
//!       │ instruments (lazy)                  ├─ closes unreachable contexts
//!       │ pre-initialized context             └─ disposes the unreachable engine
//! ```
//!
//! Languages are stored in dependency order: every language comes after all
//! languages it depends on. Close and disposal walk that order backwards.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, ThreadId};

use crossbeam_channel::{Sender, unbounded};
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};

use crate::config::{ContextConfig, EngineConfig};
use crate::context::{CloseMode, Context, ContextBuilder, ContextHandle, ContextId, ContextInner};
use crate::error::{Error, Result};
use crate::instrument::{ExecutionListener, Instrument, InstrumentEntry, InstrumentHandle, InstrumentRegistration};
use crate::language::{LanguageInstance, LanguageRegistration};
use crate::liveness::{self, DisposalSignal, EngineRef, ReaperCommand, WeakEngine};
use crate::locals::registry::OwnerScope;
use crate::locals::storage::ExactTypes;

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineId(u64);

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "engine#{}", self.0)
    }
}

pub(crate) struct EngineInner {
    pub(crate) id: EngineId,
    pub(crate) config: EngineConfig,
    /// Registrations in dependency order
    languages: Vec<Arc<LanguageRegistration>>,
    language_index: HashMap<String, usize>,
    /// Indices of the direct dependencies of every language
    dependencies: Vec<Vec<usize>>,
    shared_languages: Vec<OnceCell<LanguageInstance>>,
    instruments: Vec<InstrumentEntry>,
    instrument_index: HashMap<String, usize>,
    /// Open contexts created for the embedder
    contexts: Mutex<Vec<Arc<ContextInner>>>,
    preinitialized: Mutex<Option<Arc<ContextInner>>>,
    /// Stack of entered contexts per thread
    entered: DashMap<ThreadId, Vec<Arc<ContextInner>>>,
    /// Threads running a polyglot thread notification
    notifying: DashMap<ThreadId, ()>,
    pub(crate) exact_types: ExactTypes,
    pub(crate) listeners: RwLock<Vec<(u64, Arc<dyn ExecutionListener>)>>,
    /// Number of live `EngineRef`s
    pub(crate) refs: AtomicUsize,
    reaper: Sender<ReaperCommand>,
    closed: AtomicBool,
    disposal: Arc<DisposalSignal>,
}

impl EngineInner {
    pub(crate) fn registrations(&self) -> &[Arc<LanguageRegistration>] {
        &self.languages
    }

    pub(crate) fn registration(&self, index: usize) -> Result<&Arc<LanguageRegistration>> {
        self.languages
            .get(index)
            .ok_or_else(|| Error::internal(format!("no language at index {index}")))
    }

    pub(crate) fn language_index(&self, id: &str) -> Result<usize> {
        self.language_index
            .get(id)
            .copied()
            .ok_or_else(|| Error::LanguageNotFound(id.to_string()))
    }

    pub(crate) fn dependencies(&self, index: usize) -> &[usize] {
        self.dependencies.get(index).map_or(&[], Vec::as_slice)
    }

    /// Instance of a shared language, created on first use
    pub(crate) fn shared_language(self: &Arc<Self>, index: usize) -> Result<LanguageInstance> {
        let cell = self
            .shared_languages
            .get(index)
            .ok_or_else(|| Error::internal(format!("no language at index {index}")))?;
        cell.get_or_try_init(|| self.registration(index)?.instantiate(self, index, OwnerScope::Engine))
            .cloned()
    }

    /// Innermost context entered on the calling thread
    pub(crate) fn current_context(&self) -> Result<Arc<ContextInner>> {
        self.entered
            .get(&thread::current().id())
            .and_then(|stack| stack.last().cloned())
            .ok_or_else(Error::no_current_context)
    }

    pub(crate) fn push_entered(&self, thread: ThreadId, context: Arc<ContextInner>) {
        self.entered.entry(thread).or_default().push(context);
    }

    pub(crate) fn pop_entered(&self, thread: ThreadId, context: ContextId) {
        if let Some(mut stack) = self.entered.get_mut(&thread) {
            if let Some(position) = stack.iter().rposition(|c| c.id == context) {
                stack.remove(position);
            }
        }
        self.entered.remove_if(&thread, |_, stack| stack.is_empty());
    }

    pub(crate) fn is_notifying(&self, thread: ThreadId) -> bool {
        self.notifying.contains_key(&thread)
    }

    pub(crate) fn begin_notification(self: &Arc<Self>, thread: ThreadId) -> NotificationGuard {
        self.notifying.insert(thread, ());
        NotificationGuard {
            engine: self.clone(),
            thread,
        }
    }

    pub(crate) fn notify_enter(&self, context: &ContextHandle) {
        let listeners: Vec<_> = self.listeners.read().iter().map(|(_, l)| l.clone()).collect();
        for listener in listeners {
            listener.on_enter(context);
        }
    }

    pub(crate) fn notify_leave(&self, context: &ContextHandle) {
        let listeners: Vec<_> = self.listeners.read().iter().map(|(_, l)| l.clone()).collect();
        for listener in listeners {
            listener.on_leave(context);
        }
    }

    /// Create a context, reusing the pre-initialized one if it can be patched
    pub(crate) fn create_context(self: &Arc<Self>, config: ContextConfig) -> Result<Arc<ContextInner>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::illegal_state("The engine is already closed."));
        }
        let preinitialized = self.preinitialized.lock().take();
        let context = match preinitialized {
            Some(context) => {
                if context.patch(&config) {
                    context
                } else {
                    context.discard();
                    ContextInner::new(self, config, false)
                }
            }
            None => ContextInner::new(self, config, false),
        };
        *context.engine_ref.lock() = Some(EngineRef::new(self));
        self.contexts.lock().push(context.clone());
        Ok(context)
    }

    pub(crate) fn remove_context(&self, id: ContextId) {
        self.contexts.lock().retain(|c| c.id != id);
    }

    pub(crate) fn schedule_collection(&self, context: Arc<ContextInner>) {
        if self.reaper.send(ReaperCommand::Collect(context)).is_err() {
            tracing::debug!(engine = %self.id, "reaper stopped, context not collected");
        }
    }

    /// Called when the last counted reference was dropped
    pub(crate) fn released(self: &Arc<Self>) {
        if self.reaper.send(ReaperCommand::DisposeEngine(self.clone())).is_err() {
            tracing::debug!(engine = %self.id, "reaper stopped, engine not disposed");
        }
    }

    /// Close every context, then dispose instruments
    pub(crate) fn dispose(&self, cancel: bool) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mode = if cancel { CloseMode::Cancel } else { CloseMode::Normal };
        let preinitialized = self.preinitialized.lock().take();
        if let Some(context) = preinitialized {
            context.discard();
        }

        let contexts: Vec<_> = self.contexts.lock().clone();
        let mut failure = None;
        for context in contexts {
            if let Err(e) = context.close(mode) {
                tracing::warn!(engine = %self.id, context = %context.id, error = %e, "failed to close context");
                failure.get_or_insert(e);
            }
        }
        if let Some(e) = failure {
            self.closed.store(false, Ordering::Release);
            return Err(e);
        }

        for instrument in &self.instruments {
            instrument.dispose();
        }
        self.listeners.write().clear();
        self.disposal.signal();
        tracing::info!(engine = %self.id, "engine disposed");
        Ok(())
    }
}

/// Marks a thread as running a polyglot thread notification
pub(crate) struct NotificationGuard {
    engine: Arc<EngineInner>,
    thread: ThreadId,
}

impl Drop for NotificationGuard {
    fn drop(&mut self) {
        self.engine.notifying.remove(&self.thread);
    }
}

/// Languages sorted so that dependencies come first
struct LanguageOrder {
    languages: Vec<Arc<LanguageRegistration>>,
    index: HashMap<String, usize>,
    dependencies: Vec<Vec<usize>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Depth-first topological sort of the registrations
fn order_languages(registrations: Vec<LanguageRegistration>) -> Result<LanguageOrder> {
    let mut by_id = HashMap::new();
    for (i, registration) in registrations.iter().enumerate() {
        if by_id.insert(registration.id().to_string(), i).is_some() {
            return Err(Error::config(format!(
                "Language '{}' is registered more than once.",
                registration.id()
            )));
        }
    }
    for registration in &registrations {
        if let Some(missing) = registration
            .dependencies()
            .iter()
            .find(|dependency| !by_id.contains_key(dependency.as_str()))
        {
            return Err(Error::LanguageNotFound(missing.clone()));
        }
    }

    fn visit(
        i: usize,
        registrations: &[LanguageRegistration],
        by_id: &HashMap<String, usize>,
        marks: &mut [Mark],
        path: &mut Vec<usize>,
        order: &mut Vec<usize>,
    ) -> Result<()> {
        match marks[i] {
            Mark::Done => return Ok(()),
            Mark::InProgress => {
                let start = path.iter().position(|&p| p == i).unwrap_or(0);
                let cycle: Vec<&str> = path[start..]
                    .iter()
                    .chain(std::iter::once(&i))
                    .map(|&p| registrations[p].id())
                    .collect();
                return Err(Error::CyclicDependency(cycle.join(" -> ")));
            }
            Mark::Unvisited => {}
        }
        marks[i] = Mark::InProgress;
        path.push(i);
        for dependency in registrations[i].dependencies() {
            if let Some(&d) = by_id.get(dependency) {
                visit(d, registrations, by_id, marks, path, order)?;
            }
        }
        path.pop();
        marks[i] = Mark::Done;
        order.push(i);
        Ok(())
    }

    let mut marks = vec![Mark::Unvisited; registrations.len()];
    let mut path = Vec::new();
    let mut order = Vec::with_capacity(registrations.len());
    for i in 0..registrations.len() {
        visit(i, &registrations, &by_id, &mut marks, &mut path, &mut order)?;
    }

    let mut slots: Vec<Option<LanguageRegistration>> = registrations.into_iter().map(Some).collect();
    let mut languages = Vec::with_capacity(order.len());
    for i in order {
        let registration = slots[i]
            .take()
            .ok_or_else(|| Error::internal("language ordered twice"))?;
        languages.push(Arc::new(registration));
    }
    let index: HashMap<String, usize> = languages
        .iter()
        .enumerate()
        .map(|(i, l)| (l.id().to_string(), i))
        .collect();
    let dependencies = languages
        .iter()
        .map(|l| l.dependencies().iter().filter_map(|d| index.get(d).copied()).collect())
        .collect();
    Ok(LanguageOrder {
        languages,
        index,
        dependencies,
    })
}

/// Builder for an [`Engine`]
#[derive(Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    languages: Vec<LanguageRegistration>,
    instruments: Vec<InstrumentRegistration>,
    preinitialize: Vec<String>,
}

impl EngineBuilder {
    /// Use a configuration
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a language
    pub fn language(mut self, registration: LanguageRegistration) -> Self {
        self.languages.push(registration);
        self
    }

    /// Register an instrument
    pub fn instrument(mut self, registration: InstrumentRegistration) -> Self {
        self.instruments.push(registration);
        self
    }

    /// Pre-initialize a context with these languages at build time
    pub fn preinitialize<I, S>(mut self, languages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.preinitialize.extend(languages.into_iter().map(Into::into));
        self
    }

    /// Build the engine and start its reaper thread
    ///
    /// # Errors
    ///
    /// Fails for invalid configuration, duplicate ids, unknown or cyclic
    /// dependencies, and errors while pre-initializing.
    pub fn build(self) -> Result<Engine> {
        self.config.validate()?;
        let order = order_languages(self.languages)?;

        let mut instrument_index = HashMap::new();
        for (i, registration) in self.instruments.iter().enumerate() {
            if instrument_index.insert(registration.id().to_string(), i).is_some() {
                return Err(Error::config(format!(
                    "Instrument '{}' is registered more than once.",
                    registration.id()
                )));
            }
        }

        let (sender, receiver) = unbounded();
        let inner = Arc::new(EngineInner {
            id: EngineId(NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed)),
            shared_languages: order.languages.iter().map(|_| OnceCell::new()).collect(),
            languages: order.languages,
            language_index: order.index,
            dependencies: order.dependencies,
            instruments: self.instruments.into_iter().map(InstrumentEntry::new).collect(),
            instrument_index,
            contexts: Mutex::new(Vec::new()),
            preinitialized: Mutex::new(None),
            entered: DashMap::new(),
            notifying: DashMap::new(),
            exact_types: ExactTypes::new(),
            listeners: RwLock::new(Vec::new()),
            refs: AtomicUsize::new(0),
            reaper: sender,
            closed: AtomicBool::new(false),
            disposal: Arc::new(DisposalSignal::default()),
            config: self.config,
        });
        liveness::spawn_reaper(&inner.config.reaper_thread_name, receiver)?;
        let engine = Engine::from_inner(&inner);

        if !self.preinitialize.is_empty() {
            let context = ContextInner::preinitialize(&inner, &self.preinitialize)?;
            *inner.preinitialized.lock() = Some(context);
        }
        tracing::info!(
            engine = %inner.id,
            languages = inner.languages.len(),
            instruments = inner.instruments.len(),
            "engine created"
        );
        Ok(engine)
    }
}

/// Embedder handle of an engine
///
/// The engine stays alive while any clone, context, language or instrument
/// lookup refers to it. Once all are gone the reaper disposes it.
#[derive(Clone)]
pub struct Engine {
    inner: EngineRef,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("id", &self.id())
            .field("contexts", &self.live_contexts())
            .finish()
    }
}

impl Engine {
    /// Start building an engine
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    pub(crate) fn from_inner(inner: &Arc<EngineInner>) -> Self {
        Self {
            inner: EngineRef::new(inner),
        }
    }

    pub(crate) fn inner(&self) -> &Arc<EngineInner> {
        self.inner.engine()
    }

    /// Engine identity
    pub fn id(&self) -> EngineId {
        self.inner().id
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.inner().config
    }

    /// Create a context with default options
    ///
    /// # Errors
    ///
    /// Fails if the engine is closed.
    pub fn create_context(&self) -> Result<Context> {
        self.context_builder().build()
    }

    /// Start building a context with options
    pub fn context_builder(&self) -> ContextBuilder {
        ContextBuilder::new(self.clone())
    }

    /// Look up an instrument, creating it on first use
    ///
    /// # Errors
    ///
    /// Returns `Error::InstrumentNotFound` for unknown ids and any error of
    /// the instrument's constructor.
    pub fn lookup_instrument<I: Instrument>(&self, id: &str) -> Result<InstrumentHandle<I>> {
        let inner = self.inner();
        let index = *inner
            .instrument_index
            .get(id)
            .ok_or_else(|| Error::InstrumentNotFound(id.to_string()))?;
        let instrument = inner.instruments[index].lookup::<I>(inner, index)?;
        Ok(InstrumentHandle::new(instrument, self.inner.clone()))
    }

    /// Ids of the registered languages in dependency order
    pub fn languages(&self) -> Vec<String> {
        self.inner()
            .languages
            .iter()
            .map(|l| l.id().to_string())
            .collect()
    }

    /// Ids of the registered instruments
    pub fn instruments(&self) -> Vec<String> {
        self.inner()
            .instruments
            .iter()
            .map(|i| i.id().to_string())
            .collect()
    }

    /// Number of open contexts
    pub fn live_contexts(&self) -> usize {
        self.inner().contexts.lock().len()
    }

    /// Wait until every context that became unreachable so far was closed
    ///
    /// Must not be called from a language hook running on the reaper thread.
    pub fn collect(&self) {
        liveness::drain(&self.inner().reaper);
    }

    /// Observer that does not keep the engine alive
    pub fn downgrade(&self) -> WeakEngine {
        WeakEngine::new(self.inner().disposal.clone())
    }

    /// Whether the engine was closed
    pub fn is_closed(&self) -> bool {
        self.inner().closed.load(Ordering::Acquire)
    }

    /// Close all contexts and dispose the engine
    ///
    /// # Errors
    ///
    /// Fails if a context cannot be closed; the engine stays open then.
    pub fn close(&self) -> Result<()> {
        self.inner().dispose(false)
    }

    /// Cancel all executions, close all contexts and dispose the engine
    ///
    /// # Errors
    ///
    /// Fails if a context does not stop within the cancel timeout.
    pub fn close_cancel(&self) -> Result<()> {
        self.inner().dispose(true)
    }
}
