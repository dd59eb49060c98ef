//! Language initialization and context close
//!
//! Close runs in three stages, each over languages in reverse dependency
//! order:
//!
//! ```text
//! finalize_context (repeated until no language gets newly finalized)
//!        │
//!        ▼
//! finalize_thread ─▶ dispose_thread ─▶ dispose_context
//! ```
//!
//! Hooks run outside of every context lock so that they may read slots,
//! evaluate code or create contexts.

use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Instant;

use parking_lot::Mutex;

use crate::context::{ContextHandle, ContextInner, EnterKind};
use crate::env::Env;
use crate::error::{Error, Result};
use crate::language::{ContextPolicy, ErasedLanguage, GuestContext, LanguageInstance, ThreadRequest};
use crate::locals::registry::OwnerScope;

/// Coarse lifecycle of a context while it is being closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Active,
    /// `finalize_context` hooks are running
    Finalizing,
    /// Thread and context disposal hooks are running
    Disposing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseMode {
    Normal,
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LanguagePhase {
    NotCreated,
    Creating,
    Created,
    Initialized,
    Disposed,
}

struct LanguageState {
    phase: LanguagePhase,
    instance: Option<LanguageInstance>,
    env: Option<Env>,
    guest: Option<GuestContext>,
    multi_threading: bool,
    finalized: bool,
    initialized_threads: Vec<ThreadId>,
    finalized_threads: Vec<ThreadId>,
    disposed_threads: Vec<ThreadId>,
}

/// State of one language in one context
pub(crate) struct LanguageContext {
    pub(crate) index: usize,
    pub(crate) id: String,
    state: Mutex<LanguageState>,
}

impl LanguageContext {
    pub(crate) fn new(index: usize, id: &str) -> Self {
        Self {
            index,
            id: id.to_string(),
            state: Mutex::new(LanguageState {
                phase: LanguagePhase::NotCreated,
                instance: None,
                env: None,
                guest: None,
                multi_threading: false,
                finalized: false,
                initialized_threads: Vec::new(),
                finalized_threads: Vec::new(),
                disposed_threads: Vec::new(),
            }),
        }
    }

    fn phase(&self) -> LanguagePhase {
        self.state.lock().phase
    }

    fn set_phase(&self, phase: LanguagePhase) {
        self.state.lock().phase = phase;
    }

    fn reset(&self) {
        let mut state = self.state.lock();
        state.phase = LanguagePhase::NotCreated;
        state.instance = None;
        state.env = None;
        state.guest = None;
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.phase() == LanguagePhase::Initialized
    }

    pub(crate) fn env(&self) -> Option<Env> {
        self.state.lock().env.clone()
    }

    pub(crate) fn set_env(&self, env: Env) {
        self.state.lock().env = Some(env);
    }

    pub(crate) fn instance(&self) -> Result<LanguageInstance> {
        self.state
            .lock()
            .instance
            .clone()
            .ok_or_else(|| Error::illegal_state(format!("Language '{}' is not initialized.", self.id)))
    }

    pub(crate) fn hooks(&self) -> Option<Arc<dyn ErasedLanguage>> {
        self.state.lock().instance.as_ref().map(|i| i.hooks.clone())
    }

    /// Hooks and guest state of a created, not yet disposed language
    fn live(&self) -> Option<(Arc<dyn ErasedLanguage>, GuestContext)> {
        let state = self.state.lock();
        match state.phase {
            LanguagePhase::Created | LanguagePhase::Initialized => {
                let hooks = state.instance.as_ref()?.hooks.clone();
                Some((hooks, state.guest.clone()?))
            }
            _ => None,
        }
    }

    fn live_or_err(&self) -> Result<(Arc<dyn ErasedLanguage>, GuestContext)> {
        self.live()
            .ok_or_else(|| Error::illegal_state(format!("Language '{}' is not initialized.", self.id)))
    }

    pub(crate) fn eval(&self, source: &str) -> Result<serde_json::Value> {
        let (hooks, guest) = self.live_or_err()?;
        hooks.eval(&guest, source)
    }

    pub(crate) fn patch(&self, env: &Env) -> Result<bool> {
        let (hooks, guest) = self.live_or_err()?;
        hooks.patch_context(&guest, env)
    }

    pub(crate) fn initialize_multi_threading(&self) -> Result<()> {
        let Some((hooks, guest)) = self.live() else {
            return Ok(());
        };
        {
            let mut state = self.state.lock();
            if state.multi_threading {
                return Ok(());
            }
            state.multi_threading = true;
        }
        hooks.initialize_multi_threading(&guest)
    }

    pub(crate) fn initialize_thread(&self, thread: ThreadId) -> Result<()> {
        let Some((hooks, guest)) = self.live() else {
            return Ok(());
        };
        {
            let mut state = self.state.lock();
            if state.initialized_threads.contains(&thread) {
                return Err(Error::internal(format!(
                    "thread {thread:?} initialized twice for language '{}'",
                    self.id
                )));
            }
            state.initialized_threads.push(thread);
        }
        hooks.initialize_thread(&guest, thread)
    }

    /// Run `finalize_thread` unless it already ran for `thread`
    pub(crate) fn finalize_thread(&self, thread: ThreadId) -> Result<()> {
        let Some((hooks, guest)) = self.live() else {
            return Ok(());
        };
        {
            let mut state = self.state.lock();
            if !state.initialized_threads.contains(&thread)
                || state.finalized_threads.contains(&thread)
            {
                return Ok(());
            }
            state.finalized_threads.push(thread);
        }
        hooks.finalize_thread(&guest, thread)
    }

    /// Run `dispose_thread` unless it already ran for `thread`
    pub(crate) fn dispose_thread(&self, thread: ThreadId) -> Result<()> {
        let Some((hooks, guest)) = self.live() else {
            return Ok(());
        };
        {
            let mut state = self.state.lock();
            if !state.initialized_threads.contains(&thread)
                || state.disposed_threads.contains(&thread)
            {
                return Ok(());
            }
            state.disposed_threads.push(thread);
        }
        let result = hooks.dispose_thread(&guest, thread);
        if result.is_err() {
            self.state.lock().disposed_threads.retain(|t| *t != thread);
        }
        result
    }

    fn initialized_threads(&self) -> Vec<ThreadId> {
        self.state.lock().initialized_threads.clone()
    }

    /// Run `finalize_context` once; `true` if it ran now
    fn finalize(&self) -> Result<bool> {
        let Some((hooks, guest)) = self.live() else {
            return Ok(false);
        };
        if self.phase() != LanguagePhase::Initialized || self.state.lock().finalized {
            return Ok(false);
        }
        hooks.finalize_context(&guest)?;
        self.state.lock().finalized = true;
        Ok(true)
    }

    fn dispose(&self) -> Result<()> {
        let Some((hooks, guest)) = self.live() else {
            return Ok(());
        };
        hooks.dispose_context(&guest)?;
        let mut state = self.state.lock();
        state.phase = LanguagePhase::Disposed;
        state.guest = None;
        Ok(())
    }
}

impl ContextInner {
    pub(crate) fn lifecycle(&self) -> Lifecycle {
        self.state.lock().lifecycle
    }

    /// Environment of an initialized or initializing language
    pub(crate) fn language_env(&self, index: usize) -> Result<Env> {
        let language = self.language(index)?;
        language.env().ok_or_else(|| {
            Error::illegal_state(format!(
                "The language context of '{}' was not yet created in this context.",
                language.id
            ))
        })
    }

    /// Resolve a language the embedder asked for
    ///
    /// Languages pulled in as dependencies need not be permitted.
    pub(crate) fn permitted_language(&self, id: &str) -> Result<usize> {
        let index = self.engine.language_index(id)?;
        if !self.config.read().permits(id) {
            return Err(Error::illegal_state(format!(
                "The language '{id}' is not permitted in this context."
            )));
        }
        Ok(index)
    }

    /// Create and initialize a language and its dependencies
    ///
    /// Returns `false` if the language was already initialized.
    pub(crate) fn initialize_language(self: &Arc<Self>, index: usize) -> Result<bool> {
        let language = self.language(index)?;
        if language.is_initialized() {
            return Ok(false);
        }

        let _admission = self.admission.lock();
        match language.phase() {
            LanguagePhase::Initialized => return Ok(false),
            LanguagePhase::Creating => {
                return Err(Error::CyclicDependency(format!(
                    "'{}' was accessed during its own initialization",
                    language.id
                )));
            }
            LanguagePhase::Disposed => return Err(Error::closed()),
            LanguagePhase::NotCreated | LanguagePhase::Created => {}
        }
        let (pre_initialized, multi_threaded, threads) = {
            let state = self.state.lock();
            if state.closed {
                return Err(Error::closed());
            }
            if state.lifecycle == Lifecycle::Disposing {
                return Err(Error::illegal_state(
                    "Cannot initialize a language while the context is being disposed.",
                ));
            }
            let threads: Vec<(ThreadId, String)> = state
                .threads
                .iter()
                .filter(|t| !t.retired)
                .map(|t| (t.id, t.name.clone()))
                .collect();
            (state.pre_initialized, state.multi_threaded, threads)
        };

        for dependency in self.engine.dependencies(index) {
            self.initialize_language(*dependency)?;
        }

        if language.phase() == LanguagePhase::NotCreated {
            self.create_language(language, pre_initialized, multi_threaded, &threads)?;
        }

        let (hooks, guest) = language.live_or_err()?;
        hooks.initialize_context(&guest)?;
        language.set_phase(LanguagePhase::Initialized);

        if !pre_initialized {
            if multi_threaded {
                language.initialize_multi_threading()?;
            }
            for (thread, _) in &threads {
                language.initialize_thread(*thread)?;
            }
        }
        tracing::debug!(context = %self.id, language = %language.id, "language initialized");
        Ok(true)
    }

    fn create_language(
        self: &Arc<Self>,
        language: &LanguageContext,
        pre_initialized: bool,
        multi_threaded: bool,
        threads: &[(ThreadId, String)],
    ) -> Result<()> {
        language.set_phase(LanguagePhase::Creating);
        let registration = self.engine.registration(language.index)?;
        let instance = match registration.context_policy() {
            ContextPolicy::Exclusive => {
                registration.instantiate(&self.engine, language.index, OwnerScope::Context(self.id))
            }
            ContextPolicy::Shared => self.engine.shared_language(language.index),
        };
        let instance = match instance {
            Ok(instance) => instance,
            Err(e) => {
                language.reset();
                return Err(e);
            }
        };

        let handle = ContextHandle::new(self);
        let single_threaded = !multi_threaded && threads.len() <= 1;
        for (thread, name) in threads {
            let request = ThreadRequest::new(handle.clone(), *thread, name.clone(), single_threaded);
            if !instance.hooks.is_thread_access_allowed(&request) {
                language.reset();
                return Err(Error::AccessDenied {
                    thread: name.clone(),
                    single_threaded,
                    languages: vec![language.id.clone()],
                });
            }
        }

        let options = self.config.read().options.clone();
        let env = Env::new(&language.id, handle, &self.engine, options, pre_initialized);
        let hooks = instance.hooks.clone();
        {
            let mut state = language.state.lock();
            state.instance = Some(instance);
            state.env = Some(env.clone());
        }
        match hooks.create_context(&env) {
            Ok(guest) => {
                let mut state = language.state.lock();
                state.guest = Some(guest);
                state.phase = LanguagePhase::Created;
                Ok(())
            }
            Err(e) => {
                language.reset();
                Err(e)
            }
        }
    }

    /// Fail if polyglot threads may not be created right now
    pub(crate) fn check_thread_creation(&self) -> Result<()> {
        let state = self.state.lock();
        if state.closed {
            return Err(Error::closed());
        }
        if state.lifecycle == Lifecycle::Disposing {
            return Err(Error::illegal_state(
                "Creating threads is not allowed while the context is being disposed.",
            ));
        }
        Ok(())
    }

    /// Finalize and dispose a finished polyglot thread
    pub(crate) fn retire_thread(&self, thread: ThreadId) {
        let _admission = self.admission.lock();
        {
            let state = self.state.lock();
            if state.closed || state.thread(thread).is_none_or(|t| t.retired) {
                return;
            }
        }
        for language in self.languages.iter().rev() {
            if let Err(e) = language.finalize_thread(thread) {
                tracing::warn!(context = %self.id, language = %language.id, error = %e, "finalize_thread failed");
            }
            if let Err(e) = language.dispose_thread(thread) {
                tracing::warn!(context = %self.id, language = %language.id, error = %e, "dispose_thread failed");
            }
        }
        if let Some(info) = self.state.lock().thread_mut(thread) {
            info.retired = true;
        }
        tracing::debug!(context = %self.id, ?thread, "polyglot thread retired");
    }

    /// Close the context
    ///
    /// A closing thread that was never admitted gets `initialize_thread`
    /// without asking `is_thread_access_allowed`.
    pub(crate) fn close(self: &Arc<Self>, mode: CloseMode) -> Result<()> {
        let me = thread::current().id();
        {
            let mut state = self.state.lock();
            let mut deadline = None;
            loop {
                if state.closed {
                    return Ok(());
                }
                match state.closing_thread {
                    Some(closing) if closing == me => return Ok(()),
                    Some(_) => {
                        self.changed.wait(&mut state);
                        continue;
                    }
                    None => {}
                }
                let explicit_here = state.thread(me).filter(|t| t.entered > 0).map(|t| t.explicit);
                if let Some(explicit) = explicit_here {
                    match mode {
                        CloseMode::Normal if explicit > 0 => {
                            return Err(Error::illegal_state(
                                "The context is explicitly entered on the current thread. Call leave() before closing the context to resolve this.",
                            ));
                        }
                        CloseMode::Normal => {
                            return Err(Error::illegal_state(
                                "The context is currently entered on the current thread and cannot be closed.",
                            ));
                        }
                        CloseMode::Cancel => {
                            self.safepoint.cancel();
                            state.close_on_leave = true;
                            self.changed.notify_all();
                            tracing::debug!(context = %self.id, "cancel requested from inside the context");
                            return Ok(());
                        }
                    }
                }
                let busy = state.other_thread_active(me);
                match mode {
                    CloseMode::Normal if busy => {
                        return Err(Error::illegal_state(
                            "The context is currently executing on another thread. Use close_cancel to stop the execution on that thread.",
                        ));
                    }
                    CloseMode::Cancel if busy || !state.other_polyglot_running(me).is_empty() => {
                        self.safepoint.cancel();
                        self.changed.notify_all();
                        let deadline = *deadline.get_or_insert_with(|| {
                            Instant::now() + self.engine.config.cancel_timeout()
                        });
                        if self.changed.wait_until(&mut state, deadline).timed_out()
                            && (state.other_thread_active(me) || !state.other_polyglot_running(me).is_empty())
                        {
                            state.close_on_leave = true;
                            return Err(Error::illegal_state(format!(
                                "The context could not be cancelled within {:?}.",
                                self.engine.config.cancel_timeout()
                            )));
                        }
                        continue;
                    }
                    _ => {}
                }
                state.closing_thread = Some(me);
                break;
            }
        }

        tracing::debug!(context = %self.id, ?mode, "closing context");
        match self.close_closing() {
            Ok(()) => {
                self.engine.remove_context(self.id);
                let engine_ref = self.engine_ref.lock().take();
                drop(engine_ref);
                tracing::debug!(context = %self.id, "context closed");
                Ok(())
            }
            Err(e) => {
                {
                    let mut state = self.state.lock();
                    state.lifecycle = Lifecycle::Active;
                    state.closing_thread = None;
                    self.changed.notify_all();
                }
                self.safepoint.reset_cancel();
                tracing::warn!(context = %self.id, error = %e, "context close failed");
                Err(e)
            }
        }
    }

    fn close_closing(self: &Arc<Self>) -> Result<()> {
        let me = thread::current().id();
        let frame = self.enter(EnterKind::Internal)?;
        self.state.lock().lifecycle = Lifecycle::Finalizing;
        loop {
            let mut progressed = false;
            for language in self.languages.iter().rev() {
                progressed |= language.finalize()?;
            }
            if !progressed {
                break;
            }
        }

        {
            let mut state = self.state.lock();
            let running = state.other_polyglot_running(me);
            if !running.is_empty() {
                return Err(Error::PolyglotThreadsNotCompleted(running));
            }
            state.lifecycle = Lifecycle::Disposing;
        }

        // a closing thread that never entered is initialized so it can be disposed
        for language in self.languages.iter().filter(|l| l.is_initialized()) {
            if !language.initialized_threads().contains(&me) {
                language.initialize_thread(me)?;
            }
        }
        for language in self.languages.iter().rev() {
            for thread in language.initialized_threads() {
                language.finalize_thread(thread)?;
            }
        }
        for language in self.languages.iter().rev() {
            for thread in language.initialized_threads() {
                language.dispose_thread(thread)?;
            }
            language.dispose()?;
        }

        drop(frame);
        let mut state = self.state.lock();
        state.closed = true;
        state.closing_thread = None;
        self.changed.notify_all();
        Ok(())
    }

    /// Finish a cancel requested from inside once nothing runs in the context
    ///
    /// Called whenever a thread leaves and whenever a polyglot thread ends, so
    /// the last of them performs the close.
    pub(crate) fn close_if_requested(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            let ready = state.close_on_leave
                && !state.closed
                && state.closing_thread.is_none()
                && !state.any_thread_active()
                && state.polyglot_running.is_empty();
            if !ready {
                return;
            }
            state.close_on_leave = false;
        }
        tracing::debug!(context = %self.id, "closing cancelled context on leave");
        if let Err(e) = self.close(CloseMode::Cancel) {
            tracing::warn!(context = %self.id, error = %e, "failed to close cancelled context");
        }
    }

    /// Close an unreachable context
    pub(crate) fn collect(self: &Arc<Self>) {
        if self.is_closed() {
            return;
        }
        match self.close(CloseMode::Cancel) {
            Ok(()) => tracing::debug!(context = %self.id, "unreachable context collected"),
            Err(e) => tracing::warn!(context = %self.id, error = %e, "failed to collect context"),
        }
    }

    /// Called when the last counted reference was dropped
    pub(crate) fn released(self: &Arc<Self>) {
        if !self.engine.config.collect_on_release || self.is_closed() {
            return;
        }
        self.engine.schedule_collection(self.clone());
    }
}
