//! Entering and leaving contexts
//!
//! The first entry of a thread admits it: every initialized language is asked
//! whether the thread may enter, and on success initializes it. Admitting a
//! second distinct thread switches the context to multi-threaded mode, which
//! re-asks every language for all threads seen so far.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread::{self, Thread, ThreadId};

use crate::context::{ContextHandle, ContextInner, ThreadInfo};
use crate::error::{Error, Result};
use crate::language::ThreadRequest;
use crate::liveness::ContextRef;

/// Who is entering a context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EnterKind {
    /// Through a `ContextGuard`
    Explicit,
    /// Around an embedder operation or inside a polyglot thread
    Implicit,
    /// Engine-internal entry while closing; never admits the thread
    Internal,
}

pub(crate) fn thread_name(thread: &Thread) -> String {
    thread
        .name()
        .map(str::to_string)
        .unwrap_or_else(|| format!("{:?}", thread.id()))
}

impl ContextInner {
    /// Enter the context on the calling thread
    pub(crate) fn enter(self: &Arc<Self>, kind: EnterKind) -> Result<EnteredFrame> {
        let reference = match kind {
            EnterKind::Internal => None,
            _ => Some(ContextRef::try_acquire(self).ok_or_else(Error::closed)?),
        };
        let current = thread::current();
        let me = current.id();
        if self.engine.is_notifying(me) {
            return Err(Error::illegal_state(
                "Context cannot be entered in polyglot thread's beforeEnter or afterLeave notifications.",
            ));
        }
        let explicit = kind == EnterKind::Explicit;

        let known = {
            let mut state = self.state.lock();
            self.check_enterable(state.closed, state.closing_thread, me, kind)?;
            match state.thread_mut(me) {
                Some(info) if info.retired && kind != EnterKind::Internal => {
                    return Err(Error::illegal_state(
                        "The thread was already disposed in this context.",
                    ));
                }
                Some(info) => {
                    info.entered += 1;
                    if explicit {
                        info.explicit += 1;
                    }
                    true
                }
                None => false,
            }
        };

        if known || kind == EnterKind::Internal {
            self.engine.push_entered(me, self.clone());
            let frame = EnteredFrame::new(self.clone(), me, explicit, reference);
            self.engine.notify_enter(&frame.handle());
            return Ok(frame);
        }
        self.admit(&current, kind, reference)
    }

    fn check_enterable(
        &self,
        closed: bool,
        closing_thread: Option<ThreadId>,
        me: ThreadId,
        kind: EnterKind,
    ) -> Result<()> {
        if closed {
            return Err(Error::closed());
        }
        if kind != EnterKind::Internal
            && self.safepoint.is_cancelled()
            && closing_thread != Some(me)
        {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// First entry of a thread
    fn admit(
        self: &Arc<Self>,
        current: &Thread,
        kind: EnterKind,
        reference: Option<ContextRef>,
    ) -> Result<EnteredFrame> {
        let me = current.id();
        let name = thread_name(current);
        let explicit = kind == EnterKind::Explicit;
        let _admission = self.admission.lock();

        let (first, transition, previous) = {
            let state = self.state.lock();
            self.check_enterable(state.closed, state.closing_thread, me, kind)?;
            if let Some(closing) = state.closing_thread {
                if closing != me {
                    return Err(Error::illegal_state(
                        "Can not create new threads in closing context.",
                    ));
                }
            }
            let previous: Vec<(ThreadId, String)> = state
                .threads
                .iter()
                .filter(|t| !t.retired)
                .map(|t| (t.id, t.name.clone()))
                .collect();
            let transition = !state.threads.is_empty() && !state.multi_threaded;
            (state.threads.is_empty(), transition, previous)
        };

        self.check_thread_access(me, &name, first, transition, &previous)?;

        {
            let mut state = self.state.lock();
            state.threads.push(ThreadInfo {
                id: me,
                name: name.clone(),
                entered: 1,
                explicit: usize::from(explicit),
                retired: false,
            });
            if transition {
                state.multi_threaded = true;
            }
        }
        self.engine.push_entered(me, self.clone());
        let frame = EnteredFrame::new(self.clone(), me, explicit, reference);

        if transition {
            tracing::debug!(context = %self.id, thread = %name, "context became multi-threaded");
            for language in self.initialized_languages() {
                language.initialize_multi_threading()?;
            }
        }
        if !self.state.lock().pre_initialized {
            for language in self.initialized_languages() {
                language.initialize_thread(me)?;
            }
        }
        tracing::debug!(context = %self.id, thread = %name, ?kind, "thread admitted");
        self.engine.notify_enter(&frame.handle());
        Ok(frame)
    }

    /// Ask every initialized language whether `me` may enter
    fn check_thread_access(
        self: &Arc<Self>,
        me: ThreadId,
        name: &str,
        first: bool,
        transition: bool,
        previous: &[(ThreadId, String)],
    ) -> Result<()> {
        let handle = ContextHandle::new(self);
        let mut denied = Vec::new();
        for language in self.initialized_languages() {
            let Some(hooks) = language.hooks() else {
                continue;
            };
            let request = ThreadRequest::new(handle.clone(), me, name.to_string(), first);
            let mut allowed = hooks.is_thread_access_allowed(&request);
            if allowed && transition {
                allowed = previous.iter().all(|(thread, thread_name)| {
                    let request =
                        ThreadRequest::new(handle.clone(), *thread, thread_name.clone(), false);
                    hooks.is_thread_access_allowed(&request)
                });
            }
            if !allowed {
                denied.push(language.id.clone());
            }
        }
        if denied.is_empty() {
            Ok(())
        } else {
            tracing::debug!(context = %self.id, thread = %name, ?denied, "thread access denied");
            Err(Error::AccessDenied {
                thread: name.to_string(),
                single_threaded: first,
                languages: denied,
            })
        }
    }

    /// Leave one entry of `thread`
    pub(crate) fn leave(self: &Arc<Self>, thread: ThreadId, explicit: bool) {
        self.engine.notify_leave(&ContextHandle::new(self));
        self.engine.pop_entered(thread, self.id);
        {
            let mut state = self.state.lock();
            if let Some(info) = state.thread_mut(thread) {
                info.entered = info.entered.saturating_sub(1);
                if explicit {
                    info.explicit = info.explicit.saturating_sub(1);
                }
            }
            self.changed.notify_all();
        }
        self.close_if_requested();
    }

    /// Whether `thread` was admitted and was not retired
    pub(crate) fn is_thread_admitted(&self, thread: ThreadId) -> bool {
        self.state
            .lock()
            .thread(thread)
            .is_some_and(|info| !info.retired)
    }

    /// Make the context current without admitting the thread
    ///
    /// Used while pre-initializing, where languages are created and
    /// initialized but no thread is recorded.
    pub(crate) fn enter_preinit(self: &Arc<Self>) -> PreinitFrame {
        let me = thread::current().id();
        self.engine.push_entered(me, self.clone());
        PreinitFrame {
            context: self.clone(),
            thread: me,
        }
    }
}

/// One active entry of a thread into a context
///
/// Leaves on drop. Bound to the thread that entered.
pub(crate) struct EnteredFrame {
    context: Arc<ContextInner>,
    thread: ThreadId,
    explicit: bool,
    _reference: Option<ContextRef>,
    _not_send: PhantomData<*const ()>,
}

impl EnteredFrame {
    fn new(
        context: Arc<ContextInner>,
        thread: ThreadId,
        explicit: bool,
        reference: Option<ContextRef>,
    ) -> Self {
        Self {
            context,
            thread,
            explicit,
            _reference: reference,
            _not_send: PhantomData,
        }
    }

    pub(crate) fn handle(&self) -> ContextHandle {
        ContextHandle::new(&self.context)
    }
}

impl Drop for EnteredFrame {
    fn drop(&mut self) {
        self.context.leave(self.thread, self.explicit);
    }
}

impl fmt::Debug for EnteredFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnteredFrame")
            .field("context", &self.context.id)
            .field("explicit", &self.explicit)
            .finish()
    }
}

pub(crate) struct PreinitFrame {
    context: Arc<ContextInner>,
    thread: ThreadId,
}

impl Drop for PreinitFrame {
    fn drop(&mut self) {
        self.context.engine.pop_entered(self.thread, self.context.id);
    }
}
