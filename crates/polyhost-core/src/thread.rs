//! Polyglot threads
//!
//! Threads created by a language through [`Env::create_thread`]. A polyglot
//! thread enters its context for the duration of its body and is finalized and
//! disposed as soon as the body returns:
//!
//! ```text
//! start ─▶ before_enter ─▶ enter ─▶ body ─▶ leave ─▶ after_leave ─▶ retire
//! ```
//!
//! Errors and panics of the body never propagate to the embedder; they are
//! handed to the uncaught handler or logged.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};

use crate::context::{ContextInner, EnterKind, Lifecycle};
use crate::env::Env;
use crate::error::{Error, Result};
use crate::liveness::ContextRef;

type Body = Box<dyn FnOnce(&Env) -> Result<()> + Send>;
type Notification = Box<dyn FnOnce() -> Result<()> + Send>;
type UncaughtHandler = Box<dyn Fn(&Error) + Send + Sync>;

/// Unstarted polyglot thread
///
/// Holds only a weak reference to its context; a thread that is never started
/// does not keep the context reachable.
pub struct PolyglotThreadBuilder {
    context: Weak<ContextInner>,
    env: Env,
    name: String,
    body: Body,
    before_enter: Option<Notification>,
    after_leave: Option<Notification>,
    on_uncaught: Option<UncaughtHandler>,
}

impl PolyglotThreadBuilder {
    pub(crate) fn new(context: Weak<ContextInner>, env: Env, name: String, body: Body) -> Self {
        Self {
            context,
            env,
            name,
            body,
            before_enter: None,
            after_leave: None,
            on_uncaught: None,
        }
    }

    /// Thread name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Run on the new thread before it enters the context
    ///
    /// The context cannot be entered from inside the notification. An error
    /// skips the body.
    pub fn before_enter<F>(mut self, f: F) -> Self
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.before_enter = Some(Box::new(f));
        self
    }

    /// Run on the thread after it left the context, even if the body failed
    pub fn after_leave<F>(mut self, f: F) -> Self
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.after_leave = Some(Box::new(f));
        self
    }

    /// Receive errors of the thread instead of logging them
    pub fn on_uncaught<F>(mut self, f: F) -> Self
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.on_uncaught = Some(Box::new(f));
        self
    }

    /// Start the thread
    ///
    /// # Errors
    ///
    /// Fails if the context is closed or being disposed.
    pub fn start(self) -> Result<PolyglotThread> {
        let context = self.context.upgrade().ok_or_else(Error::closed)?;
        let reference = ContextRef::try_acquire(&context).ok_or_else(Error::closed)?;

        let mut state = context.state.lock();
        if state.closed {
            return Err(Error::closed());
        }
        if state.lifecycle == Lifecycle::Disposing {
            return Err(Error::illegal_state(
                "Creating threads is not allowed while the context is being disposed.",
            ));
        }
        let runner = Runner {
            reference,
            env: self.env,
            body: self.body,
            before_enter: self.before_enter,
            after_leave: self.after_leave,
            on_uncaught: self.on_uncaught,
        };
        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || runner.run())
            .map_err(|e| Error::internal(format!("failed to spawn polyglot thread: {e}")))?;
        let id = handle.thread().id();
        state.polyglot_running.push(id);
        drop(state);
        tracing::debug!(context = %context.id, thread = %self.name, "polyglot thread started");
        Ok(PolyglotThread { handle, id })
    }
}

impl fmt::Debug for PolyglotThreadBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolyglotThreadBuilder")
            .field("name", &self.name)
            .field("env", &self.env)
            .finish()
    }
}

struct Runner {
    reference: ContextRef,
    env: Env,
    body: Body,
    before_enter: Option<Notification>,
    after_leave: Option<Notification>,
    on_uncaught: Option<UncaughtHandler>,
}

impl Runner {
    fn run(self) {
        let Runner {
            reference,
            env,
            body,
            before_enter,
            after_leave,
            on_uncaught,
        } = self;
        let context = reference.context().clone();
        let me = thread::current().id();
        let report = |error: &Error| match &on_uncaught {
            Some(handler) => handler(error),
            None => {
                tracing::error!(context = %context.id, error = %error, "uncaught error in polyglot thread");
            }
        };

        let entered = match notify(&context, me, before_enter) {
            Err(e) => {
                report(&e);
                false
            }
            Ok(()) => {
                let result = panic::catch_unwind(AssertUnwindSafe(|| -> Result<()> {
                    let _frame = context.enter(EnterKind::Implicit)?;
                    body(&env)
                }))
                .unwrap_or_else(|payload| Err(Error::internal(panic_message(&*payload))));
                if let Err(e) = &result {
                    if !e.is_cancelled() {
                        report(e);
                    }
                }
                true
            }
        };
        if let Err(e) = notify(&context, me, after_leave) {
            report(&e);
        }

        if entered {
            context.retire_thread(me);
        }
        {
            let mut state = context.state.lock();
            state.polyglot_running.retain(|t| *t != me);
            context.changed.notify_all();
        }
        context.close_if_requested();
        tracing::debug!(context = %context.id, "polyglot thread finished");
        drop(reference);
    }
}

fn notify(context: &Arc<ContextInner>, me: ThreadId, notification: Option<Notification>) -> Result<()> {
    let Some(notification) = notification else {
        return Ok(());
    };
    let _notifying = context.engine.begin_notification(me);
    panic::catch_unwind(AssertUnwindSafe(notification))
        .unwrap_or_else(|payload| Err(Error::internal(panic_message(&*payload))))
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "polyglot thread panicked".to_string())
}

/// Running polyglot thread
#[derive(Debug)]
pub struct PolyglotThread {
    handle: JoinHandle<()>,
    id: ThreadId,
}

impl PolyglotThread {
    /// Id of the spawned thread
    pub fn thread_id(&self) -> ThreadId {
        self.id
    }

    /// Wait for the thread to finish
    ///
    /// # Errors
    ///
    /// Fails if the thread runner itself panicked.
    pub fn join(self) -> Result<()> {
        self.handle
            .join()
            .map_err(|payload| Error::internal(panic_message(&*payload)))
    }
}
