//! Reachability tracking and background collection
//!
//! Embedder-visible objects hold counted references instead of relying on a
//! garbage collector:
//!
//! ```text
//!  Context / Value / Bindings / GuestError / entered frame / running thread
//!                           │ ContextRef (counted)
//!                           ▼
//!                     ContextInner ──── EngineRef (counted) ───▶ EngineInner
//!                           ▲                                        ▲
//!  ContextHandle / Env / unstarted thread (weak)      Engine / lookups / listeners
//! ```
//!
//! When the count of a context drops to zero it is queued on the engine's
//! reaper thread, which closes it with cancellation. When the count of an
//! engine drops to zero the reaper disposes the engine and exits.

use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::{Condvar, Mutex};

use crate::context::{ContextHandle, ContextId, ContextInner};
use crate::engine::EngineInner;
use crate::error::{Error, Result};

/// Counted reference that keeps a context from being collected
pub(crate) struct ContextRef {
    inner: Arc<ContextInner>,
}

impl ContextRef {
    /// Add a reference unconditionally
    pub(crate) fn new(inner: &Arc<ContextInner>) -> Self {
        inner.refs.fetch_add(1, Ordering::AcqRel);
        Self {
            inner: inner.clone(),
        }
    }

    /// Add a reference unless the context already became unreachable
    pub(crate) fn try_acquire(inner: &Arc<ContextInner>) -> Option<Self> {
        let mut current = inner.refs.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return None;
            }
            match inner.refs.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(Self {
                        inner: inner.clone(),
                    });
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn context(&self) -> &Arc<ContextInner> {
        &self.inner
    }

    pub(crate) fn handle(&self) -> ContextHandle {
        ContextHandle::new(&self.inner)
    }

    pub(crate) fn id(&self) -> ContextId {
        self.inner.id
    }
}

impl Clone for ContextRef {
    fn clone(&self) -> Self {
        Self::new(&self.inner)
    }
}

impl Drop for ContextRef {
    fn drop(&mut self) {
        if self.inner.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.released();
        }
    }
}

impl fmt::Debug for ContextRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ContextRef").field(&self.inner.id).finish()
    }
}

/// Counted reference that keeps an engine from being disposed
pub(crate) struct EngineRef {
    inner: Arc<EngineInner>,
}

impl EngineRef {
    pub(crate) fn new(inner: &Arc<EngineInner>) -> Self {
        inner.refs.fetch_add(1, Ordering::AcqRel);
        Self {
            inner: inner.clone(),
        }
    }

    pub(crate) fn engine(&self) -> &Arc<EngineInner> {
        &self.inner
    }
}

impl Clone for EngineRef {
    fn clone(&self) -> Self {
        Self::new(&self.inner)
    }
}

impl Drop for EngineRef {
    fn drop(&mut self) {
        if self.inner.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.released();
        }
    }
}

/// Commands sent to the reaper thread
pub(crate) enum ReaperCommand {
    /// Close a context whose last reference was dropped
    Collect(Arc<ContextInner>),
    /// Dispose the engine if it is still unreachable
    DisposeEngine(Arc<EngineInner>),
    /// Acknowledge once every earlier command was processed
    Barrier(Sender<()>),
}

/// Start the reaper thread of an engine
pub(crate) fn spawn_reaper(name: &str, receiver: Receiver<ReaperCommand>) -> Result<()> {
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || reaper_thread(receiver))
        .map(|_| ())
        .map_err(|e| Error::internal(format!("failed to spawn reaper thread: {e}")))
}

fn reaper_thread(receiver: Receiver<ReaperCommand>) {
    tracing::debug!("reaper started");
    for command in receiver.iter() {
        match command {
            ReaperCommand::Collect(context) => context.collect(),
            ReaperCommand::Barrier(ack) => {
                let _ = ack.send(());
            }
            ReaperCommand::DisposeEngine(engine) => {
                if engine.refs.load(Ordering::Acquire) != 0 {
                    continue;
                }
                if let Err(e) = engine.dispose(true) {
                    tracing::warn!(engine = %engine.id, error = %e, "failed to dispose unreachable engine");
                }
                break;
            }
        }
    }
    tracing::debug!("reaper stopped");
}

/// Wait for all queued collections of an engine
pub(crate) fn drain(sender: &Sender<ReaperCommand>) {
    let (ack, done) = bounded(1);
    if sender.send(ReaperCommand::Barrier(ack)).is_ok() {
        let _ = done.recv();
    }
}

#[derive(Default)]
pub(crate) struct DisposalSignal {
    disposed: Mutex<bool>,
    condvar: Condvar,
}

impl DisposalSignal {
    pub(crate) fn signal(&self) {
        *self.disposed.lock() = true;
        self.condvar.notify_all();
    }

    fn is_set(&self) -> bool {
        *self.disposed.lock()
    }

    fn wait(&self, timeout: Duration) -> bool {
        let mut disposed = self.disposed.lock();
        if !*disposed {
            let _ = self
                .condvar
                .wait_while_for(&mut disposed, |disposed| !*disposed, timeout);
        }
        *disposed
    }
}

/// Observer of an engine that does not keep it reachable
#[derive(Clone)]
pub struct WeakEngine {
    signal: Arc<DisposalSignal>,
}

impl WeakEngine {
    pub(crate) fn new(signal: Arc<DisposalSignal>) -> Self {
        Self { signal }
    }

    /// Whether the engine was disposed
    pub fn is_disposed(&self) -> bool {
        self.signal.is_set()
    }

    /// Block until the engine was disposed or the timeout elapsed
    pub fn wait_disposed(&self, timeout: Duration) -> bool {
        self.signal.wait(timeout)
    }
}

impl fmt::Debug for WeakEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakEngine")
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
