//! Instrument that records execution events

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::ThreadId;

use parking_lot::Mutex;

use crate::context::{ContextHandle, ContextId};
use crate::error::Result;
use crate::instrument::{ExecutionListener, ExecutionListenerHandle, Instrument, InstrumentEnv, InstrumentRegistration};
use crate::locals::{ContextLocal, ContextThreadLocal, InstrumentLocals};

/// Listener that records `enter:<id>` and `leave:<id>` events
#[derive(Debug, Default)]
pub struct RecordingListener {
    events: Mutex<Vec<String>>,
}

impl RecordingListener {
    /// Events recorded so far
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

impl ExecutionListener for RecordingListener {
    fn on_enter(&self, context: &ContextHandle) {
        self.events.lock().push(format!("enter:{}", context.id()));
    }

    fn on_leave(&self, context: &ContextHandle) {
        self.events.lock().push(format!("leave:{}", context.id()));
    }
}

/// Instrument with one context local and one context thread local
pub struct RecordingInstrument {
    /// Id of the context the value was created for
    pub context_local: ContextLocal<ContextId>,
    /// Context and thread the value was created for
    pub thread_local: ContextThreadLocal<(ContextId, ThreadId)>,
    /// Execution events of every context
    pub listener: Arc<RecordingListener>,
    attachment: Mutex<Option<ExecutionListenerHandle>>,
    disposed: AtomicUsize,
}

impl RecordingInstrument {
    /// Registration that constructs the instrument
    pub fn registration(id: &str) -> InstrumentRegistration {
        InstrumentRegistration::new(id, |locals: &InstrumentLocals| {
            Ok(RecordingInstrument {
                context_local: locals.create_context_local(|context: &ContextHandle| context.id())?,
                thread_local: locals.create_context_thread_local(
                    |context: &ContextHandle, thread: ThreadId| (context.id(), thread),
                )?,
                listener: Arc::default(),
                attachment: Mutex::new(None),
                disposed: AtomicUsize::new(0),
            })
        })
    }

    /// Detach the execution listener
    ///
    /// The attachment keeps the engine reachable until it is detached or the
    /// engine is closed.
    pub fn detach(&self) {
        self.attachment.lock().take();
    }

    /// Number of `on_dispose` calls
    pub fn disposed(&self) -> usize {
        self.disposed.load(Ordering::SeqCst)
    }
}

impl Instrument for RecordingInstrument {
    fn on_create(&self, env: &InstrumentEnv) -> Result<()> {
        let handle = env.attach_execution_listener(self.listener.clone())?;
        *self.attachment.lock() = Some(handle);
        Ok(())
    }

    fn on_dispose(&self) {
        self.disposed.fetch_add(1, Ordering::SeqCst);
        self.attachment.lock().take();
    }
}
