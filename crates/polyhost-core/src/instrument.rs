//! Instruments: engine-wide tools observing every context
//!
//! An instrument is created lazily on its first lookup. Like a language it may
//! create context locals and context thread locals while its constructor runs;
//! its slots resolve against a [`ContextHandle`] and serve every context of the
//! engine.

use std::any::Any;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use once_cell::sync::OnceCell;

use crate::context::ContextHandle;
use crate::engine::EngineInner;
use crate::error::{Error, Result};
use crate::liveness::EngineRef;
use crate::locals::registry::{self, OwnerInfo, OwnerKind, OwnerScope, RegistryInner, SlotLayout};
use crate::locals::InstrumentLocals;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// An engine-wide tool
pub trait Instrument: Send + Sync + 'static {
    /// Called once after construction
    fn on_create(&self, _env: &InstrumentEnv) -> Result<()> {
        Ok(())
    }

    /// Called when the engine is disposed
    fn on_dispose(&self) {}
}

/// Observer of threads entering and leaving contexts
pub trait ExecutionListener: Send + Sync {
    /// A thread entered `context`
    fn on_enter(&self, _context: &ContextHandle) {}

    /// A thread left `context`
    fn on_leave(&self, _context: &ContextHandle) {}
}

/// Engine access handed to [`Instrument::on_create`]
pub struct InstrumentEnv {
    engine: Weak<EngineInner>,
}

impl InstrumentEnv {
    /// Register a listener for enter and leave events of every context
    ///
    /// # Errors
    ///
    /// Fails if the engine is already disposed.
    pub fn attach_execution_listener(
        &self,
        listener: Arc<dyn ExecutionListener>,
    ) -> Result<ExecutionListenerHandle> {
        let engine = self
            .engine
            .upgrade()
            .ok_or_else(|| Error::illegal_state("The engine is already closed."))?;
        let id = NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed);
        engine.listeners.write().push((id, listener));
        Ok(ExecutionListenerHandle {
            id,
            engine: EngineRef::new(&engine),
        })
    }
}

impl fmt::Debug for InstrumentEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentEnv").finish_non_exhaustive()
    }
}

/// Attached execution listener; detaches when dropped
///
/// Keeps the engine reachable while attached.
pub struct ExecutionListenerHandle {
    id: u64,
    engine: EngineRef,
}

impl ExecutionListenerHandle {
    /// Stop receiving events
    pub fn detach(self) {
        drop(self);
    }
}

impl Drop for ExecutionListenerHandle {
    fn drop(&mut self) {
        self.engine
            .engine()
            .listeners
            .write()
            .retain(|(id, _)| *id != self.id);
    }
}

impl fmt::Debug for ExecutionListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ExecutionListenerHandle").field(&self.id).finish()
    }
}

type Constructor = Box<
    dyn Fn(&InstrumentLocals) -> Result<(Arc<dyn Instrument>, Arc<dyn Any + Send + Sync>)>
        + Send
        + Sync,
>;

/// Declaration of an instrument
pub struct InstrumentRegistration {
    id: String,
    constructor: Constructor,
    layout: OnceCell<SlotLayout>,
}

impl InstrumentRegistration {
    /// Register an instrument constructor
    pub fn new<I, F>(id: impl Into<String>, constructor: F) -> Self
    where
        I: Instrument,
        F: Fn(&InstrumentLocals) -> Result<I> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            constructor: Box::new(move |locals| {
                let instrument = Arc::new(constructor(locals)?);
                let hooks: Arc<dyn Instrument> = instrument.clone();
                let any: Arc<dyn Any + Send + Sync> = instrument;
                Ok((hooks, any))
            }),
            layout: OnceCell::new(),
        }
    }

    /// Instrument id
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Debug for InstrumentRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentRegistration")
            .field("id", &self.id)
            .finish()
    }
}

#[derive(Clone)]
struct InstrumentInstance {
    hooks: Arc<dyn Instrument>,
    any: Arc<dyn Any + Send + Sync>,
}

/// A registration plus its lazily created instance
pub(crate) struct InstrumentEntry {
    registration: InstrumentRegistration,
    instance: OnceCell<InstrumentInstance>,
}

impl InstrumentEntry {
    pub(crate) fn new(registration: InstrumentRegistration) -> Self {
        Self {
            registration,
            instance: OnceCell::new(),
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.registration.id
    }

    fn get_or_create(&self, engine: &Arc<EngineInner>, index: usize) -> Result<&InstrumentInstance> {
        self.instance.get_or_try_init(|| {
            let registration = &self.registration;
            let owner = Arc::new(OwnerInfo::new(
                OwnerKind::Instrument,
                &registration.id,
                index,
                engine,
                OwnerScope::Engine,
            ));
            let registry = RegistryInner::new(owner.clone());
            let constructed = (registration.constructor)(&InstrumentLocals::new(registry.clone()));
            let layout = registry.freeze();
            let (hooks, any) = constructed?;
            registry::check_layout(&registration.layout, layout, OwnerKind::Instrument, &registration.id)?;
            hooks.on_create(&InstrumentEnv {
                engine: Arc::downgrade(engine),
            })?;
            tracing::debug!(instrument = %registration.id, owner = %owner.id, "instrument created");
            Ok(InstrumentInstance { hooks, any })
        })
    }

    /// Look up the instance as `I`, creating it on first use
    pub(crate) fn lookup<I: Instrument>(&self, engine: &Arc<EngineInner>, index: usize) -> Result<Arc<I>> {
        let instance = self.get_or_create(engine, index)?;
        instance.any.clone().downcast::<I>().map_err(|_| {
            Error::internal(format!(
                "instrument '{}' is not a {}",
                self.registration.id,
                std::any::type_name::<I>()
            ))
        })
    }

    pub(crate) fn dispose(&self) {
        if let Some(instance) = self.instance.get() {
            instance.hooks.on_dispose();
            tracing::debug!(instrument = %self.registration.id, "instrument disposed");
        }
    }
}

/// Embedder lookup of an instrument; keeps the engine reachable
pub struct InstrumentHandle<I> {
    instrument: Arc<I>,
    _engine: EngineRef,
}

impl<I: Instrument> InstrumentHandle<I> {
    pub(crate) fn new(instrument: Arc<I>, engine: EngineRef) -> Self {
        Self {
            instrument,
            _engine: engine,
        }
    }

    /// Shared pointer to the instrument
    pub fn instrument(&self) -> &Arc<I> {
        &self.instrument
    }
}

impl<I> Deref for InstrumentHandle<I> {
    type Target = I;

    fn deref(&self) -> &I {
        &self.instrument
    }
}

impl<I> fmt::Debug for InstrumentHandle<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentHandle")
            .field("instrument", &std::any::type_name::<I>())
            .finish()
    }
}
