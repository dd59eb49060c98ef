//! Per-owner slot registry
//!
//! Every language or instrument instance receives a [`Locals`] handle while
//! its constructor runs. Slot indices are handed out in creation order and
//! the registry is frozen the moment the constructor returns.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::ThreadId;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::context::{ContextHandle, ContextId, ContextInner};
use crate::engine::{EngineId, EngineInner};
use crate::env::Env;
use crate::error::{Error, Result};
use crate::locals::storage::{SlotKey, SlotValue};
use crate::locals::{ContextLocal, ContextThreadLocal, DynamicValue};

static NEXT_OWNER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a slot owner instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerId(pub(crate) u64);

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "owner#{}", self.0)
    }
}

/// Kind of slot owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OwnerKind {
    /// Language instance
    Language,
    /// Instrument instance
    Instrument,
}

impl OwnerKind {
    fn class_name(self) -> &'static str {
        match self {
            Self::Language => "Language",
            Self::Instrument => "Instrument",
        }
    }
}

impl fmt::Display for OwnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Language => f.write_str("language"),
            Self::Instrument => f.write_str("instrument"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum SlotKind {
    Context,
    Thread,
}

/// Contexts an owner instance may serve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OwnerScope {
    /// Exclusive owner bound to one context
    Context(ContextId),
    /// Shared owner or instrument serving every context of its engine
    Engine,
}

pub(crate) struct OwnerInfo {
    pub(crate) id: OwnerId,
    pub(crate) kind: OwnerKind,
    pub(crate) registration: String,
    /// Position of the registration inside the engine
    pub(crate) index: usize,
    pub(crate) engine: Weak<EngineInner>,
    pub(crate) engine_id: EngineId,
    pub(crate) scope: OwnerScope,
}

impl OwnerInfo {
    pub(crate) fn new(
        kind: OwnerKind,
        registration: &str,
        index: usize,
        engine: &Arc<EngineInner>,
        scope: OwnerScope,
    ) -> Self {
        Self {
            id: OwnerId(NEXT_OWNER_ID.fetch_add(1, Ordering::Relaxed)),
            kind,
            registration: registration.to_string(),
            index,
            engine: Arc::downgrade(engine),
            engine_id: engine.id,
            scope,
        }
    }

    /// Reject contexts this owner must not serve
    pub(crate) fn check_sharing(&self, context: &ContextInner) -> Result<()> {
        if context.engine.id != self.engine_id {
            return Err(Error::invalid_sharing(format!(
                "Context {} belongs to a different engine than {} '{}'.",
                context.id, self.kind, self.registration
            )));
        }
        if let OwnerScope::Context(bound) = self.scope {
            if bound != context.id {
                return Err(Error::invalid_sharing(format!(
                    "The {} '{}' is exclusive to context {} but was accessed with context {}.",
                    self.kind, self.registration, bound, context.id
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn current_context(&self) -> Result<Arc<ContextInner>> {
        let engine = self.engine.upgrade().ok_or_else(Error::no_current_context)?;
        engine.current_context()
    }
}

/// Number of slots an owner created, per kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SlotLayout {
    pub(crate) context_locals: u32,
    pub(crate) thread_locals: u32,
}

/// Compare a new instance's layout with the first one of its registration
pub(crate) fn check_layout(
    recorded: &OnceCell<SlotLayout>,
    actual: SlotLayout,
    kind: OwnerKind,
    registration: &str,
) -> Result<()> {
    let expected = *recorded.get_or_init(|| actual);
    if expected.context_locals != actual.context_locals {
        return Err(Error::LayoutMismatch(format!(
            "The {kind} '{registration}' did not create the same number of context locals as its first instance. Expected {} but got {}.",
            expected.context_locals, actual.context_locals
        )));
    }
    if expected.thread_locals != actual.thread_locals {
        return Err(Error::LayoutMismatch(format!(
            "The {kind} '{registration}' did not create the same number of context thread locals as its first instance. Expected {} but got {}.",
            expected.thread_locals, actual.thread_locals
        )));
    }
    Ok(())
}

pub(crate) type ContextFactory =
    Box<dyn Fn(&OwnerInfo, &Arc<ContextInner>) -> Result<SlotValue> + Send + Sync>;
pub(crate) type ThreadFactory =
    Box<dyn Fn(&OwnerInfo, &Arc<ContextInner>, ThreadId) -> Result<SlotValue> + Send + Sync>;

/// Slot position plus the factory that materializes its values
pub(crate) struct SlotDescriptor<F> {
    pub(crate) owner: Arc<OwnerInfo>,
    pub(crate) key: SlotKey,
    pub(crate) factory: F,
}

impl SlotDescriptor<ContextFactory> {
    pub(crate) fn materialize(&self, context: &Arc<ContextInner>) -> Result<SlotValue> {
        tracing::trace!(owner = %self.owner.id, index = self.key.index, "materializing context local");
        (self.factory)(&self.owner, context)
    }
}

impl SlotDescriptor<ThreadFactory> {
    pub(crate) fn materialize(&self, context: &Arc<ContextInner>, thread: ThreadId) -> Result<SlotValue> {
        tracing::trace!(owner = %self.owner.id, index = self.key.index, ?thread, "materializing context thread local");
        (self.factory)(&self.owner, context, thread)
    }
}

mod private {
    use std::sync::Arc;

    use crate::context::ContextInner;
    use crate::error::Result;
    use crate::locals::registry::OwnerInfo;

    /// Owner and context a factory argument is resolved in
    pub struct Origin<'a> {
        pub(crate) owner: &'a OwnerInfo,
        pub(crate) context: &'a Arc<ContextInner>,
    }

    /// Produces the factory argument for a context
    pub trait Resolve: Sized {
        /// Resolve the argument of the owner in the context of `origin`
        fn resolve(origin: Origin<'_>) -> Result<Self>;
    }
}

/// Argument handed to slot factories
///
/// Language slots receive the language's [`Env`] in the context, instrument
/// slots receive a [`ContextHandle`].
pub trait SlotScope: private::Resolve + Send + Sync + 'static {}

impl private::Resolve for Env {
    fn resolve(origin: private::Origin<'_>) -> Result<Self> {
        origin.context.language_env(origin.owner.index)
    }
}

impl SlotScope for Env {}

impl private::Resolve for ContextHandle {
    fn resolve(origin: private::Origin<'_>) -> Result<Self> {
        Ok(ContextHandle::new(origin.context))
    }
}

impl SlotScope for ContextHandle {}

#[derive(Debug, Default)]
struct RegistryState {
    frozen: bool,
    context_locals: u32,
    thread_locals: u32,
}

pub(crate) struct RegistryInner {
    owner: Arc<OwnerInfo>,
    state: Mutex<RegistryState>,
}

impl RegistryInner {
    pub(crate) fn new(owner: Arc<OwnerInfo>) -> Arc<Self> {
        Arc::new(Self {
            owner,
            state: Mutex::new(RegistryState::default()),
        })
    }

    /// Seal the registry and report what was created
    pub(crate) fn freeze(&self) -> SlotLayout {
        let mut state = self.state.lock();
        state.frozen = true;
        SlotLayout {
            context_locals: state.context_locals,
            thread_locals: state.thread_locals,
        }
    }

    fn allocate(&self, kind: SlotKind) -> Result<SlotKey> {
        let mut state = self.state.lock();
        if state.frozen {
            let class = self.owner.kind.class_name();
            return Err(Error::FrozenLocals(match kind {
                SlotKind::Context => format!(
                    "The set of context locals is frozen. Context locals can only be created during construction of the {class} subclass."
                ),
                SlotKind::Thread => format!(
                    "The set of context thread locals is frozen. Context thread locals can only be created during construction of the {class} subclass."
                ),
            }));
        }
        let counter = match kind {
            SlotKind::Context => &mut state.context_locals,
            SlotKind::Thread => &mut state.thread_locals,
        };
        let index = *counter;
        *counter += 1;
        Ok(SlotKey {
            owner: self.owner.id,
            kind,
            index,
        })
    }
}

/// Slot registry handle of one owner instance
pub struct Locals<S: SlotScope> {
    inner: Arc<RegistryInner>,
    _scope: PhantomData<fn() -> S>,
}

/// Registry handed to language constructors
pub type LanguageLocals = Locals<Env>;

/// Registry handed to instrument constructors
pub type InstrumentLocals = Locals<ContextHandle>;

impl<S: SlotScope> Clone for Locals<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _scope: PhantomData,
        }
    }
}

impl<S: SlotScope> fmt::Debug for Locals<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Locals")
            .field("owner", &self.inner.owner.id)
            .field("frozen", &self.is_frozen())
            .finish()
    }
}

impl<S: SlotScope> Locals<S> {
    pub(crate) fn new(inner: Arc<RegistryInner>) -> Self {
        Self {
            inner,
            _scope: PhantomData,
        }
    }

    /// Identity of the owner instance
    pub fn owner(&self) -> OwnerId {
        self.inner.owner.id
    }

    /// Whether the owner finished construction
    pub fn is_frozen(&self) -> bool {
        self.inner.state.lock().frozen
    }

    /// Declare a slot holding one value per context
    ///
    /// # Errors
    ///
    /// Returns `Error::FrozenLocals` once the owner finished construction.
    pub fn create_context_local<V, F>(&self, factory: F) -> Result<ContextLocal<V>>
    where
        V: Send + Sync + 'static,
        F: Fn(&S) -> V + Send + Sync + 'static,
    {
        let key = self.inner.allocate(SlotKind::Context)?;
        let factory: ContextFactory = Box::new(move |owner, context| {
            let scope = S::resolve(private::Origin { owner, context })?;
            let value: SlotValue = Arc::new(factory(&scope));
            Ok(value)
        });
        Ok(ContextLocal::new(self.descriptor(key, factory)))
    }

    /// Declare a slot holding one value per context and thread
    ///
    /// # Errors
    ///
    /// Returns `Error::FrozenLocals` once the owner finished construction.
    pub fn create_context_thread_local<V, F>(&self, factory: F) -> Result<ContextThreadLocal<V>>
    where
        V: Send + Sync + 'static,
        F: Fn(&S, ThreadId) -> V + Send + Sync + 'static,
    {
        let key = self.inner.allocate(SlotKind::Thread)?;
        let factory: ThreadFactory = Box::new(move |owner, context, thread| {
            let scope = S::resolve(private::Origin { owner, context })?;
            let value: SlotValue = Arc::new(factory(&scope, thread));
            Ok(value)
        });
        Ok(ContextThreadLocal::new(self.descriptor(key, factory)))
    }

    /// Declare a per-context slot whose concrete type is only known at runtime
    ///
    /// The factory must never return `None` and must always produce the same
    /// concrete type for this slot position.
    ///
    /// # Errors
    ///
    /// Returns `Error::FrozenLocals` once the owner finished construction.
    pub fn create_dynamic_context_local<F>(&self, factory: F) -> Result<ContextLocal<DynamicValue>>
    where
        F: Fn(&S) -> Option<DynamicValue> + Send + Sync + 'static,
    {
        let key = self.inner.allocate(SlotKind::Context)?;
        let factory: ContextFactory = Box::new(move |owner, context| {
            let scope = S::resolve(private::Origin { owner, context })?;
            let value = factory(&scope).ok_or_else(|| {
                Error::NullSlotValue("ContextLocalFactory.create is not allowed to return null.".to_string())
            })?;
            context
                .engine
                .exact_types
                .check(owner, SlotKind::Context, key.index, value.type_name())?;
            let value: SlotValue = Arc::new(value);
            Ok(value)
        });
        Ok(ContextLocal::new(self.descriptor(key, factory)))
    }

    /// Declare a per-context, per-thread slot whose concrete type is only known at runtime
    ///
    /// # Errors
    ///
    /// Returns `Error::FrozenLocals` once the owner finished construction.
    pub fn create_dynamic_context_thread_local<F>(
        &self,
        factory: F,
    ) -> Result<ContextThreadLocal<DynamicValue>>
    where
        F: Fn(&S, ThreadId) -> Option<DynamicValue> + Send + Sync + 'static,
    {
        let key = self.inner.allocate(SlotKind::Thread)?;
        let factory: ThreadFactory = Box::new(move |owner, context, thread| {
            let scope = S::resolve(private::Origin { owner, context })?;
            let value = factory(&scope, thread).ok_or_else(|| {
                Error::NullSlotValue(
                    "ContextThreadLocalFactory.create is not allowed to return null.".to_string(),
                )
            })?;
            context
                .engine
                .exact_types
                .check(owner, SlotKind::Thread, key.index, value.type_name())?;
            let value: SlotValue = Arc::new(value);
            Ok(value)
        });
        Ok(ContextThreadLocal::new(self.descriptor(key, factory)))
    }

    fn descriptor<F>(&self, key: SlotKey, factory: F) -> Arc<SlotDescriptor<F>> {
        Arc::new(SlotDescriptor {
            owner: self.inner.owner.clone(),
            key,
            factory,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(context_locals: u32, thread_locals: u32) -> SlotLayout {
        SlotLayout {
            context_locals,
            thread_locals,
        }
    }

    #[test]
    fn test_first_layout_is_recorded() {
        let recorded = OnceCell::new();
        assert!(check_layout(&recorded, layout(2, 1), OwnerKind::Language, "js").is_ok());
        assert!(check_layout(&recorded, layout(2, 1), OwnerKind::Language, "js").is_ok());
        assert_eq!(recorded.get(), Some(&layout(2, 1)));
    }

    #[test]
    fn test_layout_mismatch_messages() {
        let recorded = OnceCell::new();
        check_layout(&recorded, layout(2, 1), OwnerKind::Language, "js").unwrap();

        let err = check_layout(&recorded, layout(3, 1), OwnerKind::Language, "js").unwrap_err();
        assert!(matches!(err, Error::LayoutMismatch(_)));
        assert!(err
            .to_string()
            .contains("did not create the same number of context locals"));

        let err = check_layout(&recorded, layout(2, 0), OwnerKind::Instrument, "tracer").unwrap_err();
        assert!(err
            .to_string()
            .contains("did not create the same number of context thread locals"));
    }

    #[test]
    fn test_owner_kind_names() {
        assert_eq!(OwnerKind::Language.to_string(), "language");
        assert_eq!(OwnerKind::Instrument.class_name(), "Instrument");
    }
}
