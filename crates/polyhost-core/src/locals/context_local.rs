//! Slot holding one value per context

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::context::{ContextHandle, ContextInner};
use crate::error::{Error, Result};
use crate::locals::registry::{ContextFactory, OwnerId, SlotDescriptor};
use crate::locals::storage::SlotValue;

/// Typed value computed at most once per context
///
/// Created through [`Locals::create_context_local`](crate::Locals::create_context_local)
/// while the owner is being constructed. The value is invalidated only when a
/// pre-initialized context is patched.
pub struct ContextLocal<V> {
    slot: Arc<SlotDescriptor<ContextFactory>>,
    _value: PhantomData<fn() -> V>,
}

impl<V> Clone for ContextLocal<V> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
            _value: PhantomData,
        }
    }
}

impl<V> fmt::Debug for ContextLocal<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextLocal")
            .field("owner", &self.slot.owner.id)
            .field("index", &self.slot.key.index)
            .finish()
    }
}

impl<V: Send + Sync + 'static> ContextLocal<V> {
    pub(crate) fn new(slot: Arc<SlotDescriptor<ContextFactory>>) -> Self {
        Self {
            slot,
            _value: PhantomData,
        }
    }

    /// Owner that declared the slot
    pub fn owner(&self) -> OwnerId {
        self.slot.owner.id
    }

    /// Value in the context entered on the calling thread
    ///
    /// # Errors
    ///
    /// Returns `Error::IllegalState` if no context is entered and
    /// `Error::InvalidSharing` if the entered context is not one the owner
    /// may serve.
    pub fn get(&self) -> Result<Arc<V>> {
        let context = self.slot.owner.current_context()?;
        self.read(&context)
    }

    /// Value in an explicit context
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidSharing` if the owner is exclusive to another
    /// context or belongs to another engine.
    pub fn get_in(&self, context: &ContextHandle) -> Result<Arc<V>> {
        let context = context.upgrade()?;
        self.read(&context)
    }

    fn read(&self, context: &Arc<ContextInner>) -> Result<Arc<V>> {
        self.slot.owner.check_sharing(context)?;
        let value = context
            .storage
            .get_or_init(self.slot.key, || self.slot.materialize(context))?;
        downcast(value)
    }
}

pub(crate) fn downcast<V: Send + Sync + 'static>(value: SlotValue) -> Result<Arc<V>> {
    value.downcast::<V>().map_err(|_| {
        Error::internal(format!(
            "slot value is not of type {}",
            std::any::type_name::<V>()
        ))
    })
}
