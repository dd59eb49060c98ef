//! Slot holding one value per (context, thread) pair

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use crate::context::{ContextHandle, ContextInner};
use crate::error::Result;
use crate::locals::context_local::downcast;
use crate::locals::registry::{OwnerId, SlotDescriptor, ThreadFactory};

/// Typed value computed at most once per context and thread
///
/// Values exist only for threads that were admitted into the context. Looking
/// up a thread that never entered yields `None` instead of materializing a
/// value for it.
pub struct ContextThreadLocal<V> {
    slot: Arc<SlotDescriptor<ThreadFactory>>,
    _value: PhantomData<fn() -> V>,
}

impl<V> Clone for ContextThreadLocal<V> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
            _value: PhantomData,
        }
    }
}

impl<V> fmt::Debug for ContextThreadLocal<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextThreadLocal")
            .field("owner", &self.slot.owner.id)
            .field("index", &self.slot.key.index)
            .finish()
    }
}

impl<V: Send + Sync + 'static> ContextThreadLocal<V> {
    pub(crate) fn new(slot: Arc<SlotDescriptor<ThreadFactory>>) -> Self {
        Self {
            slot,
            _value: PhantomData,
        }
    }

    /// Owner that declared the slot
    pub fn owner(&self) -> OwnerId {
        self.slot.owner.id
    }

    /// Value of the calling thread in its entered context
    ///
    /// # Errors
    ///
    /// Returns `Error::IllegalState` if no context is entered and
    /// `Error::InvalidSharing` if the entered context is not one the owner
    /// may serve.
    pub fn get(&self) -> Result<Arc<V>> {
        let context = self.slot.owner.current_context()?;
        self.slot.owner.check_sharing(&context)?;
        self.materialize(&context, thread::current().id())
    }

    /// Value of another thread in the entered context
    ///
    /// # Errors
    ///
    /// Same as [`get`](Self::get).
    pub fn get_for_thread(&self, thread: ThreadId) -> Result<Option<Arc<V>>> {
        let context = self.slot.owner.current_context()?;
        self.read(&context, thread)
    }

    /// Value of a thread in an explicit context
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidSharing` if the owner is exclusive to another
    /// context or belongs to another engine.
    pub fn get_in(&self, context: &ContextHandle, thread: ThreadId) -> Result<Option<Arc<V>>> {
        let context = context.upgrade()?;
        self.read(&context, thread)
    }

    fn read(&self, context: &Arc<ContextInner>, thread: ThreadId) -> Result<Option<Arc<V>>> {
        self.slot.owner.check_sharing(context)?;
        if let Some(value) = context.storage.peek_thread(self.slot.key, thread) {
            return downcast(value).map(Some);
        }
        if !context.is_thread_admitted(thread) {
            return Ok(None);
        }
        self.materialize(context, thread).map(Some)
    }

    fn materialize(&self, context: &Arc<ContextInner>, thread: ThreadId) -> Result<Arc<V>> {
        let value = context
            .storage
            .get_or_init_for_thread(self.slot.key, thread, || {
                self.slot.materialize(context, thread)
            })?;
        downcast(value)
    }
}
