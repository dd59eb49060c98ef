//! Slot value maps and the engine-wide exact-type table

use std::any::Any;
use std::sync::Arc;
use std::thread::ThreadId;

use dashmap::DashMap;
use once_cell::sync::OnceCell;

use crate::error::{Error, Result};
use crate::locals::registry::{OwnerId, OwnerInfo, OwnerKind, SlotKind};

pub(crate) type SlotValue = Arc<dyn Any + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SlotKey {
    pub(crate) owner: OwnerId,
    pub(crate) kind: SlotKind,
    pub(crate) index: u32,
}

type Cell = Arc<OnceCell<SlotValue>>;

/// Materialized slot values of one context
///
/// The first caller for a key runs the factory while later callers block on
/// the same cell until the value is committed. A failing factory leaves the
/// cell empty. A factory that reads its own slot deadlocks.
#[derive(Default)]
pub(crate) struct SlotStorage {
    values: DashMap<SlotKey, Cell>,
    thread_values: DashMap<(SlotKey, ThreadId), Cell>,
}

impl SlotStorage {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get_or_init(
        &self,
        key: SlotKey,
        init: impl FnOnce() -> Result<SlotValue>,
    ) -> Result<SlotValue> {
        if let Some(value) = self.values.get(&key).and_then(|cell| cell.get().cloned()) {
            return Ok(value);
        }
        let cell = self.values.entry(key).or_default().clone();
        cell.get_or_try_init(init).cloned()
    }

    pub(crate) fn get_or_init_for_thread(
        &self,
        key: SlotKey,
        thread: ThreadId,
        init: impl FnOnce() -> Result<SlotValue>,
    ) -> Result<SlotValue> {
        if let Some(value) = self.peek_thread(key, thread) {
            return Ok(value);
        }
        let cell = self.thread_values.entry((key, thread)).or_default().clone();
        cell.get_or_try_init(init).cloned()
    }

    /// Committed value of a (slot, thread) pair, if any
    pub(crate) fn peek_thread(&self, key: SlotKey, thread: ThreadId) -> Option<SlotValue> {
        self.thread_values
            .get(&(key, thread))
            .and_then(|cell| cell.get().cloned())
    }

    /// Drop every value so that the next access recomputes it
    pub(crate) fn invalidate(&self) {
        self.values.clear();
        self.thread_values.clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.values.len() + self.thread_values.len()
    }
}

/// Concrete type recorded per dynamic slot position
#[derive(Default)]
pub(crate) struct ExactTypes {
    types: DashMap<(OwnerKind, String, SlotKind, u32), &'static str>,
}

impl ExactTypes {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn check(
        &self,
        owner: &OwnerInfo,
        kind: SlotKind,
        index: u32,
        actual: &'static str,
    ) -> Result<()> {
        let expected = *self
            .types
            .entry((owner.kind, owner.registration.clone(), kind, index))
            .or_insert(actual);
        if expected != actual {
            return Err(Error::UnstableSlotType {
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(())
    }
}
