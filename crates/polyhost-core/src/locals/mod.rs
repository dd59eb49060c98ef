//! Engine-managed context-local and context-thread-local storage
//!
//! Owners (language and instrument instances) declare slots while they are
//! being constructed. Values are materialized lazily, at most once per
//! context or per (context, thread) pair:
//!
//! ```text
//!  owner constructor          context C                 thread T in C
//! ┌──────────────────┐      ┌──────────────────┐      ┌──────────────────┐
//! │ Locals registry  │─────▶│ ContextLocal<V>  │      │ ContextThread-   │
//! │ (frozen after    │      │  C -> Arc<V>     │      │ Local<V>         │
//! │  construction)   │─────────────────────────────────▶│ (C,T) -> Arc<V>  │
//! └──────────────────┘      └──────────────────┘      └──────────────────┘
//! ```
//!
//! Slot reads resolve the current context through the engine's per-thread
//! stack of entered contexts, never through an implicit thread local.

pub mod context_local;
pub mod registry;
pub(crate) mod storage;
pub mod thread_local;

pub use context_local::ContextLocal;
pub use registry::{InstrumentLocals, LanguageLocals, Locals, OwnerId, OwnerKind, SlotScope};
pub use thread_local::ContextThreadLocal;

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Type-erased slot value that remembers its concrete type
///
/// Returned by the factories of dynamic slots. The engine checks that every
/// value produced for one slot position has the same concrete type.
#[derive(Clone)]
pub struct DynamicValue {
    value: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl DynamicValue {
    /// Wrap a value
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            value: Arc::new(value),
            type_name: std::any::type_name::<T>(),
        }
    }

    /// Name of the concrete type
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Whether the value is of type `T`
    pub fn is<T: Any>(&self) -> bool {
        self.value.is::<T>()
    }

    /// Borrow the value as `T`
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    /// Whether both wrap the same allocation
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.value, &other.value)
    }
}

impl fmt::Debug for DynamicValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicValue")
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}
