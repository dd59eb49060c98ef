//! Polyhost Core - Context and Thread Lifecycle for a Polyglot Engine
//!
//! This crate hosts guest languages inside isolated contexts and manages:
//! - Language registration, dependency ordering and per-context language state
//! - Thread admission, single- and multi-threaded contexts, polyglot threads
//! - Context-local and context-thread-local slots owned by languages and instruments
//! - Close, cancellation, interruption and background collection of contexts
//! - Reuse of pre-initialized contexts through patching
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                 Engine                      │
//! │  (Languages, Instruments, Reaper thread)    │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │                Context                      │
//! │ (Admission, Lifecycle, Safepoints, Patch)   │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │            Language contexts                │
//! │    (Env, guest state, polyglot threads)     │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │              Slot storage                   │
//! │ (ContextLocal, ContextThreadLocal, layout)  │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use polyhost_core::{Engine, LanguageRegistration};
//!
//! let engine = Engine::builder()
//!     .language(LanguageRegistration::new("js", |locals| MyLanguage::new(locals)))
//!     .build()?;
//! let context = engine.create_context()?;
//! let value = context.eval("js", "1 + 1")?;
//! context.close()?;
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod context;
pub mod engine;
pub mod env;
pub mod error;
pub mod instrument;
pub mod language;
mod liveness;
pub mod locals;
mod safepoint;
pub mod thread;
pub mod value;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::{ContextConfig, EngineConfig};
pub use context::{Context, ContextBuilder, ContextGuard, ContextHandle, ContextId, ContextPhase};
pub use engine::{Engine, EngineBuilder, EngineId};
pub use env::Env;
pub use error::{Error, GuestError, Result};
pub use instrument::{
    ExecutionListener, ExecutionListenerHandle, Instrument, InstrumentEnv, InstrumentHandle,
    InstrumentRegistration,
};
pub use language::{ContextPolicy, Language, LanguageHandle, LanguageRegistration, ThreadRequest};
pub use liveness::WeakEngine;
pub use locals::{
    ContextLocal, ContextThreadLocal, DynamicValue, InstrumentLocals, LanguageLocals, OwnerId,
    OwnerKind,
};
pub use thread::{PolyglotThread, PolyglotThreadBuilder};
pub use value::{Bindings, Value};
