//! Testing infrastructure for Polyhost Core
//!
//! Instrumented language and instrument implementations that count every
//! lifecycle hook, plus small helpers for waiting on background work.
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use polyhost_core::Engine;
//! use polyhost_core::testing::{Behavior, Counters, CountingLanguage};
//!
//! let counters = Arc::new(Counters::default());
//! let engine = Engine::builder()
//!     .language(CountingLanguage::registration("test", counters.clone(), Behavior::default()))
//!     .build()?;
//! let context = engine.create_context()?;
//! context.initialize("test")?;
//! assert_eq!(counters.snapshot().create_context, 1);
//! # Ok::<(), polyhost_core::Error>(())
//! ```

mod instrument;
mod language;

pub use instrument::{RecordingInstrument, RecordingListener};
pub use language::{Behavior, CountSnapshot, Counters, CountingContext, CountingLanguage, Journal};

use std::thread;
use std::time::{Duration, Instant};

/// Poll `condition` until it holds or `timeout` elapsed
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(2));
    }
}
