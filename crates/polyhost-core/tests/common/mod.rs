//! Shared helpers for integration tests

#![allow(dead_code)]

use std::sync::Arc;

use polyhost_core::testing::{Behavior, Counters, CountingLanguage, Journal};
use polyhost_core::{Engine, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install a test subscriber once; honours `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

/// Engine with a single counting language named `lang`
pub fn single_language(behavior: Behavior) -> Result<(Engine, Arc<Counters>)> {
    init_tracing();
    let counters = Arc::new(Counters::default());
    let engine = Engine::builder()
        .language(CountingLanguage::registration("lang", counters.clone(), behavior))
        .build()?;
    Ok((engine, counters))
}

pub fn multi_threaded() -> Behavior {
    Behavior {
        allow_multi_threading: true,
        ..Behavior::default()
    }
}

pub fn journal() -> Journal {
    Journal::default()
}

pub fn entries(journal: &Journal, prefix: &str) -> Vec<String> {
    journal
        .lock()
        .iter()
        .filter(|entry| entry.starts_with(prefix))
        .cloned()
        .collect()
}
