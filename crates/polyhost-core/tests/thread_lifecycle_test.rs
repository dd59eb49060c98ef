//! Thread admission, multi-threading and close ordering

mod common;

use std::sync::Arc;
use std::thread;

use polyhost_core::testing::{Behavior, Counters, CountingLanguage};
use polyhost_core::{ContextPhase, Engine, Error};

use common::{entries, journal, multi_threaded, single_language};

#[test]
fn test_ten_threads_are_initialized_and_disposed_once() {
    let (engine, counters) = single_language(multi_threaded()).unwrap();
    let context = engine.create_context().unwrap();
    assert!(context.initialize("lang").unwrap());
    assert!(!context.initialize("lang").unwrap());
    assert_eq!(context.phase(), ContextPhase::SingleThreaded);

    let workers: Vec<_> = (0..10)
        .map(|i| {
            let context = context.clone();
            thread::spawn(move || {
                for _ in 0..3 {
                    let value = context.eval("lang", &format!("value:{i}")).unwrap();
                    assert_eq!(value.as_i64(), Some(i));
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(context.phase(), ContextPhase::MultiThreaded);

    context.close().unwrap();
    assert!(context.is_closed());
    assert_eq!(context.phase(), ContextPhase::Closed);

    let counts = counters.snapshot();
    assert_eq!(counts.create_context, 1);
    assert_eq!(counts.initialize_context, 1);
    assert_eq!(counts.initialize_thread, 11);
    assert_eq!(counts.initialize_multi_threading, 1);
    assert_eq!(counts.finalize_context, 1);
    assert_eq!(counts.finalize_thread, 11);
    assert_eq!(counts.dispose_thread, 11);
    assert_eq!(counts.dispose_context, 1);
}

#[test]
fn test_single_threaded_language_denies_second_thread() {
    let (engine, counters) = single_language(Behavior::default()).unwrap();
    let context = engine.create_context().unwrap();
    context.eval("lang", "value:1").unwrap();

    let worker = {
        let context = context.clone();
        thread::Builder::new()
            .name("worker".to_string())
            .spawn(move || context.eval("lang", "value:2").unwrap_err())
            .unwrap()
    };
    let err = worker.join().unwrap();
    assert!(matches!(err, Error::AccessDenied { .. }));
    assert_eq!(
        err.to_string(),
        "Multi threaded access requested by thread worker but is not allowed for language(s) lang."
    );
    assert_eq!(context.phase(), ContextPhase::SingleThreaded);

    context.close().unwrap();
    assert_eq!(counters.snapshot().initialize_thread, 1);
    assert_eq!(counters.snapshot().dispose_thread, 1);
}

#[test]
fn test_language_created_in_multi_threaded_context_is_asked_for_all_threads() {
    common::init_tracing();
    let counters = Arc::new(Counters::default());
    let engine = Engine::builder()
        .language(CountingLanguage::registration("shared", counters.clone(), multi_threaded()))
        .language(CountingLanguage::registration("single", counters.clone(), Behavior::default()))
        .build()
        .unwrap();
    let context = engine.create_context().unwrap();
    context.eval("shared", "value:1").unwrap();
    {
        let context = context.clone();
        thread::spawn(move || context.eval("shared", "value:2").unwrap())
            .join()
            .unwrap();
    }

    let err = context.initialize("single").unwrap_err();
    let message = err.to_string();
    assert!(message.starts_with("Multi threaded access requested by thread "), "{message}");
    assert!(message.ends_with("is not allowed for language(s) single."), "{message}");

    context.close().unwrap();
    let counts = counters.snapshot();
    assert_eq!(counts.create_context, 1);
    assert_eq!(counts.dispose_context, 1);
}

#[test]
fn test_close_rejects_explicitly_entered_thread() {
    let (engine, _counters) = single_language(Behavior::default()).unwrap();
    let context = engine.create_context().unwrap();

    let guard = context.enter().unwrap();
    assert_eq!(guard.context(), context.handle());
    let err = context.close().unwrap_err();
    assert_eq!(
        err.to_string(),
        "The context is explicitly entered on the current thread. Call leave() before closing the context to resolve this."
    );
    assert!(!context.is_closed());

    guard.leave();
    context.close().unwrap();
    assert!(context.is_closed());

    let err = context.eval("lang", "value:1").unwrap_err();
    assert_eq!(err.to_string(), "The Context is already closed.");
    assert!(context.enter().is_err());
    context.close().unwrap();
}

#[test]
fn test_nested_entries_balance() {
    let (engine, counters) = single_language(Behavior::default()).unwrap();
    let context = engine.create_context().unwrap();
    let outer = context.enter().unwrap();
    let inner = context.enter().unwrap();
    assert_eq!(context.eval("lang", "value:3").unwrap().as_i64(), Some(3));
    drop(inner);
    drop(outer);
    context.close().unwrap();
    assert_eq!(counters.snapshot().initialize_thread, 1);
}

#[test]
fn test_close_hooks_run_in_reverse_dependency_order() {
    common::init_tracing();
    let counters = Arc::new(Counters::default());
    let journal = journal();
    let behavior = |dependencies: &[&str]| Behavior {
        dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
        journal: Some(journal.clone()),
        ..Behavior::default()
    };
    let engine = Engine::builder()
        .language(CountingLanguage::registration("app", counters.clone(), behavior(&["lib"])))
        .language(CountingLanguage::registration("lib", counters.clone(), behavior(&["base"])))
        .language(CountingLanguage::registration("base", counters.clone(), behavior(&[])))
        .build()
        .unwrap();
    assert_eq!(engine.languages(), vec!["base", "lib", "app"]);

    let context = engine.create_context().unwrap();
    context.eval("app", "value:1").unwrap();
    assert_eq!(
        entries(&journal, "initialize_context"),
        vec![
            "initialize_context:base",
            "initialize_context:lib",
            "initialize_context:app"
        ]
    );

    context.close().unwrap();
    assert_eq!(
        entries(&journal, "finalize_context"),
        vec![
            "finalize_context:app",
            "finalize_context:lib",
            "finalize_context:base"
        ]
    );
    assert_eq!(
        entries(&journal, "dispose_context"),
        vec![
            "dispose_context:app",
            "dispose_context:lib",
            "dispose_context:base"
        ]
    );

    let journal = journal.lock();
    let last_finalize = journal
        .iter()
        .rposition(|e| e.starts_with("finalize_context"))
        .unwrap();
    let first_dispose_thread = journal
        .iter()
        .position(|e| e.starts_with("dispose_thread"))
        .unwrap();
    assert!(last_finalize < first_dispose_thread);
}

#[test]
fn test_failed_finalization_can_be_retried() {
    let (engine, counters) = single_language(Behavior {
        finalize_failures: 1,
        ..Behavior::default()
    })
    .unwrap();
    let context = engine.create_context().unwrap();
    context.initialize("lang").unwrap();

    let err = context.close().unwrap_err();
    assert_eq!(err.to_string(), "finalization of lang failed");
    assert!(!context.is_closed());
    assert_eq!(counters.snapshot().dispose_context, 0);

    context.close().unwrap();
    let counts = counters.snapshot();
    assert_eq!(counts.finalize_context, 2);
    assert_eq!(counts.dispose_context, 1);
}

#[test]
fn test_failed_disposal_can_be_retried_without_repeating_thread_hooks() {
    let (engine, counters) = single_language(Behavior {
        dispose_failures: 1,
        ..Behavior::default()
    })
    .unwrap();
    let context = engine.create_context().unwrap();
    context.eval("lang", "value:1").unwrap();

    assert!(context.close().is_err());
    assert!(!context.is_closed());
    context.close().unwrap();

    let counts = counters.snapshot();
    assert_eq!(counts.finalize_context, 1);
    assert_eq!(counts.finalize_thread, 1);
    assert_eq!(counts.dispose_thread, 1);
    assert_eq!(counts.dispose_context, 2);
}

#[test]
fn test_permitted_languages_restrict_embedder_access() {
    common::init_tracing();
    let counters = Arc::new(Counters::default());
    let engine = Engine::builder()
        .language(CountingLanguage::registration("a", counters.clone(), Behavior::default()))
        .language(CountingLanguage::registration("b", counters.clone(), Behavior::default()))
        .build()
        .unwrap();
    let context = engine
        .context_builder()
        .permitted_languages(["a"])
        .build()
        .unwrap();
    assert!(context.eval("a", "value:1").is_ok());
    let err = context.eval("b", "value:1").unwrap_err();
    assert_eq!(err.to_string(), "The language 'b' is not permitted in this context.");

    let err = context.eval("missing", "value:1").unwrap_err();
    assert!(matches!(err, Error::LanguageNotFound(_)));
    assert_eq!(err.to_string(), "No language for id missing found.");
}

#[test]
fn test_language_lookup_returns_instance() {
    let (engine, counters) = single_language(Behavior::default()).unwrap();
    let context = engine.create_context().unwrap();
    let language = context.language::<CountingLanguage>("lang").unwrap();
    assert_eq!(language.id(), "lang");
    assert!(Arc::ptr_eq(language.counters(), &counters));
    assert_eq!(counters.snapshot().initialize_context, 1);
}

#[test]
fn test_engine_close_closes_contexts_and_rejects_new_ones() {
    let (engine, counters) = single_language(Behavior::default()).unwrap();
    let first = engine.create_context().unwrap();
    let second = engine.create_context().unwrap();
    first.initialize("lang").unwrap();
    second.initialize("lang").unwrap();
    assert_eq!(engine.live_contexts(), 2);

    engine.close().unwrap();
    assert!(first.is_closed());
    assert!(second.is_closed());
    assert_eq!(engine.live_contexts(), 0);
    assert_eq!(counters.snapshot().dispose_context, 2);
    assert!(engine.create_context().is_err());
}
