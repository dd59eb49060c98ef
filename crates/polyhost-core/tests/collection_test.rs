//! Collection of unreachable contexts and engines

mod common;

use std::sync::{Arc, Barrier, mpsc};
use std::thread;
use std::time::Duration;

use polyhost_core::testing::{Behavior, CountingLanguage, RecordingInstrument};
use polyhost_core::{ContextPhase, Engine, Error};

use common::{multi_threaded, single_language};

#[test]
fn test_dropped_context_is_collected() {
    let (engine, counters) = single_language(Behavior::default()).unwrap();
    let context = engine.create_context().unwrap();
    context.eval("lang", "value:1").unwrap();
    let handle = context.handle();
    assert_eq!(engine.live_contexts(), 1);

    drop(context);
    engine.collect();

    assert!(handle.is_closed());
    assert_eq!(handle.phase(), ContextPhase::Closed);
    assert_eq!(engine.live_contexts(), 0);
    let counts = counters.snapshot();
    assert_eq!(counts.finalize_context, 1);
    assert_eq!(counts.initialize_thread, 2);
    assert_eq!(counts.dispose_thread, 2);
    assert_eq!(counts.dispose_context, 1);
}

#[test]
fn test_value_keeps_context_reachable() {
    let (engine, counters) = single_language(Behavior::default()).unwrap();
    let context = engine.create_context().unwrap();
    let value = context.eval("lang", "value:42").unwrap();
    let handle = context.handle();
    assert_eq!(value.context(), handle);

    drop(context);
    engine.collect();
    assert!(!handle.is_closed());
    assert_eq!(value.as_i64(), Some(42));
    assert_eq!(value.to_string(), "42");

    let copy = value.clone();
    drop(value);
    engine.collect();
    assert!(!handle.is_closed());

    assert_eq!(copy.into_json(), serde_json::json!(42));
    engine.collect();
    assert!(handle.is_closed());
    assert_eq!(counters.snapshot().dispose_context, 1);
}

#[test]
fn test_guest_error_keeps_context_reachable() {
    let (engine, _counters) = single_language(Behavior::default()).unwrap();
    let context = engine.create_context().unwrap();
    let err = context.eval("lang", "fail:boom").unwrap_err();
    let handle = context.handle();

    let Error::Guest(guest) = &err else {
        panic!("expected a guest error, got {err:?}");
    };
    assert_eq!(guest.message(), "boom");
    assert_eq!(guest.context(), Some(handle.clone()));

    drop(context);
    engine.collect();
    assert!(!handle.is_closed());

    drop(err);
    engine.collect();
    assert!(handle.is_closed());
}

#[test]
fn test_bindings_keep_context_reachable() {
    let (engine, _counters) = single_language(Behavior::default()).unwrap();
    let context = engine.create_context().unwrap();
    let bindings = context.polyglot_bindings().unwrap();
    assert_eq!(bindings.put("answer", serde_json::json!(42)).unwrap(), None);
    assert_eq!(bindings.put("name", serde_json::json!("poly")).unwrap(), None);
    let handle = context.handle();

    drop(context);
    engine.collect();
    assert!(!handle.is_closed());

    let answer = bindings.get("answer").unwrap().unwrap();
    assert_eq!(answer.as_i64(), Some(42));
    assert_eq!(bindings.keys().unwrap(), vec!["answer", "name"]);
    assert_eq!(bindings.remove("name").unwrap(), Some(serde_json::json!("poly")));
    assert!(bindings.get("name").unwrap().is_none());

    drop(answer);
    drop(bindings);
    engine.collect();
    assert!(handle.is_closed());
}

#[test]
fn test_bindings_are_shared_with_languages() {
    let (engine, _counters) = single_language(Behavior::default()).unwrap();
    let context = engine.create_context().unwrap();
    let language = context.language::<CountingLanguage>("lang").unwrap();
    let env = language.env_local.get_in(&context.handle()).unwrap();

    env.export_symbol("from_guest", serde_json::json!([1, 2])).unwrap();
    let bindings = context.polyglot_bindings().unwrap();
    assert_eq!(
        bindings.get("from_guest").unwrap().unwrap().as_json(),
        &serde_json::json!([1, 2])
    );

    bindings.put("from_host", serde_json::json!(true)).unwrap();
    assert_eq!(env.import_symbol("from_host").unwrap(), Some(serde_json::json!(true)));

    context.close().unwrap();
    assert!(bindings.keys().is_err());
    assert!(env.import_symbol("from_host").is_err());
}

#[test]
fn test_running_polyglot_thread_keeps_context_reachable() {
    let (engine, _counters) = single_language(multi_threaded()).unwrap();
    let context = engine.create_context().unwrap();
    let language = context.language::<CountingLanguage>("lang").unwrap();
    let env = language.env_local.get_in(&context.handle()).unwrap();
    let handle = context.handle();

    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let thread = env
        .create_thread(move |_env| {
            started_tx.send(()).ok();
            release_rx.recv().ok();
            Ok(())
        })
        .unwrap()
        .start()
        .unwrap();
    started_rx.recv().unwrap();

    drop(context);
    engine.collect();
    assert!(!handle.is_closed());

    release_tx.send(()).unwrap();
    thread.join().unwrap();
    engine.collect();
    assert!(handle.is_closed());
}

#[test]
fn test_unstarted_polyglot_thread_does_not_keep_context_reachable() {
    let (engine, counters) = single_language(multi_threaded()).unwrap();
    let context = engine.create_context().unwrap();
    let handle = context.handle();
    let builder = {
        let language = context.language::<CountingLanguage>("lang").unwrap();
        let env = language.env_local.get_in(&handle).unwrap();
        env.create_thread(|_env| Ok(())).unwrap()
    };

    drop(context);
    engine.collect();
    assert!(handle.is_closed());
    assert_eq!(counters.snapshot().dispose_context, 1);
    assert_eq!(builder.start().unwrap_err().to_string(), "The Context is already closed.");
}

#[test]
fn test_entered_context_is_collected_only_after_leave() {
    let (engine, counters) = single_language(Behavior::default()).unwrap();
    let context = engine.create_context().unwrap();
    context.initialize("lang").unwrap();
    let handle = context.handle();

    let guard = context.enter().unwrap();
    drop(context);
    engine.collect();
    assert!(!handle.is_closed());
    assert_eq!(counters.snapshot().dispose_context, 0);

    drop(guard);
    engine.collect();
    assert!(handle.is_closed());
    assert_eq!(counters.snapshot().dispose_context, 1);
}

#[test]
fn test_contexts_released_together_are_disposed_once_each() {
    let (engine, counters) = single_language(Behavior::default()).unwrap();
    let contexts: Vec<_> = (0..8)
        .map(|i| {
            let context = engine.create_context().unwrap();
            context.eval("lang", &format!("value:{i}")).unwrap();
            context
        })
        .collect();
    let handles: Vec<_> = contexts.iter().map(|c| c.handle()).collect();
    assert_eq!(engine.live_contexts(), 8);

    let barrier = Arc::new(Barrier::new(contexts.len()));
    let releasers: Vec<_> = contexts
        .into_iter()
        .map(|context| {
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                drop(context);
            })
        })
        .collect();
    for releaser in releasers {
        releaser.join().unwrap();
    }
    engine.collect();

    assert!(handles.iter().all(|h| h.is_closed()));
    assert_eq!(engine.live_contexts(), 0);
    let counts = counters.snapshot();
    assert_eq!(counts.finalize_context, 8);
    assert_eq!(counts.dispose_context, 8);
}

#[test]
fn test_attached_listener_keeps_engine_reachable() {
    common::init_tracing();
    let engine = Engine::builder()
        .instrument(RecordingInstrument::registration("recorder"))
        .build()
        .unwrap();
    let weak = engine.downgrade();
    let recorder = engine
        .lookup_instrument::<RecordingInstrument>("recorder")
        .unwrap()
        .instrument()
        .clone();

    drop(engine);
    assert!(!weak.wait_disposed(Duration::from_millis(100)));
    assert_eq!(recorder.disposed(), 0);

    recorder.detach();
    assert!(weak.wait_disposed(Duration::from_secs(5)));
    assert_eq!(recorder.disposed(), 1);
}

#[test]
fn test_unreachable_engine_is_disposed() {
    let (engine, counters) = single_language(Behavior::default()).unwrap();
    let weak = engine.downgrade();
    let context = engine.create_context().unwrap();
    context.eval("lang", "value:1").unwrap();
    let handle = context.handle();

    drop(engine);
    assert!(!weak.is_disposed());
    drop(context);

    assert!(weak.wait_disposed(Duration::from_secs(5)));
    assert!(handle.is_closed());
    assert_eq!(counters.snapshot().dispose_context, 1);
}

#[test]
fn test_collection_can_be_disabled() {
    common::init_tracing();
    let counters = std::sync::Arc::new(polyhost_core::testing::Counters::default());
    let config = polyhost_core::EngineConfig {
        collect_on_release: false,
        ..Default::default()
    };
    let engine = Engine::builder()
        .config(config)
        .language(CountingLanguage::registration("lang", counters.clone(), Behavior::default()))
        .build()
        .unwrap();
    let context = engine.create_context().unwrap();
    context.initialize("lang").unwrap();
    let handle = context.handle();

    drop(context);
    engine.collect();
    assert!(!handle.is_closed());
    assert_eq!(engine.live_contexts(), 1);

    engine.close().unwrap();
    assert!(handle.is_closed());
    assert_eq!(counters.snapshot().dispose_context, 1);
}
