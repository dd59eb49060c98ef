//! Pre-initialized contexts and patching

mod common;

use std::sync::Arc;

use polyhost_core::testing::{Behavior, Counters, CountingLanguage};
use polyhost_core::{Engine, Error};

use common::{entries, journal};

fn patchable() -> Behavior {
    Behavior {
        patchable: true,
        ..Behavior::default()
    }
}

#[test]
fn test_patched_context_is_reused() {
    common::init_tracing();
    let counters = Arc::new(Counters::default());
    let engine = Engine::builder()
        .language(CountingLanguage::registration("lang", counters.clone(), patchable()))
        .preinitialize(["lang"])
        .build()
        .unwrap();
    let counts = counters.snapshot();
    assert_eq!(counts.create_context, 1);
    assert_eq!(counts.initialize_context, 1);
    assert_eq!(counts.initialize_thread, 0);
    assert_eq!(engine.live_contexts(), 0);

    let context = engine.context_builder().option("mode", "fast").build().unwrap();
    assert_eq!(engine.live_contexts(), 1);
    let counts = counters.snapshot();
    assert_eq!(counts.patch_context, 1);
    assert_eq!(counts.create_context, 1);

    let value = context.eval("lang", "option:mode").unwrap();
    assert_eq!(value.as_str(), Some("fast"));
    assert_eq!(counters.snapshot().initialize_thread, 1);

    let language = context.language::<CountingLanguage>("lang").unwrap();
    let env = language.env_local.get_in(&context.handle()).unwrap();
    assert_eq!(env.option("mode"), Some("fast"));
    assert!(!env.is_pre_initialization());

    let second = engine.create_context().unwrap();
    second.initialize("lang").unwrap();
    let counts = counters.snapshot();
    assert_eq!(counts.patch_context, 1);
    assert_eq!(counts.create_context, 2);

    engine.close().unwrap();
    assert_eq!(counters.snapshot().dispose_context, 2);
}

#[test]
fn test_language_outside_preinitialized_set_is_created_fresh() {
    common::init_tracing();
    let first = Arc::new(Counters::default());
    let second = Arc::new(Counters::default());
    let engine = Engine::builder()
        .language(CountingLanguage::registration("first", first.clone(), patchable()))
        .language(CountingLanguage::registration("second", second.clone(), Behavior::default()))
        .preinitialize(["first"])
        .build()
        .unwrap();
    let counts = first.snapshot();
    assert_eq!(counts.create_context, 1);
    assert_eq!(counts.initialize_context, 1);
    assert_eq!(second.snapshot().create_context, 0);

    let context = engine.create_context().unwrap();
    context.eval("first", "value:1").unwrap();
    context.eval("second", "value:2").unwrap();

    let counts = first.snapshot();
    assert_eq!(counts.create_context, 1);
    assert_eq!(counts.patch_context, 1);
    assert_eq!(counts.dispose_context, 0);
    let counts = second.snapshot();
    assert_eq!(counts.create_context, 1);
    assert_eq!(counts.initialize_context, 1);
    assert_eq!(counts.patch_context, 0);

    context.close().unwrap();
    assert_eq!(first.snapshot().dispose_context, 1);
    assert_eq!(second.snapshot().dispose_context, 1);
}

#[test]
fn test_rejected_patch_creates_fresh_context() {
    common::init_tracing();
    let counters = Arc::new(Counters::default());
    let journal = journal();
    let behavior = |dependencies: &[&str], fail_patch: bool| Behavior {
        dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
        patchable: true,
        fail_patch,
        journal: Some(journal.clone()),
        ..Behavior::default()
    };
    let engine = Engine::builder()
        .language(CountingLanguage::registration("app", counters.clone(), behavior(&["base"], true)))
        .language(CountingLanguage::registration("base", counters.clone(), behavior(&[], false)))
        .preinitialize(["app"])
        .build()
        .unwrap();
    assert_eq!(
        entries(&journal, "initialize_context"),
        vec!["initialize_context:base", "initialize_context:app"]
    );

    let context = engine.context_builder().option("mode", "slow").build().unwrap();
    assert_eq!(
        entries(&journal, "patch_context"),
        vec!["patch_context:base", "patch_context:app"]
    );
    assert_eq!(
        entries(&journal, "dispose_context"),
        vec!["dispose_context:app", "dispose_context:base"]
    );
    assert_eq!(counters.snapshot().create_context, 2);

    let value = context.eval("app", "option:mode").unwrap();
    assert_eq!(value.as_str(), Some("slow"));
    let counts = counters.snapshot();
    assert_eq!(counts.create_context, 4);
    assert_eq!(counts.patch_context, 2);
}

#[test]
fn test_unpatchable_language_is_not_reused() {
    common::init_tracing();
    let counters = Arc::new(Counters::default());
    let engine = Engine::builder()
        .language(CountingLanguage::registration("lang", counters.clone(), Behavior::default()))
        .preinitialize(["lang"])
        .build()
        .unwrap();

    let context = engine.create_context().unwrap();
    let counts = counters.snapshot();
    assert_eq!(counts.patch_context, 1);
    assert_eq!(counts.dispose_context, 1);
    assert_eq!(counts.create_context, 1);

    context.initialize("lang").unwrap();
    assert_eq!(counters.snapshot().create_context, 2);
}

#[test]
fn test_preinitialization_of_unknown_language_fails() {
    common::init_tracing();
    let counters = Arc::new(Counters::default());
    let err = Engine::builder()
        .language(CountingLanguage::registration("lang", counters, Behavior::default()))
        .preinitialize(["missing"])
        .build()
        .unwrap_err();
    assert!(matches!(err, Error::LanguageNotFound(_)));
}

#[test]
fn test_engine_close_discards_unused_preinitialized_context() {
    common::init_tracing();
    let counters = Arc::new(Counters::default());
    let engine = Engine::builder()
        .language(CountingLanguage::registration("lang", counters.clone(), patchable()))
        .preinitialize(["lang"])
        .build()
        .unwrap();
    engine.close().unwrap();
    let counts = counters.snapshot();
    assert_eq!(counts.finalize_context, 1);
    assert_eq!(counts.dispose_context, 1);
    assert_eq!(counts.initialize_thread, 1);
    assert_eq!(counts.dispose_thread, 1);
}
