//! Polyglot threads created by languages

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};

use parking_lot::Mutex;
use polyhost_core::testing::{CountingLanguage, Journal};
use polyhost_core::{Context, Env, Error, PolyglotThread};

use common::{entries, journal, multi_threaded, single_language};

fn env_of(context: &Context) -> Arc<Env> {
    let language = context.language::<CountingLanguage>("lang").unwrap();
    language.env_local.get_in(&context.handle()).unwrap()
}

#[test]
fn test_spawned_threads_are_disposed_when_they_finish() {
    let (engine, counters) = single_language(multi_threaded()).unwrap();
    let context = engine.create_context().unwrap();
    assert_eq!(context.eval("lang", "spawn:3").unwrap().as_i64(), Some(3));

    let counts = counters.snapshot();
    assert_eq!(counts.initialize_thread, 4);
    assert_eq!(counts.initialize_multi_threading, 1);
    assert_eq!(counts.dispose_thread, 3);

    context.close().unwrap();
    assert_eq!(counters.snapshot().dispose_thread, 4);
}

#[test]
fn test_notifications_surround_the_body() {
    let (engine, _counters) = single_language(multi_threaded()).unwrap();
    let context = engine.create_context().unwrap();
    let env = env_of(&context);
    let events = Arc::new(Mutex::new(Vec::new()));

    let (before, body, after) = (events.clone(), events.clone(), events.clone());
    let thread = env
        .create_thread(move |env| {
            body.lock().push(format!("body:{}", env.language_id()));
            Ok(())
        })
        .unwrap()
        .name("guest-worker")
        .before_enter(move || {
            before.lock().push("before_enter".to_string());
            Ok(())
        })
        .after_leave(move || {
            after.lock().push("after_leave".to_string());
            Ok(())
        })
        .start()
        .unwrap();
    assert_ne!(thread.thread_id(), std::thread::current().id());
    thread.join().unwrap();

    assert_eq!(*events.lock(), vec!["before_enter", "body:lang", "after_leave"]);
    context.close().unwrap();
}

#[test]
fn test_context_cannot_be_entered_from_notifications() {
    let (engine, _counters) = single_language(multi_threaded()).unwrap();
    let context = engine.create_context().unwrap();
    let env = env_of(&context);
    let (tx, rx) = mpsc::channel();

    let inside = context.clone();
    env.create_thread(|_env| Ok(()))
        .unwrap()
        .before_enter(move || {
            let result = inside.enter().map(|_| ());
            tx.send(result.map_err(|e| e.to_string())).ok();
            Ok(())
        })
        .start()
        .unwrap()
        .join()
        .unwrap();

    assert_eq!(
        rx.recv().unwrap().unwrap_err(),
        "Context cannot be entered in polyglot thread's beforeEnter or afterLeave notifications."
    );
    context.close().unwrap();
}

#[test]
fn test_failing_before_enter_skips_body() {
    let (engine, counters) = single_language(multi_threaded()).unwrap();
    let context = engine.create_context().unwrap();
    let env = env_of(&context);
    let uncaught = Arc::new(Mutex::new(Vec::new()));
    let ran = Arc::new(Mutex::new(false));

    let (reported, body_ran) = (uncaught.clone(), ran.clone());
    env.create_thread(move |_env| {
        *body_ran.lock() = true;
        Ok(())
    })
    .unwrap()
    .before_enter(|| Err(Error::illegal_state("not now")))
    .on_uncaught(move |e| reported.lock().push(e.to_string()))
    .start()
    .unwrap()
    .join()
    .unwrap();

    assert!(!*ran.lock());
    assert_eq!(*uncaught.lock(), vec!["not now"]);
    assert_eq!(counters.snapshot().initialize_thread, 1);
    context.close().unwrap();
}

/// Start a thread whose notifications both fail after taking the next slot
fn start_with_failing_notifications(
    env: &Env,
    name: &str,
    journal: &Journal,
    slots: &Arc<AtomicUsize>,
    uncaught: &Arc<Mutex<Vec<String>>>,
) -> PolyglotThread {
    let notification = |kind: &'static str| {
        let (name, journal, slots) = (name.to_string(), journal.clone(), slots.clone());
        move || -> Result<(), Error> {
            let slot = slots.fetch_add(1, Ordering::SeqCst) + 1;
            journal.lock().push(format!("{name}:{kind}:{slot}"));
            Err(Error::illegal_state(format!("{kind} of {name} failed")))
        }
    };
    let reported = uncaught.clone();
    env.create_thread(|_env| Ok(()))
        .unwrap()
        .name(name)
        .before_enter(notification("before_enter"))
        .after_leave(notification("after_leave"))
        .on_uncaught(move |e| reported.lock().push(e.to_string()))
        .start()
        .unwrap()
}

#[test]
fn test_failing_notifications_of_two_threads_fill_all_slots() {
    let (engine, counters) = single_language(multi_threaded()).unwrap();
    let context = engine.create_context().unwrap();
    let env = env_of(&context);
    let journal = journal();
    let slots = Arc::new(AtomicUsize::new(0));
    let uncaught = Arc::new(Mutex::new(Vec::new()));

    let first = start_with_failing_notifications(&env, "first", &journal, &slots, &uncaught);
    let second = start_with_failing_notifications(&env, "second", &journal, &slots, &uncaught);
    first.join().unwrap();
    second.join().unwrap();

    for name in ["first", "second"] {
        let kinds: Vec<String> = entries(&journal, name)
            .iter()
            .map(|entry| entry.split(':').nth(1).unwrap().to_string())
            .collect();
        assert_eq!(kinds, vec!["before_enter", "after_leave"]);
    }
    let mut taken: Vec<usize> = journal
        .lock()
        .iter()
        .map(|entry| entry.rsplit(':').next().unwrap().parse().unwrap())
        .collect();
    taken.sort_unstable();
    assert_eq!(taken, vec![1, 2, 3, 4]);

    let mut reported = uncaught.lock().clone();
    reported.sort();
    assert_eq!(
        reported,
        vec![
            "after_leave of first failed",
            "after_leave of second failed",
            "before_enter of first failed",
            "before_enter of second failed",
        ]
    );
    assert_eq!(counters.snapshot().initialize_thread, 1);
    context.close().unwrap();
}

#[test]
fn test_failing_after_leave_still_retires_thread() {
    let (engine, counters) = single_language(multi_threaded()).unwrap();
    let context = engine.create_context().unwrap();
    let env = env_of(&context);
    let uncaught = Arc::new(Mutex::new(Vec::new()));
    let ran = Arc::new(Mutex::new(false));

    let (reported, body_ran) = (uncaught.clone(), ran.clone());
    env.create_thread(move |_env| {
        *body_ran.lock() = true;
        Ok(())
    })
    .unwrap()
    .after_leave(|| Err(Error::illegal_state("cleanup failed")))
    .on_uncaught(move |e| reported.lock().push(e.to_string()))
    .start()
    .unwrap()
    .join()
    .unwrap();

    assert!(*ran.lock());
    assert_eq!(*uncaught.lock(), vec!["cleanup failed"]);
    let counts = counters.snapshot();
    assert_eq!(counts.initialize_thread, 2);
    assert_eq!(counts.dispose_thread, 1);

    context.close().unwrap();
    assert_eq!(counters.snapshot().dispose_thread, 2);
}

#[test]
fn test_errors_and_panics_go_to_uncaught_handler() {
    let (engine, _counters) = single_language(multi_threaded()).unwrap();
    let context = engine.create_context().unwrap();
    let env = env_of(&context);
    let uncaught = Arc::new(Mutex::new(Vec::new()));

    let reported = uncaught.clone();
    env.create_thread(|_env| Err(Error::guest("guest failure")))
        .unwrap()
        .on_uncaught(move |e| reported.lock().push(e.to_string()))
        .start()
        .unwrap()
        .join()
        .unwrap();

    let reported = uncaught.clone();
    env.create_thread(|_env| panic!("guest panic"))
        .unwrap()
        .on_uncaught(move |e| reported.lock().push(e.to_string()))
        .start()
        .unwrap()
        .join()
        .unwrap();

    assert_eq!(
        *uncaught.lock(),
        vec!["guest failure", "Internal error: guest panic"]
    );
    context.close().unwrap();
}

#[test]
fn test_close_fails_while_polyglot_thread_runs() {
    let (engine, counters) = single_language(multi_threaded()).unwrap();
    let context = engine.create_context().unwrap();
    let env = env_of(&context);

    let (waiting_tx, waiting_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let thread = env
        .create_thread(|_env| Ok(()))
        .unwrap()
        .before_enter(move || {
            waiting_tx.send(()).ok();
            release_rx.recv().ok();
            Ok(())
        })
        .start()
        .unwrap();
    waiting_rx.recv().unwrap();

    let err = context.close().unwrap_err();
    assert!(matches!(err, Error::PolyglotThreadsNotCompleted(ref threads) if threads == &[thread.thread_id()]));
    assert!(err
        .to_string()
        .starts_with("The language did not complete all polyglot threads but should have:"));
    assert!(!context.is_closed());

    release_tx.send(()).unwrap();
    thread.join().unwrap();
    context.close().unwrap();
    assert!(context.is_closed());
    assert_eq!(counters.snapshot().dispose_context, 1);
}

#[test]
fn test_threads_cannot_start_in_closed_context() {
    let (engine, _counters) = single_language(multi_threaded()).unwrap();
    let context = engine.create_context().unwrap();
    let env = env_of(&context);
    let builder = env.create_thread(|_env| Ok(())).unwrap();

    context.close().unwrap();
    let err = builder.start().unwrap_err();
    assert_eq!(err.to_string(), "The Context is already closed.");
    assert!(env.create_thread(|_env| Ok(())).is_err());
}
