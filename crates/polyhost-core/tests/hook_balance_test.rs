//! Every initialized thread is disposed exactly once, whatever the workload

mod common;

use std::thread;

use proptest::prelude::*;

use common::{multi_threaded, single_language};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_thread_hooks_balance(
        workers in 1_usize..6,
        evals in 1_usize..4,
        polyglot in 0_usize..3,
    ) {
        let (engine, counters) = single_language(multi_threaded()).unwrap();
        let context = engine.create_context().unwrap();

        let handles: Vec<_> = (0..workers)
            .map(|i| {
                let context = context.clone();
                thread::spawn(move || {
                    for _ in 0..evals {
                        context.eval("lang", &format!("value:{i}")).unwrap();
                    }
                    if polyglot > 0 {
                        context.eval("lang", &format!("spawn:{polyglot}")).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        context.close().unwrap();

        let counts = counters.snapshot();
        let threads = workers + workers * polyglot;
        // the closing thread never entered
        let closing = 1;
        prop_assert_eq!(counts.create_context, 1);
        prop_assert_eq!(counts.initialize_thread, threads + closing);
        prop_assert_eq!(counts.finalize_thread, threads + closing);
        prop_assert_eq!(counts.dispose_thread, threads + closing);
        prop_assert_eq!(counts.initialize_multi_threading, usize::from(threads > 1));
        prop_assert_eq!(counts.dispose_context, 1);
    }

    #[test]
    fn prop_nested_entries_leave_context_closable(depth in 1_usize..8) {
        let (engine, counters) = single_language(Default::default()).unwrap();
        let context = engine.create_context().unwrap();
        let guards: Vec<_> = (0..depth).map(|_| context.enter().unwrap()).collect();
        prop_assert!(context.close().is_err());
        drop(guards);
        context.close().unwrap();
        prop_assert_eq!(counters.snapshot().initialize_thread, 1);
        prop_assert_eq!(counters.snapshot().dispose_thread, 1);
    }
}
