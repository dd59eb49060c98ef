//! Language that counts its lifecycle hooks

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, ThreadId};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::json;

use crate::context::ContextId;
use crate::env::Env;
use crate::error::{Error, Result};
use crate::language::{ContextPolicy, Language, LanguageRegistration, ThreadRequest};
use crate::locals::{ContextLocal, ContextThreadLocal, LanguageLocals};

/// Ordered record of hook invocations, as `"hook:language"`
pub type Journal = Arc<Mutex<Vec<String>>>;

/// Invocation counts of every hook, summed over all instances
#[derive(Debug, Default)]
pub struct Counters {
    /// Languages constructed
    pub constructed: AtomicUsize,
    /// `create_context` calls
    pub create_context: AtomicUsize,
    /// `initialize_context` calls
    pub initialize_context: AtomicUsize,
    /// `patch_context` calls
    pub patch_context: AtomicUsize,
    /// `initialize_multi_threading` calls
    pub initialize_multi_threading: AtomicUsize,
    /// `initialize_thread` calls
    pub initialize_thread: AtomicUsize,
    /// `finalize_context` calls
    pub finalize_context: AtomicUsize,
    /// `finalize_thread` calls
    pub finalize_thread: AtomicUsize,
    /// `dispose_thread` calls
    pub dispose_thread: AtomicUsize,
    /// `dispose_context` calls
    pub dispose_context: AtomicUsize,
}

/// Plain copy of [`Counters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct CountSnapshot {
    pub constructed: usize,
    pub create_context: usize,
    pub initialize_context: usize,
    pub patch_context: usize,
    pub initialize_multi_threading: usize,
    pub initialize_thread: usize,
    pub finalize_context: usize,
    pub finalize_thread: usize,
    pub dispose_thread: usize,
    pub dispose_context: usize,
}

impl Counters {
    /// Read all counters
    pub fn snapshot(&self) -> CountSnapshot {
        let load = |counter: &AtomicUsize| counter.load(Ordering::SeqCst);
        CountSnapshot {
            constructed: load(&self.constructed),
            create_context: load(&self.create_context),
            initialize_context: load(&self.initialize_context),
            patch_context: load(&self.patch_context),
            initialize_multi_threading: load(&self.initialize_multi_threading),
            initialize_thread: load(&self.initialize_thread),
            finalize_context: load(&self.finalize_context),
            finalize_thread: load(&self.finalize_thread),
            dispose_thread: load(&self.dispose_thread),
            dispose_context: load(&self.dispose_context),
        }
    }
}

fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::SeqCst);
}

fn take_failure(remaining: &AtomicUsize) -> bool {
    remaining
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Knobs of a [`CountingLanguage`]
#[derive(Debug, Clone, Default)]
pub struct Behavior {
    /// Context policy of the registration
    pub policy: ContextPolicy,
    /// Languages to initialize first
    pub dependencies: Vec<String>,
    /// Allow more than one thread per context
    pub allow_multi_threading: bool,
    /// Accept `patch_context`
    pub patchable: bool,
    /// Fail `patch_context` with an error
    pub fail_patch: bool,
    /// Number of `finalize_context` calls that fail before one succeeds
    pub finalize_failures: usize,
    /// Number of `dispose_context` calls that fail before one succeeds
    pub dispose_failures: usize,
    /// Shared record of hook invocations
    pub journal: Option<Journal>,
}

/// Per-context state of a [`CountingLanguage`]
#[derive(Debug)]
pub struct CountingContext {
    env: RwLock<Env>,
}

impl CountingContext {
    /// Environment the context was created or last patched with
    pub fn env(&self) -> Env {
        self.env.read().clone()
    }
}

/// Language that counts every hook invocation
///
/// `eval` understands a handful of commands:
///
/// - `sleep:<ms>`: safepoint-aware sleep
/// - `spin`: poll the safepoint until cancelled or interrupted
/// - `fail:<message>`: raise a guest error
/// - `value:<json>`: return the parsed JSON
/// - `option:<key>`: return a context option
/// - `thread`: read the context thread local of the calling thread
/// - `spawn:<n>`: run `n` polyglot threads that read the thread local, and join them
pub struct CountingLanguage {
    id: String,
    counters: Arc<Counters>,
    behavior: Behavior,
    finalize_failures: AtomicUsize,
    dispose_failures: AtomicUsize,
    /// Environment of the language in the current context
    pub env_local: ContextLocal<Env>,
    /// Thread each value was created for
    pub thread_local: ContextThreadLocal<ThreadId>,
}

impl CountingLanguage {
    /// Construct the language, declaring its slots
    ///
    /// # Errors
    ///
    /// Fails if the registry is already frozen.
    pub fn new(
        id: &str,
        locals: &LanguageLocals,
        counters: Arc<Counters>,
        behavior: Behavior,
    ) -> Result<Self> {
        let env_local = locals.create_context_local(|env: &Env| env.clone())?;
        let seen: Arc<Mutex<HashSet<(ContextId, ThreadId)>>> = Arc::default();
        let thread_local = locals.create_context_thread_local(move |env: &Env, thread: ThreadId| {
            let first = seen.lock().insert((env.context().id(), thread));
            assert!(first, "duplicate thread local factory invocation");
            thread
        })?;
        bump(&counters.constructed);
        Ok(Self {
            id: id.to_string(),
            finalize_failures: AtomicUsize::new(behavior.finalize_failures),
            dispose_failures: AtomicUsize::new(behavior.dispose_failures),
            counters,
            behavior,
            env_local,
            thread_local,
        })
    }

    /// Registration that constructs a fresh `CountingLanguage` per instance
    pub fn registration(id: &str, counters: Arc<Counters>, behavior: Behavior) -> LanguageRegistration {
        let language_id = id.to_string();
        let policy = behavior.policy;
        let dependencies = behavior.dependencies.clone();
        let registration = LanguageRegistration::new(id, move |locals: &LanguageLocals| {
            CountingLanguage::new(&language_id, locals, counters.clone(), behavior.clone())
        })
        .policy(policy);
        dependencies
            .into_iter()
            .fold(registration, |registration, dependency| registration.depends_on(dependency))
    }

    /// Language id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Shared counters
    pub fn counters(&self) -> &Arc<Counters> {
        &self.counters
    }

    fn record(&self, hook: &str) {
        if let Some(journal) = &self.behavior.journal {
            journal.lock().push(format!("{hook}:{}", self.id));
        }
    }

    fn spawn(&self, env: &Env, count: usize) -> Result<serde_json::Value> {
        let mut threads = Vec::with_capacity(count);
        for _ in 0..count {
            let thread_local = self.thread_local.clone();
            let thread = env
                .create_thread(move |_env| thread_local.get().map(|_| ()))?
                .start()?;
            threads.push(thread);
        }
        for thread in threads {
            thread.join()?;
        }
        Ok(json!(count))
    }
}

impl Language for CountingLanguage {
    type Context = CountingContext;

    fn create_context(&self, env: &Env) -> Result<CountingContext> {
        bump(&self.counters.create_context);
        self.record("create_context");
        Ok(CountingContext {
            env: RwLock::new(env.clone()),
        })
    }

    fn initialize_context(&self, _context: &CountingContext) -> Result<()> {
        bump(&self.counters.initialize_context);
        self.record("initialize_context");
        Ok(())
    }

    fn patch_context(&self, context: &CountingContext, env: &Env) -> Result<bool> {
        bump(&self.counters.patch_context);
        self.record("patch_context");
        if self.behavior.fail_patch {
            return Err(Error::guest(format!("patch of {} failed", self.id)));
        }
        if !self.behavior.patchable {
            return Ok(false);
        }
        *context.env.write() = env.clone();
        Ok(true)
    }

    fn is_thread_access_allowed(&self, request: &ThreadRequest) -> bool {
        request.single_threaded() || self.behavior.allow_multi_threading
    }

    fn initialize_multi_threading(&self, _context: &CountingContext) -> Result<()> {
        bump(&self.counters.initialize_multi_threading);
        self.record("initialize_multi_threading");
        Ok(())
    }

    fn initialize_thread(&self, _context: &CountingContext, _thread: ThreadId) -> Result<()> {
        bump(&self.counters.initialize_thread);
        self.record("initialize_thread");
        Ok(())
    }

    fn finalize_context(&self, _context: &CountingContext) -> Result<()> {
        bump(&self.counters.finalize_context);
        self.record("finalize_context");
        if take_failure(&self.finalize_failures) {
            return Err(Error::guest(format!("finalization of {} failed", self.id)));
        }
        Ok(())
    }

    fn finalize_thread(&self, _context: &CountingContext, _thread: ThreadId) -> Result<()> {
        bump(&self.counters.finalize_thread);
        self.record("finalize_thread");
        Ok(())
    }

    fn dispose_thread(&self, _context: &CountingContext, _thread: ThreadId) -> Result<()> {
        bump(&self.counters.dispose_thread);
        self.record("dispose_thread");
        Ok(())
    }

    fn dispose_context(&self, _context: &CountingContext) -> Result<()> {
        bump(&self.counters.dispose_context);
        self.record("dispose_context");
        if take_failure(&self.dispose_failures) {
            return Err(Error::guest(format!("disposal of {} failed", self.id)));
        }
        Ok(())
    }

    fn eval(&self, context: &CountingContext, source: &str) -> Result<serde_json::Value> {
        let env = context.env();
        let (command, argument) = source.split_once(':').unwrap_or((source, ""));
        match command {
            "sleep" => {
                let millis: u64 = argument.parse().map_err(|e| Error::guest(format!("{e}")))?;
                env.sleep(Duration::from_millis(millis))?;
                Ok(json!(millis))
            }
            "spin" => loop {
                env.poll_safepoint()?;
                thread::yield_now();
            },
            "fail" => Err(Error::guest(argument)),
            "value" => serde_json::from_str(argument).map_err(|e| Error::guest(e.to_string())),
            "option" => Ok(env.option(argument).map_or(serde_json::Value::Null, |v| json!(v))),
            "thread" => {
                let thread = self.thread_local.get()?;
                Ok(json!(format!("{thread:?}")))
            }
            "spawn" => {
                let count: usize = argument.parse().map_err(|e| Error::guest(format!("{e}")))?;
                self.spawn(&env, count)
            }
            _ => Ok(json!(source)),
        }
    }
}
