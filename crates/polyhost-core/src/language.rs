//! Language service provider interface
//!
//! A [`Language`] is registered with the engine through a
//! [`LanguageRegistration`]. The engine constructs language instances, hands
//! them their [`LanguageLocals`] registry during construction, and drives the
//! lifecycle hooks in this order:
//!
//! ```text
//! create_context ─▶ initialize_context ─▶ [patch_context]
//!        │
//!        ├─▶ initialize_multi_threading (once, on the second thread)
//!        ├─▶ initialize_thread / dispose_thread (once per thread)
//!        │
//!        └─▶ finalize_context ─▶ finalize_thread ─▶ dispose_thread ─▶ dispose_context
//! ```

use std::any::Any;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::thread::ThreadId;

use once_cell::sync::OnceCell;

use crate::context::ContextHandle;
use crate::engine::EngineInner;
use crate::env::Env;
use crate::error::{Error, Result};
use crate::liveness::EngineRef;
use crate::locals::registry::{self, OwnerInfo, OwnerKind, OwnerScope, RegistryInner, SlotLayout};
use crate::locals::LanguageLocals;

/// Language state of one context, owned by the engine
pub(crate) type GuestContext = Arc<dyn Any + Send + Sync>;

/// How language instances relate to contexts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContextPolicy {
    /// One language instance per context
    #[default]
    Exclusive,
    /// One language instance serves every context of the engine
    Shared,
}

/// Snapshot of a thread admission decision
#[derive(Debug, Clone)]
pub struct ThreadRequest {
    context: ContextHandle,
    thread: ThreadId,
    thread_name: String,
    single_threaded: bool,
}

impl ThreadRequest {
    pub(crate) fn new(
        context: ContextHandle,
        thread: ThreadId,
        thread_name: String,
        single_threaded: bool,
    ) -> Self {
        Self {
            context,
            thread,
            thread_name,
            single_threaded,
        }
    }

    /// Context the thread wants to enter
    pub fn context(&self) -> &ContextHandle {
        &self.context
    }

    /// Thread asking for access
    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    /// Display name of the thread
    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }

    /// Whether the thread would be the only thread of the context
    pub fn single_threaded(&self) -> bool {
        self.single_threaded
    }
}

/// Lifecycle hooks of a guest language
///
/// Every hook except `create_context` has a default that does nothing. The
/// default access policy only allows single threaded contexts.
pub trait Language: Send + Sync + 'static {
    /// Per-context language state
    type Context: Send + Sync + 'static;

    /// Create the language state of a new context
    fn create_context(&self, env: &Env) -> Result<Self::Context>;

    /// Initialize the language state after creation
    fn initialize_context(&self, _context: &Self::Context) -> Result<()> {
        Ok(())
    }

    /// Reuse a pre-initialized context with a new environment
    ///
    /// Returning `false` rejects the patch and makes the engine create a
    /// fresh context instead.
    fn patch_context(&self, _context: &Self::Context, _env: &Env) -> Result<bool> {
        Ok(false)
    }

    /// Decide whether a thread may enter a context
    fn is_thread_access_allowed(&self, request: &ThreadRequest) -> bool {
        request.single_threaded()
    }

    /// Called once when a second thread is admitted into the context
    fn initialize_multi_threading(&self, _context: &Self::Context) -> Result<()> {
        Ok(())
    }

    /// Called once for every thread admitted into the context
    fn initialize_thread(&self, _context: &Self::Context, _thread: ThreadId) -> Result<()> {
        Ok(())
    }

    /// Called before the context is disposed; may run repeatedly
    fn finalize_context(&self, _context: &Self::Context) -> Result<()> {
        Ok(())
    }

    /// Called for every initialized thread before it is disposed
    fn finalize_thread(&self, _context: &Self::Context, _thread: ThreadId) -> Result<()> {
        Ok(())
    }

    /// Called once per initialized thread when it retires or the context closes
    fn dispose_thread(&self, _context: &Self::Context, _thread: ThreadId) -> Result<()> {
        Ok(())
    }

    /// Release the language state of a context
    fn dispose_context(&self, _context: &Self::Context) -> Result<()> {
        Ok(())
    }

    /// Evaluate guest source
    fn eval(&self, _context: &Self::Context, _source: &str) -> Result<serde_json::Value> {
        Err(Error::illegal_state("The language does not support evaluation."))
    }
}

/// Object-safe view of a [`Language`] over type-erased guest state
pub(crate) trait ErasedLanguage: Send + Sync {
    fn create_context(&self, env: &Env) -> Result<GuestContext>;
    fn initialize_context(&self, context: &GuestContext) -> Result<()>;
    fn patch_context(&self, context: &GuestContext, env: &Env) -> Result<bool>;
    fn is_thread_access_allowed(&self, request: &ThreadRequest) -> bool;
    fn initialize_multi_threading(&self, context: &GuestContext) -> Result<()>;
    fn initialize_thread(&self, context: &GuestContext, thread: ThreadId) -> Result<()>;
    fn finalize_context(&self, context: &GuestContext) -> Result<()>;
    fn finalize_thread(&self, context: &GuestContext, thread: ThreadId) -> Result<()>;
    fn dispose_thread(&self, context: &GuestContext, thread: ThreadId) -> Result<()>;
    fn dispose_context(&self, context: &GuestContext) -> Result<()>;
    fn eval(&self, context: &GuestContext, source: &str) -> Result<serde_json::Value>;
}

fn state<L: Language>(context: &GuestContext) -> Result<&L::Context> {
    context.downcast_ref::<L::Context>().ok_or_else(|| {
        Error::internal(format!(
            "language context is not a {}",
            std::any::type_name::<L::Context>()
        ))
    })
}

impl<L: Language> ErasedLanguage for L {
    fn create_context(&self, env: &Env) -> Result<GuestContext> {
        let context: GuestContext = Arc::new(Language::create_context(self, env)?);
        Ok(context)
    }

    fn initialize_context(&self, context: &GuestContext) -> Result<()> {
        Language::initialize_context(self, state::<L>(context)?)
    }

    fn patch_context(&self, context: &GuestContext, env: &Env) -> Result<bool> {
        Language::patch_context(self, state::<L>(context)?, env)
    }

    fn is_thread_access_allowed(&self, request: &ThreadRequest) -> bool {
        Language::is_thread_access_allowed(self, request)
    }

    fn initialize_multi_threading(&self, context: &GuestContext) -> Result<()> {
        Language::initialize_multi_threading(self, state::<L>(context)?)
    }

    fn initialize_thread(&self, context: &GuestContext, thread: ThreadId) -> Result<()> {
        Language::initialize_thread(self, state::<L>(context)?, thread)
    }

    fn finalize_context(&self, context: &GuestContext) -> Result<()> {
        Language::finalize_context(self, state::<L>(context)?)
    }

    fn finalize_thread(&self, context: &GuestContext, thread: ThreadId) -> Result<()> {
        Language::finalize_thread(self, state::<L>(context)?, thread)
    }

    fn dispose_thread(&self, context: &GuestContext, thread: ThreadId) -> Result<()> {
        Language::dispose_thread(self, state::<L>(context)?, thread)
    }

    fn dispose_context(&self, context: &GuestContext) -> Result<()> {
        Language::dispose_context(self, state::<L>(context)?)
    }

    fn eval(&self, context: &GuestContext, source: &str) -> Result<serde_json::Value> {
        Language::eval(self, state::<L>(context)?, source)
    }
}

type Constructor = Box<
    dyn Fn(&LanguageLocals) -> Result<(Arc<dyn ErasedLanguage>, Arc<dyn Any + Send + Sync>)>
        + Send
        + Sync,
>;

/// Declaration of a language: id, policy, dependencies and constructor
pub struct LanguageRegistration {
    id: String,
    policy: ContextPolicy,
    dependencies: Vec<String>,
    constructor: Constructor,
    layout: OnceCell<SlotLayout>,
}

impl fmt::Debug for LanguageRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LanguageRegistration")
            .field("id", &self.id)
            .field("policy", &self.policy)
            .field("dependencies", &self.dependencies)
            .finish()
    }
}

impl LanguageRegistration {
    /// Register a language constructor
    ///
    /// The constructor may create context locals and context thread locals
    /// through the registry it receives; the registry is frozen as soon as
    /// the constructor returns.
    pub fn new<L, F>(id: impl Into<String>, constructor: F) -> Self
    where
        L: Language,
        F: Fn(&LanguageLocals) -> Result<L> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            policy: ContextPolicy::default(),
            dependencies: Vec::new(),
            constructor: Box::new(move |locals| {
                let language = Arc::new(constructor(locals)?);
                let hooks: Arc<dyn ErasedLanguage> = language.clone();
                let any: Arc<dyn Any + Send + Sync> = language;
                Ok((hooks, any))
            }),
            layout: OnceCell::new(),
        }
    }

    /// Set the context policy
    pub fn policy(mut self, policy: ContextPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Declare a language that must be initialized before this one
    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.dependencies.push(id.into());
        self
    }

    /// Language id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Context policy
    pub fn context_policy(&self) -> ContextPolicy {
        self.policy
    }

    /// Declared dependencies
    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    /// Construct an instance bound to `scope`
    pub(crate) fn instantiate(
        &self,
        engine: &Arc<EngineInner>,
        index: usize,
        scope: OwnerScope,
    ) -> Result<LanguageInstance> {
        let owner = Arc::new(OwnerInfo::new(OwnerKind::Language, &self.id, index, engine, scope));
        let registry = RegistryInner::new(owner.clone());
        let locals = LanguageLocals::new(registry.clone());
        let constructed = (self.constructor)(&locals);
        let layout = registry.freeze();
        let (hooks, any) = constructed?;
        registry::check_layout(&self.layout, layout, OwnerKind::Language, &self.id)?;
        tracing::debug!(language = %self.id, owner = %owner.id, ?scope, "language instance created");
        Ok(LanguageInstance { owner, hooks, any })
    }
}

/// A constructed language together with its slot owner identity
#[derive(Clone)]
pub(crate) struct LanguageInstance {
    pub(crate) owner: Arc<OwnerInfo>,
    pub(crate) hooks: Arc<dyn ErasedLanguage>,
    any: Arc<dyn Any + Send + Sync>,
}

impl LanguageInstance {
    pub(crate) fn downcast<L: Language>(&self) -> Result<Arc<L>> {
        self.any.clone().downcast::<L>().map_err(|_| {
            Error::internal(format!(
                "language '{}' is not a {}",
                self.owner.registration,
                std::any::type_name::<L>()
            ))
        })
    }
}

/// Embedder lookup of a language instance
///
/// Keeps the engine reachable while it lives.
pub struct LanguageHandle<L> {
    language: Arc<L>,
    _engine: EngineRef,
}

impl<L: Language> LanguageHandle<L> {
    pub(crate) fn new(language: Arc<L>, engine: EngineRef) -> Self {
        Self {
            language,
            _engine: engine,
        }
    }

    /// Shared pointer to the language instance
    pub fn language(&self) -> &Arc<L> {
        &self.language
    }
}

impl<L> Deref for LanguageHandle<L> {
    type Target = L;

    fn deref(&self) -> &L {
        &self.language
    }
}

impl<L> fmt::Debug for LanguageHandle<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LanguageHandle")
            .field("language", &std::any::type_name::<L>())
            .finish()
    }
}
