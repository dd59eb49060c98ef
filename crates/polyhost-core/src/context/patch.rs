//! Pre-initialized contexts
//!
//! An engine may create one context ahead of time and initialize a set of
//! languages in it. The first context requested afterwards reuses it: every
//! initialized language, in dependency order, receives a fresh [`Env`] through
//! `patch_context`. If any language rejects the patch the pre-initialized
//! context is closed and a fresh context is created instead.

use std::sync::Arc;

use crate::config::ContextConfig;
use crate::context::{CloseMode, ContextHandle, ContextInner};
use crate::engine::EngineInner;
use crate::env::Env;
use crate::error::Result;

impl ContextInner {
    /// Create a context that initializes `languages` without any thread
    pub(crate) fn preinitialize(engine: &Arc<EngineInner>, languages: &[String]) -> Result<Arc<Self>> {
        let context = ContextInner::new(engine, ContextConfig::default(), true);
        let initialized = {
            let _frame = context.enter_preinit();
            languages.iter().try_for_each(|id| {
                let index = engine.language_index(id)?;
                context.initialize_language(index).map(|_| ())
            })
        };
        if let Err(e) = initialized {
            context.discard();
            return Err(e);
        }
        tracing::info!(context = %context.id, ?languages, "context pre-initialized");
        Ok(context)
    }

    /// Hand every initialized language a new environment built from `config`
    ///
    /// Returns `false` as soon as one language rejects the patch or fails.
    pub(crate) fn patch(self: &Arc<Self>, config: &ContextConfig) -> bool {
        *self.config.write() = config.clone();
        let _frame = self.enter_preinit();
        for language in self.initialized_languages() {
            let env = Env::new(
                &language.id,
                ContextHandle::new(self),
                &self.engine,
                config.options.clone(),
                false,
            );
            match language.patch(&env) {
                Ok(true) => language.set_env(env),
                Ok(false) => {
                    tracing::debug!(context = %self.id, language = %language.id, "language rejected patch");
                    return false;
                }
                Err(e) => {
                    tracing::warn!(context = %self.id, language = %language.id, error = %e, "patch_context failed");
                    return false;
                }
            }
        }
        self.storage.invalidate();
        self.state.lock().pre_initialized = false;
        tracing::debug!(context = %self.id, "pre-initialized context patched");
        true
    }

    /// Close a pre-initialized context that could not be patched
    pub(crate) fn discard(self: &Arc<Self>) {
        if let Err(e) = self.close(CloseMode::Normal) {
            tracing::warn!(context = %self.id, error = %e, "failed to close pre-initialized context");
        }
    }
}
