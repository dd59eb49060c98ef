//! Error types for Polyhost Core
//!
//! Messages of the lifecycle variants are part of the embedding contract:
//! embedders match on their prefixes, so they are rendered verbatim without
//! a category prefix.

use std::fmt;
use std::thread::ThreadId;

use thiserror::Error;

use crate::liveness::ContextRef;

/// Result type alias using Polyhost Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for Polyhost
#[derive(Error, Debug)]
pub enum Error {
    /// A slot was created after the owner finished construction
    #[error("{0}")]
    FrozenLocals(String),

    /// Two instantiations of one registration created different slot layouts
    #[error("{0}")]
    LayoutMismatch(String),

    /// A dynamic slot factory returned no value
    #[error("{0}")]
    NullSlotValue(String),

    /// A dynamic slot factory changed the concrete type of its value
    #[error("The return context value type must be stable and exact. Expected class {expected} but got class {actual}.")]
    UnstableSlotType {
        /// Type recorded on first materialization
        expected: String,
        /// Type returned now
        actual: String,
    },

    /// Language dependencies form a cycle
    #[error("Cyclic language dependency: {0}")]
    CyclicDependency(String),

    /// Slot of an exclusive owner accessed through a foreign context
    #[error("Detected invalid sharing of context locals. {0}")]
    InvalidSharing(String),

    /// Thread admission rejected by a language
    #[error(
        "{} threaded access requested by thread {thread} but is not allowed for language(s) {}.",
        threading(.single_threaded),
        .languages.join(", ")
    )]
    AccessDenied {
        /// Name of the rejected thread
        thread: String,
        /// Whether the request was for single threaded access
        single_threaded: bool,
        /// Ids of the languages that denied access
        languages: Vec<String>,
    },

    /// Lifecycle ordering violation
    #[error("{0}")]
    IllegalState(String),

    /// The context is being cancelled
    #[error("Execution got cancelled.")]
    Cancelled,

    /// The context is being interrupted
    #[error("Execution got interrupted.")]
    Interrupted,

    /// Interrupt did not complete in time
    #[error("Interrupt timed out after {0:?}.")]
    InterruptTimeout(std::time::Duration),

    /// A started polyglot thread had not finished when the context closed
    #[error("The language did not complete all polyglot threads but should have: {0:?}")]
    PolyglotThreadsNotCompleted(Vec<ThreadId>),

    /// Error raised by guest code
    #[error("{0}")]
    Guest(GuestError),

    /// No language registered under the id
    #[error("No language for id {0} found.")]
    LanguageNotFound(String),

    /// No instrument registered under the id
    #[error("No instrument for id {0} found.")]
    InstrumentNotFound(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

fn threading(single_threaded: &bool) -> &'static str {
    if *single_threaded { "Single" } else { "Multi" }
}

impl Error {
    /// Create an illegal state error
    pub fn illegal_state(msg: impl Into<String>) -> Self {
        Self::IllegalState(msg.into())
    }

    /// Create an invalid sharing error
    pub fn invalid_sharing(msg: impl Into<String>) -> Self {
        Self::InvalidSharing(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a guest error that is not bound to a context
    pub fn guest(msg: impl Into<String>) -> Self {
        Self::Guest(GuestError {
            message: msg.into(),
            context: None,
        })
    }

    pub(crate) fn closed() -> Self {
        Self::illegal_state("The Context is already closed.")
    }

    pub(crate) fn no_current_context() -> Self {
        Self::illegal_state("No current context available.")
    }

    /// Whether this error stems from cancellation or interruption
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Interrupted)
    }

    /// Attach a context to a guest error so that it keeps the context reachable
    pub(crate) fn bind_context(self, context: &ContextRef) -> Self {
        match self {
            Self::Guest(GuestError {
                message,
                context: None,
            }) => Self::Guest(GuestError {
                message,
                context: Some(context.clone()),
            }),
            other => other,
        }
    }
}

/// Error raised by guest code
///
/// A guest error that escaped an evaluation keeps its context reachable until
/// it is dropped.
pub struct GuestError {
    message: String,
    context: Option<ContextRef>,
}

impl GuestError {
    /// Error message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Handle of the context the error was raised in, if any
    pub fn context(&self) -> Option<crate::ContextHandle> {
        self.context.as_ref().map(ContextRef::handle)
    }
}

impl fmt::Display for GuestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl fmt::Debug for GuestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestError")
            .field("message", &self.message)
            .field("context", &self.context.as_ref().map(|c| c.id()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_denied_messages() {
        let err = Error::AccessDenied {
            thread: "worker-1".to_string(),
            single_threaded: false,
            languages: vec!["js".to_string(), "ruby".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Multi threaded access requested by thread worker-1 but is not allowed for language(s) js, ruby."
        );

        let err = Error::AccessDenied {
            thread: "main".to_string(),
            single_threaded: true,
            languages: vec!["js".to_string()],
        };
        assert!(err
            .to_string()
            .starts_with("Single threaded access requested by thread main"));
    }

    #[test]
    fn test_contract_messages_have_no_prefix() {
        assert_eq!(Error::closed().to_string(), "The Context is already closed.");
        assert_eq!(
            Error::no_current_context().to_string(),
            "No current context available."
        );
        assert!(Error::invalid_sharing("x")
            .to_string()
            .starts_with("Detected invalid sharing of context locals."));
    }

    #[test]
    fn test_unstable_type_message() {
        let err = Error::UnstableSlotType {
            expected: "alloc::string::String".to_string(),
            actual: "i32".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "The return context value type must be stable and exact. Expected class alloc::string::String but got class i32."
        );
    }

    #[test]
    fn test_guest_error_without_context() {
        let err = Error::guest("boom");
        assert!(!err.is_cancelled());
        match err {
            Error::Guest(guest) => {
                assert_eq!(guest.message(), "boom");
                assert!(guest.context().is_none());
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(Error::Cancelled.is_cancelled());
    }
}
