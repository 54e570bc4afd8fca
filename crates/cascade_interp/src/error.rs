use std::fmt;

use cascade::{InteropError, ResolutionError};
use thiserror::Error;

/// A run that could not complete normally or through an unhandled
/// managed exception.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("{method} IL_{offset:04}: {reason}")]
    Decode {
        method: String,
        offset: usize,
        reason: String,
    },

    #[error("{method} IL_{offset:04}: stack imbalance: {reason}")]
    StackImbalance {
        method: String,
        offset: usize,
        reason: String,
    },

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Interop(#[from] InteropError),

    #[error("call depth limit of {0} frames exceeded")]
    CallDepthExceeded(usize),

    #[error("execution was cancelled")]
    Cancelled,

    #[error("aborted: {0}")]
    Aborted(String),

    #[error("invalid entry point: {0}")]
    InvalidEntry(String),
}

/// Fault raised while executing one instruction, before it is tagged with
/// the method and offset it happened at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Fault {
    Decode(String),
    Imbalance(String),
}

impl Fault {
    pub(crate) fn at(self, method: &str, offset: usize) -> ExecutionError {
        let method = method.to_string();
        match self {
            Fault::Decode(reason) => ExecutionError::Decode {
                method,
                offset,
                reason,
            },
            Fault::Imbalance(reason) => ExecutionError::StackImbalance {
                method,
                offset,
                reason,
            },
        }
    }
}

/// A managed exception that propagated out of the entry method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnhandledException {
    pub type_name: String,
    pub message: String,
}

impl fmt::Display for UnhandledException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Unhandled exception. {}: {}", self.type_name, self.message)
    }
}
