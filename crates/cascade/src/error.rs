//! Errors raised while building method tables and while binding or
//! invoking foreign call targets.

use thiserror::Error;

use crate::types::{TypeRef, ValueKind};
use crate::values::ExceptionObject;

/// A method body or region table that cannot be accepted into a
/// [`MethodTable`](crate::method::MethodTable).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MethodError {
    #[error("method '{0}' is already defined")]
    DuplicateMethod(String),

    #[error("method '{0}' is declared but has no body")]
    UndefinedMethod(String),

    #[error("type '{0}' is already defined")]
    DuplicateType(String),

    #[error("type index {0} is not defined")]
    UnknownType(usize),

    #[error("{method}: instruction {offset} targets {target}, outside the body (len {len})")]
    TargetOutOfRange {
        method: String,
        offset: usize,
        target: usize,
        len: usize,
    },

    #[error("{method}: instruction {offset} references {what} {index}, which does not exist")]
    BadOperand {
        method: String,
        offset: usize,
        what: &'static str,
        index: usize,
    },

    #[error("{method}: region {region} has an empty or out-of-range {what} range {start}..{end}")]
    BadRegionRange {
        method: String,
        region: usize,
        what: &'static str,
        start: usize,
        end: usize,
    },

    #[error("{method}: region {region} declares no handlers")]
    NoHandlers { method: String, region: usize },

    #[error("{method}: protected ranges {first:?} and {second:?} partially overlap")]
    OverlappingRegions {
        method: String,
        first: (usize, usize),
        second: (usize, usize),
    },

    #[error("{method}: label {label} was used but never bound")]
    UnboundLabel { method: String, label: usize },

    #[error("{method}: foreign method signature returns {ret}, which cannot cross the bridge")]
    UnsupportedForeignReturn { method: String, ret: ValueKind },
}

/// Failure to bind a foreign descriptor to a callable target.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("unknown internal operation '{0}'")]
    UnknownInternalOperation(String),

    #[error("unable to load native library '{library}' (searched: {searched})")]
    LibraryNotFound { library: String, searched: String },

    #[error("unable to find entry point '{symbol}' in native library '{library}'")]
    SymbolNotFound { library: String, symbol: String },
}

/// Failure while invoking a resolved foreign target.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InteropError {
    #[error("'{target}' expects {expected} arguments, got {actual}")]
    ArityMismatch {
        target: String,
        expected: usize,
        actual: usize,
    },

    #[error("'{target}' argument {index}: expected {expected}, got {actual}")]
    TypeMismatch {
        target: String,
        index: usize,
        expected: ValueKind,
        actual: &'static str,
    },

    #[error("cannot marshal call to '{target}': {reason}")]
    MarshalingError { target: String, reason: String },
}

impl ResolutionError {
    /// The managed exception a caller observes when binding fails.
    pub fn to_exception(&self) -> ExceptionObject {
        match self {
            ResolutionError::UnknownInternalOperation(id) => ExceptionObject::new(
                TypeRef::MISSING_METHOD_EXCEPTION,
                &format!("Method not found: '{}'.", id),
            ),
            ResolutionError::LibraryNotFound { library, .. } => ExceptionObject::new(
                TypeRef::DLL_NOT_FOUND_EXCEPTION,
                &format!("Unable to load DLL '{}' or one of its dependencies.", library),
            ),
            ResolutionError::SymbolNotFound { library, symbol } => ExceptionObject::new(
                TypeRef::ENTRY_POINT_NOT_FOUND_EXCEPTION,
                &format!(
                    "Unable to find an entry point named '{}' in DLL '{}'.",
                    symbol, library
                ),
            ),
        }
    }
}

impl InteropError {
    pub fn to_exception(&self) -> ExceptionObject {
        let ty = match self {
            InteropError::ArityMismatch { .. } | InteropError::TypeMismatch { .. } => {
                TypeRef::ARGUMENT_EXCEPTION
            }
            InteropError::MarshalingError { .. } => TypeRef::MARSHAL_DIRECTIVE_EXCEPTION,
        };
        ExceptionObject::new(ty, &self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_errors_map_to_load_exceptions() {
        let e = ResolutionError::LibraryNotFound {
            library: "TestLibrary".to_string(),
            searched: String::new(),
        }
        .to_exception();
        assert_eq!(e.ty, TypeRef::DLL_NOT_FOUND_EXCEPTION);
        assert_eq!(
            &*e.message,
            "Unable to load DLL 'TestLibrary' or one of its dependencies."
        );
        let e = ResolutionError::UnknownInternalOperation("X::Y()".to_string()).to_exception();
        assert_eq!(e.ty, TypeRef::MISSING_METHOD_EXCEPTION);
    }

    #[test]
    fn test_interop_errors_map_to_argument_and_marshal_exceptions() {
        let arity = InteropError::ArityMismatch {
            target: "t".to_string(),
            expected: 1,
            actual: 2,
        };
        assert_eq!(arity.to_exception().ty, TypeRef::ARGUMENT_EXCEPTION);
        let marshal = InteropError::MarshalingError {
            target: "t".to_string(),
            reason: "nope".to_string(),
        };
        let e = marshal.to_exception();
        assert_eq!(e.ty, TypeRef::MARSHAL_DIRECTIVE_EXCEPTION);
        assert_eq!(&*e.message, "cannot marshal call to 't': nope");
    }
}
