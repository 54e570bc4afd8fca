pub mod asm;
pub mod error;
pub mod fixtures;
pub mod host;
pub mod internal;
pub mod listing;
pub mod method;
pub mod native_lib;
pub mod opcodes;
pub mod types;
pub mod values;

pub use error::{InteropError, MethodError, ResolutionError};
pub use host::{CaptureHost, Host, StdoutHost};
pub use listing::Listing;
pub use method::{Method, MethodTable, MethodTableBuilder};
pub use native_lib::{BridgeConfig, ForeignBridge, ForeignDescriptor};
pub use types::{Signature, Str, TypeRef, TypeTable, ValueKind};
pub use values::{ExceptionObject, Value};
