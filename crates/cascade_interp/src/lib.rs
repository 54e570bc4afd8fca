pub mod dispatch;
pub mod error;
mod frame;
pub mod interpreter;

pub use error::{ExecutionError, UnhandledException};
pub use interpreter::{CancellationToken, InteropErrorPolicy, Interpreter, InterpreterOptions, Outcome};
