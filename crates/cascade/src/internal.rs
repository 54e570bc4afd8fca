//! Operations implemented by the engine itself and bound by
//! [`ForeignDescriptor::Internal`](crate::native_lib::ForeignDescriptor).
//!
//! Internal operations take interpreter values directly. The bridge checks
//! arity and tags against the declared parameters before calling them, so
//! the implementations index their arguments freely.

use std::fmt;

use crate::error::InteropError;
use crate::host::Host;
use crate::native_lib::ForeignOutcome;
use crate::types::{Signature, TypeRef, TypeTable, ValueKind};
use crate::values::{ExceptionObject, Value};

/// What an internal operation can reach while it runs.
pub struct CallContext<'a> {
    pub host: &'a mut dyn Host,
    pub types: &'a TypeTable,
}

impl<'a> CallContext<'a> {
    pub fn new(host: &'a mut dyn Host, types: &'a TypeTable) -> Self {
        CallContext { host, types }
    }
}

pub type InternalFn = fn(&mut CallContext<'_>, &[Value]) -> Result<ForeignOutcome, InteropError>;

pub struct InternalOp {
    pub id: &'static str,
    pub params: &'static [ValueKind],
    pub ret: ValueKind,
    pub func: InternalFn,
}

impl fmt::Debug for InternalOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InternalOp")
            .field("id", &self.id)
            .field("signature", &self.signature())
            .finish()
    }
}

impl InternalOp {
    pub fn signature(&self) -> Signature {
        Signature::new(self.params, self.ret)
    }
}

pub static INTERNAL_OPS: &[InternalOp] = &[
    InternalOp {
        id: "System.Console::WriteLine(string)",
        params: &[ValueKind::String],
        ret: ValueKind::Void,
        func: write_line_string,
    },
    InternalOp {
        id: "System.Console::WriteLine(int32)",
        params: &[ValueKind::I4],
        ret: ValueKind::Void,
        func: write_line_int,
    },
    InternalOp {
        id: "System.String::Concat(object,object)",
        params: &[ValueKind::Object, ValueKind::Object],
        ret: ValueKind::String,
        func: concat,
    },
    InternalOp {
        id: "System.String::op_Equality(string,string)",
        params: &[ValueKind::String, ValueKind::String],
        ret: ValueKind::Bool,
        func: string_equals,
    },
    InternalOp {
        id: "System.Int32::ToString()",
        params: &[ValueKind::I4],
        ret: ValueKind::String,
        func: int_to_string,
    },
    InternalOp {
        id: "System.Exception::get_Message()",
        params: &[ValueKind::Object],
        ret: ValueKind::String,
        func: exception_message,
    },
    InternalOp {
        id: "System.Diagnostics.Debug::Assert(bool,string)",
        params: &[ValueKind::Bool, ValueKind::String],
        ret: ValueKind::Void,
        func: hard_assert,
    },
    InternalOp {
        id: "Test.Harness::Check(bool,string)",
        params: &[ValueKind::Bool, ValueKind::String],
        ret: ValueKind::Void,
        func: soft_assert,
    },
    InternalOp {
        id: "System.Runtime.Guard::CheckIndex(int32,int32)",
        params: &[ValueKind::I4, ValueKind::I4],
        ret: ValueKind::Void,
        func: check_index,
    },
    InternalOp {
        id: "Test.Interop::RuntimeInternalCall(int32)",
        params: &[ValueKind::I4],
        ret: ValueKind::Void,
        func: runtime_internal_call,
    },
];

pub fn find(id: &str) -> Option<&'static InternalOp> {
    INTERNAL_OPS.iter().find(|op| op.id == id)
}

fn returns(value: Value) -> Result<ForeignOutcome, InteropError> {
    Ok(ForeignOutcome::Return(Some(value)))
}

fn done() -> Result<ForeignOutcome, InteropError> {
    Ok(ForeignOutcome::Return(None))
}

fn write_line_string(ctx: &mut CallContext<'_>, args: &[Value]) -> Result<ForeignOutcome, InteropError> {
    ctx.host.write_line(args[0].as_str().unwrap_or(""));
    done()
}

fn write_line_int(ctx: &mut CallContext<'_>, args: &[Value]) -> Result<ForeignOutcome, InteropError> {
    ctx.host.write_line(&args[0].to_display_string(ctx.types));
    done()
}

fn concat(ctx: &mut CallContext<'_>, args: &[Value]) -> Result<ForeignOutcome, InteropError> {
    let mut s = args[0].to_display_string(ctx.types);
    s.push_str(&args[1].to_display_string(ctx.types));
    returns(Value::string(&s))
}

fn string_equals(_: &mut CallContext<'_>, args: &[Value]) -> Result<ForeignOutcome, InteropError> {
    let equal = match (&args[0], &args[1]) {
        (Value::Null, Value::Null) => true,
        (a, b) => a.as_str().is_some() && a.as_str() == b.as_str(),
    };
    returns(Value::from_bool(equal))
}

fn int_to_string(ctx: &mut CallContext<'_>, args: &[Value]) -> Result<ForeignOutcome, InteropError> {
    returns(Value::string(&args[0].to_display_string(ctx.types)))
}

fn exception_message(_: &mut CallContext<'_>, args: &[Value]) -> Result<ForeignOutcome, InteropError> {
    match &args[0] {
        Value::Null => Ok(ForeignOutcome::Throw(null_reference())),
        v => match v.as_exception() {
            Some(e) => returns(Value::string(&e.message)),
            None => Err(InteropError::TypeMismatch {
                target: "System.Exception::get_Message()".to_string(),
                index: 0,
                expected: ValueKind::Object,
                actual: v.tag_name(),
            }),
        },
    }
}

fn hard_assert(_: &mut CallContext<'_>, args: &[Value]) -> Result<ForeignOutcome, InteropError> {
    if args[0].to_bool() {
        return done();
    }
    let message = args[1].as_str().unwrap_or("");
    Ok(ForeignOutcome::Abort(format!("assertion failed: {}", message)))
}

fn soft_assert(ctx: &mut CallContext<'_>, args: &[Value]) -> Result<ForeignOutcome, InteropError> {
    if !args[0].to_bool() {
        let message = args[1].as_str().unwrap_or("");
        ctx.host.write_line(&format!("Assertion failed: {}", message));
    }
    done()
}

fn check_index(_: &mut CallContext<'_>, args: &[Value]) -> Result<ForeignOutcome, InteropError> {
    let index = args[0].as_i32().unwrap_or(-1);
    let len = args[1].as_i32().unwrap_or(0);
    if index < 0 || index >= len {
        return Ok(ForeignOutcome::Throw(ExceptionObject::new(
            TypeRef::ARGUMENT_EXCEPTION,
            "Index was out of range. Must be non-negative and less than the size of the collection.",
        )));
    }
    done()
}

fn runtime_internal_call(ctx: &mut CallContext<'_>, args: &[Value]) -> Result<ForeignOutcome, InteropError> {
    ctx.host
        .write_line(&format!("RuntimeInternalCall({})", args[0].to_display_string(ctx.types)));
    done()
}

pub fn null_reference() -> ExceptionObject {
    ExceptionObject::new(
        TypeRef::NULL_REFERENCE_EXCEPTION,
        "Object reference not set to an instance of an object.",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::CaptureHost;
    use anyhow::{bail, Context, Result};

    fn call(id: &str, args: &[Value]) -> Result<(ForeignOutcome, Vec<String>)> {
        let op = find(id).with_context(|| format!("no internal operation {}", id))?;
        let mut host = CaptureHost::new();
        let types = TypeTable::new();
        let outcome = {
            let mut ctx = CallContext::new(&mut host, &types);
            (op.func)(&mut ctx, args)?
        };
        Ok((outcome, host.into_lines()))
    }

    #[test]
    fn test_ids_are_unique() {
        for (i, op) in INTERNAL_OPS.iter().enumerate() {
            assert!(
                INTERNAL_OPS[i + 1..].iter().all(|other| other.id != op.id),
                "duplicate {}",
                op.id
            );
        }
    }

    #[test]
    fn test_write_line() -> Result<()> {
        let (outcome, lines) = call("System.Console::WriteLine(string)", &[Value::string("Zero")])?;
        assert!(matches!(outcome, ForeignOutcome::Return(None)));
        assert_eq!(lines, vec!["Zero"]);
        Ok(())
    }

    #[test]
    fn test_concat_formats_numbers() -> Result<()> {
        let (outcome, _) = call(
            "System.String::Concat(object,object)",
            &[Value::string("Addition: "), Value::I32(8)],
        )?;
        match outcome {
            ForeignOutcome::Return(Some(v)) => assert_eq!(v.as_str(), Some("Addition: 8")),
            other => bail!("unexpected {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_message_of_null_throws() -> Result<()> {
        let (outcome, _) = call("System.Exception::get_Message()", &[Value::Null])?;
        match outcome {
            ForeignOutcome::Throw(e) => assert_eq!(e.ty, TypeRef::NULL_REFERENCE_EXCEPTION),
            other => bail!("unexpected {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_assertion_conventions() -> Result<()> {
        let args = [Value::from_bool(false), Value::string("Logical AND failed")];
        let (hard, lines) = call("System.Diagnostics.Debug::Assert(bool,string)", &args)?;
        assert!(matches!(hard, ForeignOutcome::Abort(_)));
        assert!(lines.is_empty());

        let (soft, lines) = call("Test.Harness::Check(bool,string)", &args)?;
        assert!(matches!(soft, ForeignOutcome::Return(None)));
        assert_eq!(lines, vec!["Assertion failed: Logical AND failed"]);
        Ok(())
    }

    #[test]
    fn test_guard_raises_argument_exception() -> Result<()> {
        let check = "System.Runtime.Guard::CheckIndex(int32,int32)";
        let (ok, _) = call(check, &[Value::I32(2), Value::I32(3)])?;
        assert!(matches!(ok, ForeignOutcome::Return(None)));
        let (bad, _) = call(check, &[Value::I32(3), Value::I32(3)])?;
        match bad {
            ForeignOutcome::Throw(e) => assert_eq!(e.ty, TypeRef::ARGUMENT_EXCEPTION),
            other => bail!("unexpected {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_string_equality() -> Result<()> {
        let (eq, _) = call(
            "System.String::op_Equality(string,string)",
            &[Value::string("Hello"), Value::string("Hello")],
        )?;
        match eq {
            ForeignOutcome::Return(Some(v)) => assert_eq!(v, Value::I32(1)),
            other => bail!("unexpected {:?}", other),
        }
        Ok(())
    }
}
