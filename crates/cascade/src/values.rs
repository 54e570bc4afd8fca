use std::fmt;
use std::sync::Arc;

use crate::types::{Str, TypeRef, TypeTable, ValueKind};

pub type ObjRef = Arc<Object>;

/// Heap object reachable from a [`Value::Ref`].
#[derive(Debug)]
pub enum Object {
    String(Str),
    Exception(ExceptionObject),
}

impl Object {
    pub fn type_ref(&self) -> TypeRef {
        match self {
            Object::String(_) => TypeRef::STRING,
            Object::Exception(e) => e.ty,
        }
    }
}

/// A thrown (or throwable) exception: a runtime type tag and a message.
#[derive(Debug, Clone, PartialEq)]
pub struct ExceptionObject {
    pub ty: TypeRef,
    pub message: Str,
}

impl ExceptionObject {
    pub fn new(ty: TypeRef, message: &str) -> Self {
        ExceptionObject {
            ty,
            message: Str::from(message),
        }
    }

    pub fn into_ref(self) -> ObjRef {
        Arc::new(Object::Exception(self))
    }
}

/// Tagged evaluation-stack value.
#[derive(Clone)]
pub enum Value {
    I32(i32),
    I64(i64),
    F64(f64),
    Ref(ObjRef),
    /// The null object reference.
    Null,
    NativePtr(usize),
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::I32(v) => write!(f, "I32({})", v),
            Value::I64(v) => write!(f, "I64({})", v),
            Value::F64(v) => write!(f, "F64({})", v),
            Value::Ref(obj) => match obj.as_ref() {
                Object::String(s) => write!(f, "Str({:?})", &**s),
                Object::Exception(e) => write!(f, "Exc({}, {:?})", e.ty.0, &*e.message),
            },
            Value::Null => write!(f, "Null"),
            Value::NativePtr(p) => write!(f, "Ptr({:#x})", p),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::I32(a), Value::I32(b)) => a == b,
            (Value::I64(a), Value::I64(b)) => a == b,
            (Value::F64(a), Value::F64(b)) => a == b,
            (Value::Null, Value::Null) => true,
            (Value::NativePtr(a), Value::NativePtr(b)) => a == b,
            (Value::Ref(a), Value::Ref(b)) => match (a.as_ref(), b.as_ref()) {
                (Object::String(x), Object::String(y)) => x == y,
                _ => Arc::ptr_eq(a, b),
            },
            _ => false,
        }
    }
}

/// Why an arithmetic fast path refused its operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithFault {
    TagMismatch,
    DivideByZero,
    Overflow,
}

impl Value {
    pub fn string(s: &str) -> Self {
        Value::Ref(Arc::new(Object::String(Str::from(s))))
    }

    pub fn from_bool(b: bool) -> Self {
        Value::I32(b as i32)
    }

    pub fn tag_name(&self) -> &'static str {
        match self {
            Value::I32(_) => "int32",
            Value::I64(_) => "int64",
            Value::F64(_) => "float64",
            Value::Ref(obj) => match obj.as_ref() {
                Object::String(_) => "string",
                Object::Exception(_) => "exception",
            },
            Value::Null => "null",
            Value::NativePtr(_) => "native int",
        }
    }

    /// Whether this value can be bound to a slot declared as `kind`.
    /// Primitives bound to an object slot are boxed implicitly.
    pub fn fits(&self, kind: ValueKind) -> bool {
        match (kind, self) {
            (ValueKind::Void, _) => false,
            (ValueKind::I4, Value::I32(_)) => true,
            (ValueKind::Bool, Value::I32(v)) => *v == 0 || *v == 1,
            (ValueKind::I8, Value::I64(_)) => true,
            (ValueKind::R8, Value::F64(_)) => true,
            (ValueKind::NativeInt, Value::NativePtr(_)) => true,
            (ValueKind::String, Value::Null) => true,
            (ValueKind::String, Value::Ref(obj)) => matches!(obj.as_ref(), Object::String(_)),
            (ValueKind::Object, _) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Ref(obj) => match obj.as_ref() {
                Object::String(s) => Some(&**s),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_exception(&self) -> Option<&ExceptionObject> {
        match self {
            Value::Ref(obj) => match obj.as_ref() {
                Object::Exception(e) => Some(e),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::I32(v) => Some(*v),
            _ => None,
        }
    }

    /// Truthiness for `brtrue`/`brfalse`.
    pub fn to_bool(&self) -> bool {
        match self {
            Value::I32(v) => *v != 0,
            Value::I64(v) => *v != 0,
            Value::F64(v) => *v != 0.0,
            Value::Ref(_) => true,
            Value::Null => false,
            Value::NativePtr(p) => *p != 0,
        }
    }

    /// Text produced when the value is concatenated or printed.
    pub fn to_display_string(&self, types: &TypeTable) -> String {
        match self {
            Value::I32(v) => v.to_string(),
            Value::I64(v) => v.to_string(),
            Value::F64(v) => format_float(*v),
            Value::Ref(obj) => match obj.as_ref() {
                Object::String(s) => s.to_string(),
                Object::Exception(e) => format!("{}: {}", types.name(e.ty), &*e.message),
            },
            Value::Null => String::new(),
            Value::NativePtr(p) => p.to_string(),
        }
    }

    pub fn binary_op(&self, other: &Value, op: BinOp) -> Result<Value, ArithFault> {
        match (self, other) {
            (Value::I32(l), Value::I32(r)) => int32_op(*l, *r, op).map(Value::I32),
            (Value::I64(l), Value::I64(r)) => int64_op(*l, *r, op).map(Value::I64),
            (Value::I64(l), Value::I32(r)) if op.is_shift() => {
                int64_op(*l, *r as i64, op).map(Value::I64)
            }
            (Value::F64(l), Value::F64(r)) => float_op(*l, *r, op).map(Value::F64),
            _ => Err(ArithFault::TagMismatch),
        }
    }

    pub fn neg(&self) -> Result<Value, ArithFault> {
        match self {
            Value::I32(v) => Ok(Value::I32(v.wrapping_neg())),
            Value::I64(v) => Ok(Value::I64(v.wrapping_neg())),
            Value::F64(v) => Ok(Value::F64(-v)),
            _ => Err(ArithFault::TagMismatch),
        }
    }

    pub fn not(&self) -> Result<Value, ArithFault> {
        match self {
            Value::I32(v) => Ok(Value::I32(!v)),
            Value::I64(v) => Ok(Value::I64(!v)),
            _ => Err(ArithFault::TagMismatch),
        }
    }

    /// Compare two values. Returns None if the tags can't be compared.
    pub fn compare(&self, other: &Value, op: CmpOp) -> Option<bool> {
        match (self, other) {
            (Value::I32(l), Value::I32(r)) => Some(cmp_ord(l, r, op)),
            (Value::I64(l), Value::I64(r)) => Some(cmp_ord(l, r, op)),
            (Value::F64(l), Value::F64(r)) => Some(cmp_ord(l, r, op)),
            (Value::NativePtr(l), Value::NativePtr(r)) => Some(cmp_ord(l, r, op)),
            (Value::Ref(_) | Value::Null, Value::Ref(_) | Value::Null) => {
                let same = match (self, other) {
                    (Value::Null, Value::Null) => true,
                    (Value::Ref(a), Value::Ref(b)) => Arc::ptr_eq(a, b),
                    _ => false,
                };
                match op {
                    CmpOp::Eq => Some(same),
                    CmpOp::NotEq => Some(!same),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    pub fn conv(&self, to: ConvKind) -> Option<Value> {
        let v = match (to, self) {
            (ConvKind::I4, Value::I32(v)) => Value::I32(*v),
            (ConvKind::I4, Value::I64(v)) => Value::I32(*v as i32),
            (ConvKind::I4, Value::F64(v)) => Value::I32(*v as i32),
            (ConvKind::I8, Value::I32(v)) => Value::I64(*v as i64),
            (ConvKind::I8, Value::I64(v)) => Value::I64(*v),
            (ConvKind::I8, Value::F64(v)) => Value::I64(*v as i64),
            (ConvKind::R8, Value::I32(v)) => Value::F64(*v as f64),
            (ConvKind::R8, Value::I64(v)) => Value::F64(*v as f64),
            (ConvKind::R8, Value::F64(v)) => Value::F64(*v),
            _ => return None,
        };
        Some(v)
    }
}

fn format_float(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v == f64::INFINITY {
        "∞".to_string()
    } else if v == f64::NEG_INFINITY {
        "-∞".to_string()
    } else {
        v.to_string()
    }
}

fn int32_op(l: i32, r: i32, op: BinOp) -> Result<i32, ArithFault> {
    Ok(match op {
        BinOp::Add => l.wrapping_add(r),
        BinOp::Sub => l.wrapping_sub(r),
        BinOp::Mul => l.wrapping_mul(r),
        BinOp::Div => {
            if r == 0 {
                return Err(ArithFault::DivideByZero);
            }
            l.checked_div(r).ok_or(ArithFault::Overflow)?
        }
        BinOp::Rem => {
            if r == 0 {
                return Err(ArithFault::DivideByZero);
            }
            l.checked_rem(r).ok_or(ArithFault::Overflow)?
        }
        BinOp::Shl => l.wrapping_shl(r as u32),
        BinOp::Shr => l.wrapping_shr(r as u32),
        BinOp::ShrUn => ((l as u32).wrapping_shr(r as u32)) as i32,
        BinOp::And => l & r,
        BinOp::Or => l | r,
        BinOp::Xor => l ^ r,
    })
}

fn int64_op(l: i64, r: i64, op: BinOp) -> Result<i64, ArithFault> {
    Ok(match op {
        BinOp::Add => l.wrapping_add(r),
        BinOp::Sub => l.wrapping_sub(r),
        BinOp::Mul => l.wrapping_mul(r),
        BinOp::Div => {
            if r == 0 {
                return Err(ArithFault::DivideByZero);
            }
            l.checked_div(r).ok_or(ArithFault::Overflow)?
        }
        BinOp::Rem => {
            if r == 0 {
                return Err(ArithFault::DivideByZero);
            }
            l.checked_rem(r).ok_or(ArithFault::Overflow)?
        }
        BinOp::Shl => l.wrapping_shl(r as u32),
        BinOp::Shr => l.wrapping_shr(r as u32),
        BinOp::ShrUn => ((l as u64).wrapping_shr(r as u32)) as i64,
        BinOp::And => l & r,
        BinOp::Or => l | r,
        BinOp::Xor => l ^ r,
    })
}

fn float_op(l: f64, r: f64, op: BinOp) -> Result<f64, ArithFault> {
    Ok(match op {
        BinOp::Add => l + r,
        BinOp::Sub => l - r,
        BinOp::Mul => l * r,
        BinOp::Div => l / r,
        BinOp::Rem => l % r,
        _ => return Err(ArithFault::TagMismatch),
    })
}

fn cmp_ord<T: PartialOrd>(l: &T, r: &T, op: CmpOp) -> bool {
    match op {
        CmpOp::Lt => l < r,
        CmpOp::Gte => l >= r,
        CmpOp::Gt => l > r,
        CmpOp::Lte => l <= r,
        CmpOp::Eq => l == r,
        CmpOp::NotEq => l != r,
    }
}

/// Binary arithmetic and bitwise operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Shl,
    Shr,
    ShrUn,
    And,
    Or,
    Xor,
}

impl BinOp {
    fn is_shift(self) -> bool {
        matches!(self, BinOp::Shl | BinOp::Shr | BinOp::ShrUn)
    }
}

/// Comparison operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Gte,
    Gt,
    Lte,
    Eq,
    NotEq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvKind {
    I4,
    I8,
    R8,
}
