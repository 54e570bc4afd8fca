use std::collections::HashMap;
use std::fmt;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::MethodError;

pub type Str = flexstr::SharedStr;

/// Kind of a value slot as declared in a signature.
///
/// Discriminants are the metadata element-type codes, so a loader can go
/// straight from a signature blob byte to a kind with `ValueKind::try_from`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ValueKind {
    Void = 0x01,
    Bool = 0x02,
    I4 = 0x08,
    I8 = 0x0A,
    R8 = 0x0D,
    String = 0x0E,
    NativeInt = 0x18,
    Object = 0x1C,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValueKind::Void => "void",
            ValueKind::Bool => "bool",
            ValueKind::I4 => "int32",
            ValueKind::I8 => "int64",
            ValueKind::R8 => "float64",
            ValueKind::String => "string",
            ValueKind::NativeInt => "native int",
            ValueKind::Object => "object",
        };
        f.write_str(s)
    }
}

/// Parameter and return kinds of a method or foreign target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    pub params: Vec<ValueKind>,
    pub ret: ValueKind,
}

impl Signature {
    pub fn new(params: impl Into<Vec<ValueKind>>, ret: ValueKind) -> Self {
        Signature {
            params: params.into(),
            ret,
        }
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }

    pub fn returns_value(&self) -> bool {
        self.ret != ValueKind::Void
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (", self.ret)?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", p)?;
        }
        f.write_str(")")
    }
}

/// A reference to a runtime type in the [`TypeTable`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct TypeRef(pub usize);

impl TypeRef {
    pub const OBJECT: TypeRef = TypeRef(0);
    pub const STRING: TypeRef = TypeRef(1);
    pub const EXCEPTION: TypeRef = TypeRef(2);
    pub const SYSTEM_EXCEPTION: TypeRef = TypeRef(3);
    pub const ARITHMETIC_EXCEPTION: TypeRef = TypeRef(4);
    pub const DIVIDE_BY_ZERO_EXCEPTION: TypeRef = TypeRef(5);
    pub const OVERFLOW_EXCEPTION: TypeRef = TypeRef(6);
    pub const INVALID_OPERATION_EXCEPTION: TypeRef = TypeRef(7);
    pub const ARGUMENT_EXCEPTION: TypeRef = TypeRef(8);
    pub const NULL_REFERENCE_EXCEPTION: TypeRef = TypeRef(9);
    pub const TYPE_LOAD_EXCEPTION: TypeRef = TypeRef(10);
    pub const DLL_NOT_FOUND_EXCEPTION: TypeRef = TypeRef(11);
    pub const ENTRY_POINT_NOT_FOUND_EXCEPTION: TypeRef = TypeRef(12);
    pub const MISSING_METHOD_EXCEPTION: TypeRef = TypeRef(13);
    pub const MARSHAL_DIRECTIVE_EXCEPTION: TypeRef = TypeRef(14);
    pub const RUNTIME_WRAPPED_EXCEPTION: TypeRef = TypeRef(15);
}

// Order must match the TypeRef constants above.
const BUILTIN_TYPES: &[(&str, Option<TypeRef>)] = &[
    ("System.Object", None),
    ("System.String", Some(TypeRef::OBJECT)),
    ("System.Exception", Some(TypeRef::OBJECT)),
    ("System.SystemException", Some(TypeRef::EXCEPTION)),
    ("System.ArithmeticException", Some(TypeRef::SYSTEM_EXCEPTION)),
    ("System.DivideByZeroException", Some(TypeRef::ARITHMETIC_EXCEPTION)),
    ("System.OverflowException", Some(TypeRef::ARITHMETIC_EXCEPTION)),
    ("System.InvalidOperationException", Some(TypeRef::SYSTEM_EXCEPTION)),
    ("System.ArgumentException", Some(TypeRef::SYSTEM_EXCEPTION)),
    ("System.NullReferenceException", Some(TypeRef::SYSTEM_EXCEPTION)),
    ("System.TypeLoadException", Some(TypeRef::SYSTEM_EXCEPTION)),
    ("System.DllNotFoundException", Some(TypeRef::TYPE_LOAD_EXCEPTION)),
    ("System.EntryPointNotFoundException", Some(TypeRef::TYPE_LOAD_EXCEPTION)),
    ("System.MissingMethodException", Some(TypeRef::SYSTEM_EXCEPTION)),
    (
        "System.Runtime.InteropServices.MarshalDirectiveException",
        Some(TypeRef::SYSTEM_EXCEPTION),
    ),
    (
        "System.Runtime.CompilerServices.RuntimeWrappedException",
        Some(TypeRef::EXCEPTION),
    ),
];

#[derive(Debug, Clone)]
pub struct TypeDef {
    pub name: Str,
    pub super_: Option<TypeRef>,
}

/// Runtime type tags with single inheritance.
///
/// A type can only name an already-defined supertype, so the supertype
/// chain is acyclic by construction.
#[derive(Debug, Clone)]
pub struct TypeTable {
    types: Vec<TypeDef>,
    by_name: HashMap<Str, TypeRef>,
}

impl Default for TypeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeTable {
    /// A table holding the built-in object, string and exception types.
    pub fn new() -> Self {
        let mut table = TypeTable {
            types: Vec::with_capacity(BUILTIN_TYPES.len()),
            by_name: HashMap::new(),
        };
        for (name, super_) in BUILTIN_TYPES {
            let r = TypeRef(table.types.len());
            table.types.push(TypeDef {
                name: Str::from(*name),
                super_: *super_,
            });
            table.by_name.insert(Str::from(*name), r);
        }
        table
    }

    pub fn define(&mut self, name: &str, super_: TypeRef) -> Result<TypeRef, MethodError> {
        if self.by_name.contains_key(&Str::from(name)) {
            return Err(MethodError::DuplicateType(name.to_string()));
        }
        if super_.0 >= self.types.len() {
            return Err(MethodError::UnknownType(super_.0));
        }
        let r = TypeRef(self.types.len());
        self.types.push(TypeDef {
            name: Str::from(name),
            super_: Some(super_),
        });
        self.by_name.insert(Str::from(name), r);
        Ok(r)
    }

    pub fn get(&self, r: TypeRef) -> Option<&TypeDef> {
        self.types.get(r.0)
    }

    pub fn lookup(&self, name: &str) -> Option<TypeRef> {
        self.by_name.get(&Str::from(name)).copied()
    }

    pub fn name(&self, r: TypeRef) -> &str {
        self.types.get(r.0).map(|t| &*t.name).unwrap_or("<unknown type>")
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// True when a value of runtime type `from` may be bound to a slot
    /// declared as `to`: `from` is `to` or one of its declared subtypes.
    pub fn is_assignable(&self, from: TypeRef, to: TypeRef) -> bool {
        let mut current = Some(from);
        while let Some(t) = current {
            if t == to {
                return true;
            }
            current = self.types.get(t.0).and_then(|d| d.super_);
        }
        false
    }
}
