use std::fmt;

use crate::types::TypeRef;

/// Absolute instruction index a branch, `leave` or `switch` transfers to.
pub type Target = usize;

/// Index reference to a method in the [`MethodTable`](crate::method::MethodTable).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Default)]
pub struct RefMethod(pub usize);

/// Reference to the string constant pool
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct RefString(pub usize);

/// Opcode definitions for the stack machine. The fields are the opcode operands.
///
/// Instructions are addressed by their index in the method body; every
/// "offset" in a method (branch targets, protected ranges, the call-site
/// offset of a frame) is such an index.
#[derive(Debug, Clone, PartialEq)]
pub enum Opcode {
    /// Do nothing
    Nop,
    /// Push an **i32** constant
    LdcI4 { value: i32 },
    /// Push an **i64** constant
    LdcI8 { value: i64 },
    /// Push an **f64** constant
    LdcR8 { value: f64 },
    /// Push a string from the constant pool
    LdStr { ptr: RefString },
    /// Push the null reference
    LdNull,
    /// Push argument `index`
    LdArg { index: u16 },
    /// Pop into argument `index`
    StArg { index: u16 },
    /// Push local `index`
    LdLoc { index: u16 },
    /// Pop into local `index`
    StLoc { index: u16 },
    /// Duplicate the top of the stack
    Dup,
    /// Discard the top of the stack
    Pop,

    /// `a + b`
    Add,
    /// `a - b`
    Sub,
    /// `a * b`
    Mul,
    /// `a / b`, throws on a zero divisor
    Div,
    /// `a % b`, throws on a zero divisor
    Rem,
    /// `a & b`
    And,
    /// `a | b`
    Or,
    /// `a ^ b`
    Xor,
    /// `a << b`
    Shl,
    /// `a >> b` (arithmetic)
    Shr,
    /// `a >> b` (logical)
    ShrUn,
    /// `-a`
    Neg,
    /// `!a` (bitwise)
    Not,

    /// Push `a == b` as an i32
    Ceq,
    /// Push `a > b` as an i32
    Cgt,
    /// Push `a < b` as an i32
    Clt,

    /// Convert to **i32**
    ConvI4,
    /// Convert to **i64**
    ConvI8,
    /// Convert to **f64**
    ConvR8,

    /// Unconditional jump
    Br { target: Target },
    /// Pop a value, jump if it is non-zero / non-null
    BrTrue { target: Target },
    /// Pop a value, jump if it is zero / null
    BrFalse { target: Target },
    /// Pop `b`, `a`; jump if `a == b`
    Beq { target: Target },
    /// Pop `b`, `a`; jump if `a != b`
    Bne { target: Target },
    /// Pop `b`, `a`; jump if `a >= b`
    Bge { target: Target },
    /// Pop `b`, `a`; jump if `a > b`
    Bgt { target: Target },
    /// Pop `b`, `a`; jump if `a <= b`
    Ble { target: Target },
    /// Pop `b`, `a`; jump if `a < b`
    Blt { target: Target },
    /// Pop an i32 index and jump to `targets[index]`, falling through when out of range
    Switch { targets: Vec<Target> },

    /// Call a method, popping its arguments (first argument deepest) and
    /// pushing its return value if it has one
    Call { method: RefMethod },
    /// Return from the current method, popping the return value if the
    /// method declares one
    Ret,

    /// Pop a message string and push a new exception object of type `ty`
    NewException { ty: TypeRef },
    /// Pop a reference and throw it
    Throw,
    /// Re-throw the exception being handled by the enclosing catch handler
    Rethrow,
    /// Exit a protected region or handler, running the finally handlers of
    /// every region being left, then continue at `target`
    Leave { target: Target },
    /// End of a finally or fault handler
    EndFinally,
    /// End of a filter block; pops the i32 verdict
    EndFilter,
}

impl Opcode {
    /// All transfer targets named by this instruction.
    pub fn targets(&self) -> Vec<Target> {
        match self {
            Opcode::Br { target }
            | Opcode::BrTrue { target }
            | Opcode::BrFalse { target }
            | Opcode::Beq { target }
            | Opcode::Bne { target }
            | Opcode::Bge { target }
            | Opcode::Bgt { target }
            | Opcode::Ble { target }
            | Opcode::Blt { target }
            | Opcode::Leave { target } => vec![*target],
            Opcode::Switch { targets } => targets.clone(),
            _ => vec![],
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Opcode::Nop => "nop",
            Opcode::LdcI4 { .. } => "ldc.i4",
            Opcode::LdcI8 { .. } => "ldc.i8",
            Opcode::LdcR8 { .. } => "ldc.r8",
            Opcode::LdStr { .. } => "ldstr",
            Opcode::LdNull => "ldnull",
            Opcode::LdArg { .. } => "ldarg",
            Opcode::StArg { .. } => "starg",
            Opcode::LdLoc { .. } => "ldloc",
            Opcode::StLoc { .. } => "stloc",
            Opcode::Dup => "dup",
            Opcode::Pop => "pop",
            Opcode::Add => "add",
            Opcode::Sub => "sub",
            Opcode::Mul => "mul",
            Opcode::Div => "div",
            Opcode::Rem => "rem",
            Opcode::And => "and",
            Opcode::Or => "or",
            Opcode::Xor => "xor",
            Opcode::Shl => "shl",
            Opcode::Shr => "shr",
            Opcode::ShrUn => "shr.un",
            Opcode::Neg => "neg",
            Opcode::Not => "not",
            Opcode::Ceq => "ceq",
            Opcode::Cgt => "cgt",
            Opcode::Clt => "clt",
            Opcode::ConvI4 => "conv.i4",
            Opcode::ConvI8 => "conv.i8",
            Opcode::ConvR8 => "conv.r8",
            Opcode::Br { .. } => "br",
            Opcode::BrTrue { .. } => "brtrue",
            Opcode::BrFalse { .. } => "brfalse",
            Opcode::Beq { .. } => "beq",
            Opcode::Bne { .. } => "bne",
            Opcode::Bge { .. } => "bge",
            Opcode::Bgt { .. } => "bgt",
            Opcode::Ble { .. } => "ble",
            Opcode::Blt { .. } => "blt",
            Opcode::Switch { .. } => "switch",
            Opcode::Call { .. } => "call",
            Opcode::Ret => "ret",
            Opcode::NewException { .. } => "newexc",
            Opcode::Throw => "throw",
            Opcode::Rethrow => "rethrow",
            Opcode::Leave { .. } => "leave",
            Opcode::EndFinally => "endfinally",
            Opcode::EndFilter => "endfilter",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())?;
        match self {
            Opcode::LdcI4 { value } => write!(f, " {}", value),
            Opcode::LdcI8 { value } => write!(f, " {}", value),
            Opcode::LdcR8 { value } => write!(f, " {}", value),
            Opcode::LdStr { ptr } => write!(f, " @{}", ptr.0),
            Opcode::LdArg { index }
            | Opcode::StArg { index }
            | Opcode::LdLoc { index }
            | Opcode::StLoc { index } => write!(f, " {}", index),
            Opcode::Call { method } => write!(f, " m{}", method.0),
            Opcode::NewException { ty } => write!(f, " t{}", ty.0),
            Opcode::Switch { targets } => {
                f.write_str(" (")?;
                for (i, t) in targets.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "IL_{:04}", t)?;
                }
                f.write_str(")")
            }
            op => match op.targets().first() {
                Some(t) => write!(f, " IL_{:04}", t),
                None => Ok(()),
            },
        }
    }
}
