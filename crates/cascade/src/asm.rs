//! Label-based builder for method bodies.
//!
//! Branches and region boundaries refer to [`Label`]s; offsets are patched
//! in when the body is finished, so bodies can be written front to back
//! without counting instructions.

use crate::error::MethodError;
use crate::method::{Handler, HandlerKind, ProtectedRegion};
use crate::opcodes::{Opcode, RefMethod, RefString, Target};
use crate::types::{Str, TypeRef};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Label(usize);

#[derive(Debug, Clone, Copy)]
pub enum AsmHandlerKind {
    Catch(TypeRef),
    Filter(Label),
    Finally,
    Fault,
}

#[derive(Debug, Clone, Copy)]
pub struct AsmHandler {
    pub kind: AsmHandlerKind,
    pub start: Label,
    pub end: Label,
}

impl AsmHandler {
    pub fn catch(ty: TypeRef, start: Label, end: Label) -> Self {
        AsmHandler {
            kind: AsmHandlerKind::Catch(ty),
            start,
            end,
        }
    }

    /// `filter` labels the first instruction of the filter block, which
    /// runs up to `start`.
    pub fn filter(filter: Label, start: Label, end: Label) -> Self {
        AsmHandler {
            kind: AsmHandlerKind::Filter(filter),
            start,
            end,
        }
    }

    pub fn finally(start: Label, end: Label) -> Self {
        AsmHandler {
            kind: AsmHandlerKind::Finally,
            start,
            end,
        }
    }

    pub fn fault(start: Label, end: Label) -> Self {
        AsmHandler {
            kind: AsmHandlerKind::Fault,
            start,
            end,
        }
    }
}

struct AsmRegion {
    try_start: Label,
    try_end: Label,
    handlers: Vec<AsmHandler>,
}

/// Branch operand waiting for its label: instruction index and, for
/// `switch`, the slot in the jump table.
struct Fixup {
    at: usize,
    slot: usize,
    label: Label,
}

/// An assembled body: instructions with resolved targets, raw regions and
/// string literals still to be interned.
pub struct Assembled {
    pub ops: Vec<Opcode>,
    pub regions: Vec<ProtectedRegion>,
    pub locals: u16,
    pub max_stack: u16,
    pub literals: Vec<(usize, Str)>,
}

pub struct MethodAssembler {
    ops: Vec<Opcode>,
    labels: Vec<Option<usize>>,
    fixups: Vec<Fixup>,
    regions: Vec<AsmRegion>,
    literals: Vec<(usize, Str)>,
    locals: u16,
    max_stack: u16,
}

impl Default for MethodAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl MethodAssembler {
    pub const DEFAULT_MAX_STACK: u16 = 16;

    pub fn new() -> Self {
        MethodAssembler {
            ops: Vec::new(),
            labels: Vec::new(),
            fixups: Vec::new(),
            regions: Vec::new(),
            literals: Vec::new(),
            locals: 0,
            max_stack: Self::DEFAULT_MAX_STACK,
        }
    }

    pub fn locals(&mut self, count: u16) -> &mut Self {
        self.locals = count;
        self
    }

    pub fn max_stack(&mut self, depth: u16) -> &mut Self {
        self.max_stack = depth;
        self
    }

    /// Offset the next emitted instruction will have.
    pub fn offset(&self) -> usize {
        self.ops.len()
    }

    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind `label` to the next emitted instruction.
    pub fn bind(&mut self, label: Label) -> &mut Self {
        self.labels[label.0] = Some(self.ops.len());
        self
    }

    /// A fresh label bound at the current offset.
    pub fn here(&mut self) -> Label {
        let l = self.label();
        self.bind(l);
        l
    }

    pub fn op(&mut self, op: Opcode) -> &mut Self {
        self.ops.push(op);
        self
    }

    pub fn ldc_i4(&mut self, value: i32) -> &mut Self {
        self.op(Opcode::LdcI4 { value })
    }

    pub fn ldc_i8(&mut self, value: i64) -> &mut Self {
        self.op(Opcode::LdcI8 { value })
    }

    pub fn ldarg(&mut self, index: u16) -> &mut Self {
        self.op(Opcode::LdArg { index })
    }

    pub fn ldloc(&mut self, index: u16) -> &mut Self {
        self.op(Opcode::LdLoc { index })
    }

    pub fn stloc(&mut self, index: u16) -> &mut Self {
        self.op(Opcode::StLoc { index })
    }

    /// Push a string literal; it is interned into the method table's pool
    /// when the body is defined.
    pub fn ldstr(&mut self, s: &str) -> &mut Self {
        self.literals.push((self.ops.len(), Str::from(s)));
        self.op(Opcode::LdStr { ptr: RefString(0) })
    }

    pub fn call(&mut self, method: RefMethod) -> &mut Self {
        self.op(Opcode::Call { method })
    }

    /// Push a new exception of type `ty` carrying `message`.
    pub fn new_exception(&mut self, ty: TypeRef, message: &str) -> &mut Self {
        self.ldstr(message);
        self.op(Opcode::NewException { ty })
    }

    fn branch(&mut self, make: fn(Target) -> Opcode, label: Label) -> &mut Self {
        self.fixups.push(Fixup {
            at: self.ops.len(),
            slot: 0,
            label,
        });
        self.op(make(0))
    }

    pub fn br(&mut self, label: Label) -> &mut Self {
        self.branch(|target| Opcode::Br { target }, label)
    }

    pub fn brtrue(&mut self, label: Label) -> &mut Self {
        self.branch(|target| Opcode::BrTrue { target }, label)
    }

    pub fn brfalse(&mut self, label: Label) -> &mut Self {
        self.branch(|target| Opcode::BrFalse { target }, label)
    }

    pub fn beq(&mut self, label: Label) -> &mut Self {
        self.branch(|target| Opcode::Beq { target }, label)
    }

    pub fn bne(&mut self, label: Label) -> &mut Self {
        self.branch(|target| Opcode::Bne { target }, label)
    }

    pub fn bge(&mut self, label: Label) -> &mut Self {
        self.branch(|target| Opcode::Bge { target }, label)
    }

    pub fn bgt(&mut self, label: Label) -> &mut Self {
        self.branch(|target| Opcode::Bgt { target }, label)
    }

    pub fn ble(&mut self, label: Label) -> &mut Self {
        self.branch(|target| Opcode::Ble { target }, label)
    }

    pub fn blt(&mut self, label: Label) -> &mut Self {
        self.branch(|target| Opcode::Blt { target }, label)
    }

    pub fn leave(&mut self, label: Label) -> &mut Self {
        self.branch(|target| Opcode::Leave { target }, label)
    }

    pub fn switch(&mut self, labels: &[Label]) -> &mut Self {
        let at = self.ops.len();
        for (slot, label) in labels.iter().enumerate() {
            self.fixups.push(Fixup {
                at,
                slot,
                label: *label,
            });
        }
        self.op(Opcode::Switch {
            targets: vec![0; labels.len()],
        })
    }

    /// Declare a protected region over `try_start..try_end`.
    pub fn region(&mut self, try_start: Label, try_end: Label, handlers: Vec<AsmHandler>) {
        self.regions.push(AsmRegion {
            try_start,
            try_end,
            handlers,
        });
    }

    /// Resolve labels and produce the raw body. `method` only names the
    /// method in errors.
    pub fn finish(mut self, method: &str) -> Result<Assembled, MethodError> {
        let labels = std::mem::take(&mut self.labels);
        let resolve = |label: Label| {
            labels
                .get(label.0)
                .copied()
                .flatten()
                .ok_or_else(|| MethodError::UnboundLabel {
                    method: method.to_string(),
                    label: label.0,
                })
        };

        for fixup in &self.fixups {
            let offset = resolve(fixup.label)?;
            match &mut self.ops[fixup.at] {
                Opcode::Switch { targets } => targets[fixup.slot] = offset,
                Opcode::Br { target }
                | Opcode::BrTrue { target }
                | Opcode::BrFalse { target }
                | Opcode::Beq { target }
                | Opcode::Bne { target }
                | Opcode::Bge { target }
                | Opcode::Bgt { target }
                | Opcode::Ble { target }
                | Opcode::Blt { target }
                | Opcode::Leave { target } => *target = offset,
                _ => {}
            }
        }

        let mut regions = Vec::with_capacity(self.regions.len());
        for r in &self.regions {
            let mut handlers = Vec::with_capacity(r.handlers.len());
            for h in &r.handlers {
                let kind = match h.kind {
                    AsmHandlerKind::Catch(ty) => HandlerKind::Catch(ty),
                    AsmHandlerKind::Filter(l) => HandlerKind::Filter {
                        filter_start: resolve(l)?,
                    },
                    AsmHandlerKind::Finally => HandlerKind::Finally,
                    AsmHandlerKind::Fault => HandlerKind::Fault,
                };
                handlers.push(Handler {
                    kind,
                    start: resolve(h.start)?,
                    end: resolve(h.end)?,
                });
            }
            regions.push(ProtectedRegion {
                try_start: resolve(r.try_start)?,
                try_end: resolve(r.try_end)?,
                handlers,
            });
        }

        Ok(Assembled {
            ops: self.ops,
            regions,
            locals: self.locals,
            max_stack: self.max_stack,
            literals: self.literals,
        })
    }
}
