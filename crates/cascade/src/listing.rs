//! Text listing of a method table: each method's signature, its
//! instructions and its protected regions.

use std::fmt;

use crate::method::{Handler, HandlerKind, Method, MethodBody, MethodTable, ProtectedRegion};
use crate::opcodes::Opcode;

/// Displays every method of a table in declaration order.
pub struct Listing<'a>(pub &'a MethodTable);

impl fmt::Display for Listing<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (_, method)) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            self.method(f, method)?;
        }
        Ok(())
    }
}

impl Listing<'_> {
    fn method(&self, f: &mut fmt::Formatter<'_>, method: &Method) -> fmt::Result {
        writeln!(f, "// method {} sig={}", &*method.name, method.signature)?;
        let body = match &method.body {
            MethodBody::Foreign(descriptor) => return writeln!(f, "  .foreign {}", descriptor),
            MethodBody::Il(body) => body,
        };
        writeln!(f, "  .locals {} .maxstack {}", body.locals, body.max_stack)?;
        for (offset, op) in body.ops.iter().enumerate() {
            write!(f, "  IL_{:04}: ", offset)?;
            self.instruction(f, op)?;
            writeln!(f)?;
        }
        for region in body.regions.regions() {
            self.region(f, region)?;
        }
        Ok(())
    }

    /// Operands that index into the table are shown by name.
    fn instruction(&self, f: &mut fmt::Formatter<'_>, op: &Opcode) -> fmt::Result {
        let table = self.0;
        match op {
            Opcode::LdStr { ptr } => match table.string(*ptr) {
                Some(s) => write!(f, "ldstr {:?}", &**s),
                None => write!(f, "{}", op),
            },
            Opcode::Call { method } => match table.get(*method) {
                Some(callee) => write!(f, "call {}", &*callee.name),
                None => write!(f, "{}", op),
            },
            Opcode::NewException { ty } => match table.types().get(*ty) {
                Some(_) => write!(f, "newexc {}", table.types().name(*ty)),
                None => write!(f, "{}", op),
            },
            _ => write!(f, "{}", op),
        }
    }

    fn region(&self, f: &mut fmt::Formatter<'_>, region: &ProtectedRegion) -> fmt::Result {
        writeln!(f, "  .try IL_{:04}..IL_{:04}", region.try_start, region.try_end)?;
        for handler in &region.handlers {
            self.handler(f, handler)?;
        }
        Ok(())
    }

    fn handler(&self, f: &mut fmt::Formatter<'_>, handler: &Handler) -> fmt::Result {
        f.write_str("    ")?;
        match handler.kind {
            HandlerKind::Catch(ty) => write!(f, "catch {} ", self.0.types().name(ty))?,
            HandlerKind::Filter { filter_start } => write!(f, "filter IL_{:04} handler ", filter_start)?,
            HandlerKind::Finally => f.write_str("finally ")?,
            HandlerKind::Fault => f.write_str("fault ")?,
        }
        writeln!(f, "IL_{:04}..IL_{:04}", handler.start, handler.end)
    }
}
