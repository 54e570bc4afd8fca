//! Methods, protected-region tables and the method table.
//!
//! Protected regions are kept as a flat arena. For every instruction
//! offset the table precomputes the chain of scopes enclosing it, ordered
//! innermost first, so exception dispatch is a linear scan instead of a
//! walk over a nested structure.

use std::collections::HashMap;
use std::ops::Range;

use crate::asm::MethodAssembler;
use crate::error::MethodError;
use crate::native_lib::ForeignDescriptor;
use crate::opcodes::{Opcode, RefMethod, RefString};
use crate::types::{Signature, Str, TypeRef, TypeTable, ValueKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Runs when the in-flight exception is assignable to the type.
    Catch(TypeRef),
    /// Runs the filter block at `filter_start` (ending at the handler's
    /// start) and enters the handler when it yields non-zero.
    Filter { filter_start: usize },
    /// Runs on every exit from the protected range.
    Finally,
    /// Runs only when the protected range is left by an exception.
    Fault,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handler {
    pub kind: HandlerKind,
    pub start: usize,
    pub end: usize,
}

impl Handler {
    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }

    pub fn contains(&self, offset: usize) -> bool {
        self.range().contains(&offset)
    }

    /// Finally and fault handlers run during unwind; they never end the search.
    pub fn is_cleanup(&self) -> bool {
        matches!(self.kind, HandlerKind::Finally | HandlerKind::Fault)
    }

    pub fn filter_range(&self) -> Option<Range<usize>> {
        match self.kind {
            HandlerKind::Filter { filter_start } => Some(filter_start..self.start),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectedRegion {
    pub try_start: usize,
    pub try_end: usize,
    pub handlers: Vec<Handler>,
}

impl ProtectedRegion {
    pub fn try_range(&self) -> Range<usize> {
        self.try_start..self.try_end
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId(pub usize);

/// Where an offset sits relative to a region.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ScopePosition {
    /// Inside the try range: every handler of the region applies.
    Try,
    /// Inside the body of the catch or filter handler with this index: only
    /// the region's cleanup handlers apply.
    Handler(usize),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Scope {
    pub region: RegionId,
    pub position: ScopePosition,
}

#[derive(Debug, Clone, Default)]
pub struct RegionTable {
    regions: Vec<ProtectedRegion>,
    scopes: Vec<Vec<Scope>>,
}

impl RegionTable {
    pub fn build(
        method: &str,
        regions: Vec<ProtectedRegion>,
        body_len: usize,
    ) -> Result<Self, MethodError> {
        let mut ranges: Vec<(Range<usize>, Option<Scope>)> = Vec::new();

        for (i, region) in regions.iter().enumerate() {
            let id = RegionId(i);
            check_range(method, i, "try", region.try_range(), body_len)?;
            if region.handlers.is_empty() {
                return Err(MethodError::NoHandlers {
                    method: method.to_string(),
                    region: i,
                });
            }
            ranges.push((
                region.try_range(),
                Some(Scope {
                    region: id,
                    position: ScopePosition::Try,
                }),
            ));

            for (h, handler) in region.handlers.iter().enumerate() {
                check_range(method, i, "handler", handler.range(), body_len)?;
                if overlaps(&handler.range(), &region.try_range()) {
                    return Err(overlap_error(method, &handler.range(), &region.try_range()));
                }
                let scope = (!handler.is_cleanup()).then_some(Scope {
                    region: id,
                    position: ScopePosition::Handler(h),
                });
                ranges.push((handler.range(), scope));

                if let Some(filter) = handler.filter_range() {
                    check_range(method, i, "filter", filter.clone(), body_len)?;
                    if overlaps(&filter, &region.try_range()) {
                        return Err(overlap_error(method, &filter, &region.try_range()));
                    }
                    ranges.push((filter, None));
                }
            }
        }

        for (a, (ra, _)) in ranges.iter().enumerate() {
            for (rb, _) in &ranges[a + 1..] {
                if overlaps(ra, rb) && !nests(ra, rb) && !nests(rb, ra) {
                    return Err(overlap_error(method, ra, rb));
                }
            }
        }

        let mut scopes = vec![Vec::new(); body_len];
        for (offset, at) in scopes.iter_mut().enumerate() {
            let mut enclosing: Vec<(usize, usize, Scope)> = ranges
                .iter()
                .filter(|(r, _)| r.contains(&offset))
                .filter_map(|(r, s)| s.map(|s| (r.len(), s.region.0, s)))
                .collect();
            // Identical ranges: the region declared first is the inner one.
            enclosing.sort_by_key(|(len, region, _)| (*len, *region));
            *at = enclosing.into_iter().map(|(_, _, s)| s).collect();
        }

        Ok(RegionTable { regions, scopes })
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn regions(&self) -> &[ProtectedRegion] {
        &self.regions
    }

    pub fn region(&self, id: RegionId) -> &ProtectedRegion {
        &self.regions[id.0]
    }

    /// Scopes enclosing `offset`, innermost first.
    pub fn scopes_at(&self, offset: usize) -> &[Scope] {
        self.scopes.get(offset).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn scope_range(&self, scope: Scope) -> Range<usize> {
        let region = self.region(scope.region);
        match scope.position {
            ScopePosition::Try => region.try_range(),
            ScopePosition::Handler(h) => region.handlers[h].range(),
        }
    }
}

fn check_range(
    method: &str,
    region: usize,
    what: &'static str,
    range: Range<usize>,
    body_len: usize,
) -> Result<(), MethodError> {
    if range.start >= range.end || range.end > body_len {
        return Err(MethodError::BadRegionRange {
            method: method.to_string(),
            region,
            what,
            start: range.start,
            end: range.end,
        });
    }
    Ok(())
}

fn overlaps(a: &Range<usize>, b: &Range<usize>) -> bool {
    a.start < b.end && b.start < a.end
}

fn nests(inner: &Range<usize>, outer: &Range<usize>) -> bool {
    outer.start <= inner.start && inner.end <= outer.end
}

fn overlap_error(method: &str, a: &Range<usize>, b: &Range<usize>) -> MethodError {
    MethodError::OverlappingRegions {
        method: method.to_string(),
        first: (a.start, a.end),
        second: (b.start, b.end),
    }
}

#[derive(Debug, Clone)]
pub struct IlBody {
    pub ops: Vec<Opcode>,
    pub locals: u16,
    pub max_stack: u16,
    pub regions: RegionTable,
}

#[derive(Debug, Clone)]
pub enum MethodBody {
    Il(IlBody),
    Foreign(ForeignDescriptor),
}

#[derive(Debug, Clone)]
pub struct Method {
    pub name: Str,
    pub signature: Signature,
    pub body: MethodBody,
}

impl Method {
    pub fn il(&self) -> Option<&IlBody> {
        match &self.body {
            MethodBody::Il(body) => Some(body),
            MethodBody::Foreign(_) => None,
        }
    }
}

/// Read-only mapping from method identity to method, plus the string pool
/// and runtime types the bodies refer to.
#[derive(Debug)]
pub struct MethodTable {
    methods: Vec<Method>,
    by_name: HashMap<Str, RefMethod>,
    strings: Vec<Str>,
    types: TypeTable,
}

impl MethodTable {
    pub fn get(&self, r: RefMethod) -> Option<&Method> {
        self.methods.get(r.0)
    }

    pub fn lookup(&self, name: &str) -> Option<RefMethod> {
        self.by_name.get(&Str::from(name)).copied()
    }

    pub fn string(&self, r: RefString) -> Option<&Str> {
        self.strings.get(r.0)
    }

    pub fn types(&self) -> &TypeTable {
        &self.types
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (RefMethod, &Method)> {
        self.methods.iter().enumerate().map(|(i, m)| (RefMethod(i), m))
    }
}

enum PendingBody {
    Undefined,
    Il(MethodAssembler),
    Foreign(ForeignDescriptor),
}

struct PendingMethod {
    name: Str,
    signature: Signature,
    body: PendingBody,
}

/// Collects method declarations and bodies, then validates everything in
/// [`build`](MethodTableBuilder::build).
///
/// Methods are declared before they are defined so bodies can call
/// methods defined later.
#[derive(Default)]
pub struct MethodTableBuilder {
    types: TypeTable,
    strings: Vec<Str>,
    string_index: HashMap<Str, RefString>,
    methods: Vec<PendingMethod>,
    by_name: HashMap<Str, RefMethod>,
}

impl MethodTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn types_mut(&mut self) -> &mut TypeTable {
        &mut self.types
    }

    pub fn define_type(&mut self, name: &str, super_: TypeRef) -> Result<TypeRef, MethodError> {
        self.types.define(name, super_)
    }

    pub fn intern(&mut self, s: &str) -> RefString {
        let key = Str::from(s);
        if let Some(r) = self.string_index.get(&key) {
            return *r;
        }
        let r = RefString(self.strings.len());
        self.strings.push(key.clone());
        self.string_index.insert(key, r);
        r
    }

    pub fn declare(&mut self, name: &str, signature: Signature) -> Result<RefMethod, MethodError> {
        let key = Str::from(name);
        if self.by_name.contains_key(&key) {
            return Err(MethodError::DuplicateMethod(name.to_string()));
        }
        let r = RefMethod(self.methods.len());
        self.methods.push(PendingMethod {
            name: key.clone(),
            signature,
            body: PendingBody::Undefined,
        });
        self.by_name.insert(key, r);
        Ok(r)
    }

    pub fn define(&mut self, method: RefMethod, asm: MethodAssembler) {
        if let Some(m) = self.methods.get_mut(method.0) {
            m.body = PendingBody::Il(asm);
        }
    }

    pub fn define_foreign(&mut self, method: RefMethod, descriptor: ForeignDescriptor) {
        if let Some(m) = self.methods.get_mut(method.0) {
            m.body = PendingBody::Foreign(descriptor);
        }
    }

    /// Declare and bind a foreign method in one step.
    pub fn foreign(
        &mut self,
        name: &str,
        signature: Signature,
        descriptor: ForeignDescriptor,
    ) -> Result<RefMethod, MethodError> {
        let r = self.declare(name, signature)?;
        self.define_foreign(r, descriptor);
        Ok(r)
    }

    pub fn build(mut self) -> Result<MethodTable, MethodError> {
        let pending = std::mem::take(&mut self.methods);
        let method_count = pending.len();
        let mut methods = Vec::with_capacity(method_count);

        for m in pending {
            let body = match m.body {
                PendingBody::Undefined => {
                    return Err(MethodError::UndefinedMethod(m.name.to_string()))
                }
                PendingBody::Foreign(descriptor) => {
                    if descriptor.is_external()
                        && matches!(m.signature.ret, ValueKind::String | ValueKind::Object)
                    {
                        return Err(MethodError::UnsupportedForeignReturn {
                            method: m.name.to_string(),
                            ret: m.signature.ret,
                        });
                    }
                    MethodBody::Foreign(descriptor)
                }
                PendingBody::Il(asm) => {
                    let mut body = asm.finish(&m.name)?;
                    for (offset, literal) in &body.literals {
                        let ptr = self.intern(literal);
                        body.ops[*offset] = Opcode::LdStr { ptr };
                    }
                    self.check_operands(
                        &m.name,
                        &m.signature,
                        &body.ops,
                        body.locals,
                        method_count,
                    )?;
                    let regions = RegionTable::build(&m.name, body.regions, body.ops.len())?;
                    MethodBody::Il(IlBody {
                        ops: body.ops,
                        locals: body.locals,
                        max_stack: body.max_stack,
                        regions,
                    })
                }
            };
            methods.push(Method {
                name: m.name,
                signature: m.signature,
                body,
            });
        }

        Ok(MethodTable {
            methods,
            by_name: self.by_name,
            strings: self.strings,
            types: self.types,
        })
    }

    fn check_operands(
        &self,
        method: &str,
        signature: &Signature,
        ops: &[Opcode],
        locals: u16,
        method_count: usize,
    ) -> Result<(), MethodError> {
        let bad = |offset: usize, what: &'static str, index: usize| MethodError::BadOperand {
            method: method.to_string(),
            offset,
            what,
            index,
        };
        for (offset, op) in ops.iter().enumerate() {
            for target in op.targets() {
                if target >= ops.len() {
                    return Err(MethodError::TargetOutOfRange {
                        method: method.to_string(),
                        offset,
                        target,
                        len: ops.len(),
                    });
                }
            }
            match op {
                Opcode::LdStr { ptr } if ptr.0 >= self.strings.len() => {
                    return Err(bad(offset, "string", ptr.0))
                }
                Opcode::LdArg { index } | Opcode::StArg { index }
                    if *index as usize >= signature.arity() =>
                {
                    return Err(bad(offset, "argument", *index as usize))
                }
                Opcode::LdLoc { index } | Opcode::StLoc { index } if *index >= locals => {
                    return Err(bad(offset, "local", *index as usize))
                }
                Opcode::Call { method: callee } if callee.0 >= method_count => {
                    return Err(bad(offset, "method", callee.0))
                }
                Opcode::NewException { ty } if ty.0 >= self.types.len() => {
                    return Err(bad(offset, "type", ty.0))
                }
                _ => {}
            }
        }
        Ok(())
    }
}
