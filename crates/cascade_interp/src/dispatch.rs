//! Handler search over a method's protected regions.
//!
//! The functions here only look at the [`RegionTable`]; the interpreter
//! decides which catch clauses match and evaluates filters as it walks
//! the candidates [`search`] yields.
//!
//! A region that declares both catch and cleanup handlers behaves like a
//! `try`/`catch`/`finally` statement: its cleanup handlers also protect
//! the region's catch and filter handler bodies.

use std::collections::VecDeque;
use std::ops::Range;

use cascade::method::{HandlerKind, RegionTable, Scope, ScopePosition};
use cascade::types::TypeRef;
use cascade::values::{ObjRef, Value};

/// What happens once every queued cleanup handler of an unwind has run.
#[derive(Debug)]
pub enum Resume {
    /// Continue at the target of a `leave`.
    Leave(usize),
    /// Return from the method.
    Return(Option<Value>),
    /// Enter a catch (or filter) handler with the exception.
    Catch { handler: Range<usize>, exception: ObjRef },
    /// No handler in this frame; hand the exception to the caller.
    Propagate(ObjRef),
    /// The run was cancelled; keep unwinding to the caller.
    Cancel,
}

/// A sequence of finally/fault handlers being run for one control transfer.
#[derive(Debug)]
pub struct PendingUnwind {
    /// Body of the cleanup handler executing now.
    pub running: Range<usize>,
    pub queue: VecDeque<Range<usize>>,
    pub resume: Resume,
}

/// A catch handler body currently executing, and the exception it caught.
#[derive(Debug)]
pub struct ActiveCatch {
    pub range: Range<usize>,
    pub exception: ObjRef,
}

/// A step of the handler search, innermost region first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Candidate {
    Catch { ty: TypeRef, handler: Range<usize> },
    Filter { filter: Range<usize>, handler: Range<usize> },
    /// A finally or fault handler to queue if the search continues past it.
    Cleanup(Range<usize>),
}

fn within(outer: &Range<usize>, inner: &Range<usize>) -> bool {
    outer.start <= inner.start && inner.end <= outer.end
}

/// Scopes at `pc`, innermost first. With a boundary (a running filter
/// block) only regions nested inside it are visible.
pub fn scopes<'a>(
    regions: &'a RegionTable,
    pc: usize,
    boundary: Option<&'a Range<usize>>,
) -> impl Iterator<Item = Scope> + 'a {
    regions
        .scopes_at(pc)
        .iter()
        .copied()
        .filter(move |s| boundary.map_or(true, |b| within(b, &regions.scope_range(*s))))
}

/// Candidates for an exception raised at `pc`. Within one region the
/// catch and filter clauses come first, in declaration order, followed by
/// the region's cleanup handlers.
pub fn search(regions: &RegionTable, pc: usize, boundary: Option<&Range<usize>>) -> Vec<Candidate> {
    let mut out = Vec::new();
    for scope in scopes(regions, pc, boundary) {
        let region = regions.region(scope.region);
        if scope.position == ScopePosition::Try {
            for handler in &region.handlers {
                match handler.kind {
                    HandlerKind::Catch(ty) => out.push(Candidate::Catch {
                        ty,
                        handler: handler.range(),
                    }),
                    HandlerKind::Filter { filter_start } => out.push(Candidate::Filter {
                        filter: filter_start..handler.start,
                        handler: handler.range(),
                    }),
                    HandlerKind::Finally | HandlerKind::Fault => {}
                }
            }
        }
        out.extend(
            region
                .handlers
                .iter()
                .filter(|h| h.is_cleanup())
                .map(|h| Candidate::Cleanup(h.range())),
        );
    }
    out
}

/// Finally handlers that run when `leave` at `pc` exits to `target`.
pub fn leave_cleanups(
    regions: &RegionTable,
    pc: usize,
    target: usize,
    boundary: Option<&Range<usize>>,
) -> Vec<Range<usize>> {
    let mut out = Vec::new();
    for scope in scopes(regions, pc, boundary) {
        if regions.scope_range(scope).contains(&target) {
            break;
        }
        out.extend(finally_handlers(regions, scope, false));
    }
    out
}

/// Cleanup handlers that run when the frame is exited from `pc` without
/// an exception. Fault handlers are included only for cancellation.
pub fn exit_cleanups(
    regions: &RegionTable,
    pc: usize,
    boundary: Option<&Range<usize>>,
    with_faults: bool,
) -> Vec<Range<usize>> {
    scopes(regions, pc, boundary)
        .flat_map(|scope| finally_handlers(regions, scope, with_faults))
        .collect()
}

fn finally_handlers(regions: &RegionTable, scope: Scope, with_faults: bool) -> Vec<Range<usize>> {
    regions
        .region(scope.region)
        .handlers
        .iter()
        .filter(|h| match h.kind {
            HandlerKind::Finally => true,
            HandlerKind::Fault => with_faults,
            _ => false,
        })
        .map(|h| h.range())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use cascade::method::{Handler, ProtectedRegion};

    fn handler(kind: HandlerKind, start: usize, end: usize) -> Handler {
        Handler { kind, start, end }
    }

    /// 0..4 inner try (catch 4..6, fault 6..7), 0..8 outer try (finally 8..10),
    /// 10..12 filter block for a handler at 12..14 around try 0..10.
    fn nested() -> Result<RegionTable> {
        let regions = vec![
            ProtectedRegion {
                try_start: 0,
                try_end: 4,
                handlers: vec![
                    handler(HandlerKind::Catch(TypeRef::ARITHMETIC_EXCEPTION), 4, 6),
                    handler(HandlerKind::Fault, 6, 7),
                ],
            },
            ProtectedRegion {
                try_start: 0,
                try_end: 8,
                handlers: vec![handler(HandlerKind::Finally, 8, 10)],
            },
            ProtectedRegion {
                try_start: 0,
                try_end: 10,
                handlers: vec![handler(HandlerKind::Filter { filter_start: 10 }, 12, 14)],
            },
        ];
        Ok(RegionTable::build("Test::Nested()", regions, 16)?)
    }

    #[test]
    fn test_search_is_innermost_first() -> Result<()> {
        let table = nested()?;
        assert_eq!(
            search(&table, 1, None),
            vec![
                Candidate::Catch {
                    ty: TypeRef::ARITHMETIC_EXCEPTION,
                    handler: 4..6
                },
                Candidate::Cleanup(6..7),
                Candidate::Cleanup(8..10),
                Candidate::Filter {
                    filter: 10..12,
                    handler: 12..14
                },
            ]
        );
        Ok(())
    }

    #[test]
    fn test_catch_body_sees_only_cleanups_of_its_region() -> Result<()> {
        let table = nested()?;
        assert_eq!(
            search(&table, 5, None),
            vec![
                Candidate::Cleanup(6..7),
                Candidate::Cleanup(8..10),
                Candidate::Filter {
                    filter: 10..12,
                    handler: 12..14
                },
            ]
        );
        Ok(())
    }

    #[test]
    fn test_boundary_hides_outer_regions() -> Result<()> {
        let table = nested()?;
        assert!(search(&table, 11, Some(&(10..12))).is_empty());
        assert!(scopes(&table, 1, Some(&(0..5))).all(|s| s.region.0 == 0));
        Ok(())
    }

    #[test]
    fn test_leave_runs_finally_but_not_fault() -> Result<()> {
        let table = nested()?;
        assert_eq!(leave_cleanups(&table, 1, 15, None), vec![8..10]);
        assert!(leave_cleanups(&table, 1, 3, None).is_empty());
        assert_eq!(exit_cleanups(&table, 1, None, true), vec![6..7, 8..10]);
        assert_eq!(exit_cleanups(&table, 1, None, false), vec![8..10]);
        Ok(())
    }
}
