use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use cascade::asm::{AsmHandler, MethodAssembler};
use cascade::internal;
use cascade::method::{MethodTable, MethodTableBuilder};
use cascade::opcodes::{Opcode, RefMethod};
use cascade::types::{Signature, TypeRef, ValueKind};
use cascade::{CaptureHost, ForeignBridge, ForeignDescriptor, Value};
use cascade_interp::{
    CancellationToken, ExecutionError, Interpreter, InterpreterOptions, Outcome, UnhandledException,
};
use proptest::prelude::*;

const WRITE_LINE: &str = "System.Console::WriteLine(string)";
const MESSAGE: &str = "System.Exception::get_Message()";
const CONCAT: &str = "System.String::Concat(object,object)";

fn void() -> Signature {
    Signature::new([], ValueKind::Void)
}

fn internal_method(b: &mut MethodTableBuilder, id: &str) -> Result<RefMethod> {
    let op = internal::find(id).with_context(|| format!("no internal operation {}", id))?;
    Ok(b.foreign(id, op.signature(), ForeignDescriptor::internal(id))?)
}

struct Program {
    b: MethodTableBuilder,
    write_line: RefMethod,
    message: RefMethod,
    concat: RefMethod,
}

impl Program {
    fn new() -> Result<Self> {
        let mut b = MethodTableBuilder::new();
        let write_line = internal_method(&mut b, WRITE_LINE)?;
        let message = internal_method(&mut b, MESSAGE)?;
        let concat = internal_method(&mut b, CONCAT)?;
        Ok(Program {
            b,
            write_line,
            message,
            concat,
        })
    }

    fn print(&self, asm: &mut MethodAssembler, s: &str) {
        asm.ldstr(s).call(self.write_line);
    }

    /// Prints `prefix` and the message of the exception on the stack.
    fn print_message(&self, asm: &mut MethodAssembler, prefix: &str) {
        asm.stloc(0)
            .ldstr(prefix)
            .ldloc(0)
            .call(self.message)
            .call(self.concat)
            .call(self.write_line);
    }

    fn method(&mut self, name: &str, signature: Signature, asm: MethodAssembler) -> Result<RefMethod> {
        let r = self.b.declare(name, signature)?;
        self.b.define(r, asm);
        Ok(r)
    }

    fn build(self) -> Result<MethodTable> {
        Ok(self.b.build()?)
    }
}

fn run_with(
    table: MethodTable,
    entry: &str,
    options: InterpreterOptions,
    token: Option<CancellationToken>,
) -> (Result<Outcome, ExecutionError>, Vec<String>) {
    let mut interp = Interpreter::new(
        Arc::new(table),
        Arc::new(ForeignBridge::default()),
        CaptureHost::new(),
        options,
    );
    if let Some(token) = token {
        interp = interp.with_cancellation(token);
    }
    let outcome = interp.run_by_name(entry, Vec::new());
    (outcome, interp.into_host().into_lines())
}

fn run(table: MethodTable, entry: &str) -> (Result<Outcome, ExecutionError>, Vec<String>) {
    run_with(table, entry, InterpreterOptions::default(), None)
}

/// `depth` try/finally regions sharing one try start, wrapped in a catch
/// of System.Exception. The innermost try throws or leaves normally.
fn nested_finally(depth: usize, throw: bool) -> Result<MethodTable> {
    let mut p = Program::new()?;
    let mut asm = MethodAssembler::new();
    asm.locals(1);
    let try_start = asm.label();
    let finallies: Vec<_> = (0..depth).map(|_| asm.label()).collect();
    let (catch_start, end) = (asm.label(), asm.label());

    asm.bind(try_start);
    if throw {
        asm.new_exception(TypeRef::INVALID_OPERATION_EXCEPTION, "boom")
            .op(Opcode::Throw);
    } else {
        asm.op(Opcode::Nop).leave(end);
    }
    for (i, label) in finallies.iter().enumerate() {
        asm.bind(*label);
        p.print(&mut asm, &format!("finally {}", i));
        asm.op(Opcode::EndFinally);
    }
    asm.bind(catch_start);
    p.print_message(&mut asm, "caught ");
    asm.leave(end);
    asm.bind(end).op(Opcode::Ret);

    for (i, label) in finallies.iter().enumerate() {
        let handler_end = finallies.get(i + 1).copied().unwrap_or(catch_start);
        asm.region(try_start, *label, vec![AsmHandler::finally(*label, handler_end)]);
    }
    asm.region(
        try_start,
        catch_start,
        vec![AsmHandler::catch(TypeRef::EXCEPTION, catch_start, end)],
    );
    p.method("Test.Nested::Main()", void(), asm)?;
    p.build()
}

proptest! {
    #[test]
    fn each_finally_runs_once_innermost_first(depth in 1usize..8, throw in any::<bool>()) {
        let table = nested_finally(depth, throw).map_err(|e| TestCaseError::fail(e.to_string()))?;
        let (outcome, lines) = run(table, "Test.Nested::Main()");
        prop_assert_eq!(outcome, Ok(Outcome::Returned(None)));

        let mut expected: Vec<String> = (0..depth).map(|i| format!("finally {}", i)).collect();
        if throw {
            expected.push("caught boom".to_string());
        }
        prop_assert_eq!(lines, expected);
    }
}

#[test]
fn catch_matches_supertypes_and_skips_unrelated_clauses() -> Result<()> {
    let mut p = Program::new()?;
    let mut asm = MethodAssembler::new();
    asm.locals(1);
    let [start, wrong, right, end] = [(); 4].map(|_| asm.label());
    asm.bind(start).ldc_i4(7).ldc_i4(0).op(Opcode::Rem).op(Opcode::Pop).leave(end);
    asm.bind(wrong);
    p.print(&mut asm, "argument");
    asm.op(Opcode::Pop).leave(end);
    asm.bind(right);
    p.print_message(&mut asm, "system: ");
    asm.leave(end);
    asm.bind(end).op(Opcode::Ret);
    asm.region(start, wrong, vec![AsmHandler::catch(TypeRef::ARGUMENT_EXCEPTION, wrong, right)]);
    asm.region(start, right, vec![AsmHandler::catch(TypeRef::SYSTEM_EXCEPTION, right, end)]);
    p.method("Test::Main()", void(), asm)?;

    let (outcome, lines) = run(p.build()?, "Test::Main()");
    assert_eq!(outcome, Ok(Outcome::Returned(None)));
    assert_eq!(lines, vec!["system: Attempted to divide by zero."]);
    Ok(())
}

#[test]
fn innermost_matching_handler_wins() -> Result<()> {
    let mut p = Program::new()?;
    let mut asm = MethodAssembler::new();
    let [start, inner, outer, end] = [(); 4].map(|_| asm.label());
    asm.bind(start)
        .new_exception(TypeRef::INVALID_OPERATION_EXCEPTION, "x")
        .op(Opcode::Throw);
    asm.bind(inner).op(Opcode::Pop);
    p.print(&mut asm, "inner");
    asm.leave(end);
    asm.bind(outer).op(Opcode::Pop);
    p.print(&mut asm, "outer");
    asm.leave(end);
    asm.bind(end).op(Opcode::Ret);
    asm.region(start, inner, vec![AsmHandler::catch(TypeRef::EXCEPTION, inner, outer)]);
    asm.region(start, outer, vec![AsmHandler::catch(TypeRef::EXCEPTION, outer, end)]);
    p.method("Test::Main()", void(), asm)?;

    let (_, lines) = run(p.build()?, "Test::Main()");
    assert_eq!(lines, vec!["inner"]);
    Ok(())
}

#[test]
fn handler_throw_skips_sibling_clauses_of_its_region() -> Result<()> {
    let mut p = Program::new()?;
    let mut asm = MethodAssembler::new();
    asm.locals(1);
    let [start, first, sibling, outer, end] = [(); 5].map(|_| asm.label());
    asm.bind(start)
        .new_exception(TypeRef::INVALID_OPERATION_EXCEPTION, "first")
        .op(Opcode::Throw);
    asm.bind(first).op(Opcode::Pop);
    p.print(&mut asm, "first handler");
    asm.new_exception(TypeRef::ARGUMENT_EXCEPTION, "from handler")
        .op(Opcode::Throw);
    asm.bind(sibling);
    p.print_message(&mut asm, "sibling ");
    asm.leave(end);
    asm.bind(outer);
    p.print_message(&mut asm, "outer ");
    asm.leave(end);
    asm.bind(end).op(Opcode::Ret);
    asm.region(
        start,
        first,
        vec![
            AsmHandler::catch(TypeRef::INVALID_OPERATION_EXCEPTION, first, sibling),
            AsmHandler::catch(TypeRef::ARGUMENT_EXCEPTION, sibling, outer),
        ],
    );
    asm.region(start, outer, vec![AsmHandler::catch(TypeRef::EXCEPTION, outer, end)]);
    p.method("Test::Main()", void(), asm)?;

    let (outcome, lines) = run(p.build()?, "Test::Main()");
    assert_eq!(outcome, Ok(Outcome::Returned(None)));
    assert_eq!(lines, vec!["first handler", "outer from handler"]);
    Ok(())
}

/// for (i = 0; i < 3; i++) { try { body; continue at 1; break at 2 } finally { .. } }
#[test]
fn finally_runs_on_continue_and_break() -> Result<()> {
    let mut p = Program::new()?;
    let mut asm = MethodAssembler::new();
    asm.locals(2);
    let [cond, start, not_one, not_two, finally, next, done] = [(); 7].map(|_| asm.label());
    asm.ldc_i4(0).stloc(1);
    asm.bind(cond).ldloc(1).ldc_i4(3).bge(done);

    asm.bind(start).ldstr("body ").ldloc(1).call(p.concat).call(p.write_line);
    asm.ldloc(1).ldc_i4(1).bne(not_one).leave(next);
    asm.bind(not_one).ldloc(1).ldc_i4(2).bne(not_two).leave(done);
    asm.bind(not_two);
    p.print(&mut asm, "after");
    asm.leave(next);

    asm.bind(finally);
    p.print(&mut asm, "finally");
    asm.op(Opcode::EndFinally);

    asm.bind(next).ldloc(1).ldc_i4(1).op(Opcode::Add).stloc(1).br(cond);
    asm.bind(done);
    p.print(&mut asm, "done");
    asm.op(Opcode::Ret);
    asm.region(start, finally, vec![AsmHandler::finally(finally, next)]);
    p.method("Test::Main()", void(), asm)?;

    let (outcome, lines) = run(p.build()?, "Test::Main()");
    assert_eq!(outcome, Ok(Outcome::Returned(None)));
    assert_eq!(
        lines,
        vec!["body 0", "after", "finally", "body 1", "finally", "body 2", "finally", "done"]
    );
    Ok(())
}

#[test]
fn exception_from_callee_is_caught_at_the_call_site() -> Result<()> {
    let mut p = Program::new()?;
    let mut thrower = MethodAssembler::new();
    thrower
        .new_exception(TypeRef::ARGUMENT_EXCEPTION, "deep")
        .op(Opcode::Throw);
    let thrower = p.method("Test::Throw()", void(), thrower)?;

    let mut middle = MethodAssembler::new();
    let [start, finally, end] = [(); 3].map(|_| middle.label());
    middle.bind(start).call(thrower).leave(end);
    middle.bind(finally);
    p.print(&mut middle, "middle finally");
    middle.op(Opcode::EndFinally);
    middle.bind(end).op(Opcode::Ret);
    middle.region(start, finally, vec![AsmHandler::finally(finally, end)]);
    let middle = p.method("Test::Middle()", void(), middle)?;

    let mut main = MethodAssembler::new();
    main.locals(1);
    let [start, handler, end] = [(); 3].map(|_| main.label());
    main.bind(start).call(middle).leave(end);
    main.bind(handler);
    p.print_message(&mut main, "main caught ");
    main.leave(end);
    main.bind(end).op(Opcode::Ret);
    main.region(start, handler, vec![AsmHandler::catch(TypeRef::ARGUMENT_EXCEPTION, handler, end)]);
    p.method("Test::Main()", void(), main)?;

    let (outcome, lines) = run(p.build()?, "Test::Main()");
    assert_eq!(outcome, Ok(Outcome::Returned(None)));
    assert_eq!(lines, vec!["middle finally", "main caught deep"]);
    Ok(())
}

#[test]
fn unhandled_exception_runs_finally_then_reports() -> Result<()> {
    let mut p = Program::new()?;
    let mut asm = MethodAssembler::new();
    let [start, finally, end] = [(); 3].map(|_| asm.label());
    asm.bind(start)
        .new_exception(TypeRef::INVALID_OPERATION_EXCEPTION, "nobody catches this")
        .op(Opcode::Throw);
    asm.bind(finally);
    p.print(&mut asm, "finally");
    asm.op(Opcode::EndFinally);
    asm.bind(end).op(Opcode::Ret);
    asm.region(start, finally, vec![AsmHandler::finally(finally, end)]);
    p.method("Test::Main()", void(), asm)?;

    let (outcome, lines) = run(p.build()?, "Test::Main()");
    assert_eq!(
        outcome,
        Ok(Outcome::Unhandled(UnhandledException {
            type_name: "System.InvalidOperationException".to_string(),
            message: "nobody catches this".to_string(),
        }))
    );
    assert_eq!(lines, vec!["finally"]);
    Ok(())
}

#[test]
fn exception_thrown_by_finally_replaces_the_original() -> Result<()> {
    let mut p = Program::new()?;
    let mut asm = MethodAssembler::new();
    asm.locals(1);
    let [start, finally, catch, end] = [(); 4].map(|_| asm.label());
    asm.bind(start)
        .new_exception(TypeRef::INVALID_OPERATION_EXCEPTION, "first")
        .op(Opcode::Throw);
    asm.bind(finally)
        .new_exception(TypeRef::ARGUMENT_EXCEPTION, "second")
        .op(Opcode::Throw)
        .op(Opcode::EndFinally);
    asm.bind(catch);
    p.print_message(&mut asm, "caught ");
    asm.leave(end);
    asm.bind(end).op(Opcode::Ret);
    asm.region(start, finally, vec![AsmHandler::finally(finally, catch)]);
    asm.region(start, catch, vec![AsmHandler::catch(TypeRef::EXCEPTION, catch, end)]);
    p.method("Test::Main()", void(), asm)?;

    let (outcome, lines) = run(p.build()?, "Test::Main()");
    assert_eq!(outcome, Ok(Outcome::Returned(None)));
    assert_eq!(lines, vec!["caught second"]);
    Ok(())
}

#[test]
fn exception_escaping_a_filter_rejects_the_handler() -> Result<()> {
    let mut p = Program::new()?;
    let mut asm = MethodAssembler::new();
    asm.locals(1);
    let [start, filter, filtered, outer, end] = [(); 5].map(|_| asm.label());
    asm.bind(start)
        .new_exception(TypeRef::INVALID_OPERATION_EXCEPTION, "first")
        .op(Opcode::Throw);
    asm.bind(filter)
        .op(Opcode::Pop)
        .new_exception(TypeRef::ARGUMENT_EXCEPTION, "from filter")
        .op(Opcode::Throw);
    asm.bind(filtered).op(Opcode::Pop);
    p.print(&mut asm, "filtered");
    asm.leave(end);
    asm.bind(outer);
    p.print_message(&mut asm, "outer ");
    asm.leave(end);
    asm.bind(end).op(Opcode::Ret);
    asm.region(start, filter, vec![AsmHandler::filter(filter, filtered, outer)]);
    asm.region(start, outer, vec![AsmHandler::catch(TypeRef::EXCEPTION, outer, end)]);
    p.method("Test::Main()", void(), asm)?;

    let (outcome, lines) = run(p.build()?, "Test::Main()");
    assert_eq!(outcome, Ok(Outcome::Returned(None)));
    assert_eq!(lines, vec!["outer first"]);
    Ok(())
}

#[test]
fn filter_runs_before_inner_finally() -> Result<()> {
    let mut p = Program::new()?;
    let mut asm = MethodAssembler::new();
    let [start, finally, filter, filtered, end] = [(); 5].map(|_| asm.label());
    asm.bind(start)
        .new_exception(TypeRef::INVALID_OPERATION_EXCEPTION, "x")
        .op(Opcode::Throw);
    asm.bind(finally);
    p.print(&mut asm, "finally");
    asm.op(Opcode::EndFinally);
    asm.bind(filter).op(Opcode::Pop);
    p.print(&mut asm, "filter");
    asm.ldc_i4(1).op(Opcode::EndFilter);
    asm.bind(filtered).op(Opcode::Pop);
    p.print(&mut asm, "handler");
    asm.leave(end);
    asm.bind(end).op(Opcode::Ret);
    asm.region(start, finally, vec![AsmHandler::finally(finally, filter)]);
    asm.region(start, filter, vec![AsmHandler::filter(filter, filtered, end)]);
    p.method("Test::Main()", void(), asm)?;

    let (_, lines) = run(p.build()?, "Test::Main()");
    assert_eq!(lines, vec!["filter", "finally", "handler"]);
    Ok(())
}

#[test]
fn return_inside_try_runs_finally_and_keeps_the_value() -> Result<()> {
    let mut p = Program::new()?;
    let mut asm = MethodAssembler::new();
    let [start, finally, end] = [(); 3].map(|_| asm.label());
    asm.bind(start).ldc_i4(42).op(Opcode::Ret);
    asm.bind(finally);
    p.print(&mut asm, "finally");
    asm.op(Opcode::EndFinally);
    asm.bind(end);
    asm.region(start, finally, vec![AsmHandler::finally(finally, end)]);
    p.method("Test::Compute()", Signature::new([], ValueKind::I4), asm)?;

    let (outcome, lines) = run(p.build()?, "Test::Compute()");
    assert_eq!(outcome, Ok(Outcome::Returned(Some(Value::I32(42)))));
    assert_eq!(lines, vec!["finally"]);
    Ok(())
}

#[test]
fn throwing_null_raises_null_reference() -> Result<()> {
    let mut p = Program::new()?;
    let mut asm = MethodAssembler::new();
    asm.locals(1);
    let [start, handler, end] = [(); 3].map(|_| asm.label());
    asm.bind(start).op(Opcode::LdNull).op(Opcode::Throw);
    asm.bind(handler);
    p.print_message(&mut asm, "");
    asm.leave(end);
    asm.bind(end).op(Opcode::Ret);
    asm.region(
        start,
        handler,
        vec![AsmHandler::catch(TypeRef::NULL_REFERENCE_EXCEPTION, handler, end)],
    );
    p.method("Test::Main()", void(), asm)?;

    let (_, lines) = run(p.build()?, "Test::Main()");
    assert_eq!(lines, vec!["Object reference not set to an instance of an object."]);
    Ok(())
}

#[test]
fn throwing_a_string_wraps_it() -> Result<()> {
    let mut p = Program::new()?;
    let mut asm = MethodAssembler::new();
    asm.ldstr("not an exception").op(Opcode::Throw);
    p.method("Test::Main()", void(), asm)?;

    match run(p.build()?, "Test::Main()").0 {
        Ok(Outcome::Unhandled(e)) => {
            assert_eq!(e.type_name, "System.Runtime.CompilerServices.RuntimeWrappedException")
        }
        other => bail!("unexpected outcome {:?}", other),
    }
    Ok(())
}

#[test]
fn rethrow_outside_a_catch_is_a_decode_error() -> Result<()> {
    let mut p = Program::new()?;
    let mut asm = MethodAssembler::new();
    asm.op(Opcode::Rethrow);
    p.method("Test::Main()", void(), asm)?;

    assert!(matches!(
        run(p.build()?, "Test::Main()").0,
        Err(ExecutionError::Decode { offset: 0, .. })
    ));
    Ok(())
}

#[test]
fn endfinally_without_an_unwind_is_a_decode_error() -> Result<()> {
    let mut p = Program::new()?;
    let mut asm = MethodAssembler::new();
    asm.op(Opcode::EndFinally);
    p.method("Test::Main()", void(), asm)?;

    assert!(matches!(
        run(p.build()?, "Test::Main()").0,
        Err(ExecutionError::Decode { .. })
    ));
    Ok(())
}

#[test]
fn mismatched_operands_are_a_stack_imbalance() -> Result<()> {
    let mut p = Program::new()?;
    let mut asm = MethodAssembler::new();
    asm.ldc_i4(1).ldc_i8(2).op(Opcode::Add).op(Opcode::Pop).op(Opcode::Ret);
    p.method("Test::Main()", void(), asm)?;

    assert!(matches!(
        run(p.build()?, "Test::Main()").0,
        Err(ExecutionError::StackImbalance { offset: 2, .. })
    ));
    Ok(())
}

#[test]
fn operand_stack_is_bounded() -> Result<()> {
    let mut p = Program::new()?;
    let mut asm = MethodAssembler::new();
    asm.max_stack(1);
    asm.ldc_i4(1).ldc_i4(2).op(Opcode::Ret);
    p.method("Test::Main()", void(), asm)?;

    assert!(matches!(
        run(p.build()?, "Test::Main()").0,
        Err(ExecutionError::StackImbalance { offset: 1, .. })
    ));
    Ok(())
}

#[test]
fn runaway_recursion_hits_the_depth_limit() -> Result<()> {
    let mut p = Program::new()?;
    let recurse = p.b.declare("Test::Recurse()", void())?;
    let mut asm = MethodAssembler::new();
    asm.call(recurse).op(Opcode::Ret);
    p.b.define(recurse, asm);

    let options = InterpreterOptions {
        max_call_depth: 50,
        ..InterpreterOptions::default()
    };
    let (outcome, _) = run_with(p.build()?, "Test::Recurse()", options, None);
    assert_eq!(outcome, Err(ExecutionError::CallDepthExceeded(50)));
    Ok(())
}

#[test]
fn default_depth_limit_fits_on_a_64_mib_thread() -> Result<()> {
    let hit_limit = thread::Builder::new()
        .stack_size(64 * 1024 * 1024)
        .spawn(|| -> Result<bool> {
            let mut p = Program::new()?;
            let recurse = p.b.declare("Test::Recurse()", void())?;
            let mut asm = MethodAssembler::new();
            asm.call(recurse).op(Opcode::Ret);
            p.b.define(recurse, asm);

            let (outcome, _) = run(p.build()?, "Test::Recurse()");
            Ok(outcome == Err(ExecutionError::CallDepthExceeded(1000)))
        })?
        .join()
        .map_err(|_| anyhow::anyhow!("recursion thread panicked"))??;
    assert!(hit_limit);
    Ok(())
}

#[test]
fn hard_assertion_aborts_without_running_finally() -> Result<()> {
    let mut p = Program::new()?;
    let assert = internal_method(&mut p.b, "System.Diagnostics.Debug::Assert(bool,string)")?;
    let mut asm = MethodAssembler::new();
    let [start, finally, end] = [(); 3].map(|_| asm.label());
    asm.bind(start).ldc_i4(0).ldstr("boom").call(assert).leave(end);
    asm.bind(finally);
    p.print(&mut asm, "finally");
    asm.op(Opcode::EndFinally);
    asm.bind(end).op(Opcode::Ret);
    asm.region(start, finally, vec![AsmHandler::finally(finally, end)]);
    p.method("Test::Main()", void(), asm)?;

    let (outcome, lines) = run(p.build()?, "Test::Main()");
    assert_eq!(outcome, Err(ExecutionError::Aborted("assertion failed: boom".to_string())));
    assert!(lines.is_empty());
    Ok(())
}

#[test]
fn unknown_internal_operation_raises_missing_method() -> Result<()> {
    let mut p = Program::new()?;
    let missing = p
        .b
        .foreign(
            "Test::Missing()",
            void(),
            ForeignDescriptor::internal("Test::NoSuchOperation()"),
        )?;
    let mut asm = MethodAssembler::new();
    asm.call(missing).op(Opcode::Ret);
    p.method("Test::Main()", void(), asm)?;

    match run(p.build()?, "Test::Main()").0 {
        Ok(Outcome::Unhandled(e)) => {
            assert_eq!(e.type_name, "System.MissingMethodException");
            assert_eq!(e.message, "Method not found: 'Test::NoSuchOperation()'.");
        }
        other => bail!("unexpected outcome {:?}", other),
    }
    Ok(())
}

#[test]
fn cancellation_unwinds_every_frame() -> Result<()> {
    let mut p = Program::new()?;
    let mut spin = MethodAssembler::new();
    let [start, fault, end] = [(); 3].map(|_| spin.label());
    spin.bind(start).op(Opcode::Nop).br(start);
    spin.bind(fault);
    p.print(&mut spin, "inner fault");
    spin.op(Opcode::EndFinally);
    spin.bind(end).op(Opcode::Ret);
    spin.region(start, fault, vec![AsmHandler::fault(fault, end)]);
    let spin = p.method("Test::Spin()", void(), spin)?;

    let mut main = MethodAssembler::new();
    let [start, finally, end] = [(); 3].map(|_| main.label());
    main.bind(start).call(spin).leave(end);
    main.bind(finally);
    p.print(&mut main, "outer finally");
    main.op(Opcode::EndFinally);
    main.bind(end).op(Opcode::Ret);
    main.region(start, finally, vec![AsmHandler::finally(finally, end)]);
    p.method("Test::Main()", void(), main)?;

    let token = CancellationToken::new();
    let canceller = {
        let token = token.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            token.cancel();
        })
    };
    let (outcome, lines) = run_with(p.build()?, "Test::Main()", InterpreterOptions::default(), Some(token));
    canceller.join().map_err(|_| anyhow::anyhow!("canceller panicked"))?;

    assert_eq!(outcome, Err(ExecutionError::Cancelled));
    assert_eq!(lines, vec!["inner fault", "outer finally"]);
    Ok(())
}
