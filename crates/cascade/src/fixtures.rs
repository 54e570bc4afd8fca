//! Conformance programs expressed as method tables, each with the host
//! output a correct engine produces for it.

use crate::asm::{AsmHandler, MethodAssembler};
use crate::error::MethodError;
use crate::internal;
use crate::method::{MethodTable, MethodTableBuilder};
use crate::native_lib::{CallingConvention, ForeignDescriptor};
use crate::opcodes::{Opcode, RefMethod};
use crate::types::{Signature, TypeRef, ValueKind};

pub struct Fixture {
    pub name: &'static str,
    pub summary: &'static str,
    /// Name of the method to run.
    pub entry: &'static str,
    build: fn() -> Result<MethodTable, MethodError>,
    expected: fn() -> Vec<String>,
}

impl Fixture {
    pub fn build(&self) -> Result<MethodTable, MethodError> {
        (self.build)()
    }

    pub fn expected_output(&self) -> Vec<String> {
        (self.expected)()
    }
}

static FIXTURES: &[Fixture] = &[
    Fixture {
        name: "exceptions",
        summary: "exception thrown in a callee, caught by the caller, then finally",
        entry: "Test.Exceptions::Main()",
        build: exceptions,
        expected: exceptions_output,
    },
    Fixture {
        name: "handlers",
        summary: "runtime faults, filters, fault handlers and rethrow",
        entry: "Test.Handlers::Main()",
        build: handlers,
        expected: handlers_output,
    },
    Fixture {
        name: "switch",
        summary: "switch dispatch inside a counted loop",
        entry: "Test.Switch::Main()",
        build: switch,
        expected: switch_output,
    },
    Fixture {
        name: "math",
        summary: "integer arithmetic helpers and a long-running checksum loop",
        entry: "Test.HelloWorld::Main()",
        build: math,
        expected: math_output,
    },
    Fixture {
        name: "conditionals",
        summary: "branches, loops and both assertion conventions",
        entry: "Test.Conditionals::Main()",
        build: conditionals,
        expected: conditionals_output,
    },
    Fixture {
        name: "interop",
        summary: "an internal call and a call into a missing native library",
        entry: "Test.Interop::Main()",
        build: interop,
        expected: interop_output,
    },
];

pub fn all() -> &'static [Fixture] {
    FIXTURES
}

pub fn find(name: &str) -> Option<&'static Fixture> {
    FIXTURES.iter().find(|f| f.name == name)
}

fn lines(output: &[&str]) -> Vec<String> {
    output.iter().map(|s| s.to_string()).collect()
}

/// Declare an internal operation under its own id and signature.
fn internal(b: &mut MethodTableBuilder, id: &str) -> Result<RefMethod, MethodError> {
    let op = internal::find(id).ok_or_else(|| MethodError::UndefinedMethod(id.to_string()))?;
    b.foreign(id, op.signature(), ForeignDescriptor::internal(id))
}

/// Foreign methods most programs call.
struct Runtime {
    write_line: RefMethod,
    concat: RefMethod,
    message: RefMethod,
}

impl Runtime {
    fn declare(b: &mut MethodTableBuilder) -> Result<Self, MethodError> {
        Ok(Runtime {
            write_line: internal(b, "System.Console::WriteLine(string)")?,
            concat: internal(b, "System.String::Concat(object,object)")?,
            message: internal(b, "System.Exception::get_Message()")?,
        })
    }

    fn print(&self, asm: &mut MethodAssembler, s: &str) {
        asm.ldstr(s).call(self.write_line);
    }

    /// Print `prefix` followed by the message of the exception on top of
    /// the stack, using local 0 as scratch.
    fn print_message(&self, asm: &mut MethodAssembler, prefix: &str) {
        asm.stloc(0)
            .ldstr(prefix)
            .ldloc(0)
            .call(self.message)
            .call(self.concat)
            .call(self.write_line);
    }
}

fn void() -> Signature {
    Signature::new([], ValueKind::Void)
}

fn binary_int() -> Signature {
    Signature::new([ValueKind::I4, ValueKind::I4], ValueKind::I4)
}

fn exceptions_output() -> Vec<String> {
    lines(EXCEPTIONS_OUTPUT)
}

const EXCEPTIONS_OUTPUT: &[&str] = &[
    "Testing exception handling...",
    "Caught an exception: This is a test exception.",
    "Finally block executed.",
];

fn exceptions() -> Result<MethodTable, MethodError> {
    let mut b = MethodTableBuilder::new();
    let rt = Runtime::declare(&mut b)?;
    let main = b.declare("Test.Exceptions::Main()", void())?;
    let thrower = b.declare("Test.Exceptions::TestExceptionHandling()", void())?;

    let mut asm = MethodAssembler::new();
    asm.locals(1);
    let (try_start, catch_start, finally_start, end) =
        (asm.label(), asm.label(), asm.label(), asm.label());
    asm.bind(try_start);
    rt.print(&mut asm, "Testing exception handling...");
    asm.call(thrower).leave(end);
    asm.bind(catch_start);
    rt.print_message(&mut asm, "Caught an exception: ");
    asm.leave(end);
    asm.bind(finally_start);
    rt.print(&mut asm, "Finally block executed.");
    asm.op(Opcode::EndFinally);
    asm.bind(end).op(Opcode::Ret);
    asm.region(
        try_start,
        catch_start,
        vec![AsmHandler::catch(TypeRef::EXCEPTION, catch_start, finally_start)],
    );
    asm.region(
        try_start,
        finally_start,
        vec![AsmHandler::finally(finally_start, end)],
    );
    b.define(main, asm);

    let mut asm = MethodAssembler::new();
    asm.new_exception(TypeRef::INVALID_OPERATION_EXCEPTION, "This is a test exception.")
        .op(Opcode::Throw);
    b.define(thrower, asm);

    b.build()
}

fn handlers_output() -> Vec<String> {
    lines(HANDLERS_OUTPUT)
}

const HANDLERS_OUTPUT: &[&str] = &[
    "Arithmetic: Attempted to divide by zero.",
    "Filtered: Index was out of range. Must be non-negative and less than the size of the collection.",
    "Fault handler ran.",
    "Logging and rethrowing.",
    "Rethrown: inner",
    "Done.",
];

fn handlers() -> Result<MethodTable, MethodError> {
    let mut b = MethodTableBuilder::new();
    let rt = Runtime::declare(&mut b)?;
    let check_index = internal(&mut b, "System.Runtime.Guard::CheckIndex(int32,int32)")?;
    let main = b.declare("Test.Handlers::Main()", void())?;
    let divide = b.declare("Test.Handlers::Divide(int32,int32)", binary_int())?;

    let mut asm = MethodAssembler::new();
    asm.locals(1);
    let [start, arith, after_arith, filter, filtered, after_filter, throw_site, fault, log, rethrown, finally, end] =
        [(); 12].map(|_| asm.label());

    asm.bind(start);
    asm.ldc_i4(1).ldc_i4(0).call(divide).op(Opcode::Pop).leave(after_arith);
    asm.bind(arith);
    rt.print_message(&mut asm, "Arithmetic: ");
    asm.leave(after_arith);

    asm.bind(after_arith);
    asm.ldc_i4(5).ldc_i4(3).call(check_index).leave(after_filter);
    asm.bind(filter);
    asm.op(Opcode::Pop).ldc_i4(1).op(Opcode::EndFilter);
    asm.bind(filtered);
    rt.print_message(&mut asm, "Filtered: ");
    asm.leave(after_filter);

    asm.bind(after_filter).bind(throw_site);
    asm.new_exception(TypeRef::INVALID_OPERATION_EXCEPTION, "inner")
        .op(Opcode::Throw);
    asm.bind(fault);
    rt.print(&mut asm, "Fault handler ran.");
    asm.op(Opcode::EndFinally);
    asm.bind(log);
    asm.op(Opcode::Pop);
    rt.print(&mut asm, "Logging and rethrowing.");
    asm.op(Opcode::Rethrow);
    asm.bind(rethrown);
    rt.print_message(&mut asm, "Rethrown: ");
    asm.leave(end);

    asm.bind(finally);
    rt.print(&mut asm, "Done.");
    asm.op(Opcode::EndFinally);
    asm.bind(end).op(Opcode::Ret);

    asm.region(
        start,
        arith,
        vec![AsmHandler::catch(TypeRef::ARITHMETIC_EXCEPTION, arith, after_arith)],
    );
    asm.region(
        after_arith,
        filter,
        vec![AsmHandler::filter(filter, filtered, after_filter)],
    );
    asm.region(throw_site, fault, vec![AsmHandler::fault(fault, log)]);
    asm.region(
        throw_site,
        log,
        vec![AsmHandler::catch(TypeRef::EXCEPTION, log, rethrown)],
    );
    asm.region(
        throw_site,
        rethrown,
        vec![AsmHandler::catch(TypeRef::INVALID_OPERATION_EXCEPTION, rethrown, finally)],
    );
    asm.region(start, finally, vec![AsmHandler::finally(finally, end)]);
    b.define(main, asm);

    let mut asm = MethodAssembler::new();
    asm.ldarg(0).ldarg(1).op(Opcode::Div).op(Opcode::Ret);
    b.define(divide, asm);

    b.build()
}

fn switch_output() -> Vec<String> {
    lines(SWITCH_OUTPUT)
}

const SWITCH_OUTPUT: &[&str] = &["Zero", "One", "Two", "Three", "Four"];

fn switch() -> Result<MethodTable, MethodError> {
    let mut b = MethodTableBuilder::new();
    let rt = Runtime::declare(&mut b)?;
    let main = b.declare("Test.Switch::Main()", void())?;

    let mut asm = MethodAssembler::new();
    asm.locals(1);
    let (body, next, cond) = (asm.label(), asm.label(), asm.label());
    let cases = [(); 5].map(|_| asm.label());

    asm.ldc_i4(0).stloc(0).br(cond);
    asm.bind(body).ldloc(0).switch(&cases);
    asm.ldstr("Unknown number ")
        .ldloc(0)
        .call(rt.concat)
        .call(rt.write_line)
        .br(next);
    for (label, word) in cases.iter().zip(SWITCH_OUTPUT) {
        asm.bind(*label);
        rt.print(&mut asm, word);
        asm.br(next);
    }
    asm.bind(next).ldloc(0).ldc_i4(1).op(Opcode::Add).stloc(0);
    asm.bind(cond).ldloc(0).ldc_i4(5).blt(body);
    asm.op(Opcode::Ret);
    b.define(main, asm);

    b.build()
}

/// The checksum loop runs this many times instead of half a billion.
pub const MATH_ITERATIONS: i32 = 100_000;

/// What the checksum loop computes for `iterations` rounds.
pub fn math_checksum(iterations: i32) -> i64 {
    let mut result: i64 = 0;
    for i in 1..=iterations {
        result += (i.wrapping_mul(1234567) / (i % 97 + 1)) as i64;
        result ^= result << 3;
        result %= 1_000_000_007;
    }
    result
}

fn math_output() -> Vec<String> {
    let mut out = lines(&[
        "And now, math!",
        "Addition: 8",
        "Subtraction: 2",
        "Multiplication: 15",
        "Division: 2",
        "Modulus: 2",
        "Power: 8",
        "Fibonacci: 34",
    ]);
    out.push(format!("Random complex math: {}", math_checksum(MATH_ITERATIONS)));
    out
}

fn math() -> Result<MethodTable, MethodError> {
    let mut b = MethodTableBuilder::new();
    let rt = Runtime::declare(&mut b)?;
    let main = b.declare("Test.HelloWorld::Main()", void())?;

    let mut helpers = Vec::new();
    for (name, op) in [
        ("Add", Opcode::Add),
        ("Subtract", Opcode::Sub),
        ("Multiply", Opcode::Mul),
        ("Divide", Opcode::Div),
        ("Modulus", Opcode::Rem),
    ] {
        let m = b.declare(&format!("Test.HelloWorld::{}(int32,int32)", name), binary_int())?;
        let mut asm = MethodAssembler::new();
        asm.ldarg(0).ldarg(1).op(op).op(Opcode::Ret);
        b.define(m, asm);
        helpers.push((name, m));
    }

    let power = b.declare("Test.HelloWorld::Power(int32,int32)", binary_int())?;
    let mut asm = MethodAssembler::new();
    asm.locals(2);
    let (body, cond) = (asm.label(), asm.label());
    asm.ldc_i4(1).stloc(0).ldc_i4(0).stloc(1).br(cond);
    asm.bind(body).ldloc(0).ldarg(0).op(Opcode::Mul).stloc(0);
    asm.ldloc(1).ldc_i4(1).op(Opcode::Add).stloc(1);
    asm.bind(cond).ldloc(1).ldarg(1).blt(body);
    asm.ldloc(0).op(Opcode::Ret);
    b.define(power, asm);

    let fibonacci = b.declare(
        "Test.HelloWorld::Fibonacci(int32)",
        Signature::new([ValueKind::I4], ValueKind::I4),
    )?;
    let mut asm = MethodAssembler::new();
    asm.locals(4);
    let (iterate, body, cond) = (asm.label(), asm.label(), asm.label());
    asm.ldarg(0).ldc_i4(1).bgt(iterate);
    asm.ldarg(0).op(Opcode::Ret);
    asm.bind(iterate);
    asm.ldc_i4(0).stloc(0).ldc_i4(1).stloc(1).ldc_i4(2).stloc(2).br(cond);
    asm.bind(body);
    asm.ldloc(0).ldloc(1).op(Opcode::Add).stloc(3);
    asm.ldloc(1).stloc(0).ldloc(3).stloc(1);
    asm.ldloc(2).ldc_i4(1).op(Opcode::Add).stloc(2);
    asm.bind(cond).ldloc(2).ldarg(0).ble(body);
    asm.ldloc(1).op(Opcode::Ret);
    b.define(fibonacci, asm);

    let mut asm = MethodAssembler::new();
    // 0: i, 1: result
    asm.locals(2);
    rt.print(&mut asm, "And now, math!");
    let operands = [(5, 3), (5, 3), (5, 3), (6, 3), (5, 3)];
    let labels = ["Addition: ", "Subtraction: ", "Multiplication: ", "Division: ", "Modulus: "];
    for (((_, m), (l, r)), label) in helpers.iter().zip(operands).zip(labels) {
        asm.ldstr(label)
            .ldc_i4(l)
            .ldc_i4(r)
            .call(*m)
            .call(rt.concat)
            .call(rt.write_line);
    }
    asm.ldstr("Power: ").ldc_i4(2).ldc_i4(3).call(power);
    asm.call(rt.concat).call(rt.write_line);
    asm.ldstr("Fibonacci: ").ldc_i4(9).call(fibonacci);
    asm.call(rt.concat).call(rt.write_line);

    let (body, cond) = (asm.label(), asm.label());
    asm.ldc_i8(0).stloc(1).ldc_i4(1).stloc(0).br(cond);
    asm.bind(body);
    // result += (i * 1234567) / (i % 97 + 1)
    asm.ldloc(1).ldloc(0).ldc_i4(1234567).op(Opcode::Mul);
    asm.ldloc(0).ldc_i4(97).op(Opcode::Rem).ldc_i4(1).op(Opcode::Add);
    asm.op(Opcode::Div).op(Opcode::ConvI8).op(Opcode::Add).stloc(1);
    // result ^= result << 3
    asm.ldloc(1).ldloc(1).ldc_i4(3).op(Opcode::Shl).op(Opcode::Xor).stloc(1);
    // result %= 1_000_000_007
    asm.ldloc(1).ldc_i8(1_000_000_007).op(Opcode::Rem).stloc(1);
    asm.ldloc(0).ldc_i4(1).op(Opcode::Add).stloc(0);
    asm.bind(cond).ldloc(0).ldc_i4(MATH_ITERATIONS).ble(body);
    asm.ldstr("Random complex math: ").ldloc(1);
    asm.call(rt.concat).call(rt.write_line);
    asm.op(Opcode::Ret);
    b.define(main, asm);

    b.build()
}

fn conditionals_output() -> Vec<String> {
    lines(CONDITIONALS_OUTPUT)
}

const CONDITIONALS_OUTPUT: &[&str] = &[
    "Starting Conditional Tests...",
    "Testing Basic If-Else...",
    "Basic If-Else tests passed!",
    "Testing Comparison Operators...",
    "Comparison Operators tests passed!",
    "Testing Logical Operators...",
    "Assertion failed: Soft assertions keep running",
    "Logical Operators tests passed!",
    "Testing For Loops...",
    "For Loops tests passed!",
    "Testing Break and Continue...",
    "Break and Continue tests passed!",
    "Testing Null Checks...",
    "Null Checks tests passed!",
    "Testing String Comparisons...",
    "String Comparisons tests passed!",
    "All Conditional Tests Completed!",
];

/// Emits `value == expected` for the i32 local `local`.
fn local_equals(asm: &mut MethodAssembler, local: u16, expected: i32) {
    asm.ldloc(local).ldc_i4(expected).op(Opcode::Ceq);
}

/// `!top`, for a 0/1 value on the stack.
fn negate(asm: &mut MethodAssembler) {
    asm.ldc_i4(0).op(Opcode::Ceq);
}

/// `local += operand` for i32 locals.
fn add_to_local(asm: &mut MethodAssembler, local: u16, operand: u16) {
    asm.ldloc(local).ldloc(operand).op(Opcode::Add).stloc(local);
}

fn increment(asm: &mut MethodAssembler, local: u16) {
    asm.ldloc(local).ldc_i4(1).op(Opcode::Add).stloc(local);
}

fn conditionals() -> Result<MethodTable, MethodError> {
    let mut b = MethodTableBuilder::new();
    let rt = Runtime::declare(&mut b)?;
    let assert = internal(&mut b, "System.Diagnostics.Debug::Assert(bool,string)")?;
    let check = internal(&mut b, "Test.Harness::Check(bool,string)")?;
    let str_eq = internal(&mut b, "System.String::op_Equality(string,string)")?;

    let main = b.declare("Test.Conditionals::Main()", void())?;
    let names = [
        "BasicIfElse",
        "ComparisonOperators",
        "LogicalOperators",
        "ForLoops",
        "BreakAndContinue",
        "NullChecks",
        "StringComparisons",
    ];
    let mut tests = Vec::new();
    for method in names {
        tests.push(b.declare(&format!("Test.Conditionals::Test{}()", method), void())?);
    }

    let mut asm = MethodAssembler::new();
    rt.print(&mut asm, "Starting Conditional Tests...");
    for m in &tests {
        asm.call(*m);
    }
    rt.print(&mut asm, "All Conditional Tests Completed!");
    asm.op(Opcode::Ret);
    b.define(main, asm);

    let mut bodies: Vec<MethodAssembler> = Vec::new();
    let hard = |asm: &mut MethodAssembler, message: &str| {
        asm.ldstr(message).call(assert);
    };

    // Basic if-else. 0: a, 1: b, 2: result
    let mut asm = start_test(&rt, "Basic If-Else");
    asm.locals(3);
    let [else1, end1, else2, end2] = [(); 4].map(|_| asm.label());
    asm.ldc_i4(10).stloc(0).ldc_i4(5).stloc(1);
    asm.ldloc(0).ldloc(1).ble(else1);
    asm.ldc_i4(1).stloc(2).br(end1);
    asm.bind(else1).ldc_i4(0).stloc(2);
    asm.bind(end1);
    local_equals(&mut asm, 2, 1);
    hard(&mut asm, "Basic if-else failed: a > b should be true");
    asm.ldloc(0).ldloc(1).bge(else2);
    asm.ldc_i4(1).stloc(2).br(end2);
    asm.bind(else2).ldc_i4(0).stloc(2);
    asm.bind(end2);
    local_equals(&mut asm, 2, 0);
    hard(&mut asm, "Basic if-else failed: a < b should be false");
    bodies.push(finish_test(&rt, asm, "Basic If-Else"));

    // Comparison operators. 0: x, 1: y
    let mut asm = start_test(&rt, "Comparison Operators");
    asm.locals(2);
    asm.ldc_i4(10).stloc(0).ldc_i4(20).stloc(1);
    asm.ldloc(0).ldloc(1).op(Opcode::Clt);
    hard(&mut asm, "Less than comparison failed");
    asm.ldloc(1).ldloc(0).op(Opcode::Cgt);
    hard(&mut asm, "Greater than comparison failed");
    asm.ldloc(0).ldloc(1).op(Opcode::Cgt);
    negate(&mut asm);
    hard(&mut asm, "Less than or equal comparison failed");
    asm.ldloc(1).ldloc(0).op(Opcode::Clt);
    negate(&mut asm);
    hard(&mut asm, "Greater than or equal comparison failed");
    asm.ldloc(0).ldloc(1).op(Opcode::Ceq);
    negate(&mut asm);
    hard(&mut asm, "Not equal comparison failed");
    asm.ldc_i4(20).stloc(0);
    asm.ldloc(0).ldloc(1).op(Opcode::Ceq);
    hard(&mut asm, "Equal comparison failed");
    asm.ldloc(0).ldloc(1).op(Opcode::Cgt);
    negate(&mut asm);
    hard(&mut asm, "Less than or equal (equal case) failed");
    bodies.push(finish_test(&rt, asm, "Comparison Operators"));

    // Logical operators with the soft assertion. 0: a, 1: b
    let mut asm = start_test(&rt, "Logical Operators");
    asm.locals(2);
    asm.ldc_i4(1).stloc(0).ldc_i4(0).stloc(1);
    asm.ldloc(0).ldloc(1);
    negate(&mut asm);
    asm.op(Opcode::And).ldstr("Logical AND failed").call(check);
    asm.ldloc(0).ldloc(1).op(Opcode::Or);
    asm.ldstr("Logical OR failed").call(check);
    asm.ldloc(1);
    negate(&mut asm);
    asm.ldstr("Logical NOT failed").call(check);
    asm.ldloc(1).ldstr("Soft assertions keep running").call(check);
    bodies.push(finish_test(&rt, asm, "Logical Operators"));

    // For loops. 0: sum, 1: i, 2: product, 3: j
    let mut asm = start_test(&rt, "For Loops");
    asm.locals(4);
    let [body1, cond1, outer, inner, cond_inner, cond_outer] = [(); 6].map(|_| asm.label());
    asm.ldc_i4(0).stloc(0).ldc_i4(1).stloc(1).br(cond1);
    asm.bind(body1);
    add_to_local(&mut asm, 0, 1);
    increment(&mut asm, 1);
    asm.bind(cond1).ldloc(1).ldc_i4(5).ble(body1);
    local_equals(&mut asm, 0, 15);
    hard(&mut asm, "Basic for loop failed: sum should be 15");
    asm.ldc_i4(1).stloc(2).ldc_i4(1).stloc(1).br(cond_outer);
    asm.bind(outer).ldc_i4(1).stloc(3).br(cond_inner);
    asm.bind(inner).ldloc(2).ldloc(1).op(Opcode::Mul).stloc(2);
    increment(&mut asm, 3);
    asm.bind(cond_inner).ldloc(3).ldc_i4(2).ble(inner);
    increment(&mut asm, 1);
    asm.bind(cond_outer).ldloc(1).ldc_i4(3).ble(outer);
    local_equals(&mut asm, 2, 36);
    hard(&mut asm, "Nested for loop failed: product should be 36");
    bodies.push(finish_test(&rt, asm, "For Loops"));

    // Break and continue. 0: sum, 1: i, 2: evenSum
    let mut asm = start_test(&rt, "Break and Continue");
    asm.locals(3);
    let [body1, cond1, broke, body2, cont, cond2] = [(); 6].map(|_| asm.label());
    asm.ldc_i4(0).stloc(0).ldc_i4(1).stloc(1).br(cond1);
    asm.bind(body1).ldloc(1).ldc_i4(5).bgt(broke);
    add_to_local(&mut asm, 0, 1);
    increment(&mut asm, 1);
    asm.bind(cond1).ldloc(1).ldc_i4(10).ble(body1);
    asm.bind(broke);
    local_equals(&mut asm, 0, 15);
    hard(&mut asm, "Break in for loop failed: sum should be 15");
    asm.ldc_i4(0).stloc(2).ldc_i4(1).stloc(1).br(cond2);
    asm.bind(body2).ldloc(1).ldc_i4(2).op(Opcode::Rem).brtrue(cont);
    add_to_local(&mut asm, 2, 1);
    asm.bind(cont);
    increment(&mut asm, 1);
    asm.bind(cond2).ldloc(1).ldc_i4(10).ble(body2);
    local_equals(&mut asm, 2, 30);
    hard(&mut asm, "Continue in for loop failed: evenSum should be 30");
    bodies.push(finish_test(&rt, asm, "Break and Continue"));

    // Null checks. 0: text
    let mut asm = start_test(&rt, "Null Checks");
    asm.locals(1);
    let has_value = asm.label();
    asm.op(Opcode::LdNull).stloc(0);
    asm.ldloc(0).op(Opcode::LdNull).op(Opcode::Ceq);
    hard(&mut asm, "Null check failed: text should be null");
    asm.ldstr("Hello").stloc(0);
    asm.ldloc(0).op(Opcode::LdNull).op(Opcode::Ceq);
    negate(&mut asm);
    hard(&mut asm, "Not null check failed: text should not be null");
    asm.ldloc(0).op(Opcode::Dup).brtrue(has_value);
    asm.op(Opcode::Pop).ldstr("default");
    asm.bind(has_value).ldstr("Hello").call(str_eq);
    hard(&mut asm, "Null coalescing failed");
    bodies.push(finish_test(&rt, asm, "Null Checks"));

    // String comparisons.
    let mut asm = start_test(&rt, "String Comparisons");
    asm.ldstr("Hello").ldstr("Hello").call(str_eq);
    hard(&mut asm, "String equality failed");
    asm.ldstr("Hello").ldstr("hello").call(str_eq);
    negate(&mut asm);
    hard(&mut asm, "String inequality failed");
    bodies.push(finish_test(&rt, asm, "String Comparisons"));

    for (m, body) in tests.iter().zip(bodies) {
        b.define(*m, body);
    }

    b.build()
}

fn start_test(rt: &Runtime, title: &str) -> MethodAssembler {
    let mut asm = MethodAssembler::new();
    rt.print(&mut asm, &format!("Testing {}...", title));
    asm
}

fn finish_test(rt: &Runtime, mut asm: MethodAssembler, title: &str) -> MethodAssembler {
    rt.print(&mut asm, &format!("{} tests passed!", title));
    asm.op(Opcode::Ret);
    asm
}

fn interop_output() -> Vec<String> {
    lines(INTEROP_OUTPUT)
}

const INTEROP_OUTPUT: &[&str] = &[
    "RuntimeInternalCall(1)",
    "Native call failed: Unable to load DLL 'TestLibrary' or one of its dependencies.",
];

fn interop() -> Result<MethodTable, MethodError> {
    let mut b = MethodTableBuilder::new();
    let rt = Runtime::declare(&mut b)?;
    let internal_call = internal(&mut b, "Test.Interop::RuntimeInternalCall(int32)")?;
    let dll_import = b.foreign(
        "Test.Interop::RuntimeDllImportCall(int32)",
        Signature::new([ValueKind::I4], ValueKind::Void),
        ForeignDescriptor::external(
            "TestLibrary",
            "RuntimeDllImportCall",
            CallingConvention::Cdecl,
            Signature::new([ValueKind::I4], ValueKind::Void),
        ),
    )?;
    let main = b.declare("Test.Interop::Main()", void())?;

    let mut asm = MethodAssembler::new();
    asm.locals(1);
    let (try_start, handler, end) = (asm.label(), asm.label(), asm.label());
    asm.ldc_i4(1).call(internal_call);
    asm.bind(try_start).ldc_i4(2).call(dll_import).leave(end);
    asm.bind(handler);
    rt.print_message(&mut asm, "Native call failed: ");
    asm.leave(end);
    asm.bind(end).op(Opcode::Ret);
    asm.region(
        try_start,
        handler,
        vec![AsmHandler::catch(TypeRef::DLL_NOT_FOUND_EXCEPTION, handler, end)],
    );
    b.define(main, asm);

    b.build()
}
