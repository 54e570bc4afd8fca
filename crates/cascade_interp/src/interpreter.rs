use std::collections::VecDeque;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cascade::internal::{self, CallContext};
use cascade::method::{IlBody, Method, MethodBody, MethodTable};
use cascade::native_lib::{ForeignBridge, ForeignDescriptor, ForeignOutcome};
use cascade::opcodes::{Opcode, RefMethod, Target};
use cascade::types::TypeRef;
use cascade::values::{ArithFault, BinOp, CmpOp, ConvKind, ExceptionObject, ObjRef, Object, Value};
use cascade::Host;
use tracing::{debug, trace, warn};

use crate::dispatch::{self, ActiveCatch, Candidate, PendingUnwind, Resume};
use crate::error::{ExecutionError, Fault, UnhandledException};
use crate::frame::Frame;

const DIVIDE_BY_ZERO: &str = "Attempted to divide by zero.";
const OVERFLOW: &str = "Arithmetic operation resulted in an overflow.";
const WRAPPED: &str =
    "An object that does not derive from System.Exception has been wrapped in a RuntimeWrappedException.";

/// Result of executing a single opcode.
enum StepResult {
    /// Continue to the next opcode
    Continue,
    /// Jump to an absolute offset
    Jump(Target),
    /// Return from the current method
    Return(Option<Value>),
    /// Call a method; arguments are still on the stack
    Call(RefMethod),
    Throw(ObjRef),
    Leave(Target),
    EndFinally,
    EndFilter(bool),
}

/// How a method activation, or a filter block run on one, finished.
#[derive(Debug)]
enum Completion {
    Return(Option<Value>),
    Throw(ObjRef),
    FilterResult(bool),
    Cancelled,
}

/// What happens when a foreign target fails to resolve or marshal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InteropErrorPolicy {
    /// Raise the matching managed exception at the call site.
    #[default]
    Throw,
    /// End the run with [`ExecutionError::Resolution`] or
    /// [`ExecutionError::Interop`].
    Fatal,
}

/// Limits and policies for one interpreter.
///
/// Every bytecode call recurses on the native stack of the thread that
/// calls [`Interpreter::run`], and a running filter block adds another
/// level. The thread's stack must hold `max_call_depth` activations: the
/// default of 1000 needs far more than the 2 MiB a spawned thread gets by
/// default, so deep programs should run on a thread built with
/// `std::thread::Builder::stack_size` (the `cascade` runner uses 64 MiB).
#[derive(Debug, Clone)]
pub struct InterpreterOptions {
    /// Maximum number of nested bytecode activations.
    pub max_call_depth: usize,
    pub interop_errors: InteropErrorPolicy,
}

impl Default for InterpreterOptions {
    fn default() -> Self {
        Self {
            max_call_depth: 1000,
            interop_errors: InteropErrorPolicy::Throw,
        }
    }
}

/// Cooperative cancellation flag, checked before every instruction.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Result of a run that reached the end of the entry method, one way or
/// the other.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Returned(Option<Value>),
    Unhandled(UnhandledException),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Returned(_))
    }
}

/// Stack-machine interpreter with structured exception dispatch.
///
/// Each bytecode activation runs in its own frame on the native call
/// stack; a callee's exception comes back as a completion and is dispatched
/// in the caller at the offset of the call instruction.
pub struct Interpreter<H: Host> {
    table: Arc<MethodTable>,
    bridge: Arc<ForeignBridge>,
    host: H,
    options: InterpreterOptions,
    cancel: CancellationToken,
    /// Bytecode activations currently on the call stack
    depth: usize,
}

impl<H: Host> Interpreter<H> {
    pub fn new(table: Arc<MethodTable>, bridge: Arc<ForeignBridge>, host: H, options: InterpreterOptions) -> Self {
        Self {
            table,
            bridge,
            host,
            options,
            cancel: CancellationToken::new(),
            depth: 0,
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn into_host(self) -> H {
        self.host
    }

    pub fn run_by_name(&mut self, name: &str, args: Vec<Value>) -> Result<Outcome, ExecutionError> {
        let entry = self
            .table
            .lookup(name)
            .ok_or_else(|| ExecutionError::InvalidEntry(format!("no method named '{}'", name)))?;
        self.run(entry, args)
    }

    /// Run `entry` to completion.
    pub fn run(&mut self, entry: RefMethod, args: Vec<Value>) -> Result<Outcome, ExecutionError> {
        let table = Arc::clone(&self.table);
        let method = table
            .get(entry)
            .ok_or_else(|| ExecutionError::InvalidEntry(format!("no method #{}", entry.0)))?;
        if args.len() != method.signature.arity() {
            return Err(ExecutionError::InvalidEntry(format!(
                "{} expects {} arguments, got {}",
                method.name,
                method.signature.arity(),
                args.len()
            )));
        }

        debug!(method = %method.name, "run started");
        self.depth = 0;
        match self.call_method(&table, entry, args)? {
            Completion::Return(value) => Ok(Outcome::Returned(value)),
            Completion::Throw(exception) => {
                let unhandled = UnhandledException {
                    type_name: table.types().name(exception.type_ref()).to_string(),
                    message: message_of(&exception),
                };
                warn!(method = %method.name, exception = %unhandled.type_name, "unhandled exception");
                Ok(Outcome::Unhandled(unhandled))
            }
            Completion::Cancelled => Err(ExecutionError::Cancelled),
            Completion::FilterResult(_) => Err(ExecutionError::Decode {
                method: method.name.to_string(),
                offset: 0,
                reason: "filter verdict escaped its filter block".to_string(),
            }),
        }
    }

    fn call_method(
        &mut self,
        table: &MethodTable,
        callee: RefMethod,
        args: Vec<Value>,
    ) -> Result<Completion, ExecutionError> {
        let method = table
            .get(callee)
            .ok_or_else(|| ExecutionError::InvalidEntry(format!("no method #{}", callee.0)))?;
        match &method.body {
            MethodBody::Il(body) => self.execute_il(table, callee, method, body, args),
            MethodBody::Foreign(descriptor) => self.call_foreign(table, method, descriptor, args),
        }
    }

    fn execute_il(
        &mut self,
        table: &MethodTable,
        callee: RefMethod,
        method: &Method,
        body: &IlBody,
        args: Vec<Value>,
    ) -> Result<Completion, ExecutionError> {
        if self.depth >= self.options.max_call_depth {
            return Err(ExecutionError::CallDepthExceeded(self.options.max_call_depth));
        }

        self.depth += 1;
        let mut frame = Frame::new(callee, body, args);
        trace!(method = %method.name, index = frame.method.0, depth = self.depth, "enter");
        let result = self.interpret_loop(table, method, body, &mut frame, None);
        self.depth -= 1;
        trace!(method = %method.name, "exit");
        result
    }

    /// Execute `frame` until the method completes. With a `boundary` the
    /// loop is evaluating the filter block of that range and ends at its
    /// `endfilter`.
    fn interpret_loop(
        &mut self,
        table: &MethodTable,
        method: &Method,
        body: &IlBody,
        frame: &mut Frame,
        boundary: Option<&Range<usize>>,
    ) -> Result<Completion, ExecutionError> {
        loop {
            // Unwinds already in progress finish before cancellation starts its own.
            if frame.unwinds.is_empty() && self.cancel.is_cancelled() {
                debug!(method = %method.name, offset = frame.pc, "cancellation observed");
                let cleanups = dispatch::exit_cleanups(&body.regions, frame.pc, boundary, true);
                if let Some(done) = begin_unwind(frame, cleanups, Resume::Cancel).map_err(|f| f.at(&method.name, frame.pc))? {
                    return Ok(done);
                }
            }

            let pc = frame.pc;
            let op = body
                .ops
                .get(pc)
                .ok_or_else(|| Fault::Decode("execution ran past the end of the method body".to_string()).at(&method.name, pc))?;

            let step = self
                .execute_opcode(table, method, frame, op)
                .map_err(|f| f.at(&method.name, pc))?;

            let done = match step {
                StepResult::Continue => {
                    frame.pc += 1;
                    None
                }
                StepResult::Jump(target) => {
                    frame.transfer(target);
                    None
                }
                StepResult::Return(value) => {
                    if boundary.is_some() {
                        return Err(Fault::Decode("ret inside a filter block".to_string()).at(&method.name, pc));
                    }
                    let cleanups = dispatch::exit_cleanups(&body.regions, pc, boundary, false);
                    begin_unwind(frame, cleanups, Resume::Return(value)).map_err(|f| f.at(&method.name, pc))?
                }
                StepResult::Call(callee) => self.call_from(table, method, body, frame, callee, boundary)?,
                StepResult::Throw(exception) => self.raise(table, method, body, frame, exception, boundary)?,
                StepResult::Leave(target) => {
                    let cleanups = dispatch::leave_cleanups(&body.regions, pc, target, boundary);
                    begin_unwind(frame, cleanups, Resume::Leave(target)).map_err(|f| f.at(&method.name, pc))?
                }
                StepResult::EndFinally => end_finally(frame).map_err(|f| f.at(&method.name, pc))?,
                StepResult::EndFilter(verdict) => {
                    if boundary.is_none() {
                        return Err(Fault::Decode("endfilter outside of a filter block".to_string()).at(&method.name, pc));
                    }
                    Some(Completion::FilterResult(verdict))
                }
            };

            if let Some(done) = done {
                return Ok(done);
            }
        }
    }

    fn call_from(
        &mut self,
        table: &MethodTable,
        method: &Method,
        body: &IlBody,
        frame: &mut Frame,
        callee: RefMethod,
        boundary: Option<&Range<usize>>,
    ) -> Result<Option<Completion>, ExecutionError> {
        let pc = frame.pc;
        let target = table
            .get(callee)
            .ok_or_else(|| Fault::Decode(format!("call to undefined method #{}", callee.0)).at(&method.name, pc))?;
        let args = frame
            .stack
            .pop_n(target.signature.arity())
            .map_err(|f| f.at(&method.name, pc))?;

        match self.call_method(table, callee, args)? {
            Completion::Return(value) => {
                if target.signature.returns_value() {
                    let value = value.ok_or_else(|| {
                        Fault::Imbalance(format!("{} returned no value", target.name)).at(&method.name, pc)
                    })?;
                    frame.stack.push(value).map_err(|f| f.at(&method.name, pc))?;
                }
                frame.pc += 1;
                Ok(None)
            }
            Completion::Throw(exception) => self.raise(table, method, body, frame, exception, boundary),
            Completion::Cancelled => {
                let cleanups = dispatch::exit_cleanups(&body.regions, pc, boundary, true);
                begin_unwind(frame, cleanups, Resume::Cancel).map_err(|f| f.at(&method.name, pc))
            }
            Completion::FilterResult(_) => {
                Err(Fault::Decode("filter verdict escaped its filter block".to_string()).at(&method.name, pc))
            }
        }
    }

    /// Dispatch `exception` raised at the current offset of `frame`.
    ///
    /// Filters are evaluated as the search reaches them, before any finally
    /// or fault handler of this frame runs. Once cancellation is requested
    /// no catch clause is entered.
    fn raise(
        &mut self,
        table: &MethodTable,
        method: &Method,
        body: &IlBody,
        frame: &mut Frame,
        exception: ObjRef,
        boundary: Option<&Range<usize>>,
    ) -> Result<Option<Completion>, ExecutionError> {
        let pc = frame.pc;
        let ty = exception.type_ref();
        debug!(
            method = %method.name,
            offset = pc,
            exception = table.types().name(ty),
            "dispatching exception"
        );

        let cancelling = self.cancel.is_cancelled();
        let mut cleanups = Vec::new();
        let mut caught = None;
        for candidate in dispatch::search(&body.regions, pc, boundary) {
            match candidate {
                Candidate::Cleanup(range) => cleanups.push(range),
                Candidate::Catch { .. } | Candidate::Filter { .. } if cancelling => {}
                Candidate::Catch { ty: catch_ty, handler } => {
                    if table.types().is_assignable(ty, catch_ty) {
                        caught = Some(handler);
                        break;
                    }
                }
                Candidate::Filter { filter, handler } => {
                    if self.run_filter(table, method, body, frame, filter, &exception)? {
                        caught = Some(handler);
                        break;
                    }
                }
            }
        }

        let resume = match caught {
            Some(handler) => {
                trace!(method = %method.name, handler = handler.start, "exception caught");
                Resume::Catch { handler, exception }
            }
            None if cancelling => Resume::Cancel,
            None => Resume::Propagate(exception),
        };
        begin_unwind(frame, cleanups, resume).map_err(|f| f.at(&method.name, pc))
    }

    fn run_filter(
        &mut self,
        table: &MethodTable,
        method: &Method,
        body: &IlBody,
        frame: &mut Frame,
        filter: Range<usize>,
        exception: &ObjRef,
    ) -> Result<bool, ExecutionError> {
        let pc = frame.pc;
        let saved = frame
            .suspend_for_filter(filter.start, Arc::clone(exception))
            .map_err(|f| f.at(&method.name, pc))?;
        trace!(method = %method.name, offset = filter.start, "evaluating filter");
        let result = self.interpret_loop(table, method, body, frame, Some(&filter));
        frame.resume(saved);

        match result? {
            Completion::FilterResult(verdict) => Ok(verdict),
            Completion::Throw(escaped) => {
                debug!(
                    method = %method.name,
                    exception = table.types().name(escaped.type_ref()),
                    "exception escaped filter, handler skipped"
                );
                Ok(false)
            }
            Completion::Cancelled => Ok(false),
            Completion::Return(_) => {
                Err(Fault::Decode("filter block returned from the method".to_string()).at(&method.name, filter.start))
            }
        }
    }

    fn call_foreign(
        &mut self,
        table: &MethodTable,
        method: &Method,
        descriptor: &ForeignDescriptor,
        args: Vec<Value>,
    ) -> Result<Completion, ExecutionError> {
        let target = match self.bridge.resolve(descriptor) {
            Ok(target) => target,
            Err(e) => {
                warn!(method = %method.name, error = %e, "foreign target did not resolve");
                return self.interop_failure(e.to_exception(), e.into());
            }
        };

        let outcome = {
            let mut ctx = CallContext::new(&mut self.host, table.types());
            self.bridge.invoke(&target, &mut ctx, &args)
        };

        match outcome {
            Ok(ForeignOutcome::Return(value)) => Ok(Completion::Return(value)),
            Ok(ForeignOutcome::Throw(exception)) => Ok(Completion::Throw(exception.into_ref())),
            Ok(ForeignOutcome::Abort(reason)) => {
                warn!(method = %method.name, %reason, "run aborted");
                Err(ExecutionError::Aborted(reason))
            }
            Err(e) => {
                warn!(method = %method.name, error = %e, "foreign call failed");
                self.interop_failure(e.to_exception(), e.into())
            }
        }
    }

    fn interop_failure(&self, exception: ExceptionObject, error: ExecutionError) -> Result<Completion, ExecutionError> {
        match self.options.interop_errors {
            InteropErrorPolicy::Throw => Ok(Completion::Throw(exception.into_ref())),
            InteropErrorPolicy::Fatal => Err(error),
        }
    }

    fn execute_opcode(
        &mut self,
        table: &MethodTable,
        method: &Method,
        frame: &mut Frame,
        op: &Opcode,
    ) -> Result<StepResult, Fault> {
        match op {
            Opcode::Nop => {}
            Opcode::LdcI4 { value } => frame.stack.push(Value::I32(*value))?,
            Opcode::LdcI8 { value } => frame.stack.push(Value::I64(*value))?,
            Opcode::LdcR8 { value } => frame.stack.push(Value::F64(*value))?,
            Opcode::LdStr { ptr } => {
                let s = table
                    .string(*ptr)
                    .ok_or_else(|| Fault::Decode(format!("string #{} is not in the pool", ptr.0)))?;
                frame.stack.push(Value::Ref(Arc::new(Object::String(s.clone()))))?;
            }
            Opcode::LdNull => frame.stack.push(Value::Null)?,
            Opcode::LdArg { index } => {
                let value = slot(&mut frame.args, *index, "argument")?.clone();
                frame.stack.push(value)?;
            }
            Opcode::StArg { index } => {
                let value = frame.stack.pop()?;
                *slot(&mut frame.args, *index, "argument")? = value;
            }
            Opcode::LdLoc { index } => {
                let value = slot(&mut frame.locals, *index, "local")?.clone();
                frame.stack.push(value)?;
            }
            Opcode::StLoc { index } => {
                let value = frame.stack.pop()?;
                *slot(&mut frame.locals, *index, "local")? = value;
            }
            Opcode::Dup => {
                let value = frame.stack.peek()?.clone();
                frame.stack.push(value)?;
            }
            Opcode::Pop => {
                frame.stack.pop()?;
            }

            Opcode::Add => return binary(frame, BinOp::Add),
            Opcode::Sub => return binary(frame, BinOp::Sub),
            Opcode::Mul => return binary(frame, BinOp::Mul),
            Opcode::Div => return binary(frame, BinOp::Div),
            Opcode::Rem => return binary(frame, BinOp::Rem),
            Opcode::And => return binary(frame, BinOp::And),
            Opcode::Or => return binary(frame, BinOp::Or),
            Opcode::Xor => return binary(frame, BinOp::Xor),
            Opcode::Shl => return binary(frame, BinOp::Shl),
            Opcode::Shr => return binary(frame, BinOp::Shr),
            Opcode::ShrUn => return binary(frame, BinOp::ShrUn),
            Opcode::Neg => {
                let a = frame.stack.pop()?;
                match a.neg() {
                    Ok(v) => frame.stack.push(v)?,
                    Err(fault) => return arith_fault(fault, "neg"),
                }
            }
            Opcode::Not => {
                let a = frame.stack.pop()?;
                match a.not() {
                    Ok(v) => frame.stack.push(v)?,
                    Err(fault) => return arith_fault(fault, "not"),
                }
            }

            Opcode::Ceq => compare(frame, CmpOp::Eq)?,
            Opcode::Cgt => compare(frame, CmpOp::Gt)?,
            Opcode::Clt => compare(frame, CmpOp::Lt)?,

            Opcode::ConvI4 => convert(frame, ConvKind::I4)?,
            Opcode::ConvI8 => convert(frame, ConvKind::I8)?,
            Opcode::ConvR8 => convert(frame, ConvKind::R8)?,

            Opcode::Br { target } => return Ok(StepResult::Jump(*target)),
            Opcode::BrTrue { target } => {
                if frame.stack.pop()?.to_bool() {
                    return Ok(StepResult::Jump(*target));
                }
            }
            Opcode::BrFalse { target } => {
                if !frame.stack.pop()?.to_bool() {
                    return Ok(StepResult::Jump(*target));
                }
            }
            Opcode::Beq { target } => return branch_if(frame, CmpOp::Eq, *target),
            Opcode::Bne { target } => return branch_if(frame, CmpOp::NotEq, *target),
            Opcode::Bge { target } => return branch_if(frame, CmpOp::Gte, *target),
            Opcode::Bgt { target } => return branch_if(frame, CmpOp::Gt, *target),
            Opcode::Ble { target } => return branch_if(frame, CmpOp::Lte, *target),
            Opcode::Blt { target } => return branch_if(frame, CmpOp::Lt, *target),
            Opcode::Switch { targets } => {
                let value = frame.stack.pop()?;
                let index = value
                    .as_i32()
                    .ok_or_else(|| Fault::Imbalance(format!("switch on {}", value.tag_name())))?;
                if let Some(target) = usize::try_from(index).ok().and_then(|i| targets.get(i)) {
                    return Ok(StepResult::Jump(*target));
                }
            }

            Opcode::Call { method } => return Ok(StepResult::Call(*method)),
            Opcode::Ret => {
                let value = if method.signature.returns_value() {
                    Some(frame.stack.pop()?)
                } else {
                    None
                };
                return Ok(StepResult::Return(value));
            }

            Opcode::NewException { ty } => {
                if !table.types().is_assignable(*ty, TypeRef::EXCEPTION) {
                    return Err(Fault::Decode(format!(
                        "{} does not derive from System.Exception",
                        table.types().name(*ty)
                    )));
                }
                let message = frame.stack.pop()?;
                let text = match &message {
                    Value::Null => "",
                    other => other
                        .as_str()
                        .ok_or_else(|| Fault::Imbalance(format!("exception message is {}", other.tag_name())))?,
                };
                let exception = ExceptionObject::new(*ty, text).into_ref();
                frame.stack.push(Value::Ref(exception))?;
            }
            Opcode::Throw => {
                let exception = match frame.stack.pop()? {
                    Value::Null => internal::null_reference().into_ref(),
                    Value::Ref(obj) if matches!(obj.as_ref(), Object::Exception(_)) => obj,
                    Value::Ref(_) => ExceptionObject::new(TypeRef::RUNTIME_WRAPPED_EXCEPTION, WRAPPED).into_ref(),
                    other => return Err(Fault::Imbalance(format!("throw of {}", other.tag_name()))),
                };
                return Ok(StepResult::Throw(exception));
            }
            Opcode::Rethrow => {
                let active = frame
                    .catches
                    .last()
                    .ok_or_else(|| Fault::Decode("rethrow outside of a catch handler".to_string()))?;
                return Ok(StepResult::Throw(Arc::clone(&active.exception)));
            }
            Opcode::Leave { target } => return Ok(StepResult::Leave(*target)),
            Opcode::EndFinally => return Ok(StepResult::EndFinally),
            Opcode::EndFilter => {
                let verdict = frame.stack.pop()?.to_bool();
                return Ok(StepResult::EndFilter(verdict));
            }
        }
        Ok(StepResult::Continue)
    }
}

fn slot<'a>(values: &'a mut [Value], index: u16, what: &str) -> Result<&'a mut Value, Fault> {
    values
        .get_mut(index as usize)
        .ok_or_else(|| Fault::Decode(format!("{} {} is out of range", what, index)))
}

fn binary(frame: &mut Frame, op: BinOp) -> Result<StepResult, Fault> {
    let b = frame.stack.pop()?;
    let a = frame.stack.pop()?;
    match a.binary_op(&b, op) {
        Ok(v) => {
            frame.stack.push(v)?;
            Ok(StepResult::Continue)
        }
        Err(fault) => arith_fault(fault, &format!("{:?} of {} and {}", op, a.tag_name(), b.tag_name())),
    }
}

/// Division by zero and overflow become managed exceptions; mismatched
/// operands are an error in the bytecode.
fn arith_fault(fault: ArithFault, what: &str) -> Result<StepResult, Fault> {
    match fault {
        ArithFault::DivideByZero => Ok(StepResult::Throw(
            ExceptionObject::new(TypeRef::DIVIDE_BY_ZERO_EXCEPTION, DIVIDE_BY_ZERO).into_ref(),
        )),
        ArithFault::Overflow => Ok(StepResult::Throw(
            ExceptionObject::new(TypeRef::OVERFLOW_EXCEPTION, OVERFLOW).into_ref(),
        )),
        ArithFault::TagMismatch => Err(Fault::Imbalance(format!("{} on incompatible operands", what))),
    }
}

fn compare(frame: &mut Frame, op: CmpOp) -> Result<(), Fault> {
    let b = frame.stack.pop()?;
    let a = frame.stack.pop()?;
    let result = a
        .compare(&b, op)
        .ok_or_else(|| Fault::Imbalance(format!("cannot compare {} with {}", a.tag_name(), b.tag_name())))?;
    frame.stack.push(Value::from_bool(result))
}

fn branch_if(frame: &mut Frame, op: CmpOp, target: Target) -> Result<StepResult, Fault> {
    let b = frame.stack.pop()?;
    let a = frame.stack.pop()?;
    match a.compare(&b, op) {
        Some(true) => Ok(StepResult::Jump(target)),
        Some(false) => Ok(StepResult::Continue),
        None => Err(Fault::Imbalance(format!(
            "cannot compare {} with {}",
            a.tag_name(),
            b.tag_name()
        ))),
    }
}

fn convert(frame: &mut Frame, to: ConvKind) -> Result<(), Fault> {
    let value = frame.stack.pop()?;
    let converted = value
        .conv(to)
        .ok_or_else(|| Fault::Imbalance(format!("cannot convert {} with {:?}", value.tag_name(), to)))?;
    frame.stack.push(converted)
}

/// Start running `cleanups` in order, then `resume`. The operand stack is
/// emptied first.
fn begin_unwind(frame: &mut Frame, cleanups: Vec<Range<usize>>, resume: Resume) -> Result<Option<Completion>, Fault> {
    frame.stack.clear();
    let mut queue = VecDeque::from(cleanups);
    match queue.pop_front() {
        Some(first) => {
            let start = first.start;
            frame.unwinds.push(PendingUnwind {
                running: first,
                queue,
                resume,
            });
            frame.transfer(start);
            Ok(None)
        }
        None => complete_unwind(frame, resume),
    }
}

fn end_finally(frame: &mut Frame) -> Result<Option<Completion>, Fault> {
    let pc = frame.pc;
    let Some(unwind) = frame.unwinds.last_mut().filter(|u| u.running.contains(&pc)) else {
        return Err(Fault::Decode(
            "endfinally outside of a running finally or fault handler".to_string(),
        ));
    };

    if let Some(next) = unwind.queue.pop_front() {
        let start = next.start;
        unwind.running = next;
        frame.stack.clear();
        frame.transfer(start);
        return Ok(None);
    }

    match frame.unwinds.pop() {
        Some(finished) => complete_unwind(frame, finished.resume),
        None => Ok(None),
    }
}

fn complete_unwind(frame: &mut Frame, resume: Resume) -> Result<Option<Completion>, Fault> {
    match resume {
        Resume::Leave(target) => {
            frame.transfer(target);
            Ok(None)
        }
        Resume::Return(value) => Ok(Some(Completion::Return(value))),
        Resume::Catch { handler, exception } => {
            frame.stack.clear();
            frame.transfer(handler.start);
            frame.stack.push(Value::Ref(Arc::clone(&exception)))?;
            frame.catches.push(ActiveCatch {
                range: handler,
                exception,
            });
            Ok(None)
        }
        Resume::Propagate(exception) => Ok(Some(Completion::Throw(exception))),
        Resume::Cancel => Ok(Some(Completion::Cancelled)),
    }
}

fn message_of(exception: &ObjRef) -> String {
    match exception.as_ref() {
        Object::Exception(e) => e.message.to_string(),
        Object::String(s) => s.to_string(),
    }
}
