use cascade::method::IlBody;
use cascade::opcodes::RefMethod;
use cascade::values::{ObjRef, Value};

use crate::dispatch::{ActiveCatch, PendingUnwind};
use crate::error::Fault;

/// Evaluation stack for a single method activation, bounded by the
/// method's declared maximum depth.
#[derive(Debug, Default)]
pub struct OperandStack {
    values: Vec<Value>,
    max: usize,
}

impl OperandStack {
    pub fn new(max: usize) -> Self {
        Self {
            values: Vec::with_capacity(max),
            max,
        }
    }

    #[inline(always)]
    pub fn push(&mut self, value: Value) -> Result<(), Fault> {
        if self.values.len() >= self.max {
            return Err(Fault::Imbalance(format!(
                "operand stack exceeds its declared depth of {}",
                self.max
            )));
        }
        self.values.push(value);
        Ok(())
    }

    #[inline(always)]
    pub fn pop(&mut self) -> Result<Value, Fault> {
        self.values
            .pop()
            .ok_or_else(|| Fault::Imbalance("operand stack underflow".to_string()))
    }

    pub fn peek(&self) -> Result<&Value, Fault> {
        self.values
            .last()
            .ok_or_else(|| Fault::Imbalance("operand stack underflow".to_string()))
    }

    /// Pop `n` values, returned in push order.
    pub fn pop_n(&mut self, n: usize) -> Result<Vec<Value>, Fault> {
        if self.values.len() < n {
            return Err(Fault::Imbalance(format!(
                "call needs {} arguments, stack holds {}",
                n,
                self.values.len()
            )));
        }
        Ok(self.values.split_off(self.values.len() - n))
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}

/// Interpreter execution frame (one per method activation).
#[derive(Debug)]
pub struct Frame {
    pub method: RefMethod,
    pub args: Vec<Value>,
    /// Locals start zeroed.
    pub locals: Vec<Value>,
    pub stack: OperandStack,
    /// Offset of the instruction being executed.
    pub pc: usize,
    /// Finally/fault runs in progress, innermost last.
    pub unwinds: Vec<PendingUnwind>,
    /// Catch handlers currently executing, innermost last.
    pub catches: Vec<ActiveCatch>,
}

/// Evaluation state put aside while a filter block runs on the frame.
pub struct Suspended {
    stack: OperandStack,
    pc: usize,
    unwinds: Vec<PendingUnwind>,
    catches: Vec<ActiveCatch>,
}

impl Frame {
    pub fn new(method: RefMethod, body: &IlBody, args: Vec<Value>) -> Self {
        Self {
            method,
            args,
            locals: vec![Value::I32(0); body.locals as usize],
            stack: OperandStack::new(body.max_stack as usize),
            pc: 0,
            unwinds: Vec::new(),
            catches: Vec::new(),
        }
    }

    /// Move control to `target`, dropping unwinds and catches whose
    /// handler no longer contains the new offset.
    pub fn transfer(&mut self, target: usize) {
        self.pc = target;
        self.unwinds.retain(|u| u.running.contains(&target));
        self.catches.retain(|c| c.range.contains(&target));
    }

    /// Start a filter block at `start` with `exception` as the only
    /// stack entry. Arguments and locals stay shared with the frame.
    pub fn suspend_for_filter(&mut self, start: usize, exception: ObjRef) -> Result<Suspended, Fault> {
        let max = self.stack.max;
        let saved = Suspended {
            stack: std::mem::replace(&mut self.stack, OperandStack::new(max)),
            pc: self.pc,
            unwinds: std::mem::take(&mut self.unwinds),
            catches: std::mem::take(&mut self.catches),
        };
        self.pc = start;
        self.stack.push(Value::Ref(exception))?;
        Ok(saved)
    }

    pub fn resume(&mut self, saved: Suspended) {
        self.stack = saved.stack;
        self.pc = saved.pc;
        self.unwinds = saved.unwinds;
        self.catches = saved.catches;
    }
}
