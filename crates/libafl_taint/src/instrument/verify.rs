//! Structural verification of installed taint programs.
//!
//! A program that fails here would read or write shadow bytes it does not
//! own, so the engine refuses to run with it.
use core::fmt::{self, Display, Formatter};

use thiserror::Error;

use crate::{
    addr::{Address, GUEST_REG_SIZE, MAX_REG_SIZE},
    instrument::{Operand, TaintOp, TaintProgram},
    ir::{IrModule, UnitId},
    shadow::ShadowLayout,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyProblem {
    pub unit: UnitId,
    pub op: usize,
    pub reason: String,
}

impl Display for VerifyProblem {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "unit {} op #{}: {}", self.unit, self.op, self.reason)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub struct VerifyError {
    pub problems: Vec<VerifyProblem>,
}

impl Display for VerifyError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Taint instrumentation failed verification ({} problem(s))",
            self.problems.len()
        )?;
        for problem in &self.problems {
            write!(f, "\n  {problem}")?;
        }
        Ok(())
    }
}

impl VerifyError {
    pub(crate) fn check(problems: Vec<VerifyProblem>) -> Result<(), Self> {
        if problems.is_empty() {
            Ok(())
        } else {
            Err(Self { problems })
        }
    }
}

/// Width of the slot a register-class address lives in.
fn slot_width(addr: Address) -> Option<u64> {
    match addr {
        Address::Local { .. } | Address::Ret(_) => Some(MAX_REG_SIZE),
        Address::GlobalReg { .. } => Some(GUEST_REG_SIZE),
        Address::Ram(_) | Address::GlobalSpecial(_) => None,
    }
}

fn check_extent(addr: Address, size: u64, layout: &ShadowLayout) -> Result<(), String> {
    if size == 0 {
        return Err(format!("zero-sized access at {addr}"));
    }
    if !addr.is_canonical() {
        return Err(format!("non-canonical address {addr:?}"));
    }
    if let Some(width) = slot_width(addr) {
        let inner = addr.offset() % width;
        if inner + size > width {
            return Err(format!("{size} bytes at {addr} overflow a {width}-byte slot"));
        }
    }
    if let Some(cap) = layout.region_size(addr.region()) {
        if addr.offset().checked_add(size).map_or(true, |end| end > cap) {
            return Err(format!(
                "{size} bytes at {addr} exceed the {} region ({cap} bytes)",
                addr.region()
            ));
        }
    }
    Ok(())
}

struct Checker<'a> {
    layout: &'a ShadowLayout,
    reasons: Vec<String>,
}

impl Checker<'_> {
    fn extent(&mut self, addr: Address, size: u64) {
        if let Err(reason) = check_extent(addr, size, self.layout) {
            self.reasons.push(reason);
        }
    }

    fn operands(&mut self, ops: &[Operand]) {
        for o in ops {
            self.extent(o.addr, o.size);
        }
    }

    fn memory(&mut self, reg: Option<&Address>, size: u64, ptr: &Option<Operand>) {
        match reg {
            Some(reg) => self.extent(*reg, size),
            None if size == 0 => self.reasons.push("zero-sized memory access".into()),
            None => {}
        }
        self.operands(ptr.as_slice());
    }
}

pub(crate) fn verify_program(
    program: &TaintProgram,
    module: &IrModule,
    layout: &ShadowLayout,
    problems: &mut Vec<VerifyProblem>,
) {
    for (idx, op) in program.ops.iter().enumerate() {
        let mut checker = Checker {
            layout,
            reasons: Vec::new(),
        };
        match op {
            TaintOp::Copy { dst, src, size } => {
                checker.extent(*dst, *size);
                checker.extent(*src, *size);
            }
            TaintOp::Mix { dst, srcs, size } => {
                checker.extent(*dst, *size);
                checker.operands(srcs);
            }
            TaintOp::Delete { dst, size } => checker.extent(*dst, *size),
            TaintOp::LoadMem { dst, size, ptr } => {
                checker.memory(dst.as_ref(), *size, ptr);
            }
            TaintOp::StoreMem { src, size, ptr } => {
                checker.memory(src.as_ref(), *size, ptr);
            }
            TaintOp::Call {
                helper,
                args,
                ret,
                size,
            } => {
                checker.operands(args);
                if let Some(ret) = ret {
                    checker.extent(*ret, *size);
                }
                if !module.contains(*helper) {
                    checker.reasons.push(format!("call to unknown unit {helper}"));
                }
            }
        }
        problems.extend(checker.reasons.into_iter().map(|reason| VerifyProblem {
            unit: program.unit,
            op: idx,
            reason,
        }));
    }
}
