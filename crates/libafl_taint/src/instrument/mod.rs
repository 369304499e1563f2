//! # instrument
//! The instrumentation installer.
//!
//! [`TaintPass`] lowers every operation of a [`CodeUnit`] into [`TaintOp`]s,
//! the shadow-side twin of the real computation, and keeps the resulting
//! [`TaintProgram`] per unit. How labels of the inputs of one operation are
//! combined is up to the [`TaintSemantics`] in use; operations it does not
//! know are treated as taint-transparent so installation never fails.
use core::fmt::Debug;

use hashbrown::HashMap;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::{
    addr::{make_ret, Address, GUEST_REG_SIZE},
    ir::{CodeUnit, IrModule, IrOp, UnitId, Value},
    shadow::ShadowLayout,
};

pub mod exec;
pub mod verify;

use verify::{verify_program, VerifyError};

/// A shadow extent read by a taint operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Operand {
    pub addr: Address,
    pub size: u64,
}

impl Operand {
    #[must_use]
    pub fn new(addr: Address, size: u64) -> Self {
        Self { addr, size }
    }

    fn of(value: Value, size: u64) -> Option<Self> {
        value.address().map(|addr| Self::new(addr, size))
    }

    fn overlaps(&self, addr: Address, size: u64) -> bool {
        if self.addr.region() != addr.region() {
            return false;
        }
        let (a, b) = (self.addr.offset(), addr.offset());
        a < b.saturating_add(size) && b < a.saturating_add(self.size)
    }
}

/// One shadow-side operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaintOp {
    /// Byte-wise copy of `size` label-sets.
    Copy {
        dst: Address,
        src: Address,
        size: u64,
    },
    /// Every destination byte gets the union of all source bytes.
    Mix {
        dst: Address,
        srcs: Vec<Operand>,
        size: u64,
    },
    /// Untaints the destination.
    Delete { dst: Address, size: u64 },
    /// Load from the memory address next in the memlog.
    LoadMem {
        dst: Option<Address>,
        size: u64,
        ptr: Option<Operand>,
    },
    /// Store to the memory address next in the memlog. `None` stores an immediate.
    StoreMem {
        src: Option<Address>,
        size: u64,
        ptr: Option<Operand>,
    },
    /// Call of a helper unit; the return slot gets the union of the arguments.
    Call {
        helper: UnitId,
        args: Vec<Operand>,
        ret: Option<Address>,
        size: u64,
    },
}

impl TaintOp {
    /// Whether this op replaces every label of `size` bytes at `dst` without
    /// reading them first.
    fn overwrites(&self, dst: Address, size: u64) -> bool {
        let covers = |d: Address, s: u64| d == dst && s >= size;
        match self {
            TaintOp::Copy { dst: d, src, size: s } => {
                covers(*d, *s) && !Operand::new(*src, *s).overlaps(dst, size)
            }
            TaintOp::Mix { dst: d, srcs, size: s } => {
                covers(*d, *s) && !srcs.iter().any(|o| o.overlaps(dst, size))
            }
            TaintOp::Delete { dst: d, size: s } => covers(*d, *s),
            TaintOp::LoadMem {
                dst: Some(d),
                size: s,
                ptr,
            } => covers(*d, *s) && !ptr.is_some_and(|p| p.overlaps(dst, size)),
            TaintOp::LoadMem { dst: None, .. } | TaintOp::StoreMem { .. } | TaintOp::Call { .. } => {
                false
            }
        }
    }
}

/// The taint operations of one code unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaintProgram {
    pub unit: UnitId,
    pub ops: Vec<TaintOp>,
    /// Emitted inline into the unit rather than as calls to taint routines
    pub inlined: bool,
}

/// Per-operation propagation rules.
pub trait TaintSemantics: Debug {
    /// Appends the taint ops of `op` to `out`.
    ///
    /// Returns `false` if `op` has no taint semantics; the installer then
    /// passes the input labels through unchanged.
    fn lower(&self, op: &IrOp, out: &mut Vec<TaintOp>) -> bool;

    /// Toggles propagation through pointer dereference.
    fn set_tainted_pointer(&mut self, _enabled: bool) {}
}

/// Union-based propagation, the default [`TaintSemantics`].
#[derive(Debug, Clone, Copy)]
pub struct StdTaintSemantics {
    tainted_pointer: bool,
}

impl StdTaintSemantics {
    #[must_use]
    pub fn new(tainted_pointer: bool) -> Self {
        Self { tainted_pointer }
    }

    #[must_use]
    pub fn tainted_pointer(&self) -> bool {
        self.tainted_pointer
    }

    fn ptr(&self, addr: Value) -> Option<Operand> {
        if self.tainted_pointer {
            Operand::of(addr, GUEST_REG_SIZE)
        } else {
            None
        }
    }
}

impl Default for StdTaintSemantics {
    fn default() -> Self {
        Self::new(true)
    }
}

impl TaintSemantics for StdTaintSemantics {
    fn lower(&self, op: &IrOp, out: &mut Vec<TaintOp>) -> bool {
        match op {
            IrOp::Load { dst, addr, size } => out.push(TaintOp::LoadMem {
                dst: dst.address(),
                size: *size,
                ptr: self.ptr(*addr),
            }),
            IrOp::Store { src, addr, size } => out.push(TaintOp::StoreMem {
                src: src.address(),
                size: *size,
                ptr: self.ptr(*addr),
            }),
            IrOp::Move { dst, src, size } => {
                if let Some(dst) = dst.address() {
                    out.push(match src.address() {
                        Some(src) => TaintOp::Copy {
                            dst,
                            src,
                            size: *size,
                        },
                        None => TaintOp::Delete { dst, size: *size },
                    });
                }
            }
            IrOp::Compute { dst, srcs, size } => {
                if let Some(dst) = dst.address() {
                    let srcs: Vec<Operand> =
                        srcs.iter().filter_map(|v| Operand::of(*v, *size)).collect();
                    out.push(if srcs.is_empty() {
                        TaintOp::Delete { dst, size: *size }
                    } else {
                        TaintOp::Mix {
                            dst,
                            srcs,
                            size: *size,
                        }
                    });
                }
            }
            IrOp::Call {
                helper,
                args,
                ret,
                size,
            } => out.push(TaintOp::Call {
                helper: *helper,
                args: args.iter().filter_map(|v| Operand::of(*v, *size)).collect(),
                ret: ret.and_then(Value::address),
                size: *size,
            }),
            IrOp::Return { src, size } => out.push(match src.address() {
                Some(src) => TaintOp::Copy {
                    dst: make_ret(0),
                    src,
                    size: *size,
                },
                None => TaintOp::Delete {
                    dst: make_ret(0),
                    size: *size,
                },
            }),
            IrOp::Other { .. } => return false,
        }
        true
    }

    fn set_tainted_pointer(&mut self, enabled: bool) {
        self.tainted_pointer = enabled;
    }
}

/// Lowering of an operation without taint semantics: inputs flow to the
/// output unchanged. Memory ops still consume their memlog entry.
fn transparent(op: &IrOp, out: &mut Vec<TaintOp>) {
    match op {
        IrOp::Load { dst, size, .. } => out.push(TaintOp::LoadMem {
            dst: dst.address(),
            size: *size,
            ptr: None,
        }),
        IrOp::Store { src, size, .. } => out.push(TaintOp::StoreMem {
            src: src.address(),
            size: *size,
            ptr: None,
        }),
        _ => {
            let (dst, srcs, size) = op.data_flow();
            let srcs: Vec<Operand> = srcs.into_iter().filter_map(|v| Operand::of(v, size)).collect();
            if let Some(dst) = dst.and_then(Value::address) {
                out.push(if srcs.is_empty() {
                    TaintOp::Delete { dst, size }
                } else {
                    TaintOp::Mix { dst, srcs, size }
                });
            }
        }
    }
}

/// Drops self-copies and deletes that the next op overwrites anyway.
fn optimize(ops: Vec<TaintOp>) -> Vec<TaintOp> {
    let mut out: Vec<TaintOp> = Vec::with_capacity(ops.len());
    for op in ops {
        if let TaintOp::Copy { dst, src, .. } = &op {
            if dst == src {
                continue;
            }
        }
        if let Some(TaintOp::Delete { dst, size }) = out.last() {
            if op.overwrites(*dst, *size) {
                out.pop();
            }
        }
        out.push(op);
    }
    out
}

/// Installs taint programs on code units.
#[derive(Debug)]
pub struct TaintPass {
    semantics: Box<dyn TaintSemantics>,
    inline: bool,
    optimize: bool,
    programs: HashMap<UnitId, TaintProgram>,
}

impl TaintPass {
    #[must_use]
    pub fn new(semantics: Box<dyn TaintSemantics>, inline: bool, optimize: bool) -> Self {
        Self {
            semantics,
            inline,
            optimize,
            programs: HashMap::new(),
        }
    }

    pub fn semantics_mut(&mut self) -> &mut dyn TaintSemantics {
        self.semantics.as_mut()
    }

    pub fn set_semantics(&mut self, semantics: Box<dyn TaintSemantics>) {
        self.semantics = semantics;
    }

    pub fn set_inline(&mut self, inline: bool) {
        self.inline = inline;
    }

    pub fn set_optimize(&mut self, optimize: bool) {
        self.optimize = optimize;
    }

    /// Derives and installs the taint program of `unit`, replacing any older one.
    pub fn install(&mut self, unit: &CodeUnit) -> &TaintProgram {
        let mut ops = Vec::with_capacity(unit.ops.len());
        let mut transparent_ops = 0;
        for op in &unit.ops {
            if !self.semantics.lower(op, &mut ops) {
                transparent(op, &mut ops);
                transparent_ops += 1;
            }
        }
        if transparent_ops > 0 {
            debug!(
                "unit {}: {transparent_ops} op(s) without taint semantics, passing labels through",
                unit.id
            );
        }
        if self.optimize {
            ops = optimize(ops);
        }
        let program = TaintProgram {
            unit: unit.id,
            ops,
            inlined: self.inline,
        };
        self.programs.insert(unit.id, program);
        &self.programs[&unit.id]
    }

    /// Installs taint programs on every unit with a body, helpers included.
    pub fn install_all(&mut self, module: &IrModule) -> usize {
        let mut count = 0;
        for unit in module.definitions() {
            self.install(unit);
            count += 1;
        }
        info!("Installed taint instrumentation on {count} code unit(s)");
        count
    }

    #[must_use]
    pub fn is_instrumented(&self, unit: UnitId) -> bool {
        self.programs.contains_key(&unit)
    }

    #[must_use]
    pub fn program(&self, unit: UnitId) -> Option<&TaintProgram> {
        self.programs.get(&unit)
    }

    pub fn uninstall(&mut self, unit: UnitId) -> Option<TaintProgram> {
        self.programs.remove(&unit)
    }

    pub fn clear(&mut self) {
        self.programs.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.programs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }

    /// Checks every installed program against `module` and `layout`.
    pub fn verify(&self, module: &IrModule, layout: &ShadowLayout) -> Result<(), VerifyError> {
        let mut problems = Vec::new();
        let mut units: Vec<&UnitId> = self.programs.keys().collect();
        units.sort_unstable();
        for unit in units {
            verify_program(&self.programs[unit], module, layout, &mut problems);
        }
        VerifyError::check(problems)
    }

    /// Checks the program installed on `unit`.
    pub fn verify_unit(
        &self,
        unit: UnitId,
        module: &IrModule,
        layout: &ShadowLayout,
    ) -> Result<(), VerifyError> {
        let mut problems = Vec::new();
        if let Some(program) = self.programs.get(&unit) {
            verify_program(program, module, layout, &mut problems);
        }
        VerifyError::check(problems)
    }
}
