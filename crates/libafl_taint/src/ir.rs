//! # ir
//! The rewritable representation of translated guest code.
//!
//! The host lifts every translated block, and every helper routine the
//! blocks call into, into a [`CodeUnit`]. The [`crate::instrument::TaintPass`]
//! walks these units and derives the taint operations running alongside
//! the real computation.
use alloc::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    addr::{make_greg, make_gsv, make_laddr, make_ret, Address},
    GuestAddr,
};

/// Identifier of a code unit inside an [`IrModule`].
pub type UnitId = u64;

/// An operand of an IR operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Value {
    /// A scratch register of the current invocation
    Local(u64),
    /// A general-purpose guest register
    GlobalReg(u64),
    /// A special guest value, by byte offset in the special-value area
    GlobalSpecial(u64),
    /// The return-value holding area
    Ret,
    /// An immediate, never tainted
    Const(u64),
}

impl Value {
    /// Where the taint of this operand lives, `None` for immediates.
    #[must_use]
    pub fn address(self) -> Option<Address> {
        match self {
            Value::Local(slot) => Some(make_laddr(slot, 0)),
            Value::GlobalReg(index) => Some(make_greg(index, 0)),
            Value::GlobalSpecial(id) => Some(make_gsv(id)),
            Value::Ret => Some(make_ret(0)),
            Value::Const(_) => None,
        }
    }
}

/// One operation of a code unit. `size` is the operand width in bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IrOp {
    /// `dst = *addr`
    Load { dst: Value, addr: Value, size: u64 },
    /// `*addr = src`
    Store { src: Value, addr: Value, size: u64 },
    /// `dst = src`
    Move { dst: Value, src: Value, size: u64 },
    /// `dst = f(srcs...)` for any arithmetic or logic operation
    Compute {
        dst: Value,
        srcs: Vec<Value>,
        size: u64,
    },
    /// `ret = helper(args...)`
    Call {
        helper: UnitId,
        args: Vec<Value>,
        ret: Option<Value>,
        size: u64,
    },
    /// Returns `src` to the caller
    Return { src: Value, size: u64 },
    /// Anything the lifter emits that has no dedicated variant
    Other {
        name: String,
        dst: Option<Value>,
        srcs: Vec<Value>,
        size: u64,
    },
}

impl IrOp {
    /// The value this operation defines, its inputs, and the operand width.
    ///
    /// Memory is not a value here: a load has no input, a store no output.
    #[must_use]
    pub fn data_flow(&self) -> (Option<Value>, Vec<Value>, u64) {
        match self {
            IrOp::Load { dst, size, .. } => (Some(*dst), Vec::new(), *size),
            IrOp::Store { src, size, .. } => (None, vec![*src], *size),
            IrOp::Move { dst, src, size } => (Some(*dst), vec![*src], *size),
            IrOp::Compute { dst, srcs, size } => (Some(*dst), srcs.clone(), *size),
            IrOp::Call {
                args, ret, size, ..
            } => (*ret, args.clone(), *size),
            IrOp::Return { src, size } => (Some(Value::Ret), vec![*src], *size),
            IrOp::Other {
                dst, srcs, size, ..
            } => (*dst, srcs.clone(), *size),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitKind {
    /// A translated guest block
    Block,
    /// Support code executed inside the emulated environment
    Helper,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeUnit {
    pub id: UnitId,
    pub kind: UnitKind,
    pub pc: GuestAddr,
    pub ops: Vec<IrOp>,
    /// Declared only, the body lives outside the module
    pub declaration: bool,
}

impl CodeUnit {
    #[must_use]
    pub fn block(id: UnitId, pc: GuestAddr, ops: Vec<IrOp>) -> Self {
        Self {
            id,
            kind: UnitKind::Block,
            pc,
            ops,
            declaration: false,
        }
    }

    #[must_use]
    pub fn helper(id: UnitId, ops: Vec<IrOp>) -> Self {
        Self {
            id,
            kind: UnitKind::Helper,
            pc: 0,
            ops,
            declaration: false,
        }
    }

    #[must_use]
    pub fn declaration(id: UnitId) -> Self {
        Self {
            id,
            kind: UnitKind::Helper,
            pc: 0,
            ops: Vec::new(),
            declaration: true,
        }
    }
}

/// All code units known to the host.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IrModule {
    units: BTreeMap<UnitId, CodeUnit>,
}

impl IrModule {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a unit, returning the one it replaces.
    pub fn add(&mut self, unit: CodeUnit) -> Option<CodeUnit> {
        self.units.insert(unit.id, unit)
    }

    pub fn remove(&mut self, id: UnitId) -> Option<CodeUnit> {
        self.units.remove(&id)
    }

    #[must_use]
    pub fn get(&self, id: UnitId) -> Option<&CodeUnit> {
        self.units.get(&id)
    }

    #[must_use]
    pub fn contains(&self, id: UnitId) -> bool {
        self.units.contains_key(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CodeUnit> {
        self.units.values()
    }

    /// Units with a body, blocks and helpers alike.
    pub fn definitions(&self) -> impl Iterator<Item = &CodeUnit> {
        self.units.values().filter(|u| !u.declaration)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.units.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}
