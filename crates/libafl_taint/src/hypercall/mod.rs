//! # hypercall
//! The guest control protocol.
//!
//! A guest talks to the taint engine by trapping into the emulator. Commands
//! `7` and `8` label a buffer straight from the trap registers. Any other
//! value of the command register is taken as a pointer to a
//! [`HypercallStruct`] describing a query or an attack point.
use thiserror::Error;

use crate::{GuestReg, GuestVirtAddr};

#[cfg(feature = "hypercalls")]
mod handler;

/// Magic value of every valid [`HypercallStruct`].
pub const HYPERCALL_MAGIC: u32 = 0xabcd;

/// Maximum length of a null-terminated query, and of the data snippet of a
/// query record.
pub const QUERY_HYPERCALL_MAX_LEN: u32 = 32;

/// Maximum length of the attack point info string.
pub const MAX_INFO_LEN: usize = 256;

/// `len` value of a query over a null-terminated buffer.
pub const LEN_NULL_TERMINATED: u32 = 0xffff_ffff;

/// Size in bytes of an encoded [`HypercallStruct`].
pub const HYPERCALL_STRUCT_SIZE: usize = 48;

/// The trap registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrapArgs {
    pub cmd: GuestReg,
    pub arg1: GuestReg,
    pub arg2: GuestReg,
    pub arg3: GuestReg,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, num_enum::TryFromPrimitive, num_enum::IntoPrimitive,
)]
#[repr(u32)]
pub enum HypercallAction {
    LabelSingle = 7,
    LabelPositional = 8,
    Query = 11,
    AttackPoint = 12,
    /// Taint query point of a source-level instrumentation, handled elsewhere
    PriQuery = 13,
    /// Reserved
    Exploitability = 14,
}

impl HypercallAction {
    /// The label command carried directly in the command register, if any.
    #[must_use]
    pub fn from_cmd(cmd: GuestReg) -> Option<Self> {
        match cmd {
            7 => Some(Self::LabelSingle),
            8 => Some(Self::LabelPositional),
            _ => None,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Hypercall struct truncated: got {got} bytes, need 48")]
    Truncated { got: usize },
    #[error("Invalid magic value in hypercall struct: {0:#x} != 0xabcd")]
    BadMagic(u32),
}

/// A request the guest put in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HypercallStruct {
    pub magic: u32,
    pub action: u32,
    pub buf: u32,
    pub len: u32,
    pub label_num: u32,
    pub offset: u32,
    pub src_column: u32,
    pub src_filename: u32,
    pub src_linenum: u32,
    pub src_ast_node_name: u32,
    /// Guest pointer to a NUL-terminated string, `0` if none
    pub info: u32,
    pub insertion_point: u32,
}

struct FieldReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl FieldReader<'_> {
    fn u32(&mut self) -> Result<u32, DecodeError> {
        let field = self
            .bytes
            .get(self.pos..self.pos + 4)
            .ok_or(DecodeError::Truncated {
                got: self.bytes.len(),
            })?;
        self.pos += 4;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(field);
        Ok(u32::from_le_bytes(raw))
    }
}

impl HypercallStruct {
    /// Decodes the little-endian wire form.
    ///
    /// The magic is checked before any other field is looked at.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut r = FieldReader { bytes, pos: 0 };
        let magic = r.u32()?;
        if magic != HYPERCALL_MAGIC {
            return Err(DecodeError::BadMagic(magic));
        }
        if bytes.len() < HYPERCALL_STRUCT_SIZE {
            return Err(DecodeError::Truncated { got: bytes.len() });
        }
        Ok(Self {
            magic,
            action: r.u32()?,
            buf: r.u32()?,
            len: r.u32()?,
            label_num: r.u32()?,
            offset: r.u32()?,
            src_column: r.u32()?,
            src_filename: r.u32()?,
            src_linenum: r.u32()?,
            src_ast_node_name: r.u32()?,
            info: r.u32()?,
            insertion_point: r.u32()?,
        })
    }

    /// Encodes the little-endian wire form.
    #[must_use]
    pub fn encode(&self) -> [u8; HYPERCALL_STRUCT_SIZE] {
        let fields = [
            self.magic,
            self.action,
            self.buf,
            self.len,
            self.label_num,
            self.offset,
            self.src_column,
            self.src_filename,
            self.src_linenum,
            self.src_ast_node_name,
            self.info,
            self.insertion_point,
        ];
        let mut out = [0u8; HYPERCALL_STRUCT_SIZE];
        for (chunk, field) in out.chunks_exact_mut(4).zip(fields) {
            chunk.copy_from_slice(&field.to_le_bytes());
        }
        out
    }

    /// The requested action, `None` if unknown.
    #[must_use]
    pub fn action(&self) -> Option<HypercallAction> {
        HypercallAction::try_from(self.action).ok()
    }

    #[must_use]
    pub fn is_null_terminated(&self) -> bool {
        self.len == LEN_NULL_TERMINATED
    }

    #[must_use]
    pub fn buf_addr(&self) -> GuestVirtAddr {
        GuestVirtAddr::from(self.buf)
    }
}
