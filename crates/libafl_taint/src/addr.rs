//! # addr
//! The unified address model of the taint engine.
//!
//! Every location that can carry taint is named by one [`Address`]. The five
//! variants live in five disjoint shadow regions, so two addresses with the
//! same numeric coordinates but different tags never share storage.

use core::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::GuestPhysAddr;

/// Width, in bytes, of one intermediate-representation scratch register.
pub const MAX_REG_SIZE: u64 = 16;

/// Width, in bytes, of one architectural general-purpose register.
pub const GUEST_REG_SIZE: u64 = 8;

/// The five shadow regions.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum_macros::Display,
)]
#[strum(serialize_all = "lowercase")]
pub enum RegionId {
    /// Physical memory
    Ram,
    /// Per-invocation scratch registers of the IR
    Llv,
    /// General-purpose guest registers
    Grv,
    /// Special guest values (flags, condition codes, ...)
    Gsv,
    /// The return-value holding area
    Ret,
}

impl RegionId {
    pub const ALL: [RegionId; 5] = [
        RegionId::Ram,
        RegionId::Llv,
        RegionId::Grv,
        RegionId::Gsv,
        RegionId::Ret,
    ];
}

/// One taint-addressable byte (or the first byte of an extent).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Address {
    /// A physical byte address.
    Ram(GuestPhysAddr),
    /// A byte inside the scratch register `slot` of the current IR invocation.
    Local { slot: u64, offset: u64 },
    /// A byte inside the general-purpose register `index`.
    GlobalReg { index: u64, offset: u64 },
    /// A special value, identified by its byte offset in the special-value area.
    GlobalSpecial(u64),
    /// A byte inside the return-value holding area.
    Ret(u64),
}

#[must_use]
pub fn make_maddr(pa: GuestPhysAddr) -> Address {
    Address::Ram(pa)
}

#[must_use]
pub fn make_laddr(slot: u64, offset: u64) -> Address {
    Address::Local { slot, offset }
}

#[must_use]
pub fn make_greg(index: u64, offset: u64) -> Address {
    Address::GlobalReg { index, offset }
}

#[must_use]
pub fn make_gsv(id: u64) -> Address {
    Address::GlobalSpecial(id)
}

#[must_use]
pub fn make_ret(offset: u64) -> Address {
    Address::Ret(offset)
}

/// The shadow region an [`Address`] lives in.
#[must_use]
pub fn region_of(addr: Address) -> RegionId {
    match addr {
        Address::Ram(_) => RegionId::Ram,
        Address::Local { .. } => RegionId::Llv,
        Address::GlobalReg { .. } => RegionId::Grv,
        Address::GlobalSpecial(_) => RegionId::Gsv,
        Address::Ret(_) => RegionId::Ret,
    }
}

/// The byte offset of an [`Address`] inside its shadow region.
///
/// Only meaningful for canonical addresses, see [`Address::is_canonical`].
#[must_use]
pub fn offset_of(addr: Address) -> u64 {
    match addr {
        Address::Ram(pa) => pa,
        Address::Local { slot, offset } => slot.wrapping_mul(MAX_REG_SIZE).wrapping_add(offset),
        Address::GlobalReg { index, offset } => {
            index.wrapping_mul(GUEST_REG_SIZE).wrapping_add(offset)
        }
        Address::GlobalSpecial(id) => id,
        Address::Ret(offset) => offset,
    }
}

impl Address {
    #[must_use]
    pub fn region(self) -> RegionId {
        region_of(self)
    }

    #[must_use]
    pub fn offset(self) -> u64 {
        offset_of(self)
    }

    /// Whether the sub-register offset fits the register it names.
    ///
    /// A non-canonical address would otherwise alias a byte of the next slot.
    #[must_use]
    pub fn is_canonical(self) -> bool {
        match self {
            Address::Local { slot, offset } => {
                offset < MAX_REG_SIZE && slot.checked_mul(MAX_REG_SIZE).is_some()
            }
            Address::GlobalReg { index, offset } => {
                offset < GUEST_REG_SIZE && index.checked_mul(GUEST_REG_SIZE).is_some()
            }
            Address::Ret(offset) => offset < MAX_REG_SIZE,
            Address::Ram(_) | Address::GlobalSpecial(_) => true,
        }
    }

    /// Rebuilds the canonical [`Address`] of byte `offset` in `region`.
    #[must_use]
    pub fn from_region(region: RegionId, offset: u64) -> Self {
        match region {
            RegionId::Ram => make_maddr(offset),
            RegionId::Llv => make_laddr(offset / MAX_REG_SIZE, offset % MAX_REG_SIZE),
            RegionId::Grv => make_greg(offset / GUEST_REG_SIZE, offset % GUEST_REG_SIZE),
            RegionId::Gsv => make_gsv(offset),
            RegionId::Ret => make_ret(offset),
        }
    }

    /// The address `n` bytes further in the same region.
    #[must_use]
    pub fn add(self, n: u64) -> Self {
        Self::from_region(self.region(), self.offset().wrapping_add(n))
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ram(pa) => write!(f, "ram[{pa:#x}]"),
            Address::Local { slot, offset } => write!(f, "llv[{slot}+{offset}]"),
            Address::GlobalReg { index, offset } => write!(f, "grv[{index}+{offset}]"),
            Address::GlobalSpecial(id) => write!(f, "gsv[{id:#x}]"),
            Address::Ret(offset) => write!(f, "ret[{offset}]"),
        }
    }
}
