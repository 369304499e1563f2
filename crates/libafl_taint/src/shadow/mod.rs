//! # shadow
//! The shadow memory container.
//!
//! A [`ShadowState`] owns one storage per [`RegionId`] and is the only place
//! label-sets get written. Every successful write is reported to the
//! registered [`TaintChangeObserver`]s, which learn what changed but not the
//! new labels.
use core::fmt::{self, Debug, Formatter};

use log::trace;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    addr::{Address, RegionId, GUEST_REG_SIZE, MAX_REG_SIZE},
    labels::{Label, LabelSet},
    Error,
};

pub mod storage;
pub use storage::{FlatShadow, ShadowStorage, SparseShadow};

/// Longest extent a single shadow access may cover.
pub const MAX_EXTENT_LEN: u64 = 1 << 20;

/// Sizes of the fixed shadow regions. Physical memory is always unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TypedBuilder, Serialize, Deserialize)]
pub struct ShadowLayout {
    /// Number of IR scratch registers per invocation.
    #[builder(default = 5000)]
    pub locals: u64,
    /// Number of general-purpose guest registers.
    #[builder(default = 16)]
    pub regs: u64,
    /// Size in bytes of the special-value area.
    #[builder(default = 4096)]
    pub specials: u64,
}

impl Default for ShadowLayout {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ShadowLayout {
    /// Size in bytes of `region`, `None` if unbounded.
    #[must_use]
    pub fn region_size(&self, region: RegionId) -> Option<u64> {
        match region {
            RegionId::Ram => None,
            RegionId::Llv => Some(self.locals.saturating_mul(MAX_REG_SIZE)),
            RegionId::Grv => Some(self.regs.saturating_mul(GUEST_REG_SIZE)),
            RegionId::Gsv => Some(self.specials),
            RegionId::Ret => Some(MAX_REG_SIZE),
        }
    }
}

/// Gets told about every change of the shadow state.
pub trait TaintChangeObserver {
    /// `len` bytes starting at `addr` got new label-sets.
    fn on_taint_change(&mut self, addr: Address, len: u64);
}

impl<F> TaintChangeObserver for F
where
    F: FnMut(Address, u64),
{
    fn on_taint_change(&mut self, addr: Address, len: u64) {
        self(addr, len);
    }
}

/// The registered observers, in registration order.
#[derive(Default)]
pub struct TaintObservers {
    observers: Vec<Box<dyn TaintChangeObserver>>,
    track_taint_state: bool,
}

impl Debug for TaintObservers {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaintObservers")
            .field("observers", &self.observers.len())
            .field("track_taint_state", &self.track_taint_state)
            .finish()
    }
}

impl TaintObservers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an observer and turns notification on.
    pub fn add<O>(&mut self, observer: O)
    where
        O: TaintChangeObserver + 'static,
    {
        self.observers.push(Box::new(observer));
        self.track_taint_state = true;
    }

    #[must_use]
    pub fn track_taint_state(&self) -> bool {
        self.track_taint_state
    }

    pub fn set_track_taint_state(&mut self, track: bool) {
        self.track_taint_state = track;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.observers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    fn notify(&mut self, addr: Address, len: u64) {
        if !self.track_taint_state {
            return;
        }
        for observer in &mut self.observers {
            observer.on_taint_change(addr, len);
        }
    }
}

/// All five shadow regions of one taint session.
#[derive(Debug)]
pub struct ShadowState {
    ram: SparseShadow,
    llv: FlatShadow,
    grv: FlatShadow,
    gsv: FlatShadow,
    ret: FlatShadow,
    observers: TaintObservers,
}

impl ShadowState {
    #[must_use]
    pub fn new(layout: &ShadowLayout, observers: TaintObservers) -> Self {
        let flat = |region| {
            FlatShadow::new(
                layout
                    .region_size(region)
                    .and_then(|size| usize::try_from(size).ok())
                    .unwrap_or_default(),
            )
        };
        Self {
            ram: SparseShadow::new(),
            llv: flat(RegionId::Llv),
            grv: flat(RegionId::Grv),
            gsv: flat(RegionId::Gsv),
            ret: flat(RegionId::Ret),
            observers,
        }
    }

    /// Releases all regions and hands back the observers for the next session.
    #[must_use]
    pub fn destroy(self) -> TaintObservers {
        self.observers
    }

    #[must_use]
    pub fn region(&self, region: RegionId) -> &dyn ShadowStorage {
        match region {
            RegionId::Ram => &self.ram,
            RegionId::Llv => &self.llv,
            RegionId::Grv => &self.grv,
            RegionId::Gsv => &self.gsv,
            RegionId::Ret => &self.ret,
        }
    }

    fn region_mut(&mut self, region: RegionId) -> &mut dyn ShadowStorage {
        match region {
            RegionId::Ram => &mut self.ram,
            RegionId::Llv => &mut self.llv,
            RegionId::Grv => &mut self.grv,
            RegionId::Gsv => &mut self.gsv,
            RegionId::Ret => &mut self.ret,
        }
    }

    #[must_use]
    pub fn observers(&self) -> &TaintObservers {
        &self.observers
    }

    pub fn observers_mut(&mut self) -> &mut TaintObservers {
        &mut self.observers
    }

    /// Whether `len` bytes at `addr` can be stored.
    #[must_use]
    pub fn fits(&self, addr: Address, len: u64) -> bool {
        len <= MAX_EXTENT_LEN
            && addr.is_canonical()
            && self.region(addr.region()).fits(addr.offset(), len)
    }

    /// The label-sets of `len` bytes starting at `addr`, at most
    /// [`MAX_EXTENT_LEN`] of them.
    ///
    /// Bytes without backing storage, out of the region or behind a
    /// non-canonical address are untainted.
    #[must_use]
    pub fn read(&self, addr: Address, len: u64) -> Vec<LabelSet> {
        let len = len.min(MAX_EXTENT_LEN);
        if !addr.is_canonical() {
            return (0..len).map(|_| LabelSet::new()).collect();
        }
        let region = self.region(addr.region());
        let base = addr.offset();
        (0..len)
            .map(|i| {
                base.checked_add(i)
                    .map(|off| region.get(off).clone())
                    .unwrap_or_default()
            })
            .collect()
    }

    /// The label-set of the byte at `addr`.
    #[must_use]
    pub fn query(&self, addr: Address) -> LabelSet {
        if !addr.is_canonical() {
            return LabelSet::new();
        }
        self.region(addr.region()).get(addr.offset()).clone()
    }

    /// Replaces the label-sets of `labels.len()` bytes starting at `addr`.
    pub fn write(&mut self, addr: Address, labels: &[LabelSet]) -> Result<(), Error> {
        let len = labels.len() as u64;
        if len == 0 {
            return Ok(());
        }
        if !self.fits(addr, len) {
            return Err(Error::out_of_bounds(addr, len));
        }
        let base = addr.offset();
        let region = self.region_mut(addr.region());
        for (i, labels) in (0..).zip(labels) {
            region.set(base + i, labels.clone());
        }
        trace!("shadow write - addr: {addr}, len: {len:#x}");
        self.observers
            .notify(Address::from_region(addr.region(), base), len);
        Ok(())
    }

    /// Sets every byte of the extent to the same label-set.
    pub fn fill(&mut self, addr: Address, len: u64, labels: &LabelSet) -> Result<(), Error> {
        if len == 0 {
            return Ok(());
        }
        if !self.fits(addr, len) {
            return Err(Error::out_of_bounds(addr, len));
        }
        let base = addr.offset();
        let region = self.region_mut(addr.region());
        for i in 0..len {
            region.set(base + i, labels.clone());
        }
        trace!("shadow fill - addr: {addr}, len: {len:#x}");
        self.observers
            .notify(Address::from_region(addr.region(), base), len);
        Ok(())
    }

    /// Adds `label` to the byte at `addr`.
    pub fn label(&mut self, addr: Address, label: Label) -> Result<(), Error> {
        let mut labels = self.query(addr);
        labels.insert(label);
        self.write(addr, &[labels])
    }

    /// Untaints `len` bytes starting at `addr`.
    pub fn delete(&mut self, addr: Address, len: u64) -> Result<(), Error> {
        self.fill(addr, len, &LabelSet::new())
    }

    /// Number of tainted bytes in `region`.
    #[must_use]
    pub fn tainted_bytes(&self, region: RegionId) -> usize {
        self.region(region).tainted_bytes()
    }
}

#[cfg(test)]
mod tests {
    use alloc::rc::Rc;
    use core::cell::RefCell;

    use super::*;
    use crate::addr::{make_greg, make_gsv, make_laddr, make_maddr, make_ret};

    fn shadow() -> ShadowState {
        ShadowState::new(&ShadowLayout::default(), TaintObservers::new())
    }

    #[test]
    fn test_fresh_state_is_untainted() {
        let shadow = shadow();
        for addr in [
            make_maddr(0xdead_beef),
            make_laddr(4999, 15),
            make_greg(15, 7),
            make_gsv(4095),
            make_ret(15),
        ] {
            assert!(shadow.read(addr, 1)[0].is_empty());
            assert!(shadow.query(addr).is_empty());
        }
    }

    #[test]
    fn test_write_read_roundtrip() {
        let mut shadow = shadow();
        let labels = vec![
            LabelSet::singleton(1),
            LabelSet::new(),
            [2, 3].into_iter().collect(),
        ];
        shadow.write(make_laddr(3, 14), &labels).unwrap();
        assert_eq!(shadow.read(make_laddr(3, 14), 3), labels);
        // The extent spills into the next slot.
        assert!(shadow.query(make_laddr(4, 0)).contains(3));
    }

    #[test]
    fn test_regions_do_not_alias() {
        let mut shadow = shadow();
        shadow.label(make_maddr(1), 7).unwrap();
        for addr in [make_laddr(0, 1), make_greg(0, 1), make_gsv(1), make_ret(1)] {
            assert!(shadow.query(addr).is_empty());
        }
        shadow.label(make_ret(1), 8).unwrap();
        assert_eq!(shadow.query(make_maddr(1)), LabelSet::singleton(7));
    }

    #[test]
    fn test_out_of_bounds_write() {
        let mut shadow = shadow();
        assert!(matches!(
            shadow.fill(make_ret(8), 9, &LabelSet::singleton(1)),
            Err(Error::OutOfBounds { region: RegionId::Ret, .. })
        ));
        assert!(shadow.label(make_laddr(0, MAX_REG_SIZE), 1).is_err());
        assert_eq!(shadow.tainted_bytes(RegionId::Ret), 0);
    }

    #[test]
    fn test_huge_extents_are_refused() {
        let mut shadow = shadow();
        shadow.label(make_maddr(0), 1).unwrap();
        assert!(matches!(
            shadow.delete(make_maddr(0), u64::MAX),
            Err(Error::OutOfBounds { region: RegionId::Ram, .. })
        ));
        assert!(shadow
            .fill(make_maddr(0), MAX_EXTENT_LEN + 1, &LabelSet::singleton(2))
            .is_err());
        assert_eq!(shadow.query(make_maddr(0)), LabelSet::singleton(1));

        assert_eq!(shadow.read(make_maddr(0), u64::MAX).len() as u64, MAX_EXTENT_LEN);
        assert_eq!(shadow.read(make_greg(u64::MAX, 0), u64::MAX).len() as u64, MAX_EXTENT_LEN);
    }

    #[test]
    fn test_layout_sizes_saturate() {
        let layout = ShadowLayout::builder().locals(u64::MAX).regs(u64::MAX).build();
        assert_eq!(layout.region_size(RegionId::Llv), Some(u64::MAX));
        assert_eq!(layout.region_size(RegionId::Grv), Some(u64::MAX));
        assert_eq!(layout.region_size(RegionId::Ram), None);
    }

    #[test]
    fn test_notification() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut observers = TaintObservers::new();
        let log = Rc::clone(&seen);
        observers.add(move |addr, len| log.borrow_mut().push((addr, len)));

        let mut shadow = ShadowState::new(&ShadowLayout::default(), observers);
        shadow
            .fill(make_maddr(0x100), 4, &LabelSet::singleton(1))
            .unwrap();
        shadow.write(make_laddr(0, 0), &[]).unwrap();
        shadow.observers_mut().set_track_taint_state(false);
        shadow.label(make_maddr(0x200), 1).unwrap();

        assert_eq!(*seen.borrow(), vec![(make_maddr(0x100), 4)]);
    }
}
