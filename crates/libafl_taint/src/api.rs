//! # api
//! Programmatic access to the taint state, for other analyses running next
//! to the engine.
//!
//! Everything that touches shadow memory fails with
//! [`Error::IllegalState`] while tracking is disabled.
use crate::{
    addr::{make_greg, make_laddr, make_maddr, make_ret, Address, GUEST_REG_SIZE},
    engine::{TaintEngine, TaintState},
    host::TaintHost,
    labels::{Label, LabelSet},
    records::EventSink,
    shadow::TaintChangeObserver,
    Error, GuestPhysAddr, GuestVirtAddr,
};

/// Longest guest-virtual buffer a single label request may cover.
pub const MAX_LABEL_LEN: u64 = u32::MAX as u64;

fn check_label_len(len: u64) -> Result<(), Error> {
    if len > MAX_LABEL_LEN {
        return Err(Error::illegal_argument(format!(
            "Refusing to label {len:#x} bytes, at most {MAX_LABEL_LEN:#x} per request"
        )));
    }
    Ok(())
}

impl TaintEngine {
    /// Whether taint is live. Stays `true` until a pending disable completes.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        matches!(
            self.state,
            TaintState::Enabled | TaintState::DisablePending
        )
    }

    /// Propagates taint through pointer dereference in units installed from now on.
    pub fn enable_tainted_pointer(&mut self) {
        self.config.tainted_pointer = true;
        self.pass.semantics_mut().set_tainted_pointer(true);
    }

    /// Number of distinct labels applied since taint was enabled.
    #[must_use]
    pub fn num_labels_applied(&self) -> usize {
        self.labels_applied.len()
    }

    /// Adds `label` to the byte at `addr`.
    pub fn label(&mut self, addr: Address, label: Label) -> Result<(), Error> {
        self.shadow_mut()?.label(addr, label)?;
        self.labels_applied.insert(label);
        Ok(())
    }

    pub fn label_ram(&mut self, pa: GuestPhysAddr, label: Label) -> Result<(), Error> {
        self.label(make_maddr(pa), label)
    }

    pub fn label_reg(&mut self, reg: u64, offset: u64, label: Label) -> Result<(), Error> {
        self.label(make_greg(reg, offset), label)
    }

    /// Labels `len` bytes of guest-virtual memory with the same label.
    ///
    /// Unmapped bytes are skipped. Returns the number of bytes labeled.
    pub fn label_ram_virt_single<H>(
        &mut self,
        host: &H,
        vaddr: GuestVirtAddr,
        len: u64,
        label: Label,
    ) -> Result<u64, Error>
    where
        H: TaintHost,
    {
        self.shadow()?;
        check_label_len(len)?;
        let mut labeled = 0;
        for i in 0..len {
            if let Some(pa) = host.virt_to_phys(vaddr.wrapping_add(i)) {
                self.label_ram(pa, label)?;
                labeled += 1;
            }
        }
        Ok(labeled)
    }

    /// Labels byte `i` of `len` bytes of guest-virtual memory with `base + i`.
    ///
    /// The whole request is rejected if the last label does not fit a [`Label`].
    pub fn label_ram_virt_positional<H>(
        &mut self,
        host: &H,
        vaddr: GuestVirtAddr,
        len: u64,
        base: Label,
    ) -> Result<u64, Error>
    where
        H: TaintHost,
    {
        self.shadow()?;
        check_label_len(len)?;
        if len == 0 {
            return Ok(0);
        }
        let label_at = |i: u64| u32::try_from(i).ok().and_then(|i| base.checked_add(i));
        if label_at(len - 1).is_none() {
            return Err(Error::illegal_argument(format!(
                "Positional labels starting at {base} overflow for {len:#x} bytes"
            )));
        }
        let mut labeled = 0;
        for i in 0..len {
            let (Some(pa), Some(label)) = (host.virt_to_phys(vaddr.wrapping_add(i)), label_at(i))
            else {
                continue;
            };
            self.label_ram(pa, label)?;
            labeled += 1;
        }
        Ok(labeled)
    }

    /// Number of labels on the byte at `addr`, `0` if untainted.
    pub fn query(&self, addr: Address) -> Result<usize, Error> {
        Ok(self.shadow()?.query(addr).len())
    }

    pub fn query_labels(&self, addr: Address) -> Result<LabelSet, Error> {
        Ok(self.shadow()?.query(addr))
    }

    pub fn query_ram(&self, pa: GuestPhysAddr) -> Result<usize, Error> {
        self.query(make_maddr(pa))
    }

    pub fn query_reg(&self, reg: u64, offset: u64) -> Result<usize, Error> {
        self.query(make_greg(reg, offset))
    }

    pub fn query_laddr(&self, slot: u64, offset: u64) -> Result<usize, Error> {
        self.query(make_laddr(slot, offset))
    }

    pub fn query_ret(&self, offset: u64) -> Result<usize, Error> {
        self.query(make_ret(offset))
    }

    /// The labels of the physical byte at `pa`, ascending.
    pub fn query_labels_ram(&self, pa: GuestPhysAddr) -> Result<Vec<Label>, Error> {
        Ok(self.query_labels(make_maddr(pa))?.to_vec())
    }

    pub fn delete_ram(&mut self, pa: GuestPhysAddr) -> Result<(), Error> {
        self.shadow_mut()?.delete(make_maddr(pa), 1)
    }

    /// Untaints every byte of register `reg`.
    pub fn delete_reg(&mut self, reg: u64) -> Result<(), Error> {
        self.shadow_mut()?.delete(make_greg(reg, 0), GUEST_REG_SIZE)
    }

    /// Registers an observer of every taint change, and turns notification on.
    ///
    /// Observers survive disable and re-enable.
    pub fn add_taint_change_observer<O>(&mut self, observer: O)
    where
        O: TaintChangeObserver + 'static,
    {
        match self.shadow.as_mut() {
            Some(shadow) => shadow.observers_mut().add(observer),
            None => self.parked_observers.add(observer),
        }
    }

    pub fn set_track_taint_state(&mut self, track: bool) {
        match self.shadow.as_mut() {
            Some(shadow) => shadow.observers_mut().set_track_taint_state(track),
            None => self.parked_observers.set_track_taint_state(track),
        }
    }

    /// Installs the sink query and attack point records go to, returning the old one.
    pub fn set_event_sink<S>(&mut self, sink: S) -> Option<Box<dyn EventSink>>
    where
        S: EventSink + 'static,
    {
        self.sink.replace(Box::new(sink))
    }

    pub fn take_event_sink(&mut self) -> Option<Box<dyn EventSink>> {
        self.sink.take()
    }
}
