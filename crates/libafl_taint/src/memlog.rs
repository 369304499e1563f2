//! # memlog
//! Concrete addresses of the memory accesses of the block being executed.
//!
//! The memory hooks push the physical address of every access while the
//! block runs; the propagation executor pops them in the same order to learn
//! where each instrumented load and store went. The log never outlives one
//! block.
use alloc::collections::VecDeque;

use crate::GuestPhysAddr;

#[derive(Debug, Default, Clone)]
pub struct TaintMemlog {
    entries: VecDeque<GuestPhysAddr>,
}

impl TaintMemlog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, addr: GuestPhysAddr) {
        self.entries.push_back(addr);
    }

    /// The oldest address not consumed yet.
    pub fn pop(&mut self) -> Option<GuestPhysAddr> {
        self.entries.pop_front()
    }

    pub fn reset(&mut self) {
        self.entries.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
