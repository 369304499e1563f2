//! # host
//! The services the taint engine needs from the emulator it runs in.
//!
//! The engine never talks to the emulator directly. Everything it needs, from
//! hook registration to guest memory reads, goes through a [`TaintHost`], so
//! the same engine drives a real emulator or an in-memory test double.
use core::fmt::Debug;

use crate::{
    error::HostError, hypercall::TrapArgs, ir::IrModule, GuestAddr, GuestPhysAddr, GuestVirtAddr,
};

/// The host extension points the engine registers for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
pub enum HookKind {
    /// Decide whether a block has to be retranslated before it runs
    BeforeBlockExecInvalidate,
    /// A physical memory read is about to happen
    PhysMemBeforeRead,
    /// A physical memory write is about to happen
    PhysMemBeforeWrite,
    /// The guest switched address space
    AsidChanged,
    /// A block finished executing
    AfterBlockExec,
    /// The guest trapped into the emulator
    GuestHypercall,
}

impl HookKind {
    /// The hooks only needed while taint tracking is enabled.
    pub const TRACKING: [HookKind; 4] = [
        HookKind::BeforeBlockExecInvalidate,
        HookKind::PhysMemBeforeRead,
        HookKind::PhysMemBeforeWrite,
        HookKind::AsidChanged,
    ];
}

/// The emulator, as seen by the taint engine.
pub trait TaintHost: Debug {
    fn register_hook(&mut self, hook: HookKind);

    fn unregister_hook(&mut self, hook: HookKind);

    /// Keeps the guest program counter exact at every instruction.
    fn enable_precise_pc(&mut self);

    /// Whether blocks are translated to the rewritable IR and run instrumented.
    fn instrumented_execution(&self) -> bool;

    fn set_instrumented_execution(&mut self, enabled: bool);

    /// Whether helper routines run through the IR as well.
    fn set_instrumented_helpers(&mut self, enabled: bool);

    /// Drops every cached translation.
    fn flush_translations(&mut self);

    fn set_memory_callbacks(&mut self, enabled: bool);

    fn set_block_chaining(&mut self, enabled: bool);

    /// All code units lifted so far.
    fn ir_module(&self) -> &IrModule;

    fn virt_to_phys(&self, vaddr: GuestVirtAddr) -> Option<GuestPhysAddr>;

    fn read_virt(&self, vaddr: GuestVirtAddr, buf: &mut [u8]) -> Result<(), HostError>;

    /// The registers carrying the arguments of the trap being serviced.
    fn trap_args(&self) -> Result<TrapArgs, HostError>;

    /// Return addresses of the current guest call stack, innermost first.
    fn call_stack(&self) -> Vec<GuestAddr>;

    fn instr_count(&self) -> u64 {
        0
    }

    /// Reads one guest byte, `0` if it cannot be read.
    fn read_byte_lossy(&self, vaddr: GuestVirtAddr) -> u8 {
        let mut byte = [0u8];
        match self.read_virt(vaddr, &mut byte) {
            Ok(()) => byte[0],
            Err(_) => 0,
        }
    }
}
