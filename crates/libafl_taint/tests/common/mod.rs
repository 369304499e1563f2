#![allow(dead_code)]

use std::collections::{HashMap, HashSet};

use libafl_taint::{
    error::HostError,
    host::{HookKind, TaintHost},
    hypercall::{HypercallStruct, TrapArgs, HYPERCALL_MAGIC},
    ir::{CodeUnit, IrModule},
    GuestAddr, GuestPhysAddr, GuestVirtAddr,
};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// An emulator made of hash maps.
#[derive(Debug, Default)]
pub struct TestHost {
    pub hooks: HashSet<HookKind>,
    pub precise_pc: bool,
    pub instrumented: bool,
    pub helpers: bool,
    pub memory_callbacks: bool,
    pub block_chaining: bool,
    pub flushes: usize,
    pub module: IrModule,
    /// virtual address -> (physical address, value)
    pub memory: HashMap<GuestVirtAddr, (GuestPhysAddr, u8)>,
    pub trap: TrapArgs,
    pub stack: Vec<GuestAddr>,
}

impl TestHost {
    pub fn new() -> Self {
        Self {
            block_chaining: true,
            ..Self::default()
        }
    }

    pub fn with_units(units: Vec<CodeUnit>) -> Self {
        let mut host = Self::new();
        for unit in units {
            host.module.add(unit);
        }
        host
    }

    /// Maps `bytes` at `vaddr`, backed by physical memory at `paddr`.
    pub fn map(&mut self, vaddr: GuestVirtAddr, paddr: GuestPhysAddr, bytes: &[u8]) {
        for (i, byte) in (0..).zip(bytes) {
            self.memory.insert(vaddr + i, (paddr + i, *byte));
        }
    }

    /// Puts a hypercall struct at `vaddr` and points the command register at it.
    pub fn place_struct(&mut self, vaddr: GuestVirtAddr, paddr: GuestPhysAddr, phs: &HypercallStruct) {
        self.map(vaddr, paddr, &phs.encode());
        self.trap = TrapArgs {
            cmd: vaddr,
            ..TrapArgs::default()
        };
    }
}

pub fn request(action: u32, buf: u32, len: u32) -> HypercallStruct {
    HypercallStruct {
        magic: HYPERCALL_MAGIC,
        action,
        buf,
        len,
        ..HypercallStruct::default()
    }
}

impl TaintHost for TestHost {
    fn register_hook(&mut self, hook: HookKind) {
        assert!(self.hooks.insert(hook), "hook {hook} registered twice");
    }

    fn unregister_hook(&mut self, hook: HookKind) {
        self.hooks.remove(&hook);
    }

    fn enable_precise_pc(&mut self) {
        self.precise_pc = true;
    }

    fn instrumented_execution(&self) -> bool {
        self.instrumented
    }

    fn set_instrumented_execution(&mut self, enabled: bool) {
        self.instrumented = enabled;
    }

    fn set_instrumented_helpers(&mut self, enabled: bool) {
        self.helpers = enabled;
    }

    fn flush_translations(&mut self) {
        self.flushes += 1;
    }

    fn set_memory_callbacks(&mut self, enabled: bool) {
        self.memory_callbacks = enabled;
    }

    fn set_block_chaining(&mut self, enabled: bool) {
        self.block_chaining = enabled;
    }

    fn ir_module(&self) -> &IrModule {
        &self.module
    }

    fn virt_to_phys(&self, vaddr: GuestVirtAddr) -> Option<GuestPhysAddr> {
        self.memory.get(&vaddr).map(|(pa, _)| *pa)
    }

    fn read_virt(&self, vaddr: GuestVirtAddr, buf: &mut [u8]) -> Result<(), HostError> {
        let len = buf.len();
        for (i, out) in (0..).zip(buf.iter_mut()) {
            let (_, byte) = self
                .memory
                .get(&(vaddr + i))
                .ok_or(HostError::Read { addr: vaddr, len })?;
            *out = *byte;
        }
        Ok(())
    }

    fn trap_args(&self) -> Result<TrapArgs, HostError> {
        Ok(self.trap)
    }

    fn call_stack(&self) -> Vec<GuestAddr> {
        self.stack.clone()
    }
}
