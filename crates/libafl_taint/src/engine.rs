//! # engine
//! The taint engine and its lifecycle.
//!
//! [`TaintEngine`] is the one context object the host drives: it owns the
//! shadow state, the memlog and the installed taint programs, and it is
//! handed to every extension point by `&mut`. Tracking starts [`TaintState::Disabled`],
//! is switched on with [`TaintEngine::enable`] and switched off in two steps:
//! [`TaintEngine::request_disable`] only marks the engine, the teardown happens
//! in [`TaintEngine::after_block_exec`] once the running block is done.
use core::{
    fmt::{self, Debug, Formatter},
    mem,
};

use hashbrown::HashSet;
use log::{debug, error, info, warn};

use crate::{
    config::TaintConfig,
    host::{HookKind, TaintHost},
    instrument::{exec, StdTaintSemantics, TaintPass, TaintSemantics},
    ir::{IrModule, UnitId},
    labels::Label,
    memlog::TaintMemlog,
    records::{EventSink, LogEntry},
    shadow::{ShadowState, TaintObservers},
    Error, GuestAddr, GuestPhysAddr,
};

/// Lifecycle of taint tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, strum_macros::Display)]
pub enum TaintState {
    #[default]
    Disabled,
    /// Setting up, instrumentation not verified yet
    Enabling,
    Enabled,
    /// Disable requested, takes effect at the end of the current block
    DisablePending,
}

pub struct TaintEngine {
    pub(crate) config: TaintConfig,
    pub(crate) state: TaintState,
    pub(crate) shadow: Option<ShadowState>,
    /// Observers registered while no shadow state exists
    pub(crate) parked_observers: TaintObservers,
    pub(crate) memlog: TaintMemlog,
    pub(crate) pass: TaintPass,
    pub(crate) labels_applied: HashSet<Label>,
    pub(crate) sink: Option<Box<dyn EventSink>>,
}

impl Debug for TaintEngine {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaintEngine")
            .field("config", &self.config)
            .field("state", &self.state)
            .field("shadow", &self.shadow.is_some())
            .field("memlog", &self.memlog.len())
            .field("programs", &self.pass.len())
            .field("labels_applied", &self.labels_applied.len())
            .field("sink", &self.sink.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for TaintEngine {
    fn default() -> Self {
        Self::new(TaintConfig::default())
    }
}

impl TaintEngine {
    #[must_use]
    pub fn new(config: TaintConfig) -> Self {
        let semantics = StdTaintSemantics::new(config.tainted_pointer);
        Self {
            pass: TaintPass::new(Box::new(semantics), config.inline, config.optimize),
            config,
            state: TaintState::Disabled,
            shadow: None,
            parked_observers: TaintObservers::new(),
            memlog: TaintMemlog::new(),
            labels_applied: HashSet::new(),
            sink: None,
        }
    }

    #[must_use]
    pub fn config(&self) -> &TaintConfig {
        &self.config
    }

    /// Replaces the propagation rules used for units installed from now on.
    pub fn set_semantics(&mut self, mut semantics: Box<dyn TaintSemantics>) {
        semantics.set_tainted_pointer(self.config.tainted_pointer);
        self.pass.set_semantics(semantics);
    }

    /// Sets up the host, once, before anything else.
    pub fn init<H>(&mut self, host: &mut H)
    where
        H: TaintHost,
    {
        host.set_memory_callbacks(true);
        host.set_block_chaining(false);
        #[cfg(feature = "hypercalls")]
        host.register_hook(HookKind::GuestHypercall);
        host.register_hook(HookKind::AfterBlockExec);
        self.config.log_status();
    }

    /// Tears everything down and hands the host back in its original mode.
    pub fn uninit<H>(&mut self, host: &mut H)
    where
        H: TaintHost,
    {
        if self.shadow.is_some() {
            for hook in HookKind::TRACKING {
                host.unregister_hook(hook);
            }
        }
        self.teardown();
        #[cfg(feature = "hypercalls")]
        host.unregister_hook(HookKind::GuestHypercall);
        host.unregister_hook(HookKind::AfterBlockExec);
        host.set_instrumented_execution(false);
        host.set_memory_callbacks(false);
        host.set_block_chaining(true);
    }

    /// Switches taint tracking on.
    ///
    /// Installs and verifies instrumentation on every unit the host knows.
    ///
    /// # Panics
    /// Panics if the installed instrumentation fails verification.
    pub fn enable<H>(&mut self, host: &mut H)
    where
        H: TaintHost,
    {
        match self.state {
            TaintState::Enabled | TaintState::Enabling => return,
            TaintState::DisablePending => {
                info!("Taint enable requested before pending disable took effect, keeping taint enabled");
                self.state = TaintState::Enabled;
                return;
            }
            TaintState::Disabled => {}
        }
        info!("Enabling taint tracking");
        self.state = TaintState::Enabling;

        for hook in HookKind::TRACKING {
            host.register_hook(hook);
        }
        host.enable_precise_pc();
        if !host.instrumented_execution() {
            host.set_instrumented_execution(true);
        }
        host.set_instrumented_helpers(true);
        host.set_memory_callbacks(true);

        let observers = match self.shadow.take() {
            Some(old) => old.destroy(),
            None => mem::take(&mut self.parked_observers),
        };
        self.shadow = Some(ShadowState::new(&self.config.layout, observers));
        self.labels_applied.clear();
        self.memlog.reset();

        self.pass.clear();
        let module = host.ir_module();
        self.pass.install_all(module);
        self.verify_or_die(module, None);

        info!("Done verifying taint instrumentation, running");
        self.state = TaintState::Enabled;
    }

    fn verify_or_die(&self, module: &IrModule, unit: Option<UnitId>) {
        let res = match unit {
            Some(unit) => self.pass.verify_unit(unit, module, &self.config.layout),
            None => self.pass.verify(module, &self.config.layout),
        };
        if let Err(err) = res {
            error!("{err}");
            panic!("Refusing to run unverified taint instrumentation: {err}");
        }
    }

    /// Asks for taint tracking to stop after the current block.
    pub fn request_disable(&mut self) {
        if self.state == TaintState::Enabled {
            info!("Disabling taint tracking at the end of the current block");
            self.state = TaintState::DisablePending;
        }
    }

    #[must_use]
    pub fn state(&self) -> TaintState {
        self.state
    }

    /// `true` if `unit` has to be retranslated before it runs.
    pub fn before_block_exec_invalidate(&mut self, unit: UnitId) -> bool {
        if self.state != TaintState::Enabled {
            return false;
        }
        self.memlog.reset();
        !self.pass.is_instrumented(unit)
    }

    /// Installs instrumentation on a freshly translated unit.
    ///
    /// # Panics
    /// Panics if the installed instrumentation fails verification.
    pub fn after_block_translate<H>(&mut self, host: &mut H, unit: UnitId)
    where
        H: TaintHost,
    {
        if self.state != TaintState::Enabled {
            return;
        }
        let module = host.ir_module();
        let Some(code) = module.get(unit) else {
            warn!("Translated unit {unit} is missing from the IR module, not instrumenting it");
            return;
        };
        self.pass.install(code);
        self.verify_or_die(module, Some(unit));
    }

    /// Runs the taint program of `unit` against the memory accesses recorded
    /// while it executed.
    pub fn run_block_taint(&mut self, unit: UnitId) -> Result<(), Error> {
        if !matches!(
            self.state,
            TaintState::Enabled | TaintState::DisablePending
        ) {
            return Ok(());
        }
        let res = match (self.pass.program(unit), self.shadow.as_mut()) {
            (Some(program), Some(shadow)) => {
                exec::execute(&program.ops, shadow, &mut self.memlog, self.config.debug)
            }
            (None, _) => {
                debug!("unit {unit} has no taint program");
                Ok(())
            }
            (_, None) => Err(Error::illegal_state("Taint is enabled without a shadow state")),
        };
        self.memlog.reset();
        res
    }

    /// Completes a pending disable.
    pub fn after_block_exec<H>(&mut self, host: &mut H, unit: UnitId)
    where
        H: TaintHost,
    {
        if self.state != TaintState::DisablePending {
            return;
        }
        host.set_instrumented_execution(false);
        host.set_instrumented_helpers(false);
        host.flush_translations();
        host.set_memory_callbacks(false);
        for hook in HookKind::TRACKING {
            host.unregister_hook(hook);
        }
        self.teardown();
        info!(
            "Taint tracking disabled after unit {unit} ({} instructions)",
            host.instr_count()
        );
    }

    fn teardown(&mut self) {
        self.pass.clear();
        self.memlog.reset();
        if let Some(shadow) = self.shadow.take() {
            self.parked_observers = shadow.destroy();
        }
        self.state = TaintState::Disabled;
    }

    pub fn phys_mem_before_read(&mut self, addr: GuestPhysAddr, _size: u64) {
        if self.shadow.is_some() {
            self.memlog.push(addr);
        }
    }

    pub fn phys_mem_before_write(&mut self, addr: GuestPhysAddr, _size: u64) {
        if self.shadow.is_some() {
            self.memlog.push(addr);
        }
    }

    pub fn asid_changed(&mut self, old: GuestAddr, new: GuestAddr) {
        debug!("asid changed from {old:#x} to {new:#x}");
        self.memlog.reset();
    }

    /// The live shadow state.
    pub fn shadow(&self) -> Result<&ShadowState, Error> {
        self.shadow
            .as_ref()
            .ok_or_else(|| Error::illegal_state("Taint tracking is not enabled"))
    }

    pub fn shadow_mut(&mut self) -> Result<&mut ShadowState, Error> {
        self.shadow
            .as_mut()
            .ok_or_else(|| Error::illegal_state("Taint tracking is not enabled"))
    }

    /// Number of taint programs currently installed.
    #[must_use]
    pub fn instrumented_units(&self) -> usize {
        self.pass.len()
    }

    pub(crate) fn emit(&mut self, entry: LogEntry) {
        if let Some(sink) = self.sink.as_mut() {
            if let Err(err) = sink.write_entry(entry) {
                warn!("Could not write taint log entry: {err}");
            }
        }
    }
}
