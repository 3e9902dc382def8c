//! Engine / event bus: fixed-order dispatch of host-emulator events to the
//! internal subscribers and to plugins, with veto and cancellation (spec
//! §4.6, §5). Grounded on `Prophet/engine.cpp`'s dispatch shape.

use crate::disasm::{Disassembler, InstMem};
use crate::host::{ApiInfoTable, InstructionDecoder, ProcessorView};
use crate::taint::TaintEngine;
use crate::trace::{ExecFlags, MemAccess, RunTrace};

/// The event kinds the host emulator raises, per spec §4.6/§6.
#[derive(Debug, Clone, Copy)]
pub enum EventKind {
    PreExecute,
    PostExecute,
    MemRead { addr: u32, len: u8, val: u32 },
    MemWrite { addr: u32, len: u8, val: u32 },
    ProcessPreLoad,
    ProcessPostLoad,
    ProcessPreRun,
    ProcessPostRun,
    Terminate,
}

/// One dispatched event. `eip`/`proc_entry` are the addresses the fixed
/// internal subscribers need; `inst` is filled in once the disassembler
/// subscriber has run.
pub struct Event {
    pub kind: EventKind,
    pub eip: u32,
    pub proc_entry: u32,
    vetoed: bool,
}

impl Event {
    pub fn new(kind: EventKind, eip: u32, proc_entry: u32) -> Self {
        Event {
            kind,
            eip,
            proc_entry,
            vetoed: false,
        }
    }

    /// Called by a plugin during the pre-veto pass to stop propagation.
    pub fn veto(&mut self) {
        self.vetoed = true;
    }

    pub fn is_vetoed(&self) -> bool {
        self.vetoed
    }
}

/// Plugin API (spec §6): every hook is optional, defaulted to a no-op, so
/// implementors override only what they care about.
pub trait Plugin {
    fn name(&self) -> &str;

    fn initialize(&mut self) -> bool {
        true
    }

    fn cleanup(&mut self) {}

    /// Pre-veto pass: may call `event.veto()`. Runs before the fixed
    /// internal subscriber chain.
    fn on_event_pre(&mut self, _event: &mut Event) {}

    /// Observation-only pass, after the internal subscriber chain (unless
    /// vetoed).
    fn on_event_post(&mut self, _event: &Event) {}
}

/// Running statistics the `statistics` internal subscriber accumulates.
/// Kept minimal: instruction and memory-op counters, grounded on the
/// spec's naming the subscriber without specifying its fields further.
#[derive(Debug, Default, Clone)]
pub struct Statistics {
    pub instructions_executed: u64,
    pub mem_reads: u64,
    pub mem_writes: u64,
}

/// Owns the Disassembler's backing store, the taint engine, the trace
/// buffer and registered plugins, and drives fixed-order dispatch on each
/// event (spec §4.6). The host emulator is the caller; the engine never
/// calls back into it except through the `ProcessorView`/`InstructionDecoder`
/// /`ApiInfoTable` trait objects passed at each dispatch call, per spec §9's
/// redesign note against the Disassembler/Debugger ownership cycle.
pub struct Engine {
    pub mem: InstMem,
    pub taint: TaintEngine,
    pub trace: RunTrace,
    pub stats: Statistics,
    plugins: Vec<Box<dyn Plugin>>,
    enabled: bool,
}

impl Engine {
    pub fn new(taint: TaintEngine, trace: RunTrace) -> Self {
        Engine {
            mem: InstMem::new(),
            taint,
            trace,
            stats: Statistics::default(),
            plugins: Vec::new(),
            enabled: true,
        }
    }

    /// Registers a plugin, running its `initialize` hook immediately. Per
    /// spec §7, init failure is logged and the plugin excluded, not fatal.
    pub fn register_plugin(&mut self, mut plugin: Box<dyn Plugin>) {
        if plugin.initialize() {
            self.plugins.push(plugin);
        } else {
            log::warn!("plugin {} failed to initialize, excluding", plugin.name());
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Transitions `enabled := false`. In-flight handlers complete
    /// normally (spec §5); this only gates the *next* dispatch.
    pub fn terminate(&mut self) {
        self.enabled = false;
        for plugin in &mut self.plugins {
            plugin.cleanup();
        }
    }

    /// Dispatches one event through the fixed pipeline: pre-veto plugins,
    /// then (if not vetoed) disassembler → statistics → tracer → debugger
    /// → protocol, then observation-only plugins. Returns `false` without
    /// doing any work if the engine is disabled (spec §5's cancellation
    /// rule).
    #[allow(clippy::too_many_arguments)]
    pub fn dispatch(
        &mut self,
        kind: EventKind,
        eip: u32,
        proc_entry: u32,
        proc: &dyn ProcessorView,
        decoder: &dyn InstructionDecoder,
        api: &dyn ApiInfoTable,
    ) -> bool {
        if !self.enabled {
            return false;
        }

        let mut event = Event::new(kind, eip, proc_entry);

        for plugin in &mut self.plugins {
            plugin.on_event_pre(&mut event);
            if event.is_vetoed() {
                break;
            }
        }

        if !event.is_vetoed() {
            self.run_internal_subscribers(&event, proc, decoder, api);
        }

        for plugin in &mut self.plugins {
            plugin.on_event_post(&event);
        }

        !event.is_vetoed()
    }

    fn run_internal_subscribers(
        &mut self,
        event: &Event,
        proc: &dyn ProcessorView,
        decoder: &dyn InstructionDecoder,
        api: &dyn ApiInfoTable,
    ) {
        // disassembler
        let inst = Disassembler::disassemble_one(&self.mem, proc, decoder, api, event.eip);
        if inst.is_some() {
            self.mem.update_indices();
        }

        // statistics
        match event.kind {
            EventKind::PostExecute => self.stats.instructions_executed += 1,
            EventKind::MemRead { .. } => self.stats.mem_reads += 1,
            EventKind::MemWrite { .. } => self.stats.mem_writes += 1,
            _ => {}
        }

        // taint propagation: applied once the host has executed the
        // instruction, before the trace buffer records the step. A call/jmp
        // whose target resolved to a named import is flagged WINAPI_CALL/JMP
        // so the taint handlers can skip the Eip taint write (spec §4.2).
        let exec_flags = match &inst {
            Some(i) if i.target_module_name.is_some() && i.mnemonic == "call" => ExecFlags::WINAPI_CALL,
            Some(i) if i.target_module_name.is_some() && i.mnemonic == "jmp" => ExecFlags::WINAPI_JMP,
            _ => ExecFlags::empty(),
        };

        if matches!(event.kind, EventKind::PostExecute) {
            if let Some(inst) = &inst {
                if let Err(e) = self.taint.on_execute_trace(inst, proc, exec_flags) {
                    log::warn!("taint propagation failed at 0x{:08x}: {}", event.eip, e);
                }
            }
        }

        // tracer
        if matches!(event.kind, EventKind::PostExecute) {
            let (mr, mw) = match event.kind {
                EventKind::MemRead { addr, len, val } => (MemAccess { addr, len, val }, MemAccess::NONE),
                EventKind::MemWrite { addr, len, val } => (MemAccess::NONE, MemAccess { addr, len, val }),
                _ => (MemAccess::NONE, MemAccess::NONE),
            };

            let mut gprs = [0u32; 8];
            for (i, reg) in crate::taint::cputaint::ALL_GPRS.iter().enumerate() {
                gprs[i] = proc.gpr(*reg);
            }

            self.trace.trace(
                event.eip,
                gprs,
                proc.flags(),
                mr,
                mw,
                exec_flags,
                event.proc_entry,
            );
        }

        // debugger and protocol subscribers are driven by the caller's
        // own plugins/analyzers registered through the Plugin API; the
        // engine core has nothing further to do here.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disasm::Inst;
    use crate::host::{MemorySection, NoApiInfo};
    use crate::taint::cputaint::Gpr;
    use crate::taint::TaintRules;

    struct FakeProc;
    impl ProcessorView for FakeProc {
        fn eip(&self) -> u32 {
            0x1000
        }
        fn gpr(&self, _reg: Gpr) -> u32 {
            0
        }
        fn flags(&self) -> u32 {
            0
        }
        fn section_containing(&self, addr: u32) -> Option<MemorySection> {
            Some(MemorySection {
                base: 0x1000,
                size: 0x100,
                description: "test".to_string(),
            })
        }
        fn read_bytes(&self, _addr: u32, _len: usize) -> Vec<u8> {
            vec![0x90]
        }
    }

    struct FakeDecoder;
    impl InstructionDecoder for FakeDecoder {
        fn decode(&self, eip: u32, _bytes: &[u8]) -> Inst {
            let mut inst = Inst::invalid(eip);
            inst.is_invalid = false;
            inst.mnemonic = "nop".to_string();
            inst.length = 1;
            inst
        }
    }

    struct RecordingPlugin {
        pre_calls: usize,
        post_calls: usize,
        veto_next: bool,
    }

    impl Plugin for RecordingPlugin {
        fn name(&self) -> &str {
            "recording"
        }

        fn on_event_pre(&mut self, event: &mut Event) {
            self.pre_calls += 1;
            if self.veto_next {
                event.veto();
            }
        }

        fn on_event_post(&mut self, _event: &Event) {
            self.post_calls += 1;
        }
    }

    fn engine() -> Engine {
        Engine::new(TaintEngine::new(TaintRules::empty()), RunTrace::new(16, false))
    }

    #[test]
    fn dispatch_runs_internal_subscribers_and_plugins_in_order() {
        let mut eng = engine();
        eng.mem.ensure_section(0x1000, 0x100);

        let ok = eng.dispatch(
            EventKind::PostExecute,
            0x1000,
            0x1000,
            &FakeProc,
            &FakeDecoder,
            &NoApiInfo,
        );

        assert!(ok);
        assert_eq!(eng.stats.instructions_executed, 1);
        assert_eq!(eng.trace.count(), 1);
    }

    #[test]
    fn veto_in_pre_pass_stops_internal_subscribers_but_not_post_pass() {
        let mut eng = engine();
        eng.mem.ensure_section(0x1000, 0x100);
        eng.register_plugin(Box::new(RecordingPlugin {
            pre_calls: 0,
            post_calls: 0,
            veto_next: true,
        }));

        let ok = eng.dispatch(
            EventKind::PostExecute,
            0x1000,
            0x1000,
            &FakeProc,
            &FakeDecoder,
            &NoApiInfo,
        );

        assert!(!ok);
        assert_eq!(eng.stats.instructions_executed, 0);
        assert_eq!(eng.trace.count(), 0);
    }

    #[test]
    fn disabled_engine_short_circuits_dispatch() {
        let mut eng = engine();
        eng.mem.ensure_section(0x1000, 0x100);
        eng.terminate();

        let ok = eng.dispatch(
            EventKind::PostExecute,
            0x1000,
            0x1000,
            &FakeProc,
            &FakeDecoder,
            &NoApiInfo,
        );

        assert!(!ok);
        assert_eq!(eng.stats.instructions_executed, 0);
    }

    #[test]
    fn failed_plugin_init_is_excluded_not_fatal() {
        struct DoaPlugin;
        impl Plugin for DoaPlugin {
            fn name(&self) -> &str {
                "doa"
            }
            fn initialize(&mut self) -> bool {
                false
            }
        }

        let mut eng = engine();
        eng.register_plugin(Box::new(DoaPlugin));
        assert_eq!(eng.plugins.len(), 0);
    }
}
