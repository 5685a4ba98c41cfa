// Exception Engine: normal/stack/process/reset microsequences, gate
// traversal, and the three-phase context switch (spec.md §4.4).
// Grounded in `3b2_cpu.c`'s `cpu_on_normal_exception`/
// `cpu_on_stack_exception`/`cpu_on_process_exception`/
// `cpu_on_reset_exception`/`cpu_perform_gate`/`cpu_context_switch_1/2/3`.
//
// Per spec.md §9's "avoid back-references" design note, this module holds
// no reference to `Cpu`; every method takes the register file, bus, and
// MMU explicitly.

use crate::bus::{AccessSource, Bus};
use crate::fault::{Fault, MemKind};
use crate::mmu::Mmu;
use crate::psw::{ExceptionType, Level, Psw};
use crate::registers::{
    RegisterFile, PCB_AP, PCB_BLOCK_MOVE, PCB_FP, PCB_PC, PCB_PSW, PCB_R0, PCB_SP, PCB_STACK_HIGH, PCB_STACK_LOW,
};
use log::debug;

/// Mirrors the source's `abort_context` global: names which microsequence
/// is currently unwinding, so a fault raised *during* unwind escalates to
/// the next flavor instead of restarting the same one (spec.md §4.4
/// "Exception nesting", §7 "Cascaded faults").
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AbortContext {
    None,
    Normal,
    Stack,
    Process,
    Reset,
}

/// Returned by the engine when nesting depth exceeds the architectural
/// limit; the CPU main loop halts the emulator on this.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ExceptionStackOverflow;

const MAX_DEPTH: u32 = 10;
const GATE_VECTOR_BASE: u32 = 0x0000;
const STACK_PCBP_PTR: u32 = 0x88;
const PROCESS_PCBP_PTR: u32 = 0x84;
const RESET_PCBP_PTR: u32 = 0x80;
const INTERRUPT_VECTOR_BASE: u32 = 0x8c;
const QUICK_VECTOR_BASE: u32 = 0x48c;

pub struct ExceptionEngine {
    pub depth: u32,
    pub abort_context: AbortContext,
}

impl ExceptionEngine {
    pub fn new() -> Self {
        Self { depth: 0, abort_context: AbortContext::None }
    }

    /// Called once per retired instruction (spec.md §4.4 "A depth counter
    /// is decremented once per retired instruction").
    pub fn retire_instruction(&mut self) {
        if self.depth > 0 {
            self.depth -= 1;
        }
    }

    fn enter(&mut self) -> Result<(), ExceptionStackOverflow> {
        self.depth += 1;
        if self.depth >= MAX_DEPTH {
            Err(ExceptionStackOverflow)
        } else {
            Ok(())
        }
    }

    /// Top-level entry point: deliver `cause`, escalating through
    /// stack/process/reset if the delivery mechanism itself faults.
    pub fn deliver(&mut self, regs: &RegisterFile, bus: &mut Bus, mmu: &mut Mmu, cause: Fault) -> Result<(), ExceptionStackOverflow> {
        self.enter()?;
        let outcome = if cause.is_cascaded() {
            self.abort_context = AbortContext::Stack;
            self.stack(regs, bus, mmu, 0x07)
        } else {
            self.abort_context = AbortContext::Normal;
            self.normal(regs, bus, mmu, cause)
        };
        if let Err(next) = outcome {
            self.escalate(regs, bus, mmu, next)?;
        }
        Ok(())
    }

    fn escalate(&mut self, regs: &RegisterFile, bus: &mut Bus, mmu: &mut Mmu, cause: Fault) -> Result<(), ExceptionStackOverflow> {
        self.enter()?;
        let outcome = match self.abort_context {
            AbortContext::Normal => {
                self.abort_context = AbortContext::Stack;
                self.stack(regs, bus, mmu, cause.isc())
            }
            AbortContext::Stack => {
                self.abort_context = AbortContext::Process;
                self.process(regs, bus, mmu, cause.isc())
            }
            _ => {
                self.abort_context = AbortContext::Reset;
                self.reset(regs, bus, mmu);
                Ok(())
            }
        };
        if let Err(next) = outcome {
            self.escalate(regs, bus, mmu, next)?;
        }
        Ok(())
    }

    /// Normal exception: push PC then updated PSW, gate through the
    /// first-level vector table at offset `isc << 3` (spec.md §4.4
    /// "Normal exception").
    fn normal(&mut self, regs: &RegisterFile, bus: &mut Bus, mmu: &mut Mmu, cause: Fault) -> Result<(), Fault> {
        let pcbp = regs.pcbp();
        let low = RegisterFile::read_pcb_field(bus, pcbp, PCB_STACK_LOW)?;
        let high = RegisterFile::read_pcb_field(bus, pcbp, PCB_STACK_HIGH)?;
        let sp = regs.sp();
        if sp < low || sp > high {
            return Err(Fault::StackFault);
        }
        let mut psw = regs.psw();
        psw.set_isc(cause.isc());
        psw.set_et(ExceptionType::Normal);
        let pc = regs.pc();
        regs.push_word(bus, pc)?;
        regs.push_word(bus, psw.raw())?;
        debug!("normal exception isc={:#x} pc={:#010x}", cause.isc(), pc);
        self.gate_traverse(regs, bus, GATE_VECTOR_BASE, (cause.isc() as u32) << 3)
    }

    /// Stack exception: new PCB from physical 0x88, push old PCBP onto
    /// the interrupt stack, context-switch (spec.md §4.4 "Stack exception").
    fn stack(&mut self, regs: &RegisterFile, bus: &mut Bus, mmu: &mut Mmu, _isc: u32) -> Result<(), Fault> {
        let new_pcbp = bus.read_w(STACK_PCBP_PTR, AccessSource::Cpu).map_err(|_| Fault::ProcessFault)?;
        self.push_interrupt_stack(regs, bus, regs.pcbp()).map_err(|_| Fault::ProcessFault)?;
        self.context_switch(regs, bus, mmu, new_pcbp).map_err(|_| Fault::ProcessFault)?;
        let mut psw = regs.psw();
        psw.set_isc(7);
        psw.set_tm(false);
        psw.set_et(ExceptionType::Stack);
        regs.set_psw(psw);
        debug!("stack exception, new pcbp={:#010x}", new_pcbp);
        Ok(())
    }

    /// Process exception: new PCB from physical 0x84 (spec.md §4.4
    /// "Process exception").
    fn process(&mut self, regs: &RegisterFile, bus: &mut Bus, mmu: &mut Mmu, _isc: u32) -> Result<(), Fault> {
        let new_pcbp = bus.read_w(PROCESS_PCBP_PTR, AccessSource::Cpu).map_err(|_| Fault::ResetFault)?;
        self.push_interrupt_stack(regs, bus, regs.pcbp()).map_err(|_| Fault::ResetFault)?;
        self.context_switch(regs, bus, mmu, new_pcbp).map_err(|_| Fault::ResetFault)?;
        let mut psw = regs.psw();
        psw.set_isc(7);
        psw.set_tm(false);
        psw.set_et(ExceptionType::Process);
        regs.set_psw(psw);
        debug!("process exception, new pcbp={:#010x}", new_pcbp);
        Ok(())
    }

    /// Reset exception: disables the MMU, loads PCB from physical 0x80,
    /// context-switches without pushing any state (spec.md §4.4 "Reset
    /// exception"). Infallible by construction — any further fault here
    /// would exceed `MAX_DEPTH` and halt the emulator instead.
    fn reset(&mut self, regs: &RegisterFile, bus: &mut Bus, mmu: &mut Mmu) {
        mmu.enabled = false;
        let new_pcbp = bus.read_w(RESET_PCBP_PTR, AccessSource::Cpu).unwrap_or(0);
        let _ = self.context_switch(regs, bus, mmu, new_pcbp);
        let mut psw = regs.psw();
        psw.set_isc(3);
        psw.set_et(ExceptionType::Reset);
        regs.set_psw(psw);
        debug!("reset exception, new pcbp={:#010x}", new_pcbp);
    }

    fn push_interrupt_stack(&self, regs: &RegisterFile, bus: &mut Bus, value: u32) -> Result<(), Fault> {
        let isp = regs.isp().wrapping_sub(4);
        regs.set_isp(isp);
        bus.write_w(isp, value, AccessSource::Cpu)
            .map_err(|_| Fault::Memory(MemKind::ExternalMemoryFault))
    }

    /// Gate traversal, shared by the normal-exception microsequence and
    /// the `GATE` instruction (spec.md §4.4 "Gate traversal").
    pub fn gate_traverse(&self, regs: &RegisterFile, bus: &mut Bus, i1: u32, i2: u32) -> Result<(), Fault> {
        let table_ptr = bus.read_w(i1, AccessSource::Cpu).map_err(|_| Fault::GateFault)?;
        let addr = table_ptr.wrapping_add(i2);
        let new_psw_raw = bus.read_w(addr, AccessSource::Cpu).map_err(|_| Fault::GateFault)?;
        let new_pc = bus.read_w(addr.wrapping_add(4), AccessSource::Cpu).map_err(|_| Fault::GateFault)?;
        let outgoing = regs.psw();
        let mut new_psw = Psw::new(new_psw_raw);
        new_psw.clear_switch_fields();
        new_psw.set_pm(outgoing.cm());
        new_psw.set_ipl(outgoing.ipl());
        new_psw.set_r_flag(outgoing.r_flag());
        new_psw.set_isc(7);
        new_psw.set_tm(true);
        new_psw.set_et(ExceptionType::Normal);
        regs.set_pc(new_pc);
        regs.set_psw(new_psw);
        Ok(())
    }

    /// Three-phase context switch, shared by stack/process exceptions and
    /// the full-interrupt microsequence (spec.md §4.4 "Context switch").
    pub fn context_switch(&self, regs: &RegisterFile, bus: &mut Bus, _mmu: &mut Mmu, new_pcbp: u32) -> Result<(), Fault> {
        // Phase 1: save current context into the current PCB.
        let old_pcbp = regs.pcbp();
        let outgoing = regs.psw();
        RegisterFile::write_pcb_field(bus, old_pcbp, PCB_PC, regs.pc())?;
        RegisterFile::write_pcb_field(bus, old_pcbp, PCB_PSW, outgoing.raw())?;
        RegisterFile::write_pcb_field(bus, old_pcbp, PCB_SP, regs.sp())?;
        if outgoing.r_flag() {
            RegisterFile::write_pcb_field(bus, old_pcbp, PCB_FP, regs.fp())?;
            RegisterFile::write_pcb_field(bus, old_pcbp, PCB_AP, regs.ap())?;
            for r in 0..9 {
                RegisterFile::write_pcb_field(bus, old_pcbp, PCB_R0 + 4 * r, regs.read(r as usize))?;
            }
        }

        // Phase 2: install the new context.
        regs.set_pcbp(new_pcbp);
        let mut effective_pcbp = new_pcbp;
        let new_psw = Psw::new(RegisterFile::read_pcb_field(bus, effective_pcbp, PCB_PSW)?);
        if new_psw.i_flag() {
            effective_pcbp = effective_pcbp.wrapping_add(12);
            regs.set_pcbp(effective_pcbp);
        }
        let new_pc = RegisterFile::read_pcb_field(bus, effective_pcbp, PCB_PC)?;
        let new_sp = RegisterFile::read_pcb_field(bus, effective_pcbp, PCB_SP)?;
        let mut installed = new_psw;
        installed.set_tm(false);
        regs.set_pc(new_pc);
        regs.set_sp(new_sp);
        regs.set_psw(installed);

        // Phase 3: embedded block-move, only if the new PSW requests it.
        if installed.r_flag() {
            self.block_move(regs, bus, effective_pcbp)?;
        }
        Ok(())
    }

    /// CALLPS: push the calling process's PCBP onto the interrupt stack
    /// and context-switch into the process named by `new_pcbp` (spec.md
    /// §4.5 "CALLPS/RETPS"). Shares the push/context-switch shape of
    /// `stack`/`process`/`full_interrupt` above.
    pub fn call_process(&self, regs: &RegisterFile, bus: &mut Bus, mmu: &mut Mmu, new_pcbp: u32) -> Result<(), Fault> {
        self.push_interrupt_stack(regs, bus, regs.pcbp())?;
        self.context_switch(regs, bus, mmu, new_pcbp)
    }

    /// RETPS: pop the PCBP CALLPS saved on the interrupt stack and
    /// context-switch back into it (spec.md §4.5 "CALLPS/RETPS").
    pub fn return_process(&self, regs: &RegisterFile, bus: &mut Bus, mmu: &mut Mmu) -> Result<(), Fault> {
        let isp = regs.isp();
        let saved_pcbp = bus.read_w(isp, AccessSource::Cpu).map_err(|_| Fault::Memory(MemKind::ExternalMemoryFault))?;
        regs.set_isp(isp.wrapping_add(4));
        self.context_switch(regs, bus, mmu, saved_pcbp)
    }

    /// Embedded block-move loop at `pcbp + 64`: repeatedly read
    /// (count, source, destination) triples and copy `count` words,
    /// terminating on count=0 (spec.md §4.4 phase 3).
    fn block_move(&self, _regs: &RegisterFile, bus: &mut Bus, pcbp: u32) -> Result<(), Fault> {
        let mut ptr = pcbp.wrapping_add(PCB_BLOCK_MOVE);
        loop {
            let count = bus.read_w(ptr, AccessSource::Cpu).map_err(|_| Fault::ResetFault)?;
            if count == 0 {
                break;
            }
            let src = bus.read_w(ptr.wrapping_add(4), AccessSource::Cpu).map_err(|_| Fault::ResetFault)?;
            let dst = bus.read_w(ptr.wrapping_add(8), AccessSource::Cpu).map_err(|_| Fault::ResetFault)?;
            for i in 0..count {
                let word = bus.read_w(src.wrapping_add(4 * i), AccessSource::Cpu).map_err(|_| Fault::ResetFault)?;
                bus.write_w(dst.wrapping_add(4 * i), word, AccessSource::Cpu).map_err(|_| Fault::ResetFault)?;
            }
            ptr = ptr.wrapping_add(12);
        }
        Ok(())
    }

    /// Full-interrupt microsequence (spec.md §4.4).
    pub fn full_interrupt(&mut self, regs: &RegisterFile, bus: &mut Bus, mmu: &mut Mmu, vector: u32) -> Result<(), ExceptionStackOverflow> {
        self.enter()?;
        let new_pcbp_ptr = INTERRUPT_VECTOR_BASE.wrapping_add(4 * vector);
        let outcome: Result<(), Fault> = (|| {
            let new_pcbp = bus.read_w(new_pcbp_ptr, AccessSource::Cpu).map_err(|_| Fault::ProcessFault)?;
            self.push_interrupt_stack(regs, bus, regs.pcbp())?;
            let mut outgoing = regs.psw();
            outgoing.set_et(ExceptionType::Process);
            outgoing.set_isc(0);
            outgoing.set_tm(false);
            regs.set_psw(outgoing);
            self.context_switch(regs, bus, mmu, new_pcbp)?;
            let mut psw = regs.psw();
            psw.set_isc(7);
            psw.set_tm(false);
            psw.set_et(ExceptionType::Normal);
            regs.set_psw(psw);
            Ok(())
        })();
        if let Err(f) = outcome {
            self.abort_context = AbortContext::Stack;
            self.escalate(regs, bus, mmu, f)?;
        }
        Ok(())
    }

    /// Quick-interrupt microsequence (spec.md §4.4). Inherits only the
    /// QIE-enabled bits of the new PSW from the vector, per spec.md — this
    /// crate's own-layout PSW treats "QIE-enabled bits" as every bit other
    /// than PM/IPL/ISC/TM/ET, which are always supplied fresh below.
    pub fn quick_interrupt(&mut self, regs: &RegisterFile, bus: &mut Bus, mmu: &mut Mmu, vector: u32) -> Result<(), ExceptionStackOverflow> {
        self.enter()?;
        let vptr = QUICK_VECTOR_BASE.wrapping_add(8 * vector);
        let outcome: Result<(), Fault> = (|| {
            let pc = regs.pc();
            let psw = regs.psw();
            regs.push_word(bus, pc)?;
            regs.push_word(bus, psw.raw())?;
            let new_psw_raw = bus.read_w(vptr, AccessSource::Cpu).map_err(|_| Fault::ProcessFault)?;
            let new_pc = bus.read_w(vptr.wrapping_add(4), AccessSource::Cpu).map_err(|_| Fault::ProcessFault)?;
            let mut new_psw = Psw::new(new_psw_raw);
            new_psw.set_pm(psw.cm());
            new_psw.set_isc(7);
            new_psw.set_tm(false);
            new_psw.set_et(ExceptionType::Normal);
            regs.set_pc(new_pc);
            regs.set_psw(new_psw);
            Ok(())
        })();
        if let Err(f) = outcome {
            self.abort_context = AbortContext::Stack;
            self.escalate(regs, bus, mmu, f)?;
        }
        Ok(())
    }
}

/// Did the outgoing mode change as part of a kernel entry? (invariant
/// from spec.md §3: "On entry to kernel-level code via interrupt/
/// exception, CM = 0 and PM records the outgoing CM.")
pub fn enter_kernel(psw: &mut Psw) {
    let outgoing_cm = psw.cm();
    psw.set_pm(outgoing_cm);
    psw.set_cm(Level::Kernel);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Bus;
    use crate::registers::{RegisterFile, Revision};

    fn setup() -> (RegisterFile, Bus, Mmu) {
        let regs = RegisterFile::new(Revision::Rev2);
        let bus = Bus::new(0x100000, 0x10000, 0, 0x800000);
        let mmu = Mmu::new(Revision::Rev2);
        (regs, bus, mmu)
    }

    #[test]
    fn gate_through_isc5_matches_scenario_4() {
        let (regs, mut bus, _mmu) = setup();
        bus.write_w(0x0000, 0x0000_1000, AccessSource::Cpu).unwrap();
        bus.write_w(0x0000_1028, 0x0000_4000, AccessSource::Cpu).unwrap();
        bus.write_w(0x0000_102c, 0x0000_5000, AccessSource::Cpu).unwrap();
        regs.set_psw(Psw::new(0));
        let engine = ExceptionEngine::new();
        engine.gate_traverse(&regs, &mut bus, 0, 5 << 3).unwrap();
        assert_eq!(regs.pc(), 0x0000_5000);
        let psw = regs.psw();
        assert_eq!(psw.isc(), 7);
        assert!(psw.tm());
        assert_eq!(psw.et(), ExceptionType::Normal);
    }

    #[test]
    fn context_switch_moves_pcbp_and_loads_new_context() {
        let (regs, mut bus, mut mmu) = setup();
        regs.set_pcbp(0x2000);
        regs.set_pc(0x100);
        regs.set_sp(0x3000);
        bus.write_w(0x4004, 0x1234, AccessSource::Cpu).unwrap(); // new PC
        bus.write_w(0x4008, 0x5000, AccessSource::Cpu).unwrap(); // new SP
        let engine = ExceptionEngine::new();
        engine.context_switch(&regs, &mut bus, &mut mmu, 0x4000).unwrap();
        assert_eq!(regs.pcbp(), 0x4000);
        assert_eq!(regs.pc(), 0x1234);
        assert_eq!(regs.sp(), 0x5000);
        // Old context was saved.
        assert_eq!(bus.read_w(0x2004, AccessSource::Cpu).unwrap(), 0x100);
        assert_eq!(bus.read_w(0x2008, AccessSource::Cpu).unwrap(), 0x3000);
    }
}
