// Top-level wiring: `Configuration` describes a machine, `Emulator` owns
// the `Bus`/`Cpu` pair and drives the main loop (spec.md §0 crate layout,
// §10 "Configuration"). Shape kept from the teacher's `lib.rs`
// (`Configuration`/`Emulator::new`/`run`/`load`), generalized from a flat
// m68k `OpResult` memory layout to the WE32100/32200's `Bus`/`Mmu` pair.

pub mod bus;
pub mod conversions;
pub mod cpu;
pub mod devices;
pub mod exception;
pub mod fault;
pub mod history;
pub mod interrupt;
pub mod mmu;
pub mod psw;
pub mod registers;

use bus::{AccessSource, Bus};
use cpu::{Cpu, CpuOptions, StepOutcome};
use registers::Revision;
use std::fs;

/// Everything needed to stand up one machine: memory sizes, CPU revision,
/// and the `SET CPU` debugger options (spec.md §6 "CLI surface").
pub struct Configuration {
    pub ram_size: u32,
    pub rom_base: u32,
    pub rom_size: u32,
    pub revision: Revision,
    pub history_size: usize,
    pub options: CpuOptions,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            ram_size: 4 << 20,
            rom_base: 0x0040_0000,
            rom_size: 0x8000,
            revision: Revision::Rev3,
            history_size: 64,
            options: CpuOptions::default(),
        }
    }
}

pub struct Emulator {
    pub cpu: Cpu,
    pub bus: Bus,
}

impl Emulator {
    pub fn new(config: Configuration) -> Emulator {
        let bus = Bus::new(config.ram_size, config.rom_size, 0, config.rom_base);
        let cpu = Cpu::new(config.revision, config.history_size, config.options);
        Emulator { cpu, bus }
    }

    /// Load a ROM image from disk into the bus's ROM window (spec.md §6
    /// "Boot protocol": "the Bus loads the ROM image").
    pub fn load_rom(&mut self, path: &str) {
        let image = fs::read(path).expect("ROM image does not exist!");
        self.bus.load_rom(&image);
    }

    /// Run the boot protocol, then step until the CPU halts, hits a
    /// breakpoint, or breaks on an exception/illegal opcode (spec.md §4.5
    /// "Main loop", §6 "Boot protocol").
    pub fn run(&mut self) -> StepOutcome {
        if let Err(fault) = self.cpu.boot(&mut self.bus) {
            log::debug!("boot failed: {:?}", fault);
            return StepOutcome::Halted;
        }
        loop {
            match self.cpu.step(&mut self.bus) {
                StepOutcome::Ran => continue,
                StepOutcome::Waiting => {
                    if !self.cpu.options.idle_on_wait {
                        self.cpu.clear_wait();
                        continue;
                    }
                    return StepOutcome::Waiting;
                }
                other => return other,
            }
        }
    }

    /// Single-step once, without running the boot protocol (spec.md §6
    /// "SHOW CPU" / debugger single-step surface).
    pub fn step(&mut self) -> StepOutcome {
        self.cpu.step(&mut self.bus)
    }

    pub fn poke_word(&mut self, pa: u32, value: u32) {
        self.bus.write_w(pa, value, AccessSource::Cpu).expect("poke to unmapped address");
    }

    pub fn peek_word(&mut self, pa: u32) -> u32 {
        self.bus.read_w(pa, AccessSource::Cpu).expect("peek from unmapped address")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boots_and_runs_a_single_nop() {
        let config = Configuration { ram_size: 0x10000, rom_base: 0x800000, rom_size: 0x1000, ..Default::default() };
        let mut emu = Emulator::new(config);
        emu.poke_word(0x80, 0x2000);
        emu.poke_word(0x2000, 0);
        emu.poke_word(0x2004, 0x3000);
        emu.poke_word(0x2008, 0x2100);
        emu.bus.write_b(0x3000, 0x70, AccessSource::Cpu).unwrap(); // NOP
        emu.cpu.boot(&mut emu.bus).unwrap();
        let outcome = emu.cpu.step(&mut emu.bus);
        assert_eq!(outcome, StepOutcome::Ran);
        assert_eq!(emu.cpu.regs.pc(), 0x3001);
    }
}
