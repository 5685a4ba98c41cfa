// Thin CLI: BOOT/SET CPU/SHOW CPU command surface (spec.md §6 "Boot
// command surface"). Hand-parsed with `split_whitespace`, the same direct
// style the teacher uses for its debugger command loop in `processor.rs`
// rather than pulling in an argument-parsing crate.

use std::io::{stdin, stdout, Write};
use termion::cursor;
use we32k::bus::AccessSource;
use we32k::cpu::StepOutcome;
use we32k::{Configuration, Emulator};

fn main() {
    env_logger::init();

    let config = Configuration::default();
    let mut emu = Emulator::new(config);

    println!("we32k simulator. Type HELP for commands, BOOT to start.");
    loop {
        print!("we32k> ");
        let _ = stdout().flush();
        let mut line = String::new();
        if stdin().read_line(&mut line).unwrap_or(0) == 0 {
            break;
        }
        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            [] => continue,
            ["HELP"] => print_help(),
            ["QUIT"] | ["EXIT"] => break,
            ["BOOT"] | ["BOOT", "CPU"] => {
                let outcome = emu.run();
                report_outcome(outcome);
            }
            ["SET", "CPU", size] if size.ends_with('M') => {
                if let Ok(mb) = size.trim_end_matches('M').parse::<u32>() {
                    emu.bus.mem.ram.resize((mb << 20) as usize, 0);
                    emu.bus.mem.ram_size = mb << 20;
                    println!("memory size set to {}M", mb);
                } else {
                    println!("bad memory size");
                }
            }
            ["SET", "CPU", "HISTORY", n] => match n.parse::<usize>() {
                Ok(size) => {
                    emu.cpu.history.resize(size);
                    println!("history ring set to {} entries", size);
                }
                Err(_) => println!("bad history size"),
            },
            ["SET", "CPU", "IDLE"] => emu.cpu.options.idle_on_wait = true,
            ["SET", "CPU", "NOIDLE"] => emu.cpu.options.idle_on_wait = false,
            ["SET", "CPU", "EXBRK"] => emu.cpu.options.break_on_exception = true,
            ["SET", "CPU", "NOEXBRK"] => emu.cpu.options.break_on_exception = false,
            ["SET", "CPU", "OPBRK"] => emu.cpu.options.break_on_illegal_opcode = true,
            ["SET", "CPU", "NOOPBRK"] => emu.cpu.options.break_on_illegal_opcode = false,
            ["SHOW", "CPU", "VIRTUAL", vaddr] => match parse_num(vaddr) {
                Some(va) => {
                    let cm = emu.cpu.regs.psw().cm() as u8;
                    match emu.cpu.mmu.translate(&mut emu.bus, va, we32k::fault::AccessCode::Read, cm, false) {
                        Ok(pa) => println!("{:#010x} -> {:#010x}", va, pa),
                        Err(fault) => println!("translation fault: {}", fault),
                    }
                }
                None => println!("bad virtual address"),
            },
            ["SHOW", "CPU", "STACK"] => show_stack(&mut emu, 8),
            ["SHOW", "CPU", "STACK", n] => {
                let n = n.parse::<u32>().unwrap_or(8);
                show_stack(&mut emu, n);
            }
            ["SHOW", "CPU"] => show_cpu_screen(&emu),
            ["LOAD", "ROM", path] => emu.load_rom(path),
            _ => println!("unrecognized command, try HELP"),
        }
    }
}

fn report_outcome(outcome: StepOutcome) {
    match outcome {
        StepOutcome::Halted => println!("halted"),
        StepOutcome::BrokeOnException => println!("stopped: exception"),
        StepOutcome::BrokeOnIllegalOpcode => println!("stopped: illegal opcode"),
        StepOutcome::Waiting => println!("stopped: WAIT"),
        StepOutcome::Ran => println!("stopped"),
    }
}

/// A positioned register dashboard, same `cursor::Goto` layout style as
/// the teacher's `Debugger::display` table for its CPU state box.
fn show_cpu_screen(emu: &Emulator) {
    let psw = emu.cpu.regs.psw();
    println!("{}PC  {:#010x}", cursor::Goto(1, 1), emu.cpu.regs.pc());
    println!("{}SP  {:#010x}", cursor::Goto(1, 2), emu.cpu.regs.sp());
    println!("{}PCBP{:#010x}", cursor::Goto(1, 3), emu.cpu.regs.pcbp());
    println!("{}{}", cursor::Goto(1, 4), psw);
}

fn show_stack(emu: &mut Emulator, n: u32) {
    let sp = emu.cpu.regs.sp();
    for i in 0..n {
        let addr = sp.wrapping_add(i * 4);
        match emu.bus.read_w(addr, AccessSource::Cpu) {
            Ok(v) => println!("{:#010x}: {:#010x}", addr, v),
            Err(_) => println!("{:#010x}: <unmapped>", addr),
        }
    }
}

fn parse_num(s: &str) -> Option<u32> {
    if let Some(hex) = s.strip_prefix("0x") {
        u32::from_str_radix(hex, 16).ok()
    } else {
        s.parse::<u32>().ok()
    }
}

fn print_help() {
    println!("BOOT [CPU]");
    println!("SET CPU {{1M|2M|4M|...}}");
    println!("SET CPU HISTORY n");
    println!("SET CPU [NO]IDLE | [NO]EXBRK | [NO]OPBRK");
    println!("SHOW CPU VIRTUAL <vaddr> | SHOW CPU STACK [n] | SHOW CPU");
    println!("LOAD ROM <path>");
    println!("QUIT");
}
