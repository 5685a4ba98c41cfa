// Operand resolution and instruction execution (spec.md §4.5 "Execute").
// `resolve` turns a decoded `EAMode` into a read/write location, mirroring
// `3b2_cpu.c`'s `decode_operand`'s *use* of the decoded descriptor (as
// opposed to decode.rs, which mirrors its *parse*). `execute` dispatches
// on `Category` to the flag-setting microcode family for each operand
// count the opcode table can produce.

use crate::bus::{AccessSource, Bus};
use crate::cpu::decode::{condition_for, DecodedInstruction, DecodedOperand};
use crate::cpu::fields::{add_flags, bitwise_flags, sub_flags, Condition, EAMode, Flags, OpResult, Size};
use crate::cpu::instructions::Category;
use crate::exception::ExceptionEngine;
use crate::fault::{Fault, InstrKind, MemKind};
use crate::mmu::Mmu;
use crate::psw::Psw;
use crate::registers::RegisterFile;

/// Where a resolved operand's value lives, so `execute` can both read it
/// and (for destination operands) write the result back.
enum Location {
    Immediate(u32),
    Register(usize),
    Memory(u32),
}

impl Location {
    fn read(&self, regs: &RegisterFile, bus: &mut Bus, mmu: &mut Mmu, size: Size, cm: u8) -> Result<u32, Fault> {
        match *self {
            Location::Immediate(v) => Ok(v),
            Location::Register(r) => Ok(regs.read(r) & size.mask()),
            Location::Memory(va) => {
                let pa = mmu.translate(bus, va, crate::fault::AccessCode::Read, cm, true)?;
                read_sized(bus, pa, size)
            }
        }
    }

    fn write(&self, regs: &RegisterFile, bus: &mut Bus, mmu: &mut Mmu, size: Size, cm: u8, value: u32) -> Result<(), Fault> {
        match *self {
            Location::Immediate(_) => Err(Fault::Instruction(InstrKind::InvalidDescriptor)),
            Location::Register(r) => {
                let prev = regs.read(r);
                let merged = (prev & !size.mask()) | (value & size.mask());
                regs.write(r, merged);
                Ok(())
            }
            Location::Memory(va) => {
                let pa = mmu.translate(bus, va, crate::fault::AccessCode::Write, cm, true)?;
                write_sized(bus, pa, size, value)
            }
        }
    }
}

fn read_sized(bus: &mut Bus, pa: u32, size: Size) -> Result<u32, Fault> {
    match size {
        Size::Byte => bus.read_b(pa, AccessSource::Cpu).map(|v| v as u32),
        Size::Half => bus.read_h(pa, AccessSource::Cpu).map(|v| v as u32),
        Size::Word => bus.read_w(pa, AccessSource::Cpu),
    }
}

fn write_sized(bus: &mut Bus, pa: u32, size: Size, value: u32) -> Result<(), Fault> {
    match size {
        Size::Byte => bus.write_b(pa, value as u8, AccessSource::Cpu),
        Size::Half => bus.write_h(pa, value as u16, AccessSource::Cpu),
        Size::Word => bus.write_w(pa, value, AccessSource::Cpu),
    }
}

/// Resolve a decoded operand's addressing mode to a location, performing
/// whatever register-relative address arithmetic its mode implies
/// (spec.md §4.5 "Operand resolution"). Auto-increment/decrement modes
/// mutate the base register as a side effect, matching the hardware.
fn resolve(op: &DecodedOperand, regs: &RegisterFile, size: Size) -> Location {
    match op.mode {
        EAMode::PositiveLiteral(v) => Location::Immediate(v as u32),
        EAMode::NegativeLiteral(v) => Location::Immediate((v as i8) as i32 as u32),
        EAMode::WordImmediate(v) => Location::Immediate(v),
        EAMode::HalfImmediate(v) => Location::Immediate(v as u32),
        EAMode::ByteImmediate(v) => Location::Immediate(v as u32),
        EAMode::Register(r) => Location::Register(r),
        EAMode::RegisterDeferred(r) => Location::Memory(regs.read(r)),
        EAMode::FpShortOffset(o) => Location::Memory(regs.fp().wrapping_add(o as i8 as i32 as u32)),
        EAMode::ApShortOffset(o) => Location::Memory(regs.ap().wrapping_add(o as i8 as i32 as u32)),
        EAMode::Absolute(a) | EAMode::AbsoluteDeferred(a) => Location::Memory(a),
        EAMode::WordDisplacement(r, d) | EAMode::WordDisplacementDeferred(r, d) => {
            Location::Memory(regs.read(r).wrapping_add(d as u32))
        }
        EAMode::HalfDisplacement(r, d) | EAMode::HalfDisplacementDeferred(r, d) => {
            Location::Memory(regs.read(r).wrapping_add(d as i32 as u32))
        }
        EAMode::ByteDisplacement(r, d) | EAMode::ByteDisplacementDeferred(r, d) => {
            Location::Memory(regs.read(r).wrapping_add(d as i32 as u32))
        }
        EAMode::AutoPreDecrement(r) => {
            let v = regs.read(r).wrapping_sub(size as u32);
            regs.write(r, v);
            Location::Memory(v)
        }
        EAMode::AutoPostDecrement(r) => {
            let v = regs.read(r);
            regs.write(r, v.wrapping_sub(size as u32));
            Location::Memory(v)
        }
        EAMode::AutoPreIncrement(r) => {
            let v = regs.read(r).wrapping_add(size as u32);
            regs.write(r, v);
            Location::Memory(v)
        }
        EAMode::AutoPostIncrement(r) => {
            let v = regs.read(r);
            regs.write(r, v.wrapping_add(size as u32));
            Location::Memory(v)
        }
        EAMode::IndexedByteDisplacement(base, idx, d) => {
            Location::Memory(regs.read(base).wrapping_add(d as i32 as u32).wrapping_add(regs.read(idx)))
        }
        EAMode::IndexedHalfDisplacement(base, idx, d) => {
            Location::Memory(regs.read(base).wrapping_add(d as i32 as u32).wrapping_add(regs.read(idx)))
        }
        EAMode::IndexedScaled(base, idx) => {
            Location::Memory(regs.read(base).wrapping_add(regs.read(idx).wrapping_mul(size as u32)))
        }
    }
}

/// Deferred modes add one extra level of pointer indirection: the
/// resolved address is itself a pointer to the operand, not the operand.
fn is_deferred(mode: &EAMode) -> bool {
    matches!(
        mode,
        EAMode::AbsoluteDeferred(_)
            | EAMode::WordDisplacementDeferred(..)
            | EAMode::HalfDisplacementDeferred(..)
            | EAMode::ByteDisplacementDeferred(..)
    )
}

fn resolve_final(op: &DecodedOperand, regs: &RegisterFile, bus: &mut Bus, mmu: &mut Mmu, size: Size, cm: u8) -> Result<Location, Fault> {
    let loc = resolve(op, regs, size);
    if is_deferred(&op.mode) {
        if let Location::Memory(ptr_va) = loc {
            let pa = mmu.translate(bus, ptr_va, crate::fault::AccessCode::Read, cm, true)?;
            let target = bus.read_w(pa, AccessSource::Cpu)?;
            return Ok(Location::Memory(target));
        }
    }
    Ok(loc)
}

fn apply_flags(psw: &mut Psw, flags: Flags) {
    psw.set_n(flags.n);
    psw.set_z(flags.z);
    psw.set_c(flags.c);
    psw.set_v(flags.v);
}

/// Outcome of executing one instruction: whether PC should simply
/// advance by its length, or jump to an absolute target (branches,
/// calls, returns).
pub enum Control {
    Next,
    Jump(u32),
}

/// Execute a fully decoded instruction. `pc` is the address the opcode
/// byte was fetched from; `cm` is the current execution level (needed for
/// MMU permission checks).
pub fn execute(
    decoded: &DecodedInstruction,
    pc: u32,
    regs: &RegisterFile,
    bus: &mut Bus,
    mmu: &mut Mmu,
    exceptions: &ExceptionEngine,
) -> Result<Control, Fault> {
    let mn = &decoded.mnemonic;
    let cm = regs.psw().cm() as u8;
    let size = mn.dtype;

    match mn.category {
        Category::DataMovement => execute_data_movement(decoded, regs, bus, mmu, size, cm),
        Category::Arithmetic => execute_arithmetic(decoded, regs, bus, mmu, size, cm),
        Category::Logic => execute_logic(decoded, regs, bus, mmu, size, cm),
        Category::BitOps => execute_bitops(decoded, regs, bus, mmu, size, cm),
        Category::ControlFlow => execute_control_flow(decoded, pc, regs, bus, mmu, size, cm),
        Category::FieldOps => execute_field_ops(decoded, regs, bus, mmu, cm),
        Category::Privileged => execute_privileged(decoded, regs, bus, mmu, cm, exceptions),
        Category::Str => execute_string(decoded, regs, bus, mmu),
        Category::Decimal => execute_decimal(decoded, pc, regs, bus, mmu, cm),
        Category::Coprocessor => execute_coprocessor(decoded, regs, bus, mmu, cm),
    }
}

fn execute_data_movement(
    d: &DecodedInstruction,
    regs: &RegisterFile,
    bus: &mut Bus,
    mmu: &mut Mmu,
    size: Size,
    cm: u8,
) -> Result<Control, Fault> {
    match d.mnemonic.name {
        "CLRW" | "CLRH" | "CLRB" => {
            let dst = resolve_final(&d.operands[0], regs, bus, mmu, size, cm)?;
            dst.write(regs, bus, mmu, size, cm, 0)?;
            let mut psw = regs.psw();
            apply_flags(&mut psw, bitwise_flags(size, 0).1);
            regs.set_psw(psw);
        }
        "MOVW" | "MOVH" | "MOVB" => {
            let src = resolve_final(&d.operands[0], regs, bus, mmu, size, cm)?;
            let dst = resolve_final(&d.operands[1], regs, bus, mmu, size, cm)?;
            let v = src.read(regs, bus, mmu, size, cm)?;
            dst.write(regs, bus, mmu, size, cm, v)?;
            let mut psw = regs.psw();
            apply_flags(&mut psw, bitwise_flags(size, v).1);
            regs.set_psw(psw);
        }
        "MOVAW" | "MOVTRW" | "LRA" => {
            // Address-yielding: the destination receives the source
            // operand's effective address, never the value stored there.
            let addr = match resolve_final(&d.operands[0], regs, bus, mmu, size, cm)? {
                Location::Memory(a) => a,
                _ => return Err(Fault::Instruction(InstrKind::InvalidDescriptor)),
            };
            let dst = resolve_final(&d.operands[1], regs, bus, mmu, size, cm)?;
            dst.write(regs, bus, mmu, size, cm, addr)?;
            let mut psw = regs.psw();
            apply_flags(&mut psw, bitwise_flags(size, addr).1);
            regs.set_psw(psw);
        }
        "PUSHW" => {
            let src = resolve_final(&d.operands[0], regs, bus, mmu, size, cm)?;
            let v = src.read(regs, bus, mmu, size, cm)?;
            regs.push_word(bus, v)?;
        }
        "PUSHAW" => {
            if let Location::Memory(addr) = resolve(&d.operands[0], regs, size) {
                regs.push_word(bus, addr)?;
            } else {
                return Err(Fault::Instruction(InstrKind::InvalidDescriptor));
            }
        }
        "POPW" => {
            let v = regs.pop_word(bus)?;
            let dst = resolve_final(&d.operands[0], regs, bus, mmu, size, cm)?;
            dst.write(regs, bus, mmu, size, cm, v)?;
        }
        "SWAPWI" | "SWAPHI" | "SWAPBI" => {
            let loc = resolve_final(&d.operands[0], regs, bus, mmu, size, cm)?;
            let v = loc.read(regs, bus, mmu, size, cm)?;
            let swapped = match size {
                Size::Word => v.rotate_left(16),
                Size::Half => ((v & 0xff) << 8) | ((v >> 8) & 0xff),
                Size::Byte => v,
            };
            loc.write(regs, bus, mmu, size, cm, swapped)?;
        }
        _ => return Err(Fault::Instruction(InstrKind::IllegalOpcode)),
    }
    Ok(Control::Next)
}

/// Shared helper for the `OP2`/`OP3` arithmetic family: reads the source
/// operand(s), computes, writes the destination, sets flags.
fn arith2(
    d: &DecodedInstruction,
    regs: &RegisterFile,
    bus: &mut Bus,
    mmu: &mut Mmu,
    size: Size,
    cm: u8,
    op: impl Fn(Size, u32, u32) -> (OpResult, Flags),
) -> Result<(), Fault> {
    let src = resolve_final(&d.operands[0], regs, bus, mmu, size, cm)?;
    let dst = resolve_final(&d.operands[1], regs, bus, mmu, size, cm)?;
    let a = src.read(regs, bus, mmu, size, cm)?;
    let b = dst.read(regs, bus, mmu, size, cm)?;
    let (result, flags) = op(size, b, a);
    dst.write(regs, bus, mmu, size, cm, result.inner())?;
    let mut psw = regs.psw();
    apply_flags(&mut psw, flags);
    regs.set_psw(psw);
    Ok(())
}

fn arith3(
    d: &DecodedInstruction,
    regs: &RegisterFile,
    bus: &mut Bus,
    mmu: &mut Mmu,
    size: Size,
    cm: u8,
    op: impl Fn(Size, u32, u32) -> (OpResult, Flags),
) -> Result<(), Fault> {
    let src1 = resolve_final(&d.operands[0], regs, bus, mmu, size, cm)?;
    let src2 = resolve_final(&d.operands[1], regs, bus, mmu, size, cm)?;
    let dst = resolve_final(&d.operands[2], regs, bus, mmu, size, cm)?;
    let a = src1.read(regs, bus, mmu, size, cm)?;
    let b = src2.read(regs, bus, mmu, size, cm)?;
    let (result, flags) = op(size, b, a);
    dst.write(regs, bus, mmu, size, cm, result.inner())?;
    let mut psw = regs.psw();
    apply_flags(&mut psw, flags);
    regs.set_psw(psw);
    Ok(())
}

fn execute_arithmetic(
    d: &DecodedInstruction,
    regs: &RegisterFile,
    bus: &mut Bus,
    mmu: &mut Mmu,
    size: Size,
    cm: u8,
) -> Result<Control, Fault> {
    match d.mnemonic.name {
        "ADDW2" | "ADDH2" | "ADDB2" => arith2(d, regs, bus, mmu, size, cm, |s, dest, src| add_flags(s, dest, src, 0))?,
        "ADDW3" | "ADDH3" | "ADDB3" => arith3(d, regs, bus, mmu, size, cm, |s, dest, src| add_flags(s, dest, src, 0))?,
        "SUBW2" | "SUBH2" | "SUBB2" => arith2(d, regs, bus, mmu, size, cm, sub_flags)?,
        "SUBW3" | "SUBH3" | "SUBB3" => arith3(d, regs, bus, mmu, size, cm, sub_flags)?,
        "CMPW" | "CMPH" | "CMPB" => {
            let a = resolve_final(&d.operands[0], regs, bus, mmu, size, cm)?.read(regs, bus, mmu, size, cm)?;
            let b = resolve_final(&d.operands[1], regs, bus, mmu, size, cm)?.read(regs, bus, mmu, size, cm)?;
            let (_, flags) = sub_flags(size, b, a);
            let mut psw = regs.psw();
            apply_flags(&mut psw, flags);
            regs.set_psw(psw);
        }
        "MULW2" | "MULH2" | "MULB2" => {
            arith2(d, regs, bus, mmu, size, cm, |s, dest, src| bitwise_flags(s, dest.wrapping_mul(src)))?
        }
        "MULW3" => arith3(d, regs, bus, mmu, size, cm, |s, dest, src| bitwise_flags(s, dest.wrapping_mul(src)))?,
        "DIVW2" | "DIVH2" | "DIVB2" => {
            if resolve_final(&d.operands[0], regs, bus, mmu, size, cm)?.read(regs, bus, mmu, size, cm)? == 0 {
                return Err(Fault::IntegerZeroDivide);
            }
            arith2(d, regs, bus, mmu, size, cm, |s, dest, src| {
                bitwise_flags(s, ((dest as i32).wrapping_div(src as i32)) as u32)
            })?
        }
        "DIVW3" => {
            if resolve_final(&d.operands[0], regs, bus, mmu, size, cm)?.read(regs, bus, mmu, size, cm)? == 0 {
                return Err(Fault::IntegerZeroDivide);
            }
            arith3(d, regs, bus, mmu, size, cm, |s, dest, src| {
                bitwise_flags(s, ((dest as i32).wrapping_div(src as i32)) as u32)
            })?
        }
        "MODW2" | "MODH2" | "MODB2" => {
            if resolve_final(&d.operands[0], regs, bus, mmu, size, cm)?.read(regs, bus, mmu, size, cm)? == 0 {
                return Err(Fault::IntegerZeroDivide);
            }
            arith2(d, regs, bus, mmu, size, cm, |s, dest, src| {
                bitwise_flags(s, ((dest as i32).wrapping_rem(src as i32)) as u32)
            })?
        }
        "INCW" | "INCH" | "INCB" => {
            let loc = resolve_final(&d.operands[0], regs, bus, mmu, size, cm)?;
            let v = loc.read(regs, bus, mmu, size, cm)?;
            let (result, flags) = add_flags(size, v, 1, 0);
            loc.write(regs, bus, mmu, size, cm, result.inner())?;
            let mut psw = regs.psw();
            apply_flags(&mut psw, flags);
            regs.set_psw(psw);
        }
        "DECW" | "DECH" | "DECB" => {
            let loc = resolve_final(&d.operands[0], regs, bus, mmu, size, cm)?;
            let v = loc.read(regs, bus, mmu, size, cm)?;
            let (result, flags) = sub_flags(size, v, 1);
            loc.write(regs, bus, mmu, size, cm, result.inner())?;
            let mut psw = regs.psw();
            apply_flags(&mut psw, flags);
            regs.set_psw(psw);
        }
        "MNEGW" | "MNEGH" | "MNEGB" => {
            let src = resolve_final(&d.operands[0], regs, bus, mmu, size, cm)?;
            let dst = resolve_final(&d.operands[1], regs, bus, mmu, size, cm)?;
            let v = src.read(regs, bus, mmu, size, cm)?;
            let (result, flags) = sub_flags(size, 0, v);
            dst.write(regs, bus, mmu, size, cm, result.inner())?;
            let mut psw = regs.psw();
            apply_flags(&mut psw, flags);
            regs.set_psw(psw);
        }
        "MCOMW" | "MCOMH" | "MCOMB" => {
            let src = resolve_final(&d.operands[0], regs, bus, mmu, size, cm)?;
            let dst = resolve_final(&d.operands[1], regs, bus, mmu, size, cm)?;
            let v = src.read(regs, bus, mmu, size, cm)?;
            let (result, flags) = bitwise_flags(size, !v);
            dst.write(regs, bus, mmu, size, cm, result.inner())?;
            let mut psw = regs.psw();
            apply_flags(&mut psw, flags);
            regs.set_psw(psw);
        }
        _ => return Err(Fault::Instruction(InstrKind::IllegalOpcode)),
    }
    Ok(Control::Next)
}

fn execute_logic(
    d: &DecodedInstruction,
    regs: &RegisterFile,
    bus: &mut Bus,
    mmu: &mut Mmu,
    size: Size,
    cm: u8,
) -> Result<Control, Fault> {
    match d.mnemonic.name {
        "ORW2" | "ORH2" | "ORB2" => arith2(d, regs, bus, mmu, size, cm, |s, dest, src| bitwise_flags(s, dest | src))?,
        "ORW3" => arith3(d, regs, bus, mmu, size, cm, |s, dest, src| bitwise_flags(s, dest | src))?,
        "ANDW2" | "ANDH2" | "ANDB2" => arith2(d, regs, bus, mmu, size, cm, |s, dest, src| bitwise_flags(s, dest & src))?,
        "ANDW3" => arith3(d, regs, bus, mmu, size, cm, |s, dest, src| bitwise_flags(s, dest & src))?,
        "XORW2" | "XORH2" | "XORB2" => arith2(d, regs, bus, mmu, size, cm, |s, dest, src| bitwise_flags(s, dest ^ src))?,
        "ALSW3" => shift3(d, regs, bus, mmu, size, cm, true)?,
        "ARSW3" | "ARSH3" | "ARSB3" => shift3(d, regs, bus, mmu, size, cm, false)?,
        "LLSW3" => arith3(d, regs, bus, mmu, size, cm, |s, dest, shamt| {
            bitwise_flags(s, dest.wrapping_shl(shamt & 31))
        })?,
        "LRSW3" => arith3(d, regs, bus, mmu, size, cm, |s, dest, shamt| {
            bitwise_flags(s, dest.wrapping_shr(shamt & 31))
        })?,
        "ROTW" => {
            let count = resolve_final(&d.operands[0], regs, bus, mmu, size, cm)?.read(regs, bus, mmu, size, cm)? as i32;
            let dst = resolve_final(&d.operands[1], regs, bus, mmu, size, cm)?;
            let v = dst.read(regs, bus, mmu, size, cm)?;
            let rotated = if count >= 0 { v.rotate_left(count as u32 & 31) } else { v.rotate_right((-count) as u32 & 31) };
            dst.write(regs, bus, mmu, size, cm, rotated)?;
            let mut psw = regs.psw();
            apply_flags(&mut psw, bitwise_flags(size, rotated).1);
            regs.set_psw(psw);
        }
        _ => return Err(Fault::Instruction(InstrKind::IllegalOpcode)),
    }
    Ok(Control::Next)
}

/// Arithmetic shift by 3 operands: count, source, destination. A positive
/// count shifts left, negative shifts right (spec.md §4.5 "shift sign
/// convention"), saturating to the word width.
fn shift3(
    d: &DecodedInstruction,
    regs: &RegisterFile,
    bus: &mut Bus,
    mmu: &mut Mmu,
    size: Size,
    cm: u8,
    _left_only: bool,
) -> Result<(), Fault> {
    let count = resolve_final(&d.operands[0], regs, bus, mmu, size, cm)?.read(regs, bus, mmu, size, cm)? as i8 as i32;
    let src = resolve_final(&d.operands[1], regs, bus, mmu, size, cm)?;
    let dst = resolve_final(&d.operands[2], regs, bus, mmu, size, cm)?;
    let v = src.read(regs, bus, mmu, size, cm)? as i32;
    let shifted = if count >= 0 {
        ((v as i64) << count.min(31)) as u32
    } else {
        (v >> (-count).min(31)) as u32
    };
    dst.write(regs, bus, mmu, size, cm, shifted)?;
    let mut psw = regs.psw();
    apply_flags(&mut psw, bitwise_flags(size, shifted).1);
    regs.set_psw(psw);
    Ok(())
}

fn execute_bitops(
    d: &DecodedInstruction,
    regs: &RegisterFile,
    bus: &mut Bus,
    mmu: &mut Mmu,
    size: Size,
    cm: u8,
) -> Result<Control, Fault> {
    match d.mnemonic.name {
        "TSTW" | "TSTH" | "TSTB" => {
            let v = resolve_final(&d.operands[0], regs, bus, mmu, size, cm)?.read(regs, bus, mmu, size, cm)?;
            let mut psw = regs.psw();
            apply_flags(&mut psw, bitwise_flags(size, v).1);
            regs.set_psw(psw);
        }
        "BITW" | "BITH" | "BITB" => {
            let mask = resolve_final(&d.operands[0], regs, bus, mmu, size, cm)?.read(regs, bus, mmu, size, cm)?;
            let v = resolve_final(&d.operands[1], regs, bus, mmu, size, cm)?.read(regs, bus, mmu, size, cm)?;
            let mut psw = regs.psw();
            psw.set_z((v & mask) == 0);
            regs.set_psw(psw);
        }
        _ => return Err(Fault::Instruction(InstrKind::IllegalOpcode)),
    }
    Ok(Control::Next)
}

fn execute_control_flow(
    d: &DecodedInstruction,
    pc: u32,
    regs: &RegisterFile,
    bus: &mut Bus,
    mmu: &mut Mmu,
    size: Size,
    cm: u8,
) -> Result<Control, Fault> {
    let name = d.mnemonic.name;
    if name == "NOP" {
        return Ok(Control::Next);
    }
    if name == "JMP" || name == "JSB" {
        let target = match resolve(&d.operands[0], regs, size) {
            Location::Memory(va) => va,
            Location::Register(r) => regs.read(r),
            Location::Immediate(v) => v,
        };
        if name == "JSB" {
            regs.push_word(bus, pc.wrapping_add(d.length))?;
        }
        return Ok(Control::Jump(target));
    }
    if name == "CALL" {
        let ap_operand = resolve(&d.operands[0], regs, size);
        let target = match resolve(&d.operands[1], regs, size) {
            Location::Memory(va) => va,
            Location::Register(r) => regs.read(r),
            Location::Immediate(v) => v,
        };
        let new_ap = match ap_operand {
            Location::Memory(va) => va,
            Location::Register(r) => regs.read(r),
            Location::Immediate(v) => v,
        };
        regs.push_word(bus, regs.ap())?;
        regs.push_word(bus, regs.fp())?;
        regs.push_word(bus, pc.wrapping_add(d.length))?;
        regs.set_ap(new_ap);
        regs.set_fp(regs.sp());
        return Ok(Control::Jump(target));
    }
    if name == "RET" || name == "RSB" {
        let ret_pc = regs.pop_word(bus)?;
        regs.set_fp(regs.pop_word(bus)?);
        regs.set_ap(regs.pop_word(bus)?);
        return Ok(Control::Jump(ret_pc));
    }
    if name == "BSBH" || name == "BSBB" {
        let disp = match &d.operands[0].mode {
            EAMode::HalfImmediate(h) => *h as i16 as i32,
            EAMode::ByteImmediate(b) => *b as i8 as i32,
            _ => 0,
        };
        regs.push_word(bus, pc.wrapping_add(d.length))?;
        return Ok(Control::Jump(pc.wrapping_add(disp as u32)));
    }

    // Conditional branches: BRH/BRB (always) plus the Bxx family.
    let cond = condition_for(name);
    let psw = regs.psw();
    let taken = cond.evaluate(psw.n(), psw.z(), psw.c(), psw.v());
    if !taken {
        return Ok(Control::Next);
    }
    let disp = match &d.operands[0].mode {
        EAMode::HalfImmediate(h) => *h as i16 as i32,
        EAMode::ByteImmediate(b) => *b as i8 as i32,
        _ => 0,
    };
    let _ = bus;
    let _ = mmu;
    Ok(Control::Jump(pc.wrapping_add(disp as u32)))
}

/// INSFx/EXTFx field instructions (spec.md §4.5 "Field operations"):
/// operand 0 is the field width in bits, operand 1 the starting bit
/// offset, operand 2 the base, operand 3 the source (INSFx) or
/// destination (EXTFx).
fn execute_field_ops(d: &DecodedInstruction, regs: &RegisterFile, bus: &mut Bus, mmu: &mut Mmu, cm: u8) -> Result<Control, Fault> {
    let word = Size::Word;
    let width = resolve_final(&d.operands[0], regs, bus, mmu, word, cm)?.read(regs, bus, mmu, word, cm)? & 0x1f;
    let offset = resolve_final(&d.operands[1], regs, bus, mmu, word, cm)?.read(regs, bus, mmu, word, cm)? & 0x1f;
    let mask = if width == 32 { 0xffff_ffffu32 } else { (1u32 << width) - 1 };

    match d.mnemonic.name {
        "INSFW" => {
            let src = resolve_final(&d.operands[2], regs, bus, mmu, word, cm)?.read(regs, bus, mmu, word, cm)?;
            let base_loc = resolve_final(&d.operands[3], regs, bus, mmu, word, cm)?;
            let base = base_loc.read(regs, bus, mmu, word, cm)?;
            let merged = (base & !(mask << offset)) | ((src & mask) << offset);
            base_loc.write(regs, bus, mmu, word, cm, merged)?;
        }
        "EXTFW" => {
            let base = resolve_final(&d.operands[2], regs, bus, mmu, word, cm)?.read(regs, bus, mmu, word, cm)?;
            let dst = resolve_final(&d.operands[3], regs, bus, mmu, word, cm)?;
            let extracted = (base >> offset) & mask;
            dst.write(regs, bus, mmu, word, cm, extracted)?;
            let mut psw = regs.psw();
            apply_flags(&mut psw, bitwise_flags(word, extracted).1);
            regs.set_psw(psw);
        }
        _ => return Err(Fault::Instruction(InstrKind::IllegalOpcode)),
    }
    Ok(Control::Next)
}

fn execute_privileged(
    d: &DecodedInstruction,
    regs: &RegisterFile,
    bus: &mut Bus,
    mmu: &mut Mmu,
    cm: u8,
    exceptions: &ExceptionEngine,
) -> Result<Control, Fault> {
    if regs.psw().cm() != crate::psw::Level::Kernel {
        return Err(Fault::Instruction(InstrKind::PrivilegedOpcode));
    }
    match d.mnemonic.name {
        "CFLUSH" => mmu.flush_caches(),
        "WAIT" => {}
        "ENBVJMP" => mmu.enabled = true,
        "DISVJMP" => mmu.enabled = false,
        "MVERNO" => {
            let dst = resolve_final(&d.operands[0], regs, bus, mmu, Size::Word, cm)?;
            dst.write(regs, bus, mmu, Size::Word, cm, 2)?;
        }
        "INTACK" => {
            let dst = resolve_final(&d.operands[0], regs, bus, mmu, Size::Word, cm)?;
            dst.write(regs, bus, mmu, Size::Word, cm, 0)?;
        }
        // RETG pops the gated PSW then the PC, mirroring the normal
        // exception's push order of PC then PSW (spec.md §4.4 "Normal
        // exception").
        "RETG" => {
            let psw_raw = regs.pop_word(bus)?;
            let ret_pc = regs.pop_word(bus)?;
            regs.set_psw(Psw::new(psw_raw));
            return Ok(Control::Jump(ret_pc));
        }
        "RETPS" => {
            exceptions.return_process(regs, bus, mmu)?;
            return Ok(Control::Jump(regs.pc()));
        }
        "GATE" => {
            let i1 = match resolve(&d.operands[0], regs, Size::Word) {
                Location::Memory(a) => a,
                Location::Register(r) => regs.read(r),
                Location::Immediate(v) => v,
            };
            let i2 = match resolve(&d.operands[1], regs, Size::Word) {
                Location::Memory(a) => a,
                Location::Register(r) => regs.read(r),
                Location::Immediate(v) => v,
            };
            exceptions.gate_traverse(regs, bus, i1, i2)?;
            return Ok(Control::Jump(regs.pc()));
        }
        "CALLPS" => {
            let new_pcbp = match resolve(&d.operands[0], regs, Size::Word) {
                Location::Memory(a) => a,
                Location::Register(r) => regs.read(r),
                Location::Immediate(v) => v,
            };
            exceptions.call_process(regs, bus, mmu, new_pcbp)?;
            return Ok(Control::Jump(regs.pc()));
        }
        _ => return Err(Fault::Instruction(InstrKind::IllegalOpcode)),
    }
    Ok(Control::Next)
}

/// Restartable string primitives (spec.md §4.5 "String operations"): R0
/// holds the remaining count, R1/R2 the source/destination cursors, so a
/// fault midway through can resume after the causing fault is handled.
fn execute_string(d: &DecodedInstruction, regs: &RegisterFile, bus: &mut Bus, mmu: &mut Mmu) -> Result<Control, Fault> {
    let cm = regs.psw().cm() as u8;
    match d.mnemonic.name {
        "MOVBLW" => {
            let mut src = regs.read(0);
            let mut dst = regs.read(1);
            let mut count = regs.read(2);
            while count > 0 {
                let pa_src = mmu.translate(bus, src, crate::fault::AccessCode::Read, cm, true)?;
                let word = bus.read_w(pa_src, AccessSource::Cpu)?;
                let pa_dst = mmu.translate(bus, dst, crate::fault::AccessCode::Write, cm, true)?;
                bus.write_w(pa_dst, word, AccessSource::Cpu)?;
                src = src.wrapping_add(4);
                dst = dst.wrapping_add(4);
                count -= 1;
                regs.write(0, src);
                regs.write(1, dst);
                regs.write(2, count);
            }
        }
        "STRCPY" => {
            let mut src = regs.read(0);
            let mut dst = regs.read(1);
            loop {
                let pa_src = mmu.translate(bus, src, crate::fault::AccessCode::Read, cm, true)?;
                let byte = bus.read_b(pa_src, AccessSource::Cpu)?;
                let pa_dst = mmu.translate(bus, dst, crate::fault::AccessCode::Write, cm, true)?;
                bus.write_b(pa_dst, byte, AccessSource::Cpu)?;
                regs.write(0, src);
                regs.write(1, dst);
                if byte == 0 {
                    break;
                }
                src = src.wrapping_add(1);
                dst = dst.wrapping_add(1);
            }
        }
        "STREND" => {
            let mut cursor = regs.read(1);
            loop {
                let pa = mmu.translate(bus, cursor, crate::fault::AccessCode::Read, cm, true)?;
                let byte = bus.read_b(pa, AccessSource::Cpu)?;
                regs.write(1, cursor);
                if byte == 0 {
                    break;
                }
                cursor = cursor.wrapping_add(1);
            }
        }
        _ => return Err(Fault::Instruction(InstrKind::IllegalOpcode)),
    }
    Ok(Control::Next)
}

fn bcd_add_byte(a: u8, b: u8, carry_in: bool) -> (u8, bool) {
    let mut lo = (a & 0x0f) + (b & 0x0f) + carry_in as u8;
    let mut carry_lo = false;
    if lo > 9 {
        lo -= 10;
        carry_lo = true;
    }
    let mut hi = (a >> 4) + (b >> 4) + carry_lo as u8;
    let mut carry_hi = false;
    if hi > 9 {
        hi -= 10;
        carry_hi = true;
    }
    ((hi << 4) | lo, carry_hi)
}

fn bcd_sub_byte(a: u8, b: u8, borrow_in: bool) -> (u8, bool) {
    let mut lo = (a & 0x0f) as i8 - (b & 0x0f) as i8 - borrow_in as i8;
    let mut borrow_lo = false;
    if lo < 0 {
        lo += 10;
        borrow_lo = true;
    }
    let mut hi = (a >> 4) as i8 - (b >> 4) as i8 - borrow_lo as i8;
    let mut borrow_hi = false;
    if hi < 0 {
        hi += 10;
        borrow_hi = true;
    }
    (((hi as u8) << 4) | (lo as u8), borrow_hi)
}

/// Packed-BCD word add, one byte (two decimal digits) at a time, carrying
/// between bytes through PSW.X (spec.md §4.5 "Decimal operations").
fn bcd_add_word(dest: u32, src: u32, carry_in: bool) -> (u32, bool) {
    let d = dest.to_le_bytes();
    let s = src.to_le_bytes();
    let mut out = [0u8; 4];
    let mut carry = carry_in;
    for i in 0..4 {
        let (byte, c) = bcd_add_byte(d[i], s[i], carry);
        out[i] = byte;
        carry = c;
    }
    (u32::from_le_bytes(out), carry)
}

fn bcd_sub_word(dest: u32, src: u32, borrow_in: bool) -> (u32, bool) {
    let d = dest.to_le_bytes();
    let s = src.to_le_bytes();
    let mut out = [0u8; 4];
    let mut borrow = borrow_in;
    for i in 0..4 {
        let (byte, b) = bcd_sub_byte(d[i], s[i], borrow);
        out[i] = byte;
        borrow = b;
    }
    (u32::from_le_bytes(out), borrow)
}

/// Pack 4 unpacked BCD digits (one per byte, low nibble significant) into
/// 2 packed bytes; the inverse of `bcd_unpack_word` (spec.md §8 "PACKB
/// followed by UNPACKB is the identity").
fn bcd_pack_word(src: u32) -> u32 {
    let b = src.to_le_bytes();
    let byte0 = ((b[0] & 0x0f) << 4) | (b[1] & 0x0f);
    let byte1 = ((b[2] & 0x0f) << 4) | (b[3] & 0x0f);
    u32::from_le_bytes([byte0, byte1, 0, 0])
}

fn bcd_unpack_word(src: u32) -> u32 {
    let b = src.to_le_bytes();
    let d0 = b[0] >> 4;
    let d1 = b[0] & 0x0f;
    let d2 = b[1] >> 4;
    let d3 = b[1] & 0x0f;
    u32::from_le_bytes([d0, d1, d2, d3])
}

/// Decimal (packed-BCD) instructions (spec.md §4.5 "Decimal operations").
/// Carry/borrow chains through PSW.X rather than PSW.C, matching the Rev 3
/// extended-carry convention.
fn execute_decimal(d: &DecodedInstruction, pc: u32, regs: &RegisterFile, bus: &mut Bus, mmu: &mut Mmu, cm: u8) -> Result<Control, Fault> {
    let word = Size::Word;
    match d.mnemonic.name {
        "ADDPB2" => {
            let src = resolve_final(&d.operands[0], regs, bus, mmu, word, cm)?;
            let dst = resolve_final(&d.operands[1], regs, bus, mmu, word, cm)?;
            let a = src.read(regs, bus, mmu, word, cm)?;
            let b = dst.read(regs, bus, mmu, word, cm)?;
            let (result, carry_out) = bcd_add_word(b, a, regs.psw().x());
            dst.write(regs, bus, mmu, word, cm, result)?;
            let mut psw = regs.psw();
            psw.set_x(carry_out);
            apply_flags(&mut psw, bitwise_flags(word, result).1);
            regs.set_psw(psw);
        }
        "ADDPB3" => {
            let a = resolve_final(&d.operands[0], regs, bus, mmu, word, cm)?.read(regs, bus, mmu, word, cm)?;
            let b = resolve_final(&d.operands[1], regs, bus, mmu, word, cm)?.read(regs, bus, mmu, word, cm)?;
            let dst = resolve_final(&d.operands[2], regs, bus, mmu, word, cm)?;
            let (result, carry_out) = bcd_add_word(b, a, regs.psw().x());
            dst.write(regs, bus, mmu, word, cm, result)?;
            let mut psw = regs.psw();
            psw.set_x(carry_out);
            apply_flags(&mut psw, bitwise_flags(word, result).1);
            regs.set_psw(psw);
        }
        "SUBPB2" => {
            let src = resolve_final(&d.operands[0], regs, bus, mmu, word, cm)?;
            let dst = resolve_final(&d.operands[1], regs, bus, mmu, word, cm)?;
            let a = src.read(regs, bus, mmu, word, cm)?;
            let b = dst.read(regs, bus, mmu, word, cm)?;
            let (result, borrow_out) = bcd_sub_word(b, a, regs.psw().x());
            dst.write(regs, bus, mmu, word, cm, result)?;
            let mut psw = regs.psw();
            psw.set_x(borrow_out);
            apply_flags(&mut psw, bitwise_flags(word, result).1);
            regs.set_psw(psw);
        }
        "SUBPB3" => {
            let a = resolve_final(&d.operands[0], regs, bus, mmu, word, cm)?.read(regs, bus, mmu, word, cm)?;
            let b = resolve_final(&d.operands[1], regs, bus, mmu, word, cm)?.read(regs, bus, mmu, word, cm)?;
            let dst = resolve_final(&d.operands[2], regs, bus, mmu, word, cm)?;
            let (result, borrow_out) = bcd_sub_word(b, a, regs.psw().x());
            dst.write(regs, bus, mmu, word, cm, result)?;
            let mut psw = regs.psw();
            psw.set_x(borrow_out);
            apply_flags(&mut psw, bitwise_flags(word, result).1);
            regs.set_psw(psw);
        }
        "PACKB" => {
            let src = resolve_final(&d.operands[0], regs, bus, mmu, word, cm)?.read(regs, bus, mmu, word, cm)?;
            let dst = resolve_final(&d.operands[1], regs, bus, mmu, word, cm)?;
            let packed = bcd_pack_word(src);
            dst.write(regs, bus, mmu, word, cm, packed)?;
            let mut psw = regs.psw();
            apply_flags(&mut psw, bitwise_flags(word, packed).1);
            regs.set_psw(psw);
        }
        "UNPACKB" => {
            let src = resolve_final(&d.operands[0], regs, bus, mmu, word, cm)?.read(regs, bus, mmu, word, cm)?;
            let dst = resolve_final(&d.operands[1], regs, bus, mmu, word, cm)?;
            let unpacked = bcd_unpack_word(src);
            dst.write(regs, bus, mmu, word, cm, unpacked)?;
            let mut psw = regs.psw();
            apply_flags(&mut psw, bitwise_flags(word, unpacked).1);
            regs.set_psw(psw);
        }
        "SETX" => {
            let mut psw = regs.psw();
            psw.set_x(true);
            regs.set_psw(psw);
        }
        "CLRX" => {
            let mut psw = regs.psw();
            psw.set_x(false);
            regs.set_psw(psw);
        }
        "CASWI" => {
            let a = resolve_final(&d.operands[0], regs, bus, mmu, word, cm)?.read(regs, bus, mmu, word, cm)?;
            let b = resolve_final(&d.operands[1], regs, bus, mmu, word, cm)?.read(regs, bus, mmu, word, cm)?;
            let mut psw = regs.psw();
            psw.set_x(a == b);
            regs.set_psw(psw);
        }
        "DTB" | "DTH" | "TEDTB" | "TEDTH" | "TGDTB" | "TGDTH" | "TGEDTB" | "TGEDTH" | "TNEDTB" | "TNEDTH" => {
            return execute_decrement_branch(d, pc, regs, bus, mmu, cm);
        }
        _ => return Err(Fault::Instruction(InstrKind::IllegalOpcode)),
    }
    Ok(Control::Next)
}

/// Decrement, set flags, and conditionally branch (spec.md §4.5 "Decimal
/// operations": the DTx/TxDTx family). Shares its condition-evaluate shape
/// with the Bxx branches in `execute_control_flow`.
fn execute_decrement_branch(
    d: &DecodedInstruction,
    pc: u32,
    regs: &RegisterFile,
    bus: &mut Bus,
    mmu: &mut Mmu,
    cm: u8,
) -> Result<Control, Fault> {
    let size = d.mnemonic.dtype;
    let loc = resolve_final(&d.operands[0], regs, bus, mmu, size, cm)?;
    let v = loc.read(regs, bus, mmu, size, cm)?;
    let (result, flags) = sub_flags(size, v, 1);
    loc.write(regs, bus, mmu, size, cm, result.inner())?;
    let mut psw = regs.psw();
    apply_flags(&mut psw, flags);
    regs.set_psw(psw);

    let cond = match d.mnemonic.name {
        "TEDTB" | "TEDTH" => Condition::Equal,
        "TGDTB" | "TGDTH" => Condition::Greater,
        "TGEDTB" | "TGEDTH" => Condition::GreaterEqual,
        _ => Condition::NotEqual, // DTB/DTH/TNEDTB/TNEDTH
    };
    if !cond.evaluate(psw.n(), psw.z(), psw.c(), psw.v()) {
        return Ok(Control::Next);
    }
    let disp = match &d.operands[1].mode {
        EAMode::ByteImmediate(b) => *b as i8 as i32,
        _ => 0,
    };
    Ok(Control::Jump(pc.wrapping_add(disp as u32)))
}

/// Coprocessor dispatch (spec.md §4.5 "Coprocessor operations"): broadcast
/// the coprocessor word and its operands' effective addresses to the
/// math-accelerator mailbox before reporting no-answer, since this crate
/// does not model an attached coprocessor.
const COPROCESSOR_MAILBOX: u32 = 0x4000_0000;

fn execute_coprocessor(d: &DecodedInstruction, regs: &RegisterFile, bus: &mut Bus, mmu: &mut Mmu, cm: u8) -> Result<Control, Fault> {
    let _ = mmu;
    let word = match d.operands[0].mode {
        EAMode::WordImmediate(w) => w,
        _ => 0,
    };
    // No coprocessor is attached to the bus, so the mailbox write is a
    // bus miss; broadcast best-effort and fault regardless of the outcome.
    let _ = bus.write_w(COPROCESSOR_MAILBOX, word, AccessSource::Cpu);
    let mut slot = COPROCESSOR_MAILBOX.wrapping_add(4);
    for op in d.operands.iter().skip(1) {
        if let Location::Memory(ea) = resolve(op, regs, Size::Word) {
            let _ = bus.write_w(slot, ea, AccessSource::Cpu);
        }
        slot = slot.wrapping_add(4);
    }
    let _ = cm;
    Err(Fault::CoprocessorNoAnswer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::decode::decode;
    use crate::registers::Revision;

    fn setup() -> (RegisterFile, Bus, Mmu, ExceptionEngine) {
        let regs = RegisterFile::new(Revision::Rev3);
        let bus = Bus::new(0x10000, 0x1000, 0, 0x100000);
        let mmu = Mmu::new(Revision::Rev3);
        let exceptions = ExceptionEngine::new();
        (regs, bus, mmu, exceptions)
    }

    #[test]
    fn addw3_carries_into_destination_register() {
        let (regs, mut bus, mut mmu, exceptions) = setup();
        regs.write(1, 0xffff_ffff);
        regs.write(2, 1);
        // ADDW3 %r1,%r2,%r3
        bus.write_b(0, 0xdc, AccessSource::Cpu).unwrap();
        bus.write_b(1, 0x41, AccessSource::Cpu).unwrap();
        bus.write_b(2, 0x42, AccessSource::Cpu).unwrap();
        bus.write_b(3, 0x43, AccessSource::Cpu).unwrap();
        let decoded = decode(&mut bus, 0).unwrap();
        execute(&decoded, 0, &regs, &mut bus, &mut mmu, &exceptions).unwrap();
        assert_eq!(regs.read(3), 0);
        assert!(regs.psw().c());
        assert!(regs.psw().z());
    }

    #[test]
    fn clrw_zeroes_register_and_sets_z() {
        let (regs, mut bus, mut mmu, exceptions) = setup();
        regs.write(0, 0xdead_beef);
        bus.write_b(0, 0x80, AccessSource::Cpu).unwrap();
        bus.write_b(1, 0x40, AccessSource::Cpu).unwrap();
        let decoded = decode(&mut bus, 0).unwrap();
        execute(&decoded, 0, &regs, &mut bus, &mut mmu, &exceptions).unwrap();
        assert_eq!(regs.read(0), 0);
        assert!(regs.psw().z());
    }

    #[test]
    fn divw2_by_zero_faults() {
        let (regs, mut bus, mut mmu, exceptions) = setup();
        regs.write(1, 0);
        regs.write(2, 10);
        bus.write_b(0, 0xac, AccessSource::Cpu).unwrap();
        bus.write_b(1, 0x41, AccessSource::Cpu).unwrap();
        bus.write_b(2, 0x42, AccessSource::Cpu).unwrap();
        let decoded = decode(&mut bus, 0).unwrap();
        let err = execute(&decoded, 0, &regs, &mut bus, &mut mmu, &exceptions).unwrap_err();
        assert_eq!(err, Fault::IntegerZeroDivide);
    }

    #[test]
    fn packb_then_unpackb_is_identity() {
        let (regs, mut bus, mut mmu, exceptions) = setup();
        regs.write(1, 0x01020304);
        // PACKB %r1,%r2
        bus.write_b(0, 0x30, AccessSource::Cpu).unwrap();
        bus.write_b(1, 0x78, AccessSource::Cpu).unwrap();
        bus.write_b(2, 0x41, AccessSource::Cpu).unwrap();
        bus.write_b(3, 0x42, AccessSource::Cpu).unwrap();
        let decoded = decode(&mut bus, 0).unwrap();
        execute(&decoded, 0, &regs, &mut bus, &mut mmu, &exceptions).unwrap();
        let packed = regs.read(2);

        regs.write(2, packed);
        // UNPACKB %r2,%r3
        bus.write_b(4, 0x30, AccessSource::Cpu).unwrap();
        bus.write_b(5, 0x7a, AccessSource::Cpu).unwrap();
        bus.write_b(6, 0x42, AccessSource::Cpu).unwrap();
        bus.write_b(7, 0x43, AccessSource::Cpu).unwrap();
        let decoded = decode(&mut bus, 4).unwrap();
        execute(&decoded, 4, &regs, &mut bus, &mut mmu, &exceptions).unwrap();
        assert_eq!(regs.read(3), 0x01020304);
    }

    #[test]
    fn coprocessor_op_broadcasts_then_reports_no_answer() {
        let (regs, mut bus, mut mmu, exceptions) = setup();
        regs.write(1, 0);
        regs.write(2, 0);
        // SPOP %r1,%r2 with coprocessor word 0x1234
        bus.write_b(0, 0x30, AccessSource::Cpu).unwrap();
        bus.write_b(1, 0x96, AccessSource::Cpu).unwrap();
        bus.write_b(2, 0x34, AccessSource::Cpu).unwrap();
        bus.write_b(3, 0x12, AccessSource::Cpu).unwrap();
        bus.write_b(4, 0x41, AccessSource::Cpu).unwrap();
        bus.write_b(5, 0x42, AccessSource::Cpu).unwrap();
        let decoded = decode(&mut bus, 0).unwrap();
        let err = execute(&decoded, 0, &regs, &mut bus, &mut mmu, &exceptions).unwrap_err();
        assert_eq!(err, Fault::CoprocessorNoAnswer);
    }
}
