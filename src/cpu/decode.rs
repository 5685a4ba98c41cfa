// Instruction decode: primary (256-entry) and secondary (0x30-escape)
// opcode tables, plus descriptor-byte operand decode (spec.md §4.5
// "Instruction encoding" / "Operand decode"). Grounded in `3b2_cpu.h`'s
// `opcode`/`addr_mode` enums and `3b2_cpu.c`'s `decode_instruction`/
// `decode_operand` for byte layout and mode numbering.
//
// Decoding never mutates architectural state (spec.md §4.5: "guaranteed
// side-effect-free"); it only consumes bytes from the instruction stream
// through the Bus, which is itself stateless from the decoder's view.

use crate::bus::{AccessSource, Bus};
use crate::cpu::fields::{Condition, EAMode, Size};
use crate::cpu::instructions::{Category, Instruction};
use crate::fault::{Fault, InstrKind};

/// How an instruction's trailing bytes are structured (spec.md §4.5
/// "operand format"), matching `op_mode` in `3b2_cpu.h`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OperandFormat {
    None,
    Descriptor(u8),
    ByteDisplacement,
    HalfDisplacement,
    Coprocessor,
    /// A descriptor operand (the decrement target) followed by a trailing
    /// byte branch displacement (spec.md §4.5 "Decimal operations": the
    /// DTx/TxDTx family).
    DecrementBranch,
    /// A leading coprocessor word followed by `n` descriptor operands
    /// (spec.md §4.5 "Coprocessor operations").
    CoprocessorWithOperands(u8),
}

#[derive(Debug, Copy, Clone)]
pub struct Mnemonic {
    pub name: &'static str,
    pub opcode: u16,
    pub format: OperandFormat,
    pub dtype: Size,
    pub category: Category,
}

/// A decoded operand: its addressing mode plus the expanded-type prefix,
/// if the operand carried one (spec.md §4.5 "expanded datatype prefix").
#[derive(Debug, Copy, Clone)]
pub struct DecodedOperand {
    pub mode: EAMode,
    pub etype: Option<Size>,
}

pub struct DecodedInstruction {
    pub mnemonic: Mnemonic,
    pub operands: Vec<DecodedOperand>,
    pub length: u32,
}

struct Reader<'a> {
    bus: &'a mut Bus,
    pc: u32,
    offset: u32,
}

impl<'a> Reader<'a> {
    fn byte(&mut self) -> Result<u8, Fault> {
        let v = self.bus.read_b(self.pc + self.offset, AccessSource::Cpu)?;
        self.offset += 1;
        Ok(v)
    }
    fn half(&mut self) -> Result<u16, Fault> {
        let lo = self.byte()? as u16;
        let hi = self.byte()? as u16;
        Ok(lo | (hi << 8))
    }
    fn word(&mut self) -> Result<u32, Fault> {
        let lo = self.half()? as u32;
        let hi = self.half()? as u32;
        Ok(lo | (hi << 16))
    }
}

/// Decode one descriptor-byte operand (spec.md §4.5; `3b2_cpu.c`'s
/// `decode_operand`). Recurses once for the expanded-datatype prefix.
fn decode_descriptor(r: &mut Reader, default_dtype: Size) -> Result<DecodedOperand, Fault> {
    let desc = r.byte()?;

    // Rev 3 prefix bytes (spec.md §4.5 "Rev 3 adds").
    match desc {
        0x5b => {
            let tail = r.byte()?;
            let mode = (tail >> 5) & 0x7;
            let reg = (tail & 0x1f) as usize;
            let ea = match mode {
                0b000 => EAMode::AutoPreDecrement(reg),
                0b010 => EAMode::AutoPostDecrement(reg),
                0b100 => EAMode::AutoPreIncrement(reg),
                0b110 => EAMode::AutoPostIncrement(reg),
                _ => return Err(Fault::Instruction(InstrKind::InvalidDescriptor)),
            };
            return Ok(DecodedOperand { mode: ea, etype: None });
        }
        0xab => {
            let tail = r.byte()?;
            let base = ((tail >> 4) & 0xf) as usize;
            let idx = ((tail & 0xf) + 16) as usize;
            let disp = r.byte()? as i8;
            return Ok(DecodedOperand { mode: EAMode::IndexedByteDisplacement(base, idx, disp), etype: None });
        }
        0xbb => {
            let tail = r.byte()?;
            let base = ((tail >> 4) & 0xf) as usize;
            let idx = ((tail & 0xf) + 16) as usize;
            let disp = r.half()? as i16;
            return Ok(DecodedOperand { mode: EAMode::IndexedHalfDisplacement(base, idx, disp), etype: None });
        }
        0xdb => {
            let tail = r.byte()?;
            let base = ((tail >> 4) & 0xf) as usize;
            let idx = ((tail & 0xf) + 16) as usize;
            return Ok(DecodedOperand { mode: EAMode::IndexedScaled(base, idx), etype: None });
        }
        0xcb => {
            let tail = r.byte()?;
            let mode = (tail >> 4) & 0xf;
            let reg = ((tail & 0xf) + 16) as usize;
            return decode_by_mode(r, mode, reg, default_dtype);
        }
        _ => {}
    }

    let mode = (desc >> 4) & 0xf;
    let reg = (desc & 0xf) as usize;
    decode_by_mode(r, mode, reg, default_dtype)
}

fn decode_by_mode(r: &mut Reader, mode: u8, reg: usize, default_dtype: Size) -> Result<DecodedOperand, Fault> {
    let ea = match mode {
        0..=3 => EAMode::PositiveLiteral(((mode as usize) << 4 | reg) as u8),
        4 => {
            if reg == 15 {
                EAMode::WordImmediate(r.word()?)
            } else {
                EAMode::Register(reg)
            }
        }
        5 => {
            if reg == 15 {
                EAMode::HalfImmediate(r.half()?)
            } else if reg == 11 {
                return Err(Fault::Instruction(InstrKind::InvalidDescriptor));
            } else {
                EAMode::RegisterDeferred(reg)
            }
        }
        6 => {
            if reg == 15 {
                EAMode::ByteImmediate(r.byte()?)
            } else {
                EAMode::FpShortOffset(reg as u8)
            }
        }
        7 => {
            if reg == 15 {
                EAMode::Absolute(r.word()?)
            } else {
                EAMode::ApShortOffset(reg as u8)
            }
        }
        8 => EAMode::WordDisplacement(reg, r.word()? as i32),
        9 => EAMode::WordDisplacementDeferred(reg, r.word()? as i32),
        10 => EAMode::HalfDisplacement(reg, r.half()? as i16),
        11 => EAMode::HalfDisplacementDeferred(reg, r.half()? as i16),
        12 => EAMode::ByteDisplacement(reg, r.byte()? as i8),
        13 => EAMode::ByteDisplacementDeferred(reg, r.byte()? as i8),
        14 => {
            return match reg {
                15 => Ok(DecodedOperand { mode: EAMode::AbsoluteDeferred(r.word()?), etype: None }),
                0 | 2 | 3 | 4 | 6 | 7 => {
                    let etype = Size::from_datatype(reg as u8);
                    let mut inner = decode_descriptor(r, etype)?;
                    inner.etype = Some(etype);
                    Ok(inner)
                }
                _ => Err(Fault::Instruction(InstrKind::ReservedDatatype)),
            };
        }
        15 => EAMode::NegativeLiteral((0xf0 | reg) as u8),
        _ => return Err(Fault::Instruction(InstrKind::InvalidDescriptor)),
    };
    let _ = default_dtype;
    Ok(DecodedOperand { mode: ea, etype: None })
}

/// Decode the instruction at `pc`. Returns the decoded form and its total
/// byte length; never mutates the bus or registers (spec.md §4.5).
pub fn decode(bus: &mut Bus, pc: u32) -> Result<DecodedInstruction, Fault> {
    let mut r = Reader { bus, pc, offset: 0 };
    let b1 = r.byte()?;
    let mn = if b1 == 0x30 {
        let b2 = r.byte()?;
        let hword = ((b1 as u16) << 8) | b2 as u16;
        secondary_opcode(hword).ok_or(Fault::Instruction(InstrKind::IllegalOpcode))?
    } else {
        primary_opcode(b1).ok_or(Fault::Instruction(InstrKind::IllegalOpcode))?
    };

    let mut operands = Vec::new();
    match mn.format {
        OperandFormat::None => {}
        OperandFormat::ByteDisplacement => {
            let b = r.byte()? as i8;
            operands.push(DecodedOperand { mode: EAMode::ByteImmediate(b as u8), etype: None });
        }
        OperandFormat::HalfDisplacement => {
            let h = r.half()? as i16;
            operands.push(DecodedOperand { mode: EAMode::HalfImmediate(h as u16), etype: None });
        }
        OperandFormat::Coprocessor => {
            let w = r.word()?;
            operands.push(DecodedOperand { mode: EAMode::WordImmediate(w), etype: None });
        }
        OperandFormat::Descriptor(count) => {
            for _ in 0..count {
                operands.push(decode_descriptor(&mut r, mn.dtype)?);
            }
        }
        OperandFormat::DecrementBranch => {
            operands.push(decode_descriptor(&mut r, mn.dtype)?);
            let b = r.byte()? as i8;
            operands.push(DecodedOperand { mode: EAMode::ByteImmediate(b as u8), etype: None });
        }
        OperandFormat::CoprocessorWithOperands(count) => {
            let w = r.word()?;
            operands.push(DecodedOperand { mode: EAMode::WordImmediate(w), etype: None });
            for _ in 0..count {
                operands.push(decode_descriptor(&mut r, mn.dtype)?);
            }
        }
    }

    Ok(DecodedInstruction { mnemonic: mn, operands, length: r.offset })
}

macro_rules! mn {
    ($name:expr, $opcode:expr, $fmt:expr, $dtype:expr, $cat:expr) => {
        Mnemonic { name: $name, opcode: $opcode, format: $fmt, dtype: $dtype, category: $cat }
    };
}

/// Primary (single-byte) opcode table. Covers a representative instruction
/// set across every category spec.md §4.5 names; the full historical
/// WE32100 ISA has ~190 primary entries, not all of which are modeled
/// (see DESIGN.md).
fn primary_opcode(op: u8) -> Option<Mnemonic> {
    use Category::*;
    use OperandFormat::*;
    use Size::*;
    Some(match op {
        0x04 => mn!("MOVAW", 0x04, Descriptor(2), Word, DataMovement),
        0x05 => mn!("LRA", 0x05, Descriptor(2), Word, DataMovement),
        0x0c => mn!("MOVTRW", 0x0c, Descriptor(2), Word, DataMovement),
        0x1c => mn!("SWAPWI", 0x1c, Descriptor(1), Word, DataMovement),
        0x1e => mn!("SWAPHI", 0x1e, Descriptor(1), Half, DataMovement),
        0x1f => mn!("SWAPBI", 0x1f, Descriptor(1), Byte, DataMovement),
        0x20 => mn!("POPW", 0x20, Descriptor(1), Word, DataMovement),
        0x24 => mn!("JMP", 0x24, Descriptor(1), Word, ControlFlow),
        0x27 => mn!("CFLUSH", 0x27, None, Word, Privileged),
        0x28 => mn!("TSTW", 0x28, Descriptor(1), Word, BitOps),
        0x2a => mn!("TSTH", 0x2a, Descriptor(1), Half, BitOps),
        0x2b => mn!("TSTB", 0x2b, Descriptor(1), Byte, BitOps),
        0x2c => mn!("CALL", 0x2c, Descriptor(2), Word, ControlFlow),
        0x2e => mn!("BPT", 0x2e, None, Word, ControlFlow),
        0x2f => mn!("WAIT", 0x2f, None, Word, Privileged),
        0x34 => mn!("JSB", 0x34, Descriptor(1), Word, ControlFlow),
        0x36 => mn!("BSBH", 0x36, HalfDisplacement, Word, ControlFlow),
        0x37 => mn!("BSBB", 0x37, ByteDisplacement, Word, ControlFlow),
        0x38 => mn!("BITW", 0x38, Descriptor(2), Word, BitOps),
        0x3a => mn!("BITH", 0x3a, Descriptor(2), Half, BitOps),
        0x3b => mn!("BITB", 0x3b, Descriptor(2), Byte, BitOps),
        0x3c => mn!("CMPW", 0x3c, Descriptor(2), Word, Arithmetic),
        0x3e => mn!("CMPH", 0x3e, Descriptor(2), Half, Arithmetic),
        0x3f => mn!("CMPB", 0x3f, Descriptor(2), Byte, Arithmetic),
        0x42 => mn!("BGEH", 0x42, HalfDisplacement, Word, ControlFlow),
        0x43 => mn!("BGEB", 0x43, ByteDisplacement, Word, ControlFlow),
        0x46 => mn!("BGH", 0x46, HalfDisplacement, Word, ControlFlow),
        0x47 => mn!("BGB", 0x47, ByteDisplacement, Word, ControlFlow),
        0x4a => mn!("BLH", 0x4a, HalfDisplacement, Word, ControlFlow),
        0x4b => mn!("BLB", 0x4b, ByteDisplacement, Word, ControlFlow),
        0x4e => mn!("BLEH", 0x4e, HalfDisplacement, Word, ControlFlow),
        0x4f => mn!("BLEB", 0x4f, ByteDisplacement, Word, ControlFlow),
        0x52 => mn!("BGEUH", 0x52, HalfDisplacement, Word, ControlFlow),
        0x53 => mn!("BGEUB", 0x53, ByteDisplacement, Word, ControlFlow),
        0x56 => mn!("BGUH", 0x56, HalfDisplacement, Word, ControlFlow),
        0x57 => mn!("BGUB", 0x57, ByteDisplacement, Word, ControlFlow),
        0x5a => mn!("BLUH", 0x5a, HalfDisplacement, Word, ControlFlow),
        0x5b => mn!("BLUB", 0x5b, ByteDisplacement, Word, ControlFlow),
        0x5e => mn!("BLEUH", 0x5e, HalfDisplacement, Word, ControlFlow),
        0x5f => mn!("BLEUB", 0x5f, ByteDisplacement, Word, ControlFlow),
        0x62 => mn!("BVCH", 0x62, HalfDisplacement, Word, ControlFlow),
        0x63 => mn!("BVCB", 0x63, ByteDisplacement, Word, ControlFlow),
        0x6a => mn!("BVSH", 0x6a, HalfDisplacement, Word, ControlFlow),
        0x6b => mn!("BVSB", 0x6b, ByteDisplacement, Word, ControlFlow),
        0x70 => mn!("NOP", 0x70, None, Word, ControlFlow),
        0x76 => mn!("BNEH", 0x76, HalfDisplacement, Word, ControlFlow),
        0x77 => mn!("BNEB", 0x77, ByteDisplacement, Word, ControlFlow),
        0x78 => mn!("RSB", 0x78, None, Word, ControlFlow),
        0x7a => mn!("BRH", 0x7a, HalfDisplacement, Word, ControlFlow),
        0x7b => mn!("BRB", 0x7b, ByteDisplacement, Word, ControlFlow),
        0x7e => mn!("BEH", 0x7e, HalfDisplacement, Word, ControlFlow),
        0x7f => mn!("BEB", 0x7f, ByteDisplacement, Word, ControlFlow),
        0x80 => mn!("CLRW", 0x80, Descriptor(1), Word, DataMovement),
        0x82 => mn!("CLRH", 0x82, Descriptor(1), Half, DataMovement),
        0x83 => mn!("CLRB", 0x83, Descriptor(1), Byte, DataMovement),
        0x84 => mn!("MOVW", 0x84, Descriptor(2), Word, DataMovement),
        0x86 => mn!("MOVH", 0x86, Descriptor(2), Half, DataMovement),
        0x87 => mn!("MOVB", 0x87, Descriptor(2), Byte, DataMovement),
        0x88 => mn!("MCOMW", 0x88, Descriptor(2), Word, Arithmetic),
        0x8a => mn!("MCOMH", 0x8a, Descriptor(2), Half, Arithmetic),
        0x8b => mn!("MCOMB", 0x8b, Descriptor(2), Byte, Arithmetic),
        0x8c => mn!("MNEGW", 0x8c, Descriptor(2), Word, Arithmetic),
        0x8e => mn!("MNEGH", 0x8e, Descriptor(2), Half, Arithmetic),
        0x8f => mn!("MNEGB", 0x8f, Descriptor(2), Byte, Arithmetic),
        0x90 => mn!("INCW", 0x90, Descriptor(1), Word, Arithmetic),
        0x92 => mn!("INCH", 0x92, Descriptor(1), Half, Arithmetic),
        0x93 => mn!("INCB", 0x93, Descriptor(1), Byte, Arithmetic),
        0x94 => mn!("DECW", 0x94, Descriptor(1), Word, Arithmetic),
        0x96 => mn!("DECH", 0x96, Descriptor(1), Half, Arithmetic),
        0x97 => mn!("DECB", 0x97, Descriptor(1), Byte, Arithmetic),
        0x9c => mn!("ADDW2", 0x9c, Descriptor(2), Word, Arithmetic),
        0x9e => mn!("ADDH2", 0x9e, Descriptor(2), Half, Arithmetic),
        0x9f => mn!("ADDB2", 0x9f, Descriptor(2), Byte, Arithmetic),
        0xa0 => mn!("PUSHW", 0xa0, Descriptor(1), Word, DataMovement),
        0xa4 => mn!("MODW2", 0xa4, Descriptor(2), Word, Arithmetic),
        0xa6 => mn!("MODH2", 0xa6, Descriptor(2), Half, Arithmetic),
        0xa7 => mn!("MODB2", 0xa7, Descriptor(2), Byte, Arithmetic),
        0xa8 => mn!("MULW2", 0xa8, Descriptor(2), Word, Arithmetic),
        0xaa => mn!("MULH2", 0xaa, Descriptor(2), Half, Arithmetic),
        0xab => mn!("MULB2", 0xab, Descriptor(2), Byte, Arithmetic),
        0xac => mn!("DIVW2", 0xac, Descriptor(2), Word, Arithmetic),
        0xae => mn!("DIVH2", 0xae, Descriptor(2), Half, Arithmetic),
        0xaf => mn!("DIVB2", 0xaf, Descriptor(2), Byte, Arithmetic),
        0xb0 => mn!("ORW2", 0xb0, Descriptor(2), Word, Logic),
        0xb2 => mn!("ORH2", 0xb2, Descriptor(2), Half, Logic),
        0xb3 => mn!("ORB2", 0xb3, Descriptor(2), Byte, Logic),
        0xb4 => mn!("XORW2", 0xb4, Descriptor(2), Word, Logic),
        0xb6 => mn!("XORH2", 0xb6, Descriptor(2), Half, Logic),
        0xb7 => mn!("XORB2", 0xb7, Descriptor(2), Byte, Logic),
        0xb8 => mn!("ANDW2", 0xb8, Descriptor(2), Word, Logic),
        0xba => mn!("ANDH2", 0xba, Descriptor(2), Half, Logic),
        0xbb => mn!("ANDB2", 0xbb, Descriptor(2), Byte, Logic),
        0xbc => mn!("SUBW2", 0xbc, Descriptor(2), Word, Arithmetic),
        0xbe => mn!("SUBH2", 0xbe, Descriptor(2), Half, Arithmetic),
        0xbf => mn!("SUBB2", 0xbf, Descriptor(2), Byte, Arithmetic),
        0xc0 => mn!("ALSW3", 0xc0, Descriptor(3), Word, Logic),
        0xc4 => mn!("ARSW3", 0xc4, Descriptor(3), Word, Logic),
        0xc6 => mn!("ARSH3", 0xc6, Descriptor(3), Half, Logic),
        0xc7 => mn!("ARSB3", 0xc7, Descriptor(3), Byte, Logic),
        0xc8 => mn!("INSFW", 0xc8, Descriptor(4), Word, FieldOps),
        0xcc => mn!("EXTFW", 0xcc, Descriptor(4), Word, FieldOps),
        0xd0 => mn!("LLSW3", 0xd0, Descriptor(3), Word, Logic),
        0xd4 => mn!("LRSW3", 0xd4, Descriptor(3), Word, Logic),
        0xd8 => mn!("ROTW", 0xd8, Descriptor(2), Word, Logic),
        0xdc => mn!("ADDW3", 0xdc, Descriptor(3), Word, Arithmetic),
        0xde => mn!("ADDH3", 0xde, Descriptor(3), Half, Arithmetic),
        0xdf => mn!("ADDB3", 0xdf, Descriptor(3), Byte, Arithmetic),
        0xe0 => mn!("PUSHAW", 0xe0, Descriptor(1), Word, DataMovement),
        0xe8 => mn!("MULW3", 0xe8, Descriptor(3), Word, Arithmetic),
        0xec => mn!("DIVW3", 0xec, Descriptor(3), Word, Arithmetic),
        0xf0 => mn!("ORW3", 0xf0, Descriptor(3), Word, Logic),
        0xf8 => mn!("ANDW3", 0xf8, Descriptor(3), Word, Logic),
        0xfc => mn!("SUBW3", 0xfc, Descriptor(3), Word, Arithmetic),
        0xfe => mn!("SUBH3", 0xfe, Descriptor(3), Half, Arithmetic),
        0xff => mn!("SUBB3", 0xff, Descriptor(3), Byte, Arithmetic),
        0x10 => mn!("SAVE", 0x10, Descriptor(1), Word, ControlFlow),
        0x18 => mn!("RESTORE", 0x18, Descriptor(1), Word, ControlFlow),
        0x08 => mn!("RET", 0x08, None, Word, ControlFlow),
        _ => return None,
    })
}

/// Secondary (0x30-escape) opcode table, used for privileged/string/
/// coprocessor operations (spec.md §4.5 "Opcode 0x30 escapes").
fn secondary_opcode(op: u16) -> Option<Mnemonic> {
    use Category::*;
    use OperandFormat::*;
    use Size::*;
    Some(match op {
        0x3009 => mn!("MVERNO", 0x3009, Descriptor(1), Word, Privileged),
        0x300d => mn!("ENBVJMP", 0x300d, None, Word, Privileged),
        0x3013 => mn!("DISVJMP", 0x3013, None, Word, Privileged),
        0x3019 => mn!("MOVBLW", 0x3019, None, Word, Str),
        0x301f => mn!("STREND", 0x301f, None, Word, Str),
        0x302f => mn!("INTACK", 0x302f, Descriptor(1), Word, Privileged),
        0x3035 => mn!("STRCPY", 0x3035, None, Word, Str),
        0x3045 => mn!("RETG", 0x3045, None, Word, Privileged),
        0x3061 => mn!("GATE", 0x3061, Descriptor(2), Word, Privileged),
        0x30ac => mn!("CALLPS", 0x30ac, Descriptor(1), Word, Privileged),
        0x30c8 => mn!("RETPS", 0x30c8, None, Word, Privileged),
        0x3070 => mn!("ADDPB2", 0x3070, Descriptor(2), Word, Decimal),
        0x3072 => mn!("ADDPB3", 0x3072, Descriptor(3), Word, Decimal),
        0x3074 => mn!("SUBPB2", 0x3074, Descriptor(2), Word, Decimal),
        0x3076 => mn!("SUBPB3", 0x3076, Descriptor(3), Word, Decimal),
        0x3078 => mn!("PACKB", 0x3078, Descriptor(2), Word, Decimal),
        0x307a => mn!("UNPACKB", 0x307a, Descriptor(2), Word, Decimal),
        0x307c => mn!("DTB", 0x307c, DecrementBranch, Byte, Decimal),
        0x307e => mn!("DTH", 0x307e, DecrementBranch, Half, Decimal),
        0x3080 => mn!("TEDTB", 0x3080, DecrementBranch, Byte, Decimal),
        0x3082 => mn!("TEDTH", 0x3082, DecrementBranch, Half, Decimal),
        0x3084 => mn!("TGDTB", 0x3084, DecrementBranch, Byte, Decimal),
        0x3086 => mn!("TGDTH", 0x3086, DecrementBranch, Half, Decimal),
        0x3088 => mn!("TGEDTB", 0x3088, DecrementBranch, Byte, Decimal),
        0x308a => mn!("TGEDTH", 0x308a, DecrementBranch, Half, Decimal),
        0x308c => mn!("TNEDTB", 0x308c, DecrementBranch, Byte, Decimal),
        0x308e => mn!("TNEDTH", 0x308e, DecrementBranch, Half, Decimal),
        0x3090 => mn!("CASWI", 0x3090, Descriptor(2), Word, Decimal),
        0x3092 => mn!("SETX", 0x3092, None, Word, Decimal),
        0x3094 => mn!("CLRX", 0x3094, None, Word, Decimal),
        0x3096 => mn!("SPOP", 0x3096, CoprocessorWithOperands(2), Word, Coprocessor),
        0x3098 => mn!("SPOPRD", 0x3098, CoprocessorWithOperands(2), Word, Coprocessor),
        0x309a => mn!("SPOPRS", 0x309a, CoprocessorWithOperands(2), Word, Coprocessor),
        0x309c => mn!("SPOPRT", 0x309c, CoprocessorWithOperands(2), Word, Coprocessor),
        0x309e => mn!("SPOPD2", 0x309e, CoprocessorWithOperands(2), Word, Coprocessor),
        0x30a0 => mn!("SPOPS2", 0x30a0, CoprocessorWithOperands(2), Word, Coprocessor),
        0x30a2 => mn!("SPOPT2", 0x30a2, CoprocessorWithOperands(2), Word, Coprocessor),
        0x30a4 => mn!("SPOPWD", 0x30a4, CoprocessorWithOperands(2), Word, Coprocessor),
        0x30a6 => mn!("SPOPWS", 0x30a6, CoprocessorWithOperands(2), Word, Coprocessor),
        0x30a8 => mn!("SPOPWT", 0x30a8, CoprocessorWithOperands(2), Word, Coprocessor),
        _ => return None,
    })
}

/// Condition derived from a conditional branch/return mnemonic's low
/// nibble, used by `execute.rs` (spec.md §4.5 "Control flow").
pub fn condition_for(name: &str) -> Condition {
    if name.starts_with("BGE") || name.starts_with("RGEQ") {
        Condition::GreaterEqual
    } else if name.starts_with("BG") || name.starts_with("RGTR") {
        Condition::Greater
    } else if name.starts_with("BLE") || name.starts_with("RLEQ") {
        Condition::LessEqual
    } else if name.starts_with("BL") || name.starts_with("RLSS") {
        Condition::Less
    } else if name.starts_with("BNE") || name.starts_with("RNEQ") {
        Condition::NotEqual
    } else if name.starts_with("BE") || name.starts_with("REQL") {
        Condition::Equal
    } else if name.starts_with("BVC") || name.starts_with("RVC") {
        Condition::OverflowClear
    } else if name.starts_with("BVS") || name.starts_with("RVS") {
        Condition::OverflowSet
    } else {
        Condition::Always
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Bus;

    #[test]
    fn decodes_movw_register_to_register() {
        let mut bus = Bus::new(0x1000, 0x1000, 0, 0x100000);
        // MOVW %r1,%r0  => 0x84 [mode=4,reg=1] [mode=4,reg=0]
        bus.write_b(0, 0x84, AccessSource::Cpu).unwrap();
        bus.write_b(1, 0x41, AccessSource::Cpu).unwrap();
        bus.write_b(2, 0x40, AccessSource::Cpu).unwrap();
        let decoded = decode(&mut bus, 0).unwrap();
        assert_eq!(decoded.mnemonic.name, "MOVW");
        assert_eq!(decoded.length, 3);
        assert!(matches!(decoded.operands[0].mode, EAMode::Register(1)));
        assert!(matches!(decoded.operands[1].mode, EAMode::Register(0)));
    }

    #[test]
    fn decodes_word_immediate_operand() {
        let mut bus = Bus::new(0x1000, 0x1000, 0, 0x100000);
        // MOVW &0x12345678,%r0
        bus.write_b(0, 0x84, AccessSource::Cpu).unwrap();
        bus.write_b(1, 0x4f, AccessSource::Cpu).unwrap();
        bus.write_w(2, 0x1234_5678, AccessSource::Cpu).unwrap();
        bus.write_b(6, 0x40, AccessSource::Cpu).unwrap();
        let decoded = decode(&mut bus, 0).unwrap();
        assert!(matches!(decoded.operands[0].mode, EAMode::WordImmediate(0x1234_5678)));
        assert_eq!(decoded.length, 7);
    }

    #[test]
    fn escapes_to_secondary_table() {
        let mut bus = Bus::new(0x1000, 0x1000, 0, 0x100000);
        bus.write_b(0, 0x30, AccessSource::Cpu).unwrap();
        bus.write_b(1, 0x45, AccessSource::Cpu).unwrap();
        let decoded = decode(&mut bus, 0).unwrap();
        assert_eq!(decoded.mnemonic.name, "RETG");
    }

    #[test]
    fn illegal_opcode_faults() {
        let mut bus = Bus::new(0x1000, 0x1000, 0, 0x100000);
        bus.write_b(0, 0x01, AccessSource::Cpu).unwrap();
        let err = decode(&mut bus, 0).unwrap_err();
        assert_eq!(err, Fault::Instruction(InstrKind::IllegalOpcode));
    }
}
