// Operand field types: `Size`, `OpResult`, `EAMode`, `Condition`, `OpMode`.
// Generalizes the teacher's `fields.rs` from m68k's 3-size/12-mode operand
// model to the WE32100/32200's 3-size/17+-mode descriptor-byte model
// (spec.md §4.5 "Operand decode"; mode numbering from `3b2_cpu.h`'s
// `addr_mode` enum and `3b2_cpu.c`'s `decode_operand`).

use crate::conversions::Truncate;
use std::fmt;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Size {
    Byte = 1,
    Half = 2,
    Word = 4,
}

impl Size {
    pub fn from<T>(&self, res: T) -> OpResult
    where
        T: Truncate<u8> + Truncate<u16> + Truncate<u32>,
    {
        match *self {
            Self::Byte => OpResult::Byte(res.truncate()),
            Self::Half => OpResult::Half(res.truncate()),
            Self::Word => OpResult::Word(res.truncate()),
        }
    }
    pub fn zero(&self) -> OpResult {
        self.from(0u32)
    }
    pub fn from_datatype(dtype: u8) -> Self {
        match dtype {
            0 | 1 => Self::Byte, // SB/BT share a byte footprint
            2 | 3 => Self::Half, // SH/UH
            _ => Self::Word,     // SW/UW and anything else defaults to word
        }
    }
    pub fn mask(&self) -> u32 {
        match self {
            Self::Byte => 0xff,
            Self::Half => 0xffff,
            Self::Word => 0xffff_ffff,
        }
    }
    pub fn sign_bit(&self) -> u32 {
        match self {
            Self::Byte => 0x80,
            Self::Half => 0x8000,
            Self::Word => 0x8000_0000,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpResult {
    Byte(u8),
    Half(u16),
    Word(u32),
}

impl OpResult {
    pub fn inner(&self) -> u32 {
        match *self {
            Self::Byte(b) => b as u32,
            Self::Half(h) => h as u32,
            Self::Word(w) => w,
        }
    }
    pub fn size(&self) -> Size {
        match self {
            Self::Byte(_) => Size::Byte,
            Self::Half(_) => Size::Half,
            Self::Word(_) => Size::Word,
        }
    }
    pub fn sign_extend(&self) -> i32 {
        match *self {
            Self::Byte(b) => b as i8 as i32,
            Self::Half(h) => h as i16 as i32,
            Self::Word(w) => w as i32,
        }
    }
    pub fn is_zero(&self) -> bool {
        self.inner() == 0
    }
    pub fn is_negative(&self) -> bool {
        self.inner() & self.size().sign_bit() != 0
    }
}

impl fmt::Display for OpResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Byte(b) => write!(f, "${:02x}", b),
            Self::Half(h) => write!(f, "${:04x}", h),
            Self::Word(w) => write!(f, "${:08x}", w),
        }
    }
}

/// Result of an arithmetic/logic op: the value plus the NZCV flags it sets.
#[derive(Debug, Copy, Clone, Default)]
pub struct Flags {
    pub n: bool,
    pub z: bool,
    pub c: bool,
    pub v: bool,
}

pub fn add_flags(size: Size, a: u32, b: u32, carry_in: u32) -> (OpResult, Flags) {
    let mask = size.mask();
    let wide = (a as u64 & mask as u64) + (b as u64 & mask as u64) + carry_in as u64;
    let result = size.from(wide as u32);
    let sign_a = a & size.sign_bit() != 0;
    let sign_b = b & size.sign_bit() != 0;
    let sign_r = result.is_negative();
    Flags {
        n: sign_r,
        z: result.is_zero(),
        c: wide & !(mask as u64) != 0,
        v: sign_a == sign_b && sign_r != sign_a,
    }
    .pair(result)
}

pub fn sub_flags(size: Size, dest: u32, src: u32) -> (OpResult, Flags) {
    let mask = size.mask() as u64;
    let d = dest as u64 & mask;
    let s = src as u64 & mask;
    let wide = d.wrapping_sub(s) & mask;
    let result = size.from(wide as u32);
    let sign_d = dest & size.sign_bit() != 0;
    let sign_s = src & size.sign_bit() != 0;
    let sign_r = result.is_negative();
    Flags { n: sign_r, z: result.is_zero(), c: s > d, v: sign_d != sign_s && sign_r != sign_d }.pair(result)
}

pub fn bitwise_flags(size: Size, value: u32) -> (OpResult, Flags) {
    let result = size.from(value);
    Flags { n: result.is_negative(), z: result.is_zero(), c: false, v: false }.pair(result)
}

impl Flags {
    fn pair(self, result: OpResult) -> (OpResult, Flags) {
        (result, self)
    }
}

/// Effective-address descriptor, decoded but not yet resolved to a
/// location (spec.md §4.5 "Operand decode"). Mode numbers follow
/// `3b2_cpu.h`'s `addr_mode` ordering for the Rev 2 set; Rev 3 additions
/// use the prefix byte's own numbering (0x10/0x12/0x14/0x16 auto-inc/dec,
/// 0xab/0xbb indexed, 0xdb scaled-indexed).
#[derive(Debug, Copy, Clone)]
pub enum EAMode {
    PositiveLiteral(u8),
    NegativeLiteral(u8),
    WordImmediate(u32),
    Register(usize),
    HalfImmediate(u16),
    RegisterDeferred(usize),
    ByteImmediate(u8),
    FpShortOffset(u8),
    Absolute(u32),
    ApShortOffset(u8),
    WordDisplacement(usize, i32),
    WordDisplacementDeferred(usize, i32),
    HalfDisplacement(usize, i16),
    HalfDisplacementDeferred(usize, i16),
    ByteDisplacement(usize, i8),
    ByteDisplacementDeferred(usize, i8),
    AbsoluteDeferred(u32),
    /// Rev 3: auto pre/post increment/decrement through prefix 0x5b.
    AutoPreDecrement(usize),
    AutoPostDecrement(usize),
    AutoPreIncrement(usize),
    AutoPostIncrement(usize),
    /// Rev 3: indexed addressing through prefixes 0xab/0xbb/0xdb.
    IndexedByteDisplacement(usize, usize, i8),
    IndexedHalfDisplacement(usize, usize, i16),
    IndexedScaled(usize, usize),
}

impl EAMode {
    pub fn is_register_direct(&self) -> bool {
        matches!(self, EAMode::Register(_))
    }
}

impl fmt::Display for EAMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EAMode::PositiveLiteral(v) | EAMode::NegativeLiteral(v) => write!(f, "&{}", v),
            EAMode::WordImmediate(v) => write!(f, "&{:#010x}", v),
            EAMode::HalfImmediate(v) => write!(f, "&{:#06x}", v),
            EAMode::ByteImmediate(v) => write!(f, "&{:#04x}", v),
            EAMode::Register(r) => write!(f, "%r{}", r),
            EAMode::RegisterDeferred(r) => write!(f, "(%r{})", r),
            EAMode::Absolute(a) | EAMode::AbsoluteDeferred(a) => write!(f, "${:#010x}", a),
            EAMode::FpShortOffset(o) => write!(f, "{}(%fp)", o),
            EAMode::ApShortOffset(o) => write!(f, "{}(%ap)", o),
            EAMode::WordDisplacement(r, d) | EAMode::WordDisplacementDeferred(r, d) => write!(f, "{}(%r{})", d, r),
            EAMode::HalfDisplacement(r, d) | EAMode::HalfDisplacementDeferred(r, d) => write!(f, "{}(%r{})", d, r),
            EAMode::ByteDisplacement(r, d) | EAMode::ByteDisplacementDeferred(r, d) => write!(f, "{}(%r{})", d, r),
            EAMode::AutoPreDecrement(r) => write!(f, "-(%r{})", r),
            EAMode::AutoPostDecrement(r) => write!(f, "(%r{})-", r),
            EAMode::AutoPreIncrement(r) => write!(f, "+(%r{})", r),
            EAMode::AutoPostIncrement(r) => write!(f, "(%r{})+", r),
            EAMode::IndexedByteDisplacement(base, idx, d) => write!(f, "{}(%r{})[%r{}]", d, base, idx),
            EAMode::IndexedHalfDisplacement(base, idx, d) => write!(f, "{}(%r{})[%r{}]", d, base, idx),
            EAMode::IndexedScaled(base, idx) => write!(f, "(%r{})[%r{}]", base, idx),
        }
    }
}

/// The 16 branch/return condition codes (spec.md §4.5 "Control flow").
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Condition {
    Greater,
    GreaterHalf,
    GreaterByte,
    GreaterEqual,
    Less,
    LessEqual,
    GreaterEqualUnsigned,
    GreaterUnsigned,
    LessUnsigned,
    LessEqualUnsigned,
    OverflowClear,
    OverflowSet,
    NotEqual,
    Equal,
    Always,
    Never,
}

impl Condition {
    /// Matches the nibble packed into conditional-branch/return opcodes
    /// (e.g. `0x4_` = RGTR/BGH/BGB family, `0x7_` = RNEQ/BNEH/BEB family).
    pub fn from_opcode_group(nibble: u8) -> Self {
        match nibble {
            0x4 => Condition::GreaterEqual,
            0x5 => Condition::GreaterEqualUnsigned,
            0x6 => Condition::OverflowClear,
            0x7 => Condition::NotEqual,
            _ => Condition::Always,
        }
    }

    pub fn evaluate(&self, n: bool, z: bool, c: bool, v: bool) -> bool {
        match self {
            Condition::Greater => !z && (n == v),
            Condition::GreaterHalf | Condition::GreaterByte => !z && (n == v),
            Condition::GreaterEqual => n == v,
            Condition::Less => n != v,
            Condition::LessEqual => z || (n != v),
            Condition::GreaterEqualUnsigned => !c,
            Condition::GreaterUnsigned => !c && !z,
            Condition::LessUnsigned => c,
            Condition::LessEqualUnsigned => c || z,
            Condition::OverflowClear => !v,
            Condition::OverflowSet => v,
            Condition::NotEqual => !z,
            Condition::Equal => z,
            Condition::Always => true,
            Condition::Never => false,
        }
    }
}

/// Which side of a 2-operand instruction the descriptor bytes mean
/// (mirrors the teacher's `OpMode`, generalized beyond m68k's MOVE).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpMode {
    TwoOperand,
    ThreeOperand,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_sets_carry_on_unsigned_overflow() {
        let (result, flags) = add_flags(Size::Byte, 0xff, 0x01, 0);
        assert_eq!(result.inner(), 0);
        assert!(flags.c);
        assert!(flags.z);
    }

    #[test]
    fn sub_sets_carry_when_src_greater_than_dest() {
        let (_, flags) = sub_flags(Size::Word, 1, 2);
        assert!(flags.c);
    }

    #[test]
    fn signed_overflow_on_add_sets_v() {
        // 0x7f + 0x01 = 0x80 as a signed byte overflows.
        let (result, flags) = add_flags(Size::Byte, 0x7f, 0x01, 0);
        assert_eq!(result.inner(), 0x80);
        assert!(flags.v);
        assert!(flags.n);
    }

    #[test]
    fn bitwise_never_sets_carry_or_overflow() {
        let (_, flags) = bitwise_flags(Size::Word, 0xffff_ffff);
        assert!(!flags.c);
        assert!(!flags.v);
        assert!(flags.n);
    }
}
