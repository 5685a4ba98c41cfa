// Processor Status Word: register 11 in the WE32100/32200 register file.
//
// Bit layout is this crate's own (see DESIGN.md / SPEC_FULL.md §12 —
// `3b2_defs.h`, which would carry the authoritative `PSW_*_MASK` constants,
// was not part of the retrieved source pack). Fields are laid out low to
// high in the order spec.md §3 lists them, with ISC placed in the lowest
// nibble so that a cold-boot PSW of "only ISC=3" reads as the literal
// 0x00000003 from §8 scenario 1.

use std::fmt;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Level {
    Kernel = 0,
    Executive = 1,
    Supervisor = 2,
    User = 3,
}

impl Level {
    pub fn from(bits: u32) -> Self {
        match bits & 3 {
            0 => Self::Kernel,
            1 => Self::Executive,
            2 => Self::Supervisor,
            _ => Self::User,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Kernel => "kernel",
            Self::Executive => "executive",
            Self::Supervisor => "supervisor",
            Self::User => "user",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExceptionType {
    Reset = 0,
    Process = 1,
    Stack = 2,
    Normal = 3,
}

impl ExceptionType {
    pub fn from(bits: u32) -> Self {
        match bits & 3 {
            0 => Self::Reset,
            1 => Self::Process,
            2 => Self::Stack,
            _ => Self::Normal,
        }
    }
}

// Bit positions, low to high.
const ISC_SHIFT: u32 = 0;
const ISC_MASK: u32 = 0xf;
const TM_BIT: u32 = 4;
const I_BIT: u32 = 5; // initial-context flag ("I/R" pair, low half)
const R_BIT: u32 = 6; // initial-context flag ("I/R" pair, high half); block-move-on-switch
const CM_SHIFT: u32 = 7;
const CM_MASK: u32 = 0x3;
const PM_SHIFT: u32 = 9;
const PM_MASK: u32 = 0x3;
const IPL_SHIFT: u32 = 11;
const IPL_MASK: u32 = 0xf;
const TE_BIT: u32 = 15;
const C_BIT: u32 = 16;
const V_BIT: u32 = 17;
const Z_BIT: u32 = 18;
const N_BIT: u32 = 19;
const OE_BIT: u32 = 20;
const CD_BIT: u32 = 21;
const QIE_BIT: u32 = 22;
const CFD_BIT: u32 = 23;
const ET_SHIFT: u32 = 24;
const ET_MASK: u32 = 0x3;
// Rev 3 extensions
const X_BIT: u32 = 26;
const AR_BIT: u32 = 27;
const EXUC_BIT: u32 = 28;
const EA_BIT: u32 = 29;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct Psw(pub u32);

impl Psw {
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }
    pub fn raw(&self) -> u32 {
        self.0
    }
    fn bit(&self, b: u32) -> bool {
        self.0 & (1 << b) != 0
    }
    fn set_bit(&mut self, b: u32, v: bool) {
        if v {
            self.0 |= 1 << b;
        } else {
            self.0 &= !(1 << b);
        }
    }
    fn field(&self, shift: u32, mask: u32) -> u32 {
        (self.0 >> shift) & mask
    }
    fn set_field(&mut self, shift: u32, mask: u32, value: u32) {
        self.0 &= !(mask << shift);
        self.0 |= (value & mask) << shift;
    }

    pub fn isc(&self) -> u32 {
        self.field(ISC_SHIFT, ISC_MASK)
    }
    pub fn set_isc(&mut self, v: u32) {
        self.set_field(ISC_SHIFT, ISC_MASK, v);
    }
    pub fn tm(&self) -> bool {
        self.bit(TM_BIT)
    }
    pub fn set_tm(&mut self, v: bool) {
        self.set_bit(TM_BIT, v);
    }
    pub fn i_flag(&self) -> bool {
        self.bit(I_BIT)
    }
    pub fn set_i_flag(&mut self, v: bool) {
        self.set_bit(I_BIT, v);
    }
    pub fn r_flag(&self) -> bool {
        self.bit(R_BIT)
    }
    pub fn set_r_flag(&mut self, v: bool) {
        self.set_bit(R_BIT, v);
    }
    pub fn cm(&self) -> Level {
        Level::from(self.field(CM_SHIFT, CM_MASK))
    }
    pub fn set_cm(&mut self, level: Level) {
        self.set_field(CM_SHIFT, CM_MASK, level as u32);
    }
    pub fn pm(&self) -> Level {
        Level::from(self.field(PM_SHIFT, PM_MASK))
    }
    pub fn set_pm(&mut self, level: Level) {
        self.set_field(PM_SHIFT, PM_MASK, level as u32);
    }
    pub fn ipl(&self) -> u32 {
        self.field(IPL_SHIFT, IPL_MASK)
    }
    pub fn set_ipl(&mut self, v: u32) {
        self.set_field(IPL_SHIFT, IPL_MASK, v);
    }
    pub fn te(&self) -> bool {
        self.bit(TE_BIT)
    }
    pub fn set_te(&mut self, v: bool) {
        self.set_bit(TE_BIT, v);
    }
    pub fn c(&self) -> bool {
        self.bit(C_BIT)
    }
    pub fn set_c(&mut self, v: bool) {
        self.set_bit(C_BIT, v);
    }
    pub fn v(&self) -> bool {
        self.bit(V_BIT)
    }
    pub fn set_v(&mut self, v: bool) {
        self.set_bit(V_BIT, v);
    }
    pub fn z(&self) -> bool {
        self.bit(Z_BIT)
    }
    pub fn set_z(&mut self, v: bool) {
        self.set_bit(Z_BIT, v);
    }
    pub fn n(&self) -> bool {
        self.bit(N_BIT)
    }
    pub fn set_n(&mut self, v: bool) {
        self.set_bit(N_BIT, v);
    }
    pub fn oe(&self) -> bool {
        self.bit(OE_BIT)
    }
    pub fn set_oe(&mut self, v: bool) {
        self.set_bit(OE_BIT, v);
    }
    pub fn cd(&self) -> bool {
        self.bit(CD_BIT)
    }
    pub fn set_cd(&mut self, v: bool) {
        self.set_bit(CD_BIT, v);
    }
    pub fn qie(&self) -> bool {
        self.bit(QIE_BIT)
    }
    pub fn set_qie(&mut self, v: bool) {
        self.set_bit(QIE_BIT, v);
    }
    pub fn cfd(&self) -> bool {
        self.bit(CFD_BIT)
    }
    pub fn set_cfd(&mut self, v: bool) {
        self.set_bit(CFD_BIT, v);
    }
    pub fn et(&self) -> ExceptionType {
        ExceptionType::from(self.field(ET_SHIFT, ET_MASK))
    }
    pub fn set_et(&mut self, et: ExceptionType) {
        self.set_field(ET_SHIFT, ET_MASK, et as u32);
    }
    // Rev 3 only
    pub fn x(&self) -> bool {
        self.bit(X_BIT)
    }
    pub fn set_x(&mut self, v: bool) {
        self.set_bit(X_BIT, v);
    }
    pub fn ar(&self) -> bool {
        self.bit(AR_BIT)
    }
    pub fn set_ar(&mut self, v: bool) {
        self.set_bit(AR_BIT, v);
    }
    pub fn exuc(&self) -> bool {
        self.bit(EXUC_BIT)
    }
    pub fn set_exuc(&mut self, v: bool) {
        self.set_bit(EXUC_BIT, v);
    }
    pub fn ea(&self) -> bool {
        self.bit(EA_BIT)
    }
    pub fn set_ea(&mut self, v: bool) {
        self.set_bit(EA_BIT, v);
    }

    /// Clear PM/IPL/R/ISC/TM/ET, as gate traversal does before installing
    /// the fields copied from the outgoing PSW (spec.md §4.4 "Gate traversal").
    pub fn clear_switch_fields(&mut self) {
        self.set_field(PM_SHIFT, PM_MASK, 0);
        self.set_field(IPL_SHIFT, IPL_MASK, 0);
        self.set_r_flag(false);
        self.set_isc(0);
        self.set_tm(false);
        self.set_field(ET_SHIFT, ET_MASK, 0);
    }
}

impl fmt::Display for Psw {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PSW({:#010x}: ET={:?} CM={} PM={} IPL={} ISC={:#x} N={} Z={} C={} V={})",
            self.0,
            self.et(),
            self.cm(),
            self.pm(),
            self.ipl(),
            self.isc(),
            self.n() as u8,
            self.z() as u8,
            self.c() as u8,
            self.v() as u8
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cold_boot_psw_is_isc_3() {
        let mut psw = Psw::new(0);
        psw.set_isc(3);
        assert_eq!(psw.raw(), 0x3);
    }

    #[test]
    fn fields_round_trip() {
        let mut psw = Psw::new(0);
        psw.set_cm(Level::Supervisor);
        psw.set_pm(Level::User);
        psw.set_ipl(9);
        psw.set_isc(7);
        psw.set_et(ExceptionType::Normal);
        psw.set_n(true);
        psw.set_v(true);
        assert_eq!(psw.cm(), Level::Supervisor);
        assert_eq!(psw.pm(), Level::User);
        assert_eq!(psw.ipl(), 9);
        assert_eq!(psw.isc(), 7);
        assert_eq!(psw.et(), ExceptionType::Normal);
        assert!(psw.n());
        assert!(psw.v());
        assert!(!psw.z());
    }
}
