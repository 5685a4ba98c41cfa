// Typed fault taxonomy replacing the source simulator's setjmp/longjmp +
// `abort_context` global (spec.md §9 "Long-jump unwind -> typed result
// propagation"). Every fallible CPU/MMU/Bus operation returns
// `Result<T, Fault>`; the CPU main loop is the sole `?`-unwind boundary.

use thiserror::Error;

/// Which of the four access-control permission classes a request needs.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AccessCode {
    Read,
    Write,
    Execute,
}

/// MMU translation-fault subcategory (spec.md §7 category 2), matching
/// `3b2_mmu.h`'s `MMU_F_*` codes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MmuKind {
    SdtLength,
    PageWrite,
    PdtLength,
    InvalidSd,
    SegmentNotPresent,
    ObjectTrap,
    PdtNotPresent,
    PageNotPresent,
    AccessViolation,
    SegmentOffset,
    RmUpdate,
}

/// Bus/memory fault subcategory (spec.md §7 category 1).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MemKind {
    ExternalMemoryFault,
    Alignment,
    EccMultiBit,
}

/// Instruction-decode fault subcategory (spec.md §7 category 3).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InstrKind {
    IllegalOpcode,
    ReservedOpcode,
    ReservedDatatype,
    InvalidDescriptor,
    PrivilegedOpcode,
    PrivilegedRegister,
}

/// Full fault/exception-cause taxonomy. `FaultKind` below packs the bits
/// the MMU's fault-code register stores; `Fault` is the Rust-level error
/// type threaded through `Result`.
#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
pub enum Fault {
    #[error("memory fault: {0:?}")]
    Memory(MemKind),
    #[error("translation fault: {0:?}")]
    Translation(MmuKind),
    #[error("instruction fault: {0:?}")]
    Instruction(InstrKind),
    #[error("integer divide by zero")]
    IntegerZeroDivide,
    #[error("integer overflow")]
    IntegerOverflow,
    #[error("decimal trap")]
    DecimalTrap,
    #[error("breakpoint")]
    Breakpoint,
    #[error("trace trap")]
    Trace,
    #[error("gate vector fault")]
    GateFault,
    #[error("stack pointer out of PCB bounds")]
    StackFault,
    #[error("fault while servicing a stack exception")]
    ProcessFault,
    #[error("fault while servicing a process exception")]
    ResetFault,
    #[error("exception stack overflow")]
    ExceptionStackOverflow,
    #[error("coprocessor did not answer")]
    CoprocessorNoAnswer,
}

impl Fault {
    /// The "normal exception" ISC this fault carries when delivered through
    /// the normal-exception microsequence (spec.md §7 category 3/4/5).
    pub fn isc(&self) -> u32 {
        match self {
            Fault::Memory(_) => 0x0c,
            Fault::Translation(k) => match k {
                MmuKind::SdtLength => 0x03,
                MmuKind::PageWrite => 0x04,
                MmuKind::PdtLength => 0x05,
                MmuKind::InvalidSd => 0x06,
                MmuKind::SegmentNotPresent => 0x07,
                MmuKind::ObjectTrap => 0x08,
                MmuKind::PdtNotPresent => 0x09,
                MmuKind::PageNotPresent => 0x0a,
                MmuKind::AccessViolation => 0x0d,
                MmuKind::SegmentOffset => 0x0e,
                MmuKind::RmUpdate => 0x0f,
            },
            Fault::Instruction(k) => match k {
                InstrKind::IllegalOpcode => 0x10,
                InstrKind::ReservedOpcode => 0x11,
                InstrKind::ReservedDatatype => 0x12,
                InstrKind::InvalidDescriptor => 0x13,
                InstrKind::PrivilegedOpcode => 0x14,
                InstrKind::PrivilegedRegister => 0x15,
            },
            Fault::IntegerZeroDivide => 0x02,
            Fault::IntegerOverflow => 0x01,
            Fault::DecimalTrap => 0x16,
            Fault::Breakpoint => 0x07,
            Fault::Trace => 0x09,
            Fault::GateFault => 0x17,
            Fault::CoprocessorNoAnswer => 0x0c,
            Fault::StackFault | Fault::ProcessFault | Fault::ResetFault | Fault::ExceptionStackOverflow => 0x07,
        }
    }

    /// Faults that escalate normal -> stack -> process -> reset on
    /// cascading failure (spec.md §4.4 "Exception nesting"), rather than
    /// being delivered as ordinary normal exceptions.
    pub fn is_cascaded(&self) -> bool {
        matches!(self, Fault::StackFault | Fault::ProcessFault | Fault::ResetFault)
    }
}

/// The MMU fault-code register's (access, cm, id) triple, latched on any
/// non-bypassed translation failure (spec.md §3 "Fault registers").
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct FaultCode {
    pub access: u8,
    pub cm: u8,
    pub id: u8,
}

impl FaultCode {
    pub fn new(access: AccessCode, cm: u8, kind: MmuKind) -> Self {
        let access_bits = match access {
            AccessCode::Read => 0,
            AccessCode::Write => 1,
            AccessCode::Execute => 2,
        };
        Self { access: access_bits, cm, id: mmu_kind_id(kind) }
    }
}

fn mmu_kind_id(kind: MmuKind) -> u8 {
    match kind {
        MmuKind::SdtLength => 0x03,
        MmuKind::PageWrite => 0x04,
        MmuKind::PdtLength => 0x05,
        MmuKind::InvalidSd => 0x06,
        MmuKind::SegmentNotPresent => 0x07,
        MmuKind::ObjectTrap => 0x08,
        MmuKind::PdtNotPresent => 0x09,
        MmuKind::PageNotPresent => 0x0a,
        MmuKind::AccessViolation => 0x0d,
        MmuKind::SegmentOffset => 0x0e,
        MmuKind::RmUpdate => 0x0f,
    }
}
