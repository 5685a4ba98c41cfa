// Instruction categories (spec.md §4.5 "Execution categories"). The
// decoder tags each mnemonic with one of these; `execute.rs` dispatches
// on the tag to the right microcode family.

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Category {
    DataMovement,
    Arithmetic,
    Logic,
    ControlFlow,
    FieldOps,
    BitOps,
    Privileged,
    Str,
    Decimal,
    Coprocessor,
}

/// A fully decoded instruction ready for dispatch, built by `decode.rs`
/// and consumed by `execute.rs`. Intentionally thin: it borrows nothing
/// from the bus, so it can be logged into the instruction-history ring
/// after execution without re-reading memory.
#[derive(Debug, Clone)]
pub struct Instruction {
    pub mnemonic: &'static str,
    pub category: Category,
    pub length: u32,
}
