// Interrupt Controller: latches interrupt requests, maps each to a
// priority level, and raises the highest enabled request above the
// current mask (spec.md §4.3). CIO per-slot semantics and the
// system-board IPL table are grounded in `3b2_io.c`'s interrupt dispatch
// (SPEC_FULL.md §11).

use log::trace;

pub const NUM_CIO_SLOTS: usize = 12;

/// System-board interrupt sources, highest priority first within their
/// IPL group (spec.md §4.3 "Sources").
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SystemSource {
    Clock,
    SystemError,
    UartDma,
    Uart,
    FloppyDma,
    Floppy,
    Pir9,
    Pir8,
    // Rev 3 additions, all IPL 15.
    PowerDown,
    BusOperational,
    EccSingleBit,
    EccMultiBit,
    BusReceiveFail,
    BusTimeout,
}

impl SystemSource {
    pub fn ipl(&self) -> u32 {
        match self {
            SystemSource::Clock
            | SystemSource::SystemError
            | SystemSource::PowerDown
            | SystemSource::BusOperational
            | SystemSource::EccSingleBit
            | SystemSource::EccMultiBit
            | SystemSource::BusReceiveFail
            | SystemSource::BusTimeout => 15,
            SystemSource::UartDma | SystemSource::Uart => 13,
            SystemSource::FloppyDma | SystemSource::Floppy => 11,
            SystemSource::Pir9 => 9,
            SystemSource::Pir8 => 8,
        }
    }
    pub fn bit(&self) -> u32 {
        match self {
            SystemSource::Clock => 0,
            SystemSource::SystemError => 1,
            SystemSource::UartDma => 2,
            SystemSource::Uart => 3,
            SystemSource::FloppyDma => 4,
            SystemSource::Floppy => 5,
            SystemSource::Pir9 => 6,
            SystemSource::Pir8 => 7,
            SystemSource::PowerDown => 8,
            SystemSource::BusOperational => 9,
            SystemSource::EccSingleBit => 10,
            SystemSource::EccMultiBit => 11,
            SystemSource::BusReceiveFail => 12,
            SystemSource::BusTimeout => 13,
        }
    }
    pub const ALL: [SystemSource; 14] = [
        SystemSource::Clock,
        SystemSource::SystemError,
        SystemSource::UartDma,
        SystemSource::Uart,
        SystemSource::FloppyDma,
        SystemSource::Floppy,
        SystemSource::Pir9,
        SystemSource::Pir8,
        SystemSource::PowerDown,
        SystemSource::BusOperational,
        SystemSource::EccSingleBit,
        SystemSource::EccMultiBit,
        SystemSource::BusReceiveFail,
        SystemSource::BusTimeout,
    ];
}

/// What the interrupt controller decided to service this poll.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InterruptEvent {
    Nmi,
    CioSlot(usize),
    SystemBoard(u32 /* ipl */, u32 /* vector */),
}

pub struct InterruptController {
    pub nmi_pending: bool,
    /// One request bit per backplane I/O slot.
    cio_pending: [bool; NUM_CIO_SLOTS],
    /// Per-slot priority level, configured at sysgen time.
    cio_ipl: [u32; NUM_CIO_SLOTS],
    /// Bitmask of pending system-board sources.
    system_pending: u32,
}

impl InterruptController {
    pub fn new() -> Self {
        Self {
            nmi_pending: false,
            cio_pending: [false; NUM_CIO_SLOTS],
            cio_ipl: [8; NUM_CIO_SLOTS],
            system_pending: 0,
        }
    }

    pub fn set_cio_ipl(&mut self, slot: usize, ipl: u32) {
        self.cio_ipl[slot] = ipl;
    }

    pub fn post_cio(&mut self, slot: usize) {
        self.cio_pending[slot] = true;
    }

    pub fn post_system(&mut self, source: SystemSource) {
        self.system_pending |= 1 << source.bit();
    }

    pub fn post_nmi(&mut self) {
        self.nmi_pending = true;
    }

    /// Highest IPL among pending system-board sources, precomputed the
    /// way a bitmask-to-IPL lookup table would be (spec.md §4.3
    /// "A precomputed table maps each bitmask ... to its highest IPL").
    fn system_ipl(&self) -> Option<(u32, u32)> {
        SystemSource::ALL
            .iter()
            .filter(|s| self.system_pending & (1 << s.bit()) != 0)
            .map(|s| (s.ipl(), s.bit()))
            .max_by_key(|(ipl, _)| *ipl)
    }

    /// Sampling protocol (spec.md §4.3): NMI beats CIO slots beats
    /// system-board sources, gated by `current_ipl` (PSW.IPL).
    pub fn poll(&mut self, current_ipl: u32) -> Option<InterruptEvent> {
        if self.nmi_pending {
            self.nmi_pending = false;
            trace!("NMI serviced");
            return Some(InterruptEvent::Nmi);
        }
        for slot in 0..NUM_CIO_SLOTS {
            if self.cio_pending[slot] && self.cio_ipl[slot] > current_ipl {
                self.cio_pending[slot] = false;
                trace!("CIO slot {} interrupt serviced", slot);
                return Some(InterruptEvent::CioSlot(slot));
            }
        }
        if let Some((ipl, vector)) = self.system_ipl() {
            if ipl > current_ipl {
                self.system_pending &= !(1 << vector);
                trace!("system-board interrupt IPL {} serviced", ipl);
                return Some(InterruptEvent::SystemBoard(ipl, vector));
            }
        }
        None
    }

    pub fn any_pending(&self) -> bool {
        self.nmi_pending || self.cio_pending.iter().any(|p| *p) || self.system_pending != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nmi_beats_everything() {
        let mut ic = InterruptController::new();
        ic.post_system(SystemSource::Clock);
        ic.post_cio(0);
        ic.set_cio_ipl(0, 15);
        ic.post_nmi();
        assert_eq!(ic.poll(0), Some(InterruptEvent::Nmi));
    }

    #[test]
    fn cio_beats_system_board() {
        let mut ic = InterruptController::new();
        ic.post_system(SystemSource::Clock);
        ic.post_cio(3);
        ic.set_cio_ipl(3, 9);
        assert_eq!(ic.poll(0), Some(InterruptEvent::CioSlot(3)));
    }

    #[test]
    fn masked_by_current_ipl() {
        let mut ic = InterruptController::new();
        ic.post_system(SystemSource::Pir8);
        assert_eq!(ic.poll(10), None);
        assert!(ic.poll(7).is_some());
    }
}
