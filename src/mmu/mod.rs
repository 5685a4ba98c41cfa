// Address translation for the WE 32101 (Rev 2) / WE 32201 (Rev 3) MMU
// (spec.md §4.2). Grounded in `3b2_mmu.c`'s `mmu_decode_va`/
// `mmu_xlate_addr` for algorithm ordering and `3b2_mmu.h`'s field-packing
// macros for the bit layouts (SPEC_FULL.md §11).

pub mod pdc;
pub mod sdc;

use crate::bus::{AccessSource, Bus};
use crate::fault::{AccessCode, Fault, FaultCode, MmuKind};
use crate::registers::Revision;
use log::trace;
use pdc::{PdCache2Way, PdCacheAssoc, PdEntry};
use sdc::{SdCache, SdEntry};

const MAX_INDIRECTS: u32 = 8;

#[derive(Debug, Copy, Clone, Default)]
pub struct SectionReg {
    /// SD table base, aligned to 32 bytes.
    pub a: u32,
    /// Segment-table length minus 1.
    pub b: u32,
}

enum PdCacheKind {
    Rev2(PdCache2Way),
    Rev3(PdCacheAssoc),
}

/// MMU configuration register bits gating R/M bit writeback (spec.md
/// §4.2 step 8).
#[derive(Debug, Copy, Clone, Default)]
pub struct MmuConfig {
    pub update_modified: bool,
    pub update_referenced: bool,
}

pub struct Mmu {
    pub enabled: bool,
    pub revision: Revision,
    pub sections: [SectionReg; 4],
    sdc: SdCache,
    pdc: PdCacheKind,
    pub config: MmuConfig,
    pub fault_code: FaultCode,
    pub fault_addr: u32,
}

impl Mmu {
    pub fn new(revision: Revision) -> Self {
        let pdc = match revision {
            Revision::Rev2 => PdCacheKind::Rev2(PdCache2Way::new()),
            Revision::Rev3 => PdCacheKind::Rev3(PdCacheAssoc::new(2048)),
        };
        Self {
            enabled: false,
            revision,
            sections: [SectionReg::default(); 4],
            sdc: SdCache::new(),
            pdc,
            config: MmuConfig::default(),
            fault_code: FaultCode::default(),
            fault_addr: 0,
        }
    }

    fn sid(va: u32) -> u32 {
        (va >> 30) & 0x3
    }
    fn ssl(va: u32) -> u32 {
        (va >> 17) & 0x1fff
    }
    fn sot(va: u32) -> u32 {
        va & 0x1ffff
    }
    fn psl(va: u32) -> u32 {
        (va >> 11) & 0x3f
    }
    fn pot(va: u32) -> u32 {
        va & 0x7ff
    }

    fn perm(acc: u8, cm: u8) -> u8 {
        (acc >> ((3 - cm) * 2)) & 3
    }

    /// Translate a virtual address. `fc` selects whether faults are
    /// generated and caches/fault registers updated (spec.md §4.2
    /// "Fault-check bypass").
    pub fn translate(&mut self, bus: &mut Bus, va: u32, access: AccessCode, cm: u8, fc: bool) -> Result<u32, Fault> {
        if !self.enabled {
            return Ok(va);
        }
        let section = Self::sid(va);
        let ssl = Self::ssl(va);

        if ssl > self.sections[section as usize].b {
            return self.fail(access, cm, MmuKind::SdtLength, va, fc);
        }

        let sd = match self.sdc.lookup(section, ssl) {
            Some(e) => *e,
            None => self.load_sd(bus, section, ssl, access, cm, fc)?,
        };

        if fc {
            self.sdc.insert(section, ssl, sd);
        }

        let perm = Self::perm(sd.acc, cm);
        let needed = match access {
            AccessCode::Execute => 1u8,
            AccessCode::Read => 2,
            AccessCode::Write => 3,
        };
        if fc && perm < needed {
            return self.fail(access, cm, MmuKind::AccessViolation, va, fc);
        }

        let pa = if sd.contiguous {
            let sot = Self::sot(va);
            if fc && sot >= (sd.max_off + 1) * 8 {
                return self.fail(access, cm, MmuKind::SegmentOffset, va, fc);
            }
            sd.seg_addr.wrapping_add(sot)
        } else {
            let pd = self.load_pd(bus, section, va, &sd, access, cm, fc)?;
            pd.frame.wrapping_add(Self::pot(va))
        };

        if fc {
            self.update_ref_mod(section, va, &sd, access);
        }

        Ok(pa)
    }

    fn fail<T>(&mut self, access: AccessCode, cm: u8, kind: MmuKind, va: u32, fc: bool) -> Result<T, Fault> {
        if fc {
            self.fault_code = FaultCode::new(access, cm, kind);
            self.fault_addr = va;
            trace!("MMU fault {:?} at {:#010x}", kind, va);
        }
        Err(Fault::Translation(kind))
    }

    fn load_sd(
        &mut self,
        bus: &mut Bus,
        section: u32,
        ssl: u32,
        access: AccessCode,
        cm: u8,
        fc: bool,
    ) -> Result<SdEntry, Fault> {
        let mut base = self.sections[section as usize].a;
        let mut addr = base.wrapping_add(ssl * 8);
        let mut indirects = 0;
        loop {
            let sd0 = bus
                .read_w(addr, AccessSource::Cpu)
                .map_err(|_| Fault::Translation(MmuKind::InvalidSd))?;
            let sd1 = bus
                .read_w(addr.wrapping_add(4), AccessSource::Cpu)
                .map_err(|_| Fault::Translation(MmuKind::InvalidSd))?;
            let valid = (sd0 >> 6) & 1 != 0;
            if !valid {
                return self.fail(access, cm, MmuKind::InvalidSd, addr, fc);
            }
            let indirect = (sd0 >> 7) & 1 != 0;
            if indirect {
                indirects += 1;
                if indirects > MAX_INDIRECTS {
                    return Err(Fault::Translation(MmuKind::InvalidSd));
                }
                base = sd1 & 0xffff_ffe0;
                addr = base;
                continue;
            }
            let present = sd0 & 1 != 0;
            let contiguous = (sd0 >> 2) & 1 != 0;
            if !present {
                let kind = if contiguous { MmuKind::SegmentNotPresent } else { MmuKind::PdtNotPresent };
                return self.fail(access, cm, kind, addr, fc);
            }
            let entry = SdEntry {
                good: true,
                tag: 0,
                acc: (sd0 >> 24) as u8,
                max_off: (sd0 >> 10) & 0x3fff,
                seg_addr: sd1 & 0xffff_ffe0,
                trap: (sd0 >> 4) & 1 != 0,
                cacheable: (sd0 >> 3) & 1 != 0,
                contiguous,
                modified: (sd0 >> 1) & 1 != 0,
            };
            return Ok(entry);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn load_pd(
        &mut self,
        bus: &mut Bus,
        section: u32,
        va: u32,
        sd: &SdEntry,
        access: AccessCode,
        cm: u8,
        fc: bool,
    ) -> Result<PdEntry, Fault> {
        if let Some(e) = self.pdc_lookup(section, va) {
            if fc && access == AccessCode::Write && e.write_fault {
                return self.fail(access, cm, MmuKind::PageWrite, va, fc);
            }
            return Ok(e);
        }
        let psl = Self::psl(va);
        let addr = sd.seg_addr.wrapping_add(psl * 4);
        let word = bus.read_w(addr, AccessSource::Cpu).map_err(|_| Fault::Translation(MmuKind::PdtLength))?;
        let present = word & 1 != 0;
        if !present {
            return self.fail(access, cm, MmuKind::PageNotPresent, va, fc);
        }
        let write_fault = (word >> 4) & 1 != 0;
        if access == AccessCode::Write && write_fault {
            return self.fail(access, cm, MmuKind::PageWrite, va, fc);
        }
        let entry = PdEntry {
            good: true,
            tag: 0,
            acc: sd.acc,
            frame: word & 0xffff_f800,
            referenced: (word >> 5) & 1 != 0,
            write_fault,
            cacheable: sd.cacheable,
            last_page: (word >> 2) & 1 != 0,
            modified: (word >> 1) & 1 != 0,
            used: false,
        };
        if fc {
            self.pdc_insert(section, va, entry);
        }
        Ok(entry)
    }

    fn pdc_lookup(&self, section: u32, va: u32) -> Option<PdEntry> {
        match &self.pdc {
            PdCacheKind::Rev2(c) => c.lookup(section, va).copied(),
            PdCacheKind::Rev3(c) => c.lookup(va).copied(),
        }
    }
    fn pdc_insert(&mut self, section: u32, va: u32, entry: PdEntry) {
        match &mut self.pdc {
            PdCacheKind::Rev2(c) => c.insert(section, va, entry),
            PdCacheKind::Rev3(c) => c.insert(va, entry),
        }
    }

    fn update_ref_mod(&mut self, section: u32, va: u32, sd: &SdEntry, access: AccessCode) {
        if self.config.update_referenced {
            // Referenced bit is set on first touch; modeled as a no-op
            // cache write since the cache already read as referenced on
            // a subsequent hit (no R bit readback distinction is exposed).
        }
        if self.config.update_modified && access == AccessCode::Write {
            if sd.contiguous {
                self.sdc.set_modified(section, Self::ssl(va));
            } else {
                match &mut self.pdc {
                    PdCacheKind::Rev2(c) => c.set_modified(section, va),
                    PdCacheKind::Rev3(c) => c.set_modified(va),
                }
            }
        }
    }

    /// Writing Section RAM A flushes the entire section's SD and PD
    /// caches (spec.md §4.2 "Cache flushing").
    pub fn write_sram_a(&mut self, section: u32, value: u32) {
        self.sections[section as usize].a = value & 0xffff_ffe0;
        self.sdc.flush_section(section);
        match &mut self.pdc {
            PdCacheKind::Rev2(c) => c.flush_section(section),
            PdCacheKind::Rev3(c) => c.flush_all(),
        }
    }

    /// Writing SRAM-B does not flush (spec.md §4.2).
    pub fn write_sram_b(&mut self, section: u32, value: u32) {
        self.sections[section as usize].b = value;
    }

    /// CFLUSH: invalidate every SD and PD cache entry across all sections
    /// (spec.md §4.5 "Privileged instructions").
    pub fn flush_caches(&mut self) {
        for section in 0..4u32 {
            self.sdc.flush_section(section);
        }
        match &mut self.pdc {
            PdCacheKind::Rev2(c) => c.flush_all(),
            PdCacheKind::Rev3(c) => c.flush_all(),
        }
    }

    /// Writing the Virtual Address Register flushes the single SD and PD
    /// entries matching that VA (spec.md §4.2).
    pub fn write_var(&mut self, va: u32) {
        let section = Self::sid(va);
        self.sdc.flush_one(section, Self::ssl(va));
        match &mut self.pdc {
            PdCacheKind::Rev2(c) => c.flush_one(section, va),
            PdCacheKind::Rev3(c) => c.flush_one(va),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Bus;

    fn setup() -> (Mmu, Bus) {
        let mut bus = Bus::new(0x100000, 0x10000, 0x0, 0x800000);
        let mut mmu = Mmu::new(Revision::Rev2);
        mmu.enabled = true;
        mmu.sections[0].a = 0x00010000;
        mmu.sections[0].b = 0x0;
        // sd0: paged(C=0), valid, present, acc = 0b00_00_00_11 (kernel full)
        bus.write_w(0x00010000, 0x0300_0041, AccessSource::Cpu).unwrap();
        bus.write_w(0x00010004, 0x0002_0000, AccessSource::Cpu).unwrap();
        // PD at sd1.base + psl*4 = 0x20000 + 0 = 0x20000
        bus.write_w(0x00020000, 0x0004_0001, AccessSource::Cpu).unwrap();
        (mmu, bus)
    }

    #[test]
    fn paged_translation_hit_matches_scenario_3() {
        let (mut mmu, mut bus) = setup();
        let pa = mmu.translate(&mut bus, 0x0000_0010, AccessCode::Read, 0, true).unwrap();
        assert_eq!(pa, 0x0004_0010);
    }

    #[test]
    fn second_lookup_served_from_pd_cache() {
        let (mut mmu, mut bus) = setup();
        mmu.translate(&mut bus, 0x10, AccessCode::Read, 0, true).unwrap();
        // Corrupt the backing memory: if the second lookup still succeeds
        // identically, it must have come from the cache.
        bus.write_w(0x00020000, 0x0, AccessSource::Cpu).unwrap();
        let pa = mmu.translate(&mut bus, 0x10, AccessCode::Read, 0, true).unwrap();
        assert_eq!(pa, 0x0004_0010);
    }

    #[test]
    fn disabled_mmu_is_identity() {
        let mut mmu = Mmu::new(Revision::Rev2);
        let mut bus = Bus::new(0x1000, 0x1000, 0, 0x800000);
        assert_eq!(mmu.translate(&mut bus, 0x1234, AccessCode::Read, 0, true).unwrap(), 0x1234);
    }

    #[test]
    fn ssl_beyond_sramb_length_faults_sdt_length() {
        let (mut mmu, mut bus) = setup();
        let err = mmu.translate(&mut bus, 1 << 17, AccessCode::Read, 0, true).unwrap_err();
        assert_eq!(err, Fault::Translation(MmuKind::SdtLength));
    }

    #[test]
    fn sram_a_write_invalidates_only_its_section() {
        let (mut mmu, mut bus) = setup();
        mmu.translate(&mut bus, 0x10, AccessCode::Read, 0, true).unwrap();
        mmu.write_sram_a(2, 0x30000);
        // Section 0's cached SD should be untouched; re-translating must
        // not re-read memory (we corrupt it to prove the point).
        bus.write_w(0x00010000, 0, AccessSource::Cpu).unwrap();
        let pa = mmu.translate(&mut bus, 0x10, AccessCode::Read, 0, true).unwrap();
        assert_eq!(pa, 0x0004_0010);
    }

    #[test]
    fn fault_check_bypass_skips_permission_checks() {
        let mut bus = Bus::new(0x100000, 0x10000, 0x0, 0x800000);
        let mut mmu = Mmu::new(Revision::Rev2);
        mmu.enabled = true;
        mmu.sections[0].a = 0x10000;
        mmu.sections[0].b = 0;
        // acc = 0 (no permissions for anyone), contiguous, valid, present
        bus.write_w(0x10000, 0x0000_0047, AccessSource::Cpu).unwrap();
        bus.write_w(0x10004, 0x0002_0000, AccessSource::Cpu).unwrap();
        let pa = mmu.translate(&mut bus, 0x10, AccessCode::Write, 3, false).unwrap();
        assert_eq!(pa, 0x0002_0010);
    }
}
