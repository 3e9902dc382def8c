//! `InstMem`: the full decoded-instruction store, spanning every section
//! the disassembler has touched. Ported from `mttn`'s pattern of guarding
//! shared process state behind a single `Mutex` (`trace.rs::Tracer`), and
//! from `Prophet/static/disassembler.h`'s section table.

use std::collections::HashMap;
use std::sync::Mutex;

use super::inst::Inst;
use super::section::InstSection;

pub struct InstMem {
    sections: Mutex<HashMap<u32, InstSection>>,
}

impl InstMem {
    pub fn new() -> Self {
        InstMem {
            sections: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a section if one with this base isn't already known. A
    /// second call with the same base is a no-op, even if `size` differs.
    pub fn ensure_section(&self, base: u32, size: u32) {
        let mut sections = self.sections.lock().unwrap();
        sections.entry(base).or_insert_with(|| InstSection::new(base, size));
    }

    fn base_for(sections: &HashMap<u32, InstSection>, addr: u32) -> Option<u32> {
        sections.values().find(|s| s.is_in_range(addr)).map(|s| s.base())
    }

    pub fn section_base_for(&self, addr: u32) -> Option<u32> {
        let sections = self.sections.lock().unwrap();
        Self::base_for(&sections, addr)
    }

    pub fn contains(&self, addr: u32) -> bool {
        let sections = self.sections.lock().unwrap();
        sections.values().any(|s| s.contains(addr))
    }

    /// Inserts a decoded instruction into whichever registered section
    /// contains its `eip`. Returns `false` if no section claims the
    /// address (the caller should `ensure_section` first).
    pub fn insert(&self, inst: Inst) -> bool {
        let mut sections = self.sections.lock().unwrap();
        match Self::base_for(&sections, inst.eip) {
            Some(base) => {
                sections.get_mut(&base).unwrap().insert(inst);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, addr: u32) -> Option<Inst> {
        let sections = self.sections.lock().unwrap();
        sections.values().find_map(|s| s.get(addr).cloned())
    }

    pub fn eip_from_index(&self, section_base: u32, idx: usize) -> Option<u32> {
        let sections = self.sections.lock().unwrap();
        sections.get(&section_base).and_then(|s| s.eip_from_index(idx))
    }

    /// Re-derives every section's `index -> eip` table. Call once a
    /// recursive disassembly pass has stopped adding instructions.
    pub fn update_indices(&self) {
        let mut sections = self.sections.lock().unwrap();
        for section in sections.values_mut() {
            section.update_indices();
        }
    }

    pub fn section_count(&self) -> usize {
        self.sections.lock().unwrap().len()
    }
}

impl Default for InstMem {
    fn default() -> Self {
        Self::new()
    }
}
