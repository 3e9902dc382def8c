//! `InstSection`: the decoded-instruction cache for one contiguous memory
//! section. Ported from `Prophet/static/disassembler.h`'s `InstSection`.

use super::inst::Inst;

pub struct InstSection {
    base: u32,
    size: u32,
    data: Vec<Option<Inst>>,
    /// Reverse index -> eip lookup, populated by `update_indices`.
    indices: Vec<u32>,
    count: usize,
}

impl InstSection {
    pub fn new(base: u32, size: u32) -> Self {
        InstSection {
            base,
            size,
            data: (0..size).map(|_| None).collect(),
            indices: Vec::new(),
            count: 0,
        }
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_in_range(&self, addr: u32) -> bool {
        addr >= self.base && addr < self.base + self.size
    }

    pub fn contains(&self, addr: u32) -> bool {
        self.is_in_range(addr) && self.data[(addr - self.base) as usize].is_some()
    }

    pub fn get(&self, addr: u32) -> Option<&Inst> {
        if !self.is_in_range(addr) {
            return None;
        }
        self.data[(addr - self.base) as usize].as_ref()
    }

    pub fn get_mut(&mut self, addr: u32) -> Option<&mut Inst> {
        if !self.is_in_range(addr) {
            return None;
        }
        self.data[(addr - self.base) as usize].as_mut()
    }

    /// Allocates (or overwrites) the slot at `inst.eip`.
    pub fn insert(&mut self, inst: Inst) {
        debug_assert!(self.is_in_range(inst.eip));
        let slot = &mut self.data[(inst.eip - self.base) as usize];
        if slot.is_none() {
            self.count += 1;
        }
        *slot = Some(inst);
    }

    pub fn eip_from_index(&self, idx: usize) -> Option<u32> {
        self.indices.get(idx).copied()
    }

    /// Assigns `Inst.index = 0..count-1` in ascending-EIP order and
    /// rebuilds the reverse index->eip table (spec §4.3).
    pub fn update_indices(&mut self) {
        self.indices.clear();
        let mut idx = 0usize;
        for slot in self.data.iter_mut() {
            if let Some(inst) = slot {
                inst.index = Some(idx);
                self.indices.push(inst.eip);
                idx += 1;
            }
        }
        debug_assert_eq!(idx, self.count);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Inst> {
        self.data.iter().filter_map(|s| s.as_ref())
    }
}
