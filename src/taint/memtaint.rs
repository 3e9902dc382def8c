//! Page-indexed, byte-granular memory taint store. Ported from
//! `Arietis/taint/taintengine.h`'s `MemoryTaint`/`PageTaint`.

use std::collections::HashMap;

use super::value::{Taint, TaintN};

/// 4096-byte pages, addressed by a 20-bit page number (spec §3).
pub const PAGE_SIZE: u32 = 4096;
pub const PAGE_SHIFT: u32 = 12;

fn page_num(addr: u32) -> u32 {
    addr >> PAGE_SHIFT
}

fn page_off(addr: u32) -> usize {
    (addr & (PAGE_SIZE - 1)) as usize
}

/// One page of per-byte taint, lazily allocated on first write.
#[derive(Clone)]
struct PageTaint {
    data: Box<[Taint; PAGE_SIZE as usize]>,
}

impl PageTaint {
    fn new() -> Self {
        PageTaint {
            data: Box::new([Taint::new(); PAGE_SIZE as usize]),
        }
    }

    fn get(&self, offset: usize) -> Taint {
        self.data[offset]
    }

    fn set(&mut self, offset: usize, t: Taint) {
        self.data[offset] = t;
    }

    fn reset(&mut self) {
        for cell in self.data.iter_mut() {
            *cell = Taint::new();
        }
    }
}

/// Sparse, page-indexed store of per-byte memory taint. Unpopulated pages
/// read as all-zero and are allocated lazily on first `set_byte`.
#[derive(Clone, Default)]
pub struct MemoryTaint {
    pages: HashMap<u32, PageTaint>,
}

impl MemoryTaint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_byte(&self, addr: u32) -> Taint {
        match self.pages.get(&page_num(addr)) {
            Some(page) => page.get(page_off(addr)),
            None => Taint::new(),
        }
    }

    pub fn set_byte(&mut self, addr: u32, t: Taint) {
        let page = self.pages.entry(page_num(addr)).or_insert_with(PageTaint::new);
        page.set(page_off(addr), t);
    }

    /// `Get(addr, len)`: OR of all byte taints in `[addr, addr+len)`.
    pub fn get_range(&self, addr: u32, len: u32) -> Taint {
        let mut acc = Taint::new();
        for i in 0..len {
            acc |= self.get_byte(addr.wrapping_add(i));
        }
        acc
    }

    /// `Set`: writes one taint value to each of `len` bytes.
    pub fn set_range(&mut self, addr: u32, len: u32, t: Taint) {
        for i in 0..len {
            self.set_byte(addr.wrapping_add(i), t);
        }
    }

    /// `Get<N>`: N consecutive bytes, one lane each.
    pub fn get<const N: usize>(&self, addr: u32) -> TaintN<N> {
        let mut out = TaintN::<N>::default();
        for i in 0..N {
            out.0[i] = self.get_byte(addr.wrapping_add(i as u32));
        }
        out
    }

    /// `Set<N>`: N consecutive bytes, one lane each.
    pub fn set<const N: usize>(&mut self, addr: u32, t: TaintN<N>) {
        for i in 0..N {
            self.set_byte(addr.wrapping_add(i as u32), t.0[i]);
        }
    }

    /// Independent deep copy.
    pub fn clone_deep(&self) -> Self {
        self.clone()
    }

    /// Makes `self` structurally equal to `src`, releasing any pages not
    /// present in `src`.
    pub fn copy_from(&mut self, src: &Self) {
        self.pages = src.pages.clone();
    }

    /// Zeros all bytes but keeps allocated pages (so subsequent accesses
    /// don't need to re-allocate).
    pub fn reset(&mut self) {
        for page in self.pages.values_mut() {
            page.reset();
        }
    }
}
