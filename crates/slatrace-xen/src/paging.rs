//! Four-level amd64 page-table walk for kernel address translation.

use std::{cell::RefCell, num::NonZeroUsize};

use lru::LruCache;
use slatrace_core::{Gfn, Pa, Va, PAGE_SIZE};
use zerocopy::{FromBytes, Immutable, KnownLayout};

/// A page table entry in the paging structures.
#[repr(transparent)]
#[derive(Default, Clone, Copy, FromBytes, Immutable, KnownLayout)]
pub struct PageTableEntry(pub u64);

impl PageTableEntry {
    /// Checks if the page is present in physical memory.
    pub fn present(self) -> bool {
        self.0 & 1 != 0
    }

    /// Checks if this entry refers to a large page.
    pub fn large(self) -> bool {
        (self.0 >> 7) & 1 != 0
    }

    /// Extracts the page frame number from the entry.
    pub fn pfn(self) -> Gfn {
        const BITS: u64 = 40;
        const MASK: u64 = (1 << BITS) - 1;
        Gfn((self.0 >> 12) & MASK)
    }
}

fn table_index(va: Va, shift: u64) -> usize {
    ((va.0 >> shift) & 0x1ff) as usize
}

/// Walks the 4-level paging hierarchy rooted at `root`, handling 1 GiB and
/// 2 MiB large pages. `read_table` reads one full page-table frame.
///
/// 5-level paging is not handled; kernel text lives comfortably within
/// 48-bit addresses.
pub fn translate<F>(va: Va, root: Pa, mut read_table: F) -> Option<Pa>
where
    F: FnMut(Gfn) -> Option<[u8; PAGE_SIZE as usize]>,
{
    let mut table_gfn = root.gfn();

    for &(shift, large_mask) in &[
        (39u64, 0u64),
        (30, 0x3FFF_FFFF),
        (21, 0x1F_FFFF),
        (12, 0),
    ] {
        let buffer = read_table(table_gfn)?;

        let start = table_index(va, shift) * size_of::<PageTableEntry>();
        let entry =
            PageTableEntry::read_from_bytes(&buffer[start..start + size_of::<PageTableEntry>()])
                .ok()?;

        if !entry.present() {
            return None;
        }

        if shift == 12 {
            return Some(Pa::from_parts(entry.pfn(), va.offset()));
        }

        if entry.large() && large_mask != 0 {
            let base = entry.pfn().0 << 12;
            return Some(Pa((base & !large_mask) | (va.0 & large_mask)));
        }

        table_gfn = entry.pfn();
    }

    None
}

/// Kernel virtual-to-physical translations, cached.
///
/// The guest can rewrite its page tables between events, so the driver
/// flushes this on every event delivery.
pub struct TranslationCache {
    entries: RefCell<LruCache<Va, Pa>>,
}

impl TranslationCache {
    const DEFAULT_SIZE: usize = 8192;

    pub fn new() -> Self {
        Self {
            entries: RefCell::new(LruCache::new(
                NonZeroUsize::new(Self::DEFAULT_SIZE).expect("non-zero cache size"),
            )),
        }
    }

    pub fn get(&self, va: Va) -> Option<Pa> {
        self.entries.borrow_mut().get(&va).copied()
    }

    pub fn put(&self, va: Va, pa: Pa) {
        self.entries.borrow_mut().put(va, pa);
    }

    pub fn flush(&self) {
        self.entries.borrow_mut().clear();
    }
}

impl Default for TranslationCache {
    fn default() -> Self {
        Self::new()
    }
}
