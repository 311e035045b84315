// Global graphics translation table
//
// One 32-bit PTE per 4 KiB page of GPU aperture, stored in device-addressable
// memory. Every entry is always valid: unused entries point at the scratch
// page so stray GPU accesses land somewhere inert. A bitmap allocator hands
// out page ranges; entry 0 is reserved for the scratch mapping itself.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{fence, Ordering};

use spin::Mutex;
use x86_64::{PhysAddr, VirtAddr};

use crate::errors::{GfxError, Result};
use crate::mmio::RegisterIo;
use crate::regs;
use crate::{CacheType, PAGE_SIZE};

pub const PTE_VALID: u32 = 1 << 0;
const PTE_PAT0: u32 = 1 << 1;
const PTE_PAT1: u32 = 1 << 2;
const PTE_PAT2: u32 = 1 << 6;
const PTE_PFN_MASK: u32 = 0xFFFF_F000;

/// PAT index for a cache type: WB -> 0, WC -> 1, UC -> 2.
fn pat_index(cache: CacheType) -> u32 {
    match cache {
        CacheType::Default | CacheType::WriteBack => 0,
        CacheType::WriteCombining => 1,
        CacheType::Uncached => 2,
    }
}

pub fn pte_encode(phys: PhysAddr, cache: CacheType) -> u32 {
    let idx = pat_index(cache);
    let mut pte = (phys.as_u64() as u32 & PTE_PFN_MASK) | PTE_VALID;
    if idx & 1 != 0 {
        pte |= PTE_PAT0;
    }
    if idx & 2 != 0 {
        pte |= PTE_PAT1;
    }
    if idx & 4 != 0 {
        pte |= PTE_PAT2;
    }
    pte
}

struct Bitmap {
    bits: Vec<u64>,
    entries: usize,
}

impl Bitmap {
    fn new(entries: usize) -> Self {
        Self {
            bits: vec![0; (entries + 63) / 64],
            entries,
        }
    }

    fn is_set(&self, index: usize) -> bool {
        self.bits[index / 64] & (1 << (index % 64)) != 0
    }

    fn set(&mut self, index: usize) {
        self.bits[index / 64] |= 1 << (index % 64);
    }

    fn clear(&mut self, index: usize) {
        self.bits[index / 64] &= !(1 << (index % 64));
    }

    /// First-fit search for a free run of `count` entries.
    fn find_free_run(&self, count: usize) -> Option<usize> {
        let mut run_start = 0;
        let mut run_len = 0;
        for index in 0..self.entries {
            if self.is_set(index) {
                run_len = 0;
                run_start = index + 1;
            } else {
                run_len += 1;
                if run_len == count {
                    return Some(run_start);
                }
            }
        }
        None
    }
}

pub struct Gtt {
    io: Arc<dyn RegisterIo>,
    table: VirtAddr,
    entries: usize,
    scratch_phys: PhysAddr,
    control_value: u32,
    bitmap: Mutex<Bitmap>,
}

impl Gtt {
    /// `table` is the CPU mapping of the PTE store; `aperture_size` the GPU
    /// address space it covers. Initializes every entry to the scratch page.
    pub fn new(
        io: Arc<dyn RegisterIo>,
        table: VirtAddr,
        aperture_size: usize,
        scratch_phys: PhysAddr,
    ) -> Self {
        let entries = aperture_size / PAGE_SIZE;
        let control_value = io.read32(regs::PGTBL_CTL) | regs::PGTBL_CTL_ENABLE;
        let gtt = Self {
            io,
            table,
            entries,
            scratch_phys,
            control_value,
            bitmap: Mutex::new(Bitmap::new(entries)),
        };
        let scratch_pte = pte_encode(scratch_phys, CacheType::Uncached);
        for index in 0..entries {
            gtt.write_pte(index, scratch_pte);
        }
        gtt.flush();
        gtt.bitmap.lock().set(0); // entry 0 stays on the scratch page
        gtt
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    pub fn scratch_phys(&self) -> PhysAddr {
        self.scratch_phys
    }

    fn write_pte(&self, index: usize, pte: u32) {
        debug_assert!(index < self.entries);
        unsafe {
            let ptr = (self.table.as_u64() + index as u64 * 4) as *mut u32;
            ptr.write_volatile(pte);
        }
    }

    pub fn read_pte(&self, index: usize) -> u32 {
        debug_assert!(index < self.entries);
        unsafe {
            let ptr = (self.table.as_u64() + index as u64 * 4) as *const u32;
            ptr.read_volatile()
        }
    }

    /// Synchronize the GPU's GTT TLB with the page-table store: memory
    /// barrier, rewrite the control register with its cached value, read it
    /// back.
    pub fn flush(&self) {
        fence(Ordering::SeqCst);
        self.io.write32(regs::PGTBL_CTL, self.control_value);
        self.io.posting_read(regs::PGTBL_CTL);
    }

    /// First-fit allocation of `count` aperture pages.
    pub fn alloc(&self, count: usize) -> Result<usize> {
        if count == 0 {
            return Err(GfxError::BadValue);
        }
        if count > self.entries {
            return Err(GfxError::NoMemory);
        }
        let mut bitmap = self.bitmap.lock();
        let start = bitmap.find_free_run(count).ok_or(GfxError::NoMemory)?;
        for index in start..start + count {
            bitmap.set(index);
        }
        Ok(start)
    }

    /// Claim a fixed range (per-pipe framebuffer regions, context images).
    pub fn reserve_range(&self, start: usize, count: usize) -> Result<()> {
        if start + count > self.entries {
            return Err(GfxError::BadValue);
        }
        let mut bitmap = self.bitmap.lock();
        for index in start..start + count {
            if bitmap.is_set(index) {
                return Err(GfxError::Busy);
            }
        }
        for index in start..start + count {
            bitmap.set(index);
        }
        Ok(())
    }

    /// Point `count` entries at the pages of a bound object and flush.
    pub fn map(&self, start: usize, pages: &[PhysAddr], cache: CacheType) -> Result<()> {
        if start + pages.len() > self.entries {
            return Err(GfxError::BadValue);
        }
        for (i, phys) in pages.iter().enumerate() {
            self.write_pte(start + i, pte_encode(*phys, cache));
        }
        self.flush();
        Ok(())
    }

    /// Re-point a range at the scratch page without releasing the
    /// allocation. Used to roll back a partial bind that still owns its
    /// range.
    pub fn unmap(&self, start: usize, count: usize) {
        if start + count > self.entries {
            return;
        }
        let scratch_pte = pte_encode(self.scratch_phys, CacheType::Uncached);
        for index in start..start + count {
            self.write_pte(index, scratch_pte);
        }
        self.flush();
    }

    /// Release a range: clear the bitmap bits and re-point the entries at the
    /// scratch page.
    pub fn free(&self, start: usize, count: usize) {
        if start + count > self.entries {
            return;
        }
        let scratch_pte = pte_encode(self.scratch_phys, CacheType::Uncached);
        let mut bitmap = self.bitmap.lock();
        for index in start..start + count {
            bitmap.clear(index);
            self.write_pte(index, scratch_pte);
        }
        drop(bitmap);
        self.flush();
    }

    pub fn is_allocated(&self, index: usize) -> bool {
        self.bitmap.lock().is_set(index)
    }

    pub fn free_entries(&self) -> usize {
        let bitmap = self.bitmap.lock();
        (0..self.entries).filter(|i| !bitmap.is_set(*i)).count()
    }
}
