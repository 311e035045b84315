// Per-process graphics translation tables
//
// Two-level Gen7 layout: a one-page directory of 64-bit PDEs, each pointing
// at an on-demand page table of 64-bit PTEs. The tables themselves are
// buffer objects; page tables are contiguous wired allocations so the PDE
// can carry just the base frame. Unmapping a range re-points its PTEs at the
// scratch page and invalidates the GPU TLB; intermediate tables are only
// freed with the whole PPGTT.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

use spin::Mutex;
use x86_64::{PhysAddr, VirtAddr};

use crate::bo::{Bo, BoCreateInfo, GemManager};
use crate::errors::{GfxError, Result};
use crate::mmio::RegisterIo;
use crate::regs;
use crate::{CacheType, PAGE_SIZE};

pub const PTE_PRESENT: u64 = 1 << 0;
pub const PTE_WRITABLE: u64 = 1 << 1;
const PTE_CACHE_SHIFT: u64 = 2;
const PTE_PFN_MASK: u64 = 0x0000_FFFF_FFFF_F000;

const PDE_SHIFT: u64 = 22;
const PDE_MASK: u64 = 0x1FF;
const PTE_SHIFT: u64 = 12;
const PTE_MASK: u64 = 0x3FF;

const ENTRIES_PER_TABLE: usize = (PTE_MASK as usize) + 1;
const TABLE_BYTES: usize = ENTRIES_PER_TABLE * 8;

/// Highest GPU virtual address + 1 covered by the directory.
pub const ADDRESS_SPACE_SIZE: u64 = 1 << 31;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PpgttKind {
    /// Shares the global GTT layout; contexts without isolation.
    Aliasing,
    /// Private 31-bit address space.
    Full,
}

fn cache_bits(cache: CacheType) -> u64 {
    let idx: u64 = match cache {
        CacheType::Default | CacheType::WriteBack => 0,
        CacheType::WriteCombining => 1,
        CacheType::Uncached => 2,
    };
    idx << PTE_CACHE_SHIFT
}

fn leaf_pte(phys: PhysAddr, cache: CacheType, writable: bool) -> u64 {
    let mut pte = (phys.as_u64() & PTE_PFN_MASK) | cache_bits(cache) | PTE_PRESENT;
    if writable {
        pte |= PTE_WRITABLE;
    }
    pte
}

struct Tables {
    /// PDE index -> page-table object; doubles as the lookup cache and the
    /// tracking list freed with the PPGTT.
    page_tables: BTreeMap<usize, Arc<Bo>>,
}

pub struct Ppgtt {
    kind: PpgttKind,
    gem: Arc<GemManager>,
    io: Arc<dyn RegisterIo>,
    scratch_phys: PhysAddr,
    directory: Arc<Bo>,
    refcount: AtomicU32,
    tables: Mutex<Tables>,
}

impl Ppgtt {
    pub fn new(
        kind: PpgttKind,
        gem: Arc<GemManager>,
        io: Arc<dyn RegisterIo>,
        scratch_phys: PhysAddr,
    ) -> Result<Arc<Self>> {
        let directory = gem.create(BoCreateInfo::blob(PAGE_SIZE).pinned().cleared())?;
        Ok(Arc::new(Self {
            kind,
            gem,
            io,
            scratch_phys,
            directory,
            refcount: AtomicU32::new(1),
            tables: Mutex::new(Tables {
                page_tables: BTreeMap::new(),
            }),
        }))
    }

    pub fn kind(&self) -> PpgttKind {
        self.kind
    }

    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    pub fn get(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop a reference; the last put frees the directory and every
    /// intermediate table.
    pub fn put(&self) {
        if self.refcount.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        let mut tables = self.tables.lock();
        for (_, table) in core::mem::take(&mut tables.page_tables) {
            self.gem.put(&table);
        }
        self.gem.put(&self.directory);
    }

    /// Physical frame of the page directory, installed in a context's PDP.
    pub fn directory_phys(&self) -> PhysAddr {
        self.directory
            .physical_pages()
            .first()
            .copied()
            .unwrap_or(PhysAddr::new(0))
    }

    fn split(gpu_va: u64) -> (usize, usize) {
        (
            ((gpu_va >> PDE_SHIFT) & PDE_MASK) as usize,
            ((gpu_va >> PTE_SHIFT) & PTE_MASK) as usize,
        )
    }

    fn check_range(gpu_va: u64, bytes: usize) -> Result<()> {
        if gpu_va % PAGE_SIZE as u64 != 0 {
            return Err(GfxError::BadValue);
        }
        if gpu_va + bytes as u64 > ADDRESS_SPACE_SIZE {
            return Err(GfxError::BadValue);
        }
        Ok(())
    }

    fn directory_slot(&self, pde: usize) -> *mut u64 {
        let virt = self
            .directory
            .cpu_map()
            .unwrap_or(VirtAddr::new(0))
            .as_u64();
        (virt + pde as u64 * 8) as *mut u64
    }

    fn table_slot(table: &Arc<Bo>, pte: usize) -> *mut u64 {
        let virt = table.cpu_map().unwrap_or(VirtAddr::new(0)).as_u64();
        (virt + pte as u64 * 8) as *mut u64
    }

    /// Fetch or build the page table behind `pde`.
    fn table_for(&self, tables: &mut Tables, pde: usize) -> Result<Arc<Bo>> {
        if let Some(table) = tables.page_tables.get(&pde) {
            return Ok(table.clone());
        }
        let table = self.gem.create(BoCreateInfo::blob(TABLE_BYTES).pinned().cleared())?;
        let pages = table.physical_pages();
        // The PDE holds one frame, so the table must be contiguous.
        for window in pages.windows(2) {
            if window[1].as_u64() != window[0].as_u64() + PAGE_SIZE as u64 {
                self.gem.put(&table);
                return Err(GfxError::NoMemory);
            }
        }
        let base = pages.first().copied().ok_or(GfxError::NoMemory)?;
        unsafe {
            self.directory_slot(pde)
                .write_volatile((base.as_u64() & PTE_PFN_MASK) | PTE_PRESENT | PTE_WRITABLE);
        }
        tables.page_tables.insert(pde, table.clone());
        Ok(table)
    }

    /// Map every page of `bo` starting at `gpu_va`.
    pub fn map(
        &self,
        bo: &Arc<Bo>,
        gpu_va: u64,
        cache: CacheType,
        writable: bool,
    ) -> Result<()> {
        Self::check_range(gpu_va, bo.allocated_size())?;
        let pages = bo.physical_pages();
        if pages.is_empty() {
            return Err(GfxError::NotReady);
        }
        let mut tables = self.tables.lock();
        for (i, phys) in pages.iter().enumerate() {
            let va = gpu_va + (i * PAGE_SIZE) as u64;
            let (pde, pte) = Self::split(va);
            let table = self.table_for(&mut tables, pde)?;
            unsafe {
                Self::table_slot(&table, pte).write_volatile(leaf_pte(*phys, cache, writable));
            }
        }
        Ok(())
    }

    /// Re-point `[gpu_va, gpu_va + bytes)` at the scratch page. Absent
    /// tables are left absent; directories are never freed here.
    pub fn clear_range(&self, gpu_va: u64, bytes: usize) -> Result<()> {
        Self::check_range(gpu_va, bytes)?;
        let scratch = leaf_pte(self.scratch_phys, CacheType::Uncached, false);
        let tables = self.tables.lock();
        let mut va = gpu_va;
        let end = gpu_va + bytes as u64;
        while va < end {
            let (pde, pte) = Self::split(va);
            if let Some(table) = tables.page_tables.get(&pde) {
                unsafe {
                    Self::table_slot(table, pte).write_volatile(scratch);
                }
            }
            va += PAGE_SIZE as u64;
        }
        Ok(())
    }

    /// Unmap = clear + GPU TLB invalidate.
    pub fn unmap(&self, gpu_va: u64, bytes: usize) -> Result<()> {
        self.clear_range(gpu_va, bytes)?;
        self.invalidate_tlb();
        Ok(())
    }

    pub fn invalidate_tlb(&self) {
        self.io.write32(regs::PPGTT_TLB_INV, regs::PPGTT_TLB_INV_ALL);
        self.io.posting_read(regs::PPGTT_TLB_INV);
    }

    /// Software walk of the tables, for diagnostics and tests.
    pub fn translate(&self, gpu_va: u64) -> Option<PhysAddr> {
        let (pde, pte) = Self::split(gpu_va);
        let tables = self.tables.lock();
        let table = tables.page_tables.get(&pde)?;
        let entry = unsafe { Self::table_slot(table, pte).read_volatile() };
        if entry & PTE_PRESENT == 0 {
            return None;
        }
        Some(PhysAddr::new(entry & PTE_PFN_MASK))
    }

    pub fn table_count(&self) -> usize {
        self.tables.lock().page_tables.len()
    }
}
