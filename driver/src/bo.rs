// GEM buffer objects
//
// A buffer object owns wired backing pages and moves between SYSTEM and
// GTT-BOUND states. Tiled objects on pre-Gen9 hardware are bound if and only
// if they hold a programmed fence register. Bound, unpinned, evictable
// objects sit on a global LRU that the eviction path walks when the aperture
// runs dry.

use alloc::collections::BTreeMap;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use spin::Mutex;
use x86_64::{PhysAddr, VirtAddr};

use crate::errors::{GfxError, Result};
use crate::fence::FenceRegisters;
use crate::gtt::Gtt;
use crate::{
    align_up, pages_for, round_up_to_page, CacheType, EngineId, Generation, OsMemory, TilingMode,
    WiredRegion, MAX_ENGINES, PAGE_SIZE,
};

// Tile geometry, Gen6+
pub const X_TILE_WIDTH: u32 = 512;
pub const X_TILE_HEIGHT: u32 = 8;
pub const Y_TILE_WIDTH: u32 = 128;
pub const Y_TILE_HEIGHT: u32 = 32;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BoFlags: u32 {
        /// Never a candidate for eviction and never unpinned by LRU churn.
        const PINNED = 1 << 0;
        /// Zero the backing store before first use.
        const CLEAR = 1 << 1;
    }
}

/// Creation geometry: an opaque byte blob or a dimensioned surface.
#[derive(Debug, Clone, Copy)]
pub enum BoSize {
    Bytes(usize),
    Surface {
        width: u32,
        height: u32,
        bits_per_pixel: u32,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct BoCreateInfo {
    pub size: BoSize,
    pub tiling: TilingMode,
    pub flags: BoFlags,
    pub cache: CacheType,
}

impl BoCreateInfo {
    pub fn blob(size: usize) -> Self {
        Self {
            size: BoSize::Bytes(size),
            tiling: TilingMode::None,
            flags: BoFlags::empty(),
            cache: CacheType::Default,
        }
    }

    pub fn surface(width: u32, height: u32, bits_per_pixel: u32, tiling: TilingMode) -> Self {
        Self {
            size: BoSize::Surface {
                width,
                height,
                bits_per_pixel,
            },
            tiling,
            flags: BoFlags::empty(),
            cache: CacheType::Default,
        }
    }

    pub fn pinned(mut self) -> Self {
        self.flags |= BoFlags::PINNED;
        self
    }

    pub fn cleared(mut self) -> Self {
        self.flags |= BoFlags::CLEAR;
        self
    }

    pub fn cached(mut self, cache: CacheType) -> Self {
        self.cache = cache;
        self
    }
}

/// Mutable half of a buffer object, guarded by the per-BO lock.
#[derive(Debug)]
pub struct BoState {
    pub gtt_offset_pages: Option<usize>,
    pub gtt_cache: CacheType,
    pub fence_slot: Option<usize>,
    pub pinned: bool,
    pub evictable: bool,
    pub dirty: bool,
    pub on_lru: bool,
    pub last_used_seqno: u32,
    pub last_used_engine: EngineId,
}

#[derive(Debug)]
pub struct Bo {
    id: u64,
    refcount: AtomicU32,
    allocated_size: usize,
    width: u32,
    height: u32,
    aligned_height: u32,
    bits_per_pixel: u32,
    stride: u32,
    tiling: TilingMode,
    cpu_cache: CacheType,
    region: Mutex<Option<WiredRegion>>,
    pub state: Mutex<BoState>,
}

impl Bo {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    pub fn allocated_size(&self) -> usize {
        self.allocated_size
    }

    pub fn page_count(&self) -> usize {
        pages_for(self.allocated_size)
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn bits_per_pixel(&self) -> u32 {
        self.bits_per_pixel
    }

    pub fn tiling(&self) -> TilingMode {
        self.tiling
    }

    /// The CPU cache attribute the backing actually got, after any silent
    /// downgrade to the default type.
    pub fn cpu_cache(&self) -> CacheType {
        self.cpu_cache
    }

    /// Kernel virtual address of the backing region. The mapping lives as
    /// long as the object; unmap is a no-op.
    pub fn cpu_map(&self) -> Result<VirtAddr> {
        self.region
            .lock()
            .as_ref()
            .map(|r| r.virt)
            .ok_or(GfxError::NotReady)
    }

    pub fn physical_pages(&self) -> Vec<PhysAddr> {
        self.region
            .lock()
            .as_ref()
            .map(|r| r.pages.clone())
            .unwrap_or_default()
    }

    pub fn gtt_offset_pages(&self) -> Option<usize> {
        self.state.lock().gtt_offset_pages
    }

    pub fn gtt_address(&self) -> Option<u64> {
        self.state
            .lock()
            .gtt_offset_pages
            .map(|p| p as u64 * PAGE_SIZE as u64)
    }

    pub fn is_bound(&self) -> bool {
        self.state.lock().gtt_offset_pages.is_some()
    }

    pub fn fence_slot(&self) -> Option<usize> {
        self.state.lock().fence_slot
    }

    pub fn mark_dirty(&self) {
        self.state.lock().dirty = true;
    }

    pub fn clear_dirty(&self) {
        self.state.lock().dirty = false;
    }
}

/// Engine-completion snapshot used by idleness checks during eviction.
pub type CompletedSeqnos = [u32; MAX_ENGINES];

/// Seqno `a` counts as completed once `completed` has passed it, with 32-bit
/// wrap handled through signed distance.
pub fn seqno_passed(completed: u32, seqno: u32) -> bool {
    (completed.wrapping_sub(seqno) as i32) >= 0
}

pub struct GemManager {
    os_mem: Arc<dyn OsMemory>,
    gtt: Arc<Gtt>,
    fences: Arc<FenceRegisters>,
    generation: Generation,
    objects: Mutex<BTreeMap<u64, Arc<Bo>>>,
    lru: Mutex<VecDeque<u64>>,
    next_id: AtomicU64,
}

impl GemManager {
    pub fn new(
        os_mem: Arc<dyn OsMemory>,
        gtt: Arc<Gtt>,
        fences: Arc<FenceRegisters>,
        generation: Generation,
    ) -> Self {
        Self {
            os_mem,
            gtt,
            fences,
            generation,
            objects: Mutex::new(BTreeMap::new()),
            lru: Mutex::new(VecDeque::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Resolve stride / allocated size from the creation geometry.
    fn resolve_layout(info: &BoCreateInfo) -> Result<(u32, u32, u32, u32, usize)> {
        match info.size {
            BoSize::Bytes(bytes) => {
                if bytes == 0 {
                    return Err(GfxError::BadValue);
                }
                if info.tiling != TilingMode::None {
                    // A tiled allocation needs surface dimensions.
                    return Err(GfxError::BadValue);
                }
                Ok((0, 0, 0, 0, round_up_to_page(bytes)))
            }
            BoSize::Surface {
                width,
                height,
                bits_per_pixel,
            } => {
                if width == 0 || height == 0 {
                    return Err(GfxError::BadValue);
                }
                if !matches!(bits_per_pixel, 8 | 16 | 32) {
                    return Err(GfxError::BadValue);
                }
                let row_bytes = width * bits_per_pixel / 8;
                let (stride, aligned_height) = match info.tiling {
                    TilingMode::X => (align_up(row_bytes, X_TILE_WIDTH), align_up(height, X_TILE_HEIGHT)),
                    TilingMode::Y => (align_up(row_bytes, Y_TILE_WIDTH), align_up(height, Y_TILE_HEIGHT)),
                    TilingMode::None => (align_up(row_bytes, 64), height),
                };
                let total = round_up_to_page(stride as usize * aligned_height as usize);
                Ok((width, height, aligned_height, stride, total))
            }
        }
    }

    pub fn create(&self, info: BoCreateInfo) -> Result<Arc<Bo>> {
        if info.tiling != TilingMode::None && !self.generation.supports_tiling() {
            return Err(GfxError::Unsupported);
        }
        let (width, height, aligned_height, stride, total) = Self::resolve_layout(&info)?;

        let region = self.os_mem.alloc_wired(total)?;
        let mut cpu_cache = info.cache;
        if info.cache != CacheType::Default
            && self.os_mem.set_memory_type(&region, info.cache).is_err()
        {
            // Host could not honor the request; keep the default type.
            cpu_cache = CacheType::Default;
        }
        if info.flags.contains(BoFlags::CLEAR) {
            unsafe {
                core::ptr::write_bytes(region.virt.as_u64() as *mut u8, 0, total);
            }
        }

        let pinned = info.flags.contains(BoFlags::PINNED);
        let bo = Arc::new(Bo {
            id: self.next_id.fetch_add(1, Ordering::AcqRel),
            refcount: AtomicU32::new(1),
            allocated_size: total,
            width,
            height,
            aligned_height,
            bits_per_pixel: match info.size {
                BoSize::Surface { bits_per_pixel, .. } => bits_per_pixel,
                BoSize::Bytes(_) => 0,
            },
            stride,
            tiling: info.tiling,
            cpu_cache,
            region: Mutex::new(Some(region)),
            state: Mutex::new(BoState {
                gtt_offset_pages: None,
                gtt_cache: CacheType::Default,
                fence_slot: None,
                pinned,
                evictable: !pinned,
                dirty: false,
                on_lru: false,
                last_used_seqno: 0,
                last_used_engine: EngineId::Rcs,
            }),
        });
        self.objects.lock().insert(bo.id, bo.clone());
        Ok(bo)
    }

    pub fn lookup(&self, id: u64) -> Option<Arc<Bo>> {
        self.objects.lock().get(&id).cloned()
    }

    /// Take an ownership reference.
    pub fn get(&self, bo: &Arc<Bo>) {
        bo.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop an ownership reference; the last put tears the object down:
    /// off the LRU, fence disabled and freed, GTT unmapped, backing freed.
    pub fn put(&self, bo: &Arc<Bo>) {
        if bo.refcount.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        self.unbind(bo);
        if let Some(mut region) = bo.region.lock().take() {
            self.os_mem.free_wired(&mut region);
        }
        self.objects.lock().remove(&bo.id);
    }

    /// Bind to the global GTT at an allocator-chosen offset. On aperture
    /// exhaustion, evicts one idle object and retries exactly once.
    pub fn bind(
        &self,
        bo: &Arc<Bo>,
        cache: CacheType,
        completed: CompletedSeqnos,
    ) -> Result<usize> {
        if let Some(offset) = bo.gtt_offset_pages() {
            // Already resident; callers accept the existing binding even if
            // the cache type differs (the pin is promoted, not replaced).
            return Ok(offset);
        }
        let count = bo.page_count();
        let start = match self.gtt.alloc(count) {
            Ok(start) => start,
            Err(GfxError::NoMemory) => {
                self.evict_one(completed)?;
                self.gtt.alloc(count)?
            }
            Err(e) => return Err(e),
        };
        match self.bind_at(bo, start, cache) {
            Ok(()) => Ok(start),
            Err(GfxError::Busy) => {
                // Lost a bind race; hand back our range and use the winner's.
                self.gtt.free(start, count);
                bo.gtt_offset_pages().ok_or(GfxError::Busy)
            }
            Err(e) => {
                self.gtt.free(start, count);
                Err(e)
            }
        }
    }

    /// Bind at a caller-owned GTT range (reserved framebuffer and context
    /// regions). The range must already be claimed in the allocator.
    pub fn bind_at(&self, bo: &Arc<Bo>, start_page: usize, cache: CacheType) -> Result<()> {
        let pages = bo.physical_pages();
        if pages.is_empty() {
            return Err(GfxError::NotReady);
        }
        let mut state = bo.state.lock();
        if state.gtt_offset_pages.is_some() {
            return Err(GfxError::Busy);
        }
        self.gtt.map(start_page, &pages, cache)?;

        if bo.tiling != TilingMode::None && self.generation.uses_fence_registers() {
            let slot = match self.fences.alloc() {
                Some(slot) => slot,
                None => {
                    // Tiled binds without a fence are a bug; roll back.
                    self.gtt.unmap(start_page, pages.len());
                    return Err(GfxError::NoMemory);
                }
            };
            let (pitch_units, y_w, y_h) = match bo.tiling {
                TilingMode::X => (bo.stride / X_TILE_WIDTH, 0, 0),
                TilingMode::Y => (
                    bo.stride / Y_TILE_WIDTH,
                    bo.stride / Y_TILE_WIDTH,
                    bo.aligned_height / Y_TILE_HEIGHT,
                ),
                TilingMode::None => unreachable!(),
            };
            if let Err(e) = self
                .fences
                .program(slot, start_page, pages.len(), pitch_units, bo.tiling, y_w, y_h)
            {
                self.fences.free(slot);
                self.gtt.unmap(start_page, pages.len());
                return Err(e);
            }
            state.fence_slot = Some(slot);
        }

        state.gtt_offset_pages = Some(start_page);
        state.gtt_cache = cache;
        if state.evictable && !state.pinned {
            self.lru.lock().push_back(bo.id);
            state.on_lru = true;
        }
        Ok(())
    }

    /// Unbind from the GTT: fence off and freed, PTEs back to scratch, range
    /// released, object off the LRU.
    pub fn unbind(&self, bo: &Arc<Bo>) {
        let mut state = bo.state.lock();
        let start = match state.gtt_offset_pages.take() {
            Some(start) => start,
            None => return,
        };
        if let Some(slot) = state.fence_slot.take() {
            self.fences.disable(slot);
            self.fences.free(slot);
        }
        self.gtt.free(start, bo.page_count());
        if state.on_lru {
            self.lru.lock().retain(|id| *id != bo.id);
            state.on_lru = false;
        }
        state.gtt_cache = CacheType::Default;
    }

    /// Pin a bound object (scanout, ring, context image): off the LRU,
    /// never an eviction candidate.
    pub fn pin(&self, bo: &Arc<Bo>) {
        let mut state = bo.state.lock();
        state.pinned = true;
        if state.on_lru {
            self.lru.lock().retain(|id| *id != bo.id);
            state.on_lru = false;
        }
    }

    /// Undo a pin; a still-bound evictable object rejoins the MRU end.
    pub fn unpin(&self, bo: &Arc<Bo>) {
        let mut state = bo.state.lock();
        if !state.pinned {
            return;
        }
        state.pinned = false;
        state.evictable = true;
        if state.gtt_offset_pages.is_some() && !state.on_lru {
            self.lru.lock().push_back(bo.id);
            state.on_lru = true;
        }
    }

    /// Record a GPU use and move the object to the MRU end.
    pub fn mark_used(&self, bo: &Arc<Bo>, engine: EngineId, seqno: u32) {
        let mut state = bo.state.lock();
        state.last_used_seqno = seqno;
        state.last_used_engine = engine;
        if state.on_lru {
            let mut lru = self.lru.lock();
            lru.retain(|id| *id != bo.id);
            lru.push_back(bo.id);
        }
    }

    /// Evict the least-recently-used object that is evictable, unpinned,
    /// idle against `completed`, and clean. Fails with NoMemory when no
    /// candidate exists.
    pub fn evict_one(&self, completed: CompletedSeqnos) -> Result<()> {
        let candidates: Vec<u64> = self.lru.lock().iter().copied().collect();
        for id in candidates {
            let bo = match self.lookup(id) {
                Some(bo) => bo,
                None => continue,
            };
            {
                let state = bo.state.lock();
                if !state.on_lru || !state.evictable || state.pinned || state.dirty {
                    continue;
                }
                if !seqno_passed(completed[state.last_used_engine.index()], state.last_used_seqno)
                {
                    continue;
                }
            }
            // Hold a reference across the unbind, mirroring the LRU walk
            // contract: take ref, unlink, unbind, drop ref.
            self.get(&bo);
            self.unbind(&bo);
            self.put(&bo);
            return Ok(());
        }
        Err(GfxError::NoMemory)
    }

    pub fn lru_ids(&self) -> Vec<u64> {
        self.lru.lock().iter().copied().collect()
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().len()
    }
}
