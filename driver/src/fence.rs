// Fence registers
//
// Small fixed pool of hardware detiling windows for X/Y-tiled surfaces on
// pre-Gen9 parts. A slot is programmed with the GTT range and tile pitch of
// exactly one bound buffer object; the object records the slot id and gives
// it back on unbind. All programming runs inside a RENDER force-wake scope.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use crate::errors::{GfxError, Result};
use crate::forcewake::{ForceWake, ForceWakeDomain};
use crate::mmio::RegisterIo;
use crate::regs;
use crate::TilingMode;

pub const MAX_FENCE_REGS: usize = 32;

pub struct FenceRegisters {
    io: Arc<dyn RegisterIo>,
    forcewake: Arc<ForceWake>,
    used: Mutex<Vec<bool>>,
    count: usize,
}

impl FenceRegisters {
    pub fn new(io: Arc<dyn RegisterIo>, forcewake: Arc<ForceWake>, count: usize) -> Self {
        let count = count.min(MAX_FENCE_REGS);
        Self {
            io,
            forcewake,
            used: Mutex::new(vec![false; count]),
            count,
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn alloc(&self) -> Option<usize> {
        let mut used = self.used.lock();
        for (slot, in_use) in used.iter_mut().enumerate() {
            if !*in_use {
                *in_use = true;
                return Some(slot);
            }
        }
        None
    }

    pub fn free(&self, slot: usize) {
        if slot < self.count {
            self.used.lock()[slot] = false;
        }
    }

    /// Program `slot` to detile the GTT range `[start_page, start_page +
    /// page_count)`. `pitch_units` is the surface stride in tile widths; for
    /// Y tiling the tile width/height counts are programmed as well.
    pub fn program(
        &self,
        slot: usize,
        start_page: usize,
        page_count: usize,
        pitch_units: u32,
        tiling: TilingMode,
        y_tile_width: u32,
        y_tile_height: u32,
    ) -> Result<()> {
        if slot >= self.count || tiling == TilingMode::None {
            return Err(GfxError::BadValue);
        }
        if pitch_units == 0 || pitch_units > 0x1000 {
            return Err(GfxError::BadValue);
        }
        let mut lo = regs::FENCE_VALID | ((pitch_units - 1) << regs::FENCE_PITCH_SHIFT);
        if tiling == TilingMode::Y {
            if y_tile_width == 0 || y_tile_height == 0 {
                return Err(GfxError::BadValue);
            }
            lo |= regs::FENCE_TILING_Y;
            lo |= (y_tile_width - 1) << regs::FENCE_Y_WIDTH_SHIFT;
            lo |= (y_tile_height - 1) << regs::FENCE_Y_HEIGHT_SHIFT;
        }
        let end_page = start_page + page_count;
        let hi = ((end_page as u32) << 16) | start_page as u32;

        let _wake = self.forcewake.acquire(ForceWakeDomain::Render)?;
        self.io.write32(regs::fence_reg_lo(slot), 0); // quiesce before retarget
        self.io.write32(regs::fence_reg_hi(slot), hi);
        self.io.write32(regs::fence_reg_lo(slot), lo);
        self.io.posting_read(regs::fence_reg_lo(slot));
        Ok(())
    }

    pub fn disable(&self, slot: usize) {
        if slot >= self.count {
            return;
        }
        if let Ok(_wake) = self.forcewake.acquire(ForceWakeDomain::Render) {
            self.io.write32(regs::fence_reg_lo(slot), 0);
            self.io.posting_read(regs::fence_reg_lo(slot));
        }
    }

    #[cfg(test)]
    pub fn used_count(&self) -> usize {
        self.used.lock().iter().filter(|u| **u).count()
    }
}
