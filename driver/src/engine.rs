// Ring-buffer command engines
//
// Each engine owns a pinned, write-combined ring object and a hardware
// status page the GPU stores sequence numbers into. Callers reserve space,
// write dwords, then advance the tail register; commands become visible to
// the GPU in ring order. Completion of seqno s implies completion of every
// earlier submission on the same engine.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{fence, AtomicBool, AtomicU32, Ordering};

use spin::Mutex;

use crate::bo::{seqno_passed, Bo, BoCreateInfo, GemManager};
use crate::errors::{GfxError, Result};
use crate::mmio::{Deadline, RegisterIo};
use crate::regs;
use crate::{CacheType, EngineId, PAGE_SIZE};

// MI / GFXPIPE command encodings
pub const MI_NOOP: u32 = 0x0000_0000;
pub const MI_FLUSH: u32 = 0x0400_0000;
pub const MI_BATCH_BUFFER_END: u32 = 0x0A00_0000;
pub const MI_SET_CONTEXT: u32 = 0x0C00_0000;
pub const MI_STORE_DATA_INDEX: u32 = 0x1080_0000 | 1;
pub const MI_BATCH_BUFFER_START: u32 = 0x1880_0000 | 1;
pub const PIPE_CONTROL: u32 = 0x7A00_0003;

pub const PIPE_CONTROL_NOTIFY: u32 = 1 << 8;
pub const PIPE_CONTROL_WRITE_IMMEDIATE: u32 = 1 << 14;
pub const PIPE_CONTROL_CS_STALL: u32 = 1 << 20;

pub const MI_SET_CONTEXT_RESTORE_INHIBIT: u32 = 1 << 2;

/// Dword index into the status page where the engine's seqno lands.
pub const HWSP_SEQNO_INDEX: usize = 0x30;

pub const RING_BYTES: usize = 32 * 1024;
const DRAIN_TIMEOUT_MS: u64 = 50;
// The hardware refuses to fill the ring completely; keep a small gap.
const RING_GAP_BYTES: usize = 8;

struct RingState {
    tail: usize,
}

pub struct Engine {
    id: EngineId,
    base: u32,
    io: Arc<dyn RegisterIo>,
    ring_bo: Arc<Bo>,
    hwsp_bo: Arc<Bo>,
    ring_size: usize,
    ring: Mutex<RingState>,
    /// Serializes the whole execbuffer emit path (bind + patch + emit).
    pub submit_lock: Mutex<()>,
    current_context: Mutex<Option<u64>>,
    next_seqno: AtomicU32,
    last_completed: AtomicU32,
}

impl Engine {
    /// Allocate and bind the ring and status page, then program the ring
    /// registers: start, control (length | enable), head = tail = 0.
    pub fn new(id: EngineId, io: Arc<dyn RegisterIo>, gem: &Arc<GemManager>) -> Result<Self> {
        let ring_bo = gem.create(
            BoCreateInfo::blob(RING_BYTES)
                .pinned()
                .cleared()
                .cached(CacheType::WriteCombining),
        )?;
        let hwsp_bo = gem.create(
            BoCreateInfo::blob(PAGE_SIZE)
                .pinned()
                .cleared()
                .cached(CacheType::Uncached),
        )?;
        let ring_start = gem.bind(&ring_bo, CacheType::WriteCombining, [0; 4])? * PAGE_SIZE;
        let hwsp_start = gem.bind(&hwsp_bo, CacheType::Uncached, [0; 4])? * PAGE_SIZE;

        let base = regs::ring_base(id);
        io.write32(base + regs::RING_HWS_PGA, hwsp_start as u32);
        io.write32(base + regs::RING_START, ring_start as u32);
        io.write32(base + regs::RING_HEAD, 0);
        io.write32(base + regs::RING_TAIL, 0);
        let pages = (RING_BYTES / PAGE_SIZE) as u32;
        io.write32(
            base + regs::RING_CTL,
            ((pages - 1) << regs::RING_CTL_SIZE_SHIFT) | regs::RING_CTL_ENABLE,
        );
        io.posting_read(base + regs::RING_CTL);

        Ok(Self {
            id,
            base,
            io,
            ring_bo,
            hwsp_bo,
            ring_size: RING_BYTES,
            ring: Mutex::new(RingState { tail: 0 }),
            submit_lock: Mutex::new(()),
            current_context: Mutex::new(None),
            next_seqno: AtomicU32::new(1),
            last_completed: AtomicU32::new(0),
        })
    }

    pub fn id(&self) -> EngineId {
        self.id
    }

    pub fn ring_bo(&self) -> &Arc<Bo> {
        &self.ring_bo
    }

    pub fn hwsp_bo(&self) -> &Arc<Bo> {
        &self.hwsp_bo
    }

    fn head(&self) -> usize {
        (self.io.read32(self.base + regs::RING_HEAD) & regs::RING_HEAD_ADDR_MASK) as usize
            % self.ring_size
    }

    pub fn tail(&self) -> usize {
        self.ring.lock().tail
    }

    fn free_bytes(&self, tail: usize) -> usize {
        let head = self.head();
        let used = (tail + self.ring_size - head) % self.ring_size;
        (self.ring_size - used).saturating_sub(RING_GAP_BYTES)
    }

    /// Mint the next sequence number for this engine.
    pub fn mint_seqno(&self) -> u32 {
        self.next_seqno.fetch_add(1, Ordering::AcqRel)
    }

    /// Latest seqno the GPU has published to the status page.
    pub fn completed_seqno(&self) -> u32 {
        let virt = match self.hwsp_bo.cpu_map() {
            Ok(virt) => virt,
            Err(_) => return self.last_completed.load(Ordering::Acquire),
        };
        let value = unsafe {
            ((virt.as_u64() + (HWSP_SEQNO_INDEX * 4) as u64) as *const u32).read_volatile()
        };
        self.last_completed.store(value, Ordering::Release);
        value
    }

    /// GTT address of the status-page dword the GPU stores seqnos into.
    pub fn hwsp_seqno_gtt_address(&self) -> u64 {
        self.hwsp_bo.gtt_address().unwrap_or(0) + (HWSP_SEQNO_INDEX * 4) as u64
    }

    /// Write `dwords` into the ring and advance the tail. Blocks for ring
    /// drain when space is short, bounded at 50 ms.
    pub fn emit(&self, dwords: &[u32]) -> Result<()> {
        let needed = dwords.len() * 4;
        if needed + RING_GAP_BYTES > self.ring_size {
            return Err(GfxError::BadValue);
        }
        let mut ring = self.ring.lock();

        if self.free_bytes(ring.tail) < needed {
            let deadline = Deadline::after_ms(DRAIN_TIMEOUT_MS);
            while self.free_bytes(ring.tail) < needed {
                if deadline.expired() {
                    return Err(GfxError::TimedOut);
                }
                core::hint::spin_loop();
            }
        }

        let virt = self.ring_bo.cpu_map()?;
        let mut tail = ring.tail;
        for dword in dwords {
            unsafe {
                ((virt.as_u64() + tail as u64) as *mut u32).write_volatile(*dword);
            }
            tail = (tail + 4) % self.ring_size;
        }

        // Order the ring stores ahead of the tail write the GPU fetches on.
        fence(Ordering::SeqCst);
        ring.tail = tail;
        self.io.write32(self.base + regs::RING_TAIL, tail as u32);
        self.io.posting_read(self.base + regs::RING_TAIL);
        Ok(())
    }

    /// Emit the seqno store for this engine: PIPE_CONTROL on the render
    /// engine, flush + MI_STORE_DATA_INDEX elsewhere.
    pub fn seqno_store_commands(&self, seqno: u32, out: &mut Vec<u32>) {
        match self.id {
            EngineId::Rcs => {
                out.push(PIPE_CONTROL);
                out.push(PIPE_CONTROL_WRITE_IMMEDIATE | PIPE_CONTROL_CS_STALL | PIPE_CONTROL_NOTIFY);
                out.push(self.hwsp_seqno_gtt_address() as u32);
                out.push(seqno);
                out.push(0);
            }
            _ => {
                out.push(MI_FLUSH);
                out.push(MI_STORE_DATA_INDEX);
                out.push((HWSP_SEQNO_INDEX * 4) as u32);
                out.push(seqno);
            }
        }
    }

    /// Block until the status page reaches `seqno`, up to `timeout_us`.
    /// Wrap-safe; wakeable early by the completion interrupt publishing the
    /// seqno, or by `interrupt` going high.
    pub fn wait_seqno(
        &self,
        seqno: u32,
        timeout_us: u64,
        interrupt: Option<&AtomicBool>,
    ) -> Result<()> {
        let deadline = Deadline::after_us(timeout_us);
        loop {
            if seqno_passed(self.completed_seqno(), seqno) {
                return Ok(());
            }
            if let Some(flag) = interrupt {
                if flag.load(Ordering::Acquire) {
                    return Err(GfxError::Interrupted);
                }
            }
            if deadline.expired() {
                return Err(GfxError::TimedOut);
            }
            core::hint::spin_loop();
        }
    }

    pub fn current_context(&self) -> Option<u64> {
        *self.current_context.lock()
    }

    pub fn set_current_context(&self, context: Option<u64>) {
        *self.current_context.lock() = context;
    }
}
