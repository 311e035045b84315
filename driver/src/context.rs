// GEM contexts
//
// A context is a saved hardware image the engine switches to, plus an
// optional per-process address space. The image object stays pinned,
// GTT-bound and uncached for the context's whole life; the hardware
// re-enables the ring in the image on context switch, so the stored ring
// control keeps ENABLE clear.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use x86_64::VirtAddr;

use crate::bo::{Bo, BoCreateInfo, GemManager};
use crate::engine::Engine;
use crate::errors::{GfxError, Result};
use crate::ppgtt::Ppgtt;
use crate::regs;
use crate::{CacheType, EngineId, MAX_ENGINES, PAGE_SIZE};

// Dword offsets inside the context image
const CTX_CONTEXT_CONTROL: usize = 0x01;
const CTX_RING_HEAD: usize = 0x02;
const CTX_RING_TAIL: usize = 0x03;
const CTX_RING_BUFFER_START: usize = 0x04;
const CTX_RING_BUFFER_CONTROL: usize = 0x05;
const CTX_BB_STATE: usize = 0x06;
const CTX_PDP0_LO: usize = 0x30;
const CTX_PDP0_HI: usize = 0x31;

#[derive(Debug)]
pub struct EngineSeqnos {
    pub last_submitted: AtomicU32,
    pub last_completed: AtomicU32,
}

impl EngineSeqnos {
    fn new() -> Self {
        Self {
            last_submitted: AtomicU32::new(0),
            last_completed: AtomicU32::new(0),
        }
    }
}

pub struct Context {
    id: u64,
    refcount: AtomicU32,
    image_bo: Arc<Bo>,
    ppgtt: Option<Arc<Ppgtt>>,
    priority: AtomicI32,
    engine_state: [EngineSeqnos; MAX_ENGINES],
}

impl core::fmt::Debug for Context {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("refcount", &self.refcount)
            .field("image_bo", &self.image_bo)
            .field("priority", &self.priority)
            .field("engine_state", &self.engine_state)
            .finish()
    }
}

impl Context {
    /// Build the hardware image for `engine` and attach `ppgtt` if given.
    pub fn new(
        id: u64,
        gem: &Arc<GemManager>,
        engine: &Engine,
        image_bytes: usize,
        ppgtt: Option<Arc<Ppgtt>>,
    ) -> Result<Arc<Self>> {
        let image_bo = gem.create(
            BoCreateInfo::blob(image_bytes)
                .pinned()
                .cleared()
                .cached(CacheType::Uncached),
        )?;
        gem.bind(&image_bo, CacheType::Uncached, [0; 4])?;

        let image = image_bo.cpu_map()?;
        let ring_start = engine.ring_bo().gtt_address().ok_or(GfxError::NotReady)? as u32;
        let ring_pages = (engine.ring_bo().allocated_size() / PAGE_SIZE) as u32;
        // ENABLE stays clear in the image; hardware sets it on switch-in.
        let ring_control = (ring_pages - 1) << regs::RING_CTL_SIZE_SHIFT;

        write_image(image, CTX_CONTEXT_CONTROL, 0);
        write_image(image, CTX_RING_HEAD, 0);
        write_image(image, CTX_RING_TAIL, 0);
        write_image(image, CTX_RING_BUFFER_START, ring_start);
        write_image(image, CTX_RING_BUFFER_CONTROL, ring_control);
        write_image(image, CTX_BB_STATE, 0);
        match &ppgtt {
            Some(ppgtt) => {
                let dir = ppgtt.directory_phys().as_u64();
                write_image(image, CTX_PDP0_LO, dir as u32);
                write_image(image, CTX_PDP0_HI, (dir >> 32) as u32);
            }
            None => {
                write_image(image, CTX_PDP0_LO, 0);
                write_image(image, CTX_PDP0_HI, 0);
            }
        }

        Ok(Arc::new(Self {
            id,
            refcount: AtomicU32::new(1),
            image_bo,
            ppgtt,
            priority: AtomicI32::new(0),
            engine_state: [
                EngineSeqnos::new(),
                EngineSeqnos::new(),
                EngineSeqnos::new(),
                EngineSeqnos::new(),
            ],
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    pub fn get(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop a reference. The last put detaches the address space and
    /// releases the image: unbind, then put.
    pub fn put(&self, gem: &Arc<GemManager>) {
        if self.refcount.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        if let Some(ppgtt) = &self.ppgtt {
            ppgtt.put();
        }
        gem.unbind(&self.image_bo);
        gem.put(&self.image_bo);
    }

    pub fn image_bo(&self) -> &Arc<Bo> {
        &self.image_bo
    }

    /// GTT address of the image, as consumed by MI_SET_CONTEXT.
    pub fn image_gtt_address(&self) -> Option<u64> {
        self.image_bo.gtt_address()
    }

    pub fn ppgtt(&self) -> Option<&Arc<Ppgtt>> {
        self.ppgtt.as_ref()
    }

    pub fn priority(&self) -> i32 {
        self.priority.load(Ordering::Relaxed)
    }

    pub fn set_priority(&self, priority: i32) {
        self.priority.store(priority, Ordering::Relaxed);
    }

    pub fn record_submission(&self, engine: EngineId, seqno: u32) {
        self.engine_state[engine.index()]
            .last_submitted
            .store(seqno, Ordering::Release);
    }

    pub fn record_completion(&self, engine: EngineId, seqno: u32) {
        let state = &self.engine_state[engine.index()];
        let submitted = state.last_submitted.load(Ordering::Acquire);
        // Completion can never run ahead of submission.
        let clamped = if (seqno.wrapping_sub(submitted) as i32) > 0 {
            submitted
        } else {
            seqno
        };
        state.last_completed.store(clamped, Ordering::Release);
    }

    pub fn last_submitted(&self, engine: EngineId) -> u32 {
        self.engine_state[engine.index()]
            .last_submitted
            .load(Ordering::Acquire)
    }

    pub fn last_completed(&self, engine: EngineId) -> u32 {
        self.engine_state[engine.index()]
            .last_completed
            .load(Ordering::Acquire)
    }
}

fn write_image(image: VirtAddr, index: usize, value: u32) {
    unsafe {
        ((image.as_u64() + index as u64 * 4) as *mut u32).write_volatile(value);
    }
}
