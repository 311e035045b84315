// Device aggregate
//
// One `Device` per PCI graphics function. Owns the register window, the
// global GTT and scratch page, the GEM manager, the engine set, the port
// table and the display state. All mutation goes through the locks the
// individual subsystems carry; the device itself adds the handle tables and
// the shared-info snapshot user space maps read-only.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use lazy_static::lazy_static;
use spin::{Mutex, RwLock};
use x86_64::VirtAddr;

use crate::bo::{Bo, BoCreateInfo, CompletedSeqnos, GemManager};
use crate::connector::{Hotplug, Port, PortDesc};
use crate::context::Context;
use crate::display::DisplayState;
use crate::engine::Engine;
use crate::errors::{GfxError, Result};
use crate::execbuf::{self, ResolvedReloc};
use crate::fence::FenceRegisters;
use crate::forcewake::{ForceWake, ForceWakeDomain};
use crate::gtt::Gtt;
use crate::mmio::RegisterIo;
use crate::platform::{self, GenOps};
use crate::ppgtt::{Ppgtt, PpgttKind};
use crate::{
    DisplayMode, EngineId, Generation, OsMemory, PipeId, WiredRegion, MAX_ENGINES, MAX_PIPES,
    PAGE_SIZE, VENDOR_INTEL,
};

/// Everything the PCI probe hands the driver core.
pub struct DeviceConfig {
    pub vendor_id: u16,
    pub device_id: u16,
    pub mmio: Arc<dyn RegisterIo>,
    pub os_mem: Arc<dyn OsMemory>,
    /// CPU mapping of the GTT PTE store.
    pub gtt_table: VirtAddr,
    /// GPU aperture covered by the GTT.
    pub aperture_size: usize,
    /// Connector topology from the VBT.
    pub ports: Vec<PortDesc>,
}

/// Read-only state page shared with user space; rewritten only after a
/// fully successful commit so readers never observe a torn transition.
#[derive(Debug, Clone)]
pub struct SharedInfo {
    pub current_modes: [Option<DisplayMode>; MAX_PIPES],
    pub primary_pipe: PipeId,
    pub active_display_count: u32,
    pub change_count: u64,
}

impl SharedInfo {
    fn new() -> Self {
        Self {
            current_modes: [None; MAX_PIPES],
            primary_pipe: PipeId::A,
            active_display_count: 0,
            change_count: 0,
        }
    }
}

/// Bounded slot table mapping small integer handles to driver objects.
pub struct HandleTable<T> {
    slots: Vec<Option<T>>,
    free: Vec<u32>,
}

const HANDLE_TABLE_CAPACITY: usize = 4096;

impl<T> HandleTable<T> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    fn insert(&mut self, value: T) -> Result<u32> {
        if let Some(slot) = self.free.pop() {
            self.slots[slot as usize] = Some(value);
            return Ok(slot + 1);
        }
        if self.slots.len() >= HANDLE_TABLE_CAPACITY {
            return Err(GfxError::NoMemory);
        }
        self.slots.push(Some(value));
        Ok(self.slots.len() as u32)
    }

    fn get(&self, handle: u32) -> Option<&T> {
        if handle == 0 {
            return None;
        }
        self.slots.get(handle as usize - 1)?.as_ref()
    }

    fn remove(&mut self, handle: u32) -> Option<T> {
        if handle == 0 {
            return None;
        }
        let slot = self.slots.get_mut(handle as usize - 1)?;
        let value = slot.take()?;
        self.free.push(handle - 1);
        Some(value)
    }
}

/// Reserved per-pipe scanout range in the GTT.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FbRegion {
    pub start_page: usize,
    pub page_count: usize,
}

pub struct Device {
    generation: Generation,
    ops: &'static dyn GenOps,
    io: Arc<dyn RegisterIo>,
    os_mem: Arc<dyn OsMemory>,
    pub forcewake: Arc<ForceWake>,
    scratch: Mutex<Option<WiredRegion>>,
    pub gtt: Arc<Gtt>,
    pub fences: Arc<FenceRegisters>,
    pub gem: Arc<GemManager>,
    engines: Vec<Engine>,
    pub(crate) fb_regions: [Option<FbRegion>; MAX_PIPES],
    ports: Vec<Arc<Port>>,
    pub hotplug: Hotplug,
    contexts: Mutex<BTreeMap<u64, Arc<Context>>>,
    next_context_id: AtomicU64,
    bo_handles: Mutex<HandleTable<Arc<Bo>>>,
    context_handles: Mutex<HandleTable<u64>>,
    /// Held across an entire display commit; the display state lives inside.
    pub(crate) display: Mutex<DisplayState>,
    shared_info: Mutex<SharedInfo>,
    signal_pending: AtomicBool,
}

impl Device {
    pub fn new(config: DeviceConfig) -> Result<Arc<Self>> {
        if config.vendor_id != VENDOR_INTEL {
            return Err(GfxError::Unsupported);
        }
        let generation =
            Generation::from_device_id(config.device_id).ok_or(GfxError::Unsupported)?;
        let ops = platform::ops_for(generation);
        log::info!(
            "intel-gfx: device {:04x} is {} ({:?})",
            config.device_id,
            ops.name(),
            generation
        );

        let forcewake = Arc::new(ForceWake::new(config.mmio.clone()));

        let mut scratch = config.os_mem.alloc_wired(PAGE_SIZE)?;
        let scratch_phys = match scratch.pages.first() {
            Some(page) => *page,
            None => {
                config.os_mem.free_wired(&mut scratch);
                return Err(GfxError::NoMemory);
            }
        };

        let gtt = Arc::new(Gtt::new(
            config.mmio.clone(),
            config.gtt_table,
            config.aperture_size,
            scratch_phys,
        ));
        let fences = Arc::new(FenceRegisters::new(
            config.mmio.clone(),
            forcewake.clone(),
            ops.fence_register_count(),
        ));
        let gem = Arc::new(GemManager::new(
            config.os_mem.clone(),
            gtt.clone(),
            fences.clone(),
            generation,
        ));

        // Deterministic scanout regions, one per pipe, right after the
        // reserved scratch entry.
        let aperture_pages = config.aperture_size / PAGE_SIZE;
        let pipe_count = ops.pipe_count();
        let fb_pages = (aperture_pages / (pipe_count * 4)).min(2048);
        let mut fb_regions = [None; MAX_PIPES];
        for pipe in 0..pipe_count {
            let start_page = 1 + pipe * fb_pages;
            if fb_pages > 0 && gtt.reserve_range(start_page, fb_pages).is_ok() {
                fb_regions[pipe] = Some(FbRegion {
                    start_page,
                    page_count: fb_pages,
                });
            }
        }

        let mut engines = Vec::with_capacity(MAX_ENGINES);
        for index in 0..MAX_ENGINES {
            let id = EngineId::from_index(index).ok_or(GfxError::BadValue)?;
            engines.push(Engine::new(id, config.mmio.clone(), &gem)?);
        }

        let ports: Vec<Arc<Port>> = config
            .ports
            .iter()
            .map(|desc| Arc::new(Port::new(*desc)))
            .collect();

        let display = DisplayState::new(ops);

        let device = Arc::new(Self {
            generation,
            ops,
            io: config.mmio,
            os_mem: config.os_mem,
            forcewake,
            scratch: Mutex::new(Some(scratch)),
            gtt,
            fences,
            gem,
            engines,
            fb_regions,
            ports,
            hotplug: Hotplug::new(),
            contexts: Mutex::new(BTreeMap::new()),
            next_context_id: AtomicU64::new(1),
            bo_handles: Mutex::new(HandleTable::new()),
            context_handles: Mutex::new(HandleTable::new()),
            display: Mutex::new(display),
            shared_info: Mutex::new(SharedInfo::new()),
            signal_pending: AtomicBool::new(false),
        });
        device.probe_ports();
        Ok(device)
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn ops(&self) -> &'static dyn GenOps {
        self.ops
    }

    pub fn io(&self) -> &Arc<dyn RegisterIo> {
        &self.io
    }

    pub fn engine(&self, id: EngineId) -> &Engine {
        &self.engines[id.index()]
    }

    pub fn ports(&self) -> &[Arc<Port>] {
        &self.ports
    }

    pub fn port_by_connector(&self, connector_id: u32) -> Option<&Arc<Port>> {
        self.ports
            .iter()
            .find(|port| port.desc.connector_id == connector_id)
    }

    /// Completed-seqno snapshot across every engine, for idleness checks.
    pub fn completed_snapshot(&self) -> CompletedSeqnos {
        let mut snapshot = [0u32; MAX_ENGINES];
        for (index, engine) in self.engines.iter().enumerate() {
            snapshot[index] = engine.completed_seqno();
        }
        snapshot
    }

    // Connector probing and hot-plug

    pub fn probe_ports(&self) {
        let _wake = self.forcewake.acquire(ForceWakeDomain::Display);
        for port in &self.ports {
            port.probe(&*self.io);
            log::debug!(
                "intel-gfx: connector {} ({:?}) {}",
                port.desc.connector_id,
                port.desc.port_type,
                if port.is_connected() {
                    "connected"
                } else {
                    "disconnected"
                }
            );
        }
    }

    /// Hot-plug ISR bottom half: re-probe the port, then wake waiters.
    pub fn hpd_event(&self, connector_id: u32) {
        if let Some(port) = self.port_by_connector(connector_id) {
            let _wake = self.forcewake.acquire(ForceWakeDomain::Display);
            port.probe(&*self.io);
        }
        self.hotplug.post(connector_id);
    }

    pub fn wait_for_display_change(&self, timeout_us: u64) -> Result<u32> {
        self.hotplug
            .wait_for_change(timeout_us, Some(&self.signal_pending))
    }

    /// Deliver a signal to blocked waiters; they return `Interrupted`.
    pub fn post_signal(&self) {
        self.signal_pending.store(true, Ordering::Release);
    }

    pub fn clear_signal(&self) {
        self.signal_pending.store(false, Ordering::Release);
    }

    // GEM object handles

    pub fn gem_create(&self, info: BoCreateInfo) -> Result<u32> {
        let bo = self.gem.create(info)?;
        let mut handles = self.bo_handles.lock();
        match handles.insert(bo.clone()) {
            Ok(handle) => Ok(handle),
            Err(e) => {
                drop(handles);
                self.gem.put(&bo);
                Err(e)
            }
        }
    }

    pub fn gem_close(&self, handle: u32) -> Result<()> {
        let bo = self
            .bo_handles
            .lock()
            .remove(handle)
            .ok_or(GfxError::BadIndex)?;
        self.gem.put(&bo);
        Ok(())
    }

    pub fn lookup_bo(&self, handle: u32) -> Result<Arc<Bo>> {
        self.bo_handles
            .lock()
            .get(handle)
            .cloned()
            .ok_or(GfxError::BadIndex)
    }

    pub fn gem_mmap(&self, handle: u32) -> Result<VirtAddr> {
        self.lookup_bo(handle)?.cpu_map()
    }

    // Contexts

    pub fn context_create(&self, ppgtt_kind: Option<PpgttKind>) -> Result<u32> {
        let ppgtt = match ppgtt_kind {
            Some(kind) => Some(Ppgtt::new(
                kind,
                self.gem.clone(),
                self.io.clone(),
                self.gtt.scratch_phys(),
            )?),
            None => None,
        };
        let id = self.next_context_id.fetch_add(1, Ordering::AcqRel);
        let engine = self.engine(EngineId::Rcs);
        let image_bytes = self.ops.context_image_bytes(EngineId::Rcs);
        let context = match Context::new(id, &self.gem, engine, image_bytes, ppgtt.clone()) {
            Ok(context) => context,
            Err(e) => {
                if let Some(ppgtt) = ppgtt {
                    ppgtt.put();
                }
                return Err(e);
            }
        };
        self.contexts.lock().insert(id, context);
        let handle = self.context_handles.lock().insert(id);
        match handle {
            Ok(handle) => Ok(handle),
            Err(e) => {
                if let Some(context) = self.contexts.lock().remove(&id) {
                    context.put(&self.gem);
                }
                Err(e)
            }
        }
    }

    pub fn context_destroy(&self, handle: u32) -> Result<()> {
        let id = self
            .context_handles
            .lock()
            .remove(handle)
            .ok_or(GfxError::BadIndex)?;
        let context = self.contexts.lock().remove(&id).ok_or(GfxError::BadIndex)?;
        for engine in &self.engines {
            if engine.current_context() == Some(id) {
                engine.set_current_context(None);
            }
        }
        context.put(&self.gem);
        Ok(())
    }

    pub fn lookup_context(&self, handle: u32) -> Result<Arc<Context>> {
        let id = *self
            .context_handles
            .lock()
            .get(handle)
            .ok_or(GfxError::BadIndex)?;
        self.contexts
            .lock()
            .get(&id)
            .cloned()
            .ok_or(GfxError::BadIndex)
    }

    // Submission

    /// Relocation entry as it arrives from user space.
    pub fn gem_execbuffer(
        &self,
        cmd_handle: u32,
        length: usize,
        engine_id: EngineId,
        relocs: &[(u32, u32, u32, bool)],
        context_handle: Option<u32>,
    ) -> Result<u32> {
        let cmd_bo = self.lookup_bo(cmd_handle)?;
        let mut resolved = Vec::with_capacity(relocs.len());
        for (target_handle, offset, delta, write) in relocs {
            resolved.push(ResolvedReloc {
                target: self.lookup_bo(*target_handle)?,
                offset: *offset,
                delta: *delta,
                write: *write,
            });
        }
        let context = match context_handle {
            Some(handle) => Some(self.lookup_context(handle)?),
            None => None,
        };
        let engine = self.engine(engine_id);
        let seqno = execbuf::submit(
            &self.gem,
            engine,
            &cmd_bo,
            length,
            &resolved,
            context.as_ref(),
            self.completed_snapshot(),
        )?;
        Ok(seqno)
    }

    pub fn gem_wait(&self, engine_id: EngineId, seqno: u32, timeout_us: u64) -> Result<()> {
        let engine = self.engine(engine_id);
        engine.wait_seqno(seqno, timeout_us, Some(&self.signal_pending))?;
        self.retire(engine_id);
        Ok(())
    }

    pub fn gem_flush_and_get_seqno(&self, engine_id: EngineId) -> Result<u32> {
        execbuf::flush_and_get_seqno(self.engine(engine_id))
    }

    /// Completion bookkeeping: fold the engine's published seqno into every
    /// context that submitted work on it.
    pub fn retire(&self, engine_id: EngineId) {
        let completed = self.engine(engine_id).completed_seqno();
        for context in self.contexts.lock().values() {
            context.record_completion(engine_id, completed);
        }
    }

    /// Engine completion ISR entry: latch the status page and retire.
    pub fn handle_engine_interrupt(&self, engine_id: EngineId) {
        self.retire(engine_id);
    }

    // Shared info

    pub fn shared_info(&self) -> SharedInfo {
        self.shared_info.lock().clone()
    }

    pub(crate) fn publish_shared_info(&self, info: SharedInfo) {
        *self.shared_info.lock() = info;
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Some(mut scratch) = self.scratch.lock().take() {
            self.os_mem.free_wired(&mut scratch);
        }
    }
}

lazy_static! {
    /// Probed-device table; the only process-wide state in the crate.
    pub static ref DEVICES: RwLock<Vec<Arc<Device>>> = RwLock::new(Vec::new());
}

pub fn register_device(device: Arc<Device>) {
    DEVICES.write().push(device);
}

pub fn device_count() -> usize {
    DEVICES.read().len()
}
