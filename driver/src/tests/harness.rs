// Test fixtures: a reactive register-file model standing in for the GPU,
// a heap-backed wired-memory provider, and canned EDID/DPCD sinks.
//
// The fake hardware mirrors just enough behavior for the driver's bounded
// polls to converge: force-wake acks follow requests, ring HEAD follows
// TAIL (a GPU that drains instantly), DPLL lock and pipe-active follow
// their enables, the panel power status follows its control bit, GMBUS
// serves a canned EDID and the AUX channel a canned DPCD.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;
use x86_64::{PhysAddr, VirtAddr};

use crate::bo::{BoCreateInfo, BoSize};
use crate::connector::PortDesc;
use crate::device::{Device, DeviceConfig};
use crate::display::PipeConfigRequest;
use crate::engine::HWSP_SEQNO_INDEX;
use crate::errors::{GfxError, Result};
use crate::mmio::RegisterIo;
use crate::regs;
use crate::{
    CacheType, DisplayMode, DisplayModeFlags, EngineId, OsMemory, PipeId, PortType, TilingMode,
    WiredRegion, PAGE_SIZE, VENDOR_INTEL,
};

const RING_BASES: [u32; 4] = [
    regs::RING_BASE_RCS,
    regs::RING_BASE_BCS,
    regs::RING_BASE_VCS,
    regs::RING_BASE_VECS,
];

const MAX_FAKE_PORTS: usize = 8;
const DPCD_BYTES: usize = 0x300;

pub struct FakeHw {
    registers: Mutex<BTreeMap<u32, u32>>,
    write_counts: Mutex<BTreeMap<u32, usize>>,
    edid: Mutex<Option<Vec<u8>>>,
    gmbus_pos: Mutex<usize>,
    dpcd: Mutex<[u8; DPCD_BYTES]>,
    frame_tick: Mutex<u64>,
}

impl FakeHw {
    pub fn new() -> Self {
        let mut dpcd = [0u8; DPCD_BYTES];
        dpcd[0x000] = 0x12; // DPCD 1.2
        dpcd[0x001] = 0x14; // HBR2
        dpcd[0x002] = 0x04; // four lanes
        dpcd[0x202] = 0x77; // lanes 0/1: CR + EQ + symbol lock
        dpcd[0x203] = 0x77; // lanes 2/3
        Self {
            registers: Mutex::new(BTreeMap::new()),
            write_counts: Mutex::new(BTreeMap::new()),
            edid: Mutex::new(None),
            gmbus_pos: Mutex::new(0),
            dpcd: Mutex::new(dpcd),
            frame_tick: Mutex::new(0),
        }
    }

    pub fn set_edid(&self, edid: Option<Vec<u8>>) {
        *self.edid.lock() = edid;
    }

    pub fn set_dpcd(&self, address: usize, value: u8) {
        self.dpcd.lock()[address] = value;
    }

    pub fn reg(&self, offset: u32) -> u32 {
        self.registers.lock().get(&offset).copied().unwrap_or(0)
    }

    pub fn write_count(&self, offset: u32) -> usize {
        self.write_counts.lock().get(&offset).copied().unwrap_or(0)
    }

    fn stored(map: &BTreeMap<u32, u32>, offset: u32) -> u32 {
        map.get(&offset).copied().unwrap_or(0)
    }

    fn is_dpll_ctl(offset: u32) -> bool {
        (0..4).any(|i| offset == regs::pch_dpll_ctl(i) || offset == regs::wrpll_ctl(i))
    }

    fn aux_ctl_port(offset: u32) -> Option<usize> {
        (0..MAX_FAKE_PORTS).find(|p| offset == regs::aux_ctl(*p))
    }

    fn run_aux_transaction(&self, map: &mut BTreeMap<u32, u32>, port: usize) {
        let request = Self::stored(map, regs::aux_data(port, 0));
        let is_read = request & (1 << 31) != 0;
        let length = (((request >> 24) & 0x1F) as usize + 1).min(16);
        let address = (request & 0xF_FFFF) as usize;
        let mut dpcd = self.dpcd.lock();
        if is_read {
            for word_index in 0..(length + 3) / 4 {
                let mut word = 0u32;
                for byte in 0..4 {
                    let i = word_index * 4 + byte;
                    if i < length && address + i < DPCD_BYTES {
                        word |= (dpcd[address + i] as u32) << (byte * 8);
                    }
                }
                map.insert(regs::aux_data(port, 1 + word_index), word);
            }
        } else {
            for i in 0..length {
                let word = Self::stored(map, regs::aux_data(port, 1 + i / 4));
                if address + i < DPCD_BYTES {
                    dpcd[address + i] = (word >> ((i % 4) * 8)) as u8;
                }
            }
        }
    }
}

impl RegisterIo for FakeHw {
    fn read32(&self, offset: u32) -> u32 {
        // Force-wake acks mirror the request registers.
        let ack_pairs = [
            (regs::FORCEWAKE_ACK_RENDER, regs::FORCEWAKE_REQ_RENDER),
            (regs::FORCEWAKE_ACK_MEDIA, regs::FORCEWAKE_REQ_MEDIA),
            (regs::FORCEWAKE_ACK_DISPLAY, regs::FORCEWAKE_REQ_DISPLAY),
        ];
        for (ack, req) in ack_pairs {
            if offset == ack {
                return self.reg(req) & regs::FORCEWAKE_KERNEL_BIT;
            }
        }

        // Ring HEAD follows TAIL: the modeled GPU drains instantly.
        for base in RING_BASES {
            if offset == base + regs::RING_HEAD {
                return self.reg(base + regs::RING_TAIL) & regs::RING_HEAD_ADDR_MASK;
            }
        }

        if offset == regs::GMBUS2 {
            return if self.edid.lock().is_some() {
                regs::GMBUS2_HW_RDY
            } else {
                regs::GMBUS2_SATOER
            };
        }
        if offset == regs::GMBUS3 {
            let mut pos = self.gmbus_pos.lock();
            let edid = self.edid.lock();
            let mut word = 0u32;
            if let Some(edid) = edid.as_ref() {
                for byte in 0..4 {
                    let index = *pos + byte;
                    if index < edid.len() {
                        word |= (edid[index] as u32) << (byte * 8);
                    }
                }
            }
            *pos += 4;
            return word;
        }

        let map = self.registers.lock();
        let stored = Self::stored(&map, offset);

        // The frame counter runs while its pipe is scanning out; every read
        // lands in a later frame than the one before.
        for index in 0..4 {
            if let Some(pipe) = PipeId::from_index(index) {
                if offset == regs::pipe_frame_counter(pipe) {
                    if Self::stored(&map, regs::pipe_conf(pipe)) & regs::PIPE_CONF_ENABLE != 0 {
                        let mut tick = self.frame_tick.lock();
                        *tick += 1;
                        return *tick as u32;
                    }
                    return 0;
                }
            }
        }

        // Status bits that track their enables.
        for index in 0..4 {
            if let Some(pipe) = PipeId::from_index(index) {
                if offset == regs::pipe_conf(pipe) {
                    return if stored & regs::PIPE_CONF_ENABLE != 0 {
                        stored | regs::PIPE_CONF_ACTIVE
                    } else {
                        stored & !regs::PIPE_CONF_ACTIVE
                    };
                }
            }
        }
        if Self::is_dpll_ctl(offset) {
            return if stored & regs::DPLL_ENABLE != 0 {
                stored | regs::DPLL_LOCK
            } else {
                stored & !regs::DPLL_LOCK
            };
        }
        if offset == regs::PP_STATUS {
            let control = Self::stored(&map, regs::PP_CONTROL);
            return if control & regs::PP_CONTROL_POWER_ON != 0 {
                regs::PP_STATUS_ON
            } else {
                0
            };
        }

        stored
    }

    fn write32(&self, offset: u32, value: u32) {
        *self.write_counts.lock().entry(offset).or_insert(0) += 1;

        if offset == regs::GMBUS1 {
            if value & regs::GMBUS1_SW_GO != 0 {
                *self.gmbus_pos.lock() = ((value >> 8) & 0xFF) as usize;
            }
            self.registers.lock().insert(offset, value);
            return;
        }

        if let Some(port) = Self::aux_ctl_port(offset) {
            let mut map = self.registers.lock();
            if value & regs::AUX_CTL_SEND_BUSY != 0 {
                self.run_aux_transaction(&mut map, port);
                map.insert(offset, (value & !regs::AUX_CTL_SEND_BUSY) | regs::AUX_CTL_DONE);
            } else {
                map.insert(offset, value);
            }
            return;
        }

        self.registers.lock().insert(offset, value);
    }
}

// Heap-backed wired memory with identity phys == virt.

pub struct FakeMemory;

impl FakeMemory {
    pub fn new() -> Self {
        Self
    }
}

impl OsMemory for FakeMemory {
    fn alloc_wired(&self, size: usize) -> Result<WiredRegion> {
        let size = size.max(PAGE_SIZE);
        let layout = core::alloc::Layout::from_size_align(size, PAGE_SIZE)
            .map_err(|_| GfxError::BadValue)?;
        let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(GfxError::NoMemory);
        }
        let virt = ptr as u64;
        let pages = (0..size / PAGE_SIZE)
            .map(|i| PhysAddr::new(virt + (i * PAGE_SIZE) as u64))
            .collect();
        Ok(WiredRegion {
            virt: VirtAddr::new(virt),
            size,
            pages,
        })
    }

    fn free_wired(&self, region: &mut WiredRegion) {
        if region.size == 0 {
            return;
        }
        let layout =
            core::alloc::Layout::from_size_align(region.size, PAGE_SIZE).expect("layout");
        unsafe {
            alloc::alloc::dealloc(region.virt.as_u64() as *mut u8, layout);
        }
        region.size = 0;
        region.pages.clear();
    }

    fn set_memory_type(&self, _region: &WiredRegion, _cache: CacheType) -> Result<()> {
        Ok(())
    }
}

// Device rig

pub struct TestRig {
    pub device: Arc<Device>,
    pub hw: Arc<FakeHw>,
    pub mem: Arc<FakeMemory>,
}

pub const APERTURE_DEFAULT: usize = 64 * 1024 * 1024;
pub const DEVICE_ID_HASWELL: u16 = 0x0416;
pub const DEVICE_ID_IVYBRIDGE: u16 = 0x0166;
pub const DEVICE_ID_SKYLAKE: u16 = 0x1916;

pub fn standard_ports() -> Vec<PortDesc> {
    vec![
        PortDesc {
            connector_id: 1,
            port_type: PortType::Edp,
            port_index: 0,
            gmbus_pin: 3,
            aux_index: 0,
        },
        PortDesc {
            connector_id: 2,
            port_type: PortType::Hdmi,
            port_index: 2,
            gmbus_pin: 4,
            aux_index: 2,
        },
        PortDesc {
            connector_id: 3,
            port_type: PortType::Dp,
            port_index: 1,
            gmbus_pin: 5,
            aux_index: 1,
        },
        PortDesc {
            connector_id: 4,
            port_type: PortType::Dp,
            port_index: 3,
            gmbus_pin: 6,
            aux_index: 3,
        },
        PortDesc {
            connector_id: 5,
            port_type: PortType::Hdmi,
            port_index: 4,
            gmbus_pin: 2,
            aux_index: 4,
        },
        PortDesc {
            connector_id: 6,
            port_type: PortType::Hdmi,
            port_index: 5,
            gmbus_pin: 1,
            aux_index: 5,
        },
    ]
}

pub fn rig() -> TestRig {
    rig_with(APERTURE_DEFAULT, DEVICE_ID_HASWELL)
}

pub fn rig_with(aperture_size: usize, device_id: u16) -> TestRig {
    let hw = Arc::new(FakeHw::new());
    hw.set_edid(Some(edid_1080p()));
    let mem = Arc::new(FakeMemory::new());
    let entries = aperture_size / PAGE_SIZE;
    let table: &'static mut [u32] = alloc::boxed::Box::leak(vec![0u32; entries].into_boxed_slice());
    let config = DeviceConfig {
        vendor_id: VENDOR_INTEL,
        device_id,
        mmio: hw.clone(),
        os_mem: mem.clone(),
        gtt_table: VirtAddr::new(table.as_mut_ptr() as u64),
        aperture_size,
        ports: standard_ports(),
    };
    let device = Device::new(config).expect("device init");
    TestRig { device, hw, mem }
}

// Canned modes

pub fn mode_1080p() -> DisplayMode {
    DisplayMode {
        width: 1920,
        height: 1080,
        refresh_rate: 60,
        pixel_clock: 148_500,
        hsync_start: 2008,
        hsync_end: 2052,
        htotal: 2200,
        vsync_start: 1084,
        vsync_end: 1089,
        vtotal: 1125,
        flags: DisplayModeFlags::HSYNC_POSITIVE | DisplayModeFlags::VSYNC_POSITIVE,
    }
}

pub fn mode_1440p() -> DisplayMode {
    DisplayMode {
        width: 2560,
        height: 1440,
        refresh_rate: 60,
        pixel_clock: 241_500,
        hsync_start: 2608,
        hsync_end: 2640,
        htotal: 2720,
        vsync_start: 1443,
        vsync_end: 1448,
        vtotal: 1481,
        flags: DisplayModeFlags::HSYNC_POSITIVE | DisplayModeFlags::VSYNC_POSITIVE,
    }
}

pub fn mode_1280x1024() -> DisplayMode {
    DisplayMode {
        width: 1280,
        height: 1024,
        refresh_rate: 60,
        pixel_clock: 108_000,
        hsync_start: 1328,
        hsync_end: 1440,
        htotal: 1688,
        vsync_start: 1025,
        vsync_end: 1028,
        vtotal: 1066,
        flags: DisplayModeFlags::HSYNC_POSITIVE | DisplayModeFlags::VSYNC_POSITIVE,
    }
}

pub fn mode_800x600() -> DisplayMode {
    DisplayMode {
        width: 800,
        height: 600,
        refresh_rate: 60,
        pixel_clock: 40_000,
        hsync_start: 840,
        hsync_end: 968,
        htotal: 1056,
        vsync_start: 601,
        vsync_end: 605,
        vtotal: 628,
        flags: DisplayModeFlags::HSYNC_POSITIVE | DisplayModeFlags::VSYNC_POSITIVE,
    }
}

pub fn mode_8k() -> DisplayMode {
    DisplayMode {
        width: 7680,
        height: 4320,
        refresh_rate: 60,
        pixel_clock: 2_112_000,
        hsync_start: 7760,
        hsync_end: 7848,
        htotal: 8000,
        vsync_start: 4336,
        vsync_end: 4344,
        vtotal: 4400,
        flags: DisplayModeFlags::HSYNC_POSITIVE | DisplayModeFlags::VSYNC_POSITIVE,
    }
}

/// 128-byte EDID advertising a single 1920x1080@60 detailed timing.
pub fn edid_1080p() -> Vec<u8> {
    let mut edid = vec![0u8; 128];
    edid[0..8].copy_from_slice(&[0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x00]);
    edid[18] = 1; // version
    edid[19] = 4; // revision
    let descriptor = &mut edid[54..72];
    descriptor[0] = 0x02; // pixel clock 14850 (x10 kHz), little endian
    descriptor[1] = 0x3A;
    descriptor[2] = 0x80; // h active 1920 low
    descriptor[3] = 0x18; // h blank 280 low
    descriptor[4] = 0x71; // highs
    descriptor[5] = 0x38; // v active 1080 low
    descriptor[6] = 0x2D; // v blank 45 low
    descriptor[7] = 0x40; // highs
    descriptor[8] = 0x58; // h sync offset 88
    descriptor[9] = 0x2C; // h sync width 44
    descriptor[10] = 0x45; // v sync offset 4, width 5
    descriptor[11] = 0x00;
    descriptor[17] = 0x1E; // digital separate sync, +h +v
    edid[126] = 0; // no extension blocks
    edid
}

// Small builders

pub fn config_entry(
    pipe: PipeId,
    connector_id: u32,
    fb_handle: u32,
    mode: DisplayMode,
) -> PipeConfigRequest {
    PipeConfigRequest {
        pipe,
        active: true,
        mode,
        connector_id,
        fb_handle,
        pos_x: 0,
        pos_y: 0,
    }
}

pub fn create_fb(rig: &TestRig, width: u32, height: u32) -> u32 {
    rig.device
        .gem_create(BoCreateInfo {
            size: BoSize::Surface {
                width,
                height,
                bits_per_pixel: 32,
            },
            tiling: TilingMode::None,
            flags: crate::bo::BoFlags::CLEAR,
            cache: CacheType::WriteCombining,
        })
        .expect("framebuffer")
}

pub fn create_blob(rig: &TestRig, bytes: usize) -> u32 {
    rig.device
        .gem_create(BoCreateInfo::blob(bytes))
        .expect("blob")
}

/// Pretend the GPU published `seqno` on `engine`'s status page.
pub fn signal_seqno(rig: &TestRig, engine: EngineId, seqno: u32) {
    let hwsp = rig.device.engine(engine).hwsp_bo().cpu_map().unwrap();
    unsafe {
        ((hwsp.as_u64() + (HWSP_SEQNO_INDEX * 4) as u64) as *mut u32).write_volatile(seqno);
    }
}
