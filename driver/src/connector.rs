// Connectors: port state, EDID over GMBUS, DPCD over AUX, hot-plug
//
// The VBT hands us the port topology as plain descriptors; everything else
// is probed. EDID blocks arrive over the GMBUS I2C engine, DP capabilities
// and link training over the AUX channel. Hot-plug interrupts land in a
// generation counter + per-port change mask that the wait syscall drains.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use spin::Mutex;

use crate::clocks::PortCaps;
use crate::errors::{GfxError, Result};
use crate::mmio::{Deadline, RegisterIo};
use crate::regs;
use crate::{DisplayMode, DisplayModeFlags, PipeId, PortType};

pub const EDID_BLOCK_BYTES: usize = 128;
const EDID_SLAVE: u32 = 0xA0;
const GMBUS_TIMEOUT_MS: u64 = 50;
const AUX_TIMEOUT_MS: u64 = 10;

// DPCD addresses
pub const DPCD_REV: u32 = 0x000;
pub const DPCD_MAX_LINK_RATE: u32 = 0x001;
pub const DPCD_MAX_LANE_COUNT: u32 = 0x002;
pub const DPCD_LINK_BW_SET: u32 = 0x100;
pub const DPCD_LANE_COUNT_SET: u32 = 0x101;
pub const DPCD_TRAINING_PATTERN_SET: u32 = 0x102;
pub const DPCD_LANE0_1_STATUS: u32 = 0x202;
pub const DPCD_LANE2_3_STATUS: u32 = 0x203;

pub const DPCD_CACHE_BYTES: usize = 16;

/// Per-lane status nibble bits.
const LANE_CR_DONE: u8 = 1 << 0;
const LANE_CHANNEL_EQ_DONE: u8 = 1 << 1;
const LANE_SYMBOL_LOCKED: u8 = 1 << 2;

/// Static port description from the video BIOS tables.
#[derive(Debug, Clone, Copy)]
pub struct PortDesc {
    pub connector_id: u32,
    pub port_type: PortType,
    /// Index into the digital port register bank.
    pub port_index: usize,
    /// GMBUS pin pair carrying this connector's DDC lines.
    pub gmbus_pin: u8,
    pub aux_index: usize,
}

#[derive(Debug)]
pub struct PortState {
    pub connected: bool,
    pub edid: Option<Vec<u8>>,
    pub modes: Vec<DisplayMode>,
    pub preferred_mode: Option<DisplayMode>,
    pub current_pipe: Option<PipeId>,
    pub dpcd: [u8; DPCD_CACHE_BYTES],
}

pub struct Port {
    pub desc: PortDesc,
    pub state: Mutex<PortState>,
}

impl Port {
    pub fn new(desc: PortDesc) -> Self {
        Self {
            desc,
            state: Mutex::new(PortState {
                connected: false,
                edid: None,
                modes: Vec::new(),
                preferred_mode: None,
                current_pipe: None,
                dpcd: [0; DPCD_CACHE_BYTES],
            }),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub fn caps(&self) -> PortCaps {
        let state = self.state.lock();
        if !self.desc.port_type.is_dp_like() {
            return PortCaps::none();
        }
        PortCaps {
            max_link_rate_khz: state.dpcd[DPCD_MAX_LINK_RATE as usize] as u32 * 27_000,
            max_lane_count: state.dpcd[DPCD_MAX_LANE_COUNT as usize] & 0x1F,
        }
    }

    /// Re-probe the sink: DPCD receiver caps for DP ports, then EDID over
    /// GMBUS. Connection state follows whichever read the port type needs.
    pub fn probe(&self, io: &dyn RegisterIo) {
        let mut dpcd = [0u8; DPCD_CACHE_BYTES];
        let mut dp_present = false;
        if self.desc.port_type.is_dp_like() {
            let aux = AuxChannel::new(io, self.desc.aux_index);
            dp_present = aux.dpcd_read(DPCD_REV, &mut dpcd).is_ok() && dpcd[0] != 0;
        }

        let gmbus = Gmbus::new(io);
        let edid = gmbus.read_edid(self.desc.gmbus_pin);

        let mut state = self.state.lock();
        match edid {
            Ok(raw) => {
                let (modes, preferred) = parse_edid(&raw);
                state.connected = if self.desc.port_type.is_dp_like() {
                    dp_present
                } else {
                    true
                };
                state.modes = modes;
                state.preferred_mode = preferred;
                state.edid = Some(raw);
            }
            Err(_) => {
                state.connected = false;
                state.edid = None;
                state.modes.clear();
                state.preferred_mode = None;
            }
        }
        state.dpcd = dpcd;
    }
}

// GMBUS engine

pub struct Gmbus<'a> {
    io: &'a dyn RegisterIo,
}

impl<'a> Gmbus<'a> {
    pub fn new(io: &'a dyn RegisterIo) -> Self {
        Self { io }
    }

    fn wait_hw_ready(&self) -> Result<()> {
        let deadline = Deadline::after_ms(GMBUS_TIMEOUT_MS);
        loop {
            let status = self.io.read32(regs::GMBUS2);
            if status & regs::GMBUS2_SATOER != 0 {
                return Err(GfxError::IoError);
            }
            if status & regs::GMBUS2_HW_RDY != 0 {
                return Ok(());
            }
            if deadline.expired() {
                return Err(GfxError::TimedOut);
            }
            core::hint::spin_loop();
        }
    }

    /// Read one 128-byte EDID block: select the pin pair, set the segment
    /// pointer for extension blocks, then clock the block out of slave 0xA0
    /// four bytes per HW_READY.
    pub fn read_block(&self, pin: u8, segment: u8, block: u8) -> Result<[u8; EDID_BLOCK_BYTES]> {
        self.io.write32(regs::GMBUS0, pin as u32);
        if segment != 0 {
            self.io
                .write32(regs::GMBUS5, regs::GMBUS5_SEGMENT_ENABLE | segment as u32);
        } else {
            self.io.write32(regs::GMBUS5, 0);
        }
        let offset = (block as u32 % 2) * EDID_BLOCK_BYTES as u32;
        self.io.write32(
            regs::GMBUS1,
            regs::GMBUS1_SW_GO
                | regs::GMBUS1_CYCLE_WAIT
                | regs::GMBUS1_CYCLE_INDEX
                | regs::GMBUS1_CYCLE_STOP
                | (offset << 8)
                | ((EDID_BLOCK_BYTES as u32) << regs::GMBUS1_BYTE_COUNT_SHIFT)
                | EDID_SLAVE
                | regs::GMBUS1_SLAVE_READ,
        );

        let mut out = [0u8; EDID_BLOCK_BYTES];
        for chunk in out.chunks_mut(4) {
            self.wait_hw_ready()?;
            let word = self.io.read32(regs::GMBUS3);
            for (i, byte) in chunk.iter_mut().enumerate() {
                *byte = (word >> (i * 8)) as u8;
            }
        }
        Ok(out)
    }

    /// Base block plus at most one extension.
    pub fn read_edid(&self, pin: u8) -> Result<Vec<u8>> {
        let base = self.read_block(pin, 0, 0)?;
        if !valid_edid_header(&base) {
            return Err(GfxError::IoError);
        }
        let mut edid = Vec::with_capacity(2 * EDID_BLOCK_BYTES);
        edid.extend_from_slice(&base);
        if base[126] > 0 {
            if let Ok(extension) = self.read_block(pin, 0, 1) {
                edid.extend_from_slice(&extension);
            }
        }
        Ok(edid)
    }
}

fn valid_edid_header(block: &[u8]) -> bool {
    block.len() >= 8 && block[0..8] == [0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x00]
}

// AUX channel (DP / eDP)

pub struct AuxChannel<'a> {
    io: &'a dyn RegisterIo,
    port_index: usize,
}

const AUX_REQ_READ: u32 = 1 << 31;
const AUX_MAX_CHUNK: usize = 16;

impl<'a> AuxChannel<'a> {
    pub fn new(io: &'a dyn RegisterIo, port_index: usize) -> Self {
        Self { io, port_index }
    }

    fn transact(&self, request: u32, payload: &[u8]) -> Result<()> {
        self.io.write32(regs::aux_data(self.port_index, 0), request);
        for (i, chunk) in payload.chunks(4).enumerate() {
            let mut word = 0u32;
            for (b, byte) in chunk.iter().enumerate() {
                word |= (*byte as u32) << (b * 8);
            }
            self.io.write32(regs::aux_data(self.port_index, 1 + i), word);
        }
        let size = (4 + payload.len()) as u32;
        self.io.write32(
            regs::aux_ctl(self.port_index),
            regs::AUX_CTL_SEND_BUSY | (size << regs::AUX_CTL_MSG_SIZE_SHIFT),
        );

        let ctl_reg = regs::aux_ctl(self.port_index);
        let deadline = Deadline::after_ms(AUX_TIMEOUT_MS);
        loop {
            let ctl = self.io.read32(ctl_reg);
            if ctl & regs::AUX_CTL_SEND_BUSY == 0 || ctl & regs::AUX_CTL_DONE != 0 {
                if ctl & regs::AUX_CTL_TIMEOUT_ERROR != 0 {
                    return Err(GfxError::TimedOut);
                }
                if ctl & regs::AUX_CTL_RECEIVE_ERROR != 0 {
                    return Err(GfxError::IoError);
                }
                return Ok(());
            }
            if deadline.expired() {
                return Err(GfxError::TimedOut);
            }
            core::hint::spin_loop();
        }
    }

    pub fn dpcd_read(&self, address: u32, buf: &mut [u8]) -> Result<()> {
        for (chunk_index, chunk) in buf.chunks_mut(AUX_MAX_CHUNK).enumerate() {
            let chunk_address = address + (chunk_index * AUX_MAX_CHUNK) as u32;
            let request = AUX_REQ_READ
                | (chunk_address & 0xF_FFFF)
                | (((chunk.len() - 1) as u32) << 24);
            self.transact(request, &[])?;
            for (i, byte) in chunk.iter_mut().enumerate() {
                let word = self.io.read32(regs::aux_data(self.port_index, 1 + i / 4));
                *byte = (word >> ((i % 4) * 8)) as u8;
            }
        }
        Ok(())
    }

    pub fn dpcd_write(&self, address: u32, data: &[u8]) -> Result<()> {
        for (chunk_index, chunk) in data.chunks(AUX_MAX_CHUNK).enumerate() {
            let chunk_address = address + (chunk_index * AUX_MAX_CHUNK) as u32;
            let request = (chunk_address & 0xF_FFFF) | (((chunk.len() - 1) as u32) << 24);
            self.transact(request, chunk)?;
        }
        Ok(())
    }
}

/// Bring up a DP link at the chosen lane count and rate: clock recovery on
/// pattern 1, channel equalization on pattern 2, then disable the pattern.
pub fn train_link(
    io: &dyn RegisterIo,
    port_index: usize,
    lane_count: u8,
    link_rate_khz: u32,
) -> Result<()> {
    let aux = AuxChannel::new(io, port_index);
    let bw_code = (link_rate_khz / 27_000) as u8;
    aux.dpcd_write(DPCD_LINK_BW_SET, &[bw_code])?;
    aux.dpcd_write(DPCD_LANE_COUNT_SET, &[lane_count | 0x80])?;

    aux.dpcd_write(DPCD_TRAINING_PATTERN_SET, &[0x01])?;
    check_lane_status(&aux, lane_count, LANE_CR_DONE)?;

    aux.dpcd_write(DPCD_TRAINING_PATTERN_SET, &[0x02])?;
    check_lane_status(
        &aux,
        lane_count,
        LANE_CR_DONE | LANE_CHANNEL_EQ_DONE | LANE_SYMBOL_LOCKED,
    )?;

    aux.dpcd_write(DPCD_TRAINING_PATTERN_SET, &[0x00])?;
    Ok(())
}

fn check_lane_status(aux: &AuxChannel<'_>, lane_count: u8, wanted: u8) -> Result<()> {
    let mut status = [0u8; 2];
    aux.dpcd_read(DPCD_LANE0_1_STATUS, &mut status)?;
    for lane in 0..lane_count as usize {
        let nibble = (status[lane / 2] >> ((lane % 2) * 4)) & 0x0F;
        if nibble & wanted != wanted {
            return Err(GfxError::IoError);
        }
    }
    Ok(())
}

// EDID parsing: detailed timing descriptors only; the first one doubles as
// the preferred mode.

pub fn parse_edid(data: &[u8]) -> (Vec<DisplayMode>, Option<DisplayMode>) {
    let mut modes = Vec::new();
    if data.len() < EDID_BLOCK_BYTES || !valid_edid_header(data) {
        return (modes, None);
    }
    for i in 0..4 {
        let offset = 54 + i * 18;
        let descriptor = &data[offset..offset + 18];
        if descriptor[0] == 0 && descriptor[1] == 0 {
            continue; // monitor descriptor, not a timing
        }
        if let Some(mode) = parse_detailed_timing(descriptor) {
            modes.push(mode);
        }
    }
    let preferred = modes.first().copied();
    (modes, preferred)
}

fn parse_detailed_timing(data: &[u8]) -> Option<DisplayMode> {
    let pixel_clock = ((data[1] as u32) << 8) | data[0] as u32;
    if pixel_clock == 0 {
        return None;
    }

    let h_active = ((data[4] as u32 & 0xF0) << 4) | data[2] as u32;
    let h_blank = ((data[4] as u32 & 0x0F) << 8) | data[3] as u32;
    let v_active = ((data[7] as u32 & 0xF0) << 4) | data[5] as u32;
    let v_blank = ((data[7] as u32 & 0x0F) << 8) | data[6] as u32;

    let h_sync_offset = ((data[11] as u32 & 0xC0) << 2) | data[8] as u32;
    let h_sync_width = ((data[11] as u32 & 0x30) << 4) | data[9] as u32;
    let v_sync_offset = ((data[11] as u32 & 0x0C) << 2) | ((data[10] as u32 & 0xF0) >> 4);
    let v_sync_width = ((data[11] as u32 & 0x03) << 4) | (data[10] as u32 & 0x0F);

    let htotal = h_active + h_blank;
    let vtotal = v_active + v_blank;
    if htotal == 0 || vtotal == 0 {
        return None;
    }

    let mut flags = DisplayModeFlags::empty();
    if data[17] & 0x80 != 0 {
        flags |= DisplayModeFlags::INTERLACED;
    }
    if data[17] & 0x04 != 0 {
        flags |= DisplayModeFlags::HSYNC_POSITIVE;
    }
    if data[17] & 0x02 != 0 {
        flags |= DisplayModeFlags::VSYNC_POSITIVE;
    }

    let pixel_clock_khz = pixel_clock * 10;
    Some(DisplayMode {
        width: h_active,
        height: v_active,
        refresh_rate: pixel_clock_khz * 1000 / (htotal * vtotal),
        pixel_clock: pixel_clock_khz,
        hsync_start: h_active + h_sync_offset,
        hsync_end: h_active + h_sync_offset + h_sync_width,
        htotal,
        vsync_start: v_active + v_sync_offset,
        vsync_end: v_active + v_sync_offset + v_sync_width,
        vtotal,
        flags,
    })
}

// Hot-plug delivery

pub struct Hotplug {
    generation: AtomicU64,
    pending_mask: Mutex<u32>,
}

impl Hotplug {
    pub fn new() -> Self {
        Self {
            generation: AtomicU64::new(0),
            pending_mask: Mutex::new(0),
        }
    }

    /// ISR half: record the changed connector and wake waiters.
    pub fn post(&self, connector_id: u32) {
        *self.pending_mask.lock() |= 1u32 << (connector_id & 31);
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Wait for the change counter to move, then drain the mask. A zero
    /// timeout samples without waiting; interruption leaves the mask alone.
    pub fn wait_for_change(
        &self,
        timeout_us: u64,
        interrupt: Option<&AtomicBool>,
    ) -> Result<u32> {
        let sampled = self.generation.load(Ordering::Acquire);
        if timeout_us > 0 {
            let deadline = Deadline::after_us(timeout_us);
            while self.generation.load(Ordering::Acquire) == sampled {
                // An event that landed before we sampled is still pending.
                if *self.pending_mask.lock() != 0 {
                    break;
                }
                if let Some(flag) = interrupt {
                    if flag.load(Ordering::Acquire) {
                        return Err(GfxError::Interrupted);
                    }
                }
                if deadline.expired() {
                    break;
                }
                core::hint::spin_loop();
            }
        }
        let mut mask = self.pending_mask.lock();
        Ok(core::mem::take(&mut *mask))
    }
}

impl Default for Hotplug {
    fn default() -> Self {
        Self::new()
    }
}
