// IOCTL contract
//
// The demux and user-pointer copy-in/out live outside this crate; what
// arrives here are the fixed argument structs, already copied, with any
// embedded pointers resolved into slices. Every raw field is re-validated
// before it touches a typed driver call: a bad enum is BadValue, a bad
// handle is BadIndex, and a rejected argument performs no side effect.

use alloc::vec::Vec;

use crate::bo::{BoCreateInfo, BoFlags, BoSize};
use crate::device::{Device, SharedInfo};
use crate::display::{ConnectorInfo, DisplayConfigFlags, PipeConfigRequest, PipeConfigState};
use crate::errors::{GfxError, Result};
use crate::ppgtt::PpgttKind;
use crate::{CacheType, DisplayMode, DisplayModeFlags, DpmsMode, EngineId, PipeId, TilingMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum IoctlOp {
    GetSharedInfo = 0x6700,
    SetDisplayConfig,
    GetDisplayConfig,
    WaitForDisplayChange,
    GetConnectorInfo,
    SetDpmsMode,
    GetDpmsMode,
    MoveDisplayOffset,
    SetIndexedColors,
    SetCursorState,
    SetCursorBitmap,
    GemCreate,
    GemClose,
    GemMmapArea,
    GemExecbuffer,
    GemWait,
    GemFlushAndGetSeqno,
    GemContextCreate,
    GemContextDestroy,
}

// Raw wire structs

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawMode {
    pub width: u32,
    pub height: u32,
    pub refresh_rate: u32,
    pub pixel_clock: u32,
    pub hsync_start: u32,
    pub hsync_end: u32,
    pub htotal: u32,
    pub vsync_start: u32,
    pub vsync_end: u32,
    pub vtotal: u32,
    pub flags: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawPipeConfig {
    pub pipe: u32,
    pub active: u32,
    pub mode: RawMode,
    pub connector_id: u32,
    pub fb_handle: u32,
    pub pos_x: u32,
    pub pos_y: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawGemCreate {
    /// Non-zero for blob allocations; zero means dimensioned.
    pub size: u64,
    pub width: u32,
    pub height: u32,
    pub bits_per_pixel: u32,
    pub tiling: u32,
    pub flags: u32,
    pub cache: u32,
}

pub const GEM_CREATE_PINNED: u32 = 1 << 0;
pub const GEM_CREATE_CLEAR: u32 = 1 << 1;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawRelocation {
    pub target_handle: u32,
    pub offset: u32,
    pub delta: u32,
    pub read_domains: u32,
    pub write_domain: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawExecbuffer {
    pub cmd_handle: u32,
    pub length: u32,
    pub engine: u32,
    pub flags: u32,
    pub reloc_count: u32,
    pub context_handle: u32,
}

// Field decoding

fn decode_pipe(raw: u32) -> Result<PipeId> {
    PipeId::from_index(raw as usize).ok_or(GfxError::BadValue)
}

fn decode_engine(raw: u32) -> Result<EngineId> {
    EngineId::from_index(raw as usize).ok_or(GfxError::BadValue)
}

fn decode_tiling(raw: u32) -> Result<TilingMode> {
    match raw {
        0 => Ok(TilingMode::None),
        1 => Ok(TilingMode::X),
        2 => Ok(TilingMode::Y),
        _ => Err(GfxError::BadValue),
    }
}

fn decode_cache(raw: u32) -> Result<CacheType> {
    match raw {
        0 => Ok(CacheType::Default),
        1 => Ok(CacheType::Uncached),
        2 => Ok(CacheType::WriteCombining),
        3 => Ok(CacheType::WriteBack),
        _ => Err(GfxError::BadValue),
    }
}

fn decode_dpms(raw: u32) -> Result<DpmsMode> {
    match raw {
        0 => Ok(DpmsMode::On),
        1 => Ok(DpmsMode::Standby),
        2 => Ok(DpmsMode::Suspend),
        3 => Ok(DpmsMode::Off),
        _ => Err(GfxError::BadValue),
    }
}

fn decode_mode(raw: &RawMode) -> Result<DisplayMode> {
    let flags = DisplayModeFlags::from_bits(raw.flags).ok_or(GfxError::BadValue)?;
    if raw.htotal < raw.width || raw.vtotal < raw.height {
        return Err(GfxError::BadValue);
    }
    Ok(DisplayMode {
        width: raw.width,
        height: raw.height,
        refresh_rate: raw.refresh_rate,
        pixel_clock: raw.pixel_clock,
        hsync_start: raw.hsync_start,
        hsync_end: raw.hsync_end,
        htotal: raw.htotal,
        vsync_start: raw.vsync_start,
        vsync_end: raw.vsync_end,
        vtotal: raw.vtotal,
        flags,
    })
}

// Entry points, one per opcode

pub fn get_shared_info(device: &Device) -> SharedInfo {
    device.shared_info()
}

pub fn set_display_config(
    device: &Device,
    entries: &[RawPipeConfig],
    primary_pipe: u32,
    flags: u32,
) -> Result<()> {
    let flags = DisplayConfigFlags::from_bits(flags).ok_or(GfxError::BadValue)?;
    let primary = decode_pipe(primary_pipe)?;
    let mut requests = Vec::with_capacity(entries.len());
    for entry in entries {
        requests.push(PipeConfigRequest {
            pipe: decode_pipe(entry.pipe)?,
            active: entry.active != 0,
            mode: decode_mode(&entry.mode)?,
            connector_id: entry.connector_id,
            fb_handle: entry.fb_handle,
            pos_x: entry.pos_x,
            pos_y: entry.pos_y,
        });
    }
    device.set_display_config(&requests, primary, flags)
}

pub fn get_display_config(device: &Device, max_pipes: u32) -> Vec<PipeConfigState> {
    device.get_display_config(max_pipes as usize)
}

pub fn wait_for_display_change(device: &Device, timeout_us: u64) -> Result<u32> {
    device.wait_for_display_change(timeout_us)
}

pub fn get_connector_info(device: &Device, connector_id: u32) -> Result<ConnectorInfo> {
    device.get_connector_info(connector_id)
}

pub fn set_dpms_mode(device: &Device, pipe: u32, mode: u32) -> Result<()> {
    device.set_dpms_mode(decode_pipe(pipe)?, decode_dpms(mode)?)
}

pub fn get_dpms_mode(device: &Device, pipe: u32) -> Result<u32> {
    let mode = device.get_dpms_mode(decode_pipe(pipe)?)?;
    Ok(match mode {
        DpmsMode::On => 0,
        DpmsMode::Standby => 1,
        DpmsMode::Suspend => 2,
        DpmsMode::Off => 3,
    })
}

pub fn move_display_offset(device: &Device, pipe: u32, x: u32, y: u32) -> Result<()> {
    device.move_display_offset(decode_pipe(pipe)?, x, y)
}

pub fn set_indexed_colors(
    device: &Device,
    pipe: u32,
    first: u32,
    colors: &[u8],
) -> Result<()> {
    device.set_indexed_colors(decode_pipe(pipe)?, first as usize, colors)
}

pub fn set_cursor_state(device: &Device, pipe: u32, visible: bool, x: i32, y: i32) -> Result<()> {
    device.set_cursor_state(decode_pipe(pipe)?, visible, x, y)
}

pub fn set_cursor_bitmap(
    device: &Device,
    pipe: u32,
    width: u32,
    height: u32,
    hot_x: u32,
    hot_y: u32,
    argb: &[u8],
) -> Result<()> {
    device.set_cursor_bitmap(decode_pipe(pipe)?, width, height, hot_x, hot_y, argb)
}

pub fn gem_create(device: &Device, args: &RawGemCreate) -> Result<u32> {
    let size = if args.size != 0 {
        if args.size > usize::MAX as u64 {
            return Err(GfxError::BadValue);
        }
        BoSize::Bytes(args.size as usize)
    } else {
        BoSize::Surface {
            width: args.width,
            height: args.height,
            bits_per_pixel: args.bits_per_pixel,
        }
    };
    let mut flags = BoFlags::empty();
    if args.flags & GEM_CREATE_PINNED != 0 {
        flags |= BoFlags::PINNED;
    }
    if args.flags & GEM_CREATE_CLEAR != 0 {
        flags |= BoFlags::CLEAR;
    }
    if args.flags & !(GEM_CREATE_PINNED | GEM_CREATE_CLEAR) != 0 {
        return Err(GfxError::BadValue);
    }
    device.gem_create(BoCreateInfo {
        size,
        tiling: decode_tiling(args.tiling)?,
        flags,
        cache: decode_cache(args.cache)?,
    })
}

pub fn gem_close(device: &Device, handle: u32) -> Result<()> {
    device.gem_close(handle)
}

pub fn gem_mmap_area(device: &Device, handle: u32) -> Result<u64> {
    Ok(device.gem_mmap(handle)?.as_u64())
}

pub fn gem_execbuffer(
    device: &Device,
    args: &RawExecbuffer,
    relocs: &[RawRelocation],
) -> Result<u32> {
    if relocs.len() != args.reloc_count as usize {
        return Err(GfxError::BadValue);
    }
    let engine = decode_engine(args.engine)?;
    let resolved: Vec<(u32, u32, u32, bool)> = relocs
        .iter()
        .map(|r| (r.target_handle, r.offset, r.delta, r.write_domain != 0))
        .collect();
    let context = if args.context_handle != 0 {
        Some(args.context_handle)
    } else {
        None
    };
    device.gem_execbuffer(
        args.cmd_handle,
        args.length as usize,
        engine,
        &resolved,
        context,
    )
}

pub fn gem_wait(device: &Device, engine: u32, seqno: u32, timeout_us: u64) -> Result<()> {
    device.gem_wait(decode_engine(engine)?, seqno, timeout_us)
}

pub fn gem_flush_and_get_seqno(device: &Device, engine: u32) -> Result<u32> {
    device.gem_flush_and_get_seqno(decode_engine(engine)?)
}

pub const CONTEXT_CREATE_PPGTT: u32 = 1 << 0;

pub fn gem_context_create(device: &Device, flags: u32) -> Result<u32> {
    if flags & !CONTEXT_CREATE_PPGTT != 0 {
        return Err(GfxError::BadValue);
    }
    let kind = if flags & CONTEXT_CREATE_PPGTT != 0 {
        Some(PpgttKind::Full)
    } else {
        None
    };
    device.context_create(kind)
}

pub fn gem_context_destroy(device: &Device, handle: u32) -> Result<()> {
    device.context_destroy(handle)
}
