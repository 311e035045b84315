// MMIO register map (BAR0)
//
// Offsets for the Gen7-class register file. Per-instance banks (pipes,
// transcoders, ports, fence slots) are exposed as functions over the
// instance index; the stride between instances is uniform on this hardware.

// Ring engine register banks
pub const RING_BASE_RCS: u32 = 0x02000;
pub const RING_BASE_VCS: u32 = 0x12000;
pub const RING_BASE_VECS: u32 = 0x1A000;
pub const RING_BASE_BCS: u32 = 0x22000;

// Offsets within a ring bank
pub const RING_TAIL: u32 = 0x30;
pub const RING_HEAD: u32 = 0x34;
pub const RING_START: u32 = 0x38;
pub const RING_CTL: u32 = 0x3C;
pub const RING_HWS_PGA: u32 = 0x80;

pub const RING_CTL_ENABLE: u32 = 1 << 0;
pub const RING_HEAD_ADDR_MASK: u32 = 0x001F_FFFC;
pub const RING_TAIL_ADDR_MASK: u32 = 0x001F_FFF8;
/// RING_CTL encodes the buffer length in pages, minus one, at [20:12].
pub const RING_CTL_SIZE_SHIFT: u32 = 12;

pub fn ring_base(engine: crate::EngineId) -> u32 {
    match engine {
        crate::EngineId::Rcs => RING_BASE_RCS,
        crate::EngineId::Bcs => RING_BASE_BCS,
        crate::EngineId::Vcs => RING_BASE_VCS,
        crate::EngineId::Vecs => RING_BASE_VECS,
    }
}

// Global GTT control; rewriting the cached value flushes the GPU TLB
pub const PGTBL_CTL: u32 = 0x02020;
pub const PGTBL_CTL_ENABLE: u32 = 1 << 0;

// PPGTT TLB invalidation
pub const PPGTT_TLB_INV: u32 = 0x02220;
pub const PPGTT_TLB_INV_ALL: u32 = 1 << 0;

// Force-wake request/ack pairs, multithreaded (masked-bit) protocol
pub const FORCEWAKE_REQ_RENDER: u32 = 0x0A188;
pub const FORCEWAKE_REQ_MEDIA: u32 = 0x0A218;
pub const FORCEWAKE_REQ_DISPLAY: u32 = 0x0A288;
pub const FORCEWAKE_ACK_RENDER: u32 = 0x130044;
pub const FORCEWAKE_ACK_MEDIA: u32 = 0x130048;
pub const FORCEWAKE_ACK_DISPLAY: u32 = 0x13004C;
pub const FORCEWAKE_KERNEL_BIT: u32 = 1 << 0;

/// Masked-bit write: the upper half selects which low bits the write touches.
pub fn masked_bit_enable(bit: u32) -> u32 {
    (bit << 16) | bit
}

pub fn masked_bit_disable(bit: u32) -> u32 {
    bit << 16
}

// Fence registers (64-bit, pre-Gen9 tiling detile)
pub const FENCE_REG_BASE: u32 = 0x100000;
pub const FENCE_REG_STRIDE: u32 = 0x8;

pub fn fence_reg_lo(slot: usize) -> u32 {
    FENCE_REG_BASE + slot as u32 * FENCE_REG_STRIDE
}

pub fn fence_reg_hi(slot: usize) -> u32 {
    fence_reg_lo(slot) + 4
}

// Fence low-dword fields (IVB/HSW packing)
pub const FENCE_VALID: u32 = 1 << 0;
pub const FENCE_TILING_Y: u32 = 1 << 2;
pub const FENCE_Y_HEIGHT_SHIFT: u32 = 3; // [11:3] y-tile height - 1
pub const FENCE_PITCH_SHIFT: u32 = 16; // [27:16] tile pitch - 1
pub const FENCE_Y_WIDTH_SHIFT: u32 = 28; // [31:28] y-tile width - 1

// Transcoder timing banks: A/B/C at 0x1000 stride, EDP in its own bank
const TRANS_BASE: [u32; 4] = [0x60000, 0x61000, 0x62000, 0x6F000];

pub fn trans_htotal(trans: crate::TranscoderId) -> u32 {
    TRANS_BASE[trans.index()]
}

pub fn trans_hblank(trans: crate::TranscoderId) -> u32 {
    TRANS_BASE[trans.index()] + 0x04
}

pub fn trans_hsync(trans: crate::TranscoderId) -> u32 {
    TRANS_BASE[trans.index()] + 0x08
}

pub fn trans_vtotal(trans: crate::TranscoderId) -> u32 {
    TRANS_BASE[trans.index()] + 0x0C
}

pub fn trans_vblank(trans: crate::TranscoderId) -> u32 {
    TRANS_BASE[trans.index()] + 0x10
}

pub fn trans_vsync(trans: crate::TranscoderId) -> u32 {
    TRANS_BASE[trans.index()] + 0x14
}

/// Transcoder function control: enable, pipe select, BPC, interlace.
pub fn trans_conf(trans: crate::TranscoderId) -> u32 {
    TRANS_BASE[trans.index()] + 0x400
}

pub const TRANS_CONF_ENABLE: u32 = 1 << 31;
pub const TRANS_CONF_PIPE_SEL_SHIFT: u32 = 12; // [14:12]
pub const TRANS_CONF_INTERLACED: u32 = 1 << 21;
pub const TRANS_CONF_BPC_SHIFT: u32 = 5; // [7:5]: 0=8bpc 1=10bpc 2=6bpc 3=12bpc

pub fn trans_conf_bpc_field(bpc: u32) -> u32 {
    let sel = match bpc {
        6 => 2,
        8 => 0,
        10 => 1,
        12 => 3,
        _ => 0,
    };
    sel << TRANS_CONF_BPC_SHIFT
}

// Pipe registers, 0x1000 stride from pipe A
const PIPE_STRIDE: u32 = 0x1000;

pub fn pipe_src(pipe: crate::PipeId) -> u32 {
    0x6001C + pipe.index() as u32 * PIPE_STRIDE
}

pub fn pipe_conf(pipe: crate::PipeId) -> u32 {
    0x70008 + pipe.index() as u32 * PIPE_STRIDE
}

pub fn pipe_frame_counter(pipe: crate::PipeId) -> u32 {
    0x70040 + pipe.index() as u32 * PIPE_STRIDE
}

pub const PIPE_CONF_ENABLE: u32 = 1 << 31;
/// Read-only; set by hardware once the pipe is actually running.
pub const PIPE_CONF_ACTIVE: u32 = 1 << 30;

// Primary plane registers
pub fn plane_ctl(pipe: crate::PipeId) -> u32 {
    0x70180 + pipe.index() as u32 * PIPE_STRIDE
}

pub fn plane_linear_offset(pipe: crate::PipeId) -> u32 {
    0x70184 + pipe.index() as u32 * PIPE_STRIDE
}

pub fn plane_stride(pipe: crate::PipeId) -> u32 {
    0x70188 + pipe.index() as u32 * PIPE_STRIDE
}

pub fn plane_size(pipe: crate::PipeId) -> u32 {
    0x70190 + pipe.index() as u32 * PIPE_STRIDE
}

pub fn plane_surface(pipe: crate::PipeId) -> u32 {
    0x7019C + pipe.index() as u32 * PIPE_STRIDE
}

pub fn plane_tile_offset(pipe: crate::PipeId) -> u32 {
    0x701A4 + pipe.index() as u32 * PIPE_STRIDE
}

pub const PLANE_CTL_ENABLE: u32 = 1 << 31;
pub const PLANE_CTL_GAMMA_ENABLE: u32 = 1 << 30;
pub const PLANE_CTL_TILED_X: u32 = 1 << 10;
pub const PLANE_CTL_FORMAT_SHIFT: u32 = 26; // [29:26]
pub const PLANE_FORMAT_8BPP_INDEXED: u32 = 0x2;
pub const PLANE_FORMAT_BGRX565: u32 = 0x5;
pub const PLANE_FORMAT_BGRX8888: u32 = 0x6;

// Hardware cursor
pub fn cursor_ctl(pipe: crate::PipeId) -> u32 {
    0x70080 + pipe.index() as u32 * PIPE_STRIDE
}

pub fn cursor_base(pipe: crate::PipeId) -> u32 {
    0x70084 + pipe.index() as u32 * PIPE_STRIDE
}

pub fn cursor_position(pipe: crate::PipeId) -> u32 {
    0x70088 + pipe.index() as u32 * PIPE_STRIDE
}

pub const CURSOR_MODE_DISABLE: u32 = 0x00;
pub const CURSOR_MODE_64_ARGB: u32 = 0x27;
pub const CURSOR_POS_SIGN_X: u32 = 1 << 15;
pub const CURSOR_POS_SIGN_Y: u32 = 1 << 31;

// Legacy 256-entry gamma/palette, one bank per pipe
pub fn palette_entry(pipe: crate::PipeId, index: usize) -> u32 {
    0x4A000 + pipe.index() as u32 * PIPE_STRIDE + index as u32 * 4
}

pub const PALETTE_ENTRIES: usize = 256;

// DPLL banks
//
// Gen7 routes through the two shared PCH PLLs; Gen7.5 uses the WRPLLs with
// LCPLL-derived DP link clocks. Both are addressed here by pool index.
pub fn pch_dpll_ctl(index: usize) -> u32 {
    0xC6014 + index as u32 * 4
}

pub fn pch_dpll_fp0(index: usize) -> u32 {
    0xC6040 + index as u32 * 8
}

pub fn pch_dpll_fp1(index: usize) -> u32 {
    0xC6044 + index as u32 * 8
}

pub fn wrpll_ctl(index: usize) -> u32 {
    0x46040 + index as u32 * 0x20
}

pub const DPLL_ENABLE: u32 = 1 << 31;
/// Read-only lock indication.
pub const DPLL_LOCK: u32 = 1 << 15;

// Core display clock selection
pub const CDCLK_CTL: u32 = 0x46000;
pub const CDCLK_FREQ_SEL_SHIFT: u32 = 26; // [27:26]

// Digital port control, one bank per physical port
pub fn port_buf_ctl(port_index: usize) -> u32 {
    0x64000 + port_index as u32 * 0x100
}

pub const PORT_BUF_CTL_ENABLE: u32 = 1 << 31;
pub const PORT_BUF_CTL_PORT_WIDTH_SHIFT: u32 = 1; // [3:1]: lane count - 1

// DisplayPort AUX channel, per port
pub fn aux_ctl(port_index: usize) -> u32 {
    0x64010 + port_index as u32 * 0x100
}

pub fn aux_data(port_index: usize, dword: usize) -> u32 {
    0x64014 + port_index as u32 * 0x100 + dword as u32 * 4
}

pub const AUX_CTL_SEND_BUSY: u32 = 1 << 31;
pub const AUX_CTL_DONE: u32 = 1 << 30;
pub const AUX_CTL_TIMEOUT_ERROR: u32 = 1 << 28;
pub const AUX_CTL_RECEIVE_ERROR: u32 = 1 << 25;
pub const AUX_CTL_MSG_SIZE_SHIFT: u32 = 20; // [24:20]
pub const AUX_CTL_MSG_SIZE_MASK: u32 = 0x1F << 20;

// GMBUS (I2C for EDID)
pub const GMBUS0: u32 = 0x5100; // pin pair select
pub const GMBUS1: u32 = 0x5104; // command / slave / length
pub const GMBUS2: u32 = 0x5108; // status
pub const GMBUS3: u32 = 0x510C; // data
pub const GMBUS5: u32 = 0x5120; // 2-byte segment index

pub const GMBUS1_SW_GO: u32 = 1 << 30;
pub const GMBUS1_CYCLE_WAIT: u32 = 1 << 25;
pub const GMBUS1_CYCLE_INDEX: u32 = 1 << 26;
pub const GMBUS1_CYCLE_STOP: u32 = 1 << 27;
pub const GMBUS1_BYTE_COUNT_SHIFT: u32 = 16; // [24:16]
pub const GMBUS1_SLAVE_READ: u32 = 1 << 0;

pub const GMBUS2_ACTIVE: u32 = 1 << 9;
pub const GMBUS2_SATOER: u32 = 1 << 10; // slave stall timeout
pub const GMBUS2_HW_RDY: u32 = 1 << 11;
pub const GMBUS2_HW_WAIT_PHASE: u32 = 1 << 14;
pub const GMBUS2_INUSE: u32 = 1 << 15;

pub const GMBUS5_SEGMENT_ENABLE: u32 = 1 << 31;

// Panel power sequencing (eDP / LVDS)
pub const PP_STATUS: u32 = 0xC7200;
pub const PP_CONTROL: u32 = 0xC7204;
pub const PP_CONTROL_POWER_ON: u32 = 1 << 0;
pub const PP_CONTROL_BACKLIGHT: u32 = 1 << 2;
pub const PP_STATUS_ON: u32 = 1 << 31;

// Timing register encode: (end - 1) << 16 | (start - 1)
pub fn timing_pair(start: u32, end: u32) -> u32 {
    ((end - 1) << 16) | (start - 1)
}

// Size encode used by pipe source and plane size: (h - 1) << 16 | (w - 1)
pub fn size_pair(width: u32, height: u32) -> u32 {
    ((height - 1) << 16) | (width - 1)
}
