// Display configuration engine
//
// A proposed multi-pipe configuration goes through a check phase that runs
// entirely against transaction-local state (planned pipes, a DPLL
// reservation table, the CDCLK target, bandwidth budgets) and touches no
// hardware, then a commit phase under the device-wide commit lock and an
// ALL force-wake: disable pass, CDCLK reprogram, enable pass with bounded
// status polls and a best-effort rollback on failure. The shared-info page
// is republished only when the whole commit lands.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::bo::Bo;
use crate::clocks::{self, ClockParams};
use crate::connector::{self, Port};
use crate::device::Device;
use crate::errors::{GfxError, Result};
use crate::forcewake::ForceWakeDomain;
use crate::mmio;
use crate::platform::GenOps;
use crate::regs;
use crate::{
    CacheType, DisplayMode, DisplayModeFlags, DpmsMode, Generation, PipeId, PortType,
    TranscoderId, MAX_PIPES, MAX_TRANSCODERS, PAGE_SIZE,
};

const PIPE_POLL_TIMEOUT_MS: u64 = 50;
const DPLL_LOCK_TIMEOUT_MS: u64 = 50;
const PANEL_POWER_TIMEOUT_MS: u64 = 50;

/// Fraction of nominal memory bandwidth the display engine may consume.
const BANDWIDTH_HEADROOM_PERCENT: u64 = 50;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DisplayConfigFlags: u32 {
        /// Run the check phase only; commit nothing.
        const TEST_ONLY = 1 << 0;
    }
}

/// One entry of a SET_DISPLAY_CONFIG request.
#[derive(Debug, Clone, Copy)]
pub struct PipeConfigRequest {
    pub pipe: PipeId,
    pub active: bool,
    pub mode: DisplayMode,
    pub connector_id: u32,
    pub fb_handle: u32,
    pub pos_x: u32,
    pub pos_y: u32,
}

#[derive(Debug, Clone)]
pub struct PipeConfigState {
    pub pipe: PipeId,
    pub active: bool,
    pub mode: Option<DisplayMode>,
    pub connector_id: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct ConnectorInfo {
    pub connector_id: u32,
    pub port_type: PortType,
    pub connected: bool,
    pub modes: Vec<DisplayMode>,
    pub preferred_mode: Option<DisplayMode>,
    pub current_pipe: Option<PipeId>,
    pub edid: Option<Vec<u8>>,
}

// Device-resident display state

#[derive(Debug, Clone, Copy, Default)]
pub struct DpllState {
    pub users: u32,
    pub vco_khz: u32,
    pub pixel_khz: u32,
    pub is_dp: bool,
}

pub struct CursorState {
    pub bo: Option<Arc<Bo>>,
    pub visible: bool,
    pub x: i32,
    pub y: i32,
    pub hot_x: u32,
    pub hot_y: u32,
}

pub struct PipeState {
    pub enabled: bool,
    pub dpms: DpmsMode,
    pub mode: Option<DisplayMode>,
    pub connector_id: Option<u32>,
    pub transcoder: Option<TranscoderId>,
    pub dpll: Option<usize>,
    pub clock: Option<ClockParams>,
    pub fb: Option<Arc<Bo>>,
    pub pos: (u32, u32),
    pub cursor: CursorState,
}

impl PipeState {
    fn new() -> Self {
        Self {
            enabled: false,
            dpms: DpmsMode::Off,
            mode: None,
            connector_id: None,
            transcoder: None,
            dpll: None,
            clock: None,
            fb: None,
            pos: (0, 0),
            cursor: CursorState {
                bo: None,
                visible: false,
                x: 0,
                y: 0,
                hot_x: 0,
                hot_y: 0,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TranscoderState {
    pub in_use_by: Option<PipeId>,
}

pub struct DisplayState {
    pub pipes: [PipeState; MAX_PIPES],
    pub transcoders: [TranscoderState; MAX_TRANSCODERS],
    pub dplls: Vec<DpllState>,
    pub cdclk_khz: u32,
    pub pipe_count: usize,
}

impl DisplayState {
    pub fn new(ops: &dyn GenOps) -> Self {
        let mut dplls = Vec::new();
        dplls.resize_with(ops.dpll_count(), DpllState::default);
        Self {
            pipes: [PipeState::new(), PipeState::new(), PipeState::new(), PipeState::new()],
            transcoders: [TranscoderState::default(); MAX_TRANSCODERS],
            dplls,
            cdclk_khz: ops.cdclk_table()[0],
            pipe_count: ops.pipe_count(),
        }
    }
}

// Transaction-local plan

struct PlannedPipe {
    needs_modeset: bool,
    mode: DisplayMode,
    connector_id: u32,
    port: Arc<Port>,
    transcoder: TranscoderId,
    dpll: usize,
    clock: ClockParams,
    fb: Arc<Bo>,
    pos: (u32, u32),
}

#[derive(Clone, Copy)]
struct TxnDpll {
    clock: ClockParams,
}

impl Device {
    fn transcoder_for(&self, pipe: PipeId, port_type: PortType) -> TranscoderId {
        if port_type == PortType::Edp {
            return TranscoderId::Edp;
        }
        match pipe {
            PipeId::A => TranscoderId::A,
            PipeId::B => TranscoderId::B,
            _ => TranscoderId::C,
        }
    }

    /// True when `pipe` stays enabled with its current timings after this
    /// transaction (so its transcoder and DPLL survive).
    fn pipe_survives(
        requests: &[PipeConfigRequest],
        state: &DisplayState,
        pipe: PipeId,
        modesets: &[bool; MAX_PIPES],
    ) -> bool {
        if !state.pipes[pipe.index()].enabled {
            return false;
        }
        match requests.iter().find(|r| r.pipe == pipe) {
            Some(request) => request.active && !modesets[pipe.index()],
            // The request is the full configuration; absent pipes go dark.
            None => false,
        }
    }

    pub fn set_display_config(
        &self,
        requests: &[PipeConfigRequest],
        primary: PipeId,
        flags: DisplayConfigFlags,
    ) -> Result<()> {
        let mut state = self.display.lock();

        // Argument validation
        for (i, request) in requests.iter().enumerate() {
            if request.pipe.index() >= state.pipe_count {
                return Err(GfxError::BadValue);
            }
            if requests[..i].iter().any(|r| r.pipe == request.pipe) {
                return Err(GfxError::BadValue);
            }
            if request.active && (request.mode.width == 0 || request.mode.height == 0) {
                return Err(GfxError::BadValue);
            }
        }

        // Check phase: build the plan without touching hardware.
        let mut planned: [Option<PlannedPipe>; MAX_PIPES] = [None, None, None, None];
        let mut modesets = [false; MAX_PIPES];
        for request in requests.iter().filter(|r| r.active) {
            let index = request.pipe.index();
            let current = &state.pipes[index];
            modesets[index] = !(current.enabled
                && current.mode == Some(request.mode)
                && current.connector_id == Some(request.connector_id));
        }

        let mut txn_dplls: Vec<Option<TxnDpll>> = Vec::new();
        txn_dplls.resize_with(state.dplls.len(), || None);

        for request in requests.iter().filter(|r| r.active) {
            let port = self
                .port_by_connector(request.connector_id)
                .cloned()
                .ok_or(GfxError::BadIndex)?;
            if !port.is_connected() {
                return Err(GfxError::NotReady);
            }
            let fb = self.lookup_bo(request.fb_handle)?;
            if (fb.stride() as u64 * request.mode.height as u64) > fb.allocated_size() as u64 {
                return Err(GfxError::BadValue);
            }

            // One connector drives at most one pipe.
            if planned
                .iter()
                .flatten()
                .any(|p| p.connector_id == request.connector_id)
            {
                return Err(GfxError::Busy);
            }

            let transcoder = self.transcoder_for(request.pipe, port.desc.port_type);
            if planned.iter().flatten().any(|p| p.transcoder == transcoder) {
                return Err(GfxError::Busy);
            }
            if let Some(user) = state.transcoders[transcoder.index()].in_use_by {
                if user != request.pipe
                    && Self::pipe_survives(requests, &state, user, &modesets)
                {
                    return Err(GfxError::Busy);
                }
            }

            let clock = clocks::calc(&request.mode, port.desc.port_type, port.caps(), self.ops())?;

            let dpll = self.reserve_dpll(&state, requests, &modesets, &mut txn_dplls, &clock)?;

            planned[request.pipe.index()] = Some(PlannedPipe {
                needs_modeset: modesets[request.pipe.index()],
                mode: request.mode,
                connector_id: request.connector_id,
                port,
                transcoder,
                dpll,
                clock,
                fb,
                pos: (request.pos_x, request.pos_y),
            });
        }

        // CDCLK target across every pipe that will be active post-commit.
        let mut max_pixel = 0u32;
        let mut active_count = 0usize;
        for index in 0..state.pipe_count {
            let pipe = crate::PIPE_IDS[index];
            if let Some(plan) = &planned[index] {
                max_pixel = max_pixel.max(plan.clock.adjusted_pixel_clock_khz);
                active_count += 1;
            } else if Self::pipe_survives(requests, &state, pipe, &modesets) {
                if let Some(clock) = &state.pipes[index].clock {
                    max_pixel = max_pixel.max(clock.adjusted_pixel_clock_khz);
                }
                active_count += 1;
            }
        }
        let required_cdclk = clocks::required_cdclk(
            max_pixel,
            self.ops().cdclk_ratio_x10(active_count),
            active_count,
        );
        let target_cdclk = if active_count > 0 {
            clocks::pick_cdclk(self.ops().cdclk_table(), required_cdclk, state.cdclk_khz)?
        } else {
            state.cdclk_khz
        };

        self.check_bandwidth(&state, &planned, requests, &modesets, target_cdclk, required_cdclk)?;

        if flags.contains(DisplayConfigFlags::TEST_ONLY) {
            // Transaction-scoped references drop with `planned`.
            return Ok(());
        }

        // Commit phase
        let _wake = self.forcewake.acquire(ForceWakeDomain::All)?;

        // Disable pass, in pipe order: anything enabled that is absent from
        // the new configuration, deactivated, or about to modeset.
        for index in 0..state.pipe_count {
            let pipe = crate::PIPE_IDS[index];
            let must_disable = state.pipes[index].enabled
                && match &planned[index] {
                    Some(plan) => plan.needs_modeset,
                    None => true,
                };
            if must_disable {
                self.disable_pipe_hw(&mut state, pipe);
            }
        }

        if target_cdclk != state.cdclk_khz {
            self.io().write32(
                regs::CDCLK_CTL,
                self.ops().cdclk_ctl_field(target_cdclk),
            );
            self.io().posting_read(regs::CDCLK_CTL);
            state.cdclk_khz = target_cdclk;
        }

        // Enable / reconfigure pass.
        let mut touched: Vec<PipeId> = Vec::new();
        let mut failure: Option<GfxError> = None;
        for index in 0..state.pipe_count {
            let pipe = crate::PIPE_IDS[index];
            let plan = match planned[index].take() {
                Some(plan) => plan,
                None => continue,
            };
            if !plan.needs_modeset {
                if let Err(e) = self.flip_pipe_hw(&mut state, pipe, &plan) {
                    failure = Some(e);
                    break;
                }
                continue;
            }
            match self.enable_pipe_hw(&mut state, pipe, &plan) {
                Ok(()) => touched.push(pipe),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(error) = failure {
            // Best-effort rollback of what this commit enabled; the previous
            // multi-head configuration is not restored.
            for pipe in touched {
                self.disable_pipe_hw(&mut state, pipe);
            }
            return Err(error);
        }

        // Publish the new configuration atomically.
        let mut info = self.shared_info();
        info.active_display_count = 0;
        for index in 0..MAX_PIPES {
            info.current_modes[index] = if state.pipes[index].enabled {
                info.active_display_count += 1;
                state.pipes[index].mode
            } else {
                None
            };
        }
        info.primary_pipe = primary;
        info.change_count += 1;
        self.publish_shared_info(info);
        Ok(())
    }

    /// DPLL reservation against the transaction table, then the pool.
    fn reserve_dpll(
        &self,
        state: &DisplayState,
        requests: &[PipeConfigRequest],
        modesets: &[bool; MAX_PIPES],
        txn_dplls: &mut [Option<TxnDpll>],
        clock: &ClockParams,
    ) -> Result<usize> {
        // Share a PLL some earlier entry of this transaction reserved.
        for (index, txn) in txn_dplls.iter().enumerate() {
            if let Some(txn) = txn {
                if clocks::dpll_compatible(&txn.clock, clock) {
                    return Ok(index);
                }
            }
        }
        // Otherwise claim one with no surviving users.
        for (index, dpll) in state.dplls.iter().enumerate() {
            if txn_dplls[index].is_some() {
                continue;
            }
            let survivors = (0..state.pipe_count)
                .filter(|i| {
                    state.pipes[*i].dpll == Some(index)
                        && Self::pipe_survives(
                            requests,
                            state,
                            crate::PIPE_IDS[*i],
                            modesets,
                        )
                })
                .count();
            if survivors > 0 {
                // A surviving user keeps its programming; share only on
                // exact compatibility.
                let compatible = dpll.vco_khz == clock.vco_khz
                    && (dpll.is_dp && clock.port_type.is_dp_like()
                        || dpll.pixel_khz == clock.adjusted_pixel_clock_khz);
                if compatible {
                    txn_dplls[index] = Some(TxnDpll { clock: *clock });
                    return Ok(index);
                }
                continue;
            }
            txn_dplls[index] = Some(TxnDpll { clock: *clock });
            return Ok(index);
        }
        Err(GfxError::Busy)
    }

    fn check_bandwidth(
        &self,
        state: &DisplayState,
        planned: &[Option<PlannedPipe>; MAX_PIPES],
        requests: &[PipeConfigRequest],
        modesets: &[bool; MAX_PIPES],
        target_cdclk: u32,
        required_cdclk: u32,
    ) -> Result<()> {
        let mut memory_kbps: u64 = 0;
        for index in 0..state.pipe_count {
            let pipe = crate::PIPE_IDS[index];
            let (mode, clock) = match &planned[index] {
                Some(plan) => (plan.mode, plan.clock),
                None => {
                    if !Self::pipe_survives(requests, state, pipe, modesets) {
                        continue;
                    }
                    match (state.pipes[index].mode, state.pipes[index].clock) {
                        (Some(mode), Some(clock)) => (mode, clock),
                        _ => continue,
                    }
                }
            };

            // Scanout fetch traffic for this pipe.
            let refresh = mode.calculated_refresh().max(mode.refresh_rate).max(1);
            memory_kbps += mode.width as u64 * mode.height as u64 * refresh as u64 * 4 / 1000;

            // Per-link budget.
            match clock.port_type {
                PortType::Dp | PortType::Edp => {
                    let need =
                        clock.adjusted_pixel_clock_khz as u64 * clock.wire_bytes_per_pixel() as u64;
                    let capacity = clocks::dp_link_capacity_kbps(
                        clock.link_symbol_clock_khz,
                        clock.lane_count,
                    );
                    if need > capacity {
                        return Err(GfxError::Busy);
                    }
                }
                PortType::Hdmi | PortType::Dvi => {
                    if clock.adjusted_pixel_clock_khz > self.ops().max_tmds_khz() {
                        return Err(GfxError::Unsupported);
                    }
                }
                _ => {}
            }
        }

        let budget = self.ops().memory_bandwidth_kbps() * BANDWIDTH_HEADROOM_PERCENT / 100;
        if memory_kbps > budget {
            return Err(GfxError::Busy);
        }
        if target_cdclk < required_cdclk {
            return Err(GfxError::Busy);
        }
        Ok(())
    }

    // Hardware sequences

    /// Bind a scanout object, preferring the pipe's reserved GTT window.
    fn bind_scanout(&self, pipe: PipeId, fb: &Arc<Bo>) -> Result<u64> {
        if let Some(address) = fb.gtt_address() {
            return Ok(address);
        }
        if let Some(region) = self.fb_regions[pipe.index()] {
            if fb.page_count() <= region.page_count {
                self.gem
                    .bind_at(fb, region.start_page, CacheType::WriteCombining)?;
                return Ok(region.start_page as u64 * PAGE_SIZE as u64);
            }
        }
        let page = self
            .gem
            .bind(fb, CacheType::WriteCombining, self.completed_snapshot())?;
        Ok(page as u64 * PAGE_SIZE as u64)
    }

    /// Drop a scanout binding if it sits in the pipe's reserved window, so
    /// the next framebuffer can take the slot.
    fn drop_scanout_binding(&self, pipe: PipeId, fb: &Arc<Bo>) {
        if let (Some(region), Some(offset)) = (self.fb_regions[pipe.index()], fb.gtt_offset_pages())
        {
            if offset == region.start_page {
                self.gem.unbind(fb);
            }
        }
    }

    /// Release the device's reference to a retired scanout object.
    fn release_scanout(&self, pipe: PipeId, fb: &Arc<Bo>) {
        self.gem.unpin(fb);
        self.drop_scanout_binding(pipe, fb);
        self.gem.put(fb);
    }

    fn plane_format_bits(bits_per_pixel: u32) -> u32 {
        let format = match bits_per_pixel {
            8 => regs::PLANE_FORMAT_8BPP_INDEXED,
            16 => regs::PLANE_FORMAT_BGRX565,
            _ => regs::PLANE_FORMAT_BGRX8888,
        };
        format << regs::PLANE_CTL_FORMAT_SHIFT
    }

    fn program_plane(&self, pipe: PipeId, plan: &PlannedPipe, surface: u64) {
        let io = self.io();
        let fb = &plan.fb;
        // Keep the enable bit as-is: flips reprogram a live plane.
        let enabled = io.read32(regs::plane_ctl(pipe)) & regs::PLANE_CTL_ENABLE;
        let mut ctl = enabled
            | Self::plane_format_bits(fb.bits_per_pixel().max(32))
            | regs::PLANE_CTL_GAMMA_ENABLE;
        if fb.tiling() == crate::TilingMode::X {
            ctl |= regs::PLANE_CTL_TILED_X;
        }
        io.write32(regs::plane_ctl(pipe), ctl);
        io.write32(regs::plane_stride(pipe), fb.stride());
        io.write32(
            regs::plane_size(pipe),
            regs::size_pair(plan.mode.width, plan.mode.height),
        );
        let linear_offset =
            plan.pos.1 as u64 * fb.stride() as u64 + plan.pos.0 as u64 * (fb.bits_per_pixel().max(32) / 8) as u64;
        if fb.tiling() == crate::TilingMode::None {
            io.write32(regs::plane_linear_offset(pipe), linear_offset as u32);
            io.write32(regs::plane_tile_offset(pipe), 0);
        } else {
            io.write32(regs::plane_linear_offset(pipe), 0);
            io.write32(
                regs::plane_tile_offset(pipe),
                (plan.pos.1 << 16) | plan.pos.0,
            );
        }
        io.write32(regs::plane_surface(pipe), surface as u32);
    }

    fn program_dpll(&self, state: &mut DisplayState, index: usize, clock: &ClockParams) -> Result<()> {
        let io = self.io();
        let dpll = &mut state.dplls[index];
        if dpll.users == 0 {
            if self.generation() == Generation::Gen7 {
                io.write32(regs::pch_dpll_fp0(index), (clock.m << 8) | clock.n.max(1));
                io.write32(regs::pch_dpll_fp1(index), (clock.m << 8) | clock.n.max(1));
            }
            let ctl_reg = self.ops().dpll_ctl_reg(index);
            io.write32(ctl_reg, regs::DPLL_ENABLE | (clock.p & 0xFF) << 16);
            io.posting_read(ctl_reg);
            mmio::wait_for_set(&**io, ctl_reg, regs::DPLL_LOCK, DPLL_LOCK_TIMEOUT_MS)?;
            dpll.vco_khz = clock.vco_khz;
            dpll.pixel_khz = clock.adjusted_pixel_clock_khz;
            dpll.is_dp = clock.port_type.is_dp_like();
        }
        dpll.users += 1;
        Ok(())
    }

    fn release_dpll(&self, state: &mut DisplayState, index: usize) {
        let io = self.io();
        let dpll = &mut state.dplls[index];
        if dpll.users == 0 {
            return;
        }
        dpll.users -= 1;
        if dpll.users == 0 {
            let ctl_reg = self.ops().dpll_ctl_reg(index);
            io.clear_bits(ctl_reg, regs::DPLL_ENABLE);
            io.posting_read(ctl_reg);
            *dpll = DpllState::default();
        }
    }

    fn panel_power(&self, on: bool) -> Result<()> {
        let io = self.io();
        if on {
            io.set_bits(regs::PP_CONTROL, regs::PP_CONTROL_POWER_ON | regs::PP_CONTROL_BACKLIGHT);
            io.posting_read(regs::PP_CONTROL);
            mmio::wait_for_set(&**io, regs::PP_STATUS, regs::PP_STATUS_ON, PANEL_POWER_TIMEOUT_MS)
        } else {
            io.clear_bits(regs::PP_CONTROL, regs::PP_CONTROL_POWER_ON | regs::PP_CONTROL_BACKLIGHT);
            io.posting_read(regs::PP_CONTROL);
            Ok(())
        }
    }

    fn enable_port_hw(&self, plan: &PlannedPipe) -> Result<()> {
        let io = self.io();
        if plan.clock.port_type.is_dp_like() {
            connector::train_link(
                &**io,
                plan.port.desc.port_index,
                plan.clock.lane_count,
                plan.clock.link_symbol_clock_khz,
            )?;
        }
        let ctl_reg = regs::port_buf_ctl(plan.port.desc.port_index);
        let mut ctl = regs::PORT_BUF_CTL_ENABLE;
        if plan.clock.lane_count > 0 {
            ctl |= (plan.clock.lane_count as u32 - 1) << regs::PORT_BUF_CTL_PORT_WIDTH_SHIFT;
        }
        io.write32(ctl_reg, ctl);
        io.posting_read(ctl_reg);
        Ok(())
    }

    /// Surface-only update for a pipe whose timings are untouched.
    fn flip_pipe_hw(
        &self,
        state: &mut DisplayState,
        pipe: PipeId,
        plan: &PlannedPipe,
    ) -> Result<()> {
        let index = pipe.index();
        let same_fb = state.pipes[index]
            .fb
            .as_ref()
            .map(|fb| fb.id() == plan.fb.id())
            .unwrap_or(false);
        if same_fb && state.pipes[index].pos == plan.pos {
            return Ok(());
        }
        if !same_fb {
            if let Some(old) = state.pipes[index].fb.take() {
                self.release_scanout(pipe, &old);
            }
        }
        let surface = self.bind_scanout(pipe, &plan.fb)?;
        self.program_plane(pipe, plan, surface);
        self.io().posting_read(regs::plane_surface(pipe));
        if !same_fb {
            self.gem.get(&plan.fb);
            self.gem.pin(&plan.fb);
            state.pipes[index].fb = Some(plan.fb.clone());
        }
        state.pipes[index].pos = plan.pos;
        Ok(())
    }

    /// Full modeset of one pipe, in the order the hardware requires. A
    /// failure mid-sequence gives back the DPLL reference and the scanout
    /// binding before surfacing.
    fn enable_pipe_hw(
        &self,
        state: &mut DisplayState,
        pipe: PipeId,
        plan: &PlannedPipe,
    ) -> Result<()> {
        let index = pipe.index();
        let trans = plan.transcoder;

        let surface = self.bind_scanout(pipe, &plan.fb)?;
        if let Err(e) = self.program_dpll(state, plan.dpll, &plan.clock) {
            self.drop_scanout_binding(pipe, &plan.fb);
            return Err(e);
        }
        if let Err(e) = self.enable_pipe_sequence(pipe, plan, surface) {
            self.release_dpll(state, plan.dpll);
            self.drop_scanout_binding(pipe, &plan.fb);
            return Err(e);
        }

        // Fold the plan into device state.
        let pipe_state = &mut state.pipes[index];
        if let Some(old) = pipe_state.fb.take() {
            self.release_scanout(pipe, &old);
        }
        self.gem.get(&plan.fb);
        self.gem.pin(&plan.fb);
        pipe_state.enabled = true;
        pipe_state.dpms = DpmsMode::On;
        pipe_state.mode = Some(plan.mode);
        pipe_state.connector_id = Some(plan.connector_id);
        pipe_state.transcoder = Some(trans);
        pipe_state.dpll = Some(plan.dpll);
        pipe_state.clock = Some(plan.clock);
        pipe_state.fb = Some(plan.fb.clone());
        pipe_state.pos = plan.pos;
        state.transcoders[trans.index()].in_use_by = Some(pipe);
        plan.port.state.lock().current_pipe = Some(pipe);
        Ok(())
    }

    fn enable_pipe_sequence(&self, pipe: PipeId, plan: &PlannedPipe, surface: u64) -> Result<()> {
        let io = self.io();
        let mode = &plan.mode;
        let trans = plan.transcoder;

        // Transcoder timings: (end-1)<<16 | (start-1).
        io.write32(regs::trans_htotal(trans), regs::timing_pair(mode.width, mode.htotal));
        io.write32(
            regs::trans_hblank(trans),
            regs::timing_pair(mode.width, mode.htotal),
        );
        io.write32(
            regs::trans_hsync(trans),
            regs::timing_pair(mode.hsync_start, mode.hsync_end),
        );
        io.write32(regs::trans_vtotal(trans), regs::timing_pair(mode.height, mode.vtotal));
        io.write32(
            regs::trans_vblank(trans),
            regs::timing_pair(mode.height, mode.vtotal),
        );
        io.write32(
            regs::trans_vsync(trans),
            regs::timing_pair(mode.vsync_start, mode.vsync_end),
        );

        io.write32(regs::pipe_src(pipe), regs::size_pair(mode.width, mode.height));

        let mut trans_conf = ((pipe.index() as u32) << regs::TRANS_CONF_PIPE_SEL_SHIFT)
            | regs::trans_conf_bpc_field(plan.clock.bits_per_component);
        if mode.flags.contains(DisplayModeFlags::INTERLACED) {
            trans_conf |= regs::TRANS_CONF_INTERLACED;
        }
        io.write32(regs::trans_conf(trans), trans_conf);

        self.program_plane(pipe, plan, surface);

        if matches!(plan.clock.port_type, PortType::Lvds | PortType::Edp) {
            self.panel_power(true)?;
        }

        io.set_bits(regs::trans_conf(trans), regs::TRANS_CONF_ENABLE);
        io.posting_read(regs::trans_conf(trans));

        io.set_bits(regs::pipe_conf(pipe), regs::PIPE_CONF_ENABLE);
        io.posting_read(regs::pipe_conf(pipe));
        mmio::wait_for_set(
            &**io,
            regs::pipe_conf(pipe),
            regs::PIPE_CONF_ACTIVE,
            PIPE_POLL_TIMEOUT_MS,
        )?;

        io.set_bits(regs::plane_ctl(pipe), regs::PLANE_CTL_ENABLE);
        io.posting_read(regs::plane_ctl(pipe));

        self.enable_port_hw(plan)
    }

    /// Tear one pipe down: port, plane, pipe, transcoder, then bookkeeping.
    fn disable_pipe_hw(&self, state: &mut DisplayState, pipe: PipeId) {
        let io = self.io();
        let index = pipe.index();

        if let Some(connector_id) = state.pipes[index].connector_id {
            if let Some(port) = self.port_by_connector(connector_id) {
                let ctl_reg = regs::port_buf_ctl(port.desc.port_index);
                io.clear_bits(ctl_reg, regs::PORT_BUF_CTL_ENABLE);
                io.posting_read(ctl_reg);
                port.state.lock().current_pipe = None;
            }
        }
        if let Some(clock) = &state.pipes[index].clock {
            if matches!(clock.port_type, PortType::Lvds | PortType::Edp) {
                let _ = self.panel_power(false);
            }
        }

        io.clear_bits(regs::plane_ctl(pipe), regs::PLANE_CTL_ENABLE);
        io.posting_read(regs::plane_ctl(pipe));

        io.clear_bits(regs::pipe_conf(pipe), regs::PIPE_CONF_ENABLE);
        io.posting_read(regs::pipe_conf(pipe));
        let _ = mmio::wait_for_clear(
            &**io,
            regs::pipe_conf(pipe),
            regs::PIPE_CONF_ACTIVE,
            PIPE_POLL_TIMEOUT_MS,
        );

        if let Some(trans) = state.pipes[index].transcoder {
            io.clear_bits(regs::trans_conf(trans), regs::TRANS_CONF_ENABLE);
            io.posting_read(regs::trans_conf(trans));
            state.transcoders[trans.index()].in_use_by = None;
        }

        if let Some(fb) = state.pipes[index].fb.take() {
            self.release_scanout(pipe, &fb);
        }
        if let Some(dpll) = state.pipes[index].dpll.take() {
            self.release_dpll(state, dpll);
        }

        let pipe_state = &mut state.pipes[index];
        pipe_state.enabled = false;
        pipe_state.dpms = DpmsMode::Off;
        pipe_state.mode = None;
        pipe_state.connector_id = None;
        pipe_state.transcoder = None;
        pipe_state.clock = None;
    }

    // Read-side queries

    pub fn get_display_config(&self, max_pipes: usize) -> Vec<PipeConfigState> {
        let state = self.display.lock();
        (0..state.pipe_count.min(max_pipes))
            .map(|index| PipeConfigState {
                pipe: crate::PIPE_IDS[index],
                active: state.pipes[index].enabled,
                mode: state.pipes[index].mode,
                connector_id: state.pipes[index].connector_id,
            })
            .collect()
    }

    pub fn get_connector_info(&self, connector_id: u32) -> Result<ConnectorInfo> {
        let port = self
            .port_by_connector(connector_id)
            .ok_or(GfxError::BadIndex)?;
        let state = port.state.lock();
        Ok(ConnectorInfo {
            connector_id,
            port_type: port.desc.port_type,
            connected: state.connected,
            modes: state.modes.clone(),
            preferred_mode: state.preferred_mode,
            current_pipe: state.current_pipe,
            edid: state.edid.clone(),
        })
    }

    pub fn pipe_frame_count(&self, pipe: PipeId) -> u32 {
        self.io().read32(regs::pipe_frame_counter(pipe))
    }

    /// Block until the frame counter advances. Plane offset and cursor
    /// registers latch at vblank; pan and cursor updates wait here so the
    /// new programming is live when the call returns.
    fn wait_for_vblank(&self, pipe: PipeId) -> Result<()> {
        let start = self.pipe_frame_count(pipe);
        let deadline = mmio::Deadline::after_ms(PIPE_POLL_TIMEOUT_MS);
        while self.pipe_frame_count(pipe) == start {
            if deadline.expired() {
                return Err(GfxError::TimedOut);
            }
            core::hint::spin_loop();
        }
        Ok(())
    }

    /// Whether the pipe is scanning out, i.e. its frame counter runs.
    fn pipe_running(state: &DisplayState, index: usize) -> bool {
        state.pipes[index].enabled && state.pipes[index].dpms == DpmsMode::On
    }

    // DPMS

    pub fn set_dpms_mode(&self, pipe: PipeId, mode: DpmsMode) -> Result<()> {
        let mut state = self.display.lock();
        let index = pipe.index();
        if index >= state.pipe_count {
            return Err(GfxError::BadValue);
        }
        if !state.pipes[index].enabled {
            return Err(GfxError::NotReady);
        }
        if state.pipes[index].dpms == mode {
            return Ok(());
        }
        let _wake = self.forcewake.acquire(ForceWakeDomain::Display)?;
        let io = self.io();
        let port_ctl = state.pipes[index]
            .connector_id
            .and_then(|id| self.port_by_connector(id))
            .map(|port| regs::port_buf_ctl(port.desc.port_index));
        let is_panel = state.pipes[index]
            .clock
            .map(|c| matches!(c.port_type, PortType::Lvds | PortType::Edp))
            .unwrap_or(false);

        match mode {
            DpmsMode::On => {
                if is_panel {
                    self.panel_power(true)?;
                }
                io.set_bits(regs::pipe_conf(pipe), regs::PIPE_CONF_ENABLE);
                io.posting_read(regs::pipe_conf(pipe));
                io.set_bits(regs::plane_ctl(pipe), regs::PLANE_CTL_ENABLE);
                io.posting_read(regs::plane_ctl(pipe));
                if let Some(ctl) = port_ctl {
                    io.set_bits(ctl, regs::PORT_BUF_CTL_ENABLE);
                    io.posting_read(ctl);
                }
            }
            DpmsMode::Standby => {
                io.clear_bits(regs::plane_ctl(pipe), regs::PLANE_CTL_ENABLE);
                io.posting_read(regs::plane_ctl(pipe));
            }
            DpmsMode::Suspend | DpmsMode::Off => {
                io.clear_bits(regs::plane_ctl(pipe), regs::PLANE_CTL_ENABLE);
                io.posting_read(regs::plane_ctl(pipe));
                io.clear_bits(regs::pipe_conf(pipe), regs::PIPE_CONF_ENABLE);
                io.posting_read(regs::pipe_conf(pipe));
                if mode == DpmsMode::Off {
                    if let Some(ctl) = port_ctl {
                        io.clear_bits(ctl, regs::PORT_BUF_CTL_ENABLE);
                        io.posting_read(ctl);
                    }
                    if is_panel {
                        self.panel_power(false)?;
                    }
                }
            }
        }
        state.pipes[index].dpms = mode;
        Ok(())
    }

    pub fn get_dpms_mode(&self, pipe: PipeId) -> Result<DpmsMode> {
        let state = self.display.lock();
        if pipe.index() >= state.pipe_count {
            return Err(GfxError::BadValue);
        }
        Ok(state.pipes[pipe.index()].dpms)
    }

    // Panning

    pub fn move_display_offset(&self, pipe: PipeId, x: u32, y: u32) -> Result<()> {
        let mut state = self.display.lock();
        let index = pipe.index();
        if index >= state.pipe_count {
            return Err(GfxError::BadValue);
        }
        let (mode, fb) = match (&state.pipes[index].mode, &state.pipes[index].fb) {
            (Some(mode), Some(fb)) => (*mode, fb.clone()),
            _ => return Err(GfxError::NotReady),
        };
        if fb.width() > 0
            && (x + mode.width > fb.width() || y + mode.height > fb.height())
        {
            return Err(GfxError::BadValue);
        }
        let _wake = self.forcewake.acquire(ForceWakeDomain::Display)?;
        let io = self.io();
        let bytes_per_pixel = fb.bits_per_pixel().max(32) / 8;
        if fb.tiling() == crate::TilingMode::None {
            let offset = y as u64 * fb.stride() as u64 + x as u64 * bytes_per_pixel as u64;
            io.write32(regs::plane_linear_offset(pipe), offset as u32);
        } else {
            io.write32(regs::plane_tile_offset(pipe), (y << 16) | x);
        }
        io.posting_read(regs::plane_surface(pipe));
        if Self::pipe_running(&state, index) {
            // The offset latches at the next vblank.
            self.wait_for_vblank(pipe)?;
        }
        state.pipes[index].pos = (x, y);
        Ok(())
    }

    // Indexed color palette

    pub fn set_indexed_colors(&self, pipe: PipeId, first: usize, colors: &[u8]) -> Result<()> {
        let state = self.display.lock();
        if pipe.index() >= state.pipe_count {
            return Err(GfxError::BadValue);
        }
        let count = colors.len() / 3;
        if count == 0 || first + count > regs::PALETTE_ENTRIES {
            return Err(GfxError::BadValue);
        }
        let _wake = self.forcewake.acquire(ForceWakeDomain::Display)?;
        let io = self.io();
        for entry in 0..count {
            let r = colors[entry * 3] as u32;
            let g = colors[entry * 3 + 1] as u32;
            let b = colors[entry * 3 + 2] as u32;
            io.write32(regs::palette_entry(pipe, first + entry), (r << 16) | (g << 8) | b);
        }
        Ok(())
    }

    // Hardware cursor

    pub fn set_cursor_bitmap(
        &self,
        pipe: PipeId,
        width: u32,
        height: u32,
        hot_x: u32,
        hot_y: u32,
        argb: &[u8],
    ) -> Result<()> {
        const CURSOR_DIM: u32 = 64;
        let mut state = self.display.lock();
        if pipe.index() >= state.pipe_count {
            return Err(GfxError::BadValue);
        }
        if width == 0 || height == 0 || width > CURSOR_DIM || height > CURSOR_DIM {
            return Err(GfxError::BadValue);
        }
        if argb.len() < (width * height * 4) as usize {
            return Err(GfxError::BadAddress);
        }

        let bo = self.gem.create(
            crate::bo::BoCreateInfo::surface(CURSOR_DIM, CURSOR_DIM, 32, crate::TilingMode::None)
                .pinned()
                .cleared()
                .cached(CacheType::WriteCombining),
        )?;
        let virt = bo.cpu_map()?;
        for row in 0..height as usize {
            let src = &argb[row * width as usize * 4..][..width as usize * 4];
            unsafe {
                core::ptr::copy_nonoverlapping(
                    src.as_ptr(),
                    (virt.as_u64() + (row * bo.stride() as usize) as u64) as *mut u8,
                    src.len(),
                );
            }
        }
        let page = self
            .gem
            .bind(&bo, CacheType::WriteCombining, self.completed_snapshot())?;

        let _wake = self.forcewake.acquire(ForceWakeDomain::Display)?;
        let io = self.io();
        io.write32(regs::cursor_base(pipe), (page * PAGE_SIZE) as u32);
        io.posting_read(regs::cursor_base(pipe));
        if Self::pipe_running(&state, pipe.index()) {
            // The base register latches at the next vblank.
            self.wait_for_vblank(pipe)?;
        }

        let cursor = &mut state.pipes[pipe.index()].cursor;
        if let Some(old) = cursor.bo.take() {
            self.gem.put(&old);
        }
        cursor.bo = Some(bo);
        cursor.hot_x = hot_x;
        cursor.hot_y = hot_y;
        Ok(())
    }

    pub fn set_cursor_state(&self, pipe: PipeId, visible: bool, x: i32, y: i32) -> Result<()> {
        let mut state = self.display.lock();
        if pipe.index() >= state.pipe_count {
            return Err(GfxError::BadValue);
        }
        if visible && state.pipes[pipe.index()].cursor.bo.is_none() {
            return Err(GfxError::NotReady);
        }
        let _wake = self.forcewake.acquire(ForceWakeDomain::Display)?;
        let io = self.io();

        let cursor = &mut state.pipes[pipe.index()].cursor;
        let eff_x = x - cursor.hot_x as i32;
        let eff_y = y - cursor.hot_y as i32;
        let mut pos = 0u32;
        pos |= (eff_x.unsigned_abs() & 0x7FFF)
            | if eff_x < 0 { regs::CURSOR_POS_SIGN_X } else { 0 };
        pos |= ((eff_y.unsigned_abs() & 0x7FFF) << 16)
            | if eff_y < 0 { regs::CURSOR_POS_SIGN_Y } else { 0 };
        io.write32(regs::cursor_position(pipe), pos);
        io.write32(
            regs::cursor_ctl(pipe),
            if visible {
                regs::CURSOR_MODE_64_ARGB
            } else {
                regs::CURSOR_MODE_DISABLE
            },
        );
        io.posting_read(regs::cursor_ctl(pipe));
        if Self::pipe_running(&state, pipe.index()) {
            self.wait_for_vblank(pipe)?;
        }

        let cursor = &mut state.pipes[pipe.index()].cursor;
        cursor.visible = visible;
        cursor.x = x;
        cursor.y = y;
        Ok(())
    }
}
