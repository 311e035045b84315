// Mode and clock calculation
//
// Derives everything the commit phase programs: DPLL dividers (exhaustive
// search within the generation's limits), DP lane/rate selection, TMDS
// ceilings and the CDCLK operating point.

use crate::errors::{GfxError, Result};
use crate::platform::{DpllLimits, GenOps};
use crate::{DisplayMode, PortType};

pub const HBR3_KHZ: u32 = 810_000;

/// DisplayPort sink capabilities out of the DPCD receiver-cap block.
#[derive(Debug, Clone, Copy)]
pub struct PortCaps {
    pub max_link_rate_khz: u32,
    pub max_lane_count: u8,
}

impl PortCaps {
    pub fn none() -> Self {
        Self {
            max_link_rate_khz: 0,
            max_lane_count: 0,
        }
    }
}

/// Everything the enable pass needs to program one pipe's clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockParams {
    pub port_type: PortType,
    pub adjusted_pixel_clock_khz: u32,
    pub vco_khz: u32,
    pub m: u32,
    pub n: u32,
    pub p: u32,
    /// DP only; zero elsewhere.
    pub lane_count: u8,
    pub link_symbol_clock_khz: u32,
    pub bits_per_component: u32,
}

impl ClockParams {
    pub fn wire_bytes_per_pixel(&self) -> u32 {
        self.bits_per_component * 3 / 8
    }
}

/// Data capacity of a DP link in kB/s. 8b/10b channel coding up to HBR2,
/// 128b/132b at HBR3.
pub fn dp_link_capacity_kbps(link_rate_khz: u32, lane_count: u8) -> u64 {
    let per_lane = if link_rate_khz >= HBR3_KHZ {
        link_rate_khz as u64 * 2 * 128 / 132 / 8
    } else {
        link_rate_khz as u64 * 8 / 10
    };
    per_lane * lane_count as u64
}

/// Pick the smallest (lane count, link rate) pair whose capacity covers the
/// stream.
pub fn select_dp_link(
    pixel_clock_khz: u32,
    wire_bytes_per_pixel: u32,
    caps: PortCaps,
    rates: &[u32],
) -> Result<(u8, u32)> {
    if caps.max_lane_count == 0 || caps.max_link_rate_khz == 0 {
        return Err(GfxError::NotReady);
    }
    let required = pixel_clock_khz as u64 * wire_bytes_per_pixel as u64;
    for lanes in [1u8, 2, 4] {
        if lanes > caps.max_lane_count {
            break;
        }
        for rate in rates {
            if *rate > caps.max_link_rate_khz {
                break;
            }
            if dp_link_capacity_kbps(*rate, lanes) >= required {
                return Ok((lanes, *rate));
            }
        }
    }
    Err(GfxError::Busy)
}

#[derive(Debug, Clone, Copy)]
pub struct DpllDividers {
    pub vco_khz: u32,
    pub m: u32,
    pub n: u32,
    pub p: u32,
}

/// Exhaustive divider scan: VCO = ref * m / n, dot clock = VCO / p. Keeps
/// the best-error candidate inside the VCO window.
pub fn compute_dpll(target_khz: u32, limits: &DpllLimits) -> Result<DpllDividers> {
    if target_khz == 0 {
        return Err(GfxError::BadValue);
    }
    let mut best: Option<(u32, DpllDividers)> = None;
    for n in limits.n_min..=limits.n_max {
        for m in limits.m_min..=limits.m_max {
            let vco = (limits.ref_khz as u64 * m as u64 / n as u64) as u32;
            if vco < limits.vco_min_khz || vco > limits.vco_max_khz {
                continue;
            }
            for p in limits.p_values {
                let dot = vco / p;
                let error = dot.abs_diff(target_khz);
                if best.as_ref().map_or(true, |(e, _)| error < *e) {
                    best = Some((error, DpllDividers { vco_khz: vco, m, n, p: *p }));
                }
            }
        }
    }
    match best {
        // Reject anything further than 1% off target.
        Some((error, dividers)) if error as u64 * 100 <= target_khz as u64 => Ok(dividers),
        _ => Err(GfxError::Unsupported),
    }
}

/// Smallest table entry at or above `required_khz`; a current CDCLK that
/// already covers the requirement is kept.
pub fn pick_cdclk(table: &[u32], required_khz: u32, current_khz: u32) -> Result<u32> {
    if current_khz >= required_khz && table.contains(&current_khz) {
        return Ok(current_khz);
    }
    table
        .iter()
        .copied()
        .find(|freq| *freq >= required_khz)
        .ok_or(GfxError::Busy)
}

pub const CDCLK_PER_EXTRA_PIPE_KHZ: u32 = 25_000;

/// CDCLK demanded by the fastest pixel clock at this pipe count.
pub fn required_cdclk(max_pixel_khz: u32, ratio_x10: u32, active_pipes: usize) -> u32 {
    let base = (max_pixel_khz as u64 * ratio_x10 as u64 / 10) as u32;
    let extra = active_pipes.saturating_sub(1) as u32 * CDCLK_PER_EXTRA_PIPE_KHZ;
    base + extra
}

/// Full per-pipe calculation for the check phase.
pub fn calc(
    mode: &DisplayMode,
    port_type: PortType,
    caps: PortCaps,
    ops: &dyn GenOps,
) -> Result<ClockParams> {
    if mode.pixel_clock == 0 || mode.width == 0 || mode.height == 0 {
        return Err(GfxError::BadValue);
    }
    let bits_per_component = 8;
    let wire_bytes = bits_per_component * 3 / 8;

    match port_type {
        PortType::Dp | PortType::Edp => {
            let (lane_count, rate) =
                select_dp_link(mode.pixel_clock, wire_bytes, caps, ops.dp_link_rates())?;
            Ok(ClockParams {
                port_type,
                adjusted_pixel_clock_khz: mode.pixel_clock,
                // The DP PLL runs at the link bit clock; pipes sharing it
                // only need the same VCO, not the same pixel clock.
                vco_khz: rate * 10,
                m: 0,
                n: 0,
                p: 0,
                lane_count,
                link_symbol_clock_khz: rate,
                bits_per_component,
            })
        }
        PortType::Hdmi | PortType::Dvi => {
            if mode.pixel_clock > ops.max_tmds_khz() {
                return Err(GfxError::Unsupported);
            }
            let dividers = compute_dpll(mode.pixel_clock, ops.dpll_limits())?;
            Ok(ClockParams {
                port_type,
                adjusted_pixel_clock_khz: mode.pixel_clock,
                vco_khz: dividers.vco_khz,
                m: dividers.m,
                n: dividers.n,
                p: dividers.p,
                lane_count: 0,
                link_symbol_clock_khz: 0,
                bits_per_component,
            })
        }
        PortType::Vga | PortType::Lvds => {
            let dividers = compute_dpll(mode.pixel_clock, ops.dpll_limits())?;
            Ok(ClockParams {
                port_type,
                adjusted_pixel_clock_khz: mode.pixel_clock,
                vco_khz: dividers.vco_khz,
                m: dividers.m,
                n: dividers.n,
                p: dividers.p,
                lane_count: 0,
                link_symbol_clock_khz: 0,
                bits_per_component,
            })
        }
    }
}

/// Two pipes may share one DPLL when their VCOs match; non-DP outputs also
/// need the exact same pixel clock.
pub fn dpll_compatible(a: &ClockParams, b: &ClockParams) -> bool {
    if a.vco_khz != b.vco_khz {
        return false;
    }
    let both_dp = a.port_type.is_dp_like() && b.port_type.is_dp_like();
    both_dp || a.adjusted_pixel_clock_khz == b.adjusted_pixel_clock_khz
}
