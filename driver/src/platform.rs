// Per-generation hardware description
//
// Gen7/7.5/8/9 differ in CDCLK tables, DPLL pools and programming, fence
// format/count and context-image layout. One vtable instance is selected
// from the PCI device id at open time so hot paths never branch on the
// generation.

use crate::regs;
use crate::{EngineId, Generation, PAGE_SIZE};

/// Divider search window for the exhaustive DPLL calculation.
pub struct DpllLimits {
    pub ref_khz: u32,
    pub vco_min_khz: u32,
    pub vco_max_khz: u32,
    pub n_min: u32,
    pub n_max: u32,
    pub m_min: u32,
    pub m_max: u32,
    pub p_values: &'static [u32],
}

pub trait GenOps: Send + Sync {
    fn generation(&self) -> Generation;
    fn name(&self) -> &'static str;
    fn pipe_count(&self) -> usize;
    fn dpll_count(&self) -> usize;
    fn fence_register_count(&self) -> usize;
    fn context_image_bytes(&self, engine: EngineId) -> usize;

    /// Valid CDCLK operating points, ascending, in kHz.
    fn cdclk_table(&self) -> &'static [u32];
    /// Required CDCLK headroom over the fastest pixel clock, times ten.
    fn cdclk_ratio_x10(&self, active_pipes: usize) -> u32;
    /// Frequency-select field for the CDCLK control register.
    fn cdclk_ctl_field(&self, cdclk_khz: u32) -> u32;

    fn max_tmds_khz(&self) -> u32;
    fn dp_link_rates(&self) -> &'static [u32];
    fn dpll_limits(&self) -> &'static DpllLimits;
    fn dpll_ctl_reg(&self, index: usize) -> u32;

    /// Nominal memory-controller bandwidth in kB/s.
    fn memory_bandwidth_kbps(&self) -> u64;
}

const DP_RATES_HBR2: [u32; 3] = [162_000, 270_000, 540_000];
const DP_RATES_HBR3: [u32; 4] = [162_000, 270_000, 540_000, 810_000];

const GEN7_CDCLK: [u32; 4] = [337_500, 400_000, 450_000, 540_000];
const GEN75_CDCLK: [u32; 4] = [337_500, 450_000, 540_000, 675_000];
const GEN9_CDCLK: [u32; 7] = [
    308_570, 337_500, 432_000, 450_000, 540_000, 617_140, 675_000,
];

const GEN7_DPLL_LIMITS: DpllLimits = DpllLimits {
    ref_khz: 120_000,
    vco_min_khz: 1_760_000,
    vco_max_khz: 3_510_000,
    n_min: 1,
    n_max: 5,
    m_min: 40,
    m_max: 160,
    p_values: &[2, 4, 6, 8, 10, 12, 14, 16, 20, 24, 28, 32, 40, 48, 56, 64, 80, 112],
};

const GEN9_DPLL_LIMITS: DpllLimits = DpllLimits {
    ref_khz: 24_000,
    vco_min_khz: 7_998_000,
    vco_max_khz: 8_640_000,
    n_min: 1,
    n_max: 4,
    m_min: 300,
    m_max: 400,
    p_values: &[2, 4, 6, 8, 10, 12, 14, 16, 20, 24],
};

fn cdclk_field_from_table(table: &[u32], cdclk_khz: u32) -> u32 {
    let sel = table
        .iter()
        .position(|freq| *freq == cdclk_khz)
        .unwrap_or(0) as u32;
    sel << regs::CDCLK_FREQ_SEL_SHIFT
}

// Dual-channel DDR3-1600 class memory subsystem.
const NOMINAL_BANDWIDTH_KBPS: u64 = 25_600_000;

struct Gen7Ops;

impl GenOps for Gen7Ops {
    fn generation(&self) -> Generation {
        Generation::Gen7
    }

    fn name(&self) -> &'static str {
        "Ivy Bridge"
    }

    fn pipe_count(&self) -> usize {
        3
    }

    fn dpll_count(&self) -> usize {
        2
    }

    fn fence_register_count(&self) -> usize {
        16
    }

    fn context_image_bytes(&self, _engine: EngineId) -> usize {
        PAGE_SIZE
    }

    fn cdclk_table(&self) -> &'static [u32] {
        &GEN7_CDCLK
    }

    fn cdclk_ratio_x10(&self, _active_pipes: usize) -> u32 {
        15
    }

    fn cdclk_ctl_field(&self, cdclk_khz: u32) -> u32 {
        cdclk_field_from_table(&GEN7_CDCLK, cdclk_khz)
    }

    fn max_tmds_khz(&self) -> u32 {
        225_000
    }

    fn dp_link_rates(&self) -> &'static [u32] {
        &DP_RATES_HBR2
    }

    fn dpll_limits(&self) -> &'static DpllLimits {
        &GEN7_DPLL_LIMITS
    }

    fn dpll_ctl_reg(&self, index: usize) -> u32 {
        regs::pch_dpll_ctl(index)
    }

    fn memory_bandwidth_kbps(&self) -> u64 {
        NOMINAL_BANDWIDTH_KBPS
    }
}

struct Gen75Ops;

impl GenOps for Gen75Ops {
    fn generation(&self) -> Generation {
        Generation::Gen75
    }

    fn name(&self) -> &'static str {
        "Haswell"
    }

    fn pipe_count(&self) -> usize {
        3
    }

    fn dpll_count(&self) -> usize {
        2
    }

    fn fence_register_count(&self) -> usize {
        16
    }

    fn context_image_bytes(&self, _engine: EngineId) -> usize {
        PAGE_SIZE
    }

    fn cdclk_table(&self) -> &'static [u32] {
        &GEN75_CDCLK
    }

    fn cdclk_ratio_x10(&self, active_pipes: usize) -> u32 {
        if active_pipes > 1 {
            18
        } else {
            15
        }
    }

    fn cdclk_ctl_field(&self, cdclk_khz: u32) -> u32 {
        cdclk_field_from_table(&GEN75_CDCLK, cdclk_khz)
    }

    fn max_tmds_khz(&self) -> u32 {
        300_000
    }

    fn dp_link_rates(&self) -> &'static [u32] {
        &DP_RATES_HBR2
    }

    fn dpll_limits(&self) -> &'static DpllLimits {
        &GEN7_DPLL_LIMITS
    }

    fn dpll_ctl_reg(&self, index: usize) -> u32 {
        regs::wrpll_ctl(index)
    }

    fn memory_bandwidth_kbps(&self) -> u64 {
        NOMINAL_BANDWIDTH_KBPS
    }
}

struct Gen8Ops;

impl GenOps for Gen8Ops {
    fn generation(&self) -> Generation {
        Generation::Gen8
    }

    fn name(&self) -> &'static str {
        "Broadwell"
    }

    fn pipe_count(&self) -> usize {
        3
    }

    fn dpll_count(&self) -> usize {
        3
    }

    fn fence_register_count(&self) -> usize {
        32
    }

    fn context_image_bytes(&self, _engine: EngineId) -> usize {
        5 * PAGE_SIZE
    }

    fn cdclk_table(&self) -> &'static [u32] {
        &GEN75_CDCLK
    }

    fn cdclk_ratio_x10(&self, active_pipes: usize) -> u32 {
        if active_pipes > 1 {
            18
        } else {
            15
        }
    }

    fn cdclk_ctl_field(&self, cdclk_khz: u32) -> u32 {
        cdclk_field_from_table(&GEN75_CDCLK, cdclk_khz)
    }

    fn max_tmds_khz(&self) -> u32 {
        300_000
    }

    fn dp_link_rates(&self) -> &'static [u32] {
        &DP_RATES_HBR2
    }

    fn dpll_limits(&self) -> &'static DpllLimits {
        &GEN7_DPLL_LIMITS
    }

    fn dpll_ctl_reg(&self, index: usize) -> u32 {
        regs::wrpll_ctl(index)
    }

    fn memory_bandwidth_kbps(&self) -> u64 {
        NOMINAL_BANDWIDTH_KBPS
    }
}

struct Gen9Ops;

impl GenOps for Gen9Ops {
    fn generation(&self) -> Generation {
        Generation::Gen9
    }

    fn name(&self) -> &'static str {
        "Skylake"
    }

    fn pipe_count(&self) -> usize {
        3
    }

    fn dpll_count(&self) -> usize {
        4
    }

    fn fence_register_count(&self) -> usize {
        0
    }

    fn context_image_bytes(&self, _engine: EngineId) -> usize {
        5 * PAGE_SIZE
    }

    fn cdclk_table(&self) -> &'static [u32] {
        &GEN9_CDCLK
    }

    fn cdclk_ratio_x10(&self, active_pipes: usize) -> u32 {
        if active_pipes > 1 {
            20
        } else {
            15
        }
    }

    fn cdclk_ctl_field(&self, cdclk_khz: u32) -> u32 {
        cdclk_field_from_table(&GEN9_CDCLK, cdclk_khz)
    }

    fn max_tmds_khz(&self) -> u32 {
        300_000
    }

    fn dp_link_rates(&self) -> &'static [u32] {
        &DP_RATES_HBR3
    }

    fn dpll_limits(&self) -> &'static DpllLimits {
        &GEN9_DPLL_LIMITS
    }

    fn dpll_ctl_reg(&self, index: usize) -> u32 {
        regs::wrpll_ctl(index)
    }

    fn memory_bandwidth_kbps(&self) -> u64 {
        NOMINAL_BANDWIDTH_KBPS
    }
}

static GEN7_OPS: Gen7Ops = Gen7Ops;
static GEN75_OPS: Gen75Ops = Gen75Ops;
static GEN8_OPS: Gen8Ops = Gen8Ops;
static GEN9_OPS: Gen9Ops = Gen9Ops;

pub fn ops_for(generation: Generation) -> &'static dyn GenOps {
    match generation {
        Generation::Gen7 => &GEN7_OPS,
        Generation::Gen75 => &GEN75_OPS,
        Generation::Gen8 => &GEN8_OPS,
        Generation::Gen9 => &GEN9_OPS,
    }
}
