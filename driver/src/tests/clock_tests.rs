// Clock calculation tests
#[cfg(test)]
mod tests {
    use crate::clocks::{
        calc, compute_dpll, dp_link_capacity_kbps, dpll_compatible, pick_cdclk, required_cdclk,
        select_dp_link, PortCaps,
    };
    use crate::platform::ops_for;
    use crate::tests::harness::{mode_1080p, mode_1440p, mode_800x600};
    use crate::{Generation, GfxError, PortType};

    fn hbr2_caps() -> PortCaps {
        PortCaps {
            max_link_rate_khz: 540_000,
            max_lane_count: 4,
        }
    }

    #[test]
    fn link_capacity_applies_channel_coding() {
        // 8b/10b: 270 MHz symbol clock carries 216,000 kB/s per lane.
        assert_eq!(dp_link_capacity_kbps(270_000, 1), 216_000);
        assert_eq!(dp_link_capacity_kbps(270_000, 4), 864_000);
        // 128b/132b at HBR3.
        assert_eq!(dp_link_capacity_kbps(810_000, 1), 810_000 * 2 * 128 / 132 / 8);
    }

    #[test]
    fn dp_link_selection_prefers_fewest_lanes_then_lowest_rate() {
        let ops = ops_for(Generation::Gen75);
        // 1080p at 3 B/px needs 445,500 kB/s: two lanes of HBR2.
        let (lanes, rate) =
            select_dp_link(148_500, 3, hbr2_caps(), ops.dp_link_rates()).unwrap();
        assert_eq!((lanes, rate), (2, 540_000));

        // A modest stream fits one RBR lane.
        let (lanes, rate) = select_dp_link(40_000, 3, hbr2_caps(), ops.dp_link_rates()).unwrap();
        assert_eq!((lanes, rate), (1, 162_000));
    }

    #[test]
    fn dp_link_selection_respects_sink_limits() {
        let ops = ops_for(Generation::Gen75);
        let caps = PortCaps {
            max_link_rate_khz: 270_000,
            max_lane_count: 2,
        };
        // 2,112,000 kHz * 3 B far exceeds 2 lanes of HBR.
        assert_eq!(
            select_dp_link(2_112_000, 3, caps, ops.dp_link_rates()).unwrap_err(),
            GfxError::Busy
        );
    }

    #[test]
    fn dpll_search_lands_within_one_percent() {
        let limits = ops_for(Generation::Gen7).dpll_limits();
        for target in [40_000u32, 108_000, 148_500, 241_500] {
            let d = compute_dpll(target, limits).unwrap();
            let dot = d.vco_khz / d.p;
            assert!(dot.abs_diff(target) as u64 * 100 <= target as u64);
            assert!(d.vco_khz >= limits.vco_min_khz && d.vco_khz <= limits.vco_max_khz);
        }
    }

    #[test]
    fn dpll_search_rejects_unreachable_targets() {
        let limits = ops_for(Generation::Gen7).dpll_limits();
        assert_eq!(compute_dpll(0, limits).unwrap_err(), GfxError::BadValue);
        assert_eq!(compute_dpll(5_000, limits).unwrap_err(), GfxError::Unsupported);
    }

    #[test]
    fn cdclk_pick_keeps_adequate_current_value() {
        let table = ops_for(Generation::Gen75).cdclk_table();
        assert_eq!(pick_cdclk(table, 200_000, 450_000).unwrap(), 450_000);
        assert_eq!(pick_cdclk(table, 500_000, 450_000).unwrap(), 540_000);
        assert_eq!(pick_cdclk(table, 700_000, 450_000).unwrap_err(), GfxError::Busy);
    }

    #[test]
    fn required_cdclk_adds_per_pipe_allowance() {
        assert_eq!(required_cdclk(148_500, 15, 1), 222_750);
        assert_eq!(required_cdclk(148_500, 15, 3), 222_750 + 2 * 25_000);
    }

    #[test]
    fn hdmi_over_tmds_ceiling_is_unsupported() {
        let ops = ops_for(Generation::Gen7); // 225 MHz ceiling
        let mut mode = mode_1440p();
        mode.pixel_clock = 241_500;
        assert_eq!(
            calc(&mode, PortType::Hdmi, PortCaps::none(), ops).unwrap_err(),
            GfxError::Unsupported
        );
    }

    #[test]
    fn hdmi_calc_produces_dividers_dp_calc_produces_link() {
        let ops = ops_for(Generation::Gen75);
        let hdmi = calc(&mode_1080p(), PortType::Hdmi, PortCaps::none(), ops).unwrap();
        assert_eq!(hdmi.adjusted_pixel_clock_khz, 148_500);
        assert!(hdmi.p > 0 && hdmi.m > 0);
        assert_eq!(hdmi.lane_count, 0);

        let dp = calc(&mode_1080p(), PortType::Dp, hbr2_caps(), ops).unwrap();
        assert_eq!(dp.lane_count, 2);
        assert_eq!(dp.link_symbol_clock_khz, 540_000);
        assert_eq!(dp.vco_khz, 5_400_000);
    }

    #[test]
    fn dpll_sharing_relaxes_pixel_clock_only_for_dp() {
        let ops = ops_for(Generation::Gen75);
        let dp_a = calc(&mode_1080p(), PortType::Dp, hbr2_caps(), ops).unwrap();
        let mut dp_b = calc(&mode_1440p(), PortType::Dp, hbr2_caps(), ops).unwrap();
        // Force the same link rate; pixel clocks differ.
        dp_b.vco_khz = dp_a.vco_khz;
        assert!(dpll_compatible(&dp_a, &dp_b));

        let hdmi_a = calc(&mode_1080p(), PortType::Hdmi, PortCaps::none(), ops).unwrap();
        let mut hdmi_b = hdmi_a;
        hdmi_b.adjusted_pixel_clock_khz += 1_000;
        assert!(!dpll_compatible(&hdmi_a, &hdmi_b));
        hdmi_b = hdmi_a;
        assert!(dpll_compatible(&hdmi_a, &hdmi_b));

        let hdmi_800 = calc(&mode_800x600(), PortType::Hdmi, PortCaps::none(), ops).unwrap();
        assert!(!dpll_compatible(&hdmi_a, &hdmi_800));
    }
}
