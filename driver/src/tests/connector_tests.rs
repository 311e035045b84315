// Connector, EDID, DPCD and hot-plug tests
#[cfg(test)]
mod tests {
    use crate::connector::{
        parse_edid, train_link, AuxChannel, Gmbus, Hotplug, DPCD_LANE0_1_STATUS,
        DPCD_LINK_BW_SET, DPCD_MAX_LANE_COUNT, DPCD_MAX_LINK_RATE,
    };
    use crate::tests::harness::{edid_1080p, rig};
    use crate::GfxError;

    #[test]
    fn gmbus_reads_the_edid_block() {
        let rig = rig();
        let gmbus = Gmbus::new(&*rig.hw);
        let edid = gmbus.read_edid(3).unwrap();
        assert_eq!(edid.len(), 128);
        assert_eq!(&edid[0..2], &[0x00, 0xFF]);
    }

    #[test]
    fn gmbus_surfaces_slave_timeouts() {
        let rig = rig();
        rig.hw.set_edid(None);
        let gmbus = Gmbus::new(&*rig.hw);
        assert_eq!(gmbus.read_edid(3).unwrap_err(), GfxError::IoError);
    }

    #[test]
    fn edid_parse_extracts_the_detailed_timing() {
        let (modes, preferred) = parse_edid(&edid_1080p());
        assert_eq!(modes.len(), 1);
        let mode = preferred.unwrap();
        assert_eq!((mode.width, mode.height), (1920, 1080));
        assert_eq!(mode.pixel_clock, 148_500);
        assert_eq!(mode.htotal, 2200);
        assert_eq!(mode.vtotal, 1125);
        assert_eq!(mode.hsync_start, 2008);
        assert_eq!(mode.hsync_end, 2052);
        assert_eq!(mode.refresh_rate, 60);
    }

    #[test]
    fn edid_parse_rejects_garbage() {
        let (modes, preferred) = parse_edid(&[0u8; 128]);
        assert!(modes.is_empty());
        assert!(preferred.is_none());
    }

    #[test]
    fn ports_probe_to_connected_with_modes() {
        let rig = rig();
        for port in rig.device.ports() {
            assert!(port.is_connected(), "port {:?}", port.desc.port_type);
            let state = port.state.lock();
            assert_eq!(state.modes.len(), 1);
            assert!(state.preferred_mode.is_some());
        }
        let info = rig.device.get_connector_info(3).unwrap();
        assert!(info.connected);
        assert_eq!(info.modes[0].width, 1920);
        assert!(info.edid.is_some());
    }

    #[test]
    fn dp_ports_cache_receiver_caps() {
        let rig = rig();
        let dp = rig.device.port_by_connector(3).unwrap();
        let caps = dp.caps();
        assert_eq!(caps.max_link_rate_khz, 540_000);
        assert_eq!(caps.max_lane_count, 4);
        // TMDS ports advertise no DP caps.
        let hdmi = rig.device.port_by_connector(2).unwrap();
        assert_eq!(hdmi.caps().max_lane_count, 0);
    }

    #[test]
    fn dpcd_writes_land_in_the_sink() {
        let rig = rig();
        let aux = AuxChannel::new(&*rig.hw, 1);
        aux.dpcd_write(DPCD_LINK_BW_SET, &[0x0A, 0x02]).unwrap();
        let mut back = [0u8; 2];
        aux.dpcd_read(DPCD_LINK_BW_SET, &mut back).unwrap();
        assert_eq!(back, [0x0A, 0x02]);
    }

    #[test]
    fn dpcd_read_spans_chunks() {
        let rig = rig();
        let aux = AuxChannel::new(&*rig.hw, 1);
        let mut caps = [0u8; 3];
        aux.dpcd_read(0, &mut caps).unwrap();
        assert_eq!(caps[DPCD_MAX_LINK_RATE as usize], 0x14);
        assert_eq!(caps[DPCD_MAX_LANE_COUNT as usize] & 0x1F, 4);
    }

    #[test]
    fn link_training_walks_both_patterns() {
        let rig = rig();
        train_link(&*rig.hw, 1, 2, 540_000).unwrap();
        // The sink saw the requested link configuration and the pattern
        // being cleared at the end.
        let aux = AuxChannel::new(&*rig.hw, 1);
        let mut set = [0u8; 3];
        aux.dpcd_read(DPCD_LINK_BW_SET, &mut set).unwrap();
        assert_eq!(set[0], 20); // 540,000 / 27,000
        assert_eq!(set[1] & 0x1F, 2);
        assert_eq!(set[2], 0x00);
    }

    #[test]
    fn link_training_fails_on_bad_lane_status() {
        let rig = rig();
        rig.hw.set_dpcd(DPCD_LANE0_1_STATUS as usize, 0x00);
        assert_eq!(
            train_link(&*rig.hw, 1, 2, 270_000).unwrap_err(),
            GfxError::IoError
        );
    }

    #[test]
    fn hotplug_mask_is_cleared_on_wake() {
        let hotplug = Hotplug::new();
        hotplug.post(4);
        hotplug.post(2);
        let mask = hotplug.wait_for_change(0, None).unwrap();
        assert_eq!(mask, (1 << 4) | (1 << 2));
        // Drained: an immediate re-poll sees nothing.
        assert_eq!(hotplug.wait_for_change(0, None).unwrap(), 0);
    }

    #[test]
    fn hotplug_wakes_a_blocked_waiter() {
        let rig = rig();
        let device = rig.device.clone();
        let waiter = std::thread::spawn(move || device.wait_for_display_change(u64::MAX));
        // Give the waiter time to block, then fire the HPD for port D.
        std::thread::sleep(std::time::Duration::from_millis(20));
        rig.device.hpd_event(4);
        let mask = waiter.join().unwrap().unwrap();
        assert_eq!(mask, 1 << 4);
        assert_eq!(rig.device.wait_for_display_change(0).unwrap(), 0);
    }

    #[test]
    fn hpd_event_reprobes_the_port() {
        let rig = rig();
        assert!(rig.device.port_by_connector(2).unwrap().is_connected());
        rig.hw.set_edid(None);
        rig.device.hpd_event(2);
        assert!(!rig.device.port_by_connector(2).unwrap().is_connected());
        let mask = rig.device.wait_for_display_change(0).unwrap();
        assert_eq!(mask, 1 << 2);
    }

    #[test]
    fn interrupted_wait_leaves_the_mask_intact() {
        let rig = rig();
        rig.device.post_signal();
        assert_eq!(
            rig.device.wait_for_display_change(u64::MAX).unwrap_err(),
            GfxError::Interrupted
        );
        rig.device.clear_signal();
        rig.device.hpd_event(1);
        assert_eq!(rig.device.wait_for_display_change(0).unwrap(), 1 << 1);
    }
}
