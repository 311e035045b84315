// Ring engine tests
#[cfg(test)]
mod tests {
    use crate::engine::{
        HWSP_SEQNO_INDEX, MI_FLUSH, MI_STORE_DATA_INDEX, PIPE_CONTROL, RING_BYTES,
    };
    use crate::tests::harness::{rig, signal_seqno};
    use crate::{EngineId, GfxError};
    use alloc::vec::Vec;

    #[test]
    fn emit_writes_dwords_and_advances_tail() {
        let rig = rig();
        let engine = rig.device.engine(EngineId::Rcs);
        let base = crate::regs::ring_base(EngineId::Rcs);

        let dwords = [0x1111_1111u32, 0x2222_2222, 0x3333_3333, 0x4444_4444];
        engine.emit(&dwords).unwrap();

        assert_eq!(engine.tail(), 16);
        assert_eq!(rig.hw.reg(base + crate::regs::RING_TAIL), 16);
        let ring = engine.ring_bo().cpu_map().unwrap().as_u64() as *const u32;
        for (i, dword) in dwords.iter().enumerate() {
            assert_eq!(unsafe { ring.add(i).read_volatile() }, *dword);
        }
    }

    #[test]
    fn emit_wraps_at_ring_end() {
        let rig = rig();
        let engine = rig.device.engine(EngineId::Bcs);
        // March the tail to eight bytes before the end, then emit across it.
        let filler: Vec<u32> = alloc::vec![0; RING_BYTES / 4 - 2];
        engine.emit(&filler).unwrap();
        engine
            .emit(&[0xAAAA_0001, 0xAAAA_0002, 0xAAAA_0003])
            .unwrap();
        assert_eq!(engine.tail(), 4);
        let ring = engine.ring_bo().cpu_map().unwrap().as_u64() as *const u32;
        unsafe {
            assert_eq!(ring.add(RING_BYTES / 4 - 2).read_volatile(), 0xAAAA_0001);
            assert_eq!(ring.add(RING_BYTES / 4 - 1).read_volatile(), 0xAAAA_0002);
            assert_eq!(ring.read_volatile(), 0xAAAA_0003);
        }
    }

    #[test]
    fn oversized_emit_is_rejected() {
        let rig = rig();
        let engine = rig.device.engine(EngineId::Rcs);
        let too_big: Vec<u32> = alloc::vec![0; RING_BYTES / 4];
        assert_eq!(engine.emit(&too_big).unwrap_err(), GfxError::BadValue);
    }

    #[test]
    fn seqnos_are_monotone() {
        let rig = rig();
        let engine = rig.device.engine(EngineId::Rcs);
        let a = engine.mint_seqno();
        let b = engine.mint_seqno();
        assert!(b > a);
    }

    #[test]
    fn completed_seqno_reads_the_status_page() {
        let rig = rig();
        let engine = rig.device.engine(EngineId::Vcs);
        assert_eq!(engine.completed_seqno(), 0);
        signal_seqno(&rig, EngineId::Vcs, 41);
        assert_eq!(engine.completed_seqno(), 41);
    }

    #[test]
    fn wait_seqno_completes_and_times_out() {
        let rig = rig();
        let engine = rig.device.engine(EngineId::Rcs);
        signal_seqno(&rig, EngineId::Rcs, 10);
        engine.wait_seqno(10, 1_000, None).unwrap();
        engine.wait_seqno(9, 1_000, None).unwrap();
        assert_eq!(
            engine.wait_seqno(11, 1_000, None).unwrap_err(),
            GfxError::TimedOut
        );
    }

    #[test]
    fn hwsp_address_points_at_the_seqno_dword() {
        let rig = rig();
        let engine = rig.device.engine(EngineId::Rcs);
        let hwsp_gtt = engine.hwsp_bo().gtt_address().unwrap();
        assert_eq!(
            engine.hwsp_seqno_gtt_address(),
            hwsp_gtt + (HWSP_SEQNO_INDEX * 4) as u64
        );
    }

    #[test]
    fn seqno_store_uses_pipe_control_only_on_render() {
        let rig = rig();
        let mut rcs = Vec::new();
        rig.device
            .engine(EngineId::Rcs)
            .seqno_store_commands(77, &mut rcs);
        assert_eq!(rcs[0], PIPE_CONTROL);
        assert!(rcs.contains(&77));

        let mut bcs = Vec::new();
        rig.device
            .engine(EngineId::Bcs)
            .seqno_store_commands(78, &mut bcs);
        assert_eq!(bcs[0], MI_FLUSH);
        assert_eq!(bcs[1], MI_STORE_DATA_INDEX);
        assert_eq!(bcs[2], (HWSP_SEQNO_INDEX * 4) as u32);
        assert_eq!(bcs[3], 78);
    }

    #[test]
    fn ring_registers_are_programmed_at_init() {
        let rig = rig();
        for id in [EngineId::Rcs, EngineId::Bcs, EngineId::Vcs, EngineId::Vecs] {
            let base = crate::regs::ring_base(id);
            let ctl = rig.hw.reg(base + crate::regs::RING_CTL);
            assert_ne!(ctl & crate::regs::RING_CTL_ENABLE, 0);
            let start = rig.hw.reg(base + crate::regs::RING_START);
            assert_eq!(
                start as u64,
                rig.device.engine(id).ring_bo().gtt_address().unwrap()
            );
        }
    }
}
