// Force-wake power-well domains
//
// Display and GT registers are only guaranteed to decode while the matching
// power well is awake. Each domain carries a reference count; the 0 -> 1
// transition requests the wake and polls the ack bit, the 1 -> 0 transition
// lets hardware auto-sleep again. Multiple acquirers share a wake; this is
// not a mutual-exclusion lock.

use alloc::sync::Arc;
use spin::Mutex;

use crate::errors::Result;
use crate::mmio::{self, RegisterIo};
use crate::regs;

const ACK_TIMEOUT_MS: u64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForceWakeDomain {
    Render,
    Media,
    Display,
    /// Every domain at once; used by display commits.
    All,
}

const DOMAIN_COUNT: usize = 3;

fn domain_regs(index: usize) -> (u32, u32) {
    match index {
        0 => (regs::FORCEWAKE_REQ_RENDER, regs::FORCEWAKE_ACK_RENDER),
        1 => (regs::FORCEWAKE_REQ_MEDIA, regs::FORCEWAKE_ACK_MEDIA),
        _ => (regs::FORCEWAKE_REQ_DISPLAY, regs::FORCEWAKE_ACK_DISPLAY),
    }
}

fn domain_mask(domain: ForceWakeDomain) -> u8 {
    match domain {
        ForceWakeDomain::Render => 0b001,
        ForceWakeDomain::Media => 0b010,
        ForceWakeDomain::Display => 0b100,
        ForceWakeDomain::All => 0b111,
    }
}

pub struct ForceWake {
    io: Arc<dyn RegisterIo>,
    counts: Mutex<[u32; DOMAIN_COUNT]>,
}

impl ForceWake {
    pub fn new(io: Arc<dyn RegisterIo>) -> Self {
        Self {
            io,
            counts: Mutex::new([0; DOMAIN_COUNT]),
        }
    }

    /// Acquire a wake reference on `domain`, blocking up to 50 ms per
    /// underlying well for the hardware ack. The returned guard releases on
    /// drop, so every exit path of the caller gives the reference back.
    pub fn acquire(&self, domain: ForceWakeDomain) -> Result<ForceWakeGuard<'_>> {
        let mask = domain_mask(domain);
        let mut woken: u8 = 0;
        let mut counts = self.counts.lock();
        for index in 0..DOMAIN_COUNT {
            if mask & (1 << index) == 0 {
                continue;
            }
            counts[index] += 1;
            if counts[index] == 1 {
                if let Err(e) = self.wake_well(index) {
                    // Unwind everything taken so far in this call.
                    counts[index] -= 1;
                    for prev in 0..DOMAIN_COUNT {
                        if woken & (1 << prev) != 0 {
                            counts[prev] -= 1;
                            if counts[prev] == 0 {
                                self.sleep_well(prev);
                            }
                        }
                    }
                    return Err(e);
                }
            }
            woken |= 1 << index;
        }
        Ok(ForceWakeGuard { fw: self, mask })
    }

    fn wake_well(&self, index: usize) -> Result<()> {
        let (req, ack) = domain_regs(index);
        self.io
            .write32(req, regs::masked_bit_enable(regs::FORCEWAKE_KERNEL_BIT));
        self.io.posting_read(req);
        mmio::wait_for_set(&*self.io, ack, regs::FORCEWAKE_KERNEL_BIT, ACK_TIMEOUT_MS)
    }

    fn sleep_well(&self, index: usize) {
        let (req, _) = domain_regs(index);
        self.io
            .write32(req, regs::masked_bit_disable(regs::FORCEWAKE_KERNEL_BIT));
        self.io.posting_read(req);
    }

    fn release_mask(&self, mask: u8) {
        let mut counts = self.counts.lock();
        for index in 0..DOMAIN_COUNT {
            if mask & (1 << index) == 0 {
                continue;
            }
            debug_assert!(counts[index] > 0);
            counts[index] -= 1;
            if counts[index] == 0 {
                self.sleep_well(index);
            }
        }
    }

    #[cfg(test)]
    pub fn reference_count(&self, domain: ForceWakeDomain) -> u32 {
        let counts = self.counts.lock();
        let mask = domain_mask(domain);
        (0..DOMAIN_COUNT)
            .filter(|i| mask & (1 << i) != 0)
            .map(|i| counts[i])
            .max()
            .unwrap_or(0)
    }
}

pub struct ForceWakeGuard<'a> {
    fw: &'a ForceWake,
    mask: u8,
}

impl Drop for ForceWakeGuard<'_> {
    fn drop(&mut self) {
        self.fw.release_mask(self.mask);
    }
}
