//! Bandwidth-derived per-session packet caps.

use crate::config::ServerConfig;

/// Average packet size assumed when turning a byte budget into a packet
/// budget: one KB/s buys 128 packets per second.
const PACKETS_PER_KB: u64 = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Throttle {
    packets_per_tick: usize,
    bandwidth_per_tick: usize,
    idle_cap: usize,
}

impl Throttle {
    pub fn new(config: &ServerConfig) -> Self {
        let ticks = config.ticks_per_second.max(1) as u64;
        Throttle {
            packets_per_tick: (config.packets_per_second as u64 / ticks) as usize,
            bandwidth_per_tick: (config.upload_kbps as u64 * PACKETS_PER_KB / ticks) as usize,
            idle_cap: config.idle_packet_cap,
        }
    }

    pub fn packets_per_tick(&self) -> usize {
        self.packets_per_tick
    }

    /// Packets each session may send per cycle with `active` players sharing
    /// the upstream budget. Never exceeds the per-tick packet limit and never
    /// drops to zero.
    pub fn cap_for(&self, active: usize) -> usize {
        let share = match active {
            0 => self.idle_cap,
            active => self.bandwidth_per_tick / active,
        };
        share.min(self.packets_per_tick).max(1)
    }
}
