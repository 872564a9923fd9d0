use serde::{Deserialize, Serialize};

/// Tunables of the arbitration.
///
/// There is no universally right confirmation depth, which is why these are
/// parameters rather than constants.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Confirmations after which a claim transaction is considered
    /// irreversible and its resolver terminal.
    pub safety_depth: u32,
    /// Confirmations of the closing transaction before it is acted upon.
    pub close_confirmation_depth: u32,
    pub fees: FeePolicy,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            safety_depth: 6,
            close_confirmation_depth: 1,
            fees: FeePolicy::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeePolicy {
    pub sat_per_vbyte: u64,
    pub max_sat_per_vbyte: u64,
    /// Increase of the fee rate per bump.
    pub escalation_percent: u64,
    /// Blocks to wait for a claim to confirm before bumping its fee.
    pub bump_interval: u32,
}

impl FeePolicy {
    /// Fee rate of the `step`-th bump, never above `max_sat_per_vbyte`.
    pub fn rate(&self, step: u32) -> u64 {
        let mut rate = self.sat_per_vbyte.min(self.max_sat_per_vbyte);

        for _ in 0..step {
            if rate >= self.max_sat_per_vbyte {
                break;
            }
            let escalated = rate.saturating_mul(100 + self.escalation_percent) / 100;
            rate = escalated.max(rate + 1).min(self.max_sat_per_vbyte);
        }

        rate
    }
}

impl Default for FeePolicy {
    fn default() -> Self {
        FeePolicy {
            sat_per_vbyte: 2,
            max_sat_per_vbyte: 100,
            escalation_percent: 25,
            bump_interval: 6,
        }
    }
}
