use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Capture buffers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-domain clamp band for a capture buffer capacity.
#[derive(Debug, Clone, Copy)]
pub struct CapacityBand {
    pub min: usize,
    pub max: usize,
}

impl CapacityBand {
    pub const CONSOLE: CapacityBand = CapacityBand { min: 10, max: 1000 };
    pub const NETWORK: CapacityBand = CapacityBand { min: 10, max: 2000 };
    pub const EVENTS: CapacityBand = CapacityBand { min: 10, max: 1000 };

    pub fn clamp(&self, requested: usize) -> usize {
        requested.clamp(self.min, self.max)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    #[serde(default = "d_100")]
    pub console_capacity: usize,
    #[serde(default = "d_200")]
    pub network_capacity: usize,
    #[serde(default = "d_100")]
    pub event_capacity: usize,
}

impl CaptureConfig {
    /// Capacities with the per-domain clamp bands applied.
    pub fn clamped(&self) -> CaptureConfig {
        CaptureConfig {
            console_capacity: CapacityBand::CONSOLE.clamp(self.console_capacity),
            network_capacity: CapacityBand::NETWORK.clamp(self.network_capacity),
            event_capacity: CapacityBand::EVENTS.clamp(self.event_capacity),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            console_capacity: 100,
            network_capacity: 200,
            event_capacity: 100,
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_100() -> usize {
    100
}
fn d_200() -> usize {
    200
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_band_bounds() {
        assert_eq!(CapacityBand::CONSOLE.clamp(5), 10);
        assert_eq!(CapacityBand::CONSOLE.clamp(100), 100);
        assert_eq!(CapacityBand::CONSOLE.clamp(5000), 1000);
    }

    #[test]
    fn clamped_config_applies_bands() {
        let cfg = CaptureConfig {
            console_capacity: 3,
            network_capacity: 9999,
            event_capacity: 100,
        };
        let clamped = cfg.clamped();
        assert_eq!(clamped.console_capacity, 10);
        assert_eq!(clamped.network_capacity, 2000);
        assert_eq!(clamped.event_capacity, 100);
    }
}
