//! The per-tick metrics record and its quality assessments
//!
//! [`SensorMetrics`] is produced once per acquisition tick and only ever copied
//! afterwards: into the latest-value cell for the UI, into the persistence
//! queue, and into the pre-event buffer.

use crate::analytics::{FlowStats, LevelStats};
use crate::sensors::{LevelReading, PERIOD_HISTORY, PulseJitter};

/// Point-in-time record of everything the pipeline derived in one tick.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SensorMetrics {
    /// Wall-clock time, milliseconds since the Unix epoch
    pub timestamp_ms: i64,
    /// Pulses counted during this tick
    pub pulses: u32,
    /// Pulse counter at the end of this tick
    pub pulse_total: u32,
    pub flow: FlowStats,
    pub level: LevelStats,
    /// Raw sampler output behind `level`
    pub reading: LevelReading,
    pub jitter: PulseJitter,
    /// Recent inter-pulse periods, oldest first; `jitter.count` are valid
    pub periods_us: [u32; PERIOD_HISTORY],
    /// Density ratio in effect for this tick
    pub density_ratio: f32,
    /// Pulses stopped for longer than the stall window while the pump had a baseline
    pub flow_stalled: bool,
}

impl SensorMetrics {
    pub fn pump_on(&self) -> bool {
        self.flow.pump_on
    }

    pub fn noise_quality(&self) -> NoiseQuality {
        NoiseQuality::assess(self.reading.noise_pct)
    }

    pub fn flow_health(&self) -> FlowHealth {
        FlowHealth::assess(&self.flow)
    }
}

/// Qualitative grade of the level signal noise
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoiseQuality {
    /// Below 2 %
    Good,
    /// Below 5 %
    Fair,
    Poor,
}

impl NoiseQuality {
    pub fn assess(noise_pct: f32) -> Self {
        if noise_pct < 2.0 {
            Self::Good
        } else if noise_pct < 5.0 {
            Self::Fair
        } else {
            Self::Poor
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::Good => "good",
            Self::Fair => "fair",
            Self::Poor => "poor",
        }
    }
}

/// Where the instantaneous flow sits relative to the learned healthy band
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowHealth {
    /// Pump not running
    Idle,
    /// At or above the minimum-healthy flow, or no band learned yet
    Healthy,
    /// Below minimum-healthy but above half of it
    Degraded,
    Low,
}

impl FlowHealth {
    pub fn assess(flow: &FlowStats) -> Self {
        if !flow.pump_on {
            return Self::Idle;
        }
        if flow.min_healthy <= 0.0 || flow.instantaneous >= flow.min_healthy {
            Self::Healthy
        } else if flow.instantaneous >= flow.min_healthy * 0.5 {
            Self::Degraded
        } else {
            Self::Low
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Low => "low",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noise_thresholds() {
        assert_eq!(NoiseQuality::assess(0.0), NoiseQuality::Good);
        assert_eq!(NoiseQuality::assess(1.99), NoiseQuality::Good);
        assert_eq!(NoiseQuality::assess(2.0), NoiseQuality::Fair);
        assert_eq!(NoiseQuality::assess(4.99), NoiseQuality::Fair);
        assert_eq!(NoiseQuality::assess(5.0), NoiseQuality::Poor);
    }

    #[test]
    fn test_flow_health_band() {
        let mut flow = FlowStats {
            pump_on: true,
            min_healthy: 2.0,
            instantaneous: 2.5,
            ..FlowStats::default()
        };
        assert_eq!(FlowHealth::assess(&flow), FlowHealth::Healthy);
        flow.instantaneous = 1.2;
        assert_eq!(FlowHealth::assess(&flow), FlowHealth::Degraded);
        flow.instantaneous = 0.4;
        assert_eq!(FlowHealth::assess(&flow), FlowHealth::Low);
        flow.pump_on = false;
        assert_eq!(FlowHealth::assess(&flow), FlowHealth::Idle);
    }

    #[test]
    fn test_unlearned_band_is_healthy() {
        let flow = FlowStats {
            pump_on: true,
            instantaneous: 0.1,
            ..FlowStats::default()
        };
        assert_eq!(FlowHealth::assess(&flow), FlowHealth::Healthy);
    }
}
