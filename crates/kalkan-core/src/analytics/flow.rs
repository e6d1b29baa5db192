//! Flow-rate analytics: pump state, adaptive healthy-flow baseline and summary stats

use log::info;

use super::{StatWindow, blend, percent_diff};

/// Recent samples kept per window
pub const FLOW_WINDOW: usize = 120;

/// Tunable flow analytics constants.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlowTuning {
    /// Flow above this (L/s) means the pump is likely running
    pub pump_threshold_lps: f32,
    /// Consecutive below-threshold ticks before the pump counts as off
    pub off_debounce_ticks: u16,
    /// Blend factor pulling baseline and minimum-healthy toward their targets
    pub blend_alpha: f32,
    pub baseline_percentile: f32,
    pub min_healthy_percentile: f32,
}

impl Default for FlowTuning {
    fn default() -> Self {
        Self {
            pump_threshold_lps: 0.05,
            off_debounce_ticks: 5,
            blend_alpha: 0.05,
            baseline_percentile: 90.0,
            min_healthy_percentile: 10.0,
        }
    }
}

/// Output of one flow analytics update, all rates in L/s.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FlowStats {
    pub instantaneous: f32,
    /// Healthy flow while pumping, zero until learned
    pub baseline: f32,
    /// Lower edge of the healthy band, zero until learned
    pub min_healthy: f32,
    /// Instantaneous vs. baseline in percent
    pub diff_pct: f32,
    pub mean: f32,
    pub median: f32,
    pub stddev: f32,
    pub min: f32,
    pub max: f32,
    pub pump_on: bool,
}

pub struct FlowAnalytics {
    tuning: FlowTuning,
    overall: StatWindow<FLOW_WINDOW>,
    pumping: StatWindow<FLOW_WINDOW>,
    baseline: Option<f32>,
    min_healthy: Option<f32>,
    pump_on: bool,
    below_ticks: u16,
}

impl FlowAnalytics {
    pub fn new(tuning: FlowTuning) -> Self {
        Self {
            tuning,
            overall: StatWindow::new(),
            pumping: StatWindow::new(),
            baseline: None,
            min_healthy: None,
            pump_on: false,
            below_ticks: 0,
        }
    }

    pub fn update(&mut self, flow_lps: f32) -> FlowStats {
        let flow = if flow_lps.is_finite() { flow_lps } else { 0.0 };
        self.overall.push(flow);

        if flow > self.tuning.pump_threshold_lps {
            if !self.pump_on {
                info!("flow: pump running ({:.3} L/s)", flow);
            }
            self.pump_on = true;
            self.below_ticks = 0;

            self.pumping.push(flow);
            let target = self.pumping.percentile(self.tuning.baseline_percentile);
            self.baseline = Some(blend(self.baseline, target, self.tuning.blend_alpha));
            let target = self.pumping.percentile(self.tuning.min_healthy_percentile);
            self.min_healthy = Some(blend(self.min_healthy, target, self.tuning.blend_alpha));
        } else {
            self.below_ticks = self.below_ticks.saturating_add(1);
            if self.pump_on && self.below_ticks >= self.tuning.off_debounce_ticks {
                info!("flow: pump stopped");
                self.pump_on = false;
            }
        }

        let baseline = self.baseline.unwrap_or(0.0);
        FlowStats {
            instantaneous: flow,
            baseline,
            min_healthy: self.min_healthy.unwrap_or(0.0),
            diff_pct: percent_diff(flow, baseline),
            mean: self.overall.mean(),
            median: self.overall.median(),
            stddev: self.overall.stddev(),
            min: self.overall.min(),
            max: self.overall.max(),
            pump_on: self.pump_on,
        }
    }

    pub fn pump_on(&self) -> bool {
        self.pump_on
    }

    /// A baseline exists once the pump has been seen running.
    pub fn has_baseline(&self) -> bool {
        self.baseline.is_some()
    }

    /// Forget everything learned so far.
    pub fn reset(&mut self) {
        *self = Self::new(self.tuning);
    }
}

impl Default for FlowAnalytics {
    fn default() -> Self {
        Self::new(FlowTuning::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pump_on_is_immediate_off_is_debounced() {
        let mut flow = FlowAnalytics::default();
        assert!(!flow.update(0.0).pump_on);
        assert!(flow.update(1.0).pump_on, "Pump should switch on at once");

        for tick in 1..5 {
            assert!(flow.update(0.0).pump_on, "Pump dropped out after {} idle ticks", tick);
        }
        assert!(!flow.update(0.0).pump_on, "Pump should be off after 5 idle ticks");
    }

    #[test]
    fn test_pulsation_does_not_flap() {
        let mut flow = FlowAnalytics::default();
        for i in 0..50 {
            let sample = if i % 3 == 0 { 0.0 } else { 2.0 };
            assert!(flow.update(sample).pump_on || i == 0);
        }
    }

    #[test]
    fn test_baseline_blends_instead_of_snapping() {
        let mut flow = FlowAnalytics::default();
        for _ in 0..50 {
            flow.update(2.0);
        }
        let settled = flow.update(2.0);
        assert!((settled.baseline - 2.0).abs() < 1e-4);

        // One spike barely moves the baseline
        let spiked = flow.update(20.0);
        assert!(spiked.baseline < 3.0, "Baseline jumped to {}", spiked.baseline);
        assert!(spiked.diff_pct > 500.0);
    }

    #[test]
    fn test_idle_samples_do_not_teach_baseline() {
        let mut flow = FlowAnalytics::default();
        for _ in 0..20 {
            flow.update(1.5);
        }
        let before = flow.update(1.5).baseline;
        for _ in 0..100 {
            flow.update(0.01);
        }
        let after = flow.update(0.01);
        assert_eq!(after.baseline, before);
        assert!(after.diff_pct < -99.0);
    }

    #[test]
    fn test_no_baseline_means_zero_diff() {
        let mut flow = FlowAnalytics::default();
        let stats = flow.update(0.02);
        assert_eq!(stats.baseline, 0.0);
        assert_eq!(stats.diff_pct, 0.0);
        assert!(!flow.has_baseline());
    }

    #[test]
    fn test_healthy_band_is_ordered() {
        let mut flow = FlowAnalytics::default();
        for i in 0..120 {
            flow.update(1.0 + (i % 10) as f32 * 0.1);
        }
        let stats = flow.update(1.5);
        assert!(stats.min_healthy < stats.baseline);
        assert!(stats.min >= 1.0 && stats.max <= 1.9 + 1e-6);
    }
}
