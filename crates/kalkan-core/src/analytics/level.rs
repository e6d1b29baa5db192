//! Tank level analytics: calm-surface gating and slow empty/full learning

use super::{StatWindow, blend, percent_diff};

pub const LEVEL_WINDOW: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelTuning {
    /// Window standard deviation (cm) below which the surface counts as calm
    pub calm_stddev_cm: f32,
    /// Samples needed before calmness is judged at all
    pub min_calm_samples: usize,
    pub empty_alpha: f32,
    /// Smaller than `empty_alpha`: the full estimate is harder to raise
    pub full_alpha: f32,
}

impl Default for LevelTuning {
    fn default() -> Self {
        Self {
            calm_stddev_cm: 1.0,
            min_calm_samples: 5,
            empty_alpha: 0.02,
            full_alpha: 0.01,
        }
    }
}

/// Output of one level analytics update, heights in cm.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LevelStats {
    pub instantaneous: f32,
    /// Learned empty baseline (theta), zero until the first calm reading
    pub empty_estimate: f32,
    /// Learned full estimate (sigma), zero until the first calm reading
    pub full_estimate: f32,
    /// Instantaneous vs. full estimate in percent
    pub diff_pct: f32,
    pub noise_pct: f32,
    pub mean: f32,
    pub median: f32,
    pub stddev: f32,
    pub min: f32,
    pub max: f32,
    pub calm: bool,
}

pub struct LevelAnalytics {
    tuning: LevelTuning,
    window: StatWindow<LEVEL_WINDOW>,
    empty: Option<f32>,
    full: Option<f32>,
}

impl LevelAnalytics {
    pub fn new(tuning: LevelTuning) -> Self {
        Self {
            tuning,
            window: StatWindow::new(),
            empty: None,
            full: None,
        }
    }

    pub fn update(&mut self, height_cm: f32, noise_pct: f32) -> LevelStats {
        self.window.push(height_cm);

        let calm = self.window.len() >= self.tuning.min_calm_samples
            && self.window.window_stddev() < self.tuning.calm_stddev_cm;

        if calm && height_cm.is_finite() {
            self.empty = Some(blend(self.empty, height_cm, self.tuning.empty_alpha));
            self.full = match self.full {
                None => Some(height_cm),
                Some(full) if height_cm >= full => {
                    Some(full + self.tuning.full_alpha * (height_cm - full))
                }
                keep => keep,
            };
        }

        let full = self.full.unwrap_or(0.0);
        LevelStats {
            instantaneous: height_cm,
            empty_estimate: self.empty.unwrap_or(0.0),
            full_estimate: full,
            diff_pct: percent_diff(height_cm, full),
            noise_pct,
            mean: self.window.mean(),
            median: self.window.median(),
            stddev: self.window.stddev(),
            min: self.window.min(),
            max: self.window.max(),
            calm,
        }
    }

    /// Forget the learned estimates, e.g. after a recalibration.
    pub fn reset(&mut self) {
        *self = Self::new(self.tuning);
    }
}

impl Default for LevelAnalytics {
    fn default() -> Self {
        Self::new(LevelTuning::default())
    }
}
