//! Flow and level analytics built on [`StatWindow`]

pub mod flow;
pub mod level;
pub mod stat_window;

pub use flow::{FlowAnalytics, FlowStats, FlowTuning};
pub use level::{LevelAnalytics, LevelStats, LevelTuning};
pub use stat_window::StatWindow;

/// Exponential blend of `current` toward `target`; seeds on the first value.
pub(crate) fn blend(current: Option<f32>, target: f32, alpha: f32) -> f32 {
    match current {
        Some(current) => current + alpha * (target - current),
        None => target,
    }
}

/// Signed percent difference of `value` against `reference`.
///
/// Zero when the reference is too small to divide by.
pub(crate) fn percent_diff(value: f32, reference: f32) -> f32 {
    if reference.abs() < 1e-3 {
        0.0
    } else {
        (value - reference) / reference * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blend_seeds_then_moves_fractionally() {
        assert_eq!(blend(None, 8.0, 0.05), 8.0);
        assert!((blend(Some(10.0), 20.0, 0.1) - 11.0).abs() < 1e-6);
    }

    #[test]
    fn test_percent_diff_guards_tiny_reference() {
        assert_eq!(percent_diff(5.0, 0.0), 0.0);
        assert_eq!(percent_diff(5.0, 0.0005), 0.0);
        assert!((percent_diff(9.0, 10.0) + 10.0).abs() < 1e-4);
    }
}
