//! Level / pressure sensor sampling
//!
//! One call to [`LevelSampler::sample`] takes a short burst of raw ADC reads,
//! reduces them to a robust voltage (trimmed mean) plus diagnostics, and
//! converts that into a water column height.

use embedded_hal::delay::DelayNs;
use heapless::Vec;
use log::warn;

use super::{AnalogSource, SensorFault};
use crate::config::{CalibrationFactors, LevelMode, MAX_OVERSAMPLE_COUNT, MIN_OVERSAMPLE_COUNT};

/// Spacing between raw reads of one burst
pub const OVERSAMPLE_SPACING_US: u32 = 200;

/// Constant-gain position/velocity tracker.
#[derive(Debug, Clone, Copy)]
pub struct AlphaBetaFilter {
    alpha: f32,
    beta: f32,
    position: f32,
    velocity: f32,
    initialized: bool,
}

impl AlphaBetaFilter {
    pub const fn new(alpha: f32, beta: f32) -> Self {
        Self {
            alpha,
            beta,
            position: 0.0,
            velocity: 0.0,
            initialized: false,
        }
    }

    pub fn set_gains(&mut self, alpha: f32, beta: f32) {
        self.alpha = alpha;
        self.beta = beta;
    }

    pub fn reset(&mut self) {
        self.position = 0.0;
        self.velocity = 0.0;
        self.initialized = false;
    }

    /// Feed one measurement taken `dt_s` after the previous one.
    ///
    /// The first measurement seeds the position directly.
    pub fn update(&mut self, measured: f32, dt_s: f32) -> f32 {
        if !self.initialized {
            self.position = measured;
            self.velocity = 0.0;
            self.initialized = true;
            return self.position;
        }

        let predicted = self.position + self.velocity * dt_s;
        let residual = measured - predicted;
        self.position = predicted + self.alpha * residual;
        if dt_s > 0.0 {
            self.velocity += (self.beta * residual) / dt_s;
        }

        if self.position < 0.0 {
            self.position = 0.0;
            self.velocity = 0.0;
        }
        self.position
    }

    pub fn position(&self) -> f32 {
        self.position
    }

    pub fn velocity(&self) -> f32 {
        self.velocity
    }
}

/// Result of one oversampled level measurement.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LevelReading {
    pub voltage_avg: f32,
    pub voltage_median: f32,
    /// Primary signal, extremes discarded
    pub voltage_trimmed: f32,
    pub voltage_std: f32,
    /// Last valid read of the burst
    pub voltage_inst: f32,
    pub noise_pct: f32,
    /// Slow UI smoothing of the burst average
    pub ema_voltage: f32,
    /// Loop current derived from the trimmed voltage, zero in voltage mode
    pub current_ma: f32,
    /// Depth after density correction (filtered in current-loop mode)
    pub depth_mm: f32,
    /// Height before the alpha-beta filter
    pub height_raw_cm: f32,
    /// Height used downstream
    pub height_cm: f32,
    pub velocity_mm_s: f32,
    pub valid_samples: u8,
    pub fault: Option<SensorFault>,
}

/// Oversampling level reader with depth conversion.
pub struct LevelSampler {
    calibration: CalibrationFactors,
    oversample: u8,
    ema_alpha: f32,
    ema_voltage: Option<f32>,
    filter: AlphaBetaFilter,
    last: LevelReading,
}

impl LevelSampler {
    pub fn new(calibration: CalibrationFactors, oversample: u8, ema_alpha: f32) -> Self {
        let calibration = calibration.sanitized();
        Self {
            filter: AlphaBetaFilter::new(calibration.alpha_gain, calibration.beta_gain),
            calibration,
            oversample: oversample.clamp(MIN_OVERSAMPLE_COUNT, MAX_OVERSAMPLE_COUNT),
            ema_alpha: ema_alpha.clamp(0.01, 1.0),
            ema_voltage: None,
            last: LevelReading::default(),
        }
    }

    pub fn calibration(&self) -> &CalibrationFactors {
        &self.calibration
    }

    /// Replace the calibration snapshot. Switching sensor mode restarts the tracker.
    pub fn set_calibration(&mut self, calibration: CalibrationFactors) {
        let calibration = calibration.sanitized();
        if calibration.mode != self.calibration.mode {
            self.filter.reset();
        }
        self.filter.set_gains(calibration.alpha_gain, calibration.beta_gain);
        self.calibration = calibration;
    }

    pub fn set_oversampling(&mut self, oversample: u8, ema_alpha: f32) {
        self.oversample = oversample.clamp(MIN_OVERSAMPLE_COUNT, MAX_OVERSAMPLE_COUNT);
        self.ema_alpha = ema_alpha.clamp(0.01, 1.0);
    }

    /// Take one oversampled measurement.
    ///
    /// When no read in the burst produced a finite voltage, the previous
    /// reading is returned with `fault` set so downstream statistics are not
    /// fed a fabricated value.
    pub fn sample<A, D>(&mut self, adc: &mut A, delay: &mut D) -> LevelReading
    where
        A: AnalogSource,
        D: DelayNs,
    {
        self.sample_after(adc, delay, None)
    }

    /// [`sample`](Self::sample) with the measured time since the previous
    /// burst as the tracker step. `None` or a non-positive value falls back to
    /// the calibration's nominal `sample_interval_ms`.
    pub fn sample_after<A, D>(&mut self, adc: &mut A, delay: &mut D, elapsed_s: Option<f32>) -> LevelReading
    where
        A: AnalogSource,
        D: DelayNs,
    {
        let mut samples: Vec<f32, { MAX_OVERSAMPLE_COUNT as usize }> = Vec::new();
        let mut read_errors = 0u8;

        for i in 0..self.oversample {
            match adc.read_volts() {
                Ok(volts) if volts.is_finite() => {
                    // Capacity equals the oversample ceiling
                    let _ = samples.push(volts);
                }
                Ok(_) => {}
                Err(_) => read_errors += 1,
            }
            if i + 1 < self.oversample {
                delay.delay_us(OVERSAMPLE_SPACING_US);
            }
        }

        if samples.is_empty() {
            let fault = if read_errors > 0 {
                SensorFault::AdcReadFailed
            } else {
                SensorFault::NoValidSamples
            };
            if self.last.fault.is_none() {
                warn!("level: burst produced no usable samples ({})", fault);
            }
            self.last = LevelReading {
                fault: Some(fault),
                valid_samples: 0,
                ..self.last
            };
            return self.last;
        }

        let voltage_inst = samples.last().copied().unwrap_or_default();
        let stats = BurstStats::compute(&mut samples);

        let ema = match self.ema_voltage {
            Some(ema) => ema + self.ema_alpha * (stats.average - ema),
            None => stats.average,
        };
        self.ema_voltage = Some(ema);

        let cal = &self.calibration;
        let density = if cal.density_ratio > 0.0 {
            cal.density_ratio
        } else {
            1.0
        };

        let mut reading = LevelReading {
            voltage_avg: stats.average,
            voltage_median: stats.median,
            voltage_trimmed: stats.trimmed,
            voltage_std: stats.stddev,
            voltage_inst,
            noise_pct: stats.noise_pct,
            ema_voltage: ema,
            valid_samples: samples.len() as u8,
            fault: None,
            ..LevelReading::default()
        };

        match cal.mode {
            LevelMode::Voltage => {
                let norm = normalize(stats.trimmed, cal.zero_voltage, cal.full_voltage);
                let height_cm = norm * cal.full_height_cm / density;
                reading.height_raw_cm = height_cm;
                reading.height_cm = height_cm;
                reading.depth_mm = height_cm * 10.0;
            }
            LevelMode::CurrentLoop => {
                let current_ma = stats.trimmed / (cal.sense_resistor_ohms * cal.sense_gain) * 1000.0;
                let norm = normalize(current_ma, cal.zero_current_ma, cal.full_current_ma);
                let raw_mm = norm * cal.full_height_mm / density;
                let dt_s = elapsed_s
                    .filter(|dt| *dt > 0.0)
                    .unwrap_or(cal.sample_interval_ms as f32 / 1000.0);
                let filtered_mm = self.filter.update(raw_mm, dt_s);

                reading.current_ma = current_ma;
                reading.depth_mm = filtered_mm;
                reading.height_raw_cm = raw_mm / 10.0;
                reading.height_cm = filtered_mm / 10.0;
                reading.velocity_mm_s = self.filter.velocity();
            }
        }

        self.last = reading;
        reading
    }
}

/// Map `value` from `[zero, full]` onto `[0, 1]`, clamped.
fn normalize(value: f32, zero: f32, full: f32) -> f32 {
    let span = full - zero;
    if span.abs() < f32::EPSILON {
        return 0.0;
    }
    ((value - zero) / span).clamp(0.0, 1.0)
}

struct BurstStats {
    average: f32,
    median: f32,
    trimmed: f32,
    stddev: f32,
    noise_pct: f32,
}

impl BurstStats {
    /// Sorts `samples` in place.
    fn compute(samples: &mut [f32]) -> Self {
        let n = samples.len();
        let average = samples.iter().sum::<f32>() / n as f32;

        let variance = samples
            .iter()
            .map(|v| {
                let d = v - average;
                d * d
            })
            .sum::<f32>()
            / n as f32;
        let stddev = libm::sqrtf(variance);

        samples.sort_unstable_by(|a, b| a.total_cmp(b));
        let median = if n % 2 == 0 {
            (samples[n / 2 - 1] + samples[n / 2]) / 2.0
        } else {
            samples[n / 2]
        };

        let trim = (n / 10).max(1);
        let trimmed = if n > 2 * trim {
            let kept = &samples[trim..n - trim];
            kept.iter().sum::<f32>() / kept.len() as f32
        } else {
            average
        };

        let reference = if trimmed > 0.0 { trimmed } else { average };
        let noise_pct = if reference > 0.0 {
            stddev / reference * 100.0
        } else {
            0.0
        };

        Self {
            average,
            median,
            trimmed,
            stddev,
            noise_pct,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoDelay;

    impl DelayNs for NoDelay {
        fn delay_ns(&mut self, _ns: u32) {}
    }

    /// Replays a fixed list of readings, then repeats the last one.
    struct Scripted {
        values: std::vec::Vec<Result<f32, ()>>,
        index: usize,
    }

    impl Scripted {
        fn constant(volts: f32) -> Self {
            Self {
                values: std::vec![Ok(volts)],
                index: 0,
            }
        }
    }

    impl AnalogSource for Scripted {
        type Error = ();

        fn read_volts(&mut self) -> Result<f32, ()> {
            let value = self.values[self.index.min(self.values.len() - 1)];
            self.index += 1;
            value
        }
    }

    #[test]
    fn test_half_scale_voltage_is_half_height() {
        let mut sampler = LevelSampler::new(CalibrationFactors::default(), 10, 0.2);
        let reading = sampler.sample(&mut Scripted::constant(1.44), &mut NoDelay);
        assert!(
            (reading.height_cm - 250.0).abs() <= 1.0,
            "Expected ~250 cm, got {}",
            reading.height_cm
        );
        assert_eq!(reading.valid_samples, 10);
        assert!(reading.fault.is_none());
    }

    #[test]
    fn test_density_scales_height() {
        let cal = CalibrationFactors {
            density_ratio: 2.0,
            ..CalibrationFactors::default()
        };
        let mut sampler = LevelSampler::new(cal, 10, 0.2);
        let reading = sampler.sample(&mut Scripted::constant(1.44), &mut NoDelay);
        assert!((reading.height_cm - 125.0).abs() <= 1.0);
    }

    #[test]
    fn test_height_is_clamped_to_range() {
        let mut sampler = LevelSampler::new(CalibrationFactors::default(), 10, 0.2);
        assert_eq!(sampler.sample(&mut Scripted::constant(0.1), &mut NoDelay).height_cm, 0.0);
        assert_eq!(sampler.sample(&mut Scripted::constant(3.2), &mut NoDelay).height_cm, 500.0);
    }

    #[test]
    fn test_trimmed_mean_discards_outliers() {
        let mut values: std::vec::Vec<Result<f32, ()>> = std::vec![Ok(1.0); 8];
        values.push(Ok(3.0));
        values.push(Ok(0.0));
        let mut adc = Scripted { values, index: 0 };

        let mut sampler = LevelSampler::new(CalibrationFactors::default(), 10, 0.2);
        let reading = sampler.sample(&mut adc, &mut NoDelay);

        assert!((reading.voltage_trimmed - 1.0).abs() < 1e-6);
        assert!((reading.voltage_avg - 1.1).abs() < 1e-5);
        assert_eq!(reading.voltage_median, 1.0);
        assert!(reading.noise_pct > 0.0);
    }

    #[test]
    fn test_non_finite_reads_are_skipped() {
        let values = std::vec![Ok(f32::NAN), Ok(1.44), Err(()), Ok(f32::INFINITY), Ok(1.44)];
        let mut adc = Scripted { values, index: 0 };
        let mut sampler = LevelSampler::new(CalibrationFactors::default(), 5, 0.2);
        let reading = sampler.sample(&mut adc, &mut NoDelay);
        assert_eq!(reading.valid_samples, 2);
        assert!((reading.height_cm - 250.0).abs() <= 1.0);
    }

    #[test]
    fn test_empty_burst_keeps_previous_height() {
        let mut sampler = LevelSampler::new(CalibrationFactors::default(), 5, 0.2);
        let good = sampler.sample(&mut Scripted::constant(1.44), &mut NoDelay);

        let mut broken = Scripted {
            values: std::vec![Err(())],
            index: 0,
        };
        let reading = sampler.sample(&mut broken, &mut NoDelay);
        assert_eq!(reading.fault, Some(SensorFault::AdcReadFailed));
        assert_eq!(reading.height_cm, good.height_cm);
        assert_eq!(reading.valid_samples, 0);
    }

    #[test]
    fn test_ema_moves_toward_new_level() {
        let mut sampler = LevelSampler::new(CalibrationFactors::default(), 5, 0.5);
        let first = sampler.sample(&mut Scripted::constant(1.0), &mut NoDelay);
        assert_eq!(first.ema_voltage, 1.0);
        let second = sampler.sample(&mut Scripted::constant(2.0), &mut NoDelay);
        assert!((second.ema_voltage - 1.5).abs() < 1e-6);
        assert!((second.voltage_trimmed - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_current_loop_mid_scale() {
        // 12 mA across 150 ohm = 1.8 V, half of the 4-20 mA span
        let cal = CalibrationFactors {
            mode: LevelMode::CurrentLoop,
            ..CalibrationFactors::default()
        };
        let mut sampler = LevelSampler::new(cal, 10, 0.2);
        let reading = sampler.sample(&mut Scripted::constant(1.8), &mut NoDelay);
        assert!((reading.current_ma - 12.0).abs() < 1e-3);
        assert!((reading.depth_mm - 2500.0).abs() < 1.0);
        assert!((reading.height_cm - 250.0).abs() < 0.1);
    }

    #[test]
    fn test_tracker_velocity_uses_measured_step() {
        let cal = CalibrationFactors {
            mode: LevelMode::CurrentLoop,
            ..CalibrationFactors::default()
        };
        // 12.32 mA across 150 ohm, 2600 mm: 100 mm above the seeded 2500 mm
        let step_volts = 1.848;

        let mut measured = LevelSampler::new(cal, 10, 0.2);
        measured.sample(&mut Scripted::constant(1.8), &mut NoDelay);
        let reading = measured.sample_after(&mut Scripted::constant(step_volts), &mut NoDelay, Some(0.5));
        // beta 0.02 * 100 mm / 0.5 s
        assert!((reading.velocity_mm_s - 4.0).abs() < 0.1, "{}", reading.velocity_mm_s);

        let mut nominal = LevelSampler::new(cal, 10, 0.2);
        nominal.sample(&mut Scripted::constant(1.8), &mut NoDelay);
        let reading = nominal.sample_after(&mut Scripted::constant(step_volts), &mut NoDelay, Some(0.0));
        // Falls back to the 200 ms nominal step
        assert!((reading.velocity_mm_s - 10.0).abs() < 0.2, "{}", reading.velocity_mm_s);
    }

    #[test]
    fn test_alpha_beta_converges_and_clamps() {
        let mut filter = AlphaBetaFilter::new(0.4, 0.02);
        assert_eq!(filter.update(100.0, 0.2), 100.0);
        for _ in 0..200 {
            filter.update(200.0, 0.2);
        }
        assert!((filter.position() - 200.0).abs() < 1.0);

        let mut falling = AlphaBetaFilter::new(1.0, 1.0);
        falling.update(5.0, 0.2);
        assert_eq!(falling.update(-50.0, 0.2), 0.0);
        assert_eq!(falling.velocity(), 0.0);
    }

    #[test]
    fn test_mode_switch_restarts_tracker() {
        let loop_cal = CalibrationFactors {
            mode: LevelMode::CurrentLoop,
            ..CalibrationFactors::default()
        };
        let mut sampler = LevelSampler::new(loop_cal, 5, 0.2);
        sampler.sample(&mut Scripted::constant(1.8), &mut NoDelay);

        sampler.set_calibration(CalibrationFactors::default());
        sampler.set_calibration(loop_cal);
        // Seeded fresh, so the first loop reading is taken verbatim
        let reading = sampler.sample(&mut Scripted::constant(0.6), &mut NoDelay);
        assert!((reading.height_cm - reading.height_raw_cm).abs() < 1e-3);
    }
}
