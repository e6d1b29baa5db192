//! The periodic acquisition tick
//!
//! Once per tick: pull the pulse delta, take an oversampled level reading, run
//! both analytics and publish one [`SensorMetrics`] record to the latest-value
//! cell and the persistence queue. Everything here is owned by the
//! acquisition task; the interrupt handler is only read through snapshots.

use embedded_hal::delay::DelayNs;
use log::{debug, info, warn};

use crate::analytics::{FlowAnalytics, LevelAnalytics, LevelStats};
use crate::app_state::{AcquisitionCommand, SharedState};
use crate::config::{AcquisitionConfig, CalibrationFactors};
use crate::metrics::SensorMetrics;
use crate::sensors::{AnalogSource, LevelReading, LevelSampler, PulseCapture, PulseSnapshot, SensorFault};
use crate::time::TickTime;

pub struct AcquisitionOrchestrator<'a, A, D>
where
    A: AnalogSource,
    D: DelayNs,
{
    shared: &'a SharedState,
    pulses: &'a PulseCapture,
    adc: A,
    delay: D,
    sampler: LevelSampler,
    flow: FlowAnalytics,
    level: LevelAnalytics,
    config: AcquisitionConfig,
    /// Config exactly as last loaded from the shared cell
    loaded_config: AcquisitionConfig,
    /// Calibration exactly as last loaded from the shared cell
    calibration: CalibrationFactors,
    previous: Option<(PulseSnapshot, u64)>,
    last_pulse_us: u64,
    stalled: bool,
    last_reading: Option<LevelReading>,
    last_level: LevelStats,
}

impl<'a, A, D> AcquisitionOrchestrator<'a, A, D>
where
    A: AnalogSource,
    D: DelayNs,
{
    pub fn new(shared: &'a SharedState, pulses: &'a PulseCapture, adc: A, delay: D) -> Self {
        let loaded_config = shared.acquisition_config.load();
        let config = loaded_config.sanitized();
        let calibration = shared.calibration.load();
        Self {
            shared,
            pulses,
            adc,
            delay,
            sampler: LevelSampler::new(calibration, config.oversample_count, config.ema_alpha),
            flow: FlowAnalytics::default(),
            level: LevelAnalytics::default(),
            config,
            loaded_config,
            calibration,
            previous: None,
            last_pulse_us: 0,
            stalled: false,
            last_reading: None,
            last_level: LevelStats::default(),
        }
    }

    /// Tick period currently configured.
    pub fn interval_ms(&self) -> u32 {
        self.config.sensor_interval_ms
    }

    pub fn sampler(&self) -> &LevelSampler {
        &self.sampler
    }

    /// Run one acquisition tick and publish its record.
    pub fn tick(&mut self, now: TickTime) -> SensorMetrics {
        self.refresh_config();
        while let Some(command) = self.shared.commands.try_acquisition() {
            self.apply_command(command);
        }
        self.refresh_calibration();

        let snapshot = self.pulses.take_snapshot();
        let (pulses, elapsed_s) = match self.previous {
            Some((previous, at_us)) => (
                snapshot.pulses_since(&previous),
                now.monotonic_us.saturating_sub(at_us) as f32 / 1_000_000.0,
            ),
            // First tick only establishes the reference point
            None => (0, 0.0),
        };
        let flow_lps = if elapsed_s > 0.0 {
            pulses as f32 / elapsed_s / self.config.pulses_per_liter
        } else {
            0.0
        };

        let step_s = (elapsed_s > 0.0).then_some(elapsed_s);
        let reading = self.sampler.sample_after(&mut self.adc, &mut self.delay, step_s);
        let flow = self.flow.update(flow_lps);
        // A failed burst repeats the previous reading; keep it out of the statistics
        if reading.fault.is_none() {
            self.last_level = self.level.update(reading.height_cm, reading.noise_pct);
            self.last_reading = Some(reading);
        }

        let flow_stalled = self.check_stall(pulses, now.monotonic_us);

        let metrics = SensorMetrics {
            timestamp_ms: now.unix_ms,
            pulses,
            pulse_total: snapshot.total,
            flow,
            level: self.last_level,
            reading,
            jitter: snapshot.jitter(),
            periods_us: snapshot.periods,
            density_ratio: self.sampler.calibration().density_ratio,
            flow_stalled,
        };

        self.shared.latest.store(Some(metrics));
        let dropped = self.shared.metrics.publish(metrics);
        if dropped > 0 {
            debug!("acquisition: persistence queue full, dropped {} oldest", dropped);
        }

        self.previous = Some((snapshot, now.monotonic_us));
        metrics
    }

    fn refresh_config(&mut self) {
        let loaded = self.shared.acquisition_config.load();
        if loaded != self.loaded_config {
            self.loaded_config = loaded;
            let config = loaded.sanitized();
            self.sampler
                .set_oversampling(config.oversample_count, config.ema_alpha);
            info!(
                "acquisition: interval {} ms, oversample {}",
                config.sensor_interval_ms, config.oversample_count
            );
            self.config = config;
        }
    }

    /// Compared by value so writes that bypass the command bus are picked up too.
    fn refresh_calibration(&mut self) {
        let calibration = self.shared.calibration.load();
        if calibration != self.calibration {
            info!("acquisition: calibration changed, applying");
            self.sampler.set_calibration(calibration);
            self.level.reset();
            self.last_level = LevelStats::default();
            self.calibration = calibration;
        }
    }

    fn apply_command(&mut self, command: AcquisitionCommand) {
        let density = match command {
            AcquisitionCommand::CalibrateHeight(height_cm) => {
                let Some(raw_cm) = self.last_reading.map(|r| r.height_raw_cm) else {
                    warn!("acquisition: no level reading yet, calibration ignored");
                    return;
                };
                if !(height_cm.is_finite() && height_cm > 0.0 && raw_cm > 0.0) {
                    warn!(
                        "acquisition: cannot calibrate to {} cm from a reading of {} cm",
                        height_cm, raw_cm
                    );
                    return;
                }
                // height scales with 1 / density
                self.sampler.calibration().density_ratio * raw_cm / height_cm
            }
            AcquisitionCommand::SetDensity(ratio) => ratio,
        };

        let applied = self.shared.calibration.update(|calibration| {
            CalibrationFactors {
                density_ratio: density,
                ..calibration
            }
            .sanitized()
        });
        info!("acquisition: density ratio set to {:.4}", applied.density_ratio);
    }

    /// Flag a silent pulse train once the pump has been seen running.
    fn check_stall(&mut self, pulses: u32, now_us: u64) -> bool {
        if pulses > 0 || self.previous.is_none() {
            if self.stalled {
                info!("acquisition: pulses resumed");
            }
            self.last_pulse_us = now_us;
            self.stalled = false;
            return false;
        }

        let silent_us = now_us.saturating_sub(self.last_pulse_us);
        if self.flow.has_baseline() && silent_us >= self.config.stall_window_ms as u64 * 1000 {
            if !self.stalled {
                warn!(
                    "acquisition: {} after {} ms",
                    SensorFault::PulseStall,
                    silent_us / 1000
                );
            }
            self.stalled = true;
        }
        self.stalled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_state::Command;
    use crate::config::Settings;
    use crate::sensors::PERIOD_HISTORY;

    const MS: u64 = 1000;
    const SECOND: u64 = 1_000_000;

    struct NoDelay;

    impl DelayNs for NoDelay {
        fn delay_ns(&mut self, _ns: u32) {}
    }

    struct Constant(f32);

    impl AnalogSource for Constant {
        type Error = ();

        fn read_volts(&mut self) -> Result<f32, ()> {
            Ok(self.0)
        }
    }

    struct Failing;

    impl AnalogSource for Failing {
        type Error = ();

        fn read_volts(&mut self) -> Result<f32, ()> {
            Err(())
        }
    }

    fn at(us: u64) -> TickTime {
        TickTime {
            monotonic_us: us,
            unix_ms: 1_705_305_600_000 + (us / MS) as i64,
        }
    }

    fn edges(pulses: &PulseCapture, count: u32, start_us: u32, spacing_us: u32) {
        for i in 0..count {
            pulses.on_edge(start_us + i * spacing_us);
        }
    }

    #[test]
    fn test_240_pulses_per_second_is_20_lps() {
        let shared = SharedState::new(Settings::default());
        let pulses = PulseCapture::new();
        let mut orchestrator = AcquisitionOrchestrator::new(&shared, &pulses, Constant(1.44), NoDelay);

        let first = orchestrator.tick(at(0));
        assert_eq!(first.pulses, 0);
        assert_eq!(first.flow.instantaneous, 0.0);

        edges(&pulses, 240, 1000, 4000);
        let metrics = orchestrator.tick(at(SECOND));
        assert_eq!(metrics.pulses, 240);
        assert_eq!(metrics.pulse_total, 240);
        assert!(
            (metrics.flow.instantaneous - 20.0).abs() < 1e-3,
            "Expected 20 L/s, got {}",
            metrics.flow.instantaneous
        );
        assert!(metrics.pump_on());
        assert_eq!(metrics.jitter.median_us, 4000.0);
        assert_eq!(metrics.periods_us, [4000; PERIOD_HISTORY]);
    }

    #[test]
    fn test_half_scale_level_and_publication() {
        let shared = SharedState::new(Settings::default());
        let pulses = PulseCapture::new();
        let mut orchestrator = AcquisitionOrchestrator::new(&shared, &pulses, Constant(1.44), NoDelay);

        let metrics = orchestrator.tick(at(0));
        assert!((metrics.level.instantaneous - 250.0).abs() <= 1.0);
        assert_eq!(metrics.density_ratio, 1.0);
        assert_eq!(shared.latest.load(), Some(metrics));
        assert_eq!(shared.metrics.len(), 1);
    }

    #[test]
    fn test_persistence_queue_keeps_newest_when_full() {
        let shared = SharedState::new(Settings::default());
        let pulses = PulseCapture::new();
        let mut orchestrator = AcquisitionOrchestrator::new(&shared, &pulses, Constant(1.0), NoDelay);

        for i in 0..40 {
            orchestrator.tick(at(i * 200 * MS));
        }
        assert_eq!(shared.metrics.len(), crate::app_state::METRICS_CHANNEL_CAPACITY);
        let oldest = shared.metrics.try_receive().unwrap();
        // Ticks 24..40 survive
        assert_eq!(oldest.timestamp_ms, at(24 * 200 * MS).unix_ms);
    }

    #[test]
    fn test_out_of_band_calibration_write_is_applied() {
        let shared = SharedState::new(Settings::default());
        let pulses = PulseCapture::new();
        let mut orchestrator = AcquisitionOrchestrator::new(&shared, &pulses, Constant(1.44), NoDelay);
        orchestrator.tick(at(0));

        shared.calibration.update(|c| CalibrationFactors {
            density_ratio: 2.0,
            ..c
        });
        let metrics = orchestrator.tick(at(200 * MS));
        assert!((metrics.reading.height_cm - 125.0).abs() <= 1.0);
        assert_eq!(metrics.density_ratio, 2.0);
    }

    #[test]
    fn test_height_calibration_derives_density() {
        let shared = SharedState::new(Settings::default());
        let pulses = PulseCapture::new();
        let mut orchestrator = AcquisitionOrchestrator::new(&shared, &pulses, Constant(1.44), NoDelay);
        orchestrator.tick(at(0));

        shared.commands.send(Command::SetCalibration(200.0)).unwrap();
        let metrics = orchestrator.tick(at(200 * MS));

        let density = shared.calibration.load().density_ratio;
        assert!((density - 1.25).abs() < 0.01, "Expected 1.25, got {}", density);
        assert!((metrics.reading.height_cm - 200.0).abs() <= 1.0);
    }

    #[test]
    fn test_density_command_is_clamped() {
        let shared = SharedState::new(Settings::default());
        let pulses = PulseCapture::new();
        let mut orchestrator = AcquisitionOrchestrator::new(&shared, &pulses, Constant(1.44), NoDelay);

        shared.commands.send(Command::SetDensity(50.0)).unwrap();
        let metrics = orchestrator.tick(at(0));
        assert_eq!(metrics.density_ratio, 10.0);

        shared.commands.send(Command::SetDensity(-3.0)).unwrap();
        let metrics = orchestrator.tick(at(200 * MS));
        assert_eq!(metrics.density_ratio, 1.0);
    }

    #[test]
    fn test_calibration_without_reading_is_ignored() {
        let shared = SharedState::new(Settings::default());
        let pulses = PulseCapture::new();
        let mut orchestrator = AcquisitionOrchestrator::new(&shared, &pulses, Failing, NoDelay);

        shared.commands.send(Command::SetCalibration(100.0)).unwrap();
        let metrics = orchestrator.tick(at(0));
        assert_eq!(shared.calibration.load().density_ratio, 1.0);
        assert_eq!(metrics.reading.fault, Some(SensorFault::AdcReadFailed));
        assert_eq!(metrics.level, LevelStats::default());
    }

    #[test]
    fn test_stall_flagged_after_window_and_cleared_by_pulses() {
        let shared = SharedState::new(Settings::default());
        let pulses = PulseCapture::new();
        let mut orchestrator = AcquisitionOrchestrator::new(&shared, &pulses, Constant(1.0), NoDelay);

        orchestrator.tick(at(0));
        let mut edge_us = 0u32;
        for i in 1..=5u64 {
            edges(&pulses, 10, edge_us, 20_000);
            edge_us += 200_000;
            assert!(!orchestrator.tick(at(i * 200 * MS)).flow_stalled);
        }

        // Last pulses counted at 1 s
        assert!(!orchestrator.tick(at(10 * SECOND)).flow_stalled);
        assert!(orchestrator.tick(at(11 * SECOND)).flow_stalled);
        assert!(orchestrator.tick(at(12 * SECOND)).flow_stalled);

        edges(&pulses, 3, edge_us, 20_000);
        assert!(!orchestrator.tick(at(12 * SECOND + 200 * MS)).flow_stalled);
    }

    #[test]
    fn test_no_stall_before_pump_ever_ran() {
        let shared = SharedState::new(Settings::default());
        let pulses = PulseCapture::new();
        let mut orchestrator = AcquisitionOrchestrator::new(&shared, &pulses, Constant(1.0), NoDelay);

        orchestrator.tick(at(0));
        assert!(!orchestrator.tick(at(60 * SECOND)).flow_stalled);
    }

    #[test]
    fn test_config_reread_each_tick() {
        let shared = SharedState::new(Settings::default());
        let pulses = PulseCapture::new();
        let mut orchestrator = AcquisitionOrchestrator::new(&shared, &pulses, Constant(1.0), NoDelay);
        assert_eq!(orchestrator.interval_ms(), 200);

        shared.acquisition_config.update(|c| AcquisitionConfig {
            sensor_interval_ms: 100,
            oversample_count: 4,
            ..c
        });
        let metrics = orchestrator.tick(at(0));
        assert_eq!(orchestrator.interval_ms(), 100);
        assert_eq!(metrics.reading.valid_samples, 4);
    }
}
