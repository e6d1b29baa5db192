//! Configuration inputs for the acquisition and persistence pipeline
//!
//! These values are owned by an external configuration collaborator (the
//! on-device key-value store). The core only ever reads them, and every value
//! is clamped into a safe range at the point of assignment via `sanitized()`
//! instead of being reported as an error.

use alloc::vec::Vec;

use log::warn;
use serde::{Deserialize, Serialize};
use thiserror_no_std::Error;

use crate::storage::csv::CsvSchema;

pub const DEFAULT_SENSOR_INTERVAL_MS: u32 = 200;
pub const DEFAULT_LOGGING_INTERVAL_MS: u32 = 1000;
pub const DEFAULT_OVERSAMPLE_COUNT: u8 = 10;
pub const MIN_OVERSAMPLE_COUNT: u8 = 3;
/// Upper bound of the sampler's stack buffer
pub const MAX_OVERSAMPLE_COUNT: u8 = 32;
/// Datasheet: f = 0.2 * Q(L/min), so Q(L/s) = f / 0.2 / 60 = f / 12
pub const DEFAULT_PULSES_PER_LITER: f32 = 12.0;

const GIB: u64 = 1024 * 1024 * 1024;
const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("settings blob could not be encoded")]
    Encode,
    #[error("settings blob could not be decoded")]
    Decode,
}

/// Clamp a float field, replacing non-finite input with `fallback`.
fn clamp_field(field: &str, value: f32, low: f32, high: f32, fallback: f32) -> f32 {
    if !value.is_finite() {
        warn!("config: {} is not finite, using {}", field, fallback);
        return fallback;
    }
    let clamped = value.clamp(low, high);
    if clamped != value {
        warn!("config: {} = {} clamped to {}", field, value, clamped);
    }
    clamped
}

fn clamp_u32(field: &str, value: u32, low: u32, high: u32) -> u32 {
    let clamped = value.clamp(low, high);
    if clamped != value {
        warn!("config: {} = {} clamped to {}", field, value, clamped);
    }
    clamped
}

fn clamp_u64(field: &str, value: u64, low: u64, high: u64) -> u64 {
    let clamped = value.clamp(low, high);
    if clamped != value {
        warn!("config: {} = {} clamped to {}", field, value, clamped);
    }
    clamped
}

/// Timing and conversion settings for the acquisition task.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct AcquisitionConfig {
    /// Period of the acquisition tick
    pub sensor_interval_ms: u32,
    /// Raw ADC reads per level sample
    pub oversample_count: u8,
    /// Smoothing factor of the UI voltage EMA
    pub ema_alpha: f32,
    /// Pulse-frequency divisor converting Hz to L/s
    pub pulses_per_liter: f32,
    /// How long the pulse train may stay silent before a stall is flagged
    pub stall_window_ms: u32,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            sensor_interval_ms: DEFAULT_SENSOR_INTERVAL_MS,
            oversample_count: DEFAULT_OVERSAMPLE_COUNT,
            ema_alpha: 0.2,
            pulses_per_liter: DEFAULT_PULSES_PER_LITER,
            stall_window_ms: 10_000,
        }
    }
}

impl AcquisitionConfig {
    pub fn sanitized(self) -> Self {
        let oversample = self
            .oversample_count
            .clamp(MIN_OVERSAMPLE_COUNT, MAX_OVERSAMPLE_COUNT);
        if oversample != self.oversample_count {
            warn!(
                "config: oversample_count = {} clamped to {}",
                self.oversample_count, oversample
            );
        }
        let pulses_per_liter = if self.pulses_per_liter.is_finite() && self.pulses_per_liter > 0.0 {
            self.pulses_per_liter
        } else {
            warn!("config: pulses_per_liter must be positive, using default");
            DEFAULT_PULSES_PER_LITER
        };

        Self {
            sensor_interval_ms: clamp_u32("sensor_interval_ms", self.sensor_interval_ms, 50, 5000),
            oversample_count: oversample,
            ema_alpha: clamp_field("ema_alpha", self.ema_alpha, 0.01, 1.0, 0.2),
            pulses_per_liter,
            stall_window_ms: clamp_u32("stall_window_ms", self.stall_window_ms, 1000, 600_000),
        }
    }
}

/// Which physical signal the level sensor delivers.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LevelMode {
    /// Ratiometric voltage output, converted with the zero/full voltage pair
    #[default]
    Voltage,
    /// 4-20 mA loop across a sense resistor, depth tracked in millimeters
    CurrentLoop,
}

/// Calibration snapshot for the level sensor.
///
/// Read once per acquisition tick; compared by value so out-of-band writes
/// are picked up without a dirty flag.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct CalibrationFactors {
    pub mode: LevelMode,
    /// Voltage at an empty tank (4 mA across the divider)
    pub zero_voltage: f32,
    /// Voltage at the reference full height
    pub full_voltage: f32,
    /// Physical height at `full_voltage`
    pub full_height_cm: f32,
    pub zero_current_ma: f32,
    pub full_current_ma: f32,
    /// Physical height at `full_current_ma`
    pub full_height_mm: f32,
    pub sense_resistor_ohms: f32,
    pub sense_gain: f32,
    /// Position gain of the alpha-beta tracker
    pub alpha_gain: f32,
    /// Velocity gain of the alpha-beta tracker
    pub beta_gain: f32,
    /// Liquid density relative to water
    pub density_ratio: f32,
    /// Nominal time step of the alpha-beta tracker
    pub sample_interval_ms: u32,
}

impl Default for CalibrationFactors {
    fn default() -> Self {
        Self {
            mode: LevelMode::Voltage,
            zero_voltage: 0.48,
            full_voltage: 2.4,
            full_height_cm: 500.0,
            zero_current_ma: 4.0,
            full_current_ma: 20.0,
            full_height_mm: 5000.0,
            sense_resistor_ohms: 150.0,
            sense_gain: 1.0,
            alpha_gain: 0.4,
            beta_gain: 0.02,
            density_ratio: 1.0,
            sample_interval_ms: DEFAULT_SENSOR_INTERVAL_MS,
        }
    }
}

impl CalibrationFactors {
    pub fn sanitized(self) -> Self {
        let defaults = Self::default();
        let density_ratio = if self.density_ratio.is_finite() && self.density_ratio > 0.0 {
            clamp_field("density_ratio", self.density_ratio, 0.1, 10.0, 1.0)
        } else {
            warn!("config: density_ratio = {} is not positive, using 1.0", self.density_ratio);
            1.0
        };

        Self {
            mode: self.mode,
            zero_voltage: clamp_field("zero_voltage", self.zero_voltage, 0.0, 3.3, defaults.zero_voltage),
            full_voltage: clamp_field("full_voltage", self.full_voltage, 0.0, 3.3, defaults.full_voltage),
            full_height_cm: clamp_field(
                "full_height_cm",
                self.full_height_cm,
                1.0,
                10_000.0,
                defaults.full_height_cm,
            ),
            zero_current_ma: clamp_field(
                "zero_current_ma",
                self.zero_current_ma,
                0.0,
                24.0,
                defaults.zero_current_ma,
            ),
            full_current_ma: clamp_field(
                "full_current_ma",
                self.full_current_ma,
                0.0,
                24.0,
                defaults.full_current_ma,
            ),
            full_height_mm: clamp_field(
                "full_height_mm",
                self.full_height_mm,
                10.0,
                100_000.0,
                defaults.full_height_mm,
            ),
            sense_resistor_ohms: clamp_field(
                "sense_resistor_ohms",
                self.sense_resistor_ohms,
                1.0,
                100_000.0,
                defaults.sense_resistor_ohms,
            ),
            sense_gain: clamp_field("sense_gain", self.sense_gain, 0.1, 1000.0, defaults.sense_gain),
            alpha_gain: clamp_field("alpha_gain", self.alpha_gain, 0.01, 1.0, defaults.alpha_gain),
            beta_gain: clamp_field("beta_gain", self.beta_gain, 0.001, 1.0, defaults.beta_gain),
            density_ratio,
            sample_interval_ms: clamp_u32("sample_interval_ms", self.sample_interval_ms, 50, 60_000),
        }
    }
}

/// Settings for the persistence task and the safe-removal protocol.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct StorageConfig {
    /// Minimum spacing between persisted rows
    pub logging_interval_ms: u32,
    /// Reclamation starts below this many free bytes
    pub free_space_threshold_bytes: u64,
    /// Smaller log files are removed instead of halved
    pub min_trim_bytes: u64,
    pub event_duration_secs: u32,
    /// No card polling at all for this long after a removal request
    pub quiet_period_ms: u32,
    /// Card presence polling period once the quiet period is over
    pub poll_interval_ms: u32,
    /// Silent remount period while unmounted
    pub mount_retry_interval_ms: u32,
    /// Mount attempts made by `begin`
    pub begin_attempts: u8,
    pub space_check_interval_ms: u32,
    /// Offset applied to file names and ISO timestamps (0 = UTC)
    pub utc_offset_secs: i32,
    pub schema: CsvSchema,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            logging_interval_ms: DEFAULT_LOGGING_INTERVAL_MS,
            free_space_threshold_bytes: 4 * GIB,
            min_trim_bytes: 512 * KIB,
            event_duration_secs: 60 * 60,
            quiet_period_ms: 15_000,
            poll_interval_ms: 2_000,
            mount_retry_interval_ms: 2_000,
            begin_attempts: 5,
            space_check_interval_ms: 60_000,
            utc_offset_secs: 0,
            schema: CsvSchema::Standard,
        }
    }
}

impl StorageConfig {
    pub fn sanitized(self) -> Self {
        Self {
            logging_interval_ms: clamp_u32("logging_interval_ms", self.logging_interval_ms, 100, 3_600_000),
            free_space_threshold_bytes: clamp_u64(
                "free_space_threshold_bytes",
                self.free_space_threshold_bytes,
                MIB,
                1024 * GIB,
            ),
            min_trim_bytes: clamp_u64("min_trim_bytes", self.min_trim_bytes, 4 * KIB, 64 * MIB),
            event_duration_secs: clamp_u32("event_duration_secs", self.event_duration_secs, 1, 24 * 3600),
            quiet_period_ms: clamp_u32("quiet_period_ms", self.quiet_period_ms, 1_000, 120_000),
            poll_interval_ms: clamp_u32("poll_interval_ms", self.poll_interval_ms, 100, 60_000),
            mount_retry_interval_ms: clamp_u32(
                "mount_retry_interval_ms",
                self.mount_retry_interval_ms,
                100,
                600_000,
            ),
            begin_attempts: self.begin_attempts.max(1),
            space_check_interval_ms: clamp_u32(
                "space_check_interval_ms",
                self.space_check_interval_ms,
                1_000,
                3_600_000,
            ),
            utc_offset_secs: self.utc_offset_secs.clamp(-14 * 3600, 14 * 3600),
            ..self
        }
    }

    /// Pre-event history depth: twenty minutes of rows at the logging cadence.
    pub fn pre_event_entries(&self) -> usize {
        let interval = self.logging_interval_ms.max(1) as usize;
        ((20 * 60 * 1000) / interval).max(60)
    }
}

/// Everything the configuration collaborator persists, as one blob.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Default)]
pub struct Settings {
    pub acquisition: AcquisitionConfig,
    pub calibration: CalibrationFactors,
    pub storage: StorageConfig,
}

impl Settings {
    pub fn sanitized(self) -> Self {
        Self {
            acquisition: self.acquisition.sanitized(),
            calibration: self.calibration.sanitized(),
            storage: self.storage.sanitized(),
        }
    }

    /// Encode into the compact postcard form kept in the key-value store.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ConfigError> {
        postcard::to_allocvec(self).map_err(|_| ConfigError::Encode)
    }

    /// Decode a stored blob, clamping every field into range.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ConfigError> {
        let settings: Settings = postcard::from_bytes(bytes).map_err(|_| ConfigError::Decode)?;
        Ok(settings.sanitized())
    }
}
