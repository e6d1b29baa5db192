//! CSV encoding of [`SensorMetrics`] rows
//!
//! Every row starts with `timestamp,iso8601,pulses`, followed by the numeric
//! columns of the chosen schema in a fixed order. The same table drives the
//! header, the writer and the parser so they cannot drift apart.

use alloc::string::String;
use core::fmt::Write;

use serde::{Deserialize, Serialize};
use thiserror_no_std::Error;

use crate::metrics::SensorMetrics;
use crate::sensors::PERIOD_HISTORY;
use crate::time::iso8601;

/// Column layout of daily and event files.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CsvSchema {
    #[default]
    Standard,
    /// Standard columns plus pulse jitter, the raw recent pulse periods and
    /// level sampler diagnostics
    Extended,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CsvError {
    #[error("expected {expected} columns, found {found}")]
    ColumnCount { expected: usize, found: usize },
    #[error("column {column} is not a number")]
    InvalidNumber { column: &'static str },
}

const LEADING_COLUMNS: [&str; 3] = ["timestamp", "iso8601", "pulses"];

struct Column {
    name: &'static str,
    precision: usize,
    get: fn(&SensorMetrics) -> f32,
    set: fn(&mut SensorMetrics, f32),
}

static STANDARD: [Column; 22] = [
    Column { name: "flow_lps", precision: 3, get: |m| m.flow.instantaneous, set: |m, v| m.flow.instantaneous = v },
    Column { name: "flow_baseline_lps", precision: 3, get: |m| m.flow.baseline, set: |m, v| m.flow.baseline = v },
    Column { name: "flow_diff_pct", precision: 2, get: |m| m.flow.diff_pct, set: |m, v| m.flow.diff_pct = v },
    Column { name: "flow_min_healthy_lps", precision: 3, get: |m| m.flow.min_healthy, set: |m, v| m.flow.min_healthy = v },
    Column { name: "flow_mean_lps", precision: 3, get: |m| m.flow.mean, set: |m, v| m.flow.mean = v },
    Column { name: "flow_median_lps", precision: 3, get: |m| m.flow.median, set: |m, v| m.flow.median = v },
    Column { name: "flow_std_lps", precision: 3, get: |m| m.flow.stddev, set: |m, v| m.flow.stddev = v },
    Column { name: "flow_min_lps", precision: 3, get: |m| m.flow.min, set: |m, v| m.flow.min = v },
    Column { name: "flow_max_lps", precision: 3, get: |m| m.flow.max, set: |m, v| m.flow.max = v },
    Column { name: "tank_height_cm", precision: 2, get: |m| m.level.instantaneous, set: |m, v| m.level.instantaneous = v },
    Column { name: "tank_empty_cm", precision: 2, get: |m| m.level.empty_estimate, set: |m, v| m.level.empty_estimate = v },
    Column { name: "tank_full_cm", precision: 2, get: |m| m.level.full_estimate, set: |m, v| m.level.full_estimate = v },
    Column { name: "tank_diff_pct", precision: 2, get: |m| m.level.diff_pct, set: |m, v| m.level.diff_pct = v },
    Column { name: "tank_noise_pct", precision: 2, get: |m| m.level.noise_pct, set: |m, v| m.level.noise_pct = v },
    Column { name: "tank_mean_cm", precision: 2, get: |m| m.level.mean, set: |m, v| m.level.mean = v },
    Column { name: "tank_median_cm", precision: 2, get: |m| m.level.median, set: |m, v| m.level.median = v },
    Column { name: "tank_std_cm", precision: 2, get: |m| m.level.stddev, set: |m, v| m.level.stddev = v },
    Column { name: "tank_min_cm", precision: 2, get: |m| m.level.min, set: |m, v| m.level.min = v },
    Column { name: "tank_max_cm", precision: 2, get: |m| m.level.max, set: |m, v| m.level.max = v },
    Column { name: "level_voltage", precision: 4, get: |m| m.reading.voltage_trimmed, set: |m, v| m.reading.voltage_trimmed = v },
    Column { name: "ema_voltage", precision: 4, get: |m| m.reading.ema_voltage, set: |m, v| m.reading.ema_voltage = v },
    Column { name: "density_factor", precision: 4, get: |m| m.density_ratio, set: |m, v| m.density_ratio = v },
];

static EXTENDED: [Column; 14 + PERIOD_HISTORY + 1] = [
    Column { name: "flow_pulse_mean_us", precision: 1, get: |m| m.jitter.mean_us, set: |m, v| m.jitter.mean_us = v },
    Column { name: "flow_pulse_median_us", precision: 1, get: |m| m.jitter.median_us, set: |m, v| m.jitter.median_us = v },
    Column { name: "flow_pulse_std_us", precision: 1, get: |m| m.jitter.stddev_us, set: |m, v| m.jitter.stddev_us = v },
    Column { name: "flow_pulse_cv", precision: 4, get: |m| m.jitter.cv, set: |m, v| m.jitter.cv = v },
    Column { name: "flow_period_count", precision: 0, get: |m| m.jitter.count as f32, set: |m, v| m.jitter.count = v as u8 },
    Column { name: "flow_period_us_0", precision: 0, get: |m| m.periods_us[0] as f32, set: |m, v| m.periods_us[0] = v as u32 },
    Column { name: "flow_period_us_1", precision: 0, get: |m| m.periods_us[1] as f32, set: |m, v| m.periods_us[1] = v as u32 },
    Column { name: "flow_period_us_2", precision: 0, get: |m| m.periods_us[2] as f32, set: |m, v| m.periods_us[2] = v as u32 },
    Column { name: "flow_period_us_3", precision: 0, get: |m| m.periods_us[3] as f32, set: |m, v| m.periods_us[3] = v as u32 },
    Column { name: "flow_period_us_4", precision: 0, get: |m| m.periods_us[4] as f32, set: |m, v| m.periods_us[4] = v as u32 },
    Column { name: "flow_period_us_5", precision: 0, get: |m| m.periods_us[5] as f32, set: |m, v| m.periods_us[5] = v as u32 },
    Column { name: "flow_period_us_6", precision: 0, get: |m| m.periods_us[6] as f32, set: |m, v| m.periods_us[6] = v as u32 },
    Column { name: "flow_period_us_7", precision: 0, get: |m| m.periods_us[7] as f32, set: |m, v| m.periods_us[7] = v as u32 },
    Column { name: "level_voltage_inst", precision: 4, get: |m| m.reading.voltage_inst, set: |m, v| m.reading.voltage_inst = v },
    Column { name: "level_voltage_avg", precision: 4, get: |m| m.reading.voltage_avg, set: |m, v| m.reading.voltage_avg = v },
    Column { name: "level_voltage_median", precision: 4, get: |m| m.reading.voltage_median, set: |m, v| m.reading.voltage_median = v },
    Column { name: "level_voltage_trimmed", precision: 4, get: |m| m.reading.voltage_trimmed, set: |m, v| m.reading.voltage_trimmed = v },
    Column { name: "level_voltage_std", precision: 4, get: |m| m.reading.voltage_std, set: |m, v| m.reading.voltage_std = v },
    Column { name: "level_current_ma", precision: 3, get: |m| m.reading.current_ma, set: |m, v| m.reading.current_ma = v },
    Column { name: "level_depth_mm", precision: 1, get: |m| m.reading.depth_mm, set: |m, v| m.reading.depth_mm = v },
    Column { name: "level_height_raw_cm", precision: 2, get: |m| m.reading.height_raw_cm, set: |m, v| m.reading.height_raw_cm = v },
    Column { name: "level_height_filtered_cm", precision: 2, get: |m| m.reading.height_cm, set: |m, v| m.reading.height_cm = v },
    Column { name: "level_velocity_mm_s", precision: 3, get: |m| m.reading.velocity_mm_s, set: |m, v| m.reading.velocity_mm_s = v },
];

impl CsvSchema {
    fn columns(self) -> impl Iterator<Item = &'static Column> {
        let extended: &'static [Column] = match self {
            Self::Standard => &[],
            Self::Extended => &EXTENDED,
        };
        STANDARD.iter().chain(extended.iter())
    }

    pub fn column_count(self) -> usize {
        LEADING_COLUMNS.len() + self.columns().count()
    }

    /// Header line including the trailing newline.
    pub fn header(self) -> String {
        let mut out = String::new();
        out.push_str(&LEADING_COLUMNS.join(","));
        for column in self.columns() {
            out.push(',');
            out.push_str(column.name);
        }
        out.push('\n');
        out
    }

    /// One data row including the trailing newline.
    pub fn format_row(self, metrics: &SensorMetrics, utc_offset_secs: i32) -> String {
        let mut out = String::with_capacity(256);
        // Writing into a String cannot fail
        let _ = write!(
            out,
            "{},{},{}",
            metrics.timestamp_ms,
            iso8601(metrics.timestamp_ms, utc_offset_secs),
            metrics.pulses
        );
        for column in self.columns() {
            let value = (column.get)(metrics);
            let value = if value.is_finite() { value } else { 0.0 };
            let _ = write!(out, ",{:.*}", column.precision, value);
        }
        out.push('\n');
        out
    }

    /// Parse a row back into the fields this schema carries.
    ///
    /// Fields outside the schema are left at their defaults.
    pub fn parse_row(self, line: &str) -> Result<SensorMetrics, CsvError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let expected = self.column_count();
        let found = line.split(',').count();
        if found != expected {
            return Err(CsvError::ColumnCount { expected, found });
        }

        let mut fields = line.split(',');
        let mut metrics = SensorMetrics::default();

        metrics.timestamp_ms = fields
            .next()
            .and_then(|f| f.parse().ok())
            .ok_or(CsvError::InvalidNumber { column: "timestamp" })?;
        let _iso = fields.next();
        metrics.pulses = fields
            .next()
            .and_then(|f| f.parse().ok())
            .ok_or(CsvError::InvalidNumber { column: "pulses" })?;

        for (column, field) in self.columns().zip(fields) {
            let value: f32 = field
                .parse()
                .map_err(|_| CsvError::InvalidNumber { column: column.name })?;
            (column.set)(&mut metrics, value);
        }
        Ok(metrics)
    }
}

/// True when `line` is a header of any schema.
pub fn is_header(line: &[u8]) -> bool {
    line.starts_with(b"timestamp,")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_metrics() -> SensorMetrics {
        let mut m = SensorMetrics {
            timestamp_ms: 1_705_307_400_250,
            pulses: 48,
            pulse_total: 10_000,
            density_ratio: 1.0125,
            ..SensorMetrics::default()
        };
        m.flow.instantaneous = 20.0;
        m.flow.baseline = 19.5432;
        m.flow.diff_pct = 2.3378;
        m.flow.min_healthy = 17.25;
        m.flow.mean = 12.125;
        m.flow.median = 18.0;
        m.flow.stddev = 3.14159;
        m.flow.min = 0.0;
        m.flow.max = 21.75;
        m.level.instantaneous = 250.04;
        m.level.empty_estimate = 12.5;
        m.level.full_estimate = 480.333;
        m.level.diff_pct = -47.94;
        m.level.noise_pct = 0.87;
        m.level.mean = 249.9;
        m.level.median = 250.0;
        m.level.stddev = 0.42;
        m.level.min = 240.1;
        m.level.max = 260.9;
        m.reading.voltage_trimmed = 1.4401;
        m.reading.ema_voltage = 1.4399;
        m.reading.voltage_avg = 1.4412;
        m.reading.current_ma = 9.6;
        m.jitter.mean_us = 4166.7;
        m.jitter.cv = 0.0123;
        m.jitter.count = 3;
        m.periods_us[..3].copy_from_slice(&[4100, 4166, 4233]);
        m.reading.voltage_inst = 1.4397;
        m
    }

    fn close(a: f32, b: f32, precision: usize) -> bool {
        (a - b).abs() <= 0.5 * 10f32.powi(-(precision as i32)) + 1e-4
    }

    #[test]
    fn test_standard_header() {
        let header = CsvSchema::Standard.header();
        assert!(header.starts_with("timestamp,iso8601,pulses,flow_lps,flow_baseline_lps,"));
        assert!(header.ends_with("level_voltage,ema_voltage,density_factor\n"));
        assert_eq!(header.trim_end().split(',').count(), 25);
        assert!(is_header(header.as_bytes()));
    }

    #[test]
    fn test_extended_header_appends_columns() {
        let header = CsvSchema::Extended.header();
        assert!(header.starts_with(CsvSchema::Standard.header().trim_end()));
        assert!(header.contains(",flow_pulse_cv,"));
        assert!(header.contains(",flow_period_count,flow_period_us_0,"));
        assert!(header.contains(",flow_period_us_7,level_voltage_inst,level_voltage_avg,"));
        assert!(header.trim_end().ends_with("level_velocity_mm_s"));
        assert_eq!(CsvSchema::Extended.column_count(), 48);
    }

    #[test]
    fn test_row_round_trip() {
        for schema in [CsvSchema::Standard, CsvSchema::Extended] {
            let original = sample_metrics();
            let row = schema.format_row(&original, 0);
            assert!(row.ends_with('\n'));
            assert!(row.contains(",2024-01-15T08:30:00.250Z,"));

            let parsed = schema.parse_row(&row).unwrap();
            assert_eq!(parsed.timestamp_ms, original.timestamp_ms);
            assert_eq!(parsed.pulses, original.pulses);
            for column in schema.columns() {
                let want = (column.get)(&original);
                let got = (column.get)(&parsed);
                assert!(
                    close(want, got, column.precision),
                    "{}: wrote {}, read back {}",
                    column.name,
                    want,
                    got
                );
            }
        }
    }

    #[test]
    fn test_raw_periods_are_logged_oldest_first() {
        let row = CsvSchema::Extended.format_row(&sample_metrics(), 0);
        assert!(row.contains(",3,4100,4166,4233,0,0,0,0,0,1.4397,"), "{}", row);

        let parsed = CsvSchema::Extended.parse_row(&row).unwrap();
        assert_eq!(parsed.periods_us, [4100, 4166, 4233, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_non_finite_is_written_as_zero() {
        let mut m = sample_metrics();
        m.flow.diff_pct = f32::NAN;
        let row = CsvSchema::Standard.format_row(&m, 0);
        assert!(!row.contains("NaN"));
        let parsed = CsvSchema::Standard.parse_row(&row).unwrap();
        assert_eq!(parsed.flow.diff_pct, 0.0);
    }

    #[test]
    fn test_parse_rejects_wrong_shape() {
        let row = CsvSchema::Extended.format_row(&sample_metrics(), 0);
        assert_eq!(
            CsvSchema::Standard.parse_row(&row),
            Err(CsvError::ColumnCount {
                expected: 25,
                found: 48
            })
        );

        let bad = CsvSchema::Standard.format_row(&sample_metrics(), 0).replacen(",48,", ",x,", 1);
        assert_eq!(
            CsvSchema::Standard.parse_row(&bad),
            Err(CsvError::InvalidNumber { column: "pulses" })
        );
    }
}
