pub mod level;
pub mod pulse;

use thiserror_no_std::Error;

pub use level::{AlphaBetaFilter, LevelReading, LevelSampler};
pub use pulse::{PERIOD_HISTORY, PulseCapture, PulseJitter, PulseSnapshot};

/// Diagnostic sensor faults.
///
/// None of these stop the acquisition tick, they only shape the metrics.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorFault {
    #[error("ADC read failed")]
    AdcReadFailed,
    #[error("No valid samples in oversampling burst")]
    NoValidSamples,
    #[error("No flow pulses while flow was expected")]
    PulseStall,
}

/// Anything that yields one analog reading in volts at the level sensor pin.
///
/// The firmware implements this over the ESP32 ADC, the simulator and tests
/// over synthetic signals.
pub trait AnalogSource {
    type Error: core::fmt::Debug;

    fn read_volts(&mut self) -> Result<f32, Self::Error>;
}

impl<T: AnalogSource + ?Sized> AnalogSource for &mut T {
    type Error = T::Error;

    fn read_volts(&mut self) -> Result<f32, Self::Error> {
        (**self).read_volts()
    }
}
