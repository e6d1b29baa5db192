//! Level sensor on the ESP32-S3 oneshot ADC

use esp_hal::Blocking;
use esp_hal::analog::adc::{Adc, AdcCalCurve, AdcChannel, AdcConfig, AdcPin, Attenuation};
use esp_hal::peripherals::ADC1;
use kalkan_core::sensors::AnalogSource;

type CalibratedPin<'d, P> = AdcPin<P, ADC1<'d>, AdcCalCurve<ADC1<'d>>>;

/// One ADC1 channel with curve calibration, reading in volts.
pub struct LevelAdc<'d, P> {
    adc: Adc<'d, ADC1<'d>, Blocking>,
    pin: CalibratedPin<'d, P>,
}

impl<'d, P> LevelAdc<'d, P>
where
    P: AdcChannel + esp_hal::gpio::AnalogPin,
{
    /// 11 dB attenuation covers the 0..2.9 V range of the divider output.
    pub fn new(adc1: ADC1<'d>, pin: P) -> Self {
        let mut config = AdcConfig::new();
        let pin = config.enable_pin_with_cal::<_, AdcCalCurve<ADC1<'d>>>(pin, Attenuation::_11dB);
        Self {
            adc: Adc::new(adc1, config),
            pin,
        }
    }
}

impl<'d, P: AdcChannel> AnalogSource for LevelAdc<'d, P> {
    type Error = ();

    fn read_volts(&mut self) -> Result<f32, ()> {
        // Curve calibration yields millivolts
        let millivolts = nb::block!(self.adc.read_oneshot(&mut self.pin))?;
        Ok(millivolts as f32 / 1000.0)
    }
}
