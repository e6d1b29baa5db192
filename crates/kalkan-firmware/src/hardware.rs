//! Hardware initialization for the kalkan device
//!
//! Pin map (ESP32-S3):
//!
//! | Signal          | GPIO |
//! |-----------------|------|
//! | Flow pulses     | 4    |
//! | Level sensor    | 5    |
//! | SD SCK          | 40   |
//! | SD MOSI         | 38   |
//! | SD MISO         | 39   |
//! | SD CS           | 41   |

use embassy_time::Delay;
use embedded_hal_bus::spi::ExclusiveDevice;
use esp_hal::Blocking;
use esp_hal::gpio::interconnect::{PeripheralInput, PeripheralOutput};
use esp_hal::gpio::{Level, Output, OutputConfig, OutputPin};
use esp_hal::peripherals::SPI3;
use esp_hal::spi::Mode;
use esp_hal::spi::master::{Config as SpiConfig, Spi};
use esp_hal::time::Rate;
use kalkan_core::storage::sd_card::{SdVolume, UnixClock};
use log::info;
use thiserror_no_std::Error;

use crate::clock::{UTC_OFFSET_SECS, unix_time_ms};

/// SD cards must be initialised at or below 400 kHz
const SD_INIT_FREQUENCY_KHZ: u32 = 400;

pub type SdSpiDevice = ExclusiveDevice<Spi<'static, Blocking>, Output<'static>, Delay>;
pub type FirmwareVolume = SdVolume<SdSpiDevice, Delay, UnixClock<fn() -> i64>>;

#[derive(Error, Debug)]
pub enum HardwareError {
    #[error("SPI bus configuration rejected")]
    SpiConfig,
    #[error("SD chip select could not be driven")]
    ChipSelect,
}

/// Initialize the SPI bus and wrap the SD card as a storage volume
///
/// The card itself is not touched here; the persistence manager mounts it
/// (with retries) once the tasks are running.
pub fn init_sd_volume(
    spi3: SPI3<'static>,
    sck: impl PeripheralOutput<'static>,
    mosi: impl PeripheralOutput<'static>,
    miso: impl PeripheralInput<'static>,
    cs: impl OutputPin + 'static,
) -> Result<FirmwareVolume, HardwareError> {
    // Card init needs 400 kHz or less. The bus stays at that rate afterwards
    // because the SPI device is owned by the volume manager once built.
    let spi_bus = Spi::new(
        spi3,
        SpiConfig::default()
            .with_frequency(Rate::from_khz(SD_INIT_FREQUENCY_KHZ))
            .with_mode(Mode::_0),
    )
    .map_err(|_| HardwareError::SpiConfig)?
    .with_sck(sck)
    .with_mosi(mosi)
    .with_miso(miso);

    let cs = Output::new(cs, Level::High, OutputConfig::default());
    let spi_device = ExclusiveDevice::new(spi_bus, cs, Delay).map_err(|_| HardwareError::ChipSelect)?;

    let sd_card = embedded_sdmmc::SdCard::new(spi_device, Delay);
    let time_source = UnixClock::new(unix_time_ms as fn() -> i64, UTC_OFFSET_SECS);

    info!("SD card SPI ready");
    Ok(SdVolume::new(sd_card, time_source))
}
