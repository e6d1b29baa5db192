//! ESP32-S3 firmware-specific modules for kalkan
//!
//! This crate contains hardware-specific code that cannot compile on desktop
//! targets: the flow sensor GPIO interrupt, the level sensor ADC, the SPI SD
//! card and the embassy-backed clock.

#![no_std]

extern crate alloc;

pub mod clock;
pub mod flow_pin;
pub mod hardware;
pub mod level_adc;
