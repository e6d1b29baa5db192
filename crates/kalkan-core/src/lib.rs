//! Hardware-independent core library for kalkan
//!
//! This crate contains the real-time pipeline of the kalkan pump and tank
//! monitor: interrupt-side pulse capture, oversampled level sampling, running
//! statistics, flow/level analytics, the periodic acquisition orchestrator and
//! the removable-storage persistence manager.
//!
//! It is `#![no_std]` with `extern crate alloc` so it compiles on both the
//! ESP32-S3 firmware and desktop hosts (for the simulator and tests).

// Tests link std for threads and the std critical-section impl
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod acquisition;
pub mod analytics;
pub mod app_state;
pub mod config;
pub mod metrics;
pub mod sensors;
pub mod storage;
pub mod tasks;
pub mod time;
