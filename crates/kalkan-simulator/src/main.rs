//! Desktop simulator for the kalkan pump and tank monitor.
//!
//! Runs the same acquisition orchestrator and persistence manager as the
//! firmware, fed by synthetic signals: a pump that fills the tank between two
//! levels, a noisy level sensor voltage and a flow sensor pulse train. The
//! "SD card" is a directory on the host (`./sim-card` unless given as the first
//! argument), with a simulated capacity in MiB as the optional second argument.
//!
//! # Commands (type and press Enter)
//!
//! | Input     | Action                              |
//! |-----------|-------------------------------------|
//! | `e`       | Trigger an event snapshot           |
//! | `r`       | Prepare the card for removal        |
//! | `u`       | Resume after a removal request      |
//! | `x`       | Pull / insert the simulated card    |
//! | `c <cm>`  | Calibrate to the true height in cm  |
//! | `d <r>`   | Set the density ratio               |
//! | `q`       | Quit                                |

mod host_volume;

use std::io::BufRead;
use std::sync::mpsc::{self, Receiver};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use embedded_hal::delay::DelayNs;
use log::{info, warn};

use kalkan_core::acquisition::AcquisitionOrchestrator;
use kalkan_core::app_state::{Command, SharedState};
use kalkan_core::config::{CalibrationFactors, Settings};
use kalkan_core::sensors::{AnalogSource, PulseCapture};
use kalkan_core::storage::manager::PersistenceManager;
use kalkan_core::storage::pre_event::PreEventBuffer;
use kalkan_core::tasks::{Wakeup, persistence_step};
use kalkan_core::time::{Clock, TickTime};

use host_volume::HostVolume;

// ---------------------------------------------------------------------------
// Simulation constants
// ---------------------------------------------------------------------------

/// Pump starts below this height
const PUMP_START_CM: f32 = 120.0;
/// Pump stops above this height
const PUMP_STOP_CM: f32 = 420.0;
const FILL_CM_PER_S: f32 = 0.8;
const DRAIN_CM_PER_S: f32 = 0.4;
/// Pulse frequency of a healthy pump
const PUMP_PULSE_HZ: f32 = 60.0;
/// RAM the pre-event buffer may claim half of
const MEMORY_BUDGET_BYTES: usize = 4 * 1024 * 1024;
const STATUS_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_CAPACITY_MIB: u64 = 64;

static PULSES: PulseCapture = PulseCapture::new();

// ---------------------------------------------------------------------------
// Mock data generation
// ---------------------------------------------------------------------------

/// Small deterministic noise source.
struct XorShift(u32);

impl XorShift {
    fn next_f32(&mut self) -> f32 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0 = x;
        (x as f32 / u32::MAX as f32) * 2.0 - 1.0
    }
}

/// Tank and pump physics behind both synthetic sensors.
struct MockPlant {
    height_cm: f32,
    pump_on: bool,
    next_edge_us: u64,
    noise: XorShift,
}

impl MockPlant {
    fn new() -> Self {
        Self {
            height_cm: 200.0,
            pump_on: false,
            next_edge_us: 0,
            noise: XorShift(0x9E37_79B9),
        }
    }

    /// Advance the plant to `now_us`, firing flow sensor edges on the way.
    fn advance(&mut self, from_us: u64, now_us: u64) {
        let dt_s = now_us.saturating_sub(from_us) as f32 / 1_000_000.0;

        if self.pump_on {
            self.height_cm += FILL_CM_PER_S * dt_s;
            if self.height_cm >= PUMP_STOP_CM {
                info!("sim: pump off at {:.1} cm", self.height_cm);
                self.pump_on = false;
            }
        } else {
            self.height_cm -= DRAIN_CM_PER_S * dt_s;
            if self.height_cm <= PUMP_START_CM {
                info!("sim: pump on at {:.1} cm", self.height_cm);
                self.pump_on = true;
                self.next_edge_us = now_us;
            }
        }

        if !self.pump_on {
            self.next_edge_us = now_us;
            return;
        }
        while self.next_edge_us < now_us {
            PULSES.on_edge(self.next_edge_us as u32);
            // +-5 % period jitter
            let period_us = 1_000_000.0 / PUMP_PULSE_HZ * (1.0 + 0.05 * self.noise.next_f32());
            self.next_edge_us += period_us as u64;
        }
    }
}

/// Level sensor voltage for the current plant height, with ADC noise.
struct MockLevelSensor<'a> {
    plant: &'a std::cell::RefCell<MockPlant>,
    calibration: CalibrationFactors,
}

impl AnalogSource for MockLevelSensor<'_> {
    type Error = ();

    fn read_volts(&mut self) -> Result<f32, ()> {
        let mut plant = self.plant.borrow_mut();
        let cal = &self.calibration;
        let norm = plant.height_cm / cal.full_height_cm;
        let volts = cal.zero_voltage + norm * (cal.full_voltage - cal.zero_voltage);
        Ok(volts + 0.004 * plant.noise.next_f32())
    }
}

struct StdDelay;

impl DelayNs for StdDelay {
    fn delay_ns(&mut self, ns: u32) {
        std::thread::sleep(Duration::from_nanos(ns as u64));
    }
}

/// Host monotonic clock plus the wall-clock time at start.
struct HostClock {
    started: Instant,
    epoch_ms: i64,
}

impl Clock for HostClock {
    fn now(&self) -> TickTime {
        let elapsed = self.started.elapsed();
        TickTime {
            monotonic_us: elapsed.as_micros() as u64,
            unix_ms: self.epoch_ms + elapsed.as_millis() as i64,
        }
    }
}

// ---------------------------------------------------------------------------
// Keyboard input
// ---------------------------------------------------------------------------

enum Input {
    Send(Command),
    ToggleCard,
    Quit,
}

fn parse_input(line: &str) -> Option<Input> {
    let mut parts = line.split_whitespace();
    let input = match parts.next()? {
        "e" => Input::Send(Command::TriggerEventSnapshot),
        "r" => Input::Send(Command::PrepareForRemoval),
        "u" => Input::Send(Command::Resume),
        "x" => Input::ToggleCard,
        "c" => Input::Send(Command::SetCalibration(parts.next()?.parse().ok()?)),
        "d" => Input::Send(Command::SetDensity(parts.next()?.parse().ok()?)),
        "q" => Input::Quit,
        _ => return None,
    };
    Some(input)
}

fn spawn_stdin_reader() -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn main() {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let card_dir = args.next().unwrap_or_else(|| "./sim-card".to_string());
    let capacity_mib = args
        .next()
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(DEFAULT_CAPACITY_MIB);

    info!("Starting kalkan simulator");
    info!("Card: {} ({} MiB simulated)", card_dir, capacity_mib);
    info!("Keys: e=event  r=remove  u=resume  x=pull/insert  c <cm>  d <ratio>  q=quit");

    let mut settings = Settings::default();
    // Scale the free-space policy to the simulated card
    settings.storage.free_space_threshold_bytes = capacity_mib * 1024 * 1024 / 4;
    settings.storage.min_trim_bytes = 64 * 1024;
    let shared = SharedState::new(settings);
    let settings = shared.settings();

    let clock = HostClock {
        started: Instant::now(),
        epoch_ms: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64,
    };

    // Acquisition side
    let plant = std::cell::RefCell::new(MockPlant::new());
    let sensor = MockLevelSensor {
        plant: &plant,
        calibration: settings.calibration,
    };
    let mut orchestrator = AcquisitionOrchestrator::new(&shared, &PULSES, sensor, StdDelay);

    // Persistence side
    let volume = HostVolume::new(card_dir, capacity_mib * 1024 * 1024);
    let pre_event = PreEventBuffer::sized_for(&settings.storage, MEMORY_BUDGET_BYTES);
    let mut manager = PersistenceManager::new(volume, settings.storage, pre_event);
    manager.set_ready_callback(Box::new(|| info!("sim: card ready again")));
    manager.begin(&mut StdDelay, clock.now().monotonic_ms());

    let input = spawn_stdin_reader();
    let mut last_status = Instant::now();
    let mut last_tick_us = 0u64;

    // -----------------------------------------------------------------------
    // Main loop
    // -----------------------------------------------------------------------
    'running: loop {
        let tick_start = Instant::now();

        // --- Keyboard -----------------------------------------------------
        while let Ok(line) = input.try_recv() {
            match parse_input(&line) {
                Some(Input::Quit) => break 'running,
                Some(Input::ToggleCard) => {
                    let volume = manager.volume_mut();
                    let present = !volume.is_present();
                    volume.set_present(present);
                    info!("sim: card {}", if present { "inserted" } else { "pulled" });
                }
                Some(Input::Send(command)) => {
                    if let Err(e) = shared.commands.send(command) {
                        warn!("sim: {}", e);
                    }
                }
                None => warn!("sim: unknown input {:?}", line),
            }
        }

        // --- Acquisition --------------------------------------------------
        let now = clock.now();
        plant.borrow_mut().advance(last_tick_us, now.monotonic_us);
        last_tick_us = now.monotonic_us;
        orchestrator.tick(now);

        // --- Persistence --------------------------------------------------
        let now_ms = clock.now().monotonic_ms();
        while let Some(command) = shared.commands.try_storage() {
            persistence_step(&mut manager, &shared, Wakeup::Command(command), now_ms);
        }
        while let Some(metrics) = shared.metrics.try_receive() {
            persistence_step(&mut manager, &shared, Wakeup::Metrics(metrics), now_ms);
        }
        persistence_step(&mut manager, &shared, Wakeup::Service, now_ms);

        // --- Status line --------------------------------------------------
        if last_status.elapsed() >= STATUS_INTERVAL {
            last_status = Instant::now();
            if let Some(m) = shared.latest.load() {
                let status = shared.storage_status.load();
                info!(
                    "flow {:.2} L/s (baseline {:.2}, {}) | level {:.1} cm (noise {}) | storage {} rows={} buffered={}{}",
                    m.flow.instantaneous,
                    m.flow.baseline,
                    m.flow_health().label(),
                    m.level.instantaneous,
                    m.noise_quality().label(),
                    status.state.label(),
                    status.rows_written,
                    status.rows_buffered_only,
                    if status.event_active { " [event]" } else { "" },
                );
            }
        }

        // --- Tick pacing --------------------------------------------------
        let period = Duration::from_millis(orchestrator.interval_ms() as u64);
        let elapsed = tick_start.elapsed();
        if elapsed < period {
            std::thread::sleep(period - elapsed);
        }
    }

    info!("Simulator exiting");
}
