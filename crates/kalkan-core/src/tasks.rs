//! Async loops driving the acquisition and persistence pipeline
//!
//! Embassy tasks cannot be generic, so the composition root wraps these in
//! its own `#[embassy_executor::task]` functions with concrete types.

use embassy_futures::select::{Either3, select3};
use embassy_time::{Duration, Instant, Timer};
use embedded_hal::delay::DelayNs;
use log::info;

use crate::acquisition::AcquisitionOrchestrator;
use crate::app_state::{SharedState, StorageCommand};
use crate::metrics::SensorMetrics;
use crate::sensors::AnalogSource;
use crate::storage::Volume;
use crate::storage::manager::PersistenceManager;
use crate::time::Clock;

/// Upper bound between persistence service passes when nothing arrives
pub const SERVICE_INTERVAL_MS: u64 = 500;

/// Why the persistence loop woke up.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Wakeup {
    Metrics(SensorMetrics),
    Command(StorageCommand),
    Service,
}

/// Tick the orchestrator at its configured period, forever.
///
/// The period is re-read after every tick. A tick that overruns shifts the
/// schedule instead of bursting to catch up.
pub async fn acquisition_loop<A, D, C>(mut orchestrator: AcquisitionOrchestrator<'_, A, D>, clock: C) -> !
where
    A: AnalogSource,
    D: DelayNs,
    C: Clock,
{
    info!("acquisition: running every {} ms", orchestrator.interval_ms());
    let mut next = Instant::now();
    loop {
        orchestrator.tick(clock.now());

        next += Duration::from_millis(orchestrator.interval_ms() as u64);
        let now = Instant::now();
        if next < now {
            next = now;
        }
        Timer::at(next).await;
    }
}

/// Feed metrics and commands into the persistence manager, forever.
pub async fn persistence_loop<V, C>(mut manager: PersistenceManager<V>, shared: &SharedState, clock: C) -> !
where
    V: Volume,
    C: Clock,
{
    shared.storage_status.store(manager.status());
    loop {
        let wakeup = match select3(
            shared.metrics.receive(),
            shared.commands.next_storage(),
            Timer::after_millis(SERVICE_INTERVAL_MS),
        )
        .await
        {
            Either3::First(metrics) => Wakeup::Metrics(metrics),
            Either3::Second(command) => Wakeup::Command(command),
            Either3::Third(()) => Wakeup::Service,
        };

        persistence_step(&mut manager, shared, wakeup, clock.now().monotonic_ms());
    }
}

/// One pass of the persistence loop; publishes the resulting status.
pub fn persistence_step<V: Volume>(
    manager: &mut PersistenceManager<V>,
    shared: &SharedState,
    wakeup: Wakeup,
    now_ms: u64,
) {
    match wakeup {
        Wakeup::Metrics(metrics) => {
            manager.offer(metrics, now_ms);
        }
        Wakeup::Command(command) => manager.handle(command, now_ms),
        Wakeup::Service => {}
    }

    manager.service(now_ms);
    shared.storage_status.store(manager.status());
}
