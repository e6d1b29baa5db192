#![no_std]
#![no_main]
#![deny(
    clippy::mem_forget,
    reason = "mem::forget is generally not safe to do with esp_hal types, especially those \
    holding buffers for the duration of a data transfer."
)]
#![deny(clippy::large_stack_frames)]

use alloc::boxed::Box;

use embassy_executor::Spawner;
use embassy_time::{Delay, Duration, Timer};
use esp_hal::clock::CpuClock;
use esp_hal::gpio::Io;
use esp_hal::peripherals::GPIO5;
use esp_hal::timer::timg::TimerGroup;
use log::{error, info};
use static_cell::StaticCell;

use kalkan_core::acquisition::AcquisitionOrchestrator;
use kalkan_core::app_state::SharedState;
use kalkan_core::config::Settings;
use kalkan_core::storage::manager::PersistenceManager;
use kalkan_core::storage::pre_event::PreEventBuffer;
use kalkan_core::tasks;
use kalkan_core::time::Clock;
use kalkan_firmware::clock::{FirmwareClock, UTC_OFFSET_SECS};
use kalkan_firmware::flow_pin::{self, PULSES};
use kalkan_firmware::hardware::{FirmwareVolume, init_sd_volume};
use kalkan_firmware::level_adc::LevelAdc;

/// Heap size; the pre-event buffer may claim up to half of it
const HEAP_SIZE: usize = 73744;
const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(10);

type LevelSensor = LevelAdc<'static, GPIO5<'static>>;

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    rtt_target::rprintln!("PANIC: {}", info);
    loop {}
}

extern crate alloc;

// This creates a default app-descriptor required by the esp-idf bootloader.
// For more information see: <https://docs.espressif.com/projects/esp-idf/en/stable/esp32/api-reference/system/app_image_format.html#application-description>
esp_bootloader_esp_idf::esp_app_desc!();

static SHARED: StaticCell<SharedState> = StaticCell::new();

#[embassy_executor::task]
async fn acquisition_task(orchestrator: AcquisitionOrchestrator<'static, LevelSensor, Delay>) {
    tasks::acquisition_loop(orchestrator, FirmwareClock).await
}

#[embassy_executor::task]
async fn persistence_task(manager: PersistenceManager<FirmwareVolume>, shared: &'static SharedState) {
    tasks::persistence_loop(manager, shared, FirmwareClock).await
}

/// Stand-in for the display: log the latest record and storage status.
#[embassy_executor::task]
async fn status_task(shared: &'static SharedState) {
    loop {
        Timer::after(STATUS_LOG_INTERVAL).await;
        let status = shared.storage_status.load();
        if let Some(m) = shared.latest.load() {
            info!(
                "flow {:.2} L/s ({}) | level {:.1} cm (noise {}) | sd {}{}",
                m.flow.instantaneous,
                m.flow_health().label(),
                m.level.instantaneous,
                m.noise_quality().label(),
                status.state.label(),
                if status.event_active { " [event]" } else { "" },
            );
        }
    }
}

#[allow(
    clippy::large_stack_frames,
    reason = "it's not unusual to allocate larger buffers etc. in main"
)]
#[esp_rtos::main]
async fn main(spawner: Spawner) -> ! {
    rtt_target::rtt_init_log!();

    let config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(config);

    esp_alloc::heap_allocator!(#[esp_hal::ram(reclaimed)] size: HEAP_SIZE);

    let timg0 = TimerGroup::new(peripherals.TIMG0);
    esp_rtos::start(timg0.timer0);

    info!("Embassy initialized!");

    // Shared state, published to every task
    let mut settings = Settings::default();
    settings.storage.utc_offset_secs = UTC_OFFSET_SECS;
    let shared: &'static SharedState = SHARED.init(SharedState::new(settings));
    let settings = shared.settings();

    // 1. Flow sensor interrupt
    let mut io = Io::new(peripherals.IO_MUX);
    flow_pin::attach(&mut io, peripherals.GPIO4);

    // 2. Level sensor ADC
    let level = LevelAdc::new(peripherals.ADC1, peripherals.GPIO5);
    let orchestrator = AcquisitionOrchestrator::new(shared, &PULSES, level, Delay);

    // 3. SD card and persistence
    match init_sd_volume(
        peripherals.SPI3,
        peripherals.GPIO40,
        peripherals.GPIO38,
        peripherals.GPIO39,
        peripherals.GPIO41,
    ) {
        Ok(volume) => {
            let pre_event = PreEventBuffer::sized_for(&settings.storage, HEAP_SIZE);
            let mut manager = PersistenceManager::new(volume, settings.storage, pre_event);
            manager.set_ready_callback(Box::new(|| info!("SD card ready")));
            manager.begin(&mut Delay, FirmwareClock.now().monotonic_ms());

            match persistence_task(manager, shared) {
                Ok(token) => spawner.spawn(token),
                Err(e) => error!("Failed to spawn persistence task: {:?}", e),
            }
        }
        Err(e) => error!("SD card unavailable, logging disabled: {}", e),
    }

    match acquisition_task(orchestrator) {
        Ok(token) => spawner.spawn(token),
        Err(e) => error!("Failed to spawn acquisition task: {:?}", e),
    }
    match status_task(shared) {
        Ok(token) => spawner.spawn(token),
        Err(e) => error!("Failed to spawn status task: {:?}", e),
    }

    loop {
        Timer::after(Duration::from_secs(60)).await;
    }
}
