//! Flow sensor pulse input
//!
//! The hall-effect sensor drives one GPIO; every rising edge lands in
//! [`PULSES`] from the GPIO interrupt handler.

use core::cell::RefCell;

use critical_section::Mutex;
use esp_hal::gpio::{Event, Input, InputConfig, InputPin, Io, Pull};
use esp_hal::{handler, ram};
use kalkan_core::sensors::PulseCapture;
use log::info;

/// Pulse state shared between the interrupt handler and the acquisition task
pub static PULSES: PulseCapture = PulseCapture::new();

static FLOW_INPUT: Mutex<RefCell<Option<Input<'static>>>> = Mutex::new(RefCell::new(None));

/// Configure `pin` for rising-edge interrupts and route them to [`PULSES`].
pub fn attach(io: &mut Io<'_>, pin: impl InputPin + 'static) {
    PULSES.reset();
    io.set_interrupt_handler(flow_edge_handler);

    let mut input = Input::new(pin, InputConfig::default().with_pull(Pull::Down));
    critical_section::with(|cs| {
        input.listen(Event::RisingEdge);
        FLOW_INPUT.borrow_ref_mut(cs).replace(input);
    });
    info!("Flow sensor interrupt attached");
}

#[handler]
#[ram]
fn flow_edge_handler() {
    let now_us = esp_hal::time::Instant::now()
        .duration_since_epoch()
        .as_micros() as u32;

    critical_section::with(|cs| {
        if let Some(input) = FLOW_INPUT.borrow_ref_mut(cs).as_mut()
            && input.is_interrupt_set()
        {
            PULSES.on_edge(now_us);
            input.clear_interrupt();
        }
    });
}
