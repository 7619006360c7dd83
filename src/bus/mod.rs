//! Event bus - ordered, acknowledgement-gated delivery within one run.

mod event_bus;

pub use event_bus::{BusPublisher, Delivery, EventBus};
