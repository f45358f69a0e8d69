//! Ledger notifications: event contract, envelope and pub/sub mechanics.
//!
//! Settlement never calls a notifier directly. The service publishes an envelope on the
//! bus after the balance write and the audit rows are done; delivery (SMS, e-mail, push)
//! lives with whoever subscribes.

pub mod bus;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
