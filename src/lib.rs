#![doc = include_str!("../README.md")]

pub mod contractor;
pub mod outbox;
pub mod scheduler;
pub mod settings;
pub mod telemetry;
pub mod transport;

#[doc(inline)]
pub use outbox::{DeliveryFailure, Outbox, OutboxError, OutboxErrorKind, OutboxMessage};

#[doc(inline)]
pub use transport::{Transport, TransportError, TransportErrorKind};

#[doc(inline)]
pub use scheduler::{DefaultSchedulerHook, Schedule, Scheduler, SchedulerHook, Tick};
