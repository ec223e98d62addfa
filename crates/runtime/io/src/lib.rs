//! IO and concurrency substrate shared by the mesh network session fabric:
//! a bounded worker pool for one-shot background jobs, cooperative
//! cancellable timers, and a single-consumer event bus. Adapted from
//! `ethcore-io`'s worker/thread model.

mod events;
mod timer;
mod worker;

pub use events::{EventBus, EventSender};
pub use timer::Timer;
pub use worker::WorkerPool;
