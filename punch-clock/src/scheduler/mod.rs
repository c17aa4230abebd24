//! Time-driven job scheduling.
//!
//! Jobs pair a daily [`Trigger`] with an [`Action`](crate::action::Action).
//! The [`JobScheduler`] fires each job at its trigger time, runs it through
//! the [`RetryExecutor`](crate::resilience::RetryExecutor) and publishes the
//! result.

pub mod clock;
mod job;
mod service;
mod trigger;

pub use clock::{AnchoredClock, Clock, SystemClock};
pub use job::{Job, JobStatus, PUNCH_OPERATION};
pub use service::{JobScheduler, JobSchedulerBuilder, SchedulerConfig};
pub use trigger::{TimeOfDay, Trigger};
