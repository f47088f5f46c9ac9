//! Live collection of workload metrics
//!
//! The [`Supervisor`] keeps one monitoring cycle running at a time. Within a
//! cycle the [`EventWatcher`] and the initial enumeration feed workload IDs
//! into the [`WorkloadRegistry`], which starts one stats stream reader per
//! workload and publishes changes on the [`UpdateBus`].

mod bus;
mod events;
mod registry;
mod stream;
mod supervisor;

#[cfg(test)]
mod tests;

pub use bus::{UpdateBus, WorkloadEvent, DEFAULT_BUS_CAPACITY};
pub use events::EventWatcher;
pub use registry::{AdmissionQueue, StopReason, WorkloadRegistry};
pub use supervisor::{CycleError, StreamConfig, Supervisor, SupervisorBuilder, SupervisorConfig};
