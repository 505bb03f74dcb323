//! Dependency graph and scheduler.
//!
//! Plan and Apply both walk a [`Graph`] of resource keys with a
//! [`Scheduler`]; a node runs once every predecessor has completed and a
//! failure is propagated to everything downstream of it.

mod dag;
mod scheduler;

pub use dag::{Direction, Graph};
pub use scheduler::{NodeOutcome, RunReport, Scheduler};
