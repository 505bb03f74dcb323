//! Planning module for deployment operations.
//!
//! This module compares saved and desired resource states, classifies the
//! result into actions, and carries out those actions one resource at a time.

mod action;
mod classify;
mod diff;
mod executor;
mod path;
mod plan;

pub use action::ActionType;
pub use classify::{Classification, PlannedChange, classify};
pub use diff::{Change, KeyedSlices, diff};
pub use executor::DeploymentUnit;
pub use path::{FieldPath, Segment, key_text, normalize_pattern};
pub use plan::{Plan, PlanEntry};
