// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(dead_code)]                   // Unused code is forbidden
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Keel Deploy
//!
//! A declarative deployment engine for interdependent remote resources.
//!
//! ## Overview
//!
//! Keel compares the resources declared in a configuration file with the
//! last recorded state and drives the remote control plane toward the
//! declared configuration:
//!
//! - Resources reference each other with `${resources.<group>.<name>.<field>}`
//! - Each change is classified into a single action per resource
//! - Resources are planned and applied in dependency order, in parallel
//! - Every successful mutation is logged to a write-ahead log before the
//!   state snapshot is rewritten, so an interrupted run loses nothing
//!
//! ## Architecture
//!
//! 1. **Plan**: walk the dependency graph, resolve references where they are
//!    already known and classify each resource into an [`planner::ActionType`]
//! 2. **Apply**: walk the graph again, substitute the remaining references
//!    and run one [`planner::DeploymentUnit`] per resource
//! 3. **Finalize**: fold the write-ahead log into a new state snapshot
//!
//! ## Modules
//!
//! - [`config`]: Configuration parsing and validation
//! - [`adapter`]: The per-group adapter contract and the REST adapter
//! - [`refs`]: Reference parsing, substitution and resolution
//! - [`graph`]: Dependency graph and bounded parallel scheduler
//! - [`planner`]: Diffing, action classification and the deployment unit
//! - [`state`]: Write-ahead-logged state store and state lock
//! - [`reconciler`]: Plan and apply engine
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: analytics
//!   environment: dev
//!
//! remote:
//!   base_url: https://api.example.com
//!   token_env: KEEL_TOKEN
//!
//! adapters:
//!   storage:
//!     path: /api/storage
//!     remote_fields: [url]
//!   jobs:
//!     path: /api/jobs
//!     triggers: { name: update }
//!
//! resources:
//!   storage:
//!     raw: { name: raw-data }
//!   jobs:
//!     ingest:
//!       name: ingest
//!       target: "${resources.storage.raw.url}"
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod adapter;
pub mod cli;
pub mod config;
pub mod error;
pub mod graph;
pub mod planner;
pub mod reconciler;
pub mod refs;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use adapter::{Adapter, AdapterRegistry, RestAdapter};
pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, DeployConfig};
pub use error::{KeelError, Result};
pub use graph::{Graph, Scheduler};
pub use planner::{ActionType, DeploymentUnit, Plan, PlanEntry};
pub use reconciler::{ApplyReport, ReconcileOptions, Reconciler};
pub use state::{StateLock, StateStore};
