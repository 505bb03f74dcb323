//! Cross-resource references.
//!
//! Resources may embed `${resources.<group>.<name>.<field>}` placeholders in
//! their configuration. This module parses and substitutes them and decides
//! whether a referenced field can be known at plan time.

mod reference;
mod resolver;

pub use reference::{Reference, contains_reference, find_references, substitute};
pub use resolver::{ID_FIELD, Resolution, resolve_local_or_remote, resolve_remote};
