//! Action types and their severity ordering.
//!
//! The variant order of [`ActionType`] is the severity scale used to pick a
//! single action when several fields of a resource change at once.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Action to take on a single resource.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// No decision has been made yet.
    #[default]
    Unset,
    /// The resource is up to date.
    Noop,
    /// In-place resize that keeps the remote identifier.
    Resize,
    /// In-place update that keeps the remote identifier.
    Update,
    /// Update that may assign a new remote identifier.
    UpdateWithId,
    /// The resource does not exist yet.
    Create,
    /// Delete and create again.
    Recreate,
    /// The resource is no longer configured.
    Delete,
}

impl ActionType {
    /// Every action in severity order.
    pub const ALL: [Self; 8] = [
        Self::Unset,
        Self::Noop,
        Self::Resize,
        Self::Update,
        Self::UpdateWithId,
        Self::Create,
        Self::Recreate,
        Self::Delete,
    ];

    /// Returns true if the action is guaranteed not to change the remote ID.
    #[must_use]
    pub const fn keeps_id(self) -> bool {
        matches!(self, Self::Noop | Self::Resize | Self::Update)
    }

    /// Returns true for actions assigned from resource presence rather than
    /// from field changes.
    #[must_use]
    pub const fn is_structural(self) -> bool {
        matches!(self, Self::Unset | Self::Create | Self::Delete)
    }

    /// Returns true if applying the action calls the remote.
    #[must_use]
    pub const fn has_changes(self) -> bool {
        !matches!(self, Self::Unset | Self::Noop)
    }

    /// Returns the action name as written in configuration and output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unset => "unset",
            Self::Noop => "noop",
            Self::Resize => "resize",
            Self::Update => "update",
            Self::UpdateWithId => "update_with_id",
            Self::Create => "create",
            Self::Recreate => "recreate",
            Self::Delete => "delete",
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| format!("unknown action: {s}"))
    }
}
