//! State locking for concurrent access protection.
//!
//! A lock file next to the snapshot (`<state>.lock`) keeps two processes from
//! running sessions against the same state at once. Locks expire so a crashed
//! process does not block the state forever.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, StateError};

use super::wal::{remove_if_exists, sibling, write_atomic};

/// Lock expiry duration in seconds.
pub const LOCK_EXPIRY_SECS: i64 = 300; // 5 minutes

/// Information about a state lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique lock identifier.
    pub lock_id: String,
    /// Who holds the lock.
    pub holder: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lock expires.
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    /// Creates a new lock info.
    #[must_use]
    pub fn new(holder: &str) -> Self {
        let now = Utc::now();
        Self {
            lock_id: Uuid::new_v4().to_string(),
            holder: holder.to_string(),
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(LOCK_EXPIRY_SECS),
        }
    }

    /// Checks if the lock has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Returns the remaining time until expiry in seconds.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        let remaining = self.expires_at - Utc::now();
        remaining.num_seconds().max(0)
    }
}

/// Lock file guarding a state snapshot.
#[derive(Debug, Clone)]
pub struct StateLock {
    lock_path: PathBuf,
}

impl StateLock {
    /// Creates a lock handle for the snapshot at `state_path`.
    #[must_use]
    pub fn for_state(state_path: &Path) -> Self {
        Self {
            lock_path: sibling(state_path, ".lock"),
        }
    }

    /// Returns the lock file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.lock_path
    }

    /// Acquires the lock, taking over an expired one.
    ///
    /// # Errors
    ///
    /// Returns an error if another process holds an unexpired lock.
    pub async fn acquire(&self, holder: &str) -> Result<LockInfo> {
        if let Some(existing) = self.read().await? {
            if !existing.is_expired() {
                return Err(StateError::LockedByOther {
                    holder: existing.holder,
                    since: existing.acquired_at.to_rfc3339(),
                }
                .into());
            }
            warn!("Expired lock held by {} found, taking over", existing.holder);
        }

        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };

        let lock_info = LockInfo::new(&holder_id);
        let content = serde_json::to_vec_pretty(&lock_info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;
        write_atomic(&self.lock_path, &content).await.map_err(|e| {
            StateError::LockFailed {
                message: e.to_string(),
            }
        })?;

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );
        Ok(lock_info)
    }

    /// Releases the lock if it is still ours.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock file cannot be read or removed.
    pub async fn release(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read().await? {
            if existing.lock_id == lock_id {
                remove_if_exists(&self.lock_path).await?;
                info!("Released state lock: {lock_id}");
            } else {
                debug!(
                    "Lock ID mismatch: expected {lock_id}, found {}",
                    existing.lock_id
                );
            }
        }
        Ok(())
    }

    /// Removes the lock regardless of holder.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock file cannot be removed.
    pub async fn force_release(&self) -> Result<Option<LockInfo>> {
        let existing = self.read().await.unwrap_or_else(|e| {
            warn!("Unreadable lock file will be removed: {e}");
            None
        });
        remove_if_exists(&self.lock_path).await?;
        Ok(existing)
    }

    /// Reads the lock file if it exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock file exists but is unreadable.
    pub async fn read(&self) -> Result<Option<LockInfo>> {
        let content = match fs::read(&self.lock_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StateError::io("read", &self.lock_path)(e)),
        };

        let lock_info = serde_json::from_slice(&content)
            .map_err(|e| StateError::corrupted(format!("Failed to parse lock file: {e}")))?;
        Ok(Some(lock_info))
    }

    /// Returns true if an unexpired lock is held.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock file is unreadable.
    pub async fn is_locked(&self) -> Result<bool> {
        Ok(self.read().await?.is_some_and(|info| !info.is_expired()))
    }
}

/// Generates a unique holder identifier for the current process.
#[must_use]
pub fn generate_holder_id() -> String {
    let hostname = hostname::get().map_or_else(
        |_| String::from("unknown"),
        |h| h.to_string_lossy().to_string(),
    );

    let pid = std::process::id();
    let uuid = &Uuid::new_v4().to_string()[..8];

    format!("{hostname}-{pid}-{uuid}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn lock(dir: &TempDir) -> StateLock {
        StateLock::for_state(&dir.path().join("state.json"))
    }

    #[test]
    fn test_lock_info() {
        let info = LockInfo::new("test-holder");
        assert_eq!(info.holder, "test-holder");
        assert!(!info.is_expired());
        assert!(info.remaining_secs() > 0);
    }

    #[tokio::test]
    async fn test_lock_acquire_release() {
        let dir = TempDir::new().unwrap();
        let lock = lock(&dir);
        assert!(lock.path().ends_with("state.json.lock"));

        let info = lock.acquire("holder").await.unwrap();
        assert!(lock.is_locked().await.unwrap());

        lock.release(&info.lock_id).await.unwrap();
        assert!(!lock.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_lock_conflict() {
        let dir = TempDir::new().unwrap();
        let _first = lock(&dir).acquire("holder-1").await.unwrap();

        let result = lock(&dir).acquire("holder-2").await;
        assert!(matches!(
            result,
            Err(crate::error::KeelError::State(StateError::LockedByOther { .. }))
        ));
    }

    #[tokio::test]
    async fn test_expired_lock_is_taken_over() {
        let dir = TempDir::new().unwrap();
        let lock = lock(&dir);
        let mut stale = LockInfo::new("crashed");
        stale.expires_at = Utc::now() - chrono::Duration::seconds(1);
        fs::write(lock.path(), serde_json::to_vec(&stale).unwrap())
            .await
            .unwrap();

        let info = lock.acquire("holder").await.unwrap();
        assert_eq!(lock.read().await.unwrap(), Some(info));
    }

    #[tokio::test]
    async fn test_force_release() {
        let dir = TempDir::new().unwrap();
        let lock = lock(&dir);
        lock.acquire("holder").await.unwrap();

        let removed = lock.force_release().await.unwrap();
        assert_eq!(removed.map(|i| i.holder), Some(String::from("holder")));
        assert!(!lock.is_locked().await.unwrap());
    }

    #[test]
    fn test_holder_id_generation() {
        let id1 = generate_holder_id();
        let id2 = generate_holder_id();
        assert_ne!(id1, id2);
        assert!(id1.contains(&std::process::id().to_string()));
    }
}
