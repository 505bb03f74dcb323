//! WAL-backed state store.
//!
//! The store keeps the snapshot in memory behind one async mutex. Mutations
//! are appended to the WAL (and synced) before memory changes; [`StateStore::finalize`]
//! folds the session into a new snapshot and removes the WAL.
//!
//! [`StateStore::open_read_only`] replays a pending WAL in memory without
//! touching any file, for commands that run without the state lock.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{KeelError, Result, StateError};

use super::types::{
    CLI_VERSION, Database, ExportedResource, ExportedState, ResourceEntry, STATE_VERSION,
    WalEntry, WalHeader, split_key,
};
use super::wal::{
    WalFile, WalWriter, quarantine, quarantine_path, remove_if_exists, wal_path, write_atomic,
};

/// Durable key/value store of resource entries.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    wal_path: PathBuf,
    read_only: bool,
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    db: Database,
    writer: Option<WalWriter>,
    /// The WAL holds a header for the current session.
    session_open: bool,
}

impl StateStore {
    /// Opens the store, recovering any WAL left by an interrupted session.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot is unreadable, or the WAL is ahead of
    /// the snapshot or belongs to another lineage.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let wal_path = wal_path(&path);
        let mut db = load_snapshot(&path).await?;
        let session_open = recover(&path, &wal_path, &mut db).await?;
        Ok(Self::from_parts(path, wal_path, db, session_open, false))
    }

    /// Opens the store for reading. A pending WAL is replayed in memory only:
    /// nothing is quarantined, rewritten or removed, so a session running in
    /// another process keeps appending to the same file. Mutations fail with
    /// [`StateError::ReadOnly`].
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot is unreadable, or the WAL is ahead of
    /// the snapshot or belongs to another lineage.
    pub async fn open_read_only(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let wal_path = wal_path(&path);
        let mut db = load_snapshot(&path).await?;
        let pending = replay_in_memory(&wal_path, &mut db).await?;
        Ok(Self::from_parts(path, wal_path, db, pending, true))
    }

    fn from_parts(
        path: PathBuf,
        wal_path: PathBuf,
        db: Database,
        session_open: bool,
        read_only: bool,
    ) -> Self {
        info!(
            "Opened state {}{} (serial {}, {} resource(s))",
            path.display(),
            if read_only { " read-only" } else { "" },
            db.serial,
            db.state.len()
        );
        Self {
            path,
            wal_path,
            read_only,
            inner: Mutex::new(Inner {
                db,
                writer: None,
                session_open,
            }),
        }
    }

    /// Returns the snapshot path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the entry for a key.
    pub async fn get(&self, key: &str) -> Option<ResourceEntry> {
        self.inner.lock().await.db.state.get(key).cloned()
    }

    /// Returns a copy of every entry.
    pub async fn entries(&self) -> BTreeMap<String, ResourceEntry> {
        self.inner.lock().await.db.state.clone()
    }

    /// Returns a copy of the in-memory database.
    pub async fn database(&self) -> Database {
        self.inner.lock().await.db.clone()
    }

    /// Returns the current serial.
    pub async fn serial(&self) -> u64 {
        self.inner.lock().await.db.serial
    }

    /// Returns true if the WAL holds mutations not yet folded into the
    /// snapshot, whether from this process or a recovered session.
    pub async fn has_pending_session(&self) -> bool {
        self.inner.lock().await.session_open
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(StateError::ReadOnly {
                path: self.path.display().to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Records a new entry for a key.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry has an empty ID or the WAL append fails.
    pub async fn save_state(&self, key: &str, entry: ResourceEntry) -> Result<()> {
        if entry.id.is_empty() {
            return Err(StateError::EmptyId {
                key: key.to_string(),
            }
            .into());
        }

        let mut inner = self.inner.lock().await;
        let record = WalEntry {
            k: key.to_string(),
            v: Some(entry),
        };
        self.append(&mut inner, &record).await?;
        debug!("Saved state for {key}");
        if let Some(entry) = record.v {
            inner.db.state.insert(record.k, entry);
        }
        Ok(())
    }

    /// Records the removal of a key.
    ///
    /// # Errors
    ///
    /// Returns an error if the WAL append fails.
    pub async fn delete_state(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let record = WalEntry {
            k: key.to_string(),
            v: None,
        };
        self.append(&mut inner, &record).await?;
        debug!("Deleted state for {key}");
        inner.db.state.remove(key);
        Ok(())
    }

    async fn append(&self, inner: &mut Inner, record: &WalEntry) -> Result<()> {
        self.ensure_writable()?;
        if inner.writer.is_none() {
            inner.writer = Some(WalWriter::open(&self.wal_path).await?);
        }
        if !inner.session_open {
            if inner.db.lineage.is_empty() {
                inner.db.lineage = uuid::Uuid::new_v4().to_string();
            }
            let header = WalHeader {
                lineage: inner.db.lineage.clone(),
                serial: inner.db.serial + 1,
            };
            if let Some(writer) = inner.writer.as_mut() {
                writer.write_header(&header).await?;
            }
            inner.session_open = true;
        }
        match inner.writer.as_mut() {
            Some(writer) => writer.append(record).await,
            None => Err(KeelError::internal("WAL writer is not open")),
        }
    }

    /// Commits the session: replays the WAL, bumps the serial by one, writes
    /// the snapshot atomically and removes the WAL.
    ///
    /// # Errors
    ///
    /// Returns an error if a WAL entry written by this session cannot be read
    /// back, or the snapshot cannot be written.
    pub async fn finalize(&self) -> Result<u64> {
        self.ensure_writable()?;
        let mut inner = self.inner.lock().await;
        inner.writer = None;

        // Memory only moves to the next serial once the snapshot is on disk.
        let mut next = inner.db.clone();
        if inner.session_open
            && let Some(wal) = WalFile::read(&self.wal_path).await?
        {
            let header = wal.header()?;
            if header.serial != next.serial + 1 {
                return Err(StateError::WalAhead {
                    wal_serial: header.serial,
                    expected: next.serial + 1,
                }
                .into());
            }
            for entry in wal.entries_strict()? {
                apply(&mut next.state, entry);
            }
        }

        if next.lineage.is_empty() {
            next.lineage = uuid::Uuid::new_v4().to_string();
        }
        next.serial += 1;
        next.state_version = STATE_VERSION;
        next.cli_version = CLI_VERSION.to_string();

        let content = serde_json::to_vec_pretty(&next)
            .map_err(|e| StateError::serialization(format!("Failed to serialize state: {e}")))?;
        write_atomic(&self.path, &content).await?;
        remove_if_exists(&self.wal_path).await?;

        inner.db = next;
        inner.session_open = false;
        info!(
            "Committed state {} at serial {}",
            self.path.display(),
            inner.db.serial
        );
        Ok(inner.db.serial)
    }

    /// Returns group → name → {ID, ETag} for every entry.
    pub async fn export(&self) -> ExportedState {
        let inner = self.inner.lock().await;
        let mut exported = ExportedState::new();
        for (key, entry) in &inner.db.state {
            let Some((group, name)) = split_key(key) else {
                warn!("Skipping malformed state key {key} in export");
                continue;
            };
            exported.entry(group.to_string()).or_default().insert(
                name.to_string(),
                ExportedResource {
                    id: entry.id.clone(),
                    etag: entry.etag().map(ToString::to_string),
                },
            );
        }
        exported
    }
}

fn apply(state: &mut BTreeMap<String, ResourceEntry>, entry: WalEntry) {
    match entry.v {
        Some(value) => {
            state.insert(entry.k, value);
        }
        None => {
            state.remove(&entry.k);
        }
    }
}

async fn load_snapshot(path: &Path) -> Result<Database> {
    let content = match tokio::fs::read(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("State file does not exist: {}", path.display());
            // Lineage is assigned when the first session starts, or adopted
            // from a WAL left by an uncommitted first session.
            return Ok(Database {
                lineage: String::new(),
                ..Database::new()
            });
        }
        Err(e) => return Err(StateError::io("read", path)(e)),
    };

    let db: Database = serde_json::from_slice(&content)
        .map_err(|e| StateError::corrupted(format!("Failed to parse state file: {e}")))?;
    if db.state_version > STATE_VERSION {
        return Err(StateError::VersionMismatch {
            expected: STATE_VERSION,
            found: db.state_version,
        }
        .into());
    }
    if let Some((key, _)) = db.state.iter().find(|(_, entry)| entry.id.is_empty()) {
        return Err(StateError::corrupted(format!("entry {key} has an empty ID")).into());
    }
    Ok(db)
}

/// Replays a WAL left by an interrupted session. Returns true if the session
/// is still open (its WAL was kept).
async fn recover(path: &Path, wal_path: &Path, db: &mut Database) -> Result<bool> {
    let Some(wal) = WalFile::read(wal_path).await? else {
        return Ok(false);
    };
    if wal.is_empty() {
        remove_if_exists(wal_path).await?;
        return Ok(false);
    }

    let quarantine_to = quarantine_path(path);
    let header = match wal.header() {
        Ok(header) => header,
        Err(e) => {
            warn!("Discarding WAL with unreadable header: {e}");
            let lines: Vec<&[u8]> = wal.lines().collect();
            quarantine(&quarantine_to, &lines).await?;
            remove_if_exists(wal_path).await?;
            return Ok(false);
        }
    };

    let expected = db.serial + 1;
    if header.serial < expected {
        info!(
            "Removing stale WAL (serial {} already committed)",
            header.serial
        );
        remove_if_exists(wal_path).await?;
        return Ok(false);
    }
    check_header(&header, db)?;

    let (entries, rejected) = wal.entries_lenient();
    quarantine(&quarantine_to, &rejected).await?;

    info!(
        "Recovering {} WAL entr{} for serial {}",
        entries.len(),
        if entries.len() == 1 { "y" } else { "ies" },
        header.serial
    );

    // Rewrite the WAL with only readable lines so the strict read at
    // finalize sees exactly what was replayed.
    let mut clean = serde_json::to_vec(&header)
        .map_err(|e| StateError::serialization(format!("Failed to encode WAL header: {e}")))?;
    clean.push(b'\n');
    for entry in &entries {
        serde_json::to_writer(&mut clean, entry)
            .map_err(|e| StateError::serialization(format!("Failed to encode WAL entry: {e}")))?;
        clean.push(b'\n');
    }
    write_atomic(wal_path, &clean).await?;
    debug!("Rewrote WAL {}", wal_path.display());

    for entry in entries {
        apply(&mut db.state, entry);
    }
    Ok(true)
}

/// Applies a pending WAL to `db` without writing anything. Returns true if
/// entries of an uncommitted session were applied.
async fn replay_in_memory(wal_path: &Path, db: &mut Database) -> Result<bool> {
    let Some(wal) = WalFile::read(wal_path).await? else {
        return Ok(false);
    };
    let header = match wal.header() {
        Ok(header) => header,
        Err(e) => {
            if !wal.is_empty() {
                warn!("Ignoring WAL with unreadable header: {e}");
            }
            return Ok(false);
        }
    };

    let expected = db.serial + 1;
    if header.serial < expected {
        debug!("Ignoring stale WAL (serial {})", header.serial);
        return Ok(false);
    }
    check_header(&header, db)?;

    let (entries, rejected) = wal.entries_lenient();
    if !rejected.is_empty() {
        warn!("Ignoring {} unreadable WAL line(s)", rejected.len());
    }
    debug!(
        "Replaying {} pending WAL entr{} in memory",
        entries.len(),
        if entries.len() == 1 { "y" } else { "ies" }
    );
    for entry in entries {
        apply(&mut db.state, entry);
    }
    Ok(true)
}

/// Rejects a WAL written past the next serial or for another lineage, and
/// adopts the WAL's lineage when the snapshot has none yet.
fn check_header(header: &WalHeader, db: &mut Database) -> Result<()> {
    let expected = db.serial + 1;
    if header.serial > expected {
        return Err(StateError::WalAhead {
            wal_serial: header.serial,
            expected,
        }
        .into());
    }
    if db.lineage.is_empty() {
        db.lineage.clone_from(&header.lineage);
    } else if !header.lineage.is_empty() && header.lineage != db.lineage {
        return Err(StateError::LineageMismatch {
            wal: header.lineage.clone(),
            state: db.lineage.clone(),
        }
        .into());
    }
    Ok(())
}
