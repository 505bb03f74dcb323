//! Write-ahead log for state sessions.
//!
//! The WAL is newline-delimited JSON: a [`WalHeader`] line followed by one
//! [`WalEntry`] line per mutation. Every append is flushed to disk before the
//! in-memory state changes.
//!
//! Reading comes in two flavors. Recovery at open time is lenient: lines that
//! fail to parse are copied verbatim to a quarantine file and skipped, which
//! covers a last line truncated by a crash. Reading at finalize time is
//! strict: any unreadable entry is a hard error.

use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{Result, StateError};

use super::types::{WalEntry, WalHeader};

/// Returns `<state>.wal`.
#[must_use]
pub fn wal_path(state_path: &Path) -> PathBuf {
    sibling(state_path, ".wal")
}

/// Returns `<state>.wal.corrupted`.
#[must_use]
pub fn quarantine_path(state_path: &Path) -> PathBuf {
    sibling(state_path, ".wal.corrupted")
}

pub(crate) fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Raw WAL contents split into lines.
#[derive(Debug)]
pub struct WalFile {
    lines: Vec<Vec<u8>>,
}

impl WalFile {
    /// Reads the WAL, returning `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read.
    pub async fn read(path: &Path) -> Result<Option<Self>> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StateError::io("read", path)(e)),
        };

        let lines = bytes
            .split(|&b| b == b'\n')
            .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
            .map(<[u8]>::to_vec)
            .collect();
        Ok(Some(Self { lines }))
    }

    /// Returns true if the file holds no lines at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Parses the header line.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is empty or the header is malformed.
    pub fn header(&self) -> Result<WalHeader> {
        let line = self
            .lines
            .first()
            .ok_or_else(|| StateError::corrupted("WAL has no header"))?;
        serde_json::from_slice(line)
            .map_err(|e| StateError::corrupted(format!("invalid WAL header: {e}")).into())
    }

    /// Parses every entry, failing on the first unreadable line.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::CorruptedWalEntry`] with the one-based line
    /// number of the first bad entry.
    pub fn entries_strict(&self) -> Result<Vec<WalEntry>> {
        self.lines
            .iter()
            .enumerate()
            .skip(1)
            .map(|(i, line)| {
                serde_json::from_slice(line).map_err(|e| {
                    StateError::CorruptedWalEntry {
                        line: i + 1,
                        message: e.to_string(),
                    }
                    .into()
                })
            })
            .collect()
    }

    /// Parses every entry, returning the good ones and the raw bad lines.
    #[must_use]
    pub fn entries_lenient(&self) -> (Vec<WalEntry>, Vec<&[u8]>) {
        let mut entries = Vec::new();
        let mut rejected = Vec::new();
        for (i, line) in self.lines.iter().enumerate().skip(1) {
            match serde_json::from_slice::<WalEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    warn!("Skipping corrupted WAL line {}: {e}", i + 1);
                    rejected.push(line.as_slice());
                }
            }
        }
        (entries, rejected)
    }

    /// Returns every line, header included.
    #[must_use]
    pub fn lines(&self) -> impl Iterator<Item = &[u8]> {
        self.lines.iter().map(Vec::as_slice)
    }
}

/// Appends rejected lines verbatim to the quarantine file.
///
/// # Errors
///
/// Returns an error if the quarantine file cannot be written.
pub async fn quarantine(path: &Path, lines: &[&[u8]]) -> Result<()> {
    if lines.is_empty() {
        return Ok(());
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(StateError::io("open", path))?;
    for line in lines {
        file.write_all(line)
            .await
            .map_err(StateError::io("write", path))?;
        file.write_all(b"\n")
            .await
            .map_err(StateError::io("write", path))?;
    }
    file.sync_data()
        .await
        .map_err(StateError::io("sync", path))?;
    warn!(
        "Quarantined {} WAL line(s) to {}",
        lines.len(),
        path.display()
    );
    Ok(())
}

/// Append handle on the WAL.
#[derive(Debug)]
pub struct WalWriter {
    path: PathBuf,
    file: File,
}

impl WalWriter {
    /// Opens the WAL for appending, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .await
                .map_err(StateError::io("create directory for", path))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(StateError::io("open", path))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Writes the session header.
    ///
    /// # Errors
    ///
    /// Returns an error if the line cannot be written or synced.
    pub async fn write_header(&mut self, header: &WalHeader) -> Result<()> {
        debug!(
            "Starting WAL session {} for serial {}",
            header.lineage, header.serial
        );
        self.append_line(header).await
    }

    /// Appends one entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the line cannot be written or synced.
    pub async fn append(&mut self, entry: &WalEntry) -> Result<()> {
        self.append_line(entry).await
    }

    async fn append_line<T: serde::Serialize>(&mut self, value: &T) -> Result<()> {
        let mut line = serde_json::to_vec(value)
            .map_err(|e| StateError::serialization(format!("Failed to encode WAL line: {e}")))?;
        line.push(b'\n');
        self.file
            .write_all(&line)
            .await
            .map_err(StateError::io("append to", &self.path))?;
        self.file
            .sync_data()
            .await
            .map_err(StateError::io("sync", &self.path))?;
        Ok(())
    }
}

/// Writes a file atomically: temp file, fsync, rename.
///
/// # Errors
///
/// Returns an error if any step fails.
pub async fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .await
            .map_err(StateError::io("create directory for", path))?;
    }

    let temp_path = sibling(path, ".tmp");
    let mut file = File::create(&temp_path)
        .await
        .map_err(StateError::io("create", &temp_path))?;
    file.write_all(content)
        .await
        .map_err(StateError::io("write", &temp_path))?;
    file.sync_all()
        .await
        .map_err(StateError::io("sync", &temp_path))?;
    drop(file);

    fs::rename(&temp_path, path)
        .await
        .map_err(StateError::io("rename into", path))?;
    Ok(())
}

/// Removes a file, ignoring a missing one.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be removed.
pub async fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StateError::io("remove", path)(e)),
    }
}
