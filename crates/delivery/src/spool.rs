//! Durable spool for payloads that could not be delivered.
//!
//! One record per failed delivery. `FileSpool` keeps each record as a JSON
//! file named `{endpoint}_{UTC timestamp, µs}.json`; the endpoint tag and the
//! creation time are recovered from the name. Records are published with a
//! write-to-temp then no-clobber link, so a reader never sees a partial file
//! and two writers never overwrite each other. Deletes are idempotent, which
//! makes concurrent replays redundant rather than harmful.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info};
use uuid::Uuid;

use seer_core::Endpoint;

const RECORD_EXT: &str = ".json";
const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S%6f";
/// Collision suffixes tried before giving up on a save.
const MAX_NAME_COLLISIONS: u32 = 1_000;

/// Name of a spooled record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordId(String);

impl RecordId {
    fn new(endpoint_tag: &str, created_at: DateTime<Utc>, collision: u32) -> Self {
        let ts = created_at.format(TIMESTAMP_FORMAT);
        if collision == 0 {
            Self(format!("{endpoint_tag}_{ts}{RECORD_EXT}"))
        } else {
            Self(format!("{endpoint_tag}_{ts}-{collision}{RECORD_EXT}"))
        }
    }

    /// Accept a file name as a record id.
    ///
    /// Hidden files (temp files in flight), names without `.json`, and names
    /// without an `{endpoint}_` prefix are not records.
    pub fn parse(name: &str) -> Option<Self> {
        if name.starts_with('.') {
            return None;
        }
        let stem = name.strip_suffix(RECORD_EXT)?;
        match stem.rsplit_once('_') {
            Some((tag, rest)) if !tag.is_empty() && !rest.is_empty() => {
                Some(Self(name.to_string()))
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The endpoint this record targets. May be a tag this version does not know.
    pub fn endpoint_tag(&self) -> &str {
        self.split().0
    }

    /// Creation time encoded in the name, when it uses this crate's format.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        let ts = self.split().1;
        let ts = ts.split_once('-').map_or(ts, |(ts, _)| ts);
        NaiveDateTime::parse_from_str(ts, TIMESTAMP_FORMAT)
            .ok()
            .map(|naive| naive.and_utc())
    }

    fn split(&self) -> (&str, &str) {
        let stem = self.0.strip_suffix(RECORD_EXT).unwrap_or(&self.0);
        stem.rsplit_once('_').unwrap_or((stem, ""))
    }
}

impl core::fmt::Display for RecordId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("spool I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("record {name} is not valid JSON: {source}")]
    InvalidRecord {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("record not found: {0}")]
    NotFound(RecordId),

    #[error("could not resolve a data directory for the spool")]
    NoDataDir,
}

impl SpoolError {
    fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Storage for undelivered payloads.
pub trait Spool: Send + Sync {
    /// Persist a payload. Never fails the caller: problems are logged and
    /// reported as `None`, since the caller is already handling a failure.
    fn save(&self, payload: &Value, endpoint: Endpoint) -> Option<RecordId>;

    /// Pending records, in no particular order.
    fn list_pending(&self) -> Result<Box<dyn Iterator<Item = RecordId> + '_>, SpoolError>;

    /// Payload and endpoint tag of a record.
    fn load(&self, id: &RecordId) -> Result<(Value, String), SpoolError>;

    /// Remove a record. Removing a missing record is not an error.
    fn delete(&self, id: &RecordId) -> Result<(), SpoolError>;
}

/// Directory-backed spool, shareable between processes.
#[derive(Debug, Clone)]
pub struct FileSpool {
    dir: PathBuf,
}

impl FileSpool {
    /// Spool rooted at `dir`. The directory is created on first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Spool in the per-user data directory.
    pub fn open_default() -> Result<Self, SpoolError> {
        Ok(Self::new(Self::default_dir()?))
    }

    /// `{data_dir}/seer/failed_payloads`, falling back to `~/.local/share`.
    pub fn default_dir() -> Result<PathBuf, SpoolError> {
        let mut dir = dirs::data_dir()
            .or_else(|| {
                dirs::home_dir().map(|mut h| {
                    h.push(".local");
                    h.push("share");
                    h
                })
            })
            .ok_or(SpoolError::NoDataDir)?;

        dir.push("seer");
        dir.push("failed_payloads");
        Ok(dir)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_of(&self, id: &RecordId) -> PathBuf {
        self.dir.join(id.as_str())
    }

    /// Save, reporting failures instead of logging them.
    pub fn try_save(&self, payload: &Value, endpoint: Endpoint) -> Result<RecordId, SpoolError> {
        fs::create_dir_all(&self.dir).map_err(|e| SpoolError::io(&self.dir, e))?;

        let bytes = serde_json::to_vec_pretty(payload)?;
        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", endpoint.tag(), Uuid::now_v7()));

        let result = write_synced(&tmp, &bytes)
            .map_err(|e| SpoolError::io(&tmp, e))
            .and_then(|()| self.publish(&tmp, endpoint));

        // The temp file is gone after a rename, and redundant after a link.
        let _ = fs::remove_file(&tmp);
        result
    }

    /// Give the temp file its final name without clobbering another record.
    fn publish(&self, tmp: &Path, endpoint: Endpoint) -> Result<RecordId, SpoolError> {
        let created_at = Utc::now();

        for collision in 0..MAX_NAME_COLLISIONS {
            let id = RecordId::new(endpoint.tag(), created_at, collision);
            let target = self.path_of(&id);

            match fs::hard_link(tmp, &target) {
                Ok(()) => {
                    sync_dir(&self.dir);
                    return Ok(id);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(_) if target.exists() => continue,
                // Filesystems without hard links.
                Err(_) => {
                    fs::rename(tmp, &target).map_err(|e| SpoolError::io(&target, e))?;
                    sync_dir(&self.dir);
                    return Ok(id);
                }
            }
        }

        Err(SpoolError::io(
            &self.dir,
            io::Error::new(io::ErrorKind::AlreadyExists, "no free record name"),
        ))
    }
}

impl Spool for FileSpool {
    fn save(&self, payload: &Value, endpoint: Endpoint) -> Option<RecordId> {
        match self.try_save(payload, endpoint) {
            Ok(id) => {
                info!(
                    record = %id,
                    path = %self.path_of(&id).display(),
                    "delivery failed, payload spooled; replay to resend"
                );
                Some(id)
            }
            Err(err) => {
                error!(endpoint = %endpoint, error = %err, "failed to spool undelivered payload");
                None
            }
        }
    }

    fn list_pending(&self) -> Result<Box<dyn Iterator<Item = RecordId> + '_>, SpoolError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(Box::new(std::iter::empty()));
            }
            Err(e) => return Err(SpoolError::io(&self.dir, e)),
        };

        Ok(Box::new(entries.filter_map(|entry| {
            let entry = entry.ok()?;
            if !entry.file_type().ok()?.is_file() {
                return None;
            }
            RecordId::parse(entry.file_name().to_str()?)
        })))
    }

    fn load(&self, id: &RecordId) -> Result<(Value, String), SpoolError> {
        let path = self.path_of(id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(SpoolError::NotFound(id.clone()));
            }
            Err(e) => return Err(SpoolError::io(path, e)),
        };

        let payload = serde_json::from_slice(&bytes).map_err(|source| SpoolError::InvalidRecord {
            name: id.to_string(),
            source,
        })?;

        Ok((payload, id.endpoint_tag().to_string()))
    }

    fn delete(&self, id: &RecordId) -> Result<(), SpoolError> {
        let path = self.path_of(id);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(record = %id, "spool record deleted");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SpoolError::io(path, e)),
        }
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = fs::OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

fn sync_dir(dir: &Path) {
    if let Ok(handle) = fs::File::open(dir) {
        let _ = handle.sync_all();
    }
}

/// In-memory spool for tests/dev.
#[derive(Debug, Default)]
pub struct InMemorySpool {
    records: Mutex<BTreeMap<RecordId, Value>>,
}

impl InMemorySpool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record under an arbitrary endpoint tag.
    pub fn insert_raw(&self, endpoint_tag: &str, payload: Value) -> RecordId {
        let mut records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        let created_at = Utc::now();
        let id = (0..)
            .map(|collision| RecordId::new(endpoint_tag, created_at, collision))
            .find(|id| !records.contains_key(id))
            .unwrap_or_else(|| RecordId::new(endpoint_tag, created_at, u32::MAX));
        records.insert(id.clone(), payload);
        id
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all records.
    pub fn records(&self) -> Vec<(RecordId, Value)> {
        self.records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|(id, v)| (id.clone(), v.clone()))
            .collect()
    }
}

impl Spool for InMemorySpool {
    fn save(&self, payload: &Value, endpoint: Endpoint) -> Option<RecordId> {
        Some(self.insert_raw(endpoint.tag(), payload.clone()))
    }

    fn list_pending(&self) -> Result<Box<dyn Iterator<Item = RecordId> + '_>, SpoolError> {
        let ids: Vec<RecordId> = self
            .records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect();
        Ok(Box::new(ids.into_iter()))
    }

    fn load(&self, id: &RecordId) -> Result<(Value, String), SpoolError> {
        self.records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(id)
            .map(|payload| (payload.clone(), id.endpoint_tag().to_string()))
            .ok_or_else(|| SpoolError::NotFound(id.clone()))
    }

    fn delete(&self, id: &RecordId) -> Result<(), SpoolError> {
        self.records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(id);
        Ok(())
    }
}
