//! Whole-file JSON session store.
//!
//! The file at `<data_dir>/sessions.json` holds `{"sessions":[...]}`. Every
//! write serializes the full mirror to `sessions.json.tmp`, fsyncs it, and
//! renames it over the target, so readers see either the old or the new
//! snapshot.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use docent_core::error::DocentError;
use docent_core::types::SessionRecord;

/// File name of the store inside the data directory.
pub const STORE_FILE_NAME: &str = "sessions.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    sessions: Vec<SessionRecord>,
}

/// Durable map of session id to [`SessionRecord`].
///
/// Writers serialize on the mirror's mutex; the lock is held across the
/// file write so the file always matches some state the mirror passed
/// through.
pub struct SessionStore {
    path: PathBuf,
    mirror: Mutex<HashMap<String, SessionRecord>>,
}

impl SessionStore {
    /// Open the store in `data_dir`, creating the directory if needed.
    ///
    /// A missing file yields an empty store. An unreadable or malformed
    /// file is logged and also treated as empty; it stays on disk until the
    /// next successful save replaces it.
    pub fn open(data_dir: &Path) -> Result<Self, DocentError> {
        fs::create_dir_all(data_dir).map_err(|e| {
            DocentError::Storage(format!(
                "Failed to create data directory {}: {}",
                data_dir.display(),
                e
            ))
        })?;

        let path = data_dir.join(STORE_FILE_NAME);
        let sessions = Self::read_file(&path);
        info!(path = %path.display(), sessions = sessions.len(), "Session store opened");

        Ok(Self {
            path,
            mirror: Mutex::new(sessions),
        })
    }

    /// Read the store file from disk, bypassing the mirror.
    pub fn load(&self) -> HashMap<String, SessionRecord> {
        Self::read_file(&self.path)
    }

    /// Replace the whole store with `sessions` and write it out.
    pub fn save(&self, sessions: HashMap<String, SessionRecord>) -> Result<(), DocentError> {
        let mut mirror = self.lock()?;
        Self::write_file(&self.path, &sessions)?;
        *mirror = sessions;
        Ok(())
    }

    /// Insert or replace one record and write the store.
    pub fn upsert(&self, record: SessionRecord) -> Result<(), DocentError> {
        let mut mirror = self.lock()?;
        let id = record.id.clone();
        let previous = mirror.insert(id.clone(), record);
        if let Err(e) = Self::write_file(&self.path, &mirror) {
            // Keep the mirror equal to what is on disk.
            match previous {
                Some(prev) => mirror.insert(id, prev),
                None => mirror.remove(&id),
            };
            return Err(e);
        }
        debug!(session_id = %id, "Session record saved");
        Ok(())
    }

    /// Remove one record and write the store. Returns whether it existed.
    pub fn remove(&self, id: &str) -> Result<bool, DocentError> {
        let mut mirror = self.lock()?;
        let Some(previous) = mirror.remove(id) else {
            return Ok(false);
        };
        if let Err(e) = Self::write_file(&self.path, &mirror) {
            mirror.insert(id.to_string(), previous);
            return Err(e);
        }
        debug!(session_id = %id, "Session record removed");
        Ok(true)
    }

    pub fn get(&self, id: &str) -> Option<SessionRecord> {
        self.lock().ok().and_then(|m| m.get(id).cloned())
    }

    /// All records, most recently updated first.
    pub fn list(&self) -> Vec<SessionRecord> {
        let mut records: Vec<SessionRecord> = match self.lock() {
            Ok(m) => m.values().cloned().collect(),
            Err(_) => Vec::new(),
        };
        records.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        records
    }

    pub fn len(&self) -> usize {
        self.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, SessionRecord>>, DocentError> {
        self.mirror
            .lock()
            .map_err(|e| DocentError::Storage(format!("Session store lock poisoned: {}", e)))
    }

    fn read_file(path: &Path) -> HashMap<String, SessionRecord> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return HashMap::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Session store unreadable; starting empty");
                return HashMap::new();
            }
        };

        if content.trim().is_empty() {
            return HashMap::new();
        }

        match serde_json::from_str::<StoreFile>(&content) {
            Ok(file) => file
                .sessions
                .into_iter()
                .map(|record| (record.id.clone(), record))
                .collect(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Session store malformed; starting empty");
                HashMap::new()
            }
        }
    }

    fn write_file(
        path: &Path,
        sessions: &HashMap<String, SessionRecord>,
    ) -> Result<(), DocentError> {
        let mut records: Vec<SessionRecord> = sessions.values().cloned().collect();
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        let json = serde_json::to_string_pretty(&StoreFile { sessions: records })?;

        let tmp_path = temp_path(path);
        let write = || -> std::io::Result<()> {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(json.as_bytes())?;
            tmp.sync_all()?;
            drop(tmp);
            fs::rename(&tmp_path, path)
        };

        write().map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            DocentError::Storage(format!("Failed to write {}: {}", path.display(), e))
        })
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("path", &self.path)
            .field("sessions", &self.len())
            .finish()
    }
}

/// `sessions.json` -> `sessions.json.tmp`, in the same directory.
fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
