//! On-disk records of attach-mode sessions.
//!
//! A multiplexer pane outlives the server, so its attachment is recorded
//! under `<data_dir>/sessions/<id>.json` and re-established on the next
//! start. Local PTY sessions die with the server and are never recorded.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::model::{MultiplexerTarget, SessionError, SessionId};

/// A persisted attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredSession {
    pub id: SessionId,
    pub name: String,
    pub target: MultiplexerTarget,
    pub created_at: u64,
}

/// Directory of [`StoredSession`] records.
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    /// Store rooted at `<data_dir>/sessions`.
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            dir: data_dir.as_ref().join("sessions"),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    /// Write (or overwrite) a record.
    pub fn save(&self, record: &StoredSession) -> Result<(), SessionError> {
        std::fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_vec_pretty(record)
            .map_err(|e| SessionError::Io(std::io::Error::other(e)))?;

        // Atomic replace.
        let tmp = self.dir.join(format!(".{}.json.tmp", record.id));
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, self.path_for(&record.id))?;
        Ok(())
    }

    /// Delete a record. Missing records are not an error.
    pub fn remove(&self, id: &str) -> Result<(), SessionError> {
        match std::fs::remove_file(self.path_for(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// All readable records. Unreadable files are logged and skipped.
    pub fn load_all(&self) -> Vec<StoredSession> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let mut records: Vec<StoredSession> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .filter_map(|path| {
                let parsed = std::fs::read(&path)
                    .map_err(|e| e.to_string())
                    .and_then(|bytes| {
                        serde_json::from_slice::<StoredSession>(&bytes).map_err(|e| e.to_string())
                    });
                match parsed {
                    Ok(record) => Some(record),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable session record");
                        None
                    }
                }
            })
            .collect();

        records.sort_by_key(|r| r.created_at);
        records
    }
}
