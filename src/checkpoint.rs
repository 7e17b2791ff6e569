use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use tempfile::NamedTempFile;

use crate::log_warn;
use crate::types::SessionState;

/// A loaded checkpoint is "stale" once this much time has passed since its
/// `last_updated` (§4.1).
pub const STALE_RECOVERY: Duration = Duration::from_secs(24 * 60 * 60);

/// Single-writer checkpoint store for one project directory (§4.1).
///
/// All mutations to `<project>/.agent/session_state.json` go through one
/// `CheckpointStore`; an internal mutex serializes concurrent writes from
/// within a single worker process.
pub struct CheckpointStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl CheckpointStore {
    pub fn new(project_dir: &Path) -> CheckpointStore {
        CheckpointStore {
            path: project_dir.join(".agent").join("session_state.json"),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serialize `state` to JSON and atomically replace the checkpoint
    /// file: write to a sibling temp file in the same directory, `fsync`,
    /// then rename over the target. On any error the temp file is removed
    /// and the previous target is left untouched.
    pub fn save(&self, state: &SessionState) -> Result<(), String> {
        let _guard = self.write_lock.lock().map_err(|e| e.to_string())?;

        let parent = self
            .path
            .parent()
            .ok_or_else(|| "checkpoint path has no parent directory".to_string())?;
        fs::create_dir_all(parent)
            .map_err(|e| format!("failed to create {}: {}", parent.display(), e))?;

        let json = serde_json::to_string_pretty(state)
            .map_err(|e| format!("failed to serialize session state: {}", e))?;

        let temp_file = NamedTempFile::new_in(parent)
            .map_err(|e| format!("failed to create temp file: {}", e))?;

        if let Err(e) = fs::write(temp_file.path(), &json) {
            return Err(format!("failed to write temp checkpoint: {}", e));
        }

        let file = fs::File::open(temp_file.path())
            .map_err(|e| format!("failed to reopen temp checkpoint: {}", e))?;
        file.sync_all()
            .map_err(|e| format!("failed to fsync temp checkpoint: {}", e))?;

        temp_file
            .persist(&self.path)
            .map_err(|e| format!("failed to rename checkpoint into place: {}", e))?;

        Ok(())
    }

    /// Load the checkpoint, returning `None` if absent. A parse error is
    /// treated as corruption: logged, `None` returned, the file is left
    /// in place (not auto-deleted).
    pub fn load(&self) -> Option<SessionState> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(_) => return None,
        };

        match serde_json::from_str(&contents) {
            Ok(state) => Some(state),
            Err(e) => {
                log_warn!(
                    "Checkpoint at {} failed to parse, treating as absent: {}",
                    self.path.display(),
                    e
                );
                None
            }
        }
    }

    /// Remove the checkpoint file if present. Idempotent.
    pub fn clear(&self) -> Result<(), String> {
        let _guard = self.write_lock.lock().map_err(|e| e.to_string())?;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(format!("failed to remove checkpoint: {}", e)),
        }
    }
}

/// True if `state.last_updated` is more than `STALE_RECOVERY` in the past.
pub fn is_stale(state: &SessionState) -> bool {
    let age = Utc::now().signed_duration_since(state.last_updated);
    age.to_std().map(|d| d > STALE_RECOVERY).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Phase;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let mut state = SessionState::start("ENG-1");
        state.transition_to(Phase::StatusCheck);

        store.save(&state).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn load_absent_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        assert!(store.load().is_none());
    }

    #[test]
    fn clear_then_load_is_none_and_clear_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let state = SessionState::start("ENG-1");
        store.save(&state).unwrap();

        store.clear().unwrap();
        assert!(store.load().is_none());
        store.clear().unwrap();
    }

    #[test]
    fn corrupt_file_is_treated_as_absent_and_not_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        fs::create_dir_all(dir.path().join(".agent")).unwrap();
        fs::write(store.path(), "{ not json").unwrap();

        assert!(store.load().is_none());
        assert!(store.path().exists());
    }

    #[test]
    fn staleness_threshold() {
        let mut state = SessionState::start("ENG-1");
        assert!(!is_stale(&state));

        state.last_updated = Utc::now() - ChronoDuration::hours(25);
        assert!(is_stale(&state));

        state.last_updated = Utc::now() - ChronoDuration::hours(23);
        assert!(!is_stale(&state));
    }
}
