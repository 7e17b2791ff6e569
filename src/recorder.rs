use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

use chrono::Utc;
use tempfile::NamedTempFile;

use crate::budget::truncate;
use crate::log_warn;
use crate::types::{SessionEvent, SessionFile, SessionFileStatus};

pub const MAX_SESSIONS: u32 = 50;
const SESSION_FILE_PREFIX: &str = "session-";
const SESSION_FILE_SUFFIX: &str = ".json";

struct ActiveSession {
    session_id: u32,
    issue_id: String,
    started_at: std::time::SystemTime,
    clock_start: Instant,
    events: Vec<SessionEvent>,
}

/// One active session per worker, appending events and rotating files on
/// disk (§4.5). Thread-safe: `record_event` is guarded by an internal
/// mutex so a helper thread emitting tool-call events cannot corrupt the
/// in-memory event list.
pub struct SessionRecorder {
    sessions_dir: PathBuf,
    max_sessions: u32,
    active: Mutex<Option<ActiveSession>>,
}

impl SessionRecorder {
    pub fn new(project_dir: &Path, max_sessions: u32) -> SessionRecorder {
        SessionRecorder {
            sessions_dir: project_dir.join(".agent").join("sessions"),
            max_sessions,
            active: Mutex::new(None),
        }
    }

    /// Allocate the next session number (directory scan for
    /// `session-<N>.json`, take `max + 1`, or `1` if none) and start
    /// recording. Errors if a session is already active.
    pub fn start(&self, issue_id: &str) -> Result<u32, String> {
        let mut guard = self.active.lock().map_err(|e| e.to_string())?;
        if guard.is_some() {
            return Err("session recorder already has an active session".to_string());
        }

        fs::create_dir_all(&self.sessions_dir)
            .map_err(|e| format!("failed to create sessions dir: {}", e))?;

        let next_id = self.scan_max_session_id()?.map(|n| n + 1).unwrap_or(1);

        *guard = Some(ActiveSession {
            session_id: next_id,
            issue_id: issue_id.to_string(),
            started_at: std::time::SystemTime::now(),
            clock_start: Instant::now(),
            events: Vec::new(),
        });

        Ok(next_id)
    }

    /// Append an event with `t = now - started_at`. Truncates `result_preview`
    /// / `output_preview` fields inside `data` per §4.4.
    pub fn record_event(
        &self,
        event_type: &str,
        mut data: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), String> {
        let mut guard = self.active.lock().map_err(|e| e.to_string())?;
        let session = guard
            .as_mut()
            .ok_or_else(|| "no active session to record into".to_string())?;

        for key in ["result_preview", "output_preview"] {
            if let Some(serde_json::Value::String(s)) = data.get(key) {
                let truncated = truncate(s);
                data.insert(key.to_string(), serde_json::Value::String(truncated));
            }
        }

        session.events.push(SessionEvent {
            t: session.clock_start.elapsed().as_secs_f64(),
            event_type: event_type.to_string(),
            data,
        });
        Ok(())
    }

    /// Finalize the active session: write the file atomically, then rotate
    /// so the directory keeps at most `max_sessions` files (oldest deleted
    /// first). Errors if no session is active.
    pub fn end(&self, status: SessionFileStatus) -> Result<(), String> {
        let mut guard = self.active.lock().map_err(|e| e.to_string())?;
        let session = guard
            .take()
            .ok_or_else(|| "no active session to end".to_string())?;

        let started_at: chrono::DateTime<Utc> = session.started_at.into();
        let file = SessionFile {
            session_id: session.session_id,
            started_at,
            ended_at: Some(Utc::now()),
            issue_id: session.issue_id,
            status,
            events: session.events,
        };

        self.write_session_file(&file)?;
        self.rotate()?;
        Ok(())
    }

    fn session_path(&self, id: u32) -> PathBuf {
        self.sessions_dir
            .join(format!("{}{}{}", SESSION_FILE_PREFIX, id, SESSION_FILE_SUFFIX))
    }

    fn write_session_file(&self, file: &SessionFile) -> Result<(), String> {
        fs::create_dir_all(&self.sessions_dir)
            .map_err(|e| format!("failed to create sessions dir: {}", e))?;

        let json = serde_json::to_string_pretty(file)
            .map_err(|e| format!("failed to serialize session file: {}", e))?;

        let temp_file = NamedTempFile::new_in(&self.sessions_dir)
            .map_err(|e| format!("failed to create temp file: {}", e))?;
        fs::write(temp_file.path(), &json)
            .map_err(|e| format!("failed to write temp session file: {}", e))?;

        let fsync_handle = fs::File::open(temp_file.path())
            .map_err(|e| format!("failed to reopen temp session file: {}", e))?;
        fsync_handle
            .sync_all()
            .map_err(|e| format!("failed to fsync temp session file: {}", e))?;

        temp_file
            .persist(self.session_path(file.session_id))
            .map_err(|e| format!("failed to rename session file into place: {}", e))?;
        Ok(())
    }

    fn scan_max_session_id(&self) -> Result<Option<u32>, String> {
        let mut max: Option<u32> = None;
        let entries = match fs::read_dir(&self.sessions_dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(format!("failed to scan sessions dir: {}", e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| e.to_string())?;
            if let Some(id) = parse_session_id(&entry.file_name().to_string_lossy()) {
                max = Some(max.map_or(id, |m: u32| m.max(id)));
            }
        }
        Ok(max)
    }

    /// Delete the lowest-numbered session files until the directory holds
    /// at most `max_sessions`.
    fn rotate(&self) -> Result<(), String> {
        let mut ids: Vec<u32> = Vec::new();
        let entries = fs::read_dir(&self.sessions_dir).map_err(|e| e.to_string())?;
        for entry in entries {
            let entry = entry.map_err(|e| e.to_string())?;
            if let Some(id) = parse_session_id(&entry.file_name().to_string_lossy()) {
                ids.push(id);
            }
        }
        ids.sort_unstable();

        if ids.len() as u32 <= self.max_sessions {
            return Ok(());
        }

        let excess = ids.len() - self.max_sessions as usize;
        for id in &ids[..excess] {
            let path = self.session_path(*id);
            if let Err(e) = fs::remove_file(&path) {
                log_warn!("Failed to rotate out session file {}: {}", path.display(), e);
            }
        }
        Ok(())
    }
}

fn parse_session_id(filename: &str) -> Option<u32> {
    filename
        .strip_prefix(SESSION_FILE_PREFIX)?
        .strip_suffix(SESSION_FILE_SUFFIX)?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_allocates_sequential_ids() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = SessionRecorder::new(dir.path(), MAX_SESSIONS);

        let id1 = recorder.start("ENG-1").unwrap();
        recorder.end(SessionFileStatus::Completed).unwrap();
        assert_eq!(id1, 1);

        let id2 = recorder.start("ENG-2").unwrap();
        assert_eq!(id2, 2);
        recorder.end(SessionFileStatus::Completed).unwrap();
    }

    #[test]
    fn double_start_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = SessionRecorder::new(dir.path(), MAX_SESSIONS);
        recorder.start("ENG-1").unwrap();
        assert!(recorder.start("ENG-2").is_err());
    }

    #[test]
    fn end_without_start_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = SessionRecorder::new(dir.path(), MAX_SESSIONS);
        assert!(recorder.end(SessionFileStatus::Completed).is_err());
    }

    #[test]
    fn record_event_truncates_previews() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = SessionRecorder::new(dir.path(), MAX_SESSIONS);
        recorder.start("ENG-1").unwrap();

        let mut data = serde_json::Map::new();
        data.insert(
            "result_preview".to_string(),
            serde_json::Value::String("x".repeat(6000)),
        );
        recorder.record_event("tool_call", data).unwrap();
        recorder.end(SessionFileStatus::Completed).unwrap();

        let contents = fs::read_to_string(dir.path().join(".agent/sessions/session-1.json")).unwrap();
        let file: SessionFile = serde_json::from_str(&contents).unwrap();
        let preview = file.events[0].data["result_preview"].as_str().unwrap();
        assert!(preview.len() < 6000);
    }

    #[test]
    fn rotation_keeps_cap_deleting_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = SessionRecorder::new(dir.path(), 2);

        for i in 1..=3 {
            recorder.start(&format!("ENG-{}", i)).unwrap();
            recorder.end(SessionFileStatus::Completed).unwrap();
        }

        assert!(!dir.path().join(".agent/sessions/session-1.json").exists());
        assert!(dir.path().join(".agent/sessions/session-2.json").exists());
        assert!(dir.path().join(".agent/sessions/session-3.json").exists());
    }
}
