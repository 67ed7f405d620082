//! Local history of finished corrections
//!
//! Stored as a JSON array in the user's data directory, newest first.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::feedback::Rating;
use crate::settings::write_atomically;
use crate::state_machine::{CorrectionPhase, CorrectionState};
use crate::streaming::CourseSource;

const HISTORY_DIR_NAME: &str = "studybuddy";
const HISTORY_FILE_NAME: &str = "history.json";

/// Subject recorded when the server never classified the exercise
pub const UNKNOWN_SUBJECT: &str = "Inconnu";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub session_id: String,
    pub date: DateTime<Utc>,
    pub subject: String,
    pub level: String,
    #[serde(default)]
    pub exercise_statement: String,
    pub correction: String,
    #[serde(default)]
    pub sources: Vec<CourseSource>,
    pub evaluation_score: Option<f64>,
    #[serde(default)]
    pub feedback: Option<Rating>,
}

impl HistoryEntry {
    /// Entry for a successful correction. `None` unless the session is done,
    /// has a session id and produced some text.
    pub fn from_session(state: &CorrectionState) -> Option<Self> {
        if state.phase != CorrectionPhase::Done || state.tokens.is_empty() {
            return None;
        }
        let session_id = state.session_id.clone()?;
        Some(Self {
            session_id,
            date: Utc::now(),
            subject: state
                .subject
                .clone()
                .unwrap_or_else(|| UNKNOWN_SUBJECT.to_string()),
            level: state.level.clone().unwrap_or_default(),
            exercise_statement: String::new(),
            correction: state.tokens.clone(),
            sources: state.sources.clone(),
            evaluation_score: state.evaluation_score,
            feedback: None,
        })
    }
}

pub fn default_history_path() -> Result<PathBuf, String> {
    let dir = dirs::data_local_dir()
        .ok_or_else(|| "Could not determine data directory".to_string())?;
    Ok(dir.join(HISTORY_DIR_NAME).join(HISTORY_FILE_NAME))
}

pub struct HistoryStore {
    path: PathBuf,
    limit: usize,
    entries: Vec<HistoryEntry>,
}

impl HistoryStore {
    /// Open the store at `path`, loading what is already there.
    pub fn open(path: impl Into<PathBuf>, limit: usize) -> Self {
        let mut store = Self {
            path: path.into(),
            limit,
            entries: Vec::new(),
        };
        store.load();
        store
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reload from disk. A missing or corrupt file gives an empty history.
    pub fn load(&mut self) {
        self.entries = match std::fs::read_to_string(&self.path) {
            Ok(contents) => match serde_json::from_str::<Vec<HistoryEntry>>(&contents) {
                Ok(entries) => entries,
                Err(e) => {
                    log::warn!("History: failed to parse {:?}: {}", self.path, e);
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                log::warn!("History: failed to read {:?}: {}", self.path, e);
                Vec::new()
            }
        };
        self.entries.truncate(self.limit);
    }

    /// Newest first
    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn get(&self, session_id: &str) -> Option<&HistoryEntry> {
        self.entries.iter().find(|e| e.session_id == session_id)
    }

    /// Prepend `entry`, dropping the oldest beyond the limit.
    ///
    /// Re-adding a session replaces its previous entry.
    pub fn add_entry(&mut self, entry: HistoryEntry) -> Result<(), String> {
        self.entries.retain(|e| e.session_id != entry.session_id);
        self.entries.insert(0, entry);
        self.entries.truncate(self.limit);
        self.persist()
    }

    /// Returns whether an entry with this session id exists.
    pub fn update_feedback(&mut self, session_id: &str, rating: Rating) -> Result<bool, String> {
        let Some(entry) = self.entries.iter_mut().find(|e| e.session_id == session_id) else {
            return Ok(false);
        };
        entry.feedback = Some(rating);
        self.persist()?;
        Ok(true)
    }

    pub fn clear(&mut self) -> Result<(), String> {
        self.entries.clear();
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(format!("Remove {:?}: {}", self.path, e)),
        }
    }

    fn persist(&self) -> Result<(), String> {
        let contents = serde_json::to_string_pretty(&self.entries)
            .map_err(|e| format!("Serialize history: {}", e))?;
        write_atomically(&self.path, &contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str) -> HistoryEntry {
        HistoryEntry {
            session_id: id.to_string(),
            date: Utc::now(),
            subject: "SVT".to_string(),
            level: "4ème".to_string(),
            exercise_statement: String::new(),
            correction: "Bonne réponse.".to_string(),
            sources: vec![CourseSource::from_label("La cellule (SVT)")],
            evaluation_score: Some(0.9),
            feedback: None,
        }
    }

    #[test]
    fn entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join(HISTORY_FILE_NAME);

        let mut store = HistoryStore::open(&path, 10);
        store.add_entry(entry("a")).unwrap();
        store.add_entry(entry("b")).unwrap();

        let reopened = HistoryStore::open(&path, 10);
        let ids: Vec<_> = reopened.entries().iter().map(|e| e.session_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(reopened.get("a").unwrap().sources[0].subject, "SVT");
    }

    #[test]
    fn limit_drops_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = HistoryStore::open(dir.path().join(HISTORY_FILE_NAME), 2);
        for id in ["a", "b", "c"] {
            store.add_entry(entry(id)).unwrap();
        }
        assert_eq!(store.entries().len(), 2);
        assert!(store.get("a").is_none());
    }

    #[test]
    fn feedback_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(HISTORY_FILE_NAME);
        let mut store = HistoryStore::open(&path, 10);
        store.add_entry(entry("a")).unwrap();

        assert!(store.update_feedback("a", Rating::NotHelpful).unwrap());
        assert!(!store.update_feedback("zzz", Rating::Helpful).unwrap());

        let reopened = HistoryStore::open(&path, 10);
        assert_eq!(reopened.get("a").unwrap().feedback, Some(Rating::NotHelpful));
    }

    #[test]
    fn corrupt_file_gives_empty_history() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(HISTORY_FILE_NAME);
        std::fs::write(&path, "[{").unwrap();
        assert!(HistoryStore::open(&path, 10).entries().is_empty());
    }

    #[test]
    fn clear_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(HISTORY_FILE_NAME);
        let mut store = HistoryStore::open(&path, 10);
        store.add_entry(entry("a")).unwrap();
        store.clear().unwrap();

        assert!(!path.exists());
        assert!(store.entries().is_empty());
        store.clear().unwrap();
    }

    #[test]
    fn only_finished_sessions_become_entries() {
        let mut state = CorrectionState {
            phase: CorrectionPhase::Done,
            tokens: "Correction".to_string(),
            session_id: Some("s1".to_string()),
            ..Default::default()
        };
        let built = HistoryEntry::from_session(&state).unwrap();
        assert_eq!(built.subject, UNKNOWN_SUBJECT);
        assert_eq!(built.correction, "Correction");

        state.phase = CorrectionPhase::Error;
        assert!(HistoryEntry::from_session(&state).is_none());
    }
}
