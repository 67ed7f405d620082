//! Correction service stream protocol types
//!
//! This module defines the JSON events the backend sends on the correction
//! and follow-up streaming endpoints.
//!
//! # Protocol Overview
//!
//! 1. POST the multipart request to `/api/exercice/correct/stream`
//! 2. Receive `start` with the session id
//! 3. Receive `phase` events (`running`, then `done`) for ocr, rag, specialist, evaluating
//! 4. Receive `token` events while the specialist writes the correction
//! 5. Receive `done` (or `error`), then `data: [DONE]` or connection close
//!
//! Each event travels on its own line as `data: <json>`.

use serde::{Deserialize, Serialize};

/// Prefix of every payload-carrying line
pub const DATA_PREFIX: &str = "data: ";

/// Literal end-of-stream marker
pub const DONE_SENTINEL: &str = "[DONE]";

/// Server-side pipeline stage reported in `phase` events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Ocr,
    Rag,
    Specialist,
    Evaluating,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Ocr => "ocr",
            Phase::Rag => "rag",
            Phase::Specialist => "specialist",
            Phase::Evaluating => "evaluating",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseStatus {
    Running,
    Done,
}

/// Reference to a course passage used for the correction.
///
/// The backend sends either a structured object or a `"Title (Subject)"`
/// label; both land here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawSource")]
pub struct CourseSource {
    pub title: String,
    pub subject: String,
    pub course_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawSource {
    Structured {
        title: String,
        #[serde(default)]
        subject: String,
        #[serde(default)]
        course_id: Option<String>,
    },
    Label(String),
}

impl From<RawSource> for CourseSource {
    fn from(raw: RawSource) -> Self {
        match raw {
            RawSource::Structured {
                title,
                subject,
                course_id,
            } => CourseSource {
                title,
                subject,
                course_id,
            },
            RawSource::Label(label) => CourseSource::from_label(&label),
        }
    }
}

impl CourseSource {
    /// Parse a `"Title (Subject)"` label. Labels without a trailing
    /// parenthesised subject keep the whole text as title.
    pub fn from_label(label: &str) -> Self {
        let label = label.trim();
        if let Some(stripped) = label.strip_suffix(')') {
            if let Some(open) = stripped.rfind(" (") {
                return CourseSource {
                    title: stripped[..open].trim().to_string(),
                    subject: stripped[open + 2..].trim().to_string(),
                    course_id: None,
                };
            }
        }
        CourseSource {
            title: label.to_string(),
            subject: String::new(),
            course_id: None,
        }
    }

    /// Display label in the backend's `"Title (Subject)"` form
    pub fn label(&self) -> String {
        if self.subject.is_empty() {
            self.title.clone()
        } else {
            format!("{} ({})", self.title, self.subject)
        }
    }
}

// ============================================================================
// Server Events (received FROM the correction service)
// ============================================================================

/// Events received on the correction and follow-up streams
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    /// Stream opened; carries the session id on the correction endpoint
    Start {
        #[serde(default)]
        session_id: Option<String>,
    },

    /// Pipeline stage started (`running`) or finished (`done`)
    Phase {
        phase: Phase,
        status: PhaseStatus,
        #[serde(default)]
        subject: Option<String>,
        #[serde(default)]
        exercise_type: Option<String>,
        #[serde(default)]
        chunks_found: Option<u32>,
        #[serde(default)]
        specialist: Option<String>,
        #[serde(default)]
        level: Option<String>,
    },

    /// Incremental correction text
    Token { text: String },

    /// Terminal success
    Done {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        sources: Vec<CourseSource>,
        #[serde(default)]
        evaluation_score: Option<f64>,
        #[serde(default)]
        chunks_found: Option<u32>,
        #[serde(default)]
        student_attempted: Option<bool>,
        #[serde(default)]
        specialist: Option<String>,
        #[serde(default)]
        level: Option<String>,
    },

    /// Terminal failure reported by the server
    Error {
        #[serde(default)]
        code: Option<String>,
        message: String,
    },
}

impl StreamEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Start { .. } => "start",
            StreamEvent::Phase { .. } => "phase",
            StreamEvent::Token { .. } => "token",
            StreamEvent::Done { .. } => "done",
            StreamEvent::Error { .. } => "error",
        }
    }

    /// Extract token text if this is a token event
    pub fn token_text(&self) -> Option<&str> {
        match self {
            StreamEvent::Token { text } => Some(text),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done { .. } | StreamEvent::Error { .. })
    }
}

/// Classification of one decoded line
#[derive(Debug)]
pub enum Line {
    /// A well-formed event
    Event(StreamEvent),
    /// Not a data line, or an empty payload
    Ignored,
    /// The `[DONE]` marker
    Sentinel,
    /// A data line whose payload is not a known event
    Malformed(serde_json::Error),
}

/// Classify a single line (without its newline).
pub fn classify_line(line: &str) -> Line {
    let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
        return Line::Ignored;
    };
    let raw = payload.trim();
    if raw.is_empty() {
        return Line::Ignored;
    }
    if raw == DONE_SENTINEL {
        return Line::Sentinel;
    }
    match serde_json::from_str::<StreamEvent>(raw) {
        Ok(event) => Line::Event(event),
        Err(e) => Line::Malformed(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(line: &str) -> StreamEvent {
        match classify_line(line) {
            Line::Event(ev) => ev,
            other => panic!("Expected event, got {:?}", other),
        }
    }

    #[test]
    fn test_start_event_deserialization() {
        let ev = event(r#"data: {"type":"start","session_id":"s1"}"#);
        assert_eq!(
            ev,
            StreamEvent::Start {
                session_id: Some("s1".to_string())
            }
        );
    }

    #[test]
    fn test_phase_running_with_specialist() {
        let ev = event(
            r#"data: {"type":"phase","phase":"specialist","status":"running","specialist":"mathematiques","level":"3ème"}"#,
        );
        match ev {
            StreamEvent::Phase {
                phase,
                status,
                specialist,
                level,
                ..
            } => {
                assert_eq!(phase, Phase::Specialist);
                assert_eq!(status, PhaseStatus::Running);
                assert_eq!(specialist.as_deref(), Some("mathematiques"));
                assert_eq!(level.as_deref(), Some("3ème"));
            }
            _ => panic!("Expected Phase"),
        }
    }

    #[test]
    fn test_done_event_with_label_sources() {
        let ev = event(
            r#"data: {"type":"done","session_id":"s1","sources":["Les fractions (Mathématiques)"],"chunks_found":3,"evaluation_score":0.85}"#,
        );
        match ev {
            StreamEvent::Done {
                sources,
                evaluation_score,
                chunks_found,
                ..
            } => {
                assert_eq!(sources.len(), 1);
                assert_eq!(sources[0].title, "Les fractions");
                assert_eq!(sources[0].subject, "Mathématiques");
                assert_eq!(sources[0].course_id, None);
                assert_eq!(evaluation_score, Some(0.85));
                assert_eq!(chunks_found, Some(3));
            }
            _ => panic!("Expected Done"),
        }
    }

    #[test]
    fn test_done_event_with_structured_sources() {
        let ev = event(
            r#"data: {"type":"done","session_id":"s1","sources":[{"title":"Thalès","subject":"Mathématiques","course_id":"c-42"}],"evaluation_score":1}"#,
        );
        match ev {
            StreamEvent::Done { sources, .. } => {
                assert_eq!(sources[0].course_id.as_deref(), Some("c-42"));
                assert_eq!(sources[0].label(), "Thalès (Mathématiques)");
            }
            _ => panic!("Expected Done"),
        }
    }

    #[test]
    fn test_error_event_keeps_code() {
        let ev = event(r#"data: {"type":"error","code":"OCR_EMPTY","message":"Photo illisible"}"#);
        assert_eq!(
            ev,
            StreamEvent::Error {
                code: Some("OCR_EMPTY".to_string()),
                message: "Photo illisible".to_string()
            }
        );
        assert!(ev.is_terminal());
    }

    #[test]
    fn test_followup_events_without_fields_parse() {
        // The follow-up endpoint sends bare start/done markers
        assert!(matches!(
            event(r#"data: {"type":"start"}"#),
            StreamEvent::Start { session_id: None }
        ));
        assert!(matches!(
            event(r#"data: {"type":"done"}"#),
            StreamEvent::Done { .. }
        ));
    }

    #[test]
    fn test_non_data_and_empty_lines_are_ignored() {
        assert!(matches!(classify_line(""), Line::Ignored));
        assert!(matches!(classify_line(": keep-alive"), Line::Ignored));
        assert!(matches!(classify_line("event: token"), Line::Ignored));
        assert!(matches!(classify_line("data:    "), Line::Ignored));
        // No space after the colon: not the prefix this protocol uses
        assert!(matches!(
            classify_line(r#"data:{"type":"token","text":"x"}"#),
            Line::Ignored
        ));
    }

    #[test]
    fn test_sentinel_is_recognized() {
        assert!(matches!(classify_line("data: [DONE]"), Line::Sentinel));
        assert!(matches!(classify_line("data: [DONE]\r"), Line::Sentinel));
    }

    #[test]
    fn test_malformed_payloads() {
        assert!(matches!(classify_line("data: {not json"), Line::Malformed(_)));
        assert!(matches!(
            classify_line(r#"data: {"type":"mystery"}"#),
            Line::Malformed(_)
        ));
        assert!(matches!(
            classify_line(r#"data: {"type":"phase","phase":"teleport","status":"running"}"#),
            Line::Malformed(_)
        ));
        assert!(matches!(
            classify_line(r#"data: {"type":"token"}"#),
            Line::Malformed(_)
        ));
    }

    #[test]
    fn test_label_without_subject() {
        let src = CourseSource::from_label("Notes de cours");
        assert_eq!(src.title, "Notes de cours");
        assert_eq!(src.subject, "");
        assert_eq!(src.label(), "Notes de cours");
    }
}
