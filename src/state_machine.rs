//! State machine for StudyBuddy corrections
//!
//! This module folds stream events into the observable state of a correction
//! session and of a follow-up transcript. All transitions go through
//! [`CorrectionState::apply`] and the [`Transcript`] methods; the controllers
//! only decide *whether* an event is still current.

use serde::{Deserialize, Serialize};

use crate::streaming::{CourseSource, Phase, PhaseStatus, StreamEvent};

/// Progress of a correction, as shown to the student
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorrectionPhase {
    #[default]
    Idle,
    Ocr,
    Rag,
    Specialist,
    Evaluating,
    Done,
    Error,
}

impl CorrectionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            CorrectionPhase::Idle => "idle",
            CorrectionPhase::Ocr => "ocr",
            CorrectionPhase::Rag => "rag",
            CorrectionPhase::Specialist => "specialist",
            CorrectionPhase::Evaluating => "evaluating",
            CorrectionPhase::Done => "done",
            CorrectionPhase::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CorrectionPhase::Done | CorrectionPhase::Error)
    }

    /// A request is running and has not reached a terminal phase
    pub fn is_processing(&self) -> bool {
        !matches!(self, CorrectionPhase::Idle) && !self.is_terminal()
    }

    /// French progress label
    pub fn label(&self) -> &'static str {
        match self {
            CorrectionPhase::Idle => "En attente",
            CorrectionPhase::Ocr => "Lecture de l'exercice",
            CorrectionPhase::Rag => "Recherche dans tes cours",
            CorrectionPhase::Specialist => "Correction en cours",
            CorrectionPhase::Evaluating => "Vérification",
            CorrectionPhase::Done => "Terminé",
            CorrectionPhase::Error => "Erreur",
        }
    }
}

impl From<Phase> for CorrectionPhase {
    fn from(phase: Phase) -> Self {
        match phase {
            Phase::Ocr => CorrectionPhase::Ocr,
            Phase::Rag => CorrectionPhase::Rag,
            Phase::Specialist => CorrectionPhase::Specialist,
            Phase::Evaluating => CorrectionPhase::Evaluating,
        }
    }
}

/// State of one correction session.
///
/// `sources` and `evaluation_score` are only meaningful once `phase` is
/// `Done`; `error` is only set in `Error`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CorrectionState {
    pub phase: CorrectionPhase,
    pub tokens: String,
    pub subject: Option<String>,
    pub level: Option<String>,
    pub specialist: Option<String>,
    pub sources: Vec<CourseSource>,
    pub chunks_found: u32,
    pub evaluation_score: Option<f64>,
    pub session_id: Option<String>,
    pub student_attempted: bool,
    pub error: Option<String>,
}

impl CorrectionState {
    /// Fresh state for a request that was just sent
    pub fn starting() -> Self {
        Self {
            phase: CorrectionPhase::Ocr,
            ..Self::default()
        }
    }

    /// Fold one event into the state. Returns whether anything changed.
    ///
    /// Once a terminal phase is reached every further event is ignored.
    pub fn apply(&mut self, event: StreamEvent) -> bool {
        if self.phase.is_terminal() {
            log::debug!("Ignoring {} event after {}", event.kind(), self.phase.as_str());
            return false;
        }

        match event {
            StreamEvent::Start { session_id } => match session_id {
                Some(id) => {
                    self.session_id = Some(id);
                    true
                }
                None => false,
            },

            StreamEvent::Phase {
                phase,
                status: PhaseStatus::Running,
                specialist,
                level,
                ..
            } => {
                let next = CorrectionPhase::from(phase);
                if next != self.phase {
                    log::debug!("Correction phase: {} -> {}", self.phase.as_str(), next.as_str());
                }
                self.phase = next;
                merge(&mut self.specialist, specialist);
                merge(&mut self.level, level);
                true
            }

            // A finished stage only contributes metadata; the next running
            // event moves the phase forward.
            StreamEvent::Phase {
                phase,
                status: PhaseStatus::Done,
                subject,
                chunks_found,
                ..
            } => match phase {
                Phase::Ocr => merge(&mut self.subject, subject),
                Phase::Rag => match chunks_found {
                    Some(n) => {
                        self.chunks_found = n;
                        true
                    }
                    None => false,
                },
                Phase::Specialist | Phase::Evaluating => false,
            },

            StreamEvent::Token { text } => {
                if text.is_empty() {
                    return false;
                }
                self.tokens.push_str(&text);
                true
            }

            StreamEvent::Done {
                session_id,
                sources,
                evaluation_score,
                chunks_found,
                student_attempted,
                specialist,
                level,
            } => {
                self.phase = CorrectionPhase::Done;
                merge(&mut self.session_id, session_id);
                self.sources = sources;
                self.evaluation_score = evaluation_score;
                if let Some(n) = chunks_found {
                    self.chunks_found = n;
                }
                self.student_attempted = student_attempted.unwrap_or(false);
                merge(&mut self.specialist, specialist);
                merge(&mut self.level, level);
                true
            }

            StreamEvent::Error { code, message } => {
                log::info!(
                    "Correction failed on server ({}): {}",
                    code.as_deref().unwrap_or("no code"),
                    message
                );
                self.fail(message)
            }
        }
    }

    /// Move to the error phase unless already terminal.
    pub fn fail(&mut self, message: impl Into<String>) -> bool {
        if self.phase.is_terminal() {
            return false;
        }
        self.phase = CorrectionPhase::Error;
        self.error = Some(message.into());
        true
    }

    /// Subject to route follow-up questions to: the specialist the server
    /// picked, else the detected subject.
    pub fn routed_subject(&self) -> Option<&str> {
        self.specialist.as_deref().or(self.subject.as_deref())
    }
}

/// Overwrite `slot` only when the event carries a value.
fn merge(slot: &mut Option<String>, value: Option<String>) -> bool {
    match value {
        Some(v) => {
            *slot = Some(v);
            true
        }
        None => false,
    }
}

// ============================================================================
// Follow-up transcript
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowupMessage {
    pub role: Role,
    pub content: String,
}

impl FollowupMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Ordered follow-up conversation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Transcript {
    messages: Vec<FollowupMessage>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the user's message and an empty assistant placeholder.
    ///
    /// Returns the conversation as it was before this exchange, which is
    /// what the server expects as history.
    pub fn begin_exchange(&mut self, user_message: &str) -> Vec<FollowupMessage> {
        let history = self.messages.clone();
        self.messages.push(FollowupMessage::user(user_message));
        self.messages.push(FollowupMessage::assistant(String::new()));
        history
    }

    /// Append streamed text to the trailing assistant entry.
    ///
    /// Dropped if the last entry is not an assistant entry.
    pub fn append_token(&mut self, text: &str) -> bool {
        match self.messages.last_mut() {
            Some(last) if last.role == Role::Assistant => {
                last.content.push_str(text);
                !text.is_empty()
            }
            _ => {
                log::debug!("Dropping follow-up token: no assistant placeholder");
                false
            }
        }
    }

    /// Replace an empty assistant placeholder with `message`. Partial
    /// answers are kept as they are.
    pub fn fail_placeholder(&mut self, message: &str) -> bool {
        match self.messages.last_mut() {
            Some(last) if last.role == Role::Assistant && last.content.is_empty() => {
                last.content = message.to_string();
                true
            }
            _ => false,
        }
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn messages(&self) -> &[FollowupMessage] {
        &self.messages
    }

    pub fn last(&self) -> Option<&FollowupMessage> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
