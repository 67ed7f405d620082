//! Error types for the StudyBuddy client
//!
//! Controllers never hand transport errors back to their callers: every
//! failure is folded into observable state using [`ClientError::user_message`].
//! Only precondition failures (caller misuse) are returned directly.

use std::path::PathBuf;
use std::time::Duration;

/// Shown when a request fails for a reason the student cannot act on.
pub const GENERIC_RETRY_MESSAGE: &str = "Une erreur s'est produite. Réessaie.";

/// Shown when the server closed the stream before `done` or `error`.
pub const INTERRUPTED_MESSAGE: &str =
    "La correction a été interrompue avant la fin. Réessaie.";

/// Shown when no data arrived for longer than the stall timeout.
pub const STALLED_MESSAGE: &str = "Le serveur ne répond plus. Réessaie dans un instant.";

const MISSING_AUTH_MESSAGE: &str = "Tu dois être connecté pour continuer.";
const MISSING_FILE_MESSAGE: &str = "Ajoute une photo de ton exercice.";
const MISSING_CONTEXT_MESSAGE: &str = "Termine d'abord une correction pour poser une question.";
const EMPTY_MESSAGE_MESSAGE: &str = "Écris ta question avant d'envoyer.";
const BUSY_MESSAGE: &str = "Une réponse est déjà en cours.";
const MISSING_SESSION_MESSAGE: &str = "Aucune correction à évaluer.";
const INVALID_COURSE_MESSAGE: &str = "Cours introuvable.";

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// No access token in the session context
    #[error("not authenticated: no access token available")]
    MissingAuth,

    /// Correction started without an exercise image
    #[error("no exercise file provided")]
    MissingFile,

    /// Follow-up sent before subject and level are known
    #[error("follow-up context (subject, level) is not known yet")]
    MissingContext,

    #[error("message is empty")]
    EmptyMessage,

    /// A follow-up answer is still streaming
    #[error("a follow-up message is already being answered")]
    Busy,

    /// Feedback requested before the server assigned a session id
    #[error("no correction session to attach feedback to")]
    MissingSession,

    #[error("invalid upload: {0}")]
    InvalidUpload(String),

    /// Course image refused before upload; carries the text for the student
    #[error("course image rejected: {0}")]
    RejectedImage(String),

    #[error("invalid course id {0:?}")]
    InvalidCourseId(String),

    /// Server answered with a non-success status
    #[error("server returned {status}: {body}")]
    Http { status: u16, body: String },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("no data received for {0:?}")]
    Stalled(Duration),

    #[error("failed to access {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClientError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ClientError::Io {
            path: path.into(),
            source,
        }
    }

    /// True for errors raised locally before any network call.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            ClientError::MissingAuth
                | ClientError::MissingFile
                | ClientError::MissingContext
                | ClientError::EmptyMessage
                | ClientError::Busy
                | ClientError::MissingSession
                | ClientError::InvalidUpload(_)
                | ClientError::RejectedImage(_)
                | ClientError::InvalidCourseId(_)
        )
    }

    /// French, non-technical text to show the student.
    ///
    /// Server-provided text is passed through verbatim. A non-success
    /// response with an empty or blank body maps to `"HTTP <status>"`.
    pub fn user_message(&self) -> String {
        match self {
            ClientError::MissingAuth => MISSING_AUTH_MESSAGE.to_string(),
            ClientError::MissingFile => MISSING_FILE_MESSAGE.to_string(),
            ClientError::MissingContext => MISSING_CONTEXT_MESSAGE.to_string(),
            ClientError::EmptyMessage => EMPTY_MESSAGE_MESSAGE.to_string(),
            ClientError::Busy => BUSY_MESSAGE.to_string(),
            ClientError::MissingSession => MISSING_SESSION_MESSAGE.to_string(),
            ClientError::RejectedImage(reason) => reason.clone(),
            ClientError::InvalidCourseId(_) => INVALID_COURSE_MESSAGE.to_string(),
            ClientError::Http { status, body } => {
                if body.trim().is_empty() {
                    format!("HTTP {}", status)
                } else {
                    body.clone()
                }
            }
            ClientError::Stalled(_) => STALLED_MESSAGE.to_string(),
            ClientError::InvalidUpload(_)
            | ClientError::Network(_)
            | ClientError::Io { .. }
            | ClientError::Json(_) => GENERIC_RETRY_MESSAGE.to_string(),
        }
    }
}
