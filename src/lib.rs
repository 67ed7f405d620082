//! StudyBuddy client
//!
//! Client side of the StudyBuddy homework-correction service. A student
//! uploads a photo of an exercise; the service reads it, looks up matching
//! course passages and streams back a tutoring correction, phase by phase.
//! Afterwards the student can ask follow-up questions on the same exercise.
//!
//! - [`correction::CorrectionController`] drives one correction stream and
//!   exposes its [`state_machine::CorrectionState`] through a watch channel.
//! - [`followup::FollowupController`] keeps the follow-up transcript and
//!   streams each answer into it.
//! - [`courses::CourseLibrary`] uploads, lists and deletes the student's
//!   courses, the sources corrections draw on.
//! - [`streaming`] holds the wire format and the incremental event reader
//!   both controllers share.

pub mod api;
pub mod auth;
pub mod correction;
pub mod courses;
pub mod credentials;
pub mod error;
pub mod feedback;
pub mod followup;
pub mod history;
pub mod metrics;
pub mod settings;
pub mod state_machine;
pub mod streaming;

pub use api::{ApiClient, CorrectParams, UploadFile};
pub use auth::{AuthSession, SessionContext};
pub use correction::CorrectionController;
pub use courses::{Course, CourseDetail, CourseLibrary};
pub use error::ClientError;
pub use feedback::{submit_feedback, Rating};
pub use followup::{FollowupContext, FollowupController, FollowupView};
pub use history::{HistoryEntry, HistoryStore};
pub use settings::ClientSettings;
pub use state_machine::{CorrectionPhase, CorrectionState, FollowupMessage, Role};
