//! Course library
//!
//! Students photograph their lessons; the service extracts and indexes them,
//! and corrections then cite them as sources. [`CourseLibrary`] keeps the
//! local list in sync with the server and reports upload progress through a
//! watch channel, like the stream controllers do.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::api::{ApiClient, UploadFile};
use crate::auth::SessionContext;
use crate::error::ClientError;

/// Largest course photo the service accepts
pub const MAX_COURSE_IMAGE_BYTES: usize = 10 * 1024 * 1024;

/// Image types the service accepts for courses
pub const COURSE_IMAGE_TYPES: &[&str] = &[
    "image/jpeg",
    "image/png",
    "image/webp",
    "image/heic",
    "image/heif",
];

/// The server does not report progress; after this long the upload is
/// assumed to have moved from reading to indexing.
const EMBEDDING_AFTER: Duration = Duration::from_secs(4);

/// Entry of the course list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Course {
    pub id: String,
    pub title: String,
    pub subject: String,
    pub level: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub chapter_id: Option<String>,
    pub created_at: String,
}

/// A course with its extracted text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourseDetail {
    pub id: String,
    pub title: String,
    pub subject: String,
    pub level: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub raw_content: String,
    pub created_at: String,
}

/// Server answer to an upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadedCourse {
    pub id: String,
    pub title: String,
    pub subject: String,
    pub level: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Passages indexed for retrieval
    pub chunk_count: u32,
    pub created_at: String,
}

impl From<UploadedCourse> for Course {
    fn from(uploaded: UploadedCourse) -> Self {
        Self {
            id: uploaded.id,
            title: uploaded.title,
            subject: uploaded.subject,
            level: uploaded.level,
            keywords: uploaded.keywords,
            chapter_id: None,
            created_at: uploaded.created_at,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    #[default]
    Idle,
    Ocr,
    Embedding,
    Done,
    Error,
}

impl UploadStatus {
    pub fn label(&self) -> &'static str {
        match self {
            UploadStatus::Idle => "",
            UploadStatus::Ocr => "Lecture du cours...",
            UploadStatus::Embedding => "Vectorisation en cours...",
            UploadStatus::Done => "Cours ajouté !",
            UploadStatus::Error => "Échec de l'ajout du cours",
        }
    }

    pub fn is_uploading(&self) -> bool {
        matches!(self, UploadStatus::Ocr | UploadStatus::Embedding)
    }
}

/// Observable state of the library
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LibraryView {
    pub courses: Vec<Course>,
    pub upload: UploadStatus,
    /// Student-facing text of the last failed upload
    pub upload_error: Option<String>,
}

/// Check a course photo before sending it.
pub fn validate_course_image(file: &UploadFile) -> Result<(), ClientError> {
    if file.is_empty() {
        return Err(ClientError::MissingFile);
    }
    if !COURSE_IMAGE_TYPES.contains(&file.mime_type.as_str()) {
        return Err(ClientError::RejectedImage(
            "Format non supporté. Formats acceptés : JPEG, PNG, WEBP, HEIC.".to_string(),
        ));
    }
    if file.bytes.len() > MAX_COURSE_IMAGE_BYTES {
        return Err(ClientError::RejectedImage(format!(
            "L'image est trop lourde (max {} Mo).",
            MAX_COURSE_IMAGE_BYTES / (1024 * 1024)
        )));
    }
    Ok(())
}

pub struct CourseLibrary {
    api: Arc<ApiClient>,
    auth: SessionContext,
    view: watch::Sender<LibraryView>,
}

impl CourseLibrary {
    pub fn new(api: Arc<ApiClient>, auth: SessionContext) -> Self {
        let (view, _) = watch::channel(LibraryView::default());
        Self { api, auth, view }
    }

    pub fn view(&self) -> LibraryView {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<LibraryView> {
        self.view.subscribe()
    }

    /// Replace the local list with the server's.
    pub async fn refresh(&self) -> Result<Vec<Course>, ClientError> {
        let bearer = self.auth.bearer_token()?;
        let courses = self.api.list_courses(&bearer).await?;
        self.view.send_modify(|v| v.courses = courses.clone());
        Ok(courses)
    }

    pub async fn get(&self, id: &str) -> Result<CourseDetail, ClientError> {
        let bearer = self.auth.bearer_token()?;
        self.api.get_course(&bearer, id).await
    }

    /// Upload a course photo and add the result at the top of the list.
    ///
    /// Invalid images and missing auth are returned without touching the
    /// upload status. Server failures set it to `Error` and are returned.
    pub async fn upload(&self, file: UploadFile) -> Result<Course, ClientError> {
        validate_course_image(&file)?;
        let bearer = self.auth.bearer_token()?;

        self.set_upload(UploadStatus::Ocr, None);
        let request = self.api.upload_course(&bearer, &file);
        let indexing_after = tokio::time::sleep(EMBEDDING_AFTER);
        tokio::pin!(request, indexing_after);
        let mut indexing = false;
        let result = loop {
            tokio::select! {
                result = &mut request => break result,
                _ = &mut indexing_after, if !indexing => {
                    indexing = true;
                    self.set_upload(UploadStatus::Embedding, None);
                }
            }
        };

        match result {
            Ok(uploaded) => {
                log::info!(
                    "Course {} added: {} ({} passages)",
                    uploaded.id,
                    uploaded.title,
                    uploaded.chunk_count
                );
                let course = Course::from(uploaded);
                self.view.send_modify(|v| {
                    v.courses.retain(|c| c.id != course.id);
                    v.courses.insert(0, course.clone());
                    v.upload = UploadStatus::Done;
                    v.upload_error = None;
                });
                Ok(course)
            }
            Err(e) => {
                log::warn!("Course upload failed: {}", e);
                self.set_upload(UploadStatus::Error, Some(e.user_message()));
                Err(e)
            }
        }
    }

    /// Delete a course on the server, then drop it from the local list.
    pub async fn delete(&self, id: &str) -> Result<(), ClientError> {
        let bearer = self.auth.bearer_token()?;
        self.api.delete_course(&bearer, id).await?;
        self.view.send_if_modified(|v| {
            let before = v.courses.len();
            v.courses.retain(|c| c.id != id);
            v.courses.len() != before
        });
        Ok(())
    }

    /// Back to `Idle` after a finished or failed upload.
    pub fn reset_upload(&self) {
        self.set_upload(UploadStatus::Idle, None);
    }

    fn set_upload(&self, status: UploadStatus, error: Option<String>) {
        self.view.send_modify(|v| {
            v.upload = status;
            v.upload_error = error;
        });
    }
}
