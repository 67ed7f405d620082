//! HTTP client for the StudyBuddy correction service
//!
//! Builds the exact requests the backend expects (multipart for the two
//! streaming endpoints and course uploads, JSON for feedback) and checks
//! response status. Bodies of streaming responses are consumed by the
//! controllers; course endpoints return decoded JSON.

use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response};
use std::future::Future;
use std::path::Path;
use std::time::Duration;

use crate::courses::{Course, CourseDetail, UploadedCourse};
use crate::error::ClientError;
use crate::feedback::FeedbackRequest;
use crate::settings::ClientSettings;
use crate::state_machine::FollowupMessage;

pub const CORRECT_STREAM_PATH: &str = "/api/exercice/correct/stream";
pub const FOLLOWUP_STREAM_PATH: &str = "/api/exercice/followup/stream";
pub const FEEDBACK_PATH: &str = "/api/feedback";
pub const COURSES_PATH: &str = "/api/cours/";
pub const COURSE_UPLOAD_PATH: &str = "/api/cours/upload";

/// Exercise image (or PDF) to upload
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub bytes: Vec<u8>,
    pub file_name: String,
    pub mime_type: String,
}

impl UploadFile {
    pub fn new(
        bytes: Vec<u8>,
        file_name: impl Into<String>,
        mime_type: impl Into<String>,
    ) -> Self {
        Self {
            bytes,
            file_name: file_name.into(),
            mime_type: mime_type.into(),
        }
    }

    /// Read a file from disk, guessing its MIME type from the extension.
    pub async fn from_path(path: &Path) -> Result<Self, ClientError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| ClientError::io(path, e))?;

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("exercice.jpg")
            .to_string();

        let mime_type = mime_for(path).to_string();
        Ok(Self {
            bytes,
            file_name,
            mime_type,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

fn mime_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("heic") => "image/heic",
        Some("heif") => "image/heif",
        Some("gif") => "image/gif",
        Some("pdf") => "application/pdf",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        _ => "application/octet-stream",
    }
}

/// Input of a correction request
#[derive(Debug, Clone)]
pub struct CorrectParams {
    pub file: UploadFile,
    /// Subject chosen by the student, overriding detection
    pub subject: Option<String>,
    /// The student's own attempt, for the specialist to review
    pub student_answer: Option<String>,
}

impl CorrectParams {
    pub fn new(file: UploadFile) -> Self {
        Self {
            file,
            subject: None,
            student_answer: None,
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_student_answer(mut self, answer: impl Into<String>) -> Self {
        self.student_answer = Some(answer.into());
        self
    }
}

/// Input of one follow-up request
#[derive(Debug, Clone)]
pub struct FollowupRequest {
    pub routed_subject: String,
    pub level: String,
    /// Conversation before `message`
    pub conversation_history: Vec<FollowupMessage>,
    pub message: String,
}

/// Client for the correction service
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
}

impl ApiClient {
    /// Build a client from settings.
    ///
    /// No overall request timeout is set: streamed answers can legitimately
    /// last minutes; silence is handled by the stall timeout instead.
    pub fn new(settings: &ClientSettings) -> Result<Self, ClientError> {
        let http = Client::builder()
            .connect_timeout(settings.connect_timeout())
            .build()?;
        Ok(Self::with_client(http, settings.base_url()))
    }

    pub fn with_client(http: Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// POST the exercise and return the streaming response.
    ///
    /// Non-success statuses are turned into [`ClientError::Http`] carrying
    /// the response body; the body is not read as a stream.
    pub async fn open_correction_stream(
        &self,
        bearer: &str,
        params: &CorrectParams,
    ) -> Result<Response, ClientError> {
        let form = correction_form(params)?;

        log::info!(
            "Opening correction stream: {} ({} bytes, subject={:?})",
            params.file.file_name,
            params.file.bytes.len(),
            params.subject
        );

        let response = self
            .http
            .post(self.url(CORRECT_STREAM_PATH))
            .bearer_auth(bearer)
            .multipart(form)
            .send()
            .await?;

        check_status(response).await
    }

    pub async fn open_followup_stream(
        &self,
        bearer: &str,
        request: &FollowupRequest,
    ) -> Result<Response, ClientError> {
        let form = followup_form(request)?;

        log::info!(
            "Opening follow-up stream: subject={} level={} history={}",
            request.routed_subject,
            request.level,
            request.conversation_history.len()
        );

        let response = self
            .http
            .post(self.url(FOLLOWUP_STREAM_PATH))
            .bearer_auth(bearer)
            .multipart(form)
            .send()
            .await?;

        check_status(response).await
    }

    pub async fn submit_feedback(
        &self,
        bearer: &str,
        request: &FeedbackRequest,
    ) -> Result<(), ClientError> {
        let response = self
            .http
            .post(self.url(FEEDBACK_PATH))
            .bearer_auth(bearer)
            .json(request)
            .send()
            .await?;

        check_status(response).await?;
        Ok(())
    }

    /// Upload a course photo. The server reads, chunks and indexes it
    /// before answering, which can take tens of seconds.
    pub async fn upload_course(
        &self,
        bearer: &str,
        file: &UploadFile,
    ) -> Result<UploadedCourse, ClientError> {
        let form = Form::new().part("file", file_part(file)?);

        log::info!(
            "Uploading course: {} ({} bytes)",
            file.file_name,
            file.bytes.len()
        );

        let response = self
            .http
            .post(self.url(COURSE_UPLOAD_PATH))
            .bearer_auth(bearer)
            .multipart(form)
            .send()
            .await?;

        let course = check_status(response).await?.json().await?;
        Ok(course)
    }

    /// The student's courses, newest first
    pub async fn list_courses(&self, bearer: &str) -> Result<Vec<Course>, ClientError> {
        let response = self
            .http
            .get(self.url(COURSES_PATH))
            .bearer_auth(bearer)
            .send()
            .await?;

        let courses: Vec<Course> = check_status(response).await?.json().await?;
        log::debug!("Listed {} courses", courses.len());
        Ok(courses)
    }

    pub async fn get_course(&self, bearer: &str, id: &str) -> Result<CourseDetail, ClientError> {
        let response = self
            .http
            .get(self.url(&course_path(id)?))
            .bearer_auth(bearer)
            .send()
            .await?;

        let course = check_status(response).await?.json().await?;
        Ok(course)
    }

    /// Delete a course and its indexed passages
    pub async fn delete_course(&self, bearer: &str, id: &str) -> Result<(), ClientError> {
        let response = self
            .http
            .delete(self.url(&course_path(id)?))
            .bearer_auth(bearer)
            .send()
            .await?;

        check_status(response).await?;
        log::info!("Deleted course {}", id);
        Ok(())
    }
}

/// Ids are interpolated into the path, so they must be a single segment.
fn course_path(id: &str) -> Result<String, ClientError> {
    let id = id.trim();
    if id.is_empty() || id.contains(['/', '?', '#', '%']) {
        return Err(ClientError::InvalidCourseId(id.to_string()));
    }
    Ok(format!("{}{}", COURSES_PATH, id))
}

fn file_part(file: &UploadFile) -> Result<Part, ClientError> {
    Part::bytes(file.bytes.clone())
        .file_name(file.file_name.clone())
        .mime_str(&file.mime_type)
        .map_err(|e| ClientError::InvalidUpload(e.to_string()))
}

/// Await a request, failing with [`ClientError::Stalled`] when the response
/// head does not arrive within `limit`.
pub(crate) async fn within_stall_limit<T>(
    limit: Option<Duration>,
    request: impl Future<Output = Result<T, ClientError>>,
) -> Result<T, ClientError> {
    match limit {
        None => request.await,
        Some(limit) => tokio::time::timeout(limit, request)
            .await
            .unwrap_or_else(|_| Err(ClientError::Stalled(limit))),
    }
}

fn correction_form(params: &CorrectParams) -> Result<Form, ClientError> {
    let mut form = Form::new().part("file", file_part(&params.file)?);
    if let Some(subject) = non_empty(&params.subject) {
        form = form.text("subject", subject);
    }
    if let Some(answer) = non_empty(&params.student_answer) {
        form = form.text("student_answer", answer);
    }
    Ok(form)
}

fn followup_form(request: &FollowupRequest) -> Result<Form, ClientError> {
    let history = serde_json::to_string(&request.conversation_history)?;
    Ok(Form::new()
        .text("routed_subject", request.routed_subject.clone())
        .text("level", request.level.clone())
        .text("conversation_history", history)
        .text("message", request.message.clone()))
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .filter(|v| !v.trim().is_empty())
        .map(str::to_owned)
}

async fn check_status(response: Response) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = match response.text().await {
        Ok(text) => text,
        Err(e) => {
            log::warn!("Could not read error body ({}): {}", status, e);
            String::new()
        }
    };
    log::warn!("Correction service error ({}): {}", status.as_u16(), body);

    Err(ClientError::Http {
        status: status.as_u16(),
        body,
    })
}
