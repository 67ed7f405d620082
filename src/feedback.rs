//! Thumbs up / down on a finished correction
//!
//! Feedback is fire-and-forget: the request runs on its own task and a
//! failure is only logged.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::api::ApiClient;
use crate::auth::SessionContext;
use crate::error::ClientError;
use crate::state_machine::CorrectionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "i8", try_from = "i8")]
pub enum Rating {
    Helpful = 1,
    NotHelpful = -1,
}

impl From<Rating> for i8 {
    fn from(rating: Rating) -> Self {
        rating as i8
    }
}

impl TryFrom<i8> for Rating {
    type Error = String;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Rating::Helpful),
            -1 => Ok(Rating::NotHelpful),
            other => Err(format!("rating must be 1 or -1, got {}", other)),
        }
    }
}

impl std::str::FromStr for Rating {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "up" | "+1" | "1" | "helpful" => Ok(Rating::Helpful),
            "down" | "-1" | "not-helpful" => Ok(Rating::NotHelpful),
            other => Err(format!("unknown rating '{}' (expected up or down)", other)),
        }
    }
}

/// Body of `POST /api/feedback`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedbackRequest {
    pub session_id: String,
    pub rating: Rating,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl FeedbackRequest {
    pub fn new(session_id: impl Into<String>, rating: Rating, comment: Option<String>) -> Self {
        Self {
            session_id: session_id.into(),
            rating,
            comment: comment.filter(|c| !c.trim().is_empty()),
        }
    }
}

/// Rate the correction held in `state`.
///
/// Fails only if the server never assigned a session id. The returned task
/// never fails; await it only to know the request is finished.
pub fn submit_feedback(
    api: Arc<ApiClient>,
    auth: &SessionContext,
    state: &CorrectionState,
    rating: Rating,
    comment: Option<String>,
) -> Result<JoinHandle<()>, ClientError> {
    let session_id = state
        .session_id
        .as_deref()
        .filter(|id| !id.is_empty())
        .ok_or(ClientError::MissingSession)?;
    Ok(submit_session_feedback(
        api,
        auth,
        FeedbackRequest::new(session_id, rating, comment),
    ))
}

/// Send feedback for a known session id, e.g. one taken from the history.
pub fn submit_session_feedback(
    api: Arc<ApiClient>,
    auth: &SessionContext,
    request: FeedbackRequest,
) -> JoinHandle<()> {
    let bearer = auth.bearer_token();
    tokio::spawn(async move {
        let bearer = match bearer {
            Ok(token) => token,
            Err(e) => {
                log::warn!("Feedback for {} not sent: {}", request.session_id, e);
                return;
            }
        };
        match api.submit_feedback(&bearer, &request).await {
            Ok(()) => log::info!(
                "Feedback sent for {} ({:?})",
                request.session_id,
                request.rating
            ),
            Err(e) => log::warn!("Feedback for {} failed: {}", request.session_id, e),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Client;

    #[test]
    fn rating_serializes_as_integer() {
        let body = FeedbackRequest::new("s1", Rating::NotHelpful, None);
        assert_eq!(
            serde_json::to_string(&body).unwrap(),
            r#"{"session_id":"s1","rating":-1}"#
        );

        let with_comment = FeedbackRequest::new("s1", Rating::Helpful, Some("Clair".to_string()));
        assert_eq!(
            serde_json::to_value(&with_comment).unwrap(),
            serde_json::json!({"session_id": "s1", "rating": 1, "comment": "Clair"})
        );
    }

    #[test]
    fn blank_comment_is_dropped() {
        let body = FeedbackRequest::new("s1", Rating::Helpful, Some("  ".to_string()));
        assert!(body.comment.is_none());
    }

    #[test]
    fn rating_parsing() {
        assert_eq!("up".parse::<Rating>(), Ok(Rating::Helpful));
        assert_eq!("DOWN".parse::<Rating>(), Ok(Rating::NotHelpful));
        assert!("meh".parse::<Rating>().is_err());
        assert!(serde_json::from_str::<Rating>("0").is_err());
        assert_eq!(serde_json::from_str::<Rating>("-1").unwrap(), Rating::NotHelpful);
    }

    #[tokio::test]
    async fn feedback_requires_session_id() {
        let api = Arc::new(ApiClient::with_client(Client::new(), "http://127.0.0.1:9"));
        let result = submit_feedback(
            api,
            &SessionContext::new(),
            &CorrectionState::default(),
            Rating::Helpful,
            None,
        );
        assert!(matches!(result, Err(ClientError::MissingSession)));
    }

    #[tokio::test]
    async fn missing_auth_is_logged_not_raised() {
        let api = Arc::new(ApiClient::with_client(Client::new(), "http://127.0.0.1:9"));
        let state = CorrectionState {
            session_id: Some("s1".to_string()),
            ..Default::default()
        };
        let handle =
            submit_feedback(api, &SessionContext::new(), &state, Rating::Helpful, None).unwrap();
        handle.await.unwrap();
    }
}
