//! Authenticated session context
//!
//! Controllers receive a [`SessionContext`] handle instead of reading a
//! process-wide store. Whoever owns the login flow sets or clears the session;
//! every clone observes the change.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::ClientError;

#[derive(Clone)]
pub struct AuthSession {
    pub user_id: Option<String>,
    access_token: String,
}

impl AuthSession {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            user_id: None,
            access_token: access_token.into(),
        }
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }
}

// Never print the token
impl fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSession")
            .field("user_id", &self.user_id)
            .field("access_token", &"***")
            .finish()
    }
}

/// Shared handle to the current authenticated session
#[derive(Clone, Default)]
pub struct SessionContext {
    inner: Arc<RwLock<Option<AuthSession>>>,
}

impl SessionContext {
    /// Context with no session
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(session: AuthSession) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Some(session))),
        }
    }

    pub fn set_session(&self, session: Option<AuthSession>) {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        match &session {
            Some(s) => log::info!("Auth: session set (user {:?})", s.user_id),
            None => log::info!("Auth: session cleared"),
        }
        *guard = session;
    }

    pub fn clear(&self) {
        self.set_session(None);
    }

    pub fn session(&self) -> Option<AuthSession> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.bearer_token().is_ok()
    }

    /// Access token for the `Authorization` header.
    pub fn bearer_token(&self) -> Result<String, ClientError> {
        self.session()
            .map(|s| s.access_token)
            .filter(|t| !t.trim().is_empty())
            .ok_or(ClientError::MissingAuth)
    }
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("session", &self.session())
            .finish()
    }
}
