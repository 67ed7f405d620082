//! Secure storage for the StudyBuddy access token using the system keyring.
//!
//! The token is stored in the OS's native secret storage:
//! - Linux: libsecret (GNOME Keyring/KDE Wallet)
//! - macOS: Keychain
//! - Windows: Credential Manager
//!
//! Never log the token value.

use keyring::Entry;

use crate::auth::AuthSession;

const SERVICE_NAME: &str = "studybuddy";
const ACCESS_TOKEN_NAME: &str = "access-token";
const USER_ID_NAME: &str = "user-id";

/// Takes precedence over the keyring when set and non-empty.
pub const ACCESS_TOKEN_ENV: &str = "STUDYBUDDY_ACCESS_TOKEN";

fn read_entry(name: &str) -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, name) {
        Ok(e) => e,
        Err(e) => {
            log::warn!("Credentials: failed to create keyring entry {}: {}", name, e);
            return None;
        }
    };

    match entry.get_password() {
        Ok(value) if !value.is_empty() => Some(value),
        Ok(_) => None,
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            log::warn!("Credentials: failed to retrieve {}: {}", name, e);
            None
        }
    }
}

fn write_entry(name: &str, value: Option<&str>) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, name)
        .map_err(|e| format!("Failed to create keyring entry: {}", e))?;

    match value {
        Some(v) if !v.is_empty() => entry
            .set_password(v)
            .map_err(|e| format!("Failed to store {}: {}", name, e)),
        _ => match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(format!("Failed to delete {}: {}", name, e)),
        },
    }
}

/// Retrieve the stored session, if any. Errors are logged and read as "none".
pub fn load_session() -> Option<AuthSession> {
    let token = read_entry(ACCESS_TOKEN_NAME)?;
    let session = AuthSession::new(token);
    Some(match read_entry(USER_ID_NAME) {
        Some(user_id) => session.with_user_id(user_id),
        None => session,
    })
}

/// Store the session in the keyring. Pass `None` to delete it.
pub fn store_session(session: Option<&AuthSession>) -> Result<(), String> {
    match session {
        Some(s) => {
            write_entry(ACCESS_TOKEN_NAME, Some(s.access_token()))?;
            write_entry(USER_ID_NAME, s.user_id.as_deref())?;
            log::info!("Credentials: stored access token");
        }
        None => {
            write_entry(ACCESS_TOKEN_NAME, None)?;
            write_entry(USER_ID_NAME, None)?;
            log::info!("Credentials: deleted access token");
        }
    }
    Ok(())
}

/// Resolve the session from `STUDYBUDDY_ACCESS_TOKEN`, then the keyring.
pub fn resolve_session() -> Option<AuthSession> {
    token_from_env(std::env::var(ACCESS_TOKEN_ENV).ok()).or_else(load_session)
}

fn token_from_env(value: Option<String>) -> Option<AuthSession> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(AuthSession::new)
}
