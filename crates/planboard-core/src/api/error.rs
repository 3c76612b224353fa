use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

use crate::auth::DecodeError;

/// Failure of a session operation, classified for display.
///
/// `Display` is the message shown to the user; the wrapped detail is for
/// logs.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AuthError {
    #[error("Invalid username or password")]
    InvalidCredentials,

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Server error. Please try again later.")]
    Server(String),

    #[error("Unable to connect to server. Please check your connection.")]
    Connectivity(String),

    #[error("Stored session could not be read: {0}")]
    Decode(#[from] DecodeError),

    #[error("Your session has expired. Please sign in again.")]
    ExpiredCredential,

    #[error("Request was superseded by a newer session change")]
    Superseded,

    #[error("Could not save session: {0}")]
    Storage(String),

    #[error("Not signed in")]
    Unauthenticated,

    /// Only a message the server chose to send is shown; raw bodies are not.
    #[error("Request failed ({status}){}", with_colon(.message))]
    Unexpected { status: u16, message: Option<String> },
}

fn with_colon(message: &Option<String>) -> String {
    message
        .as_deref()
        .map(|message| format!(": {}", message))
        .unwrap_or_default()
}

/// Which call produced a response; the same status means different things
/// for different calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Login,
    Register,
    Logout,
    Refresh,
    Request,
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
    message: Option<String>,
}

impl AuthError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        match body.char_indices().nth(MAX_ERROR_BODY_LENGTH) {
            None => body.to_string(),
            Some((cut, _)) => format!(
                "{}... (truncated, {} total bytes)",
                &body[..cut],
                body.len()
            ),
        }
    }

    /// Pull the server's own message out of a `{"error": ..}` or
    /// `{"message": ..}` body.
    fn server_message(body: &str) -> Option<String> {
        let parsed: ErrorBody = serde_json::from_str(body).ok()?;
        parsed
            .error
            .or(parsed.message)
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
    }

    pub fn from_status(operation: Operation, status: StatusCode, body: &str) -> Self {
        let message = Self::server_message(body);
        match status.as_u16() {
            401 if operation == Operation::Login => AuthError::InvalidCredentials,
            401 => AuthError::Unauthenticated,
            409 => AuthError::Conflict(
                message.unwrap_or_else(|| "Username already exists. Please choose another.".to_string()),
            ),
            400 | 422 => AuthError::Validation(message.unwrap_or_else(|| match operation {
                Operation::Login => "Missing required fields".to_string(),
                Operation::Register => "Please fill in all required fields correctly".to_string(),
                _ => "Invalid request".to_string(),
            })),
            500..=599 => AuthError::Server(Self::truncate_body(body)),
            code => AuthError::Unexpected { status: code, message },
        }
    }

    /// Map a transport failure. The raw `reqwest::Error` never leaves this
    /// module.
    pub fn from_transport(error: reqwest::Error) -> Self {
        if error.is_decode() {
            AuthError::Server(format!("Invalid response: {}", error))
        } else if error.is_timeout() {
            AuthError::Connectivity("Request timed out".to_string())
        } else {
            AuthError::Connectivity(error.to_string())
        }
    }

    /// Worth retrying later without new input.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AuthError::Connectivity(_) | AuthError::Server(_))
    }

    /// Ends the session quietly instead of being reported as a failed login.
    pub fn is_silent_invalidation(&self) -> bool {
        matches!(self, AuthError::Decode(_) | AuthError::ExpiredCredential)
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(error: reqwest::Error) -> Self {
        AuthError::from_transport(error)
    }
}
