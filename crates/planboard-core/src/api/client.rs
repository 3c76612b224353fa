//! HTTP client for the dashboard API.
//!
//! This module provides the `AuthEndpoint` seam the session manager talks
//! to, and `ApiClient`, its reqwest implementation.

use std::fmt;

use async_trait::async_trait;
use reqwest::{header, Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::auth::Credential;
use crate::config::{Config, CredentialMode};
use crate::models::Role;

use super::error::Operation;
use super::AuthError;

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoginResponse {
    pub username: Option<String>,
    #[serde(alias = "companyName")]
    pub company_name: Option<String>,
    pub role: Option<Role>,
    /// Absent when the server sets a session cookie instead.
    #[serde(alias = "credential")]
    pub access_token: Option<Credential>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RefreshResponse {
    #[serde(alias = "credential")]
    pub access_token: Option<Credential>,
}

#[derive(Clone, Serialize)]
pub struct Registration {
    pub username: String,
    pub password: String,
    pub company_name: String,
    pub role: Role,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("username", &self.username)
            .field("company_name", &self.company_name)
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RegisteredUser {
    pub id: Option<String>,
    pub username: String,
    #[serde(alias = "companyName")]
    pub company_name: String,
    pub role: Role,
}

#[derive(Debug, Deserialize)]
struct RegisterResponse {
    user: RegisteredUser,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

// ============================================================================
// Endpoint seam
// ============================================================================

/// Server-side authentication collaborator.
#[async_trait]
pub trait AuthEndpoint: Send + Sync {
    async fn login(&self, username: &str, password: &str) -> Result<LoginResponse, AuthError>;

    async fn register(&self, registration: &Registration) -> Result<RegisteredUser, AuthError>;

    async fn logout(&self, credential: Option<&Credential>) -> Result<(), AuthError>;

    async fn refresh(&self, credential: Option<&Credential>) -> Result<RefreshResponse, AuthError>;
}

// ============================================================================
// reqwest implementation
// ============================================================================

/// API client for the dashboard server.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    /// Create a new API client. Cookie mode keeps a cookie jar so the
    /// server-managed session rides along on every request.
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .cookie_store(config.credential_mode == CredentialMode::Cookie)
            .build()?;

        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub fn get(&self, path: &str) -> RequestBuilder {
        self.client.get(self.url(path))
    }

    pub fn post(&self, path: &str) -> RequestBuilder {
        self.client.post(self.url(path)).header(header::ACCEPT, "application/json")
    }

    fn with_credential(builder: RequestBuilder, credential: Option<&Credential>) -> RequestBuilder {
        match credential {
            Some(credential) => builder.bearer_auth(credential.expose()),
            None => builder,
        }
    }

    /// Check if response is successful, returning a classified error if not.
    pub async fn check_response(
        operation: Operation,
        response: Response,
    ) -> Result<Response, AuthError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            debug!(?operation, %status, "Auth endpoint rejected request");
            Err(AuthError::from_status(operation, status, &body))
        }
    }
}

#[async_trait]
impl AuthEndpoint for ApiClient {
    async fn login(&self, username: &str, password: &str) -> Result<LoginResponse, AuthError> {
        let response = self
            .post("/login")
            .json(&LoginRequest { username, password })
            .send()
            .await?;

        let response = Self::check_response(Operation::Login, response).await?;
        Ok(response.json().await?)
    }

    async fn register(&self, registration: &Registration) -> Result<RegisteredUser, AuthError> {
        let response = self.post("/register").json(registration).send().await?;

        let response = Self::check_response(Operation::Register, response).await?;
        let body: RegisterResponse = response.json().await?;
        Ok(body.user)
    }

    async fn logout(&self, credential: Option<&Credential>) -> Result<(), AuthError> {
        let response = Self::with_credential(self.post("/logout"), credential)
            .send()
            .await?;

        Self::check_response(Operation::Logout, response).await?;
        Ok(())
    }

    async fn refresh(&self, credential: Option<&Credential>) -> Result<RefreshResponse, AuthError> {
        let response = Self::with_credential(self.post("/refresh"), credential)
            .send()
            .await?;

        let response = Self::check_response(Operation::Refresh, response).await?;
        // Cookie-mode servers may answer with an empty body.
        let body = response.text().await?;
        if body.trim().is_empty() {
            return Ok(RefreshResponse::default());
        }
        serde_json::from_str(&body)
            .map_err(|e| AuthError::Server(format!("Invalid refresh response: {}", e)))
    }
}
