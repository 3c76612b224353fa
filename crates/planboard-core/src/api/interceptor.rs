//! Request/response hooks tying outbound HTTP to the session.

use std::sync::Arc;

use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info, warn};

use crate::auth::{InvalidationReason, SessionManager, SessionTicket};

use super::client::ApiClient;
use super::error::Operation;
use super::AuthError;

/// What the post-response hook did with a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseDisposition {
    Passed,
    /// This response ended the session.
    Invalidated,
    /// Authentication failure for a session that was already gone.
    AlreadyInvalidated,
}

#[derive(Clone)]
pub struct Interceptor {
    session: Arc<SessionManager>,
}

impl Interceptor {
    pub fn new(session: Arc<SessionManager>) -> Self {
        Self { session }
    }

    /// Attach the bearer credential, if any, and note which session the
    /// request belongs to. In cookie mode the cookie jar does the attaching.
    pub fn before_request(&self, headers: &mut HeaderMap) -> SessionTicket {
        self.session.check_expiry();
        let ticket = self.session.ticket();

        if !self.session.is_authenticated() {
            return ticket;
        }
        if let Some(credential) = self.session.credential() {
            match HeaderValue::from_str(&format!("Bearer {}", credential.expose())) {
                Ok(mut value) => {
                    value.set_sensitive(true);
                    headers.insert(header::AUTHORIZATION, value);
                }
                Err(e) => warn!(error = %e, "Stored credential is not a valid header value"),
            }
        }
        ticket
    }

    /// End the session on an authentication failure. Concurrent failures
    /// from the same session invalidate it once.
    pub fn after_response(&self, ticket: SessionTicket, status: StatusCode) -> ResponseDisposition {
        if status != StatusCode::UNAUTHORIZED {
            return ResponseDisposition::Passed;
        }
        if self.session.invalidate(ticket, InvalidationReason::Rejected) {
            info!("Server rejected the session credential");
            ResponseDisposition::Invalidated
        } else {
            debug!("Authentication failure for an already ended session");
            ResponseDisposition::AlreadyInvalidated
        }
    }
}

/// Executes dashboard API requests with the interceptor applied.
/// Clone is cheap - the client and session are shared.
#[derive(Clone)]
pub struct AuthorizedClient {
    api: ApiClient,
    interceptor: Interceptor,
}

impl AuthorizedClient {
    pub fn new(api: ApiClient, session: Arc<SessionManager>) -> Self {
        Self {
            api,
            interceptor: Interceptor::new(session),
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, AuthError> {
        let response = self.execute(self.api.get(path)).await?;
        Ok(response.json().await?)
    }

    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, AuthError> {
        let response = self.execute(self.api.post(path).json(body)).await?;
        Ok(response.json().await?)
    }

    pub async fn execute(&self, builder: RequestBuilder) -> Result<Response, AuthError> {
        let mut headers = HeaderMap::new();
        let ticket = self.interceptor.before_request(&mut headers);

        let response = builder.headers(headers).send().await?;
        self.interceptor.after_response(ticket, response.status());
        ApiClient::check_response(Operation::Request, response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::credentials::{Credential, CredentialStore, MemoryCredentialStore};
    use crate::config::{Config, CredentialMode};
    use crate::models::{IdentityClaims, Role};

    fn session(mode: CredentialMode, store: Arc<MemoryCredentialStore>) -> Arc<SessionManager> {
        // Never contacted: hydration does no network I/O.
        let api = ApiClient::new(&Config::default()).unwrap();
        let manager = SessionManager::new(mode, store, Arc::new(api));
        manager.initialize();
        Arc::new(manager)
    }

    fn seeded(credential: Option<&str>) -> Arc<MemoryCredentialStore> {
        let store = Arc::new(MemoryCredentialStore::new());
        store
            .set(
                credential.map(Credential::new).as_ref(),
                &IdentityClaims::new("alice", "Acme", Role::Member),
            )
            .unwrap();
        store
    }

    #[test]
    fn test_before_request_attaches_bearer() {
        let interceptor = Interceptor::new(session(CredentialMode::Bearer, seeded(Some("tok-123"))));
        let mut headers = HeaderMap::new();
        interceptor.before_request(&mut headers);

        let value = headers.get(header::AUTHORIZATION).unwrap();
        assert_eq!(value.to_str().unwrap(), "Bearer tok-123");
        assert!(value.is_sensitive());
    }

    #[test]
    fn test_before_request_cookie_mode_adds_nothing() {
        let interceptor = Interceptor::new(session(CredentialMode::Cookie, seeded(None)));
        let mut headers = HeaderMap::new();
        interceptor.before_request(&mut headers);
        assert!(headers.is_empty());
    }

    #[test]
    fn test_before_request_unauthenticated_adds_nothing() {
        let interceptor = Interceptor::new(session(
            CredentialMode::Bearer,
            Arc::new(MemoryCredentialStore::new()),
        ));
        let mut headers = HeaderMap::new();
        interceptor.before_request(&mut headers);
        assert!(headers.get(header::AUTHORIZATION).is_none());
    }

    #[test]
    fn test_after_response_invalidates_once() {
        let store = seeded(Some("tok"));
        let manager = session(CredentialMode::Bearer, store.clone());
        let interceptor = Interceptor::new(manager.clone());

        let mut headers = HeaderMap::new();
        let first = interceptor.before_request(&mut headers);
        let second = interceptor.before_request(&mut headers);

        assert_eq!(
            interceptor.after_response(first, StatusCode::UNAUTHORIZED),
            ResponseDisposition::Invalidated
        );
        assert_eq!(
            interceptor.after_response(second, StatusCode::UNAUTHORIZED),
            ResponseDisposition::AlreadyInvalidated
        );
        assert!(!manager.is_authenticated());
        assert!(store.get().unwrap().is_none());
    }

    #[test]
    fn test_after_response_passes_other_statuses() {
        let manager = session(CredentialMode::Bearer, seeded(Some("tok")));
        let interceptor = Interceptor::new(manager.clone());
        let ticket = manager.ticket();

        for status in [StatusCode::OK, StatusCode::FORBIDDEN, StatusCode::INTERNAL_SERVER_ERROR] {
            assert_eq!(interceptor.after_response(ticket, status), ResponseDisposition::Passed);
        }
        assert!(manager.is_authenticated());
    }
}
