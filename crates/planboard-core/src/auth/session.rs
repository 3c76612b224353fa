//! Session state machine.
//!
//! One `SessionManager` owns the client's single logical session. It is
//! constructed explicitly and shared through `Arc`, so tests can run
//! isolated sessions side by side.
//!
//! Every transition bumps a session epoch. Work that suspends on the network
//! captures a `SessionTicket` first and is discarded on resumption if the
//! epoch moved in the meantime. Overlapping logins (and overlapping
//! refreshes) are sequenced: only the most recently started one may commit.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::api::{ApiClient, AuthEndpoint, AuthError, LoginResponse, RegisteredUser, Registration};
use crate::config::{Config, CredentialMode};
use crate::models::{IdentityClaims, Role};

use super::credentials::{self, Credential, CredentialStore, StoredSession};
use super::decoder;
use super::identity::{IdentityStore, IdentityView};

/// Login/refresh time limit when none is configured.
const DEFAULT_TIMEOUT_SECS: u64 = 10;

const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Source of the current time.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Expiry is a trigger, not a resting state: an expired session moves
/// straight to `Unauthenticated`.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    Unauthenticated,
    Authenticated(IdentityClaims),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationReason {
    /// The server answered an authenticated request with 401.
    Rejected,
    Expired,
    /// Stored session or credential could not be read or decoded.
    Malformed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    SignedIn(IdentityClaims),
    /// Claims superseded without a new login (refresh or profile change).
    Updated(IdentityClaims),
    SignedOut,
    Invalidated(InvalidationReason),
}

/// The session epoch an operation started under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTicket(u64);

/// Fields of the current identity that may change without signing in again.
#[derive(Debug, Clone, Default)]
pub struct ClaimsUpdate {
    pub company_name: Option<String>,
    pub role: Option<Role>,
}

struct Inner {
    state: SessionState,
    /// Bumped by every transition.
    epoch: u64,
    /// Bumped only when the session ends (logout, invalidation, expiry).
    generation: u64,
    logins: u64,
    refreshes: u64,
    /// The stored record this manager wrote or restored.
    held: Option<StoredSession>,
}

/// Where an in-flight login or refresh started.
#[derive(Debug, Clone, Copy)]
struct Attempt {
    seq: u64,
    epoch: u64,
    generation: u64,
}

impl Inner {
    fn begin_login(&mut self) -> Attempt {
        self.logins += 1;
        self.attempt(self.logins)
    }

    fn begin_refresh(&mut self) -> Attempt {
        self.refreshes += 1;
        self.attempt(self.refreshes)
    }

    fn attempt(&self, seq: u64) -> Attempt {
        Attempt {
            seq,
            epoch: self.epoch,
            generation: self.generation,
        }
    }

    /// The newest login, with no sign-out since it started.
    fn admits_login(&self, attempt: Attempt) -> bool {
        attempt.seq == self.logins && attempt.generation == self.generation
    }

    /// The newest refresh, with the session untouched since it started.
    fn admits_refresh(&self, attempt: Attempt) -> bool {
        attempt.seq == self.refreshes && attempt.epoch == self.epoch
    }
}

enum Hydration {
    Empty,
    Restored {
        claims: IdentityClaims,
        credential: Option<Credential>,
        repersist: bool,
    },
    Rejected(InvalidationReason),
}

pub struct SessionManager {
    mode: CredentialMode,
    store: Arc<dyn CredentialStore>,
    endpoint: Arc<dyn AuthEndpoint>,
    inner: Mutex<Inner>,
    identity: watch::Sender<IdentityView>,
    events: broadcast::Sender<SessionEvent>,
    timeout: Duration,
    clock: Clock,
}

impl SessionManager {
    pub fn new(
        mode: CredentialMode,
        store: Arc<dyn CredentialStore>,
        endpoint: Arc<dyn AuthEndpoint>,
    ) -> Self {
        let (identity, _) = watch::channel(IdentityView::default());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let clock: Clock = Arc::new(Utc::now);

        Self {
            mode,
            store,
            endpoint,
            inner: Mutex::new(Inner {
                state: SessionState::Unauthenticated,
                epoch: 0,
                generation: 0,
                logins: 0,
                refreshes: 0,
                held: None,
            }),
            identity,
            events,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            clock,
        }
    }

    /// Wire the configured store and the HTTP auth endpoint together.
    /// The session starts `Unauthenticated` until `initialize` runs.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Self::with_api(config, ApiClient::new(config)?)
    }

    /// Like `from_config`, but auth calls go through `api`. Clones of one
    /// `ApiClient` share a cookie jar, which cookie mode depends on.
    pub fn with_api(config: &Config, api: ApiClient) -> anyhow::Result<Self> {
        let store = credentials::open(config)?;
        Ok(Self::new(config.credential_mode, store, Arc::new(api)).with_timeout(config.request_timeout()))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn mode(&self) -> CredentialMode {
        self.mode
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    // ===== Observation =====

    pub fn state(&self) -> SessionState {
        self.lock().state.clone()
    }

    pub fn ticket(&self) -> SessionTicket {
        SessionTicket(self.lock().epoch)
    }

    pub fn identity(&self) -> IdentityStore {
        IdentityStore::new(self.identity.subscribe())
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Authenticated and, if the claims carry an expiry, not past it.
    /// Reads state only; `check_expiry` performs the transition.
    pub fn is_authenticated(&self) -> bool {
        let now = self.now();
        matches!(&self.lock().state, SessionState::Authenticated(claims) if !claims.is_expired_at(now))
    }

    pub fn current_identity(&self) -> Option<IdentityClaims> {
        match &self.lock().state {
            SessionState::Authenticated(claims) => Some(claims.clone()),
            SessionState::Unauthenticated => None,
        }
    }

    pub fn time_until_expiry(&self) -> Option<chrono::Duration> {
        let now = self.now();
        self.current_identity()
            .and_then(|claims| claims.time_until_expiry(now))
    }

    /// Check if the session will expire soon and should be refreshed
    pub fn needs_refresh(&self) -> bool {
        let now = self.now();
        self.current_identity()
            .map(|claims| claims.needs_refresh_at(now))
            .unwrap_or(false)
    }

    /// Bearer credential for an outbound request. Always `None` in cookie
    /// mode, where the client never holds the credential.
    pub fn credential(&self) -> Option<Credential> {
        match self.stored_credential() {
            Ok(credential) => credential,
            Err(e) => {
                warn!(error = %e, "Failed to read stored credential");
                None
            }
        }
    }

    fn stored_credential(&self) -> anyhow::Result<Option<Credential>> {
        if self.mode == CredentialMode::Cookie {
            return Ok(None);
        }
        Ok(self
            .store
            .get()?
            .and_then(|stored| stored.credential)
            .filter(|credential| !credential.is_empty()))
    }

    // ===== Transitions =====

    fn transition(&self, inner: &mut Inner, state: SessionState, event: SessionEvent) {
        inner.state = state;
        inner.epoch += 1;
        self.identity.send_replace(IdentityView::from_state(&inner.state));
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    /// End the session. The stored record is removed only if it is still
    /// the one this manager holds; another client may have signed in since.
    fn clear_locked(&self, inner: &mut Inner, event: SessionEvent) {
        if let Some(record) = inner.held.take() {
            match self.store.clear_if(&record) {
                Ok(true) => {}
                Ok(false) => debug!("Stored session belongs to a newer sign-in, leaving it"),
                Err(e) => warn!(error = %e, "Failed to clear stored session"),
            }
        }
        inner.generation += 1;
        self.transition(inner, SessionState::Unauthenticated, event);
    }

    fn persist(
        &self,
        inner: &mut Inner,
        credential: Option<&Credential>,
        claims: &IdentityClaims,
    ) -> Result<(), AuthError> {
        let record = self
            .store
            .set(credential, claims)
            .map_err(|e| AuthError::Storage(e.to_string()))?;
        inner.held = Some(record);
        Ok(())
    }

    /// Hydrate from the credential store. No network I/O; safe to repeat.
    pub fn initialize(&self) -> SessionState {
        let now = self.now();
        let mut inner = self.lock();

        let mut read = None;
        let hydration = match self.store.get() {
            Ok(None) => Hydration::Empty,
            Ok(Some(stored)) => {
                read = Some(stored.clone());
                self.hydrate(stored, now)
            }
            Err(e) => {
                warn!(error = %e, "Stored session is unreadable, clearing");
                Hydration::Rejected(InvalidationReason::Malformed)
            }
        };

        let (state, event) = match hydration {
            Hydration::Restored {
                claims,
                credential,
                repersist,
            } => {
                inner.held = read;
                if repersist {
                    if let Err(e) = self.persist(&mut inner, credential.as_ref(), &claims) {
                        warn!(error = %e, "Failed to persist restored claims");
                    }
                }
                debug!(username = %claims.username, company = %claims.company_name, "Session restored");
                (
                    SessionState::Authenticated(claims.clone()),
                    SessionEvent::SignedIn(claims),
                )
            }
            Hydration::Empty => {
                debug!("No stored session");
                inner.held = None;
                (SessionState::Unauthenticated, SessionEvent::SignedOut)
            }
            Hydration::Rejected(reason) => {
                inner.held = None;
                let cleared = match &read {
                    Some(record) => self.store.clear_if(record).map(|_| ()),
                    None => self.store.clear(),
                };
                if let Err(e) = cleared {
                    warn!(error = %e, "Failed to clear rejected session");
                }
                (SessionState::Unauthenticated, SessionEvent::Invalidated(reason))
            }
        };

        if inner.state != state {
            self.transition(&mut inner, state, event);
        }
        inner.state.clone()
    }

    fn hydrate(&self, stored: StoredSession, now: DateTime<Utc>) -> Hydration {
        let StoredSession {
            credential, claims, ..
        } = stored;

        match self.mode {
            CredentialMode::Cookie => match claims {
                Some(claims) => Self::check_claims(claims, None, now),
                None => Hydration::Rejected(InvalidationReason::Malformed),
            },
            CredentialMode::Bearer => {
                let Some(credential) = credential.filter(|c| !c.is_empty()) else {
                    debug!("Stored session has no bearer credential");
                    return Hydration::Rejected(InvalidationReason::Malformed);
                };

                let decoded = decoder::decode_at(credential.expose(), now);
                if let Err(decoder::DecodeError::Expired { expired_at }) = &decoded {
                    warn!(%expired_at, "Stored credential has expired");
                    return Hydration::Rejected(InvalidationReason::Expired);
                }

                match claims.filter(IdentityClaims::is_complete) {
                    Some(claims) => Self::check_claims(claims, Some(credential), now),
                    None => match decoded {
                        Ok(claims) => {
                            debug!("Restoring claims from the stored credential");
                            Hydration::Restored {
                                claims,
                                credential: Some(credential),
                                repersist: true,
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Stored credential could not be decoded");
                            Hydration::Rejected(InvalidationReason::Malformed)
                        }
                    },
                }
            }
        }
    }

    fn check_claims(
        claims: IdentityClaims,
        credential: Option<Credential>,
        now: DateTime<Utc>,
    ) -> Hydration {
        if claims.is_usable_at(now) {
            Hydration::Restored {
                claims,
                credential,
                repersist: false,
            }
        } else if !claims.is_complete() {
            warn!("Stored claims are missing username or company");
            Hydration::Rejected(InvalidationReason::Malformed)
        } else {
            warn!(username = %claims.username, "Stored session has expired");
            Hydration::Rejected(InvalidationReason::Expired)
        }
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, AuthError>>,
    ) -> Result<T, AuthError> {
        tokio::time::timeout(self.timeout, call)
            .await
            .unwrap_or_else(|_| Err(AuthError::Connectivity("Request timed out".to_string())))
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<IdentityClaims, AuthError> {
        let username = username.trim();
        if username.is_empty() || password.is_empty() {
            return Err(AuthError::Validation(
                "Username and password required".to_string(),
            ));
        }

        let attempt = self.lock().begin_login();
        let response = match self.bounded(self.endpoint.login(username, password)).await {
            Ok(response) => response,
            Err(e) => {
                error!(error = %e, username = %username, "Login failed");
                return Err(e);
            }
        };
        let (credential, claims) = self.claims_from_login(username, response)?;

        let mut inner = self.lock();
        if !inner.admits_login(attempt) {
            warn!(username = %username, "Discarding login result superseded by a newer login or sign-out");
            return Err(AuthError::Superseded);
        }

        self.persist(&mut inner, credential.as_ref(), &claims).map_err(|e| {
            error!(error = %e, "Failed to persist session");
            e
        })?;

        self.transition(
            &mut inner,
            SessionState::Authenticated(claims.clone()),
            SessionEvent::SignedIn(claims.clone()),
        );
        info!(username = %claims.username, company = %claims.company_name, role = %claims.role, "Login successful");
        Ok(claims)
    }

    /// The response body is authoritative for identity; the credential only
    /// contributes its expiry.
    fn claims_from_login(
        &self,
        username: &str,
        response: LoginResponse,
    ) -> Result<(Option<Credential>, IdentityClaims), AuthError> {
        let company_name = response
            .company_name
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| AuthError::Server("Login response did not include a company".to_string()))?;
        let username = response
            .username
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| username.to_string());
        let claims = IdentityClaims::new(username, company_name, response.role.unwrap_or_default());

        match self.mode {
            CredentialMode::Cookie => Ok((None, claims)),
            CredentialMode::Bearer => {
                let credential = response
                    .access_token
                    .filter(|credential| !credential.is_empty())
                    .ok_or_else(|| {
                        AuthError::Server("Login response did not include an access token".to_string())
                    })?;
                let expires_at = self.credential_expiry(&credential)?;
                Ok((Some(credential), claims.with_expiry(expires_at)))
            }
        }
    }

    /// Expiry carried by a bearer credential. Opaque credentials carry none.
    fn credential_expiry(&self, credential: &Credential) -> Result<Option<DateTime<Utc>>, AuthError> {
        match decoder::expiry(credential.expose()) {
            Ok(Some(expired_at)) if expired_at <= self.now() => {
                warn!(%expired_at, "Server issued an already expired credential");
                Err(AuthError::ExpiredCredential)
            }
            Ok(expires_at) => Ok(expires_at),
            Err(e) => {
                debug!(error = %e, "Credential is not decodable, treating it as opaque");
                Ok(None)
            }
        }
    }

    /// Clear the local session, then tell the server. A failed server call is
    /// logged; the local session is gone either way.
    pub async fn logout(&self) {
        let credential = self.credential();
        {
            let mut inner = self.lock();
            self.clear_locked(&mut inner, SessionEvent::SignedOut);
        }
        info!("Signed out");

        if let Err(e) = self.bounded(self.endpoint.logout(credential.as_ref())).await {
            warn!(error = %e, "Server logout failed; local session already cleared");
        }
    }

    /// Forced invalidation: local clear only, no server round trip.
    ///
    /// Returns `true` only for the call that actually ended the session. A
    /// ticket from an earlier epoch, or an already cleared session, is a
    /// no-op.
    pub fn invalidate(&self, ticket: SessionTicket, reason: InvalidationReason) -> bool {
        let mut inner = self.lock();
        if inner.epoch != ticket.0 {
            debug!(?reason, "Ignoring invalidation from a previous session");
            return false;
        }
        if inner.state == SessionState::Unauthenticated {
            return false;
        }
        warn!(?reason, "Session invalidated");
        self.clear_locked(&mut inner, SessionEvent::Invalidated(reason));
        true
    }

    /// Enforce lazy expiry. Returns whether a live session remains.
    pub fn check_expiry(&self) -> bool {
        let now = self.now();
        let mut inner = self.lock();
        let expired = match &inner.state {
            SessionState::Authenticated(claims) => claims.is_expired_at(now),
            SessionState::Unauthenticated => return false,
        };
        if expired {
            warn!("Session expired");
            self.clear_locked(&mut inner, SessionEvent::Invalidated(InvalidationReason::Expired));
        }
        !expired
    }

    pub async fn refresh(&self) -> Result<IdentityClaims, AuthError> {
        let (attempt, claims) = {
            let mut inner = self.lock();
            let claims = match &inner.state {
                SessionState::Authenticated(claims) => claims.clone(),
                SessionState::Unauthenticated => return Err(AuthError::Unauthenticated),
            };
            (inner.begin_refresh(), claims)
        };
        let ticket = SessionTicket(attempt.epoch);

        let credential = self.credential();
        if self.mode == CredentialMode::Bearer && credential.is_none() {
            self.invalidate(ticket, InvalidationReason::Malformed);
            return Err(AuthError::Unauthenticated);
        }

        let response = match self.bounded(self.endpoint.refresh(credential.as_ref())).await {
            Ok(response) => response,
            Err(AuthError::Unauthenticated) => {
                self.invalidate(ticket, InvalidationReason::Rejected);
                return Err(AuthError::Unauthenticated);
            }
            Err(e) => {
                warn!(error = %e, "Session refresh failed");
                return Err(e);
            }
        };

        let (credential, claims) = match self.mode {
            CredentialMode::Cookie => (None, claims),
            CredentialMode::Bearer => {
                let fresh = response
                    .access_token
                    .filter(|credential| !credential.is_empty())
                    .ok_or_else(|| {
                        AuthError::Server("Refresh response did not include an access token".to_string())
                    })?;
                let expires_at = match self.credential_expiry(&fresh) {
                    Ok(expires_at) => expires_at,
                    Err(e) => {
                        self.invalidate(ticket, InvalidationReason::Expired);
                        return Err(e);
                    }
                };
                (Some(fresh), claims.with_expiry(expires_at))
            }
        };

        let mut inner = self.lock();
        if !inner.admits_refresh(attempt) {
            warn!("Discarding refresh result superseded by a newer session change");
            return Err(AuthError::Superseded);
        }
        self.persist(&mut inner, credential.as_ref(), &claims)?;
        self.transition(
            &mut inner,
            SessionState::Authenticated(claims.clone()),
            SessionEvent::Updated(claims.clone()),
        );
        info!(username = %claims.username, expires_at = ?claims.expires_at, "Session refreshed");
        Ok(claims)
    }

    /// Create an account. Does not sign in.
    pub async fn register(&self, registration: &Registration) -> Result<RegisteredUser, AuthError> {
        let missing: Vec<&str> = [
            ("username", registration.username.as_str()),
            ("password", registration.password.as_str()),
            ("company_name", registration.company_name.as_str()),
            ("role", registration.role.as_str()),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(field, _)| field)
        .collect();

        if !missing.is_empty() {
            return Err(AuthError::Validation(format!(
                "{} required",
                missing.join(", ")
            )));
        }

        match self.bounded(self.endpoint.register(registration)).await {
            Ok(user) => {
                info!(username = %user.username, company = %user.company_name, "Registration successful");
                Ok(user)
            }
            Err(e) => {
                error!(error = %e, username = %registration.username, "Registration failed");
                Err(e)
            }
        }
    }

    /// Supersede the current claims with a new company or role.
    pub fn update_claims(&self, update: ClaimsUpdate) -> Result<IdentityClaims, AuthError> {
        let mut inner = self.lock();
        let current = match &inner.state {
            SessionState::Authenticated(claims) => claims.clone(),
            SessionState::Unauthenticated => return Err(AuthError::Unauthenticated),
        };

        let updated = IdentityClaims {
            company_name: update
                .company_name
                .map(|name| name.trim().to_string())
                .unwrap_or_else(|| current.company_name.clone()),
            role: update.role.unwrap_or_else(|| current.role.clone()),
            ..current
        };
        if !updated.is_complete() {
            return Err(AuthError::Validation("Company name is required".to_string()));
        }

        let credential = inner
            .held
            .as_ref()
            .and_then(|record| record.credential.clone());
        if self.mode == CredentialMode::Bearer && credential.is_none() {
            return Err(AuthError::Storage("No stored credential".to_string()));
        }
        self.persist(&mut inner, credential.as_ref(), &updated)?;

        self.transition(
            &mut inner,
            SessionState::Authenticated(updated.clone()),
            SessionEvent::Updated(updated.clone()),
        );
        Ok(updated)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use tokio::sync::Notify;

    use super::*;
    use crate::api::RefreshResponse;
    use crate::auth::credentials::MemoryCredentialStore;
    use crate::auth::decoder::test_token;

    // -------------------------------------------------------------------------
    // Fakes
    // -------------------------------------------------------------------------

    struct FakeEndpoint {
        login: Mutex<Result<LoginResponse, AuthError>>,
        refresh: Mutex<Result<RefreshResponse, AuthError>>,
        register: Mutex<Result<RegisteredUser, AuthError>>,
        logout_fails: bool,
        calls: AtomicUsize,
        gate: Option<Arc<Notify>>,
        refresh_gate: Option<Arc<Notify>>,
        /// Per-username login latency.
        delays: Vec<(&'static str, u64)>,
    }

    impl FakeEndpoint {
        fn accepting(response: LoginResponse) -> Self {
            Self {
                login: Mutex::new(Ok(response)),
                refresh: Mutex::new(Err(AuthError::Server("no refresh".to_string()))),
                register: Mutex::new(Err(AuthError::Server("no register".to_string()))),
                logout_fails: false,
                calls: AtomicUsize::new(0),
                gate: None,
                refresh_gate: None,
                delays: Vec::new(),
            }
        }

        fn rejecting(error: AuthError) -> Self {
            let fake = Self::accepting(LoginResponse::default());
            *fake.login.lock().unwrap() = Err(error);
            fake
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AuthEndpoint for FakeEndpoint {
        async fn login(&self, username: &str, _password: &str) -> Result<LoginResponse, AuthError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if let Some((_, millis)) = self.delays.iter().find(|(name, _)| *name == username) {
                tokio::time::sleep(Duration::from_millis(*millis)).await;
            }
            self.login.lock().unwrap().clone()
        }

        async fn register(&self, _registration: &Registration) -> Result<RegisteredUser, AuthError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.register.lock().unwrap().clone()
        }

        async fn logout(&self, _credential: Option<&Credential>) -> Result<(), AuthError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.logout_fails {
                Err(AuthError::Connectivity("connection refused".to_string()))
            } else {
                Ok(())
            }
        }

        async fn refresh(&self, _credential: Option<&Credential>) -> Result<RefreshResponse, AuthError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.refresh_gate {
                gate.notified().await;
            }
            self.refresh.lock().unwrap().clone()
        }
    }

    fn token_expiring_in(seconds: i64) -> Credential {
        let exp = (Utc::now() + ChronoDuration::seconds(seconds)).timestamp();
        Credential::new(test_token(json!({
            "sub": "alice",
            "company_name": "Acme",
            "role": "manager",
            "exp": exp,
        })))
    }

    fn acme_login(token: Option<Credential>) -> LoginResponse {
        LoginResponse {
            username: Some("alice".to_string()),
            company_name: Some("Acme".to_string()),
            role: Some(Role::Manager),
            access_token: token,
        }
    }

    fn manager_with(
        mode: CredentialMode,
        store: Arc<MemoryCredentialStore>,
        endpoint: Arc<FakeEndpoint>,
    ) -> SessionManager {
        SessionManager::new(mode, store, endpoint)
    }

    fn shifted_clock(offset_secs: Arc<AtomicI64>) -> Clock {
        Arc::new(move || Utc::now() + ChronoDuration::seconds(offset_secs.load(Ordering::SeqCst)))
    }

    fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    // -------------------------------------------------------------------------
    // Hydration
    // -------------------------------------------------------------------------

    #[test]
    fn test_initialize_empty_store() {
        let store = Arc::new(MemoryCredentialStore::new());
        let endpoint = Arc::new(FakeEndpoint::accepting(acme_login(None)));
        let manager = manager_with(CredentialMode::Bearer, store, endpoint.clone());

        assert_eq!(manager.initialize(), SessionState::Unauthenticated);
        assert!(!manager.is_authenticated());
        assert_eq!(endpoint.calls(), 0);
    }

    #[test]
    fn test_initialize_restores_complete_bearer_session() {
        let store = Arc::new(MemoryCredentialStore::new());
        let claims = IdentityClaims::new("alice", "Acme", Role::Admin);
        store.set(Some(&token_expiring_in(3600)), &claims).unwrap();

        let endpoint = Arc::new(FakeEndpoint::accepting(acme_login(None)));
        let manager = manager_with(CredentialMode::Bearer, store, endpoint.clone());

        assert_eq!(manager.initialize(), SessionState::Authenticated(claims.clone()));
        assert!(manager.is_authenticated());
        assert_eq!(manager.current_identity(), Some(claims));
        assert_eq!(endpoint.calls(), 0);
    }

    #[test]
    fn test_initialize_rejects_claims_without_company() {
        let store = Arc::new(MemoryCredentialStore::new());
        let opaque = Credential::new("opaque-token");
        store
            .set(Some(&opaque), &IdentityClaims::new("alice", "", Role::Admin))
            .unwrap();

        let manager = manager_with(
            CredentialMode::Bearer,
            store.clone(),
            Arc::new(FakeEndpoint::accepting(acme_login(None))),
        );

        assert_eq!(manager.initialize(), SessionState::Unauthenticated);
        assert!(store.get().unwrap().is_none(), "rejected session must be cleared");
    }

    #[test]
    fn test_initialize_rejects_expired_claims() {
        let store = Arc::new(MemoryCredentialStore::new());
        let claims = IdentityClaims::new("alice", "Acme", Role::Member)
            .with_expiry(Some(Utc::now() - ChronoDuration::seconds(1)));
        store.set(Some(&Credential::new("opaque")), &claims).unwrap();

        let manager = manager_with(
            CredentialMode::Bearer,
            store.clone(),
            Arc::new(FakeEndpoint::accepting(acme_login(None))),
        );
        assert_eq!(manager.initialize(), SessionState::Unauthenticated);
        assert!(store.get().unwrap().is_none());
    }

    #[test]
    fn test_initialize_rejects_expired_credential_even_with_fresh_claims() {
        let store = Arc::new(MemoryCredentialStore::new());
        let claims = IdentityClaims::new("alice", "Acme", Role::Member);
        store.set(Some(&token_expiring_in(-5)), &claims).unwrap();

        let manager = manager_with(
            CredentialMode::Bearer,
            store.clone(),
            Arc::new(FakeEndpoint::accepting(acme_login(None))),
        );
        assert_eq!(manager.initialize(), SessionState::Unauthenticated);
    }

    #[test]
    fn test_initialize_recovers_from_corrupt_record() {
        let store = Arc::new(MemoryCredentialStore::with_raw("{\"credential\": 42"));
        let manager = manager_with(
            CredentialMode::Bearer,
            store.clone(),
            Arc::new(FakeEndpoint::accepting(acme_login(None))),
        );

        assert_eq!(manager.initialize(), SessionState::Unauthenticated);
        assert!(store.raw().is_none());
    }

    #[test]
    fn test_initialize_falls_back_to_decoded_claims() {
        let token = token_expiring_in(3600);
        let raw = json!({
            "credential": token.expose(),
            "saved_at": Utc::now(),
        });
        let store = Arc::new(MemoryCredentialStore::with_raw(raw.to_string()));
        let manager = manager_with(
            CredentialMode::Bearer,
            store.clone(),
            Arc::new(FakeEndpoint::accepting(acme_login(None))),
        );

        let state = manager.initialize();
        let SessionState::Authenticated(claims) = state else {
            panic!("expected restored session");
        };
        assert_eq!(claims.company_name, "Acme");
        assert_eq!(claims.role, Role::Manager);

        let persisted = store.get().unwrap().unwrap();
        assert_eq!(persisted.claims, Some(claims));
    }

    #[test]
    fn test_initialize_bearer_requires_token() {
        let store = Arc::new(MemoryCredentialStore::new());
        store
            .set(None, &IdentityClaims::new("alice", "Acme", Role::Member))
            .unwrap();
        let manager = manager_with(
            CredentialMode::Bearer,
            store,
            Arc::new(FakeEndpoint::accepting(acme_login(None))),
        );
        assert_eq!(manager.initialize(), SessionState::Unauthenticated);
    }

    #[test]
    fn test_initialize_cookie_mode_uses_claims_alone() {
        let store = Arc::new(MemoryCredentialStore::new());
        let claims = IdentityClaims::new("alice", "Acme", Role::Member);
        store.set(None, &claims).unwrap();
        let manager = manager_with(
            CredentialMode::Cookie,
            store,
            Arc::new(FakeEndpoint::accepting(acme_login(None))),
        );

        assert_eq!(manager.initialize(), SessionState::Authenticated(claims));
        assert!(manager.credential().is_none());
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let store = Arc::new(MemoryCredentialStore::new());
        let claims = IdentityClaims::new("alice", "Acme", Role::Member);
        store.set(Some(&Credential::new("opaque")), &claims).unwrap();
        let manager = manager_with(
            CredentialMode::Bearer,
            store,
            Arc::new(FakeEndpoint::accepting(acme_login(None))),
        );
        let mut events = manager.events();

        let first = manager.initialize();
        let second = manager.initialize();
        assert_eq!(first, second);
        assert_eq!(drain(&mut events), vec![SessionEvent::SignedIn(claims)]);
    }

    // -------------------------------------------------------------------------
    // Login / logout
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_login_success_derives_manager_flags() {
        let store = Arc::new(MemoryCredentialStore::new());
        let token = token_expiring_in(3600);
        let endpoint = Arc::new(FakeEndpoint::accepting(acme_login(Some(token.clone()))));
        let manager = manager_with(CredentialMode::Bearer, store.clone(), endpoint);
        let identity = manager.identity();

        let claims = manager.login("alice", "pw").await.unwrap();
        assert_eq!(claims.role, Role::Manager);
        assert!(claims.expires_at.is_some());
        assert!(manager.is_authenticated());
        assert_eq!(manager.current_identity().unwrap().role, Role::Manager);

        let view = identity.current();
        assert!(view.is_manager());
        assert!(!view.is_admin());
        assert_eq!(view.company_name(), Some("Acme"));

        let stored = store.get().unwrap().unwrap();
        assert_eq!(stored.credential, Some(token));
        assert_eq!(stored.claims, Some(claims));
    }

    #[tokio::test]
    async fn test_login_username_falls_back_to_submitted() {
        let response = LoginResponse {
            username: None,
            ..acme_login(Some(Credential::new("opaque")))
        };
        let manager = manager_with(
            CredentialMode::Bearer,
            Arc::new(MemoryCredentialStore::new()),
            Arc::new(FakeEndpoint::accepting(response)),
        );

        let claims = manager.login("  bob@acme.test ", "pw").await.unwrap();
        assert_eq!(claims.username, "bob@acme.test");
        assert!(claims.expires_at.is_none(), "opaque credential carries no expiry");
    }

    #[tokio::test]
    async fn test_login_rejected_leaves_no_trace() {
        let store = Arc::new(MemoryCredentialStore::new());
        let manager = manager_with(
            CredentialMode::Bearer,
            store.clone(),
            Arc::new(FakeEndpoint::rejecting(AuthError::InvalidCredentials)),
        );

        let err = manager.login("alice", "wrong").await.unwrap_err();
        assert_eq!(err, AuthError::InvalidCredentials);
        assert!(!manager.is_authenticated());
        assert!(store.raw().is_none());
    }

    #[tokio::test]
    async fn test_login_requires_both_fields() {
        let endpoint = Arc::new(FakeEndpoint::accepting(acme_login(None)));
        let manager = manager_with(
            CredentialMode::Bearer,
            Arc::new(MemoryCredentialStore::new()),
            endpoint.clone(),
        );

        let err = manager.login("  ", "pw").await.unwrap_err();
        assert!(matches!(err, AuthError::Validation(_)));
        assert!(manager.login("alice", "").await.is_err());
        assert_eq!(endpoint.calls(), 0);
    }

    #[tokio::test]
    async fn test_login_without_company_is_not_authenticated() {
        let response = LoginResponse {
            company_name: None,
            ..acme_login(Some(Credential::new("opaque")))
        };
        let store = Arc::new(MemoryCredentialStore::new());
        let manager = manager_with(
            CredentialMode::Bearer,
            store.clone(),
            Arc::new(FakeEndpoint::accepting(response)),
        );

        assert!(manager.login("alice", "pw").await.is_err());
        assert!(!manager.is_authenticated());
        assert!(store.raw().is_none());
    }

    #[tokio::test]
    async fn test_login_bearer_requires_token() {
        let manager = manager_with(
            CredentialMode::Bearer,
            Arc::new(MemoryCredentialStore::new()),
            Arc::new(FakeEndpoint::accepting(acme_login(None))),
        );
        let err = manager.login("alice", "pw").await.unwrap_err();
        assert!(matches!(err, AuthError::Server(_)));
    }

    #[tokio::test]
    async fn test_login_with_already_expired_token() {
        let manager = manager_with(
            CredentialMode::Bearer,
            Arc::new(MemoryCredentialStore::new()),
            Arc::new(FakeEndpoint::accepting(acme_login(Some(token_expiring_in(-10))))),
        );
        assert_eq!(
            manager.login("alice", "pw").await.unwrap_err(),
            AuthError::ExpiredCredential
        );
        assert!(!manager.is_authenticated());
    }

    #[tokio::test]
    async fn test_login_cookie_mode_persists_claims_only() {
        let store = Arc::new(MemoryCredentialStore::new());
        let manager = manager_with(
            CredentialMode::Cookie,
            store.clone(),
            Arc::new(FakeEndpoint::accepting(acme_login(Some(Credential::new("ignored"))))),
        );

        manager.login("alice", "pw").await.unwrap();
        let stored = store.get().unwrap().unwrap();
        assert!(stored.credential.is_none());
        assert!(manager.is_authenticated());
    }

    #[tokio::test]
    async fn test_login_then_reload_restores_same_identity() {
        let store = Arc::new(MemoryCredentialStore::new());
        let first = manager_with(
            CredentialMode::Bearer,
            store.clone(),
            Arc::new(FakeEndpoint::accepting(acme_login(Some(token_expiring_in(3600))))),
        );
        let claims = first.login("alice", "pw").await.unwrap();

        let reloaded = manager_with(
            CredentialMode::Bearer,
            store,
            Arc::new(FakeEndpoint::accepting(acme_login(None))),
        );
        reloaded.initialize();
        assert_eq!(reloaded.current_identity(), Some(claims));
    }

    #[tokio::test]
    async fn test_logout_clears_even_when_server_fails() {
        let store = Arc::new(MemoryCredentialStore::new());
        let mut endpoint = FakeEndpoint::accepting(acme_login(Some(token_expiring_in(3600))));
        endpoint.logout_fails = true;
        let manager = manager_with(CredentialMode::Bearer, store.clone(), Arc::new(endpoint));
        let mut events = manager.events();

        manager.login("alice", "pw").await.unwrap();
        manager.logout().await;

        assert!(!manager.is_authenticated());
        assert!(manager.current_identity().is_none());
        assert!(store.raw().is_none());
        let events = drain(&mut events);
        assert_eq!(events.last(), Some(&SessionEvent::SignedOut));
    }

    #[tokio::test]
    async fn test_login_superseded_by_logout_is_discarded() {
        let gate = Arc::new(Notify::new());
        let mut endpoint = FakeEndpoint::accepting(acme_login(Some(token_expiring_in(3600))));
        endpoint.gate = Some(gate.clone());
        let store = Arc::new(MemoryCredentialStore::new());
        let manager = manager_with(CredentialMode::Bearer, store.clone(), Arc::new(endpoint));

        let login = manager.login("alice", "pw");
        let logout_then_release = async {
            tokio::task::yield_now().await;
            manager.logout().await;
            gate.notify_one();
        };
        let (result, ()) = tokio::join!(login, logout_then_release);

        assert_eq!(result.unwrap_err(), AuthError::Superseded);
        assert!(!manager.is_authenticated());
        assert!(store.raw().is_none());
    }

    #[tokio::test]
    async fn test_latest_login_wins_when_earlier_one_finishes_first() {
        let response = LoginResponse {
            username: None,
            ..acme_login(Some(Credential::new("opaque")))
        };
        let mut endpoint = FakeEndpoint::accepting(response);
        endpoint.delays = vec![("old", 10), ("new", 80)];
        let store = Arc::new(MemoryCredentialStore::new());
        let manager = manager_with(CredentialMode::Bearer, store.clone(), Arc::new(endpoint));

        let (old, new) = tokio::join!(manager.login("old", "pw"), manager.login("new", "pw"));

        assert_eq!(old.unwrap_err(), AuthError::Superseded);
        assert_eq!(new.unwrap().username, "new");
        assert_eq!(manager.current_identity().unwrap().username, "new");
        let stored = store.get().unwrap().unwrap();
        assert_eq!(stored.claims.unwrap().username, "new");
    }

    #[tokio::test]
    async fn test_invalidation_leaves_another_clients_session() {
        let store = Arc::new(MemoryCredentialStore::new());
        let first = manager_with(
            CredentialMode::Bearer,
            store.clone(),
            Arc::new(FakeEndpoint::accepting(acme_login(Some(Credential::new("opaque-a"))))),
        );
        let second = manager_with(
            CredentialMode::Bearer,
            store.clone(),
            Arc::new(FakeEndpoint::accepting(acme_login(Some(Credential::new("opaque-b"))))),
        );

        first.login("alice", "pw").await.unwrap();
        let stale = first.ticket();
        second.login("alice", "pw").await.unwrap();

        assert!(first.invalidate(stale, InvalidationReason::Rejected));
        assert!(!first.is_authenticated());
        assert!(second.is_authenticated());

        let reloaded = manager_with(
            CredentialMode::Bearer,
            store.clone(),
            Arc::new(FakeEndpoint::accepting(acme_login(None))),
        );
        assert!(matches!(reloaded.initialize(), SessionState::Authenticated(_)));
        assert_eq!(reloaded.credential(), Some(Credential::new("opaque-b")));

        second.logout().await;
        assert!(store.raw().is_none());
    }

    #[tokio::test]
    async fn test_login_timeout_is_connectivity() {
        let mut endpoint = FakeEndpoint::accepting(acme_login(None));
        endpoint.gate = Some(Arc::new(Notify::new()));
        let manager = manager_with(
            CredentialMode::Bearer,
            Arc::new(MemoryCredentialStore::new()),
            Arc::new(endpoint),
        )
        .with_timeout(Duration::from_millis(20));

        let err = manager.login("alice", "pw").await.unwrap_err();
        assert!(matches!(err, AuthError::Connectivity(_)));
        assert!(err.is_retryable());
    }

    // -------------------------------------------------------------------------
    // Expiry and invalidation
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_lazy_expiry_leaves_storage_until_enforced() {
        let offset = Arc::new(AtomicI64::new(0));
        let store = Arc::new(MemoryCredentialStore::new());
        let manager = manager_with(
            CredentialMode::Bearer,
            store.clone(),
            Arc::new(FakeEndpoint::accepting(acme_login(Some(token_expiring_in(60))))),
        )
        .with_clock(shifted_clock(offset.clone()));

        manager.login("alice", "pw").await.unwrap();
        assert!(manager.is_authenticated());

        // One second past expiry.
        offset.store(61, Ordering::SeqCst);
        assert!(!manager.is_authenticated());
        assert!(store.get().unwrap().unwrap().credential.is_some());

        assert!(!manager.check_expiry());
        assert_eq!(manager.state(), SessionState::Unauthenticated);
        assert!(store.raw().is_none());
    }

    #[tokio::test]
    async fn test_needs_refresh_near_expiry() {
        let offset = Arc::new(AtomicI64::new(0));
        let manager = manager_with(
            CredentialMode::Bearer,
            Arc::new(MemoryCredentialStore::new()),
            Arc::new(FakeEndpoint::accepting(acme_login(Some(token_expiring_in(3600))))),
        )
        .with_clock(shifted_clock(offset.clone()));

        manager.login("alice", "pw").await.unwrap();
        assert!(!manager.needs_refresh());
        offset.store(3600 - 120, Ordering::SeqCst);
        assert!(manager.needs_refresh());
        assert!(manager.time_until_expiry().unwrap() <= ChronoDuration::minutes(2));
    }

    #[tokio::test]
    async fn test_invalidate_is_idempotent() {
        let manager = manager_with(
            CredentialMode::Bearer,
            Arc::new(MemoryCredentialStore::new()),
            Arc::new(FakeEndpoint::accepting(acme_login(Some(token_expiring_in(3600))))),
        );
        manager.login("alice", "pw").await.unwrap();
        let mut events = manager.events();

        let first = manager.ticket();
        let second = manager.ticket();
        assert!(manager.invalidate(first, InvalidationReason::Rejected));
        assert!(!manager.invalidate(second, InvalidationReason::Rejected));

        assert_eq!(
            drain(&mut events),
            vec![SessionEvent::Invalidated(InvalidationReason::Rejected)]
        );
    }

    #[tokio::test]
    async fn test_stale_ticket_does_not_end_new_session() {
        let manager = manager_with(
            CredentialMode::Bearer,
            Arc::new(MemoryCredentialStore::new()),
            Arc::new(FakeEndpoint::accepting(acme_login(Some(token_expiring_in(3600))))),
        );
        manager.login("alice", "pw").await.unwrap();
        let old = manager.ticket();
        manager.login("alice", "pw").await.unwrap();

        assert!(!manager.invalidate(old, InvalidationReason::Rejected));
        assert!(manager.is_authenticated());
    }

    // -------------------------------------------------------------------------
    // Refresh / register / update
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_refresh_replaces_token_and_expiry() {
        let store = Arc::new(MemoryCredentialStore::new());
        let endpoint = FakeEndpoint::accepting(acme_login(Some(token_expiring_in(60))));
        let fresh = token_expiring_in(7200);
        *endpoint.refresh.lock().unwrap() = Ok(RefreshResponse {
            access_token: Some(fresh.clone()),
        });
        let manager = manager_with(CredentialMode::Bearer, store.clone(), Arc::new(endpoint));

        let before = manager.login("alice", "pw").await.unwrap();
        let after = manager.refresh().await.unwrap();

        assert_eq!(after.username, before.username);
        assert!(after.expires_at > before.expires_at);
        assert_eq!(store.get().unwrap().unwrap().credential, Some(fresh));
    }

    #[tokio::test]
    async fn test_refresh_rejected_invalidates() {
        let endpoint = FakeEndpoint::accepting(acme_login(Some(token_expiring_in(60))));
        *endpoint.refresh.lock().unwrap() = Err(AuthError::Unauthenticated);
        let manager = manager_with(
            CredentialMode::Bearer,
            Arc::new(MemoryCredentialStore::new()),
            Arc::new(endpoint),
        );

        manager.login("alice", "pw").await.unwrap();
        assert_eq!(manager.refresh().await.unwrap_err(), AuthError::Unauthenticated);
        assert!(!manager.is_authenticated());
    }

    #[tokio::test]
    async fn test_refresh_connectivity_keeps_session() {
        let endpoint = FakeEndpoint::accepting(acme_login(Some(token_expiring_in(600))));
        *endpoint.refresh.lock().unwrap() = Err(AuthError::Connectivity("offline".to_string()));
        let manager = manager_with(
            CredentialMode::Bearer,
            Arc::new(MemoryCredentialStore::new()),
            Arc::new(endpoint),
        );

        manager.login("alice", "pw").await.unwrap();
        assert!(manager.refresh().await.unwrap_err().is_retryable());
        assert!(manager.is_authenticated());
    }

    #[tokio::test]
    async fn test_refresh_superseded_by_logout_is_discarded() {
        let gate = Arc::new(Notify::new());
        let mut endpoint = FakeEndpoint::accepting(acme_login(Some(token_expiring_in(600))));
        *endpoint.refresh.lock().unwrap() = Ok(RefreshResponse {
            access_token: Some(token_expiring_in(7200)),
        });
        endpoint.refresh_gate = Some(gate.clone());
        let store = Arc::new(MemoryCredentialStore::new());
        let manager = manager_with(CredentialMode::Bearer, store.clone(), Arc::new(endpoint));
        manager.login("alice", "pw").await.unwrap();

        let refresh = manager.refresh();
        let logout_then_release = async {
            tokio::task::yield_now().await;
            manager.logout().await;
            gate.notify_one();
        };
        let (result, ()) = tokio::join!(refresh, logout_then_release);

        assert_eq!(result.unwrap_err(), AuthError::Superseded);
        assert_eq!(manager.state(), SessionState::Unauthenticated);
        assert!(store.raw().is_none());
    }

    #[tokio::test]
    async fn test_refresh_cookie_mode_keeps_claims() {
        let endpoint = FakeEndpoint::accepting(acme_login(None));
        *endpoint.refresh.lock().unwrap() = Ok(RefreshResponse::default());
        let store = Arc::new(MemoryCredentialStore::new());
        let manager = manager_with(CredentialMode::Cookie, store.clone(), Arc::new(endpoint));

        let before = manager.login("alice", "pw").await.unwrap();
        let mut events = manager.events();
        let after = manager.refresh().await.unwrap();

        assert_eq!(after, before);
        assert!(manager.is_authenticated());
        assert_eq!(drain(&mut events), vec![SessionEvent::Updated(after.clone())]);
        let stored = store.get().unwrap().unwrap();
        assert!(stored.credential.is_none());
        assert_eq!(stored.claims, Some(after));
    }

    #[tokio::test]
    async fn test_refresh_requires_session() {
        let manager = manager_with(
            CredentialMode::Cookie,
            Arc::new(MemoryCredentialStore::new()),
            Arc::new(FakeEndpoint::accepting(acme_login(None))),
        );
        assert_eq!(manager.refresh().await.unwrap_err(), AuthError::Unauthenticated);
    }

    #[tokio::test]
    async fn test_register_validates_before_network() {
        let endpoint = Arc::new(FakeEndpoint::accepting(acme_login(None)));
        let manager = manager_with(
            CredentialMode::Bearer,
            Arc::new(MemoryCredentialStore::new()),
            endpoint.clone(),
        );

        let registration = Registration {
            username: "carol@acme.test".to_string(),
            password: String::new(),
            company_name: " ".to_string(),
            role: Role::Member,
        };
        let err = manager.register(&registration).await.unwrap_err();
        assert_eq!(
            err,
            AuthError::Validation("password, company_name required".to_string())
        );
        assert_eq!(endpoint.calls(), 0);
    }

    #[tokio::test]
    async fn test_register_does_not_sign_in() {
        let endpoint = FakeEndpoint::accepting(acme_login(None));
        let user = RegisteredUser {
            id: Some("1".to_string()),
            username: "carol@acme.test".to_string(),
            company_name: "Acme".to_string(),
            role: Role::Member,
        };
        *endpoint.register.lock().unwrap() = Ok(user.clone());
        let manager = manager_with(
            CredentialMode::Bearer,
            Arc::new(MemoryCredentialStore::new()),
            Arc::new(endpoint),
        );

        let registration = Registration {
            username: "carol@acme.test".to_string(),
            password: "pw".to_string(),
            company_name: "Acme".to_string(),
            role: Role::Member,
        };
        assert_eq!(manager.register(&registration).await.unwrap(), user);
        assert!(!manager.is_authenticated());
    }

    #[tokio::test]
    async fn test_update_claims_supersedes_and_persists() {
        let store = Arc::new(MemoryCredentialStore::new());
        let manager = manager_with(
            CredentialMode::Bearer,
            store.clone(),
            Arc::new(FakeEndpoint::accepting(acme_login(Some(token_expiring_in(3600))))),
        );
        manager.login("alice", "pw").await.unwrap();

        let updated = manager
            .update_claims(ClaimsUpdate {
                role: Some(Role::Admin),
                ..ClaimsUpdate::default()
            })
            .unwrap();
        assert!(updated.role.is_admin());
        assert_eq!(updated.company_name, "Acme");
        assert!(manager.identity().current().is_admin());
        assert_eq!(store.get().unwrap().unwrap().claims, Some(updated));

        let err = manager
            .update_claims(ClaimsUpdate {
                company_name: Some("".to_string()),
                ..ClaimsUpdate::default()
            })
            .unwrap_err();
        assert!(matches!(err, AuthError::Validation(_)));
    }
}
