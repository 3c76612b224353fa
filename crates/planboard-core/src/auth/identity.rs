//! Reactive view of the session for UI consumers.

use tokio::sync::watch;

use crate::models::{IdentityClaims, Role};

use super::session::SessionState;

/// Snapshot of who is signed in, with the derived getters views need.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdentityView {
    claims: Option<IdentityClaims>,
}

impl IdentityView {
    pub fn from_state(state: &SessionState) -> Self {
        match state {
            SessionState::Authenticated(claims) => Self {
                claims: Some(claims.clone()),
            },
            SessionState::Unauthenticated => Self::default(),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.claims.is_some()
    }

    pub fn claims(&self) -> Option<&IdentityClaims> {
        self.claims.as_ref()
    }

    pub fn username(&self) -> Option<&str> {
        self.claims.as_ref().map(|c| c.username.as_str())
    }

    pub fn company_name(&self) -> Option<&str> {
        self.claims.as_ref().map(|c| c.company_name.as_str())
    }

    pub fn role(&self) -> Option<&Role> {
        self.claims.as_ref().map(|c| &c.role)
    }

    pub fn is_admin(&self) -> bool {
        self.role().map(Role::is_admin).unwrap_or(false)
    }

    pub fn is_manager(&self) -> bool {
        self.role().map(Role::is_manager).unwrap_or(false)
    }
}

/// Subscription to identity changes. Cloning gives an independent cursor.
#[derive(Clone)]
pub struct IdentityStore {
    rx: watch::Receiver<IdentityView>,
}

impl IdentityStore {
    pub(crate) fn new(rx: watch::Receiver<IdentityView>) -> Self {
        Self { rx }
    }

    pub fn current(&self) -> IdentityView {
        self.rx.borrow().clone()
    }

    /// Wait for the next published view. `None` once the session manager
    /// is gone.
    pub async fn changed(&mut self) -> Option<IdentityView> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }
}
