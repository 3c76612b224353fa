//! Route gating against the session.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{debug, info, warn};

use crate::auth::{SessionEvent, SessionManager};
use crate::config::Config;

use super::routes::{normalize, RouteClass, RouteKind, RouteTable};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NavigationError {
    #[error("Redirect loop: {from} redirected to {to}, which redirects again")]
    RedirectLoop { from: String, to: String },
}

/// Outcome of evaluating one navigation target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Proceed,
    Redirect(String),
    Logout,
}

#[derive(Debug, Clone)]
pub struct NavigationGuard {
    table: RouteTable,
    guest_entry: String,
    landing: String,
}

impl NavigationGuard {
    pub fn new(table: RouteTable, guest_entry: &str, landing: &str) -> Self {
        Self {
            table,
            guest_entry: normalize(guest_entry),
            landing: normalize(landing),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(RouteTable::dashboard(), &config.guest_entry, &config.landing)
    }

    pub fn table(&self) -> &RouteTable {
        &self.table
    }

    pub fn guest_entry(&self) -> &str {
        &self.guest_entry
    }

    pub fn landing(&self) -> &str {
        &self.landing
    }

    /// Decide what happens when `path` is opened. Pure: the caller supplies
    /// the authentication state.
    pub fn evaluate(&self, path: &str, authenticated: bool) -> Decision {
        let Some(route) = self.table.find(path) else {
            // Unknown paths fall back by session state.
            let fallback = if authenticated {
                &self.landing
            } else {
                &self.guest_entry
            };
            return Decision::Redirect(fallback.clone());
        };

        if route.kind == RouteKind::Logout {
            return Decision::Logout;
        }
        match (route.class(), authenticated) {
            (RouteClass::Protected, false) => Decision::Redirect(self.guest_entry.clone()),
            (RouteClass::GuestOnly, true) => Decision::Redirect(self.landing.clone()),
            _ => Decision::Proceed,
        }
    }
}

/// Where a navigation ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Navigation {
    pub path: String,
    pub title: String,
    /// The requested path when the guard sent us elsewhere.
    pub redirected_from: Option<String>,
}

/// Tracks the current route and keeps it consistent with the session.
pub struct Navigator {
    guard: NavigationGuard,
    session: Arc<SessionManager>,
    app_name: String,
    current: Option<Navigation>,
    events: broadcast::Receiver<SessionEvent>,
}

impl Navigator {
    pub fn new(guard: NavigationGuard, session: Arc<SessionManager>, app_name: &str) -> Self {
        let events = session.events();
        Self {
            guard,
            session,
            app_name: app_name.to_string(),
            current: None,
            events,
        }
    }

    pub fn from_config(config: &Config, session: Arc<SessionManager>) -> Self {
        Self::new(NavigationGuard::from_config(config), session, &config.app_name)
    }

    pub fn current(&self) -> Option<&Navigation> {
        self.current.as_ref()
    }

    /// Display title of the current route.
    pub fn title(&self) -> &str {
        self.current
            .as_ref()
            .map(|nav| nav.title.as_str())
            .unwrap_or(&self.app_name)
    }

    pub async fn navigate(&mut self, path: &str) -> Result<Navigation, NavigationError> {
        let target = normalize(path);
        let authenticated = self.session.check_expiry();

        let navigation = match self.guard.evaluate(&target, authenticated) {
            Decision::Proceed => self.arrive(target, None),
            Decision::Redirect(to) => self.settle(&target, to, authenticated)?,
            Decision::Logout => {
                self.session.logout().await;
                let to = self.guard.guest_entry.clone();
                self.settle(&target, to, false)?
            }
        };

        // Anything queued so far is reflected in this navigation already.
        self.discard_events();
        debug!(path = %navigation.path, title = %navigation.title, "Navigated");
        self.current = Some(navigation.clone());
        Ok(navigation)
    }

    /// Follow one redirect. A target that redirects again is a loop.
    fn settle(
        &self,
        from: &str,
        to: String,
        authenticated: bool,
    ) -> Result<Navigation, NavigationError> {
        match self.guard.evaluate(&to, authenticated) {
            Decision::Proceed => {
                info!(from = %from, to = %to, "Redirecting");
                Ok(self.arrive(to, Some(from.to_string())))
            }
            Decision::Redirect(_) | Decision::Logout => {
                warn!(from = %from, to = %to, "Redirect target is not reachable");
                Err(NavigationError::RedirectLoop {
                    from: from.to_string(),
                    to,
                })
            }
        }
    }

    fn arrive(&self, path: String, redirected_from: Option<String>) -> Navigation {
        let title = self
            .guard
            .table
            .find(&path)
            .and_then(|route| route.meta.title.clone())
            .unwrap_or_else(|| self.app_name.clone());
        Navigation {
            path,
            title,
            redirected_from,
        }
    }

    /// Re-check the current route after a session change. Returns the new
    /// navigation when the route had to change.
    pub fn on_session_event(&mut self, event: &SessionEvent) -> Option<Navigation> {
        let path = self.current.as_ref()?.path.clone();
        let authenticated = self.session.is_authenticated();

        let to = match self.guard.evaluate(&path, authenticated) {
            Decision::Redirect(to) => to,
            Decision::Proceed | Decision::Logout => return None,
        };
        match self.settle(&path, to, authenticated) {
            Ok(navigation) => {
                debug!(?event, path = %navigation.path, "Route changed by session event");
                self.current = Some(navigation.clone());
                Some(navigation)
            }
            Err(e) => {
                warn!(error = %e, "Could not move off the current route");
                None
            }
        }
    }

    /// Apply every session event queued since the last call.
    pub fn sync(&mut self) -> Option<Navigation> {
        let mut moved = None;
        loop {
            match self.events.try_recv() {
                Ok(event) => {
                    if let Some(navigation) = self.on_session_event(&event) {
                        moved = Some(navigation);
                    }
                }
                Err(TryRecvError::Lagged(skipped)) => {
                    debug!(skipped, "Session events lagged");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        moved
    }

    fn discard_events(&mut self) {
        while !matches!(
            self.events.try_recv(),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed)
        ) {}
    }
}

// ============================================================================
// Tests
// ============================================================================
