//! Planboard client session subsystem.
//!
//! Establishes, persists, validates, refreshes and invalidates the signed-in
//! member's session, and keeps outbound HTTP and route navigation in step
//! with it.
//!
//! - `auth`: session state machine, credential storage, claims decoding
//! - `api`: auth endpoint client, request interceptor, error taxonomy
//! - `nav`: route table and navigation guard
//! - `models`: identity claims and roles
//! - `config`: client configuration

pub mod api;
pub mod auth;
pub mod config;
pub mod models;
pub mod nav;

pub use api::{ApiClient, AuthError, AuthorizedClient};
pub use auth::{SessionEvent, SessionManager, SessionState};
pub use config::{Config, CredentialMode, StorageBackend};
pub use models::{IdentityClaims, Role};
pub use nav::{NavigationGuard, Navigator};
