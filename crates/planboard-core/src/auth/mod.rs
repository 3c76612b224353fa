//! Authentication module for managing the client session.
//!
//! This module provides:
//! - `SessionManager`: the session state machine (login, logout, refresh,
//!   lazy expiry, forced invalidation)
//! - `CredentialStore`: durable storage for the credential and its claims,
//!   backed by a file, the OS keychain, or memory
//! - `decoder`: structural decoding of bearer credentials
//! - `IdentityStore`: reactive identity view for UI consumers

pub mod credentials;
pub mod decoder;
pub mod identity;
pub mod session;

pub use credentials::{Credential, CredentialStore, FileCredentialStore, KeyringCredentialStore, MemoryCredentialStore, StoredSession};
pub use decoder::DecodeError;
pub use identity::{IdentityStore, IdentityView};
pub use session::{ClaimsUpdate, Clock, InvalidationReason, SessionEvent, SessionManager, SessionState, SessionTicket};
