//! HTTP side of the session subsystem.
//!
//! This module provides the `AuthEndpoint` collaborator (login, register,
//! logout, refresh), the `Interceptor` that instruments every other
//! outbound request, and the `AuthError` taxonomy both report through.
//!
//! Credentials travel either as a bearer token or as a server-managed
//! cookie, depending on `CredentialMode`.

pub mod client;
pub mod error;
pub mod interceptor;

pub use client::{ApiClient, AuthEndpoint, LoginResponse, RefreshResponse, RegisteredUser, Registration};
pub use error::{AuthError, Operation};
pub use interceptor::{AuthorizedClient, Interceptor, ResponseDisposition};
