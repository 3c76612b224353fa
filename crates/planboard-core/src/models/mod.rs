//! Data models shared across the session subsystem.
//!
//! - `IdentityClaims`: who the signed-in member is and when the session ends
//! - `Role`: the member's workspace role

pub mod claims;

pub use claims::{IdentityClaims, Role};
