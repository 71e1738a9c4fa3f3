//! Core library for Envo.
//!
//! This crate holds the security-critical logic of the secrets service:
//!
//! - [`crypto`]: AES-256-GCM primitives and envelope encryption over a
//!   managed key service with a local fallback
//! - [`rbac`]: permission catalog, system roles and the permission resolver
//! - [`quota`]: tier limits checked against live counts
//! - [`token`]: HS256 access and refresh tokens
//! - [`login`]: the OAuth login state machine for browsers and the CLI
//! - [`audit`] and [`audit_file`]: append-only audit logging
//! - [`tenancy`] and [`secrets`]: the services the HTTP layer calls
//! - [`seed`]: bootstrap roles and tier limits
//!
//! All persistence goes through [`envo_storage::Store`].

pub mod audit;
pub mod audit_file;
pub mod crypto;
pub mod error;
pub mod login;
pub mod quota;
pub mod rbac;
pub mod secrets;
pub mod seed;
pub mod tenancy;
pub mod token;

pub use error::{CoreError, EncryptionError};
