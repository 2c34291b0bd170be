//! # vlb-id
//!
//! Identity types for the VIP controller.
//!
//! ## Design Principles
//!
//! - Keys are user-controlled names, validated once at the boundary
//! - Every key has a canonical string form with strict parsing
//! - Keys roundtrip through serde as their canonical string
//! - Keys are typed so a tenant key can never be used as an owner key
//!
//! ## Key Format
//!
//! - [`ServiceKey`]: `{namespace}/{name}`, e.g. `payments/api-gateway`
//! - [`TenantKey`]: a bare name, e.g. `prod-eu-1`
//!
//! Name segments follow DNS-subdomain rules: lowercase alphanumerics, `-`
//! and `.`, starting and ending with an alphanumeric, at most 253 bytes.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;
