//! `marketsieve-core` — domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! strongly-typed identifiers, the instrument symbol value type, target-set
//! normalization and fingerprinting, and the domain error model.

pub mod error;
pub mod id;
pub mod symbol;

pub use error::{DomainError, DomainResult};
pub use id::{JobId, PayloadId};
pub use symbol::{normalize_targets, Fingerprint, Symbol};
