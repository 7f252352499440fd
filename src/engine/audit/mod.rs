//! Audit Module
//!
//! Immutable record of administrative release operations

pub mod audit;

pub use audit::{AuditAction, AuditEntry, AuditLog};
