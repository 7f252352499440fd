//! Release records, version rules and the Release Store

pub mod error;
pub mod model;
pub mod store;
pub mod version;

pub use error::StoreError;
pub use model::{Platform, Release, ReleaseStats, Scope, DEFAULT_ENVIRONMENT};
pub use store::{JsonReleaseStore, MemoryReleaseStore, ReleaseStore};
