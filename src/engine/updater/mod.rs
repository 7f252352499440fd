//! HotPush Client Update Agent
//!
//! A rollback-safe, hash-verified hot update pipeline for one installation.
//!
//! Components:
//! - `state` - Generation slots, confirmation records, lifecycle status
//! - `generations` - Filesystem layout and garbage collection
//! - `download` - Streaming download into a temp file
//! - `verify` - Digest verification
//! - `transport` - Wire protocol client
//! - `agent` - The state machine tying them together

pub mod agent;
pub mod download;
pub mod generations;
pub mod state;
pub mod transport;
pub mod verify;

use thiserror::Error;

use crate::engine::delta::DeltaError;

pub use agent::{AgentConfig, LaunchOutcome, UpdateAgent};
pub use download::{CancelFlag, DownloadedPackage};
pub use generations::GenerationStore;
pub use state::{AgentState, Confirmation, Generation, Generations, UpdateStatus};
pub use transport::{ByteStream, HttpTransport, PackageBody, UpdateTransport};

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Verification failed: expected {expected}, got {actual}")]
    VerificationFailed { expected: String, actual: String },

    #[error("Invalid package: {0}")]
    InvalidPackage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("State error: {0}")]
    State(#[from] state::StateError),

    #[error("Download cancelled")]
    Cancelled,
}

impl From<DeltaError> for AgentError {
    fn from(e: DeltaError) -> Self {
        match e {
            DeltaError::Io(io) => AgentError::Io(io),
            other => AgentError::InvalidPackage(other.to_string()),
        }
    }
}
