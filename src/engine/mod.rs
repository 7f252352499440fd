// HotPush Engine - Core module structure
pub mod admin;
pub mod api;
pub mod audit;
pub mod cli;
pub mod config;
pub mod delta;
pub mod hasher;
pub mod packages;
pub mod protocol;
pub mod publish;
pub mod release;
pub mod resolver;
pub mod updater;

pub use config::ServerConfig;
pub use release::{JsonReleaseStore, ReleaseStore};
pub use updater::UpdateAgent;
