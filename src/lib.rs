//! HotPush - Over-the-air bundle updates with staged rollout and automatic rollback
//!
//! The `engine` module holds both halves of the system: the distribution
//! endpoint (`api`, `release`, `publish`, `admin`) and the client update
//! agent (`updater`).

pub mod engine;
