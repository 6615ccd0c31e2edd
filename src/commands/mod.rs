//! Inbound commands: direct-method handlers and the cloud-to-device drain loop

pub mod drain;
pub mod handlers;

pub use drain::{CommandDrainLoop, DrainStats};
pub use handlers::{default_registry, IsAlive, StartLongRunning};
