//! anonet core
//!
//! Shared types, constants, configuration and the event bus used by every
//! anonet subsystem. Nothing in this crate touches the network.

pub mod config;
pub mod error;
pub mod events;
pub mod types;

pub use config::AnonetConfig;
pub use error::{AnonetError, Result};
pub use events::{CoreEvent, EventBus};
