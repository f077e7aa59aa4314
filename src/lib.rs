// Core modules
pub mod api;
pub mod backoff;
pub mod config;
pub mod error;
pub mod execution;
pub mod feed;
pub mod indicators;
pub mod market;
pub mod models;
pub mod notify;
pub mod orchestrator;
pub mod persistence;
pub mod risk;
pub mod strategy;

// Re-export commonly used types
pub use config::Settings;
pub use error::{BotError, Result};
pub use models::*;
pub use orchestrator::Orchestrator;
pub use strategy::Strategy;
