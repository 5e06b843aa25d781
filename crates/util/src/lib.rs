//! Environment-driven settings shared by the hookrelay crates.

pub mod config;

use std::path::PathBuf;

pub use config::{
    AppConfig, ConfigError, DispatchConfig, Environment, WebhookConfig, DEFAULT_BIND_ADDR,
};

/// Reads `.env` into the process environment and returns the file used.
///
/// A missing file is not an error: deployments set real variables instead.
pub fn load_env_file() -> Option<PathBuf> {
    dotenvy::dotenv().ok()
}

#[cfg(test)]
pub(crate) static ENV_GUARD: std::sync::LazyLock<std::sync::Mutex<()>> =
    std::sync::LazyLock::new(|| std::sync::Mutex::new(()));
