//! Environment-only configuration.
//!
//! Only these variables bind behavior at startup; everything else (pipeline
//! tuning, debug logging) is read by the engine where it is used.

use anyhow::{bail, Context};
use std::path::PathBuf;

pub const ENV_DATABASE_URL: &str = "DATABASE_URL";
pub const ENV_DATA_DIR: &str = "DITTO_DATA_DIR";
pub const ENV_PORT: &str = "DITTO_PORT";

const DEFAULT_DATA_DIR: &str = "./data";
const DEFAULT_PORT: u16 = 8080;

/// Application configuration loaded from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Connection string for the store (required).
    pub database_url: String,
    /// Local directory for non-database auxiliary data.
    pub data_dir: PathBuf,
    /// HTTP port for the web UI collaborator. 0 means "let the kernel pick".
    pub port: u16,
}

impl Config {
    /// Read configuration from the environment. `DATABASE_URL` is required;
    /// the rest default when unset or empty.
    pub fn load() -> anyhow::Result<Self> {
        let database_url = match std::env::var(ENV_DATABASE_URL) {
            Ok(url) if !url.is_empty() => url,
            _ => bail!("{ENV_DATABASE_URL} is required (e.g. sqlite:///var/lib/ditto/ditto.db)"),
        };
        let data_dir = match std::env::var(ENV_DATA_DIR) {
            Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => PathBuf::from(DEFAULT_DATA_DIR),
        };
        let port = match std::env::var(ENV_PORT) {
            Ok(port) if !port.is_empty() => parse_port(&port)?,
            _ => DEFAULT_PORT,
        };
        Ok(Self { database_url, data_dir, port })
    }
}

fn parse_port(text: &str) -> anyhow::Result<u16> {
    let port: i64 = text.parse().with_context(|| format!("{ENV_PORT} must be a number"))?;
    if !(0..=65535).contains(&port) {
        bail!("{ENV_PORT} must be between 0 and 65535");
    }
    Ok(port as u16)
}
