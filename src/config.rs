//! Server configuration (component M): layered defaults → file → environment,
//! built on the `config`/`serde`/`toml` stack the way the teacher loads its
//! own settings, but exposed as a single typed [`XmppServerConfig`] rather
//! than environment-variable-only switches.

use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

/// Fully resolved server configuration (component M).
///
/// Precedence, lowest to highest: built-in defaults, an optional TOML file
/// (`config/stanzad.toml` by default, or `STANZAD_CONFIG_FILE`), then
/// `STANZAD_*` environment variables (e.g. `STANZAD_DOMAIN=example.com`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct XmppServerConfig {
    /// The XMPP domain this server is authoritative for (used to build
    /// bare JIDs and to recognize local-loopback S2S connections).
    pub domain: String,
    /// Bind address for client-to-server connections (RFC 3920 default 5222).
    pub c2s_bind_addr: String,
    /// Bind address for server-to-server connections (RFC 3920 default 5269).
    pub s2s_bind_addr: String,
    /// Path to the libsql database file (`:memory:` is valid for tests).
    pub store_path: String,
    /// Number of retries to attempt if either listener's bind fails.
    pub bind_retries: u32,
    /// Size of the bounded blocking-worker pool (component L).
    pub worker_pool_size: usize,
    /// Directory for log output, if file logging is enabled.
    pub log_dir: Option<PathBuf>,
}

impl Default for XmppServerConfig {
    fn default() -> Self {
        XmppServerConfig {
            domain: "localhost".to_string(),
            c2s_bind_addr: "0.0.0.0:5222".to_string(),
            s2s_bind_addr: "0.0.0.0:5269".to_string(),
            store_path: "stanzad.db".to_string(),
            bind_retries: 3,
            worker_pool_size: 5,
            log_dir: None,
        }
    }
}

impl XmppServerConfig {
    /// Loads configuration from defaults, an optional file, then env vars
    /// prefixed `STANZAD_` (double underscore separates nesting, though
    /// this config is flat).
    pub fn load() -> Result<Self, ConfigError> {
        let defaults = XmppServerConfig::default();
        let file = std::env::var("STANZAD_CONFIG_FILE").unwrap_or_else(|_| "config/stanzad.toml".into());

        let builder = config::Config::builder()
            .set_default("domain", defaults.domain)?
            .set_default("c2s_bind_addr", defaults.c2s_bind_addr)?
            .set_default("s2s_bind_addr", defaults.s2s_bind_addr)?
            .set_default("store_path", defaults.store_path)?
            .set_default("bind_retries", defaults.bind_retries)?
            .set_default("worker_pool_size", defaults.worker_pool_size as i64)?
            .add_source(config::File::with_name(&file).required(false))
            .add_source(config::Environment::with_prefix("STANZAD").separator("__"));

        let settings = builder.build()?;
        let resolved: XmppServerConfig = settings.try_deserialize()?;
        info!(domain = %resolved.domain, c2s = %resolved.c2s_bind_addr, s2s = %resolved.s2s_bind_addr, "configuration loaded");
        Ok(resolved)
    }
}
