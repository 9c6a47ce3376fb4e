//! Configuration Loader
//!
//! Reads a JSON or TOML file (chosen by extension) and layers `CASTLE_`
//! environment variables over its `system` section, e.g.
//! `CASTLE_AUTO_START=false` or `CASTLE_NOTIFY_MAIL=ops`.

use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Json, Toml};
use tracing::{debug, info};

use super::types::ConfigDocument;

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file does not exist: {0}")]
    NotFound(PathBuf),

    #[error("Unsupported configuration format: {0} (expected .json or .toml)")]
    UnsupportedFormat(PathBuf),

    #[error("Failed to read configuration: {0}")]
    Figment(#[from] Box<figment::Error>),
}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        ConfigError::Figment(Box::new(e))
    }
}

/// Prefix of environment overrides
pub const ENV_PREFIX: &str = "CASTLE_";

/// Overridable settings: variable name without the prefix, document path
const ENV_KEYS: [(&str, &str); 3] = [
    ("NAME", "system.name"),
    ("AUTO_START", "system.autoStart"),
    ("NOTIFY_MAIL", "system.notifyMail"),
];

/// Build the layered figment for a configuration file
pub fn figment(path: &Path) -> Result<Figment, ConfigError> {
    let file = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => Figment::from(Json::file(path)),
        Some("toml") => Figment::from(Toml::file(path)),
        _ => return Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
    };

    Ok(file.merge(
        Env::prefixed(ENV_PREFIX).lowercase(false).filter_map(|key| {
            ENV_KEYS
                .iter()
                .find(|(name, _)| key.as_str().eq_ignore_ascii_case(name))
                .map(|(_, path)| (*path).into())
        }),
    ))
}

/// Load the configuration document at `path`
pub fn load_config(path: impl AsRef<Path>) -> Result<ConfigDocument, ConfigError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    info!("Loading configuration from: {}", path.display());
    let document: ConfigDocument = figment(path)?.extract()?;
    debug!(
        devices = document.devices.len(),
        engines = document.engines.len(),
        persistence = document.persistence.len(),
        mail = document.mail.len(),
        "Configuration loaded"
    );
    Ok(document)
}
