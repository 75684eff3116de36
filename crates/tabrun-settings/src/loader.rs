//! Layered settings loading.
//!
//! Loading flow:
//! 1. Start with compiled [`TabrunSettings::default()`]
//! 2. If the settings file exists, merge its values over the defaults
//!    (objects merge per key, everything else is replaced)
//! 3. Merge `TABRUN_*` environment variables (highest priority)
//! 4. Validate

use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized};
use tracing::debug;

use crate::errors::Result;
use crate::types::TabrunSettings;

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "TABRUN_";

/// Resolve the path to the settings file (`~/.tabrun/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".tabrun").join("settings.json")
}

/// The layered provider stack for `path`, before extraction.
///
/// Exposed so embedders can merge additional providers on top.
pub fn settings_figment(path: &Path) -> Figment {
    Figment::from(Serialized::defaults(TabrunSettings::default()))
        .merge(Json::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<TabrunSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; malformed JSON or invalid values error.
pub fn load_settings_from_path(path: &Path) -> Result<TabrunSettings> {
    if path.exists() {
        debug!(?path, "loading settings from file");
    } else {
        debug!(?path, "settings file not found, using defaults");
    }
    extract(settings_figment(path))
}

fn extract(figment: Figment) -> Result<TabrunSettings> {
    let settings: TabrunSettings = figment.extract()?;
    settings.validate()?;
    Ok(settings)
}
