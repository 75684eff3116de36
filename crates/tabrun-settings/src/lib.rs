//! # tabrun-settings
//!
//! Configuration for the orchestration core, loaded from three layers (in
//! priority order):
//! 1. **Compiled defaults**: [`TabrunSettings::default()`]
//! 2. **User file**: `~/.tabrun/settings.json`
//! 3. **Environment variables**: `TABRUN_*`, `__` separating nested keys
//!    (e.g. `TABRUN_RESOURCES__MAX_EXECUTIONS=4`)
//!
//! There is no global instance: the loaded value is handed to
//! `Orchestrator::start`, so tests build their own.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{load_settings, load_settings_from_path, settings_figment, settings_path};
pub use types::*;
