//! # parlor-settings
//!
//! Configuration for the parlor gateway, loaded from three layers (lowest to
//! highest priority):
//! 1. **Compiled defaults**: [`ParlorSettings::default()`]
//! 2. **User file**: `~/.parlor/settings.json`, deep-merged over defaults
//! 3. **Environment variables**: `PARLOR_*` overrides
//!
//! Command-line flags, applied by the binary, sit above all three.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{apply_env_overrides, deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
