//! # helm-settings
//!
//! Layered configuration for the helm engine.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`HelmSettings::default()`]
//! 2. **User file**: `~/.helm/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `HELM_*` overrides (highest priority)
//!
//! There is no process-wide singleton: callers load a [`HelmSettings`] once
//! and hand the relevant sections to the engine components they build.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
