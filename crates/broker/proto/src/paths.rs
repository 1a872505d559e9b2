//! Utilities for broker configuration paths.

use std::path::PathBuf;

/// Returns the default configuration file path for the codeshare broker.
///
/// # Resolution Order
///
/// 1. `CODESHARE_CONFIG` environment variable.
/// 2. System config directory (e.g., `$XDG_CONFIG_HOME/codeshare/config.toml`).
///
/// Returns `None` when neither is available. The file itself may not exist;
/// callers treat a missing default file as "use built-in defaults".
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
	if let Ok(p) = std::env::var("CODESHARE_CONFIG") {
		return Some(PathBuf::from(p));
	}

	dirs::config_dir().map(|dir| dir.join("codeshare").join("config.toml"))
}
