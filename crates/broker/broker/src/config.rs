//! Broker configuration loaded from TOML.
//!
//! Every field has a default, so an empty file (or no file) yields a runnable
//! broker listening on `0.0.0.0:8765` with a `workspace` directory relative to
//! the current directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Who may write a file through `EDIT`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EditPolicy {
	/// Only the current lock holder may edit.
	#[default]
	Holder,
	/// Anyone may edit unless another connection holds the lock.
	UnlockedOrHolder,
}

/// What `RUN` does while the connection already has an active run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunPolicy {
	/// Reply with `run_in_progress` and leave the active run alone.
	#[default]
	Reject,
	/// Cancel the active run, then start the new one.
	Replace,
}

/// What happens to an active run when its connection goes away.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DisconnectPolicy {
	/// Terminate the process.
	#[default]
	Kill,
	/// Stop streaming and let the process run to completion in the background.
	Detach,
}

/// Per-connection behaviour knobs shared by the lock table, broadcaster and
/// run sessions.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionPolicy {
	/// Edit gate.
	pub edit_policy: EditPolicy,
	/// Whether `OPEN` takes the lock when the request does not say.
	pub lock_on_open: bool,
	/// Whether accepted edits are pushed to other watchers.
	pub broadcast_edits: bool,
	/// Behaviour of `RUN` while a run is active.
	pub run_policy: RunPolicy,
	/// Behaviour of an active run on disconnect.
	pub on_disconnect: DisconnectPolicy,
	/// Optional wall-clock limit for a run, in seconds.
	pub run_timeout_secs: Option<u64>,
	/// Time between SIGTERM and SIGKILL when cancelling a run, in milliseconds.
	pub kill_grace_ms: u64,
}

impl Default for SessionPolicy {
	fn default() -> Self {
		Self {
			edit_policy: EditPolicy::default(),
			lock_on_open: true,
			broadcast_edits: true,
			run_policy: RunPolicy::default(),
			on_disconnect: DisconnectPolicy::default(),
			run_timeout_secs: None,
			kill_grace_ms: 2000,
		}
	}
}

impl SessionPolicy {
	/// Wall-clock limit for a run, if configured.
	pub fn run_timeout(&self) -> Option<Duration> {
		self.run_timeout_secs.map(Duration::from_secs)
	}

	/// Grace period between SIGTERM and SIGKILL.
	pub fn kill_grace(&self) -> Duration {
		Duration::from_millis(self.kill_grace_ms)
	}
}

/// How to build and run files with one extension.
///
/// Arguments are templates. `{file}`, `{dir}`, `{stem}`, `{out}` and `{build}`
/// are replaced with the source path, its directory, its stem, the build
/// artifact path and the build directory.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ToolchainSpec {
	/// Optional compile step. A non-zero exit aborts the run.
	#[serde(default)]
	pub build: Option<Vec<String>>,
	/// Command that runs the program.
	pub run: Vec<String>,
	/// Starter content for `CREATE_FILE`.
	#[serde(default)]
	pub template: Option<String>,
}

fn argv(parts: &[&str]) -> Vec<String> {
	parts.iter().map(|s| (*s).to_string()).collect()
}

/// Built-in toolchains for `py`, `c`, `cpp` and `java`.
pub fn default_toolchains() -> BTreeMap<String, ToolchainSpec> {
	let mut table = BTreeMap::new();
	table.insert(
		"py".to_string(),
		ToolchainSpec {
			build: None,
			run: argv(&["python3", "-u", "{file}"]),
			template: Some("print(\"Hello, World!\")\n".to_string()),
		},
	);
	table.insert(
		"c".to_string(),
		ToolchainSpec {
			build: Some(argv(&["gcc", "{file}", "-o", "{out}"])),
			run: argv(&["{out}"]),
			template: Some(
				"#include <stdio.h>\n\nint main() {\n    printf(\"Hello, World!\\n\");\n    return 0;\n}\n"
					.to_string(),
			),
		},
	);
	table.insert(
		"cpp".to_string(),
		ToolchainSpec {
			build: Some(argv(&["g++", "{file}", "-o", "{out}"])),
			run: argv(&["{out}"]),
			template: None,
		},
	);
	table.insert(
		"java".to_string(),
		ToolchainSpec {
			build: Some(argv(&["javac", "-d", "{build}", "{file}"])),
			run: argv(&["java", "-cp", "{build}", "{stem}"]),
			template: None,
		},
	);
	table
}

/// Top-level broker configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
	/// Socket address the WebSocket listener binds to.
	pub bind: String,
	/// Directory holding the shared files.
	pub workspace: PathBuf,
	/// Session behaviour.
	#[serde(flatten)]
	pub session: SessionPolicy,
	/// Toolchain overrides keyed by extension, merged over the built-ins.
	pub toolchains: BTreeMap<String, ToolchainSpec>,
}

impl Default for BrokerConfig {
	fn default() -> Self {
		Self {
			bind: "0.0.0.0:8765".to_string(),
			workspace: PathBuf::from("workspace"),
			session: SessionPolicy::default(),
			toolchains: BTreeMap::new(),
		}
	}
}

/// Failure to load a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
	/// The file could not be read.
	#[error("failed to read config {path}: {source}")]
	Read {
		/// Config file path.
		path: PathBuf,
		/// Underlying I/O error.
		#[source]
		source: std::io::Error,
	},
	/// The file is not valid TOML for [`BrokerConfig`].
	#[error("failed to parse config: {0}")]
	Parse(#[from] toml::de::Error),
	/// A toolchain entry has an empty `run` command.
	#[error("toolchain `{0}` has an empty run command")]
	EmptyRunCommand(String),
	/// A toolchain entry has an empty `build` command.
	#[error("toolchain `{0}` has an empty build command")]
	EmptyBuildCommand(String),
}

impl BrokerConfig {
	/// Parses a TOML document.
	pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
		let config: Self = toml::from_str(text)?;
		config.validate()?;
		Ok(config)
	}

	/// Reads and parses a TOML file.
	pub fn load(path: &Path) -> Result<Self, ConfigError> {
		let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
			path: path.to_path_buf(),
			source,
		})?;
		Self::from_toml_str(&text)
	}

	/// Built-in toolchains with this config's overrides applied.
	pub fn toolchain_table(&self) -> BTreeMap<String, ToolchainSpec> {
		let mut table = default_toolchains();
		table.extend(self.toolchains.clone());
		table
	}

	fn validate(&self) -> Result<(), ConfigError> {
		for (ext, spec) in &self.toolchains {
			if spec.run.is_empty() {
				return Err(ConfigError::EmptyRunCommand(ext.clone()));
			}
			if spec.build.as_ref().is_some_and(Vec::is_empty) {
				return Err(ConfigError::EmptyBuildCommand(ext.clone()));
			}
		}
		Ok(())
	}
}
