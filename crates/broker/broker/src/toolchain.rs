//! Build and run command resolution per file extension.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;

use thiserror::Error;

use crate::config::ToolchainSpec;

/// Failure to turn a source file into a runnable command.
#[derive(Debug, Error)]
pub enum ToolchainError {
	/// No toolchain is configured for the extension.
	#[error("Unsupported file type: {0}")]
	Unsupported(String),
	/// The compile step exited non-zero.
	#[error("Compilation error: {diagnostics}")]
	BuildFailed {
		/// Compiler stderr, or stdout when stderr is empty.
		diagnostics: String,
	},
	/// A build tool could not be started.
	#[error("failed to start {program}: {source}")]
	Spawn {
		/// Program name.
		program: String,
		/// Underlying error.
		#[source]
		source: std::io::Error,
	},
}

/// A ready-to-spawn program invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prepared {
	/// Executable.
	pub program: String,
	/// Arguments.
	pub args: Vec<String>,
	/// Working directory.
	pub cwd: PathBuf,
}

/// Trait for preparing source files for execution.
///
/// This abstraction allows the broker to use the configured compilers in
/// production and shell-script toolchains in tests.
pub trait ToolchainRunner: Send + Sync + 'static {
	/// Compiles `source` if its toolchain needs it and returns the run command.
	fn prepare(
		&self,
		source: &Path,
	) -> Pin<Box<dyn Future<Output = Result<Prepared, ToolchainError>> + Send>>;

	/// Starter content for a new file with extension `ext`.
	fn template(&self, ext: &str) -> Option<String>;
}

/// Table-driven toolchain runner.
///
/// Build artifacts go to `build_dir`, which lives inside the workspace under a
/// hidden name so listings never show it.
#[derive(Debug, Clone)]
pub struct Toolchains {
	table: BTreeMap<String, ToolchainSpec>,
	build_dir: PathBuf,
}

impl Toolchains {
	/// Creates a runner over `table`, writing artifacts to `build_dir`.
	pub fn new(table: BTreeMap<String, ToolchainSpec>, build_dir: impl Into<PathBuf>) -> Self {
		Self {
			table,
			build_dir: build_dir.into(),
		}
	}
}

struct Placeholders {
	file: String,
	dir: String,
	stem: String,
	out: String,
	build: String,
}

impl Placeholders {
	fn new(source: &Path, build_dir: &Path) -> Self {
		let stem = source
			.file_stem()
			.map(|s| s.to_string_lossy().into_owned())
			.unwrap_or_default();
		Self {
			file: source.display().to_string(),
			dir: source
				.parent()
				.map(|p| p.display().to_string())
				.unwrap_or_default(),
			out: build_dir.join(&stem).display().to_string(),
			build: build_dir.display().to_string(),
			stem,
		}
	}

	fn expand(&self, template: &str) -> String {
		template
			.replace("{file}", &self.file)
			.replace("{dir}", &self.dir)
			.replace("{stem}", &self.stem)
			.replace("{out}", &self.out)
			.replace("{build}", &self.build)
	}

	fn expand_all(&self, argv: &[String]) -> Vec<String> {
		argv.iter().map(|a| self.expand(a)).collect()
	}
}

fn extension_of(source: &Path) -> String {
	source
		.extension()
		.map(|e| e.to_string_lossy().to_ascii_lowercase())
		.unwrap_or_default()
}

impl ToolchainRunner for Toolchains {
	fn prepare(
		&self,
		source: &Path,
	) -> Pin<Box<dyn Future<Output = Result<Prepared, ToolchainError>> + Send>> {
		let ext = extension_of(source);
		let spec = self.table.get(&ext).cloned();
		let vars = Placeholders::new(source, &self.build_dir);
		let build_dir = self.build_dir.clone();
		let cwd = source
			.parent()
			.map(Path::to_path_buf)
			.unwrap_or_else(|| PathBuf::from("."));

		Box::pin(async move {
			let Some(spec) = spec else {
				let shown = if ext.is_empty() { "(none)".to_string() } else { ext };
				return Err(ToolchainError::Unsupported(shown));
			};

			if let Some(build) = &spec.build {
				let argv = vars.expand_all(build);
				let (program, args) = argv.split_first().ok_or(ToolchainError::Unsupported(ext.clone()))?;
				tokio::fs::create_dir_all(&build_dir)
					.await
					.map_err(|source| ToolchainError::Spawn {
						program: program.clone(),
						source,
					})?;

				tracing::debug!(%program, ?args, "building");
				let output = tokio::process::Command::new(program)
					.args(args)
					.current_dir(&cwd)
					.stdin(Stdio::null())
					.kill_on_drop(true)
					.output()
					.await
					.map_err(|source| ToolchainError::Spawn {
						program: program.clone(),
						source,
					})?;

				if !output.status.success() {
					let stderr = String::from_utf8_lossy(&output.stderr);
					let diagnostics = if stderr.trim().is_empty() {
						String::from_utf8_lossy(&output.stdout).into_owned()
					} else {
						stderr.into_owned()
					};
					return Err(ToolchainError::BuildFailed { diagnostics });
				}
			}

			let argv = vars.expand_all(&spec.run);
			let (program, args) = argv.split_first().ok_or(ToolchainError::Unsupported(ext))?;
			Ok(Prepared {
				program: program.clone(),
				args: args.to_vec(),
				cwd,
			})
		})
	}

	fn template(&self, ext: &str) -> Option<String> {
		self.table.get(ext).and_then(|s| s.template.clone())
	}
}
