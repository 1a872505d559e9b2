//! Workspace file storage.
//!
//! The broker keeps an in-memory copy of every opened file and mirrors each
//! accepted edit to a [`Storage`] backend. [`FsWorkspace`] stores one file per
//! entry directly under a workspace directory.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

/// Failure of a workspace operation.
#[derive(Debug, Error)]
pub enum StorageError {
	/// The name is empty, hidden, or not a single path component.
	#[error("Invalid filename: {0:?}")]
	InvalidName(String),
	/// The file does not exist.
	#[error("File {0} not found")]
	NotFound(String),
	/// The file already exists.
	#[error("File {0} already exists")]
	AlreadyExists(String),
	/// Any other I/O failure.
	#[error("I/O error on {name}: {source}")]
	Io {
		/// File name.
		name: String,
		/// Underlying error.
		#[source]
		source: std::io::Error,
	},
}

impl StorageError {
	fn from_io(name: &str, source: std::io::Error) -> Self {
		match source.kind() {
			ErrorKind::NotFound => Self::NotFound(name.to_string()),
			ErrorKind::AlreadyExists => Self::AlreadyExists(name.to_string()),
			_ => Self::Io {
				name: name.to_string(),
				source,
			},
		}
	}
}

/// Checks that `name` is a plain file name inside the workspace.
///
/// Accepts a single normal path component that does not start with `.`.
/// Hidden names are reserved for broker-owned entries such as the build
/// directory.
pub fn validate_filename(name: &str) -> Result<(), StorageError> {
	let invalid = || StorageError::InvalidName(name.to_string());
	if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\', '\0']) {
		return Err(invalid());
	}
	let mut components = Path::new(name).components();
	match (components.next(), components.next()) {
		(Some(Component::Normal(_)), None) => Ok(()),
		_ => Err(invalid()),
	}
}

/// Persistent backing store for shared files.
///
/// Methods are synchronous; files are small and writes happen inside the
/// broker's file-table critical section so the cache and disk never diverge.
/// They run on the calling runtime worker with that lock held, so a slow
/// disk delays every connection's `OPEN`, `EDIT` and `LIST_FILES` until the
/// call returns.
pub trait Storage: Send + Sync + 'static {
	/// Absolute path of the workspace root.
	fn root(&self) -> &Path;

	/// Resolves a validated name to its on-disk path.
	fn path_of(&self, name: &str) -> Result<PathBuf, StorageError> {
		validate_filename(name)?;
		Ok(self.root().join(name))
	}

	/// Reads a file.
	fn read(&self, name: &str) -> Result<String, StorageError>;

	/// Overwrites (or creates) a file.
	fn write(&self, name: &str, content: &str) -> Result<(), StorageError>;

	/// Creates a file, failing if it already exists.
	fn create(&self, name: &str, content: &str) -> Result<(), StorageError>;

	/// Removes a file.
	fn delete(&self, name: &str) -> Result<(), StorageError>;

	/// Returns `true` when the file exists.
	fn exists(&self, name: &str) -> bool;

	/// Lists visible files, sorted by name.
	fn list(&self) -> Result<Vec<String>, StorageError>;
}

/// Filesystem workspace: one regular file per entry under `root`.
#[derive(Debug, Clone)]
pub struct FsWorkspace {
	root: PathBuf,
}

impl FsWorkspace {
	/// Opens (creating if needed) a workspace directory.
	pub fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
		let root = root.into();
		std::fs::create_dir_all(&root).map_err(|source| StorageError::Io {
			name: root.display().to_string(),
			source,
		})?;
		let root = std::fs::canonicalize(&root).map_err(|source| StorageError::Io {
			name: root.display().to_string(),
			source,
		})?;
		Ok(Self { root })
	}
}

impl Storage for FsWorkspace {
	fn root(&self) -> &Path {
		&self.root
	}

	fn read(&self, name: &str) -> Result<String, StorageError> {
		let path = self.path_of(name)?;
		std::fs::read_to_string(path).map_err(|e| StorageError::from_io(name, e))
	}

	fn write(&self, name: &str, content: &str) -> Result<(), StorageError> {
		let path = self.path_of(name)?;
		std::fs::write(path, content).map_err(|e| StorageError::from_io(name, e))
	}

	fn create(&self, name: &str, content: &str) -> Result<(), StorageError> {
		use std::io::Write;

		let path = self.path_of(name)?;
		let mut file = std::fs::OpenOptions::new()
			.write(true)
			.create_new(true)
			.open(path)
			.map_err(|e| StorageError::from_io(name, e))?;
		file.write_all(content.as_bytes())
			.map_err(|e| StorageError::from_io(name, e))
	}

	fn delete(&self, name: &str) -> Result<(), StorageError> {
		let path = self.path_of(name)?;
		std::fs::remove_file(path).map_err(|e| StorageError::from_io(name, e))
	}

	fn exists(&self, name: &str) -> bool {
		self.path_of(name).is_ok_and(|p| p.is_file())
	}

	fn list(&self) -> Result<Vec<String>, StorageError> {
		let io = |source| StorageError::Io {
			name: self.root.display().to_string(),
			source,
		};
		let mut names = Vec::new();
		for entry in std::fs::read_dir(&self.root).map_err(io)? {
			let entry = entry.map_err(io)?;
			if !entry.file_type().map_err(io)?.is_file() {
				continue;
			}
			let Ok(name) = entry.file_name().into_string() else {
				continue;
			};
			if !name.starts_with('.') {
				names.push(name);
			}
		}
		names.sort();
		Ok(names)
	}
}
