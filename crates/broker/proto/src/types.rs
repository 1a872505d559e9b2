//! Wire types for the codeshare broker protocol.
//!
//! Identifiers, error classification and the events the broker pushes to
//! connected clients.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier for a client connection.
///
/// Allocated by the broker on accept; never reused within one broker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "conn-{}", self.0)
	}
}

/// Unique identifier for a program run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunId(pub u64);

impl fmt::Display for RunId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "run-{}", self.0)
	}
}

/// Error classification reported in [`ServerEvent::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
	/// The frame was not valid JSON.
	InvalidJson,
	/// The `command` (or `action`) field is missing or not recognized.
	UnknownCommand,
	/// Required fields are missing or have the wrong type.
	InvalidArgs,
	/// The filename is empty, hidden, or escapes the workspace.
	InvalidFilename,
	/// Another connection holds the lock for the file.
	LockConflict,
	/// Lock release requested by a connection that does not hold it.
	NotLockOwner,
	/// The file does not exist in the workspace.
	FileNotFound,
	/// The file already exists in the workspace.
	FileExists,
	/// A program is already running for this connection.
	RunInProgress,
	/// No program is running for this connection.
	NoActiveRun,
	/// Workspace I/O failed.
	Io,
	/// Unspecified broker error.
	Internal,
}

/// How a program run ended, reported in [`ServerEvent::ProgramFinished`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
	/// The process exited on its own.
	Exited,
	/// The run was stopped by request, replacement, disconnect or shutdown.
	Cancelled,
	/// The run exceeded the configured wall-clock limit.
	TimedOut,
}

/// Lock state of one workspace file as seen by the requesting connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStatus {
	/// File name relative to the workspace root.
	pub name: String,
	/// True when another connection holds the file's lock.
	pub locked: bool,
}

/// A frame sent from the broker to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerEvent {
	/// File content in reply to `OPEN`.
	Load {
		/// File name.
		filename: String,
		/// Authoritative content.
		content: String,
		/// True when any connection (including the requester) holds the lock.
		locked: bool,
	},
	/// Whole-buffer content pushed to watchers after another connection's edit.
	Update {
		/// File name.
		filename: String,
		/// New authoritative content.
		content: String,
	},
	/// The requested program was spawned.
	ProgramStarted {
		/// Run identifier.
		run_id: RunId,
	},
	/// A chunk of program output, or a terminal build/spawn diagnostic.
	Output {
		/// Output text, usually one line including its newline.
		output: String,
		/// True only for the terminal message of a run that never spawned.
		finished: bool,
	},
	/// Terminal notification for a spawned program.
	ProgramFinished {
		/// Run identifier.
		run_id: RunId,
		/// How the run ended.
		status: RunOutcome,
		/// Process exit code, when the process exited normally.
		exit_code: Option<i32>,
		/// Always true; kept for clients that key on the flag.
		finished: bool,
	},
	/// Workspace listing in reply to `LIST_FILES`.
	FilesList {
		/// File names.
		files: Vec<String>,
		/// Lock state per file, in the same order as `files`.
		file_status: Vec<FileStatus>,
	},
	/// Reply to `CREATE_FILE`.
	FileCreated {
		/// Final file name, including any appended extension.
		filename: String,
	},
	/// Reply to `DELETE_FILE`.
	FileDeleted {
		/// File name.
		filename: String,
	},
	/// Reply to `CHECK_LOCK`.
	LockStatus {
		/// File name.
		filename: String,
		/// True when any connection holds the lock.
		locked: bool,
		/// True when the requester may edit the file under the active edit policy.
		can_edit: bool,
	},
	/// Reply to `RELEASE_LOCK`.
	LockReleased {
		/// File name.
		filename: String,
	},
	/// Request failure. The connection stays open.
	Error {
		/// Error classification.
		code: ErrorCode,
		/// Human-readable description.
		message: String,
	},
}

impl ServerEvent {
	/// Builds an [`ServerEvent::Error`] frame.
	pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
		Self::Error {
			code,
			message: message.into(),
		}
	}

	/// Builds a non-terminal [`ServerEvent::Output`] frame.
	pub fn output(output: impl Into<String>) -> Self {
		Self::Output {
			output: output.into(),
			finished: false,
		}
	}

	/// Builds a terminal [`ServerEvent::Output`] frame.
	pub fn final_output(output: impl Into<String>) -> Self {
		Self::Output {
			output: output.into(),
			finished: true,
		}
	}
}
