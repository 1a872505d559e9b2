//! Client command decoding.
//!
//! Clients speak one of two dialects: frames tagged with an upper-case
//! `command` field (`OPEN`, `EDIT`, `RUN`, ...) or frames tagged with a
//! lower-case `action` field (`get_file`, `save_file`, `run_file`, ...).
//! Both decode into the same closed [`Command`] enum so the broker dispatches
//! on a single exhaustive match.

use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::types::ErrorCode;

/// A request sent from a client to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "command", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
	/// Load a file and start watching it.
	Open {
		/// File name.
		filename: String,
		/// Try to take the edit lock. Defaults to the broker's `lock_on_open`.
		#[serde(default)]
		acquire_lock: Option<bool>,
	},
	/// Replace a file's content.
	Edit {
		/// File name.
		filename: String,
		/// Whole-buffer content.
		content: String,
	},
	/// Build (if needed) and run a file.
	Run {
		/// File name.
		filename: String,
		/// Batch stdin written once before stdin is closed.
		#[serde(default)]
		input: Option<String>,
	},
	/// Forward one line to the running program's stdin.
	ProgramInput {
		/// Input text. A trailing newline is appended when absent.
		input: String,
	},
	/// Terminate the running program.
	StopProgram,
	/// Stop watching a file and release its lock.
	Close {
		/// File name.
		filename: String,
	},
	/// List workspace files with their lock state.
	ListFiles,
	/// Create a new file from the language template.
	CreateFile {
		/// File name.
		filename: String,
		/// Language extension appended when the name has none.
		#[serde(default, rename = "type")]
		file_type: Option<String>,
	},
	/// Delete a file.
	DeleteFile {
		/// File name.
		filename: String,
	},
	/// Query a file's lock state.
	CheckLock {
		/// File name.
		filename: String,
	},
	/// Release a held lock without closing the file.
	ReleaseLock {
		/// File name.
		filename: String,
	},
}

impl Command {
	/// Returns the wire name of this command, used for logging.
	pub fn name(&self) -> &'static str {
		match self {
			Self::Open { .. } => "OPEN",
			Self::Edit { .. } => "EDIT",
			Self::Run { .. } => "RUN",
			Self::ProgramInput { .. } => "PROGRAM_INPUT",
			Self::StopProgram => "STOP_PROGRAM",
			Self::Close { .. } => "CLOSE",
			Self::ListFiles => "LIST_FILES",
			Self::CreateFile { .. } => "CREATE_FILE",
			Self::DeleteFile { .. } => "DELETE_FILE",
			Self::CheckLock { .. } => "CHECK_LOCK",
			Self::ReleaseLock { .. } => "RELEASE_LOCK",
		}
	}
}

const KNOWN_COMMANDS: &[&str] = &[
	"OPEN",
	"EDIT",
	"RUN",
	"PROGRAM_INPUT",
	"STOP_PROGRAM",
	"CLOSE",
	"LIST_FILES",
	"CREATE_FILE",
	"DELETE_FILE",
	"CHECK_LOCK",
	"RELEASE_LOCK",
];

/// Failure to turn a client frame into a [`Command`].
#[derive(Debug, Error)]
pub enum DecodeError {
	/// The frame is not valid JSON.
	#[error("invalid JSON: {0}")]
	InvalidJson(#[source] serde_json::Error),
	/// The frame is JSON but not an object.
	#[error("message must be a JSON object")]
	NotAnObject,
	/// Neither `command` nor `action` is present.
	#[error("missing command")]
	MissingCommand,
	/// The command name is not recognized.
	#[error("Unknown command: {0}")]
	UnknownCommand(String),
	/// Fields are missing or mistyped.
	#[error("invalid arguments for {command}: {source}")]
	InvalidArgs {
		/// Canonical command name.
		command: String,
		/// Underlying serde error.
		#[source]
		source: serde_json::Error,
	},
}

impl DecodeError {
	/// Maps the failure to its wire error code.
	pub fn code(&self) -> ErrorCode {
		match self {
			Self::InvalidJson(_) => ErrorCode::InvalidJson,
			Self::NotAnObject | Self::InvalidArgs { .. } => ErrorCode::InvalidArgs,
			Self::MissingCommand | Self::UnknownCommand(_) => ErrorCode::UnknownCommand,
		}
	}
}

/// Decodes a client text frame.
///
/// The `command` field wins when both tags are present. Action names are
/// mapped onto their command equivalents before the typed decode, so
/// `{"action": "get_file", "filename": "a.py"}` decodes to [`Command::Open`].
///
/// Only requests are accepted in both dialects. Replies are always
/// [`ServerEvent`](crate::ServerEvent) frames tagged on `command` (`LOAD`,
/// `FILES_LIST`, ...), whichever dialect the request used.
pub fn decode_command(text: &str) -> Result<Command, DecodeError> {
	let value: Value = serde_json::from_str(text).map_err(DecodeError::InvalidJson)?;
	let Value::Object(mut map) = value else {
		return Err(DecodeError::NotAnObject);
	};

	let name = canonical_name(&map)?;
	map.remove("action");
	map.insert("command".to_string(), Value::String(name.clone()));

	serde_json::from_value(Value::Object(map)).map_err(|source| DecodeError::InvalidArgs {
		command: name,
		source,
	})
}

fn canonical_name(map: &Map<String, Value>) -> Result<String, DecodeError> {
	let raw = match (map.get("command"), map.get("action")) {
		(Some(Value::String(c)), _) => c.as_str(),
		(None, Some(Value::String(a))) => a.as_str(),
		(Some(other), _) | (None, Some(other)) => {
			return Err(DecodeError::UnknownCommand(other.to_string()));
		}
		(None, None) => return Err(DecodeError::MissingCommand),
	};

	let mapped = match raw {
		"get_file" => "OPEN".to_string(),
		"save_file" => "EDIT".to_string(),
		"run_file" => "RUN".to_string(),
		other => other.to_ascii_uppercase(),
	};

	if KNOWN_COMMANDS.contains(&mapped.as_str()) {
		Ok(mapped)
	} else {
		Err(DecodeError::UnknownCommand(raw.to_string()))
	}
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;

	use super::*;

	#[test]
	fn decodes_command_dialect() {
		let cmd = decode_command(r#"{"command":"EDIT","filename":"a.py","content":"x"}"#).unwrap();
		assert_eq!(
			cmd,
			Command::Edit {
				filename: "a.py".into(),
				content: "x".into(),
			}
		);
	}

	#[test]
	fn decodes_action_aliases() {
		let cmd = decode_command(r#"{"action":"get_file","filename":"a.py","acquire_lock":false}"#).unwrap();
		assert_eq!(
			cmd,
			Command::Open {
				filename: "a.py".into(),
				acquire_lock: Some(false),
			}
		);

		let cmd = decode_command(r#"{"action":"run_file","filename":"a.py","input":"5\n"}"#).unwrap();
		assert_eq!(
			cmd,
			Command::Run {
				filename: "a.py".into(),
				input: Some("5\n".into()),
			}
		);

		let cmd = decode_command(r#"{"action":"list_files"}"#).unwrap();
		assert_eq!(cmd, Command::ListFiles);
	}

	#[test]
	fn create_file_reads_type_field() {
		let cmd = decode_command(r#"{"action":"create_file","filename":"hello","type":"c"}"#).unwrap();
		assert_eq!(
			cmd,
			Command::CreateFile {
				filename: "hello".into(),
				file_type: Some("c".into()),
			}
		);
	}

	#[test]
	fn unit_commands_ignore_extra_fields() {
		let cmd = decode_command(r#"{"command":"STOP_PROGRAM","filename":"a.py"}"#).unwrap();
		assert_eq!(cmd, Command::StopProgram);
	}

	#[test]
	fn rejects_malformed_frames() {
		assert_eq!(decode_command("not json").unwrap_err().code(), ErrorCode::InvalidJson);
		assert_eq!(decode_command("[1,2]").unwrap_err().code(), ErrorCode::InvalidArgs);
		assert_eq!(decode_command("{}").unwrap_err().code(), ErrorCode::UnknownCommand);
		assert_eq!(
			decode_command(r#"{"command":"FORMAT_DISK"}"#).unwrap_err().code(),
			ErrorCode::UnknownCommand
		);
		assert_eq!(
			decode_command(r#"{"command":"OPEN"}"#).unwrap_err().code(),
			ErrorCode::InvalidArgs
		);
		assert_eq!(
			decode_command(r#"{"command":"EDIT","filename":"a.py","content":7}"#)
				.unwrap_err()
				.code(),
			ErrorCode::InvalidArgs
		);
	}
}
