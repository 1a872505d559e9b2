//! Broker request errors and their wire mapping.

use codeshare_proto::{ErrorCode, ServerEvent};
use thiserror::Error;

use crate::storage::StorageError;

/// Failure of a client request.
///
/// Every variant maps to an [`ErrorCode`] and is reported to the requesting
/// connection only; no variant closes the connection.
#[derive(Debug, Error)]
pub enum BrokerError {
	/// Another connection holds the lock requested by `OPEN`.
	#[error("File {file} is currently being edited by another user")]
	LockConflict {
		/// File name.
		file: String,
	},
	/// `EDIT` from a connection the edit policy does not allow.
	#[error("You don't own the lock for {file}")]
	EditRejected {
		/// File name.
		file: String,
	},
	/// `DELETE_FILE` while another connection holds the lock.
	#[error("Cannot delete file - it's being edited by another user")]
	DeleteRejected {
		/// File name.
		file: String,
	},
	/// `RELEASE_LOCK` for a lock the connection does not hold.
	#[error("You don't own the lock for {file}")]
	NotLockOwner {
		/// File name.
		file: String,
	},
	/// Workspace failure.
	#[error(transparent)]
	Storage(#[from] StorageError),
	/// `RUN` while a run is active under the reject policy.
	#[error("A program is already running")]
	RunInProgress,
	/// `PROGRAM_INPUT` or `STOP_PROGRAM` with no active run.
	#[error("No program is running")]
	NoActiveRun,
	/// The connection was unregistered while the request was in flight.
	#[error("connection is closed")]
	ConnectionGone,
}

impl BrokerError {
	/// Wire classification of this error.
	pub fn code(&self) -> ErrorCode {
		match self {
			Self::LockConflict { .. } | Self::EditRejected { .. } | Self::DeleteRejected { .. } => {
				ErrorCode::LockConflict
			}
			Self::NotLockOwner { .. } => ErrorCode::NotLockOwner,
			Self::Storage(StorageError::InvalidName(_)) => ErrorCode::InvalidFilename,
			Self::Storage(StorageError::NotFound(_)) => ErrorCode::FileNotFound,
			Self::Storage(StorageError::AlreadyExists(_)) => ErrorCode::FileExists,
			Self::Storage(StorageError::Io { .. }) => ErrorCode::Io,
			Self::RunInProgress => ErrorCode::RunInProgress,
			Self::NoActiveRun => ErrorCode::NoActiveRun,
			Self::ConnectionGone => ErrorCode::Internal,
		}
	}

	/// Builds the `ERROR` frame sent to the requester.
	pub fn to_event(&self) -> ServerEvent {
		ServerEvent::error(self.code(), self.to_string())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn storage_errors_map_to_specific_codes() {
		let err = BrokerError::from(StorageError::InvalidName("../x".into()));
		assert_eq!(err.code(), ErrorCode::InvalidFilename);
		let err = BrokerError::from(StorageError::AlreadyExists("a.py".into()));
		assert_eq!(err.code(), ErrorCode::FileExists);
	}

	#[test]
	fn lock_conflict_message_names_file() {
		let event = BrokerError::LockConflict { file: "a.py".into() }.to_event();
		assert_eq!(
			event,
			ServerEvent::error(
				ErrorCode::LockConflict,
				"File a.py is currently being edited by another user"
			)
		);
	}
}
