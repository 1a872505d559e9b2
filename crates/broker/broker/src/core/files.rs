//! File commands: open, close, create, delete, list and lock queries.

use codeshare_proto::{ConnectionId, FileStatus, ServerEvent};

use super::{Acquire, BrokerCore, ConnectionSink, FileRecord};
use crate::error::BrokerError;
use crate::storage::validate_filename;

impl BrokerCore {
	/// Loads `file` for `conn`, optionally taking its lock, and registers `conn` as a watcher.
	///
	/// When the lock is requested and another connection holds it, nothing is
	/// mutated and [`BrokerError::LockConflict`] is returned.
	pub fn open_file(
		&self,
		conn: ConnectionId,
		file: &str,
		acquire_lock: Option<bool>,
	) -> Result<ServerEvent, BrokerError> {
		validate_filename(file)?;
		let sink = self.sink_of(conn)?;
		self.open_with_sink(conn, file, acquire_lock, sink)
	}

	/// Second half of [`BrokerCore::open_file`], run under the files lock only.
	///
	/// The connections lock is already released here, so `conn` may have been
	/// unregistered in between; its final unregister sweeps what this adds.
	pub(super) fn open_with_sink(
		&self,
		conn: ConnectionId,
		file: &str,
		acquire_lock: Option<bool>,
		sink: ConnectionSink,
	) -> Result<ServerEvent, BrokerError> {
		let acquire = acquire_lock.unwrap_or(self.policy.lock_on_open);
		let mut files = self.files.lock();
		if acquire && files.locks.is_locked_by_other(file, conn) {
			return Err(BrokerError::LockConflict {
				file: file.to_string(),
			});
		}

		let content = match files.records.get(file) {
			Some(record) => record.content.clone(),
			None => {
				let content = self.storage.read(file)?;
				files
					.records
					.insert(file.to_string(), FileRecord::new(content.clone()));
				content
			}
		};

		if acquire {
			let granted = files.locks.acquire(file, conn);
			debug_assert_eq!(granted, Acquire::Granted);
		}
		Self::watch_locked(&mut files, file, conn, sink);
		let locked = files.locks.holder(file).is_some();
		drop(files);

		tracing::debug!(%conn, file, acquire, locked, "file opened");
		Ok(ServerEvent::Load {
			filename: file.to_string(),
			content,
			locked,
		})
	}

	/// Stops `conn` watching `file` and releases its lock if held. Silent when neither applies.
	pub fn close_file(&self, conn: ConnectionId, file: &str) -> Result<(), BrokerError> {
		validate_filename(file)?;
		let mut files = self.files.lock();
		let released = files.locks.release(file, conn).is_ok();
		Self::unwatch_locked(&mut files, file, conn);
		drop(files);
		tracing::debug!(%conn, file, released, "file closed");
		Ok(())
	}

	/// Creates a new file from the toolchain template.
	///
	/// `file_type` is appended as an extension when the name has none.
	/// Returns the final file name.
	pub fn create_file(
		&self,
		conn: ConnectionId,
		file: &str,
		file_type: Option<&str>,
	) -> Result<String, BrokerError> {
		let name = match file_type {
			Some(ext) if !ext.is_empty() && !file.contains('.') => {
				format!("{file}.{}", ext.trim_start_matches('.'))
			}
			_ => file.to_string(),
		};
		validate_filename(&name)?;

		let ext = name.rsplit_once('.').map(|(_, ext)| ext).unwrap_or_default();
		let content = self.runner.template(ext).unwrap_or_default();

		let _guard = self.files.lock();
		self.storage.create(&name, &content)?;
		tracing::info!(%conn, file = %name, "file created");
		Ok(name)
	}

	/// Deletes `file` and clears its cached content, lock and watchers.
	///
	/// Refused while another connection holds the lock.
	pub fn delete_file(&self, conn: ConnectionId, file: &str) -> Result<(), BrokerError> {
		validate_filename(file)?;
		let mut files = self.files.lock();
		if files.locks.is_locked_by_other(file, conn) {
			return Err(BrokerError::DeleteRejected {
				file: file.to_string(),
			});
		}
		self.storage.delete(file)?;

		files.locks.clear(file);
		if let Some(record) = files.records.remove(file) {
			for watcher in record.watchers.keys() {
				if let Some(watched) = files.watched.get_mut(watcher) {
					watched.remove(file);
					if watched.is_empty() {
						files.watched.remove(watcher);
					}
				}
			}
		}
		drop(files);

		tracing::info!(%conn, file, "file deleted");
		Ok(())
	}

	/// Lists workspace files with their lock state as seen by `conn`.
	pub fn list_files(&self, conn: ConnectionId) -> Result<ServerEvent, BrokerError> {
		let names = self.storage.list()?;
		let files = self.files.lock();
		let file_status = names
			.iter()
			.map(|name| FileStatus {
				name: name.clone(),
				locked: files.locks.is_locked_by_other(name, conn),
			})
			.collect();
		drop(files);
		Ok(ServerEvent::FilesList {
			files: names,
			file_status,
		})
	}

	/// Reports whether `file` is locked and whether `conn` may edit it.
	pub fn check_lock(&self, conn: ConnectionId, file: &str) -> Result<ServerEvent, BrokerError> {
		validate_filename(file)?;
		let files = self.files.lock();
		let locked = files.locks.holder(file).is_some();
		let can_edit = files.locks.can_write(file, conn, self.policy.edit_policy);
		Ok(ServerEvent::LockStatus {
			filename: file.to_string(),
			locked,
			can_edit,
		})
	}

	/// Releases `conn`'s lock on `file` without closing it.
	pub fn release_lock(&self, conn: ConnectionId, file: &str) -> Result<(), BrokerError> {
		validate_filename(file)?;
		self.files
			.lock()
			.locks
			.release(file, conn)
			.map_err(|_| BrokerError::NotLockOwner {
				file: file.to_string(),
			})?;
		tracing::debug!(%conn, file, "lock released");
		Ok(())
	}
}
