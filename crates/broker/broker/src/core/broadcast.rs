//! Whole-buffer edits and watcher fan-out.

use codeshare_proto::{ConnectionId, ServerEvent};

use super::{BrokerCore, ConnectionSink, FileRecord, FileState};
use crate::error::BrokerError;
use crate::storage::validate_filename;

impl BrokerCore {
	/// Overwrites `file` with `content` on behalf of `author`.
	///
	/// The edit policy decides whether `author` may write. Accepted content is
	/// persisted first and cached second, so a storage failure leaves the
	/// cache untouched. Every other watcher receives `UPDATE` with exactly the
	/// new content; the author never does.
	pub fn edit_file(
		&self,
		author: ConnectionId,
		file: &str,
		content: String,
	) -> Result<(), BrokerError> {
		validate_filename(file)?;

		let mut dead = Vec::new();
		{
			let mut files = self.files.lock();
			if !files.locks.can_write(file, author, self.policy.edit_policy) {
				return Err(BrokerError::EditRejected {
					file: file.to_string(),
				});
			}
			if !files.records.contains_key(file) && !self.storage.exists(file) {
				return Err(crate::storage::StorageError::NotFound(file.to_string()).into());
			}

			self.storage.write(file, &content)?;
			let record = files
				.records
				.entry(file.to_string())
				.or_insert_with(|| FileRecord::new(String::new()));
			record.content.clone_from(&content);

			if self.policy.broadcast_edits {
				for (&watcher, sink) in &record.watchers {
					if watcher == author {
						continue;
					}
					let update = ServerEvent::Update {
						filename: file.to_string(),
						content: content.clone(),
					};
					if sink.send(update).is_err() {
						dead.push(watcher);
					}
				}
			}
		}

		tracing::debug!(conn = %author, file, bytes = content.len(), "file edited");
		for conn in dead {
			self.handle_send_failure(conn);
		}
		Ok(())
	}

	/// Current cached content of `file`, if it has been opened or edited.
	pub fn cached_content(&self, file: &str) -> Option<String> {
		self.files.lock().records.get(file).map(|r| r.content.clone())
	}

	pub(super) fn sink_of(&self, conn: ConnectionId) -> Result<ConnectionSink, BrokerError> {
		self.connections
			.lock()
			.connections
			.get(&conn)
			.map(|entry| entry.sink.clone())
			.ok_or(BrokerError::ConnectionGone)
	}

	pub(super) fn watch_locked(
		files: &mut FileState,
		file: &str,
		conn: ConnectionId,
		sink: ConnectionSink,
	) {
		if let Some(record) = files.records.get_mut(file) {
			record.watchers.insert(conn, sink);
			files.watched.entry(conn).or_default().insert(file.to_string());
		}
	}

	pub(super) fn unwatch_locked(files: &mut FileState, file: &str, conn: ConnectionId) {
		if let Some(record) = files.records.get_mut(file) {
			record.watchers.remove(&conn);
		}
		if let Some(watched) = files.watched.get_mut(&conn) {
			watched.remove(file);
			if watched.is_empty() {
				files.watched.remove(&conn);
			}
		}
	}
}
