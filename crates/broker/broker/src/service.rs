//! Broker service implementation.

use std::sync::Arc;

use codeshare_proto::{Command, ConnectionId, ServerEvent, decode_command};

use crate::core::{BrokerCore, ConnectionSink};
use crate::error::BrokerError;

/// Per-connection command handler.
///
/// Each transport connection is handled by an instance of this service. It
/// decodes client frames, dispatches them to the shared [`BrokerCore`] and
/// sends direct replies back through the connection's sink. Dropping the
/// service unregisters the connection.
pub struct BrokerService {
	/// Shared broker core.
	core: Arc<BrokerCore>,
	/// Event sink for this connection.
	sink: ConnectionSink,
	/// Identity assigned on registration.
	conn: ConnectionId,
}

impl std::fmt::Debug for BrokerService {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("BrokerService")
			.field("core", &self.core)
			.field("sink", &"<ConnectionSink>")
			.field("conn", &self.conn)
			.finish()
	}
}

impl BrokerService {
	/// Registers a new connection and returns its service.
	#[must_use]
	pub fn new(core: Arc<BrokerCore>, sink: ConnectionSink) -> Self {
		let conn = core.register_connection(sink.clone());
		Self { core, sink, conn }
	}

	/// Identity of this connection.
	pub fn connection_id(&self) -> ConnectionId {
		self.conn
	}

	/// Handles one text frame from the client.
	///
	/// Protocol and request errors are reported as `ERROR` events; the
	/// connection stays open.
	pub fn handle_text(&self, text: &str) {
		let command = match decode_command(text) {
			Ok(command) => command,
			Err(err) => {
				tracing::debug!(conn = %self.conn, error = %err, "rejected frame");
				self.reply(ServerEvent::error(err.code(), err.to_string()));
				return;
			}
		};

		let name = command.name();
		match self.dispatch(command) {
			Ok(Some(event)) => self.reply(event),
			Ok(None) => {}
			Err(err) => {
				tracing::debug!(conn = %self.conn, command = name, error = %err, "command failed");
				self.reply(err.to_event());
			}
		}
	}

	/// Executes a decoded command and returns the direct reply, if any.
	pub fn dispatch(&self, command: Command) -> Result<Option<ServerEvent>, BrokerError> {
		let core = &self.core;
		let conn = self.conn;
		match command {
			Command::Open {
				filename,
				acquire_lock,
			} => core.open_file(conn, &filename, acquire_lock).map(Some),
			Command::Edit { filename, content } => {
				core.edit_file(conn, &filename, content)?;
				Ok(None)
			}
			Command::Run { filename, input } => {
				core.start_run(conn, &filename, input)?;
				Ok(None)
			}
			Command::ProgramInput { input } => {
				core.submit_input(conn, input)?;
				Ok(None)
			}
			Command::StopProgram => {
				core.stop_run(conn)?;
				Ok(None)
			}
			Command::Close { filename } => {
				core.close_file(conn, &filename)?;
				Ok(None)
			}
			Command::ListFiles => core.list_files(conn).map(Some),
			Command::CreateFile {
				filename,
				file_type,
			} => {
				let filename = core.create_file(conn, &filename, file_type.as_deref())?;
				Ok(Some(ServerEvent::FileCreated { filename }))
			}
			Command::DeleteFile { filename } => {
				core.delete_file(conn, &filename)?;
				Ok(Some(ServerEvent::FileDeleted { filename }))
			}
			Command::CheckLock { filename } => core.check_lock(conn, &filename).map(Some),
			Command::ReleaseLock { filename } => {
				core.release_lock(conn, &filename)?;
				Ok(Some(ServerEvent::LockReleased { filename }))
			}
		}
	}

	fn reply(&self, event: ServerEvent) {
		if self.sink.send(event).is_err() {
			self.core.handle_send_failure(self.conn);
		}
	}
}

impl Drop for BrokerService {
	/// Authoritatively cleans up the connection when the transport is dropped.
	fn drop(&mut self) {
		self.core.unregister_connection(self.conn);
	}
}
