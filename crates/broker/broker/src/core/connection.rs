//! Connection lifecycle management.
//!
//! Methods for registering, unregistering, and cleaning up client connections.

use std::sync::atomic::Ordering;

use codeshare_proto::{ConnectionId, ServerEvent};

use super::{BrokerCore, ConnectionEntry, ConnectionSink};
use crate::config::DisconnectPolicy;
use crate::run::CancelReason;

impl BrokerCore {
	/// Register a client connection with its outbound event sink.
	pub fn register_connection(&self, sink: ConnectionSink) -> ConnectionId {
		let conn = ConnectionId(self.next_connection_id.fetch_add(1, Ordering::Relaxed));
		self.connections
			.lock()
			.connections
			.insert(conn, ConnectionEntry { sink, run: None });
		tracing::debug!(%conn, "connection registered");
		conn
	}

	/// Unregister a connection and release everything it owns.
	///
	/// Performs authoritative cleanup: releases every lock the connection
	/// holds, removes it from all watcher sets, and cancels (or detaches) its
	/// active run according to the disconnect policy. Calling this more than
	/// once is safe.
	///
	/// The file-side cleanup runs even when the entry is already gone: an
	/// `OPEN` that looked up the sink before a concurrent unregister may still
	/// have taken a lock, and the transport's final unregister releases it.
	pub fn unregister_connection(&self, conn: ConnectionId) {
		let (registered, run) = {
			let mut state = self.connections.lock();
			match state.connections.remove(&conn) {
				Some(entry) => (true, entry.run),
				None => (false, None),
			}
		};

		let (released, unwatched) = {
			let mut files = self.files.lock();
			let released = files.locks.release_all(conn);
			let unwatched = files.watched.remove(&conn).unwrap_or_default();
			for name in &unwatched {
				if let Some(record) = files.records.get_mut(name) {
					record.watchers.remove(&conn);
				}
			}
			(released, unwatched)
		};

		if let Some(run) = run {
			match self.policy.on_disconnect {
				DisconnectPolicy::Kill => {
					tracing::info!(%conn, run = %run.id(), "cancelling run of disconnected connection");
					run.cancel(CancelReason::Disconnected);
				}
				DisconnectPolicy::Detach => {
					tracing::info!(%conn, run = %run.id(), "detaching run of disconnected connection");
				}
			}
		}

		if registered {
			tracing::info!(
				%conn,
				released = released.len(),
				unwatched = unwatched.len(),
				"connection unregistered"
			);
		} else if !released.is_empty() || !unwatched.is_empty() {
			tracing::warn!(
				%conn,
				released = released.len(),
				unwatched = unwatched.len(),
				"released state left behind by an unregistered connection"
			);
		}
	}

	/// Sends an event to one connection.
	///
	/// Returns `false` when the connection is gone. A failed send triggers
	/// cleanup of the connection.
	pub fn send_event(&self, conn: ConnectionId, event: ServerEvent) -> bool {
		let sink = {
			let state = self.connections.lock();
			match state.connections.get(&conn) {
				Some(entry) => entry.sink.clone(),
				None => return false,
			}
		};

		if sink.send(event).is_err() {
			self.handle_send_failure(conn);
			return false;
		}
		true
	}

	/// Authoritatively cleans up a connection that is determined to be dead.
	pub fn handle_send_failure(&self, conn: ConnectionId) {
		tracing::warn!(%conn, "connection send failed, triggering cleanup");
		self.unregister_connection(conn);
	}

	/// Returns `true` while `conn` is registered.
	pub fn is_connected(&self, conn: ConnectionId) -> bool {
		self.connections.lock().connections.contains_key(&conn)
	}
}
