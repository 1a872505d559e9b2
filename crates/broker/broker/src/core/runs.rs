//! Per-connection run slot management.

use std::sync::Arc;
use std::time::Duration;

use codeshare_proto::{ConnectionId, RunId};

use super::BrokerCore;
use crate::config::RunPolicy;
use crate::error::BrokerError;
use crate::run::{CancelReason, RunRequest, RunSession, wait_terminal};

impl BrokerCore {
	/// Starts running `file` for `conn`.
	///
	/// Claims the connection's run slot synchronously, so a second `RUN` racing
	/// this one sees the slot taken. Under [`RunPolicy::Replace`] the previous
	/// run is cancelled and fully finished before the new one starts building.
	pub fn start_run(
		self: &Arc<Self>,
		conn: ConnectionId,
		file: &str,
		batch_input: Option<String>,
	) -> Result<RunId, BrokerError> {
		let source = self.storage.path_of(file)?;
		if !self.storage.exists(file) {
			return Err(crate::storage::StorageError::NotFound(file.to_string()).into());
		}

		let id = self.next_run_id();
		let (session, handle) = RunSession::new(
			RunRequest {
				id,
				conn,
				source,
				batch_input,
				timeout: self.policy.run_timeout(),
				grace: self.policy.kill_grace(),
			},
			self.clone(),
			self.runner.clone(),
			self.shutdown.child_token(),
		);

		let previous = {
			let mut state = self.connections.lock();
			let entry = state
				.connections
				.get_mut(&conn)
				.ok_or(BrokerError::ConnectionGone)?;
			if entry.run.is_some() && self.policy.run_policy == RunPolicy::Reject {
				return Err(BrokerError::RunInProgress);
			}
			entry.run.replace(handle)
		};

		let wait_limit = self.policy.kill_grace() + Duration::from_secs(3);
		self.runs.spawn(async move {
			if let Some(previous) = previous {
				tracing::info!(%conn, old = %previous.id(), new = %id, "replacing run");
				previous.cancel(CancelReason::Replaced);
				if !wait_terminal(previous.subscribe(), wait_limit).await {
					tracing::warn!(%conn, old = %previous.id(), "previous run did not finish in time");
				}
			}
			session.drive().await;
		});

		tracing::info!(%conn, file, run = %id, "run requested");
		Ok(id)
	}

	/// Queues a line of stdin for `conn`'s active run.
	pub fn submit_input(&self, conn: ConnectionId, input: String) -> Result<(), BrokerError> {
		let state = self.connections.lock();
		let run = state
			.connections
			.get(&conn)
			.and_then(|entry| entry.run.as_ref())
			.ok_or(BrokerError::NoActiveRun)?;
		run.send_input(input);
		Ok(())
	}

	/// Cancels `conn`'s active run. The driver reports `PROGRAM_FINISHED{cancelled}`.
	pub fn stop_run(&self, conn: ConnectionId) -> Result<RunId, BrokerError> {
		let state = self.connections.lock();
		let run = state
			.connections
			.get(&conn)
			.and_then(|entry| entry.run.as_ref())
			.ok_or(BrokerError::NoActiveRun)?;
		run.cancel(CancelReason::Stopped);
		tracing::info!(%conn, run = %run.id(), "run stop requested");
		Ok(run.id())
	}

	/// Id of `conn`'s active run.
	pub fn active_run(&self, conn: ConnectionId) -> Option<RunId> {
		self.connections
			.lock()
			.connections
			.get(&conn)
			.and_then(|entry| entry.run.as_ref())
			.map(|run| run.id())
	}

	/// Frees `conn`'s run slot if it still holds `run`.
	pub(crate) fn release_run_slot(&self, conn: ConnectionId, run: RunId) {
		let mut state = self.connections.lock();
		if let Some(entry) = state.connections.get_mut(&conn)
			&& entry.run.as_ref().is_some_and(|r| r.id() == run)
		{
			entry.run = None;
		}
	}

	/// Cancels every run, including detached ones, and waits up to `limit` for them to finish.
	pub async fn shutdown(&self, limit: Duration) {
		{
			let state = self.connections.lock();
			for entry in state.connections.values() {
				if let Some(run) = &entry.run {
					run.cancel(CancelReason::Shutdown);
				}
			}
		}
		self.shutdown.cancel();
		self.runs.close();
		if tokio::time::timeout(limit, self.runs.wait()).await.is_err() {
			tracing::warn!(remaining = self.runs.len(), "runs still active at shutdown");
		}
	}
}
