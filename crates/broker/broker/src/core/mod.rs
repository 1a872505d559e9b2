//! Broker core: connection registry, file locks, edit broadcast and run slots.
//!
//! # Purpose
//!
//! - Arbitrate concurrent editing of shared workspace files with one exclusive lock per file.
//! - Fan out accepted whole-buffer edits to every other connection watching the file.
//! - Own at most one running program per connection and stream its output back to that connection only.
//! - Exclude transport framing and JSON decoding; see [`crate::service`] and [`crate::ws`].
//!
//! # Mental model
//!
//! - Clients connect over a WebSocket and are registered with a [`ConnectionId`] and [`ConnectionSink`].
//! - `OPEN` makes the connection a watcher of the file and, by default, tries to take its lock.
//! - `EDIT` overwrites the whole buffer. The edit policy decides who may write; the broker persists the content, then sends `UPDATE` to the other watchers.
//! - `RUN` claims the connection's single run slot and spawns a `RunSession` driver task that builds, spawns and streams the program.
//! - Disconnect releases locks and watches and cancels (or detaches) the active run. The run is handled once; the file-side sweep is idempotent and repeated on every unregister.
//! - BrokerCore splits file state and connection state behind independent locks; no code path holds both at once.
//!
//! # Key types
//!
//! | Type | Meaning | Constraints | Constructed / mutated in |
//! |---|---|---|---|
//! | [`BrokerCore`] | Authoritative broker state | MUST be the only owner of connection and file maps | `BrokerCore::*` |
//! | [`LockTable`] | Per-file exclusive lock | MUST have at most one holder per file | `BrokerCore::open_file`, `BrokerCore::close_file`, `BrokerCore::unregister_connection` |
//! | `FileState` | Locks, cached content and watcher sets | MUST only be accessed under the files lock | `BrokerCore::*` |
//! | `ConnectionEntry` | One connected client | MUST hold at most one [`RunHandle`] | `BrokerCore::register_connection`, `BrokerCore::start_run` |
//! | [`RunHandle`] | Control side of a running program | MUST be removed from the slot before `PROGRAM_FINISHED` is sent | `BrokerCore::start_run`, `BrokerCore::release_run_slot` |
//! | `RunSession` | Driver task for one program run | MUST join its output workers before reporting completion | `RunSession::drive` |
//!
//! # Invariants
//!
//! 1. A file MUST have at most one lock holder, and a connection's held set MUST equal the files it holds.
//!    - Enforced in: `LockTable::acquire`, `LockTable::release`, `LockTable::release_all`
//!    - Tested by: `core::lock_table::tests::interleaved_operations_keep_single_holder`
//!    - Failure symptom: two clients edit the same file and overwrite each other.
//!
//! 2. A denied lock request MUST NOT mutate lock or watcher state.
//!    - Enforced in: `BrokerCore::open_file`
//!    - Tested by: `core::tests::files::open_denied_leaves_no_watch`
//!    - Failure symptom: a rejected client keeps receiving updates for a file it never loaded.
//!
//! 3. Locks held by a disconnected connection MUST be acquirable by others on their next request.
//!    - Enforced in: `BrokerCore::unregister_connection` (file-side sweep runs even for an already removed entry)
//!    - Tested by: `core::tests::files::disconnect_releases_locks`, `core::tests::files::open_racing_unregister_is_swept_by_final_unregister`
//!    - Failure symptom: files stay locked forever after a client crash.
//!
//! 4. `UPDATE` MUST go to every watcher except the author and MUST carry exactly the written content.
//!    - Enforced in: `BrokerCore::edit_file`
//!    - Tested by: `core::tests::broadcast::holder_edit_reaches_other_watchers`, `core::tests::broadcast::unlocked_edit_reaches_watchers`
//!    - Failure symptom: editors echo their own keystrokes or miss remote changes.
//!
//! 5. A rejected edit MUST NOT change cached content, storage or watchers.
//!    - Enforced in: `BrokerCore::edit_file`
//!    - Tested by: `core::tests::broadcast::non_holder_edit_is_rejected_without_mutation`
//!    - Failure symptom: a reader overwrites the holder's buffer.
//!
//! 6. A failed send to a connection MUST trigger authoritative cleanup of that connection.
//!    - Enforced in: `BrokerCore::send_event`, `BrokerCore::edit_file`
//!    - Tested by: `core::tests::broadcast::dead_watcher_is_unregistered`
//!    - Failure symptom: a dead client keeps its locks and blocks every other editor.
//!
//! 7. A connection MUST own at most one active run.
//!    - Enforced in: `BrokerCore::start_run`
//!    - Tested by: `core::tests::runs::second_run_is_rejected`, `core::tests::runs::replace_policy_cancels_previous_run`
//!    - Failure symptom: output of two programs interleaves and stdin goes to the wrong process.
//!
//! 8. Run output MUST reach only the owning connection.
//!    - Enforced in: `run::forward_output`
//!    - Tested by: `core::tests::runs::interactive_echo_reaches_only_owner`
//!    - Failure symptom: other users see a program's output or input prompts.
//!
//! 9. A disconnect MUST terminate the connection's run (kill policy) within the grace period.
//!    - Enforced in: `BrokerCore::unregister_connection`, `run::terminate`
//!    - Tested by: `core::tests::runs::disconnect_kills_running_program`
//!    - Failure symptom: orphaned processes accumulate after clients drop.
//!
//! 10. The run slot MUST be released before `PROGRAM_FINISHED` is sent.
//!     - Enforced in: `RunSession::drive`
//!     - Tested by: `core::tests::runs::run_after_finish_is_accepted`
//!     - Failure symptom: a client that starts a new run right after `PROGRAM_FINISHED` gets `run_in_progress`.
//!
//! 11. File state and connection state MUST be protected by independent locks and no path may hold both.
//!     - Enforced in: `BrokerCore::open_file`, `BrokerCore::edit_file`, `BrokerCore::unregister_connection`
//!     - Tested by: review; `clippy::await_holding_lock` guards the async side.
//!     - Failure symptom: deadlock between a broadcast and a disconnect.
//!
//! # Concurrency and ordering
//!
//! - Each connection's reader dispatches commands one at a time, so edits from one connection apply in send order.
//! - Critical sections are synchronous `parking_lot` guards and never span an `.await`.
//! - Watcher sets store sink clones, so `UPDATE` fan-out happens under the files lock without touching connection state; broadcasts for one file are therefore serialized with its writes.
//! - Output lines within one stream keep emission order; stdout and stderr are not ordered relative to each other.
//! - Every run driver is tracked by a [`TaskTracker`] and its cancellation token is a child of the broker's shutdown token.
//!
//! # Failure modes and recovery
//!
//! - Client disconnect: the service drop unregisters the connection; locks and watches are released and the run is cancelled or detached per policy.
//! - Send failure: the dead connection is unregistered as if it disconnected.
//! - Build failure or unsupported extension: one terminal `OUTPUT` with `finished: true`; no process is spawned.
//! - Spawn failure: one terminal `OUTPUT` starting with `Error:`; the run is marked failed.
//! - Stuck program: SIGTERM to its process group, SIGKILL after the grace period, then a bounded reap.
//! - Storage failure on edit: `ERROR{io}` and the cached content is left unchanged.
//!
//! # Recipes
//!
//! ## Add a new client command
//!
//! - Extend `codeshare_proto::Command` and its name table.
//! - Add the `BrokerCore` operation and its tests under `core::tests`.
//! - Dispatch it in `BrokerService::dispatch`; the match is exhaustive, so the compiler points at it.
//!
//! ## Debug a stuck run
//!
//! - Set `CODESHARE_LOG_DIR` and `RUST_LOG=codeshare_broker=debug`.
//! - Inspect `codeshare-broker.<pid>.log` for `run` spans: build, spawn, exit, terminate and drain decisions.

mod broadcast;
mod connection;
mod files;
mod lock_table;
mod runs;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use codeshare_proto::{ConnectionId, RunId, ServerEvent};
pub use lock_table::{Acquire, LockTable, NotOwner};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::{BrokerConfig, SessionPolicy};
use crate::run::RunHandle;
use crate::storage::{FsWorkspace, Storage, StorageError};
use crate::toolchain::{ToolchainRunner, Toolchains};

/// Sink for sending events to a connected client.
pub type ConnectionSink = mpsc::UnboundedSender<ServerEvent>;

/// Name of the hidden directory that receives build artifacts.
pub const BUILD_DIR: &str = ".build";

/// Shared state for the broker.
///
/// File state and connection state are protected by independent locks so
/// edit fan-out never contends with run bookkeeping.
pub struct BrokerCore {
	files: Mutex<FileState>,
	connections: Mutex<ConnectionState>,
	storage: Arc<dyn Storage>,
	runner: Arc<dyn ToolchainRunner>,
	policy: SessionPolicy,
	next_connection_id: AtomicU64,
	next_run_id: AtomicU64,
	runs: TaskTracker,
	shutdown: CancellationToken,
}

impl std::fmt::Debug for BrokerCore {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("BrokerCore")
			.field("root", &self.storage.root())
			.field("policy", &self.policy)
			.field("runs", &self.runs.len())
			.finish_non_exhaustive()
	}
}

#[derive(Default)]
struct FileState {
	locks: LockTable,
	/// Cached authoritative content and watchers, keyed by file name.
	records: HashMap<String, FileRecord>,
	/// Reverse index of watched files per connection.
	watched: HashMap<ConnectionId, BTreeSet<String>>,
}

struct FileRecord {
	content: String,
	watchers: BTreeMap<ConnectionId, ConnectionSink>,
}

impl FileRecord {
	fn new(content: String) -> Self {
		Self {
			content,
			watchers: BTreeMap::new(),
		}
	}
}

#[derive(Default)]
struct ConnectionState {
	connections: HashMap<ConnectionId, ConnectionEntry>,
}

struct ConnectionEntry {
	sink: ConnectionSink,
	run: Option<RunHandle>,
}

impl BrokerCore {
	/// Creates a broker over a filesystem workspace using the configured toolchains.
	pub fn new(config: &BrokerConfig) -> Result<Arc<Self>, StorageError> {
		let workspace = FsWorkspace::open(&config.workspace)?;
		let runner = Toolchains::new(config.toolchain_table(), workspace.root().join(BUILD_DIR));
		Ok(Self::with_parts(
			config.session.clone(),
			Arc::new(workspace),
			Arc::new(runner),
		))
	}

	/// Creates a broker from explicit collaborators.
	#[must_use]
	pub fn with_parts(
		policy: SessionPolicy,
		storage: Arc<dyn Storage>,
		runner: Arc<dyn ToolchainRunner>,
	) -> Arc<Self> {
		Arc::new(Self {
			files: Mutex::new(FileState::default()),
			connections: Mutex::new(ConnectionState::default()),
			storage,
			runner,
			policy,
			next_connection_id: AtomicU64::new(1),
			next_run_id: AtomicU64::new(1),
			runs: TaskTracker::new(),
			shutdown: CancellationToken::new(),
		})
	}

	/// Active session policy.
	pub fn policy(&self) -> &SessionPolicy {
		&self.policy
	}

	/// Workspace root directory.
	pub fn workspace_root(&self) -> &Path {
		self.storage.root()
	}

	fn next_run_id(&self) -> RunId {
		RunId(self.next_run_id.fetch_add(1, Ordering::Relaxed))
	}

	/// Number of registered connections.
	#[doc(hidden)]
	pub fn connection_count(&self) -> usize {
		self.connections.lock().connections.len()
	}

	/// Number of run driver tasks that have not returned yet, detached runs included.
	#[doc(hidden)]
	pub fn run_driver_count(&self) -> usize {
		self.runs.len()
	}

	/// Current lock holder of `file`.
	pub fn lock_holder(&self, file: &str) -> Option<ConnectionId> {
		self.files.lock().locks.holder(file)
	}

	/// Connections currently watching `file`.
	#[doc(hidden)]
	pub fn watchers_of(&self, file: &str) -> Vec<ConnectionId> {
		self.files
			.lock()
			.records
			.get(file)
			.map(|r| r.watchers.keys().copied().collect())
			.unwrap_or_default()
	}
}

#[cfg(test)]
impl BrokerCore {
	fn assert_file_state_consistent(&self) {
		let files = self.files.lock();
		files.locks.assert_consistent();
		for (conn, names) in &files.watched {
			for name in names {
				assert!(
					files.records.get(name).is_some_and(|r| r.watchers.contains_key(conn)),
					"{conn} indexed as watching {name} but not in its watcher set"
				);
			}
		}
		for (name, record) in &files.records {
			for conn in record.watchers.keys() {
				assert!(files.watched.get(conn).is_some_and(|w| w.contains(name)));
			}
		}
	}
}
