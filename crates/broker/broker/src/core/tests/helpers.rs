//! Common test utilities and helpers.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use codeshare_proto::{ConnectionId, ServerEvent};
use tokio::sync::mpsc;

use crate::config::{SessionPolicy, ToolchainSpec};
use crate::core::{BUILD_DIR, BrokerCore};
use crate::storage::{FsWorkspace, Storage};
use crate::toolchain::Toolchains;

/// Echoes each stdin line back on stdout.
pub const ECHO_SH: &str = "while IFS= read -r line; do printf '%s\\n' \"$line\"; done\n";

/// Prints its pid, then loops until killed.
pub const LOOP_SH: &str = "echo \"$$\"\nwhile :; do sleep 0.1; done\n";

/// Like [`LOOP_SH`] but ignores SIGTERM.
pub const STUBBORN_SH: &str = "trap '' TERM\necho \"$$\"\nwhile :; do sleep 0.1; done\n";

/// Waits for stdin to close, then writes far more than a pipe buffer holds.
pub const FLOOD_SH: &str = "echo \"$$\"\nread -r _ || :\nyes flood | head -n 50000\n";

/// A test harness that captures events sent to a connection.
pub struct TestConnection {
	pub conn: ConnectionId,
	pub events_rx: mpsc::UnboundedReceiver<ServerEvent>,
}

impl TestConnection {
	/// Register a new connection with the core.
	pub fn connect(core: &BrokerCore) -> Self {
		let (tx, rx) = mpsc::unbounded_channel();
		let conn = core.register_connection(tx);
		Self {
			conn,
			events_rx: rx,
		}
	}

	/// Try to receive an event, returning None if none available.
	pub fn try_recv(&mut self) -> Option<ServerEvent> {
		self.events_rx.try_recv().ok()
	}

	/// Wait briefly for an event.
	pub async fn recv_timeout(&mut self) -> Option<ServerEvent> {
		tokio::time::timeout(Duration::from_millis(100), self.events_rx.recv())
			.await
			.ok()
			.flatten()
	}

	/// Wait for the next event, failing the test after a generous bound.
	pub async fn next_event(&mut self) -> ServerEvent {
		tokio::time::timeout(Duration::from_secs(10), self.events_rx.recv())
			.await
			.expect("timed out waiting for event")
			.expect("event channel closed")
	}

	/// Collects events up to and including the run's terminal message.
	pub async fn collect_run(&mut self) -> Vec<ServerEvent> {
		let mut events = Vec::new();
		loop {
			let event = self.next_event().await;
			let terminal = matches!(
				event,
				ServerEvent::ProgramFinished { .. } | ServerEvent::Output { finished: true, .. }
			);
			events.push(event);
			if terminal {
				return events;
			}
		}
	}

	/// Waits for an output line and parses it as a pid.
	pub async fn next_pid(&mut self) -> i32 {
		match self.next_event().await {
			ServerEvent::Output { output, .. } => output.trim().parse().expect("pid line"),
			other => panic!("expected pid output, got {other:?}"),
		}
	}
}

/// Broker core over a temporary workspace populated with fixtures.
pub struct TestBroker {
	pub core: Arc<BrokerCore>,
	pub dir: tempfile::TempDir,
}

impl TestBroker {
	pub fn new(policy: SessionPolicy) -> Self {
		let dir = tempfile::tempdir().expect("tempdir");
		let workspace = FsWorkspace::open(dir.path()).expect("workspace");
		for (name, content) in [
			("x.py", "print('v1')\n"),
			("shared.py", "v1"),
			("echo.sh", ECHO_SH),
			("loop.sh", LOOP_SH),
			("stubborn.sh", STUBBORN_SH),
			("mixed.sh", "echo out\necho err >&2\nexit 3\n"),
			("bad.c", "int main(\n"),
			("notes.txt", "hello\n"),
			("ghost.bin", ""),
			("flood.sh", FLOOD_SH),
			("wait.slow", ""),
		] {
			workspace.write(name, content).expect("fixture");
		}

		let runner = Toolchains::new(test_toolchains(), workspace.root().join(BUILD_DIR));
		let core = BrokerCore::with_parts(policy, Arc::new(workspace), Arc::new(runner));
		Self { core, dir }
	}

	pub fn path(&self, name: &str) -> PathBuf {
		self.dir.path().join(name)
	}

	pub fn read(&self, name: &str) -> String {
		std::fs::read_to_string(self.path(name)).expect("read fixture")
	}
}

/// Short grace period so cancellation tests stay fast.
pub fn fast_policy() -> SessionPolicy {
	SessionPolicy {
		kill_grace_ms: 300,
		..SessionPolicy::default()
	}
}

fn argv(parts: &[&str]) -> Vec<String> {
	parts.iter().map(|s| s.to_string()).collect()
}

fn test_toolchains() -> BTreeMap<String, ToolchainSpec> {
	let mut table = BTreeMap::new();
	table.insert(
		"sh".to_string(),
		ToolchainSpec {
			build: None,
			run: argv(&["sh", "{file}"]),
			template: Some("echo hello\n".to_string()),
		},
	);
	table.insert(
		"py".to_string(),
		ToolchainSpec {
			build: None,
			run: argv(&["sh", "-c", "cat \"$0\"", "{file}"]),
			template: Some("print(\"Hello, World!\")\n".to_string()),
		},
	);
	table.insert(
		"c".to_string(),
		ToolchainSpec {
			build: Some(argv(&[
				"sh",
				"-c",
				"echo \"$0:1:10: error: expected declaration\" >&2; exit 1",
				"{file}",
			])),
			run: argv(&["{out}"]),
			template: None,
		},
	);
	// The build step records its pid next to the source, then hangs.
	table.insert(
		"slow".to_string(),
		ToolchainSpec {
			build: Some(argv(&["sh", "-c", "echo $$ > \"$0.pid\"; exec sleep 30", "{file}"])),
			run: argv(&["true"]),
			template: None,
		},
	);
	table.insert(
		"bin".to_string(),
		ToolchainSpec {
			build: None,
			run: argv(&["/nonexistent/codeshare-missing-program"]),
			template: None,
		},
	);
	table
}

impl TestBroker {
	/// Waits for the pid the `slow` build step writes for `name`.
	pub async fn build_pid(&self, name: &str) -> i32 {
		let path = self.path(&format!("{name}.pid"));
		let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
		loop {
			if let Ok(text) = std::fs::read_to_string(&path)
				&& let Ok(pid) = text.trim().parse()
			{
				return pid;
			}
			assert!(tokio::time::Instant::now() < deadline, "build never started");
			tokio::time::sleep(Duration::from_millis(25)).await;
		}
	}
}

/// Polls until every run driver has returned or `limit` elapses.
pub async fn wait_runs_drained(core: &BrokerCore, limit: Duration) -> bool {
	let deadline = tokio::time::Instant::now() + limit;
	while core.run_driver_count() > 0 {
		if tokio::time::Instant::now() >= deadline {
			return false;
		}
		tokio::time::sleep(Duration::from_millis(25)).await;
	}
	true
}

/// True while a process with `pid` exists.
pub fn pid_alive(pid: i32) -> bool {
	nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

/// Polls until `pid` is gone or `limit` elapses.
pub async fn wait_pid_gone(pid: i32, limit: Duration) -> bool {
	let deadline = tokio::time::Instant::now() + limit;
	while tokio::time::Instant::now() < deadline {
		if !pid_alive(pid) {
			return true;
		}
		tokio::time::sleep(Duration::from_millis(25)).await;
	}
	!pid_alive(pid)
}
