//! Program runs: build, spawn, stream and tear down one subprocess.
//!
//! A [`RunSession`] is driven by one task. It prepares the command through the
//! [`ToolchainRunner`], spawns the program in its own process group with piped
//! stdio, and runs three workers in a [`JoinSet`]: a stdout reader, a stderr
//! reader and a stdin writer. The broker keeps the matching [`RunHandle`] in
//! the owning connection's run slot to forward input and request
//! cancellation.

mod output;

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use codeshare_proto::{ConnectionId, RunId, RunOutcome, ServerEvent};
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
pub use output::LineSplitter;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::core::BrokerCore;
use crate::toolchain::{ToolchainError, ToolchainRunner};

/// Bound on waiting for a killed process to be reaped.
const REAP_TIMEOUT: Duration = Duration::from_secs(1);

/// Bound on draining output after the process has exited.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

const READ_BUF: usize = 8 * 1024;

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
	/// Building or about to spawn.
	Starting,
	/// The process is alive.
	Running {
		/// OS process id, also the process group id.
		pid: u32,
	},
	/// The run ended after a build failure, an exit or a cancellation.
	Finished,
	/// The program could not be started.
	Failed,
}

impl RunState {
	/// True for [`RunState::Finished`] and [`RunState::Failed`].
	pub fn is_terminal(self) -> bool {
		matches!(self, Self::Finished | Self::Failed)
	}
}

/// Why a run was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
	/// `STOP_PROGRAM`.
	Stopped,
	/// A new `RUN` replaced this one.
	Replaced,
	/// The owning connection went away.
	Disconnected,
	/// The broker is shutting down.
	Shutdown,
}

/// Control side of a run, stored in the owning connection's run slot.
#[derive(Debug)]
pub struct RunHandle {
	id: RunId,
	input: mpsc::UnboundedSender<String>,
	cancel: CancellationToken,
	reason: Arc<OnceLock<CancelReason>>,
	state: watch::Receiver<RunState>,
}

impl RunHandle {
	/// Run identifier.
	pub fn id(&self) -> RunId {
		self.id
	}

	/// Current lifecycle state.
	pub fn state(&self) -> RunState {
		*self.state.borrow()
	}

	/// Queues one input line for the program's stdin.
	///
	/// Input arriving after stdin has closed is dropped.
	pub fn send_input(&self, line: String) {
		if self.input.send(line).is_err() {
			tracing::debug!(run = %self.id, "stdin closed, dropping input");
		}
	}

	/// Requests cancellation. The first reason recorded wins.
	pub fn cancel(&self, reason: CancelReason) {
		let _ = self.reason.set(reason);
		self.cancel.cancel();
	}

	/// Returns a receiver that observes state transitions.
	pub fn subscribe(&self) -> watch::Receiver<RunState> {
		self.state.clone()
	}
}

/// Waits until `state` reaches a terminal state or `limit` elapses.
///
/// Returns `true` when the run finished in time.
pub async fn wait_terminal(mut state: watch::Receiver<RunState>, limit: Duration) -> bool {
	tokio::time::timeout(limit, state.wait_for(|s| s.is_terminal()))
		.await
		.is_ok_and(|r| r.is_ok())
}

/// Parameters for a new run.
#[derive(Debug)]
pub(crate) struct RunRequest {
	pub id: RunId,
	pub conn: ConnectionId,
	pub source: PathBuf,
	pub batch_input: Option<String>,
	pub timeout: Option<Duration>,
	pub grace: Duration,
}

/// Driver side of a run. Consumed by [`RunSession::drive`].
pub(crate) struct RunSession {
	req: RunRequest,
	core: Arc<BrokerCore>,
	runner: Arc<dyn ToolchainRunner>,
	input_rx: mpsc::UnboundedReceiver<String>,
	cancel: CancellationToken,
	reason: Arc<OnceLock<CancelReason>>,
	state: watch::Sender<RunState>,
}

impl RunSession {
	/// Creates the driver and its handle. `cancel` should be a child of the broker's shutdown token.
	pub(crate) fn new(
		req: RunRequest,
		core: Arc<BrokerCore>,
		runner: Arc<dyn ToolchainRunner>,
		cancel: CancellationToken,
	) -> (Self, RunHandle) {
		let (input_tx, input_rx) = mpsc::unbounded_channel();
		let (state_tx, state_rx) = watch::channel(RunState::Starting);
		let reason = Arc::new(OnceLock::new());
		let handle = RunHandle {
			id: req.id,
			input: input_tx,
			cancel: cancel.clone(),
			reason: reason.clone(),
			state: state_rx,
		};
		let session = Self {
			req,
			core,
			runner,
			input_rx,
			cancel,
			reason,
			state: state_tx,
		};
		(session, handle)
	}

	/// Runs the program to completion or cancellation.
	///
	/// Emits exactly one terminal message: a final `OUTPUT` when no process
	/// was spawned, otherwise `PROGRAM_FINISHED`. The run slot is released
	/// before that message is sent.
	pub(crate) async fn drive(self) {
		let span = tracing::info_span!("run", run = %self.req.id, conn = %self.req.conn);
		self.drive_inner().instrument(span).await;
	}

	async fn drive_inner(self) {
		let Self {
			req,
			core,
			runner,
			input_rx,
			cancel,
			reason,
			state,
		} = self;
		let conn = req.conn;
		let deadline = req.timeout.map(|limit| Instant::now() + limit);

		let prepared = tokio::select! {
			biased;
			_ = cancel.cancelled() => {
				tracing::info!(reason = ?reason.get(), "cancelled during build");
				finish(&core, &req, &state, RunState::Finished, ServerEvent::ProgramFinished {
					run_id: req.id,
					status: RunOutcome::Cancelled,
					exit_code: None,
					finished: true,
				});
				return;
			}
			_ = until(deadline) => {
				tracing::info!(limit = ?req.timeout, "run timed out during build");
				finish(&core, &req, &state, RunState::Finished, ServerEvent::ProgramFinished {
					run_id: req.id,
					status: RunOutcome::TimedOut,
					exit_code: None,
					finished: true,
				});
				return;
			}
			res = runner.prepare(&req.source) => res,
		};

		let prepared = match prepared {
			Ok(p) => p,
			Err(err @ (ToolchainError::BuildFailed { .. } | ToolchainError::Unsupported(_))) => {
				tracing::info!(error = %err, "run aborted before spawn");
				finish(&core, &req, &state, RunState::Finished, ServerEvent::final_output(err.to_string()));
				return;
			}
			Err(err @ ToolchainError::Spawn { .. }) => {
				tracing::warn!(error = %err, "build tool failed to start");
				finish(
					&core,
					&req,
					&state,
					RunState::Failed,
					ServerEvent::final_output(format!("Error: {err}")),
				);
				return;
			}
		};

		let mut child = match tokio::process::Command::new(&prepared.program)
			.args(&prepared.args)
			.current_dir(&prepared.cwd)
			.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.kill_on_drop(true)
			.process_group(0)
			.spawn()
		{
			Ok(child) => child,
			Err(err) => {
				tracing::warn!(program = %prepared.program, error = %err, "failed to spawn program");
				finish(
					&core,
					&req,
					&state,
					RunState::Failed,
					ServerEvent::final_output(format!(
						"Error: failed to start {}: {err}",
						prepared.program
					)),
				);
				return;
			}
		};

		let pid = child.id();
		tracing::info!(?pid, program = %prepared.program, "program started");
		if let Some(pid) = pid {
			state.send_replace(RunState::Running { pid });
		}
		core.send_event(conn, ServerEvent::ProgramStarted { run_id: req.id });

		let exited = Arc::new(AtomicBool::new(false));
		let stop_input = CancellationToken::new();
		let mut workers = JoinSet::new();
		if let Some(stdout) = child.stdout.take() {
			workers.spawn(forward_output(stdout, core.clone(), conn).in_current_span());
		}
		if let Some(stderr) = child.stderr.take() {
			workers.spawn(forward_output(stderr, core.clone(), conn).in_current_span());
		}
		if let Some(stdin) = child.stdin.take() {
			workers.spawn(
				feed_input(
					stdin,
					input_rx,
					req.batch_input.clone(),
					exited.clone(),
					stop_input.clone(),
				)
				.in_current_span(),
			);
		}

		let (status, exit_code) = tokio::select! {
			res = child.wait() => {
				match res {
					Ok(status) => {
						tracing::info!(%status, "program exited");
						(RunOutcome::Exited, status.code())
					}
					Err(err) => {
						tracing::error!(error = %err, "failed to wait on program");
						(RunOutcome::Exited, None)
					}
				}
			}
			_ = cancel.cancelled() => {
				tracing::info!(reason = ?reason.get().copied().unwrap_or(CancelReason::Shutdown), "terminating program");
				terminate(&mut child, pid, req.grace).await;
				(RunOutcome::Cancelled, None)
			}
			_ = until(deadline) => {
				tracing::info!(limit = ?req.timeout, "run timed out");
				terminate(&mut child, pid, req.grace).await;
				(RunOutcome::TimedOut, None)
			}
		};
		exited.store(true, Ordering::Release);
		stop_input.cancel();

		let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
			while let Some(res) = workers.join_next().await {
				if let Err(err) = res {
					tracing::warn!(error = %err, "run worker failed");
				}
			}
		})
		.await;
		if drained.is_err() {
			tracing::warn!("output still open after exit, killing process group");
			signal_group(pid, Signal::SIGKILL);
			workers.shutdown().await;
		}

		finish(
			&core,
			&req,
			&state,
			RunState::Finished,
			ServerEvent::ProgramFinished {
				run_id: req.id,
				status,
				exit_code,
				finished: true,
			},
		);
	}
}

/// Resolves at `deadline`, or never when the run is unbounded.
async fn until(deadline: Option<Instant>) {
	match deadline {
		Some(at) => tokio::time::sleep_until(at).await,
		None => std::future::pending().await,
	}
}

/// Marks the run terminal, frees the slot, then sends the terminal message.
fn finish(
	core: &BrokerCore,
	req: &RunRequest,
	state: &watch::Sender<RunState>,
	terminal: RunState,
	event: ServerEvent,
) {
	core.release_run_slot(req.conn, req.id);
	core.send_event(req.conn, event);
	state.send_replace(terminal);
}

fn signal_group(pid: Option<u32>, signal: Signal) {
	let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
		return;
	};
	if let Err(err) = killpg(Pid::from_raw(pid), signal) {
		tracing::debug!(pid, ?signal, error = %err, "killpg failed");
	}
}

/// Terminates the program: SIGTERM to its group, SIGKILL after `grace`, then a bounded reap.
async fn terminate(child: &mut Child, pid: Option<u32>, grace: Duration) {
	signal_group(pid, Signal::SIGTERM);
	if tokio::time::timeout(grace, child.wait()).await.is_ok() {
		return;
	}
	tracing::warn!(?pid, ?grace, "program ignored SIGTERM, killing");
	signal_group(pid, Signal::SIGKILL);
	let _ = child.start_kill();
	let _ = tokio::time::timeout(REAP_TIMEOUT, child.wait()).await;
}

/// Reads one pipe until EOF and forwards it to the owning connection.
///
/// When the connection is gone the reader keeps draining so the program never
/// blocks on a full pipe.
async fn forward_output<R>(mut pipe: R, core: Arc<BrokerCore>, conn: ConnectionId)
where
	R: AsyncRead + Unpin,
{
	let mut splitter = LineSplitter::default();
	let mut buf = vec![0u8; READ_BUF];
	let mut forwarding = true;

	loop {
		let n = match pipe.read(&mut buf).await {
			Ok(0) => break,
			Ok(n) => n,
			Err(err) => {
				tracing::debug!(error = %err, "output pipe read failed");
				break;
			}
		};
		for chunk in splitter.push(&buf[..n]) {
			if forwarding && !core.send_event(conn, ServerEvent::output(chunk)) {
				tracing::debug!("owner gone, discarding further output");
				forwarding = false;
			}
		}
	}

	if forwarding && let Some(rest) = splitter.finish() {
		core.send_event(conn, ServerEvent::output(rest));
	}
}

/// Writes queued input to the program's stdin.
///
/// With a batch, writes it once and closes stdin. Otherwise drains the queue
/// in order, appending a newline when missing, until the queue closes or the
/// program exits.
async fn feed_input(
	mut stdin: ChildStdin,
	mut queue: mpsc::UnboundedReceiver<String>,
	batch: Option<String>,
	exited: Arc<AtomicBool>,
	stop: CancellationToken,
) {
	if let Some(batch) = batch {
		if let Err(err) = stdin.write_all(batch.as_bytes()).await {
			tracing::debug!(error = %err, "batch input not delivered");
		}
		return;
	}

	loop {
		let line = tokio::select! {
			_ = stop.cancelled() => break,
			line = queue.recv() => match line {
				Some(line) => line,
				None => break,
			},
		};

		if exited.load(Ordering::Acquire) {
			break;
		}

		let mut line = line;
		if !line.ends_with('\n') {
			line.push('\n');
		}
		let res = async {
			stdin.write_all(line.as_bytes()).await?;
			stdin.flush().await
		}
		.await;
		if let Err(err) = res {
			if err.kind() == std::io::ErrorKind::BrokenPipe {
				tracing::debug!("stdin closed by program");
			} else {
				tracing::warn!(error = %err, "stdin write failed");
			}
			break;
		}
	}
}
