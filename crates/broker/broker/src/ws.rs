//! WebSocket transport for the broker.
//!
//! Each socket gets a [`BrokerService`]. The reader loop dispatches frames in
//! arrival order; a separate writer task drains the connection's event channel
//! so a slow client never stalls command handling for others.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use codeshare_proto::ServerEvent;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::BrokerCore;
use crate::service::BrokerService;

/// Bound on flushing queued events after the reader loop ends.
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Shared state handed to every request handler.
#[derive(Clone, Debug)]
pub struct AppState {
	/// Broker core.
	pub core: Arc<BrokerCore>,
	/// Cancelled when the server shuts down; open sockets close on it.
	pub shutdown: CancellationToken,
}

#[derive(Serialize)]
struct HealthResponse {
	status: &'static str,
}

async fn health() -> Json<HealthResponse> {
	Json(HealthResponse { status: "ok" })
}

/// Builds the HTTP router: `/ws` and `/` upgrade to the command socket, `/health` reports liveness.
pub fn router(core: Arc<BrokerCore>, shutdown: CancellationToken) -> Router {
	Router::new()
		.route("/", get(ws_upgrade))
		.route("/ws", get(ws_upgrade))
		.route("/health", get(health))
		.with_state(AppState { core, shutdown })
}

/// Serves the broker on `listener` until `shutdown` is cancelled.
///
/// # Errors
///
/// Returns an error if the listener fails.
pub async fn serve(
	listener: TcpListener,
	core: Arc<BrokerCore>,
	shutdown: CancellationToken,
) -> std::io::Result<()> {
	let addr = listener.local_addr()?;
	tracing::info!(%addr, "Broker WebSocket server listening");
	let app = router(core, shutdown.clone());
	axum::serve(listener, app)
		.with_graceful_shutdown(shutdown.cancelled_owned())
		.await?;
	tracing::info!("Broker WebSocket server shutting down");
	Ok(())
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
	ws.on_upgrade(move |socket| handle_connection(socket, state))
}

/// Handle a single WebSocket connection from a client.
async fn handle_connection(socket: WebSocket, state: AppState) {
	let (mut ws_tx, mut ws_rx) = socket.split();
	let (events_tx, mut events_rx) = mpsc::unbounded_channel::<ServerEvent>();
	let service = BrokerService::new(state.core.clone(), events_tx);
	let conn = service.connection_id();
	tracing::info!(%conn, "New broker connection");

	let writer = tokio::spawn(async move {
		while let Some(event) = events_rx.recv().await {
			let text = match serde_json::to_string(&event) {
				Ok(text) => text,
				Err(err) => {
					tracing::error!(%conn, error = %err, "failed to encode event");
					continue;
				}
			};
			if ws_tx.send(Message::Text(text)).await.is_err() {
				break;
			}
		}
		let _ = ws_tx.send(Message::Close(None)).await;
	});

	loop {
		tokio::select! {
			_ = state.shutdown.cancelled() => {
				tracing::debug!(%conn, "closing connection for shutdown");
				break;
			}
			msg = ws_rx.next() => {
				match msg {
					Some(Ok(Message::Text(text))) => service.handle_text(&text),
					Some(Ok(Message::Binary(bytes))) => {
						service.handle_text(&String::from_utf8_lossy(&bytes));
					}
					Some(Ok(Message::Close(_))) | None => break,
					Some(Ok(_)) => continue,
					Some(Err(err)) => {
						tracing::debug!(%conn, error = %err, "WebSocket read failed");
						break;
					}
				}
			}
		}
	}

	drop(service);
	if tokio::time::timeout(WRITER_FLUSH_TIMEOUT, writer).await.is_err() {
		tracing::debug!(%conn, "writer did not flush before timeout");
	}
	tracing::info!(%conn, "Broker connection closed");
}
