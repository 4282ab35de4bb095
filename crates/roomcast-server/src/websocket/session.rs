//! WebSocket session lifecycle: handles a single admitted client from
//! upgrade through disconnect.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{Sink, SinkExt, Stream, StreamExt};
use metrics::{counter, gauge, histogram};
use roomcast_core::TransportError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::connection::{Connection, Outbound};
use super::handler::MessageRouter;
use super::registry::{Admission, ConnectionRegistry};
use crate::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL,
};

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Client sent Close or the stream ended.
    ClientClosed,
    /// Transport error while reading.
    ReadError,
    /// The connection was closed from the server side (eviction, write failure).
    ServerClosed,
    /// Server shutdown.
    Shutdown,
}

/// Run a WebSocket session for an admitted client.
///
/// 1. Forwards queued frames to the socket (the welcome frame is already queued)
/// 2. Routes inbound text and binary frames through the [`MessageRouter`]
/// 3. Treats transport Ping/Pong as liveness
/// 4. Removes the connection from the registry on the way out
#[instrument(skip_all, fields(conn_id = %admission.connection.id))]
pub async fn run_ws_session(
    ws: WebSocket,
    admission: Admission,
    router: MessageRouter,
    registry: Arc<ConnectionRegistry>,
    write_timeout: Duration,
    shutdown: CancellationToken,
) {
    let Admission {
        connection,
        outbound,
    } = admission;
    let (ws_tx, ws_rx) = ws.split();

    let connection_start = std::time::Instant::now();
    info!("client connected");
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

    let writer = tokio::spawn(write_loop(
        ws_tx,
        outbound,
        connection.clone(),
        write_timeout,
        shutdown.clone(),
    ));

    let end = read_loop(ws_rx, &connection, &router, &registry, &shutdown).await;

    // Idempotent: the supervisor may have removed it already.
    let removed = registry.remove(&connection.id).is_some();
    info!(?end, removed, "client disconnected");
    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(connection_start.elapsed().as_secs_f64());

    connection.close();
    // Bounded by the write timeout.
    if let Err(e) = writer.await {
        debug!(error = %e, "writer task ended abnormally");
    }
}

/// Read frames until the client leaves, the connection is closed, or the
/// server shuts down.
pub(crate) async fn read_loop<S, E>(
    mut ws_rx: S,
    connection: &Connection,
    router: &MessageRouter,
    registry: &ConnectionRegistry,
    shutdown: &CancellationToken,
) -> SessionEnd
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let closed = connection.close_token();
    loop {
        let msg = tokio::select! {
            () = closed.cancelled() => return SessionEnd::ServerClosed,
            () = shutdown.cancelled() => return SessionEnd::Shutdown,
            msg = ws_rx.next() => msg,
        };

        let msg = match msg {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                debug!(error = %e, "websocket read failed");
                return SessionEnd::ReadError;
            }
            None => return SessionEnd::ClientClosed,
        };

        let outcome = match msg {
            Message::Text(ref t) => router.dispatch(connection, t.as_str()).map(drop),
            Message::Binary(ref data) => match std::str::from_utf8(data) {
                Ok(text) => router.dispatch(connection, text).map(drop),
                Err(_) => {
                    let result = router.handle_undecodable(connection, data.len());
                    connection.send_frame(&result.reply)
                }
            },
            Message::Ping(_) | Message::Pong(_) => {
                let _ = registry.mark_seen(&connection.id);
                Ok(())
            }
            Message::Close(_) => {
                debug!("client sent close frame");
                return SessionEnd::ClientClosed;
            }
        };

        if let Err(e) = outcome {
            debug!(error = %e, "reply not queued");
        }
    }
}

/// Drain the outbound queue into the socket.
///
/// A write that fails or outlasts `write_timeout` closes the connection.
pub(crate) async fn write_loop<S>(
    mut ws_tx: S,
    mut outbound: mpsc::Receiver<Outbound>,
    connection: Arc<Connection>,
    write_timeout: Duration,
    shutdown: CancellationToken,
) where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let closed = connection.close_token();
    loop {
        let item = tokio::select! {
            biased;
            () = shutdown.cancelled() => {
                let _ = tokio::time::timeout(write_timeout, ws_tx.send(Message::Close(None))).await;
                break;
            }
            () = closed.cancelled() => {
                // Cleanup on shutdown may close the connection before this
                // loop observes the shutdown token.
                if shutdown.is_cancelled() {
                    let _ = tokio::time::timeout(write_timeout, ws_tx.send(Message::Close(None))).await;
                }
                break;
            }
            item = outbound.recv() => item,
        };
        let Some(item) = item else { break };

        if let Err(e) = write_item(&mut ws_tx, item, write_timeout).await {
            warn!(conn_id = %connection.id, error = %e, "write failed, closing connection");
            connection.close();
            break;
        }
    }
}

async fn write_item<S>(ws_tx: &mut S, item: Outbound, limit: Duration) -> Result<(), TransportError>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    match item {
        Outbound::Text(text) => send_bounded(ws_tx, Message::Text(text.to_string().into()), limit).await,
        Outbound::Heartbeat(text) => {
            send_bounded(ws_tx, Message::Text(text.to_string().into()), limit).await?;
            send_bounded(ws_tx, Message::Ping(vec![].into()), limit).await
        }
    }
}

async fn send_bounded<S>(ws_tx: &mut S, msg: Message, limit: Duration) -> Result<(), TransportError>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    match tokio::time::timeout(limit, ws_tx.send(msg)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(TransportError::Socket(e.to_string())),
        Err(_) => Err(TransportError::WriteTimeout(limit)),
    }
}
