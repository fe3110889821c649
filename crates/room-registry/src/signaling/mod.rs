//! WebSocket signaling endpoint.
//!
//! Each upgraded socket is bridged onto a [`ServerLink`]: a reader loop
//! decodes text frames into the link's inbound queue, and a writer task
//! drains the outbound queue into the socket. The registry's
//! `ConnectionActor` sits on the other side of the link.
//!
//! A frame that fails to decode is answered with an `invalidRequest`
//! error event; the socket stays open.

use crate::actors::RegistryActorHandle;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use signaling_protocol::codec::{decode_client, encode_server};
use signaling_protocol::link::{OutboundSender, ServerLink, CLIENT_QUEUE_CAPACITY};
use signaling_protocol::{ErrorKind, ServerEvent, ServerMessage};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Router serving `GET /ws`.
pub fn signaling_router(registry: RegistryActorHandle) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(registry)
}

async fn ws_handler(ws: WebSocketUpgrade, State(registry): State<RegistryActorHandle>) -> Response {
    ws.on_upgrade(move |socket| serve_socket(socket, registry))
}

/// Serve one signaling socket until either side closes it.
pub async fn serve_socket(socket: WebSocket, registry: RegistryActorHandle) {
    let (sink, mut stream) = socket.split();

    let (inbound_tx, inbound_rx) = mpsc::channel(CLIENT_QUEUE_CAPACITY);
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let outbound = OutboundSender::new(outbound_tx);

    let writer_done = CancellationToken::new();
    let writer = tokio::spawn(write_frames(sink, outbound_rx, writer_done.clone()));

    let (handle, mut connection_task) = registry.accept(ServerLink {
        inbound: inbound_rx,
        outbound: outbound.clone(),
    });

    info!(
        target: "rr.signaling",
        connection_id = %handle.connection_id(),
        "Signaling socket opened"
    );

    let mut connection_finished = false;
    loop {
        tokio::select! {
            result = &mut connection_task => {
                log_connection_exit(result);
                connection_finished = true;
                break;
            }

            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if !forward_frame(&text, &inbound_tx, &outbound).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        reject_frame(&outbound, "binary frames are not supported");
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(target: "rr.signaling", error = %e, "Socket read failed");
                        break;
                    }
                }
            }
        }
    }

    // Closing the inbound queue is the connection actor's disconnect signal.
    drop(inbound_tx);
    if !connection_finished {
        log_connection_exit(connection_task.await);
    }

    writer_done.cancel();
    if let Err(e) = writer.await {
        warn!(target: "rr.signaling", error = ?e, "Socket writer task failed");
    }

    info!(
        target: "rr.signaling",
        connection_id = %handle.connection_id(),
        "Signaling socket closed"
    );
}

/// Decode and enqueue one text frame. Returns `false` once the connection
/// actor is gone.
async fn forward_frame(
    text: &str,
    inbound: &mpsc::Sender<signaling_protocol::ClientEnvelope>,
    outbound: &OutboundSender,
) -> bool {
    match decode_client(text) {
        Ok(envelope) => inbound.send(envelope).await.is_ok(),
        Err(e) => {
            debug!(target: "rr.signaling", error = %e, "Rejecting malformed frame");
            reject_frame(outbound, "Malformed signaling frame");
            true
        }
    }
}

fn reject_frame(outbound: &OutboundSender, message: &str) {
    outbound.send_event(ServerEvent::Error {
        message: message.to_string(),
        kind: ErrorKind::InvalidRequest,
        role: None,
    });
}

/// Drain the outbound queue into the socket.
///
/// Room actors keep clones of the outbound sender, so the queue does not
/// close on its own; `done` ends the task once whatever is queued has
/// been flushed.
async fn write_frames(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::UnboundedReceiver<ServerMessage>,
    done: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            message = outbound.recv() => message,
            () = done.cancelled() => outbound.try_recv().ok(),
        };
        let Some(message) = message else {
            break;
        };

        let text = match encode_server(&message) {
            Ok(text) => text,
            Err(e) => {
                warn!(target: "rr.signaling", error = %e, "Dropping unencodable frame");
                continue;
            }
        };

        if let Err(e) = sink.send(Message::Text(text)).await {
            debug!(target: "rr.signaling", error = %e, "Socket write failed");
            break;
        }
    }

    let _ = sink.close().await;
}

fn log_connection_exit(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            warn!(target: "rr.signaling", error = ?e, "Connection actor panicked");
        }
    }
}
