//! WebSocket signaling link.
//!
//! Bridges a registry WebSocket endpoint onto the in-process [`ClientLink`]
//! queues the session actor reads and writes. One bridge task owns the
//! socket: it encodes outbound envelopes as text frames and decodes inbound
//! text frames into server messages. A frame that fails to decode is logged
//! and skipped. When the socket closes the inbound queue is dropped, which
//! the session observes as a closed link.

use crate::errors::LinkError;

use futures::{SinkExt, StreamExt};
use signaling_protocol::codec::{decode_server, encode_client};
use signaling_protocol::link::{ClientLink, CLIENT_QUEUE_CAPACITY};
use signaling_protocol::{ClientEnvelope, ServerMessage};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Connect to `url` and start the bridge task.
///
/// The task ends when either side closes or `cancel_token` fires.
pub async fn connect(
    url: &str,
    cancel_token: CancellationToken,
) -> Result<(ClientLink, JoinHandle<()>), LinkError> {
    info!(target: "session.link", url = %url, "Connecting to signaling server");

    let (ws_stream, _) = connect_async(url)
        .await
        .map_err(|e| LinkError::Connect(e.to_string()))?;

    info!(target: "session.link", "Connected to signaling server");

    let (mut write, mut read) = ws_stream.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ClientEnvelope>(CLIENT_QUEUE_CAPACITY);
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<ServerMessage>();

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel_token.cancelled() => {
                    debug!(target: "session.link", "Link cancelled");
                    break;
                }

                envelope = outbound_rx.recv() => {
                    let Some(envelope) = envelope else {
                        debug!(target: "session.link", "Session dropped the link");
                        break;
                    };
                    let text = match encode_client(&envelope) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(target: "session.link", error = %e, "Dropping unencodable frame");
                            continue;
                        }
                    };
                    if let Err(e) = write.send(Message::Text(text)).await {
                        warn!(target: "session.link", error = %e, "WebSocket write failed");
                        break;
                    }
                }

                frame = read.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => match decode_server(&text) {
                            Ok(message) => {
                                if inbound_tx.send(message).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!(target: "session.link", error = %e, "Skipping malformed frame");
                            }
                        },
                        Some(Ok(Message::Close(_))) | None => {
                            debug!(target: "session.link", "Server closed the socket");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(target: "session.link", error = %e, "WebSocket read failed");
                            break;
                        }
                    }
                }
            }
        }

        let _ = write.send(Message::Close(None)).await;
        info!(target: "session.link", "Signaling link closed");
    });

    Ok((
        ClientLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        },
        task,
    ))
}
