use std::borrow::Cow;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use pairline_core::{ProtocolError, SignalingMessage};
use tracing::{debug, info, warn};

use crate::{
    relay::{Outbound, Relay},
    AppState,
};

pub(crate) async fn ws_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let relay = state.relay.clone();
    ws.on_upgrade(move |socket| handle_connection(socket, relay))
}

async fn handle_connection(socket: WebSocket, relay: Relay) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (mut connection, mut rx) = relay.open_connection();
    let connection_id = connection.id();
    counter!("pairline_relay_connections_total", 1);
    info!(connection_id = %connection_id, "signaling connection opened");

    let writer = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Signal(message) => {
                    let text = match message.encode() {
                        Ok(text) => text,
                        Err(err) => {
                            warn!(connection_id = %connection_id, error = %err, "failed to encode frame");
                            continue;
                        }
                    };
                    if ws_tx.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close { reason } => {
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::POLICY,
                            reason: Cow::Borrowed(reason),
                        })))
                        .await;
                    break;
                }
            }
        }
        debug!(connection_id = %connection_id, "writer task finished");
    });

    while let Some(frame) = ws_rx.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                warn!(connection_id = %connection_id, error = %err, "error receiving frame");
                break;
            }
        };
        relay.touch(&connection);

        let decoded = match frame {
            Message::Text(text) => SignalingMessage::decode(&text),
            Message::Binary(bytes) => SignalingMessage::decode_bytes(&bytes),
            Message::Close(frame) => {
                info!(
                    connection_id = %connection_id,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "client closed websocket"
                );
                break;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        match decoded {
            Ok(message) => relay.handle(&mut connection, message),
            Err(ProtocolError::UnknownType(kind)) => {
                counter!("pairline_relay_unhandled_messages_total", 1);
                warn!(connection_id = %connection_id, message_type = %kind, "unhandled message type");
            }
            Err(err) => {
                counter!("pairline_relay_malformed_messages_total", 1);
                warn!(connection_id = %connection_id, error = %err, "ignoring malformed frame");
            }
        }
    }

    relay.disconnect(&connection);
    writer.abort();
    info!(
        connection_id = %connection_id,
        peer_id = ?connection.peer_id().map(|id| id.as_str()),
        "signaling connection closed"
    );
}
