//! Per-socket pump between an axum WebSocket and its connection actor.

use std::{net::SocketAddr, sync::Arc};

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::{connection::TransportId, relay::Relay};

/// Drive one WebSocket until either side closes it.
///
/// Inbound frames go to [`crate::connection::Connection::receive`]; encoded
/// replies come back over the connection's outbox. When the relay closes the
/// outbox, everything already queued is flushed before the Close frame.
pub async fn process(socket: WebSocket, peer: SocketAddr, relay: Arc<Relay>) {
    let transport = TransportId(peer);
    let (tx, mut outbox) = mpsc::unbounded_channel::<String>();
    let (mut sink, mut stream) = socket.split();
    let Some(conn) = relay.hub().register(transport, tx) else {
        let _ = sink.send(Message::Close(None)).await;
        return;
    };

    loop {
        tokio::select! {
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => conn.receive(text.as_bytes()),
                Some(Ok(Message::Binary(bytes))) => conn.receive(&bytes),
                Some(Ok(Message::Close(_))) | None => break,
                // axum answers pings itself
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(%transport, %err, "websocket error");
                    break;
                }
            },
            outbound = outbox.recv() => match outbound {
                Some(text) => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
        }
    }
    conn.disconnect();
    info!(%transport, "connection closed");
}
