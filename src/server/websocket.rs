//! Websocket transport for token streaming

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::stream::Stream;
use futures::StreamExt;
use tokio::sync::mpsc;

use super::handlers::AppState;
use crate::stream::{ClientId, Frame};

/// Upgrade to a websocket carrying the streaming chat protocol
pub async fn ws_chat(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let client = ClientId::new();
    let outbox = state.registry().register(client);
    let (sink, mut inbound) = socket.split();

    let writer = tokio::spawn(async move {
        if let Err(e) = outbound(outbox).forward(sink).await {
            tracing::debug!(client = %client, error = %e, "websocket write ended");
        }
    });

    while let Some(message) = inbound.next().await {
        match message {
            Ok(Message::Text(text)) => state.dispatcher.handle_text(client, &text).await,
            Ok(Message::Binary(_)) => state.dispatcher.reject_unsupported(client).await,
            Ok(Message::Close(_)) => break,
            // Ping and pong are answered by the transport.
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(client = %client, error = %e, "websocket read failed");
                break;
            }
        }
    }

    state.registry().unregister(client);
    writer.abort();
}

/// Encode outbox frames as websocket text messages
fn outbound(mut outbox: mpsc::Receiver<Frame>) -> impl Stream<Item = Result<Message, axum::Error>> {
    async_stream::stream! {
        while let Some(frame) = outbox.recv().await {
            match frame.to_json() {
                Ok(text) => yield Ok(Message::Text(text)),
                Err(e) => tracing::error!(error = %e, "failed to encode frame"),
            }
        }
    }
}
