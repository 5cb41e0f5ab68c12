use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Extension, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

use crate::api::AppState;
use crate::auth::Claims;
use crate::hub::Hub;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> impl IntoResponse {
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| run_connection(socket, hub, claims.sub))
}

/// Pump one connection: session events out as JSON text frames, client
/// text frames into the session. The session is disconnected when either
/// side goes away.
pub async fn run_connection(socket: WebSocket, hub: Arc<Hub>, principal: String) {
    let (mut sink, mut stream) = socket.split();
    let (mut session, rx) = hub.open_session(principal);
    let mut events = UnboundedReceiverStream::new(rx);
    info!(session = %session.id(), "websocket connected");

    loop {
        tokio::select! {
            Some(event) = events.next() => {
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "failed to encode event");
                        continue;
                    }
                };
                if sink.send(WsMessage::Text(text)).await.is_err() {
                    break;
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    // rejections are already reported back on the session queue
                    let _ = session.handle_frame(&text).await;
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "websocket read failed");
                    break;
                }
            },
        }
    }

    session.disconnect();
    let _ = sink.close().await;
    info!(session = %session.id(), "websocket closed");
}
