use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::{IntoResponse, Response},
};
use futures_util::{sink::SinkExt, stream::StreamExt};
use tracing::{debug, error, info};

use crate::api::{
    state::AppState,
    types::{api_error, ActivityQuery},
};
use crate::events::ActivityStream;

/// GET /ws/users/:user_id/activity?since=
///
/// Sends every stored event after `since`, then live events, one JSON
/// `ActivityEvent` per text frame. Reconnect with the last `seq` seen.
pub async fn activity_socket(
    ws: WebSocketUpgrade,
    Path(user_id): Path<String>,
    Query(query): Query<ActivityQuery>,
    State(state): State<AppState>,
) -> Response {
    // Open before the upgrade so a bad user id is a plain 400
    match state.scheduler.stream_activity(&user_id, query.since).await {
        Ok(stream) => ws
            .on_upgrade(move |socket| handle_socket(socket, stream, user_id))
            .into_response(),
        Err(e) => api_error(e).into_response(),
    }
}

async fn handle_socket(socket: WebSocket, mut stream: ActivityStream, user_id: String) {
    let (mut sender, mut receiver) = socket.split();
    info!("Activity stream opened for {} (since {})", user_id, stream.last_seq());

    let send_task = tokio::spawn(async move {
        loop {
            let event = match stream.next().await {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(e) => {
                    error!("Activity stream failed: {}", e);
                    break;
                }
            };

            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    error!("Failed to serialize activity event: {}", e);
                    continue;
                }
            };

            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    // Drain client frames until it closes; axum answers pings itself
    while let Some(Ok(msg)) = receiver.next().await {
        if let Message::Close(_) = msg {
            break;
        }
    }

    send_task.abort();
    debug!("Activity stream closed for {}", user_id);
}
