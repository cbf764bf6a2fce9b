use crate::error::{BridgeError, BridgeResult};
use crate::http::AppState;
use crate::hub::{Subscriber, SubscriberHub};
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

const TEST_GREETING: &str = "Hello, WebSocket Client!";

// GET /ws (relais temps réel vers les UIs)
pub async fn ws_handler(ws: WebSocketUpgrade, State(app): State<AppState>) -> impl IntoResponse {
    let hub = app.link.hub().clone();
    let ping_every = app.link.config().relay.ping_interval();
    ws.on_upgrade(move |socket| handle_socket(socket, hub, ping_every))
}

/// Moitié écriture d'un client /ws, partagée entre le hub et la boucle de lecture
pub struct WsSubscriber {
    id: Uuid,
    sink: Mutex<SplitSink<WebSocket, Message>>,
}

impl WsSubscriber {
    fn new(sink: SplitSink<WebSocket, Message>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sink: Mutex::new(sink),
        }
    }

    async fn ping(&self) -> BridgeResult<()> {
        self.sink
            .lock()
            .await
            .send(Message::Ping(Vec::new().into()))
            .await
            .map_err(|_| BridgeError::SubscriberGone(self.id))
    }
}

#[async_trait]
impl Subscriber for WsSubscriber {
    async fn send_text(&self, text: &str) -> BridgeResult<()> {
        self.sink
            .lock()
            .await
            .send(Message::Text(text.to_string().into()))
            .await
            .map_err(|_| BridgeError::SubscriberGone(self.id))
    }
}

async fn handle_socket(socket: WebSocket, hub: SubscriberHub, ping_every: Duration) {
    let (sink, mut stream) = socket.split();
    let handle = Arc::new(WsSubscriber::new(sink));

    let id = match hub.subscribe(handle.clone()).await {
        Ok(id) => id,
        Err(e) => {
            warn!("[relay] {e}");
            return;
        }
    };

    let mut ping = tokio::time::interval(ping_every);
    ping.tick().await;

    loop {
        tokio::select! {
            _ = ping.tick() => {
                if handle.ping().await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    debug!(%id, "[relay] client message");
                    if let Some(reply) = answer_client_message(text.as_str()) {
                        if handle.send_text(&reply).await.is_err() {
                            break;
                        }
                        info!(%id, "[relay] test message answered");
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(%id, error = %e, "[relay] read error");
                    break;
                }
            }
        }
    }

    hub.unsubscribe(id).await;
}

/// Réponse à un message client : seul `{"type":"test"}` appelle une réponse.
pub fn answer_client_message(text: &str) -> Option<String> {
    let message: Value = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(_) => {
            warn!("[relay] invalid JSON from client: {text}");
            return None;
        }
    };

    if message.get("type").and_then(Value::as_str) != Some("test") {
        return None;
    }

    let received = message.get("data").cloned().unwrap_or_else(|| json!(""));
    Some(
        json!({
            "type": "test_response",
            "data": TEST_GREETING,
            "received": received,
        })
        .to_string(),
    )
}
