/*!
Faux serveur Matter WebSocket pour tester le kernel sans matériel

Écoute sur un port local éphémère, enregistre toutes les trames JSON reçues
du kernel et permet de pousser des trames (snapshot, status, ack) vers la
connexion courante. Peut couper la connexion pour tester la reconnexion.
*/

use crate::frame_helpers::FrameBuilder;
use crate::test_utils::wait_until;
use anyhow::Result;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

#[derive(Default)]
struct ServerState {
    received: Mutex<Vec<Value>>,
    current: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    connections: AtomicUsize,
    snapshot: Mutex<Option<Vec<Value>>>,
    drop_next: AtomicUsize,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Serveur Matter simulé
pub struct MockMatterServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    accept_task: JoinHandle<()>,
}

impl MockMatterServer {
    pub async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(ServerState::default());

        let accept_state = state.clone();
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let task = tokio::spawn(serve_connection(stream, accept_state.clone()));
                accept_state.tasks.lock().push(task);
            }
        });

        log::info!("🧪 [MOCK] Matter server listening on {}", addr);
        Ok(Self {
            addr,
            state,
            accept_task,
        })
    }

    /// Répond automatiquement à start_listening avec ce snapshot
    pub fn with_snapshot(self, nodes: Vec<Value>) -> Self {
        self.set_snapshot(nodes);
        self
    }

    /// Les `count` prochaines connexions sont fermées juste après le handshake
    pub fn dropping_first(self, count: usize) -> Self {
        self.state.drop_next.store(count, Ordering::SeqCst);
        self
    }

    pub fn set_snapshot(&self, nodes: Vec<Value>) {
        *self.state.snapshot.lock() = Some(nodes);
    }

    pub fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Pousse une trame vers le kernel sur la connexion courante
    pub fn push(&self, frame: &Value) -> Result<()> {
        let current = self.state.current.lock();
        let Some(tx) = current.as_ref() else {
            anyhow::bail!("no kernel connected");
        };
        tx.send(Message::text(frame.to_string()))
            .map_err(|_| anyhow::anyhow!("connection closed"))?;
        log::info!("📨 [MOCK] Pushed frame to kernel");
        Ok(())
    }

    /// Toutes les trames reçues du kernel, toutes connexions confondues
    pub fn received(&self) -> Vec<Value> {
        self.state.received.lock().clone()
    }

    pub fn frames_with_command(&self, command: &str) -> Vec<Value> {
        self.state
            .received
            .lock()
            .iter()
            .filter(|frame| frame.get("command").and_then(Value::as_str) == Some(command))
            .cloned()
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Ferme la connexion courante (trame Close). false si aucune connexion.
    pub fn drop_connection(&self) -> bool {
        match self.state.current.lock().take() {
            Some(tx) => {
                log::info!("✂️ [MOCK] Dropping kernel connection");
                tx.send(Message::Close(None)).is_ok()
            }
            None => false,
        }
    }

    /// Attend au moins `count` trames portant `command`
    pub async fn wait_for_frames(
        &self,
        command: &str,
        count: usize,
        timeout: Duration,
    ) -> Result<Vec<Value>> {
        if !wait_until(timeout, || self.frames_with_command(command).len() >= count).await {
            anyhow::bail!(
                "expected {} '{}' frames, got {}",
                count,
                command,
                self.frames_with_command(command).len()
            );
        }
        Ok(self.frames_with_command(command))
    }

    pub async fn wait_for_connections(&self, count: usize, timeout: Duration) -> Result<()> {
        if !wait_until(timeout, || self.connection_count() >= count).await {
            anyhow::bail!(
                "expected {} connections, got {}",
                count,
                self.connection_count()
            );
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        self.accept_task.abort();
        for task in self.state.tasks.lock().drain(..) {
            task.abort();
        }
        self.state.current.lock().take();
    }
}

impl Drop for MockMatterServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn serve_connection(stream: TcpStream, state: Arc<ServerState>) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            log::warn!("⚠️ [MOCK] Handshake failed: {}", e);
            return;
        }
    };
    let n = state.connections.fetch_add(1, Ordering::SeqCst) + 1;
    let dropping = state
        .drop_next
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
        .is_ok();
    if dropping {
        log::info!("✂️ [MOCK] Connection #{} dropped after handshake", n);
        drop(ws);
        return;
    }

    let (mut sink, mut source) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    *state.current.lock() = Some(tx.clone());
    log::info!("🔌 [MOCK] Kernel connected (connection #{})", n);

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if sink.send(msg).await.is_err() || closing {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = source.next().await {
        let text = match &msg {
            Message::Text(text) => text.as_str(),
            Message::Close(_) => break,
            _ => continue,
        };
        let frame: Value = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("⚠️ [MOCK] Non-JSON frame from kernel: {}", e);
                continue;
            }
        };

        let listening = frame.get("command").and_then(Value::as_str) == Some("start_listening");
        state.received.lock().push(frame);

        if listening {
            let snapshot = state.snapshot.lock().clone();
            if let Some(nodes) = snapshot {
                let reply = FrameBuilder::snapshot(nodes);
                tx.send(Message::text(reply.to_string())).ok();
            }
        }
    }

    writer.abort();
    log::info!("🔌 [MOCK] Connection #{} closed", n);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_helpers::NodeBuilder;
    use serde_json::json;
    use tokio_tungstenite::connect_async;

    #[tokio::test]
    async fn test_records_frames_and_answers_listen() {
        let server = MockMatterServer::start()
            .await
            .unwrap()
            .with_snapshot(vec![NodeBuilder::new(4).operational_state(1).build()]);

        let (mut ws, _) = connect_async(server.url()).await.unwrap();
        ws.send(Message::text(
            json!({ "message_id": "client", "command": "start_listening" }).to_string(),
        ))
        .await
        .unwrap();

        let reply = ws.next().await.unwrap().unwrap();
        let reply: Value = serde_json::from_str(reply.to_text().unwrap()).unwrap();
        assert_eq!(reply["message_id"], "client");
        assert_eq!(reply["result"][0]["node_id"], 4);

        let frames = server
            .wait_for_frames("start_listening", 1, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(server.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_push_and_drop_connection() {
        let server = MockMatterServer::start().await.unwrap();
        assert!(server.push(&json!({})).is_err());
        assert!(!server.drop_connection());

        let (mut ws, _) = connect_async(server.url()).await.unwrap();
        server
            .wait_for_connections(1, Duration::from_secs(2))
            .await
            .unwrap();

        server
            .push(&FrameBuilder::device_status(json!({ "battery_level": 50 })))
            .unwrap();
        let pushed = ws.next().await.unwrap().unwrap();
        assert!(pushed.to_text().unwrap().contains("battery_level"));

        assert!(server.drop_connection());
        let closed = ws.next().await;
        assert!(matches!(closed, Some(Ok(Message::Close(_))) | None | Some(Err(_))));
    }
}
