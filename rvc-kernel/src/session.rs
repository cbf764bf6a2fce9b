/**
 * UPSTREAM SESSION - Connexion unique vers le serveur Matter
 *
 * RÔLE :
 * Ouvre le WebSocket amont, envoie le handshake start_listening, lance la
 * boucle de réception et expose un canal d'écriture au dispatcher.
 *
 * FONCTIONNEMENT :
 * - connect() : une seule tentative, le retry appartient au superviseur
 * - Boucle de réception : seul chemin qui passe la session à "déconnectée"
 * - Écritures via une task dédiée (moitié sink du stream), lectures sur l'autre moitié
 * - Chaque connexion a sa génération et son compteur de corrélation (repart à 1)
 */

use crate::error::{BridgeError, BridgeResult};
use crate::models::{LISTEN_MESSAGE_ID, START_LISTENING};
use crate::router::MessageRouter;
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connected {
    pub url: String,
    pub generation: u64,
}

struct Link {
    generation: u64,
    url: String,
    outbound: mpsc::UnboundedSender<Message>,
    next_id: AtomicU64,
    reader: Mutex<Option<AbortHandle>>,
}

impl Link {
    fn close(&self) {
        let _ = self.outbound.send(Message::Close(None));
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}

struct SessionInner {
    router: Arc<MessageRouter>,
    link: Mutex<Option<Arc<Link>>>,
    generation: AtomicU64,
    connected: watch::Sender<bool>,
}

impl SessionInner {
    /// Ignoré si une connexion plus récente a déjà remplacé celle-ci
    fn mark_disconnected(&self, generation: u64) {
        let mut link = self.link.lock();
        if link.as_ref().is_some_and(|l| l.generation == generation) {
            *link = None;
            drop(link);
            self.connected.send_replace(false);
            info!(generation, "[session] upstream connection lost");
        }
    }
}

pub struct UpstreamSession {
    inner: Arc<SessionInner>,
}

impl UpstreamSession {
    pub fn new(router: Arc<MessageRouter>) -> Self {
        let (connected, _) = watch::channel(false);
        Self {
            inner: Arc::new(SessionInner {
                router,
                link: Mutex::new(None),
                generation: AtomicU64::new(0),
                connected,
            }),
        }
    }

    pub async fn connect(&self, url: &str) -> BridgeResult<Connected> {
        debug!(url, "[session] connecting");
        let (ws, _response) = connect_async(url).await.map_err(|e| BridgeError::Connect {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let (mut sink, stream) = ws.split();
        let (outbound, mut rx) = mpsc::unbounded_channel::<Message>();
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;

        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = sink.send(msg).await {
                    debug!(generation, error = %e, "[session] write failed");
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let link = Arc::new(Link {
            generation,
            url: url.to_string(),
            outbound,
            next_id: AtomicU64::new(0),
            reader: Mutex::new(None),
        });

        // table vidée avant publication du lien : cmd_1 de cette connexion doit survivre
        self.inner.router.reset_connection();
        let previous = self.inner.link.lock().replace(link.clone());
        if let Some(previous) = previous {
            previous.close();
        }
        self.inner.connected.send_replace(true);

        let reader = tokio::spawn(receive_loop(stream, self.inner.clone(), generation));
        *link.reader.lock() = Some(reader.abort_handle());

        let handshake = json!({ "message_id": LISTEN_MESSAGE_ID, "command": START_LISTENING });
        if link.outbound.send(Message::text(handshake.to_string())).is_err() {
            self.inner.mark_disconnected(generation);
            return Err(BridgeError::Connect {
                url: url.to_string(),
                reason: "writer closed before handshake".into(),
            });
        }

        info!(url, generation, "[session] connected, listening for node events");
        Ok(Connected {
            url: url.to_string(),
            generation,
        })
    }

    /// Fermeture propre si connecté, sans effet sinon.
    pub fn disconnect(&self) {
        let link = self.inner.link.lock().take();
        if let Some(link) = link {
            link.close();
            self.inner.connected.send_replace(false);
            info!(url = %link.url, generation = link.generation, "[session] disconnected");
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    pub fn subscribe_connectivity(&self) -> watch::Receiver<bool> {
        self.inner.connected.subscribe()
    }

    pub fn url(&self) -> Option<String> {
        self.inner.link.lock().as_ref().map(|l| l.url.clone())
    }

    /// Prend le prochain numéro de corrélation de la connexion courante et
    /// écrit la trame construite par `build`. Verrou tenu pendant les deux
    /// étapes pour que l'ordre sur le fil suive l'ordre des numéros.
    pub fn transmit<F>(&self, build: F) -> BridgeResult<u64>
    where
        F: FnOnce(u64) -> String,
    {
        let guard = self.inner.link.lock();
        let link = guard.as_ref().ok_or(BridgeError::NotConnected)?;
        let n = link.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        link.outbound
            .send(Message::text(build(n)))
            .map_err(|_| BridgeError::NotConnected)?;
        Ok(n)
    }
}

async fn receive_loop(mut stream: SplitStream<WsStream>, inner: Arc<SessionInner>, generation: u64) {
    while let Some(next) = stream.next().await {
        match next {
            Ok(Message::Text(text)) => {
                inner.router.handle_text(text.as_str());
            }
            Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                Ok(text) => {
                    inner.router.handle_text(text);
                }
                Err(_) => warn!(generation, len = bytes.len(), "[session] binary frame dropped"),
            },
            Ok(Message::Close(frame)) => {
                info!(generation, reason = ?frame, "[session] server closed the connection");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(generation, error = %e, "[session] read error");
                break;
            }
        }
    }
    inner.mark_disconnected(generation);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{CommandDispatcher, PendingCommands};
    use crate::store::DeviceStore;
    use rvc_devkit::{wait_until, FrameBuilder, MockMatterServer};
    use std::time::Duration;

    fn session() -> UpstreamSession {
        let router = MessageRouter::new(Arc::new(DeviceStore::new()), PendingCommands::new());
        UpstreamSession::new(Arc::new(router))
    }

    #[test]
    fn test_new_session_is_disconnected() {
        let s = session();
        assert!(!s.is_connected());
        assert!(s.url().is_none());
        assert!(matches!(s.transmit(|_| String::new()), Err(BridgeError::NotConnected)));
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let s = session();
        s.disconnect();
        s.disconnect();
        assert!(!s.is_connected());
    }

    #[tokio::test]
    async fn test_reconnect_while_connected_keeps_new_commands_pending() {
        let server = MockMatterServer::start().await.unwrap();
        let pending = PendingCommands::new();
        let router = MessageRouter::new(Arc::new(DeviceStore::new()), pending.clone());
        let s = Arc::new(UpstreamSession::new(Arc::new(router)));
        let dispatcher = CommandDispatcher::new(s.clone(), pending.clone());

        s.connect(&server.url()).await.unwrap();
        dispatcher.send_command(None, "start", json!({})).unwrap();
        dispatcher.send_command(None, "pause", json!({})).unwrap();
        assert_eq!(pending.len(), 2);

        let second = s.connect(&server.url()).await.unwrap();
        assert_eq!(second.generation, 2);
        assert!(pending.is_empty());

        let accepted = dispatcher.send_command(None, "resume", json!({})).unwrap();
        assert_eq!(accepted.message_id, "cmd_1");
        assert!(pending.contains("cmd_1"));

        server.wait_for_connections(2, Duration::from_secs(5)).await.unwrap();
        server.wait_for_frames("resume", 1, Duration::from_secs(5)).await.unwrap();
        server.push(&FrameBuilder::ack("cmd_1", json!(null))).unwrap();
        assert!(wait_until(Duration::from_secs(5), || pending.is_empty()).await);
    }

    #[tokio::test]
    async fn test_connect_refused_returns_connect_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let s = session();
        let err = s.connect(&format!("ws://127.0.0.1:{port}/ws")).await.unwrap_err();
        assert!(matches!(err, BridgeError::Connect { .. }));
        assert!(!s.is_connected());
    }
}
