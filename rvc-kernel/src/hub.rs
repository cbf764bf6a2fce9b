/**
 * SUBSCRIBER HUB - Diffusion de l'état du robot vers les clients WebSocket
 *
 * RÔLE :
 * Ensemble des abonnés actifs (UIs connectées sur /ws). Chaque changement de
 * résumé est sérialisé une fois puis envoyé en parallèle à tous les abonnés.
 *
 * FONCTIONNEMENT :
 * - subscribe() : ajoute l'abonné et lui pousse tout de suite l'état courant
 * - broadcast() : envoi sur une copie de l'ensemble, retrait des abonnés en échec
 * - Pas de retry ni de file par abonné : un client cassé est simplement retiré
 */

use crate::error::{BridgeError, BridgeResult};
use crate::store::{DeviceStore, StatusListener};
use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type SubscriberId = Uuid;

/// Poignée vers un client en aval
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn send_text(&self, text: &str) -> BridgeResult<()>;
}

pub fn status_update(status: &Value, message: Option<&str>) -> String {
    let envelope = match message {
        Some(message) => json!({ "type": "status_update", "data": status, "message": message }),
        None => json!({ "type": "status_update", "data": status }),
    };
    envelope.to_string()
}

#[derive(Clone)]
pub struct SubscriberHub {
    subscribers: Arc<RwLock<HashMap<SubscriberId, Arc<dyn Subscriber>>>>,
    store: Arc<DeviceStore>,
    upstream: watch::Receiver<bool>,
}

impl SubscriberHub {
    pub fn new(store: Arc<DeviceStore>, upstream: watch::Receiver<bool>) -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            store,
            upstream,
        }
    }

    /// Premier message = état courant; si le serveur amont est absent le
    /// message le signale. Un abonné qui échoue dès ce premier envoi n'est pas ajouté.
    /// Un changement survenu pendant l'envoi initial est renvoyé après l'ajout.
    pub async fn subscribe(&self, handle: Arc<dyn Subscriber>) -> BridgeResult<SubscriberId> {
        let id = Uuid::new_v4();
        let note = (!*self.upstream.borrow()).then_some("upstream not connected");
        let mut sent = self.store.status();

        handle
            .send_text(&status_update(&sent, note))
            .await
            .map_err(|_| BridgeError::SubscriberGone(id))?;

        {
            let mut subscribers = self.subscribers.write().await;
            subscribers.insert(id, handle.clone());
            info!(%id, total = subscribers.len(), "[hub] subscriber added");
        }

        // les diffusions suivantes incluent l'abonné, on rattrape celles d'avant
        loop {
            let current = self.store.status();
            if current == sent {
                break;
            }
            if handle.send_text(&status_update(&current, None)).await.is_err() {
                self.unsubscribe(id).await;
                return Err(BridgeError::SubscriberGone(id));
            }
            sent = current;
        }
        Ok(id)
    }

    pub async fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.subscribers.write().await;
        let removed = subscribers.remove(&id).is_some();
        if removed {
            info!(%id, total = subscribers.len(), "[hub] subscriber removed");
        }
        removed
    }

    /// Retourne le nombre d'envois réussis. Ne remonte jamais d'erreur.
    pub async fn broadcast(&self, status: &Value) -> usize {
        let text = status_update(status, None);
        let snapshot: Vec<(SubscriberId, Arc<dyn Subscriber>)> = self
            .subscribers
            .read()
            .await
            .iter()
            .map(|(id, s)| (*id, s.clone()))
            .collect();

        if snapshot.is_empty() {
            return 0;
        }

        let results = join_all(snapshot.iter().map(|(id, subscriber)| {
            let text = text.as_str();
            async move { (*id, subscriber.send_text(text).await) }
        }))
        .await;

        let failed: Vec<SubscriberId> = results
            .iter()
            .filter(|(_, result)| result.is_err())
            .map(|(id, _)| *id)
            .collect();

        if !failed.is_empty() {
            let mut subscribers = self.subscribers.write().await;
            for id in &failed {
                subscribers.remove(id);
                warn!(%id, "[hub] send failed, subscriber dropped");
            }
        }

        let delivered = snapshot.len() - failed.len();
        debug!(delivered, dropped = failed.len(), "[hub] status broadcast");
        delivered
    }

    pub async fn len(&self) -> usize {
        self.subscribers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Listener à brancher sur le store + la boucle qui diffuse ce qu'il reçoit
    pub fn status_feed(&self) -> (HubFeed, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (HubFeed { tx }, rx)
    }

    pub async fn run(self, mut updates: mpsc::UnboundedReceiver<Value>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                update = updates.recv() => match update {
                    Some(status) => {
                        self.broadcast(&status).await;
                    }
                    None => break,
                },
            }
        }
        debug!("[hub] broadcaster stopped");
    }
}

/// Pont synchrone store -> hub : le store notifie, la boucle du hub diffuse.
pub struct HubFeed {
    tx: mpsc::UnboundedSender<Value>,
}

impl StatusListener for HubFeed {
    fn name(&self) -> &str {
        "subscriber-hub"
    }

    fn on_status(&self, status: &Value) -> Result<(), BridgeError> {
        self.tx
            .send(status.clone())
            .map_err(|_| BridgeError::ListenerFailure {
                listener: self.name().to_string(),
                reason: "broadcaster stopped".into(),
            })
    }
}
