/**
 * DEVICE LINK - Assemblage du noyau : session, router, store, dispatcher, hub
 *
 * RÔLE :
 * Construit tous les composants une fois dans main() et les injecte dans les
 * handlers HTTP/WebSocket. Cycle de vie explicite : new() -> start() -> shutdown().
 *
 * TASKS DÉMARRÉES PAR start() :
 * - superviseur de connexion (connexion initiale + reconnexion bornée)
 * - diffuseur du hub (store -> abonnés WebSocket)
 * - simulateur de batterie si activé en config
 */

use crate::config::{validate_server_url, KernelConfig};
use crate::dispatcher::{Accepted, CommandDispatcher, PendingCommands};
use crate::error::{BridgeError, BridgeResult};
use crate::health::{memory_usage_mb, HealthTracker, KernelHealth};
use crate::hub::SubscriberHub;
use crate::router::MessageRouter;
use crate::session::UpstreamSession;
use crate::simulator::spawn_battery_drain;
use crate::state::Shared;
use crate::store::DeviceStore;
use crate::supervisor::{Supervisor, SupervisorRequest};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

struct Pending {
    supervisor: mpsc::UnboundedReceiver<SupervisorRequest>,
    hub_updates: mpsc::UnboundedReceiver<Value>,
}

pub struct DeviceLink {
    config: Shared<KernelConfig>,
    store: Arc<DeviceStore>,
    session: Arc<UpstreamSession>,
    dispatcher: CommandDispatcher,
    hub: SubscriberHub,
    health: HealthTracker,
    supervisor_tx: mpsc::UnboundedSender<SupervisorRequest>,
    not_started: Mutex<Option<Pending>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl DeviceLink {
    pub fn new(config: Shared<KernelConfig>) -> Arc<Self> {
        let store = Arc::new(DeviceStore::new());
        let pending = PendingCommands::new();
        let router = Arc::new(MessageRouter::new(store.clone(), pending.clone()));
        let session = Arc::new(UpstreamSession::new(router));
        let dispatcher = CommandDispatcher::new(session.clone(), pending);
        let hub = SubscriberHub::new(store.clone(), session.subscribe_connectivity());

        let (feed, hub_updates) = hub.status_feed();
        store.add_listener(Arc::new(feed));
        let (supervisor_tx, supervisor) = mpsc::unbounded_channel();

        Arc::new(Self {
            config,
            store,
            session,
            dispatcher,
            hub,
            health: HealthTracker::new(),
            supervisor_tx,
            not_started: Mutex::new(Some(Pending {
                supervisor,
                hub_updates,
            })),
            tasks: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        })
    }

    /// Lance les tasks de fond. Un second appel est sans effet.
    pub fn start(&self) {
        let Some(pending) = self.not_started.lock().take() else {
            warn!("[link] already started");
            return;
        };

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(
            self.hub.clone().run(pending.hub_updates, self.cancel.child_token()),
        ));

        let supervisor = Supervisor::new(
            self.session.clone(),
            self.config.clone(),
            self.health.clone(),
            pending.supervisor,
            self.cancel.child_token(),
        );
        tasks.push(tokio::spawn(supervisor.run()));

        let relay = self.config.lock().relay.clone();
        if relay.simulate_battery_drain {
            tasks.push(spawn_battery_drain(
                self.store.clone(),
                relay.status_update_interval(),
                self.cancel.child_token(),
            ));
        }
        info!(tasks = tasks.len(), "[link] device link started");
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.session.disconnect();

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!("[link] background task ended badly: {e}");
            }
        }
        info!("[link] device link stopped");
    }

    pub fn send_command(
        &self,
        node_id: Option<&str>,
        action: &str,
        params: Value,
    ) -> BridgeResult<Accepted> {
        self.dispatcher.send_command(node_id, action, params)
    }

    /// Change l'adresse du serveur amont puis demande une reconnexion en fond.
    pub fn set_server_url(&self, url: &str) -> BridgeResult<()> {
        validate_server_url(url)?;
        self.config.lock().matter_server_url = url.trim().to_string();
        self.supervisor_tx
            .send(SupervisorRequest::Reconnect)
            .map_err(|_| BridgeError::Config("supervisor not running".into()))?;
        info!(url, "[link] upstream server changed");
        Ok(())
    }

    pub async fn health(&self) -> KernelHealth {
        KernelHealth {
            uptime_seconds: self.health.uptime_seconds(),
            upstream_status: self.health.status(),
            upstream_reconnects: self.health.reconnects(),
            upstream_url: self.session.url(),
            nodes_tracked: self.store.len(),
            subscribers: self.hub.len().await,
            pending_commands: self.dispatcher.pending().len(),
            memory_usage_mb: memory_usage_mb(),
        }
    }

    pub fn config(&self) -> KernelConfig {
        self.config.lock().clone()
    }

    pub fn store(&self) -> &Arc<DeviceStore> {
        &self.store
    }

    pub fn session(&self) -> &Arc<UpstreamSession> {
        &self.session
    }

    pub fn hub(&self) -> &SubscriberHub {
        &self.hub
    }

    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.dispatcher
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }
}
