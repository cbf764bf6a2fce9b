/**
 * DEVICE STORE - État courant des nodes Matter et résumé du robot
 *
 * RÔLE :
 * Table node_id -> NodeRecord remplacée en bloc à chaque snapshot, plus le
 * résumé d'état courant (dérivé, ou poussé tel quel par le serveur).
 *
 * FONCTIONNEMENT :
 * - replace_nodes() : remplace toute la table puis recalcule le résumé
 * - set_status() : remplace le résumé sans passer par la dérivation
 * - Chaque mutation notifie tous les listeners, l'échec de l'un n'arrête pas les autres
 */

use crate::error::BridgeError;
use crate::models::{DeviceStatusSummary, NodeRecord};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Consommateur des changements de résumé (le hub WebSocket en pratique)
pub trait StatusListener: Send + Sync {
    fn name(&self) -> &str;
    fn on_status(&self, status: &Value) -> Result<(), BridgeError>;
}

struct StoreInner {
    nodes: HashMap<String, NodeRecord>,
    status: Value,
    active_node: Option<String>,
}

pub struct DeviceStore {
    inner: Mutex<StoreInner>,
    listeners: Mutex<Vec<Arc<dyn StatusListener>>>,
}

impl DeviceStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                nodes: HashMap::new(),
                status: DeviceStatusSummary::offline().to_value(),
                active_node: None,
            }),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn StatusListener>) {
        self.listeners.lock().push(listener);
    }

    /// Remplace toute la table. Pour un id répété, la dernière occurrence gagne.
    /// Le résumé vient du dernier node disponible du snapshot, sinon résumé offline.
    pub fn replace_nodes(&self, nodes: Vec<NodeRecord>) -> Value {
        let mut table: HashMap<String, (usize, NodeRecord)> = HashMap::with_capacity(nodes.len());
        for (position, node) in nodes.into_iter().enumerate() {
            table.insert(node.node_id.clone(), (position, node));
        }

        let summary = table
            .values()
            .filter(|(_, node)| node.available)
            .max_by_key(|(position, _)| *position)
            .map(|(_, node)| DeviceStatusSummary::from_node(node))
            .unwrap_or_else(DeviceStatusSummary::offline);
        let status = summary.to_value();

        {
            let mut inner = self.inner.lock();
            inner.nodes = table.into_iter().map(|(id, (_, node))| (id, node)).collect();
            inner.active_node = summary.node_id.clone();
            inner.status = status.clone();
            debug!(nodes = inner.nodes.len(), active = ?inner.active_node, "[store] nodes replaced");
        }

        self.notify(&status);
        status
    }

    /// Résumé poussé directement par le serveur, conservé tel quel.
    pub fn set_status(&self, status: Value) {
        self.inner.lock().status = status.clone();
        self.notify(&status);
    }

    pub fn status(&self) -> Value {
        self.inner.lock().status.clone()
    }

    pub fn active_node_id(&self) -> Option<String> {
        self.inner.lock().active_node.clone()
    }

    pub fn node(&self, node_id: &str) -> Option<NodeRecord> {
        self.inner.lock().nodes.get(node_id).cloned()
    }

    /// Nodes triés par id (les ids numériques dans l'ordre naturel)
    pub fn nodes(&self) -> Vec<NodeRecord> {
        let mut nodes: Vec<NodeRecord> = self.inner.lock().nodes.values().cloned().collect();
        nodes.sort_by(|a, b| {
            (a.node_id.len(), &a.node_id).cmp(&(b.node_id.len(), &b.node_id))
        });
        nodes
    }

    pub fn len(&self) -> usize {
        self.inner.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn notify(&self, status: &Value) {
        // copie de la liste : un listener peut en enregistrer un autre
        let listeners: Vec<Arc<dyn StatusListener>> = self.listeners.lock().clone();

        for listener in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener.on_status(status))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(listener = listener.name(), "[store] {e}"),
                Err(_) => error!(listener = listener.name(), "[store] status listener panicked"),
            }
        }
    }
}

impl Default for DeviceStore {
    fn default() -> Self {
        Self::new()
    }
}
