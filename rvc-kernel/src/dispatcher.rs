use crate::error::{BridgeError, BridgeResult};
use crate::models::{PendingCommand, COMMAND_PREFIX};
use crate::session::UpstreamSession;
use crate::state::{new_state, Shared};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::info;

/// Commande acceptée et écrite sur la session amont
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Accepted {
    pub message_id: String,
}

pub fn correlation_id(n: u64) -> String {
    format!("{COMMAND_PREFIX}{n}")
}

/// Table des commandes en attente d'acquittement, partagée avec le router.
#[derive(Clone)]
pub struct PendingCommands {
    inner: Shared<HashMap<String, PendingCommand>>,
}

impl PendingCommands {
    pub fn new() -> Self {
        Self { inner: new_state(HashMap::new()) }
    }

    pub fn insert(&self, command: PendingCommand) {
        self.inner.lock().insert(command.correlation_id.clone(), command);
    }

    pub fn complete(&self, correlation_id: &str) -> Option<PendingCommand> {
        self.inner.lock().remove(correlation_id)
    }

    /// Les ids repartent à 1 sur chaque connexion, l'ancienne table n'a plus de sens
    pub fn clear(&self) -> usize {
        let mut table = self.inner.lock();
        let dropped = table.len();
        table.clear();
        dropped
    }

    pub fn contains(&self, correlation_id: &str) -> bool {
        self.inner.lock().contains_key(correlation_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PendingCommands {
    fn default() -> Self {
        Self::new()
    }
}

pub struct CommandDispatcher {
    session: Arc<UpstreamSession>,
    pending: PendingCommands,
}

impl CommandDispatcher {
    pub fn new(session: Arc<UpstreamSession>, pending: PendingCommands) -> Self {
        Self { session, pending }
    }

    /// Écrit `{message_id, command, params}` sur la session. Pas de file
    /// d'attente : hors connexion on échoue tout de suite.
    pub fn send_command(
        &self,
        node_id: Option<&str>,
        action: &str,
        params: Value,
    ) -> BridgeResult<Accepted> {
        if !self.session.is_connected() {
            return Err(BridgeError::NotConnected);
        }

        let params = with_node_id(params, node_id);
        let mut issued: Option<String> = None;

        // enregistré avant l'envoi : l'ack peut arriver avant le retour de transmit()
        let sent = self.session.transmit(|n| {
            let message_id = correlation_id(n);
            self.pending.insert(PendingCommand {
                correlation_id: message_id.clone(),
                action: action.to_string(),
                node_id: node_id.map(str::to_string),
                issued_at: OffsetDateTime::now_utc(),
            });
            let frame = json!({ "message_id": message_id, "command": action, "params": params });
            issued = Some(message_id);
            frame.to_string()
        });

        if let Err(e) = sent {
            if let Some(message_id) = issued {
                self.pending.complete(&message_id);
            }
            return Err(e);
        }

        let message_id = issued.ok_or(BridgeError::NotConnected)?;
        info!(%message_id, action, node_id = ?node_id, "[dispatcher] command sent");
        Ok(Accepted { message_id })
    }

    pub fn pending(&self) -> &PendingCommands {
        &self.pending
    }
}

fn with_node_id(params: Value, node_id: Option<&str>) -> Value {
    let mut params = match params {
        Value::Null => Value::Object(Map::new()),
        other => other,
    };
    if let (Some(id), Some(map)) = (node_id, params.as_object_mut()) {
        map.entry("node_id").or_insert_with(|| Value::String(id.to_string()));
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::MessageRouter;
    use crate::store::DeviceStore;

    fn dispatcher() -> CommandDispatcher {
        let pending = PendingCommands::new();
        let router = Arc::new(MessageRouter::new(Arc::new(DeviceStore::new()), pending.clone()));
        CommandDispatcher::new(Arc::new(UpstreamSession::new(router)), pending)
    }

    #[test]
    fn test_send_without_connection_fails_immediately() {
        let d = dispatcher();
        let err = d.send_command(Some("4"), "start", json!({})).unwrap_err();
        assert!(matches!(err, BridgeError::NotConnected));
        assert!(d.pending().is_empty());
    }

    #[test]
    fn test_correlation_id_format() {
        assert_eq!(correlation_id(1), "cmd_1");
        assert_eq!(correlation_id(42), "cmd_42");
    }

    #[test]
    fn test_node_id_added_to_params() {
        assert_eq!(with_node_id(Value::Null, Some("4")), json!({ "node_id": "4" }));
        assert_eq!(
            with_node_id(json!({ "node_id": 7, "mode": 1 }), Some("4")),
            json!({ "node_id": 7, "mode": 1 })
        );
        assert_eq!(with_node_id(json!({}), None), json!({}));
    }

    #[test]
    fn test_pending_table() {
        let pending = PendingCommands::new();
        pending.insert(PendingCommand {
            correlation_id: "cmd_1".into(),
            action: "start".into(),
            node_id: None,
            issued_at: OffsetDateTime::now_utc(),
        });
        assert!(pending.contains("cmd_1"));
        assert_eq!(pending.complete("cmd_1").map(|c| c.action).as_deref(), Some("start"));
        assert!(pending.complete("cmd_1").is_none());
        assert_eq!(pending.clear(), 0);
    }
}
