use crate::dispatcher::PendingCommands;
use crate::error::BridgeError;
use crate::models::{NodeRecord, COMMAND_PREFIX, LISTEN_MESSAGE_ID};
use crate::store::DeviceStore;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

/// Trame entrante classée. L'ordre des tests dans `classify` compte :
/// un ack peut aussi porter un champ `result`.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    NodeSnapshot(Vec<NodeRecord>),
    DeviceStatus(Value),
    CommandAck { message_id: String, frame: Value },
    Unclassified(Value),
}

pub fn classify(text: &str) -> Result<InboundFrame, BridgeError> {
    let frame: Value =
        serde_json::from_str(text).map_err(|e| BridgeError::MalformedFrame(e.to_string()))?;
    let message_id = frame.get("message_id").and_then(Value::as_str);

    if message_id == Some(LISTEN_MESSAGE_ID) {
        if let Some(result) = frame.get("result") {
            let entries = result
                .as_array()
                .ok_or_else(|| BridgeError::MalformedFrame("node list is not an array".into()))?;
            return Ok(InboundFrame::NodeSnapshot(parse_nodes(entries)));
        }
    }

    if let Some(status) = frame.get("device_status") {
        return Ok(InboundFrame::DeviceStatus(status.clone()));
    }

    if let Some(id) = message_id.filter(|id| id.starts_with(COMMAND_PREFIX)) {
        return Ok(InboundFrame::CommandAck {
            message_id: id.to_string(),
            frame,
        });
    }

    Ok(InboundFrame::Unclassified(frame))
}

/// Un node illisible est ignoré seul, les autres entrent dans le snapshot.
fn parse_nodes(entries: &[Value]) -> Vec<NodeRecord> {
    entries
        .iter()
        .filter_map(|entry| match NodeRecord::deserialize(entry) {
            Ok(node) => Some(node),
            Err(e) => {
                warn!(%entry, "[router] node skipped: {e}");
                None
            }
        })
        .collect()
}

/// Ce que le router a fait d'une trame (utile aux logs et aux tests)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    Snapshot { nodes: usize },
    Status,
    Ack { matched: bool },
    Rejected,
    Unclassified,
    Dropped,
}

pub struct MessageRouter {
    store: Arc<DeviceStore>,
    pending: PendingCommands,
}

impl MessageRouter {
    pub fn new(store: Arc<DeviceStore>, pending: PendingCommands) -> Self {
        Self { store, pending }
    }

    pub fn store(&self) -> &Arc<DeviceStore> {
        &self.store
    }

    /// Appelé à chaque nouvelle connexion amont
    pub fn reset_connection(&self) {
        let dropped = self.pending.clear();
        if dropped > 0 {
            warn!(dropped, "[router] pending commands dropped on new connection");
        }
    }

    /// Ne remonte jamais d'erreur : une trame illisible est loguée puis ignorée.
    pub fn handle_text(&self, text: &str) -> Routed {
        let frame = match classify(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("[router] {e}, frame dropped");
                debug!(frame = text, "[router] dropped frame content");
                return Routed::Dropped;
            }
        };

        match frame {
            InboundFrame::NodeSnapshot(nodes) => {
                let count = nodes.len();
                let status = self.store.replace_nodes(nodes);
                info!(
                    nodes = count,
                    state = %status["operational_state"],
                    "[router] node snapshot received"
                );
                Routed::Snapshot { nodes: count }
            }
            InboundFrame::DeviceStatus(status) => {
                debug!("[router] device status pushed");
                self.store.set_status(status);
                Routed::Status
            }
            InboundFrame::CommandAck { message_id, frame } => {
                self.acknowledge(&message_id, &frame)
            }
            InboundFrame::Unclassified(frame) => {
                debug!(%frame, "[router] unclassified frame");
                Routed::Unclassified
            }
        }
    }

    fn acknowledge(&self, message_id: &str, frame: &Value) -> Routed {
        let Some(command) = self.pending.complete(message_id) else {
            warn!(message_id, "[router] ack for unknown command");
            return Routed::Ack { matched: false };
        };

        let waited_ms = (OffsetDateTime::now_utc() - command.issued_at).whole_milliseconds() as i64;
        match frame.get("error_code") {
            Some(code) => {
                warn!(
                    message_id,
                    action = %command.action,
                    error_code = %code,
                    details = ?frame.get("details"),
                    "[router] command failed"
                );
                Routed::Rejected
            }
            None => {
                info!(
                    message_id,
                    action = %command.action,
                    waited_ms,
                    result = ?frame.get("result"),
                    "[router] command acknowledged"
                );
                Routed::Ack { matched: true }
            }
        }
    }
}
