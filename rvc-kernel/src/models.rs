use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use time::OffsetDateTime;

// Identifiants de trames du protocole amont
pub const LISTEN_MESSAGE_ID: &str = "client";
pub const START_LISTENING: &str = "start_listening";
pub const COMMAND_PREFIX: &str = "cmd_";

// Chemins d'attributs endpoint/cluster/attribut lus pour le résumé
pub const ATTR_OPERATIONAL_STATE: &str = "1/97/4"; // RVC Operational State
pub const ATTR_CLEAN_MODE: &str = "1/85/1"; // RVC Clean Mode, CurrentMode
pub const ATTR_RUN_MODE: &str = "1/84/1"; // RVC Run Mode, CurrentMode
pub const ATTR_BATTERY_PERCENT: &str = "1/47/12"; // Power Source, demi-pourcents

pub const UNKNOWN: &str = "unknown";
pub const OFFLINE: &str = "offline";

/// Node tel que publié par le serveur Matter dans un snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeRecord {
    #[serde(deserialize_with = "node_id_as_string")]
    pub node_id: String,
    #[serde(default)]
    pub available: bool,
    #[serde(default)]
    pub date_commissioned: Option<String>,
    #[serde(default)]
    pub last_interview: Option<String>,
    #[serde(default)]
    pub attributes: HashMap<String, Value>,
}

// Le serveur envoie des ids numériques, l'API les expose en string
fn node_id_as_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("invalid node_id: {other}"))),
    }
}

/// Vue allégée d'un node pour GET /api/nodes
#[derive(Debug, Clone, Serialize)]
pub struct NodeView {
    pub node_id: String,
    pub available: bool,
    pub date_commissioned: Option<String>,
    pub last_interview: Option<String>,
}

impl From<&NodeRecord> for NodeView {
    fn from(node: &NodeRecord) -> Self {
        Self {
            node_id: node.node_id.clone(),
            available: node.available,
            date_commissioned: node.date_commissioned.clone(),
            last_interview: node.last_interview.clone(),
        }
    }
}

/// Résumé dérivé de l'état du robot, recalculé à chaque snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceStatusSummary {
    pub node_id: Option<String>,
    pub available: bool,
    pub operational_state: String,
    pub operational_state_code: Option<i64>,
    pub current_cleaning_mode: Value,
    pub current_run_mode: Value,
    pub battery_level: u8,
}

impl DeviceStatusSummary {
    pub fn offline() -> Self {
        Self {
            node_id: None,
            available: false,
            operational_state: OFFLINE.to_string(),
            operational_state_code: None,
            current_cleaning_mode: Value::String(UNKNOWN.to_string()),
            current_run_mode: Value::String(UNKNOWN.to_string()),
            battery_level: 0,
        }
    }

    /// Dérive le résumé d'un node. Un node indisponible donne le résumé offline,
    /// un attribut absent donne sa valeur par défaut.
    pub fn from_node(node: &NodeRecord) -> Self {
        if !node.available {
            return Self {
                node_id: Some(node.node_id.clone()),
                ..Self::offline()
            };
        }

        let code = node
            .attributes
            .get(ATTR_OPERATIONAL_STATE)
            .and_then(Value::as_i64);

        Self {
            node_id: Some(node.node_id.clone()),
            available: true,
            operational_state: code
                .map(operational_state_name)
                .unwrap_or_else(|| UNKNOWN.to_string()),
            operational_state_code: code,
            current_cleaning_mode: attribute_or_unknown(node, ATTR_CLEAN_MODE),
            current_run_mode: attribute_or_unknown(node, ATTR_RUN_MODE),
            battery_level: node
                .attributes
                .get(ATTR_BATTERY_PERCENT)
                .map(battery_percent)
                .unwrap_or(0),
        }
    }

    pub fn to_value(&self) -> Value {
        json!({
            "node_id": self.node_id,
            "available": self.available,
            "operational_state": self.operational_state,
            "operational_state_code": self.operational_state_code,
            "current_cleaning_mode": self.current_cleaning_mode,
            "current_run_mode": self.current_run_mode,
            "battery_level": self.battery_level,
        })
    }
}

fn attribute_or_unknown(node: &NodeRecord, path: &str) -> Value {
    match node.attributes.get(path) {
        Some(Value::Null) | None => Value::String(UNKNOWN.to_string()),
        Some(v) => v.clone(),
    }
}

/// BatPercentRemaining est en demi-pourcents (0..=200)
fn battery_percent(raw: &Value) -> u8 {
    raw.as_u64().map(|half| (half / 2).min(100) as u8).unwrap_or(0)
}

/// Nom lisible d'un code OperationalState
pub fn operational_state_name(code: i64) -> String {
    match code {
        0 => "Stopped".to_string(),
        1 => "Running".to_string(),
        2 => "Paused".to_string(),
        3 => "Error".to_string(),
        64 => "SeekingCharger".to_string(),
        65 => "Charging".to_string(),
        66 => "Docked".to_string(),
        other => format!("State{other}"),
    }
}

/// Commande envoyée au serveur, en attente d'acquittement.
#[derive(Debug, Clone)]
pub struct PendingCommand {
    pub correlation_id: String,
    pub action: String,
    pub node_id: Option<String>,
    pub issued_at: OffsetDateTime,
}
