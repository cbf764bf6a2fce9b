/*!
Constructeurs de trames du protocole Matter server

Produit les trames que le serveur amont envoie au kernel:
- snapshot de nodes (réponse à start_listening)
- push d'état `device_status`
- acquittements de commandes `cmd_<n>`
*/

use serde_json::{json, Map, Value};

// Chemins d'attributs endpoint/cluster/attribut
pub const ATTR_OPERATIONAL_STATE: &str = "1/97/4";
pub const ATTR_CLEAN_MODE: &str = "1/85/1";
pub const ATTR_RUN_MODE: &str = "1/84/1";
pub const ATTR_BATTERY: &str = "1/47/12";

pub struct FrameBuilder;

impl FrameBuilder {
    /// Réponse au handshake : `{"message_id":"client","result":[...]}`
    pub fn snapshot(nodes: Vec<Value>) -> Value {
        json!({ "message_id": "client", "result": nodes })
    }

    pub fn device_status(status: Value) -> Value {
        json!({ "device_status": status })
    }

    /// Acquittement réussi d'une commande
    pub fn ack(message_id: &str, result: Value) -> Value {
        json!({ "message_id": message_id, "result": result })
    }

    /// Acquittement en échec
    pub fn ack_error(message_id: &str, error_code: i64, details: &str) -> Value {
        json!({ "message_id": message_id, "error_code": error_code, "details": details })
    }
}

/// Node tel que publié dans un snapshot
pub struct NodeBuilder {
    node_id: u64,
    available: bool,
    date_commissioned: Option<String>,
    last_interview: Option<String>,
    attributes: Map<String, Value>,
}

impl NodeBuilder {
    pub fn new(node_id: u64) -> Self {
        Self {
            node_id,
            available: true,
            date_commissioned: None,
            last_interview: None,
            attributes: Map::new(),
        }
    }

    pub fn available(mut self, available: bool) -> Self {
        self.available = available;
        self
    }

    pub fn operational_state(self, code: i64) -> Self {
        self.attribute(ATTR_OPERATIONAL_STATE, json!(code))
    }

    pub fn clean_mode(self, mode: Value) -> Self {
        self.attribute(ATTR_CLEAN_MODE, mode)
    }

    pub fn run_mode(self, mode: Value) -> Self {
        self.attribute(ATTR_RUN_MODE, mode)
    }

    /// Valeur brute en demi-pourcents (200 = 100%)
    pub fn battery_half_percent(self, raw: u64) -> Self {
        self.attribute(ATTR_BATTERY, json!(raw))
    }

    pub fn attribute(mut self, path: &str, value: Value) -> Self {
        self.attributes.insert(path.to_string(), value);
        self
    }

    /// Horodatages de mise en service/interview à maintenant
    pub fn commissioned_now(mut self) -> Self {
        let now = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string();
        self.date_commissioned = Some(now.clone());
        self.last_interview = Some(now);
        self
    }

    pub fn build(self) -> Value {
        json!({
            "node_id": self.node_id,
            "available": self.available,
            "date_commissioned": self.date_commissioned,
            "last_interview": self.last_interview,
            "attributes": self.attributes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_builder() {
        let node = NodeBuilder::new(4)
            .operational_state(1)
            .battery_half_percent(150)
            .clean_mode(json!(2))
            .commissioned_now()
            .build();
        assert_eq!(node["node_id"], 4);
        assert_eq!(node["available"], true);
        assert_eq!(node["attributes"]["1/97/4"], 1);
        assert_eq!(node["attributes"]["1/47/12"], 150);
        assert!(node["date_commissioned"].is_string());

        let offline = NodeBuilder::new(5).available(false).build();
        assert_eq!(offline["available"], false);
        assert!(offline["last_interview"].is_null());
    }

    #[test]
    fn test_frames() {
        let snapshot = FrameBuilder::snapshot(vec![NodeBuilder::new(1).build()]);
        assert_eq!(snapshot["message_id"], "client");
        assert_eq!(snapshot["result"].as_array().unwrap().len(), 1);

        let ack = FrameBuilder::ack_error("cmd_3", 5, "busy");
        assert_eq!(ack["message_id"], "cmd_3");
        assert_eq!(ack["error_code"], 5);
    }
}
