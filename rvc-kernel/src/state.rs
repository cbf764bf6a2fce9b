use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// État partagé entre tasks (config, tables internes).
pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Connectivité de la session amont telle que vue par le superviseur.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamStatus {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
    /// Tentatives épuisées, on attend un changement de config
    Failed,
}

impl fmt::Display for UpstreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UpstreamStatus::Connecting => "connecting",
            UpstreamStatus::Connected => "connected",
            UpstreamStatus::Disconnected => "disconnected",
            UpstreamStatus::Reconnecting => "reconnecting",
            UpstreamStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}
