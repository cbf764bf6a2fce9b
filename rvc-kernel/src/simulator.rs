use crate::store::DeviceStore;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Décharge simulée : -1% par pas, repart à 100 sous 0. Données de démo,
/// désactivé par défaut (relay.simulate_battery_drain).
pub fn drain_step(status: &Value) -> Option<Value> {
    let mut next = status.clone();
    let map = next.as_object_mut()?;
    let battery = map.get("battery_level").and_then(Value::as_i64).unwrap_or(0);
    let drained = if battery <= 0 { 100 } else { battery - 1 };
    map.insert("battery_level".into(), Value::from(drained));
    Some(next)
}

pub fn spawn_battery_drain(
    store: Arc<DeviceStore>,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    info!(interval_secs = every.as_secs(), "[simulator] battery drain demo enabled");
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Some(next) = drain_step(&store.status()) {
                        store.set_status(next);
                    }
                }
            }
        }
    })
}
