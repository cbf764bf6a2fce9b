/*!
Utilitaires de test pour le kernel RVC

- Init des logs (tracing) une seule fois par binaire de test
- Attente active bornée sur une condition
- Accès aux champs imbriqués d'une trame JSON
*/

use anyhow::Result;
use serde_json::Value;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Init logging pour tests (idempotent). Capture les logs `tracing` du kernel
/// et, via le pont `log`, ceux du devkit.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init()
        .ok();
}

/// Interroge `cond` toutes les 20ms jusqu'à `timeout`. true si la condition est vue.
pub async fn wait_until<F>(timeout: Duration, mut cond: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = tokio::time::Instant::now();
    loop {
        if cond() {
            return true;
        }
        if start.elapsed() >= timeout {
            log::warn!("⏰ Timeout after {:?}", timeout);
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Champ par chemin pointé, ex. `data.device_status.battery_level`
pub fn field<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, part| match current {
        Value::Object(obj) => obj.get(part),
        _ => None,
    })
}

/// Assert qu'un champ a une valeur spécifique
pub fn assert_field_equals(value: &Value, path: &str, expected: &Value) -> Result<()> {
    match field(value, path) {
        Some(actual) if actual == expected => Ok(()),
        Some(actual) => anyhow::bail!(
            "Field '{}' mismatch: expected {:?}, got {:?}",
            path,
            expected,
            actual
        ),
        None => anyhow::bail!("Field '{}' not found", path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_nested_field_access() {
        let frame = json!({ "data": { "device_status": { "battery_level": 42 } } });
        assert_eq!(field(&frame, "data.device_status.battery_level"), Some(&json!(42)));
        assert!(field(&frame, "data.missing").is_none());
        assert!(field(&frame, "data.device_status.battery_level.x").is_none());

        assert!(assert_field_equals(&frame, "data.device_status.battery_level", &json!(42)).is_ok());
        assert!(assert_field_equals(&frame, "data.device_status.battery_level", &json!(1)).is_err());
    }

    #[tokio::test]
    async fn test_wait_until() {
        init_logging();
        assert!(wait_until(Duration::from_millis(50), || true).await);
        assert!(!wait_until(Duration::from_millis(50), || false).await);
    }
}
