use crate::config::{KernelConfig, ReconnectConf};
use crate::error::BridgeResult;
use crate::health::HealthTracker;
use crate::session::{Connected, UpstreamSession};
use crate::state::{Shared, UpstreamStatus};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Politique de reconnexion : nombre fixe de tentatives, délai fixe entre
/// deux tentatives (pas de backoff exponentiel).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(5),
        }
    }
}

impl From<&ReconnectConf> for ReconnectPolicy {
    fn from(conf: &ReconnectConf) -> Self {
        Self {
            max_attempts: conf.max_attempts.max(1),
            delay: Duration::from_secs(conf.delay_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectOutcome {
    Connected { attempt: u32 },
    Exhausted { attempts: u32 },
}

/// Ce dont le superviseur a besoin d'une session
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> BridgeResult<Connected>;
    fn disconnect(&self);
}

#[async_trait]
impl Connector for UpstreamSession {
    async fn connect(&self, url: &str) -> BridgeResult<Connected> {
        UpstreamSession::connect(self, url).await
    }

    fn disconnect(&self) {
        UpstreamSession::disconnect(self)
    }
}

/// Ferme l'ancienne connexion puis retente `connect()` au plus
/// `policy.max_attempts` fois.
pub async fn reconnect_with_retry<C>(connector: &C, url: &str, policy: ReconnectPolicy) -> ReconnectOutcome
where
    C: Connector + ?Sized,
{
    connector.disconnect();

    for attempt in 1..=policy.max_attempts {
        match connector.connect(url).await {
            Ok(_) => {
                info!(attempt, url, "[supervisor] upstream connected");
                return ReconnectOutcome::Connected { attempt };
            }
            Err(e) => {
                warn!(attempt, max = policy.max_attempts, "[supervisor] {e}");
                if attempt < policy.max_attempts {
                    tokio::time::sleep(policy.delay).await;
                }
            }
        }
    }

    error!(
        attempts = policy.max_attempts,
        url, "[supervisor] giving up on upstream server"
    );
    ReconnectOutcome::Exhausted {
        attempts: policy.max_attempts,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorRequest {
    /// L'URL du serveur a changé (POST /api/config)
    Reconnect,
}

/// Surveille la connectivité de la session et applique la politique de
/// reconnexion. Tourne jusqu'à l'annulation du token.
pub struct Supervisor {
    session: Arc<UpstreamSession>,
    config: Shared<KernelConfig>,
    health: HealthTracker,
    requests: mpsc::UnboundedReceiver<SupervisorRequest>,
    cancel: CancellationToken,
}

impl Supervisor {
    pub fn new(
        session: Arc<UpstreamSession>,
        config: Shared<KernelConfig>,
        health: HealthTracker,
        requests: mpsc::UnboundedReceiver<SupervisorRequest>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session,
            config,
            health,
            requests,
            cancel,
        }
    }

    pub async fn run(mut self) {
        let mut connectivity = self.session.subscribe_connectivity();

        // connexion initiale avec la même politique
        self.health.set_status(UpstreamStatus::Connecting);
        self.reconnect_until_stable(&mut connectivity).await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                request = self.requests.recv() => match request {
                    Some(SupervisorRequest::Reconnect) => {
                        info!("[supervisor] reconnect requested");
                        self.health.increment_reconnects();
                        self.reconnect_until_stable(&mut connectivity).await;
                    }
                    None => break,
                },
                changed = connectivity.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let up = *connectivity.borrow_and_update();
                    if up {
                        self.health.set_status(UpstreamStatus::Connected);
                    } else {
                        warn!("[supervisor] upstream disconnected, reconnecting");
                        self.health.increment_reconnects();
                        self.reconnect_until_stable(&mut connectivity).await;
                    }
                }
            }
        }
        info!("[supervisor] stopped");
    }

    /// Les transitions causées par reconnect() sont absorbées, puis l'état réel
    /// est relu : une coupure arrivée entre-temps relance un cycle.
    async fn reconnect_until_stable(&self, connectivity: &mut watch::Receiver<bool>) {
        loop {
            let connected = self.reconnect().await;
            connectivity.mark_unchanged();
            if !connected || *connectivity.borrow() || self.cancel.is_cancelled() {
                return;
            }
            warn!("[supervisor] upstream dropped right after connect, reconnecting");
            self.health.increment_reconnects();
        }
    }

    /// true si la session est connectée à la sortie
    async fn reconnect(&self) -> bool {
        let (url, policy) = {
            let cfg = self.config.lock();
            (cfg.matter_server_url.clone(), ReconnectPolicy::from(&cfg.reconnect))
        };

        tokio::select! {
            _ = self.cancel.cancelled() => false,
            outcome = reconnect_with_retry(self.session.as_ref(), &url, policy) => {
                match outcome {
                    ReconnectOutcome::Connected { .. } => {
                        self.health.set_status(UpstreamStatus::Connected);
                        true
                    }
                    ReconnectOutcome::Exhausted { .. } => {
                        self.health.set_status(UpstreamStatus::Failed);
                        false
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;
    use parking_lot::Mutex;
    use tokio::time::Instant;

    /// Échoue jusqu'à la tentative `succeed_on` et note l'instant de chaque appel
    struct ScriptedConnector {
        succeed_on: Option<u32>,
        calls: Mutex<Vec<Instant>>,
        disconnects: Mutex<u32>,
    }

    impl ScriptedConnector {
        fn new(succeed_on: Option<u32>) -> Self {
            Self {
                succeed_on,
                calls: Mutex::new(Vec::new()),
                disconnects: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(&self, url: &str) -> BridgeResult<Connected> {
            let attempt = {
                let mut calls = self.calls.lock();
                calls.push(Instant::now());
                calls.len() as u32
            };
            if Some(attempt) == self.succeed_on {
                Ok(Connected {
                    url: url.to_string(),
                    generation: attempt as u64,
                })
            } else {
                Err(BridgeError::Connect {
                    url: url.to_string(),
                    reason: "refused".into(),
                })
            }
        }

        fn disconnect(&self) {
            *self.disconnects.lock() += 1;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_five_attempts_five_seconds_apart() {
        let connector = ScriptedConnector::new(None);
        let started = Instant::now();

        let outcome =
            reconnect_with_retry(&connector, "ws://matter:5580/ws", ReconnectPolicy::default()).await;

        assert_eq!(outcome, ReconnectOutcome::Exhausted { attempts: 5 });
        let calls = connector.calls.lock().clone();
        assert_eq!(calls.len(), 5);
        for pair in calls.windows(2) {
            assert_eq!(pair[1] - pair[0], Duration::from_secs(5));
        }
        assert_eq!(started.elapsed(), Duration::from_secs(20));
        assert_eq!(*connector.disconnects.lock(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_stops_further_attempts() {
        let connector = ScriptedConnector::new(Some(3));

        let outcome =
            reconnect_with_retry(&connector, "ws://matter:5580/ws", ReconnectPolicy::default()).await;

        assert_eq!(outcome, ReconnectOutcome::Connected { attempt: 3 });
        assert_eq!(connector.calls.lock().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_attempt_success_does_not_sleep() {
        let connector = ScriptedConnector::new(Some(1));
        let started = Instant::now();
        let outcome = reconnect_with_retry(&connector, "ws://m/ws", ReconnectPolicy::default()).await;
        assert_eq!(outcome, ReconnectOutcome::Connected { attempt: 1 });
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[test]
    fn test_policy_from_config() {
        let policy = ReconnectPolicy::from(&ReconnectConf {
            max_attempts: 0,
            delay_secs: 2,
        });
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.delay, Duration::from_secs(2));
        assert_eq!(ReconnectPolicy::from(&ReconnectConf::default()), ReconnectPolicy::default());
    }
}
