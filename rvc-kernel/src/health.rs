use crate::state::{new_state, Shared, UpstreamStatus};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Serialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub upstream_status: UpstreamStatus,
    pub upstream_reconnects: u32,
    pub upstream_url: Option<String>,
    pub nodes_tracked: usize,
    pub subscribers: usize,
    pub pending_commands: usize,
    pub memory_usage_mb: f32,
}

/// Compteurs de santé partagés entre superviseur et API
#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    reconnects: Arc<AtomicU32>,
    status: Shared<UpstreamStatus>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            reconnects: Arc::new(AtomicU32::new(0)),
            status: new_state(UpstreamStatus::Disconnected),
        }
    }

    pub fn set_status(&self, status: UpstreamStatus) {
        *self.status.lock() = status;
    }

    pub fn status(&self) -> UpstreamStatus {
        *self.status.lock()
    }

    pub fn increment_reconnects(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
        self.set_status(UpstreamStatus::Reconnecting);
    }

    pub fn reconnects(&self) -> u32 {
        self.reconnects.load(Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

pub fn memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let rss_kb = status
                .lines()
                .find(|line| line.starts_with("VmRSS:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<u64>().ok());
            if let Some(kb) = rss_kb {
                return kb as f32 / 1024.0;
            }
        }
    }
    0.0
}
