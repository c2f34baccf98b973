//! Dry-run supervisor: logs restart requests without acting on them.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tracing::warn;

use crate::error::SupervisorError;
use crate::ports::supervisor::{ServiceStatus, ServiceSupervisor};

#[derive(Debug, Default)]
pub struct LogSupervisor {
    restarts: AtomicU64,
}

impl LogSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restart requests received so far.
    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ServiceSupervisor for LogSupervisor {
    async fn restart(&self, service: &str) -> Result<(), SupervisorError> {
        let n = self.restarts.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(service, request = n, "Restart requested (dry run, not executed)");
        Ok(())
    }

    async fn status(&self, _service: &str) -> Result<ServiceStatus, SupervisorError> {
        Ok(ServiceStatus::Unknown("dry-run".to_string()))
    }
}
