//! Service Supervisor Adapters
//!
//! - `systemd`: restarts units with `systemctl`
//! - `log`: dry run, records the request in the log only

pub mod log;
pub mod systemd;

use std::sync::Arc;

pub use log::LogSupervisor;
pub use systemd::SystemdSupervisor;

use crate::config::{HealthConfig, SupervisorKind};
use crate::ports::supervisor::ServiceSupervisor;

/// Build the supervisor selected in `[health]`.
pub fn from_config(config: &HealthConfig) -> Arc<dyn ServiceSupervisor> {
    match config.supervisor {
        SupervisorKind::Systemd => Arc::new(SystemdSupervisor::new(config.supervisor_timeout())),
        SupervisorKind::Log => Arc::new(LogSupervisor::new()),
    }
}
