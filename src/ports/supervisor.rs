//! Supervisor Port - Service Restart Requests
//!
//! The health monitor only asks for a restart; how the service is
//! actually restarted belongs to the supervisor.

use std::fmt;

use async_trait::async_trait;

use crate::error::SupervisorError;

/// Service state as reported by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceStatus {
  Active,
  Inactive,
  Failed,
  /// Supervisor cannot tell (dry run, unknown unit).
  Unknown(String),
}

impl fmt::Display for ServiceStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Active => write!(f, "active"),
      Self::Inactive => write!(f, "inactive"),
      Self::Failed => write!(f, "failed"),
      Self::Unknown(raw) => write!(f, "unknown({raw})"),
    }
  }
}

#[async_trait]
pub trait ServiceSupervisor: Send + Sync + 'static {
  /// Request a restart of `service`.
  async fn restart(&self, service: &str) -> Result<(), SupervisorError>;

  /// Current status of `service`.
  async fn status(&self, service: &str) -> Result<ServiceStatus, SupervisorError>;
}
