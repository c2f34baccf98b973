//! Adapters Layer - Hexagonal Architecture Outer Ring
//!
//! Implements the port traits defined in `crate::ports` with concrete
//! external dependencies (streaming HTTP, local files, systemd). Each
//! sub-module groups adapters by infrastructure concern.
//!
//! Adapter categories:
//! - `feeds`: OANDA streaming price transport
//! - `metrics`: Prometheus metrics export and health checks
//! - `storage`: JSON-lines record store and the overflow spill buffer
//! - `supervisor`: service restart via systemctl or dry-run logging

pub mod feeds;
pub mod metrics;
pub mod storage;
pub mod supervisor;
