//! Ports Layer - Hexagonal Architecture Boundaries
//!
//! Interfaces the pipeline and the monitor require from the outside
//! world. Adapters implement these traits; tests mock them.
//!
//! Port categories:
//! - `FeedTransport`: streaming market-data subscription
//! - `RecordStore`: durable per-instrument record collections
//! - `ServiceSupervisor`: restart requests for the ingestion service

pub mod feed;
pub mod storage;
pub mod supervisor;

pub use feed::{FeedMessage, FeedSession, FeedTransport};
pub use storage::RecordStore;
pub use supervisor::{ServiceStatus, ServiceSupervisor};
