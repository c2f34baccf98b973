//! Use Cases Layer - Pipeline Stages and Control Loops
//!
//! Combines domain logic with the port interfaces into the running
//! system. Stages talk to each other only through `WorkQueue`s.
//!
//! Use cases:
//! - `StreamConnector`: resilient feed subscription producing ticks and gaps
//! - `FormatterStage`: parallel validation of raw ticks
//! - `PersistenceWriter`: batching, ordered writes, overflow spill and replay
//! - `Autoscaler`: worker count control loop
//! - `HealthMonitor`: stall inference from storage growth
//! - `Pipeline`: wiring, ingest loop and staged drain

pub mod autoscaler;
pub mod connector;
pub mod formatter_stage;
pub mod health_monitor;
pub mod pipeline;
pub mod queue;
pub mod raw_journal;
pub mod worker_pool;
pub mod writer;

pub use autoscaler::{Autoscaler, DepthSource};
pub use connector::{ConnectionState, ConnectorSettings, StreamConnector};
pub use formatter_stage::FormatterStage;
pub use health_monitor::{HealthMonitor, PollReport};
pub use pipeline::{Pipeline, PipelineReport};
pub use queue::{KeyGuard, Keyed, PushOutcome, QueueClosed, WorkQueue};
pub use raw_journal::{RawJournal, RawJournalSettings, RawJournalWriter};
pub use worker_pool::{WorkerContext, WorkerPool};
pub use writer::{PersistenceWriter, WriteJob, WriterSettings};
