//! Domain layer - Pipeline data model and pure decision logic.
//!
//! Nothing in here performs I/O or reads a clock on its own: the
//! formatter, batch accumulator, scaling policy and health store all
//! take their inputs (including time) as arguments.

pub mod backoff;
pub mod batch;
pub mod formatter;
pub mod health;
pub mod quiet_hours;
pub mod scaling;
pub mod tick;

pub use backoff::{Backoff, BackoffConfig};
pub use batch::BatchAccumulator;
pub use formatter::Formatter;
pub use health::{HealthSample, HealthState, HealthStore, HealthTransition};
pub use quiet_hours::QuietHours;
pub use scaling::{ScaleDecision, ScaleReason, ScalingConfig, ScalingPolicy, StageSample};
pub use tick::{
    CanonicalRecord, GapMarker, InstrumentId, OverflowEntry, RawTick, StreamEvent, WriteBatch,
};
