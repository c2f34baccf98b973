//! Storage Adapters
//!
//! - `jsonl`: append-only JSON-lines record store implementing `RecordStore`
//! - `overflow`: durable spill buffer used by the persistence writer

pub mod jsonl;
pub mod overflow;

pub use jsonl::JsonlStore;
pub use overflow::{OverflowBuffer, OverflowKey};
