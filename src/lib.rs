//! Tidepool - Tick Ingestion Pipeline Library Root
//!
//! Re-exports all modules for the binaries, integration tests and
//! benchmarks.

pub mod adapters;
pub mod config;
pub mod domain;
pub mod error;
pub mod ports;
pub mod usecases;
