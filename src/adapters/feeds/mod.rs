//! Market Data Feed Adapters
//!
//! - `oanda`: OANDA v3 HTTP pricing stream (line-delimited JSON)

pub mod oanda;

pub use oanda::OandaTransport;
