//! Feed Port - Streaming Market Data Interface
//!
//! A transport opens one session for a set of instruments and yields
//! decoded frames until the session ends or fails. Reconnecting,
//! heartbeat supervision, sequencing and deduplication are the stream
//! connector's job, not the transport's.

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::domain::tick::{InstrumentId, RawTick};
use crate::error::ConnectivityError;

/// One decoded frame from the feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedMessage {
  /// A price update. `sequence` is left at zero; the connector assigns it.
  Price(RawTick),
  /// Keep-alive frame carrying no market data, with the raw text.
  Heartbeat { payload: String },
  /// A frame that could not be decoded, with the raw text.
  Unparseable { payload: String, reason: String },
}

/// An open subscription. Ends with `None` when the server closes it.
pub type FeedSession = BoxStream<'static, Result<FeedMessage, ConnectivityError>>;

/// Streaming feed provider.
#[async_trait]
pub trait FeedTransport: Send + Sync + 'static {
  /// Open a session subscribed to `instruments`.
  ///
  /// Returns once the server has accepted the subscription; frames are
  /// then pulled from the returned session.
  async fn open(&self, instruments: &[InstrumentId]) -> Result<FeedSession, ConnectivityError>;
}
