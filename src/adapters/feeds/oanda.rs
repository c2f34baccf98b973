//! OANDA v3 Pricing Stream - Line-delimited JSON over HTTP
//!
//! Opens `GET {stream_url}/v3/accounts/{account}/pricing/stream` with
//! the subscribed instruments and decodes the chunked body into one
//! `FeedMessage` per line. The server interleaves `PRICE` frames with
//! a `HEARTBEAT` roughly every five seconds.
//!
//! The transport does not reconnect; a failed or finished session is
//! handed back to the stream connector.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::config::FeedConfig;
use crate::domain::tick::{InstrumentId, RawTick};
use crate::error::ConnectivityError;
use crate::ports::feed::{FeedMessage, FeedSession, FeedTransport};

/// Lines longer than this are cut and reported as unparseable.
const MAX_LINE_BYTES: usize = 1 << 20;
/// Error bodies are truncated to this many characters.
const MAX_ERROR_BODY: usize = 512;

/// OANDA pricing frame (both `PRICE` and `HEARTBEAT`).
#[derive(Debug, Deserialize)]
struct Frame {
    #[serde(rename = "type")]
    kind: Option<String>,
    instrument: Option<String>,
    time: Option<Value>,
    #[serde(rename = "closeoutBid")]
    closeout_bid: Option<Value>,
    #[serde(rename = "closeoutAsk")]
    closeout_ask: Option<Value>,
    #[serde(default)]
    bids: Vec<PriceBucket>,
    #[serde(default)]
    asks: Vec<PriceBucket>,
    status: Option<String>,
    tradeable: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct PriceBucket {
    price: Value,
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Decode one line of the pricing stream.
pub fn parse_frame(line: &str, received_at: DateTime<Utc>) -> FeedMessage {
    let unparseable = |reason: &str| FeedMessage::Unparseable {
        payload: line.to_string(),
        reason: reason.to_string(),
    };

    let frame: Frame = match serde_json::from_str(line) {
        Ok(frame) => frame,
        Err(_) => return unparseable("invalid_json"),
    };

    match frame.kind.as_deref() {
        Some("HEARTBEAT") => {
            return FeedMessage::Heartbeat {
                payload: line.to_string(),
            }
        }
        Some("PRICE") | None => {}
        Some(_) => return unparseable("unknown_type"),
    }

    let Some(instrument) = frame.instrument.filter(|i| !i.is_empty()) else {
        return unparseable("missing_instrument");
    };

    let bid = frame
        .closeout_bid
        .as_ref()
        .and_then(scalar_text)
        .or_else(|| frame.bids.first().and_then(|b| scalar_text(&b.price)));
    let ask = frame
        .closeout_ask
        .as_ref()
        .and_then(scalar_text)
        .or_else(|| frame.asks.first().and_then(|b| scalar_text(&b.price)));

    FeedMessage::Price(RawTick {
        instrument: InstrumentId::new(instrument),
        sequence: 0,
        time: frame.time.as_ref().and_then(scalar_text),
        bid,
        ask,
        status: frame.status,
        tradeable: frame.tradeable,
        received_at,
        payload: line.to_string(),
    })
}

/// Splits a chunked body into complete, non-empty lines.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buf: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            Self::emit(&line[..line.len() - 1], &mut lines);
        }
        if self.buf.len() > MAX_LINE_BYTES {
            let line = std::mem::take(&mut self.buf);
            Self::emit(&line, &mut lines);
        }
        lines
    }

    /// Whatever is left once the body ends.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buf);
        let mut lines = Vec::new();
        Self::emit(&rest, &mut lines);
        lines.pop()
    }

    fn emit(raw: &[u8], out: &mut Vec<String>) {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let text = String::from_utf8_lossy(raw);
        let text = text.trim();
        if !text.is_empty() {
            out.push(text.to_string());
        }
    }
}

struct Decoding<S> {
    body: S,
    decoder: LineDecoder,
    ready: VecDeque<String>,
    done: bool,
}

/// HTTP streaming transport for the OANDA v3 pricing endpoint.
pub struct OandaTransport {
    client: reqwest::Client,
    stream_url: String,
    account_id: String,
    token: String,
    connect_timeout: Duration,
}

impl OandaTransport {
    /// Create a transport for `account_id` authenticated by `token`.
    pub fn new(
        stream_url: impl Into<String>,
        account_id: impl Into<String>,
        token: impl Into<String>,
        connect_timeout: Duration,
    ) -> Result<Self, ConnectivityError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .tcp_keepalive(Duration::from_secs(30))
            .build()
            .map_err(|e| ConnectivityError::Connect(e.to_string()))?;

        Ok(Self {
            client,
            stream_url: stream_url.into().trim_end_matches('/').to_string(),
            account_id: account_id.into(),
            token: token.into(),
            connect_timeout,
        })
    }

    pub fn from_config(config: &FeedConfig, token: String) -> Result<Self, ConnectivityError> {
        Self::new(
            config.stream_url.as_str(),
            config.account_id.as_str(),
            token,
            config.connect_timeout(),
        )
    }

    fn endpoint(&self, instruments: &[InstrumentId]) -> String {
        let list: Vec<&str> = instruments.iter().map(InstrumentId::as_str).collect();
        format!(
            "{}/v3/accounts/{}/pricing/stream?instruments={}",
            self.stream_url,
            self.account_id,
            list.join("%2C")
        )
    }
}

#[async_trait]
impl FeedTransport for OandaTransport {
    #[instrument(skip(self, instruments), fields(instruments = instruments.len()))]
    async fn open(&self, instruments: &[InstrumentId]) -> Result<FeedSession, ConnectivityError> {
        let url = self.endpoint(instruments);
        let request = self.client.get(&url).bearer_auth(&self.token).send();

        let response = tokio::time::timeout(self.connect_timeout, request)
            .await
            .map_err(|_| {
                ConnectivityError::Connect(format!(
                    "no response within {:?}",
                    self.connect_timeout
                ))
            })?
            .map_err(|e| ConnectivityError::Connect(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            body.truncate(
                body.char_indices()
                    .nth(MAX_ERROR_BODY)
                    .map_or(body.len(), |(i, _)| i),
            );
            return Err(ConnectivityError::Http {
                status: status.as_u16(),
                body,
            });
        }

        info!(%status, "Pricing stream opened");

        let state = Decoding {
            body: response.bytes_stream().boxed(),
            decoder: LineDecoder::new(),
            ready: VecDeque::new(),
            done: false,
        };

        let session = stream::unfold(state, |mut s| async move {
            loop {
                if let Some(line) = s.ready.pop_front() {
                    return Some((Ok(parse_frame(&line, Utc::now())), s));
                }
                if s.done {
                    return None;
                }
                match s.body.next().await {
                    Some(Ok(chunk)) => {
                        let lines = s.decoder.push(&chunk);
                        s.ready.extend(lines);
                    }
                    Some(Err(e)) => {
                        s.done = true;
                        return Some((Err(ConnectivityError::Read(e.to_string())), s));
                    }
                    None => {
                        debug!("Pricing stream body ended");
                        s.done = true;
                        if let Some(rest) = s.decoder.finish() {
                            s.ready.push_back(rest);
                        }
                    }
                }
            }
        });

        Ok(session.boxed())
    }
}
