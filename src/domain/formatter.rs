//! Tick Formatter - Raw Tick → Canonical Record
//!
//! Pure, stateless validation and normalization. The same `Formatter`
//! value can be shared by any number of workers: it holds only the
//! immutable rules it was built with.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::domain::tick::{CanonicalRecord, RawTick};
use crate::error::ValidationError;

/// Validation rules applied to every tick.
#[derive(Debug, Clone, Copy)]
pub struct Formatter {
    /// Maximum accepted `(ask - bid) / bid`.
    max_spread_ratio: Decimal,
}

impl Formatter {
    pub const fn new(max_spread_ratio: Decimal) -> Self {
        Self { max_spread_ratio }
    }

    /// Validate a raw tick and produce its canonical record.
    ///
    /// # Errors
    /// Returns the first rule the tick violates.
    pub fn format(&self, tick: &RawTick) -> Result<CanonicalRecord, ValidationError> {
        let time = tick
            .time
            .as_deref()
            .ok_or(ValidationError::MissingField("time"))?;
        let time = parse_timestamp(time)?;

        let bid = parse_price("bid", tick.bid.as_deref())?;
        let ask = parse_price("ask", tick.ask.as_deref())?;

        if ask < bid {
            return Err(ValidationError::CrossedQuote {
                bid: bid.to_string(),
                ask: ask.to_string(),
            });
        }

        // Overflows only for absurd quotes; those are too wide as well.
        match (ask - bid).checked_div(bid) {
            Some(ratio) if ratio <= self.max_spread_ratio => {}
            ratio => {
                return Err(ValidationError::SpreadTooWide {
                    ratio: ratio.map_or_else(|| "overflow".to_string(), |r| r.round_dp(6).to_string()),
                    max: self.max_spread_ratio.to_string(),
                });
            }
        }

        Ok(CanonicalRecord {
            instrument: tick.instrument.clone(),
            sequence: tick.sequence,
            time,
            bid,
            ask,
            status: tick.status.clone(),
            tradeable: tick.tradeable.unwrap_or(true),
            received_at: tick.received_at,
        })
    }
}

fn parse_price(field: &'static str, raw: Option<&str>) -> Result<Decimal, ValidationError> {
    let raw = raw.ok_or(ValidationError::MissingField(field))?.trim();
    if raw.is_empty() {
        return Err(ValidationError::MissingField(field));
    }

    let value = Decimal::from_str(raw)
        .or_else(|_| Decimal::from_scientific(raw))
        .map_err(|_| ValidationError::InvalidNumber {
            field,
            value: raw.to_string(),
        })?;

    if value <= Decimal::ZERO {
        return Err(ValidationError::OutOfRange {
            field,
            value: value.to_string(),
        });
    }

    Ok(value)
}

/// Accepts RFC 3339 with any offset, or UNIX seconds with an optional
/// fractional part (the feed's `UNIX` datetime format).
fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, ValidationError> {
    let raw = raw.trim();

    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }

    let invalid = || ValidationError::InvalidTimestamp(raw.to_string());

    let (secs, frac) = raw.split_once('.').unwrap_or((raw, ""));
    if secs.is_empty() || !secs.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    if !frac.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }

    let secs: i64 = secs.parse().map_err(|_| invalid())?;
    let nanos: u32 = if frac.is_empty() {
        0
    } else {
        let digits: String = frac.chars().chain(std::iter::repeat('0')).take(9).collect();
        digits.parse().map_err(|_| invalid())?
    };

    DateTime::from_timestamp(secs, nanos).ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    use super::*;

    fn tick() -> RawTick {
        RawTick {
            instrument: "EUR_USD".into(),
            sequence: 7,
            time: Some("2024-03-01T14:30:00.123456789Z".into()),
            bid: Some("1.08412".into()),
            ask: Some("1.08426".into()),
            status: Some("tradeable".into()),
            tradeable: Some(true),
            received_at: Utc::now(),
            payload: String::new(),
        }
    }

    fn formatter() -> Formatter {
        Formatter::new(dec!(0.05))
    }

    #[test]
    fn formats_valid_tick() {
        let record = formatter().format(&tick()).unwrap();
        assert_eq!(record.sequence, 7);
        assert_eq!(record.bid, dec!(1.08412));
        assert_eq!(record.ask, dec!(1.08426));
        assert_eq!(record.time.timestamp_subsec_nanos(), 123_456_789);
        assert!(record.tradeable);
    }

    #[test]
    fn normalizes_offset_to_utc() {
        let mut t = tick();
        t.time = Some("2024-03-01T16:30:00+02:00".into());
        let record = formatter().format(&t).unwrap();
        assert_eq!(record.time, Utc.with_ymd_and_hms(2024, 3, 1, 14, 30, 0).unwrap());
    }

    #[test]
    fn accepts_unix_seconds() {
        let mut t = tick();
        t.time = Some("1709303400.5".into());
        let record = formatter().format(&t).unwrap();
        assert_eq!(record.time.timestamp(), 1_709_303_400);
        assert_eq!(record.time.timestamp_subsec_millis(), 500);
    }

    #[test]
    fn rejects_missing_price_field() {
        let mut t = tick();
        t.ask = None;
        assert_eq!(
            formatter().format(&t),
            Err(ValidationError::MissingField("ask"))
        );
    }

    #[test]
    fn rejects_non_numeric_and_non_positive() {
        let mut t = tick();
        t.bid = Some("abc".into());
        assert!(matches!(
            formatter().format(&t),
            Err(ValidationError::InvalidNumber { field: "bid", .. })
        ));

        t.bid = Some("0".into());
        assert!(matches!(
            formatter().format(&t),
            Err(ValidationError::OutOfRange { field: "bid", .. })
        ));
    }

    #[test]
    fn rejects_crossed_and_wide_quotes() {
        let mut t = tick();
        t.bid = Some("1.2".into());
        t.ask = Some("1.1".into());
        assert!(matches!(
            formatter().format(&t),
            Err(ValidationError::CrossedQuote { .. })
        ));

        t.bid = Some("1.0".into());
        t.ask = Some("1.5".into());
        assert!(matches!(
            formatter().format(&t),
            Err(ValidationError::SpreadTooWide { .. })
        ));
    }

    #[test]
    fn rejects_bad_timestamps() {
        for raw in ["", "yesterday", "12.3.4", "-5"] {
            let mut t = tick();
            t.time = Some(raw.into());
            assert!(
                matches!(formatter().format(&t), Err(ValidationError::InvalidTimestamp(_))),
                "{raw:?} should be rejected"
            );
        }
    }
}
