// ABOUTME: Watermark timestamp formatting and ordering-key interpretation
// ABOUTME: Converts SQLite epoch numbers and date-time text into naive instants in one time zone

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Local, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Utc};
use rusqlite::types::Value;
use serde::Deserialize;

/// Checkpoint text format, microsecond precision.
pub const WATERMARK_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Date-time layouts accepted for TEXT ordering columns, tried in order.
const TEXT_LAYOUTS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
    "%Y/%m/%d %H:%M:%S%.f",
];

/// Time zone that watermarks, the wall clock and partition dates are expressed in.
///
/// Producers that name partitions by their local date need `Local`; a
/// watermark and a partition date must always come from the same zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TimeZoneMode {
    #[default]
    Local,
    Utc,
}

impl TimeZoneMode {
    /// Current wall clock in this zone, truncated to microseconds.
    pub fn now(self) -> NaiveDateTime {
        self.naive_from_utc(Utc::now())
    }

    pub fn naive_from_utc(self, instant: DateTime<Utc>) -> NaiveDateTime {
        let naive = match self {
            Self::Local => instant.with_timezone(&Local).naive_local(),
            Self::Utc => instant.naive_utc(),
        };
        truncate_to_micros(naive)
    }

    /// The UTC instant a naive time in this zone denotes.
    ///
    /// A repeated local hour resolves to its earlier instant. A local time
    /// skipped by a DST jump resolves with the offset after the jump, which
    /// never lands later than the first real instant following it.
    pub fn to_utc(self, ts: &NaiveDateTime) -> DateTime<Utc> {
        match self {
            Self::Utc => ts.and_utc(),
            Self::Local => match Local.from_local_datetime(ts) {
                LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => dt.with_timezone(&Utc),
                LocalResult::None => Local
                    .from_local_datetime(&(*ts + Duration::hours(3)))
                    .earliest()
                    .map(|after| {
                        let offset = Duration::seconds(i64::from(after.offset().local_minus_utc()));
                        (*ts - offset).and_utc()
                    })
                    .unwrap_or_else(|| ts.and_utc()),
            },
        }
    }

    /// Convert epoch seconds to a naive instant in this zone, rounded to the microsecond.
    pub fn naive_from_epoch(self, secs: f64) -> Option<NaiveDateTime> {
        if !secs.is_finite() {
            return None;
        }
        let micros = (secs * 1_000_000.0).round();
        if micros.abs() >= i64::MAX as f64 {
            return None;
        }
        DateTime::from_timestamp_micros(micros as i64).map(|dt| self.naive_from_utc(dt))
    }

    pub fn to_epoch_seconds(self, ts: &NaiveDateTime) -> f64 {
        self.to_utc(ts).timestamp_micros() as f64 / 1_000_000.0
    }

    /// Interpret a SQLite value as an ordering-key instant.
    ///
    /// INTEGER and REAL are Unix epoch seconds with the fraction as sub-second
    /// part. TEXT may hold a date-time or numeric epoch seconds. NULL and BLOB
    /// have no ordering and yield `None`.
    pub fn ordering_value(self, value: &Value) -> Option<NaiveDateTime> {
        match value {
            Value::Integer(secs) => self.naive_from_epoch(*secs as f64),
            Value::Real(secs) => self.naive_from_epoch(*secs),
            Value::Text(text) => {
                let trimmed = text.trim();
                self.parse_instant(trimmed).or_else(|| {
                    trimmed
                        .parse::<f64>()
                        .ok()
                        .and_then(|secs| self.naive_from_epoch(secs))
                })
            }
            Value::Null | Value::Blob(_) => None,
        }
    }

    /// Parse date-time text. Offset-qualified RFC 3339 text is shifted into
    /// this zone; anything else is taken as already in it.
    pub fn parse_instant(self, text: &str) -> Option<NaiveDateTime> {
        parse_naive(text).or_else(|| {
            DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|parsed| self.naive_from_utc(parsed.with_timezone(&Utc)))
        })
    }
}

pub fn format_watermark(ts: &NaiveDateTime) -> String {
    ts.format(WATERMARK_FORMAT).to_string()
}

/// Parse a stored watermark. Accepts the canonical form and the other naive
/// layouts, so hand-edited checkpoints work too.
pub fn parse_watermark(raw: &str) -> Result<NaiveDateTime> {
    parse_naive(raw.trim()).ok_or_else(|| anyhow!("Invalid watermark timestamp '{}'", raw))
}

/// The watermark that follows a cycle whose newest row was `max_ordering`.
pub fn next_watermark(max_ordering: NaiveDateTime) -> NaiveDateTime {
    max_ordering + Duration::microseconds(1)
}

pub fn truncate_to_micros(ts: NaiveDateTime) -> NaiveDateTime {
    let nanos = ts.and_utc().timestamp_subsec_nanos();
    ts - Duration::nanoseconds(i64::from(nanos % 1_000))
}

fn parse_naive(text: &str) -> Option<NaiveDateTime> {
    for layout in TEXT_LAYOUTS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(text, layout) {
            return Some(truncate_to_micros(parsed));
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}
