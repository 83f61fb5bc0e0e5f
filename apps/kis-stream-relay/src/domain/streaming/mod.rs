//! Market Data Streaming Types
//!
//! Core domain types for the relay: upstream topics, raw ticks, quote
//! snapshots and the envelope delivered to downstream consumers.
//!
//! Ticks are relayed verbatim. The relay never decodes the caret-separated
//! payload beyond extracting the topic used for routing.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// =============================================================================
// Topic
// =============================================================================

/// An upstream subscription key: channel (`tr_id`) plus instrument (`tr_key`).
///
/// Written as `CHANNEL:INSTRUMENT`, e.g. `H0STNAV0:102110`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic {
    channel_id: String,
    instrument_key: String,
}

impl Topic {
    /// Create a topic.
    #[must_use]
    pub fn new(channel_id: impl Into<String>, instrument_key: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            instrument_key: instrument_key.into(),
        }
    }

    /// Upstream channel identifier (`tr_id`).
    #[must_use]
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Instrument key (`tr_key`).
    #[must_use]
    pub fn instrument_key(&self) -> &str {
        &self.instrument_key
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.channel_id, self.instrument_key)
    }
}

impl FromStr for Topic {
    type Err = TopicParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (channel, instrument) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| TopicParseError(s.to_string()))?;
        let channel = channel.trim();
        let instrument = instrument.trim();
        if channel.is_empty() || instrument.is_empty() || instrument.contains(':') {
            return Err(TopicParseError(s.to_string()));
        }
        Ok(Self::new(channel, instrument))
    }
}

/// A topic string was not of the form `CHANNEL:INSTRUMENT`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid topic '{0}': expected CHANNEL:INSTRUMENT")]
pub struct TopicParseError(pub String);

// =============================================================================
// Tick
// =============================================================================

/// One upstream frame, as received. Transient; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tick {
    /// Raw frame text.
    pub raw: String,
    /// Routing topic, when it could be extracted from the frame.
    pub topic: Option<Topic>,
    /// Receipt time at the relay.
    pub received_at: DateTime<Utc>,
}

impl Tick {
    /// Create a tick received now.
    #[must_use]
    pub fn new(raw: String, topic: Option<Topic>) -> Self {
        Self {
            raw,
            topic,
            received_at: Utc::now(),
        }
    }
}

// =============================================================================
// Quotes and Snapshots
// =============================================================================

/// The fields of a REST price quote the relay cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceQuote {
    /// Current price.
    pub price: Decimal,
    /// Change versus previous close.
    pub change: Decimal,
    /// Change versus previous close, in percent.
    pub change_percent: Decimal,
    /// Exchange business date, when reported.
    pub business_date: Option<NaiveDate>,
}

/// A periodic quote sample, broadcast downstream and appended to the log.
///
/// Serialized with the brokerage field names so downstream dashboards can
/// consume snapshots and raw quotes alike.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Capture time at the relay.
    pub captured_at: DateTime<Utc>,
    /// Current price.
    #[serde(rename = "stck_prpr")]
    pub price: Decimal,
    /// Change versus previous close.
    #[serde(rename = "prdy_vrss")]
    pub change: Decimal,
    /// Change versus previous close, in percent.
    #[serde(rename = "prdy_ctrt")]
    pub change_percent: Decimal,
    /// Exchange business date.
    #[serde(rename = "stck_bsop_date", with = "compact_date")]
    pub business_date: NaiveDate,
}

impl Snapshot {
    /// Project a quote into a snapshot.
    ///
    /// Quotes without a business date are stamped with `fallback_date`.
    #[must_use]
    pub fn from_quote(
        quote: PriceQuote,
        captured_at: DateTime<Utc>,
        fallback_date: NaiveDate,
    ) -> Self {
        Self {
            captured_at,
            price: quote.price,
            change: quote.change,
            change_percent: quote.change_percent,
            business_date: quote.business_date.unwrap_or(fallback_date),
        }
    }
}

/// `YYYYMMDD` dates, as used by the brokerage.
pub mod compact_date {
    use chrono::NaiveDate;
    use serde::{Deserialize, Deserializer, Serializer};

    /// Format string for compact dates.
    pub const FORMAT: &str = "%Y%m%d";

    /// Serialize as `YYYYMMDD`.
    ///
    /// # Errors
    ///
    /// Propagates serializer errors.
    pub fn serialize<S: Serializer>(date: &NaiveDate, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&date.format(FORMAT))
    }

    /// Deserialize from `YYYYMMDD`.
    ///
    /// # Errors
    ///
    /// Fails when the string is not a valid compact date.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDate, D::Error> {
        let raw = String::deserialize(deserializer)?;
        NaiveDate::parse_from_str(&raw, FORMAT).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Relay Envelope
// =============================================================================

/// Message delivered to downstream consumers.
///
/// Serializes as `{"type":"tick","data":"<raw frame>"}` or
/// `{"type":"snapshot_5min","data":{...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum RelayMessage {
    /// A raw upstream frame.
    #[serde(rename = "tick")]
    Tick(String),
    /// A periodic quote snapshot.
    #[serde(rename = "snapshot_5min")]
    Snapshot(Snapshot),
}

impl RelayMessage {
    /// Message kind label.
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        match self {
            Self::Tick(_) => MessageKind::Tick,
            Self::Snapshot(_) => MessageKind::Snapshot,
        }
    }
}

impl From<Tick> for RelayMessage {
    fn from(tick: Tick) -> Self {
        Self::Tick(tick.raw)
    }
}

/// Kinds of downstream message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Raw feed frame.
    Tick,
    /// Quote snapshot.
    Snapshot,
}

impl MessageKind {
    /// Label used in metrics and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tick => "tick",
            Self::Snapshot => "snapshot",
        }
    }
}

// =============================================================================
// Feed Phase
// =============================================================================

/// Lifecycle phase of the upstream feed connection.
///
/// `Disconnected -> Connecting -> Subscribed -> Streaming`, back to
/// `Disconnected` on any failure. `Stopped` is terminal and only entered on
/// shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedPhase {
    /// No connection; waiting out backoff or not yet started.
    #[default]
    Disconnected,
    /// Obtaining an approval key and opening the transport.
    Connecting,
    /// Sending subscribe frames.
    Subscribed,
    /// Reading frames and relaying them.
    Streaming,
    /// Shut down.
    Stopped,
}

impl FeedPhase {
    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Subscribed => "subscribed",
            Self::Streaming => "streaming",
            Self::Stopped => "stopped",
        }
    }

    /// Numeric code for the phase gauge.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Disconnected => 0,
            Self::Connecting => 1,
            Self::Subscribed => 2,
            Self::Streaming => 3,
            Self::Stopped => 4,
        }
    }
}

impl fmt::Display for FeedPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Tests
// =============================================================================
