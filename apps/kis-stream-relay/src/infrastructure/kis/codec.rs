//! Streaming Frame Codec
//!
//! Classifies inbound text frames from the KIS streaming endpoint. The
//! relay forwards frames verbatim, so decoding only extracts what routing
//! and session control need.
//!
//! # Frame formats
//!
//! - **Heartbeat**: any frame containing `PINGPONG`, e.g.
//!   `{"header":{"tr_id":"PINGPONG","datetime":"20260306093000"}}`
//! - **Control** (JSON): subscribe acknowledgements and errors,
//!   `{"header":{"tr_id":"H0STNAV0","tr_key":"102110"},"body":{"rt_cd":"0","msg_cd":"OPSP0000","msg1":"SUBSCRIBE SUCCESS"}}`
//! - **Data** (pipe-delimited): `0|H0STNAV0|001|102110^...`; the fourth
//!   field holds `^`-separated values whose first entry is the instrument.

use serde::Deserialize;

use crate::domain::streaming::Topic;

/// Substring that marks a keep-alive frame.
pub const HEARTBEAT_MARKER: &str = "PINGPONG";

/// Kind of an inbound text frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameKind {
    /// Keep-alive; echo upstream, never forward.
    Heartbeat,
    /// JSON control frame.
    Control(ControlFrame),
    /// Market data, with its topic when recognizable.
    Data {
        /// Routing topic.
        topic: Option<Topic>,
    },
}

/// Classify a text frame.
#[must_use]
pub fn classify(text: &str) -> FrameKind {
    if text.contains(HEARTBEAT_MARKER) {
        return FrameKind::Heartbeat;
    }

    let trimmed = text.trim_start();
    if trimmed.starts_with('{') {
        return match serde_json::from_str::<ControlFrame>(trimmed) {
            Ok(frame) => FrameKind::Control(frame),
            Err(e) => {
                tracing::debug!(error = %e, "Unrecognized JSON frame");
                FrameKind::Data { topic: None }
            }
        };
    }

    FrameKind::Data {
        topic: data_topic(trimmed),
    }
}

fn data_topic(text: &str) -> Option<Topic> {
    let mut fields = text.splitn(4, '|');
    let _encrypted = fields.next()?;
    let channel = fields.next()?.trim();
    let _count = fields.next()?;
    let instrument = fields.next()?.split('^').next()?.trim();

    (!channel.is_empty() && !instrument.is_empty()).then(|| Topic::new(channel, instrument))
}

/// JSON control frame.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ControlFrame {
    /// Routing header.
    #[serde(default)]
    pub header: ControlHeader,
    /// Result body, absent on some notices.
    #[serde(default)]
    pub body: Option<ControlBody>,
}

/// Control frame header.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ControlHeader {
    /// Channel id.
    #[serde(default)]
    pub tr_id: String,
    /// Instrument key.
    #[serde(default)]
    pub tr_key: String,
}

/// Control frame result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ControlBody {
    /// `"0"` on success.
    #[serde(default)]
    pub rt_cd: String,
    /// Message code.
    #[serde(default)]
    pub msg_cd: String,
    /// Message text.
    #[serde(default)]
    pub msg1: String,
}

impl ControlFrame {
    /// Topic named in the header, if complete.
    #[must_use]
    pub fn topic(&self) -> Option<Topic> {
        let channel = self.header.tr_id.trim();
        let instrument = self.header.tr_key.trim();
        (!channel.is_empty() && !instrument.is_empty()).then(|| Topic::new(channel, instrument))
    }

    /// Whether the upstream refused the request.
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        self.body.as_ref().is_some_and(|body| body.rt_cd != "0")
    }

    /// Whether the refusal is about the approval key.
    #[must_use]
    pub fn is_approval_rejection(&self) -> bool {
        self.is_rejection()
            && self
                .body
                .as_ref()
                .is_some_and(|body| body.msg1.to_ascii_lowercase().contains("approval"))
    }

    /// Message text, if any.
    #[must_use]
    pub fn message(&self) -> &str {
        self.body.as_ref().map_or("", |body| body.msg1.as_str())
    }
}
