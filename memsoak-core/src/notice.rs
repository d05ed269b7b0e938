//! Controller notices.
//!
//! A notice is one JSON object per emission:
//!
//! ```json
//! {"noticeType": "Tunnels", "data": {"count": 1}, "timestamp": "2017-01-01T00:00:00Z"}
//! ```
//!
//! Only `Tunnels` and `Info` carry meaning for a soak run; everything else
//! decodes to [`NoticeKind::Other`].

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

/// Diagnostic `Info` messages surfaced to the operator.
pub const PEAK_ESTABLISH_TUNNELS: &str = "peak concurrent establish tunnels";
pub const PEAK_MEEK_ESTABLISH_TUNNELS: &str = "peak concurrent meek establish tunnels";

/// A decoded notice envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notice {
    #[serde(rename = "noticeType")]
    pub notice_type: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    /// Emission time as the controller wrote it. Never parsed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// What a notice means to the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum NoticeKind {
    /// Active tunnel count changed.
    Tunnels { count: i64 },
    /// Free-form informational message.
    Info { message: String },
    /// Any other notice type.
    Other(String),
}

impl Notice {
    /// Build a notice stamped with the current time.
    pub fn new(notice_type: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            notice_type: notice_type.into(),
            data,
            timestamp: Some(Utc::now().to_rfc3339()),
        }
    }

    /// `Tunnels{count}` notice.
    pub fn tunnels(count: i64) -> Self {
        let mut data = Map::new();
        data.insert("count".to_string(), Value::from(count));
        Self::new("Tunnels", data)
    }

    /// `Info{message}` notice.
    pub fn info(message: impl Into<String>) -> Self {
        let mut data = Map::new();
        data.insert("message".to_string(), Value::from(message.into()));
        Self::new("Info", data)
    }

    /// Decode a raw notice.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Encode for emission.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Classify by type and payload. `None` when a known type carries a
    /// payload of the wrong shape.
    pub fn kind(&self) -> Option<NoticeKind> {
        match self.notice_type.as_str() {
            "Tunnels" => {
                // counts arrive as JSON numbers, possibly floats
                let count = self.data.get("count")?;
                let count = count.as_i64().or_else(|| count.as_f64().map(|f| f as i64))?;
                Some(NoticeKind::Tunnels { count })
            }
            "Info" => {
                let message = self.data.get("message")?.as_str()?;
                Some(NoticeKind::Info {
                    message: message.to_string(),
                })
            }
            other => Some(NoticeKind::Other(other.to_string())),
        }
    }
}

/// Decode and classify in one step. Malformed input yields `None`.
pub fn classify(bytes: &[u8]) -> Option<NoticeKind> {
    Notice::parse(bytes).ok()?.kind()
}

/// True if an `Info` message is one of the peak-concurrency diagnostics.
pub fn is_peak_concurrency_message(message: &str) -> bool {
    message.contains(PEAK_ESTABLISH_TUNNELS) || message.contains(PEAK_MEEK_ESTABLISH_TUNNELS)
}
