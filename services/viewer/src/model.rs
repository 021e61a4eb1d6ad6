//! Frame metadata types shared by the decoder, renderer and alert bus.
//!
//! These mirror the JSON metadata block produced by the vision server:
//!
//! ```json
//! {
//!   "camera_id": "cam-1",
//!   "timestamp": 1718.25,
//!   "detections": [{"bbox": [10, 10, 50, 50], "class": "drill", "confidence": 0.91, "interaction": true}],
//!   "alerts": [{"type": "INTRUSION", "message": "Person in zone", "severity": "high"}]
//! }
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;
use tracing::debug;

/// Axis-aligned box in image pixel space, `(x1, y1)` top-left and `(x2, y2)` bottom-right.
///
/// Serialized as a 4-element array `[x1, y1, x2, y2]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).abs()
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).abs()
    }
}

impl From<[f32; 4]> for BoundingBox {
    fn from(v: [f32; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }
}

impl From<BoundingBox> for [f32; 4] {
    fn from(b: BoundingBox) -> Self {
        [b.x1, b.y1, b.x2, b.y2]
    }
}

/// One object recognized in a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Bounding box in image pixels
    pub bbox: BoundingBox,

    /// Object class (the server emits it as `class`)
    #[serde(default, alias = "class")]
    pub label: String,

    /// Detector confidence (0.0 - 1.0)
    #[serde(default)]
    pub confidence: f32,

    /// Whether the object is currently being handled
    #[serde(default)]
    pub interaction: bool,

    /// Tracker identifier, when the producer tracks objects across frames
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,

    /// Stability status reported by the temporal engine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Alert severity.
///
/// Parsed case-insensitively. Producers that omit the field, or send an
/// unrecognised value, get [`AlertSeverity::Medium`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum AlertSeverity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl From<String> for AlertSeverity {
    fn from(s: String) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "low" | "info" => AlertSeverity::Low,
            "high" | "error" => AlertSeverity::High,
            "critical" => AlertSeverity::Critical,
            _ => AlertSeverity::Medium,
        }
    }
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AlertSeverity::Low => "low",
            AlertSeverity::Medium => "medium",
            AlertSeverity::High => "high",
            AlertSeverity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Out-of-band event attached to a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Alert tag, e.g. `INTRUSION`
    #[serde(rename = "type")]
    pub kind: String,

    /// Human-readable description
    pub message: String,

    #[serde(default)]
    pub severity: AlertSeverity,
}

/// Metadata block carried alongside every frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameMetadata {
    /// Unreadable entries are skipped so they never cost the frame its alerts.
    #[serde(default, deserialize_with = "lenient_detections")]
    pub detections: Vec<Detection>,

    #[serde(default)]
    pub alerts: Vec<Alert>,

    /// Camera the frame was produced for (informational)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera_id: Option<String>,

    /// Producer clock at capture, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
}

impl Detection {
    /// Build a detection from a raw detector row `[x1, y1, x2, y2, (id), conf, cls]`.
    ///
    /// Rows carry no interaction flag, so `interaction` is false.
    pub fn from_row(row: &[f32]) -> Option<Self> {
        if row.len() < 4 {
            return None;
        }
        let bbox = BoundingBox::new(row[0], row[1], row[2], row[3]);

        let (id, confidence, label) = match row.len() {
            4 | 5 => (None, 0.0, String::new()),
            6 => (None, row[4], (row[5] as i64).to_string()),
            n => (
                Some(serde_json::Value::from(row[4] as i64)),
                row[n - 2],
                (row[n - 1] as i64).to_string(),
            ),
        };

        Some(Self {
            bbox,
            label,
            confidence,
            interaction: false,
            id,
            status: None,
        })
    }
}

fn lenient_detections<'de, D>(deserializer: D) -> Result<Vec<Detection>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Option::<Vec<serde_json::Value>>::deserialize(deserializer)?.unwrap_or_default();

    let mut detections = Vec::with_capacity(raw.len());
    for value in raw {
        let parsed = match &value {
            serde_json::Value::Array(_) => serde_json::from_value::<Vec<f32>>(value.clone())
                .ok()
                .and_then(|row| Detection::from_row(&row)),
            serde_json::Value::Object(_) => serde_json::from_value::<Detection>(value.clone()).ok(),
            _ => None,
        };

        match parsed {
            Some(detection) => detections.push(detection),
            None => debug!(detection = %value, "Skipping unreadable detection"),
        }
    }
    Ok(detections)
}

/// Wire layout a frame arrived in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    /// `[u32 length][JSON metadata][JPEG]`
    Binary,
    /// `{"type": "frame", "data": "<base64>", ...}`
    LegacyText,
}

/// A decoded frame, alive for one render cycle.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub metadata: FrameMetadata,

    /// Encoded image bytes; for binary frames a zero-copy slice of the transport buffer
    pub image: Bytes,

    pub format: FrameFormat,

    /// When the transport handed the message over
    pub arrived_at: Instant,
}

impl DecodedFrame {
    pub fn detections(&self) -> &[Detection] {
        &self.metadata.detections
    }

    pub fn alerts(&self) -> &[Alert] {
        &self.metadata.alerts
    }

    pub fn has_image(&self) -> bool {
        !self.image.is_empty()
    }
}
