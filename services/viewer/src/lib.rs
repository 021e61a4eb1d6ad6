//! Live camera viewer for Nier vision streams.
//!
//! Each camera gets a [`ConnectionSession`] that connects to the vision
//! server's `/ws/video/{camera_id}` endpoint, decodes the annotated frames it
//! pushes, paints them with their interaction overlays and republishes frame
//! alerts to whoever is listening.
//!
//! # Architecture
//!
//! ```text
//!                         +--> AlertBus ----------> subscribers
//!                         |
//! Connector -> decoder ---+--> LatencyTracker
//!     ^                   |
//!     |                   +--> OverlayRenderer --> Surface
//!     |
//!  reconnect loop (ConnectionSession, one per camera in SessionRegistry)
//! ```
//!
//! Frames arrive in one of two layouts, length-prefixed binary or legacy
//! JSON with a base64 image; see [`decoder`].

pub mod alerts;
pub mod config;
pub mod decoder;
pub mod latency;
pub mod model;
pub mod notifications;
pub mod reconnect;
pub mod registry;
pub mod renderer;
pub mod session;
pub mod state;
pub mod surface;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

pub use alerts::{AlertBatch, AlertBus, AlertSubscription, SubscriberId};
pub use crate::config::{ConfigValidationError, RenderConfig, ViewerConfig};
pub use decoder::DecodeError;
pub use model::{Alert, AlertSeverity, BoundingBox, DecodedFrame, Detection, FrameFormat, FrameMetadata};
pub use notifications::{Notification, NotificationKind, NotificationListener};
pub use reconnect::ReconnectPolicy;
pub use registry::{RegistryError, SessionRegistry};
pub use renderer::{OverlayRenderer, RenderError, RenderOutcome, ResourceLedger};
pub use session::{ConnectionSession, SessionError, SessionEvent, SessionOptions, SessionSnapshot, SessionStats};
pub use state::{Indicator, SessionPhase};
pub use surface::{RasterSurface, StrokeStyle, Surface};
pub use transport::{Connector, TransportError, TransportMessage, WsConnector};
