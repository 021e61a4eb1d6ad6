//! Per-camera streaming session.
//!
//! A [`ConnectionSession`] owns one transport connection for one camera and
//! runs two tasks while open:
//!
//! ```text
//!            +-------------------- reader task --------------------+
//! transport -+-> decode -> latency -> alerts -> render queue (lossy) -+-> render task -> Surface
//!            +-----------------------------------------------------+
//! ```
//!
//! The reader also owns the reconnect loop. Frames are handled strictly in
//! arrival order; when the renderer falls behind, new frames are dropped
//! instead of queued.
//!
//! [`close`](ConnectionSession::close) is synchronous. Once it returns no
//! phase transition, alert publish or surface call happens for this session.

use crate::alerts::AlertBus;
use crate::config::RenderConfig;
use crate::decoder;
use crate::model::DecodedFrame;
use crate::reconnect::{ReconnectPolicy, ReconnectSchedule};
use crate::renderer::{OverlayRenderer, RenderOutcome, ResourceLedger};
use crate::state::{Indicator, PhaseEvent, SessionPhase, SessionState};
use crate::surface::Surface;
use crate::transport::{Connector, MessageStream, TransportError, TransportMessage};
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Errors returned by session lifecycle calls.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session for camera {0} is closed")]
    Closed(String),

    #[error("Session for camera {0} is already open")]
    AlreadyOpen(String),

    #[error("No tokio runtime available to drive the session")]
    NoRuntime,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Tunables for one session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub reconnect: ReconnectPolicy,

    /// Frames that may wait for the renderer before new ones are dropped
    pub render_queue: usize,

    /// Capacity of the [`SessionEvent`] broadcast channel
    pub event_capacity: usize,

    pub render: RenderConfig,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            render_queue: 1,
            event_capacity: 64,
            render: RenderConfig::default(),
        }
    }
}

/// Why a frame never reached the surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Decode,
    Render,
    Backpressure,
    /// Read from a connection that has since been lost
    Stale,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DropReason::Decode => "decode",
            DropReason::Render => "render",
            DropReason::Backpressure => "backpressure",
            DropReason::Stale => "stale",
        };
        f.write_str(s)
    }
}

/// Observable session events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    PhaseChanged {
        from: SessionPhase,
        to: SessionPhase,
    },
    FrameRendered {
        /// Gap since the previous frame; `None` for the first frame
        latency_ms: Option<u64>,
        overlays: usize,
    },
    FrameDropped {
        reason: DropReason,
    },
}

/// Counters for one session.
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    /// Messages taken off the transport
    pub frames_received: u64,
    pub frames_rendered: u64,
    /// Frames dropped because the renderer was busy
    pub frames_dropped: u64,
    /// Frames discarded because their connection was lost before drawing
    pub frames_stale: u64,
    pub decode_errors: u64,
    pub render_errors: u64,
    pub alerts_published: u64,
    pub connect_attempts: u64,
    pub reconnects: u64,
    pub last_frame_at: Option<Instant>,
}

/// Point-in-time view of a session.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub camera_id: String,
    pub endpoint: String,
    pub phase: SessionPhase,
    pub indicator: Indicator,
    pub latency_ms: Option<u64>,
    pub stats: SessionStats,
}

struct Shared {
    camera_id: String,
    state: RwLock<SessionState>,
    stats: RwLock<SessionStats>,
    indicator: watch::Sender<Indicator>,
    events: broadcast::Sender<SessionEvent>,
    alerts: AlertBus,
}

impl Shared {
    /// Drive the state machine. Returns false when the event was rejected,
    /// which after `close()` is always the case.
    fn transition(&self, event: PhaseEvent) -> bool {
        let mut state = self.state.write();
        let Some((from, to)) = state.apply(event) else {
            return false;
        };

        if from != to {
            debug!(camera_id = %self.camera_id, %from, %to, "Session phase changed");
            match to {
                SessionPhase::Open => {
                    self.indicator.send_replace(Indicator::AwaitingFrames);
                }
                SessionPhase::Reconnecting => {
                    self.indicator.send_replace(Indicator::AwaitingReconnect);
                }
                SessionPhase::Disconnected => {
                    self.indicator.send_replace(Indicator::Idle);
                }
                SessionPhase::Connecting => {}
            }
            let _ = self.events.send(SessionEvent::PhaseChanged { from, to });
        }
        true
    }

    fn is_closed(&self) -> bool {
        self.state.read().is_closed()
    }

    fn drop_frame(&self, reason: DropReason) {
        {
            let mut stats = self.stats.write();
            match reason {
                DropReason::Decode => stats.decode_errors += 1,
                DropReason::Render => stats.render_errors += 1,
                DropReason::Backpressure => stats.frames_dropped += 1,
                DropReason::Stale => stats.frames_stale += 1,
            }
        }
        match reason {
            DropReason::Decode => metrics::counter!("viewer.decode.errors").increment(1),
            DropReason::Render => metrics::counter!("viewer.render.errors").increment(1),
            DropReason::Backpressure | DropReason::Stale => {
                metrics::counter!("viewer.frames.dropped").increment(1)
            }
        }
        let _ = self.events.send(SessionEvent::FrameDropped { reason });
    }
}

struct RenderJob {
    frame: DecodedFrame,
    latency_ms: Option<u64>,
    connection: u64,
}

/// One camera's connection, decode and render pipeline.
pub struct ConnectionSession<S: Surface + 'static> {
    shared: Arc<Shared>,
    endpoint: String,
    surface: Arc<Mutex<Option<S>>>,
    renderer: OverlayRenderer,
    connector: Arc<dyn Connector>,
    options: SessionOptions,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: Surface + 'static> ConnectionSession<S> {
    pub fn new(
        camera_id: impl Into<String>,
        endpoint: impl Into<String>,
        surface: S,
        connector: Arc<dyn Connector>,
        alerts: AlertBus,
        options: SessionOptions,
    ) -> Self {
        let camera_id = camera_id.into();
        let endpoint = endpoint.into();
        let (indicator, _) = watch::channel(Indicator::Idle);
        let (events, _) = broadcast::channel(options.event_capacity.max(1));

        Self {
            shared: Arc::new(Shared {
                state: RwLock::new(SessionState::new(camera_id.clone(), endpoint.clone())),
                camera_id,
                stats: RwLock::new(SessionStats::default()),
                indicator,
                events,
                alerts,
            }),
            endpoint,
            surface: Arc::new(Mutex::new(Some(surface))),
            renderer: OverlayRenderer::new(options.render.clone()),
            connector,
            options,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn camera_id(&self) -> &str {
        &self.shared.camera_id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn phase(&self) -> SessionPhase {
        self.shared.state.read().phase()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn stats(&self) -> SessionStats {
        self.shared.stats.read().clone()
    }

    /// Inter-arrival time of the two most recent frames.
    pub fn latency_ms(&self) -> Option<u64> {
        self.shared
            .state
            .read()
            .latency
            .latency()
            .map(|d| d.as_millis() as u64)
    }

    pub fn current_indicator(&self) -> Indicator {
        *self.shared.indicator.borrow()
    }

    /// Watch the tile indicator.
    pub fn indicator(&self) -> watch::Receiver<Indicator> {
        self.shared.indicator.subscribe()
    }

    /// Subscribe to session events from this point on.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Transient image resources used by this session's renderer.
    pub fn resources(&self) -> &ResourceLedger {
        self.renderer.ledger()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            camera_id: self.shared.camera_id.clone(),
            endpoint: self.endpoint.clone(),
            phase: self.phase(),
            indicator: self.current_indicator(),
            latency_ms: self.latency_ms(),
            stats: self.stats(),
        }
    }

    /// Run `f` against the surface, if the session still holds it.
    pub fn with_surface<R>(&self, f: impl FnOnce(&S) -> R) -> Option<R> {
        self.surface.lock().as_ref().map(f)
    }

    /// Hand the surface back. Only possible once the session is closed.
    pub fn take_surface(&self) -> Option<S> {
        if !self.is_closed() {
            return None;
        }
        self.surface.lock().take()
    }

    /// Start connecting. Must be called from within a tokio runtime.
    pub fn open(&self) -> Result<(), SessionError> {
        let handle = Handle::try_current().map_err(|_| SessionError::NoRuntime)?;

        if !self.shared.transition(PhaseEvent::OpenRequested) {
            let camera_id = self.shared.camera_id.clone();
            return Err(if self.is_closed() {
                SessionError::Closed(camera_id)
            } else {
                SessionError::AlreadyOpen(camera_id)
            });
        }

        let (render_tx, render_rx) = mpsc::channel(self.options.render_queue.max(1));

        let driver = Driver {
            shared: self.shared.clone(),
            connector: self.connector.clone(),
            endpoint: self.endpoint.clone(),
            schedule: ReconnectSchedule::new(&self.options.reconnect),
            render_tx,
            cancel: self.cancel.clone(),
        };
        let render_loop = RenderLoop {
            shared: self.shared.clone(),
            surface: self.surface.clone(),
            renderer: self.renderer.clone(),
            rx: render_rx,
            cancel: self.cancel.clone(),
        };

        let reader = handle.spawn(driver.run());
        let render = handle.spawn(render_loop.run());
        self.tasks.lock().extend([reader, render]);

        info!(
            camera_id = %self.shared.camera_id,
            endpoint = %self.endpoint,
            "Session opened"
        );
        Ok(())
    }

    /// Close the session. Idempotent; the session cannot be reopened.
    pub fn close(&self) {
        if !self.shared.transition(PhaseEvent::CloseRequested) {
            return;
        }

        self.cancel.cancel();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        // Wait out a render that is already in progress
        drop(self.surface.lock());

        let stats = self.stats();
        info!(
            camera_id = %self.shared.camera_id,
            frames_rendered = stats.frames_rendered,
            reconnects = stats.reconnects,
            "Session closed"
        );
    }
}

impl<S: Surface + 'static> Drop for ConnectionSession<S> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<S: Surface + 'static> fmt::Debug for ConnectionSession<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSession")
            .field("camera_id", &self.shared.camera_id)
            .field("endpoint", &self.endpoint)
            .field("phase", &self.phase())
            .finish()
    }
}

enum StreamEnd {
    Closed,
    Failed(TransportError),
    Stopped,
}

/// Reader task: connection, reconnect loop and frame intake.
struct Driver {
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    endpoint: String,
    schedule: ReconnectSchedule,
    render_tx: mpsc::Sender<RenderJob>,
    cancel: CancellationToken,
}

impl Driver {
    async fn run(mut self) {
        let camera_id = self.shared.camera_id.clone();

        loop {
            self.shared.stats.write().connect_attempts += 1;

            let connected = tokio::select! {
                _ = self.cancel.cancelled() => return,
                result = self.connector.connect(&self.endpoint) => result,
            };

            match connected {
                Ok(stream) => {
                    if !self.shared.transition(PhaseEvent::TransportEstablished) {
                        return;
                    }
                    self.schedule.reset();
                    info!(camera_id = %camera_id, endpoint = %self.endpoint, "Connected to video stream");

                    let event = match self.pump(stream).await {
                        StreamEnd::Stopped => return,
                        StreamEnd::Closed => {
                            warn!(camera_id = %camera_id, "Video stream closed by peer");
                            PhaseEvent::TransportClosed
                        }
                        StreamEnd::Failed(e) => {
                            warn!(camera_id = %camera_id, error = %e, "Video stream failed");
                            PhaseEvent::TransportFailed
                        }
                    };
                    if !self.shared.transition(event) {
                        return;
                    }
                }
                Err(e) => {
                    warn!(
                        camera_id = %camera_id,
                        endpoint = %self.endpoint,
                        error = %e,
                        "Failed to connect to video stream"
                    );
                    if !self.shared.transition(PhaseEvent::TransportFailed) {
                        return;
                    }
                }
            }

            let delay = self.schedule.next_delay();
            info!(
                camera_id = %camera_id,
                delay_ms = delay.as_millis() as u64,
                attempt = self.schedule.attempts(),
                "Reconnecting after delay"
            );

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            if !self.shared.transition(PhaseEvent::RetryElapsed) {
                return;
            }
            self.shared.stats.write().reconnects += 1;
            metrics::counter!("viewer.reconnects").increment(1);
        }
    }

    async fn pump(&mut self, mut stream: MessageStream) -> StreamEnd {
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return StreamEnd::Stopped,
                item = stream.next() => item,
            };

            match next {
                None => return StreamEnd::Closed,
                Some(Err(e)) => return StreamEnd::Failed(e),
                Some(Ok(message)) => {
                    if !self.handle_message(message) {
                        return StreamEnd::Stopped;
                    }
                }
            }
        }
    }

    /// Returns false once the session is closed.
    fn handle_message(&self, message: TransportMessage) -> bool {
        let arrived_at = tokio::time::Instant::now().into_std();
        {
            let mut stats = self.shared.stats.write();
            stats.frames_received += 1;
            stats.last_frame_at = Some(arrived_at);
        }

        let frame = match decoder::decode_at(&message, arrived_at) {
            Ok(frame) => frame,
            Err(e) => {
                error!(
                    camera_id = %self.shared.camera_id,
                    error = %e,
                    bytes = message.len(),
                    "Dropping undecodable frame"
                );
                self.shared.drop_frame(DropReason::Decode);
                return true;
            }
        };

        let (latency, connection) = {
            let mut state = self.shared.state.write();
            if state.is_closed() {
                return false;
            }
            let connection = state.connection();
            let latency = state.latency.record(arrived_at);
            let delivered = self.shared.alerts.publish(&state.camera_id, frame.alerts());
            if !frame.alerts().is_empty() {
                debug!(
                    camera_id = %state.camera_id,
                    alerts = frame.alerts().len(),
                    subscribers = delivered,
                    "Published frame alerts"
                );
            }
            (latency, connection)
        };

        if !frame.alerts().is_empty() {
            self.shared.stats.write().alerts_published += frame.alerts().len() as u64;
        }

        let latency_ms = latency.map(|d| d.as_millis() as u64);
        if let Some(ms) = latency_ms {
            metrics::histogram!("viewer.frame.interarrival_ms").record(ms as f64);
        }

        match self.render_tx.try_send(RenderJob {
            frame,
            latency_ms,
            connection,
        }) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                trace!(camera_id = %self.shared.camera_id, "Renderer busy, dropping frame");
                self.shared.drop_frame(DropReason::Backpressure);
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// Render task: paints queued frames onto the session's surface.
struct RenderLoop<S> {
    shared: Arc<Shared>,
    surface: Arc<Mutex<Option<S>>>,
    renderer: OverlayRenderer,
    rx: mpsc::Receiver<RenderJob>,
    cancel: CancellationToken,
}

impl<S: Surface + 'static> RenderLoop<S> {
    async fn run(mut self) {
        loop {
            let job = tokio::select! {
                _ = self.cancel.cancelled() => return,
                job = self.rx.recv() => match job {
                    Some(job) => job,
                    None => return,
                },
            };

            if !self.render(job) {
                return;
            }
        }
    }

    /// Returns false once the session is closed.
    fn render(&self, job: RenderJob) -> bool {
        // Lock order: surface, then state. close() never holds both.
        let mut guard = self.surface.lock();
        {
            let state = self.shared.state.read();
            if state.is_closed() {
                return false;
            }
            if !state.is_live(job.connection) {
                drop(state);
                trace!(camera_id = %self.shared.camera_id, "Discarding frame from lost connection");
                self.shared.drop_frame(DropReason::Stale);
                return true;
            }
        }
        let Some(surface) = guard.as_mut() else {
            return false;
        };

        match self.renderer.render(&job.frame, surface) {
            Ok(RenderOutcome::Drawn { overlays, .. }) => {
                self.shared.stats.write().frames_rendered += 1;
                metrics::counter!("viewer.frames.rendered").increment(1);
                self.shared.indicator.send_if_modified(|indicator| {
                    if *indicator == Indicator::AwaitingFrames {
                        *indicator = Indicator::Idle;
                        true
                    } else {
                        false
                    }
                });
                let _ = self.shared.events.send(SessionEvent::FrameRendered {
                    latency_ms: job.latency_ms,
                    overlays,
                });
            }
            Ok(RenderOutcome::Empty) => {
                trace!(camera_id = %self.shared.camera_id, "Frame without image");
            }
            Err(e) => {
                warn!(camera_id = %self.shared.camera_id, error = %e, "Failed to render frame");
                self.shared.drop_frame(DropReason::Render);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Alert, AlertSeverity, BoundingBox, Detection, FrameMetadata};
    use crate::surface::RasterSurface;
    use crate::test_support::{binary_frame, raw_binary_frame, ScriptedConnector};
    use bytes::Bytes;
    use std::time::Duration;
    use crate::state::SessionPhase::*;

    fn session(connector: &Arc<ScriptedConnector>, bus: &AlertBus) -> ConnectionSession<RasterSurface> {
        ConnectionSession::new(
            "cam-1",
            "ws://test/ws/video/cam-1",
            RasterSurface::default(),
            connector.clone(),
            bus.clone(),
            SessionOptions::default(),
        )
    }

    async fn next_phase(events: &mut broadcast::Receiver<SessionEvent>, want: SessionPhase) {
        let wait = async {
            loop {
                if let SessionEvent::PhaseChanged { to, .. } = events.recv().await.unwrap() {
                    if to == want {
                        return;
                    }
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(1), wait)
            .await
            .expect("phase not reached");
    }

    async fn next_rendered(events: &mut broadcast::Receiver<SessionEvent>) -> (Option<u64>, usize) {
        let wait = async {
            loop {
                if let SessionEvent::FrameRendered { latency_ms, overlays } = events.recv().await.unwrap() {
                    return (latency_ms, overlays);
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(1), wait)
            .await
            .expect("no frame rendered")
    }

    fn metadata_with(detections: Vec<Detection>, alerts: Vec<Alert>) -> FrameMetadata {
        FrameMetadata {
            detections,
            alerts,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_connect_retries_once_after_delay() {
        let connector = Arc::new(ScriptedConnector::new());
        connector.fail_next("refused");
        let session = session(&connector, &AlertBus::new());
        let mut events = session.subscribe();

        session.open().unwrap();
        next_phase(&mut events, Connecting).await;
        next_phase(&mut events, Reconnecting).await;
        assert_eq!(session.current_indicator(), Indicator::AwaitingReconnect);

        tokio::time::sleep(Duration::from_millis(2990)).await;
        assert_eq!(connector.attempts(), 1);
        assert_eq!(session.phase(), Reconnecting);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(connector.attempts(), 2);
        assert_eq!(session.phase(), Connecting);

        let times = connector.attempt_times();
        assert!(times[1] - times[0] >= Duration::from_millis(3000));

        // The second attempt hangs and no other timer is armed
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.attempts(), 2);
        assert_eq!(connector.endpoints()[1], "ws://test/ws/video/cam-1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_failures_keep_single_timer() {
        let connector = Arc::new(ScriptedConnector::new());
        for _ in 0..3 {
            connector.fail_next("refused");
        }
        let session = session(&connector, &AlertBus::new());
        session.open().unwrap();

        tokio::time::sleep(Duration::from_millis(9500)).await;
        assert_eq!(connector.attempts(), 4);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(connector.attempts(), 4);
        assert_eq!(session.stats().reconnects, 3);
        assert_eq!(session.stats().connect_attempts, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_close_while_open_reconnects_once() {
        let connector = Arc::new(ScriptedConnector::new());
        let feed = connector.accept_next();
        let session = session(&connector, &AlertBus::new());
        let mut events = session.subscribe();

        session.open().unwrap();
        next_phase(&mut events, Open).await;
        assert_eq!(session.current_indicator(), Indicator::AwaitingFrames);

        drop(feed);
        next_phase(&mut events, Reconnecting).await;
        assert_eq!(session.current_indicator(), Indicator::AwaitingReconnect);

        tokio::time::sleep(Duration::from_millis(3001)).await;
        assert_eq!(session.phase(), Connecting);
        assert_eq!(connector.attempts(), 2);

        let mut connecting = 0;
        while let Ok(event) = events.try_recv() {
            if event == (SessionEvent::PhaseChanged { from: Reconnecting, to: Connecting }) {
                connecting += 1;
            }
        }
        assert_eq!(connecting, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_while_open_reconnects() {
        let connector = Arc::new(ScriptedConnector::new());
        let feed = connector.accept_next();
        let session = session(&connector, &AlertBus::new());
        let mut events = session.subscribe();

        session.open().unwrap();
        next_phase(&mut events, Open).await;

        feed.send(Err(TransportError::Protocol("reset".to_string())))
            .unwrap();
        next_phase(&mut events, Reconnecting).await;
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_cancels_pending_retry() {
        let connector = Arc::new(ScriptedConnector::new());
        connector.fail_next("refused");
        let session = session(&connector, &AlertBus::new());
        let mut events = session.subscribe();

        session.open().unwrap();
        next_phase(&mut events, Reconnecting).await;

        session.close();
        assert_eq!(session.phase(), Disconnected);
        assert_eq!(session.current_indicator(), Indicator::Idle);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(connector.attempts(), 1);
        assert_eq!(session.phase(), Disconnected);
        assert!(matches!(session.open(), Err(SessionError::Closed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_decode_error_keeps_session_open() {
        let connector = Arc::new(ScriptedConnector::new());
        let feed = connector.accept_next();
        let session = session(&connector, &AlertBus::new());
        let mut events = session.subscribe();

        session.open().unwrap();
        next_phase(&mut events, Open).await;

        feed.send(Ok(TransportMessage::Binary(Bytes::from_static(&[0, 0, 0, 50, 1]))))
            .unwrap();
        feed.send(Ok(binary_frame(&FrameMetadata::default(), 32, 24)))
            .unwrap();
        next_rendered(&mut events).await;

        assert_eq!(session.phase(), Open);
        assert_eq!(session.current_indicator(), Indicator::Idle);

        let stats = session.stats();
        assert_eq!(stats.frames_received, 2);
        assert_eq!(stats.decode_errors, 1);
        assert_eq!(stats.frames_rendered, 1);
        assert_eq!(session.with_surface(|s| s.size()), Some((32, 24)));
        assert_eq!(session.resources().outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_between_frames() {
        let connector = Arc::new(ScriptedConnector::new());
        let feed = connector.accept_next();
        let session = session(&connector, &AlertBus::new());
        let mut events = session.subscribe();

        session.open().unwrap();
        next_phase(&mut events, Open).await;

        feed.send(Ok(binary_frame(&FrameMetadata::default(), 8, 8))).unwrap();
        let (first, _) = next_rendered(&mut events).await;
        assert_eq!(first, None);

        tokio::time::sleep(Duration::from_millis(40)).await;
        feed.send(Ok(binary_frame(&FrameMetadata::default(), 8, 8))).unwrap();
        let (second, _) = next_rendered(&mut events).await;
        assert_eq!(second, Some(40));
        assert_eq!(session.latency_ms(), Some(40));
    }

    #[tokio::test(start_paused = true)]
    async fn test_alerts_published_once() {
        let connector = Arc::new(ScriptedConnector::new());
        let feed = connector.accept_next();
        let bus = AlertBus::new();
        let mut subscription = bus.subscribe();
        let session = session(&connector, &bus);
        let mut events = session.subscribe();

        session.open().unwrap();
        next_phase(&mut events, Open).await;

        let alerts = vec![Alert {
            kind: "X".to_string(),
            message: "m".to_string(),
            severity: AlertSeverity::High,
        }];
        let detections = vec![Detection {
            bbox: BoundingBox::new(10.0, 10.0, 50.0, 50.0),
            label: "drill".to_string(),
            confidence: 0.9,
            interaction: true,
            id: None,
            status: None,
        }];
        feed.send(Ok(binary_frame(&metadata_with(detections, alerts.clone()), 64, 64)))
            .unwrap();

        let (_, overlays) = next_rendered(&mut events).await;
        assert_eq!(overlays, 1);

        let batch = subscription.try_recv().unwrap();
        assert_eq!(batch.camera_id, "cam-1");
        assert_eq!(&*batch.alerts, alerts.as_slice());
        assert!(subscription.try_recv().is_err());
        assert_eq!(session.stats().alerts_published, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bare_interaction_detection_renders() {
        let connector = Arc::new(ScriptedConnector::new());
        let feed = connector.accept_next();
        let session = session(&connector, &AlertBus::new());
        let mut events = session.subscribe();

        session.open().unwrap();
        next_phase(&mut events, Open).await;

        feed.send(Ok(raw_binary_frame(
            r#"{"detections":[{"bbox":[10,10,50,50],"interaction":true}],"alerts":[]}"#,
            64,
            64,
        )))
        .unwrap();

        let (_, overlays) = next_rendered(&mut events).await;
        assert_eq!(overlays, 1);
        assert_eq!(session.stats().decode_errors, 0);
        assert_eq!(session.current_indicator(), Indicator::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_detector_rows_keep_frame_alerts() {
        let connector = Arc::new(ScriptedConnector::new());
        let feed = connector.accept_next();
        let bus = AlertBus::new();
        let mut subscription = bus.subscribe();
        let session = session(&connector, &bus);
        let mut events = session.subscribe();

        session.open().unwrap();
        next_phase(&mut events, Open).await;

        feed.send(Ok(raw_binary_frame(
            r#"{"camera_id":"0","detections":[[1.0,2.0,3.0,4.0,7.0,0.9,0.0]],"alerts":[{"type":"INTRUSION","message":"zone"}]}"#,
            32,
            32,
        )))
        .unwrap();

        let (_, overlays) = next_rendered(&mut events).await;
        assert_eq!(overlays, 0);

        let batch = subscription.try_recv().unwrap();
        assert_eq!(batch.alerts[0].kind, "INTRUSION");
        assert_eq!(session.stats().decode_errors, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_from_lost_connection_not_drawn() {
        let connector = Arc::new(ScriptedConnector::new());
        let first = connector.accept_next();
        let _second = connector.accept_next();
        let session = session(&connector, &AlertBus::new());
        let mut events = session.subscribe();

        session.open().unwrap();
        next_phase(&mut events, Open).await;

        // The frame is queued and the stream ends in the same reader pass.
        first.send(Ok(binary_frame(&FrameMetadata::default(), 16, 16))).unwrap();
        drop(first);
        next_phase(&mut events, Reconnecting).await;

        tokio::time::sleep(Duration::from_millis(3100)).await;
        assert_eq!(session.phase(), Open);
        assert_eq!(connector.attempts(), 2);

        let stats = session.stats();
        assert_eq!(stats.frames_received, 1);
        assert_eq!(stats.frames_rendered, 0);
        assert_eq!(stats.frames_stale, 1);
        assert_eq!(session.current_indicator(), Indicator::AwaitingFrames);
        assert_eq!(session.with_surface(|s| s.size()), Some((0, 0)));
        assert_eq!(session.resources().outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_renderer_drops_frames() {
        let connector = Arc::new(ScriptedConnector::new());
        let feed = connector.accept_next();
        let session = session(&connector, &AlertBus::new());
        let mut events = session.subscribe();

        session.open().unwrap();
        next_phase(&mut events, Open).await;

        for _ in 0..5 {
            feed.send(Ok(binary_frame(&FrameMetadata::default(), 8, 8))).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(1)).await;

        let stats = session.stats();
        assert_eq!(stats.frames_received, 5);
        assert!(stats.frames_dropped >= 1);
        assert_eq!(stats.frames_rendered + stats.frames_dropped, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_rendering_after_close() {
        let connector = Arc::new(ScriptedConnector::new());
        let feed = connector.accept_next();
        let session = session(&connector, &AlertBus::new());
        let mut events = session.subscribe();

        session.open().unwrap();
        next_phase(&mut events, Open).await;

        session.close();
        let _ = feed.send(Ok(binary_frame(&FrameMetadata::default(), 8, 8)));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(session.stats().frames_rendered, 0);
        let surface = session.take_surface().unwrap();
        assert_eq!(surface.size(), (0, 0));
        assert!(session.take_surface().is_none());
    }

    #[tokio::test]
    async fn test_open_twice_rejected() {
        let connector = Arc::new(ScriptedConnector::new());
        let session = session(&connector, &AlertBus::new());

        session.open().unwrap();
        assert!(matches!(session.open(), Err(SessionError::AlreadyOpen(_))));
        assert!(session.take_surface().is_none());
    }

    #[test]
    fn test_open_requires_runtime() {
        let connector = Arc::new(ScriptedConnector::new());
        let session = session(&connector, &AlertBus::new());

        assert!(matches!(session.open(), Err(SessionError::NoRuntime)));
        assert_eq!(session.phase(), Disconnected);
        assert_eq!(connector.attempts(), 0);
    }
}
