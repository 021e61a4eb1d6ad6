//! Camera id to session registry.
//!
//! A session is created the first time a camera is viewed and destroyed when
//! the view is released. All sessions share one connector and one alert bus
//! but nothing else.

use crate::alerts::AlertBus;
use crate::session::{ConnectionSession, SessionError, SessionEvent, SessionOptions, SessionSnapshot};
use crate::state::{Indicator, SessionPhase};
use crate::surface::Surface;
use crate::transport::{video_endpoint, Connector, TransportError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::info;

/// Errors returned by the registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Camera {0} is already being viewed")]
    AlreadyViewed(String),

    #[error("Camera {0} is not being viewed")]
    NotViewed(String),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Live sessions keyed by camera id.
pub struct SessionRegistry<S: Surface + 'static> {
    base_url: String,
    connector: Arc<dyn Connector>,
    alerts: AlertBus,
    options: SessionOptions,
    sessions: RwLock<HashMap<String, ConnectionSession<S>>>,
}

impl<S: Surface + 'static> SessionRegistry<S> {
    pub fn new(
        base_url: impl Into<String>,
        connector: Arc<dyn Connector>,
        alerts: AlertBus,
        options: SessionOptions,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            connector,
            alerts,
            options,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn alerts(&self) -> &AlertBus {
        &self.alerts
    }

    /// Start viewing `camera_id` on `surface`.
    pub fn view(&self, camera_id: &str, surface: S) -> Result<(), RegistryError> {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(camera_id) {
            return Err(RegistryError::AlreadyViewed(camera_id.to_string()));
        }

        let endpoint = video_endpoint(&self.base_url, camera_id)?;
        let session = ConnectionSession::new(
            camera_id,
            endpoint,
            surface,
            self.connector.clone(),
            self.alerts.clone(),
            self.options.clone(),
        );
        session.open()?;

        sessions.insert(camera_id.to_string(), session);
        info!(camera_id = %camera_id, active = sessions.len(), "Camera view started");
        Ok(())
    }

    /// Stop viewing `camera_id` and get its surface back.
    pub fn release(&self, camera_id: &str) -> Result<S, RegistryError> {
        let session = self
            .sessions
            .write()
            .remove(camera_id)
            .ok_or_else(|| RegistryError::NotViewed(camera_id.to_string()))?;

        session.close();
        info!(camera_id = %camera_id, "Camera view released");

        session
            .take_surface()
            .ok_or_else(|| RegistryError::NotViewed(camera_id.to_string()))
    }

    pub fn contains(&self, camera_id: &str) -> bool {
        self.sessions.read().contains_key(camera_id)
    }

    pub fn phase(&self, camera_id: &str) -> Option<SessionPhase> {
        self.sessions.read().get(camera_id).map(|s| s.phase())
    }

    pub fn indicator(&self, camera_id: &str) -> Option<watch::Receiver<Indicator>> {
        self.sessions.read().get(camera_id).map(|s| s.indicator())
    }

    pub fn subscribe(&self, camera_id: &str) -> Option<broadcast::Receiver<SessionEvent>> {
        self.sessions.read().get(camera_id).map(|s| s.subscribe())
    }

    pub fn snapshot(&self, camera_id: &str) -> Option<SessionSnapshot> {
        self.sessions.read().get(camera_id).map(|s| s.snapshot())
    }

    /// Snapshots of every session, ordered by camera id.
    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        let mut snapshots: Vec<_> = self.sessions.read().values().map(|s| s.snapshot()).collect();
        snapshots.sort_by(|a, b| a.camera_id.cmp(&b.camera_id));
        snapshots
    }

    pub fn camera_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.sessions.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Close and remove every session. Returns how many were closed.
    pub fn close_all(&self) -> usize {
        let sessions: Vec<_> = self.sessions.write().drain().collect();
        for (_, session) in &sessions {
            session.close();
        }
        if !sessions.is_empty() {
            info!(count = sessions.len(), "Closed all camera views");
        }
        sessions.len()
    }
}

impl<S: Surface + 'static> std::fmt::Debug for SessionRegistry<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("base_url", &self.base_url)
            .field("cameras", &self.camera_ids())
            .finish()
    }
}
