//! Validation notifications side channel.
//!
//! The vision server pushes `{"type", "message", "data"}` text messages on
//! `/ws/notifications` whenever a stock change is detected, approved or
//! rejected. [`NotificationListener`] keeps that connection alive with the
//! same reconnect policy as the video sessions and rebroadcasts what it
//! receives. Presenting them is left to the caller.

use crate::reconnect::{ReconnectPolicy, ReconnectSchedule};
use crate::transport::{Connector, TransportMessage};
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Errors returned by [`NotificationListener::start`].
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("Notification listener already started")]
    AlreadyStarted,

    #[error("No tokio runtime available to drive the listener")]
    NoRuntime,
}

/// How a notification should be presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    Created,
    Approved,
    Rejected,
    Info,
}

impl NotificationKind {
    /// Map a server tag such as `VALIDATION_APPROVED` to a kind.
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "VALIDATION_CREATED" => NotificationKind::Created,
            "VALIDATION_APPROVED" => NotificationKind::Approved,
            "VALIDATION_REJECTED" => NotificationKind::Rejected,
            _ => NotificationKind::Info,
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NotificationKind::Created => "created",
            NotificationKind::Approved => "approved",
            NotificationKind::Rejected => "rejected",
            NotificationKind::Info => "info",
        };
        f.write_str(s)
    }
}

/// One notification from the server.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub kind: NotificationKind,
    /// The raw `type` tag
    pub tag: String,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct RawNotification {
    #[serde(rename = "type")]
    tag: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

/// Parse one notification message.
pub fn parse_notification(text: &str) -> Result<Notification, serde_json::Error> {
    let raw: RawNotification = serde_json::from_str(text)?;
    Ok(Notification {
        kind: NotificationKind::from_tag(&raw.tag),
        tag: raw.tag,
        message: raw.message,
        data: raw.data,
    })
}

/// Reconnecting reader for the notification endpoint.
pub struct NotificationListener {
    endpoint: String,
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    sender: broadcast::Sender<Notification>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl NotificationListener {
    pub fn new(
        endpoint: impl Into<String>,
        connector: Arc<dyn Connector>,
        policy: ReconnectPolicy,
        capacity: usize,
    ) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            endpoint: endpoint.into(),
            connector,
            policy,
            sender,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }

    pub fn start(&self) -> Result<(), ListenerError> {
        let handle = Handle::try_current().map_err(|_| ListenerError::NoRuntime)?;
        let mut task = self.task.lock();
        if task.is_some() || self.cancel.is_cancelled() {
            return Err(ListenerError::AlreadyStarted);
        }

        let endpoint = self.endpoint.clone();
        let connector = self.connector.clone();
        let schedule = ReconnectSchedule::new(&self.policy);
        let sender = self.sender.clone();
        let cancel = self.cancel.clone();

        *task = Some(handle.spawn(listen(endpoint, connector, schedule, sender, cancel)));
        info!(endpoint = %self.endpoint, "Notification listener started");
        Ok(())
    }

    pub fn stop(&self) {
        self.cancel.cancel();
        if let Some(task) = self.task.lock().take() {
            task.abort();
            info!(endpoint = %self.endpoint, "Notification listener stopped");
        }
    }
}

impl Drop for NotificationListener {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn listen(
    endpoint: String,
    connector: Arc<dyn Connector>,
    mut schedule: ReconnectSchedule,
    sender: broadcast::Sender<Notification>,
    cancel: CancellationToken,
) {
    loop {
        let connected = tokio::select! {
            _ = cancel.cancelled() => return,
            result = connector.connect(&endpoint) => result,
        };

        match connected {
            Ok(mut stream) => {
                schedule.reset();
                debug!(endpoint = %endpoint, "Notification channel connected");

                loop {
                    let next = tokio::select! {
                        _ = cancel.cancelled() => return,
                        item = stream.next() => item,
                    };
                    match next {
                        Some(Ok(message)) => forward(&sender, message),
                        Some(Err(e)) => {
                            warn!(endpoint = %endpoint, error = %e, "Notification channel failed");
                            break;
                        }
                        None => {
                            warn!(endpoint = %endpoint, "Notification channel closed");
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(endpoint = %endpoint, error = %e, "Failed to connect notification channel");
            }
        }

        let delay = schedule.next_delay();
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

fn forward(sender: &broadcast::Sender<Notification>, message: TransportMessage) {
    let text = match &message {
        TransportMessage::Text(text) => text.as_str(),
        TransportMessage::Binary(data) => match std::str::from_utf8(data) {
            Ok(text) => text,
            Err(_) => {
                debug!(bytes = data.len(), "Ignoring binary notification");
                return;
            }
        },
    };

    match parse_notification(text) {
        Ok(notification) => {
            debug!(kind = %notification.kind, tag = %notification.tag, "Notification received");
            let _ = sender.send(notification);
        }
        Err(e) => warn!(error = %e, "Ignoring malformed notification"),
    }
}
