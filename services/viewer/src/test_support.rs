//! Fixtures shared by the unit tests.

use crate::decoder::encode_binary;
use crate::model::FrameMetadata;
use crate::transport::{Connector, MessageStream, TransportError, TransportMessage};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::Cursor;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Encode a solid-colour JPEG.
pub(crate) fn jpeg(width: u32, height: u32) -> Bytes {
    let img = RgbImage::from_pixel(width, height, Rgb([40, 80, 120]));
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut buf, ImageFormat::Jpeg)
        .expect("encode jpeg");
    Bytes::from(buf.into_inner())
}

/// A binary-layout message carrying `metadata` and a JPEG of the given size.
pub(crate) fn binary_frame(metadata: &FrameMetadata, width: u32, height: u32) -> TransportMessage {
    let data = encode_binary(metadata, &jpeg(width, height)).expect("encode frame");
    TransportMessage::Binary(data)
}

/// A binary-layout message with the metadata JSON exactly as the producer wrote it.
pub(crate) fn raw_binary_frame(metadata_json: &str, width: u32, height: u32) -> TransportMessage {
    let mut out = Vec::new();
    out.extend_from_slice(&(metadata_json.len() as u32).to_be_bytes());
    out.extend_from_slice(metadata_json.as_bytes());
    out.extend_from_slice(&jpeg(width, height));
    TransportMessage::Binary(Bytes::from(out))
}

/// Sending half of a scripted connection. Dropping it closes the stream.
pub(crate) type Feed = mpsc::UnboundedSender<Result<TransportMessage, TransportError>>;

enum Step {
    Fail(String),
    Accept(mpsc::UnboundedReceiver<Result<TransportMessage, TransportError>>),
}

/// Connector that replays queued outcomes, then hangs on every later attempt.
#[derive(Default)]
pub(crate) struct ScriptedConnector {
    steps: Mutex<VecDeque<Step>>,
    attempts: Mutex<Vec<(String, Instant)>>,
}

impl ScriptedConnector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fail_next(&self, reason: &str) {
        self.steps.lock().push_back(Step::Fail(reason.to_string()));
    }

    pub(crate) fn accept_next(&self) -> Feed {
        let (tx, rx) = mpsc::unbounded_channel();
        self.steps.lock().push_back(Step::Accept(rx));
        tx
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.lock().len()
    }

    pub(crate) fn attempt_times(&self) -> Vec<Instant> {
        self.attempts.lock().iter().map(|(_, at)| *at).collect()
    }

    pub(crate) fn endpoints(&self) -> Vec<String> {
        self.attempts.lock().iter().map(|(e, _)| e.clone()).collect()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, endpoint: &str) -> Result<MessageStream, TransportError> {
        self.attempts
            .lock()
            .push((endpoint.to_string(), Instant::now()));

        let step = self.steps.lock().pop_front();
        match step {
            Some(Step::Fail(reason)) => Err(TransportError::ConnectFailed(reason)),
            Some(Step::Accept(rx)) => Ok(UnboundedReceiverStream::new(rx).boxed()),
            None => futures::future::pending().await,
        }
    }
}
