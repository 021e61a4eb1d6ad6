//! Overlay rendering.
//!
//! Decodes the JPEG carried by a [`DecodedFrame`], paints it on a
//! [`Surface`] and outlines every detection that is marked as an
//! interaction with a dashed rectangle.

use crate::config::RenderConfig;
use crate::model::DecodedFrame;
use crate::surface::{StrokeStyle, Surface};
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

/// Errors that can occur while rendering a frame.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Image decode failed: {0}")]
    Decode(#[from] image::ImageError),
}

/// Result of rendering one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderOutcome {
    /// The frame carried no image; the surface was not touched.
    Empty,

    /// The image was drawn.
    Drawn {
        width: u32,
        height: u32,
        /// Whether the surface had to be reallocated
        resized: bool,
        /// Number of interaction boxes outlined
        overlays: usize,
    },
}

#[derive(Debug, Default)]
struct LedgerCounts {
    created: AtomicU64,
    released: AtomicU64,
}

/// Counts transient image resources handed out and given back.
#[derive(Debug, Clone, Default)]
pub struct ResourceLedger {
    counts: Arc<LedgerCounts>,
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap `bytes` in a handle that is released when dropped.
    pub fn acquire(&self, bytes: Bytes) -> ImageHandle {
        self.counts.created.fetch_add(1, Ordering::Relaxed);
        ImageHandle {
            bytes,
            ledger: self.clone(),
        }
    }

    pub fn created(&self) -> u64 {
        self.counts.created.load(Ordering::Relaxed)
    }

    pub fn released(&self) -> u64 {
        self.counts.released.load(Ordering::Relaxed)
    }

    /// Handles currently alive.
    pub fn outstanding(&self) -> u64 {
        self.created().saturating_sub(self.released())
    }
}

/// Transient holder for encoded image bytes.
#[derive(Debug)]
pub struct ImageHandle {
    bytes: Bytes,
    ledger: ResourceLedger,
}

impl ImageHandle {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl Drop for ImageHandle {
    fn drop(&mut self) {
        self.ledger.counts.released.fetch_add(1, Ordering::Relaxed);
    }
}

/// Paints frames and their interaction overlays.
#[derive(Debug, Clone)]
pub struct OverlayRenderer {
    config: RenderConfig,
    ledger: ResourceLedger,
}

impl OverlayRenderer {
    pub fn new(config: RenderConfig) -> Self {
        Self {
            config,
            ledger: ResourceLedger::new(),
        }
    }

    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    pub fn ledger(&self) -> &ResourceLedger {
        &self.ledger
    }

    /// Render `frame` onto `surface`.
    ///
    /// The surface is only reallocated when the image dimensions differ from
    /// its current size. The dash pattern is reset to solid after every box.
    /// Frames without image bytes leave the surface untouched.
    pub fn render<S: Surface + ?Sized>(
        &self,
        frame: &DecodedFrame,
        surface: &mut S,
    ) -> Result<RenderOutcome, RenderError> {
        if !frame.has_image() {
            trace!("Frame has no image, nothing to draw");
            return Ok(RenderOutcome::Empty);
        }

        // Released on drop, including the early return on decode failure
        let handle = self.ledger.acquire(frame.image.clone());
        let image = image::load_from_memory(handle.bytes())?.to_rgba8();
        let (width, height) = image.dimensions();

        let resized = surface.size() != (width, height);
        if resized {
            trace!(width, height, "Resizing surface");
            surface.resize(width, height);
        }

        surface.clear();
        surface.draw_image(&image);

        let style = StrokeStyle {
            color: self.config.stroke_color,
            width: self.config.stroke_width,
        };

        let mut overlays = 0;
        for detection in frame.detections().iter().filter(|d| d.interaction) {
            surface.set_stroke(style);
            surface.set_line_dash(&self.config.dash_pattern);
            surface.stroke_rect(detection.bbox);
            surface.set_line_dash(&[]);
            overlays += 1;
        }

        drop(handle);

        Ok(RenderOutcome::Drawn {
            width,
            height,
            resized,
            overlays,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BoundingBox, Detection, FrameFormat, FrameMetadata};
    use crate::surface::{MockSurface, RasterSurface};
    use crate::test_support::jpeg;
    use mockall::predicate::eq;
    use mockall::Sequence;
    use std::time::Instant;

    fn detection(bbox: [f32; 4], interaction: bool) -> Detection {
        Detection {
            bbox: bbox.into(),
            label: "drill".to_string(),
            confidence: 0.9,
            interaction,
            id: None,
            status: None,
        }
    }

    fn frame(detections: Vec<Detection>, image: Bytes) -> DecodedFrame {
        DecodedFrame {
            metadata: FrameMetadata {
                detections,
                ..Default::default()
            },
            image,
            format: FrameFormat::Binary,
            arrived_at: Instant::now(),
        }
    }

    fn renderer() -> OverlayRenderer {
        OverlayRenderer::new(RenderConfig::default())
    }

    #[test]
    fn test_single_interaction_draws_one_dashed_rect() {
        let renderer = renderer();
        let frame = frame(
            vec![
                detection([10.0, 10.0, 50.0, 50.0], true),
                detection([0.0, 0.0, 5.0, 5.0], false),
            ],
            jpeg(64, 48),
        );

        let mut surface = MockSurface::new();
        let mut seq = Sequence::new();
        surface.expect_size().return_const((64u32, 48u32));
        surface.expect_resize().never();
        surface.expect_clear().times(1).return_const(());
        surface
            .expect_draw_image()
            .withf(|img| img.dimensions() == (64, 48))
            .times(1)
            .return_const(());
        surface
            .expect_set_stroke()
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        surface
            .expect_set_line_dash()
            .withf(|segments| segments.to_vec() == vec![6, 4])
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        surface
            .expect_stroke_rect()
            .with(eq(BoundingBox::new(10.0, 10.0, 50.0, 50.0)))
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        surface
            .expect_set_line_dash()
            .withf(|segments| segments.is_empty())
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());

        let outcome = renderer.render(&frame, &mut surface).unwrap();
        assert_eq!(
            outcome,
            RenderOutcome::Drawn {
                width: 64,
                height: 48,
                resized: false,
                overlays: 1
            }
        );
        assert_eq!(renderer.ledger().outstanding(), 0);
    }

    #[test]
    fn test_resize_only_on_dimension_change() {
        let renderer = renderer();
        let frame = frame(vec![], jpeg(32, 16));

        let mut surface = MockSurface::new();
        surface.expect_size().return_const((0u32, 0u32));
        surface
            .expect_resize()
            .with(eq(32), eq(16))
            .times(1)
            .return_const(());
        surface.expect_clear().return_const(());
        surface.expect_draw_image().return_const(());

        let outcome = renderer.render(&frame, &mut surface).unwrap();
        assert!(matches!(outcome, RenderOutcome::Drawn { resized: true, overlays: 0, .. }));
    }

    #[test]
    fn test_empty_image_touches_nothing() {
        let renderer = renderer();
        let frame = frame(vec![detection([1.0, 1.0, 2.0, 2.0], true)], Bytes::new());

        // No expectations: any surface call panics
        let mut surface = MockSurface::new();
        let outcome = renderer.render(&frame, &mut surface).unwrap();

        assert_eq!(outcome, RenderOutcome::Empty);
        assert_eq!(renderer.ledger().created(), 0);
    }

    #[test]
    fn test_corrupt_image_still_released() {
        let renderer = renderer();
        let frame = frame(vec![], Bytes::from_static(&[0xFF, 0xD8, 0x01, 0x02, 0x03]));

        let mut surface = MockSurface::new();
        let result = renderer.render(&frame, &mut surface);

        assert!(matches!(result, Err(RenderError::Decode(_))));
        assert_eq!(renderer.ledger().created(), 1);
        assert_eq!(renderer.ledger().released(), 1);
    }

    #[test]
    fn test_no_handle_accumulation_over_many_frames() {
        let renderer = renderer();
        let image = jpeg(16, 16);
        let mut surface = RasterSurface::default();

        for i in 0..1000 {
            let interaction = i % 2 == 0;
            let frame = frame(vec![detection([2.0, 2.0, 12.0, 12.0], interaction)], image.clone());
            renderer.render(&frame, &mut surface).unwrap();
        }

        let ledger = renderer.ledger();
        assert_eq!(ledger.created(), 1000);
        assert_eq!(ledger.released(), 1000);
        assert_eq!(ledger.outstanding(), 0);
        assert_eq!(surface.resize_count(), 1);
    }

    #[test]
    fn test_dash_reset_on_raster_surface() {
        let renderer = renderer();
        let frame = frame(vec![detection([2.0, 2.0, 12.0, 12.0], true)], jpeg(16, 16));
        let mut surface = RasterSurface::default();

        renderer.render(&frame, &mut surface).unwrap();
        assert!(surface.line_dash().is_empty());
        assert_eq!(surface.stroke().width, 3);
    }

    #[test]
    fn test_handle_counts() {
        let ledger = ResourceLedger::new();
        let handle = ledger.acquire(Bytes::from_static(b"abc"));
        assert_eq!(handle.bytes(), b"abc");
        assert_eq!(ledger.outstanding(), 1);

        drop(handle);
        assert_eq!(ledger.outstanding(), 0);
        assert_eq!(ledger.released(), 1);
    }
}
