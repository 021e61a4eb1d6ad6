//! Drawing surfaces.
//!
//! [`Surface`] is the canvas-like target the renderer paints on. Stroke and
//! dash settings are surface state, like a 2D canvas context, so anything
//! that changes them is expected to put them back.

use crate::model::BoundingBox;
use image::{Rgba, RgbaImage};

/// Stroke colour and width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrokeStyle {
    pub color: [u8; 4],
    pub width: u32,
}

impl Default for StrokeStyle {
    fn default() -> Self {
        Self {
            color: [255, 59, 48, 255],
            width: 3,
        }
    }
}

/// A 2D drawing target owned by exactly one session at a time.
#[cfg_attr(test, mockall::automock)]
pub trait Surface: Send {
    /// Current `(width, height)` in pixels.
    fn size(&self) -> (u32, u32);

    /// Reallocate to new dimensions. Contents are discarded.
    fn resize(&mut self, width: u32, height: u32);

    /// Clear to transparent.
    fn clear(&mut self);

    /// Draw `image` with its top-left corner at the origin.
    fn draw_image(&mut self, image: &RgbaImage);

    fn set_stroke(&mut self, style: StrokeStyle);

    /// Dash pattern as alternating on/off run lengths; empty means solid.
    fn set_line_dash(&mut self, segments: &[u32]);

    /// Outline `rect` with the current stroke and dash pattern.
    fn stroke_rect(&mut self, rect: BoundingBox);
}

/// In-memory RGBA surface.
#[derive(Debug, Clone)]
pub struct RasterSurface {
    canvas: RgbaImage,
    stroke: StrokeStyle,
    dash: Vec<u32>,
    resize_count: u64,
}

impl RasterSurface {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            canvas: RgbaImage::new(width, height),
            stroke: StrokeStyle::default(),
            dash: Vec::new(),
            resize_count: 0,
        }
    }

    pub fn image(&self) -> &RgbaImage {
        &self.canvas
    }

    pub fn into_image(self) -> RgbaImage {
        self.canvas
    }

    pub fn stroke(&self) -> StrokeStyle {
        self.stroke
    }

    pub fn line_dash(&self) -> &[u32] {
        &self.dash
    }

    /// Number of reallocations since creation.
    pub fn resize_count(&self) -> u64 {
        self.resize_count
    }

    fn dash_on(&self, step: u64) -> bool {
        let period: u64 = self.dash.iter().map(|&s| s as u64).sum();
        if period == 0 {
            return true;
        }
        let mut pos = step % period;
        for (i, &seg) in self.dash.iter().enumerate() {
            if pos < seg as u64 {
                return i % 2 == 0;
            }
            pos -= seg as u64;
        }
        true
    }

    fn stroke_outline(&mut self, x0: u32, y0: u32, x1: u32, y1: u32) {
        let color = Rgba(self.stroke.color);
        let mut step = 0u64;

        let plot = |surface: &mut Self, x: u32, y: u32, step: &mut u64| {
            if surface.dash_on(*step) {
                surface.canvas.put_pixel(x, y, color);
            }
            *step += 1;
        };

        for x in x0..=x1 {
            plot(self, x, y0, &mut step);
        }
        for y in y0..=y1 {
            plot(self, x1, y, &mut step);
        }
        for x in (x0..=x1).rev() {
            plot(self, x, y1, &mut step);
        }
        for y in (y0..=y1).rev() {
            plot(self, x0, y, &mut step);
        }
    }
}

impl Default for RasterSurface {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

impl Surface for RasterSurface {
    fn size(&self) -> (u32, u32) {
        self.canvas.dimensions()
    }

    fn resize(&mut self, width: u32, height: u32) {
        self.canvas = RgbaImage::new(width, height);
        self.resize_count += 1;
    }

    fn clear(&mut self) {
        for p in self.canvas.pixels_mut() {
            *p = Rgba([0, 0, 0, 0]);
        }
    }

    fn draw_image(&mut self, image: &RgbaImage) {
        if image.dimensions() == self.canvas.dimensions() {
            self.canvas.copy_from_slice(image.as_raw());
        } else {
            image::imageops::replace(&mut self.canvas, image, 0, 0);
        }
    }

    fn set_stroke(&mut self, style: StrokeStyle) {
        self.stroke = style;
    }

    fn set_line_dash(&mut self, segments: &[u32]) {
        self.dash = segments.to_vec();
    }

    fn stroke_rect(&mut self, rect: BoundingBox) {
        let (w, h) = self.canvas.dimensions();
        if w == 0 || h == 0 {
            return;
        }

        let clamp = |v: f32, max: u32| -> u32 { v.max(0.0).min((max - 1) as f32) as u32 };
        let (ax, bx) = (clamp(rect.x1, w), clamp(rect.x2, w));
        let (ay, by) = (clamp(rect.y1, h), clamp(rect.y2, h));
        let (x0, x1) = (ax.min(bx), ax.max(bx));
        let (y0, y1) = (ay.min(by), ay.max(by));

        // Thickness grows inward from the box edge
        for t in 0..self.stroke.width.max(1) {
            let (ix0, iy0) = (x0 + t, y0 + t);
            let (ix1, iy1) = (x1.saturating_sub(t), y1.saturating_sub(t));
            if ix0 > ix1 || iy0 > iy1 {
                break;
            }
            self.stroke_outline(ix0, iy0, ix1, iy1);
        }
    }
}
