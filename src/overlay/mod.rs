//! Detection overlay drawn onto a copy of each frame.

pub mod font;

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use image::{Rgb, RgbImage};
use tracing::warn;

use crate::capture::Frame;
use crate::detect::{BoundingBox, DetectionResult};

const BOX_THICKNESS: i32 = 2;
const PLATE: Rgb<u8> = Rgb([16, 16, 16]);
const STATUS_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const PALETTE: [Rgb<u8>; 8] = [
    Rgb([0, 255, 0]),
    Rgb([255, 64, 64]),
    Rgb([64, 160, 255]),
    Rgb([255, 200, 0]),
    Rgb([255, 0, 255]),
    Rgb([0, 255, 255]),
    Rgb([255, 128, 0]),
    Rgb([160, 96, 255]),
];

/// Frame ready for the encoder.
#[derive(Clone)]
pub struct AnnotatedFrame {
    pub pixels: Bytes,
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub captured_at: Instant,
    /// Detections drawn on this frame, if any were cached.
    pub detections: Option<Arc<DetectionResult>>,
}

impl std::fmt::Debug for AnnotatedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnnotatedFrame")
            .field("sequence", &self.sequence)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("detections", &self.detections.as_ref().map(|d| d.sequence))
            .finish()
    }
}

/// Status text drawn in the top-left corner.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatusLine {
    pub fps: f32,
    pub detections: usize,
}

impl StatusLine {
    pub fn text(&self) -> String {
        format!("FPS: {:.1} | DETECTIONS: {}", self.fps, self.detections)
    }
}

#[derive(Debug, Clone)]
pub struct OverlayCompositor {
    scale: u32,
}

impl Default for OverlayCompositor {
    fn default() -> Self {
        Self { scale: 1 }
    }
}

impl OverlayCompositor {
    /// Text scale grows with frame height so labels stay legible at 720p and up.
    pub fn for_height(height: u32) -> Self {
        Self {
            scale: (height / 360).max(1),
        }
    }

    pub fn compose(&self, frame: &Frame, snapshot: Option<&Arc<DetectionResult>>) -> AnnotatedFrame {
        self.compose_with_status(frame, snapshot, None)
    }

    /// Draw `snapshot` and the optional status line onto a copy of `frame`.
    ///
    /// With nothing to draw the frame's buffer is passed through untouched.
    pub fn compose_with_status(
        &self,
        frame: &Frame,
        snapshot: Option<&Arc<DetectionResult>>,
        status: Option<&StatusLine>,
    ) -> AnnotatedFrame {
        let passthrough = || AnnotatedFrame {
            pixels: frame.data.clone(),
            sequence: frame.sequence(),
            width: frame.width(),
            height: frame.height(),
            captured_at: frame.timestamp,
            detections: snapshot.cloned(),
        };

        if snapshot.is_none() && status.is_none() {
            return passthrough();
        }

        let Some(mut image) = RgbImage::from_raw(frame.width(), frame.height(), frame.data.to_vec())
        else {
            warn!(
                sequence = frame.sequence(),
                "frame buffer does not match {}x{}, skipping overlay",
                frame.width(),
                frame.height()
            );
            return passthrough();
        };

        if let Some(result) = snapshot {
            for b in result.boxes() {
                self.draw_box(&mut image, b);
            }
        }
        if let Some(status) = status {
            let text = status.text();
            let pad = 2 * self.scale as i32;
            let w = font::text_width(&text, self.scale) as i32;
            let h = (font::GLYPH_HEIGHT * self.scale) as i32;
            fill_rect(&mut image, 8, 8, 8 + w + 2 * pad, 8 + h + 2 * pad, PLATE);
            draw_text(&mut image, 8 + pad, 8 + pad, &text, self.scale, STATUS_COLOR);
        }

        AnnotatedFrame {
            pixels: Bytes::from(image.into_raw()),
            sequence: frame.sequence(),
            width: frame.width(),
            height: frame.height(),
            captured_at: frame.timestamp,
            detections: snapshot.cloned(),
        }
    }

    fn draw_box(&self, image: &mut RgbImage, b: &BoundingBox) {
        let color = label_color(&b.label);
        let (x0, y0) = (b.x.round() as i32, b.y.round() as i32);
        let (x1, y1) = ((b.x + b.w).round() as i32, (b.y + b.h).round() as i32);
        stroke_rect(image, x0, y0, x1, y1, color);

        let label = format!("{} {:.0}%", b.label, b.score * 100.0);
        let pad = self.scale as i32;
        let text_h = (font::GLYPH_HEIGHT * self.scale) as i32 + 2 * pad;
        let text_w = font::text_width(&label, self.scale) as i32 + 2 * pad;
        // Above the box, or just inside it when the box touches the top edge.
        let top = if y0 - text_h >= 0 { y0 - text_h } else { y0.max(0) };
        fill_rect(image, x0, top, x0 + text_w, top + text_h, PLATE);
        draw_text(image, x0 + pad, top + pad, &label, self.scale, color);
    }
}

fn label_color(label: &str) -> Rgb<u8> {
    let hash = label.bytes().fold(0usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize));
    PALETTE[hash % PALETTE.len()]
}

/// Fill `[x0, x1) x [y0, y1)`, clipped to the image.
fn fill_rect(image: &mut RgbImage, x0: i32, y0: i32, x1: i32, y1: i32, color: Rgb<u8>) {
    let (w, h) = (image.width() as i32, image.height() as i32);
    for y in y0.max(0)..y1.min(h) {
        for x in x0.max(0)..x1.min(w) {
            image.put_pixel(x as u32, y as u32, color);
        }
    }
}

fn stroke_rect(image: &mut RgbImage, x0: i32, y0: i32, x1: i32, y1: i32, color: Rgb<u8>) {
    let t = BOX_THICKNESS;
    fill_rect(image, x0, y0, x1, y0 + t, color);
    fill_rect(image, x0, y1 - t, x1, y1, color);
    fill_rect(image, x0, y0, x0 + t, y1, color);
    fill_rect(image, x1 - t, y0, x1, y1, color);
}

fn draw_text(image: &mut RgbImage, x: i32, y: i32, text: &str, scale: u32, color: Rgb<u8>) {
    let s = scale as i32;
    let mut pen = x;
    for ch in text.chars() {
        for (row, bits) in font::glyph(ch).iter().enumerate() {
            for col in 0..font::GLYPH_WIDTH as i32 {
                if (bits >> (font::GLYPH_WIDTH as i32 - 1 - col)) & 1 == 1 {
                    let px = pen + col * s;
                    let py = y + row as i32 * s;
                    fill_rect(image, px, py, px + s, py + s, color);
                }
            }
        }
        pen += (font::ADVANCE * scale) as i32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{FrameStamper, PixelFormat};

    fn grey_frame(width: u32, height: u32) -> Frame {
        FrameStamper::new().rgb_frame(
            Bytes::from(vec![128u8; (width * height * 3) as usize]),
            width,
            height,
            PixelFormat::Rgb24,
            None,
        )
    }

    fn pixel(frame: &AnnotatedFrame, x: u32, y: u32) -> [u8; 3] {
        let i = ((y * frame.width + x) * 3) as usize;
        [frame.pixels[i], frame.pixels[i + 1], frame.pixels[i + 2]]
    }

    #[test]
    fn empty_cache_passes_frame_through() {
        let frame = grey_frame(64, 48);
        let out = OverlayCompositor::default().compose(&frame, None);
        assert_eq!(out.pixels, frame.data);
        assert_eq!(out.sequence, frame.sequence());
        assert!(out.detections.is_none());
    }

    #[test]
    fn boxes_are_drawn_on_a_copy() {
        let frame = grey_frame(64, 48);
        let result = Arc::new(DetectionResult::from_raw(
            0,
            vec![BoundingBox::new(10.0, 20.0, 30.0, 20.0, "person", 0.87)],
            0.5,
        ));
        let out = OverlayCompositor::default().compose(&frame, Some(&result));

        // Input untouched.
        assert!(frame.data.iter().all(|&c| c == 128));
        // Box edges painted in the label colour, interior untouched.
        let color = label_color("person").0;
        assert_eq!(pixel(&out, 10, 30), color);
        assert_eq!(pixel(&out, 39, 30), color);
        assert_eq!(pixel(&out, 25, 39), color);
        assert_eq!(pixel(&out, 25, 30), [128, 128, 128]);
        assert_eq!(out.detections.as_ref().map(|d| d.sequence), Some(0));
    }

    #[test]
    fn composition_is_deterministic() {
        let frame = grey_frame(96, 64);
        let result = Arc::new(DetectionResult::from_raw(
            3,
            vec![BoundingBox::new(-5.0, -5.0, 200.0, 30.0, "car", 0.6)],
            0.5,
        ));
        let status = StatusLine { fps: 29.97, detections: 1 };
        let compositor = OverlayCompositor::default();
        let a = compositor.compose_with_status(&frame, Some(&result), Some(&status));
        let b = compositor.compose_with_status(&frame, Some(&result), Some(&status));
        assert_eq!(a.pixels, b.pixels);
        assert_ne!(a.pixels, frame.data);
    }

    #[test]
    fn status_text_layout() {
        let status = StatusLine { fps: 29.94, detections: 2 };
        assert_eq!(status.text(), "FPS: 29.9 | DETECTIONS: 2");
    }
}
