//! Detection overlays.
//!
//! The annotator is a pure transform: it draws onto a copy of the frame and
//! keeps no state between calls. Boxes are colored by class (flagged vs.
//! not), labels carry class name, confidence and track id, and live sources
//! additionally get a wall-clock stamp in the top-left corner.

use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;

use crate::detect::Detection;
use crate::frame::Frame;

const FLAGGED_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const CLEAR_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const CLOCK_BACKING: Rgb<u8> = Rgb([0, 0, 0]);

const LABEL_SCALE: f32 = 16.0;
const CLOCK_SCALE: f32 = 20.0;

/// Label anchor: 10px above the box top when that stays at least 10px from
/// the frame top, else 30px below the box top so labels remain on-screen.
pub fn label_anchor_y(box_top: i32) -> i32 {
    if box_top - 10 >= 10 {
        box_top - 10
    } else {
        box_top + 30
    }
}

pub struct Annotator {
    font: Option<FontArc>,
    class_names: Vec<String>,
    flagged_class: u32,
}

impl Annotator {
    /// `font` is optional: without one, labels are drawn as backing
    /// rectangles only (the caller logs the degradation once).
    pub fn new(font: Option<FontArc>, class_names: Vec<String>, flagged_class: u32) -> Self {
        Self {
            font,
            class_names,
            flagged_class,
        }
    }

    /// Draw detection overlays onto a copy of the frame.
    pub fn annotate(&self, frame: &Frame, detections: &[Detection]) -> Frame {
        let mut img = match frame.to_image() {
            Ok(img) => img,
            Err(e) => {
                log::error!("annotate skipped: {}", e);
                return frame.clone();
            }
        };

        for det in detections {
            let color = if det.class_id == self.flagged_class {
                FLAGGED_COLOR
            } else {
                CLEAR_COLOR
            };
            self.draw_box(&mut img, det, color);
            self.draw_label(&mut img, det, color);
        }

        frame.with_image(img)
    }

    /// Stamp the capture time into the top-left corner, over an opaque
    /// backing rectangle. Applied to live sources only.
    pub fn stamp_clock(&self, frame: &mut Frame) {
        let mut img = match frame.to_image() {
            Ok(img) => img,
            Err(e) => {
                log::error!("clock stamp skipped: {}", e);
                return;
            }
        };

        let stamp = frame.timestamp.format("%Y-%m-%d %H:%M:%S").to_string();
        let (tw, th) = self.measure(CLOCK_SCALE, &stamp);
        draw_filled_rect_mut(
            &mut img,
            Rect::at(5, 5).of_size(tw + 10, th + 10),
            CLOCK_BACKING,
        );
        if let Some(font) = &self.font {
            draw_text_mut(&mut img, TEXT_COLOR, 10, 10, PxScale::from(CLOCK_SCALE), font, &stamp);
        }

        *frame = frame.with_image(img);
    }

    fn draw_box(&self, img: &mut RgbImage, det: &Detection, color: Rgb<u8>) {
        let x = det.bbox.x1 as i32;
        let y = det.bbox.y1 as i32;
        let w = det.bbox.width().max(1.0) as u32;
        let h = det.bbox.height().max(1.0) as u32;

        draw_hollow_rect_mut(img, Rect::at(x, y).of_size(w.max(1), h.max(1)), color);
        // Second pass one pixel in for a 2px border.
        if w > 2 && h > 2 {
            draw_hollow_rect_mut(img, Rect::at(x + 1, y + 1).of_size(w - 2, h - 2), color);
        }
    }

    fn draw_label(&self, img: &mut RgbImage, det: &Detection, color: Rgb<u8>) {
        let mut label = format!("{} {:.2}", self.class_name(det.class_id), det.confidence);
        if let Some(track_id) = det.track_id {
            label.push_str(&format!(" ID:{}", track_id));
        }

        let x = det.bbox.x1 as i32;
        let anchor = label_anchor_y(det.bbox.y1 as i32);
        let (tw, th) = self.measure(LABEL_SCALE, &label);

        draw_filled_rect_mut(
            img,
            Rect::at(x, anchor - th as i32 - 4).of_size(tw + 8, th + 8),
            color,
        );
        if let Some(font) = &self.font {
            draw_text_mut(
                img,
                TEXT_COLOR,
                x + 4,
                anchor - th as i32,
                PxScale::from(LABEL_SCALE),
                font,
                &label,
            );
        }
    }

    fn class_name(&self, class_id: u32) -> String {
        self.class_names
            .get(class_id as usize)
            .cloned()
            .unwrap_or_else(|| format!("class{}", class_id))
    }

    fn measure(&self, scale: f32, text: &str) -> (u32, u32) {
        match &self.font {
            Some(font) => text_size(PxScale::from(scale), font, text),
            // Rough monospace estimate when no font is configured.
            None => (text.len() as u32 * (scale * 0.5) as u32, scale as u32),
        }
    }
}
