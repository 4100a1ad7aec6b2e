//! Detection overlays for saved frames.
//!
//! Each detection gets a box outline in a colour picked by class id and a
//! filled tag above its top-left corner carrying the class name and
//! confidence, e.g. `BATTERY 87%`. Text is drawn from a built-in 5x7 bitmap
//! font, upper case only.

use anyhow::Result;
use image::{Rgb, RgbImage};
use std::path::PathBuf;

use crate::capture::CaptureStore;
use crate::detect::Detection;
use crate::frame::Frame;
use crate::pipeline::TickReport;

/// File prefix for frames written by `save_annotated`.
pub const ANNOTATED_PREFIX: &str = "annotated";

const LINE_WIDTH: u32 = 2;
const GLYPH_WIDTH: u32 = 5;
const GLYPH_HEIGHT: u32 = 7;
const GLYPH_ADVANCE: u32 = GLYPH_WIDTH + 1;
/// Glyph rows plus one pixel of padding above and below.
const TAG_HEIGHT: u32 = GLYPH_HEIGHT + 2;
const TEXT_COLOUR: Rgb<u8> = Rgb([0, 0, 0]);

const PALETTE: [[u8; 3]; 6] = [
    [255, 56, 56],
    [72, 249, 10],
    [0, 194, 255],
    [255, 178, 29],
    [207, 210, 49],
    [255, 55, 199],
];

/// Outline and tag colour for a class id.
pub fn class_colour(class_id: usize) -> Rgb<u8> {
    Rgb(PALETTE[class_id % PALETTE.len()])
}

/// Tag text for a detection.
pub fn label_text(detection: &Detection) -> String {
    format!(
        "{} {:.0}%",
        detection.class_name.to_uppercase(),
        detection.confidence.clamp(0.0, 1.0) * 100.0
    )
}

/// Copy of `frame` with every detection drawn on top. The sequence number
/// carries over so saved files can be matched to log lines.
pub fn annotate(frame: &Frame, detections: &[Detection]) -> Frame {
    let mut canvas = frame.as_image().clone();
    for detection in detections {
        draw_detection(&mut canvas, detection);
    }
    Frame::from_image(canvas, frame.sequence)
}

/// Save the tick's frame with its detections drawn on. Ticks without a frame
/// or without detections write nothing.
pub fn save_annotated(store: &mut CaptureStore, report: &TickReport) -> Result<Option<PathBuf>> {
    let Some(frame) = &report.frame else {
        return Ok(None);
    };
    if report.detections.is_empty() {
        return Ok(None);
    }
    let annotated = annotate(frame, &report.detections);
    store.save(&annotated, ANNOTATED_PREFIX).map(Some)
}

fn draw_detection(canvas: &mut RgbImage, detection: &Detection) {
    let Some((x1, y1, x2, y2)) = pixel_box(canvas, detection) else {
        log::debug!("skipping degenerate box for {}", detection.class_name);
        return;
    };
    let colour = class_colour(detection.class_id);

    for t in 0..LINE_WIDTH {
        let top = (y1 + t).min(y2);
        let bottom = y2.saturating_sub(t).max(y1);
        let left = (x1 + t).min(x2);
        let right = x2.saturating_sub(t).max(x1);
        for x in x1..=x2 {
            canvas.put_pixel(x, top, colour);
            canvas.put_pixel(x, bottom, colour);
        }
        for y in y1..=y2 {
            canvas.put_pixel(left, y, colour);
            canvas.put_pixel(right, y, colour);
        }
    }

    draw_tag(canvas, x1, y1, &label_text(detection), colour);
}

/// Tag sits above the box, or just inside it when the box touches the top.
/// Text that runs past the right edge of the frame is cut off.
fn draw_tag(canvas: &mut RgbImage, x1: u32, y1: u32, text: &str, colour: Rgb<u8>) {
    let (width, height) = canvas.dimensions();
    let text_width = text.chars().count() as u32 * GLYPH_ADVANCE + 1;
    let right = x1.saturating_add(text_width).min(width);
    let top = if y1 >= TAG_HEIGHT { y1 - TAG_HEIGHT } else { y1 };
    let bottom = (top + TAG_HEIGHT).min(height);

    for y in top..bottom {
        for x in x1..right {
            canvas.put_pixel(x, y, colour);
        }
    }

    let mut pen_x = x1 + 1;
    for ch in text.chars() {
        if pen_x >= right {
            break;
        }
        if let Some(rows) = glyph(ch) {
            for (row, &bits) in rows.iter().enumerate() {
                let y = top + 1 + row as u32;
                for col in 0..GLYPH_WIDTH {
                    let x = pen_x + col;
                    if (bits >> (GLYPH_WIDTH - 1 - col)) & 1 == 1 && x < right && y < bottom {
                        canvas.put_pixel(x, y, TEXT_COLOUR);
                    }
                }
            }
        }
        pen_x += GLYPH_ADVANCE;
    }
}

/// Box corners clamped to the image, or `None` when nothing is left to draw.
fn pixel_box(canvas: &RgbImage, detection: &Detection) -> Option<(u32, u32, u32, u32)> {
    let (width, height) = canvas.dimensions();
    if width == 0 || height == 0 {
        return None;
    }
    let b = &detection.bounding_box;
    if !(b.x1.is_finite() && b.y1.is_finite() && b.x2.is_finite() && b.y2.is_finite()) {
        return None;
    }
    let clamp = |v: f32, max: u32| v.round().clamp(0.0, (max - 1) as f32) as u32;
    let (x1, x2) = (clamp(b.x1.min(b.x2), width), clamp(b.x1.max(b.x2), width));
    let (y1, y2) = (clamp(b.y1.min(b.y2), height), clamp(b.y1.max(b.y2), height));
    if x1 == x2 || y1 == y2 {
        return None;
    }
    Some((x1, y1, x2, y2))
}

/// 5x7 glyph rows, bit 4 leftmost. Characters without a glyph leave a blank
/// cell.
fn glyph(ch: char) -> Option<[u8; 7]> {
    let rows = match ch.to_ascii_uppercase() {
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'B' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110],
        'C' => [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110],
        'D' => [0b11110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b11110],
        'E' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b11111],
        'F' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000],
        'G' => [0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111],
        'H' => [0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'I' => [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'J' => [0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100],
        'K' => [0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001],
        'L' => [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111],
        'M' => [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001],
        'N' => [0b10001, 0b10001, 0b11001, 0b10101, 0b10011, 0b10001, 0b10001],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'P' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000],
        'Q' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        'S' => [0b01111, 0b10000, 0b10000, 0b01110, 0b00001, 0b00001, 0b11110],
        'T' => [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100],
        'U' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'V' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100],
        'W' => [0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b10101, 0b01010],
        'X' => [0b10001, 0b10001, 0b01010, 0b00100, 0b01010, 0b10001, 0b10001],
        'Y' => [0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100, 0b00100],
        'Z' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b11111],
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b11111, 0b00010, 0b00100, 0b00010, 0b00001, 0b10001, 0b01110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
        '%' => [0b11000, 0b11001, 0b00010, 0b00100, 0b01000, 0b10011, 0b00011],
        '.' => [0, 0, 0, 0, 0, 0b01100, 0b01100],
        '-' => [0, 0, 0, 0b11111, 0, 0, 0],
        '_' => [0, 0, 0, 0, 0, 0, 0b11111],
        _ => return None,
    };
    Some(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::BoundingBox;
    use crate::pipeline::TickAction;
    use std::ops::Range;

    fn detection(class_id: usize, x1: f32, y1: f32, x2: f32, y2: f32) -> Detection {
        Detection {
            class_id,
            class_name: "battery".to_string(),
            confidence: 0.5,
            bounding_box: BoundingBox { x1, y1, x2, y2 },
        }
    }

    fn black_frame(width: u32, height: u32) -> Frame {
        Frame::from_image(RgbImage::new(width, height), 7)
    }

    fn region_has(image: &RgbImage, xs: Range<u32>, ys: Range<u32>, colour: Rgb<u8>) -> bool {
        ys.flat_map(|y| xs.clone().map(move |x| (x, y)))
            .any(|(x, y)| *image.get_pixel(x, y) == colour)
    }

    #[test]
    fn label_text_is_upper_case_with_percent() {
        let mut det = detection(0, 0.0, 0.0, 1.0, 1.0);
        det.confidence = 0.874;
        assert_eq!(label_text(&det), "BATTERY 87%");
    }

    #[test]
    fn box_outline_and_tag_are_drawn() {
        let frame = black_frame(96, 48);
        let annotated = annotate(&frame, &[detection(1, 10.0, 20.0, 40.0, 44.0)]);
        let image = annotated.as_image();
        let colour = class_colour(1);

        assert_eq!(annotated.sequence, 7);
        assert_eq!(*image.get_pixel(10, 30), colour);
        assert_eq!(*image.get_pixel(25, 20), colour);
        assert_eq!(*image.get_pixel(40, 44), colour);
        // Tag rows 11..20 start at the box's left edge; the first row and
        // column are padding, text sits inside.
        assert_eq!(*image.get_pixel(25, 11), colour);
        assert_eq!(*image.get_pixel(10, 15), colour);
        assert!(region_has(image, 11..40, 12..19, TEXT_COLOUR));
        assert_eq!(*image.get_pixel(90, 15), Rgb([0, 0, 0]));
        // The source frame is not modified.
        assert_eq!(*frame.as_image().get_pixel(10, 30), Rgb([0, 0, 0]));
    }

    #[test]
    fn tag_moves_inside_when_box_touches_top() {
        let annotated = annotate(&black_frame(96, 48), &[detection(0, 4.0, 0.0, 60.0, 30.0)]);
        let image = annotated.as_image();
        assert!(region_has(image, 8..40, 2..8, class_colour(0)));
        assert!(region_has(image, 8..40, 2..8, TEXT_COLOUR));
    }

    #[test]
    fn boxes_outside_the_frame_are_clamped_or_skipped() {
        let frame = black_frame(16, 16);
        let clamped = annotate(&frame, &[detection(2, -10.0, -10.0, 100.0, 100.0)]);
        assert_eq!(*clamped.as_image().get_pixel(15, 15), class_colour(2));

        let skipped = annotate(
            &frame,
            &[
                detection(2, 5.0, 5.0, 5.0, 12.0),
                detection(2, f32::NAN, 0.0, 4.0, 4.0),
            ],
        );
        assert!(skipped.as_image().pixels().all(|p| *p == Rgb([0, 0, 0])));
    }

    #[test]
    fn ticks_without_detections_are_not_saved() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut store = CaptureStore::open(dir.path())?;

        let empty = TickReport {
            detections: Vec::new(),
            action: TickAction::NoCommand,
            frame: Some(black_frame(16, 16)),
        };
        assert_eq!(save_annotated(&mut store, &empty)?, None);

        let missing = TickReport {
            detections: vec![detection(0, 2.0, 2.0, 12.0, 12.0)],
            action: TickAction::NoCommand,
            frame: None,
        };
        assert_eq!(save_annotated(&mut store, &missing)?, None);
        assert_eq!(store.count()?, 0);

        let seen = TickReport {
            frame: Some(black_frame(16, 16)),
            ..missing
        };
        let path = save_annotated(&mut store, &seen)?.expect("annotated frame saved");
        assert!(path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(ANNOTATED_PREFIX)));
        assert_eq!(store.count()?, 1);
        Ok(())
    }
}
