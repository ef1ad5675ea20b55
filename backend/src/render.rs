use anyhow::Result;
use image::{Rgb, RgbImage, codecs::jpeg::JpegEncoder};
use imageproc::{
    drawing::{draw_filled_rect_mut, draw_hollow_rect_mut},
    rect::Rect,
};

use crate::models::TrackedObject;

/// JPEG quality of the visualization stream.
pub const JPEG_QUALITY: u8 = 90;

const BORDER_PX: i32 = 2;
const CONFIDENCE_BAR_PX: u32 = 3;
const ANONYMOUS_COLOR: Rgb<u8> = Rgb([160, 160, 160]);

/// Per-track colors; a track keeps its color for as long as it keeps its id.
const TRACK_COLORS: [Rgb<u8>; 6] = [
    Rgb([0, 225, 27]),
    Rgb([255, 99, 30]),
    Rgb([46, 134, 255]),
    Rgb([255, 205, 0]),
    Rgb([200, 60, 220]),
    Rgb([0, 200, 200]),
];

fn color_for(id: Option<u64>) -> Rgb<u8> {
    match id {
        Some(id) => TRACK_COLORS[(id % TRACK_COLORS.len() as u64) as usize],
        None => ANONYMOUS_COLOR,
    }
}

/// Draws the tracked objects over a copy of `image`: a colored box per
/// track plus a confidence bar along its top edge.
pub fn annotate(image: &RgbImage, objects: &[TrackedObject]) -> RgbImage {
    let mut canvas = image.clone();
    let (width, height) = (canvas.width() as i32, canvas.height() as i32);

    for object in objects {
        let color = color_for(object.id);
        let x1 = (object.bbox[0] as i32).clamp(0, width - 1);
        let y1 = (object.bbox[1] as i32).clamp(0, height - 1);
        let x2 = (object.bbox[2] as i32).clamp(0, width - 1);
        let y2 = (object.bbox[3] as i32).clamp(0, height - 1);
        if x2 - x1 < 2 || y2 - y1 < 2 {
            continue;
        }

        for inset in 0..BORDER_PX {
            let w = (x2 - x1 - 2 * inset) as u32;
            let h = (y2 - y1 - 2 * inset) as u32;
            if w < 2 || h < 2 {
                break;
            }
            draw_hollow_rect_mut(
                &mut canvas,
                Rect::at(x1 + inset, y1 + inset).of_size(w, h),
                color,
            );
        }

        let bar = ((x2 - x1) as f32 * object.confidence.clamp(0.0, 1.0)) as u32;
        if bar >= 2 && y1 >= CONFIDENCE_BAR_PX as i32 {
            draw_filled_rect_mut(
                &mut canvas,
                Rect::at(x1, y1 - CONFIDENCE_BAR_PX as i32).of_size(bar, CONFIDENCE_BAR_PX),
                color,
            );
        }
    }

    canvas
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut buffer, quality);
    encoder.encode_image(image)?;
    Ok(buffer)
}
