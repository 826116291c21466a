// Annotation overlay
//
// Draws one hollow box per detection in its class colour and re-encodes the
// frame as JPEG for upload.

use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::types::Detection;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;

pub const JPEG_QUALITY: u8 = 85;

/// Box outline thickness in pixels
const LINE_WIDTH: i32 = 2;

pub fn encode_jpeg(rgb: &RgbImage, quality: u8) -> PipelineResult<Vec<u8>> {
    if rgb.width() == 0 || rgb.height() == 0 {
        return Err(PipelineError::Render("empty image".into()));
    }
    let mut buffer = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut buffer, quality);
    encoder
        .encode_image(rgb)
        .map_err(|e| PipelineError::Render(e.to_string()))?;
    Ok(buffer)
}

/// Clamp a detection box to the canvas. `None` if nothing is left to draw.
fn clamp_rect(det: &Detection, width: u32, height: u32, inset: i32) -> Option<Rect> {
    let max_x = width as f32 - 1.0;
    let max_y = height as f32 - 1.0;
    let x1 = det.bbox.x1.clamp(0.0, max_x) as i32 + inset;
    let y1 = det.bbox.y1.clamp(0.0, max_y) as i32 + inset;
    let x2 = det.bbox.x2.clamp(0.0, max_x) as i32 - inset;
    let y2 = det.bbox.y2.clamp(0.0, max_y) as i32 - inset;
    if x2 <= x1 || y2 <= y1 {
        return None;
    }
    Some(Rect::at(x1, y1).of_size((x2 - x1) as u32, (y2 - y1) as u32))
}

/// Render the overlay and return JPEG bytes.
pub fn render_annotated(image: &DynamicImage, detections: &[Detection]) -> PipelineResult<Vec<u8>> {
    let mut canvas = image.to_rgb8();
    let (width, height) = canvas.dimensions();

    for det in detections {
        let color = Rgb(det.class.color());
        for inset in 0..LINE_WIDTH {
            if let Some(rect) = clamp_rect(det, width, height, inset) {
                draw_hollow_rect_mut(&mut canvas, rect, color);
            }
        }
    }

    encode_jpeg(&canvas, JPEG_QUALITY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::classes::TrafficClass;
    use crate::pipeline::types::BBox;

    fn det(x1: f32, y1: f32, x2: f32, y2: f32) -> Detection {
        Detection {
            class: TrafficClass::Car,
            confidence: 0.8,
            bbox: BBox { x1, y1, x2, y2 },
        }
    }

    #[test]
    fn test_render_produces_jpeg() {
        let image = DynamicImage::new_rgb8(64, 48);
        let bytes = render_annotated(&image, &[det(4.0, 4.0, 30.0, 30.0)]).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (64, 48));
    }

    #[test]
    fn test_box_outline_uses_class_colour() {
        let image = DynamicImage::new_rgb8(32, 32);
        let mut canvas = image.to_rgb8();
        let rect = clamp_rect(&det(2.0, 2.0, 20.0, 20.0), 32, 32, 0).unwrap();
        draw_hollow_rect_mut(&mut canvas, rect, Rgb(TrafficClass::Car.color()));
        assert_eq!(canvas.get_pixel(2, 2).0, TrafficClass::Car.color());
        assert_eq!(canvas.get_pixel(10, 10).0, [0, 0, 0]);
    }

    #[test]
    fn test_out_of_bounds_boxes_are_clamped() {
        assert!(clamp_rect(&det(-50.0, -50.0, 500.0, 500.0), 32, 32, 0).is_some());
        assert!(clamp_rect(&det(40.0, 40.0, 50.0, 50.0), 32, 32, 0).is_none());
        let image = DynamicImage::new_rgb8(32, 32);
        assert!(render_annotated(&image, &[det(-50.0, -50.0, 500.0, 500.0)]).is_ok());
    }

    #[test]
    fn test_empty_image_is_render_error() {
        let image = DynamicImage::new_rgb8(0, 0);
        let err = render_annotated(&image, &[]).unwrap_err();
        assert!(matches!(err, PipelineError::Render(_)));
    }
}
