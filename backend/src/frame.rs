use image::{RgbImage, imageops::FilterType};

/// Width every captured frame is resized to before entering the pipeline.
pub const FRAME_WIDTH: u32 = 640;

/// Height every captured frame is resized to before entering the pipeline.
pub const FRAME_HEIGHT: u32 = 400;

/// An owned RGB frame plus the wall-clock instant it was captured at.
#[derive(Clone, Debug)]
pub struct Frame {
    pub image: RgbImage,
    pub captured_at_ms: i64,
}

impl Frame {
    pub fn new(image: RgbImage, captured_at_ms: i64) -> Self {
        Self {
            image,
            captured_at_ms,
        }
    }

    /// Returns this frame scaled to the pipeline resolution, skipping the
    /// resize when the device already delivers the target size.
    pub fn into_target_size(self) -> Self {
        if self.image.width() == FRAME_WIDTH && self.image.height() == FRAME_HEIGHT {
            return self;
        }

        let image = image::imageops::resize(
            &self.image,
            FRAME_WIDTH,
            FRAME_HEIGHT,
            FilterType::Triangle,
        );
        Self {
            image,
            captured_at_ms: self.captured_at_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resizes_to_target_resolution() {
        let frame = Frame::new(RgbImage::new(1280, 720), 0);
        let resized = frame.into_target_size();

        assert_eq!(resized.image.width(), FRAME_WIDTH);
        assert_eq!(resized.image.height(), FRAME_HEIGHT);
    }

    #[test]
    fn target_sized_frame_is_untouched() {
        let mut image = RgbImage::new(FRAME_WIDTH, FRAME_HEIGHT);
        image.put_pixel(3, 4, image::Rgb([255, 0, 0]));
        let frame = Frame::new(image, 42).into_target_size();

        assert_eq!(frame.captured_at_ms, 42);
        assert_eq!(frame.image.get_pixel(3, 4), &image::Rgb([255, 0, 0]));
    }
}
