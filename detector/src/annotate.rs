use image::{ImageBuffer, Rgb};
use snowtify_common::frame::{Frame, FrameError};

// BGR order, matching the decoder's pixel format.
const BELOW: Rgb<u8> = Rgb([0, 200, 0]);
const ABOVE: Rgb<u8> = Rgb([0, 0, 230]);
const TRACK: Rgb<u8> = Rgb([40, 40, 40]);

/// Paints the confidence bar along the bottom edge of the output frames.
#[derive(Debug, Clone, Copy)]
pub struct ConfidenceBar {
    min: i64,
    max: i64,
    threshold: i64,
}

impl ConfidenceBar {
    pub fn new(min: i64, max: i64, threshold: i64) -> Self {
        Self { min, max, threshold }
    }

    /// Copy of `frame` with the bar drawn in; the input is left untouched.
    pub fn draw(&self, frame: &Frame, confidence: i64) -> Result<Frame, FrameError> {
        let (width, height) = (frame.width(), frame.height());
        let Some(mut canvas) = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_raw(width, height, frame.data().to_vec()) else {
            return Ok(frame.clone());
        };

        let bar_height = (height / 20).max(2).min(height);
        let filled = self.filled_width(width, confidence);
        let colour = if confidence >= self.threshold { ABOVE } else { BELOW };

        for y in height - bar_height..height {
            for x in 0..width {
                canvas.put_pixel(x, y, if x < filled { colour } else { TRACK });
            }
        }

        Frame::new(canvas.into_raw(), width, height, frame.seq(), frame.captured_at_ms())
    }

    fn filled_width(&self, width: u32, confidence: i64) -> u32 {
        let span = (self.max - self.min).max(1) as f64;
        let level = (confidence.clamp(self.min, self.max) - self.min) as f64 / span;
        (level * width as f64).round() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank(width: u32, height: u32) -> Frame {
        Frame::new(vec![255u8; (width * height * 3) as usize], width, height, Some(4), 99).unwrap()
    }

    #[test]
    fn bar_length_follows_confidence() {
        let bar = ConfidenceBar::new(0, 100, 80);
        let out = bar.draw(&blank(10, 20), 50).unwrap();

        let bottom = 19;
        assert_eq!(out.pixel(4, bottom), Some(BELOW.0));
        assert_eq!(out.pixel(5, bottom), Some(TRACK.0));
        // rows above the bar are untouched
        assert_eq!(out.pixel(0, 17), Some([255, 255, 255]));
        assert_eq!(out.seq(), Some(4));
        assert_eq!(out.captured_at_ms(), 99);
    }

    #[test]
    fn colour_switches_at_threshold() {
        let bar = ConfidenceBar::new(0, 100, 80);
        let out = bar.draw(&blank(10, 20), 80).unwrap();
        assert_eq!(out.pixel(0, 19), Some(ABOVE.0));
        assert_eq!(out.pixel(7, 19), Some(ABOVE.0));
        assert_eq!(out.pixel(8, 19), Some(TRACK.0));
    }

    #[test]
    fn out_of_range_confidence_is_clamped() {
        let bar = ConfidenceBar::new(0, 255, 100);
        let full = bar.draw(&blank(8, 4), 1000).unwrap();
        assert_eq!(full.pixel(7, 3), Some(ABOVE.0));
        let empty = bar.draw(&blank(8, 4), -5).unwrap();
        assert_eq!(empty.pixel(0, 3), Some(TRACK.0));
    }

    #[test]
    fn input_frame_is_not_modified() {
        let frame = blank(8, 4);
        ConfidenceBar::new(0, 10, 5).draw(&frame, 10).unwrap();
        assert!(frame.data().iter().all(|&b| b == 255));
    }
}
