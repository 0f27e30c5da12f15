use image::{DynamicImage, GrayImage, Rgb, RgbImage};
use snowtify_common::frame::Frame;
use tracing::debug;

/// Per-frame observation counter feeding the confidence smoother.
pub trait Scorer: Send {
    /// Number of snow-like observations in this frame.
    fn score(&mut self, frame: &Frame) -> u32;

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}

/// Coarse frame-difference scorer.
///
/// Splits the luma plane into a `cols x rows` grid and counts the cells whose
/// mean brightness rose by more than `rise_threshold` since the previous
/// frame. Falling flakes brighten the cells they pass through, so a steady
/// count of rising cells is a cheap stand-in for a real flake detector.
pub struct MotionScorer {
    cols: u32,
    rows: u32,
    rise_threshold: f32,
    previous: Option<Vec<f32>>,
}

impl MotionScorer {
    pub fn new(cols: u32, rows: u32, rise_threshold: f32) -> Self {
        Self {
            cols: cols.max(1),
            rows: rows.max(1),
            rise_threshold,
            previous: None,
        }
    }

    fn luma(frame: &Frame) -> GrayImage {
        let rgb = RgbImage::from_fn(frame.width(), frame.height(), |x, y| {
            let [b, g, r] = frame.pixel(x, y).unwrap_or_default();
            Rgb([r, g, b])
        });
        DynamicImage::ImageRgb8(rgb).to_luma8()
    }

    fn cell_means(&self, gray: &GrayImage) -> Vec<f32> {
        let (width, height) = gray.dimensions();
        let cells = (self.cols * self.rows) as usize;
        let mut sums = vec![0u64; cells];
        let mut counts = vec![0u32; cells];

        for (x, y, pixel) in gray.enumerate_pixels() {
            let cx = (x as u64 * self.cols as u64 / width as u64) as usize;
            let cy = (y as u64 * self.rows as u64 / height as u64) as usize;
            let i = cy * self.cols as usize + cx;
            sums[i] += pixel.0[0] as u64;
            counts[i] += 1;
        }

        sums.iter()
            .zip(&counts)
            .map(|(&sum, &count)| if count == 0 { 0.0 } else { sum as f32 / count as f32 })
            .collect()
    }
}

impl Default for MotionScorer {
    fn default() -> Self {
        Self::new(16, 9, 12.0)
    }
}

impl Scorer for MotionScorer {
    fn score(&mut self, frame: &Frame) -> u32 {
        let means = self.cell_means(&Self::luma(frame));

        let count = match &self.previous {
            Some(prev) if prev.len() == means.len() => means
                .iter()
                .zip(prev)
                .filter(|(now, before)| *now - *before > self.rise_threshold)
                .count() as u32,
            _ => 0,
        };

        debug!(count, cells = means.len(), "motion score");
        self.previous = Some(means);
        count
    }

    fn name(&self) -> &str {
        "motion"
    }
}
