use bytes::Bytes;

/// Bytes per pixel of a raw decoder frame (packed 24-bit, BGR order).
pub const CHANNELS: usize = 3;

/// A raw camera frame with capture metadata.
///
/// Layout: `height` rows of `width` pixels, `CHANNELS` bytes each, no
/// padding and no header, exactly as the decoder writes it to its pipe.
/// The pixel buffer is shared, so clones are cheap and never copy pixels.
#[derive(Debug, Clone)]
pub struct Frame {
    data: Bytes,
    width: u32,
    height: u32,
    seq: Option<u64>,
    captured_at_ms: i64,
}

impl Frame {
    /// Wrap a raw pixel buffer, checking its length against the dimensions.
    pub fn new(
        data: impl Into<Bytes>,
        width: u32,
        height: u32,
        seq: Option<u64>,
        captured_at_ms: i64,
    ) -> Result<Self, FrameError> {
        let data = data.into();
        let expected = frame_len(width, height);
        if data.len() != expected {
            return Err(FrameError::SizeMismatch {
                got: data.len(),
                expected,
                width,
                height,
            });
        }
        Ok(Self {
            data,
            width,
            height,
            seq,
            captured_at_ms,
        })
    }

    /// Frame stamped with the current wall-clock time.
    pub fn captured_now(
        data: impl Into<Bytes>,
        width: u32,
        height: u32,
        seq: Option<u64>,
    ) -> Result<Self, FrameError> {
        Self::new(data, width, height, seq, chrono::Utc::now().timestamp_millis())
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Position in the stream of the source that produced this frame.
    pub fn seq(&self) -> Option<u64> {
        self.seq
    }

    pub fn captured_at_ms(&self) -> i64 {
        self.captured_at_ms
    }

    /// Pixel at (x, y) as `[b, g, r]`.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; CHANNELS]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = (y as usize * self.width as usize + x as usize) * CHANNELS;
        Some([self.data[i], self.data[i + 1], self.data[i + 2]])
    }
}

/// Byte length of one raw frame of the given dimensions.
pub fn frame_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * CHANNELS
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame buffer is {got} bytes, expected {expected} for {width}x{height}")]
    SizeMismatch {
        got: usize,
        expected: usize,
        width: u32,
        height: u32,
    },
}
