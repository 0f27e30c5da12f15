pub mod ffmpeg;

use snowtify_common::config::{StreamConfig, StreamMode};
use snowtify_common::frame::{frame_len, Frame, FrameError};
use std::process::ExitStatus;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, info, warn};

/// How reads against the decoder pipe are interpreted.
#[derive(Debug, Clone, Copy)]
pub enum ReadMode {
    /// Continuous feed: every read must deliver a full frame within `read_timeout`.
    Live { read_timeout: Duration },
    /// Stored container: a clean EOF between frames ends the stream.
    File { offset_frames: u64 },
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("failed to spawn decoder: {0}")]
    Spawn(String),
    #[error("short read from decoder: got {got} of {expected} bytes")]
    ShortRead { got: usize, expected: usize },
    #[error("no frame from decoder within {0:?}")]
    Timeout(Duration),
    #[error("failed to read decoder output: {0}")]
    Read(#[from] std::io::Error),
    #[error("decoder exited with {0}")]
    DecoderExited(ExitStatus),
    #[error("frame source is closed")]
    Closed,
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Pull-based raw frame producer backed by a decoder subprocess.
///
/// The decoder is spawned on construction and killed on close, on any fatal
/// read, at end of stream, and on drop.
pub struct FrameSource {
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    mode: ReadMode,
    width: u32,
    height: u32,
    skip_remaining: u64,
    next_seq: u64,
    exhausted: bool,
}

impl FrameSource {
    /// Spawn the ffmpeg decoder described by the stream config.
    pub fn open(config: &StreamConfig) -> Result<Self, SourceError> {
        let mode = match config.mode {
            StreamMode::Live => ReadMode::Live {
                read_timeout: Duration::from_secs(config.read_timeout_secs),
            },
            StreamMode::File => ReadMode::File {
                offset_frames: config.offset_frames,
            },
        };
        let source = Self::spawn(ffmpeg::decoder_command(config), mode, config.width, config.height)?;
        info!(
            mode = ?config.mode,
            width = config.width,
            height = config.height,
            offset_frames = config.offset_frames,
            "frame source opened"
        );
        Ok(source)
    }

    /// Spawn any command that writes raw `width x height` frames to stdout.
    pub fn spawn(mut cmd: Command, mode: ReadMode, width: u32, height: u32) -> Result<Self, SourceError> {
        cmd.stdout(std::process::Stdio::piped()).kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| SourceError::Spawn(e.to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SourceError::Spawn("could not get stdout handle".into()))?;

        let skip_remaining = match mode {
            ReadMode::File { offset_frames } => offset_frames,
            ReadMode::Live { .. } => 0,
        };

        Ok(Self {
            child: Some(child),
            stdout: Some(stdout),
            mode,
            width,
            height,
            skip_remaining,
            next_seq: 0,
            exhausted: false,
        })
    }

    /// Read the next frame.
    ///
    /// `Ok(None)` means a stored feed ended cleanly. Every `Err` is fatal: the
    /// decoder has already been torn down and the source must be reopened.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        if self.exhausted {
            return Ok(None);
        }
        if self.stdout.is_none() {
            return Err(SourceError::Closed);
        }

        while self.skip_remaining > 0 {
            match self.read_raw().await {
                Ok(Some(_)) => self.skip_remaining -= 1,
                Ok(None) => {
                    debug!(remaining = self.skip_remaining, "feed ended while skipping offset frames");
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        }

        let Some(raw) = self.read_raw().await? else {
            return Ok(None);
        };

        let seq = self.next_seq;
        self.next_seq += 1;
        let frame = Frame::captured_now(raw, self.width, self.height, Some(seq))?;
        Ok(Some(frame))
    }

    /// Read exactly one frame's worth of bytes, applying the mode's end rules.
    async fn read_raw(&mut self) -> Result<Option<Vec<u8>>, SourceError> {
        let expected = frame_len(self.width, self.height);
        let mut buf = vec![0u8; expected];
        let Some(stdout) = self.stdout.as_mut() else {
            return Err(SourceError::Closed);
        };

        let got = match self.mode {
            ReadMode::Live { read_timeout } => {
                let read = tokio::time::timeout(read_timeout, read_full(stdout, &mut buf)).await;
                match read {
                    Ok(result) => result,
                    Err(_) => {
                        self.close().await;
                        return Err(SourceError::Timeout(read_timeout));
                    }
                }
            }
            ReadMode::File { .. } => read_full(stdout, &mut buf).await,
        };

        let got = match got {
            Ok(n) => n,
            Err(e) => {
                self.close().await;
                return Err(SourceError::Read(e));
            }
        };

        if got == expected {
            return Ok(Some(buf));
        }

        if got == 0 {
            if let ReadMode::File { .. } = self.mode {
                return match self.finish().await {
                    Some(status) if !status.success() => Err(SourceError::DecoderExited(status)),
                    _ => {
                        self.exhausted = true;
                        info!(frames = self.next_seq, "stored feed exhausted");
                        Ok(None)
                    }
                };
            }
        }

        self.close().await;
        Err(SourceError::ShortRead { got, expected })
    }

    /// Wait for a decoder that has closed its output and report how it exited.
    async fn finish(&mut self) -> Option<ExitStatus> {
        self.stdout = None;
        let mut child = self.child.take()?;
        match child.wait().await {
            Ok(status) => Some(status),
            Err(e) => {
                warn!(error = %e, "failed to reap decoder");
                None
            }
        }
    }

    /// Terminate the decoder and release the pipe. Safe to call repeatedly.
    pub async fn close(&mut self) {
        self.stdout = None;
        let Some(mut child) = self.child.take() else {
            return;
        };
        if let Err(e) = child.start_kill() {
            debug!(error = %e, "decoder already exited");
        }
        match child.wait().await {
            Ok(status) => debug!(%status, "decoder terminated"),
            Err(e) => warn!(error = %e, "failed to reap decoder"),
        }
    }

    /// Frames handed out so far.
    pub fn frames_read(&self) -> u64 {
        self.next_seq
    }
}

/// Fill `buf` from the reader, stopping early only at EOF. Returns bytes read.
async fn read_full<R: AsyncReadExt + Unpin>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
