use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use snowtify_common::frame::Frame;
use std::ffi::CString;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::pipe;
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, info, warn};

use crate::source::ffmpeg::encoder_command;

const READER_POLL: Duration = Duration::from_millis(200);
const FINISH_GRACE: Duration = Duration::from_secs(5);

/// Destination for multiplexed output frames.
pub trait FrameSink: Send {
    fn name(&self) -> &str;

    fn write_frame<'a>(&'a mut self, frame: &'a Frame) -> BoxFuture<'a, Result<(), SinkError>>;
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The reader went away; the downstream encoder has to be reset.
    #[error("output sink closed by its reader")]
    Closed,
    #[error("failed to create named pipe {path}: {reason}")]
    Create { path: String, reason: String },
    #[error("failed to open {path} for writing: {reason}")]
    Open { path: String, reason: String },
    #[error("failed to spawn output encoder: {0}")]
    Spawn(String),
    #[error("failed to write frame: {0}")]
    Write(String),
}

fn write_error(e: io::Error) -> SinkError {
    match e.kind() {
        io::ErrorKind::BrokenPipe => SinkError::Closed,
        _ => SinkError::Write(e.to_string()),
    }
}

/// Writes raw frames into a named pipe for an external encoder to consume.
pub struct FifoSink {
    path: PathBuf,
    pipe: pipe::Sender,
    frames: u64,
}

impl FifoSink {
    /// Create the pipe if it does not exist yet, then open it for writing.
    ///
    /// Waits until a reader has opened the other end. Neither the wait nor
    /// later writes hold a thread, so dropping either future abandons it
    /// cleanly.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            make_fifo(&path)?;
            info!(path = %path.display(), "created output pipe");
        }

        let open_error = |e: io::Error| SinkError::Open {
            path: path.display().to_string(),
            reason: e.to_string(),
        };
        let mut waiting = false;
        let sender = loop {
            match pipe::OpenOptions::new().open_sender(&path) {
                Ok(sender) => break sender,
                // no reader on the other end yet
                Err(e) if e.raw_os_error() == Some(libc::ENXIO) => {
                    if !waiting {
                        info!(path = %path.display(), "waiting for a reader on the output pipe");
                        waiting = true;
                    }
                    tokio::time::sleep(READER_POLL).await;
                }
                Err(e) => return Err(open_error(e)),
            }
        };
        debug!(path = %path.display(), "output pipe opened");

        Ok(Self {
            path,
            pipe: sender,
            frames: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn frames_written(&self) -> u64 {
        self.frames
    }
}

fn make_fifo(path: &Path) -> Result<(), SinkError> {
    let create_error = |reason: String| SinkError::Create {
        path: path.display().to_string(),
        reason,
    };
    let c_path = CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|e| create_error(e.to_string()))?;
    // SAFETY: c_path is a valid NUL-terminated string that outlives the call.
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o644) };
    if rc != 0 {
        return Err(create_error(io::Error::last_os_error().to_string()));
    }
    Ok(())
}

impl FrameSink for FifoSink {
    fn name(&self) -> &str {
        "fifo"
    }

    fn write_frame<'a>(&'a mut self, frame: &'a Frame) -> BoxFuture<'a, Result<(), SinkError>> {
        async move {
            self.pipe.write_all(frame.data()).await.map_err(write_error)?;
            self.frames += 1;
            Ok(())
        }
        .boxed()
    }
}

/// Runs the republishing encoder itself and feeds raw frames to its stdin.
pub struct EncoderSink {
    child: Child,
    stdin: Option<ChildStdin>,
    frames: u64,
}

impl EncoderSink {
    pub fn start(ffmpeg_path: &str, width: u32, height: u32, fps: f64, publish_url: &str) -> Result<Self, SinkError> {
        let sink = Self::spawn(encoder_command(ffmpeg_path, width, height, fps, publish_url))?;
        info!(width, height, fps, publish_url, "output encoder started");
        Ok(sink)
    }

    /// Spawn any command that reads raw frames on stdin.
    pub fn spawn(mut cmd: Command) -> Result<Self, SinkError> {
        cmd.stdin(std::process::Stdio::piped()).kill_on_drop(true);
        let mut child = cmd.spawn().map_err(|e| SinkError::Spawn(e.to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SinkError::Spawn("could not get stdin handle".into()))?;
        Ok(Self {
            child,
            stdin: Some(stdin),
            frames: 0,
        })
    }

    /// Close stdin and wait for the encoder to drain and exit.
    pub async fn finish(self) -> Result<u64, SinkError> {
        self.finish_within(FINISH_GRACE).await
    }

    /// Like `finish`, but kills an encoder that has not exited after `grace`.
    pub async fn finish_within(mut self, grace: Duration) -> Result<u64, SinkError> {
        drop(self.stdin.take());
        let status = match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(waited) => waited.map_err(|e| SinkError::Write(e.to_string()))?,
            Err(_) => {
                warn!(?grace, frames = self.frames, "output encoder did not exit, killing it");
                self.child.kill().await.map_err(|e| SinkError::Write(e.to_string()))?;
                return Ok(self.frames);
            }
        };
        if !status.success() {
            warn!(%status, frames = self.frames, "output encoder exited with error");
        }
        Ok(self.frames)
    }
}

impl FrameSink for EncoderSink {
    fn name(&self) -> &str {
        "encoder"
    }

    fn write_frame<'a>(&'a mut self, frame: &'a Frame) -> BoxFuture<'a, Result<(), SinkError>> {
        async move {
            let stdin = self.stdin.as_mut().ok_or(SinkError::Closed)?;
            stdin.write_all(frame.data()).await.map_err(write_error)?;
            self.frames += 1;
            Ok(())
        }
        .boxed()
    }
}
