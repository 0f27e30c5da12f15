use snowtify_common::config::{StreamConfig, StreamMode};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

/// Build the decoder command for the configured stream.
///
/// Both modes emit headerless `bgr24` frames of exactly `width x height`
/// on stdout; scaling and the optional blur run inside ffmpeg so every frame
/// reaching the scorer has already been pre-processed.
pub fn decoder_command(config: &StreamConfig) -> Command {
    let input = match config.mode {
        StreamMode::Live => config.url.clone(),
        StreamMode::File => config.file.clone().unwrap_or_default(),
    };

    let mut filters = format!("scale={}:{}", config.width, config.height);
    if let Some(sigma) = config.blur_sigma {
        filters.push_str(&format!(",gblur=sigma={sigma}"));
    }

    let mut cmd = Command::new(&config.ffmpeg_path);
    cmd.args(["-nostdin", "-loglevel", "error"]);
    if config.mode == StreamMode::Live {
        cmd.args(["-fflags", "nobuffer"]);
    }
    cmd.args([
        "-i", &input,
        "-an",
        "-vf", &filters,
        "-f", "rawvideo",
        "-pix_fmt", "bgr24",
        "pipe:1",
    ])
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::null());

    debug!(
        mode = ?config.mode,
        input,
        filters,
        "ffmpeg decoder command prepared"
    );
    cmd
}

/// Build the republishing encoder: raw frames on stdin, FLV/H.264 out.
pub fn encoder_command(ffmpeg_path: &str, width: u32, height: u32, fps: f64, publish_url: &str) -> Command {
    let size = format!("{width}x{height}");
    let rate = fps.to_string();

    let mut cmd = Command::new(ffmpeg_path);
    cmd.args([
        "-nostdin", "-loglevel", "error",
        "-f", "rawvideo",
        "-pix_fmt", "bgr24",
        "-s", &size,
        "-r", &rate,
        "-i", "pipe:0",
        "-c:v", "libx264",
        "-preset", "veryfast",
        "-tune", "zerolatency",
        "-pix_fmt", "yuv420p",
        "-f", "flv",
        publish_url,
    ])
    .stdin(Stdio::piped())
    .stdout(Stdio::null())
    .stderr(Stdio::null());
    cmd
}

/// Check whether ffmpeg is available. Logs a warning if not found.
pub async fn check_ffmpeg_available(ffmpeg_path: &str) {
    match Command::new(ffmpeg_path).arg("-version").output().await {
        Ok(out) if out.status.success() => {
            debug!(ffmpeg_path, "ffmpeg is available");
        }
        Ok(_) => {
            warn!(ffmpeg_path, "ffmpeg returned non-zero for -version; decoding may fail");
        }
        Err(e) => {
            warn!(
                error = %e,
                ffmpeg_path,
                "ffmpeg not found; the frame source cannot start without it"
            );
        }
    }
}
