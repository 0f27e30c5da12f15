use snowtify_common::config::{DetectionConfig, StreamConfig, StreamMode};
use snowtify_common::frame::{Frame, FrameError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::alert::window::{EventFlag, WindowSnapshot};
use crate::annotate::ConfidenceBar;
use crate::output::OutputMultiplexer;
use crate::score::Scorer;
use crate::smoother::ConfidenceSmoother;
use crate::source::{FrameSource, SourceError};
use crate::stop::{is_stopped, stopped, StopSignal};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("frame source failed: {0}")]
    Source(#[from] SourceError),
    #[error("failed to annotate frame: {0}")]
    Annotate(#[from] FrameError),
}

/// Why a detection run returned without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEnd {
    EndOfStream,
    Stopped,
}

/// Counters accumulated across every source the detector has consumed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub frames: u64,
    pub processed: u64,
    pub events: u64,
}

/// Scores frames, smooths the score and logs snow events.
///
/// Survives source reconnects, so the counters and the output sequence carry
/// on from where the previous source left off. Confidence does not: frames
/// on either side of a reconnect gap are unrelated, so `run_stream` restarts
/// it from the minimum.
pub struct Detector {
    scorer: Box<dyn Scorer>,
    smoother: ConfidenceSmoother,
    threshold: i64,
    frame_hop: u64,
    flag: EventFlag,
    window: Option<watch::Receiver<WindowSnapshot>>,
    output: Option<(OutputMultiplexer, ConfidenceBar)>,
    next_out_seq: u64,
    stats: PipelineStats,
}

impl Detector {
    pub fn new(scorer: Box<dyn Scorer>, detection: &DetectionConfig, frame_hop: u64, flag: EventFlag) -> Self {
        Self {
            scorer,
            smoother: ConfidenceSmoother::from_config(detection),
            threshold: detection.confidence_threshold,
            frame_hop: frame_hop.max(1),
            flag,
            window: None,
            output: None,
            next_out_seq: 0,
            stats: PipelineStats::default(),
        }
    }

    /// Also submit every processed frame, annotated, to `mux`.
    pub fn with_output(mut self, mux: OutputMultiplexer, bar: ConfidenceBar) -> Self {
        self.output = Some((mux, bar));
        self
    }

    /// Report the alerting window's state alongside detection logs.
    pub fn with_window_state(mut self, window: watch::Receiver<WindowSnapshot>) -> Self {
        self.window = Some(window);
        self
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    pub fn confidence(&self) -> i64 {
        self.smoother.value()
    }

    fn window_state(&self) -> Option<WindowSnapshot> {
        self.window.as_ref().map(|window| *window.borrow())
    }

    /// Forget the accumulated confidence before reading a fresh feed.
    pub fn reset_confidence(&mut self) {
        let previous = self.smoother.value();
        self.smoother.reset();
        debug!(previous, confidence = self.smoother.value(), "confidence reset");
    }

    /// Pull frames from `source` until it ends, fails, or a stop is requested.
    ///
    /// The source is closed before returning in every case.
    pub async fn run(&mut self, source: &mut FrameSource, stop: &mut StopSignal) -> Result<RunEnd, PipelineError> {
        info!(scorer = self.scorer.name(), frame_hop = self.frame_hop, "detection loop started");
        let end = loop {
            let next = tokio::select! {
                biased;
                _ = stopped(stop) => break Ok(RunEnd::Stopped),
                next = source.next_frame() => next,
            };
            match next {
                Ok(Some(frame)) => {
                    if let Err(e) = self.process(&frame) {
                        break Err(e);
                    }
                }
                Ok(None) => break Ok(RunEnd::EndOfStream),
                Err(e) => {
                    warn!(error = %e, frames = self.stats.frames, "frame source failed");
                    break Err(e.into());
                }
            }
        };
        source.close().await;
        let window = self.window_state();
        info!(
            source_frames = source.frames_read(),
            frames = self.stats.frames,
            processed = self.stats.processed,
            events = self.stats.events,
            confidence = self.confidence(),
            is_snowing = window.map(|w| w.is_snowing),
            snow_tally = window.map(|w| w.snow_tally),
            "detection loop finished"
        );
        end
    }

    /// Handle one decoded frame. Frames off the hop are only counted.
    pub fn process(&mut self, frame: &Frame) -> Result<(), PipelineError> {
        self.stats.frames += 1;
        let index = frame.seq().unwrap_or(self.stats.frames - 1);
        if index % self.frame_hop != 0 {
            return Ok(());
        }
        self.stats.processed += 1;

        let count = self.scorer.score(frame);
        let confidence = self.smoother.update(count);
        if confidence >= self.threshold {
            self.flag.increment_event();
            self.stats.events += 1;
            debug!(
                index,
                count,
                confidence,
                is_snowing = self.window_state().map(|w| w.is_snowing),
                "snow event"
            );
        }

        if let Some((mux, bar)) = &self.output {
            let annotated = bar.draw(frame, confidence)?;
            mux.submit(self.next_out_seq, annotated);
            self.next_out_seq += 1;
        }
        Ok(())
    }
}

/// How often, and how patiently, a failed feed is reopened.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub max_reconnects: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl ReconnectPolicy {
    /// Only live feeds reconnect; a stored file that fails is not retried.
    pub fn from_config(config: &StreamConfig) -> Self {
        Self {
            max_reconnects: match config.mode {
                StreamMode::Live => config.max_reconnects,
                StreamMode::File => 0,
            },
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Drive `detector` over sources produced by `open`, reopening on failure.
///
/// Returns `Ok` when the feed ends cleanly or a stop is requested, and the
/// last error once `policy.max_reconnects` reopen attempts are used up.
pub async fn run_stream<F>(
    mut open: F,
    detector: &mut Detector,
    policy: ReconnectPolicy,
    stop: &mut StopSignal,
) -> Result<(), PipelineError>
where
    F: FnMut() -> Result<FrameSource, SourceError>,
{
    let mut backoff = policy.initial_backoff;
    let mut reconnects = 0u32;

    loop {
        if is_stopped(stop) {
            return Ok(());
        }
        let attempt = match open() {
            Ok(mut source) => detector.run(&mut source, stop).await,
            Err(e) => Err(e.into()),
        };
        match attempt {
            Ok(RunEnd::EndOfStream) => {
                info!(frames = detector.stats().frames, "stream ended");
                return Ok(());
            }
            Ok(RunEnd::Stopped) => return Ok(()),
            Err(e) if reconnects < policy.max_reconnects => {
                reconnects += 1;
                error!(
                    error = %e,
                    reconnects,
                    max_reconnects = policy.max_reconnects,
                    "stream error, reconnecting in {:?}",
                    backoff
                );
                tokio::select! {
                    _ = stopped(stop) => return Ok(()),
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(policy.max_backoff);
                detector.reset_confidence();
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::source::ReadMode;
    use crate::stop::stop_channel;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::process::Command;

    /// Returns the same count for every frame and remembers how often it ran.
    struct Fixed {
        count: u32,
        calls: Arc<AtomicU32>,
    }

    impl Scorer for Fixed {
        fn score(&mut self, _frame: &Frame) -> u32 {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.count
        }
    }

    fn detection() -> DetectionConfig {
        DetectionConfig {
            sensitivity: 100.0,
            decay: 0.0,
            min: 0,
            max: 255,
            confidence_threshold: 50,
        }
    }

    fn detector(count: u32, frame_hop: u64) -> (Detector, EventFlag, Arc<AtomicU32>) {
        let flag = EventFlag::new();
        let calls = Arc::new(AtomicU32::new(0));
        let scorer = Fixed {
            count,
            calls: calls.clone(),
        };
        let detector = Detector::new(Box::new(scorer), &detection(), frame_hop, flag.clone());
        (detector, flag, calls)
    }

    /// `frames` zeroed 2x1 frames, then a clean end of file.
    fn file_source(frames: usize) -> FrameSource {
        let mut cmd = Command::new("head");
        cmd.args(["-c", &(frames * 6).to_string(), "/dev/zero"]);
        FrameSource::spawn(cmd, ReadMode::File { offset_frames: 0 }, 2, 1).unwrap()
    }

    #[tokio::test]
    async fn snowy_frames_raise_the_flag() {
        let (mut detector, flag, _) = detector(1, 1);
        let (_stop_tx, mut stop) = stop_channel();
        let end = detector.run(&mut file_source(5), &mut stop).await.unwrap();
        assert_eq!(end, RunEnd::EndOfStream);
        assert!(flag.take());
        assert!(detector.confidence() >= 50);
        assert_eq!(detector.stats(), PipelineStats { frames: 5, processed: 5, events: 5 });
    }

    #[tokio::test]
    async fn quiet_frames_leave_the_flag_clear() {
        let (mut detector, flag, _) = detector(0, 1);
        let (_stop_tx, mut stop) = stop_channel();
        detector.run(&mut file_source(5), &mut stop).await.unwrap();
        assert!(!flag.take());
        assert_eq!(detector.stats().events, 0);
    }

    #[tokio::test]
    async fn frame_hop_skips_frames() {
        let (mut detector, _, calls) = detector(0, 3);
        let (_stop_tx, mut stop) = stop_channel();
        detector.run(&mut file_source(10), &mut stop).await.unwrap();
        // indices 0, 3, 6, 9
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(detector.stats().frames, 10);
        assert_eq!(detector.stats().processed, 4);
    }

    #[tokio::test]
    async fn processed_frames_reach_the_multiplexer() {
        let (detector, _, _) = detector(1, 2);
        let mux = OutputMultiplexer::new(10.0, 16);
        let mut detector = detector.with_output(mux.clone(), ConfidenceBar::new(0, 255, 50));
        let (_stop_tx, mut stop) = stop_channel();
        detector.run(&mut file_source(6), &mut stop).await.unwrap();
        assert_eq!(mux.pending(), 3);

        // a second source continues the output sequence instead of restarting it
        detector.run(&mut file_source(2), &mut stop).await.unwrap();
        assert_eq!(mux.pending(), 4);
    }

    #[tokio::test]
    async fn live_failure_is_a_source_error() {
        let (mut detector, _, _) = detector(1, 1);
        let (_stop_tx, mut stop) = stop_channel();
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "printf abc"]);
        let mode = ReadMode::Live {
            read_timeout: Duration::from_secs(5),
        };
        let mut source = FrameSource::spawn(cmd, mode, 2, 1).unwrap();
        let err = detector.run(&mut source, &mut stop).await.unwrap_err();
        assert!(matches!(err, PipelineError::Source(SourceError::ShortRead { .. })));
    }

    #[tokio::test]
    async fn stop_interrupts_a_stalled_source() {
        let (mut detector, _, _) = detector(1, 1);
        let (stop_tx, mut stop) = stop_channel();
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let mode = ReadMode::Live {
            read_timeout: Duration::from_secs(60),
        };
        let mut source = FrameSource::spawn(cmd, mode, 2, 1).unwrap();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stop_tx.send(true).unwrap();
        });
        let end = detector.run(&mut source, &mut stop).await.unwrap();
        assert_eq!(end, RunEnd::Stopped);
        assert_eq!(detector.stats().frames, 0);
    }

    fn failing_live_source() -> Result<FrameSource, SourceError> {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "printf abc"]);
        let mode = ReadMode::Live {
            read_timeout: Duration::from_secs(5),
        };
        FrameSource::spawn(cmd, mode, 2, 1)
    }

    fn quick_policy(max_reconnects: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            max_reconnects,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn reconnects_until_budget_is_spent() {
        let (mut detector, _, _) = detector(1, 1);
        let (_stop_tx, mut stop) = stop_channel();
        let mut opens = 0;
        let open = || {
            opens += 1;
            failing_live_source()
        };
        let err = run_stream(open, &mut detector, quick_policy(2), &mut stop).await.unwrap_err();
        assert!(matches!(err, PipelineError::Source(SourceError::ShortRead { .. })));
        assert_eq!(opens, 3);
    }

    #[tokio::test]
    async fn recovers_when_a_reopened_feed_ends_cleanly() {
        let (mut detector, _, _) = detector(1, 1);
        let (_stop_tx, mut stop) = stop_channel();
        let mut opens = 0;
        let open = || {
            opens += 1;
            if opens == 1 {
                failing_live_source()
            } else {
                Ok(file_source(3))
            }
        };
        run_stream(open, &mut detector, quick_policy(1), &mut stop).await.unwrap();
        assert_eq!(opens, 2);
        assert_eq!(detector.stats().frames, 3);
    }

    #[tokio::test]
    async fn reconnect_restarts_confidence() {
        let (mut detector, _, _) = detector(1, 1);
        let (_stop_tx, mut stop) = stop_channel();
        detector.run(&mut file_source(3), &mut stop).await.unwrap();
        assert!(detector.confidence() >= 50);

        // decay is zero here, so only the reset can bring confidence down
        let mut opens = 0;
        let open = || {
            opens += 1;
            if opens == 1 {
                failing_live_source()
            } else {
                Ok(file_source(0))
            }
        };
        run_stream(open, &mut detector, quick_policy(1), &mut stop).await.unwrap();
        assert_eq!(opens, 2);
        assert_eq!(detector.confidence(), 0);
    }

    #[tokio::test]
    async fn window_state_is_readable_while_detecting() {
        let (detector, flag, _) = detector(1, 1);
        let snapshot = WindowSnapshot {
            tick: 7,
            snow_tally: 4,
            no_snow_tally: 3,
            is_snowing: true,
            refractory_elapsed: 0,
        };
        let (_window_tx, window_rx) = watch::channel(snapshot);
        let mut detector = detector.with_window_state(window_rx);
        let (_stop_tx, mut stop) = stop_channel();
        detector.run(&mut file_source(2), &mut stop).await.unwrap();
        assert!(flag.take());
        assert_eq!(detector.window_state(), Some(snapshot));
    }

    #[tokio::test]
    async fn no_reconnects_by_default() {
        let (mut detector, _, _) = detector(1, 1);
        let (_stop_tx, mut stop) = stop_channel();
        let mut opens = 0;
        let open = || {
            opens += 1;
            Err(SourceError::Spawn("no decoder".into()))
        };
        let err = run_stream(open, &mut detector, quick_policy(0), &mut stop).await.unwrap_err();
        assert!(matches!(err, PipelineError::Source(SourceError::Spawn(_))));
        assert_eq!(opens, 1);
    }

    #[test]
    fn stored_files_are_never_reopened() {
        let mut stream = snowtify_common::config::Config::from_toml(
            "[stream]\nmode = \"file\"\nfile = \"clip.mp4\"\nmax_reconnects = 4\n",
        )
        .unwrap()
        .stream;
        assert_eq!(ReconnectPolicy::from_config(&stream).max_reconnects, 0);
        stream.mode = StreamMode::Live;
        let policy = ReconnectPolicy::from_config(&stream);
        assert_eq!(policy.max_reconnects, 4);
        assert_eq!(policy.initial_backoff, Duration::from_secs(2));
    }
}
