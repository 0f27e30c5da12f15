mod alert;
mod annotate;
mod output;
mod pipeline;
mod score;
mod smoother;
mod source;
mod stop;

use alert::channel::build_channels;
use alert::dispatch::RetryPolicy;
use alert::AlertService;
use annotate::ConfidenceBar;
use output::sink::{EncoderSink, FifoSink, SinkError};
use output::OutputMultiplexer;
use pipeline::{run_stream, Detector, ReconnectPolicy};
use score::MotionScorer;
use snowtify_common::config::{Config, OutputConfig, SinkKind, StreamConfig};
use source::FrameSource;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use stop::{stop_channel, stopped, StopSignal};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    info!(
        mode = ?config.stream.mode,
        width = config.stream.width,
        height = config.stream.height,
        frame_hop = config.stream.frame_hop,
        window_ticks = config.window.window_ticks,
        refractory_ticks = config.window.refractory_ticks,
        webhooks = config.notify.webhooks.len(),
        output = config.output.enabled,
        "starting snowtify"
    );

    // Decoding and republishing both fail without it.
    source::ffmpeg::check_ffmpeg_available(&config.stream.ffmpeg_path).await;

    let channels = match build_channels(&config.notify) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to set up notification channels");
            std::process::exit(1);
        }
    };
    let mut alerts = AlertService::new(config.window.clone(), RetryPolicy::from_config(&config.notify), channels);
    if let Err(e) = alerts.start() {
        error!(error = %e, "failed to start alert workers");
        std::process::exit(1);
    }

    let (stop_tx, mut stop) = stop_channel();
    let stop_tx = Arc::new(stop_tx);
    let interrupt_tx = Arc::clone(&stop_tx);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received, shutting down");
                interrupt_tx.send_replace(true);
            }
            Err(e) => warn!(error = %e, "failed to listen for interrupts"),
        }
    });

    let mut detector = Detector::new(
        Box::new(MotionScorer::default()),
        &config.detection,
        config.stream.frame_hop,
        alerts.flag(),
    );
    if let Some(window) = alerts.subscribe() {
        detector = detector.with_window_state(window);
    }

    let output_task = if config.output.enabled {
        let mux = OutputMultiplexer::new(config.output.fps, config.output.buffer_capacity);
        let bar = ConfidenceBar::new(
            config.detection.min,
            config.detection.max,
            config.detection.confidence_threshold,
        );
        detector = detector.with_output(mux.clone(), bar);
        let output = config.output.clone();
        let stream = config.stream.clone();
        let output_stop = stop.clone();
        Some(tokio::spawn(async move {
            run_output(mux, &output, &stream, output_stop).await;
        }))
    } else {
        None
    };

    let stream_config = config.stream.clone();
    let result = run_stream(
        || FrameSource::open(&stream_config),
        &mut detector,
        ReconnectPolicy::from_config(&config.stream),
        &mut stop,
    )
    .await;

    stop_tx.send_replace(true);
    if let Some(task) = output_task {
        if let Err(e) = task.await {
            error!(error = %e, "output task panicked");
        }
    }
    match alerts.stop().await {
        Ok(summary) => info!(
            ticks = summary.window.tick,
            delivered = summary.dispatch.delivered,
            failed = summary.dispatch.failed,
            "alerting shut down"
        ),
        Err(e) => error!(error = %e, "failed to stop alert workers"),
    }

    let stats = detector.stats();
    if let Err(e) = result {
        error!(error = %e, frames = stats.frames, "snowtify stopped on a fatal stream error");
        std::process::exit(1);
    }
    info!(
        frames = stats.frames,
        processed = stats.processed,
        events = stats.events,
        "snowtify finished"
    );
}

/// Feed the multiplexer into the configured sink, reopening it whenever the
/// reader goes away, until stopped.
async fn run_output(mux: OutputMultiplexer, output: &OutputConfig, stream: &StreamConfig, mut stop: StopSignal) {
    let reopen_delay = Duration::from_secs(2);

    loop {
        let result = match output.sink {
            SinkKind::Fifo => {
                // opening blocks until a reader attaches
                let opened = tokio::select! {
                    _ = stopped(&mut stop) => return,
                    opened = FifoSink::open(&output.pipe_path) => opened,
                };
                match opened {
                    Ok(mut sink) => {
                        let result = mux.run(&mut sink, stop.clone()).await;
                        info!(
                            path = %sink.path().display(),
                            frames = sink.frames_written(),
                            pending = mux.pending(),
                            "output pipe released"
                        );
                        result
                    }
                    Err(e) => Err(e),
                }
            }
            SinkKind::Encoder => {
                match EncoderSink::start(
                    &stream.ffmpeg_path,
                    stream.width,
                    stream.height,
                    output.fps,
                    &output.publish_url,
                ) {
                    Ok(mut sink) => match mux.run(&mut sink, stop.clone()).await {
                        Ok(stats) => {
                            if let Err(e) = sink.finish().await {
                                warn!(error = %e, "output encoder did not shut down cleanly");
                            }
                            Ok(stats)
                        }
                        Err(e) => Err(e),
                    },
                    Err(e) => Err(e),
                }
            }
        };

        match result {
            Ok(_) => return,
            Err(SinkError::Closed) => {
                warn!(
                    sink = ?output.sink,
                    pending = mux.pending(),
                    "output reader went away, reopening in {:?}",
                    reopen_delay
                );
            }
            Err(e) => {
                error!(error = %e, "output sink failed, republishing disabled");
                return;
            }
        }

        tokio::select! {
            _ = stopped(&mut stop) => return,
            _ = tokio::time::sleep(reopen_delay) => {}
        }
    }
}
