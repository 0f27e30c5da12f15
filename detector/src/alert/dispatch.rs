use snowtify_common::config::NotifyConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::channel::{Notifier, NotifyError};
use super::window::NotificationEvent;
use crate::stop::{is_stopped, stopped, StopSignal};

/// Outcome of handing a notification to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submit {
    Queued,
    /// A notification is already waiting; it already means "alert due".
    Dropped,
    /// The dispatcher has shut down.
    Closed,
}

/// Single-slot handoff from the event window to the dispatcher.
#[derive(Debug, Clone)]
pub struct Mailbox {
    tx: mpsc::Sender<NotificationEvent>,
}

impl Mailbox {
    pub fn new() -> (Self, mpsc::Receiver<NotificationEvent>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx }, rx)
    }

    /// Never waits: a full slot drops the submission.
    pub fn try_submit(&self, event: NotificationEvent) -> Submit {
        match self.tx.try_send(event) {
            Ok(()) => Submit::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => Submit::Dropped,
            Err(mpsc::error::TrySendError::Closed(_)) => Submit::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &NotifyConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }
}

/// Per-run delivery counters, counted per channel delivery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub delivered: u64,
    pub failed: u64,
    pub dropped_on_shutdown: u64,
}

/// Deliver queued notifications to every channel until stopped.
///
/// A channel that keeps failing is given up on after `policy.max_attempts`
/// and reported; the other channels are still tried. Stop ends the current
/// notification without trying the channels not reached yet, and a
/// notification still sitting in the slot is discarded.
pub async fn run_dispatch_loop(
    mut inbox: mpsc::Receiver<NotificationEvent>,
    channels: Vec<Arc<dyn Notifier>>,
    policy: RetryPolicy,
    mut stop: StopSignal,
) -> DispatchStats {
    let mut stats = DispatchStats::default();
    info!(
        channels = channels.len(),
        max_attempts = policy.max_attempts,
        backoff_ms = policy.backoff.as_millis() as u64,
        "notification dispatcher started"
    );

    loop {
        let event = tokio::select! {
            biased;
            _ = stopped(&mut stop) => break,
            event = inbox.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        info!(tick = event.tick, "dispatching notification");
        for channel in &channels {
            if is_stopped(&stop) {
                warn!(channel = channel.name(), tick = event.tick, "notification abandoned on shutdown");
                break;
            }
            match deliver(channel.as_ref(), &event, policy, &mut stop).await {
                Ok(attempts) => {
                    stats.delivered += 1;
                    info!(channel = channel.name(), attempts, tick = event.tick, "notification delivered");
                }
                Err(e @ NotifyError::Cancelled { .. }) => {
                    warn!(error = %e, tick = event.tick, "notification abandoned on shutdown");
                    break;
                }
                Err(e) => {
                    stats.failed += 1;
                    error!(error = %e, channel = channel.name(), tick = event.tick, "notification delivery failed");
                }
            }
        }
    }

    inbox.close();
    while let Ok(event) = inbox.try_recv() {
        stats.dropped_on_shutdown += 1;
        warn!(tick = event.tick, "discarding undelivered notification on shutdown");
    }

    info!(
        delivered = stats.delivered,
        failed = stats.failed,
        dropped = stats.dropped_on_shutdown,
        "notification dispatcher stopped"
    );
    stats
}

/// Try one channel with fixed backoff. Returns the attempt that succeeded.
pub async fn deliver(
    channel: &dyn Notifier,
    event: &NotificationEvent,
    policy: RetryPolicy,
    stop: &mut StopSignal,
) -> Result<u32, NotifyError> {
    for attempt in 1..=policy.max_attempts {
        match channel.send(event).await {
            Ok(()) => return Ok(attempt),
            Err(e) => {
                warn!(
                    error = %e,
                    channel = channel.name(),
                    attempt,
                    max_attempts = policy.max_attempts,
                    "notification attempt failed"
                );
            }
        }

        if attempt < policy.max_attempts {
            tokio::select! {
                _ = tokio::time::sleep(policy.backoff) => {}
                _ = stopped(stop) => {
                    return Err(NotifyError::Cancelled {
                        channel: channel.name().to_string(),
                        attempts: attempt,
                    });
                }
            }
        }
    }

    Err(NotifyError::DeliveryFailed {
        channel: channel.name().to_string(),
        attempts: policy.max_attempts,
    })
}
