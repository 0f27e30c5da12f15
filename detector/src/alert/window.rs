use snowtify_common::config::WindowConfig;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::dispatch::{Mailbox, Submit};
use crate::stop::{stopped, StopSignal};

/// "An alert is due", raised by the window on a qualifying onset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotificationEvent {
    /// Window tick on which the alert fired.
    pub tick: u64,
    pub fired_at_ms: i64,
}

/// Pending-event flag shared between detection callers and the window worker.
///
/// Any number of `increment_event` calls between two ticks collapse into one.
#[derive(Debug, Clone, Default)]
pub struct EventFlag(Arc<AtomicBool>);

impl EventFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_event(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Read and clear in one step.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Read-only view of the window published after every tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowSnapshot {
    pub tick: u64,
    pub snow_tally: u32,
    pub no_snow_tally: u32,
    pub is_snowing: bool,
    pub refractory_elapsed: u32,
}

/// Debounce state machine over per-tick event flags.
///
/// Two capped counters stand in for a sliding window of `window` ticks.
/// While they sum to less than `window` each tick only increments one of
/// them; once the window is full every tick moves one unit from one counter
/// to the other, which keeps the sum pinned at `window` without storing
/// per-tick history.
#[derive(Debug, Clone)]
pub struct EventWindow {
    window: u32,
    snow_threshold: f64,
    no_snow_threshold: f64,
    refractory_period: u32,
    snow_tally: u32,
    no_snow_tally: u32,
    is_snowing: bool,
    refractory_elapsed: u32,
    tick: u64,
}

impl EventWindow {
    pub fn new(
        window: u32,
        notify_fraction: f64,
        no_snow_fraction: f64,
        refractory_period: u32,
        initial_refractory: u32,
    ) -> Self {
        Self {
            window,
            snow_threshold: window as f64 * notify_fraction,
            no_snow_threshold: window as f64 * no_snow_fraction,
            refractory_period,
            snow_tally: 0,
            no_snow_tally: 0,
            is_snowing: false,
            refractory_elapsed: initial_refractory.min(refractory_period),
            tick: 0,
        }
    }

    pub fn from_config(config: &WindowConfig) -> Self {
        let initial = if config.immediate_first_notify {
            config.refractory_ticks
        } else {
            0
        };
        Self::new(
            config.window_ticks,
            config.notify_fraction,
            config.no_snow_fraction,
            config.refractory_ticks,
            initial,
        )
    }

    /// Advance one tick. `pending` is whether an event was logged since the
    /// previous tick. Returns the notification to send, if this tick fires one.
    pub fn tick(&mut self, pending: bool) -> Option<NotificationEvent> {
        self.tick += 1;

        if self.snow_tally + self.no_snow_tally < self.window {
            if pending {
                self.snow_tally += 1;
            } else {
                self.no_snow_tally += 1;
            }
        } else if pending {
            self.snow_tally = (self.snow_tally + 1).min(self.window);
            self.no_snow_tally = self.no_snow_tally.saturating_sub(1);
        } else {
            self.no_snow_tally = (self.no_snow_tally + 1).min(self.window);
            self.snow_tally = self.snow_tally.saturating_sub(1);
        }

        if self.snow_tally as f64 >= self.snow_threshold {
            self.is_snowing = true;
            if self.refractory_elapsed >= self.refractory_period {
                self.refractory_elapsed = 0;
                return Some(NotificationEvent {
                    tick: self.tick,
                    fired_at_ms: chrono::Utc::now().timestamp_millis(),
                });
            }
        } else if self.no_snow_tally as f64 >= self.no_snow_threshold {
            self.is_snowing = false;
            if self.refractory_elapsed < self.refractory_period {
                self.refractory_elapsed += 1;
            }
        }
        None
    }

    pub fn snapshot(&self) -> WindowSnapshot {
        WindowSnapshot {
            tick: self.tick,
            snow_tally: self.snow_tally,
            no_snow_tally: self.no_snow_tally,
            is_snowing: self.is_snowing,
            refractory_elapsed: self.refractory_elapsed,
        }
    }
}

/// Tick the window every `interval` until `stop` flips to true.
///
/// Fired notifications go to the mailbox without waiting; if the dispatcher
/// still holds an undelivered one, the new one is dropped. Returns the final
/// window state.
pub async fn run_window_loop(
    mut window: EventWindow,
    flag: EventFlag,
    interval: Duration,
    mailbox: Mailbox,
    snapshots: watch::Sender<WindowSnapshot>,
    mut stop: StopSignal,
) -> EventWindow {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        window = window.window,
        snow_threshold = window.snow_threshold,
        no_snow_threshold = window.no_snow_threshold,
        refractory_period = window.refractory_period,
        refractory_elapsed = window.refractory_elapsed,
        "event window started"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stopped(&mut stop) => break,
        }

        let was_snowing = window.is_snowing;
        let pending = flag.take();
        let fired = window.tick(pending);
        let snap = window.snapshot();

        debug!(
            tick = snap.tick,
            pending,
            snow = snap.snow_tally,
            no_snow = snap.no_snow_tally,
            refractory = snap.refractory_elapsed,
            "window tick"
        );
        if snap.is_snowing != was_snowing {
            info!(
                tick = snap.tick,
                snow = snap.snow_tally,
                no_snow = snap.no_snow_tally,
                is_snowing = snap.is_snowing,
                "snow state changed"
            );
        }

        if let Some(event) = fired {
            match mailbox.try_submit(event) {
                Submit::Queued => info!(tick = event.tick, "notification queued"),
                Submit::Dropped => {
                    warn!(tick = event.tick, "notification already pending, dropping new one")
                }
                Submit::Closed => warn!(tick = event.tick, "dispatcher gone, notification lost"),
            }
        }

        snapshots.send_replace(snap);
    }

    info!(tick = window.tick, "event window stopped");
    window
}
