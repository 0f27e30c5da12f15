pub mod channel;
pub mod dispatch;
pub mod window;

use snowtify_common::config::WindowConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::stop::stop_channel;
use channel::Notifier;
use dispatch::{run_dispatch_loop, DispatchStats, Mailbox, RetryPolicy};
use window::{run_window_loop, EventFlag, EventWindow, WindowSnapshot};

#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    #[error("alert workers are already running")]
    AlreadyRunning,
    #[error("alert workers are not running")]
    NotRunning,
    #[error("alert worker failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// What a finished run looked like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub window: WindowSnapshot,
    pub dispatch: DispatchStats,
}

struct Running {
    stop_tx: watch::Sender<bool>,
    snapshots: watch::Receiver<WindowSnapshot>,
    window: JoinHandle<EventWindow>,
    dispatcher: JoinHandle<DispatchStats>,
}

/// Owns the event window and dispatcher workers.
///
/// Every `start` builds a fresh window, mailbox and stop signal and clears
/// the event flag; nothing carries over from an earlier run.
pub struct AlertService {
    window_config: WindowConfig,
    policy: RetryPolicy,
    channels: Vec<Arc<dyn Notifier>>,
    flag: EventFlag,
    running: Option<Running>,
}

impl AlertService {
    pub fn new(window_config: WindowConfig, policy: RetryPolicy, channels: Vec<Arc<dyn Notifier>>) -> Self {
        Self {
            window_config,
            policy,
            channels,
            flag: EventFlag::new(),
            running: None,
        }
    }

    /// Handle for detection code to log events from anywhere.
    pub fn flag(&self) -> EventFlag {
        self.flag.clone()
    }

    /// Live window state of the current run, `None` while stopped.
    ///
    /// The receiver keeps the last published state after the run it belongs
    /// to is stopped; a restarted service publishes through a new channel.
    pub fn subscribe(&self) -> Option<watch::Receiver<WindowSnapshot>> {
        self.running.as_ref().map(|running| running.snapshots.clone())
    }

    pub fn start(&mut self) -> Result<(), AlertError> {
        if self.running.is_some() {
            return Err(AlertError::AlreadyRunning);
        }

        self.flag.clear();
        let window = EventWindow::from_config(&self.window_config);
        let (snap_tx, snapshots) = watch::channel(window.snapshot());
        let (mailbox, inbox) = Mailbox::new();
        let (stop_tx, stop_rx) = stop_channel();
        let interval = Duration::from_millis(self.window_config.tick_ms);

        let window = tokio::spawn(run_window_loop(
            window,
            self.flag.clone(),
            interval,
            mailbox,
            snap_tx,
            stop_rx.clone(),
        ));
        let dispatcher = tokio::spawn(run_dispatch_loop(
            inbox,
            self.channels.clone(),
            self.policy,
            stop_rx,
        ));

        self.running = Some(Running {
            stop_tx,
            snapshots,
            window,
            dispatcher,
        });
        info!(channels = self.channels.len(), tick_ms = self.window_config.tick_ms, "alert workers started");
        Ok(())
    }

    /// Signal both workers and wait for them to finish.
    pub async fn stop(&mut self) -> Result<RunSummary, AlertError> {
        let running = self.running.take().ok_or(AlertError::NotRunning)?;
        running.stop_tx.send_replace(true);

        let window = running.window.await?;
        let dispatch = running.dispatcher.await?;
        let last = window.snapshot();

        info!(
            ticks = last.tick,
            is_snowing = last.is_snowing,
            delivered = dispatch.delivered,
            failed = dispatch.failed,
            "alert workers stopped"
        );
        Ok(RunSummary {
            window: last,
            dispatch,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::channel::NotifyError;
    use crate::alert::window::NotificationEvent;
    use futures_util::future::BoxFuture;
    use futures_util::FutureExt;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<u64>>,
    }

    impl Notifier for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn send<'a>(&'a self, event: &'a NotificationEvent) -> BoxFuture<'a, Result<(), NotifyError>> {
            self.seen.lock().unwrap().push(event.tick);
            futures_util::future::ready(Ok(())).boxed()
        }
    }

    fn service(recorder: Arc<Recorder>) -> AlertService {
        let window = WindowConfig {
            window_ticks: 4,
            tick_ms: 1000,
            notify_fraction: 0.5,
            no_snow_fraction: 0.75,
            refractory_ticks: 2,
            immediate_first_notify: true,
        };
        let policy = RetryPolicy {
            max_attempts: 2,
            backoff: Duration::from_millis(100),
        };
        AlertService::new(window, policy, vec![recorder as Arc<dyn Notifier>])
    }

    fn current(alerts: &AlertService) -> WindowSnapshot {
        *alerts.subscribe().unwrap().borrow()
    }

    async fn advance(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn onset_notifies_through_dispatcher() {
        let recorder = Arc::new(Recorder::default());
        let mut alerts = service(recorder.clone());
        alerts.start().unwrap();

        advance(500).await;
        for _ in 0..2 {
            alerts.flag().increment_event();
            advance(1000).await;
        }
        advance(100).await;

        assert!(current(&alerts).is_snowing);
        let summary = alerts.stop().await.unwrap();
        assert_eq!(*recorder.seen.lock().unwrap(), vec![2]);
        assert_eq!(summary.window.snow_tally, 2);
        assert_eq!(summary.dispatch.delivered, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_begins_from_clean_state() {
        let recorder = Arc::new(Recorder::default());
        let mut alerts = service(recorder.clone());
        alerts.start().unwrap();
        advance(500).await;
        for _ in 0..3 {
            alerts.flag().increment_event();
            advance(1000).await;
        }
        let first = alerts.stop().await.unwrap();
        assert_eq!(first.window.snow_tally, 3);
        assert!(alerts.subscribe().is_none());

        // a stale event logged while stopped must not leak into the next run
        alerts.flag().increment_event();
        alerts.start().unwrap();
        let fresh = current(&alerts);
        assert_eq!((fresh.tick, fresh.snow_tally, fresh.no_snow_tally), (0, 0, 0));

        advance(1500).await;
        let snap = current(&alerts);
        assert_eq!(snap.tick, 1);
        assert_eq!(snap.snow_tally, 0);
        assert_eq!(snap.no_snow_tally, 1);
        alerts.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn subscriber_keeps_final_state_after_stop() {
        let mut alerts = service(Arc::new(Recorder::default()));
        alerts.start().unwrap();
        let state = alerts.subscribe().unwrap();
        advance(2500).await;
        let summary = alerts.stop().await.unwrap();
        assert_eq!(*state.borrow(), summary.window);
        assert_eq!(summary.window.tick, 2);
    }

    #[tokio::test]
    async fn lifecycle_transitions_are_checked() {
        let mut alerts = service(Arc::new(Recorder::default()));
        assert!(matches!(alerts.stop().await, Err(AlertError::NotRunning)));
        alerts.start().unwrap();
        assert!(matches!(alerts.start(), Err(AlertError::AlreadyRunning)));
        alerts.stop().await.unwrap();
        assert!(alerts.subscribe().is_none());
    }
}
