pub mod sink;

use snowtify_common::frame::Frame;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::stop::{stopped, StopSignal};
use sink::{FrameSink, SinkError};

/// A frame waiting for its emission slot.
#[derive(Debug, Clone)]
pub struct BufferedFrame {
    pub seq: u64,
    pub frame: Frame,
    pub enqueued_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    Buffered,
    /// Buffered, but the buffer was full so the lowest sequence was evicted.
    BufferedEvicting(u64),
    /// A later sequence has already gone out; emitting this one would reorder.
    Late,
}

/// What to send on one emission slot.
#[derive(Debug, Clone)]
pub struct Emission {
    pub seq: u64,
    pub frame: Frame,
    pub repeated: bool,
}

/// Sequence-ordered frame buffer with gap filling.
#[derive(Debug)]
pub struct ReorderBuffer {
    pending: BTreeMap<u64, BufferedFrame>,
    capacity: usize,
    last: Option<(u64, Frame)>,
}

impl ReorderBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: BTreeMap::new(),
            capacity: capacity.max(1),
            last: None,
        }
    }

    pub fn push(&mut self, seq: u64, frame: Frame) -> Enqueue {
        if matches!(self.last, Some((last_seq, _)) if seq <= last_seq) {
            return Enqueue::Late;
        }
        self.pending.insert(
            seq,
            BufferedFrame {
                seq,
                frame,
                enqueued_at: Instant::now(),
            },
        );
        if self.pending.len() > self.capacity {
            if let Some((evicted, _)) = self.pending.pop_first() {
                return Enqueue::BufferedEvicting(evicted);
            }
        }
        Enqueue::Buffered
    }

    /// Lowest buffered frame, else a repeat of the last one emitted.
    /// `None` only before anything has ever been emitted.
    pub fn next_emission(&mut self) -> Option<Emission> {
        if let Some((_, buffered)) = self.pending.pop_first() {
            let seq = buffered.seq;
            trace!(seq, waited_ms = buffered.enqueued_at.elapsed().as_millis() as u64, "frame leaves buffer");
            self.last = Some((seq, buffered.frame.clone()));
            return Some(Emission {
                seq,
                frame: buffered.frame,
                repeated: false,
            });
        }
        self.last.as_ref().map(|(seq, frame)| Emission {
            seq: *seq,
            frame: frame.clone(),
            repeated: true,
        })
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutputStats {
    pub emitted: u64,
    pub repeated: u64,
}

/// Cloneable producer handle plus the paced emission loop.
#[derive(Debug, Clone)]
pub struct OutputMultiplexer {
    buffer: Arc<Mutex<ReorderBuffer>>,
    interval: Duration,
}

impl OutputMultiplexer {
    /// `fps` must be positive with a representable period; the config
    /// loader rejects anything else. Out of range values fall back to 1 fps.
    pub fn new(fps: f64, capacity: usize) -> Self {
        let interval = Duration::try_from_secs_f64(1.0 / fps)
            .ok()
            .filter(|d| !d.is_zero())
            .unwrap_or(Duration::from_secs(1));
        Self {
            buffer: Arc::new(Mutex::new(ReorderBuffer::new(capacity))),
            interval,
        }
    }

    /// Non-blocking enqueue from any producer.
    pub fn submit(&self, seq: u64, frame: Frame) -> Enqueue {
        let outcome = match self.buffer.lock() {
            Ok(mut buffer) => buffer.push(seq, frame),
            Err(poisoned) => poisoned.into_inner().push(seq, frame),
        };
        match outcome {
            Enqueue::Buffered => {}
            Enqueue::BufferedEvicting(evicted) => {
                warn!(seq, evicted, "output buffer full, dropped oldest frame")
            }
            Enqueue::Late => debug!(seq, "frame arrived after a later one was emitted, dropped"),
        }
        outcome
    }

    fn next_emission(&self) -> Option<Emission> {
        match self.buffer.lock() {
            Ok(mut buffer) => buffer.next_emission(),
            Err(poisoned) => poisoned.into_inner().next_emission(),
        }
    }

    /// Frames waiting for an emission slot.
    pub fn pending(&self) -> usize {
        match self.buffer.lock() {
            Ok(buffer) => buffer.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Emit one frame per interval into `sink` until stopped.
    ///
    /// Slot `k` is due at `start + k * interval`. A slot that is already
    /// overdue fires at once, so a slow sink write never pushes every later
    /// slot back. Stop also interrupts a write the sink is blocked on; the
    /// interrupted frame is abandoned and not counted.
    pub async fn run<S: FrameSink>(&self, sink: &mut S, mut stop: StopSignal) -> Result<OutputStats, SinkError> {
        let start = Instant::now();
        let mut stats = OutputStats::default();
        let mut slot: u32 = 0;

        info!(
            interval_ms = self.interval.as_millis() as u64,
            sink = sink.name(),
            "output multiplexer started"
        );

        loop {
            let due = start + self.interval * slot;
            tokio::select! {
                biased;
                _ = stopped(&mut stop) => break,
                _ = tokio::time::sleep_until(due) => {}
            }
            slot = slot.wrapping_add(1);

            let Some(emission) = self.next_emission() else {
                continue;
            };
            let written = tokio::select! {
                biased;
                _ = stopped(&mut stop) => break,
                written = sink.write_frame(&emission.frame) => written,
            };
            if let Err(e) = written {
                warn!(error = %e, seq = emission.seq, emitted = stats.emitted, "output sink failed");
                return Err(e);
            }
            stats.emitted += 1;
            if emission.repeated {
                stats.repeated += 1;
            }
        }

        info!(emitted = stats.emitted, repeated = stats.repeated, "output multiplexer stopped");
        Ok(stats)
    }
}
