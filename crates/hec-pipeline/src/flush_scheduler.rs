// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared background timer for delayed flush buffers.
//!
//! The scheduler drives two things:
//!
//! - **Recurring flushes.** Each buffer gets a timer task holding only a
//!   `Weak` reference, so scheduling never keeps a buffer alive. The task ends
//!   when the buffer is closed or dropped.
//! - **Reclaim queue.** A buffer dropped without `close()` posts its leftover
//!   bytes and its sink here. A poller writes and flushes them every ten
//!   seconds. This is a leak mitigation only; owners are expected to close
//!   their buffers.

use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::constants::RECLAIM_POLL_INTERVAL;

/// A buffer the scheduler can flush on a timer.
pub trait ScheduledFlush: Send + Sync {
    /// Pushes buffered bytes down and returns the delay until the next run,
    /// or `None` once the buffer is closed.
    fn scheduled_flush(&self) -> Option<Duration>;
}

/// Leftovers of a buffer that was dropped while still open.
pub struct Reclaimed {
    pub(crate) pending: Vec<u8>,
    pub(crate) sink: Box<dyn Write + Send>,
}

type ReclaimReceiver = Arc<Mutex<mpsc::UnboundedReceiver<Reclaimed>>>;

pub struct FlushScheduler {
    reclaim_tx: mpsc::UnboundedSender<Reclaimed>,
    reclaim_rx: ReclaimReceiver,
    runtime: Option<Handle>,
    cancel: CancellationToken,
}

impl FlushScheduler {
    /// Creates the scheduler and, when called inside a tokio runtime, starts
    /// the reclaim poller.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_poll_interval(RECLAIM_POLL_INTERVAL)
    }

    #[must_use]
    pub fn with_poll_interval(poll_interval: Duration) -> Arc<Self> {
        let (reclaim_tx, reclaim_rx) = mpsc::unbounded_channel();
        let scheduler = FlushScheduler {
            reclaim_tx,
            reclaim_rx: Arc::new(Mutex::new(reclaim_rx)),
            runtime: Handle::try_current().ok(),
            cancel: CancellationToken::new(),
        };

        match &scheduler.runtime {
            Some(runtime) => {
                let reclaim_rx = Arc::clone(&scheduler.reclaim_rx);
                let cancel = scheduler.cancel.clone();
                runtime.spawn(async move {
                    let mut ticker = interval(poll_interval);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        tokio::select! {
                            () = cancel.cancelled() => break,
                            _ = ticker.tick() => {
                                drain_reclaimed(&reclaim_rx);
                            }
                        }
                    }
                    drain_reclaimed(&reclaim_rx);
                });
            }
            None => {
                warn!("FLUSH | No tokio runtime, timed and reclaim flushes are disabled");
            }
        }
        Arc::new(scheduler)
    }

    /// Runs `target.scheduled_flush()` after `delay` and then at whatever
    /// period each run returns.
    pub fn schedule(&self, target: Weak<dyn ScheduledFlush>, delay: Duration) {
        let Some(runtime) = &self.runtime else {
            return;
        };
        let cancel = self.cancel.clone();
        runtime.spawn(async move {
            let mut delay = delay;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = sleep(delay) => {}
                }
                let Some(target) = target.upgrade() else {
                    break;
                };
                match target.scheduled_flush() {
                    Some(next) => delay = next,
                    None => break,
                }
            }
        });
    }

    pub(crate) fn reclaimer(&self) -> mpsc::UnboundedSender<Reclaimed> {
        self.reclaim_tx.clone()
    }

    /// Flushes every reclaimed sink queued so far. Returns how many were handled.
    pub fn poll_reclaimed(&self) -> usize {
        drain_reclaimed(&self.reclaim_rx)
    }

    /// Stops all timers after flushing anything waiting in the reclaim queue.
    pub fn shutdown(&self) {
        self.poll_reclaimed();
        self.cancel.cancel();
    }
}

impl Drop for FlushScheduler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn drain_reclaimed(reclaim_rx: &Mutex<mpsc::UnboundedReceiver<Reclaimed>>) -> usize {
    let mut reclaim_rx = reclaim_rx.lock().unwrap_or_else(PoisonError::into_inner);
    let mut handled = 0;
    while let Ok(mut reclaimed) = reclaim_rx.try_recv() {
        debug!(
            "FLUSH | Flushing reclaimed buffer with {} pending bytes",
            reclaimed.pending.len()
        );
        if let Err(e) = flush_reclaimed(&mut reclaimed) {
            warn!("FLUSH | Failed to flush reclaimed buffer: {}", e);
        }
        handled += 1;
    }
    handled
}

fn flush_reclaimed(reclaimed: &mut Reclaimed) -> std::io::Result<()> {
    if !reclaimed.pending.is_empty() {
        reclaimed.sink.write_all(&reclaimed.pending)?;
    }
    reclaimed.sink.flush()
}
