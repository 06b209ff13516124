// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Write buffer flushed on an adaptive timer.
//!
//! ```text
//!   Active ──timer──> Flushing ──> Active (period *= backoff, capped)
//!     │
//!   close()
//!     v
//!   Closed (final flush, sink flushed, no more timers)
//! ```
//!
//! A scheduled flush pushes the buffered bytes into the sink but does not call
//! the sink's own `flush`; only an explicit `flush()` or `close()` does. Each
//! byte reaches the sink once.
//!
//! A buffer dropped while still open hands its leftovers and sink to the
//! [`FlushScheduler`] reclaim queue.

use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use crate::config::FlushTuning;
use crate::flush_scheduler::{FlushScheduler, Reclaimed, ScheduledFlush};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferStatus {
    Active,
    Flushing,
    Closed,
}

/// Something an owner can close on its way out.
pub trait Closeable: Send + Sync {
    fn close(&self) -> io::Result<()>;
    fn is_closed(&self) -> bool;
}

pub struct DelayedFlushBuffer<W: Write + Send + 'static> {
    shared: Arc<Shared<W>>,
}

struct Shared<W: Write + Send + 'static> {
    state: Mutex<State<W>>,
}

struct State<W: Write + Send + 'static> {
    buf: Vec<u8>,
    sink: Option<W>,
    tuning: FlushTuning,
    next_period: Duration,
    enable_flush: bool,
    status: BufferStatus,
    reclaim: mpsc::UnboundedSender<Reclaimed>,
}

impl<W: Write + Send + 'static> DelayedFlushBuffer<W> {
    /// Wraps `sink` and schedules the first flush after `tuning.min_period`.
    pub fn new(sink: W, tuning: FlushTuning, scheduler: &FlushScheduler) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                buf: Vec::with_capacity(tuning.buffer_size),
                sink: Some(sink),
                tuning,
                next_period: tuning.min_period,
                enable_flush: true,
                status: BufferStatus::Active,
                reclaim: scheduler.reclaimer(),
            }),
        });
        let first = shared.lock().advance_period();
        let target: Weak<dyn ScheduledFlush> = Arc::downgrade(&shared) as Weak<dyn ScheduledFlush>;
        scheduler.schedule(target, first);
        DelayedFlushBuffer { shared }
    }

    #[must_use]
    pub fn status(&self) -> BufferStatus {
        self.shared.lock().status
    }

    /// Delay the timer will use after the currently scheduled flush.
    #[must_use]
    pub fn next_period(&self) -> Duration {
        self.shared.lock().next_period
    }

    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.shared.lock().buf.len()
    }

    /// Final flush. Later writes fail; closing twice is a no-op.
    pub fn close(&self) -> io::Result<()> {
        self.shared.close()
    }

    /// Registration handle for an owner that must close this buffer later.
    #[must_use]
    pub fn closer(&self) -> Weak<dyn Closeable> {
        Arc::downgrade(&self.shared) as Weak<dyn Closeable>
    }

    /// One timer tick, as the scheduler runs it.
    pub fn flush_scheduled(&self) -> Option<Duration> {
        self.shared.scheduled_flush()
    }
}

impl<W: Write + Send + 'static> Write for DelayedFlushBuffer<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut state = self.shared.lock();
        if state.status == BufferStatus::Closed {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "delayed flush buffer is closed",
            ));
        }
        if state.buf.len() + data.len() > state.tuning.buffer_size {
            state.push_down()?;
            if data.len() >= state.tuning.buffer_size {
                state.sink_mut()?.write_all(data)?;
                return Ok(data.len());
            }
        }
        state.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut state = self.shared.lock();
        if state.status == BufferStatus::Closed {
            return Ok(());
        }
        state.flush_all()
    }
}

impl<W: Write + Send + 'static> Shared<W> {
    fn lock(&self) -> MutexGuard<'_, State<W>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<W: Write + Send + 'static> ScheduledFlush for Shared<W> {
    fn scheduled_flush(&self) -> Option<Duration> {
        let mut state = self.lock();
        if state.status == BufferStatus::Closed {
            return None;
        }
        state.status = BufferStatus::Flushing;
        let enable_flush = state.enable_flush;
        state.enable_flush = false;
        if let Err(e) = state.flush_all() {
            debug!("FLUSH | Scheduled flush failed: {}", e);
        }
        state.enable_flush = enable_flush;
        state.status = BufferStatus::Active;
        Some(state.advance_period())
    }
}

impl<W: Write + Send + 'static> Closeable for Shared<W> {
    fn close(&self) -> io::Result<()> {
        let mut state = self.lock();
        if state.status == BufferStatus::Closed {
            return Ok(());
        }
        state.status = BufferStatus::Closed;
        let result = state.flush_all();
        state.sink = None;
        result
    }

    fn is_closed(&self) -> bool {
        self.lock().status == BufferStatus::Closed
    }
}

impl<W: Write + Send + 'static> State<W> {
    fn sink_mut(&mut self) -> io::Result<&mut W> {
        self.sink
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "sink released"))
    }

    /// Moves buffered bytes into the sink without flushing it.
    fn push_down(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let buf = std::mem::take(&mut self.buf);
        let result = self.sink_mut().and_then(|sink| sink.write_all(&buf));
        self.buf = buf;
        self.buf.clear();
        result
    }

    fn flush_all(&mut self) -> io::Result<()> {
        self.push_down()?;
        self.flush_sink()
    }

    fn flush_sink(&mut self) -> io::Result<()> {
        if !self.enable_flush {
            return Ok(());
        }
        self.sink_mut()?.flush()
    }

    /// Returns the delay for the next run and grows the one after it.
    fn advance_period(&mut self) -> Duration {
        let current = self.next_period;
        self.next_period = current
            .mul_f64(self.tuning.backoff)
            .min(self.tuning.max_period);
        current
    }
}

impl<W: Write + Send + 'static> Drop for State<W> {
    fn drop(&mut self) {
        if self.status == BufferStatus::Closed {
            return;
        }
        if let Some(sink) = self.sink.take() {
            let reclaimed = Reclaimed {
                pending: std::mem::take(&mut self.buf),
                sink: Box::new(sink),
            };
            if self.reclaim.send(reclaimed).is_err() {
                debug!("FLUSH | Reclaim queue closed, dropping unflushed buffer");
            }
        }
    }
}
