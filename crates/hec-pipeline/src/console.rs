// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-build console capture.
//!
//! A [`ConsoleCapture`] owns every console stream opened for one build. Streams
//! are [`DelayedFlushBuffer`]s over a [`ConsoleSink`], which turns console bytes
//! into [`EventKind::ConsoleLog`] records. Closing the capture, explicitly or by
//! dropping it, closes every stream that is still open.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tracing::{debug, warn};

use crate::buffer::{Closeable, DelayedFlushBuffer};
use crate::event::{EventKind, EventRecord};
use crate::flush_scheduler::FlushScheduler;
use crate::service::{DeliveryService, Submitter};

/// Console stream handed to build steps.
pub type ConsoleStream = DelayedFlushBuffer<ConsoleSink>;

/// Emits console bytes as records, one or more complete lines at a time.
/// A trailing partial line is held until the next newline or an explicit flush.
pub struct ConsoleSink {
    submitter: Submitter,
    source: String,
    batch_size: usize,
    pending: Vec<u8>,
}

impl ConsoleSink {
    #[must_use]
    pub fn new(service: Arc<DeliveryService>, source: String) -> Self {
        let batch_size = service.config().max_events_batch_size;
        ConsoleSink {
            submitter: service.submitter(),
            source,
            batch_size,
            pending: Vec::new(),
        }
    }

    fn emit(&self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        let text = String::from_utf8_lossy(chunk).into_owned();
        let record = EventRecord::new(text, EventKind::ConsoleLog).with_source(self.source.clone());
        if !self.submitter.submit(record) {
            debug!("CONSOLE | Dropped {} bytes for {}", chunk.len(), self.source);
        }
    }

    fn emit_complete_lines(&mut self) {
        let Some(last_newline) = self.pending.iter().rposition(|b| *b == b'\n') else {
            if self.pending.len() >= self.batch_size {
                let chunk = std::mem::take(&mut self.pending);
                self.emit(&chunk);
            }
            return;
        };
        let rest = self.pending.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.pending, rest);
        for chunk in split_at_lines(&complete, self.batch_size) {
            self.emit(chunk);
        }
    }
}

impl Write for ConsoleSink {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(data);
        self.emit_complete_lines();
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.emit_complete_lines();
        let rest = std::mem::take(&mut self.pending);
        self.emit(&rest);
        Ok(())
    }
}

/// Chunks of at most `max` bytes, cut after a newline whenever one is in reach.
fn split_at_lines(bytes: &[u8], max: usize) -> Vec<&[u8]> {
    let max = max.max(1);
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < bytes.len() {
        let mut end = (start + max).min(bytes.len());
        if end < bytes.len() {
            if let Some(pos) = bytes[start..end].iter().rposition(|b| *b == b'\n') {
                end = start + pos + 1;
            }
        }
        chunks.push(&bytes[start..end]);
        start = end;
    }
    chunks
}

/// Owning context for one build's console streams.
pub struct ConsoleCapture {
    key: String,
    source: String,
    service: Arc<DeliveryService>,
    scheduler: Arc<FlushScheduler>,
    streams: Mutex<Vec<Weak<dyn Closeable>>>,
    closed: AtomicBool,
}

impl ConsoleCapture {
    #[must_use]
    pub fn new(
        key: String,
        build_url: &str,
        service: Arc<DeliveryService>,
        scheduler: Arc<FlushScheduler>,
    ) -> Self {
        ConsoleCapture {
            key,
            source: format!("{build_url}console"),
            service,
            scheduler,
            streams: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// `source` attached to every console record of this build.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Opens a buffered console stream registered with this capture. Returns
    /// `None` once the capture is closed.
    #[must_use]
    pub fn open_stream(&self) -> Option<ConsoleStream> {
        let mut streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_closed() {
            return None;
        }
        let sink = ConsoleSink::new(Arc::clone(&self.service), self.source.clone());
        let stream = DelayedFlushBuffer::new(sink, self.service.config().flush, &self.scheduler);
        streams.retain(|stream| stream.strong_count() > 0);
        streams.push(stream.closer());
        Some(stream)
    }

    /// Streams that are still alive and open.
    #[must_use]
    pub fn open_streams(&self) -> usize {
        self.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|stream| !stream.is_closed())
            .count()
    }

    /// Closes every open stream. Returns how many were closed by this call.
    pub fn close(&self) -> usize {
        let streams = {
            let mut streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
            self.closed.store(true, Ordering::Release);
            std::mem::take(&mut *streams)
        };
        let mut closed = 0;
        for stream in streams.iter().filter_map(Weak::upgrade) {
            if stream.is_closed() {
                continue;
            }
            if let Err(e) = stream.close() {
                warn!("CONSOLE | Failed to close console stream for {}: {}", self.key, e);
            }
            closed += 1;
        }
        if closed > 0 {
            debug!("CONSOLE | Closed {} console stream(s) for {}", closed, self.key);
        }
        closed
    }
}

impl Drop for ConsoleCapture {
    fn drop(&mut self) {
        self.close();
    }
}
