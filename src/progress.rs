//! Throttled progress instrumentation for request and response bodies.

use std::sync::Arc;
use std::time::{Duration, Instant};

/// Minimum spacing between progress callbacks. The final event for a
/// transfer is always emitted regardless of throttling.
pub const PROGRESS_THROTTLE: Duration = Duration::from_millis(50);

/// Which side of the wire the bytes moved on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Request body bytes leaving the client
    Upload,
    /// Response body bytes arriving at the client
    Download,
}

/// A single progress observation.
#[derive(Debug, Clone, Copy)]
pub struct ProgressEvent {
    /// Transfer direction
    pub direction: Direction,
    /// Bytes transferred so far
    pub transferred: u64,
    /// Total bytes when known (from `Content-Length` or a sized body)
    pub total: Option<u64>,
    /// Observed transfer rate in bytes per second since the transfer began
    pub rate: f64,
}

/// Callback invoked with throttled [`ProgressEvent`]s.
pub type ProgressSink = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// Tracks a transfer and emits throttled events to a sink.
///
/// Emission must not block the body reader, so sinks are expected to be
/// cheap; the throttle keeps chatty streams from overwhelming them.
pub(crate) struct ProgressMeter {
    sink: ProgressSink,
    direction: Direction,
    total: Option<u64>,
    transferred: u64,
    started: Instant,
    last_emit: Option<Instant>,
}

impl ProgressMeter {
    pub(crate) fn new(
        sink: ProgressSink,
        direction: Direction,
        total: Option<u64>,
    ) -> Self {
        Self {
            sink,
            direction,
            total,
            transferred: 0,
            started: Instant::now(),
            last_emit: None,
        }
    }

    /// Record `len` more bytes and emit if the throttle window has passed.
    pub(crate) fn record(&mut self, len: usize) {
        self.transferred += len as u64;
        let now = Instant::now();
        let due = match self.last_emit {
            Some(last) => now.duration_since(last) >= PROGRESS_THROTTLE,
            None => true,
        };
        if due {
            self.emit(now);
        }
    }

    /// Emit the final event for the transfer unconditionally.
    pub(crate) fn finish(&mut self) {
        self.emit(Instant::now());
    }

    fn emit(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.started).as_secs_f64();
        let rate = if elapsed > 0.0 {
            self.transferred as f64 / elapsed
        } else {
            0.0
        };
        (self.sink)(ProgressEvent {
            direction: self.direction,
            transferred: self.transferred,
            total: self.total,
            rate,
        });
        self.last_emit = Some(now);
    }
}
