use std::time::{Duration, Instant};

use tracing::info;

/// Time spent on one plane, split between reading and writing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaneTiming {
    pub read: Duration,
    pub write: Duration,
}

impl PlaneTiming {
    pub fn add(&mut self, other: PlaneTiming) {
        self.read += other.read;
        self.write += other.write;
    }
}

/// Running totals for one job. Owned and mutated by the worker running it.
#[derive(Debug, Clone)]
pub struct ConversionStats {
    pub total_planes: usize,
    pub read: Duration,
    pub write: Duration,
    started: Instant,
    /// Set once the source and sink are open and planes start flowing
    planes_started: Option<Instant>,
    finished: Option<Instant>,
}

impl ConversionStats {
    pub fn new() -> Self {
        Self::started_at(Instant::now())
    }

    pub fn started_at(started: Instant) -> Self {
        Self {
            total_planes: 0,
            read: Duration::ZERO,
            write: Duration::ZERO,
            started,
            planes_started: None,
            finished: None,
        }
    }

    pub fn mark_planes_started(&mut self) {
        self.planes_started.get_or_insert_with(Instant::now);
    }

    pub fn record_plane(&mut self, timing: PlaneTiming) {
        self.total_planes += 1;
        self.read += timing.read;
        self.write += timing.write;
    }

    pub fn finish(&mut self) {
        self.finished = Some(Instant::now());
    }

    pub fn elapsed(&self) -> Duration {
        self.finished.unwrap_or_else(Instant::now) - self.started
    }

    /// Time spent opening the source and sink before the first plane.
    pub fn overhead(&self) -> Duration {
        self.planes_started.map(|t| t - self.started).unwrap_or_default()
    }

    pub fn average_read_ms(&self) -> f64 {
        Self::average_ms(self.read, self.total_planes)
    }

    pub fn average_write_ms(&self) -> f64 {
        Self::average_ms(self.write, self.total_planes)
    }

    fn average_ms(total: Duration, planes: usize) -> f64 {
        if planes == 0 {
            0.0
        } else {
            total.as_secs_f64() * 1000.0 / planes as f64
        }
    }

    pub fn log_summary(&self) {
        info!(
            planes = self.total_planes,
            "{:.3}s elapsed ({:.3}+{:.3}ms per plane, {:.3}ms overhead)",
            self.elapsed().as_secs_f64(),
            self.average_read_ms(),
            self.average_write_ms(),
            self.overhead().as_secs_f64() * 1000.0
        );
    }
}

impl Default for ConversionStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Decides when a progress line is due.
///
/// A line is emitted after the last plane of a series, or when at least
/// `interval` has passed since the previous line.
#[derive(Debug)]
pub struct ProgressThrottle {
    interval: Duration,
    last_emitted: Instant,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emitted: Instant::now(),
        }
    }

    pub fn is_due(&self, last_plane: bool, now: Instant) -> bool {
        last_plane || now.saturating_duration_since(self.last_emitted) >= self.interval
    }

    /// Returns whether to emit now, and resets the clock if so.
    pub fn tick(&mut self, last_plane: bool, now: Instant) -> bool {
        let due = self.is_due(last_plane, now);
        if due {
            self.last_emitted = now;
        }
        due
    }
}

pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn start() -> Self {
        Self { start: Instant::now() }
    }

    pub fn stop(self) -> Duration {
        self.start.elapsed()
    }
}
