//! Progress reporting.
//!
//! Rendering is not the pipeline's concern: the pipeline only pushes
//! `(current, total)` pairs through the narrow [`Progress`] interface.
//! The decorator wraps the innermost, pre-transform stream, so reported
//! values reflect original file sizes rather than compressed or encrypted
//! sizes.

use std::{
    io::{self, Read},
    sync::Arc,
};

/// Narrow progress sink implemented by the frontend.
pub trait Progress: Send + Sync {
    fn report(&self, current: u64, total: u64);
    fn finish(&self);
}

/// Progress sink that discards all reports.
pub struct NoProgress;

impl Progress for NoProgress {
    fn report(&self, _current: u64, _total: u64) {}
    fn finish(&self) {}
}

/// Forwards reads and reports the cumulative byte count against a known
/// total. The count only advances by bytes actually read and is clamped to
/// the total, so reports are monotonic and never overshoot.
pub struct ProgressReader<R> {
    inner: R,
    progress: Arc<dyn Progress>,
    current: u64,
    total: u64,
}

impl<R> ProgressReader<R> {
    pub fn new(inner: R, total: u64, progress: Arc<dyn Progress>) -> Self {
        Self {
            inner,
            progress,
            current: 0,
            total,
        }
    }

    /// Continues counting into the same progress sink for a subsequent
    /// stream, keeping the cumulative count across several wrapped readers.
    pub fn resume(inner: R, current: u64, total: u64, progress: Arc<dyn Progress>) -> Self {
        Self {
            inner,
            progress,
            current,
            total,
        }
    }

    #[must_use]
    pub fn current(&self) -> u64 {
        self.current
    }
}

impl<R: Read> Read for ProgressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let len = self.inner.read(buf)?;
        if len == 0 {
            return Ok(0);
        }
        self.current = (self.current + len as u64).min(self.total);
        self.progress.report(self.current, self.total);
        Ok(len)
    }
}
