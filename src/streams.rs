//! Composable byte-stream decorators.
//!
//! Every component that moves image bytes stacks some of these around a
//! plain reader or writer:
//!
//! | Wrapper | Effect |
//! |---------|--------|
//! | [`DigestReader`] / [`DigestWriter`] | rolling SHA-256 + byte count |
//! | [`ProgressReader`] / [`ProgressWriter`] | `count / expected` into a [`TaskStepTracker`] |
//! | [`CancellableReader`] | fails the next read once a [`CancelFlag`] is raised |
//!
//! All wrappers are pass-through: no buffering, O(1) extra state.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::tracker::TaskStepTracker;

/// Final SHA-256 digest and length of a byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDigest {
    /// Lowercase hex SHA-256.
    pub sha256: String,
    pub length: u64,
}

impl StreamDigest {
    /// Case-insensitive comparison against a declared hex digest.
    pub fn matches(&self, declared: &str) -> bool {
        self.sha256.eq_ignore_ascii_case(declared.trim())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Digest
// ═══════════════════════════════════════════════════════════════════════

/// Reader that digests every byte read through it.
pub struct DigestReader<R> {
    inner: R,
    hasher: Sha256,
    count: u64,
}

impl<R: Read> DigestReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            count: 0,
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Digest of everything read so far, without consuming the reader.
    pub fn digest(&self) -> StreamDigest {
        StreamDigest {
            sha256: hex::encode(self.hasher.clone().finalize()),
            length: self.count,
        }
    }

    pub fn finish(self) -> (R, StreamDigest) {
        let digest = StreamDigest {
            sha256: hex::encode(self.hasher.finalize()),
            length: self.count,
        };
        (self.inner, digest)
    }
}

impl<R: Read> Read for DigestReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.hasher.update(&buf[..n]);
            self.count += n as u64;
        }
        Ok(n)
    }
}

/// Writer that digests every byte written through it.
pub struct DigestWriter<W> {
    inner: W,
    hasher: Sha256,
    count: u64,
}

impl<W: Write> DigestWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            count: 0,
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn finish(self) -> (W, StreamDigest) {
        let digest = StreamDigest {
            sha256: hex::encode(self.hasher.finalize()),
            length: self.count,
        };
        (self.inner, digest)
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Progress
// ═══════════════════════════════════════════════════════════════════════

fn report(tracker: &TaskStepTracker, count: u64, expected: u64) {
    if expected > 0 {
        tracker.set_step_percent_complete(count as f64 / expected as f64);
    }
}

/// Reader that reports `bytes read / expected` to a tracker.
pub struct ProgressReader<R> {
    inner: R,
    tracker: Arc<TaskStepTracker>,
    expected: u64,
    count: u64,
}

impl<R: Read> ProgressReader<R> {
    pub fn new(expected: u64, tracker: Arc<TaskStepTracker>, inner: R) -> Self {
        Self {
            inner,
            tracker,
            expected,
            count: 0,
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for ProgressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.count += n as u64;
            report(&self.tracker, self.count, self.expected);
        }
        Ok(n)
    }
}

/// Writer that reports `bytes written / expected` to a tracker.
pub struct ProgressWriter<W> {
    inner: W,
    tracker: Arc<TaskStepTracker>,
    expected: u64,
    count: u64,
}

impl<W: Write> ProgressWriter<W> {
    pub fn new(expected: u64, tracker: Arc<TaskStepTracker>, inner: W) -> Self {
        Self {
            inner,
            tracker,
            expected,
            count: 0,
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for ProgressWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        if n > 0 {
            self.count += n as u64;
            report(&self.tracker, self.count, self.expected);
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Cancellation
// ═══════════════════════════════════════════════════════════════════════

/// Shared flag raised when a task is cancelled.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Reader that fails once its [`CancelFlag`] is raised.
///
/// The error kind is `Other`, not `Interrupted`, so `io::copy` gives up
/// instead of retrying.
pub struct CancellableReader<R> {
    inner: R,
    flag: CancelFlag,
}

impl<R: Read> CancellableReader<R> {
    pub fn new(flag: CancelFlag, inner: R) -> Self {
        Self { inner, flag }
    }
}

impl<R: Read> Read for CancellableReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.flag.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::Other, "task cancelled"));
        }
        self.inner.read(buf)
    }
}

/// Hex SHA-256 of an in-memory buffer.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
