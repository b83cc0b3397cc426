//! Lock-free state cells backing clients and servers.
//!
//! Each mutable field of a client or server (installed handle, callbacks, timeouts, buffer sizes)
//! lives in its own cell. Every cell operation is individually atomic; sequences of operations
//! (for example "load the handle, then read from it") are not, and callers must tolerate the race
//! resolving to a typed error.

use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use tokio::time::Instant;

/// An optional, atomically replaceable value.
///
/// Readers get a cheap [`Arc`] snapshot, so a value swapped out while a reader still holds it
/// stays alive until that reader is done with it.
pub(crate) struct Slot<T> {
    inner: ArcSwapOption<T>,
}

impl<T> Slot<T> {
    /// Creates an empty slot.
    pub(crate) fn empty() -> Self {
        Self {
            inner: ArcSwapOption::empty(),
        }
    }

    /// Creates a slot holding `value`.
    pub(crate) fn new(value: Option<T>) -> Self {
        Self {
            inner: ArcSwapOption::new(value.map(Arc::new)),
        }
    }

    /// Returns a snapshot of the current value.
    pub(crate) fn load(&self) -> Option<Arc<T>> {
        self.inner.load_full()
    }

    /// Replaces the current value, dropping the previous one.
    pub(crate) fn store(&self, value: Option<T>) {
        self.inner.store(value.map(Arc::new));
    }

    /// Replaces the current value and returns the previous one.
    pub(crate) fn swap(&self, value: Option<T>) -> Option<Arc<T>> {
        self.inner.swap(value.map(Arc::new))
    }

    /// Removes and returns the current value.
    pub(crate) fn take(&self) -> Option<Arc<T>> {
        self.inner.swap(None)
    }

    /// Whether a value is currently installed.
    pub(crate) fn is_set(&self) -> bool {
        self.inner.load().is_some()
    }
}

impl<T: Copy> Slot<T> {
    /// Returns a copy of the current value.
    pub(crate) fn get(&self) -> Option<T> {
        self.inner.load().as_deref().copied()
    }
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> Debug for Slot<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot").field("set", &self.is_set()).finish()
    }
}

/// A buffer size where `0` means "leave the operating system default".
#[derive(Debug, Default)]
pub(crate) struct SizeCell(AtomicUsize);

impl SizeCell {
    pub(crate) fn new(value: Option<usize>) -> Self {
        Self(AtomicUsize::new(value.unwrap_or(0)))
    }

    pub(crate) fn get(&self) -> Option<usize> {
        match self.0.load(Ordering::Acquire) {
            0 => None,
            size => Some(size),
        }
    }

    pub(crate) fn set(&self, value: Option<usize>) {
        self.0.store(value.unwrap_or(0), Ordering::Release);
    }
}

/// Read and write deadlines applied to each I/O call, plus the idle limit of a connection.
#[derive(Debug, Default)]
pub(crate) struct Timeouts {
    pub(crate) read: Slot<Duration>,
    pub(crate) write: Slot<Duration>,
    pub(crate) idle: Slot<Duration>,
}

/// The timeouts in effect for one dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct TimeoutSnapshot {
    pub(crate) read: Option<Duration>,
    pub(crate) write: Option<Duration>,
    pub(crate) idle: Option<Duration>,
}

impl Timeouts {
    pub(crate) fn new(
        read: Option<Duration>,
        write: Option<Duration>,
        idle: Option<Duration>,
    ) -> Self {
        Self {
            read: Slot::new(read),
            write: Slot::new(write),
            idle: Slot::new(idle),
        }
    }

    /// Returns a copy of the current values, taken when a dispatch starts.
    pub(crate) fn snapshot(&self) -> TimeoutSnapshot {
        TimeoutSnapshot {
            read: self.read.get(),
            write: self.write.get(),
            idle: self.idle.get(),
        }
    }
}

/// Time of the last completed I/O on a connection.
#[derive(Debug)]
pub(crate) struct Activity {
    start: Instant,
    // Milliseconds since `start`.
    last: AtomicU64,
}

impl Activity {
    pub(crate) fn new() -> Self {
        Self {
            start: Instant::now(),
            last: AtomicU64::new(0),
        }
    }

    /// Records activity now.
    pub(crate) fn touch(&self) {
        let elapsed = u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last.fetch_max(elapsed, Ordering::AcqRel);
    }

    /// How long ago the last activity was recorded.
    pub(crate) fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last.load(Ordering::Acquire));
        self.start.elapsed().saturating_sub(last)
    }

    /// Completes once no activity has been recorded for `limit`.
    pub(crate) async fn expired(&self, limit: Duration) {
        loop {
            let idle = self.idle_for();
            if idle >= limit {
                return;
            }
            tokio::time::sleep(limit - idle).await;
        }
    }
}
