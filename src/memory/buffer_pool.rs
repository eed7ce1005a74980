//! Per-stage frame buffer pool.
//!
//! This module provides the fixed buffer pool each stage allocates at
//! `init()`:
//! - Pre-allocates `capacity` buffers of one size, never resized
//! - Buffers return automatically when their last reference drops
//! - Provides backpressure (blocks when the pool is exhausted) or rejects
//! - Tracks statistics for `dump_pipe_summary`
//!
//! Invariant: `free + in_flight == capacity` at all times.
//!
//! # Example
//!
//! ```rust
//! use stagegraph::memory::FramePool;
//!
//! let pool = FramePool::new("scaler", 1024, 2);
//!
//! let mut buffer = pool.acquire().unwrap();
//! buffer.copy_from(b"hello").unwrap();
//! let frame = buffer.into_shared();
//! assert_eq!(pool.stats().in_flight, 1);
//!
//! // Returns to the pool with its last reference.
//! drop(frame);
//! assert_eq!(pool.stats().free, 2);
//! ```

use crate::buffer::{Frame, PooledFrame};
use crate::error::{Error, Result};
use crate::observability::record_pool_free;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// What `acquire()` does when the pool is exhausted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PoolMode {
    /// Wait for a buffer to come back (backpressure).
    #[default]
    Block,
    /// Fail immediately; the stage drops the frame.
    Reject,
}

impl FromStr for PoolMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "block" => Ok(Self::Block),
            "reject" => Ok(Self::Reject),
            other => Err(Error::config(format!("pool mode '{other}' is not supported"))),
        }
    }
}

/// Statistics about pool usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total buffers in the pool.
    pub capacity: usize,
    /// Buffers on the free list.
    pub free: usize,
    /// Buffers held by a stage or by consumers.
    pub in_flight: usize,
    /// Successful acquisitions.
    pub acquisitions: u64,
    /// Acquisitions that had to wait for a buffer.
    pub waits: u64,
    /// Acquisitions refused in reject mode.
    pub rejections: u64,
}

struct FreeSlot {
    index: usize,
    storage: Box<[u8]>,
}

struct PoolState {
    free: Vec<FreeSlot>,
    closed: bool,
}

/// State shared between the pool handle and every buffer it handed out.
pub(crate) struct PoolShared {
    id: u64,
    name: String,
    capacity: usize,
    buffer_size: usize,
    state: Mutex<PoolState>,
    available: Condvar,
    acquisitions: AtomicU64,
    waits: AtomicU64,
    rejections: AtomicU64,
}

impl PoolShared {
    #[inline]
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Put a slot back on the free list and wake one waiter.
    pub(crate) fn recycle(&self, index: usize, storage: Box<[u8]>) {
        let free = {
            let mut state = self.state.lock().unwrap();
            debug_assert!(
                state.free.iter().all(|slot| slot.index != index),
                "slot {index} returned twice to pool '{}'",
                self.name
            );
            state.free.push(FreeSlot { index, storage });
            state.free.len()
        };
        self.available.notify_one();
        record_pool_free(&self.name, free);
    }

    fn take(self: &Arc<Self>, state: &mut PoolState) -> Option<PooledFrame> {
        let slot = state.free.pop()?;
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        Some(PooledFrame::new(slot.storage, self.clone(), slot.index))
    }
}

// ============================================================================
// FramePool
// ============================================================================

/// A fixed set of equally sized frame buffers owned by one stage.
///
/// Cloning the pool clones the handle, not the buffers.
#[derive(Clone)]
pub struct FramePool {
    shared: Arc<PoolShared>,
    mode: PoolMode,
}

impl FramePool {
    /// Allocate `capacity` buffers of `buffer_size` bytes in blocking mode.
    pub fn new(name: &str, buffer_size: usize, capacity: usize) -> Self {
        Self::with_mode(name, buffer_size, capacity, PoolMode::Block)
    }

    /// Allocate a pool with an explicit exhaustion mode.
    pub fn with_mode(name: &str, buffer_size: usize, capacity: usize, mode: PoolMode) -> Self {
        let free = (0..capacity)
            .map(|index| FreeSlot {
                index,
                storage: vec![0u8; buffer_size].into_boxed_slice(),
            })
            .collect();

        tracing::debug!(pool = %name, buffer_size, capacity, ?mode, "allocated frame pool");

        Self {
            shared: Arc::new(PoolShared {
                id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
                name: name.to_string(),
                capacity,
                buffer_size,
                state: Mutex::new(PoolState {
                    free,
                    closed: false,
                }),
                available: Condvar::new(),
                acquisitions: AtomicU64::new(0),
                waits: AtomicU64::new(0),
                rejections: AtomicU64::new(0),
            }),
            mode,
        }
    }

    /// Acquire a free buffer.
    ///
    /// In blocking mode this waits until a buffer is returned. In reject mode
    /// an exhausted pool fails with [`Error::Resource`]. Either way a closed
    /// pool fails with [`Error::PoolClosed`].
    pub fn acquire(&self) -> Result<PooledFrame> {
        let mut state = self.shared.state.lock().unwrap();
        if state.closed {
            return Err(self.closed_error());
        }
        if let Some(frame) = self.shared.take(&mut state) {
            return Ok(frame);
        }

        if self.mode == PoolMode::Reject {
            self.shared.rejections.fetch_add(1, Ordering::Relaxed);
            return Err(Error::Resource(format!(
                "pool '{}' exhausted",
                self.shared.name
            )));
        }

        self.shared.waits.fetch_add(1, Ordering::Relaxed);
        loop {
            state = self.shared.available.wait(state).unwrap();
            if state.closed {
                return Err(self.closed_error());
            }
            if let Some(frame) = self.shared.take(&mut state) {
                return Ok(frame);
            }
        }
    }

    /// Acquire without blocking; `None` if the pool is exhausted or closed.
    pub fn try_acquire(&self) -> Option<PooledFrame> {
        let mut state = self.shared.state.lock().unwrap();
        if state.closed {
            return None;
        }
        self.shared.take(&mut state)
    }

    /// Acquire with a timeout.
    ///
    /// Returns `Ok(None)` if the timeout expires before a buffer is free.
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<Option<PooledFrame>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock().unwrap();
        let mut waited = false;

        loop {
            if state.closed {
                return Err(self.closed_error());
            }
            if let Some(frame) = self.shared.take(&mut state) {
                return Ok(Some(frame));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            if !waited {
                self.shared.waits.fetch_add(1, Ordering::Relaxed);
                waited = true;
            }
            state = self
                .shared
                .available
                .wait_timeout(state, remaining)
                .unwrap()
                .0;
        }
    }

    /// Give back a reference obtained from this pool.
    ///
    /// The buffer goes back on the free list once no other reference remains.
    /// Releasing a frame this pool does not own is a programming error: it
    /// panics in debug builds and returns [`Error::ForeignBuffer`] otherwise.
    pub fn release(&self, frame: Frame) -> Result<()> {
        if frame.pool_id() != Some(self.shared.id) {
            debug_assert!(
                false,
                "frame released to pool '{}' it does not belong to",
                self.shared.name
            );
            return Err(Error::ForeignBuffer(self.shared.name.clone()));
        }
        drop(frame);
        Ok(())
    }

    /// Close the pool: current and future acquisitions fail with
    /// [`Error::PoolClosed`]. Outstanding buffers still come back.
    pub fn close(&self) {
        self.shared.state.lock().unwrap().closed = true;
        self.shared.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().unwrap().closed
    }

    /// Get pool statistics.
    pub fn stats(&self) -> PoolStats {
        let free = self.shared.state.lock().unwrap().free.len();
        PoolStats {
            capacity: self.shared.capacity,
            free,
            in_flight: self.shared.capacity - free,
            acquisitions: self.shared.acquisitions.load(Ordering::Relaxed),
            waits: self.shared.waits.load(Ordering::Relaxed),
            rejections: self.shared.rejections.load(Ordering::Relaxed),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    #[inline]
    pub fn buffer_size(&self) -> usize {
        self.shared.buffer_size
    }

    #[inline]
    pub fn mode(&self) -> PoolMode {
        self.mode
    }

    fn closed_error(&self) -> Error {
        Error::PoolClosed(self.shared.name.clone())
    }
}

impl fmt::Debug for FramePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramePool")
            .field("name", &self.shared.name)
            .field("mode", &self.mode)
            .field("stats", &self.stats())
            .finish()
    }
}
