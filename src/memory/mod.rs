//! Memory management for stagegraph.
//!
//! Each stage that produces new data owns one [`FramePool`]: a fixed set of
//! equally sized buffers allocated at `init()`. Buffers leave the pool as
//! writable [`PooledFrame`](crate::buffer::PooledFrame)s, are published as
//! shared [`Frame`](crate::buffer::Frame)s and come back when the last
//! reference drops. An exhausted pool is what stalls a producer behind a
//! slow consumer.

mod buffer_pool;

pub use buffer_pool::{FramePool, PoolMode, PoolStats};
pub(crate) use buffer_pool::PoolShared;
