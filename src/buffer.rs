//! Frame buffers passed between stages.
//!
//! A frame moves through three ownership states:
//!
//! - **free**: its storage sits on a [`FramePool`](crate::memory::FramePool) free list
//! - **in flight**: a [`PooledFrame`] held by exactly one stage, writable
//! - **shared**: one or more [`Frame`] handles, read-only
//!
//! [`PooledFrame::into_shared`] performs the one-way transition from in flight
//! to shared. When the last `Frame` handle drops, the storage goes back on the
//! free list of the pool that owns it and one waiter is woken.

use crate::error::{Error, Result};
use crate::format::{AudioPara, ImagePara, MediaType};
use crate::memory::PoolShared;
use std::fmt;
use std::sync::Arc;

/// Per-frame metadata.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FrameMeta {
    /// Video, audio or other payload.
    pub media_type: MediaType,
    /// Presentation timestamp in microseconds.
    pub pts: Option<i64>,
    /// Duration in microseconds (0 if unknown).
    pub duration: i64,
    /// Sequence number assigned by the producing stage.
    pub sequence: u64,
    /// Geometry of a video payload.
    pub image: Option<ImagePara>,
    /// Layout of an audio payload.
    pub audio: Option<AudioPara>,
    /// Whether the payload can be decoded on its own.
    pub keyframe: bool,
}

/// Where a buffer's storage returns to.
struct Home {
    pool: Arc<PoolShared>,
    index: usize,
}

impl Home {
    fn recycle(self, storage: Box<[u8]>) {
        self.pool.recycle(self.index, storage);
    }
}

// ============================================================================
// PooledFrame
// ============================================================================

/// A buffer held by one stage, writable.
///
/// Dropping it without calling [`into_shared`](Self::into_shared) returns the
/// storage to the pool unpublished.
pub struct PooledFrame {
    storage: Box<[u8]>,
    offset: usize,
    len: usize,
    meta: FrameMeta,
    home: Option<Home>,
}

impl PooledFrame {
    pub(crate) fn new(storage: Box<[u8]>, pool: Arc<PoolShared>, index: usize) -> Self {
        Self {
            storage,
            offset: 0,
            len: 0,
            meta: FrameMeta::default(),
            home: Some(Home { pool, index }),
        }
    }

    /// Whole backing storage, for backends writing output.
    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.storage
    }

    /// The active region.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.storage[self.offset..self.offset + self.len]
    }

    /// Size of the backing storage.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Length of the active region.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Set the active region to `[0, len)`.
    ///
    /// # Panics
    ///
    /// Panics if `len > capacity()`.
    #[inline]
    pub fn set_len(&mut self, len: usize) {
        self.set_active(0, len);
    }

    /// Set the active region to `[offset, offset + len)`.
    ///
    /// # Panics
    ///
    /// Panics if the region exceeds the storage.
    pub fn set_active(&mut self, offset: usize, len: usize) {
        assert!(
            offset + len <= self.capacity(),
            "length exceeds buffer capacity"
        );
        self.offset = offset;
        self.len = len;
    }

    /// Copy `bytes` to the start of the buffer and make them the active region.
    pub fn copy_from(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.capacity() {
            return Err(Error::Resource(format!(
                "{} bytes do not fit in a {} byte buffer",
                bytes.len(),
                self.capacity()
            )));
        }
        self.storage[..bytes.len()].copy_from_slice(bytes);
        self.set_len(bytes.len());
        Ok(())
    }

    #[inline]
    pub fn meta(&self) -> &FrameMeta {
        &self.meta
    }

    #[inline]
    pub fn meta_mut(&mut self) -> &mut FrameMeta {
        &mut self.meta
    }

    /// Id of the owning pool.
    pub fn pool_id(&self) -> Option<u64> {
        self.home.as_ref().map(|h| h.pool.id())
    }

    /// Publish the buffer: from here on it is read-only and reference counted.
    pub fn into_shared(mut self) -> Frame {
        Frame {
            inner: Arc::new(FrameInner {
                storage: std::mem::take(&mut self.storage),
                offset: self.offset,
                len: self.len,
                meta: std::mem::take(&mut self.meta),
                home: self.home.take(),
            }),
        }
    }
}

impl Drop for PooledFrame {
    fn drop(&mut self) {
        if let Some(home) = self.home.take() {
            home.recycle(std::mem::take(&mut self.storage));
        }
    }
}

impl fmt::Debug for PooledFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledFrame")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .field("pool", &self.pool_id())
            .finish()
    }
}

// ============================================================================
// Frame
// ============================================================================

struct FrameInner {
    storage: Box<[u8]>,
    offset: usize,
    len: usize,
    meta: FrameMeta,
    home: Option<Home>,
}

impl Drop for FrameInner {
    fn drop(&mut self) {
        if let Some(home) = self.home.take() {
            home.recycle(std::mem::take(&mut self.storage));
        }
    }
}

/// A published, read-only frame.
///
/// Cloning takes another reference; the buffer returns to its pool when the
/// last reference drops.
#[derive(Clone)]
pub struct Frame {
    inner: Arc<FrameInner>,
}

impl Frame {
    /// Wrap bytes that do not belong to any pool.
    ///
    /// Used for frames produced outside the graph (tests, external sources).
    pub fn detached(data: Vec<u8>, meta: FrameMeta) -> Self {
        let len = data.len();
        Self {
            inner: Arc::new(FrameInner {
                storage: data.into_boxed_slice(),
                offset: 0,
                len,
                meta,
                home: None,
            }),
        }
    }

    #[inline]
    pub fn media_type(&self) -> MediaType {
        self.inner.meta.media_type
    }

    /// The payload bytes.
    #[inline]
    pub fn active_data(&self) -> &[u8] {
        let inner = &*self.inner;
        &inner.storage[inner.offset..inner.offset + inner.len]
    }

    #[inline]
    pub fn active_size(&self) -> usize {
        self.inner.len
    }

    /// Offset of the payload inside the backing storage.
    #[inline]
    pub fn active_offset(&self) -> usize {
        self.inner.offset
    }

    #[inline]
    pub fn image_para(&self) -> Option<&ImagePara> {
        self.inner.meta.image.as_ref()
    }

    #[inline]
    pub fn audio_para(&self) -> Option<&AudioPara> {
        self.inner.meta.audio.as_ref()
    }

    #[inline]
    pub fn pts(&self) -> Option<i64> {
        self.inner.meta.pts
    }

    #[inline]
    pub fn duration(&self) -> i64 {
        self.inner.meta.duration
    }

    #[inline]
    pub fn sequence(&self) -> u64 {
        self.inner.meta.sequence
    }

    #[inline]
    pub fn is_keyframe(&self) -> bool {
        self.inner.meta.keyframe
    }

    #[inline]
    pub fn meta(&self) -> &FrameMeta {
        &self.inner.meta
    }

    /// Id of the owning pool, `None` for detached frames.
    pub fn pool_id(&self) -> Option<u64> {
        self.inner.home.as_ref().map(|h| h.pool.id())
    }

    /// Number of live references to this buffer.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("media_type", &self.media_type())
            .field("size", &self.active_size())
            .field("sequence", &self.sequence())
            .field("pts", &self.pts())
            .field("refs", &self.ref_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::PixelFormat;

    #[test]
    fn test_detached_frame() {
        let meta = FrameMeta {
            media_type: MediaType::Video,
            pts: Some(40_000),
            sequence: 3,
            image: Some(ImagePara::new(2, 2, PixelFormat::Gray8)),
            ..Default::default()
        };
        let frame = Frame::detached(vec![1, 2, 3, 4], meta);

        assert_eq!(frame.active_data(), &[1, 2, 3, 4]);
        assert_eq!(frame.active_size(), 4);
        assert_eq!(frame.pts(), Some(40_000));
        assert_eq!(frame.sequence(), 3);
        assert_eq!(frame.media_type(), MediaType::Video);
        assert_eq!(frame.image_para().unwrap().width, 2);
        assert!(frame.audio_para().is_none());
        assert!(frame.pool_id().is_none());
    }

    #[test]
    fn test_clone_shares_storage() {
        let frame = Frame::detached(vec![7; 16], FrameMeta::default());
        let other = frame.clone();
        assert_eq!(frame.ref_count(), 2);
        assert_eq!(
            frame.active_data().as_ptr(),
            other.active_data().as_ptr()
        );
        drop(other);
        assert_eq!(frame.ref_count(), 1);
    }
}
