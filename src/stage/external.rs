//! Zero-copy handoff to observers outside the graph.
//!
//! An [`ExternalConsumer`] is a slot on a stage's output. Every published
//! frame is offered to each slot through a bounded kanal channel; the
//! observer either polls ([`ready`](ExternalConsumer::ready)) or blocks
//! ([`wait`](ExternalConsumer::wait)), reads the frame in place and then
//! releases it with [`consume_buffer`](ExternalConsumer::consume_buffer).
//!
//! A frame offered to a slot keeps its buffer out of the producer's pool
//! until it is consumed, so a slow observer applies backpressure exactly like
//! a slow in-graph consumer.

use crate::buffer::Frame;
use kanal::{Receiver, Sender};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Channel depth used by [`Stage::add_external_consumer`](crate::stage::Stage::add_external_consumer).
pub const DEFAULT_EXTERNAL_DEPTH: usize = 16;

/// Stage-side state of one slot.
pub(crate) struct ExternalSlot {
    name: String,
    tx: Sender<Frame>,
    rx: Receiver<Frame>,
    /// Frame handed to the observer and not yet consumed.
    current: Mutex<Option<Frame>>,
    offered: AtomicU64,
    overflowed: AtomicU64,
}

impl ExternalSlot {
    pub(crate) fn new(name: &str, depth: usize) -> Arc<Self> {
        let (tx, rx) = kanal::bounded(depth.max(1));
        Arc::new(Self {
            name: name.to_string(),
            tx,
            rx,
            current: Mutex::new(None),
            offered: AtomicU64::new(0),
            overflowed: AtomicU64::new(0),
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Offer one reference; returns false if the slot is full and the
    /// reference was dropped.
    pub(crate) fn offer(&self, frame: Frame) -> bool {
        match self.tx.try_send(frame) {
            Ok(true) => {
                self.offered.fetch_add(1, Ordering::Relaxed);
                true
            }
            _ => {
                self.overflowed.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Drop every reference the slot holds.
    pub(crate) fn clear(&self) -> usize {
        let mut released = usize::from(self.current.lock().unwrap().take().is_some());
        while let Ok(Some(frame)) = self.rx.try_recv() {
            drop(frame);
            released += 1;
        }
        released
    }

    pub(crate) fn pending(&self) -> usize {
        self.rx.len() + usize::from(self.current.lock().unwrap().is_some())
    }

    pub(crate) fn overflowed(&self) -> u64 {
        self.overflowed.load(Ordering::Relaxed)
    }
}

/// Observer handle for one external slot.
///
/// # Example
///
/// ```rust,ignore
/// let observer = stage.add_external_consumer("preview");
/// while observer.wait(Duration::from_millis(100)) {
///     if let Some(frame) = observer.get_output_buffer() {
///         inspect(frame.active_data());
///     }
///     observer.consume_buffer();
/// }
/// ```
pub struct ExternalConsumer {
    slot: Arc<ExternalSlot>,
}

impl ExternalConsumer {
    pub(crate) fn new(slot: Arc<ExternalSlot>) -> Self {
        Self { slot }
    }

    pub fn name(&self) -> &str {
        &self.slot.name
    }

    /// Whether a frame is waiting. Never blocks.
    pub fn ready(&self) -> bool {
        self.slot.current.lock().unwrap().is_some() || !self.slot.rx.is_empty()
    }

    /// Oldest unconsumed frame, if any.
    ///
    /// Repeated calls return the same frame until
    /// [`consume_buffer`](Self::consume_buffer) is called.
    pub fn get_output_buffer(&self) -> Option<Frame> {
        let mut current = self.slot.current.lock().unwrap();
        if current.is_none() {
            *current = self.slot.rx.try_recv().ok().flatten();
        }
        current.clone()
    }

    /// Release the slot's reference to the oldest frame.
    ///
    /// Returns false if there was nothing to release.
    pub fn consume_buffer(&self) -> bool {
        let mut current = self.slot.current.lock().unwrap();
        if current.take().is_some() {
            return true;
        }
        matches!(self.slot.rx.try_recv(), Ok(Some(_)))
    }

    /// Block until a frame is available or `timeout` expires.
    pub fn wait(&self, timeout: Duration) -> bool {
        if self.slot.current.lock().unwrap().is_some() {
            return true;
        }
        match self.slot.rx.recv_timeout(timeout) {
            Ok(frame) => {
                *self.slot.current.lock().unwrap() = Some(frame);
                true
            }
            Err(_) => false,
        }
    }

    /// Frames offered to this slot so far.
    pub fn offered(&self) -> u64 {
        self.slot.offered.load(Ordering::Relaxed)
    }

    /// Frames dropped because the slot was full.
    pub fn overflowed(&self) -> u64 {
        self.slot.overflowed()
    }
}

impl std::fmt::Debug for ExternalConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalConsumer")
            .field("name", &self.slot.name)
            .field("pending", &self.slot.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::FrameMeta;

    fn frame(sequence: u64) -> Frame {
        Frame::detached(
            vec![sequence as u8; 8],
            FrameMeta {
                sequence,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_poll_get_consume() {
        let slot = ExternalSlot::new("preview", 4);
        let observer = ExternalConsumer::new(slot.clone());
        assert!(!observer.ready());
        assert!(observer.get_output_buffer().is_none());
        assert!(!observer.consume_buffer());

        slot.offer(frame(1));
        slot.offer(frame(2));
        assert!(observer.ready());

        // Same frame until consumed.
        assert_eq!(observer.get_output_buffer().unwrap().sequence(), 1);
        assert_eq!(observer.get_output_buffer().unwrap().sequence(), 1);
        assert!(observer.consume_buffer());
        assert_eq!(observer.get_output_buffer().unwrap().sequence(), 2);
        assert!(observer.consume_buffer());
        assert!(!observer.ready());
        assert_eq!(observer.offered(), 2);
    }

    #[test]
    fn test_consume_releases_reference() {
        let slot = ExternalSlot::new("preview", 4);
        let observer = ExternalConsumer::new(slot.clone());

        let published = frame(7);
        slot.offer(published.clone());
        assert_eq!(published.ref_count(), 2);

        let view = observer.get_output_buffer().unwrap();
        drop(view);
        assert_eq!(published.ref_count(), 2);
        observer.consume_buffer();
        assert_eq!(published.ref_count(), 1);
    }

    #[test]
    fn test_overflow_drops_reference() {
        let slot = ExternalSlot::new("preview", 1);
        assert!(slot.offer(frame(1)));
        assert!(!slot.offer(frame(2)));
        assert_eq!(slot.overflowed(), 1);
    }

    #[test]
    fn test_wait_and_clear() {
        let slot = ExternalSlot::new("preview", 4);
        let observer = ExternalConsumer::new(slot.clone());
        assert!(!observer.wait(Duration::from_millis(5)));

        let producer = {
            let slot = slot.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                slot.offer(frame(3));
                slot.offer(frame(4));
            })
        };
        assert!(observer.wait(Duration::from_secs(2)));
        producer.join().unwrap();

        assert_eq!(slot.pending(), 2);
        assert_eq!(slot.clear(), 2);
        assert!(!observer.ready());
    }
}
