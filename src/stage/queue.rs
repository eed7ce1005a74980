//! Per-consumer input queue.
//!
//! Every stage with a producer owns one [`FrameQueue`]. The producer pushes a
//! reference to each published frame; the consumer's worker pops them in
//! order. The queue itself never blocks the producer: backpressure comes from
//! the producer's pool, since every queued frame keeps a pool buffer in
//! flight. A [`QueuePolicy::DropOldest`] consumer bounds that hold and never
//! stalls its producer.

use crate::buffer::Frame;
use crate::error::{Error, Result};
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// What a consumer's input queue does when frames arrive faster than the
/// consumer processes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueuePolicy {
    /// Keep every frame; the producer stalls once its pool is exhausted.
    #[default]
    Unbounded,
    /// Keep at most this many frames, discarding the oldest.
    DropOldest(usize),
}

impl FromStr for QueuePolicy {
    type Err = Error;

    /// Parses `"fifo"` / `"unbounded"` or `"drop-oldest:<depth>"`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_ascii_lowercase();
        match s.split_once(':') {
            None if s == "fifo" || s == "unbounded" => Ok(Self::Unbounded),
            Some(("drop-oldest", depth)) => depth
                .parse::<usize>()
                .ok()
                .filter(|d| *d > 0)
                .map(Self::DropOldest)
                .ok_or_else(|| Error::config(format!("invalid queue depth '{depth}'"))),
            _ => Err(Error::config(format!("queue policy '{s}' is not supported"))),
        }
    }
}

/// Result of a pop.
#[derive(Debug)]
pub(crate) enum Pulled {
    Frame(Frame),
    /// Producer finished and every queued frame was delivered.
    Eos,
    /// Queue is shutting down.
    Flushing,
    /// Timed out with nothing queued.
    Empty,
}

struct QueueState {
    frames: VecDeque<Frame>,
    policy: QueuePolicy,
    eos: bool,
    flushing: bool,
    total_pushed: u64,
    total_popped: u64,
    total_dropped: u64,
}

/// Statistics about queue operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Frames currently queued.
    pub current: usize,
    /// Frames accepted.
    pub total_pushed: u64,
    /// Frames handed to the consumer.
    pub total_popped: u64,
    /// Frames discarded by the drop-oldest policy or while flushing.
    pub total_dropped: u64,
}

pub(crate) struct FrameQueue {
    state: Mutex<QueueState>,
    not_empty: Condvar,
}

impl FrameQueue {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                frames: VecDeque::new(),
                policy: QueuePolicy::Unbounded,
                eos: false,
                flushing: false,
                total_pushed: 0,
                total_popped: 0,
                total_dropped: 0,
            }),
            not_empty: Condvar::new(),
        }
    }

    pub(crate) fn set_policy(&self, policy: QueuePolicy) {
        self.state.lock().unwrap().policy = policy;
    }

    /// Queue a frame. Returns false if it was discarded because the queue is
    /// flushing or already saw end-of-stream.
    pub(crate) fn push(&self, frame: Frame) -> bool {
        let evicted = {
            let mut state = self.state.lock().unwrap();
            if state.flushing || state.eos {
                state.total_dropped += 1;
                return false;
            }

            let mut evicted = None;
            if let QueuePolicy::DropOldest(max) = state.policy {
                if state.frames.len() >= max {
                    evicted = state.frames.pop_front();
                    state.total_dropped += 1;
                }
            }
            state.frames.push_back(frame);
            state.total_pushed += 1;
            evicted
        };
        self.not_empty.notify_one();
        // Evicted frame goes back to its pool outside the lock.
        drop(evicted);
        true
    }

    /// Mark end-of-stream; the consumer sees it after the queued frames.
    pub(crate) fn push_eos(&self) {
        self.state.lock().unwrap().eos = true;
        self.not_empty.notify_all();
    }

    /// Pop the oldest frame, waiting up to `timeout` (forever if `None`).
    pub(crate) fn pop(&self, timeout: Option<Duration>) -> Pulled {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.flushing {
                return Pulled::Flushing;
            }
            if let Some(frame) = state.frames.pop_front() {
                state.total_popped += 1;
                return Pulled::Frame(frame);
            }
            if state.eos {
                return Pulled::Eos;
            }
            state = match timeout {
                Some(t) => {
                    let (guard, result) = self.not_empty.wait_timeout(state, t).unwrap();
                    if result.timed_out() && guard.frames.is_empty() && !guard.eos && !guard.flushing {
                        return Pulled::Empty;
                    }
                    guard
                }
                None => self.not_empty.wait(state).unwrap(),
            };
        }
    }

    /// Set flushing mode: blocked pops return, later pushes are discarded.
    pub(crate) fn set_flushing(&self) {
        self.state.lock().unwrap().flushing = true;
        self.not_empty.notify_all();
    }

    /// Drop everything queued; returns how many frames were released.
    pub(crate) fn drain(&self) -> usize {
        let drained: Vec<Frame> = {
            let mut state = self.state.lock().unwrap();
            let drained: Vec<Frame> = state.frames.drain(..).collect();
            state.total_dropped += drained.len() as u64;
            drained
        };
        drained.len()
    }

    pub(crate) fn stats(&self) -> QueueStats {
        let state = self.state.lock().unwrap();
        QueueStats {
            current: state.frames.len(),
            total_pushed: state.total_pushed,
            total_popped: state.total_popped,
            total_dropped: state.total_dropped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::FrameMeta;
    use std::sync::Arc;
    use std::thread;

    fn frame(sequence: u64) -> Frame {
        Frame::detached(
            vec![0; 4],
            FrameMeta {
                sequence,
                ..Default::default()
            },
        )
    }

    fn sequence(pulled: Pulled) -> u64 {
        match pulled {
            Pulled::Frame(f) => f.sequence(),
            other => panic!("expected a frame, got {other:?}"),
        }
    }

    #[test]
    fn test_fifo_order() {
        let queue = FrameQueue::new();
        for i in 0..5 {
            assert!(queue.push(frame(i)));
        }
        for i in 0..5 {
            assert_eq!(sequence(queue.pop(None)), i);
        }
        assert!(matches!(queue.pop(Some(Duration::from_millis(5))), Pulled::Empty));
    }

    #[test]
    fn test_drop_oldest() {
        let queue = FrameQueue::new();
        queue.set_policy(QueuePolicy::DropOldest(2));

        let first = frame(0);
        queue.push(first.clone());
        queue.push(frame(1));
        queue.push(frame(2));

        // The evicted frame's reference was released.
        assert_eq!(first.ref_count(), 1);
        assert_eq!(sequence(queue.pop(None)), 1);
        assert_eq!(sequence(queue.pop(None)), 2);
        assert_eq!(queue.stats().total_dropped, 1);
    }

    #[test]
    fn test_eos_after_queued_frames() {
        let queue = FrameQueue::new();
        queue.push(frame(0));
        queue.push_eos();
        assert!(!queue.push(frame(1)));

        assert_eq!(sequence(queue.pop(None)), 0);
        assert!(matches!(queue.pop(None), Pulled::Eos));
    }

    #[test]
    fn test_flushing_wakes_consumer() {
        let queue = Arc::new(FrameQueue::new());
        let q = queue.clone();
        let handle = thread::spawn(move || matches!(q.pop(None), Pulled::Flushing));

        thread::sleep(Duration::from_millis(20));
        queue.set_flushing();
        assert!(handle.join().unwrap());
        assert!(!queue.push(frame(0)));
    }

    #[test]
    fn test_drain() {
        let queue = FrameQueue::new();
        let held = frame(0);
        queue.push(held.clone());
        queue.push(frame(1));
        assert_eq!(queue.drain(), 2);
        assert_eq!(held.ref_count(), 1);
        assert_eq!(queue.stats().current, 0);
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!("fifo".parse::<QueuePolicy>().unwrap(), QueuePolicy::Unbounded);
        assert_eq!(
            "drop-oldest:3".parse::<QueuePolicy>().unwrap(),
            QueuePolicy::DropOldest(3)
        );
        assert!("drop-oldest:0".parse::<QueuePolicy>().is_err());
        assert!("lifo".parse::<QueuePolicy>().is_err());
    }
}
