//! Integration tests for backpressure and failure isolation.
//!
//! These tests verify that:
//! - A held frame stalls its producer once the pool is exhausted
//! - Rejecting pools drop frames instead of stalling
//! - A non-fatal backend error drops one frame and nothing else
//! - Drop-oldest queues bound a slow consumer's backlog
//! - A source that stays idle too long stops with a timeout

use stagegraph::backends::{NullSink, Pattern, PatternSource};
use stagegraph::error::{Error, Result};
use stagegraph::format::{ImagePara, PixelFormat, StreamPara};
use stagegraph::memory::PoolMode;
use stagegraph::stage::{
    Flow, ProcessContext, QueuePolicy, Stage, StageBackend, StageKind, StageOptions, StageState,
};
use std::thread;
use std::time::{Duration, Instant};

const PARA: ImagePara = ImagePara::new(8, 4, PixelFormat::Gray8);

fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

/// Emits a fixed number of frames, then stays alive without data.
struct BurstSource {
    remaining: u64,
}

impl StageBackend for BurstSource {
    fn kind(&self) -> StageKind {
        StageKind::Source
    }

    fn negotiate(&mut self, _input: Option<&StreamPara>) -> Result<StreamPara> {
        Ok(StreamPara::Video(PARA))
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<Flow> {
        if self.remaining == 0 {
            thread::sleep(Duration::from_millis(1));
            return Ok(Flow::Idle);
        }
        let Some(output) = ctx.output() else {
            return Ok(Flow::Skip);
        };
        output.set_len(PARA.frame_size());
        self.remaining -= 1;
        Ok(Flow::Ready)
    }
}

/// Forwards its input, failing on one sequence number.
struct FailOnce {
    fail_at: u64,
}

impl StageBackend for FailOnce {
    fn kind(&self) -> StageKind {
        StageKind::Transform
    }

    fn negotiate(&mut self, input: Option<&StreamPara>) -> Result<StreamPara> {
        input.copied().ok_or_else(|| Error::config("needs a producer"))
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<Flow> {
        match ctx.input() {
            Some(frame) if frame.sequence() == self.fail_at => {
                Err(Error::backend(format!("cannot handle frame {}", self.fail_at)))
            }
            Some(_) => Ok(Flow::Forward),
            None => Ok(Flow::Skip),
        }
    }
}

#[test]
fn test_held_frame_stalls_source() {
    let source = Stage::with_options(
        "source",
        PatternSource::new(PARA)
            .with_pattern(Pattern::Sequence)
            .with_frame_limit(10),
        StageOptions::default().with_buffer_count(1),
    );
    let relay = Stage::with_options("relay", NullSink::forwarding(), StageOptions::pass_through());
    relay.set_productor(&source).unwrap();
    let observer = relay.add_external_consumer("app");

    source.init().unwrap();
    relay.init().unwrap();
    source.start_pipe().unwrap();

    for i in 0..10u64 {
        assert!(observer.wait(Duration::from_secs(5)), "frame {i} never arrived");
        let frame = observer.get_output_buffer().unwrap();
        assert_eq!(frame.sequence(), i);
        assert_eq!(frame.active_data()[0], i as u8);

        // While the frame is held the source cannot get a buffer.
        thread::sleep(Duration::from_millis(20));
        assert_eq!(source.stats().produced, i + 1);
        assert_eq!(source.pool_stats().unwrap().free, 0);

        drop(frame);
        assert!(observer.consume_buffer());
    }

    wait_until("relay to stop", || relay.state() == StageState::Stopped);
    assert_eq!(observer.offered(), 10);
    assert_eq!(observer.overflowed(), 0);
    assert!(source.pool_stats().unwrap().waits > 0);

    source.stop_pipe();
    assert_eq!(source.pool_stats().unwrap().free, 1);
}

#[test]
fn test_reject_mode_drops_instead_of_stalling() {
    let source = Stage::with_options(
        "source",
        PatternSource::new(PARA).with_frame_rate(500),
        StageOptions::default()
            .with_buffer_count(1)
            .with_pool_mode(PoolMode::Reject),
    );
    let observer = source.add_external_consumer("app");
    source.init().unwrap();
    source.start().unwrap();

    assert!(observer.wait(Duration::from_secs(5)));
    let held = observer.get_output_buffer().unwrap();
    wait_until("rejections", || {
        source.pool_stats().unwrap().rejections > 2 && source.stats().dropped > 2
    });
    assert_eq!(source.state(), StageState::Running);

    drop(held);
    observer.consume_buffer();
    assert!(observer.wait(Duration::from_secs(5)));
    let next = observer.get_output_buffer().unwrap();
    assert!(next.sequence() > 0);
    drop(next);

    source.stop();
    assert_eq!(source.pool_stats().unwrap().in_flight, 0);
}

#[test]
fn test_backend_error_drops_single_frame() {
    let source = Stage::new("source", BurstSource { remaining: 10 });
    let faulty = Stage::with_options("faulty", FailOnce { fail_at: 4 }, StageOptions::pass_through());
    faulty.set_productor(&source).unwrap();
    let observer = faulty.add_external_consumer("app");

    source.init().unwrap();
    faulty.init().unwrap();
    source.start_pipe().unwrap();

    let mut sequences = Vec::new();
    while sequences.len() < 9 {
        assert!(observer.wait(Duration::from_secs(5)), "got only {sequences:?}");
        let frame = observer.get_output_buffer().unwrap();
        sequences.push(frame.sequence());
        drop(frame);
        observer.consume_buffer();
    }
    assert_eq!(sequences, vec![0, 1, 2, 3, 5, 6, 7, 8, 9]);

    assert_eq!(source.state(), StageState::Running);
    assert_eq!(faulty.state(), StageState::Running);
    let stats = faulty.stats();
    assert_eq!(stats.errors, 1);
    assert_eq!(stats.dropped, 1);
    assert!(faulty.last_error().is_none());

    source.stop_pipe();
    assert_eq!(faulty.state(), StageState::Stopped);
    assert_eq!(source.pool_stats().unwrap().in_flight, 0);
}

#[test]
fn test_fatal_error_stops_stage() {
    struct Broken;

    impl StageBackend for Broken {
        fn kind(&self) -> StageKind {
            StageKind::Sink
        }

        fn negotiate(&mut self, input: Option<&StreamPara>) -> Result<StreamPara> {
            input.copied().ok_or_else(|| Error::config("needs a producer"))
        }

        fn process(&mut self, _ctx: &mut ProcessContext<'_>) -> Result<Flow> {
            Err(Error::fatal("device lost"))
        }
    }

    let source = Stage::new("source", BurstSource { remaining: 3 });
    let broken = Stage::with_options("broken", Broken, StageOptions::pass_through());
    broken.set_productor(&source).unwrap();
    source.init().unwrap();
    broken.init().unwrap();
    source.start_pipe().unwrap();

    wait_until("broken to stop", || broken.state() == StageState::Stopped);
    assert!(broken.last_error().unwrap().contains("device lost"));
    assert_eq!(broken.stats().errors, 1);

    source.stop_pipe();
    assert_eq!(source.pool_stats().unwrap().in_flight, 0);
}

#[test]
fn test_drop_oldest_bounds_backlog() {
    let source = Stage::with_options(
        "source",
        PatternSource::new(PARA)
            .with_pattern(Pattern::Sequence)
            .with_frame_limit(20),
        StageOptions::default().with_buffer_count(8),
    );
    let slow = Stage::with_options(
        "slow",
        NullSink::forwarding().with_delay(Duration::from_millis(10)),
        StageOptions::pass_through().with_queue_policy(QueuePolicy::DropOldest(2)),
    );
    slow.set_productor(&source).unwrap();

    let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let record = seen.clone();
    slow.set_output_data_callback(move |frame| record.lock().unwrap().push(frame.sequence()));

    source.init().unwrap();
    slow.init().unwrap();
    source.start_pipe().unwrap();
    wait_until("slow to stop", || slow.state() == StageState::Stopped);

    let seen = seen.lock().unwrap();
    let queue = slow.queue_stats();
    assert!(queue.total_dropped > 0);
    assert_eq!(seen.len() as u64 + queue.total_dropped, 20);
    // Survivors keep their order and the newest frame always gets through.
    assert!(seen.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(seen.last(), Some(&19));

    source.stop_pipe();
    assert_eq!(source.pool_stats().unwrap().in_flight, 0);
}

#[test]
fn test_idle_source_stops_with_timeout() {
    let source = Stage::with_options(
        "source",
        BurstSource { remaining: 3 },
        StageOptions::default().with_max_timeout_count(3),
    );
    let sink = Stage::with_options("sink", NullSink::new(), StageOptions::pass_through());
    sink.set_productor(&source).unwrap();

    source.init().unwrap();
    sink.init().unwrap();
    source.start_pipe().unwrap();
    wait_until("source to time out", || source.state() == StageState::Stopped);

    let error = source.last_error().expect("timeout recorded");
    assert!(error.starts_with("timeout:"), "{error}");
    assert_eq!(source.stats().produced, 3);
    // Downstream sees end-of-stream once the source gives up.
    wait_until("sink to stop", || sink.state() == StageState::Stopped);
    assert_eq!(sink.stats().consumed, 3);

    source.stop_pipe();
}

#[test]
fn test_idle_source_without_limit_keeps_running() {
    let source = Stage::new("source", BurstSource { remaining: 1 });
    source.init().unwrap();
    source.start().unwrap();

    thread::sleep(Duration::from_millis(50));
    assert_eq!(source.state(), StageState::Running);
    assert!(source.last_error().is_none());
    source.stop();
}
