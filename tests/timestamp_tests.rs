//! Tests for timestamp stamping and presentation pacing through stages.

use stagegraph::backends::{NullSink, PatternSource};
use stagegraph::clock::{Clock, ManualClock};
use stagegraph::format::{ImagePara, PixelFormat};
use stagegraph::stage::{Stage, StageKind, StageOptions, StageState};
use stagegraph::synchronize::{SyncAction, SynchronizeType, Synchronizer};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
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

/// Run `source` to end-of-stream and collect `(sequence, pts, duration)`.
fn collect(source: &Stage) -> Vec<(u64, Option<i64>, i64)> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = seen.clone();
    source.set_output_data_callback(move |frame| {
        record
            .lock()
            .unwrap()
            .push((frame.sequence(), frame.pts(), frame.duration()));
    });
    source.init().unwrap();
    source.start().unwrap();
    wait_until("source to finish", || source.state() == StageState::Stopped);
    source.stop();
    seen.lock().unwrap().clone()
}

#[test]
fn test_paced_source_pts_from_frame_rate() {
    let source = Stage::new(
        "source",
        PatternSource::new(PARA).with_frame_rate(200).with_frame_limit(5),
    );
    let frames = collect(&source);

    assert_eq!(frames.len(), 5);
    for (i, (sequence, pts, duration)) in frames.iter().enumerate() {
        assert_eq!(*sequence, i as u64);
        assert_eq!(*pts, Some(i as i64 * 5_000));
        assert_eq!(*duration, 5_000);
    }
}

#[test]
fn test_free_running_source_pts_non_decreasing() {
    let source = Stage::new("source", PatternSource::new(PARA).with_frame_limit(20));
    let frames = collect(&source);

    assert_eq!(frames.len(), 20);
    let pts: Vec<i64> = frames.iter().map(|f| f.1.unwrap()).collect();
    assert!(pts.windows(2).all(|w| w[0] <= w[1]), "{pts:?}");
}

#[test]
fn test_source_stamps_from_attached_clock() {
    let clock = Arc::new(ManualClock::new(1_000_000));
    let sync = Arc::new(Synchronizer::with_clock(SynchronizeType::Absolute, clock.clone()));
    clock.advance(Duration::from_millis(250));

    let source = Stage::new("source", PatternSource::new(PARA).with_frame_limit(3));
    source.set_synchronize(sync);
    let frames = collect(&source);

    assert_eq!(frames.len(), 3);
    for (_, pts, _) in frames {
        assert_eq!(pts, Some(250_000));
    }
}

#[test]
fn test_late_frames_dropped_by_display() {
    let clock = Arc::new(ManualClock::new(0));
    let sync = Arc::new(Synchronizer::with_clock(SynchronizeType::Absolute, clock.clone()));
    // Ten seconds behind: every frame is far past its presentation time.
    clock.advance(Duration::from_secs(10));

    let source = Stage::new(
        "source",
        PatternSource::new(PARA).with_frame_rate(1000).with_frame_limit(5),
    );
    let display_backend = NullSink::new().with_kind(StageKind::Display);
    let shown = display_backend.counter();
    let display = Stage::with_options("display", display_backend, StageOptions::pass_through());
    display.set_productor(&source).unwrap();
    display.set_synchronize(sync);

    source.init().unwrap();
    display.init().unwrap();
    source.start_pipe().unwrap();
    wait_until("display to stop", || display.state() == StageState::Stopped);

    assert_eq!(shown.load(Ordering::Relaxed), 0);
    assert_eq!(display.stats().dropped, 5);
    source.stop_pipe();
}

#[test]
fn test_on_time_frames_shown_by_display() {
    let clock = Arc::new(ManualClock::new(0));
    let sync = Arc::new(Synchronizer::with_clock(SynchronizeType::Absolute, clock));

    let source = Stage::new(
        "source",
        PatternSource::new(PARA).with_frame_rate(1000).with_frame_limit(5),
    );
    let display_backend = NullSink::new().with_kind(StageKind::Display);
    let shown = display_backend.counter();
    let display = Stage::with_options("display", display_backend, StageOptions::pass_through());
    display.set_productor(&source).unwrap();
    display.set_synchronize(sync);

    source.init().unwrap();
    display.init().unwrap();
    source.start_pipe().unwrap();
    wait_until("display to stop", || display.state() == StageState::Stopped);

    // Frames up to 4 ms early are held, then shown.
    assert_eq!(shown.load(Ordering::Relaxed), 5);
    assert_eq!(display.stats().dropped, 0);
    source.stop_pipe();
}

#[test]
fn test_video_clock_never_moves_backwards() {
    let clock = Arc::new(ManualClock::new(0));
    let sync = Synchronizer::with_clock(SynchronizeType::Video, clock.clone());

    for pts in [0, 40_000, 80_000, 20_000, 60_000, 120_000] {
        clock.advance(Duration::from_millis(10));
        sync.update_video(pts, 40_000);
        let current = sync.clock(SynchronizeType::Video).current_pts;
        assert!(current >= pts);
    }
    assert_eq!(sync.clock(SynchronizeType::Video).current_pts, 120_000);
    assert_eq!(sync.master_time(), 120_000);
}

#[test]
fn test_reset_reanchors_all_timelines() {
    let clock = Arc::new(ManualClock::new(5_000));
    let sync = Synchronizer::with_clock(SynchronizeType::Audio, clock.clone());
    sync.update_audio(480, 48_000, 0);
    clock.advance(Duration::from_secs(3));
    assert_eq!(sync.clock_time(&sync.clock(SynchronizeType::Absolute)), 3_000_000);

    sync.reset();
    for which in [
        SynchronizeType::Audio,
        SynchronizeType::Video,
        SynchronizeType::Absolute,
    ] {
        let record = sync.clock(which);
        assert_eq!(record.start_time, clock.now_micros());
        assert_eq!(record.current_pts, 0);
        assert_eq!(sync.clock_time(&record), 0);
    }
    // Audio master without audio follows the absolute timeline again.
    clock.advance(Duration::from_millis(7));
    assert_eq!(sync.master_time(), 7_000);
}

#[test]
fn test_audio_master_paces_video() {
    let clock = Arc::new(ManualClock::new(0));
    let sync = Synchronizer::with_clock(SynchronizeType::Audio, clock.clone());

    // 1024 samples at 48 kHz advance the audio position by 21 333 us.
    sync.update_audio(1024, 48_000, 0);
    assert_eq!(sync.master_time(), 21_333);

    let on_time = sync.update_video(21_333, 33_333);
    assert_eq!(Synchronizer::decide(on_time, 33_333), SyncAction::Emit);

    let early = sync.update_video(41_333, 33_333);
    assert_eq!(
        Synchronizer::decide(early, 33_333),
        SyncAction::Hold(Duration::from_millis(20))
    );

    // The audio position moves on; an old video frame is now late.
    sync.update_audio(48_000, 48_000, 21_333);
    let late = sync.update_video(40_000, 33_333);
    assert_eq!(Synchronizer::decide(late, 33_333), SyncAction::Drop);
}
