//! Audio/video synchronization clock.
//!
//! A [`Synchronizer`] keeps three timelines (audio, video and absolute wall
//! time) and designates one of them as master. Stages that stamp or present
//! frames report their timestamps here and get back a presentation delay:
//! positive means the frame is early and should be held, negative means it
//! is late.
//!
//! All values are signed microseconds.
//!
//! # Example
//!
//! ```rust
//! use stagegraph::synchronize::{Synchronizer, SynchronizeType, SyncAction};
//!
//! let sync = Synchronizer::new(SynchronizeType::Absolute);
//! let delay = sync.update_video(0, 40_000);
//! match Synchronizer::decide(delay, 40_000) {
//!     SyncAction::Emit | SyncAction::Hold(_) => {}
//!     SyncAction::Drop => unreachable!("first frame is never late"),
//! }
//! ```

use crate::clock::{Clock, MICROS_PER_SEC, SystemClock};
use crate::error::{Error, Result};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Frames later than this (or one frame duration, if longer) are dropped.
const MIN_DROP_THRESHOLD_US: i64 = 40_000;

/// Longest hold a single decision will ask for.
const MAX_HOLD_US: i64 = MICROS_PER_SEC;

/// Which timeline is authoritative for presentation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SynchronizeType {
    /// Audio playback position drives presentation.
    #[default]
    Audio,
    /// Video timestamps drive presentation.
    Video,
    /// Wall clock since the last reset drives presentation.
    Absolute,
}

impl FromStr for SynchronizeType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "audio" => Ok(Self::Audio),
            "video" => Ok(Self::Video),
            "abs" | "absolute" => Ok(Self::Absolute),
            other => Err(Error::config(format!("sync mode '{other}' is not supported"))),
        }
    }
}

/// One timeline: where it started on the wall clock and how far it has got.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClockRecord {
    /// Wall time (µs) the timeline was anchored at.
    pub start_time: i64,
    /// Latest presentation timestamp reported on this timeline (µs).
    pub current_pts: i64,
}

/// Emit/hold/drop decision for one frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncAction {
    /// Present now.
    Emit,
    /// Present after waiting this long.
    Hold(Duration),
    /// Too late; skip the frame.
    Drop,
}

#[derive(Debug)]
struct SyncState {
    audio: ClockRecord,
    video: ClockRecord,
    absolute: ClockRecord,
    pts_ratio: f32,
    sync_type: SynchronizeType,
    /// Whether any audio was reported since the last reset.
    audio_started: bool,
}

impl SyncState {
    fn record(&self, which: SynchronizeType) -> &ClockRecord {
        match which {
            SynchronizeType::Audio => &self.audio,
            SynchronizeType::Video => &self.video,
            SynchronizeType::Absolute => &self.absolute,
        }
    }

    fn record_mut(&mut self, which: SynchronizeType) -> &mut ClockRecord {
        match which {
            SynchronizeType::Audio => &mut self.audio,
            SynchronizeType::Video => &mut self.video,
            SynchronizeType::Absolute => &mut self.absolute,
        }
    }

    fn scale(&self, pts: i64) -> i64 {
        (pts as f64 * self.pts_ratio as f64) as i64
    }
}

/// Shared audio/video synchronization clock.
///
/// Mutating calls are serialized by one mutex over all three records, so a
/// reader always sees a consistent snapshot.
pub struct Synchronizer {
    clock: Arc<dyn Clock>,
    state: Mutex<SyncState>,
}

impl Synchronizer {
    /// Create a synchronizer on the system wall clock.
    pub fn new(sync_type: SynchronizeType) -> Self {
        Self::with_clock(sync_type, Arc::new(SystemClock::new()))
    }

    /// Create a synchronizer on a custom time source.
    pub fn with_clock(sync_type: SynchronizeType, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_micros();
        let anchored = ClockRecord {
            start_time: now,
            current_pts: 0,
        };
        Self {
            clock,
            state: Mutex::new(SyncState {
                audio: anchored,
                video: anchored,
                absolute: anchored,
                pts_ratio: 1.0,
                sync_type,
                audio_started: false,
            }),
        }
    }

    /// The master timeline designation.
    pub fn sync_type(&self) -> SynchronizeType {
        self.state.lock().unwrap().sync_type
    }

    /// Current wall time in microseconds.
    #[inline]
    pub fn current_time(&self) -> i64 {
        self.clock.now_micros()
    }

    /// Re-anchor all three timelines to now and clear their positions.
    pub fn reset(&self) {
        let now = self.current_time();
        let mut state = self.state.lock().unwrap();
        for which in [
            SynchronizeType::Audio,
            SynchronizeType::Video,
            SynchronizeType::Absolute,
        ] {
            *state.record_mut(which) = ClockRecord {
                start_time: now,
                current_pts: 0,
            };
        }
        state.audio_started = false;
        tracing::debug!(start_time = now, "synchronizer reset");
    }

    /// Scale applied to incoming timestamps for sources whose timebase is
    /// not 1:1 with wall time.
    pub fn set_pts_ratio(&self, ratio: f32) {
        self.state.lock().unwrap().pts_ratio = ratio;
    }

    /// Snapshot of the master timeline.
    pub fn master_clock(&self) -> ClockRecord {
        let state = self.state.lock().unwrap();
        *state.record(state.sync_type)
    }

    /// Snapshot of any timeline.
    pub fn clock(&self, which: SynchronizeType) -> ClockRecord {
        *self.state.lock().unwrap().record(which)
    }

    /// Current position of the master timeline.
    ///
    /// Audio and video masters report their latest position; the absolute
    /// master reports wall time elapsed since its anchor. An audio master that
    /// has not seen any audio yet follows the absolute timeline.
    pub fn master_time(&self) -> i64 {
        let now = self.current_time();
        let state = self.state.lock().unwrap();
        Self::master_time_locked(&state, now)
    }

    fn master_time_locked(state: &SyncState, now: i64) -> i64 {
        match state.sync_type {
            SynchronizeType::Audio if state.audio_started => state.audio.current_pts,
            SynchronizeType::Video => state.video.current_pts,
            _ => now - state.absolute.start_time,
        }
    }

    /// Wall time elapsed since `clock` was anchored.
    pub fn clock_time(&self, clock: &ClockRecord) -> i64 {
        self.current_time() - clock.start_time
    }

    /// Move one timeline's position forward to `pts` (never backwards).
    pub fn set_clock_time(&self, which: SynchronizeType, pts: i64) {
        let mut state = self.state.lock().unwrap();
        let record = state.record_mut(which);
        record.current_pts = record.current_pts.max(pts);
    }

    /// Report a video frame; returns its presentation delay in microseconds.
    pub fn update_video(&self, pts: i64, duration: i64) -> i64 {
        let now = self.current_time();
        let mut state = self.state.lock().unwrap();
        let scaled = state.scale(pts);
        state.video.current_pts = state.video.current_pts.max(scaled);

        let delay = match state.sync_type {
            SynchronizeType::Video => scaled - (now - state.video.start_time),
            SynchronizeType::Audio if state.audio_started => scaled - state.audio.current_pts,
            _ => scaled - (now - state.absolute.start_time),
        };
        tracing::trace!(pts, duration, delay, "video clock updated");
        delay
    }

    /// Report an audio block of `samples` samples; returns its presentation
    /// delay in microseconds.
    ///
    /// The audio position advances to the end of the block:
    /// `pts + samples * 1_000_000 / sample_rate`.
    pub fn update_audio(&self, samples: u32, sample_rate: u32, pts: i64) -> i64 {
        if sample_rate == 0 {
            return 0;
        }
        let duration = samples as i64 * MICROS_PER_SEC / sample_rate as i64;
        let now = self.current_time();
        let mut state = self.state.lock().unwrap();
        let scaled = state.scale(pts);
        state.audio.current_pts = state.audio.current_pts.max(scaled + duration);
        state.audio_started = true;

        let delay = match state.sync_type {
            SynchronizeType::Audio => scaled - (now - state.audio.start_time),
            SynchronizeType::Absolute => scaled - (now - state.absolute.start_time),
            SynchronizeType::Video => scaled - state.video.current_pts,
        };
        tracing::trace!(pts, duration, delay, "audio clock updated");
        delay
    }

    /// Report an audio block by its raw byte length.
    ///
    /// The sample count is `bytes / (channels * bits_per_sample / 8)`.
    pub fn update_audio_by_bytes_size(
        &self,
        bytes: u32,
        sample_rate: u32,
        channels: u32,
        bits_per_sample: u32,
        pts: i64,
    ) -> i64 {
        let frame_bytes = channels * bits_per_sample / 8;
        if frame_bytes == 0 {
            return 0;
        }
        self.update_audio(bytes / frame_bytes, sample_rate, pts)
    }

    /// Turn a presentation delay into an emit/hold/drop decision.
    ///
    /// A frame later than one frame duration (at least 40 ms) is dropped; an
    /// early frame is held, for at most one second.
    pub fn decide(delay: i64, duration: i64) -> SyncAction {
        let threshold = duration.max(MIN_DROP_THRESHOLD_US);
        if delay < -threshold {
            SyncAction::Drop
        } else if delay > 0 {
            SyncAction::Hold(Duration::from_micros(delay.min(MAX_HOLD_US) as u64))
        } else {
            SyncAction::Emit
        }
    }
}

impl std::fmt::Debug for Synchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("Synchronizer")
            .field("clock", &self.clock.name())
            .field("sync_type", &state.sync_type)
            .field("audio", &state.audio)
            .field("video", &state.video)
            .field("absolute", &state.absolute)
            .field("pts_ratio", &state.pts_ratio)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn manual(sync_type: SynchronizeType) -> (Arc<ManualClock>, Synchronizer) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let sync = Synchronizer::with_clock(sync_type, clock.clone());
        (clock, sync)
    }

    #[test]
    fn test_sync_type_parse() {
        assert_eq!("".parse::<SynchronizeType>().unwrap(), SynchronizeType::Audio);
        assert_eq!("video".parse::<SynchronizeType>().unwrap(), SynchronizeType::Video);
        assert_eq!("abs".parse::<SynchronizeType>().unwrap(), SynchronizeType::Absolute);
        assert!("ntp".parse::<SynchronizeType>().is_err());
    }

    #[test]
    fn test_audio_duration_from_samples() {
        let (_clock, sync) = manual(SynchronizeType::Audio);
        sync.update_audio(1024, 48_000, 0);
        // 1024 * 1_000_000 / 48_000 = 21_333
        assert_eq!(sync.clock(SynchronizeType::Audio).current_pts, 21_333);
    }

    #[test]
    fn test_audio_duration_from_bytes() {
        let (_clock, sync) = manual(SynchronizeType::Audio);
        // 4096 bytes of stereo S16 = 1024 samples
        sync.update_audio_by_bytes_size(4096, 48_000, 2, 16, 100_000);
        assert_eq!(sync.clock(SynchronizeType::Audio).current_pts, 121_333);
    }

    #[test]
    fn test_zero_rate_is_ignored() {
        let (_clock, sync) = manual(SynchronizeType::Audio);
        assert_eq!(sync.update_audio(1024, 0, 5), 0);
        assert_eq!(sync.update_audio_by_bytes_size(1024, 48_000, 0, 16, 5), 0);
        assert_eq!(sync.clock(SynchronizeType::Audio).current_pts, 0);
    }

    #[test]
    fn test_video_master_delay() {
        let (clock, sync) = manual(SynchronizeType::Video);
        clock.advance(Duration::from_millis(10));
        // Frame due at 40ms, 10ms elapsed -> 30ms early.
        assert_eq!(sync.update_video(40_000, 40_000), 30_000);
        clock.advance(Duration::from_millis(100));
        // Frame due at 80ms, 110ms elapsed -> 30ms late.
        assert_eq!(sync.update_video(80_000, 40_000), -30_000);
    }

    #[test]
    fn test_audio_master_delay_for_video() {
        let (_clock, sync) = manual(SynchronizeType::Audio);
        sync.update_audio(48_000, 48_000, 0); // audio at 1s
        assert_eq!(sync.update_video(900_000, 40_000), -100_000);
        assert_eq!(sync.master_time(), 1_000_000);
    }

    #[test]
    fn test_audio_master_without_audio_follows_wall_clock() {
        let (clock, sync) = manual(SynchronizeType::Audio);
        clock.advance(Duration::from_millis(100));
        assert_eq!(sync.master_time(), 100_000);
        assert_eq!(sync.update_video(100_000, 40_000), 0);
    }

    #[test]
    fn test_absolute_master_time() {
        let (clock, sync) = manual(SynchronizeType::Absolute);
        clock.advance(Duration::from_millis(250));
        assert_eq!(sync.master_time(), 250_000);
        assert_eq!(sync.master_clock().start_time, 1_000_000);
    }

    #[test]
    fn test_positions_never_go_backwards() {
        let (_clock, sync) = manual(SynchronizeType::Video);
        sync.update_video(80_000, 40_000);
        sync.update_video(40_000, 40_000);
        assert_eq!(sync.clock(SynchronizeType::Video).current_pts, 80_000);
        sync.set_clock_time(SynchronizeType::Video, 10);
        assert_eq!(sync.clock(SynchronizeType::Video).current_pts, 80_000);
    }

    #[test]
    fn test_pts_ratio() {
        let (_clock, sync) = manual(SynchronizeType::Video);
        sync.set_pts_ratio(0.5);
        sync.update_video(100_000, 0);
        assert_eq!(sync.clock(SynchronizeType::Video).current_pts, 50_000);
    }

    #[test]
    fn test_reset_reanchors() {
        let (clock, sync) = manual(SynchronizeType::Video);
        sync.update_video(500_000, 40_000);
        clock.advance(Duration::from_secs(3));
        sync.reset();

        let video = sync.clock(SynchronizeType::Video);
        assert_eq!(video.start_time, 4_000_000);
        assert_eq!(video.current_pts, 0);
        assert_eq!(sync.clock_time(&video), 0);
    }

    #[test]
    fn test_decide() {
        assert_eq!(Synchronizer::decide(0, 40_000), SyncAction::Emit);
        assert_eq!(Synchronizer::decide(-10_000, 40_000), SyncAction::Emit);
        assert_eq!(Synchronizer::decide(-50_000, 40_000), SyncAction::Drop);
        assert_eq!(
            Synchronizer::decide(20_000, 40_000),
            SyncAction::Hold(Duration::from_millis(20))
        );
        assert_eq!(
            Synchronizer::decide(5_000_000, 40_000),
            SyncAction::Hold(Duration::from_secs(1))
        );
        // Long frame durations widen the drop window.
        assert_eq!(Synchronizer::decide(-90_000, 100_000), SyncAction::Emit);
    }
}
