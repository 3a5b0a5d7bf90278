//! End-to-end playback of scripted sources through the full pipeline.

use avpipe_core::synthetic::{SyntheticService, SyntheticSource};
use avpipe_core::{
    Demuxer, Frame, FrameSink, MediaKind, MediaOptions, MediaStatus, PlaybackState, StatusSink,
};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Default)]
struct CollectingSink {
    frames: Mutex<Vec<(MediaKind, i64)>>,
}

impl FrameSink for CollectingSink {
    fn frame_finished(&self, frame: Frame) {
        self.frames.lock().push((frame.kind, frame.pts_us));
    }
}

impl CollectingSink {
    fn pts_of(&self, kind: MediaKind) -> Vec<i64> {
        self.frames
            .lock()
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, pts)| *pts)
            .collect()
    }
}

/// Records transitions and lets the test wait for the final `Stopped`
#[derive(Default)]
struct StatusProbe {
    state: Mutex<(Vec<PlaybackState>, Vec<MediaStatus>)>,
    changed: Condvar,
}

impl StatusSink for StatusProbe {
    fn playback_state_changed(&self, state: PlaybackState) {
        self.state.lock().0.push(state);
        self.changed.notify_all();
    }

    fn media_status_changed(&self, status: MediaStatus) {
        self.state.lock().1.push(status);
        self.changed.notify_all();
    }
}

impl StatusProbe {
    /// Wait until playback went Playing and back to Stopped
    fn wait_stopped(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            let played = state.0.contains(&PlaybackState::Playing);
            if played && state.0.last() == Some(&PlaybackState::Stopped) {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            self.changed.wait_for(&mut state, remaining);
        }
    }
}

#[test]
fn test_alternating_packets_play_to_end() {
    let frames = Arc::new(CollectingSink::default());
    let status = Arc::new(StatusProbe::default());
    let source = SyntheticSource::alternating(6, 4, Duration::from_millis(10));
    let demuxer = Demuxer::new(
        Arc::new(SyntheticService::with_source(source)),
        frames.clone(),
        status.clone(),
    );

    demuxer.load("file:///media/alternating.synthetic", MediaOptions::default());
    demuxer.start();
    assert!(status.wait_stopped(Duration::from_secs(5)));

    let video: Vec<i64> = (0..6).map(|n| n * 10_000).collect();
    let audio: Vec<i64> = (0..4).map(|n| n * 10_000).collect();
    assert_eq!(frames.pts_of(MediaKind::Video), video);
    assert_eq!(frames.pts_of(MediaKind::Audio), audio);

    let stat = demuxer.stat();
    assert_eq!(stat.packets_decoded(), 10);
    assert_eq!(stat.frames_discarded(), 0);
    assert_eq!(stat.video.map(|v| v.packets_decoded), Some(6));
    assert_eq!(stat.audio.map(|a| a.packets_decoded), Some(4));

    assert_eq!(demuxer.playback_state(), PlaybackState::Stopped);
    assert_eq!(demuxer.media_status(), MediaStatus::EndOfMedia);

    let state = status.state.lock();
    assert_eq!(
        state.1,
        vec![
            MediaStatus::Loading,
            MediaStatus::Loaded,
            MediaStatus::Buffered,
            MediaStatus::EndOfMedia,
        ]
    );
}

#[test]
fn test_local_playback_is_paced() {
    let frames = Arc::new(CollectingSink::default());
    let status = Arc::new(StatusProbe::default());
    let source = SyntheticSource::alternating(5, 0, Duration::from_millis(40));
    let demuxer = Demuxer::new(
        Arc::new(SyntheticService::with_source(source)),
        frames.clone(),
        status.clone(),
    );

    let started = Instant::now();
    demuxer.load("/media/paced.mkv", MediaOptions::default());
    demuxer.start();
    assert!(status.wait_stopped(Duration::from_secs(5)));

    // last frame is due 160ms after the first
    assert!(started.elapsed() >= Duration::from_millis(150));
    assert_eq!(frames.pts_of(MediaKind::Video).len(), 5);
}

#[test]
fn test_realtime_source_is_not_paced() {
    let frames = Arc::new(CollectingSink::default());
    let status = Arc::new(StatusProbe::default());
    let source = SyntheticSource::alternating(10, 10, Duration::from_secs(1));
    let demuxer = Demuxer::new(
        Arc::new(SyntheticService::with_source(source)),
        frames.clone(),
        status.clone(),
    );

    let started = Instant::now();
    demuxer.load("rtsp://camera.local/live", MediaOptions::default());
    demuxer.start();
    assert!(status.wait_stopped(Duration::from_secs(5)));

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(demuxer.stat().packets_decoded(), 20);
}

#[test]
fn test_teardown_during_paced_playback() {
    let frames = Arc::new(CollectingSink::default());
    let status = Arc::new(StatusProbe::default());
    // ten minutes of content at 1s per packet
    let source = SyntheticSource::alternating(600, 600, Duration::from_secs(1));
    let demuxer = Demuxer::new(
        Arc::new(SyntheticService::with_source(source)),
        frames.clone(),
        status.clone(),
    );

    demuxer.load("/media/long.mp4", MediaOptions::default());
    demuxer.start();
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(demuxer.playback_state(), PlaybackState::Playing);

    let started = Instant::now();
    drop(demuxer);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(status.wait_stopped(Duration::from_millis(10)));
    assert!(frames.frames.lock().len() < 10);
}

#[test]
fn test_url_described_source() {
    let frames = Arc::new(CollectingSink::default());
    let status = Arc::new(StatusProbe::default());
    let demuxer = Demuxer::new(
        Arc::new(SyntheticService::new()),
        frames.clone(),
        status.clone(),
    );

    demuxer.load(
        "synthetic://demo?video=4&audio=2&interval_ms=5&frames_per_packet=2",
        MediaOptions::default(),
    );
    demuxer.start();
    assert!(status.wait_stopped(Duration::from_secs(5)));

    let stat = demuxer.stat();
    assert_eq!(stat.video.map(|v| v.frames_decoded), Some(8));
    assert_eq!(stat.audio.map(|a| a.frames_decoded), Some(4));
    assert_eq!(demuxer.media_status(), MediaStatus::EndOfMedia);
}
