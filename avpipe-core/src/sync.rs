//! Audio/Video Synchronization
//!
//! One wall clock shared by every stream of a media. Each decode stage maps
//! frame timestamps onto it:
//!
//! ```text
//! presentation_us = clock.start_us + (frame_pts_us - stream_start_pts_us)
//! ```
//!
//! Non-real-time sources wait for that instant; real-time sources are
//! forwarded as they arrive. Audio drift is absorbed by nudging the
//! resampling rate within a small band.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Instant;
use url::Url;

/// Process-wide monotonic origin for every clock reading
static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

const UNSET: i64 = i64::MIN;

/// Microseconds on the process-wide monotonic clock
pub fn monotonic_us() -> i64 {
    EPOCH.elapsed().as_micros() as i64
}

/// Schemes of live network sources that are never paced locally
const REALTIME_SCHEMES: &[&str] = &["rtp", "srtp", "rtsp", "udp"];

/// Whether `source` names a live network stream.
///
/// Anything that does not parse as a URL is treated as a local file.
pub fn is_realtime_source(source: &str) -> bool {
    match Url::parse(source) {
        Ok(url) => {
            let scheme = url.scheme();
            REALTIME_SCHEMES.contains(&scheme) || scheme.starts_with("rtmp")
        }
        Err(_) => false,
    }
}

// ============================================================================
// Clock
// ============================================================================

/// Shared presentation clock
#[derive(Debug)]
pub struct Clock {
    /// Latched on first use
    start_us: AtomicI64,
    realtime: AtomicBool,
    /// Presentation time of the most recently forwarded frame
    last_pts_us: AtomicI64,
    /// Latest presentation time handed to decoding (packets queued, frames decoded)
    decoded_us: AtomicI64,
}

impl Default for Clock {
    fn default() -> Self {
        Self::new(false)
    }
}

impl Clock {
    pub fn new(realtime: bool) -> Self {
        Self {
            start_us: AtomicI64::new(UNSET),
            realtime: AtomicBool::new(realtime),
            last_pts_us: AtomicI64::new(UNSET),
            decoded_us: AtomicI64::new(UNSET),
        }
    }

    /// Start time, latching the current instant if nobody has yet
    pub fn start_us(&self) -> i64 {
        let current = self.start_us.load(Ordering::Acquire);
        if current != UNSET {
            return current;
        }
        let now = monotonic_us();
        match self
            .start_us
            .compare_exchange(UNSET, now, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => now,
            Err(latched) => latched,
        }
    }

    pub fn is_started(&self) -> bool {
        self.start_us.load(Ordering::Acquire) != UNSET
    }

    pub fn is_realtime(&self) -> bool {
        self.realtime.load(Ordering::Acquire)
    }

    /// Wall-clock instant a frame `offset_us` into its stream is due
    pub fn presentation_us(&self, offset_us: i64) -> i64 {
        self.start_us().saturating_add(offset_us)
    }

    pub fn update(&self, presentation_us: i64) {
        self.last_pts_us.store(presentation_us, Ordering::Release);
    }

    pub fn last_pts_us(&self) -> Option<i64> {
        match self.last_pts_us.load(Ordering::Acquire) {
            UNSET => None,
            v => Some(v),
        }
    }

    /// Move the decode clock forward; older timestamps are ignored
    pub fn advance(&self, presentation_us: i64) {
        self.decoded_us.fetch_max(presentation_us, Ordering::AcqRel);
    }

    pub fn decoded_us(&self) -> Option<i64> {
        match self.decoded_us.load(Ordering::Acquire) {
            UNSET => None,
            v => Some(v),
        }
    }

    /// How far decoding runs ahead of now (0 when behind or not started)
    pub fn lead_us(&self) -> i64 {
        self.decoded_us()
            .map(|pts| pts.saturating_sub(monotonic_us()).max(0))
            .unwrap_or(0)
    }
}

// ============================================================================
// Audio Drift Compensation
// ============================================================================

/// Resampling nudge applied to audio that drifts from the clock
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftPolicy {
    /// Maximum rate change, as a fraction (0.02 = ±2%)
    pub max_adjust: f64,
    /// Drift tolerated before any adjustment (microseconds)
    pub threshold_us: i64,
}

impl Default for DriftPolicy {
    fn default() -> Self {
        Self {
            max_adjust: 0.02,
            threshold_us: 40_000,
        }
    }
}

impl DriftPolicy {
    /// Resampling factor for audio due at `presentation_us` and handed over at `now_us`.
    ///
    /// Late audio is shortened (factor below 1), early audio stretched.
    pub fn factor(&self, presentation_us: i64, now_us: i64) -> f64 {
        let drift = presentation_us.saturating_sub(now_us);
        if drift.saturating_abs() <= self.threshold_us {
            1.0
        } else if drift < 0 {
            1.0 - self.max_adjust
        } else {
            1.0 + self.max_adjust
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_realtime_detection() {
        assert!(is_realtime_source("rtsp://camera.local/stream"));
        assert!(is_realtime_source("rtmps://live.example.com/app"));
        assert!(is_realtime_source("udp://239.0.0.1:1234"));
        assert!(is_realtime_source("srtp://10.0.0.2:5004"));
        assert!(!is_realtime_source("http://example.com/movie.mp4"));
        assert!(!is_realtime_source("/home/user/movie.mkv"));
        assert!(!is_realtime_source("movie.mkv"));
        assert!(!is_realtime_source(""));
    }

    #[test]
    fn test_start_latches_once() {
        let clock = Arc::new(Clock::new(false));
        assert!(!clock.is_started());

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let clock = clock.clone();
                thread::spawn(move || clock.start_us())
            })
            .collect();
        let starts: Vec<i64> = readers.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(starts.windows(2).all(|w| w[0] == w[1]));
        thread::sleep(Duration::from_millis(2));
        assert_eq!(clock.start_us(), starts[0]);
    }

    #[test]
    fn test_presentation_offsets() {
        let clock = Clock::new(false);
        let start = clock.start_us();
        assert_eq!(clock.presentation_us(40_000), start + 40_000);
    }

    #[test]
    fn test_lead_follows_decode_clock() {
        let clock = Clock::new(false);
        assert_eq!(clock.decoded_us(), None);
        assert_eq!(clock.lead_us(), 0);

        // forwarding alone does not move the decode clock
        clock.update(monotonic_us() + 500_000);
        assert_eq!(clock.last_pts_us().map(|v| v > 0), Some(true));
        assert_eq!(clock.lead_us(), 0);

        clock.advance(monotonic_us() + 500_000);
        assert!(clock.lead_us() > 400_000);

        // never moves backwards
        clock.advance(monotonic_us() - 500_000);
        assert!(clock.lead_us() > 400_000);
    }

    #[test]
    fn test_drift_policy() {
        let policy = DriftPolicy::default();
        let now = 1_000_000;
        assert_eq!(policy.factor(now + 10_000, now), 1.0);
        assert!((policy.factor(now - 100_000, now) - 0.98).abs() < 1e-12);
        assert!((policy.factor(now + 100_000, now) - 1.02).abs() < 1e-12);
    }
}
