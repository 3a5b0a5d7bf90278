//! # Codec Boundary
//!
//! The container/codec service is opaque to the pipeline. Anything that can
//! open a source, hand out compressed packets and turn them back into frames
//! plugs in here:
//!
//! ```text
//! ContainerService ──open──► Container ──read_packet──► Packet
//!                                │
//!                          open_decoder
//!                                ▼
//!                         DecoderContext ──submit/receive──► RawFrame
//! ```

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::options::MediaOptions;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Failed to open {source_name}: {reason}")]
    Open { source_name: String, reason: String },
    #[error("Failed to read stream information: {0}")]
    StreamInfo(String),
    #[error("No decoder available for stream {stream} ({codec})")]
    NoDecoder { stream: usize, codec: String },
    #[error("Decode failed: {0}")]
    Decode(String),
    #[error("Read failed: {0}")]
    Read(String),
    #[error("I/O interrupted")]
    Interrupted,
    #[error("I/O timed out after {0:?}")]
    TimedOut(Duration),
}

// ============================================================================
// Stream Description
// ============================================================================

/// Elementary stream kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Video => f.write_str("video"),
            Self::Audio => f.write_str("audio"),
        }
    }
}

/// Stream time base (seconds per tick = num / den)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rational {
    pub num: i32,
    pub den: i32,
}

impl Rational {
    pub const MICROS: Rational = Rational::new(1, 1_000_000);

    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    /// Rescale a tick count to microseconds
    pub fn to_us(&self, ticks: i64) -> i64 {
        if self.den == 0 {
            return 0;
        }
        let us = ticks as i128 * self.num as i128 * 1_000_000 / self.den as i128;
        us.clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }
}

/// One elementary stream in a container
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub index: usize,
    pub kind: MediaKind,
    pub time_base: Rational,
    /// First timestamp of the stream, in `time_base` ticks
    pub start_pts: Option<i64>,
    pub codec: String,
}

impl StreamInfo {
    pub fn start_us(&self) -> i64 {
        self.start_pts.map(|p| self.time_base.to_us(p)).unwrap_or(0)
    }
}

// ============================================================================
// Packets and Frames
// ============================================================================

/// Compressed packet as read from the container
#[derive(Debug, Clone)]
pub struct Packet {
    pub stream_index: usize,
    /// Timestamps in the stream's time base
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub duration: i64,
    pub keyframe: bool,
    pub data: Bytes,
}

/// Decoded frame as produced by the codec, before timing is attached
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Timestamps in the stream's time base
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub duration: i64,
    /// Extra half-frame periods the frame should be shown for
    pub repeat_pict: u32,
    pub keyframe: bool,
    pub data: Bytes,
}

/// Which frames the codec may skip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Discard {
    /// Decode everything
    #[default]
    Default,
    /// Skip frames no other frame references
    NonReference,
}

// ============================================================================
// I/O Interrupt
// ============================================================================

/// Polling predicate consulted by blocking container I/O.
///
/// The timer is armed around each call so the timeout bounds a single
/// operation, not the whole playback.
#[derive(Debug)]
pub struct IoInterrupt {
    requested: AtomicBool,
    armed_at: Mutex<Option<Instant>>,
    timeout: Duration,
}

impl IoInterrupt {
    pub fn new(timeout: Duration) -> Self {
        Self {
            requested: AtomicBool::new(false),
            armed_at: Mutex::new(None),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn start_timer(&self) {
        *self.armed_at.lock() = Some(Instant::now());
    }

    pub fn stop_timer(&self) {
        *self.armed_at.lock() = None;
    }

    /// Abort any blocking I/O from now on
    pub fn request(&self) {
        self.requested.store(true, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Why the current operation should give up, if it should
    pub fn check(&self) -> Result<(), CodecError> {
        if self.is_requested() {
            return Err(CodecError::Interrupted);
        }
        match *self.armed_at.lock() {
            Some(at) if !self.timeout.is_zero() && at.elapsed() > self.timeout => {
                Err(CodecError::TimedOut(self.timeout))
            }
            _ => Ok(()),
        }
    }

    pub fn should_interrupt(&self) -> bool {
        self.check().is_err()
    }
}

// ============================================================================
// Service Traits
// ============================================================================

/// Opens sources
pub trait ContainerService: Send + Sync {
    fn open(
        &self,
        source: &str,
        options: &MediaOptions,
        interrupt: Arc<IoInterrupt>,
    ) -> Result<Box<dyn Container>, CodecError>;

    fn name(&self) -> &str;
}

/// An opened source, owned by the demux loop
pub trait Container: Send {
    fn streams(&self) -> &[StreamInfo];

    /// Next packet; `Ok(None)` at end of media
    fn read_packet(&mut self) -> Result<Option<Packet>, CodecError>;

    fn open_decoder(&self, stream: &StreamInfo) -> Result<Box<dyn DecoderContext>, CodecError>;
}

/// A codec context, owned by one decode stage
pub trait DecoderContext: Send {
    fn submit(&mut self, packet: &Packet) -> Result<(), CodecError>;

    /// Signal end of stream so buffered frames get flushed
    fn submit_eof(&mut self) -> Result<(), CodecError>;

    /// Next frame; `Ok(None)` when the codec needs more input or is drained
    fn receive(&mut self) -> Result<Option<RawFrame>, CodecError>;

    fn set_discard(&mut self, discard: Discard);

    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_rescale() {
        let tb = Rational::new(1, 90_000);
        assert_eq!(tb.to_us(90_000), 1_000_000);
        assert_eq!(tb.to_us(3_600), 40_000);
        assert_eq!(Rational::new(1, 1000).to_us(-5), -5_000);
        assert_eq!(Rational::new(1, 0).to_us(10), 0);
        assert_eq!(Rational::MICROS.to_us(123), 123);
    }

    #[test]
    fn test_stream_start() {
        let stream = StreamInfo {
            index: 0,
            kind: MediaKind::Video,
            time_base: Rational::new(1, 1000),
            start_pts: Some(250),
            codec: "h264".into(),
        };
        assert_eq!(stream.start_us(), 250_000);
    }

    #[test]
    fn test_interrupt_request() {
        let interrupt = IoInterrupt::new(Duration::from_secs(10));
        assert!(!interrupt.should_interrupt());
        interrupt.request();
        assert!(matches!(interrupt.check(), Err(CodecError::Interrupted)));
    }

    #[test]
    fn test_interrupt_timeout_per_call() {
        let interrupt = IoInterrupt::new(Duration::from_millis(10));
        // not armed: never times out
        thread::sleep(Duration::from_millis(15));
        assert!(!interrupt.should_interrupt());

        interrupt.start_timer();
        assert!(!interrupt.should_interrupt());
        thread::sleep(Duration::from_millis(15));
        assert!(matches!(interrupt.check(), Err(CodecError::TimedOut(_))));

        interrupt.stop_timer();
        assert!(!interrupt.should_interrupt());
    }
}
