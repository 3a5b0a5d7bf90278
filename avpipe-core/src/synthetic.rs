//! Synthetic container service.
//!
//! In-memory stand-in for a real codec library: streams and packets are
//! described up front (or through URL query parameters) and every packet
//! decodes into a fixed number of frames carrying the packet's timing.
//! Read delays, read failures and broken decoders can be scripted to drive
//! the pipeline through its error paths.
//!
//! ```text
//! synthetic://demo?video=50&audio=50&interval_ms=40&read_delay_ms=0&fail_at=30
//! ```

use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use url::Url;

use crate::codec::{
    CodecError, Container, ContainerService, DecoderContext, Discard, IoInterrupt, MediaKind,
    Packet, Rational, RawFrame, StreamInfo,
};
use crate::options::MediaOptions;

/// Format name accepted through the `f` option
pub const FORMAT_NAME: &str = "synthetic";

// ============================================================================
// Source Description
// ============================================================================

/// Scripted media content
#[derive(Debug, Clone)]
pub struct SyntheticSource {
    pub streams: Vec<StreamInfo>,
    pub packets: Vec<Packet>,
    /// Simulated blocking time of each read
    pub read_delay: Duration,
    /// Packet position at which a read error is reported instead
    pub fail_at: Option<usize>,
    /// Streams whose decoder refuses to open
    pub broken_decoders: Vec<usize>,
    pub frames_per_packet: usize,
}

impl Default for SyntheticSource {
    fn default() -> Self {
        Self {
            streams: Vec::new(),
            packets: Vec::new(),
            read_delay: Duration::ZERO,
            fail_at: None,
            broken_decoders: Vec::new(),
            frames_per_packet: 1,
        }
    }
}

impl SyntheticSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a stream in millisecond ticks starting at zero
    pub fn with_stream(mut self, kind: MediaKind) -> Self {
        let index = self.streams.len();
        self.streams.push(StreamInfo {
            index,
            kind,
            time_base: Rational::new(1, 1000),
            start_pts: Some(0),
            codec: format!("synthetic-{kind}"),
        });
        self
    }

    pub fn with_packet(mut self, stream_index: usize, pts_ms: i64, duration_ms: i64) -> Self {
        let sequence = self.packets.len();
        self.packets.push(Packet {
            stream_index,
            pts: Some(pts_ms),
            dts: Some(pts_ms),
            duration: duration_ms,
            keyframe: true,
            data: Bytes::from(format!("packet-{sequence}")),
        });
        self
    }

    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = delay;
        self
    }

    pub fn with_read_failure(mut self, at: usize) -> Self {
        self.fail_at = Some(at);
        self
    }

    pub fn with_broken_decoder(mut self, stream_index: usize) -> Self {
        self.broken_decoders.push(stream_index);
        self
    }

    pub fn with_frames_per_packet(mut self, frames: usize) -> Self {
        self.frames_per_packet = frames.max(1);
        self
    }

    /// Video on stream 0, audio on stream 1, packets interleaved V A V A ...
    /// until one side runs out. Video packets are keyframes every fourth.
    pub fn alternating(video: usize, audio: usize, interval: Duration) -> Self {
        let mut source = Self::new();
        let mut video_index = None;
        let mut audio_index = None;
        if video > 0 {
            video_index = Some(source.streams.len());
            source = source.with_stream(MediaKind::Video);
        }
        if audio > 0 {
            audio_index = Some(source.streams.len());
            source = source.with_stream(MediaKind::Audio);
        }

        let step = interval.as_millis() as i64;
        for n in 0..video.max(audio) {
            let pts = n as i64 * step;
            if let Some(index) = video_index.filter(|_| n < video) {
                source = source.with_packet(index, pts, step);
                if let Some(packet) = source.packets.last_mut() {
                    packet.keyframe = n % 4 == 0;
                }
            }
            if let Some(index) = audio_index.filter(|_| n < audio) {
                source = source.with_packet(index, pts, step);
            }
        }
        source
    }

    /// Parse `video`, `audio`, `interval_ms`, `read_delay_ms`, `fail_at`,
    /// `frames_per_packet` and `broken` from the query string
    pub fn from_url(url: &Url) -> Result<Self, CodecError> {
        let mut video = 50usize;
        let mut audio = 50usize;
        let mut interval_ms = 40u64;
        let mut read_delay_ms = 0u64;
        let mut fail_at = None;
        let mut frames_per_packet = 1usize;
        let mut broken = Vec::new();

        for (key, value) in url.query_pairs() {
            let bad = || CodecError::Open {
                source_name: url.to_string(),
                reason: format!("bad query parameter {key}={value}"),
            };
            match key.as_ref() {
                "video" => video = value.parse().map_err(|_| bad())?,
                "audio" => audio = value.parse().map_err(|_| bad())?,
                "interval_ms" => interval_ms = value.parse().map_err(|_| bad())?,
                "read_delay_ms" => read_delay_ms = value.parse().map_err(|_| bad())?,
                "fail_at" => fail_at = Some(value.parse().map_err(|_| bad())?),
                "frames_per_packet" => frames_per_packet = value.parse().map_err(|_| bad())?,
                "broken" => broken.push(value.parse().map_err(|_| bad())?),
                _ => {}
            }
        }

        let mut source = Self::alternating(video, audio, Duration::from_millis(interval_ms))
            .with_read_delay(Duration::from_millis(read_delay_ms))
            .with_frames_per_packet(frames_per_packet);
        source.fail_at = fail_at;
        source.broken_decoders = broken;
        Ok(source)
    }
}

// ============================================================================
// Service
// ============================================================================

/// Opens synthetic sources, either one fixed script or URL-described ones
#[derive(Debug, Clone, Default)]
pub struct SyntheticService {
    fixed: Option<SyntheticSource>,
}

impl SyntheticService {
    /// Every source is described by its URL query
    pub fn new() -> Self {
        Self::default()
    }

    /// Every source opens to `source`, whatever its name
    pub fn with_source(source: SyntheticSource) -> Self {
        Self {
            fixed: Some(source),
        }
    }
}

impl ContainerService for SyntheticService {
    fn open(
        &self,
        source: &str,
        options: &MediaOptions,
        interrupt: Arc<IoInterrupt>,
    ) -> Result<Box<dyn Container>, CodecError> {
        interrupt.check()?;

        if let Some(format) = options.input_format.as_deref() {
            if format != FORMAT_NAME {
                return Err(CodecError::Open {
                    source_name: source.to_string(),
                    reason: format!("unknown input format {format:?}"),
                });
            }
        }

        let script = match &self.fixed {
            Some(script) => script.clone(),
            None => {
                let url = Url::parse(source).map_err(|e| CodecError::Open {
                    source_name: source.to_string(),
                    reason: e.to_string(),
                })?;
                SyntheticSource::from_url(&url)?
            }
        };

        if script.streams.is_empty() {
            return Err(CodecError::StreamInfo(format!("{source} has no streams")));
        }

        Ok(Box::new(SyntheticContainer {
            script,
            cursor: 0,
            interrupt,
        }))
    }

    fn name(&self) -> &str {
        FORMAT_NAME
    }
}

// ============================================================================
// Container
// ============================================================================

struct SyntheticContainer {
    script: SyntheticSource,
    cursor: usize,
    interrupt: Arc<IoInterrupt>,
}

impl SyntheticContainer {
    /// Simulate blocking I/O, polling the interrupt every millisecond
    fn block_for(&self, delay: Duration) -> Result<(), CodecError> {
        let deadline = Instant::now() + delay;
        loop {
            self.interrupt.check()?;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(());
            }
            thread::sleep(remaining.min(Duration::from_millis(1)));
        }
    }
}

impl Container for SyntheticContainer {
    fn streams(&self) -> &[StreamInfo] {
        &self.script.streams
    }

    fn read_packet(&mut self) -> Result<Option<Packet>, CodecError> {
        if self.cursor >= self.script.packets.len() {
            return Ok(None);
        }
        self.block_for(self.script.read_delay)?;

        let position = self.cursor;
        self.cursor += 1;
        if self.script.fail_at == Some(position) {
            return Err(CodecError::Read(format!("scripted failure at packet {position}")));
        }
        Ok(Some(self.script.packets[position].clone()))
    }

    fn open_decoder(&self, stream: &StreamInfo) -> Result<Box<dyn DecoderContext>, CodecError> {
        if self.script.broken_decoders.contains(&stream.index) {
            return Err(CodecError::NoDecoder {
                stream: stream.index,
                codec: stream.codec.clone(),
            });
        }
        Ok(Box::new(SyntheticDecoder::new(
            stream.codec.clone(),
            self.script.frames_per_packet,
        )))
    }
}

// ============================================================================
// Decoder
// ============================================================================

/// Turns each packet into `frames_per_packet` frames sharing its timing
pub struct SyntheticDecoder {
    name: String,
    frames_per_packet: usize,
    pending: VecDeque<RawFrame>,
    discard: Discard,
    eof: bool,
}

impl SyntheticDecoder {
    pub fn new(name: impl Into<String>, frames_per_packet: usize) -> Self {
        Self {
            name: name.into(),
            frames_per_packet: frames_per_packet.max(1),
            pending: VecDeque::new(),
            discard: Discard::Default,
            eof: false,
        }
    }

    pub fn discard(&self) -> Discard {
        self.discard
    }
}

impl DecoderContext for SyntheticDecoder {
    fn submit(&mut self, packet: &Packet) -> Result<(), CodecError> {
        if self.eof {
            return Err(CodecError::Decode("packet submitted after end of stream".into()));
        }
        if self.discard == Discard::NonReference && !packet.keyframe {
            return Ok(());
        }

        let count = self.frames_per_packet as i64;
        let slice = packet.duration / count;
        for k in 0..count {
            self.pending.push_back(RawFrame {
                pts: packet.pts.map(|p| p + k * slice),
                dts: packet.dts.map(|d| d + k * slice),
                duration: slice,
                repeat_pict: 0,
                keyframe: packet.keyframe && k == 0,
                data: packet.data.clone(),
            });
        }
        Ok(())
    }

    fn submit_eof(&mut self) -> Result<(), CodecError> {
        self.eof = true;
        Ok(())
    }

    fn receive(&mut self) -> Result<Option<RawFrame>, CodecError> {
        Ok(self.pending.pop_front())
    }

    fn set_discard(&mut self, discard: Discard) {
        self.discard = discard;
    }

    fn name(&self) -> &str {
        &self.name
    }
}
