//! # Decode Stage - One Elementary Stream, One Thread
//!
//! Each selected stream gets a queue-fed worker:
//!
//! ```text
//!  demux ──PacketCmd──► [packet queue] ──► DecodeLoop ──Frame──► FrameSink
//!                        (producer limit)      │
//!                                         SoftLimit / Clock
//! ```
//!
//! A packet is submitted once; the frames it yields wait in `pending` until
//! their presentation time. While the next frame is early the loop returns
//! `Retry`, so the packet stays at the head of the queue and nothing new is
//! pulled. Once every pending frame is out the packet is popped.
//!
//! Admission uses the number of frames still alive anywhere (pending here or
//! held by the sink). A sustained backlog pushes the soft limit over, frames
//! get discarded and the codec is told to skip non-reference frames.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::codec::{DecoderContext, Discard, MediaKind, Packet, RawFrame, StreamInfo};
use crate::loop_control::LoopControl;
use crate::options::MediaOptions;
use crate::soft_limit::SoftLimit;
use crate::sync::{monotonic_us, Clock, DriftPolicy};
use crate::worker::{LiveController, TaskQueue, WorkerError};

// ============================================================================
// Frames
// ============================================================================

/// Keeps a stage's outstanding-frame count up while alive
#[derive(Debug)]
pub struct FrameTicket {
    counters: Arc<StageCounters>,
}

impl FrameTicket {
    fn issue(counters: &Arc<StageCounters>) -> Self {
        counters.frame_queue_length.fetch_add(1, Ordering::Relaxed);
        Self {
            counters: counters.clone(),
        }
    }
}

impl Drop for FrameTicket {
    fn drop(&mut self) {
        self.counters.frame_queue_length.fetch_sub(1, Ordering::Relaxed);
    }
}

/// A decoded frame on its way to presentation
#[derive(Debug)]
pub struct Frame {
    pub kind: MediaKind,
    pub stream_index: usize,
    /// Relative to the stream start (microseconds)
    pub pts_us: i64,
    pub duration_us: i64,
    /// Monotonic instant the frame is due, see [`monotonic_us`]
    pub presentation_us: i64,
    /// Resampling factor for audio drift, 1.0 for video
    pub rate_factor: f64,
    pub raw: RawFrame,
    _ticket: FrameTicket,
}

/// Receives admitted frames; dropping a frame releases it
pub trait FrameSink: Send + Sync {
    fn frame_finished(&self, frame: Frame);
}

/// Input of a decode stage
#[derive(Debug, Clone)]
pub enum PacketCmd {
    Data(Packet),
    /// Flush the codec and forward what it still holds
    Eof,
}

// ============================================================================
// Counters
// ============================================================================

#[derive(Debug, Default)]
pub struct StageCounters {
    packets_decoded: AtomicU64,
    frames_decoded: AtomicU64,
    frames_discarded: AtomicU64,
    frame_queue_length: AtomicU64,
}

impl StageCounters {
    pub fn snapshot(&self) -> StageStat {
        StageStat {
            packets_decoded: self.packets_decoded.load(Ordering::Relaxed),
            frames_decoded: self.frames_decoded.load(Ordering::Relaxed),
            frames_discarded: self.frames_discarded.load(Ordering::Relaxed),
            frame_queue_length: self.frame_queue_length.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of one stage's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageStat {
    pub packets_decoded: u64,
    pub frames_decoded: u64,
    pub frames_discarded: u64,
    /// Frames decoded but not yet released
    pub frame_queue_length: u64,
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct StageConfig {
    pub soft_limit: f64,
    pub alpha: f64,
    pub packet_queue_limit: usize,
    pub drift: DriftPolicy,
}

impl StageConfig {
    pub fn for_stream(kind: MediaKind, options: &MediaOptions) -> Self {
        let soft_limit = match kind {
            MediaKind::Video => options.video_soft_limit,
            MediaKind::Audio => options.audio_soft_limit,
        };
        Self {
            soft_limit,
            alpha: options.soft_limit_alpha,
            packet_queue_limit: options.packet_queue_limit,
            drift: options.drift,
        }
    }
}

// ============================================================================
// Decode Loop (runs on the stage thread)
// ============================================================================

struct DecodeLoop {
    stream: StreamInfo,
    codec: Box<dyn DecoderContext>,
    limit: SoftLimit,
    drift: DriftPolicy,
    discard: Discard,
    clock: Arc<Clock>,
    sink: Arc<dyn FrameSink>,
    counters: Arc<StageCounters>,
    /// Frames of the head packet not forwarded yet
    pending: VecDeque<Frame>,
    /// Head packet already went through the codec
    submitted: bool,
    /// Guess for frames without timestamps, in stream ticks
    next_pts: i64,
}

impl DecodeLoop {
    fn new(
        stream: StreamInfo,
        codec: Box<dyn DecoderContext>,
        clock: Arc<Clock>,
        sink: Arc<dyn FrameSink>,
        counters: Arc<StageCounters>,
        config: &StageConfig,
    ) -> Self {
        let next_pts = stream.start_pts.unwrap_or(0);
        Self {
            stream,
            codec,
            limit: SoftLimit::with_alpha(config.soft_limit, config.alpha),
            drift: config.drift,
            discard: Discard::Default,
            clock,
            sink,
            counters,
            pending: VecDeque::new(),
            submitted: false,
            next_pts,
        }
    }

    fn step(&mut self, cmd: PacketCmd) -> LoopControl {
        if !self.submitted {
            self.submit(&cmd);
            self.submitted = true;
        }

        while let Some(frame) = self.pending.front() {
            if !self.clock.is_realtime() {
                let delay = frame.presentation_us.saturating_sub(monotonic_us());
                if delay > 0 {
                    trace!(stream = self.stream.index, delay_us = delay, "Frame early");
                    return LoopControl::retry_after_us(delay);
                }
            }
            if let Some(frame) = self.pending.pop_front() {
                self.admit(frame);
            }
        }

        self.submitted = false;
        LoopControl::continue_now()
    }

    fn submit(&mut self, cmd: &PacketCmd) {
        let submitted = match cmd {
            PacketCmd::Data(packet) => {
                self.counters.packets_decoded.fetch_add(1, Ordering::Relaxed);
                self.codec.submit(packet)
            }
            PacketCmd::Eof => {
                debug!(stream = self.stream.index, "Flushing {} decoder", self.codec.name());
                self.codec.submit_eof()
            }
        };
        if let Err(e) = submitted {
            warn!(stream = self.stream.index, "Decoder rejected input: {}", e);
        }

        loop {
            match self.codec.receive() {
                Ok(Some(raw)) => {
                    self.counters.frames_decoded.fetch_add(1, Ordering::Relaxed);
                    let frame = self.wrap(raw);
                    self.pending.push_back(frame);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(stream = self.stream.index, "Decode failed: {}", e);
                    break;
                }
            }
        }
    }

    /// Attach timing and a ticket to a codec frame
    fn wrap(&mut self, raw: RawFrame) -> Frame {
        let ticks = raw.pts.or(raw.dts).unwrap_or(self.next_pts);
        let duration = raw
            .duration
            .saturating_add((raw.repeat_pict as i64).saturating_mul(raw.duration) / 2);
        self.next_pts = ticks.saturating_add(duration.max(0));

        let time_base = self.stream.time_base;
        let pts_us = time_base.to_us(ticks).saturating_sub(self.stream.start_us());
        let presentation_us = self.clock.presentation_us(pts_us);
        self.clock.advance(presentation_us);
        Frame {
            kind: self.stream.kind,
            stream_index: self.stream.index,
            pts_us,
            duration_us: time_base.to_us(duration),
            presentation_us,
            rate_factor: 1.0,
            raw,
            _ticket: FrameTicket::issue(&self.counters),
        }
    }

    fn admit(&mut self, mut frame: Frame) {
        let backlog = self.counters.frame_queue_length.load(Ordering::Relaxed) as f64;
        if self.limit.add_value(backlog) {
            self.set_discard(Discard::Default);
            if frame.kind == MediaKind::Audio {
                frame.rate_factor = self.drift.factor(frame.presentation_us, monotonic_us());
            }
            self.clock.update(frame.presentation_us);
            self.sink.frame_finished(frame);
        } else {
            self.counters.frames_discarded.fetch_add(1, Ordering::Relaxed);
            debug!(
                stream = self.stream.index,
                pts_us = frame.pts_us,
                average = self.limit.average(),
                "Backlog over soft limit, frame discarded"
            );
            self.set_discard(Discard::NonReference);
        }
    }

    fn set_discard(&mut self, discard: Discard) {
        if self.discard != discard {
            debug!(stream = self.stream.index, ?discard, "Codec discard policy changed");
            self.discard = discard;
            self.codec.set_discard(discard);
        }
    }
}

// ============================================================================
// Decode Stage
// ============================================================================

/// A running decode loop plus its packet queue and counters
pub struct DecodeStage {
    stream: StreamInfo,
    counters: Arc<StageCounters>,
    tasks: TaskQueue<PacketCmd>,
    worker: LiveController,
}

impl DecodeStage {
    pub fn spawn(
        stream: StreamInfo,
        codec: Box<dyn DecoderContext>,
        clock: Arc<Clock>,
        sink: Arc<dyn FrameSink>,
        config: StageConfig,
    ) -> Result<Self, WorkerError> {
        let counters = Arc::new(StageCounters::default());
        let tasks = TaskQueue::with_producer_limit(config.packet_queue_limit);
        let name = format!("decode-{}-{}", stream.kind, stream.index);

        debug!(
            stream = stream.index,
            codec = codec.name(),
            soft_limit = config.soft_limit,
            "Starting decode stage"
        );

        let mut decode = DecodeLoop::new(
            stream.clone(),
            codec,
            clock,
            sink,
            counters.clone(),
            &config,
        );
        let worker = tasks.spawn(name, move |cmd| decode.step(cmd))?;

        Ok(Self {
            stream,
            counters,
            tasks,
            worker,
        })
    }

    pub fn stream(&self) -> &StreamInfo {
        &self.stream
    }

    pub fn kind(&self) -> MediaKind {
        self.stream.kind
    }

    pub fn index(&self) -> usize {
        self.stream.index
    }

    /// Queue input, blocking while the packet queue is full.
    ///
    /// Input for a stage whose loop has ended is dropped.
    pub fn push(&self, cmd: PacketCmd) {
        if !self.worker.is_running() {
            trace!(stream = self.stream.index, "Stage stopped, input dropped");
            return;
        }
        self.tasks.push(cmd);
    }

    pub fn queued(&self) -> usize {
        self.tasks.len()
    }

    /// Block until every queued packet went through, or the stage stopped
    pub fn wait_for_empty(&self) {
        self.tasks.queue().wait_for_empty();
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    /// Stop the loop and drop queued packets, waking a blocked producer
    pub fn request_interrupt(&self, wait: bool) {
        self.worker.request_interrupt(wait);
        self.tasks.queue().clear();
    }

    pub fn stat(&self) -> StageStat {
        self.counters.snapshot()
    }
}
