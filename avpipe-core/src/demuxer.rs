//! # Demuxer - Pipeline Scheduler
//!
//! Owns the whole playback of one source:
//!
//! ```text
//!   load() ──► [loader]  open container, pick streams, spawn decode stages
//!                  │ LoadedMedia (result queue)
//!   start() ─► [demux loop] ──packets──► [decode video] ──┐
//!                          └─packets──► [decode audio] ──┴──► FrameSink
//! ```
//!
//! ## State machine
//!
//! ```text
//! Unknown ─load─► Loading ─► Loaded ─start─► Buffered (Playing)
//!    │               └─► Invalid              ├─► EndOfMedia (Stopped)
//!    └─(empty)─► NoMedia                      └─► Stalled    (Stopped)
//! ```
//!
//! Every stage is interrupted and joined before `Stopped` is reported.

use parking_lot::{Mutex, ReentrantMutex};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::codec::{Container, ContainerService, IoInterrupt, MediaKind};
use crate::decoder::{DecodeStage, FrameSink, PacketCmd, StageConfig, StageStat};
use crate::loop_control::LoopControl;
use crate::options::MediaOptions;
use crate::sync::{is_realtime_source, Clock};
use crate::worker::{LiveController, Worker};

/// Sleep after a packet of a stream nobody decodes
const UNKNOWN_STREAM_YIELD: Duration = Duration::from_micros(1);

// ============================================================================
// Status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PlaybackState {
    Stopped,
    Playing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MediaStatus {
    /// Nothing requested yet
    Unknown,
    NoMedia,
    Loading,
    Loaded,
    Buffered,
    EndOfMedia,
    /// Reading failed mid-playback
    Stalled,
    /// Source could not be opened or has nothing decodable
    Invalid,
}

/// Receives state transitions, in order, each one once
pub trait StatusSink: Send + Sync {
    fn playback_state_changed(&self, _state: PlaybackState) {}

    fn media_status_changed(&self, _status: MediaStatus) {}
}

/// Ignores every transition
pub struct NullStatusSink;

impl StatusSink for NullStatusSink {}

/// Counters of every running stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stat {
    pub video: Option<StageStat>,
    pub audio: Option<StageStat>,
}

impl Stat {
    pub fn packets_decoded(&self) -> u64 {
        self.stages().map(|s| s.packets_decoded).sum()
    }

    pub fn frames_discarded(&self) -> u64 {
        self.stages().map(|s| s.frames_discarded).sum()
    }

    fn stages(&self) -> impl Iterator<Item = &StageStat> {
        self.video.iter().chain(self.audio.iter())
    }
}

// ============================================================================
// Shared State
// ============================================================================

struct Shared {
    service: Arc<dyn ContainerService>,
    frames: Arc<dyn FrameSink>,
    status_sink: Arc<dyn StatusSink>,
    status: Mutex<(PlaybackState, MediaStatus)>,
    /// Held while a transition is delivered; re-entrant for sinks that call back in
    notify: ReentrantMutex<()>,
    interrupted: AtomicBool,
    io: Mutex<Option<Arc<IoInterrupt>>>,
    stages: Mutex<Vec<Arc<DecodeStage>>>,
}

impl Shared {
    fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// The sink is called after `status` is released so it may query the
    /// demuxer; `notify` keeps deliveries in transition order.
    fn set_playback_state(&self, state: PlaybackState) {
        let _order = self.notify.lock();
        {
            let mut status = self.status.lock();
            if status.0 == state {
                return;
            }
            status.0 = state;
        }
        info!("Playback state: {:?}", state);
        self.status_sink.playback_state_changed(state);
    }

    fn set_media_status(&self, media: MediaStatus) {
        let _order = self.notify.lock();
        {
            let mut status = self.status.lock();
            if status.1 == media {
                return;
            }
            status.1 = media;
        }
        info!("Media status: {:?}", media);
        self.status_sink.media_status_changed(media);
    }

    /// Interrupt and join every decode stage
    fn stop_stages(&self) {
        let stages = self.stages.lock().clone();
        for stage in stages {
            stage.request_interrupt(true);
        }
    }
}

/// What the loader hands to the demux loop
struct LoadedMedia {
    container: Box<dyn Container>,
    clock: Arc<Clock>,
    io: Arc<IoInterrupt>,
}

// ============================================================================
// Demuxer
// ============================================================================

/// Playback of one source
pub struct Demuxer {
    shared: Arc<Shared>,
    loader: Mutex<Option<LiveController<Option<LoadedMedia>>>>,
    runner: Mutex<Option<LiveController>>,
}

impl Demuxer {
    pub fn new(
        service: Arc<dyn ContainerService>,
        frames: Arc<dyn FrameSink>,
        status_sink: Arc<dyn StatusSink>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                service,
                frames,
                status_sink,
                status: Mutex::new((PlaybackState::Stopped, MediaStatus::Unknown)),
                notify: ReentrantMutex::new(()),
                interrupted: AtomicBool::new(false),
                io: Mutex::new(None),
                stages: Mutex::new(Vec::new()),
            }),
            loader: Mutex::new(None),
            runner: Mutex::new(None),
        }
    }

    /// Open `source` in the background.
    ///
    /// An empty source reports `NoMedia` right away. A second load on the
    /// same demuxer is ignored.
    pub fn load(&self, source: &str, options: MediaOptions) {
        let mut loader = self.loader.lock();
        if loader.is_some() {
            warn!("Load of {:?} ignored, media already loaded", source);
            return;
        }
        if self.shared.is_interrupted() {
            warn!("Load of {:?} ignored, demuxer shut down", source);
            return;
        }

        let source = source.trim().to_string();
        if source.is_empty() {
            self.shared.set_media_status(MediaStatus::NoMedia);
            self.shared.set_playback_state(PlaybackState::Stopped);
            return;
        }

        self.shared.set_media_status(MediaStatus::Loading);
        self.shared.set_playback_state(PlaybackState::Stopped);

        let io = Arc::new(IoInterrupt::new(options.demuxer_timeout()));
        *self.shared.io.lock() = Some(io.clone());

        let shared = self.shared.clone();
        match Worker::run("avpipe-loader", move || open_media(&shared, &source, &options, io)) {
            Ok(controller) => *loader = Some(controller),
            Err(e) => {
                error!("Cannot start loader: {}", e);
                self.shared.set_media_status(MediaStatus::Invalid);
            }
        }
    }

    /// Start the demux loop; does nothing if already started.
    ///
    /// May be called while loading: the loop waits for the load to finish.
    pub fn start(&self) {
        let Some(loader) = self.loader.lock().clone() else {
            warn!("Start requested without loaded media");
            return;
        };
        let mut runner = self.runner.lock();
        if runner.is_some() || self.shared.is_interrupted() {
            debug!("Start ignored");
            return;
        }

        let mut demux = DemuxLoop {
            shared: self.shared.clone(),
            loader: Some(loader),
            media: None,
            stages: Vec::new(),
        };
        match Worker::looping("avpipe-demux", move || demux.step()) {
            Ok(controller) => *runner = Some(controller),
            Err(e) => {
                error!("Cannot start demux loop: {}", e);
                self.shared.set_media_status(MediaStatus::Stalled);
            }
        }
    }

    /// Snapshot of every stage's counters
    pub fn stat(&self) -> Stat {
        let mut stat = Stat::default();
        for stage in self.shared.stages.lock().iter() {
            match stage.kind() {
                MediaKind::Video => stat.video = Some(stage.stat()),
                MediaKind::Audio => stat.audio = Some(stage.stat()),
            }
        }
        stat
    }

    pub fn playback_state(&self) -> PlaybackState {
        self.shared.status.lock().0
    }

    pub fn media_status(&self) -> MediaStatus {
        self.shared.status.lock().1
    }

    /// Block until the demux loop has ended on its own (or was interrupted)
    pub fn wait_for_finished(&self) {
        let runner = self.runner.lock().clone();
        if let Some(runner) = runner {
            runner.wait_for_finished();
        }
    }

    /// Tear everything down. Idempotent, also run on drop.
    pub fn request_interrupt(&self) {
        if !self.shared.interrupted.swap(true, Ordering::AcqRel) {
            debug!("Demuxer interrupt requested");
        }
        if let Some(io) = self.shared.io.lock().as_ref() {
            io.request();
        }

        let loader = self.loader.lock().clone();
        if let Some(loader) = loader {
            loader.request_interrupt(true);
        }

        self.shared.stop_stages();

        let runner = self.runner.lock().clone();
        if let Some(runner) = runner {
            runner.request_interrupt(true);
        }

        self.shared.set_playback_state(PlaybackState::Stopped);
    }
}

impl Drop for Demuxer {
    fn drop(&mut self) {
        self.request_interrupt();
    }
}

// ============================================================================
// Loading (runs on the loader thread)
// ============================================================================

fn open_media(
    shared: &Shared,
    source: &str,
    options: &MediaOptions,
    io: Arc<IoInterrupt>,
) -> Option<LoadedMedia> {
    info!(
        timeout_ms = io.timeout().as_millis() as u64,
        "Opening {} with {}",
        source,
        shared.service.name()
    );

    io.start_timer();
    let opened = shared.service.open(source, options, io.clone());
    io.stop_timer();

    let container = match opened {
        Ok(container) => container,
        Err(e) if shared.is_interrupted() => {
            debug!("Open of {} aborted: {}", source, e);
            return None;
        }
        Err(e) => {
            error!("Failed to open {}: {}", source, e);
            shared.set_media_status(MediaStatus::Invalid);
            return None;
        }
    };

    let realtime = options
        .realtime
        .unwrap_or_else(|| is_realtime_source(source));
    let clock = Arc::new(Clock::new(realtime));

    let mut stages = Vec::new();
    for kind in [MediaKind::Video, MediaKind::Audio] {
        let disabled = match kind {
            MediaKind::Video => options.video_disable,
            MediaKind::Audio => options.audio_disable,
        };
        if disabled {
            debug!("{} disabled by options", kind);
            continue;
        }

        let Some(stream) = container.streams().iter().find(|s| s.kind == kind).cloned() else {
            continue;
        };
        let codec = match container.open_decoder(&stream) {
            Ok(codec) => codec,
            Err(e) => {
                warn!("Skipping {} stream {}: {}", kind, stream.index, e);
                continue;
            }
        };

        let config = StageConfig::for_stream(kind, options);
        match DecodeStage::spawn(stream, codec, clock.clone(), shared.frames.clone(), config) {
            Ok(stage) => stages.push(Arc::new(stage)),
            Err(e) => error!("Cannot start {} decoder: {}", kind, e),
        }
    }

    if stages.is_empty() {
        error!("No decodable stream in {}", source);
        shared.set_media_status(MediaStatus::Invalid);
        return None;
    }
    if shared.is_interrupted() {
        for stage in &stages {
            stage.request_interrupt(true);
        }
        return None;
    }

    info!(
        realtime,
        streams = stages.len(),
        "Loaded {}",
        source
    );
    *shared.stages.lock() = stages;
    shared.set_media_status(MediaStatus::Loaded);

    Some(LoadedMedia {
        container,
        clock,
        io,
    })
}

// ============================================================================
// Demux Loop (runs on the demux thread)
// ============================================================================

struct DemuxLoop {
    shared: Arc<Shared>,
    loader: Option<LiveController<Option<LoadedMedia>>>,
    media: Option<LoadedMedia>,
    stages: Vec<Arc<DecodeStage>>,
}

impl DemuxLoop {
    fn step(&mut self) -> LoopControl {
        if self.shared.is_interrupted() {
            return self.finish(None);
        }

        if self.media.is_none() {
            let loaded = self.loader.take().and_then(|loader| loader.result()).flatten();
            match loaded {
                Some(media) => {
                    self.stages = self.shared.stages.lock().clone();
                    self.media = Some(media);
                    self.shared.set_playback_state(PlaybackState::Playing);
                    self.shared.set_media_status(MediaStatus::Buffered);
                }
                None => {
                    debug!("Nothing to play");
                    return LoopControl::Break;
                }
            }
        }

        let Some(media) = self.media.as_mut() else {
            return LoopControl::Break;
        };

        media.io.start_timer();
        let read = media.container.read_packet();
        media.io.stop_timer();

        match read {
            Ok(Some(packet)) => {
                let Some(stage) = self.stages.iter().find(|s| s.index() == packet.stream_index)
                else {
                    return LoopControl::continue_after(UNKNOWN_STREAM_YIELD);
                };
                if media.clock.is_realtime() {
                    stage.push(PacketCmd::Data(packet));
                    return LoopControl::continue_now();
                }

                // queued input counts as decoded for pacing
                let stream = stage.stream();
                if let Some(ticks) = packet.pts.or(packet.dts) {
                    let offset = stream.time_base.to_us(ticks).saturating_sub(stream.start_us());
                    media.clock.advance(media.clock.presentation_us(offset));
                }
                stage.push(PacketCmd::Data(packet));
                LoopControl::continue_after_us(media.clock.lead_us())
            }
            Ok(None) => {
                info!("End of media, draining decoders");
                for stage in &self.stages {
                    stage.push(PacketCmd::Eof);
                }
                for stage in &self.stages {
                    stage.wait_for_empty();
                }
                if self.shared.is_interrupted() {
                    self.finish(None)
                } else {
                    self.finish(Some(MediaStatus::EndOfMedia))
                }
            }
            Err(e) if self.shared.is_interrupted() => {
                debug!("Read aborted: {}", e);
                self.finish(None)
            }
            Err(e) => {
                error!("Read failed: {}", e);
                self.finish(Some(MediaStatus::Stalled))
            }
        }
    }

    fn finish(&mut self, status: Option<MediaStatus>) -> LoopControl {
        if let Some(status) = status {
            self.shared.set_media_status(status);
        }
        self.shared.stop_stages();
        self.media = None;
        self.shared.set_playback_state(PlaybackState::Stopped);
        LoopControl::Break
    }
}
