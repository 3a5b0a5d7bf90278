//! # avpipe Core
//!
//! Threaded demux → decode → present pipeline with soft-real-time pacing.
//!
//! Each stage runs a closure on its own thread ([`worker`]), stages talk
//! through dual-limit blocking queues ([`blocking_queue`]), and decode
//! stages drop frames under sustained backlog ([`soft_limit`]). The
//! [`demuxer`] ties it together around an opaque codec service ([`codec`]).

// ============================================================================
// Task Framework
// ============================================================================
pub mod blocking_queue;
pub mod loop_control;
pub mod soft_limit;
pub mod worker;

// ============================================================================
// Media
// ============================================================================
pub mod codec;
pub mod options;
pub mod synthetic;
pub mod sync;

// ============================================================================
// Pipeline
// ============================================================================
pub mod decoder;
pub mod demuxer;

pub use codec::{CodecError, ContainerService, MediaKind};
pub use decoder::{Frame, FrameSink, StageStat};
pub use demuxer::{Demuxer, MediaStatus, PlaybackState, Stat, StatusSink};
pub use options::{MediaOptions, OptionsError};

// ============================================================================
// Version
// ============================================================================
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
