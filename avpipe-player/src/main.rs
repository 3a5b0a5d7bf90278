//! # avpipe Player
//!
//! Headless front end for the pipeline: plays one source, logs every status
//! transition and prints the final statistics as JSON on stdout.
//!
//! ```text
//! avpipe [--config options.json] [-o key=value]... [--duration secs] <source>
//! avpipe "synthetic://demo?video=100&audio=100&interval_ms=20"
//! ```

use anyhow::{Context, Result};
use avpipe_core::synthetic::SyntheticService;
use avpipe_core::{
    Demuxer, Frame, FrameSink, MediaKind, MediaOptions, MediaStatus, PlaybackState, Stat,
    StatusSink,
};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ============================================================================
// Command Line
// ============================================================================

#[derive(Debug, Default, PartialEq)]
struct PlayerOptions {
    source: String,
    config: Option<PathBuf>,
    overrides: Vec<(String, String)>,
    /// Stop after this long even if the media has not ended
    duration: Option<Duration>,
}

impl PlayerOptions {
    fn from_args(args: &[String]) -> Result<Self> {
        let mut options = Self::default();
        let mut source = None;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--config" | "-c" => {
                    let value = args
                        .get(i + 1)
                        .ok_or_else(|| anyhow::anyhow!("Missing value for --config"))?;
                    options.config = Some(PathBuf::from(value));
                    i += 2;
                }
                "--option" | "-o" => {
                    let value = args
                        .get(i + 1)
                        .ok_or_else(|| anyhow::anyhow!("Missing value for --option"))?;
                    let (key, val) = value.split_once('=').unwrap_or((value.as_str(), ""));
                    options.overrides.push((key.to_string(), val.to_string()));
                    i += 2;
                }
                "--duration" | "-d" => {
                    let value = args
                        .get(i + 1)
                        .ok_or_else(|| anyhow::anyhow!("Missing value for --duration"))?;
                    let secs = value
                        .parse::<f64>()
                        .ok()
                        .filter(|s| s.is_finite() && *s > 0.0)
                        .ok_or_else(|| anyhow::anyhow!("Invalid duration {}", value))?;
                    options.duration = Some(Duration::from_secs_f64(secs));
                    i += 2;
                }
                "--help" | "-h" => {
                    print_usage();
                    std::process::exit(0);
                }
                other => {
                    if source.is_some() {
                        anyhow::bail!("Unexpected argument {}", other);
                    }
                    source = Some(other.to_string());
                    i += 1;
                }
            }
        }

        options.source = source.ok_or_else(|| {
            print_usage();
            anyhow::anyhow!("Missing source")
        })?;
        Ok(options)
    }

    /// Config file first, then `-o` overrides on top
    fn media_options(&self) -> Result<MediaOptions> {
        let mut media = match &self.config {
            Some(path) => {
                let json = std::fs::read_to_string(path)
                    .with_context(|| format!("Cannot read {}", path.display()))?;
                MediaOptions::from_json(&json)
                    .with_context(|| format!("Invalid options in {}", path.display()))?
            }
            None => MediaOptions::default(),
        };
        for (key, value) in &self.overrides {
            media
                .set(key, value)
                .with_context(|| format!("Bad option -o {}={}", key, value))?;
        }
        Ok(media)
    }
}

fn print_usage() {
    eprintln!(
        "\nUsage:\n  avpipe [--config <file.json>] [-o key=value]... [--duration <secs>] <source>\n\n\
         Sources are opened by the synthetic service, e.g.\n  \
         avpipe \"synthetic://demo?video=100&audio=100&interval_ms=20\"\n"
    );
}

// ============================================================================
// Sinks
// ============================================================================

/// Counts presented frames and releases them right away
#[derive(Default)]
struct PresentCounter {
    video: AtomicU64,
    audio: AtomicU64,
}

impl FrameSink for PresentCounter {
    fn frame_finished(&self, frame: Frame) {
        let counter = match frame.kind {
            MediaKind::Video => &self.video,
            MediaKind::Audio => &self.audio,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(
            kind = %frame.kind,
            pts_us = frame.pts_us,
            rate = frame.rate_factor,
            "Frame presented"
        );
    }
}

/// Logs transitions and wakes `main` once playback is over
#[derive(Default)]
struct PlaybackWatch {
    /// (has played, finished)
    state: Mutex<(bool, bool)>,
    changed: Condvar,
}

impl PlaybackWatch {
    fn mark_finished(&self) {
        self.state.lock().1 = true;
        self.changed.notify_all();
    }

    /// `false` if `limit` elapsed first
    fn wait(&self, limit: Option<Duration>) -> bool {
        let deadline = limit.map(|l| Instant::now() + l);
        let mut state = self.state.lock();
        while !state.1 {
            match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return false;
                    }
                    self.changed.wait_for(&mut state, remaining);
                }
                None => self.changed.wait(&mut state),
            }
        }
        true
    }
}

impl StatusSink for PlaybackWatch {
    fn playback_state_changed(&self, state: PlaybackState) {
        tracing::info!("Playback {:?}", state);
        match state {
            PlaybackState::Playing => self.state.lock().0 = true,
            PlaybackState::Stopped => {
                if self.state.lock().0 {
                    self.mark_finished();
                }
            }
        }
    }

    fn media_status_changed(&self, status: MediaStatus) {
        tracing::info!("Media {:?}", status);
        if matches!(status, MediaStatus::NoMedia | MediaStatus::Invalid) {
            self.mark_finished();
        }
    }
}

// ============================================================================
// Report
// ============================================================================

#[derive(Serialize)]
struct Report<'a> {
    source: &'a str,
    media_status: MediaStatus,
    presented_video: u64,
    presented_audio: u64,
    elapsed_ms: u128,
    stat: Stat,
}

fn is_failure(status: MediaStatus) -> bool {
    matches!(
        status,
        MediaStatus::NoMedia | MediaStatus::Invalid | MediaStatus::Stalled
    )
}

// ============================================================================
// Main
// ============================================================================

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("avpipe=info,avpipe_core=info")
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let options = PlayerOptions::from_args(&args)?;
    let media = options.media_options()?;

    tracing::info!("avpipe v{}", avpipe_core::VERSION);
    tracing::info!("Playing {}", options.source);

    let presented = Arc::new(PresentCounter::default());
    let watch = Arc::new(PlaybackWatch::default());
    let demuxer = Demuxer::new(
        Arc::new(SyntheticService::new()),
        presented.clone(),
        watch.clone(),
    );

    let started = Instant::now();
    demuxer.load(&options.source, media);
    demuxer.start();

    if !watch.wait(options.duration) {
        tracing::info!("Duration limit reached, stopping");
    }
    demuxer.request_interrupt();

    let status = demuxer.media_status();
    let report = Report {
        source: &options.source,
        media_status: status,
        presented_video: presented.video.load(Ordering::Relaxed),
        presented_audio: presented.audio.load(Ordering::Relaxed),
        elapsed_ms: started.elapsed().as_millis(),
        stat: demuxer.stat(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    if is_failure(status) {
        anyhow::bail!("Playback of {} ended with {:?}", options.source, status);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("avpipe")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_parse_args() {
        let options = PlayerOptions::from_args(&args(&[
            "-o",
            "vn=1",
            "--option",
            "timeout=500",
            "-d",
            "2.5",
            "synthetic://demo",
        ]))
        .unwrap();

        assert_eq!(options.source, "synthetic://demo");
        assert_eq!(
            options.overrides,
            vec![
                ("vn".to_string(), "1".to_string()),
                ("timeout".to_string(), "500".to_string())
            ]
        );
        assert_eq!(options.duration, Some(Duration::from_millis(2500)));
    }

    #[test]
    fn test_parse_args_errors() {
        assert!(PlayerOptions::from_args(&args(&["-o"])).is_err());
        assert!(PlayerOptions::from_args(&args(&["-d", "never", "x"])).is_err());
        assert!(PlayerOptions::from_args(&args(&["one", "two"])).is_err());
    }

    #[test]
    fn test_config_then_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "audio_disable": true, "demuxer_timeout_ms": 1000 }}"#).unwrap();

        let options = PlayerOptions {
            source: "synthetic://demo".into(),
            config: Some(file.path().to_path_buf()),
            overrides: vec![("timeout".into(), "250".into())],
            duration: None,
        };
        let media = options.media_options().unwrap();
        assert!(media.audio_disable);
        assert_eq!(media.demuxer_timeout_ms, 250);
    }

    #[test]
    fn test_bad_override_is_reported() {
        let options = PlayerOptions {
            source: "synthetic://demo".into(),
            overrides: vec![("vn".into(), "sometimes".into())],
            ..Default::default()
        };
        let err = options.media_options().unwrap_err();
        assert!(err.to_string().contains("vn=sometimes"));
    }

    #[test]
    fn test_watch_finishes_after_playing() {
        let watch = PlaybackWatch::default();
        watch.playback_state_changed(PlaybackState::Stopped);
        assert!(!watch.wait(Some(Duration::from_millis(10))));

        watch.playback_state_changed(PlaybackState::Playing);
        watch.playback_state_changed(PlaybackState::Stopped);
        assert!(watch.wait(Some(Duration::from_millis(10))));
    }

    #[test]
    fn test_watch_finishes_on_invalid() {
        let watch = PlaybackWatch::default();
        watch.media_status_changed(MediaStatus::Invalid);
        assert!(watch.wait(None));
    }
}
