//! Media options.
//!
//! Built from ffmpeg-style key/value pairs (`f`, `timeout`, `vn`, `an`, ...)
//! or deserialized from a JSON config. Keys the pipeline does not know are
//! kept in `format_options` and handed to the container service untouched.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::soft_limit::{AUDIO_SOFT_LIMIT, DEFAULT_ALPHA, VIDEO_SOFT_LIMIT};
use crate::sync::DriftPolicy;

#[derive(Debug, Error)]
pub enum OptionsError {
    #[error("Invalid value {value:?} for option {key:?}")]
    InvalidValue { key: String, value: String },
    #[error("Invalid options document: {0}")]
    Json(#[from] serde_json::Error),
}

/// Per-source playback options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaOptions {
    /// Force a container format instead of probing (`f`)
    pub input_format: Option<String>,
    /// Bound on a single blocking open/read, 0 disables (`timeout`, ms)
    pub demuxer_timeout_ms: u64,
    /// Ignore video streams (`vn`)
    pub video_disable: bool,
    /// Ignore audio streams (`an`)
    pub audio_disable: bool,
    /// Override scheme-based real-time detection
    pub realtime: Option<bool>,
    pub video_soft_limit: f64,
    pub audio_soft_limit: f64,
    pub soft_limit_alpha: f64,
    /// Packets a decode stage may have waiting before the demuxer blocks
    pub packet_queue_limit: usize,
    pub drift: DriftPolicy,
    /// Everything else, passed through to the container service
    pub format_options: Vec<(String, String)>,
}

impl Default for MediaOptions {
    fn default() -> Self {
        Self {
            input_format: None,
            demuxer_timeout_ms: 10_000,
            video_disable: false,
            audio_disable: false,
            realtime: None,
            video_soft_limit: VIDEO_SOFT_LIMIT,
            audio_soft_limit: AUDIO_SOFT_LIMIT,
            soft_limit_alpha: DEFAULT_ALPHA,
            packet_queue_limit: 64,
            drift: DriftPolicy::default(),
            format_options: Vec::new(),
        }
    }
}

impl MediaOptions {
    /// Build from key/value pairs on top of the defaults
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, OptionsError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut options = Self::default();
        for (key, value) in pairs {
            options.set(key.as_ref(), value.as_ref())?;
        }
        Ok(options)
    }

    pub fn from_json(json: &str) -> Result<Self, OptionsError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Apply one option
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), OptionsError> {
        let invalid = || OptionsError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        };

        match key {
            "f" => self.input_format = Some(value.to_string()),
            "timeout" => self.demuxer_timeout_ms = value.parse().map_err(|_| invalid())?,
            "vn" => self.video_disable = parse_flag(value).ok_or_else(invalid)?,
            "an" => self.audio_disable = parse_flag(value).ok_or_else(invalid)?,
            "realtime" => self.realtime = Some(parse_flag(value).ok_or_else(invalid)?),
            "video_soft_limit" => self.video_soft_limit = parse_positive(value).ok_or_else(invalid)?,
            "audio_soft_limit" => self.audio_soft_limit = parse_positive(value).ok_or_else(invalid)?,
            "soft_limit_alpha" => {
                self.soft_limit_alpha = parse_positive(value)
                    .filter(|a| *a <= 1.0)
                    .ok_or_else(invalid)?
            }
            "packet_queue_limit" => self.packet_queue_limit = value.parse().map_err(|_| invalid())?,
            "drift_max" => {
                self.drift.max_adjust = value
                    .parse::<f64>()
                    .ok()
                    .filter(|v| (0.0..1.0).contains(v))
                    .ok_or_else(invalid)?
            }
            "drift_threshold_ms" => {
                let ms: i64 = value.parse().map_err(|_| invalid())?;
                self.drift.threshold_us = ms.saturating_mul(1000);
            }
            _ => self
                .format_options
                .push((key.to_string(), value.to_string())),
        }
        Ok(())
    }

    pub fn demuxer_timeout(&self) -> Duration {
        Duration::from_millis(self.demuxer_timeout_ms)
    }

    pub fn format_option(&self, key: &str) -> Option<&str> {
        self.format_options
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Flags accept `1`/`0`, `true`/`false`, `yes`/`no`; an empty value means set
fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_positive(value: &str) -> Option<f64> {
    value
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v > 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = MediaOptions::default();
        assert_eq!(options.video_soft_limit, 8.0);
        assert_eq!(options.audio_soft_limit, 32.0);
        assert_eq!(options.soft_limit_alpha, 0.01);
        assert_eq!(options.demuxer_timeout(), Duration::from_secs(10));
        assert!(options.realtime.is_none());
    }

    #[test]
    fn test_known_keys() {
        let options = MediaOptions::from_pairs([
            ("f", "mpegts"),
            ("timeout", "2500"),
            ("vn", "1"),
            ("an", "false"),
            ("realtime", "yes"),
            ("video_soft_limit", "4"),
            ("drift_threshold_ms", "25"),
        ])
        .unwrap();

        assert_eq!(options.input_format.as_deref(), Some("mpegts"));
        assert_eq!(options.demuxer_timeout_ms, 2500);
        assert!(options.video_disable);
        assert!(!options.audio_disable);
        assert_eq!(options.realtime, Some(true));
        assert_eq!(options.video_soft_limit, 4.0);
        assert_eq!(options.drift.threshold_us, 25_000);
        assert!(options.format_options.is_empty());
    }

    #[test]
    fn test_unknown_keys_pass_through() {
        let options =
            MediaOptions::from_pairs([("rtsp_transport", "tcp"), ("probesize", "32")]).unwrap();
        assert_eq!(options.format_option("rtsp_transport"), Some("tcp"));
        assert_eq!(options.format_option("probesize"), Some("32"));
        assert_eq!(options.format_option("missing"), None);
    }

    #[test]
    fn test_invalid_values() {
        for (key, value) in [
            ("timeout", "soon"),
            ("vn", "maybe"),
            ("soft_limit_alpha", "1.5"),
            ("audio_soft_limit", "-3"),
            ("drift_max", "2"),
        ] {
            let err = MediaOptions::from_pairs([(key, value)]).unwrap_err();
            assert!(matches!(err, OptionsError::InvalidValue { .. }), "{key}={value}");
        }
    }

    #[test]
    fn test_json_partial_document() {
        let options = MediaOptions::from_json(
            r#"{ "audio_disable": true, "packet_queue_limit": 8, "drift": { "max_adjust": 0.01 } }"#,
        )
        .unwrap();
        assert!(options.audio_disable);
        assert_eq!(options.packet_queue_limit, 8);
        assert_eq!(options.drift.max_adjust, 0.01);
        assert_eq!(options.drift.threshold_us, 40_000);
        assert_eq!(options.video_soft_limit, 8.0);
    }
}
