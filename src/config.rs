//! Run configuration and application settings
//!
//! [`RunConfig`] is what a run is started with. It is validated strictly at
//! `start()`; user-editable input goes through [`RunConfig::from_fields`],
//! which coerces anything malformed to the nearest valid value instead.
//!
//! [`AppConfig`] holds the startup defaults read from a TOML file. It is only
//! ever read; nothing writes settings back.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::error::{Error, Result};

/// Immutable parameters of one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Tempo, 1..=300
    pub bpm: u32,
    /// Beats played before the main phase; may be zero
    pub warmup_beats: u32,
    /// Beats in the main phase, already multiplied; at least one
    pub main_beats: u32,
    /// Multiplier that was applied to the external beat count
    pub beat_multiplier: u32,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            bpm: DEFAULT_BPM,
            warmup_beats: DEFAULT_WARMUP_BEATS,
            main_beats: DEFAULT_MAIN_BEATS,
            beat_multiplier: 1,
        }
    }
}

impl RunConfig {
    pub fn new(bpm: u32, warmup_beats: u32, main_beats: u32) -> Self {
        Self {
            bpm,
            warmup_beats,
            main_beats,
            beat_multiplier: 1,
        }
    }

    /// Build from an externally supplied beat count.
    ///
    /// `main_beats = round(external_beats) * beat_multiplier`. The result is
    /// not validated; a zero product is rejected later by [`validate`].
    ///
    /// [`validate`]: RunConfig::validate
    pub fn with_external_beats(
        bpm: u32,
        warmup_beats: u32,
        external_beats: f64,
        beat_multiplier: u32,
    ) -> Self {
        let rounded = if external_beats.is_finite() && external_beats > 0.0 {
            external_beats.round().min(u32::MAX as f64) as u32
        } else {
            0
        };
        Self {
            bpm,
            warmup_beats,
            main_beats: rounded.saturating_mul(beat_multiplier),
            beat_multiplier,
        }
    }

    /// Coerce raw user input into a valid configuration.
    ///
    /// Non-numeric or out-of-range fields fall back to the nearest valid
    /// value: bpm to `1..=300`, warmup to `>= 0`, beats to `>= 1`,
    /// multiplier to `>= 1`.
    pub fn from_fields(bpm: &str, warmup_beats: &str, beats: &str, beat_multiplier: u32) -> Self {
        let bpm = parse_number(bpm)
            .map(|v| v.round().clamp(MIN_BPM as f64, MAX_BPM as f64) as u32)
            .unwrap_or(MIN_BPM);
        let warmup_beats = parse_number(warmup_beats)
            .map(|v| v.round().clamp(0.0, u32::MAX as f64) as u32)
            .unwrap_or(0);
        let beats = parse_number(beats)
            .map(|v| v.round().clamp(1.0, u32::MAX as f64))
            .unwrap_or(1.0);

        let mut config =
            Self::with_external_beats(bpm, warmup_beats, beats, beat_multiplier.max(1));
        config.warmup_beats = config.warmup_beats.min((MAX_TOTAL_BEATS - 1) as u32);
        let room = (MAX_TOTAL_BEATS - config.warmup_beats as u64) as u32;
        config.main_beats = config.main_beats.clamp(1, room);
        config
    }

    /// Reject configurations a run cannot start with
    pub fn validate(&self) -> Result<()> {
        if !(MIN_BPM..=MAX_BPM).contains(&self.bpm) {
            return Err(Error::InvalidConfig(format!(
                "bpm must be between {} and {}, got {}",
                MIN_BPM, MAX_BPM, self.bpm
            )));
        }
        if self.main_beats == 0 {
            return Err(Error::InvalidConfig(
                "main beat count must be at least 1".to_string(),
            ));
        }
        if self.total_beats() > MAX_TOTAL_BEATS {
            return Err(Error::InvalidConfig(format!(
                "a run may have at most {} beats, got {}",
                MAX_TOTAL_BEATS,
                self.total_beats()
            )));
        }
        if self.beat_multiplier == 0 {
            return Err(Error::InvalidConfig(
                "beat multiplier must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Ticks in one run, warmup and main combined
    pub fn total_beats(&self) -> u64 {
        self.warmup_beats as u64 + self.main_beats as u64
    }

    /// Time between consecutive ticks, `60000 / bpm` ms
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(60.0 / self.bpm.max(1) as f64)
    }
}

/// Leading numeric value of a field: `"12 beats"` reads as 12, `"abc"` as nothing
fn parse_number(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    let bytes = raw.as_bytes();
    let mut end = 0;
    if matches!(bytes.first(), Some(b'+') | Some(b'-')) {
        end += 1;
    }
    let digits_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if end == digits_start {
        return None;
    }
    if end < bytes.len() && bytes[end] == b'.' {
        end += 1;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
    }
    raw[..end].trim_end_matches('.').parse().ok()
}

/// Startup settings loaded from `config.toml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub metronome: MetronomeDefaults,
    pub audio: AudioSettings,
    pub logging: LoggingSettings,
}

/// Initial values of the user-editable fields
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetronomeDefaults {
    pub bpm: u32,
    pub warmup_beats: u32,
    pub beats: u32,
    pub beat_multiplier: u32,
}

impl Default for MetronomeDefaults {
    fn default() -> Self {
        Self {
            bpm: DEFAULT_BPM,
            warmup_beats: DEFAULT_WARMUP_BEATS,
            beats: DEFAULT_MAIN_BEATS,
            beat_multiplier: 1,
        }
    }
}

impl MetronomeDefaults {
    /// Run configuration with boundary coercion applied
    pub fn run_config(&self) -> RunConfig {
        RunConfig::from_fields(
            &self.bpm.to_string(),
            &self.warmup_beats.to_string(),
            &self.beats.to_string(),
            self.beat_multiplier,
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    /// Output device name; `None` picks the host default
    pub device: Option<String>,
    /// How far ahead of each tick its click is placed on the device clock
    pub lookahead_ms: u64,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            device: None,
            lookahead_ms: DEFAULT_LOOKAHEAD_MS,
        }
    }
}

impl AudioSettings {
    pub fn lookahead(&self) -> Duration {
        Duration::from_millis(self.lookahead_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// `tracing_subscriber::EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Default location: `<config dir>/practice-metronome/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "practice-metronome")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Read `path`; a missing file yields the defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                tracing::debug!(path = %path.display(), "Loaded configuration");
                Self::from_toml(&text)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Read the file at the default location, if any
    pub fn load() -> Result<Self> {
        match Self::default_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }
}
