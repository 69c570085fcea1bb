//! Procedural click synthesis
//!
//! Clicks are rendered from three exponentially decaying harmonics
//! (fundamental, 2nd and 6th) so they read as a short percussive knock
//! rather than a pure tone. Rendering is pure and deterministic: the same
//! kind and sample rate always give the same samples.

use std::f64::consts::PI;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::CLICK_DURATION_SECS;

/// Mixing weights of the fundamental, 2nd and 6th harmonic
const HARMONIC_WEIGHTS: [f64; 3] = [0.09, 0.34, 0.57];

/// Frequency multipliers of the three harmonics
const HARMONIC_MULTIPLIERS: [f64; 3] = [1.0, 2.0, 6.0];

/// Decay rates of the three harmonics, in units of 1/second
const HARMONIC_DECAY: [f64; 3] = [100.0, 200.0, 500.0];

/// Timbral category of a click
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClickKind {
    /// Played for every warmup beat
    Warmup,
    /// Played for every main beat except the last
    Common,
    /// Played for the final beat of the main phase
    Accent,
}

impl ClickKind {
    pub const ALL: [ClickKind; 3] = [ClickKind::Warmup, ClickKind::Common, ClickKind::Accent];

    /// Base frequency in Hz
    pub fn frequency(self) -> f64 {
        match self {
            ClickKind::Warmup => 330.0,
            ClickKind::Common => 440.0,
            ClickKind::Accent => 880.0,
        }
    }

    /// Peak gain applied to the harmonic mix
    pub fn gain(self) -> f64 {
        match self {
            ClickKind::Warmup => 0.5,
            ClickKind::Common => 0.7,
            ClickKind::Accent => 0.5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ClickKind::Warmup => "warmup",
            ClickKind::Common => "common",
            ClickKind::Accent => "accent",
        }
    }
}

impl std::fmt::Display for ClickKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mono sample data for one click kind at one sample rate
#[derive(Debug, Clone, PartialEq)]
pub struct ClickBuffer {
    kind: ClickKind,
    sample_rate: u32,
    samples: Vec<f32>,
}

impl ClickBuffer {
    pub fn kind(&self) -> ClickKind {
        self.kind
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Playback length of the buffer
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }

    /// Largest absolute sample value
    pub fn peak(&self) -> f32 {
        self.samples.iter().fold(0.0f32, |peak, s| peak.max(s.abs()))
    }
}

/// Number of samples in a click at the given sample rate
pub fn click_len(sample_rate: u32) -> usize {
    (sample_rate as f64 * CLICK_DURATION_SECS).round() as usize
}

/// Render the click for `kind` at `sample_rate`.
///
/// A sample rate of zero yields an empty buffer.
pub fn synthesize(kind: ClickKind, sample_rate: u32) -> ClickBuffer {
    let len = click_len(sample_rate);
    let mut samples = Vec::with_capacity(len);

    if len > 0 {
        let sr = sample_rate as f64;
        let omega = 2.0 * PI * kind.frequency() / sr;
        let gain = kind.gain();

        for i in 0..len {
            let t = i as f64;
            let mix: f64 = (0..3)
                .map(|h| {
                    HARMONIC_WEIGHTS[h]
                        * (-t * HARMONIC_DECAY[h] / sr).exp()
                        * (HARMONIC_MULTIPLIERS[h] * omega * t).sin()
                })
                .sum();
            samples.push((gain * mix) as f32);
        }
    }

    ClickBuffer {
        kind,
        sample_rate,
        samples,
    }
}
