//! # Practice Metronome
//!
//! A metronome engine for practice sets: a warmup phase, then a main phase
//! whose last beat is accented, with every click synthesized on the fly.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                     BeatScheduler (scheduler)                    │
//! │   start / stop / toggle ──► TickPlan: anchor + k · 60/bpm        │
//! │                                  │                               │
//! │              tokio task: sleep_until(deadline k) ──► tick        │
//! │                                  │                               │
//! │        RunState ◄── publish ─────┤                               │
//! │     (watch channel)              ▼                               │
//! │              ┌────────────────────────────────────┐              │
//! │              │     AudioOutput (audio::output)    │              │
//! │              │  acquire / resume · click cache    │              │
//! │              │  play(buffer, device time)         │              │
//! │              └──────────────┬─────────────────────┘              │
//! └─────────────────────────────┼────────────────────────────────────┘
//!                               │ AudioDevice
//!             ┌─────────────────┴──────────────────┐
//!             ▼                                    ▼
//!   ┌───────────────────┐                ┌───────────────────┐
//!   │ CpalDevice        │                │ StubDevice        │
//!   │ output thread,    │                │ silent, records   │
//!   │ frame clock, mix  │                │ scheduled clicks  │
//!   └───────────────────┘                └───────────────────┘
//! ```
//!
//! Click buffers come from [`audio::synth::synthesize`], rendered once per
//! device sample rate.

pub mod audio;
pub mod config;
pub mod error;
pub mod scheduler;

pub use audio::{AudioDevice, AudioOutput, ClickBuffer, ClickKind};
pub use config::{AppConfig, RunConfig};
pub use error::{AudioError, Error, Result};
pub use scheduler::{BeatScheduler, Phase, RunState, SchedulerStats};

/// Application-wide constants
pub mod constants {
    /// Slowest accepted tempo
    pub const MIN_BPM: u32 = 1;

    /// Fastest accepted tempo
    pub const MAX_BPM: u32 = 300;

    /// Default tempo
    pub const DEFAULT_BPM: u32 = 50;

    /// Default warmup beat count
    pub const DEFAULT_WARMUP_BEATS: u32 = 2;

    /// Default main beat count
    pub const DEFAULT_MAIN_BEATS: u32 = 20;

    /// Upper bound on warmup + main beats in one run
    pub const MAX_TOTAL_BEATS: u64 = 100_000;

    /// Length of every click
    pub const CLICK_DURATION_SECS: f64 = 0.1;

    /// Sample rate assumed before a device reports its own
    pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

    /// Default device-clock lead of each click over its tick
    pub const DEFAULT_LOOKAHEAD_MS: u64 = 50;

    /// Clicks that may wait between scheduler and output callback
    pub const CLICK_QUEUE_CAPACITY: usize = 64;

    /// Clicks mixed at once in the output callback; further clicks are dropped
    pub const MAX_VOICES: usize = 8;
}
