//! Run phases and the published run state

use serde::Serialize;

use crate::audio::synth::ClickKind;
use crate::config::RunConfig;

/// Position of the scheduler within a run.
///
/// `Warmup(i)` and `Main(i)` name the beat the *next* tick will play, as a
/// 0-based index into its phase. `Finishing` holds the final beat on screen
/// for one interval after the accent; the run completes when it elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Warmup(u32),
    Main(u32),
    Finishing,
}

impl Phase {
    /// Phase a run enters on `start`
    pub fn initial(config: &RunConfig) -> Phase {
        if config.warmup_beats > 0 {
            Phase::Warmup(0)
        } else if config.main_beats > 0 {
            Phase::Main(0)
        } else {
            Phase::Idle
        }
    }

    /// Phase after the tick for `self` has fired
    pub fn advance(self, config: &RunConfig) -> Phase {
        match self {
            Phase::Idle => Phase::Idle,
            Phase::Warmup(i) if i + 1 < config.warmup_beats => Phase::Warmup(i + 1),
            Phase::Warmup(_) if config.main_beats > 0 => Phase::Main(0),
            Phase::Warmup(_) => Phase::Idle,
            Phase::Main(i) if i + 1 < config.main_beats => Phase::Main(i + 1),
            Phase::Main(_) => Phase::Finishing,
            Phase::Finishing => Phase::Idle,
        }
    }

    /// Click played by the tick for `self`, if it plays one
    pub fn click_kind(self, config: &RunConfig) -> Option<ClickKind> {
        match self {
            Phase::Warmup(_) => Some(ClickKind::Warmup),
            Phase::Main(i) if i + 1 == config.main_beats => Some(ClickKind::Accent),
            Phase::Main(_) => Some(ClickKind::Common),
            Phase::Idle | Phase::Finishing => None,
        }
    }

    /// 1-based beat number shown once the tick for `self` has fired
    pub fn beat_in_phase(self) -> u32 {
        match self {
            Phase::Warmup(i) | Phase::Main(i) => i + 1,
            Phase::Idle | Phase::Finishing => 0,
        }
    }

    pub fn is_warmup(self) -> bool {
        matches!(self, Phase::Warmup(_))
    }

    /// True while a run is in progress
    pub fn is_active(self) -> bool {
        !matches!(self, Phase::Idle)
    }
}

/// Snapshot of the scheduler for rendering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    pub is_playing: bool,
    pub is_warmup_phase: bool,
    pub current_beat_in_phase: u32,
    pub completed_run_count: u64,
}

impl RunState {
    /// Idle state carrying an existing completion count
    pub fn idle(completed_run_count: u64) -> Self {
        Self {
            is_playing: false,
            is_warmup_phase: true,
            current_beat_in_phase: 0,
            completed_run_count,
        }
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::idle(0)
    }
}
