//! Absolute-deadline tick plan
//!
//! Every tick of a run is laid out up front against one anchor. Tick `k` is
//! due at `anchor + k * interval` and sounds at `device_anchor + k * interval`
//! on the device clock; both are computed from `k` directly, so lateness of
//! one tick never shifts the ones after it.

use std::time::Duration;

use tokio::time::Instant;

use crate::audio::synth::ClickKind;
use crate::config::RunConfig;
use crate::scheduler::phase::Phase;

/// One scheduled beat
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlannedTick {
    /// Position in the run, warmup and main combined
    pub index: u64,
    /// Phase the scheduler is in when this tick fires
    pub phase: Phase,
    pub kind: ClickKind,
    /// 1-based beat number within the phase
    pub beat_in_phase: u32,
    pub deadline: Instant,
    /// Playback start on the device clock, seconds
    pub device_time: f64,
}

impl PlannedTick {
    pub fn is_warmup(&self) -> bool {
        self.phase.is_warmup()
    }
}

/// All ticks of one run plus its completion deadline
#[derive(Debug, Clone)]
pub struct TickPlan {
    anchor: Instant,
    device_anchor: f64,
    interval_secs: f64,
    ticks: Vec<PlannedTick>,
}

impl TickPlan {
    /// Lay out a run starting at `anchor` (wall side) / `device_anchor`
    /// (device clock side). `config` must already be validated.
    pub fn new(config: &RunConfig, anchor: Instant, device_anchor: f64) -> Self {
        let interval_secs = 60.0 / config.bpm.max(1) as f64;
        let mut plan = Self {
            anchor,
            device_anchor,
            interval_secs,
            ticks: Vec::with_capacity(config.total_beats() as usize),
        };

        let mut phase = Phase::initial(config);
        let mut index = 0u64;
        while let Some(kind) = phase.click_kind(config) {
            plan.ticks.push(PlannedTick {
                index,
                phase,
                kind,
                beat_in_phase: phase.beat_in_phase(),
                deadline: plan.deadline(index),
                device_time: plan.device_time(index),
            });
            phase = phase.advance(config);
            index += 1;
        }

        plan
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.interval_secs)
    }

    /// Number of beat ticks
    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }

    pub fn ticks(&self) -> &[PlannedTick] {
        &self.ticks
    }

    pub fn tick(&self, index: usize) -> Option<&PlannedTick> {
        self.ticks.get(index)
    }

    /// Offset of tick `index` from the anchor
    pub fn offset(&self, index: u64) -> Duration {
        Duration::from_secs_f64(index as f64 * self.interval_secs)
    }

    /// Wall deadline of tick `index`
    pub fn deadline(&self, index: u64) -> Instant {
        self.anchor + self.offset(index)
    }

    /// Device-clock start of tick `index`
    pub fn device_time(&self, index: u64) -> f64 {
        self.device_anchor + index as f64 * self.interval_secs
    }

    /// When the run completes: one interval after the final beat
    pub fn completion_deadline(&self) -> Instant {
        self.deadline(self.ticks.len() as u64)
    }

    /// Phase after tick `index` has fired
    pub fn phase_after(&self, index: usize) -> Phase {
        match self.ticks.get(index + 1) {
            Some(next) => next.phase,
            None => Phase::Finishing,
        }
    }
}
