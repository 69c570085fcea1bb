//! Beat scheduler
//!
//! Drives one run at a time through warmup and main phases. A run is laid out
//! as a [`TickPlan`] when it starts; a single tokio task then sleeps until
//! each absolute deadline and fires the tick. The first tick fires inside
//! `start` itself.
//!
//! All state lives behind one mutex together with a run generation number.
//! A tick only takes effect if the generation it was spawned with is still
//! current, and `stop` bumps the generation under that same lock, so once
//! `stop` returns no earlier tick can play or publish anything.

pub mod phase;
pub mod plan;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::audio::output::{AudioDevice, AudioOutput};
use crate::config::RunConfig;
use crate::constants::DEFAULT_LOOKAHEAD_MS;
use crate::error::Result;

pub use phase::{Phase, RunState};
pub use plan::{PlannedTick, TickPlan};

/// Counters kept across runs
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchedulerStats {
    pub runs_started: u64,
    pub runs_completed: u64,
    pub runs_stopped: u64,
    pub ticks_fired: u64,
    /// Largest gap seen between a tick's deadline and when it actually ran
    pub max_lateness: Duration,
}

struct Shared {
    phase: Phase,
    generation: u64,
    stats: SchedulerStats,
    state_tx: watch::Sender<RunState>,
}

impl Shared {
    fn fire<D: AudioDevice>(
        &mut self,
        plan: &TickPlan,
        index: usize,
        output: &AudioOutput<D>,
        now: Instant,
    ) {
        let Some(tick) = plan.tick(index) else {
            return;
        };
        debug_assert_eq!(self.phase, tick.phase);

        let buffer = output.get_or_synthesize(tick.kind);
        output.play(&buffer, tick.device_time);

        self.phase = plan.phase_after(index);
        self.state_tx.send_modify(|state| {
            state.is_playing = true;
            state.is_warmup_phase = tick.is_warmup();
            state.current_beat_in_phase = tick.beat_in_phase;
        });

        let lateness = now.saturating_duration_since(tick.deadline);
        self.stats.ticks_fired += 1;
        self.stats.max_lateness = self.stats.max_lateness.max(lateness);

        tracing::debug!(
            tick = tick.index,
            warmup = tick.is_warmup(),
            beat = tick.beat_in_phase,
            kind = %tick.kind,
            lateness_us = lateness.as_micros() as u64,
            "Tick"
        );
        if lateness > plan.interval() / 2 {
            tracing::warn!(
                tick = tick.index,
                lateness_ms = lateness.as_millis() as u64,
                "Tick fired more than half a beat late"
            );
        }
    }

    fn complete(&mut self) {
        self.phase = Phase::Idle;
        self.stats.runs_completed += 1;
        self.state_tx
            .send_modify(|state| *state = RunState::idle(state.completed_run_count + 1));
        tracing::info!(
            completed = self.state_tx.borrow().completed_run_count,
            "Run complete"
        );
    }
}

/// Metronome state machine bound to one audio output
pub struct BeatScheduler<D: AudioDevice> {
    output: Arc<AudioOutput<D>>,
    shared: Arc<Mutex<Shared>>,
    config: RunConfig,
    lookahead: Duration,
    task: Option<JoinHandle<()>>,
}

impl<D: AudioDevice> BeatScheduler<D> {
    pub fn new(output: AudioOutput<D>) -> Self {
        let (state_tx, _) = watch::channel(RunState::default());
        Self {
            output: Arc::new(output),
            shared: Arc::new(Mutex::new(Shared {
                phase: Phase::Idle,
                generation: 0,
                stats: SchedulerStats::default(),
                state_tx,
            })),
            config: RunConfig::default(),
            lookahead: Duration::from_millis(DEFAULT_LOOKAHEAD_MS),
            task: None,
        }
    }

    /// Scheduler over a bare device
    pub fn with_device(device: D) -> Self {
        Self::new(AudioOutput::new(device))
    }

    /// How far ahead on the device clock clicks are placed
    pub fn with_lookahead(mut self, lookahead: Duration) -> Self {
        self.lookahead = lookahead;
        self
    }

    /// Configuration `toggle` starts with until `start` is given another
    pub fn with_config(mut self, config: RunConfig) -> Self {
        self.config = config;
        self
    }

    pub fn output(&self) -> &AudioOutput<D> {
        &self.output
    }

    /// Last configuration provided
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn state(&self) -> RunState {
        *self.shared.lock().state_tx.borrow()
    }

    pub fn phase(&self) -> Phase {
        self.shared.lock().phase
    }

    pub fn is_playing(&self) -> bool {
        self.state().is_playing
    }

    /// Receiver that sees every published state change
    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.shared.lock().state_tx.subscribe()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.shared.lock().stats.clone()
    }

    /// Start a run, replacing any run in progress.
    ///
    /// Fails with `InvalidConfig` or `UnsupportedAudio` without touching the
    /// current state. On success the first beat has already fired.
    pub async fn start(&mut self, config: RunConfig) -> Result<()> {
        if let Err(e) = config.validate() {
            tracing::warn!("Rejected run configuration: {}", e);
            return Err(e);
        }
        self.config = config;

        let ready = match self.output.acquire().await {
            Ok(ready) => ready,
            Err(e) => {
                tracing::warn!("Audio output unavailable: {}", e);
                return Err(e.into());
            }
        };

        self.stop();

        let anchor = Instant::now();
        let device_anchor = self.output.current_time() + self.lookahead.as_secs_f64();
        let plan = Arc::new(TickPlan::new(&config, anchor, device_anchor));

        let generation = {
            let mut shared = self.shared.lock();
            shared.generation += 1;
            shared.phase = Phase::initial(&config);
            shared.stats.runs_started += 1;

            let is_warmup = shared.phase.is_warmup();
            shared.state_tx.send_modify(|state| {
                state.is_playing = true;
                state.is_warmup_phase = is_warmup;
                state.current_beat_in_phase = 0;
            });

            tracing::info!(
                bpm = config.bpm,
                warmup = config.warmup_beats,
                main = config.main_beats,
                sample_rate = ready.sample_rate,
                "Run started"
            );

            shared.fire(&plan, 0, &self.output, anchor);
            shared.generation
        };

        self.task = Some(tokio::spawn(drive(
            plan,
            generation,
            Arc::clone(&self.shared),
            Arc::clone(&self.output),
        )));
        Ok(())
    }

    /// Abort the current run. Returns false if nothing was running.
    pub fn stop(&mut self) -> bool {
        let stopped = {
            let mut shared = self.shared.lock();
            if shared.phase.is_active() {
                shared.generation += 1;
                shared.phase = Phase::Idle;
                shared.stats.runs_stopped += 1;
                shared
                    .state_tx
                    .send_modify(|state| *state = RunState::idle(state.completed_run_count));
                true
            } else {
                false
            }
        };

        if let Some(task) = self.task.take() {
            task.abort();
        }
        if stopped {
            tracing::info!("Run stopped");
        }
        stopped
    }

    /// Stop if running, otherwise start with the last configuration.
    ///
    /// Returns whether a run is in progress afterwards.
    pub async fn toggle(&mut self) -> Result<bool> {
        if self.is_playing() {
            self.stop();
            Ok(false)
        } else {
            let config = self.config;
            self.start(config).await?;
            Ok(true)
        }
    }

    /// Resolve once no run is in progress
    pub async fn wait_idle(&self) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|state| !state.is_playing).await;
    }
}

impl<D: AudioDevice> Drop for BeatScheduler<D> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Fire ticks `1..` at their deadlines, then complete the run
async fn drive<D: AudioDevice>(
    plan: Arc<TickPlan>,
    generation: u64,
    shared: Arc<Mutex<Shared>>,
    output: Arc<AudioOutput<D>>,
) {
    for index in 1..plan.len() {
        tokio::time::sleep_until(plan.deadline(index as u64)).await;

        let mut guard = shared.lock();
        if guard.generation != generation {
            return;
        }
        guard.fire(&plan, index, &output, Instant::now());
    }

    tokio::time::sleep_until(plan.completion_deadline()).await;

    let mut guard = shared.lock();
    if guard.generation == generation {
        guard.complete();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::stub::{StubDevice, StubOptions};
    use crate::audio::synth::ClickKind;

    fn scheduler() -> BeatScheduler<StubDevice> {
        BeatScheduler::with_device(StubDevice::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_fires_first_beat_immediately() {
        let mut scheduler = scheduler();
        scheduler.start(RunConfig::new(120, 2, 4)).await.unwrap();

        let state = scheduler.state();
        assert!(state.is_playing);
        assert!(state.is_warmup_phase);
        assert_eq!(state.current_beat_in_phase, 1);
        assert_eq!(scheduler.phase(), Phase::Warmup(1));
        assert_eq!(scheduler.output().device().played_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_warmup_starts_in_main() {
        let mut scheduler = scheduler();
        scheduler.start(RunConfig::new(120, 0, 5)).await.unwrap();

        let state = scheduler.state();
        assert!(!state.is_warmup_phase);
        assert_eq!(state.current_beat_in_phase, 1);
        assert_eq!(scheduler.output().device().played()[0].kind, ClickKind::Common);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_config_leaves_idle() {
        let mut scheduler = scheduler();
        let err = scheduler.start(RunConfig::new(0, 2, 4)).await.unwrap_err();
        assert!(err.is_invalid_config());
        assert_eq!(scheduler.state(), RunState::default());
        assert_eq!(scheduler.output().device().open_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_when_idle_is_noop() {
        let mut scheduler = scheduler();
        assert!(!scheduler.stop());
        assert_eq!(scheduler.stats().runs_stopped, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggle_uses_last_config() {
        let mut scheduler = scheduler().with_config(RunConfig::new(60, 0, 3));
        assert!(scheduler.toggle().await.unwrap());
        assert_eq!(scheduler.state().current_beat_in_phase, 1);
        assert!(!scheduler.state().is_warmup_phase);

        assert!(!scheduler.toggle().await.unwrap());
        assert_eq!(scheduler.state(), RunState::idle(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clicks_placed_ahead_on_device_clock() {
        let mut scheduler = scheduler().with_lookahead(Duration::from_millis(100));
        scheduler.start(RunConfig::new(120, 1, 2)).await.unwrap();
        scheduler.wait_idle().await;

        let played = scheduler.output().device().played();
        assert_eq!(played.len(), 3);
        for (k, click) in played.iter().enumerate() {
            let at = click.at;
            assert!((at - (0.1 + k as f64 * 0.5)).abs() < 1e-9, "tick {} at {}", k, at);
            // Each click is requested one lookahead before it sounds
            let lead = at - click.requested_at;
            assert!((lead - 0.1).abs() < 2e-3, "tick {} lead {}", k, lead);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_track_runs() {
        let mut scheduler = scheduler();
        scheduler.start(RunConfig::new(300, 0, 2)).await.unwrap();
        scheduler.wait_idle().await;
        scheduler.start(RunConfig::new(300, 0, 2)).await.unwrap();
        scheduler.stop();

        let stats = scheduler.stats();
        assert_eq!(stats.runs_started, 2);
        assert_eq!(stats.runs_completed, 1);
        assert_eq!(stats.runs_stopped, 1);
        assert_eq!(stats.ticks_fired, 3);
        assert!(stats.max_lateness < Duration::from_millis(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_audio_surfaces() {
        let mut scheduler = BeatScheduler::with_device(StubDevice::new(StubOptions {
            fail_open: true,
            ..StubOptions::default()
        }));
        let err = scheduler.start(RunConfig::new(120, 2, 4)).await.unwrap_err();
        assert!(err.is_unsupported_audio());
        assert_eq!(scheduler.state(), RunState::default());
        assert_eq!(scheduler.phase(), Phase::Idle);
    }
}
