//! End-to-end runs of the beat scheduler against the stub device

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::time::{sleep_until, Instant};

use practice_metronome::audio::stub::{StubDevice, StubOptions};
use practice_metronome::audio::{AudioDevice, ClickBuffer, ClickKind, DeviceState};
use practice_metronome::{AudioError, BeatScheduler, RunConfig, RunState};

const BEAT_120: Duration = Duration::from_millis(500);

fn scheduler() -> BeatScheduler<StubDevice> {
    BeatScheduler::with_device(StubDevice::default())
}

/// Halfway between tick `k` and tick `k + 1` of a run anchored at `t0`
fn mid_beat(t0: Instant, interval: Duration, k: u32) -> Instant {
    t0 + interval * k + interval / 2
}

fn beat(state: &RunState) -> (bool, u32) {
    (state.is_warmup_phase, state.current_beat_in_phase)
}

#[tokio::test(start_paused = true)]
async fn full_run_visits_every_beat_and_completes_once() {
    let mut scheduler = scheduler();
    let t0 = Instant::now();
    scheduler.start(RunConfig::new(120, 2, 4)).await.unwrap();

    let mut seen = vec![beat(&scheduler.state())];
    for k in 1..6 {
        sleep_until(mid_beat(t0, BEAT_120, k)).await;
        let state = scheduler.state();
        assert!(state.is_playing);
        assert_eq!(state.completed_run_count, 0);
        seen.push(beat(&state));
    }
    assert_eq!(
        seen,
        vec![(true, 1), (true, 2), (false, 1), (false, 2), (false, 3), (false, 4)]
    );

    scheduler.wait_idle().await;
    assert_eq!(scheduler.state(), RunState::idle(1));

    let kinds: Vec<ClickKind> = scheduler
        .output()
        .device()
        .played()
        .iter()
        .map(|click| click.kind)
        .collect();
    assert_eq!(
        kinds,
        vec![
            ClickKind::Warmup,
            ClickKind::Warmup,
            ClickKind::Common,
            ClickKind::Common,
            ClickKind::Common,
            ClickKind::Accent,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn run_lasts_total_beats_times_interval() {
    let mut scheduler = scheduler();
    let t0 = Instant::now();
    scheduler.start(RunConfig::new(120, 2, 4)).await.unwrap();
    scheduler.wait_idle().await;

    let elapsed = t0.elapsed();
    let expected = BEAT_120 * 6;
    let diff = if elapsed > expected {
        elapsed - expected
    } else {
        expected - elapsed
    };
    assert!(diff <= Duration::from_millis(2), "run took {:?}", elapsed);
}

#[tokio::test(start_paused = true)]
async fn long_run_has_no_drift() {
    let mut scheduler = scheduler();
    let config = RunConfig::new(7, 0, 50);
    let interval = config.interval();
    let t0 = Instant::now();
    scheduler.start(config).await.unwrap();
    scheduler.wait_idle().await;

    let expected = interval * 50;
    let elapsed = t0.elapsed();
    assert!(elapsed >= expected);
    assert!(elapsed - expected < interval * 2, "drifted {:?}", elapsed - expected);

    let played = scheduler.output().device().played();
    let first = played[0].at;
    for (k, click) in played.iter().enumerate() {
        let expected = first + k as f64 * 60.0 / 7.0;
        assert!((click.at - expected).abs() < 1e-6);
    }
}

#[tokio::test(start_paused = true)]
async fn stop_during_main_cancels_remaining_ticks() {
    let mut scheduler = scheduler();
    let t0 = Instant::now();
    scheduler.start(RunConfig::new(120, 2, 4)).await.unwrap();

    sleep_until(mid_beat(t0, BEAT_120, 2)).await;
    assert_eq!(beat(&scheduler.state()), (false, 1));

    assert!(scheduler.stop());
    assert_eq!(scheduler.state(), RunState::idle(0));
    let played = scheduler.output().device().played_count();
    assert_eq!(played, 3);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(scheduler.output().device().played_count(), played);
    assert_eq!(scheduler.state(), RunState::idle(0));
}

#[tokio::test(start_paused = true)]
async fn stop_during_warmup_cancels_remaining_ticks() {
    let mut scheduler = scheduler();
    scheduler.start(RunConfig::new(60, 3, 2)).await.unwrap();
    assert!(scheduler.stop());

    let state = scheduler.state();
    assert!(!state.is_playing);
    assert!(state.is_warmup_phase);
    assert_eq!(state.current_beat_in_phase, 0);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(scheduler.output().device().played_count(), 1);
    assert_eq!(scheduler.stats().runs_completed, 0);
}

#[tokio::test(start_paused = true)]
async fn stop_while_final_beat_is_held_does_not_complete() {
    let mut scheduler = scheduler();
    let t0 = Instant::now();
    scheduler.start(RunConfig::new(120, 0, 2)).await.unwrap();

    sleep_until(mid_beat(t0, BEAT_120, 1)).await;
    assert_eq!(beat(&scheduler.state()), (false, 2));
    scheduler.stop();

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(scheduler.state().completed_run_count, 0);
}

#[tokio::test(start_paused = true)]
async fn restart_replaces_the_running_run() {
    let mut scheduler = scheduler();
    scheduler.start(RunConfig::new(120, 2, 4)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(750)).await;
    assert_eq!(scheduler.output().device().played_count(), 2);

    let t1 = Instant::now();
    scheduler.start(RunConfig::new(120, 1, 2)).await.unwrap();
    let mut seen = vec![beat(&scheduler.state())];
    for k in 1..3 {
        sleep_until(mid_beat(t1, BEAT_120, k)).await;
        seen.push(beat(&scheduler.state()));
    }
    assert_eq!(seen, vec![(true, 1), (false, 1), (false, 2)]);

    scheduler.wait_idle().await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    let kinds: Vec<ClickKind> = scheduler
        .output()
        .device()
        .played()
        .iter()
        .map(|click| click.kind)
        .collect();
    assert_eq!(
        kinds,
        vec![
            ClickKind::Warmup,
            ClickKind::Warmup,
            ClickKind::Warmup,
            ClickKind::Common,
            ClickKind::Accent,
        ]
    );
    assert_eq!(scheduler.state(), RunState::idle(1));
}

#[tokio::test(start_paused = true)]
async fn completed_count_tracks_natural_completions_only() {
    let mut scheduler = scheduler();
    let config = RunConfig::new(300, 1, 2);

    scheduler.start(config).await.unwrap();
    scheduler.wait_idle().await;
    scheduler.start(config).await.unwrap();
    scheduler.wait_idle().await;
    assert_eq!(scheduler.state().completed_run_count, 2);

    scheduler.start(config).await.unwrap();
    scheduler.stop();
    assert_eq!(scheduler.state().completed_run_count, 2);

    assert!(scheduler.toggle().await.unwrap());
    scheduler.wait_idle().await;
    assert_eq!(scheduler.state().completed_run_count, 3);
}

#[tokio::test(start_paused = true)]
async fn invalid_config_does_not_disturb_running_run() {
    let mut scheduler = scheduler();
    scheduler.start(RunConfig::new(120, 2, 4)).await.unwrap();
    let before = scheduler.state();

    let err = scheduler.start(RunConfig::new(0, 2, 4)).await.unwrap_err();
    assert!(err.is_invalid_config());
    assert_eq!(scheduler.state(), before);

    let err = scheduler.start(RunConfig::new(120, 2, 0)).await.unwrap_err();
    assert!(err.is_invalid_config());

    scheduler.wait_idle().await;
    assert_eq!(scheduler.output().device().played_count(), 6);
    assert_eq!(scheduler.state().completed_run_count, 1);
}

#[tokio::test(start_paused = true)]
async fn scheduler_recovers_once_audio_becomes_available() {
    let mut scheduler = BeatScheduler::with_device(StubDevice::new(StubOptions {
        fail_open: true,
        ..StubOptions::default()
    }));

    let err = scheduler.start(RunConfig::new(120, 2, 4)).await.unwrap_err();
    assert!(err.is_unsupported_audio());
    assert_eq!(scheduler.state(), RunState::default());
    assert_eq!(scheduler.output().device().played_count(), 0);

    scheduler.output().device().set_fail_open(false);
    scheduler.start(RunConfig::new(120, 2, 4)).await.unwrap();
    scheduler.wait_idle().await;

    assert_eq!(scheduler.state().completed_run_count, 1);
    assert_eq!(scheduler.output().device().played_count(), 6);
    assert_eq!(scheduler.stats().runs_started, 1);
}

#[tokio::test(start_paused = true)]
async fn suspended_device_is_resumed_once() {
    let mut scheduler = BeatScheduler::with_device(StubDevice::new(StubOptions {
        start_suspended: true,
        ..StubOptions::default()
    }));
    scheduler.start(RunConfig::new(300, 0, 1)).await.unwrap();
    scheduler.wait_idle().await;
    scheduler.start(RunConfig::new(300, 0, 1)).await.unwrap();
    scheduler.wait_idle().await;

    let device = scheduler.output().device();
    assert_eq!(device.open_count(), 1);
    assert_eq!(device.resume_count(), 1);
    assert_eq!(device.state(), DeviceState::Running);
    assert_eq!(scheduler.state().completed_run_count, 2);
}

#[tokio::test(start_paused = true)]
async fn device_suspended_between_runs_is_resumed_again() {
    let mut scheduler = scheduler();
    scheduler.start(RunConfig::new(300, 0, 1)).await.unwrap();
    scheduler.wait_idle().await;

    scheduler.output().device().suspend();
    scheduler.start(RunConfig::new(300, 0, 1)).await.unwrap();
    assert_eq!(scheduler.output().device().resume_count(), 1);
    assert!(scheduler.is_playing());
}

#[tokio::test(start_paused = true)]
async fn subscribers_see_each_transition() {
    let mut scheduler = scheduler();
    let mut rx = scheduler.subscribe();

    scheduler.start(RunConfig::new(120, 0, 2)).await.unwrap();
    assert!(rx.has_changed().unwrap());
    assert_eq!(beat(&rx.borrow_and_update()), (false, 1));

    rx.changed().await.unwrap();
    assert_eq!(beat(&rx.borrow_and_update()), (false, 2));

    rx.changed().await.unwrap();
    assert_eq!(*rx.borrow_and_update(), RunState::idle(1));
}

/// Device whose `schedule` blocks, standing in for slow dispatch
struct SlowDevice {
    inner: StubDevice,
    delay: Duration,
}

impl AudioDevice for SlowDevice {
    fn open(&self) -> Result<u32, AudioError> {
        self.inner.open()
    }

    fn state(&self) -> DeviceState {
        self.inner.state()
    }

    fn resume(&self) -> BoxFuture<'_, Result<(), AudioError>> {
        self.inner.resume()
    }

    fn sample_rate(&self) -> Option<u32> {
        self.inner.sample_rate()
    }

    fn current_time(&self) -> f64 {
        self.inner.current_time()
    }

    fn schedule(&self, buffer: Arc<ClickBuffer>, at: f64) {
        std::thread::sleep(self.delay);
        self.inner.schedule(buffer, at);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_dispatch_does_not_accumulate() {
    let mut scheduler = BeatScheduler::with_device(SlowDevice {
        inner: StubDevice::default(),
        delay: Duration::from_millis(20),
    });

    // 6 beats at 300 bpm; a relative re-arm would add 6 x 20ms
    let t0 = Instant::now();
    scheduler.start(RunConfig::new(300, 2, 4)).await.unwrap();
    scheduler.wait_idle().await;
    let elapsed = t0.elapsed();

    assert!(elapsed >= Duration::from_millis(1200));
    assert!(elapsed < Duration::from_millis(1290), "run took {:?}", elapsed);

    let played = scheduler.output().device().inner.played();
    assert_eq!(played.len(), 6);
    for pair in played.windows(2) {
        assert!((pair[1].at - pair[0].at - 0.2).abs() < 1e-9);
    }
}

#[tokio::test(start_paused = true)]
async fn lost_device_is_reported_on_next_start() {
    let mut scheduler = scheduler();
    scheduler.start(RunConfig::new(300, 0, 1)).await.unwrap();
    scheduler.wait_idle().await;

    let device = scheduler.output().device();
    device.disconnect();
    device.set_fail_open(true);

    let err = scheduler.start(RunConfig::new(300, 0, 1)).await.unwrap_err();
    assert!(err.is_unsupported_audio());
    assert_eq!(scheduler.state(), RunState::idle(1));

    scheduler.output().device().set_fail_open(false);
    scheduler.start(RunConfig::new(300, 0, 1)).await.unwrap();
    scheduler.wait_idle().await;
    assert_eq!(scheduler.output().device().open_count(), 2);
    assert_eq!(scheduler.state().completed_run_count, 2);
}
