//! Silent in-process audio device
//!
//! Used for `--silent` runs and for exercising the scheduler without audio
//! hardware. The device clock follows `tokio::time`, so it stays consistent
//! with paused-time tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::audio::output::{AudioDevice, DeviceState};
use crate::audio::synth::{ClickBuffer, ClickKind};
use crate::constants::DEFAULT_SAMPLE_RATE;
use crate::error::AudioError;

/// Behaviour knobs for [`StubDevice`]
#[derive(Debug, Clone)]
pub struct StubOptions {
    pub sample_rate: u32,
    /// Open into `Suspended`, like a browser context before a user gesture
    pub start_suspended: bool,
    /// Fail `open` as if no output device existed, until cleared with
    /// [`StubDevice::set_fail_open`]
    pub fail_open: bool,
}

impl Default for StubOptions {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            start_suspended: false,
            fail_open: false,
        }
    }
}

/// A click handed to the device
#[derive(Debug, Clone, PartialEq)]
pub struct PlayedClick {
    pub kind: ClickKind,
    /// Requested start on the device clock, seconds
    pub at: f64,
    /// Device clock when the request arrived
    pub requested_at: f64,
}

#[derive(Default)]
struct Clock {
    /// Device seconds accumulated before the current running span
    base: f64,
    running_since: Option<Instant>,
}

impl Clock {
    fn now(&self) -> f64 {
        match self.running_since {
            Some(since) => self.base + since.elapsed().as_secs_f64(),
            None => self.base,
        }
    }
}

struct Inner {
    state: DeviceState,
    clock: Clock,
    played: Vec<PlayedClick>,
    opens: usize,
    resumes: usize,
}

/// Device that renders nothing but records what it was asked to play
pub struct StubDevice {
    options: StubOptions,
    fail_open: AtomicBool,
    inner: Mutex<Inner>,
}

impl StubDevice {
    pub fn new(options: StubOptions) -> Self {
        Self {
            fail_open: AtomicBool::new(options.fail_open),
            options,
            inner: Mutex::new(Inner {
                state: DeviceState::Closed,
                clock: Clock::default(),
                played: Vec::new(),
                opens: 0,
                resumes: 0,
            }),
        }
    }

    /// Every click scheduled so far, in request order
    pub fn played(&self) -> Vec<PlayedClick> {
        self.inner.lock().played.clone()
    }

    pub fn played_count(&self) -> usize {
        self.inner.lock().played.len()
    }

    pub fn open_count(&self) -> usize {
        self.inner.lock().opens
    }

    pub fn resume_count(&self) -> usize {
        self.inner.lock().resumes
    }

    /// Make later `open` calls fail or succeed
    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Lose the device, as if it were unplugged. The next `open` starts over.
    pub fn disconnect(&self) {
        let mut inner = self.inner.lock();
        inner.clock.base = inner.clock.now();
        inner.clock.running_since = None;
        inner.state = DeviceState::Closed;
    }

    /// Put a running device back to sleep, as a platform might on interruption
    pub fn suspend(&self) {
        let mut inner = self.inner.lock();
        if inner.state == DeviceState::Running {
            inner.clock.base = inner.clock.now();
            inner.clock.running_since = None;
            inner.state = DeviceState::Suspended;
        }
    }
}

impl Default for StubDevice {
    fn default() -> Self {
        Self::new(StubOptions::default())
    }
}

impl AudioDevice for StubDevice {
    fn open(&self) -> Result<u32, AudioError> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(AudioError::DeviceNotFound(
                "stub device configured to fail".to_string(),
            ));
        }

        let mut inner = self.inner.lock();
        inner.opens += 1;
        if self.options.start_suspended {
            inner.state = DeviceState::Suspended;
        } else {
            inner.state = DeviceState::Running;
            inner.clock.running_since = Some(Instant::now());
        }
        Ok(self.options.sample_rate)
    }

    fn state(&self) -> DeviceState {
        self.inner.lock().state
    }

    fn resume(&self) -> BoxFuture<'_, Result<(), AudioError>> {
        async move {
            tokio::task::yield_now().await;
            let mut inner = self.inner.lock();
            match inner.state {
                DeviceState::Closed => Err(AudioError::Closed),
                DeviceState::Running => Ok(()),
                DeviceState::Suspended => {
                    inner.resumes += 1;
                    inner.state = DeviceState::Running;
                    inner.clock.running_since = Some(Instant::now());
                    Ok(())
                }
            }
        }
        .boxed()
    }

    fn sample_rate(&self) -> Option<u32> {
        match self.inner.lock().state {
            DeviceState::Closed => None,
            _ => Some(self.options.sample_rate),
        }
    }

    fn current_time(&self) -> f64 {
        self.inner.lock().clock.now()
    }

    fn schedule(&self, buffer: Arc<ClickBuffer>, at: f64) {
        let mut inner = self.inner.lock();
        let requested_at = inner.clock.now();
        tracing::trace!(kind = %buffer.kind(), at, requested_at, "Stub click");
        inner.played.push(PlayedClick {
            kind: buffer.kind(),
            at,
            requested_at,
        });
    }
}
