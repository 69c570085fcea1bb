//! Audio output: device capability and click buffer cache

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;

use crate::audio::synth::{synthesize, ClickBuffer, ClickKind};
use crate::error::AudioError;

/// Lifecycle of the hardware audio resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Not opened yet, or torn down
    Closed,
    /// Opened but not rendering; needs a resume before clicks are audible
    Suspended,
    /// Rendering; the device clock advances
    Running,
}

/// Capability interface over a playback device.
///
/// `current_time` and the `at` argument of `schedule` are seconds on the
/// device's own monotonic clock, not wall-clock time.
pub trait AudioDevice: Send + Sync + 'static {
    /// Open the device and return its native sample rate.
    fn open(&self) -> Result<u32, AudioError>;

    fn state(&self) -> DeviceState;

    /// Bring a suspended device to `Running`.
    fn resume(&self) -> BoxFuture<'_, Result<(), AudioError>>;

    /// Native sample rate, once opened
    fn sample_rate(&self) -> Option<u32>;

    /// Current device clock in seconds
    fn current_time(&self) -> f64;

    /// Queue `buffer` to start at device time `at`. Fire-and-forget.
    fn schedule(&self, buffer: Arc<ClickBuffer>, at: f64);

    /// Clicks the device had to discard
    fn dropped_clicks(&self) -> u64 {
        0
    }
}

/// Proof that the device is open and running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ready {
    pub sample_rate: u32,
}

struct ClickCache {
    sample_rate: u32,
    buffers: HashMap<ClickKind, Arc<ClickBuffer>>,
}

/// Owns the playback device and the rendered click buffers
pub struct AudioOutput<D: AudioDevice> {
    device: D,
    cache: Mutex<ClickCache>,
}

impl<D: AudioDevice> AudioOutput<D> {
    pub fn new(device: D) -> Self {
        Self {
            device,
            cache: Mutex::new(ClickCache {
                sample_rate: 0,
                buffers: HashMap::new(),
            }),
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// Open and resume the device. Cheap when already running.
    ///
    /// The first successful open pre-renders every click kind.
    pub async fn acquire(&self) -> Result<Ready, AudioError> {
        let sample_rate = match (self.device.state(), self.device.sample_rate()) {
            (DeviceState::Closed, _) | (_, None) => {
                let sample_rate = self.device.open()?;
                tracing::info!(sample_rate, "Audio device opened");
                self.prerender(sample_rate);
                sample_rate
            }
            (_, Some(sample_rate)) => sample_rate,
        };

        if self.device.state() == DeviceState::Suspended {
            tracing::debug!("Audio device suspended, resuming");
            self.device.resume().await?;
            tracing::info!("Audio device resumed");
        }

        match self.device.state() {
            DeviceState::Running => Ok(Ready { sample_rate }),
            DeviceState::Suspended => Err(AudioError::ResumeFailed(
                "device still suspended after resume".to_string(),
            )),
            DeviceState::Closed => Err(AudioError::Closed),
        }
    }

    fn prerender(&self, sample_rate: u32) {
        for kind in ClickKind::ALL {
            self.cached(kind, sample_rate);
        }
    }

    /// Rendered buffer for `kind` at the device's sample rate
    pub fn get_or_synthesize(&self, kind: ClickKind) -> Arc<ClickBuffer> {
        let sample_rate = self
            .device
            .sample_rate()
            .unwrap_or(crate::constants::DEFAULT_SAMPLE_RATE);
        self.cached(kind, sample_rate)
    }

    fn cached(&self, kind: ClickKind, sample_rate: u32) -> Arc<ClickBuffer> {
        let mut cache = self.cache.lock();
        if cache.sample_rate != sample_rate {
            if !cache.buffers.is_empty() {
                tracing::debug!(
                    old = cache.sample_rate,
                    new = sample_rate,
                    "Sample rate changed, dropping cached clicks"
                );
            }
            cache.buffers.clear();
            cache.sample_rate = sample_rate;
        }
        cache
            .buffers
            .entry(kind)
            .or_insert_with(|| Arc::new(synthesize(kind, sample_rate)))
            .clone()
    }

    /// Schedule `buffer` to start at device time `at`
    pub fn play(&self, buffer: &Arc<ClickBuffer>, at: f64) {
        self.device.schedule(Arc::clone(buffer), at);
    }

    /// Current device clock in seconds
    pub fn current_time(&self) -> f64 {
        self.device.current_time()
    }

    /// Number of click kinds currently rendered
    pub fn cached_kinds(&self) -> usize {
        self.cache.lock().buffers.len()
    }
}
