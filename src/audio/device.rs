//! cpal output device with a sample-counting clock
//!
//! The `cpal::Stream` lives on a dedicated thread (it is not `Send` on every
//! host). Scheduled clicks reach the output callback through a lock-free
//! queue and are mixed in at their exact start frame, so the device clock is
//! simply the number of frames rendered so far.
//!
//! A stream error marks the device failed. It then reports `Closed`, and the
//! next `open` tears the dead stream down and builds a fresh one.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam::queue::ArrayQueue;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;

use crate::audio::output::{AudioDevice, DeviceState};
use crate::audio::synth::ClickBuffer;
use crate::constants::{CLICK_QUEUE_CAPACITY, MAX_VOICES};
use crate::error::AudioError;

/// Output device description for listings
#[derive(Debug, Clone, Serialize)]
pub struct OutputDeviceInfo {
    pub name: String,
    pub is_default: bool,
    pub sample_rates: Vec<u32>,
    pub channels: Vec<u16>,
}

/// List all output devices of the default host
pub fn list_output_devices() -> Vec<OutputDeviceInfo> {
    let host = cpal::default_host();
    let default_name = host.default_output_device().and_then(|d| d.name().ok());

    let mut devices = Vec::new();
    if let Ok(outputs) = host.output_devices() {
        for device in outputs {
            let Ok(name) = device.name() else { continue };
            let (sample_rates, channels) = output_capabilities(&device);
            devices.push(OutputDeviceInfo {
                is_default: default_name.as_ref() == Some(&name),
                name,
                sample_rates,
                channels,
            });
        }
    }
    devices
}

fn output_capabilities(device: &cpal::Device) -> (Vec<u32>, Vec<u16>) {
    let mut rates = Vec::new();
    let mut chans = Vec::new();

    if let Ok(configs) = device.supported_output_configs() {
        for config in configs {
            for rate_val in [44100u32, 48000, 88200, 96000, 176400, 192000] {
                let rate = cpal::SampleRate(rate_val);
                if rate >= config.min_sample_rate()
                    && rate <= config.max_sample_rate()
                    && !rates.contains(&rate_val)
                {
                    rates.push(rate_val);
                }
            }
            if !chans.contains(&config.channels()) {
                chans.push(config.channels());
            }
        }
    }

    rates.sort();
    chans.sort();
    (rates, chans)
}

/// Find an output device by name, or the default one
fn find_output_device(name: Option<&str>) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();

    let Some(name) = name else {
        return host
            .default_output_device()
            .ok_or_else(|| AudioError::DeviceNotFound("No default output device".to_string()));
    };

    let devices = host
        .output_devices()
        .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;
    for device in devices {
        if device.name().ok().as_deref() == Some(name) {
            return Ok(device);
        }
    }

    Err(AudioError::DeviceNotFound(name.to_string()))
}

/// A click waiting to be mixed in
struct ScheduledClick {
    buffer: Arc<ClickBuffer>,
    start_frame: u64,
}

/// A click being mixed
struct Voice {
    buffer: Arc<ClickBuffer>,
    start_frame: u64,
    position: usize,
}

impl Voice {
    fn finished(&self) -> bool {
        self.position >= self.buffer.len()
    }
}

/// State shared between the control side and the output callback
struct StreamShared {
    frames_rendered: AtomicU64,
    sample_rate: AtomicU32,
    /// Device seconds carried over from streams that were torn down (f64 bits)
    clock_base: AtomicU64,
    running: AtomicBool,
    failed: AtomicBool,
    pending: ArrayQueue<ScheduledClick>,
    dropped: AtomicU64,
}

impl StreamShared {
    fn new() -> Self {
        Self {
            frames_rendered: AtomicU64::new(0),
            sample_rate: AtomicU32::new(0),
            clock_base: AtomicU64::new(0f64.to_bits()),
            running: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            pending: ArrayQueue::new(CLICK_QUEUE_CAPACITY),
            dropped: AtomicU64::new(0),
        }
    }

    fn now(&self) -> f64 {
        let base = f64::from_bits(self.clock_base.load(Ordering::Relaxed));
        let sample_rate = self.sample_rate.load(Ordering::Relaxed);
        if sample_rate == 0 {
            return base;
        }
        base + self.frames_rendered.load(Ordering::Relaxed) as f64 / sample_rate as f64
    }

    fn mark_failed(&self, err: &dyn std::fmt::Display) {
        tracing::error!("Output stream error: {}", err);
        self.failed.store(true, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
    }

    /// Fold rendered frames into the clock base so a new stream can count
    /// from zero without the clock going backwards
    fn rebase_clock(&self) {
        let now = self.now();
        self.clock_base.store(now.to_bits(), Ordering::Relaxed);
        self.frames_rendered.store(0, Ordering::Relaxed);
        while self.pending.pop().is_some() {}
    }
}

/// Output callback state: mixes queued clicks in at their start frames.
///
/// At most `MAX_VOICES` clicks sound at once; extra clicks are counted as
/// dropped so the voice list never reallocates in the callback.
struct Mixer {
    voices: Vec<Voice>,
}

impl Mixer {
    fn new() -> Self {
        Self {
            voices: Vec::with_capacity(MAX_VOICES),
        }
    }

    fn render(&mut self, shared: &StreamShared, data: &mut [f32], channels: usize) {
        while let Some(click) = shared.pending.pop() {
            if self.voices.len() >= MAX_VOICES {
                shared.dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            self.voices.push(Voice {
                buffer: click.buffer,
                start_frame: click.start_frame,
                position: 0,
            });
        }

        let first_frame = shared.frames_rendered.load(Ordering::Relaxed);
        let mut frames = 0u64;
        for frame in data.chunks_mut(channels.max(1)) {
            let now = first_frame + frames;
            let mut value = 0.0f32;
            for voice in self.voices.iter_mut() {
                if now >= voice.start_frame && !voice.finished() {
                    value += voice.buffer.samples()[voice.position];
                    voice.position += 1;
                }
            }
            frame.fill(value);
            frames += 1;
        }

        self.voices.retain(|voice| !voice.finished());
        shared.frames_rendered.fetch_add(frames, Ordering::Relaxed);
    }
}

enum StreamCommand {
    Resume(oneshot::Sender<Result<(), AudioError>>),
    Close,
}

struct StreamHandle {
    command_tx: Sender<StreamCommand>,
    thread: Option<JoinHandle<()>>,
    sample_rate: u32,
}

/// Hardware output device backed by cpal
pub struct CpalDevice {
    device_name: Option<String>,
    shared: Arc<StreamShared>,
    handle: Mutex<Option<StreamHandle>>,
}

impl CpalDevice {
    /// Use the default output device
    pub fn new() -> Self {
        Self::with_device_name(None)
    }

    /// Use the output device with the given name, or the default if `None`
    pub fn with_device_name(device_name: Option<String>) -> Self {
        Self {
            device_name,
            shared: Arc::new(StreamShared::new()),
            handle: Mutex::new(None),
        }
    }

    /// Stop the stream and release the device
    pub fn close(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            self.shutdown(handle);
            tracing::info!("Audio device closed");
        }
    }

    fn shutdown(&self, mut handle: StreamHandle) {
        let _ = handle.command_tx.send(StreamCommand::Close);
        if let Some(thread) = handle.thread.take() {
            let _ = thread.join();
        }
        self.shared.running.store(false, Ordering::SeqCst);
    }
}

impl Default for CpalDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CpalDevice {
    fn drop(&mut self) {
        self.close();
    }
}

impl AudioDevice for CpalDevice {
    fn open(&self) -> Result<u32, AudioError> {
        let mut handle = self.handle.lock();
        if self.shared.failed.load(Ordering::SeqCst) {
            if let Some(dead) = handle.take() {
                self.shutdown(dead);
            }
            self.shared.failed.store(false, Ordering::SeqCst);
            tracing::info!("Reopening output device after stream failure");
        }
        if let Some(existing) = handle.as_ref() {
            return Ok(existing.sample_rate);
        }
        self.shared.rebase_clock();

        let (ready_tx, ready_rx) = bounded::<Result<u32, AudioError>>(1);
        let (command_tx, command_rx) = unbounded::<StreamCommand>();
        let shared = Arc::clone(&self.shared);
        let device_name = self.device_name.clone();

        let thread = thread::Builder::new()
            .name("metronome-output".to_string())
            .spawn(move || run_stream(device_name, shared, ready_tx, command_rx))
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        let opened = ready_rx
            .recv()
            .map_err(|_| AudioError::StreamError("output thread exited during open".to_string()))
            .and_then(|result| result);

        match opened {
            Ok(sample_rate) => {
                *handle = Some(StreamHandle {
                    command_tx,
                    thread: Some(thread),
                    sample_rate,
                });
                Ok(sample_rate)
            }
            Err(e) => {
                let _ = thread.join();
                Err(e)
            }
        }
    }

    fn state(&self) -> DeviceState {
        if self.handle.lock().is_none() || self.shared.failed.load(Ordering::SeqCst) {
            DeviceState::Closed
        } else if self.shared.running.load(Ordering::SeqCst) {
            DeviceState::Running
        } else {
            DeviceState::Suspended
        }
    }

    fn resume(&self) -> BoxFuture<'_, Result<(), AudioError>> {
        let request = self.handle.lock().as_ref().map(|handle| {
            let (reply_tx, reply_rx) = oneshot::channel();
            handle
                .command_tx
                .send(StreamCommand::Resume(reply_tx))
                .map(|_| reply_rx)
        });

        async move {
            match request {
                None | Some(Err(_)) => Err(AudioError::Closed),
                Some(Ok(reply_rx)) => reply_rx.await.map_err(|_| {
                    AudioError::ResumeFailed("output thread exited".to_string())
                })?,
            }
        }
        .boxed()
    }

    fn sample_rate(&self) -> Option<u32> {
        self.handle.lock().as_ref().map(|h| h.sample_rate)
    }

    fn current_time(&self) -> f64 {
        self.shared.now()
    }

    fn schedule(&self, buffer: Arc<ClickBuffer>, at: f64) {
        let sample_rate = self.shared.sample_rate.load(Ordering::Relaxed) as f64;
        let base = f64::from_bits(self.shared.clock_base.load(Ordering::Relaxed));
        let start_frame = ((at - base).max(0.0) * sample_rate).round() as u64;
        if self
            .shared
            .pending
            .push(ScheduledClick {
                buffer,
                start_frame,
            })
            .is_err()
        {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(at, "Click queue full, dropping click");
        }
    }

    fn dropped_clicks(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

/// Body of the output thread: owns the stream until told to close
fn run_stream(
    device_name: Option<String>,
    shared: Arc<StreamShared>,
    ready_tx: Sender<Result<u32, AudioError>>,
    command_rx: Receiver<StreamCommand>,
) {
    let stream = match build_stream(device_name.as_deref(), &shared) {
        Ok((stream, sample_rate)) => {
            let _ = ready_tx.send(Ok(sample_rate));
            stream
        }
        Err(e) => {
            tracing::error!("Failed to open output stream: {}", e);
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    while let Ok(command) = command_rx.recv() {
        match command {
            StreamCommand::Resume(reply) => {
                let result = stream
                    .play()
                    .map_err(|e| AudioError::ResumeFailed(e.to_string()));
                if result.is_ok() {
                    shared.running.store(true, Ordering::SeqCst);
                }
                let _ = reply.send(result);
            }
            StreamCommand::Close => break,
        }
    }

    shared.running.store(false, Ordering::SeqCst);
    // Stream is dropped here, releasing the device
}

fn build_stream(
    device_name: Option<&str>,
    shared: &Arc<StreamShared>,
) -> Result<(cpal::Stream, u32), AudioError> {
    let device = find_output_device(device_name)?;
    let name = device.name().unwrap_or_else(|_| "Unknown".to_string());

    let supported = device
        .default_output_config()
        .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;
    if supported.sample_format() != cpal::SampleFormat::F32 {
        return Err(AudioError::UnsupportedFormat(format!(
            "{:?} output (only f32 is supported)",
            supported.sample_format()
        )));
    }

    let config: cpal::StreamConfig = supported.config();
    let sample_rate = config.sample_rate.0;
    let channels = config.channels as usize;
    shared.sample_rate.store(sample_rate, Ordering::SeqCst);

    let callback_shared = Arc::clone(shared);
    let error_shared = Arc::clone(shared);
    let mut mixer = Mixer::new();

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                mixer.render(&callback_shared, data, channels);
            },
            move |err| error_shared.mark_failed(&err),
            None,
        )
        .map_err(|e| AudioError::StreamError(e.to_string()))?;

    // Some hosts start streams immediately; hold it until resume
    if let Err(e) = stream.pause() {
        tracing::debug!("Output stream cannot be paused: {}", e);
    }

    tracing::info!(device = %name, sample_rate, channels, "Output stream ready");
    Ok((stream, sample_rate))
}
