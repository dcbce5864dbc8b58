//! # Audio Device Management
//!
//! cpal-backed implementations of the two device seams:
//! - **MicrophoneInput** implements [`AudioInput`] for the capture engine
//! - **SpeakerOutput** implements [`AudioOutput`] for the playback scheduler
//!
//! cpal streams are not `Send` on every platform, so each stream is built, played and
//! dropped on its own named thread. The owning handle talks to that thread through a
//! stop channel; releasing the handle signals the thread and joins it, which guarantees
//! the device is released before `stop()`/`close()` returns.

use crate::audio::capture::{AudioInput, FrameAssembler, InputHandle};
use crate::audio::codec::{self, LinearResampler};
use crate::audio::playback::{AudioOutput, PlaybackRenderer, PlaybackUnit, RendererOutput};
use crate::error::{AppError, AppResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// Pick the stream rate: the preferred rate when any supported range covers it,
/// otherwise the device default (audio is then resampled at the edge).
pub fn pick_sample_rate(supported: &[(u32, u32)], preferred: u32, default: u32) -> u32 {
    if supported
        .iter()
        .any(|&(min, max)| min <= preferred && preferred <= max)
    {
        preferred
    } else {
        default
    }
}

/// Summary of the audio devices visible to the default host.
#[derive(Debug, Clone)]
pub struct DeviceSummary {
    pub host: String,
    pub input_device: Option<String>,
    pub output_device: Option<String>,
}

impl DeviceSummary {
    pub fn describe(&self) -> String {
        format!(
            "host={} input={} output={}",
            self.host,
            self.input_device.as_deref().unwrap_or("<none>"),
            self.output_device.as_deref().unwrap_or("<none>")
        )
    }
}

/// Device detection utilities
pub struct DeviceManager;

impl DeviceManager {
    pub fn summary() -> DeviceSummary {
        let host = cpal::default_host();
        DeviceSummary {
            host: host.id().name().to_string(),
            input_device: host.default_input_device().and_then(|d| d.name().ok()),
            output_device: host.default_output_device().and_then(|d| d.name().ok()),
        }
    }

    fn input_device() -> AppResult<Device> {
        cpal::default_host()
            .default_input_device()
            .ok_or_else(|| AppError::DeviceUnavailable("no input device available".to_string()))
    }

    fn output_device() -> AppResult<Device> {
        cpal::default_host()
            .default_output_device()
            .ok_or_else(|| AppError::DeviceUnavailable("no output device available".to_string()))
    }

    /// Default input config, switched to `preferred_rate` when the device supports it.
    fn input_config(device: &Device, preferred_rate: u32) -> AppResult<(StreamConfig, SampleFormat)> {
        let default = device.default_input_config()?;
        let ranges: Vec<(u32, u32)> = device
            .supported_input_configs()?
            .filter(|range| range.sample_format() == default.sample_format())
            .map(|range| (range.min_sample_rate().0, range.max_sample_rate().0))
            .collect();

        let mut config: StreamConfig = default.config();
        config.sample_rate = cpal::SampleRate(pick_sample_rate(
            &ranges,
            preferred_rate,
            default.sample_rate().0,
        ));
        Ok((config, default.sample_format()))
    }

    fn output_config(device: &Device, preferred_rate: u32) -> AppResult<(StreamConfig, SampleFormat)> {
        let default = device.default_output_config()?;
        let ranges: Vec<(u32, u32)> = device
            .supported_output_configs()?
            .filter(|range| range.sample_format() == default.sample_format())
            .map(|range| (range.min_sample_rate().0, range.max_sample_rate().0))
            .collect();

        let mut config: StreamConfig = default.config();
        config.sample_rate = cpal::SampleRate(pick_sample_rate(
            &ranges,
            preferred_rate,
            default.sample_rate().0,
        ));
        Ok((config, default.sample_format()))
    }
}

/// Default system microphone.
#[derive(Debug, Default)]
pub struct MicrophoneInput;

impl MicrophoneInput {
    pub fn new() -> Self {
        Self
    }
}

impl AudioInput for MicrophoneInput {
    fn open(&self, assembler: FrameAssembler) -> AppResult<InputHandle> {
        let (ready_tx, ready_rx) = std_mpsc::channel::<AppResult<String>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("mic-capture".to_string())
            .spawn(move || {
                let (stream, name) = match build_microphone_stream(assembler) {
                    Ok(opened) => opened,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(name));

                // Blocks until the handle is released (message or sender dropped)
                let _ = stop_rx.recv();
                drop(stream);
                debug!("Microphone stream dropped");
            })
            .map_err(|e| AppError::DeviceUnavailable(format!("failed to spawn capture thread: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(name)) => {
                info!(device = %name, "Microphone opened");
                Ok(InputHandle::new(move || {
                    let _ = stop_tx.send(());
                    if thread.join().is_err() {
                        warn!("Capture thread panicked while releasing the microphone");
                    }
                }))
            }
            Ok(Err(err)) => {
                let _ = thread.join();
                Err(err)
            }
            Err(_) => {
                let _ = thread.join();
                Err(AppError::DeviceUnavailable(
                    "capture thread exited before the microphone opened".to_string(),
                ))
            }
        }
    }
}

fn build_microphone_stream(assembler: FrameAssembler) -> AppResult<(Stream, String)> {
    let device = DeviceManager::input_device()?;
    let name = device.name().unwrap_or_else(|_| "unknown input".to_string());
    let (config, format) = DeviceManager::input_config(&device, assembler.sample_rate())?;

    debug!(
        device = %name,
        channels = config.channels,
        sample_rate = config.sample_rate.0,
        format = ?format,
        "Microphone stream config"
    );

    let stream = match format {
        SampleFormat::F32 => build_input::<f32>(&device, &config, assembler)?,
        SampleFormat::I16 => build_input::<i16>(&device, &config, assembler)?,
        SampleFormat::U16 => build_input::<u16>(&device, &config, assembler)?,
        other => {
            return Err(AppError::DeviceUnavailable(format!(
                "unsupported input sample format {:?}",
                other
            )))
        }
    };
    stream.play()?;

    Ok((stream, name))
}

fn build_input<T>(device: &Device, config: &StreamConfig, mut assembler: FrameAssembler) -> AppResult<Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels as usize;
    let device_rate = config.sample_rate.0;
    let target_rate = assembler.sample_rate();
    let mut interleaved: Vec<f32> = Vec::new();
    let mut mono: Vec<f32> = Vec::new();
    // Phase carries across callbacks so the converted stream stays continuous
    let mut resampler = LinearResampler::new(device_rate, target_rate);
    let mut resampled: Vec<f32> = Vec::new();

    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            // Format conversion only; framing and channel send never block
            interleaved.clear();
            interleaved.extend(data.iter().map(|&s| f32::from_sample(s)));
            codec::downmix_to_mono(&interleaved, channels, &mut mono);

            if resampler.is_passthrough() {
                assembler.push(&mono);
            } else {
                resampled.clear();
                resampler.process(&mono, &mut resampled);
                assembler.push(&resampled);
            }
        },
        |err| warn!(error = %err, "Microphone stream error"),
        None,
    )?;

    Ok(stream)
}

/// Default system speaker, rendering from a [`PlaybackRenderer`].
pub struct SpeakerOutput {
    output: RendererOutput,
    sample_rate: u32,
    stop_tx: Mutex<Option<std_mpsc::Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

type SpeakerReady = AppResult<(String, u32, Arc<Mutex<PlaybackRenderer>>)>;

impl SpeakerOutput {
    /// Open the default output device, preferring `preferred_rate`.
    pub fn open(preferred_rate: u32) -> AppResult<Self> {
        let (ready_tx, ready_rx) = std_mpsc::channel::<SpeakerReady>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("speaker-playback".to_string())
            .spawn(move || {
                let (stream, ready) = match build_speaker_stream(preferred_rate) {
                    Ok(opened) => opened,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(ready));

                let _ = stop_rx.recv();
                drop(stream);
                debug!("Speaker stream dropped");
            })
            .map_err(|e| AppError::DeviceUnavailable(format!("failed to spawn playback thread: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok((name, sample_rate, renderer))) => {
                info!(device = %name, sample_rate, "Speaker opened");
                Ok(Self {
                    output: RendererOutput::new(renderer),
                    sample_rate,
                    stop_tx: Mutex::new(Some(stop_tx)),
                    thread: Mutex::new(Some(thread)),
                })
            }
            Ok(Err(err)) => {
                let _ = thread.join();
                Err(err)
            }
            Err(_) => {
                let _ = thread.join();
                Err(AppError::DeviceUnavailable(
                    "playback thread exited before the speaker opened".to_string(),
                ))
            }
        }
    }

    /// Rate the device actually runs at.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl AudioOutput for SpeakerOutput {
    fn current_time(&self) -> f64 {
        self.output.current_time()
    }

    fn schedule(&self, unit: PlaybackUnit) -> AppResult<()> {
        self.output.schedule(unit)
    }

    fn flush(&self) {
        self.output.flush();
    }

    fn close(&self) {
        let stop_tx = self
            .stop_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(stop_tx) = stop_tx {
            let _ = stop_tx.send(());
        }

        let thread = self.thread.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                warn!("Playback thread panicked while releasing the speaker");
            }
            info!("Speaker closed");
        }
    }
}

impl Drop for SpeakerOutput {
    fn drop(&mut self) {
        self.close();
    }
}

fn build_speaker_stream(
    preferred_rate: u32,
) -> AppResult<(Stream, (String, u32, Arc<Mutex<PlaybackRenderer>>))> {
    let device = DeviceManager::output_device()?;
    let name = device.name().unwrap_or_else(|_| "unknown output".to_string());
    let (config, format) = DeviceManager::output_config(&device, preferred_rate)?;
    let sample_rate = config.sample_rate.0;
    let renderer = Arc::new(Mutex::new(PlaybackRenderer::new(sample_rate)));

    debug!(
        device = %name,
        channels = config.channels,
        sample_rate,
        format = ?format,
        "Speaker stream config"
    );

    let stream = match format {
        SampleFormat::F32 => build_output::<f32>(&device, &config, Arc::clone(&renderer))?,
        SampleFormat::I16 => build_output::<i16>(&device, &config, Arc::clone(&renderer))?,
        SampleFormat::U16 => build_output::<u16>(&device, &config, Arc::clone(&renderer))?,
        other => {
            return Err(AppError::DeviceUnavailable(format!(
                "unsupported output sample format {:?}",
                other
            )))
        }
    };
    stream.play()?;

    Ok((stream, (name, sample_rate, renderer)))
}

fn build_output<T>(
    device: &Device,
    config: &StreamConfig,
    renderer: Arc<Mutex<PlaybackRenderer>>,
) -> AppResult<Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels as usize;
    let mut scratch: Vec<f32> = Vec::new();

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            scratch.resize(data.len(), 0.0);

            let Ok(mut renderer) = renderer.lock() else {
                scratch.fill(0.0);
                for (out, &s) in data.iter_mut().zip(scratch.iter()) {
                    *out = T::from_sample(s);
                }
                return;
            };
            renderer.render(&mut scratch, channels);
            drop(renderer);

            for (out, &s) in data.iter_mut().zip(scratch.iter()) {
                *out = T::from_sample(s);
            }
        },
        |err| warn!(error = %err, "Speaker stream error"),
        None,
    )?;

    Ok(stream)
}
