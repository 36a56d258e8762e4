//! Audio capture from an input device
//!
//! The cpal stream lives on its own thread for as long as the capture is
//! open; the data callback downmixes to mono i16 and hands samples over a
//! bounded channel. [`DeviceCapture::read_frame`] regroups them into
//! fixed-size frames.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::audio::device::{input_device, pick_config, DEVICE_OPEN_TIMEOUT};
use crate::audio::frame::FRAME_SAMPLES;
use crate::audio::session::FrameSource;
use crate::error::AudioError;
use crate::worker::{self, JOIN_TIMEOUT};

/// Chunks buffered between the callback and the send loop
const CHUNK_QUEUE: usize = 64;

/// Capture stream for a single input device
pub struct DeviceCapture {
    running: Arc<AtomicBool>,
    samples: Receiver<Vec<i16>>,
    pending: Vec<i16>,
    thread_handle: Option<JoinHandle<()>>,
}

impl DeviceCapture {
    /// Open `device_id`, or the default input device, and start capturing
    pub fn open(device_id: Option<&str>) -> Result<Self, AudioError> {
        let device_id = device_id.map(str::to_string);
        let running = Arc::new(AtomicBool::new(true));
        let (sample_tx, sample_rx) = bounded::<Vec<i16>>(CHUNK_QUEUE);
        let (ready_tx, ready_rx) = bounded::<Result<String, AudioError>>(1);

        let running_for_thread = running.clone();
        let handle = worker::spawn("audio-capture-device", move || {
            capture_thread(device_id, sample_tx, ready_tx, running_for_thread)
        })
        .map_err(|e| AudioError::DeviceThread(e.to_string()))?;

        match ready_rx.recv_timeout(DEVICE_OPEN_TIMEOUT) {
            Ok(Ok(name)) => {
                tracing::info!("Capturing from {}", name);
                Ok(Self {
                    running,
                    samples: sample_rx,
                    pending: Vec::with_capacity(FRAME_SAMPLES * 2),
                    thread_handle: Some(handle),
                })
            }
            Ok(Err(e)) => {
                worker::join_bounded(handle, JOIN_TIMEOUT);
                Err(e)
            }
            Err(RecvTimeoutError::Timeout) => {
                // The thread exits on its own once the stream finally opens
                running.store(false, Ordering::SeqCst);
                drop(handle);
                Err(AudioError::DeviceThread(format!(
                    "capture device did not open within {:?}",
                    DEVICE_OPEN_TIMEOUT
                )))
            }
            Err(RecvTimeoutError::Disconnected) => {
                worker::join_bounded(handle, JOIN_TIMEOUT);
                Err(AudioError::DeviceThread(
                    "capture thread exited before opening the device".to_string(),
                ))
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn take_frame(&mut self) -> Option<Vec<i16>> {
        if self.pending.len() < FRAME_SAMPLES {
            return None;
        }
        let rest = self.pending.split_off(FRAME_SAMPLES);
        Some(std::mem::replace(&mut self.pending, rest))
    }
}

impl FrameSource for DeviceCapture {
    fn read_frame(&mut self, timeout: Duration) -> Result<Option<Vec<i16>>, AudioError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(frame) = self.take_frame() {
                return Ok(Some(frame));
            }
            let wait = deadline.saturating_duration_since(Instant::now());
            match self.samples.recv_timeout(wait) {
                Ok(chunk) => self.pending.extend_from_slice(&chunk),
                Err(RecvTimeoutError::Timeout) => return Ok(None),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(AudioError::DeviceThread("capture stream ended".to_string()))
                }
            }
        }
    }

    fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            worker::join_bounded(handle, JOIN_TIMEOUT);
        }
    }
}

impl Drop for DeviceCapture {
    fn drop(&mut self) {
        self.close();
    }
}

fn capture_thread(
    device_id: Option<String>,
    samples: Sender<Vec<i16>>,
    ready: Sender<Result<String, AudioError>>,
    running: Arc<AtomicBool>,
) {
    let stream = match build_stream(device_id.as_deref(), samples) {
        Ok((stream, name)) => {
            let _ = ready.send(Ok(name));
            stream
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    // Keep thread alive while running; the stream stops when dropped
    while running.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(10));
    }
    drop(stream);
}

fn build_stream(
    device_id: Option<&str>,
    samples: Sender<Vec<i16>>,
) -> Result<(cpal::Stream, String), AudioError> {
    let device = input_device(device_id)?;
    let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
    let ranges = device
        .supported_input_configs()
        .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?;
    let supported = pick_config(ranges)?;
    let format = supported.sample_format();
    let config = supported.config();

    let stream = match format {
        cpal::SampleFormat::I16 => input_stream::<i16>(&device, &config, samples)?,
        cpal::SampleFormat::F32 => input_stream::<f32>(&device, &config, samples)?,
        cpal::SampleFormat::U16 => input_stream::<u16>(&device, &config, samples)?,
        other => return Err(AudioError::UnsupportedConfig(format!("{:?}", other))),
    };
    stream.play()?;
    Ok((stream, name))
}

fn input_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    samples: Sender<Vec<i16>>,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample,
    i16: FromSample<T>,
{
    let channels = usize::from(config.channels.max(1));
    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            let mono: Vec<i16> = data
                .chunks(channels)
                .map(|frame| {
                    let sum: i32 = frame.iter().map(|&s| i32::from(s.to_sample::<i16>())).sum();
                    (sum / frame.len() as i32) as i16
                })
                .collect();
            // Drop on overflow rather than block the audio callback
            let _ = samples.try_send(mono);
        },
        |err| tracing::warn!("Capture stream error: {}", err),
        None,
    )?;
    Ok(stream)
}
