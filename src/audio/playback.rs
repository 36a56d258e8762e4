//! Audio playback to an output device
//!
//! Frames are queued sample by sample on a lock-free ring; the output
//! callback drains it and plays silence on underrun. When the ring is
//! full the oldest samples are overwritten so latency stays bounded.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};
use crossbeam::queue::ArrayQueue;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::audio::device::{output_device, pick_config, DEVICE_OPEN_TIMEOUT};
use crate::audio::frame::SAMPLE_RATE;
use crate::audio::session::FrameSink;
use crate::error::AudioError;
use crate::worker::{self, JOIN_TIMEOUT};

/// Half a second of mono audio
const RING_SAMPLES: usize = SAMPLE_RATE as usize / 2;

/// Playback stream for a single output device
pub struct DevicePlayback {
    running: Arc<AtomicBool>,
    ring: Arc<ArrayQueue<i16>>,
    thread_handle: Option<JoinHandle<()>>,
}

impl DevicePlayback {
    /// Open `device_id`, or the default output device, and start playing
    pub fn open(device_id: Option<&str>) -> Result<Self, AudioError> {
        let device_id = device_id.map(str::to_string);
        let running = Arc::new(AtomicBool::new(true));
        let ring = Arc::new(ArrayQueue::new(RING_SAMPLES));
        let (ready_tx, ready_rx) = bounded::<Result<String, AudioError>>(1);

        let running_for_thread = running.clone();
        let ring_for_thread = ring.clone();
        let handle = worker::spawn("audio-playback-device", move || {
            playback_thread(device_id, ring_for_thread, ready_tx, running_for_thread)
        })
        .map_err(|e| AudioError::DeviceThread(e.to_string()))?;

        match ready_rx.recv_timeout(DEVICE_OPEN_TIMEOUT) {
            Ok(Ok(name)) => {
                tracing::info!("Playing to {}", name);
                Ok(Self {
                    running,
                    ring,
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
                    "playback device did not open within {:?}",
                    DEVICE_OPEN_TIMEOUT
                )))
            }
            Err(RecvTimeoutError::Disconnected) => {
                worker::join_bounded(handle, JOIN_TIMEOUT);
                Err(AudioError::DeviceThread(
                    "playback thread exited before opening the device".to_string(),
                ))
            }
        }
    }
}

impl FrameSink for DevicePlayback {
    fn write_frame(&mut self, samples: &[i16]) -> Result<(), AudioError> {
        if !self.running.load(Ordering::Relaxed) {
            return Err(AudioError::DeviceThread("playback stopped".to_string()));
        }
        for &sample in samples {
            self.ring.force_push(sample);
        }
        Ok(())
    }

    fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            worker::join_bounded(handle, JOIN_TIMEOUT);
        }
    }
}

impl Drop for DevicePlayback {
    fn drop(&mut self) {
        self.close();
    }
}

fn playback_thread(
    device_id: Option<String>,
    ring: Arc<ArrayQueue<i16>>,
    ready: Sender<Result<String, AudioError>>,
    running: Arc<AtomicBool>,
) {
    let stream = match build_stream(device_id.as_deref(), ring) {
        Ok((stream, name)) => {
            let _ = ready.send(Ok(name));
            stream
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    while running.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(10));
    }
    drop(stream);
}

fn build_stream(
    device_id: Option<&str>,
    ring: Arc<ArrayQueue<i16>>,
) -> Result<(cpal::Stream, String), AudioError> {
    let device = output_device(device_id)?;
    let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
    let ranges = device
        .supported_output_configs()
        .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?;
    let supported = pick_config(ranges)?;
    let format = supported.sample_format();
    let config = supported.config();

    let stream = match format {
        cpal::SampleFormat::I16 => output_stream::<i16>(&device, &config, ring)?,
        cpal::SampleFormat::F32 => output_stream::<f32>(&device, &config, ring)?,
        cpal::SampleFormat::U16 => output_stream::<u16>(&device, &config, ring)?,
        other => return Err(AudioError::UnsupportedConfig(format!("{:?}", other))),
    };
    stream.play()?;
    Ok((stream, name))
}

fn output_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    ring: Arc<ArrayQueue<i16>>,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample + FromSample<i16>,
{
    let channels = usize::from(config.channels.max(1));
    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            for frame in data.chunks_mut(channels) {
                let value = T::from_sample(ring.pop().unwrap_or(0));
                for out in frame.iter_mut() {
                    *out = value;
                }
            }
        },
        |err| tracing::warn!("Playback stream error: {}", err),
        None,
    )?;
    Ok(stream)
}
