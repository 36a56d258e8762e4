//! In-memory frame source and sink
//!
//! Stand-ins for capture and playback devices, used by tests and by
//! anything that wants to drive a session without audio hardware.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::audio::frame::FRAME_SAMPLES;
use crate::audio::session::{FrameSink, FrameSource};
use crate::error::AudioError;

/// Yields frames queued on a channel
pub struct MemorySource {
    frames: Receiver<Vec<i16>>,
    // Held so an exhausted source blocks for the timeout instead of spinning
    _keep_open: Option<Sender<Vec<i16>>>,
    closed: Arc<AtomicBool>,
}

impl MemorySource {
    /// Source fed by the returned sender
    pub fn channel() -> (Self, Sender<Vec<i16>>) {
        let (tx, rx) = unbounded();
        (
            Self {
                frames: rx,
                _keep_open: None,
                closed: Arc::new(AtomicBool::new(false)),
            },
            tx,
        )
    }

    /// `count` full frames of `value`, then nothing
    pub fn constant(value: i16, count: usize) -> Self {
        let (tx, rx) = unbounded();
        for _ in 0..count {
            let _ = tx.send(vec![value; FRAME_SAMPLES]);
        }
        Self {
            frames: rx,
            _keep_open: Some(tx),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Never yields a frame
    pub fn silent() -> Self {
        Self::constant(0, 0)
    }

    /// Set once the session releases the source
    pub fn closed_flag(&self) -> Arc<AtomicBool> {
        self.closed.clone()
    }
}

impl FrameSource for MemorySource {
    fn read_frame(&mut self, timeout: Duration) -> Result<Option<Vec<i16>>, AudioError> {
        match self.frames.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                std::thread::sleep(timeout);
                Ok(None)
            }
        }
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Records every frame written to it; clones share the recording
#[derive(Clone, Default)]
pub struct MemorySink {
    frames: Arc<Mutex<Vec<Vec<i16>>>>,
    closed: Arc<AtomicBool>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Vec<Vec<i16>> {
        self.frames.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl FrameSink for MemorySink {
    fn write_frame(&mut self, samples: &[i16]) -> Result<(), AudioError> {
        self.frames.lock().push(samples.to_vec());
        Ok(())
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Drops every frame, keeping only a count
#[derive(Default)]
pub struct NullSink {
    written: u64,
}

impl NullSink {
    pub fn written(&self) -> u64 {
        self.written
    }
}

impl FrameSink for NullSink {
    fn write_frame(&mut self, _samples: &[i16]) -> Result<(), AudioError> {
        self.written += 1;
        Ok(())
    }
}
