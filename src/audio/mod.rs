//! Audio capture, playback and the per-call media session

pub mod capture;
pub mod device;
pub mod frame;
pub mod memory;
pub mod playback;
pub mod session;

pub use capture::DeviceCapture;
pub use device::{list_devices, DeviceSelection};
pub use frame::Volumes;
pub use memory::{MemorySink, MemorySource, NullSink};
pub use playback::DevicePlayback;
pub use session::{AudioSession, FrameSink, FrameSource, SessionStats};
