//! Audio subsystem module

pub mod buffer;
pub mod capture;
pub mod convert;
pub mod device;
pub mod stream;

pub use buffer::{AudioBuffer, AudioFrame, SendQueue};
pub use capture::DeviceCapture;
pub use convert::{ChunkResampler, FrameAssembler};
pub use device::{list_devices, AudioDeviceInfo};
pub use stream::{AudioStream, StreamView};
