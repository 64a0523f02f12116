//! Playback: output timeline and chunk scheduling

pub mod output;
pub mod scheduler;

pub use output::{AudioOutput, DeviceOutput, SourceId, SourceStart, VirtualOutput};
pub use scheduler::{PlaybackScheduler, PlaybackSource, SchedulerStats, SourceState};
