//! Speaking activity detection
//!
//! Each stream (local capture or a remote peer) gets its own
//! [`SpeakingMonitor`] reading from a private stream view. The monitor ticks,
//! analyses the latest samples and publishes a debounced speaking flag.

pub mod analyser;
pub mod speaking;
pub mod ticker;

pub use analyser::{average_magnitude, is_speaking, FrequencyAnalyser};
pub use speaking::{SpeakingMonitor, SpeakingState};
pub use ticker::{IntervalTicker, Ticker};
