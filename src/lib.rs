//! # Live Voice Engine
//!
//! Real-time voice sessions: a duplex audio bridge to a remote conversational
//! agent, and independent pairwise voice links with other participants.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                                VoiceEngine                               │
//! │                                                                          │
//! │  ┌──────────────┐  subscribe   ┌──────────────────────────────────────┐  │
//! │  │ DeviceCapture├──► AudioStream ──┬──► DuplexSession (session)       │  │
//! │  └──────────────┘  (broadcast) │  │     capture → PCM16 → send queue  │  │
//! │                                │  │              │                    │  │
//! │                                │  │              ▼ websocket          │  │
//! │                                │  │        remote live service        │  │
//! │                                │  │              │                    │  │
//! │                                │  │   audio / interrupted messages    │  │
//! │                                │  │              ▼                    │  │
//! │                                │  │   PlaybackScheduler (playback)    │  │
//! │                                │  │     contiguous timeline, barge-in │  │
//! │                                │  └──────────────┬────────────────────┘  │
//! │                                │                 │                       │
//! │                                ├──► PeerMesh (peer)                      │
//! │                                │     call / auto-accept, N links         │
//! │                                │     remote AudioStream per link ──┐     │
//! │                                │                                   │     │
//! │                                └──► SpeakingMonitor (monitor) ◄────┤     │
//! │                                      FFT level vs threshold        │     │
//! │                                                                    ▼     │
//! │  ┌──────────────────────────────────────────────────────────────────┐    │
//! │  │           DeviceOutput (playback::output) - timeline mixer       │    │
//! │  └──────────────────────────────────────────────────────────────────┘    │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod monitor;
pub mod peer;
pub mod playback;
pub mod session;

pub use engine::VoiceEngine;
pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Sample rate of frames sent to the live service and to peers
    pub const INPUT_SAMPLE_RATE: u32 = 16_000;

    /// Sample rate of audio synthesized by the live service
    pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

    /// Format tag attached to outbound frames
    pub const INPUT_MIME_TYPE: &str = "audio/pcm;rate=16000";

    /// Samples per outbound frame to the live service
    pub const DEFAULT_FRAME_SAMPLES: usize = 4096;

    /// Samples per peer media frame (20ms at 16kHz)
    pub const PEER_FRAME_SAMPLES: usize = 320;

    /// Outbound frames buffered before the oldest is dropped
    pub const SEND_QUEUE_CAPACITY: usize = 32;

    /// Delay before "stopped speaking" after the last source ends
    pub const SPEAKING_RELEASE_MS: u64 = 200;

    /// Analyser FFT size
    pub const ANALYSER_FFT_SIZE: usize = 512;

    /// Average analyser magnitude above which a stream counts as speaking
    pub const SPEAKING_THRESHOLD: f32 = 10.0;

    /// Default analysis tick interval (one display frame)
    pub const MONITOR_TICK_MS: u64 = 16;

    /// Frames buffered per stream subscriber
    pub const STREAM_CAPACITY: usize = 64;

    /// Maximum datagram size for peer media
    pub const MAX_PACKET_SIZE: usize = 1472; // MTU - IP/UDP headers
}
