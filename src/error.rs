//! Error types for the voice engine

use thiserror::Error;

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Peer link error: {0}")]
    PeerLink(#[from] PeerLinkError),

    #[error("Permission error: {0}")]
    Permission(#[from] PermissionError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Output device errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
}

/// PCM payload errors. A chunk that fails with one of these is dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("PCM16 payload length {0} is not a multiple of 2")]
    InvalidLength(usize),

    #[error("Invalid transport encoding: {0}")]
    InvalidEncoding(String),

    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(String),

    #[error("Empty audio payload")]
    Empty,
}

/// Remote audio service session errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Session setup failed: {0}")]
    Handshake(String),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Session already active")]
    AlreadyActive,

    #[error("Missing API key (set {0})")]
    MissingApiKey(String),

    #[error("Connection closed")]
    Closed,
}

/// Errors scoped to a single peer link
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerLinkError {
    #[error("Peer {0} is not reachable")]
    Unavailable(String),

    #[error("Peer {0} did not answer in time")]
    Timeout(String),

    #[error("Peer {0} rejected the call")]
    Rejected(String),

    #[error("Link to {0} already exists")]
    AlreadyLinked(String),

    #[error("Malformed peer id: {0}")]
    InvalidPeerId(String),

    #[error("Link not found: {0}")]
    NotFound(String),

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Link closed")]
    Closed,
}

/// Capture device access errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PermissionError {
    #[error("No capture device available")]
    NoCaptureDevice,

    #[error("Capture device {0} not found")]
    DeviceNotFound(String),

    #[error("Capture access denied: {0}")]
    Denied(String),
}

/// Result type alias for the engine
pub type Result<T> = std::result::Result<T, Error>;
