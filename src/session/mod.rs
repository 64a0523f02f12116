//! Duplex session with the remote conversational agent

pub mod duplex;
pub mod protocol;
pub mod transport;

pub use duplex::{DuplexSession, SessionState};
pub use protocol::{ClientMessage, InboundEvent, SessionSetup};
pub use transport::{FrameSink, LiveConnector, LiveTransport, MessageSource, WebSocketConnector};
