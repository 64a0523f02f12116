//! Pairwise peer voice links

pub mod connector;
pub mod hub;
pub mod link;
pub mod manager;
pub mod udp;
pub mod wire;

pub use connector::{CallHandle, IncomingOffer, OfferResponder, PeerCall, PeerConnector};
pub use hub::{HubConnector, SignalingHub};
pub use link::{CallDirection, Participant, PeerEvent, PeerLink, PeerState};
pub use manager::PeerMesh;
pub use udp::UdpConnector;
pub use wire::PeerPacket;
