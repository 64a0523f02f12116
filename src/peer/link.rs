//! Peer link records

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::audio::stream::AudioStream;
use crate::error::PeerLinkError;

/// Link lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    Idle,
    Connecting,
    Connected,
    Failed,
}

/// Who placed the call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// Display metadata derived from a peer id
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Participant {
    pub id: String,
    pub label: String,
    pub avatar_seed: String,
    pub avatar_url: String,
}

impl Participant {
    pub fn from_peer_id(id: &str) -> Self {
        let short: String = id.chars().take(4).collect();
        Self {
            id: id.to_string(),
            label: format!("Friend {}", short),
            avatar_seed: id.to_string(),
            avatar_url: format!("https://api.dicebear.com/7.x/avataaars/svg?seed={}", id),
        }
    }
}

/// Snapshot of one pairwise link
#[derive(Debug, Clone, Serialize)]
pub struct PeerLink {
    pub peer_id: String,
    pub state: PeerState,
    pub direction: CallDirection,
    pub participant: Participant,
    /// Present only while connected
    #[serde(skip)]
    pub remote: Option<AudioStream>,
    /// Reason for the last failure
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<PeerLinkError>,
    pub updated_at: DateTime<Utc>,
}

impl PeerLink {
    pub fn new(peer_id: &str, direction: CallDirection) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            state: PeerState::Idle,
            direction,
            participant: Participant::from_peer_id(peer_id),
            remote: None,
            error: None,
            updated_at: Utc::now(),
        }
    }

    pub fn connecting(mut self) -> Self {
        self.state = PeerState::Connecting;
        self.updated_at = Utc::now();
        self
    }

    pub fn connected(mut self, remote: AudioStream) -> Self {
        self.state = PeerState::Connected;
        self.remote = Some(remote);
        self.error = None;
        self.updated_at = Utc::now();
        self
    }

    pub fn failed(mut self, error: PeerLinkError) -> Self {
        self.state = PeerState::Failed;
        self.remote = None;
        self.error = Some(error);
        self.updated_at = Utc::now();
        self
    }

    pub fn is_live(&self) -> bool {
        matches!(self.state, PeerState::Connecting | PeerState::Connected)
    }
}

fn serialize_error<S: serde::Serializer>(
    error: &Option<PeerLinkError>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match error {
        Some(e) => serializer.serialize_some(&e.to_string()),
        None => serializer.serialize_none(),
    }
}

/// Mesh notifications
#[derive(Debug, Clone)]
pub enum PeerEvent {
    Connecting { peer_id: String },
    Connected { peer_id: String, remote: AudioStream },
    Failed { peer_id: String, error: PeerLinkError },
    Disconnected { peer_id: String },
}

impl PeerEvent {
    pub fn peer_id(&self) -> &str {
        match self {
            PeerEvent::Connecting { peer_id }
            | PeerEvent::Connected { peer_id, .. }
            | PeerEvent::Failed { peer_id, .. }
            | PeerEvent::Disconnected { peer_id } => peer_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_participant_from_id() {
        let p = Participant::from_peer_id("3f2a9c1e-77aa");
        assert_eq!(p.label, "Friend 3f2a");
        assert_eq!(p.avatar_seed, "3f2a9c1e-77aa");
        assert_eq!(
            p.avatar_url,
            "https://api.dicebear.com/7.x/avataaars/svg?seed=3f2a9c1e-77aa"
        );
        assert_eq!(Participant::from_peer_id("ab").label, "Friend ab");
    }

    #[test]
    fn test_link_transitions() {
        let link = PeerLink::new("peer", CallDirection::Outgoing).connecting();
        assert_eq!(link.state, PeerState::Connecting);
        assert!(link.is_live());

        let link = link.connected(AudioStream::new(16_000, 1));
        assert!(link.remote.is_some());

        let link = link.failed(PeerLinkError::Closed);
        assert_eq!(link.state, PeerState::Failed);
        assert!(link.remote.is_none());
        assert!(!link.is_live());
    }

    #[test]
    fn test_link_serializes_error_text() {
        let link = PeerLink::new("peer", CallDirection::Incoming)
            .failed(PeerLinkError::Rejected("peer".to_string()));
        let value = serde_json::to_value(&link).unwrap();
        assert_eq!(value["state"], "failed");
        assert_eq!(value["direction"], "incoming");
        assert_eq!(value["error"], "Peer peer rejected the call");
    }
}
