//! Peer datagram format

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::MAX_PACKET_SIZE;

/// One datagram between two peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerPacket {
    /// Call request, retransmitted until answered
    Offer { call_id: Uuid, from: String },
    Answer { call_id: Uuid, from: String },
    Reject { call_id: Uuid },
    /// PCM16 little-endian, 16 kHz mono
    Audio { call_id: Uuid, sequence: u32, pcm: Vec<u8> },
    Bye { call_id: Uuid },
}

impl PeerPacket {
    pub fn call_id(&self) -> Uuid {
        match self {
            PeerPacket::Offer { call_id, .. }
            | PeerPacket::Answer { call_id, .. }
            | PeerPacket::Reject { call_id }
            | PeerPacket::Audio { call_id, .. }
            | PeerPacket::Bye { call_id } => *call_id,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Whether the encoded packet fits in one datagram
    pub fn fits(encoded: &[u8]) -> bool {
        encoded.len() <= MAX_PACKET_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_pcm16;
    use crate::constants::PEER_FRAME_SAMPLES;

    #[test]
    fn test_audio_frame_fits_datagram() {
        let packet = PeerPacket::Audio {
            call_id: Uuid::new_v4(),
            sequence: 9,
            pcm: encode_pcm16(&vec![0.1; PEER_FRAME_SAMPLES]).to_vec(),
        };
        let bytes = packet.to_bytes().unwrap();
        assert!(PeerPacket::fits(&bytes));
        assert_eq!(PeerPacket::from_bytes(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(PeerPacket::from_bytes(&[0xff, 0xff, 0xff, 0xff, 0x01]).is_err());
    }
}
