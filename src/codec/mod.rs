//! PCM16 codec
//!
//! Stateless conversion between normalized samples and the PCM16 frames
//! exchanged with the live service and with peers.

pub mod pcm;

pub use pcm::{
    decode, decode_pcm16, encode, encode_pcm16, mime_for_rate, sample_rate_from_mime,
    EncodedAudioPacket,
};
