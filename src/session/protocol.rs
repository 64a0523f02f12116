//! Live service wire messages
//!
//! Outbound messages are built from typed structs. Inbound messages are
//! parsed leniently: unknown fields are ignored and every section is
//! optional, then flattened into [`InboundEvent`]s in arrival order.

use serde::{Deserialize, Serialize};

use crate::codec::{self, EncodedAudioPacket};
use crate::constants::OUTPUT_SAMPLE_RATE;

/// Session parameters sent in the opening message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSetup {
    pub model: String,
    pub voice: String,
    pub instruction: String,
}

/// Client → service
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(SetupBody),
    RealtimeInput(RealtimeInput),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupBody {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TextPart {
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<EncodedAudioPacket>,
}

impl ClientMessage {
    pub fn setup(setup: &SessionSetup) -> Self {
        ClientMessage::Setup(SetupBody {
            model: setup.model.clone(),
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: setup.voice.clone(),
                        },
                    },
                },
            },
            system_instruction: Content {
                parts: vec![TextPart {
                    text: setup.instruction.clone(),
                }],
            },
        })
    }

    pub fn audio(packet: EncodedAudioPacket) -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            media_chunks: vec![packet],
        })
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Service → client
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    pub setup_complete: Option<serde_json::Value>,
    pub server_content: Option<ServerContent>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    pub model_turn: Option<ModelTurn>,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub turn_complete: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    pub inline_data: Option<InlineData>,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    #[serde(default)]
    pub mime_type: Option<String>,
    pub data: String,
}

/// Flattened inbound event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    SetupComplete,
    /// Base64 PCM16 chunk of synthesized speech
    Audio { data: String, sample_rate: u32 },
    /// The user barged in; queued speech must be discarded
    Interrupted,
    TurnComplete,
}

impl ServerMessage {
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Events carried by this message. Interruption comes before any audio
    /// in the same message so stale speech is flushed first.
    pub fn into_events(self) -> Vec<InboundEvent> {
        let mut events = Vec::new();
        if self.setup_complete.is_some() {
            events.push(InboundEvent::SetupComplete);
        }
        if let Some(content) = self.server_content {
            if content.interrupted {
                events.push(InboundEvent::Interrupted);
            }
            let parts = content.model_turn.map(|turn| turn.parts).unwrap_or_default();
            for part in parts {
                let Some(inline) = part.inline_data else {
                    continue;
                };
                let sample_rate = inline
                    .mime_type
                    .as_deref()
                    .and_then(codec::sample_rate_from_mime)
                    .unwrap_or(OUTPUT_SAMPLE_RATE);
                events.push(InboundEvent::Audio {
                    data: inline.data,
                    sample_rate,
                });
            }
            if content.turn_complete {
                events.push(InboundEvent::TurnComplete);
            }
        }
        events
    }
}

/// Parse a raw frame into events; malformed frames yield nothing
pub fn parse_events(text: &str) -> Vec<InboundEvent> {
    match ServerMessage::parse(text) {
        Ok(message) => message.into_events(),
        Err(e) => {
            tracing::warn!("Ignoring malformed server message: {}", e);
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_setup_message_shape() {
        let setup = SessionSetup {
            model: "models/test".to_string(),
            voice: "Kore".to_string(),
            instruction: "Be brief.".to_string(),
        };
        let value: serde_json::Value =
            serde_json::from_str(&ClientMessage::setup(&setup).to_json().unwrap()).unwrap();

        assert_eq!(
            value,
            json!({
                "setup": {
                    "model": "models/test",
                    "generationConfig": {
                        "responseModalities": ["AUDIO"],
                        "speechConfig": {
                            "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": "Kore" } }
                        }
                    },
                    "systemInstruction": { "parts": [{ "text": "Be brief." }] }
                }
            })
        );
    }

    #[test]
    fn test_audio_message_shape() {
        let packet = codec::encode(&[0.0, 0.5], 7);
        let value: serde_json::Value =
            serde_json::from_str(&ClientMessage::audio(packet.clone()).to_json().unwrap()).unwrap();

        assert_eq!(
            value,
            json!({
                "realtimeInput": {
                    "mediaChunks": [{ "mimeType": "audio/pcm;rate=16000", "data": packet.data }]
                }
            })
        );
    }

    #[test]
    fn test_parse_audio_parts() {
        let text = json!({
            "serverContent": {
                "modelTurn": {
                    "parts": [
                        { "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": "AAA=" } },
                        { "text": "hello" },
                        { "inlineData": { "data": "AQA=" } },
                        { "inlineData": { "mimeType": "audio/pcm;rate=16000", "data": "AgA=" } }
                    ]
                }
            }
        })
        .to_string();

        assert_eq!(
            parse_events(&text),
            vec![
                InboundEvent::Audio { data: "AAA=".to_string(), sample_rate: 24_000 },
                InboundEvent::Audio { data: "AQA=".to_string(), sample_rate: 24_000 },
                InboundEvent::Audio { data: "AgA=".to_string(), sample_rate: 16_000 },
            ]
        );
    }

    #[test]
    fn test_parse_control_events() {
        assert_eq!(
            parse_events(r#"{"setupComplete":{}}"#),
            vec![InboundEvent::SetupComplete]
        );
        assert_eq!(
            parse_events(r#"{"serverContent":{"interrupted":true}}"#),
            vec![InboundEvent::Interrupted]
        );
        assert_eq!(
            parse_events(
                r#"{"serverContent":{"turnComplete":true,"modelTurn":{"parts":[{"inlineData":{"data":"AAA="}}]},"interrupted":true}}"#
            ),
            vec![
                InboundEvent::Interrupted,
                InboundEvent::Audio { data: "AAA=".to_string(), sample_rate: 24_000 },
                InboundEvent::TurnComplete,
            ]
        );
    }

    #[test]
    fn test_parse_ignores_unknown_and_malformed() {
        assert!(parse_events(r#"{"usageMetadata":{"totalTokenCount":3}}"#).is_empty());
        assert!(parse_events("not json").is_empty());
    }
}
