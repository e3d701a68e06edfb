use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type ArbitraryJson = Value;

/// Audio encodings accepted on the wire.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AudioFormat {
    #[serde(rename = "pcm16")]
    Pcm16,
    #[serde(rename = "g711_ulaw")]
    G711Ulaw,
    #[serde(rename = "g711_alaw")]
    G711Alaw,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InputAudioTranscription {
    pub model: String,
}

impl Default for InputAudioTranscription {
    fn default() -> Self {
        Self {
            model: "whisper-1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TurnDetectionKind {
    ServerVad,
}

/// Server-side voice activity detection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub kind: TurnDetectionKind,
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

impl Default for TurnDetection {
    fn default() -> Self {
        Self {
            kind: TurnDetectionKind::ServerVad,
            threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 200,
        }
    }
}

/// Payload of the `session.update` client event.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SessionUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_format: Option<AudioFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_format: Option<AudioFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<InputAudioTranscription>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_detection: Option<TurnDetection>,
}

/// Session description as reported by `session.created` and `session.updated`.
///
/// Only the fields the session manager reads are typed; everything else the
/// server includes is preserved in `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SessionInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn turn_detection_serializes_with_type_tag() {
        let detection = TurnDetection::default();
        let json = serde_json::to_value(&detection).unwrap();
        assert_eq!(json["type"], "server_vad");
        assert_eq!(json["prefix_padding_ms"], 300);
        assert_eq!(json["silence_duration_ms"], 200);
    }

    #[test]
    fn session_update_omits_unset_fields() {
        let update = SessionUpdate {
            voice: Some("alloy".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json, serde_json::json!({ "voice": "alloy" }));
    }

    #[test]
    fn session_info_preserves_unknown_fields() {
        let raw = serde_json::json!({
            "id": "sess_1",
            "modalities": ["audio", "text"],
        });
        let info: SessionInfo = serde_json::from_value(raw).unwrap();
        assert_eq!(info.id.as_deref(), Some("sess_1"));
        assert!(info.extra.contains_key("modalities"));
    }

    #[test]
    fn audio_format_wire_names() {
        assert_eq!(
            serde_json::to_value(AudioFormat::Pcm16).unwrap(),
            serde_json::json!("pcm16")
        );
        assert_eq!(
            serde_json::to_value(AudioFormat::G711Ulaw).unwrap(),
            serde_json::json!("g711_ulaw")
        );
    }
}
