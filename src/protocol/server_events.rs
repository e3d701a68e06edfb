use serde::{Deserialize, Deserializer, Serialize};

use super::models::{ArbitraryJson, SessionInfo};
use crate::error::ServerError;

/// Events the server delivers over the control channel.
///
/// Unrecognized event types never fail deserialization; they are preserved
/// as [`ServerEvent::Unknown`] so new server events pass through untouched.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    SessionCreated {
        event_id: Option<String>,
        session: SessionInfo,
    },
    ResponseAudioDelta {
        event_id: Option<String>,
        response_id: String,
        item_id: String,
        output_index: u32,
        content_index: u32,
        delta: String,
    },
    ResponseAudioDone {
        event_id: Option<String>,
        response_id: String,
        item_id: String,
        output_index: u32,
        content_index: u32,
    },
    InputAudioBufferSpeechStarted {
        event_id: Option<String>,
        audio_start_ms: u32,
        item_id: String,
    },
    InputAudioBufferSpeechStopped {
        event_id: Option<String>,
        audio_end_ms: u32,
        item_id: String,
    },
    InputAudioTranscriptionCompleted {
        event_id: Option<String>,
        item_id: String,
        content_index: u32,
        transcript: String,
    },
    ResponseTextDelta {
        event_id: Option<String>,
        response_id: String,
        item_id: String,
        output_index: u32,
        content_index: u32,
        delta: String,
    },
    Error {
        event_id: Option<String>,
        error: ServerError,
    },
    Unknown(ArbitraryJson),
}

impl ServerEvent {
    /// Wire name of the event type, if the event is recognized or carries one.
    #[must_use]
    pub fn event_type(&self) -> Option<&str> {
        match self {
            Self::SessionCreated { .. } => Some("session.created"),
            Self::ResponseAudioDelta { .. } => Some("response.audio.delta"),
            Self::ResponseAudioDone { .. } => Some("response.audio.done"),
            Self::InputAudioBufferSpeechStarted { .. } => {
                Some("input_audio_buffer.speech_started")
            }
            Self::InputAudioBufferSpeechStopped { .. } => {
                Some("input_audio_buffer.speech_stopped")
            }
            Self::InputAudioTranscriptionCompleted { .. } => {
                Some("conversation.item.input_audio_transcription.completed")
            }
            Self::ResponseTextDelta { .. } => Some("response.text.delta"),
            Self::Error { .. } => Some("error"),
            Self::Unknown(value) => value.get("type").and_then(|v| v.as_str()),
        }
    }

    /// Event id assigned by the server, when present.
    #[must_use]
    pub fn event_id(&self) -> Option<&str> {
        match self {
            Self::SessionCreated { event_id, .. }
            | Self::ResponseAudioDelta { event_id, .. }
            | Self::ResponseAudioDone { event_id, .. }
            | Self::InputAudioBufferSpeechStarted { event_id, .. }
            | Self::InputAudioBufferSpeechStopped { event_id, .. }
            | Self::InputAudioTranscriptionCompleted { event_id, .. }
            | Self::ResponseTextDelta { event_id, .. }
            | Self::Error { event_id, .. } => event_id.as_deref(),
            Self::Unknown(value) => value.get("event_id").and_then(|v| v.as_str()),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "type")]
enum ServerEventRepr {
    #[serde(rename = "session.created")]
    SessionCreated {
        event_id: Option<String>,
        session: SessionInfo,
    },
    #[serde(rename = "response.audio.delta")]
    ResponseAudioDelta {
        event_id: Option<String>,
        response_id: String,
        item_id: String,
        #[serde(default)]
        output_index: u32,
        #[serde(default)]
        content_index: u32,
        delta: String,
    },
    #[serde(rename = "response.audio.done")]
    ResponseAudioDone {
        event_id: Option<String>,
        response_id: String,
        item_id: String,
        #[serde(default)]
        output_index: u32,
        #[serde(default)]
        content_index: u32,
    },
    #[serde(rename = "input_audio_buffer.speech_started")]
    InputAudioBufferSpeechStarted {
        event_id: Option<String>,
        audio_start_ms: u32,
        item_id: String,
    },
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    InputAudioBufferSpeechStopped {
        event_id: Option<String>,
        audio_end_ms: u32,
        item_id: String,
    },
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputAudioTranscriptionCompleted {
        event_id: Option<String>,
        item_id: String,
        #[serde(default)]
        content_index: u32,
        transcript: String,
    },
    #[serde(rename = "response.text.delta")]
    ResponseTextDelta {
        event_id: Option<String>,
        response_id: String,
        item_id: String,
        #[serde(default)]
        output_index: u32,
        #[serde(default)]
        content_index: u32,
        delta: String,
    },
    #[serde(rename = "error")]
    Error {
        event_id: Option<String>,
        error: ServerError,
    },
}

impl From<ServerEventRepr> for ServerEvent {
    fn from(repr: ServerEventRepr) -> Self {
        match repr {
            ServerEventRepr::SessionCreated { event_id, session } => {
                Self::SessionCreated { event_id, session }
            }
            ServerEventRepr::ResponseAudioDelta {
                event_id,
                response_id,
                item_id,
                output_index,
                content_index,
                delta,
            } => Self::ResponseAudioDelta {
                event_id,
                response_id,
                item_id,
                output_index,
                content_index,
                delta,
            },
            ServerEventRepr::ResponseAudioDone {
                event_id,
                response_id,
                item_id,
                output_index,
                content_index,
            } => Self::ResponseAudioDone {
                event_id,
                response_id,
                item_id,
                output_index,
                content_index,
            },
            ServerEventRepr::InputAudioBufferSpeechStarted {
                event_id,
                audio_start_ms,
                item_id,
            } => Self::InputAudioBufferSpeechStarted {
                event_id,
                audio_start_ms,
                item_id,
            },
            ServerEventRepr::InputAudioBufferSpeechStopped {
                event_id,
                audio_end_ms,
                item_id,
            } => Self::InputAudioBufferSpeechStopped {
                event_id,
                audio_end_ms,
                item_id,
            },
            ServerEventRepr::InputAudioTranscriptionCompleted {
                event_id,
                item_id,
                content_index,
                transcript,
            } => Self::InputAudioTranscriptionCompleted {
                event_id,
                item_id,
                content_index,
                transcript,
            },
            ServerEventRepr::ResponseTextDelta {
                event_id,
                response_id,
                item_id,
                output_index,
                content_index,
                delta,
            } => Self::ResponseTextDelta {
                event_id,
                response_id,
                item_id,
                output_index,
                content_index,
                delta,
            },
            ServerEventRepr::Error { event_id, error } => Self::Error { event_id, error },
        }
    }
}

impl<'de> Deserialize<'de> for ServerEvent {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = ArbitraryJson::deserialize(deserializer)?;
        match ServerEventRepr::deserialize(value.clone()) {
            Ok(repr) => Ok(repr.into()),
            Err(err) => {
                tracing::debug!("Failed to parse ServerEvent: {err}");
                Ok(Self::Unknown(value))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApiErrorType;
    use pretty_assertions::assert_eq;

    #[test]
    fn session_created_parses() {
        let raw = r#"{
            "type": "session.created",
            "event_id": "evt_1",
            "session": { "id": "sess_1", "voice": "alloy" }
        }"#;
        let event: ServerEvent = serde_json::from_str(raw).unwrap();
        match event {
            ServerEvent::SessionCreated { event_id, session } => {
                assert_eq!(event_id.as_deref(), Some("evt_1"));
                assert_eq!(session.id.as_deref(), Some("sess_1"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn speech_started_parses() {
        let raw = r#"{
            "type": "input_audio_buffer.speech_started",
            "event_id": "evt_2",
            "audio_start_ms": 120,
            "item_id": "item_1"
        }"#;
        let event: ServerEvent = serde_json::from_str(raw).unwrap();
        match event {
            ServerEvent::InputAudioBufferSpeechStarted { audio_start_ms, item_id, .. } => {
                assert_eq!(audio_start_ms, 120);
                assert_eq!(item_id, "item_1");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn transcription_completed_parses() {
        let raw = r#"{
            "type": "conversation.item.input_audio_transcription.completed",
            "event_id": "evt_3",
            "item_id": "item_1",
            "content_index": 0,
            "transcript": "hello there"
        }"#;
        let event: ServerEvent = serde_json::from_str(raw).unwrap();
        match event {
            ServerEvent::InputAudioTranscriptionCompleted { transcript, .. } => {
                assert_eq!(transcript, "hello there");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn error_event_parses_taxonomy() {
        let raw = r#"{
            "type": "error",
            "event_id": "evt_4",
            "error": {
                "type": "invalid_request_error",
                "code": "bad_session",
                "message": "nope",
                "param": null,
                "event_id": null
            }
        }"#;
        let event: ServerEvent = serde_json::from_str(raw).unwrap();
        match event {
            ServerEvent::Error { error, .. } => {
                assert_eq!(error.error_type, ApiErrorType::InvalidRequestError);
                assert_eq!(error.message, "nope");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unknown_event_type_is_preserved() {
        let raw = r#"{"type": "rate_limits.updated", "event_id": "evt_5", "rate_limits": []}"#;
        let event: ServerEvent = serde_json::from_str(raw).unwrap();
        match &event {
            ServerEvent::Unknown(value) => {
                assert_eq!(value["type"], "rate_limits.updated");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(event.event_type(), Some("rate_limits.updated"));
        assert_eq!(event.event_id(), Some("evt_5"));
    }

    #[test]
    fn recognized_type_with_missing_fields_falls_back_to_unknown() {
        let raw = r#"{"type": "response.audio.delta", "event_id": "evt_6"}"#;
        let event: ServerEvent = serde_json::from_str(raw).unwrap();
        assert!(matches!(event, ServerEvent::Unknown(_)));
    }
}
