//! Control-channel protocol handling: outbound command serialization and
//! inbound event classification.

use crate::error::Result;
use crate::protocol::client_events::ClientEvent;
use crate::protocol::server_events::ServerEvent;
use crate::session::events::SessionEvent;
use crate::transport::ControlLink;

const TRACE_LOG_MAX_BYTES: usize = 1024;

/// Outbound side of the control channel.
///
/// Sending while the channel is not yet open is a logged no-op, matching
/// fire-and-forget command semantics; commands are never queued.
pub struct ControlChannel {
    link: Box<dyn ControlLink>,
}

impl ControlChannel {
    #[must_use]
    pub fn new(link: Box<dyn ControlLink>) -> Self {
        Self { link }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.link.is_open()
    }

    /// Serialize and send a command.
    ///
    /// # Errors
    /// Returns an error if serialization or the transport send fails.
    pub async fn send(&self, event: &ClientEvent) -> Result<()> {
        if !self.link.is_open() {
            tracing::warn!(event = ?event, "Control channel not open, dropping command");
            return Ok(());
        }
        let json = serde_json::to_string(event)?;
        tracing::trace!("Sending event: {}", safe_truncate(&json, TRACE_LOG_MAX_BYTES));
        self.link.send_text(json).await
    }

    /// Close the underlying transport.
    ///
    /// # Errors
    /// Returns an error if teardown fails.
    pub async fn close(&self) -> Result<()> {
        self.link.close().await
    }
}

/// Parse an inbound control message. Malformed JSON is logged and dropped
/// rather than terminating the session.
#[must_use]
pub fn parse_message(text: &str) -> Option<ServerEvent> {
    tracing::trace!("Received event: {}", safe_truncate(text, TRACE_LOG_MAX_BYTES));
    match serde_json::from_str::<ServerEvent>(text) {
        Ok(event) => Some(event),
        Err(err) => {
            tracing::warn!("Dropping malformed control message: {err}");
            None
        }
    }
}

/// Map a wire event to the facade event the session publishes.
#[must_use]
pub fn classify(event: ServerEvent) -> SessionEvent {
    match event {
        ServerEvent::SessionCreated { session, .. } => SessionEvent::SessionCreated { session },
        ServerEvent::ResponseAudioDelta { response_id, item_id, .. } => {
            SessionEvent::AiSpeaking { response_id, item_id }
        }
        ServerEvent::ResponseAudioDone { response_id, item_id, .. } => {
            SessionEvent::AiFinishedSpeaking { response_id, item_id }
        }
        ServerEvent::InputAudioBufferSpeechStarted { audio_start_ms, item_id, .. } => {
            SessionEvent::UserSpeechStarted { audio_start_ms, item_id }
        }
        ServerEvent::InputAudioBufferSpeechStopped { audio_end_ms, item_id, .. } => {
            SessionEvent::UserSpeechStopped { audio_end_ms, item_id }
        }
        ServerEvent::InputAudioTranscriptionCompleted { item_id, transcript, .. } => {
            SessionEvent::TranscriptionCompleted { item_id, transcript }
        }
        ServerEvent::ResponseTextDelta { response_id, delta, .. } => {
            SessionEvent::TextResponse { response_id, delta }
        }
        ServerEvent::Error { error, .. } => SessionEvent::ApiError { error },
        other @ ServerEvent::Unknown(_) => SessionEvent::RealtimeEvent {
            event: Box::new(other),
        },
    }
}

fn safe_truncate(s: &str, max_bytes: usize) -> std::borrow::Cow<'_, str> {
    if s.len() <= max_bytes {
        return std::borrow::Cow::Borrowed(s);
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    std::borrow::Cow::Owned(format!("{} ... ({} bytes)", &s[..end], s.len()))
}
