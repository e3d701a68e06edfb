use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::SystemTime;

use futures::Stream;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::error::{CredentialError, NegotiationError, ServerError};
use crate::protocol::models::SessionInfo;
use crate::protocol::server_events::ServerEvent;

/// Why a connection attempt or an established session failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectFailure {
    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error("transport failure: {0}")]
    Transport(String),
}

/// Lifecycle and conversation events published by a [`VoiceSession`].
///
/// [`VoiceSession`]: crate::session::VoiceSession
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The session reached the connected state.
    Connected,
    /// A connection attempt or the live transport failed.
    ConnectionError { error: ConnectFailure },
    /// The session was torn down.
    Disconnected,
    /// The control channel is open; the configuration handshake was sent.
    ChannelOpen,
    /// The control channel reported an error.
    ChannelError { message: String },
    /// The server acknowledged the session.
    SessionCreated { session: SessionInfo },
    /// The assistant started producing audio.
    AiSpeaking { response_id: String, item_id: String },
    /// The assistant finished producing audio.
    AiFinishedSpeaking { response_id: String, item_id: String },
    /// Server-side VAD detected the user speaking.
    UserSpeechStarted { audio_start_ms: u32, item_id: String },
    /// Server-side VAD detected the user going quiet.
    UserSpeechStopped { audio_end_ms: u32, item_id: String },
    /// A transcription of user speech completed.
    TranscriptionCompleted { item_id: String, transcript: String },
    /// Incremental assistant text.
    TextResponse { response_id: String, delta: String },
    /// The server reported an in-band error.
    ApiError { error: ServerError },
    /// Activity snapshot for visualization, published per sampled frame.
    AiAudioData {
        volume: f32,
        frequency_data: Vec<f32>,
        timestamp: SystemTime,
    },
    /// Any recognized-but-unmapped or unknown server event, passed through.
    RealtimeEvent { event: Box<ServerEvent> },
}

/// Stream adapter over the session's event receiver.
pub struct SessionEventStream<'a> {
    rx: &'a mut mpsc::Receiver<SessionEvent>,
}

impl<'a> SessionEventStream<'a> {
    #[must_use]
    pub const fn new(rx: &'a mut mpsc::Receiver<SessionEvent>) -> Self {
        Self { rx }
    }
}

impl Stream for SessionEventStream<'_> {
    type Item = SessionEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        Pin::new(&mut this.rx).poll_recv(cx)
    }
}
