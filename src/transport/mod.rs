pub mod broker;
pub mod signaling;
pub mod webrtc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{CredentialError, NegotiationError, Result};

pub use broker::{CredentialBroker, EphemeralCredential};
pub use signaling::SignalingClient;
pub use webrtc::WebRtcNegotiator;

/// Out-of-band notifications from the peer transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkSignal {
    /// The control channel is open and ready to carry commands.
    ChannelOpen,
    /// The control channel reported an error.
    ChannelError(String),
    /// The peer connection failed.
    TransportFailed(String),
    /// The peer connection closed.
    TransportClosed,
}

/// Handle for sending on an established control channel and tearing the
/// transport down.
#[async_trait]
pub trait ControlLink: Send + Sync {
    fn is_open(&self) -> bool;

    /// Deliver a serialized command over the control channel.
    async fn send_text(&self, payload: String) -> Result<()>;

    /// Close the control channel, then the peer connection, then local media.
    async fn close(&self) -> Result<()>;
}

/// An established peer transport: a control handle plus the inbound streams
/// the session controller consumes.
pub struct PeerLink {
    pub control: Box<dyn ControlLink>,
    pub messages: mpsc::Receiver<String>,
    pub signals: mpsc::Receiver<LinkSignal>,
    pub remote_audio: mpsc::Receiver<Vec<f32>>,
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink").finish_non_exhaustive()
    }
}

/// Source of single-use session credentials.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn acquire(&self) -> std::result::Result<EphemeralCredential, CredentialError>;
}

/// Establishes a peer transport authorized by an ephemeral credential.
#[async_trait]
pub trait Negotiator: Send + Sync {
    async fn negotiate(
        &mut self,
        credential: &EphemeralCredential,
    ) -> std::result::Result<PeerLink, NegotiationError>;
}
