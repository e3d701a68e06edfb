#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::multiple_crate_versions)]

//! Realtime AI voice sessions over WebRTC.
//!
//! A [`VoiceSession`] acquires a single-use credential from a broker,
//! negotiates a WebRTC peer connection carrying microphone audio and a JSON
//! control channel, and publishes typed [`SessionEvent`]s. An activity
//! analyzer derives input/output levels for visualization, sampled once per
//! rendering frame.
//!
//! ```no_run
//! use voicewire::{SessionOptions, VoiceSession};
//!
//! # async fn run() -> voicewire::Result<()> {
//! let options = SessionOptions::new("http://localhost:3000/session")?;
//! let mut session = VoiceSession::builder().options(options).build()?;
//! session.connect().await?;
//! while let Some(event) = session.next_event().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod media;
pub mod protocol;
pub mod session;
pub mod transport;

pub use config::SessionOptions;
pub use error::{ApiErrorType, CredentialError, Error, NegotiationError, Result, ServerError};
pub use protocol::client_events::ClientEvent;
pub use protocol::models::{
    AudioFormat, InputAudioTranscription, SessionInfo, SessionUpdate, TurnDetection,
    TurnDetectionKind,
};
pub use protocol::server_events::ServerEvent;
pub use session::{
    ActivityAnalyzer, ActivitySample, ConnectFailure, SessionBuilder, SessionEvent,
    SessionEventStream, SessionState, VoiceSession, VoiceSessionHandle,
};
pub use transport::{
    ControlLink, CredentialBroker, CredentialSource, EphemeralCredential, LinkSignal, Negotiator,
    PeerLink, SignalingClient, WebRtcNegotiator,
};
