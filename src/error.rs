use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApiErrorType {
    InvalidRequestError,
    RateLimitError,
    AuthenticationError,
    ServerError,
    #[serde(other)]
    Unknown,
}

/// Error payload delivered by the remote service over the control channel.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ServerError {
    #[serde(rename = "type")]
    pub error_type: ApiErrorType,
    pub code: Option<String>,
    pub message: String,
    pub param: Option<String>,
    pub event_id: Option<String>,
}

/// Failures while acquiring an ephemeral credential from the broker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    #[error("credential broker rejected the request ({status}): {detail}")]
    BrokerRejected { status: u16, detail: String },

    #[error("credential broker returned a malformed response: {0}")]
    MalformedResponse(String),

    #[error("credential broker unreachable: {0}")]
    Unreachable(String),
}

/// Failures while negotiating the peer transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("local media unavailable: {0}")]
    MediaDenied(String),

    #[error("signaling endpoint rejected the offer ({status})")]
    SignalingRejected { status: u16 },

    #[error("peer transport failed: {0}")]
    TransportFailed(String),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error("HTTP protocol error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to parse or serialize JSON: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("reconnect attempts exhausted after {0} tries")]
    ReconnectExhausted(u32),

    #[error("the session controller is no longer running")]
    ControllerClosed,
}

pub type Result<T> = std::result::Result<T, Error>;
