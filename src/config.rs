use std::time::Duration;

use url::Url;

use crate::error::Result;
use crate::protocol::models::TurnDetection;

pub(crate) const DEFAULT_SIGNALING_URL: &str = "https://api.openai.com/v1/realtime";
pub(crate) const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

const DEFAULT_MODEL: &str = "gpt-4o-realtime-preview-2024-10-01";
const DEFAULT_VOICE: &str = "alloy";
const DEFAULT_INSTRUCTIONS: &str =
    "You are a helpful AI assistant. Keep responses concise and engaging.";
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for a voice session.
///
/// Broker endpoints are tried in declaration order until one responds;
/// only endpoints that are unreachable fall through to the next candidate.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub model: String,
    pub voice: String,
    pub instructions: String,
    pub broker_endpoints: Vec<Url>,
    pub signaling_url: Url,
    pub ice_servers: Vec<String>,
    /// Input device by name; `None` selects the system default microphone.
    pub input_device: Option<String>,
    pub turn_detection: TurnDetection,
    pub max_retries: u32,
    pub http_timeout: Duration,
}

impl SessionOptions {
    /// Create options with a single broker endpoint and defaults elsewhere.
    ///
    /// # Errors
    /// Returns an error if `broker_endpoint` is not a valid URL.
    pub fn new(broker_endpoint: &str) -> Result<Self> {
        let endpoint = Url::parse(broker_endpoint)?;
        Ok(Self {
            broker_endpoints: vec![endpoint],
            ..Self::default()
        })
    }

    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    #[must_use]
    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = voice.into();
        self
    }

    #[must_use]
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    /// Append a fallback broker endpoint.
    ///
    /// # Errors
    /// Returns an error if `endpoint` is not a valid URL.
    pub fn with_broker_endpoint(mut self, endpoint: &str) -> Result<Self> {
        self.broker_endpoints.push(Url::parse(endpoint)?);
        Ok(self)
    }

    #[must_use]
    pub fn with_signaling_url(mut self, url: Url) -> Self {
        self.signaling_url = url;
        self
    }

    #[must_use]
    pub fn with_ice_servers(mut self, servers: Vec<String>) -> Self {
        self.ice_servers = servers;
        self
    }

    #[must_use]
    pub fn with_input_device(mut self, device_name: impl Into<String>) -> Self {
        self.input_device = Some(device_name.into());
        self
    }

    #[must_use]
    pub fn with_turn_detection(mut self, detection: TurnDetection) -> Self {
        self.turn_detection = detection;
        self
    }

    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            instructions: DEFAULT_INSTRUCTIONS.to_string(),
            broker_endpoints: Vec::new(),
            signaling_url: Url::parse(DEFAULT_SIGNALING_URL)
                .expect("default signaling URL parses"),
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            input_device: None,
            turn_detection: TurnDetection::default(),
            max_retries: DEFAULT_MAX_RETRIES,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
        }
    }
}
