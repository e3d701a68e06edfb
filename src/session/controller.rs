//! Session lifecycle: a single controller task owns the state machine, the
//! peer link and the activity analyzer, and serializes all access through a
//! command channel.

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::SessionOptions;
use crate::error::{Error, Result};
use crate::protocol::client_events::ClientEvent;
use crate::protocol::models::{AudioFormat, InputAudioTranscription, SessionUpdate};
use crate::protocol::server_events::ServerEvent;
use crate::session::activity::{ActivityAnalyzer, ActivitySample};
use crate::session::channel::{self, ControlChannel};
use crate::session::events::{ConnectFailure, SessionEvent, SessionEventStream};
use crate::transport::broker::CredentialBroker;
use crate::transport::webrtc::WebRtcNegotiator;
use crate::transport::{CredentialSource, LinkSignal, Negotiator, PeerLink};

const COMMAND_CHANNEL_CAPACITY: usize = 64;
const EVENT_CHANNEL_CAPACITY: usize = 256;
const LINK_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle states of a voice session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
}

/// A realtime voice session.
///
/// All operations are forwarded to a controller task; the task processes
/// them strictly in order, so a `connect` issued while another `connect` is
/// in flight resolves after it and becomes a no-op.
#[must_use]
pub struct VoiceSession {
    sender: mpsc::Sender<Command>,
    event_rx: mpsc::Receiver<SessionEvent>,
}

/// Cloneable handle for driving a session from another task, e.g. a
/// rendering loop sampling activity per frame.
#[derive(Clone)]
pub struct VoiceSessionHandle {
    sender: mpsc::Sender<Command>,
}

impl VoiceSession {
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    /// Assemble a session from explicit collaborators.
    pub fn from_parts(
        options: SessionOptions,
        credentials: Box<dyn CredentialSource>,
        negotiator: Box<dyn Negotiator>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (link_tx, link_rx) = mpsc::channel(LINK_CHANNEL_CAPACITY);

        let controller = Controller {
            options,
            credentials,
            negotiator,
            event_tx,
            link_tx,
            analyzer: ActivityAnalyzer::new(),
            state: SessionState::Idle,
            retry_count: 0,
            generation: 0,
            handshake_sent: false,
            channel_announced: false,
            active: None,
        };
        tokio::spawn(controller.run(cmd_rx, link_rx));

        Self {
            sender: cmd_tx,
            event_rx,
        }
    }

    #[must_use]
    pub fn handle(&self) -> VoiceSessionHandle {
        VoiceSessionHandle {
            sender: self.sender.clone(),
        }
    }

    /// Connect the session: acquire a credential, negotiate the transport
    /// and send the configuration handshake.
    ///
    /// A no-op when already connecting or connected.
    ///
    /// # Errors
    /// Returns the failure that was also published as a
    /// [`SessionEvent::ConnectionError`].
    pub async fn connect(&self) -> Result<()> {
        roundtrip(&self.sender, |respond| Command::Connect { respond }).await?
    }

    /// Tear the session down. Safe to call in any state, repeatedly.
    ///
    /// # Errors
    /// Returns an error only if the controller task is gone.
    pub async fn disconnect(&self) -> Result<()> {
        roundtrip(&self.sender, |respond| Command::Disconnect { respond }).await
    }

    /// Tear down and connect again, bounded by the configured retry budget.
    ///
    /// # Errors
    /// Returns [`Error::ReconnectExhausted`] once the budget is spent, or
    /// the connect failure otherwise.
    pub async fn reconnect(&self) -> Result<()> {
        roundtrip(&self.sender, |respond| Command::Reconnect { respond }).await?
    }

    /// Current lifecycle state.
    ///
    /// # Errors
    /// Returns an error only if the controller task is gone.
    pub async fn state(&self) -> Result<SessionState> {
        roundtrip(&self.sender, |respond| Command::State { respond }).await
    }

    /// Send a raw protocol command over the control channel.
    ///
    /// Fire-and-forget: dropped with a warning when no channel is open.
    ///
    /// # Errors
    /// Returns an error if serialization or the transport send fails.
    pub async fn send_raw(&self, event: ClientEvent) -> Result<()> {
        roundtrip(&self.sender, |respond| Command::Send { event, respond }).await?
    }

    /// Commit the input audio buffer, prompting the server to respond.
    ///
    /// # Errors
    /// Returns an error if the send fails.
    pub async fn commit_input_audio(&self) -> Result<()> {
        self.send_raw(ClientEvent::InputAudioBufferCommit { event_id: None })
            .await
    }

    /// Clear the input audio buffer.
    ///
    /// # Errors
    /// Returns an error if the send fails.
    pub async fn clear_input_audio(&self) -> Result<()> {
        self.send_raw(ClientEvent::InputAudioBufferClear { event_id: None })
            .await
    }

    /// Sample activity levels for the current frame and advance their decay.
    /// Also publishes a [`SessionEvent::AiAudioData`] snapshot.
    ///
    /// # Errors
    /// Returns an error only if the controller task is gone.
    pub async fn sample_activity(&self) -> Result<ActivitySample> {
        roundtrip(&self.sender, |respond| Command::SampleActivity { respond }).await
    }

    /// Await the next session event.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.event_rx.recv().await
    }

    /// Stream session events.
    #[must_use]
    pub fn events(&mut self) -> SessionEventStream<'_> {
        SessionEventStream::new(&mut self.event_rx)
    }
}

impl VoiceSessionHandle {
    /// See [`VoiceSession::connect`].
    ///
    /// # Errors
    /// Returns the connect failure, or an error if the controller is gone.
    pub async fn connect(&self) -> Result<()> {
        roundtrip(&self.sender, |respond| Command::Connect { respond }).await?
    }

    /// See [`VoiceSession::disconnect`].
    ///
    /// # Errors
    /// Returns an error only if the controller task is gone.
    pub async fn disconnect(&self) -> Result<()> {
        roundtrip(&self.sender, |respond| Command::Disconnect { respond }).await
    }

    /// See [`VoiceSession::state`].
    ///
    /// # Errors
    /// Returns an error only if the controller task is gone.
    pub async fn state(&self) -> Result<SessionState> {
        roundtrip(&self.sender, |respond| Command::State { respond }).await
    }

    /// See [`VoiceSession::send_raw`].
    ///
    /// # Errors
    /// Returns an error if serialization or the transport send fails.
    pub async fn send_raw(&self, event: ClientEvent) -> Result<()> {
        roundtrip(&self.sender, |respond| Command::Send { event, respond }).await?
    }

    /// See [`VoiceSession::sample_activity`].
    ///
    /// # Errors
    /// Returns an error only if the controller task is gone.
    pub async fn sample_activity(&self) -> Result<ActivitySample> {
        roundtrip(&self.sender, |respond| Command::SampleActivity { respond }).await
    }
}

async fn roundtrip<T>(
    sender: &mpsc::Sender<Command>,
    make: impl FnOnce(oneshot::Sender<T>) -> Command,
) -> Result<T> {
    let (tx, rx) = oneshot::channel();
    sender
        .send(make(tx))
        .await
        .map_err(|_| Error::ControllerClosed)?;
    rx.await.map_err(|_| Error::ControllerClosed)
}

/// Builder wiring default collaborators from [`SessionOptions`].
#[must_use]
pub struct SessionBuilder {
    options: SessionOptions,
    credentials: Option<Box<dyn CredentialSource>>,
    negotiator: Option<Box<dyn Negotiator>>,
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self {
            options: SessionOptions::default(),
            credentials: None,
            negotiator: None,
        }
    }

    pub fn options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    /// Override the credential source, e.g. for tests.
    pub fn credential_source(mut self, source: Box<dyn CredentialSource>) -> Self {
        self.credentials = Some(source);
        self
    }

    /// Override the transport negotiator, e.g. for tests.
    pub fn negotiator(mut self, negotiator: Box<dyn Negotiator>) -> Self {
        self.negotiator = Some(negotiator);
        self
    }

    /// Build the session and spawn its controller task.
    ///
    /// # Errors
    /// Returns an error if the default broker or negotiator cannot be built.
    pub fn build(self) -> Result<VoiceSession> {
        let credentials = match self.credentials {
            Some(source) => source,
            None => Box::new(CredentialBroker::from_options(&self.options)?),
        };
        let negotiator = match self.negotiator {
            Some(negotiator) => negotiator,
            None => Box::new(WebRtcNegotiator::from_options(self.options.clone())?),
        };
        Ok(VoiceSession::from_parts(self.options, credentials, negotiator))
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

enum Command {
    Connect { respond: oneshot::Sender<Result<()>> },
    Disconnect { respond: oneshot::Sender<()> },
    Reconnect { respond: oneshot::Sender<Result<()>> },
    State { respond: oneshot::Sender<SessionState> },
    Send { event: ClientEvent, respond: oneshot::Sender<Result<()>> },
    SampleActivity { respond: oneshot::Sender<ActivitySample> },
}

struct LinkItem {
    generation: u64,
    kind: LinkItemKind,
}

enum LinkItemKind {
    Message(String),
    Signal(LinkSignal),
    Audio(Vec<f32>),
}

struct ActiveLink {
    control: ControlChannel,
    tasks: Vec<JoinHandle<()>>,
}

struct Controller {
    options: SessionOptions,
    credentials: Box<dyn CredentialSource>,
    negotiator: Box<dyn Negotiator>,
    event_tx: mpsc::Sender<SessionEvent>,
    link_tx: mpsc::Sender<LinkItem>,
    analyzer: ActivityAnalyzer,
    state: SessionState,
    retry_count: u32,
    generation: u64,
    handshake_sent: bool,
    channel_announced: bool,
    active: Option<ActiveLink>,
}

impl Controller {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut link_rx: mpsc::Receiver<LinkItem>,
    ) {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        // Session dropped: release everything.
                        self.teardown().await;
                        break;
                    }
                },
                item = link_rx.recv() => {
                    // The controller holds a sender clone, so recv never
                    // yields None here.
                    if let Some(item) = item {
                        if item.generation == self.generation {
                            self.handle_link_item(item.kind).await;
                        }
                    }
                }
            }
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect { respond } => {
                let result = self.handle_connect().await;
                let _ = respond.send(result);
            }
            Command::Disconnect { respond } => {
                self.handle_disconnect().await;
                let _ = respond.send(());
            }
            Command::Reconnect { respond } => {
                let result = self.handle_reconnect().await;
                let _ = respond.send(result);
            }
            Command::State { respond } => {
                let _ = respond.send(self.state);
            }
            Command::Send { event, respond } => {
                let result = self.handle_send(&event).await;
                let _ = respond.send(result);
            }
            Command::SampleActivity { respond } => {
                let sample = self.handle_sample().await;
                let _ = respond.send(sample);
            }
        }
    }

    async fn handle_connect(&mut self) -> Result<()> {
        if matches!(self.state, SessionState::Connecting | SessionState::Connected) {
            tracing::warn!(state = ?self.state, "connect ignored, session already active");
            return Ok(());
        }
        self.set_state(SessionState::Connecting);

        match self.establish().await {
            Ok(()) => {
                self.retry_count = 0;
                self.set_state(SessionState::Connected);
                self.emit(SessionEvent::Connected).await;
                if self
                    .active
                    .as_ref()
                    .is_some_and(|link| link.control.is_open())
                {
                    self.announce_channel_open().await;
                    self.send_handshake().await;
                }
                Ok(())
            }
            Err(failure) => {
                self.set_state(SessionState::Disconnected);
                self.emit(SessionEvent::ConnectionError {
                    error: failure.clone(),
                })
                .await;
                Err(match failure {
                    ConnectFailure::Credential(err) => Error::Credential(err),
                    ConnectFailure::Negotiation(err) => Error::Negotiation(err),
                    ConnectFailure::Transport(detail) => Error::Negotiation(
                        crate::error::NegotiationError::TransportFailed(detail),
                    ),
                })
            }
        }
    }

    async fn establish(&mut self) -> std::result::Result<(), ConnectFailure> {
        let credential = self.credentials.acquire().await?;
        let link = self.negotiator.negotiate(&credential).await?;
        // The credential authorized this one negotiation; it is dropped here
        // and never stored.
        drop(credential);

        self.generation += 1;
        self.handshake_sent = false;
        self.channel_announced = false;
        let control = self.spawn_forwarders(link);
        self.active = Some(control);
        Ok(())
    }

    fn spawn_forwarders(&self, link: PeerLink) -> ActiveLink {
        let PeerLink {
            control,
            mut messages,
            mut signals,
            mut remote_audio,
        } = link;
        let generation = self.generation;

        let message_tx = self.link_tx.clone();
        let message_task = tokio::spawn(async move {
            while let Some(text) = messages.recv().await {
                let item = LinkItem {
                    generation,
                    kind: LinkItemKind::Message(text),
                };
                if message_tx.send(item).await.is_err() {
                    break;
                }
            }
        });

        let signal_tx = self.link_tx.clone();
        let signal_task = tokio::spawn(async move {
            while let Some(signal) = signals.recv().await {
                let item = LinkItem {
                    generation,
                    kind: LinkItemKind::Signal(signal),
                };
                if signal_tx.send(item).await.is_err() {
                    break;
                }
            }
        });

        let audio_tx = self.link_tx.clone();
        let audio_task = tokio::spawn(async move {
            while let Some(frame) = remote_audio.recv().await {
                let item = LinkItem {
                    generation,
                    kind: LinkItemKind::Audio(frame),
                };
                if audio_tx.send(item).await.is_err() {
                    break;
                }
            }
        });

        ActiveLink {
            control: ControlChannel::new(control),
            tasks: vec![message_task, signal_task, audio_task],
        }
    }

    async fn handle_disconnect(&mut self) {
        let was_connected = self.state == SessionState::Connected;
        self.teardown().await;
        if self.state != SessionState::Idle {
            self.set_state(SessionState::Disconnected);
        }
        if was_connected {
            self.emit(SessionEvent::Disconnected).await;
        }
    }

    async fn handle_reconnect(&mut self) -> Result<()> {
        if self.retry_count >= self.options.max_retries {
            tracing::warn!(
                max_retries = self.options.max_retries,
                "reconnect refused, retry budget exhausted"
            );
            return Err(Error::ReconnectExhausted(self.options.max_retries));
        }
        self.retry_count += 1;
        tracing::info!(
            attempt = self.retry_count,
            max_retries = self.options.max_retries,
            "Reconnecting"
        );

        self.handle_disconnect().await;
        self.set_state(SessionState::Reconnecting);
        self.handle_connect().await
    }

    async fn handle_send(&mut self, event: &ClientEvent) -> Result<()> {
        match &self.active {
            Some(link) => link.control.send(event).await,
            None => {
                tracing::warn!("No active session, dropping command");
                Ok(())
            }
        }
    }

    async fn handle_sample(&mut self) -> ActivitySample {
        let (sample, frequency_data) = self.analyzer.sample_frame();
        // Audio data snapshots are only meaningful while a session is live.
        if self.state == SessionState::Connected {
            self.emit(SessionEvent::AiAudioData {
                volume: sample.output_level,
                frequency_data,
                timestamp: sample.timestamp,
            })
            .await;
        }
        sample
    }

    async fn handle_link_item(&mut self, kind: LinkItemKind) {
        match kind {
            LinkItemKind::Message(text) => self.handle_message(&text).await,
            LinkItemKind::Signal(signal) => self.handle_signal(signal).await,
            LinkItemKind::Audio(frame) => self.analyzer.feed(&frame),
        }
    }

    async fn handle_message(&mut self, text: &str) {
        let Some(event) = channel::parse_message(text) else {
            return;
        };

        match &event {
            ServerEvent::ResponseAudioDelta { .. } => {
                self.analyzer.assistant_started_speaking();
            }
            ServerEvent::InputAudioBufferSpeechStarted { .. } => {
                self.analyzer.user_started_speaking();
            }
            ServerEvent::InputAudioBufferSpeechStopped { .. } => {
                self.analyzer.user_stopped_speaking();
            }
            _ => {}
        }

        self.emit(channel::classify(event)).await;
    }

    async fn handle_signal(&mut self, signal: LinkSignal) {
        match signal {
            LinkSignal::ChannelOpen => {
                self.announce_channel_open().await;
                self.send_handshake().await;
            }
            LinkSignal::ChannelError(message) => {
                self.emit(SessionEvent::ChannelError { message }).await;
            }
            LinkSignal::TransportFailed(detail) => {
                self.emit(SessionEvent::ConnectionError {
                    error: ConnectFailure::Transport(detail),
                })
                .await;
                self.handle_disconnect().await;
            }
            LinkSignal::TransportClosed => {
                tracing::info!("Peer transport closed");
                self.handle_disconnect().await;
            }
        }
    }

    /// Emit `ChannelOpen` once per link; the open callback can race the
    /// connect path and report a channel that was already announced.
    async fn announce_channel_open(&mut self) {
        if self.channel_announced {
            return;
        }
        self.channel_announced = true;
        self.emit(SessionEvent::ChannelOpen).await;
    }

    async fn send_handshake(&mut self) {
        if self.handshake_sent {
            return;
        }
        let update = SessionUpdate {
            instructions: Some(self.options.instructions.clone()),
            voice: Some(self.options.voice.clone()),
            input_audio_format: Some(AudioFormat::Pcm16),
            output_audio_format: Some(AudioFormat::Pcm16),
            input_audio_transcription: Some(InputAudioTranscription::default()),
            turn_detection: Some(self.options.turn_detection.clone()),
        };
        let event = ClientEvent::SessionUpdate {
            event_id: None,
            session: Box::new(update),
        };
        if let Some(link) = &self.active {
            match link.control.send(&event).await {
                Ok(()) => {
                    self.handshake_sent = true;
                    tracing::info!("Session configuration sent");
                }
                Err(err) => tracing::warn!("Failed to send session configuration: {err}"),
            }
        }
    }

    /// Release the active link: control channel first, then the peer
    /// connection and local media behind it, then the analyzer.
    async fn teardown(&mut self) {
        if let Some(link) = self.active.take() {
            if let Err(err) = link.control.close().await {
                tracing::warn!("Error while closing peer link: {err}");
            }
            for task in link.tasks {
                task.abort();
            }
        }
        self.generation += 1;
        self.handshake_sent = false;
        self.channel_announced = false;
        self.analyzer.reset();
    }

    fn set_state(&mut self, next: SessionState) {
        if self.state != next {
            tracing::info!(from = ?self.state, to = ?next, "Session state changed");
            self.state = next;
        }
    }

    async fn emit(&self, event: SessionEvent) {
        if self.event_tx.send(event).await.is_err() {
            tracing::debug!("Session event receiver dropped");
        }
    }
}
