//! WebRTC peer transport: offer/answer negotiation, the control data
//! channel, the mu-law uplink track and decoded remote audio.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rubato::{FftFixedIn, Resampler};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_PCMU, MediaEngine};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use crate::config::SessionOptions;
use crate::error::{NegotiationError, Result};
use crate::media::{self, AudioSource, Microphone};
use crate::transport::broker::EphemeralCredential;
use crate::transport::signaling::SignalingClient;
use crate::transport::{ControlLink, LinkSignal, Negotiator, PeerLink};

const CONTROL_CHANNEL_LABEL: &str = "oai-events";
const MESSAGE_CHANNEL_CAPACITY: usize = 128;
const SIGNAL_CHANNEL_CAPACITY: usize = 32;
const AUDIO_CHANNEL_CAPACITY: usize = 256;

const UPLINK_SAMPLE_RATE: u32 = 8000;
const UPLINK_FRAME_SAMPLES: usize = 160; // 20ms at 8kHz
const UPLINK_FRAME_DURATION: Duration = Duration::from_millis(20);
const RESAMPLER_SUB_CHUNKS: usize = 2;

/// Negotiates a WebRTC peer transport authorized by an ephemeral credential.
pub struct WebRtcNegotiator {
    options: SessionOptions,
    signaling: SignalingClient,
    audio_source: Box<dyn AudioSource>,
}

impl WebRtcNegotiator {
    /// Create a negotiator using the default microphone.
    ///
    /// # Errors
    /// Returns an error if the signaling client cannot be built.
    pub fn from_options(options: SessionOptions) -> Result<Self> {
        let signaling = SignalingClient::from_options(&options)?;
        let microphone = Microphone::new(options.input_device.clone());
        Ok(Self {
            options,
            signaling,
            audio_source: Box::new(microphone),
        })
    }

    /// Replace the audio source, e.g. with a specific input device.
    #[must_use]
    pub fn with_audio_source(mut self, source: Box<dyn AudioSource>) -> Self {
        self.audio_source = source;
        self
    }

    async fn build_peer_connection(
        &self,
    ) -> std::result::Result<Arc<RTCPeerConnection>, webrtc::Error> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = self
            .options
            .ice_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        Ok(Arc::new(api.new_peer_connection(config).await?))
    }
}

#[async_trait]
impl Negotiator for WebRtcNegotiator {
    async fn negotiate(
        &mut self,
        credential: &EphemeralCredential,
    ) -> std::result::Result<PeerLink, NegotiationError> {
        // Local media first: a denied microphone must fail before any
        // network traffic happens.
        let capture = self.audio_source.open()?;

        let pc = self
            .build_peer_connection()
            .await
            .map_err(|err| NegotiationError::TransportFailed(err.to_string()))?;

        let (message_tx, message_rx) = mpsc::channel(MESSAGE_CHANNEL_CAPACITY);
        let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_CHANNEL_CAPACITY);
        let (audio_tx, audio_rx) = mpsc::channel(AUDIO_CHANNEL_CAPACITY);

        match self
            .establish(&pc, capture, credential, &message_tx, &signal_tx, &audio_tx)
            .await
        {
            Ok((channel, uplink)) => {
                tracing::info!("Peer negotiation complete");
                Ok(PeerLink {
                    control: Box::new(DataChannelLink {
                        channel,
                        peer: pc,
                        uplink,
                    }),
                    messages: message_rx,
                    signals: signal_rx,
                    remote_audio: audio_rx,
                })
            }
            Err(err) => {
                // A failed negotiation must not hold the peer connection.
                let _ = pc.close().await;
                Err(err)
            }
        }
    }
}

impl WebRtcNegotiator {
    async fn establish(
        &self,
        pc: &Arc<RTCPeerConnection>,
        capture: crate::media::AudioCapture,
        credential: &EphemeralCredential,
        message_tx: &mpsc::Sender<String>,
        signal_tx: &mpsc::Sender<LinkSignal>,
        audio_tx: &mpsc::Sender<Vec<f32>>,
    ) -> std::result::Result<(Arc<RTCDataChannel>, JoinHandle<()>), NegotiationError> {
        // The control channel must exist before the offer is created so it
        // is part of the negotiated SDP.
        let channel = pc
            .create_data_channel(CONTROL_CHANNEL_LABEL, None)
            .await
            .map_err(|err| NegotiationError::TransportFailed(err.to_string()))?;
        wire_channel_callbacks(&channel, message_tx, signal_tx);
        wire_peer_callbacks(pc, signal_tx, audio_tx);

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_PCMU.to_owned(),
                clock_rate: UPLINK_SAMPLE_RATE,
                channels: 1,
                ..Default::default()
            },
            "audio".to_owned(),
            "voicewire".to_owned(),
        ));
        let rtp_sender = pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|err| NegotiationError::TransportFailed(err.to_string()))?;

        // Drain RTCP so the interceptors keep running.
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while rtp_sender.read(&mut rtcp_buf).await.is_ok() {}
        });

        let uplink = tokio::spawn(run_uplink(capture, track));

        match self.exchange(pc, credential).await {
            Ok(()) => Ok((channel, uplink)),
            Err(err) => {
                // Aborting the uplink drops the capture, which stops the
                // microphone.
                uplink.abort();
                Err(err)
            }
        }
    }

    async fn exchange(
        &self,
        pc: &Arc<RTCPeerConnection>,
        credential: &EphemeralCredential,
    ) -> std::result::Result<(), NegotiationError> {
        let offer = pc
            .create_offer(None)
            .await
            .map_err(|err| NegotiationError::TransportFailed(err.to_string()))?;
        pc.set_local_description(offer)
            .await
            .map_err(|err| NegotiationError::TransportFailed(err.to_string()))?;

        let mut gather_complete = pc.gathering_complete_promise().await;
        let _ = gather_complete.recv().await;

        let local = pc.local_description().await.ok_or_else(|| {
            NegotiationError::TransportFailed("local description missing after gathering".to_string())
        })?;

        let answer_sdp = self
            .signaling
            .exchange_offer(&local.sdp, credential, &self.options.model)
            .await?;

        let answer = RTCSessionDescription::answer(answer_sdp)
            .map_err(|err| NegotiationError::TransportFailed(err.to_string()))?;
        pc.set_remote_description(answer)
            .await
            .map_err(|err| NegotiationError::TransportFailed(err.to_string()))
    }
}

fn wire_channel_callbacks(
    channel: &Arc<RTCDataChannel>,
    message_tx: &mpsc::Sender<String>,
    signal_tx: &mpsc::Sender<LinkSignal>,
) {
    let open_tx = signal_tx.clone();
    channel.on_open(Box::new(move || {
        Box::pin(async move {
            tracing::debug!("Control channel open");
            let _ = open_tx.send(LinkSignal::ChannelOpen).await;
        })
    }));

    let text_tx = message_tx.clone();
    channel.on_message(Box::new(move |msg: DataChannelMessage| {
        let text_tx = text_tx.clone();
        Box::pin(async move {
            if msg.is_string {
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => {
                        let _ = text_tx.send(text).await;
                    }
                    Err(err) => tracing::warn!("Dropping non-UTF8 control message: {err}"),
                }
            } else {
                tracing::debug!("Ignoring binary control message ({} bytes)", msg.data.len());
            }
        })
    }));

    let error_tx = signal_tx.clone();
    channel.on_error(Box::new(move |err| {
        let error_tx = error_tx.clone();
        Box::pin(async move {
            let _ = error_tx.send(LinkSignal::ChannelError(err.to_string())).await;
        })
    }));

    let close_tx = signal_tx.clone();
    channel.on_close(Box::new(move || {
        let close_tx = close_tx.clone();
        Box::pin(async move {
            tracing::debug!("Control channel closed");
            let _ = close_tx.send(LinkSignal::TransportClosed).await;
        })
    }));
}

fn wire_peer_callbacks(
    pc: &Arc<RTCPeerConnection>,
    signal_tx: &mpsc::Sender<LinkSignal>,
    audio_tx: &mpsc::Sender<Vec<f32>>,
) {
    let state_tx = signal_tx.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let state_tx = state_tx.clone();
        tracing::info!(state = ?state, "Peer connection state changed");
        Box::pin(async move {
            match state {
                RTCPeerConnectionState::Failed => {
                    let _ = state_tx
                        .send(LinkSignal::TransportFailed("peer connection failed".to_string()))
                        .await;
                }
                RTCPeerConnectionState::Closed | RTCPeerConnectionState::Disconnected => {
                    let _ = state_tx.send(LinkSignal::TransportClosed).await;
                }
                _ => {}
            }
        })
    }));

    let track_tx = audio_tx.clone();
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let track_tx = track_tx.clone();
        Box::pin(async move {
            if track.kind() == RTPCodecType::Audio {
                tracing::info!(
                    codec = track.codec().capability.mime_type,
                    "Remote audio track received"
                );
                tokio::spawn(read_remote_audio(track, track_tx));
            }
        })
    }));
}

async fn read_remote_audio(track: Arc<TrackRemote>, audio_tx: mpsc::Sender<Vec<f32>>) {
    let mime_type = track.codec().capability.mime_type.clone();
    let is_mulaw = mime_type.eq_ignore_ascii_case(MIME_TYPE_PCMU);

    loop {
        match track.read_rtp().await {
            Ok((packet, _attributes)) => {
                if packet.payload.is_empty() {
                    continue;
                }
                let samples = if is_mulaw {
                    media::decode_mulaw(&packet.payload)
                } else {
                    pcm16_to_f32(&packet.payload)
                };
                if audio_tx.send(samples).await.is_err() {
                    tracing::debug!("Remote audio channel closed");
                    break;
                }
            }
            Err(err) => {
                tracing::debug!("Remote track read ended: {err}");
                break;
            }
        }
    }
}

fn pcm16_to_f32(payload: &[u8]) -> Vec<f32> {
    payload
        .chunks_exact(2)
        .map(|chunk| f32::from(i16::from_le_bytes([chunk[0], chunk[1]])) / 32_768.0)
        .collect()
}

/// Forward microphone frames to the uplink track as 20ms mu-law samples.
async fn run_uplink(mut capture: crate::media::AudioCapture, track: Arc<TrackLocalStaticSample>) {
    let mut resampler = if capture.sample_rate == UPLINK_SAMPLE_RATE {
        None
    } else {
        let chunk = capture.sample_rate as usize / 50;
        match FftFixedIn::<f32>::new(
            capture.sample_rate as usize,
            UPLINK_SAMPLE_RATE as usize,
            chunk,
            RESAMPLER_SUB_CHUNKS,
            1,
        ) {
            Ok(r) => Some(r),
            Err(err) => {
                tracing::warn!("Failed to create uplink resampler: {err}, using passthrough");
                None
            }
        }
    };

    let mut pending: Vec<f32> = Vec::new();
    let mut outbound: Vec<f32> = Vec::new();

    while let Some(frame) = capture.frames.recv().await {
        if let Some(resampler) = resampler.as_mut() {
            pending.extend_from_slice(&frame);
            let needed = resampler.input_frames_next();
            while pending.len() >= needed {
                let chunk: Vec<f32> = pending.drain(..needed).collect();
                match resampler.process(&[chunk], None) {
                    Ok(mut resampled) => {
                        if let Some(channel) = resampled.pop() {
                            outbound.extend_from_slice(&channel);
                        }
                    }
                    Err(err) => tracing::warn!("Uplink resample error: {err}"),
                }
            }
        } else {
            outbound.extend_from_slice(&frame);
        }

        while outbound.len() >= UPLINK_FRAME_SAMPLES {
            let frame: Vec<f32> = outbound.drain(..UPLINK_FRAME_SAMPLES).collect();
            let sample = Sample {
                data: Bytes::from(media::encode_mulaw(&frame)),
                duration: UPLINK_FRAME_DURATION,
                ..Default::default()
            };
            if let Err(err) = track.write_sample(&sample).await {
                tracing::debug!("Uplink write ended: {err}");
                return;
            }
        }
    }

    tracing::debug!("Microphone capture ended, uplink stopped");
}

/// [`ControlLink`] backed by a WebRTC data channel.
struct DataChannelLink {
    channel: Arc<RTCDataChannel>,
    peer: Arc<RTCPeerConnection>,
    uplink: JoinHandle<()>,
}

#[async_trait]
impl ControlLink for DataChannelLink {
    fn is_open(&self) -> bool {
        self.channel.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, payload: String) -> Result<()> {
        self.channel.send_text(payload).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // Teardown order: control channel, peer connection, local media.
        // The uplink task owns the capture, so aborting it releases the
        // microphone.
        self.channel.close().await?;
        self.peer.close().await?;
        self.uplink.abort();
        Ok(())
    }
}
