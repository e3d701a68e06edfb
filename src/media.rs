//! Local audio capture and the G.711 transforms used on the uplink track.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tokio::sync::mpsc;

use crate::error::NegotiationError;

const CAPTURE_CHANNEL_CAPACITY: usize = 64;
const MULAW_BIAS: i32 = 0x84;
const MULAW_CLIP: i32 = 32_635;

/// A running microphone capture. Frames are mono f32 at `sample_rate`.
///
/// Dropping the capture stops the underlying device stream.
pub struct AudioCapture {
    pub sample_rate: u32,
    pub frames: mpsc::Receiver<Vec<f32>>,
    stop: Arc<AtomicBool>,
}

impl AudioCapture {
    /// Wrap an already-running frame source, e.g. a synthetic feed.
    #[must_use]
    pub fn new(sample_rate: u32, frames: mpsc::Receiver<Vec<f32>>) -> Self {
        Self {
            sample_rate,
            frames,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Provider of local audio input for the uplink track.
pub trait AudioSource: Send + Sync {
    /// Open the source and start producing frames.
    ///
    /// # Errors
    /// Returns [`NegotiationError::MediaDenied`] when no usable input device
    /// is available.
    fn open(&mut self) -> std::result::Result<AudioCapture, NegotiationError>;
}

/// The default microphone on the host system.
#[derive(Debug, Default)]
pub struct Microphone {
    device_name: Option<String>,
}

impl Microphone {
    #[must_use]
    pub const fn new(device_name: Option<String>) -> Self {
        Self { device_name }
    }
}

impl AudioSource for Microphone {
    fn open(&mut self) -> std::result::Result<AudioCapture, NegotiationError> {
        let host = cpal::default_host();
        let device = match &self.device_name {
            Some(name) => host
                .input_devices()
                .map_err(|err| NegotiationError::MediaDenied(err.to_string()))?
                .find(|d| d.name().is_ok_and(|n| &n == name))
                .ok_or_else(|| {
                    NegotiationError::MediaDenied(format!("input device {name} not found"))
                })?,
            None => host.default_input_device().ok_or_else(|| {
                NegotiationError::MediaDenied("no default input device".to_string())
            })?,
        };

        let config = device
            .default_input_config()
            .map_err(|err| NegotiationError::MediaDenied(err.to_string()))?;
        let sample_rate = config.sample_rate().0;
        let channels = usize::from(config.channels());

        let (frame_tx, frame_rx) = mpsc::channel(CAPTURE_CHANNEL_CAPACITY);
        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();

        // cpal streams are !Send, so the stream lives on a dedicated thread
        // and samples are forwarded through the channel. The callback uses
        // try_send so a slow consumer drops frames instead of stalling the
        // audio thread.
        let stop_thread = Arc::clone(&stop);
        std::thread::spawn(move || {
            let err_fn = |err| tracing::warn!("Input stream error: {err}");
            let built = match config.sample_format() {
                cpal::SampleFormat::F32 => device.build_input_stream(
                    &config.into(),
                    {
                        let frame_tx = frame_tx.clone();
                        move |data: &[f32], _: &cpal::InputCallbackInfo| {
                            let _ = frame_tx.try_send(downmix(data, channels));
                        }
                    },
                    err_fn,
                    None,
                ),
                cpal::SampleFormat::I16 => device.build_input_stream(
                    &config.into(),
                    {
                        let frame_tx = frame_tx.clone();
                        move |data: &[i16], _: &cpal::InputCallbackInfo| {
                            let floats: Vec<f32> =
                                data.iter().map(|&s| f32::from(s) / 32_768.0).collect();
                            let _ = frame_tx.try_send(downmix(&floats, channels));
                        }
                    },
                    err_fn,
                    None,
                ),
                other => {
                    let _ = ready_tx.send(Err(format!("unsupported sample format {other}")));
                    return;
                }
            };

            let stream = match built {
                Ok(stream) => stream,
                Err(err) => {
                    let _ = ready_tx.send(Err(err.to_string()));
                    return;
                }
            };
            if let Err(err) = stream.play() {
                let _ = ready_tx.send(Err(err.to_string()));
                return;
            }
            let _ = ready_tx.send(Ok(()));

            while !stop_thread.load(Ordering::Acquire) {
                std::thread::sleep(Duration::from_millis(50));
            }
        });

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(AudioCapture {
                sample_rate,
                frames: frame_rx,
                stop,
            }),
            Ok(Err(detail)) => Err(NegotiationError::MediaDenied(detail)),
            Err(_) => Err(NegotiationError::MediaDenied(
                "capture thread exited before the stream started".to_string(),
            )),
        }
    }
}

/// Average interleaved channels down to mono.
#[must_use]
pub fn downmix(samples: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Encode a linear PCM16 sample as G.711 mu-law.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn linear_to_mulaw(pcm: i16) -> u8 {
    let mut magnitude = i32::from(pcm);
    let sign: u8 = if magnitude < 0 {
        magnitude = -magnitude;
        0x80
    } else {
        0
    };
    if magnitude > MULAW_CLIP {
        magnitude = MULAW_CLIP;
    }
    magnitude += MULAW_BIAS;

    let mut exponent: u8 = 7;
    let mut mask = 0x4000;
    while exponent > 0 && (magnitude & mask) == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = ((magnitude >> (exponent + 3)) & 0x0F) as u8;
    !(sign | (exponent << 4) | mantissa)
}

/// Decode a G.711 mu-law byte to linear PCM16.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn mulaw_to_linear(byte: u8) -> i16 {
    let byte = !byte;
    let sign = byte & 0x80;
    let exponent = (byte >> 4) & 0x07;
    let mantissa = i32::from(byte & 0x0F);
    let magnitude = ((mantissa << 3) + MULAW_BIAS) << exponent;
    let sample = magnitude - MULAW_BIAS;
    if sign == 0 { sample as i16 } else { (-sample) as i16 }
}

/// Encode mono f32 samples in [-1, 1] as a mu-law byte stream.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn encode_mulaw(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .map(|&s| {
            let clamped = (s.clamp(-1.0, 1.0) * 32_767.0) as i16;
            linear_to_mulaw(clamped)
        })
        .collect()
}

/// Decode a mu-law byte stream to mono f32 samples.
#[must_use]
pub fn decode_mulaw(payload: &[u8]) -> Vec<f32> {
    payload
        .iter()
        .map(|&b| f32::from(mulaw_to_linear(b)) / 32_768.0)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_source_objects_cross_threads() {
        fn assert_send_sync<T: Send + Sync + ?Sized>() {}
        assert_send_sync::<dyn AudioSource>();
    }

    #[test]
    fn mulaw_silence_encodes_to_ff() {
        assert_eq!(linear_to_mulaw(0), 0xFF);
    }

    #[test]
    fn mulaw_round_trip_is_close() {
        for &pcm in &[0i16, 100, -100, 1000, -1000, 16_000, -16_000, 32_000] {
            let decoded = mulaw_to_linear(linear_to_mulaw(pcm));
            let error = (i32::from(decoded) - i32::from(pcm)).abs();
            // mu-law is logarithmic, tolerance scales with magnitude.
            assert!(
                error <= i32::from(pcm).abs() / 10 + 40,
                "pcm {pcm} decoded as {decoded}"
            );
        }
    }

    #[test]
    fn mulaw_clips_extremes() {
        let max = mulaw_to_linear(linear_to_mulaw(i16::MAX));
        let min = mulaw_to_linear(linear_to_mulaw(i16::MIN));
        assert!(max > 30_000);
        assert!(min < -30_000);
    }

    #[test]
    fn downmix_averages_stereo() {
        let stereo = [0.5, 0.3, 0.6, 0.2];
        let mono = downmix(&stereo, 2);
        assert_eq!(mono.len(), 2);
        assert!((mono[0] - 0.4).abs() < 1e-6);
        assert!((mono[1] - 0.4).abs() < 1e-6);
    }

    #[test]
    fn downmix_mono_is_identity() {
        let samples = [0.1, -0.2, 0.3];
        assert_eq!(downmix(&samples, 1), samples.to_vec());
    }

    #[test]
    fn encode_mulaw_clamps_out_of_range() {
        let encoded = encode_mulaw(&[2.0, -2.0]);
        assert_eq!(encoded[0], linear_to_mulaw(32_767));
        assert_eq!(encoded[1], linear_to_mulaw(-32_767));
    }
}
