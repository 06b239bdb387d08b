//! Microphone input abstraction and level metering.
//!
//! The engine never touches a device directly: an `AudioInput` hands out a channel of PCM frames
//! on `open` and releases the device on `close`. Frames feed both the live volume meter and the
//! session recorder.

use crate::error::{LiveError, LiveResult};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const FRAME_CHANNEL_CAPACITY: usize = 64;

/// Audio sample data (16-bit PCM, mono)
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Raw samples
    pub samples: Vec<i16>,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Milliseconds since capture started
    pub timestamp_ms: u64,
}

impl AudioFrame {
    /// Normalized RMS level in 0.0..=1.0, used for the live volume indicator.
    pub fn level(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let sum: f64 = self
            .samples
            .iter()
            .map(|&s| {
                let v = s as f64 / i16::MAX as f64;
                v * v
            })
            .sum();
        ((sum / self.samples.len() as f64).sqrt() as f32).clamp(0.0, 1.0)
    }
}

/// Microphone capability. Only one open stream at a time; `close` must be safe to call twice.
#[async_trait]
pub trait AudioInput: Send + Sync {
    /// Acquire the device. Permission problems map to `LiveError::Permission`.
    async fn open(&self) -> LiveResult<mpsc::Receiver<AudioFrame>>;

    /// Release the device.
    async fn close(&self);
}

/// Input driven by an external sender (headless hosts, tests, piped audio).
pub struct ChannelAudioInput {
    rx: Mutex<Option<mpsc::Receiver<AudioFrame>>>,
}

impl ChannelAudioInput {
    pub fn new() -> (Self, mpsc::Sender<AudioFrame>) {
        let (tx, rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        (
            Self {
                rx: Mutex::new(Some(rx)),
            },
            tx,
        )
    }
}

#[async_trait]
impl AudioInput for ChannelAudioInput {
    async fn open(&self) -> LiveResult<mpsc::Receiver<AudioFrame>> {
        self.rx
            .lock()
            .await
            .take()
            .ok_or_else(|| LiveError::AudioDevice("Audio input already consumed".to_string()))
    }

    async fn close(&self) {}
}

/// Emits silent frames on a fixed cadence. Keeps recordings time-aligned when no device is present.
pub struct SilentAudioInput {
    sample_rate: u32,
    frame_interval: Duration,
    running: Mutex<Option<CancellationToken>>,
}

impl Default for SilentAudioInput {
    fn default() -> Self {
        Self::new(16000, Duration::from_millis(100))
    }
}

impl SilentAudioInput {
    pub fn new(sample_rate: u32, frame_interval: Duration) -> Self {
        Self {
            sample_rate,
            frame_interval,
            running: Mutex::new(None),
        }
    }
}

#[async_trait]
impl AudioInput for SilentAudioInput {
    async fn open(&self) -> LiveResult<mpsc::Receiver<AudioFrame>> {
        let mut running = self.running.lock().await;
        if let Some(previous) = running.take() {
            previous.cancel();
        }
        let token = CancellationToken::new();
        *running = Some(token.clone());

        let (tx, rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let samples_per_frame = (self.sample_rate as u128 * self.frame_interval.as_millis() / 1000) as usize;
        let sample_rate = self.sample_rate;
        let interval = self.frame_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut timestamp_ms = 0u64;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let frame = AudioFrame {
                            samples: vec![0; samples_per_frame],
                            sample_rate,
                            timestamp_ms,
                        };
                        if tx.send(frame).await.is_err() {
                            break;
                        }
                        timestamp_ms += interval.as_millis() as u64;
                    }
                }
            }
            debug!(target: "courtcraft::audio", "silent input stopped");
        });

        info!(target: "courtcraft::audio", sample_rate, "silent audio input opened");
        Ok(rx)
    }

    async fn close(&self) {
        if let Some(token) = self.running.lock().await.take() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_of_silence_and_full_scale() {
        let silent = AudioFrame {
            samples: vec![0; 160],
            sample_rate: 16000,
            timestamp_ms: 0,
        };
        assert_eq!(silent.level(), 0.0);

        let loud = AudioFrame {
            samples: vec![i16::MAX; 160],
            sample_rate: 16000,
            timestamp_ms: 0,
        };
        assert!((loud.level() - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn channel_input_opens_once() {
        let (input, tx) = ChannelAudioInput::new();
        let mut rx = input.open().await.unwrap();
        assert!(input.open().await.is_err());
        tx.send(AudioFrame {
            samples: vec![1, 2, 3],
            sample_rate: 16000,
            timestamp_ms: 0,
        })
        .await
        .unwrap();
        assert_eq!(rx.recv().await.unwrap().samples.len(), 3);
    }

    #[tokio::test]
    async fn silent_input_closes_idempotently() {
        let input = SilentAudioInput::new(16000, Duration::from_millis(5));
        let mut rx = input.open().await.unwrap();
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.samples.len(), 80);
        input.close().await;
        input.close().await;
        while rx.recv().await.is_some() {}
    }
}
