//! Session recording.
//!
//! A `RecordingSink` consumes the microphone frames for the whole session and yields one blob on
//! `stop`. `WavRecorder` encodes 16-bit PCM WAV in memory.

use crate::audio::AudioFrame;
use crate::error::{LiveError, LiveResult};
use async_trait::async_trait;
use base64::Engine;
use std::io::Cursor;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Finished recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedAudio {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl RecordedAudio {
    /// RFC 2397 data URL, the portable reference stored in session records.
    pub fn to_data_url(&self) -> String {
        format!(
            "data:{};base64,{}",
            self.mime_type,
            base64::engine::general_purpose::STANDARD.encode(&self.bytes)
        )
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[async_trait]
pub trait RecordingSink: Send + Sync {
    /// Begin consuming frames. The recorder owns the receiver until `stop`.
    async fn start(&self, frames: mpsc::Receiver<AudioFrame>) -> LiveResult<()>;

    /// Finish and return the blob. Calling `stop` without an active recording returns `None`.
    async fn stop(&self) -> LiveResult<Option<RecordedAudio>>;
}

struct ActiveRecording {
    task: JoinHandle<LiveResult<RecordedAudio>>,
    stop_tx: tokio::sync::oneshot::Sender<()>,
}

/// In-memory WAV recorder.
pub struct WavRecorder {
    sample_rate: u32,
    active: Mutex<Option<ActiveRecording>>,
}

impl Default for WavRecorder {
    fn default() -> Self {
        Self::new(16000)
    }
}

impl WavRecorder {
    /// `sample_rate` is used for the header when no frame arrives before stop.
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            active: Mutex::new(None),
        }
    }
}

fn encode_wav(frames: &[AudioFrame], fallback_rate: u32) -> LiveResult<RecordedAudio> {
    let sample_rate = frames.first().map(|f| f.sample_rate).unwrap_or(fallback_rate);
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for frame in frames {
            for &sample in &frame.samples {
                writer.write_sample(sample)?;
            }
        }
        writer.finalize()?;
    }

    Ok(RecordedAudio {
        mime_type: "audio/wav".to_string(),
        bytes: cursor.into_inner(),
    })
}

#[async_trait]
impl RecordingSink for WavRecorder {
    async fn start(&self, mut frames: mpsc::Receiver<AudioFrame>) -> LiveResult<()> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(LiveError::Recording("Recording already in progress".to_string()));
        }

        let (stop_tx, mut stop_rx) = tokio::sync::oneshot::channel();
        let fallback_rate = self.sample_rate;
        let task = tokio::spawn(async move {
            let mut buffered = Vec::new();
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    frame = frames.recv() => match frame {
                        Some(frame) => buffered.push(frame),
                        None => {
                            // Input closed: wait for the explicit stop to hand over the blob.
                            let _ = (&mut stop_rx).await;
                            break;
                        }
                    },
                }
            }
            while let Ok(frame) = frames.try_recv() {
                buffered.push(frame);
            }
            encode_wav(&buffered, fallback_rate)
        });

        *active = Some(ActiveRecording { task, stop_tx });
        info!(target: "courtcraft::recording", "recording started");
        Ok(())
    }

    async fn stop(&self) -> LiveResult<Option<RecordedAudio>> {
        let Some(recording) = self.active.lock().await.take() else {
            return Ok(None);
        };
        let _ = recording.stop_tx.send(());
        match recording.task.await {
            Ok(result) => {
                let audio = result?;
                info!(target: "courtcraft::recording", bytes = audio.bytes.len(), "recording stopped");
                Ok(Some(audio))
            }
            Err(e) => {
                warn!(target: "courtcraft::recording", error = %e, "recording task failed");
                Err(LiveError::Recording(e.to_string()))
            }
        }
    }
}

/// Discards the microphone stream. For hosts whose input carries no real audio.
#[derive(Debug, Default)]
pub struct NullRecorder;

impl NullRecorder {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RecordingSink for NullRecorder {
    async fn start(&self, frames: mpsc::Receiver<AudioFrame>) -> LiveResult<()> {
        drop(frames);
        Ok(())
    }

    async fn stop(&self) -> LiveResult<Option<RecordedAudio>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(n: usize) -> AudioFrame {
        AudioFrame {
            samples: vec![1000; n],
            sample_rate: 8000,
            timestamp_ms: 0,
        }
    }

    #[tokio::test]
    async fn records_frames_into_wav() {
        let recorder = WavRecorder::default();
        let (tx, rx) = mpsc::channel(8);
        recorder.start(rx).await.unwrap();
        tx.send(frame(800)).await.unwrap();
        tx.send(frame(800)).await.unwrap();
        drop(tx);

        let audio = recorder.stop().await.unwrap().expect("recording");
        assert_eq!(audio.mime_type, "audio/wav");
        let reader = hound::WavReader::new(Cursor::new(audio.bytes.clone())).unwrap();
        assert_eq!(reader.spec().sample_rate, 8000);
        assert_eq!(reader.len(), 1600);
        assert!(audio.to_data_url().starts_with("data:audio/wav;base64,UklGR"));
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let recorder = WavRecorder::default();
        assert!(recorder.stop().await.unwrap().is_none());
        let (_tx, rx) = mpsc::channel(1);
        recorder.start(rx).await.unwrap();
        let audio = recorder.stop().await.unwrap().unwrap();
        assert!(!audio.is_empty(), "header only wav still has bytes");
        assert!(recorder.stop().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn null_recorder_yields_nothing() {
        let recorder = NullRecorder::new();
        let (tx, rx) = mpsc::channel(1);
        recorder.start(rx).await.unwrap();
        assert!(tx.is_closed());
        assert!(recorder.stop().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejects_double_start() {
        let recorder = WavRecorder::default();
        let (_a, rx_a) = mpsc::channel(1);
        let (_b, rx_b) = mpsc::channel(1);
        recorder.start(rx_a).await.unwrap();
        assert!(recorder.start(rx_b).await.is_err());
        recorder.stop().await.unwrap();
    }
}
