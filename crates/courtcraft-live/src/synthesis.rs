//! **Voice synthesis pipeline**: speaks the counterpart's line with automatic fallback.
//!
//! Tier 1 asks a remote TTS service for audio bytes and plays them through an `AudioSink`.
//! Tier 2 hands the text to an on-device synthesizer when one is available. Tier 3 gives up with a
//! "voice unavailable" notice; the line remains in the transcript. The AI-speaking flag is held for
//! the whole attempt so the recognizer never hears the synthesized voice.

use crate::config::SynthesisConfig;
use crate::error::{LiveError, LiveResult};
use crate::events::{EventBus, NoticeLevel};
use crate::guard::TurnGuard;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Prosody shared by both tiers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoiceParams {
    pub speed: f32,
    pub pitch: f32,
}

impl Default for VoiceParams {
    fn default() -> Self {
        Self {
            speed: 1.0,
            pitch: 1.0,
        }
    }
}

impl From<&SynthesisConfig> for VoiceParams {
    fn from(cfg: &SynthesisConfig) -> Self {
        Self {
            speed: cfg.speed,
            pitch: cfg.pitch,
        }
    }
}

/// Tier 1: remote text-to-audio service.
#[async_trait]
pub trait RemoteSynthesizer: Send + Sync {
    /// Audio bytes (MP3/WAV) for `text`. Network and quota problems surface as `LiveError`.
    async fn synthesize(&self, text: &str, voice_id: &str, params: &VoiceParams) -> LiveResult<Vec<u8>>;
}

/// Tier 2: synthesizer that speaks directly on this machine.
#[async_trait]
pub trait OnDeviceSynthesizer: Send + Sync {
    fn is_available(&self) -> bool;

    /// Resolves when the utterance has finished.
    async fn speak(&self, text: &str, params: &VoiceParams) -> LiveResult<()>;

    /// Interrupt the current utterance, if any.
    async fn stop(&self) {}
}

/// Handle to audio loaded into a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClipId(pub u64);

/// Playback device. Every loaded clip must be released, whether or not it played.
#[async_trait]
pub trait AudioSink: Send + Sync {
    fn load(&self, bytes: Vec<u8>) -> LiveResult<ClipId>;

    /// Resolves when playback of `clip` completes.
    async fn play(&self, clip: ClipId) -> LiveResult<()>;

    fn release(&self, clip: ClipId);

    /// Stop whatever is playing. Safe to call when idle.
    fn stop(&self);
}

/// Which tier ended up voicing the line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeakOutcome {
    Remote,
    OnDevice,
    Unavailable,
    Cancelled,
}

/// The three-tier pipeline. `speak` never fails.
pub struct SynthesisPipeline {
    remote: Option<Arc<dyn RemoteSynthesizer>>,
    on_device: Option<Arc<dyn OnDeviceSynthesizer>>,
    sink: Arc<dyn AudioSink>,
    config: SynthesisConfig,
    guard: Arc<TurnGuard>,
    events: EventBus,
}

impl SynthesisPipeline {
    pub fn new(
        remote: Option<Arc<dyn RemoteSynthesizer>>,
        on_device: Option<Arc<dyn OnDeviceSynthesizer>>,
        sink: Arc<dyn AudioSink>,
        config: SynthesisConfig,
        guard: Arc<TurnGuard>,
        events: EventBus,
    ) -> Self {
        Self {
            remote,
            on_device,
            sink,
            config,
            guard,
            events,
        }
    }

    /// Speak `text`, falling back tier by tier. Returns once playback ends or every tier is exhausted.
    pub async fn speak(&self, text: &str, cancel: &CancellationToken) -> SpeakOutcome {
        let _speaking = self.guard.begin_speaking();
        let params = VoiceParams::from(&self.config);

        if let Some(remote) = self.remote.as_ref().filter(|_| self.config.remote_enabled) {
            match self.speak_remote(remote.as_ref(), text, &params, cancel).await {
                Ok(()) => {
                    debug!(target: "courtcraft::synthesis", chars = text.len(), "🔊 spoken via remote TTS");
                    return SpeakOutcome::Remote;
                }
                Err(LiveError::Cancelled) => return SpeakOutcome::Cancelled,
                Err(e) => warn!(target: "courtcraft::synthesis", error = %e, "remote TTS failed, falling back"),
            }
        }

        if cancel.is_cancelled() {
            return SpeakOutcome::Cancelled;
        }

        if let Some(device) = self.on_device.as_ref().filter(|d| d.is_available()) {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    device.stop().await;
                    return SpeakOutcome::Cancelled;
                }
                r = device.speak(text, &params) => r,
            };
            match result {
                Ok(()) => {
                    debug!(target: "courtcraft::synthesis", "🔊 spoken via on-device synthesizer");
                    return SpeakOutcome::OnDevice;
                }
                Err(e) => warn!(target: "courtcraft::synthesis", error = %e, "on-device synthesis failed"),
            }
        }

        if cancel.is_cancelled() {
            return SpeakOutcome::Cancelled;
        }
        self.events.notice(
            NoticeLevel::Warning,
            "Voice unavailable: the reply is shown in the transcript only.",
        );
        SpeakOutcome::Unavailable
    }

    async fn speak_remote(
        &self,
        remote: &dyn RemoteSynthesizer,
        text: &str,
        params: &VoiceParams,
        cancel: &CancellationToken,
    ) -> LiveResult<()> {
        let bytes = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LiveError::Cancelled),
            r = remote.synthesize(text, &self.config.voice_id, params) => r?,
        };
        if bytes.is_empty() {
            return Err(LiveError::Synthesis("TTS returned no audio".to_string()));
        }

        let clip = self.sink.load(bytes)?;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.sink.stop();
                Err(LiveError::Cancelled)
            }
            r = self.sink.play(clip) => r,
        };
        self.sink.release(clip);
        result
    }

    /// Interrupt playback on every tier. Idempotent.
    pub async fn stop(&self) {
        self.sink.stop();
        if let Some(device) = &self.on_device {
            device.stop().await;
        }
    }
}

/// Remote TTS over an OpenAI-compatible `/audio/speech` endpoint (OpenAI, OpenRouter, ...).
#[derive(Debug, Clone)]
pub struct OpenAiTts {
    /// Base URL without trailing slash (e.g. https://api.openai.com/v1).
    pub base_url: String,
    api_key: String,
    /// tts-1 (fast) or tts-1-hd.
    pub model: String,
    client: reqwest::Client,
}

impl OpenAiTts {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> LiveResult<Self> {
        let client = reqwest::Client::builder().timeout(Duration::from_secs(60)).build()?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            client,
        })
    }

    /// Build from environment: TTS_API_URL, TTS_API_KEY (or OPENROUTER_API_KEY), TTS_MODEL.
    pub fn from_env() -> LiveResult<Self> {
        let base_url = std::env::var("TTS_API_URL").unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let api_key = std::env::var("TTS_API_KEY")
            .or_else(|_| std::env::var("OPENROUTER_API_KEY"))
            .map_err(|_| LiveError::Config("TTS requires TTS_API_KEY or OPENROUTER_API_KEY".to_string()))?;
        let model = std::env::var("TTS_MODEL").unwrap_or_else(|_| "tts-1".to_string());
        Self::new(base_url, api_key, model)
    }
}

#[async_trait]
impl RemoteSynthesizer for OpenAiTts {
    async fn synthesize(&self, text: &str, voice_id: &str, params: &VoiceParams) -> LiveResult<Vec<u8>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/audio/speech", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
            "voice": voice_id,
            "speed": params.speed.clamp(0.25, 4.0),
        });
        let res = self.client.post(&url).bearer_auth(&self.api_key).json(&body).send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(LiveError::Synthesis(format!("TTS API error {}: {}", status, body)));
        }
        Ok(res.bytes().await?.to_vec())
    }
}

/// On-device synthesis through a local speech program such as `espeak-ng`.
#[derive(Debug, Clone)]
pub struct CommandSpeech {
    program: String,
    current: Arc<Mutex<Option<tokio::process::Child>>>,
}

impl Default for CommandSpeech {
    fn default() -> Self {
        Self::new("espeak-ng")
    }
}

impl CommandSpeech {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            current: Arc::new(Mutex::new(None)),
        }
    }

    fn resolve(&self) -> Option<PathBuf> {
        let candidate = PathBuf::from(&self.program);
        if candidate.components().count() > 1 {
            return candidate.is_file().then_some(candidate);
        }
        let paths = std::env::var_os("PATH")?;
        std::env::split_paths(&paths)
            .map(|dir| dir.join(&self.program))
            .find(|p| p.is_file())
    }
}

#[async_trait]
impl OnDeviceSynthesizer for CommandSpeech {
    fn is_available(&self) -> bool {
        self.resolve().is_some()
    }

    async fn speak(&self, text: &str, params: &VoiceParams) -> LiveResult<()> {
        let program = self
            .resolve()
            .ok_or_else(|| LiveError::Synthesis(format!("{} not found", self.program)))?;
        // espeak: words per minute around 175 at normal speed, pitch 0..99 around 50.
        let rate = (175.0 * params.speed).round().clamp(80.0, 450.0) as u32;
        let pitch = (50.0 * params.pitch).round().clamp(0.0, 99.0) as u32;
        let child = tokio::process::Command::new(program)
            .arg("-s")
            .arg(rate.to_string())
            .arg("-p")
            .arg(pitch.to_string())
            .arg(text)
            .kill_on_drop(true)
            .spawn()?;
        *self.current.lock().await = Some(child);

        // Poll so that `stop` can take the child out from under us.
        loop {
            let mut current = self.current.lock().await;
            let Some(child) = current.as_mut() else {
                return Err(LiveError::Cancelled);
            };
            if let Some(status) = child.try_wait()? {
                current.take();
                return if status.success() {
                    Ok(())
                } else {
                    Err(LiveError::Synthesis(format!("{} exited with {}", self.program, status)))
                };
            }
            drop(current);
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn stop(&self) {
        if let Some(mut child) = self.current.lock().await.take() {
            if let Err(e) = child.kill().await {
                debug!(target: "courtcraft::synthesis", error = %e, "speech process already gone");
            }
        }
    }
}

/// Sink that discards audio. For headless runs where the transcript is the only output.
#[derive(Debug, Default)]
pub struct NullSink {
    next_id: AtomicU64,
}

impl NullSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AudioSink for NullSink {
    fn load(&self, bytes: Vec<u8>) -> LiveResult<ClipId> {
        debug!(target: "courtcraft::synthesis", bytes = bytes.len(), "discarding synthesized audio");
        Ok(ClipId(self.next_id.fetch_add(1, Ordering::SeqCst)))
    }

    async fn play(&self, _clip: ClipId) -> LiveResult<()> {
        Ok(())
    }

    fn release(&self, _clip: ClipId) {}

    fn stop(&self) {}
}

#[cfg(feature = "playback")]
pub use self::rodio_sink::RodioSink;

#[cfg(feature = "playback")]
mod rodio_sink {
    //! Speaker output through rodio. The output stream is not `Send`, so it lives on its own thread
    //! and only the handle crosses over.

    use super::{AudioSink, ClipId};
    use crate::error::{LiveError, LiveResult};
    use async_trait::async_trait;
    use dashmap::DashMap;
    use rodio::{OutputStream, OutputStreamHandle, Sink, Source};
    use std::io::Cursor;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};
    use tracing::info;

    pub struct RodioSink {
        handle: OutputStreamHandle,
        clips: DashMap<ClipId, Vec<u8>>,
        current: Mutex<Option<Arc<Sink>>>,
        next_id: AtomicU64,
        _shutdown: std::sync::mpsc::Sender<()>,
    }

    impl RodioSink {
        /// Open the default output device.
        pub fn new() -> LiveResult<Self> {
            let (handle_tx, handle_rx) = std::sync::mpsc::channel();
            let (shutdown_tx, shutdown_rx) = std::sync::mpsc::channel::<()>();
            std::thread::spawn(move || match OutputStream::try_default() {
                Ok((_stream, handle)) => {
                    let _ = handle_tx.send(Ok(handle));
                    // Blocks until the sink is dropped.
                    let _ = shutdown_rx.recv();
                }
                Err(e) => {
                    let _ = handle_tx.send(Err(LiveError::Playback(e.to_string())));
                }
            });
            let handle = handle_rx
                .recv()
                .map_err(|_| LiveError::Playback("output thread exited".to_string()))??;
            info!(target: "courtcraft::synthesis", "RodioSink: output device ready");
            Ok(Self {
                handle,
                clips: DashMap::new(),
                current: Mutex::new(None),
                next_id: AtomicU64::new(0),
                _shutdown: shutdown_tx,
            })
        }
    }

    #[async_trait]
    impl AudioSink for RodioSink {
        fn load(&self, bytes: Vec<u8>) -> LiveResult<ClipId> {
            let id = ClipId(self.next_id.fetch_add(1, Ordering::SeqCst));
            self.clips.insert(id, bytes);
            Ok(id)
        }

        async fn play(&self, clip: ClipId) -> LiveResult<()> {
            let bytes = self
                .clips
                .get(&clip)
                .map(|b| b.clone())
                .ok_or_else(|| LiveError::Playback(format!("unknown clip {}", clip.0)))?;
            let source = rodio::Decoder::new(Cursor::new(bytes))
                .map_err(|e| LiveError::Playback(format!("Decode failed: {}", e)))?;
            let sink = Arc::new(Sink::try_new(&self.handle).map_err(|e| LiveError::Playback(e.to_string()))?);
            sink.append(source.convert_samples::<f32>());
            if let Ok(mut current) = self.current.lock() {
                *current = Some(Arc::clone(&sink));
            }

            let waiting = Arc::clone(&sink);
            tokio::task::spawn_blocking(move || waiting.sleep_until_end())
                .await
                .map_err(|e| LiveError::Playback(e.to_string()))?;
            if let Ok(mut current) = self.current.lock() {
                current.take();
            }
            Ok(())
        }

        fn release(&self, clip: ClipId) {
            self.clips.remove(&clip);
        }

        fn stop(&self) {
            if let Ok(mut current) = self.current.lock() {
                if let Some(sink) = current.take() {
                    sink.stop();
                    info!(target: "courtcraft::synthesis", "RodioSink: stopped");
                }
            }
        }
    }
}
