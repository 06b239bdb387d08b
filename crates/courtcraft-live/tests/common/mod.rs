// Shared fakes for the live session integration tests.
//
// Every collaborator the engine talks to is replaced by an in-process stand-in whose calls can be
// inspected afterwards.

#![allow(dead_code)]

use async_trait::async_trait;
use courtcraft_live::{
    AudioFrame, ChannelAudioInput, ChannelRecognizer, CompletionChunks, CompletionStream, CourtroomPrompts,
    EngineEvent, LiveConfig, LiveError, LiveResult, LiveSession, MemoryHistoryStore, NullRecorder, NullSink,
    Objection, OnDeviceSynthesizer, RebuttalPrompter, RecognitionEvent, Recognizer, RecordingSink,
    RemoteSynthesizer, SessionPhase, SessionProfile, SessionServices, VoiceParams, WavRecorder,
};
use futures::stream::{self, StreamExt};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Notify};

pub const CASE_ID: &str = "case-1";

/// Structured reply as the model would send it.
pub fn reply(speak: &str, score: u8, objection: Option<(&str, &str)>) -> String {
    let (action, objection) = match objection {
        Some((grounds, explanation)) => (
            "objection",
            serde_json::json!({ "grounds": grounds, "explanation": explanation }),
        ),
        None => ("response", serde_json::Value::Null),
    };
    serde_json::json!({
        "speak": speak,
        "action": action,
        "objection": objection,
        "coaching": {
            "critique": "Solid structure.",
            "suggestion": "Slow down.",
            "teleprompterScript": "Your Honor, the record reflects...",
            "rhetoricalEffectiveness": score,
            "fallaciesIdentified": [],
        }
    })
    .to_string()
}

/// Replays canned replies in order, split into two chunks each. A reply of `"ERR"` fails the call.
/// When gated, each stream waits for `release` before yielding anything.
#[derive(Default)]
pub struct ScriptedCompletion {
    replies: Mutex<VecDeque<String>>,
    pub calls: Mutex<Vec<String>>,
    gate: Option<Arc<Notify>>,
}

impl ScriptedCompletion {
    pub fn new(replies: Vec<String>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            calls: Mutex::new(Vec::new()),
            gate: None,
        }
    }

    pub fn gated(replies: Vec<String>) -> Self {
        Self {
            gate: Some(Arc::new(Notify::new())),
            ..Self::new(replies)
        }
    }

    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.notify_one();
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionStream for ScriptedCompletion {
    async fn stream(&self, system_prompt: &str, user_text: &str) -> LiveResult<CompletionChunks> {
        assert!(system_prompt.contains("rhetoricalEffectiveness"), "schema must be appended");
        self.calls.lock().unwrap().push(user_text.to_string());
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| reply("No further questions.", 50, None));
        if reply == "ERR" {
            return Err(LiveError::Completion("connection reset".to_string()));
        }

        let mid = reply.char_indices().nth(reply.chars().count() / 2).map(|(i, _)| i).unwrap_or(0);
        let chunks = vec![reply[..mid].to_string(), reply[mid..].to_string()];
        let gate = self.gate.clone();
        let stream = stream::once(async move {
            if let Some(gate) = gate {
                gate.notified().await;
            }
        })
        .flat_map(move |_| stream::iter(chunks.clone().into_iter().map(Ok)));
        Ok(stream.boxed())
    }
}

/// Remote TTS that either fails like a dropped network or returns a few bytes.
pub struct FakeRemote {
    pub fail: bool,
    pub texts: Mutex<Vec<String>>,
    gate: Option<Arc<Notify>>,
}

impl FakeRemote {
    pub fn working() -> Self {
        Self {
            fail: false,
            texts: Mutex::new(Vec::new()),
            gate: None,
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::working()
        }
    }

    /// Waits for `release` before returning audio.
    pub fn gated() -> Self {
        Self {
            gate: Some(Arc::new(Notify::new())),
            ..Self::working()
        }
    }

    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.notify_one();
        }
    }
}

#[async_trait]
impl RemoteSynthesizer for FakeRemote {
    async fn synthesize(&self, text: &str, _voice_id: &str, _params: &VoiceParams) -> LiveResult<Vec<u8>> {
        self.texts.lock().unwrap().push(text.to_string());
        if self.fail {
            return Err(LiveError::Synthesis("network unreachable".to_string()));
        }
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        Ok(vec![0u8; 16])
    }
}

pub struct FakeDevice {
    pub available: bool,
    pub texts: Mutex<Vec<String>>,
}

impl FakeDevice {
    pub fn new(available: bool) -> Self {
        Self {
            available,
            texts: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl OnDeviceSynthesizer for FakeDevice {
    fn is_available(&self) -> bool {
        self.available
    }

    async fn speak(&self, text: &str, _params: &VoiceParams) -> LiveResult<()> {
        self.texts.lock().unwrap().push(text.to_string());
        Ok(())
    }
}

/// Picks a fixed rebuttal and remembers every objection it was shown.
pub struct ScriptedRebuttal {
    pub choice: Option<String>,
    pub asked: Mutex<Vec<Objection>>,
}

impl ScriptedRebuttal {
    pub fn choosing(choice: Option<&str>) -> Self {
        Self {
            choice: choice.map(str::to_string),
            asked: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl RebuttalPrompter for ScriptedRebuttal {
    async fn choose_rebuttal(&self, objection: &Objection, options: &[String]) -> Option<String> {
        assert!(!options.is_empty());
        self.asked.lock().unwrap().push(objection.clone());
        self.choice.clone()
    }
}

/// Scripted recognizer whose `stop` can be held open until `release_stop`, to widen the window in
/// which a stop is under way.
pub struct HarnessRecognizer {
    channel: ChannelRecognizer,
    stop_gate: Option<Arc<Notify>>,
    pub stop_calls: AtomicU32,
}

impl HarnessRecognizer {
    pub fn starts(&self) -> u32 {
        self.channel.starts()
    }

    pub fn release_stop(&self) {
        if let Some(gate) = &self.stop_gate {
            gate.notify_one();
        }
    }
}

#[async_trait]
impl Recognizer for HarnessRecognizer {
    async fn start(&self) -> LiveResult<mpsc::Receiver<RecognitionEvent>> {
        self.channel.start().await
    }

    async fn stop(&self) {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.stop_gate {
            gate.notified().await;
        }
        self.channel.stop().await;
    }
}

/// A session wired to fakes, with handles to everything the tests poke at.
pub struct Harness {
    pub session: LiveSession,
    pub completion: Arc<ScriptedCompletion>,
    pub remote: Arc<FakeRemote>,
    pub device: Arc<FakeDevice>,
    pub rebuttal: Arc<ScriptedRebuttal>,
    pub history: Arc<MemoryHistoryStore>,
    pub recognizer: Arc<HarnessRecognizer>,
    pub speech_feed: Option<mpsc::Sender<RecognitionEvent>>,
    pub mic: mpsc::Sender<AudioFrame>,
}

pub struct HarnessBuilder {
    pub config: LiveConfig,
    pub completion: ScriptedCompletion,
    pub remote: FakeRemote,
    pub device: FakeDevice,
    pub rebuttal: ScriptedRebuttal,
    pub history: Arc<MemoryHistoryStore>,
    pub gate_recognizer_stop: bool,
    pub record_audio: bool,
}

/// Route engine logs to the test output; `RUST_LOG` picks the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

impl HarnessBuilder {
    pub fn new(replies: Vec<String>) -> Self {
        init_tracing();
        let mut config = LiveConfig::default();
        config.speech.restart_delay_ms = 1;
        Self {
            config,
            completion: ScriptedCompletion::new(replies),
            remote: FakeRemote::working(),
            device: FakeDevice::new(true),
            rebuttal: ScriptedRebuttal::choosing(None),
            history: Arc::new(MemoryHistoryStore::new()),
            gate_recognizer_stop: false,
            record_audio: true,
        }
    }

    pub fn build(self) -> Harness {
        let (channel, speech_feed) = ChannelRecognizer::new();
        let recognizer = Arc::new(HarnessRecognizer {
            channel,
            stop_gate: self.gate_recognizer_stop.then(|| Arc::new(Notify::new())),
            stop_calls: AtomicU32::new(0),
        });
        let (mic_input, mic) = ChannelAudioInput::new();
        let completion = Arc::new(self.completion);
        let remote = Arc::new(self.remote);
        let device = Arc::new(self.device);
        let rebuttal = Arc::new(self.rebuttal);

        let recorder: Arc<dyn RecordingSink> = if self.record_audio {
            Arc::new(WavRecorder::default())
        } else {
            Arc::new(NullRecorder::new())
        };

        let services = SessionServices {
            audio_input: Arc::new(mic_input),
            recognizer: recognizer.clone(),
            recorder,
            completion: completion.clone(),
            prompts: Arc::new(CourtroomPrompts),
            rebuttals: rebuttal.clone(),
            remote_tts: Some(remote.clone()),
            on_device_tts: Some(device.clone()),
            audio_sink: Arc::new(NullSink::new()),
            history: self.history.clone(),
        };
        let profile = SessionProfile {
            case_id: CASE_ID.to_string(),
            case_summary: "State v. Doe: the defendant is accused of stealing a bicycle.".to_string(),
            ..SessionProfile::default()
        };

        Harness {
            session: LiveSession::new(self.config, profile, services),
            completion,
            remote,
            device,
            rebuttal,
            history: self.history,
            recognizer,
            speech_feed: Some(speech_feed),
            mic,
        }
    }

    pub async fn start(self) -> Harness {
        let harness = self.build();
        harness.session.start().await.expect("session starts");
        harness
    }
}

impl Harness {
    pub async fn say(&self, text: &str) {
        let feed = self.speech_feed.as_ref().expect("speech feed");
        feed.send(RecognitionEvent::Final(text.to_string())).await.expect("feed open");
    }

    pub async fn say_interim(&self, text: &str) {
        let feed = self.speech_feed.as_ref().expect("speech feed");
        feed.send(RecognitionEvent::Interim(text.to_string())).await.expect("feed open");
    }

    pub async fn send_tone(&self, frames: usize) {
        for i in 0..frames {
            self.mic
                .send(AudioFrame {
                    samples: vec![4000; 1600],
                    sample_rate: 16000,
                    timestamp_ms: i as u64 * 100,
                })
                .await
                .expect("mic open");
        }
    }
}

/// Poll until `check` holds or a second passes.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

pub async fn wait_for_phase(session: &LiveSession, phase: SessionPhase) -> bool {
    eventually(|| session.snapshot().phase == phase).await
}

/// Everything currently buffered on an event receiver.
pub fn drain_events(rx: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    events
}
