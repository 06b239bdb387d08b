//! # Courtcraft Live - Live Session Engine
//!
//! Real-time courtroom rehearsal: the user speaks, the engine transcribes continuously, sends each
//! finished utterance to a language model that answers in character plus private coaching, voices
//! the reply and keeps metrics and a recording for later review.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          LiveSession                              │
//! │  ┌──────────────┐ final ┌──────────────┐ raw  ┌──────────────┐   │
//! │  │    Speech    │──────→│     Turn     │─────→│    Codec     │   │
//! │  │  Controller  │       │ Orchestrator │←─────│ (fallback)   │   │
//! │  └──────────────┘       └──────────────┘      └──────────────┘   │
//! │         ↑ busy?                │     │                            │
//! │  ┌──────────────┐              │     ↓                            │
//! │  │  Turn Guard  │←─────────────┘  ┌──────────────┐                │
//! │  └──────────────┘                 │  Synthesis   │ remote →       │
//! │         ↓                         │   Pipeline   │ on-device →    │
//! │  ┌──────────────┐                 └──────────────┘ notice         │
//! │  │ State Machine│ → watch / events → UI                           │
//! │  └──────────────┘                                                 │
//! │  Microphone → volume + WavRecorder → SessionRecord → HistoryStore │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod codec;
pub mod completion;
pub mod config;
pub mod error;
pub mod events;
pub mod guard;
pub mod history;
pub mod metrics;
pub mod orchestrator;
pub mod prompt;
pub mod recording;
pub mod session;
pub mod speech;
pub mod state;
pub mod synthesis;

pub use audio::{AudioFrame, AudioInput, ChannelAudioInput, SilentAudioInput};
pub use codec::{
    decode, encode_prompt, Coaching, Objection, ResponseParseResult, StructuredTurnResponse, TurnAction,
};
pub use completion::{CompletionChunks, CompletionStream, OpenRouterChat, SseDecoder};
pub use config::{LiveConfig, LlmConfig, SessionSettings, SpeechConfig, SynthesisConfig};
pub use error::{LiveError, LiveResult};
pub use events::{EngineEvent, EventBus, NoticeLevel};
pub use guard::{SpeakingGuard, TurnGuard, TurnPermit};
pub use history::{
    HistoryManager, HistoryStore, MemoryHistoryStore, SessionRecord, SledHistoryStore, Speaker, TranscriptEntry,
};
pub use metrics::{scan_utterance, MetricsAccumulator, SessionMetrics, FILLER_WORDS};
pub use orchestrator::{rebuttal_options, RebuttalPrompter, SessionLedger, TurnCollaborators, TurnOrchestrator};
pub use prompt::{CourtroomPrompts, PromptContext, PromptProvider, SimulationMode, TrialPhase};
pub use recording::{NullRecorder, RecordedAudio, RecordingSink, WavRecorder};
pub use session::{LiveSession, SessionProfile, SessionServices};
pub use speech::{
    ChannelRecognizer, RecognitionErrorKind, RecognitionEvent, Recognizer, SpeechCaptureController, SpeechSink,
};
pub use state::{mean_score, SessionAction, SessionPhase, SessionState, StateMachine, TranscriptDirection};
pub use synthesis::{
    AudioSink, ClipId, CommandSpeech, NullSink, OnDeviceSynthesizer, OpenAiTts, RemoteSynthesizer, SpeakOutcome,
    SynthesisPipeline, VoiceParams,
};
#[cfg(feature = "playback")]
pub use synthesis::RodioSink;
