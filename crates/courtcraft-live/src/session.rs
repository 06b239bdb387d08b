//! `LiveSession`: one rehearsal from microphone open to archived record.
//!
//! Owns every per-session resource (microphone stream, recognizer, recorder, playback, the session
//! cancellation token) and releases each of them exactly once on stop.

use crate::audio::{AudioFrame, AudioInput};
use crate::completion::CompletionStream;
use crate::config::LiveConfig;
use crate::error::{LiveError, LiveResult};
use crate::events::{EngineEvent, EventBus, NoticeLevel};
use crate::guard::TurnGuard;
use crate::history::{HistoryManager, HistoryStore, SessionRecord, TranscriptEntry};
use crate::metrics::SessionMetrics;
use crate::orchestrator::{RebuttalPrompter, SessionLedger, SharedLedger, TurnCollaborators, TurnOrchestrator};
use crate::prompt::{PromptContext, PromptProvider, SimulationMode, TrialPhase};
use crate::recording::RecordingSink;
use crate::speech::{Recognizer, SpeechCaptureController, SpeechSink};
use crate::state::{SessionAction, SessionPhase, SessionState, StateMachine, TranscriptDirection};
use crate::synthesis::{AudioSink, OnDeviceSynthesizer, RemoteSynthesizer, SynthesisPipeline};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const RECORDER_CHANNEL_CAPACITY: usize = 256;

/// What is being rehearsed.
#[derive(Debug, Clone, Default)]
pub struct SessionProfile {
    pub case_id: String,
    pub phase: TrialPhase,
    pub mode: SimulationMode,
    pub case_summary: String,
}

/// Collaborators supplied by the host.
#[derive(Clone)]
pub struct SessionServices {
    pub audio_input: Arc<dyn AudioInput>,
    pub recognizer: Arc<dyn Recognizer>,
    pub recorder: Arc<dyn RecordingSink>,
    pub completion: Arc<dyn CompletionStream>,
    pub prompts: Arc<dyn PromptProvider>,
    pub rebuttals: Arc<dyn RebuttalPrompter>,
    pub remote_tts: Option<Arc<dyn RemoteSynthesizer>>,
    pub on_device_tts: Option<Arc<dyn OnDeviceSynthesizer>>,
    pub audio_sink: Arc<dyn AudioSink>,
    pub history: Arc<dyn HistoryStore>,
}

struct ActiveRun {
    cancel: CancellationToken,
    started_at: DateTime<Utc>,
    pump: JoinHandle<()>,
}

struct SessionInner {
    profile: SessionProfile,
    state: StateMachine,
    guard: Arc<TurnGuard>,
    events: EventBus,
    ledger: SharedLedger,
    orchestrator: TurnOrchestrator,
    synthesis: Arc<SynthesisPipeline>,
    speech: SpeechCaptureController,
    audio_input: Arc<dyn AudioInput>,
    recorder: Arc<dyn RecordingSink>,
    history: HistoryManager,
    run: Mutex<Option<ActiveRun>>,
}

/// Handle to a live session. Clones share the session.
#[derive(Clone)]
pub struct LiveSession {
    inner: Arc<SessionInner>,
}

impl LiveSession {
    pub fn new(config: LiveConfig, profile: SessionProfile, services: SessionServices) -> Self {
        let state = StateMachine::new();
        let guard = TurnGuard::new(state.clone());
        let events = EventBus::new();
        let ledger: SharedLedger = Arc::new(Mutex::new(SessionLedger::new()));

        let synthesis = Arc::new(SynthesisPipeline::new(
            services.remote_tts,
            services.on_device_tts,
            services.audio_sink,
            config.synthesis.clone(),
            Arc::clone(&guard),
            events.clone(),
        ));
        let context = PromptContext {
            phase: profile.phase,
            mode: profile.mode,
            counterpart_name: config.session.counterpart_name.clone(),
            case_summary: profile.case_summary.clone(),
        };
        let orchestrator = TurnOrchestrator::new(
            state.clone(),
            Arc::clone(&guard),
            TurnCollaborators {
                completion: services.completion,
                prompts: services.prompts,
                rebuttals: services.rebuttals,
            },
            context,
            Arc::clone(&synthesis),
            Arc::clone(&ledger),
            events.clone(),
        );
        let speech = SpeechCaptureController::new(services.recognizer, Arc::clone(&guard), config.speech.clone());

        Self {
            inner: Arc::new(SessionInner {
                profile,
                state,
                guard,
                events,
                ledger,
                orchestrator,
                synthesis,
                speech,
                audio_input: services.audio_input,
                recorder: services.recorder,
                history: HistoryManager::new(services.history, config.session.history_limit),
                run: Mutex::new(None),
            }),
        }
    }

    /// Open the microphone and begin listening.
    ///
    /// A microphone failure is fatal: the session moves to `Stopped`, a fatal notice is emitted and
    /// the error is returned.
    pub async fn start(&self) -> LiveResult<()> {
        let inner = &self.inner;
        let mut run = inner.run.lock().await;
        let phase = inner.state.phase();
        if run.is_some() || !matches!(phase, SessionPhase::Idle | SessionPhase::Stopped) {
            return Err(LiveError::InvalidState(format!("cannot start from {:?}", phase)));
        }

        inner.state.dispatch(SessionAction::StartConnecting);
        inner.guard.reset();
        *inner.ledger.lock().await = SessionLedger::new();

        let frames = match inner.audio_input.open().await {
            Ok(frames) => frames,
            Err(e) => {
                error!(target: "courtcraft::session", error = %e, "microphone unavailable");
                inner.state.dispatch(SessionAction::Stop);
                inner
                    .events
                    .notice(NoticeLevel::Fatal, format!("Could not access the microphone: {}", e));
                return Err(e);
            }
        };

        let cancel = CancellationToken::new();
        inner.orchestrator.begin_session(cancel.clone());

        let (recorder_tx, recorder_rx) = mpsc::channel(RECORDER_CHANNEL_CAPACITY);
        if let Err(e) = inner.recorder.start(recorder_rx).await {
            warn!(target: "courtcraft::session", error = %e, "recording unavailable");
            inner
                .events
                .notice(NoticeLevel::Warning, "Recording unavailable; the session will not include audio.");
        }
        let pump = tokio::spawn(pump_frames(frames, recorder_tx, inner.state.clone(), cancel.clone()));

        inner.state.dispatch(SessionAction::SessionLive);
        let sink = Arc::new(SessionSpeechSink {
            session: Arc::downgrade(inner),
        });
        inner.speech.start(sink).await;

        *run = Some(ActiveRun {
            cancel,
            started_at: Utc::now(),
            pump,
        });
        info!(target: "courtcraft::session", case_id = %inner.profile.case_id, phase = %inner.profile.phase, "✅ session live");
        Ok(())
    }

    /// End the session and release every resource. With `persist`, archive a record of it.
    /// Calling stop on a session that is not running does nothing.
    pub async fn stop(&self, persist: bool) -> LiveResult<Option<SessionRecord>> {
        stop_session(&self.inner, persist).await
    }

    /// Feed a typed utterance as if it had been spoken.
    pub fn submit_transcript(&self, text: impl Into<String>) -> Option<JoinHandle<()>> {
        self.inner.orchestrator.handle_transcript(text.into())
    }

    pub fn snapshot(&self) -> SessionState {
        self.inner.state.snapshot()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    pub async fn metrics(&self) -> SessionMetrics {
        self.inner.ledger.lock().await.metrics.snapshot()
    }

    pub async fn transcript(&self) -> Vec<TranscriptEntry> {
        self.inner.ledger.lock().await.transcript.clone()
    }

    pub async fn is_running(&self) -> bool {
        self.inner.run.lock().await.is_some()
    }

    /// Archived sessions for this case, oldest first.
    pub fn history(&self) -> LiveResult<Vec<SessionRecord>> {
        self.inner.history.load(&self.inner.profile.case_id)
    }

    /// Explicit user deletion of an archived session.
    pub fn delete_record(&self, id: &str) -> LiveResult<()> {
        self.inner.history.delete(&self.inner.profile.case_id, id)
    }
}

async fn stop_session(inner: &SessionInner, persist: bool) -> LiveResult<Option<SessionRecord>> {
    let Some(active) = inner.run.lock().await.take() else {
        return Ok(None);
    };

    active.cancel.cancel();
    inner.orchestrator.cancel_turn();
    inner.speech.stop().await;
    inner.synthesis.stop().await;
    if let Err(e) = active.pump.await {
        warn!(target: "courtcraft::session", error = %e, "audio pump ended abnormally");
    }
    inner.audio_input.close().await;
    let audio = match inner.recorder.stop().await {
        Ok(audio) => audio,
        Err(e) => {
            warn!(target: "courtcraft::session", error = %e, "recording lost");
            None
        }
    };
    inner.guard.reset();
    inner.state.dispatch(SessionAction::Stop);

    if !persist {
        info!(target: "courtcraft::session", "session stopped without saving");
        inner.events.emit(EngineEvent::SessionStopped { record_id: None });
        return Ok(None);
    }

    let record = {
        let ledger = inner.ledger.lock().await;
        let ended_at = Utc::now();
        SessionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            case_id: inner.profile.case_id.clone(),
            phase: inner.profile.phase,
            mode: inner.profile.mode,
            started_at: active.started_at,
            duration_seconds: (ended_at - active.started_at).num_seconds().max(0) as u64,
            transcript_entries: ledger.transcript.clone(),
            audio_reference: audio.filter(|a| !a.is_empty()).map(|a| a.to_data_url()),
            score: inner.state.snapshot().session_score,
            metrics: ledger.metrics.snapshot(),
        }
    };

    match inner.history.archive(record.clone()) {
        Ok(()) => {
            info!(target: "courtcraft::session", id = %record.id, score = record.score, "💾 session saved");
            inner.events.emit(EngineEvent::SessionStopped {
                record_id: Some(record.id.clone()),
            });
            Ok(Some(record))
        }
        Err(e) => {
            error!(target: "courtcraft::session", error = %e, "failed to save session");
            inner
                .events
                .notice(NoticeLevel::Warning, format!("The session could not be saved: {}", e));
            inner.events.emit(EngineEvent::SessionStopped { record_id: None });
            Err(e)
        }
    }
}

/// Feed the volume meter and the recorder from the microphone until cancelled.
async fn pump_frames(
    mut frames: mpsc::Receiver<AudioFrame>,
    recorder: mpsc::Sender<AudioFrame>,
    state: StateMachine,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            f = frames.recv() => f,
        };
        let Some(frame) = frame else {
            debug!(target: "courtcraft::session", "microphone stream ended");
            break;
        };
        state.dispatch(SessionAction::SetVolume(frame.level()));
        if let Err(mpsc::error::TrySendError::Full(_)) = recorder.try_send(frame) {
            debug!(target: "courtcraft::session", "recorder behind, frame dropped");
        }
    }
    state.dispatch(SessionAction::SetVolume(0.0));
}

/// Routes recognizer output into the session.
struct SessionSpeechSink {
    session: Weak<SessionInner>,
}

impl SpeechSink for SessionSpeechSink {
    fn on_interim(&self, text: &str) {
        if let Some(inner) = self.session.upgrade() {
            inner
                .state
                .dispatch(SessionAction::SetTranscript(TranscriptDirection::Input, text.to_string()));
        }
    }

    fn on_final(&self, text: String) {
        if let Some(inner) = self.session.upgrade() {
            inner.orchestrator.handle_transcript(text);
        }
    }

    fn on_fatal(&self, error: LiveError) {
        let Some(inner) = self.session.upgrade() else {
            return;
        };
        error!(target: "courtcraft::session", error = %error, "fatal speech error, stopping session");
        inner.events.notice(
            NoticeLevel::Fatal,
            format!("Speech recognition stopped: {}. Restart the session to continue.", error),
        );
        tokio::spawn(async move {
            if let Err(e) = stop_session(&inner, true).await {
                warn!(target: "courtcraft::session", error = %e, "stop after fatal error failed");
            }
        });
    }
}
