//! **AI turn orchestrator**: one final transcript in, one voiced counterpart line out.
//!
//! The turn slot is claimed synchronously in `handle_transcript`, before anything is spawned, so
//! two transcripts arriving back to back can never start two turns. Everything after that runs on
//! a task and is raced against a per-turn cancellation token derived from the session token.

use crate::codec::{self, Objection};
use crate::completion::CompletionStream;
use crate::error::{LiveError, LiveResult};
use crate::events::{EngineEvent, EventBus, NoticeLevel};
use crate::guard::{TurnGuard, TurnPermit};
use crate::history::{Speaker, TranscriptEntry};
use crate::metrics::MetricsAccumulator;
use crate::prompt::{PromptContext, PromptProvider};
use crate::state::{SessionAction, SessionPhase, StateMachine, TranscriptDirection};
use crate::synthesis::{SpeakOutcome, SynthesisPipeline};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Transcript log and metrics for the running session.
#[derive(Debug, Default)]
pub struct SessionLedger {
    pub metrics: MetricsAccumulator,
    pub transcript: Vec<TranscriptEntry>,
}

impl SessionLedger {
    pub fn new() -> Self {
        Self {
            metrics: MetricsAccumulator::new(),
            transcript: Vec::new(),
        }
    }
}

pub type SharedLedger = Arc<tokio::sync::Mutex<SessionLedger>>;

/// Asks the user how to answer an objection. `None` means the user let it stand.
#[async_trait]
pub trait RebuttalPrompter: Send + Sync {
    async fn choose_rebuttal(&self, objection: &Objection, options: &[String]) -> Option<String>;
}

/// Quick responses offered for an objection.
pub fn rebuttal_options(objection: &Objection) -> Vec<String> {
    let grounds = objection.grounds.trim().to_lowercase();
    vec![
        "I'll rephrase, Your Honor.".to_string(),
        "Withdrawn.".to_string(),
        format!(
            "Your Honor, the objection should be overruled; this is not {}, and it goes directly to the issues in this case.",
            if grounds.is_empty() { "improper" } else { grounds.as_str() }
        ),
    ]
}

/// Remote services a turn talks to.
#[derive(Clone)]
pub struct TurnCollaborators {
    pub completion: Arc<dyn CompletionStream>,
    pub prompts: Arc<dyn PromptProvider>,
    pub rebuttals: Arc<dyn RebuttalPrompter>,
}

struct OrchestratorInner {
    state: StateMachine,
    guard: Arc<TurnGuard>,
    collaborators: TurnCollaborators,
    context: PromptContext,
    synthesis: Arc<SynthesisPipeline>,
    ledger: SharedLedger,
    events: EventBus,
    session_cancel: Mutex<CancellationToken>,
    turn_cancel: Mutex<Option<CancellationToken>>,
    turns: AtomicU32,
}

/// Cheap to clone; all clones drive the same session.
#[derive(Clone)]
pub struct TurnOrchestrator {
    inner: Arc<OrchestratorInner>,
}

impl TurnOrchestrator {
    pub fn new(
        state: StateMachine,
        guard: Arc<TurnGuard>,
        collaborators: TurnCollaborators,
        context: PromptContext,
        synthesis: Arc<SynthesisPipeline>,
        ledger: SharedLedger,
        events: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(OrchestratorInner {
                state,
                guard,
                collaborators,
                context,
                synthesis,
                ledger,
                events,
                session_cancel: Mutex::new(CancellationToken::new()),
                turn_cancel: Mutex::new(None),
                turns: AtomicU32::new(0),
            }),
        }
    }

    /// Bind turns to a new session token and reset the turn counter.
    pub fn begin_session(&self, session_cancel: CancellationToken) {
        *self.inner.session_cancel.lock().unwrap_or_else(|e| e.into_inner()) = session_cancel;
        self.inner.turns.store(0, Ordering::SeqCst);
    }

    /// Cancel the turn in flight, if any.
    pub fn cancel_turn(&self) {
        if let Some(token) = self.inner.turn_cancel.lock().unwrap_or_else(|e| e.into_inner()).take() {
            token.cancel();
        }
    }

    pub fn turns_completed(&self) -> u32 {
        self.inner.turns.load(Ordering::SeqCst)
    }

    /// Start a turn for `text`. Returns `None` (and does nothing) when the session is not live or
    /// is stopping, the text is blank, or a turn is already in flight.
    pub fn handle_transcript(&self, text: String) -> Option<JoinHandle<()>> {
        let text = text.trim().to_string();
        if text.is_empty() {
            return None;
        }
        if self.inner.state.phase() != SessionPhase::Live || self.session_stopping() {
            debug!(target: "courtcraft::turn", "ignoring transcript outside a live session");
            return None;
        }
        let Some(permit) = self.inner.guard.try_begin_turn() else {
            debug!(target: "courtcraft::turn", "turn already in flight, transcript dropped");
            return None;
        };
        let cancel = self.next_turn_token();

        let this = self.clone();
        Some(tokio::spawn(async move { this.run_turn(text, permit, cancel).await }))
    }

    fn session_stopping(&self) -> bool {
        self.inner
            .session_cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_cancelled()
    }

    fn next_turn_token(&self) -> CancellationToken {
        let token = self
            .inner
            .session_cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .child_token();
        let previous = self
            .inner
            .turn_cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(token.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }
        token
    }

    async fn run_turn(self, text: String, permit: TurnPermit, cancel: CancellationToken) {
        let objection = match self.execute(&text, &cancel).await {
            Ok(objection) => objection,
            Err(e) if e.is_cancellation() || cancel.is_cancelled() => {
                debug!(target: "courtcraft::turn", "turn cancelled");
                return;
            }
            Err(e) => {
                warn!(target: "courtcraft::turn", error = %e, "⚠️ turn failed");
                self.inner.events.notice(
                    NoticeLevel::Warning,
                    format!("The counterpart could not respond ({}). Keep going.", e),
                );
                return;
            }
        };

        let rebuttal = match objection {
            Some(objection) => self.ask_rebuttal(&objection, &cancel).await,
            None => None,
        };
        drop(permit);

        // The chosen rebuttal is user speech and runs as its own turn.
        if let Some(rebuttal) = rebuttal {
            if cancel.is_cancelled() {
                return;
            }
            if let Some(next) = self.handle_transcript(rebuttal) {
                if let Err(e) = next.await {
                    warn!(target: "courtcraft::turn", error = %e, "rebuttal turn ended abnormally");
                }
            }
        }
    }

    async fn ask_rebuttal(&self, objection: &Objection, cancel: &CancellationToken) -> Option<String> {
        let options = rebuttal_options(objection);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            choice = self.inner.collaborators.rebuttals.choose_rebuttal(objection, &options) => choice,
        }
    }

    /// Steps of one turn up to and including synthesis. Returns the objection, if one was raised.
    async fn execute(&self, text: &str, cancel: &CancellationToken) -> LiveResult<Option<Objection>> {
        let inner = &self.inner;
        if cancel.is_cancelled() {
            return Err(LiveError::Cancelled);
        }
        inner
            .state
            .dispatch(SessionAction::SetTranscript(TranscriptDirection::Output, String::new()));
        inner
            .state
            .dispatch(SessionAction::SetTranscript(TranscriptDirection::Input, text.to_string()));

        {
            let mut ledger = inner.ledger.lock().await;
            // Stop may have begun while waiting for the ledger.
            if cancel.is_cancelled() {
                return Err(LiveError::Cancelled);
            }
            ledger.metrics.record_utterance(text);
            ledger.transcript.push(TranscriptEntry::now(Speaker::User, text));
        }

        let system_prompt = codec::encode_prompt(&inner.collaborators.prompts.system_prompt(&inner.context));
        let raw = self.stream_reply(&system_prompt, text, cancel).await?;

        let parsed = codec::decode(&raw);
        if parsed.is_fallback() {
            info!(target: "courtcraft::turn", "model reply was not structured, voicing raw text");
        }
        let response = parsed.into_response();
        if cancel.is_cancelled() {
            return Err(LiveError::Cancelled);
        }

        if let Some(objection) = &response.objection {
            info!(target: "courtcraft::turn", grounds = %objection.grounds, "⚖️ objection raised");
            inner.state.dispatch(SessionAction::ObjectionDetected);
            inner.ledger.lock().await.metrics.record_objection();
            inner.events.emit(EngineEvent::ObjectionRaised(objection.clone()));
        }

        let coaching = &response.coaching;
        {
            let mut ledger = inner.ledger.lock().await;
            ledger.metrics.record_fallacies(coaching.fallacies_identified.len());
            ledger.metrics.record_score(coaching.rhetorical_effectiveness);
            ledger
                .transcript
                .push(TranscriptEntry::now(Speaker::Counterpart, response.speak.as_str()));
        }
        inner
            .state
            .dispatch(SessionAction::RhetoricalScore(coaching.rhetorical_effectiveness));
        inner.state.dispatch(SessionAction::SetTranscript(
            TranscriptDirection::Output,
            response.speak.clone(),
        ));
        inner.events.emit(EngineEvent::Coaching(coaching.clone()));
        if !coaching.teleprompter_script.trim().is_empty() {
            inner
                .events
                .emit(EngineEvent::Teleprompter(coaching.teleprompter_script.clone()));
        }

        if inner.synthesis.speak(&response.speak, cancel).await == SpeakOutcome::Cancelled {
            return Err(LiveError::Cancelled);
        }

        let turn = inner.turns.fetch_add(1, Ordering::SeqCst) + 1;
        inner.events.emit(EngineEvent::TurnCompleted { turn });
        debug!(target: "courtcraft::turn", turn, action = ?response.action, "turn completed");
        Ok(response.objection)
    }

    /// Collect the streamed reply, mirroring it into the output preview as it arrives.
    async fn stream_reply(&self, system_prompt: &str, text: &str, cancel: &CancellationToken) -> LiveResult<String> {
        let inner = &self.inner;
        let mut chunks = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LiveError::Cancelled),
            r = inner.collaborators.completion.stream(system_prompt, text) => r?,
        };

        let mut raw = String::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(LiveError::Cancelled),
                c = chunks.next() => c,
            };
            match next {
                Some(Ok(chunk)) => {
                    raw.push_str(&chunk);
                    inner
                        .state
                        .dispatch(SessionAction::AppendTranscript(TranscriptDirection::Output, chunk));
                    inner.events.emit(EngineEvent::OutputPreview(raw.clone()));
                }
                Some(Err(e)) => return Err(e),
                None => break,
            }
        }
        Ok(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rebuttal_options_name_the_grounds() {
        let options = rebuttal_options(&Objection {
            grounds: "Hearsay".to_string(),
            explanation: String::new(),
        });
        assert_eq!(options.len(), 3);
        assert_eq!(options[1], "Withdrawn.");
        assert!(options[2].contains("not hearsay"));
    }

    #[test]
    fn blank_grounds_still_reads() {
        let options = rebuttal_options(&Objection {
            grounds: "  ".to_string(),
            explanation: String::new(),
        });
        assert!(options[2].contains("not improper"));
    }
}
