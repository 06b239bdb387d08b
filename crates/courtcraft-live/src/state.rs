//! Session state machine: the single source of truth for session-visible state.
//!
//! `SessionState::apply` is a pure, total transition function. Actions that are not legal in the
//! current phase are ignored. `StateMachine` wraps it in a `watch` channel so observers always see
//! the latest state without being able to mutate it.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

/// Score reported when no rhetorical scores have been recorded yet.
pub const NEUTRAL_SCORE: u8 = 50;

/// Lifecycle of a live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    #[default]
    Idle,
    Connecting,
    Live,
    Stopped,
}

/// Which live preview a transcript update targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptDirection {
    /// What the user is saying (interim recognition).
    Input,
    /// What the counterpart is saying (streamed model output).
    Output,
}

/// Every mutation the engine may request.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    StartConnecting,
    SessionLive,
    AiSpeakingStart,
    AiSpeakingEnd,
    ProcessingStart,
    ProcessingEnd,
    SetVolume(f32),
    SetTranscript(TranscriptDirection, String),
    /// Append a streamed chunk to a preview instead of replacing it.
    AppendTranscript(TranscriptDirection, String),
    ObjectionDetected,
    RhetoricalScore(u8),
    Stop,
}

/// UI-facing aggregate state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub phase: SessionPhase,
    pub is_ai_speaking: bool,
    pub is_processing: bool,
    pub live_volume: f32,
    pub input_transcript: String,
    pub output_transcript: String,
    pub objection_count: u32,
    pub rhetorical_scores: Vec<u8>,
    pub session_score: u8,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            phase: SessionPhase::Idle,
            is_ai_speaking: false,
            is_processing: false,
            live_volume: 0.0,
            input_transcript: String::new(),
            output_transcript: String::new(),
            objection_count: 0,
            rhetorical_scores: Vec::new(),
            session_score: NEUTRAL_SCORE,
        }
    }
}

/// Rounded mean of the scores, or 50 when there are none.
pub fn mean_score(scores: &[u8]) -> u8 {
    if scores.is_empty() {
        return NEUTRAL_SCORE;
    }
    let sum: u32 = scores.iter().map(|&s| s as u32).sum();
    (sum as f64 / scores.len() as f64).round() as u8
}

impl SessionState {
    /// True while new final transcripts must be discarded.
    pub fn is_busy(&self) -> bool {
        self.is_ai_speaking || self.is_processing
    }

    /// Apply one action.
    pub fn apply(&mut self, action: SessionAction) {
        use SessionAction::*;
        use SessionPhase::*;

        match (self.phase, action) {
            (Idle | Stopped, StartConnecting) => {
                *self = SessionState {
                    phase: Connecting,
                    ..SessionState::default()
                };
            }
            (Connecting, SessionLive) => {
                self.phase = Live;
            }
            (Live, AiSpeakingStart) => self.is_ai_speaking = true,
            (Live, AiSpeakingEnd) => self.is_ai_speaking = false,
            (Live, ProcessingStart) => self.is_processing = true,
            (Live, ProcessingEnd) => self.is_processing = false,
            (Connecting | Live, SetVolume(v)) => {
                self.live_volume = if v.is_finite() { v.clamp(0.0, 1.0) } else { 0.0 };
            }
            (Connecting | Live, SetTranscript(direction, text)) => match direction {
                TranscriptDirection::Input => self.input_transcript = text,
                TranscriptDirection::Output => self.output_transcript = text,
            },
            (Connecting | Live, AppendTranscript(direction, text)) => match direction {
                TranscriptDirection::Input => self.input_transcript.push_str(&text),
                TranscriptDirection::Output => self.output_transcript.push_str(&text),
            },
            (Live, ObjectionDetected) => self.objection_count += 1,
            (Live, RhetoricalScore(n)) => {
                self.rhetorical_scores.push(n.min(100));
                self.session_score = mean_score(&self.rhetorical_scores);
            }
            (Connecting | Live, Stop) => {
                self.phase = Stopped;
                self.is_ai_speaking = false;
                self.is_processing = false;
                self.live_volume = 0.0;
                self.input_transcript.clear();
                self.output_transcript.clear();
            }
            (phase, action) => {
                debug!(target: "courtcraft::state", ?phase, ?action, "ignored action");
            }
        }
    }
}

/// Owner of the session state. Cloning shares the same state.
#[derive(Debug, Clone)]
pub struct StateMachine {
    tx: watch::Sender<SessionState>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SessionState::default());
        Self { tx }
    }

    /// Apply an action and notify subscribers.
    pub fn dispatch(&self, action: SessionAction) {
        self.tx.send_modify(|state| state.apply(action));
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> SessionState {
        self.tx.borrow().clone()
    }

    pub fn phase(&self) -> SessionPhase {
        self.tx.borrow().phase
    }

    pub fn is_ai_speaking(&self) -> bool {
        self.tx.borrow().is_ai_speaking
    }

    /// Receiver for UI observers.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live() -> SessionState {
        let mut s = SessionState::default();
        s.apply(SessionAction::StartConnecting);
        s.apply(SessionAction::SessionLive);
        s
    }

    #[test]
    fn lifecycle_follows_idle_connecting_live_stopped() {
        let mut s = SessionState::default();
        assert_eq!(s.phase, SessionPhase::Idle);
        s.apply(SessionAction::SessionLive);
        assert_eq!(s.phase, SessionPhase::Idle, "live requires connecting first");
        s.apply(SessionAction::StartConnecting);
        assert_eq!(s.phase, SessionPhase::Connecting);
        s.apply(SessionAction::SessionLive);
        assert_eq!(s.phase, SessionPhase::Live);
        s.apply(SessionAction::Stop);
        assert_eq!(s.phase, SessionPhase::Stopped);
    }

    #[test]
    fn session_score_is_rounded_mean_or_neutral() {
        let mut s = live();
        assert_eq!(s.session_score, 50);
        s.apply(SessionAction::RhetoricalScore(40));
        s.apply(SessionAction::RhetoricalScore(61));
        assert_eq!(s.session_score, 51); // 50.5 rounds up
        s.apply(SessionAction::RhetoricalScore(80));
        assert_eq!(s.session_score, mean_score(&s.rhetorical_scores));
        assert_eq!(s.session_score, 60);
    }

    #[test]
    fn stop_clears_transients_and_keeps_counters() {
        let mut s = live();
        s.apply(SessionAction::SetVolume(0.4));
        s.apply(SessionAction::SetTranscript(TranscriptDirection::Input, "your honor".into()));
        s.apply(SessionAction::AppendTranscript(TranscriptDirection::Output, "Sustained".into()));
        s.apply(SessionAction::AiSpeakingStart);
        s.apply(SessionAction::ObjectionDetected);
        s.apply(SessionAction::RhetoricalScore(70));
        s.apply(SessionAction::Stop);

        assert_eq!(s.live_volume, 0.0);
        assert!(s.input_transcript.is_empty());
        assert!(s.output_transcript.is_empty());
        assert!(!s.is_ai_speaking);
        assert_eq!(s.objection_count, 1);
        assert_eq!(s.rhetorical_scores, vec![70]);

        s.apply(SessionAction::StartConnecting);
        assert_eq!(s.objection_count, 0);
        assert!(s.rhetorical_scores.is_empty());
        assert_eq!(s.session_score, 50);
    }

    #[test]
    fn illegal_actions_are_no_ops() {
        let mut s = SessionState::default();
        let before = s.clone();
        s.apply(SessionAction::ObjectionDetected);
        s.apply(SessionAction::AiSpeakingStart);
        s.apply(SessionAction::RhetoricalScore(90));
        s.apply(SessionAction::Stop);
        assert_eq!(s, before);
    }

    #[test]
    fn speaking_and_processing_make_state_busy() {
        let mut s = live();
        assert!(!s.is_busy());
        s.apply(SessionAction::ProcessingStart);
        assert!(s.is_busy());
        s.apply(SessionAction::ProcessingEnd);
        s.apply(SessionAction::AiSpeakingStart);
        assert!(s.is_busy());
        s.apply(SessionAction::AiSpeakingEnd);
        assert!(!s.is_busy());
    }

    #[test]
    fn volume_is_clamped() {
        let mut s = live();
        s.apply(SessionAction::SetVolume(3.0));
        assert_eq!(s.live_volume, 1.0);
        s.apply(SessionAction::SetVolume(f32::NAN));
        assert_eq!(s.live_volume, 0.0);
    }

    #[tokio::test]
    async fn machine_notifies_subscribers() {
        let machine = StateMachine::new();
        let mut rx = machine.subscribe();
        machine.dispatch(SessionAction::StartConnecting);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().phase, SessionPhase::Connecting);
        assert_eq!(machine.phase(), SessionPhase::Connecting);
    }
}
