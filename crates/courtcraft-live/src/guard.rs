//! Turn guard: the synchronous flags that keep at most one AI turn in flight and keep the
//! recognizer from hearing the synthesized voice.
//!
//! Both flags are mirrored into the state machine so the UI sees them, but the atomics are the
//! authority for hand-off decisions: they are checked and set without awaiting.

use crate::state::{SessionAction, StateMachine};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug)]
pub struct TurnGuard {
    processing: AtomicBool,
    ai_speaking: AtomicBool,
    state: StateMachine,
}

impl TurnGuard {
    pub fn new(state: StateMachine) -> Arc<Self> {
        Arc::new(Self {
            processing: AtomicBool::new(false),
            ai_speaking: AtomicBool::new(false),
            state,
        })
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::SeqCst)
    }

    pub fn is_ai_speaking(&self) -> bool {
        self.ai_speaking.load(Ordering::SeqCst)
    }

    /// True when incoming speech must be dropped.
    pub fn is_busy(&self) -> bool {
        self.is_processing() || self.is_ai_speaking()
    }

    /// Claim the single turn slot. `None` if a turn is already in flight or the AI is speaking.
    pub fn try_begin_turn(self: &Arc<Self>) -> Option<TurnPermit> {
        if self.is_ai_speaking() {
            return None;
        }
        self.processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()?;
        self.state.dispatch(SessionAction::ProcessingStart);
        Some(TurnPermit {
            guard: Arc::clone(self),
        })
    }

    /// Mark the AI as speaking until the returned guard drops.
    pub fn begin_speaking(self: &Arc<Self>) -> SpeakingGuard {
        self.ai_speaking.store(true, Ordering::SeqCst);
        self.state.dispatch(SessionAction::AiSpeakingStart);
        SpeakingGuard {
            guard: Arc::clone(self),
        }
    }

    /// Force both flags down (session stop).
    pub fn reset(&self) {
        self.processing.store(false, Ordering::SeqCst);
        self.ai_speaking.store(false, Ordering::SeqCst);
    }
}

/// Held for the lifetime of one AI turn. Dropping it clears the processing and speaking flags.
#[derive(Debug)]
pub struct TurnPermit {
    guard: Arc<TurnGuard>,
}

impl Drop for TurnPermit {
    fn drop(&mut self) {
        self.guard.processing.store(false, Ordering::SeqCst);
        self.guard.ai_speaking.store(false, Ordering::SeqCst);
        self.guard.state.dispatch(SessionAction::ProcessingEnd);
        self.guard.state.dispatch(SessionAction::AiSpeakingEnd);
    }
}

/// Held for the whole synthesis attempt window.
#[derive(Debug)]
pub struct SpeakingGuard {
    guard: Arc<TurnGuard>,
}

impl Drop for SpeakingGuard {
    fn drop(&mut self) {
        self.guard.ai_speaking.store(false, Ordering::SeqCst);
        self.guard.state.dispatch(SessionAction::AiSpeakingEnd);
    }
}
