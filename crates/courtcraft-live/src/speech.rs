//! **Speech capture controller**: continuous listening with self-healing restarts.
//!
//! Recognizers close their connection after a stretch of silence. The controller restarts them after
//! a short delay, gives up after too many consecutive empty cycles, and stops at once on fatal
//! errors. Events that arrive while a turn is in flight or the AI is speaking are dropped here,
//! before anything downstream sees them.

use crate::config::SpeechConfig;
use crate::error::{LiveError, LiveResult};
use crate::guard::TurnGuard;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Recognizer error categories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionErrorKind {
    NotAllowed,
    AudioCapture,
    ServiceNotAllowed,
    /// No recognition capability on this platform.
    Unsupported,
    NoSpeech,
    Network,
    Aborted,
    Other(String),
}

impl RecognitionErrorKind {
    /// Fatal errors end the session; the rest are covered by the automatic restart.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RecognitionErrorKind::NotAllowed
                | RecognitionErrorKind::AudioCapture
                | RecognitionErrorKind::ServiceNotAllowed
                | RecognitionErrorKind::Unsupported
        )
    }

    fn into_error(self) -> LiveError {
        match self {
            RecognitionErrorKind::NotAllowed => LiveError::Permission("speech recognition not allowed".to_string()),
            RecognitionErrorKind::AudioCapture => LiveError::AudioDevice("no microphone for recognition".to_string()),
            RecognitionErrorKind::ServiceNotAllowed => {
                LiveError::RecognitionUnavailable("recognition service rejected the request".to_string())
            }
            RecognitionErrorKind::Unsupported => {
                LiveError::RecognitionUnavailable("speech recognition is not supported".to_string())
            }
            other => LiveError::Recognition(format!("{:?}", other)),
        }
    }
}

/// One event from a recognition cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionEvent {
    Interim(String),
    Final(String),
    Error(RecognitionErrorKind),
    /// The cycle is over. A closed channel means the same thing.
    End,
}

/// Continuous speech recognition capability.
#[async_trait]
pub trait Recognizer: Send + Sync {
    /// Begin one recognition cycle.
    async fn start(&self) -> LiveResult<mpsc::Receiver<RecognitionEvent>>;

    /// End the current cycle, if any.
    async fn stop(&self);
}

/// Receives what the controller lets through.
pub trait SpeechSink: Send + Sync {
    fn on_interim(&self, text: &str);
    fn on_final(&self, text: String);
    fn on_fatal(&self, error: LiveError);
}

/// Restart bookkeeping for one `start` call.
#[derive(Debug)]
struct RestartTracker {
    attempts: u32,
    max_attempts: u32,
}

impl RestartTracker {
    fn new(max_attempts: u32) -> Self {
        Self {
            attempts: 0,
            max_attempts,
        }
    }

    fn heard_something(&mut self) {
        self.attempts = 0;
    }

    /// Count a restart. False once the ceiling is exceeded.
    fn try_restart(&mut self) -> bool {
        self.attempts += 1;
        self.attempts <= self.max_attempts
    }
}

enum CycleEnd {
    Ended,
    Cancelled,
    Fatal(LiveError),
}

struct CaptureLoop {
    recognizer: Arc<dyn Recognizer>,
    guard: Arc<TurnGuard>,
    sink: Arc<dyn SpeechSink>,
    config: SpeechConfig,
    tracker: RestartTracker,
    cancel: CancellationToken,
}

impl CaptureLoop {
    async fn run(mut self) {
        loop {
            let end = match self.recognizer.start().await {
                Ok(mut events) => self.drain(&mut events).await,
                Err(e) if e.is_fatal() => CycleEnd::Fatal(e),
                Err(e) => {
                    warn!(target: "courtcraft::speech", error = %e, "recognizer failed to start");
                    CycleEnd::Ended
                }
            };

            match end {
                CycleEnd::Cancelled => break,
                CycleEnd::Fatal(e) => {
                    self.recognizer.stop().await;
                    self.raise(e);
                    break;
                }
                CycleEnd::Ended => {}
            }

            if self.cancel.is_cancelled() {
                break;
            }
            if !self.tracker.try_restart() {
                error!(
                    target: "courtcraft::speech",
                    attempts = self.tracker.max_attempts,
                    "🎙️ recognition keeps dropping, giving up"
                );
                self.raise(LiveError::RestartLimitExceeded(self.tracker.max_attempts));
                break;
            }
            debug!(target: "courtcraft::speech", attempt = self.tracker.attempts, "restarting recognition");

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.restart_delay()) => {}
            }
        }
        debug!(target: "courtcraft::speech", "capture loop finished");
    }

    async fn drain(&mut self, events: &mut mpsc::Receiver<RecognitionEvent>) -> CycleEnd {
        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return CycleEnd::Cancelled,
                e = events.recv() => e,
            };
            match event {
                None | Some(RecognitionEvent::End) => return CycleEnd::Ended,
                Some(RecognitionEvent::Error(kind)) if kind.is_fatal() => {
                    return CycleEnd::Fatal(kind.into_error());
                }
                Some(RecognitionEvent::Error(kind)) => {
                    debug!(target: "courtcraft::speech", ?kind, "transient recognition error");
                }
                Some(RecognitionEvent::Interim(text)) => {
                    // Liveness only: the restart count resets even for results the guard drops.
                    self.tracker.heard_something();
                    if self.guard.is_busy() {
                        continue;
                    }
                    self.sink.on_interim(&text);
                }
                Some(RecognitionEvent::Final(text)) => {
                    self.tracker.heard_something();
                    if self.guard.is_busy() {
                        debug!(target: "courtcraft::speech", "dropping final transcript while busy");
                        continue;
                    }
                    let text = text.trim();
                    if !text.is_empty() {
                        self.sink.on_final(text.to_string());
                    }
                }
            }
        }
    }

    fn raise(&self, error: LiveError) {
        if !self.cancel.is_cancelled() {
            self.sink.on_fatal(error);
        }
    }
}

struct RunningCapture {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns the recognizer for the session.
pub struct SpeechCaptureController {
    recognizer: Arc<dyn Recognizer>,
    guard: Arc<TurnGuard>,
    config: SpeechConfig,
    running: Mutex<Option<RunningCapture>>,
}

impl SpeechCaptureController {
    pub fn new(recognizer: Arc<dyn Recognizer>, guard: Arc<TurnGuard>, config: SpeechConfig) -> Self {
        Self {
            recognizer,
            guard,
            config,
            running: Mutex::new(None),
        }
    }

    /// Begin continuous listening. Restarts any previous capture with a fresh restart counter.
    pub async fn start(&self, sink: Arc<dyn SpeechSink>) {
        self.stop().await;

        let cancel = CancellationToken::new();
        let capture = CaptureLoop {
            recognizer: Arc::clone(&self.recognizer),
            guard: Arc::clone(&self.guard),
            sink,
            config: self.config.clone(),
            tracker: RestartTracker::new(self.config.max_restart_attempts),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(capture.run());
        *self.running.lock().await = Some(RunningCapture { cancel, task });
        info!(target: "courtcraft::speech", "🎙️ listening");
    }

    /// Stop listening and suppress any pending restart. Idempotent.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        running.cancel.cancel();
        self.recognizer.stop().await;
        if let Err(e) = running.task.await {
            warn!(target: "courtcraft::speech", error = %e, "capture task ended abnormally");
        }
        info!(target: "courtcraft::speech", "🎙️ stopped listening");
    }

    pub async fn is_running(&self) -> bool {
        match self.running.lock().await.as_ref() {
            Some(running) => !running.task.is_finished(),
            None => false,
        }
    }
}

/// Recognizer fed from a channel: each cycle forwards events until `End`. When the feed is closed,
/// every cycle ends immediately.
pub struct ChannelRecognizer {
    feed: Arc<Mutex<mpsc::Receiver<RecognitionEvent>>>,
    cycle: Mutex<Option<CancellationToken>>,
    starts: AtomicU32,
}

impl ChannelRecognizer {
    pub fn new() -> (Self, mpsc::Sender<RecognitionEvent>) {
        let (tx, rx) = mpsc::channel(64);
        (
            Self {
                feed: Arc::new(Mutex::new(rx)),
                cycle: Mutex::new(None),
                starts: AtomicU32::new(0),
            },
            tx,
        )
    }

    /// Number of cycles started so far.
    pub fn starts(&self) -> u32 {
        self.starts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Recognizer for ChannelRecognizer {
    async fn start(&self) -> LiveResult<mpsc::Receiver<RecognitionEvent>> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let token = CancellationToken::new();
        if let Some(previous) = self.cycle.lock().await.replace(token.clone()) {
            previous.cancel();
        }

        let (tx, rx) = mpsc::channel(32);
        let feed = Arc::clone(&self.feed);
        tokio::spawn(async move {
            let mut feed = feed.lock().await;
            loop {
                let event = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    e = feed.recv() => e,
                };
                match event {
                    None | Some(RecognitionEvent::End) => break,
                    Some(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                }
            }
            let _ = tx.send(RecognitionEvent::End).await;
        });
        Ok(rx)
    }

    async fn stop(&self) {
        if let Some(token) = self.cycle.lock().await.take() {
            token.cancel();
        }
    }
}
