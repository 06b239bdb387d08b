//! Courtcraft terminal rehearsal
//!
//! Runs a live session from the terminal: each line typed on stdin is treated as a final
//! transcript, the counterpart's lines are printed (and voiced when a TTS key or local synthesizer
//! is available), and the session is archived to sled on exit. Typed sessions carry no recording.

use async_trait::async_trait;
use courtcraft_live::{
    rebuttal_options, ChannelRecognizer, CommandSpeech, CourtroomPrompts, EngineEvent, LiveConfig, LiveResult,
    LiveSession, NoticeLevel, NullRecorder, Objection, OnDeviceSynthesizer, OpenAiTts, OpenRouterChat,
    RebuttalPrompter, RecognitionErrorKind, RecognitionEvent, Recognizer, RemoteSynthesizer, SessionPhase,
    SessionProfile, SessionServices, SilentAudioInput, SimulationMode, SledHistoryStore, TrialPhase,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const QUIT_COMMAND: &str = "/quit";

/// Typed lines stand in for recognized speech. Each line is one recognition cycle.
struct StdinRecognizer {
    channel: ChannelRecognizer,
    quit: CancellationToken,
}

impl StdinRecognizer {
    fn spawn(quit: CancellationToken) -> Self {
        let (channel, feed) = ChannelRecognizer::new();
        let reader_quit = quit.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                let line = tokio::select! {
                    _ = reader_quit.cancelled() => break,
                    line = lines.next_line() => line,
                };
                match line {
                    Ok(Some(line)) if line.trim() == QUIT_COMMAND => {
                        reader_quit.cancel();
                        break;
                    }
                    Ok(Some(line)) => {
                        if !forward(&feed, RecognitionEvent::Final(line)).await
                            || !forward(&feed, RecognitionEvent::End).await
                        {
                            break;
                        }
                    }
                    Ok(None) => {
                        reader_quit.cancel();
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "stdin read failed");
                        let _ = forward(&feed, RecognitionEvent::Error(RecognitionErrorKind::AudioCapture)).await;
                        break;
                    }
                }
            }
        });
        Self { channel, quit }
    }
}

async fn forward(feed: &mpsc::Sender<RecognitionEvent>, event: RecognitionEvent) -> bool {
    feed.send(event).await.is_ok()
}

#[async_trait]
impl Recognizer for StdinRecognizer {
    async fn start(&self) -> LiveResult<mpsc::Receiver<RecognitionEvent>> {
        self.channel.start().await
    }

    async fn stop(&self) {
        self.channel.stop().await;
        if self.quit.is_cancelled() {
            tracing::debug!("stdin recognizer stopped after quit");
        }
    }
}

/// Headless hosts have no modal: answer every objection with the first quick response.
struct FirstOptionRebuttal;

#[async_trait]
impl RebuttalPrompter for FirstOptionRebuttal {
    async fn choose_rebuttal(&self, objection: &Objection, options: &[String]) -> Option<String> {
        let choice = options.first().cloned();
        if let Some(choice) = &choice {
            println!("  [objection: {}] you answer: {}", objection.grounds, choice);
        }
        choice
    }
}

fn env_enum<T: serde::de::DeserializeOwned + Default>(key: &str) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| serde_json::from_value(serde_json::Value::String(v.trim().to_lowercase())).ok())
        .unwrap_or_default()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[courtcraft] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = LiveConfig::load()?;
    let profile = SessionProfile {
        case_id: std::env::var("COURTCRAFT_CASE_ID").unwrap_or_else(|_| "default".to_string()),
        phase: env_enum::<TrialPhase>("COURTCRAFT_PHASE"),
        mode: env_enum::<SimulationMode>("COURTCRAFT_MODE"),
        case_summary: std::env::var("COURTCRAFT_CASE_SUMMARY").unwrap_or_default(),
    };

    let history_path =
        std::env::var("COURTCRAFT_HISTORY_PATH").unwrap_or_else(|_| "./data/courtcraft_history".to_string());
    let history = Arc::new(SledHistoryStore::open_path(&history_path)?);

    let remote_tts: Option<Arc<dyn RemoteSynthesizer>> = match OpenAiTts::from_env() {
        Ok(tts) => Some(Arc::new(tts)),
        Err(e) => {
            tracing::info!(reason = %e, "remote TTS disabled");
            None
        }
    };
    let local_speech = CommandSpeech::default();
    let on_device_tts: Option<Arc<dyn OnDeviceSynthesizer>> = if local_speech.is_available() {
        Some(Arc::new(local_speech))
    } else {
        None
    };

    #[cfg(feature = "playback")]
    let audio_sink: Arc<dyn courtcraft_live::AudioSink> = Arc::new(courtcraft_live::RodioSink::new()?);
    #[cfg(not(feature = "playback"))]
    let audio_sink: Arc<dyn courtcraft_live::AudioSink> = Arc::new(courtcraft_live::NullSink::new());

    let quit = CancellationToken::new();
    let services = SessionServices {
        // Typed input has no microphone audio worth keeping, so nothing is recorded.
        audio_input: Arc::new(SilentAudioInput::default()),
        recognizer: Arc::new(StdinRecognizer::spawn(quit.clone())),
        recorder: Arc::new(NullRecorder::new()),
        completion: Arc::new(OpenRouterChat::from_env(&config.llm)?),
        prompts: Arc::new(CourtroomPrompts),
        rebuttals: Arc::new(FirstOptionRebuttal),
        remote_tts,
        on_device_tts,
        audio_sink,
        history,
    };

    let session = LiveSession::new(config, profile.clone(), services);
    let mut events = session.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                EngineEvent::Notice { level, message } => match level {
                    NoticeLevel::Info => tracing::info!("{}", message),
                    NoticeLevel::Warning => tracing::warn!("⚠️ {}", message),
                    NoticeLevel::Fatal => tracing::error!("🛑 {}", message),
                },
                EngineEvent::ObjectionRaised(objection) => {
                    println!("  OBJECTION: {} {}", objection.grounds, objection.explanation);
                    tracing::debug!(options = ?rebuttal_options(&objection), "quick responses");
                }
                EngineEvent::Teleprompter(script) => println!("  [teleprompter] {}", script),
                EngineEvent::Coaching(coaching) => println!(
                    "  [coach {}/100] {} | {}",
                    coaching.rhetorical_effectiveness, coaching.critique, coaching.suggestion
                ),
                EngineEvent::TurnCompleted { turn } => tracing::debug!(turn, "turn completed"),
                EngineEvent::OutputPreview(_) => {}
                EngineEvent::SessionStopped { record_id } => {
                    tracing::info!(record_id = ?record_id, "session stopped");
                }
            }
        }
    });

    let mut state = session.subscribe_state();
    let mut last_line = String::new();

    session.start().await?;
    println!(
        "Rehearsing {} in case '{}'. Speak by typing; {} to finish.",
        profile.phase, profile.case_id, QUIT_COMMAND
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("CTRL-C received; ending session");
                break;
            }
            _ = quit.cancelled() => break,
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = state.borrow_and_update().clone();
                if snapshot.phase == SessionPhase::Stopped {
                    break;
                }
                if !snapshot.is_processing && !snapshot.output_transcript.is_empty()
                    && snapshot.output_transcript != last_line
                {
                    println!("COUNSEL: {}", snapshot.output_transcript);
                    last_line = snapshot.output_transcript;
                }
            }
        }
    }

    if let Some(record) = session.stop(true).await? {
        let metrics = &record.metrics;
        println!(
            "Session {} saved: score {}, {} words, {} fillers, {} objections, {} fallacies.",
            record.id,
            record.score,
            metrics.word_count,
            metrics.filler_words_count,
            metrics.objections_received,
            metrics.fallacies_committed
        );
    }
    Ok(())
}
