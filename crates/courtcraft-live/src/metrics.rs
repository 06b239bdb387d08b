//! Per-session metrics: word and filler counts, objections, fallacies, rhetorical average.

use crate::state::mean_score;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Fillers counted against the speaker. Multi-word entries are matched as phrases.
pub const FILLER_WORDS: &[&str] = &[
    "um", "uh", "uhm", "er", "ah", "like", "you know", "i mean", "basically", "actually", "literally",
    "kind of", "sort of", "so yeah", "right",
];

static FILLER_PATTERN: Lazy<Regex> = Lazy::new(|| {
    // Longest phrases first so "you know" is not shadowed by shorter alternatives.
    let mut words: Vec<&str> = FILLER_WORDS.to_vec();
    words.sort_by_key(|w| std::cmp::Reverse(w.len()));
    let alternatives = words
        .iter()
        .map(|w| regex::escape(w).replace(' ', r"\s+"))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(r"(?i)\b(?:{})\b", alternatives)).expect("filler regex is valid")
});

/// Snapshot of the running metrics. Persisted inside each session record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub objections_received: u32,
    pub fallacies_committed: u32,
    pub avg_rhetorical_score: u8,
    pub word_count: u32,
    pub filler_words_count: u32,
}

/// Count words and fillers in an utterance.
pub fn scan_utterance(text: &str) -> (u32, u32) {
    let words = text.split_whitespace().count() as u32;
    let fillers = FILLER_PATTERN.find_iter(text).count() as u32;
    (words, fillers)
}

/// Mutable accumulator, one per session.
#[derive(Debug, Clone, Default)]
pub struct MetricsAccumulator {
    metrics: SessionMetrics,
    scores: Vec<u8>,
}

impl MetricsAccumulator {
    pub fn new() -> Self {
        Self {
            metrics: SessionMetrics {
                avg_rhetorical_score: mean_score(&[]),
                ..SessionMetrics::default()
            },
            scores: Vec::new(),
        }
    }

    pub fn record_utterance(&mut self, text: &str) {
        let (words, fillers) = scan_utterance(text);
        self.metrics.word_count += words;
        self.metrics.filler_words_count += fillers;
    }

    pub fn record_objection(&mut self) {
        self.metrics.objections_received += 1;
    }

    pub fn record_fallacies(&mut self, count: usize) {
        self.metrics.fallacies_committed += count as u32;
    }

    /// Add a score and recompute the average from the full list.
    pub fn record_score(&mut self, score: u8) {
        self.scores.push(score.min(100));
        self.metrics.avg_rhetorical_score = mean_score(&self.scores);
    }

    pub fn snapshot(&self) -> SessionMetrics {
        self.metrics.clone()
    }
}
