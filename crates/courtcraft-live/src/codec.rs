//! Structured response protocol between the engine and the model.
//!
//! The model must answer with one JSON object carrying the in-character line (`speak`) and private
//! coaching metadata. `encode_prompt` appends the schema to the domain prompt; `decode` turns the raw
//! completion back into a `StructuredTurnResponse`, falling back to a neutral payload that still
//! voices the raw text when the output is malformed.

use crate::state::NEUTRAL_SCORE;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Spoken when the model returned nothing at all.
pub const EMPTY_RESPONSE: &str = "[No response]";

const FALLBACK_CRITIQUE: &str =
    "The counterpart's reply could not be analyzed, so no coaching is available for this turn.";

static CODE_FENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^```[A-Za-z0-9_-]*\s*\n?(.*?)\n?\s*```$").expect("code fence regex is valid")
});

const RESPONSE_SCHEMA: &str = r#"RESPONSE FORMAT (mandatory):
Reply with exactly one JSON object and nothing else. Do not wrap it in markdown or code fences.
{
  "speak": "the words you say aloud, in character",
  "action": "response" | "objection" | "ruling" | "question",
  "objection": null | { "grounds": "legal grounds, e.g. Hearsay", "explanation": "why it applies" },
  "coaching": {
    "critique": "private feedback on the user's last statement",
    "suggestion": "what the user should try instead",
    "teleprompterScript": "a line the user could say next, verbatim",
    "rhetoricalEffectiveness": 0-100 integer score of the user's last statement,
    "fallaciesIdentified": ["names of logical fallacies the user committed"]
  }
}
Rules:
- "speak" must be a non-empty string.
- Set "objection" only when "action" is "objection"; otherwise use null.
- "coaching" is always required, even when there is nothing to criticize.
- "rhetoricalEffectiveness" must be an integer between 0 and 100."#;

/// What the counterpart is doing with its line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnAction {
    #[default]
    Response,
    Objection,
    Ruling,
    Question,
}

/// An objection raised by the counterpart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Objection {
    pub grounds: String,
    #[serde(default)]
    pub explanation: String,
}

/// Private coaching payload. Always present on a decoded response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Coaching {
    #[serde(default)]
    pub critique: String,
    #[serde(default)]
    pub suggestion: String,
    #[serde(default)]
    pub teleprompter_script: String,
    #[serde(default = "neutral_score", deserialize_with = "clamped_score")]
    pub rhetorical_effectiveness: u8,
    #[serde(default)]
    pub fallacies_identified: Vec<String>,
}

fn neutral_score() -> u8 {
    NEUTRAL_SCORE
}

/// Accept any JSON number and clamp it into 0..=100.
fn clamped_score<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = f64::deserialize(deserializer)?;
    if !value.is_finite() {
        return Ok(NEUTRAL_SCORE);
    }
    Ok(value.round().clamp(0.0, 100.0) as u8)
}

impl Default for Coaching {
    fn default() -> Self {
        Self {
            critique: String::new(),
            suggestion: String::new(),
            teleprompter_script: String::new(),
            rhetorical_effectiveness: NEUTRAL_SCORE,
            fallacies_identified: Vec::new(),
        }
    }
}

impl Coaching {
    /// Neutral coaching used when the model output could not be decoded.
    pub fn neutral() -> Self {
        Self {
            critique: FALLBACK_CRITIQUE.to_string(),
            suggestion: "Keep going; coaching resumes with the next exchange.".to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredTurnResponse {
    pub speak: String,
    #[serde(default)]
    pub action: TurnAction,
    #[serde(default)]
    pub objection: Option<Objection>,
    #[serde(default)]
    pub coaching: Coaching,
}

impl StructuredTurnResponse {
    /// Safe default that voices the raw model text.
    pub fn fallback(raw: &str) -> Self {
        let speak = raw.trim();
        Self {
            speak: if speak.is_empty() {
                EMPTY_RESPONSE.to_string()
            } else {
                speak.to_string()
            },
            action: TurnAction::Response,
            objection: None,
            coaching: Coaching::neutral(),
        }
    }
}

/// Outcome of decoding. Both variants carry a usable response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseParseResult {
    Parsed(StructuredTurnResponse),
    Fallback(StructuredTurnResponse),
}

impl ResponseParseResult {
    pub fn response(&self) -> &StructuredTurnResponse {
        match self {
            ResponseParseResult::Parsed(r) | ResponseParseResult::Fallback(r) => r,
        }
    }

    pub fn into_response(self) -> StructuredTurnResponse {
        match self {
            ResponseParseResult::Parsed(r) | ResponseParseResult::Fallback(r) => r,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, ResponseParseResult::Fallback(_))
    }
}

/// Append the response schema and formatting rules to a domain prompt.
pub fn encode_prompt(base_prompt: &str) -> String {
    let base = base_prompt.trim_end();
    if base.is_empty() {
        return RESPONSE_SCHEMA.to_string();
    }
    format!("{}\n\n{}", base, RESPONSE_SCHEMA)
}

/// Remove a surrounding markdown code fence, if any.
pub fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    match CODE_FENCE.captures(trimmed).and_then(|c| c.get(1)) {
        Some(inner) => inner.as_str().trim(),
        None => trimmed,
    }
}

/// Decode raw model output. Never fails: malformed output becomes the fallback variant.
pub fn decode(raw: &str) -> ResponseParseResult {
    let body = strip_code_fence(raw);
    match serde_json::from_str::<StructuredTurnResponse>(body) {
        Ok(response) if !response.speak.trim().is_empty() => {
            ResponseParseResult::Parsed(normalize(response))
        }
        Ok(_) => {
            warn!(target: "courtcraft::codec", "model response has an empty speak field, using fallback");
            ResponseParseResult::Fallback(StructuredTurnResponse::fallback(raw))
        }
        Err(e) => {
            warn!(target: "courtcraft::codec", error = %e, "model response is not valid structured JSON, using fallback");
            ResponseParseResult::Fallback(StructuredTurnResponse::fallback(raw))
        }
    }
}

fn normalize(mut response: StructuredTurnResponse) -> StructuredTurnResponse {
    if response.action != TurnAction::Objection {
        response.objection = None;
    }
    let coaching = &mut response.coaching;
    let mut seen = std::collections::HashSet::new();
    coaching
        .fallacies_identified
        .retain(|f| !f.trim().is_empty() && seen.insert(f.trim().to_lowercase()));
    response
}
