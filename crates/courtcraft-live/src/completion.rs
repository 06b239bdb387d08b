//! Streaming completion endpoint.
//!
//! `CompletionStream` yields the model's reply as text chunks. Dropping the returned stream abandons
//! the request; no server-side cancel call is needed. `OpenRouterChat` talks to any OpenAI-compatible
//! `/chat/completions` endpoint with `stream: true` and decodes the SSE `data:` lines.

use crate::config::LlmConfig;
use crate::error::{LiveError, LiveResult};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::time::Duration;
use tracing::{debug, info};

/// Chunks of model output in arrival order.
pub type CompletionChunks = BoxStream<'static, LiveResult<String>>;

#[async_trait]
pub trait CompletionStream: Send + Sync {
    /// Start a completion for `user_text` under `system_prompt`.
    async fn stream(&self, system_prompt: &str, user_text: &str) -> LiveResult<CompletionChunks>;
}

/// Incremental decoder for OpenAI-style server-sent events.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    done: bool,
}

impl SseDecoder {
    /// Feed raw bytes; returns the content deltas completed by this chunk.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut deltas = Vec::new();
        if self.done {
            return deltas;
        }
        self.buffer.extend_from_slice(bytes);

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\r', '\n']);

            let Some(payload) = line.strip_prefix("data:") else {
                continue;
            };
            let payload = payload.trim();
            if payload == "[DONE]" {
                self.done = true;
                self.buffer.clear();
                break;
            }
            match serde_json::from_str::<serde_json::Value>(payload) {
                Ok(json) => {
                    if let Some(delta) = json["choices"][0]["delta"]["content"].as_str() {
                        if !delta.is_empty() {
                            deltas.push(delta.to_string());
                        }
                    }
                }
                Err(e) => debug!(target: "courtcraft::completion", error = %e, "skipping undecodable SSE line"),
            }
        }

        deltas
    }

    pub fn is_done(&self) -> bool {
        self.done
    }
}

/// OpenAI-compatible streaming chat client (OpenRouter by default).
#[derive(Debug, Clone)]
pub struct OpenRouterChat {
    /// Base URL without trailing slash (e.g. https://openrouter.ai/api/v1).
    pub base_url: String,
    api_key: String,
    pub model: String,
    pub temperature: f32,
    client: reqwest::Client,
}

impl OpenRouterChat {
    /// Create with explicit config.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        temperature: f32,
    ) -> LiveResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            temperature,
            client,
        })
    }

    /// Build from config plus `COURTCRAFT_LLM_API_KEY` (or `OPENROUTER_API_KEY`).
    pub fn from_env(cfg: &LlmConfig) -> LiveResult<Self> {
        let api_key = std::env::var("COURTCRAFT_LLM_API_KEY")
            .or_else(|_| std::env::var("OPENROUTER_API_KEY"))
            .map_err(|_| {
                LiveError::Config("completion requires COURTCRAFT_LLM_API_KEY or OPENROUTER_API_KEY".to_string())
            })?;
        Self::new(cfg.api_url.clone(), api_key, cfg.model.clone(), cfg.temperature)
    }
}

#[async_trait]
impl CompletionStream for OpenRouterChat {
    async fn stream(&self, system_prompt: &str, user_text: &str) -> LiveResult<CompletionChunks> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system_prompt },
                { "role": "user", "content": user_text },
            ],
            "stream": true,
            "temperature": self.temperature,
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("X-Title", "Courtcraft Live")
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(LiveError::Completion(format!("API error {}: {}", status, body)));
        }

        info!(target: "courtcraft::completion", model = %self.model, "completion stream opened");

        let mut decoder = SseDecoder::default();
        let chunks = response
            .bytes_stream()
            .map(move |chunk| -> Vec<LiveResult<String>> {
                match chunk {
                    Ok(bytes) => decoder.push(&bytes).into_iter().map(Ok).collect(),
                    Err(e) => vec![Err(LiveError::Completion(format!("Stream error: {}", e)))],
                }
            })
            .flat_map(stream::iter);

        Ok(chunks.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(content: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({"choices": [{"delta": {"content": content}}]})
        )
    }

    #[test]
    fn decodes_deltas_across_split_chunks() {
        let mut decoder = SseDecoder::default();
        let wire = format!(
            "{}: OPENROUTER PROCESSING\n\n{}",
            event("{\"speak\":"),
            event(" \"Sustained.\"}")
        );
        let (a, b) = wire.as_bytes().split_at(17);

        let mut out = decoder.push(a);
        out.extend(decoder.push(b));
        assert_eq!(out.concat(), "{\"speak\": \"Sustained.\"}");
    }

    #[test]
    fn stops_at_done_marker() {
        let mut decoder = SseDecoder::default();
        let wire = format!("{}data: [DONE]\n\n{}", event("Overruled."), event("ignored"));
        let out = decoder.push(wire.as_bytes());
        assert_eq!(out, vec!["Overruled.".to_string()]);
        assert!(decoder.is_done());
        assert!(decoder.push(event("late").as_bytes()).is_empty());
    }

    #[test]
    fn tolerates_crlf_and_role_only_deltas() {
        let mut decoder = SseDecoder::default();
        let wire = "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\r\n\r\ndata: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\r\n";
        assert_eq!(decoder.push(wire.as_bytes()), vec!["Hi".to_string()]);
    }
}
