// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! ChatGPT-backend Responses driver.
//!
//! Same event shapes as [`crate::responses`] but reached through ChatGPT's
//! `/backend-api/codex/responses` endpoint using an OAuth access token and
//! account id instead of an API key, and the system prompt goes in a
//! top-level `instructions` field rather than a `developer`-role input item.
//! Credentials come from the caller (`sven-auth`'s ChatGPT OAuth store) —
//! this module only knows how to use a token, not how to obtain one.

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

use crate::{
    catalog::{static_catalog, ModelCatalogEntry},
    provider::ResponseStream,
    responses::{build_responses_input, ResponsesState},
    CompletionRequest, Message, ResponseEvent, Role, StopReason,
};

const MAX_RETRIES: u32 = 3;
const BASE_DELAY_MS: u64 = 1000;

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

/// A valid (already-refreshed) ChatGPT OAuth access token plus the
/// account id that must accompany every backend-api request.
#[derive(Debug, Clone)]
pub struct ChatGptCredentials {
    pub access_token: String,
    pub account_id: String,
}

pub struct ChatGptResponsesProvider {
    model: String,
    creds: ChatGptCredentials,
    base_url: String,
    max_output_tokens: Option<u32>,
    temperature: Option<f32>,
    driver_options: serde_json::Value,
    client: reqwest::Client,
}

impl ChatGptResponsesProvider {
    pub fn new(
        model: String,
        creds: ChatGptCredentials,
        base_url: Option<String>,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
        driver_options: serde_json::Value,
    ) -> Self {
        Self {
            model,
            creds,
            base_url: base_url.unwrap_or_else(|| "https://chatgpt.com/backend-api".into()),
            max_output_tokens: max_tokens,
            temperature,
            driver_options,
            client: reqwest::Client::new(),
        }
    }

    fn resolve_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        if base.ends_with("/codex/responses") {
            base.to_string()
        } else if base.ends_with("/codex") {
            format!("{base}/responses")
        } else {
            format!("{base}/codex/responses")
        }
    }
}

#[async_trait]
impl crate::ModelProvider for ChatGptResponsesProvider {
    fn name(&self) -> &str {
        "chatgpt-responses"
    }
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn list_models(&self) -> anyhow::Result<Vec<ModelCatalogEntry>> {
        let mut entries: Vec<ModelCatalogEntry> = static_catalog()
            .into_iter()
            .filter(|e| e.provider == "chatgpt-responses")
            .collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entries)
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        let (instructions, rest): (String, Vec<Message>) = {
            let system_text = req
                .messages
                .iter()
                .find(|m| m.role == Role::System)
                .and_then(|m| m.as_text())
                .unwrap_or("")
                .to_string();
            let rest = req
                .messages
                .iter()
                .filter(|m| m.role != Role::System)
                .cloned()
                .collect();
            (system_text, rest)
        };

        let mut body = json!({
            "model": self.model,
            "store": false,
            "stream": true,
            "instructions": instructions,
            "input": build_responses_input(&rest),
            "include": ["reasoning.encrypted_content"],
            "text": { "verbosity": "medium" },
            "tool_choice": "auto",
            "parallel_tool_calls": true,
        });

        if !req.tools.is_empty() {
            let tools: Vec<Value> = req
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                        "strict": false,
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }
        if let Some(max_tok) = self.max_output_tokens {
            body["max_output_tokens"] = json!(max_tok);
        }
        if let Some(effort) = self.driver_options.get("reasoning_effort").and_then(|v| v.as_str())
        {
            if effort != "none" {
                body["reasoning"] = json!({ "effort": effort, "summary": "auto" });
            }
        }
        if let Some(t) = self.temperature {
            body["temperature"] = json!(t);
        }

        let url = self.resolve_url();
        debug!(model = %self.model, %url, "sending chatgpt-backend codex request");

        let mut attempt = 0;
        let resp = loop {
            let resp = self
                .client
                .post(&url)
                .bearer_auth(&self.creds.access_token)
                .header("chatgpt-account-id", &self.creds.account_id)
                .header("OpenAI-Beta", "responses=experimental")
                .header("originator", "sven")
                .header("accept", "text/event-stream")
                .json(&body)
                .send()
                .await
                .context("ChatGPT backend request failed")?;

            if resp.status().is_success() {
                break resp;
            }
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            if attempt < MAX_RETRIES && is_retryable_status(status.as_u16()) {
                let delay = BASE_DELAY_MS * 2u64.pow(attempt);
                warn!(attempt, %status, delay_ms = delay, "retrying chatgpt-backend request");
                sleep(Duration::from_millis(delay)).await;
                attempt += 1;
                continue;
            }
            bail!("ChatGPT backend error {status}: {text}");
        };

        let byte_stream = resp.bytes_stream();
        let event_stream = byte_stream
            .scan((String::new(), ResponsesState::default()), |(buf, state), chunk| {
                let text = match chunk {
                    Ok(b) => String::from_utf8_lossy(&b).to_string(),
                    Err(e) => {
                        return futures::future::ready(Some(vec![Err(anyhow::anyhow!(e))]));
                    }
                };
                buf.push_str(&text);
                let mut events: Vec<anyhow::Result<ResponseEvent>> = Vec::new();
                // This backend frames events as "data: ...\n\n" blocks rather
                // than single lines, so split on the blank-line terminator.
                while let Some(pos) = buf.find("\n\n") {
                    let block = buf[..pos].to_string();
                    buf.drain(..=pos + 1);
                    let data: String = block
                        .lines()
                        .filter_map(|l| l.strip_prefix("data:"))
                        .map(|l| l.trim())
                        .collect::<Vec<_>>()
                        .join("\n");
                    if data.is_empty() || data == "[DONE]" {
                        continue;
                    }
                    if let Ok(v) = serde_json::from_str::<Value>(&data) {
                        events.extend(state.handle_event(&v));
                    }
                }
                futures::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> ChatGptCredentials {
        ChatGptCredentials { access_token: "tok".into(), account_id: "acct".into() }
    }

    #[test]
    fn resolve_url_appends_codex_responses_by_default() {
        let p = ChatGptResponsesProvider::new(
            "gpt-5-codex".into(),
            creds(),
            None,
            None,
            None,
            serde_json::Value::Null,
        );
        assert_eq!(p.resolve_url(), "https://chatgpt.com/backend-api/codex/responses");
    }

    #[test]
    fn resolve_url_respects_explicit_full_path() {
        let p = ChatGptResponsesProvider::new(
            "gpt-5-codex".into(),
            creds(),
            Some("https://chatgpt.com/backend-api/codex/responses".into()),
            None,
            None,
            serde_json::Value::Null,
        );
        assert_eq!(p.resolve_url(), "https://chatgpt.com/backend-api/codex/responses");
    }

    #[test]
    fn resolve_url_appends_responses_when_base_ends_in_codex() {
        let p = ChatGptResponsesProvider::new(
            "gpt-5-codex".into(),
            creds(),
            Some("https://chatgpt.com/backend-api/codex".into()),
            None,
            None,
            serde_json::Value::Null,
        );
        assert_eq!(p.resolve_url(), "https://chatgpt.com/backend-api/codex/responses");
    }

    #[test]
    fn is_retryable_status_matches_429_and_5xx_gateway_codes() {
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(503));
        assert!(!is_retryable_status(400));
        assert!(!is_retryable_status(401));
    }

    #[test]
    fn name_and_model_name() {
        use crate::ModelProvider;
        let p = ChatGptResponsesProvider::new(
            "gpt-5-codex".into(),
            creds(),
            None,
            None,
            None,
            serde_json::Value::Null,
        );
        assert_eq!(p.name(), "chatgpt-responses");
        assert_eq!(p.model_name(), "gpt-5-codex");
    }
}
