// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! OpenAI Responses API driver.
//!
//! Unlike Chat Completions, the Responses API streams structured item events
//! (`response.output_item.added/.done`, `response.function_call_arguments.*`)
//! rather than a flat delta array, and tool-call arguments can additionally
//! arrive as a single `.done` correction rather than incremental deltas. This
//! module accumulates both shapes into the same by-index [`ResponseEvent::ToolCall`]
//! the rest of the crate expects.

use std::collections::HashMap;

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    catalog::{static_catalog, ModelCatalogEntry},
    provider::ResponseStream,
    sanitize::sanitize_surrogates,
    CompletionRequest, ContentPart, Message, MessageContent, ResponseEvent, Role, StopReason,
    ToolResultContent,
};

/// OpenAI Responses API driver, also used (with different headers/base_url)
/// for the GitHub-Copilot-proxied `github-copilot-responses` variant.
pub struct OpenAIResponsesProvider {
    model: String,
    api_key: Option<String>,
    base_url: String,
    max_output_tokens: u32,
    temperature: Option<f32>,
    extra_headers: Vec<(String, String)>,
    driver_options: serde_json::Value,
    client: reqwest::Client,
}

impl OpenAIResponsesProvider {
    pub fn new(
        model: String,
        api_key: Option<String>,
        base_url: Option<String>,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
        driver_options: serde_json::Value,
    ) -> Self {
        Self::with_headers(model, api_key, base_url, max_tokens, temperature, vec![], driver_options)
    }

    /// Construct with extra static headers, used by the Copilot wrapper to
    /// inject `Editor-Version` / `Copilot-Integration-Id` and friends.
    pub fn with_headers(
        model: String,
        api_key: Option<String>,
        base_url: Option<String>,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
        extra_headers: Vec<(String, String)>,
        driver_options: serde_json::Value,
    ) -> Self {
        Self {
            model,
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com/v1".into()),
            max_output_tokens: max_tokens.unwrap_or(4096),
            temperature,
            extra_headers,
            driver_options,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl crate::ModelProvider for OpenAIResponsesProvider {
    fn name(&self) -> &str {
        "openai-responses"
    }
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn list_models(&self) -> anyhow::Result<Vec<ModelCatalogEntry>> {
        let mut entries: Vec<ModelCatalogEntry> = static_catalog()
            .into_iter()
            .filter(|e| e.provider == "openai-responses")
            .collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entries)
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        let key = self.api_key.as_deref().context("OPENAI_API_KEY not set")?;

        let input = build_responses_input(&req.messages);

        let mut body = json!({
            "model": self.model,
            "input": input,
            "stream": true,
            "store": false,
            "max_output_tokens": self.max_output_tokens,
        });

        if let Some(t) = self.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(cache_key) = &req.cache_key {
            body["prompt_cache_key"] = json!(cache_key);
        }
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
        if let Some(effort) = self.driver_options.get("reasoning_effort").and_then(|v| v.as_str())
        {
            if effort != "none" {
                body["reasoning"] = json!({ "effort": effort, "summary": "auto" });
                body["include"] = json!(["reasoning.encrypted_content"]);
            }
        }

        debug!(model = %self.model, "sending openai-responses request");

        let mut request_builder = self
            .client
            .post(format!("{}/responses", self.base_url.trim_end_matches('/')))
            .bearer_auth(key);
        for (k, v) in &self.extra_headers {
            request_builder = request_builder.header(k, v);
        }

        let resp = request_builder
            .json(&body)
            .send()
            .await
            .context("OpenAI Responses request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("OpenAI Responses error {status}: {text}");
        }

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
                let mut events = Vec::new();
                while let Some(pos) = buf.find('\n') {
                    let line = buf[..pos].trim_end_matches('\r').to_string();
                    buf.drain(..=pos);
                    if let Some(data) = line.strip_prefix("data: ") {
                        let data = data.trim();
                        if data == "[DONE]" {
                            continue;
                        }
                        if let Ok(v) = serde_json::from_str::<Value>(data) {
                            events.extend(state.handle_event(&v));
                        }
                    }
                }
                futures::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

/// Tracks in-flight tool calls and emits [`ResponseEvent`]s from decoded
/// Responses API SSE frames. One instance is scanned across the whole stream.
///
/// Shared with [`crate::chatgpt_responses`], which streams the same event
/// shapes from the ChatGPT backend's `/codex/responses` endpoint.
#[derive(Default)]
pub(crate) struct ResponsesState {
    tool_calls: HashMap<String, ToolCallAccum>,
    call_key_by_item_id: HashMap<String, String>,
    current_call_key: Option<String>,
    next_index: u32,
    /// `item.id` of the reasoning item currently streaming, so a later
    /// `.done` event can be matched back to it even though summary-text
    /// deltas don't carry an item id of their own.
    current_reasoning_item_id: Option<String>,
}

struct ToolCallAccum {
    index: u32,
    id: String,
    arguments: String,
}

impl ResponsesState {
    pub(crate) fn handle_event(&mut self, v: &Value) -> Vec<anyhow::Result<ResponseEvent>> {
        let event_type = v["type"].as_str().unwrap_or("");
        match event_type {
            "response.reasoning_summary_text.delta" | "response.reasoning_text.delta" => {
                let delta = v["delta"].as_str().unwrap_or("").to_string();
                vec![Ok(ResponseEvent::ThinkingDelta(delta, None))]
            }
            "response.output_text.delta" => {
                let delta = v["delta"].as_str().unwrap_or("").to_string();
                vec![Ok(ResponseEvent::TextDelta(delta))]
            }
            "response.output_item.added" => {
                let item = &v["item"];
                if item["type"].as_str() == Some("reasoning") {
                    let item_id = item["id"].as_str().unwrap_or("").to_string();
                    if !item_id.is_empty() {
                        self.current_reasoning_item_id = Some(item_id);
                    }
                    return vec![];
                }
                if item["type"].as_str() == Some("function_call") {
                    let item_id = item["id"].as_str().unwrap_or("").to_string();
                    let call_id = item["call_id"].as_str().unwrap_or("").to_string();
                    let name = item["name"].as_str().unwrap_or("").to_string();
                    let key = format!("{call_id}|{item_id}");
                    let index = self.next_index;
                    self.next_index += 1;
                    self.tool_calls.insert(
                        key.clone(),
                        ToolCallAccum { index, id: key.clone(), arguments: String::new() },
                    );
                    if !item_id.is_empty() {
                        self.call_key_by_item_id.insert(item_id, key.clone());
                    }
                    self.current_call_key = Some(key.clone());
                    return vec![Ok(ResponseEvent::ToolCall {
                        index,
                        id: key,
                        name,
                        arguments: String::new(),
                    })];
                }
                vec![]
            }
            "response.function_call_arguments.delta" => {
                let item_id = v["item_id"].as_str();
                let key = item_id
                    .and_then(|id| self.call_key_by_item_id.get(id).cloned())
                    .or_else(|| self.current_call_key.clone());
                let Some(key) = key else { return vec![] };
                let Some(call) = self.tool_calls.get_mut(&key) else { return vec![] };
                let delta = v["delta"].as_str().unwrap_or("").to_string();
                call.arguments.push_str(&delta);
                vec![Ok(ResponseEvent::ToolCall {
                    index: call.index,
                    id: call.id.clone(),
                    name: String::new(),
                    arguments: delta,
                })]
            }
            "response.function_call_arguments.done" => {
                let item_id = v["item_id"].as_str();
                let key = item_id
                    .and_then(|id| self.call_key_by_item_id.get(id).cloned())
                    .or_else(|| self.current_call_key.clone());
                let Some(key) = key else { return vec![] };
                let Some(final_args) = v["arguments"].as_str() else { return vec![] };
                let Some(call) = self.tool_calls.get_mut(&key) else { return vec![] };
                let missing = reconcile_arguments(&call.arguments, final_args);
                if missing.is_empty() {
                    return vec![];
                }
                call.arguments.push_str(&missing);
                vec![Ok(ResponseEvent::ToolCall {
                    index: call.index,
                    id: call.id.clone(),
                    name: String::new(),
                    arguments: missing,
                })]
            }
            "response.output_item.done" => {
                let item = &v["item"];
                if item["type"].as_str() == Some("reasoning") {
                    let item_id = item["id"]
                        .as_str()
                        .map(|s| s.to_string())
                        .or_else(|| self.current_reasoning_item_id.take())
                        .unwrap_or_default();
                    let encrypted = item["encrypted_content"].as_str().unwrap_or("").to_string();
                    if item_id.is_empty() && encrypted.is_empty() {
                        return vec![];
                    }
                    return vec![Ok(ResponseEvent::ThinkingDelta(
                        String::new(),
                        Some(format!("{item_id}|{encrypted}")),
                    ))];
                }
                if item["type"].as_str() != Some("function_call") {
                    return vec![];
                }
                let item_id = item["id"].as_str().unwrap_or("").to_string();
                let call_id = item["call_id"].as_str().unwrap_or("").to_string();
                let direct_key = format!("{call_id}|{item_id}");
                let key = if self.tool_calls.contains_key(&direct_key) {
                    Some(direct_key)
                } else if !item_id.is_empty() {
                    self.call_key_by_item_id.get(&item_id).cloned()
                } else {
                    self.current_call_key.clone()
                };
                let Some(key) = key else { return vec![] };
                let Some(final_args) = item["arguments"].as_str() else { return vec![] };
                let Some(call) = self.tool_calls.get_mut(&key) else { return vec![] };
                let missing = reconcile_arguments(&call.arguments, final_args);
                if missing.is_empty() {
                    return vec![];
                }
                call.arguments.push_str(&missing);
                vec![Ok(ResponseEvent::ToolCall {
                    index: call.index,
                    id: call.id.clone(),
                    name: String::new(),
                    arguments: missing,
                })]
            }
            "response.completed" | "response.done" => {
                let response = &v["response"];
                let mut out = Vec::new();
                if let Some(usage) = response.get("usage") {
                    let input_tokens = usage["input_tokens"].as_u64().unwrap_or(0) as u32;
                    let output_tokens = usage["output_tokens"].as_u64().unwrap_or(0) as u32;
                    let cache_read = usage["input_tokens_details"]["cached_tokens"]
                        .as_u64()
                        .unwrap_or(0) as u32;
                    out.push(Ok(ResponseEvent::Usage {
                        input_tokens,
                        output_tokens,
                        cache_read_tokens: cache_read,
                        cache_write_tokens: 0,
                    }));
                }
                let status = response["status"].as_str();
                let mut stop_reason = match status {
                    Some("completed") | None => StopReason::Stop,
                    Some("incomplete") => StopReason::Length,
                    Some("failed") | Some("cancelled") => StopReason::Error,
                    _ => StopReason::Stop,
                };
                if !self.tool_calls.is_empty() && stop_reason == StopReason::Stop {
                    stop_reason = StopReason::ToolUse;
                }
                out.push(Ok(ResponseEvent::Done(stop_reason)));
                out
            }
            "error" => {
                let code = v["code"].as_str().unwrap_or("");
                let message = v["message"].as_str().unwrap_or("");
                vec![Ok(ResponseEvent::Error(format!("Error Code {code}: {message}")))]
            }
            "response.failed" => {
                vec![Ok(ResponseEvent::Error("Response failed".to_string()))]
            }
            _ => vec![],
        }
    }
}

/// Compute the suffix of `final_args` not already covered by `current`.
///
/// When `final_args` is not an extension of `current` (the provider sent a
/// corrected, non-prefix-compatible value) the whole string is treated as
/// missing so the accumulated arguments stay in sync with what the provider
/// considers final.
fn reconcile_arguments(current: &str, final_args: &str) -> String {
    if let Some(missing) = final_args.strip_prefix(current) {
        missing.to_string()
    } else if final_args != current {
        final_args.to_string()
    } else {
        String::new()
    }
}

pub(crate) fn build_responses_input(messages: &[Message]) -> Vec<Value> {
    let mut out = Vec::new();
    for m in messages {
        match m.role {
            Role::System => {
                if let Some(t) = m.as_text() {
                    out.push(json!({ "role": "developer", "content": sanitize_surrogates(t) }));
                }
            }
            Role::User => match &m.content {
                MessageContent::Text(t) => {
                    out.push(json!({
                        "role": "user",
                        "content": [{ "type": "input_text", "text": sanitize_surrogates(t) }],
                    }));
                }
                MessageContent::ContentParts(parts) => {
                    let content: Vec<Value> = parts
                        .iter()
                        .map(|p| match p {
                            ContentPart::Text { text } => {
                                json!({ "type": "input_text", "text": sanitize_surrogates(text) })
                            }
                            ContentPart::Image { image_url, .. } => {
                                json!({
                                    "type": "input_image",
                                    "detail": "auto",
                                    "image_url": image_url,
                                })
                            }
                        })
                        .collect();
                    out.push(json!({ "role": "user", "content": content }));
                }
                _ => {}
            },
            Role::Assistant => match &m.content {
                MessageContent::Text(t) => {
                    out.push(json!({
                        "type": "message",
                        "role": "assistant",
                        "status": "completed",
                        "content": [{ "type": "output_text", "text": t, "annotations": [] }],
                    }));
                }
                MessageContent::ContentParts(parts) => {
                    for p in parts {
                        if let ContentPart::Thinking { text, signature } = p {
                            let (item_id, encrypted_content) = match signature.split_once('|') {
                                Some((id, enc)) => (id, enc),
                                None => ("", signature.as_str()),
                            };
                            if item_id.is_empty() && encrypted_content.is_empty() {
                                continue;
                            }
                            let summary = if text.is_empty() {
                                json!([])
                            } else {
                                json!([{ "type": "summary_text", "text": text }])
                            };
                            out.push(json!({
                                "type": "reasoning",
                                "id": item_id,
                                "encrypted_content": encrypted_content,
                                "summary": summary,
                            }));
                        }
                    }
                }
                MessageContent::ToolCall { tool_call_id, function } => {
                    let (call_id, item_id) = match tool_call_id.split_once('|') {
                        Some((c, i)) => (c.to_string(), Some(i.to_string())),
                        None => (tool_call_id.clone(), None),
                    };
                    out.push(json!({
                        "type": "function_call",
                        "id": item_id,
                        "call_id": call_id,
                        "name": function.name,
                        "arguments": function.arguments,
                    }));
                }
                _ => {}
            },
            Role::Tool => {
                if let MessageContent::ToolResult { tool_call_id, content } = &m.content {
                    let call_id = tool_call_id.split('|').next().unwrap_or(tool_call_id).to_string();
                    let text = match content {
                        ToolResultContent::Text(t) if !t.is_empty() => t.clone(),
                        ToolResultContent::Text(_) => "(see attached)".to_string(),
                        ToolResultContent::Parts(parts) => {
                            let joined = content.to_string();
                            if joined.is_empty() && !parts.is_empty() {
                                "(see attached)".to_string()
                            } else {
                                joined
                            }
                        }
                    };
                    out.push(json!({
                        "type": "function_call_output",
                        "call_id": call_id,
                        "output": text,
                    }));
                    for img in content.image_urls() {
                        out.push(json!({
                            "role": "user",
                            "content": [
                                { "type": "input_text", "text": "Attached image(s) from tool result:" },
                                { "type": "input_image", "detail": "auto", "image_url": img },
                            ],
                        }));
                    }
                }
            }
        }
    }
    out
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FunctionCall;

    #[test]
    fn system_message_becomes_developer_role() {
        let input = build_responses_input(&[Message::system("be helpful")]);
        assert_eq!(input[0]["role"], "developer");
        assert_eq!(input[0]["content"], "be helpful");
    }

    #[test]
    fn user_text_wraps_in_input_text_part() {
        let input = build_responses_input(&[Message::user("hi")]);
        assert_eq!(input[0]["role"], "user");
        assert_eq!(input[0]["content"][0]["type"], "input_text");
        assert_eq!(input[0]["content"][0]["text"], "hi");
    }

    #[test]
    fn assistant_tool_call_splits_composite_id() {
        let msg = Message {
            role: Role::Assistant,
            content: MessageContent::ToolCall {
                tool_call_id: "call_1|item_2".into(),
                function: FunctionCall { name: "read_file".into(), arguments: "{}".into() },
            },
        };
        let input = build_responses_input(&[msg]);
        assert_eq!(input[0]["type"], "function_call");
        assert_eq!(input[0]["call_id"], "call_1");
        assert_eq!(input[0]["id"], "item_2");
    }

    #[test]
    fn tool_result_becomes_function_call_output() {
        let msg = Message::tool_result("call_1", "42");
        let input = build_responses_input(&[msg]);
        assert_eq!(input[0]["type"], "function_call_output");
        assert_eq!(input[0]["call_id"], "call_1");
        assert_eq!(input[0]["output"], "42");
    }

    #[test]
    fn assistant_thinking_part_becomes_reasoning_item() {
        use crate::{ContentPart, Message, MessageContent, Role};
        let msg = Message {
            role: Role::Assistant,
            content: MessageContent::ContentParts(vec![ContentPart::Thinking {
                text: "weighing the options".into(),
                signature: "item_9|ZW5jcnlwdGVk".into(),
            }]),
        };
        let input = build_responses_input(&[msg]);
        assert_eq!(input[0]["type"], "reasoning");
        assert_eq!(input[0]["id"], "item_9");
        assert_eq!(input[0]["encrypted_content"], "ZW5jcnlwdGVk");
        assert_eq!(input[0]["summary"][0]["text"], "weighing the options");
    }

    #[test]
    fn assistant_thinking_part_with_no_signature_is_skipped() {
        use crate::{ContentPart, Message, MessageContent, Role};
        let msg = Message {
            role: Role::Assistant,
            content: MessageContent::ContentParts(vec![ContentPart::Thinking {
                text: "local model reasoning".into(),
                signature: String::new(),
            }]),
        };
        let input = build_responses_input(&[msg]);
        assert!(input.is_empty());
    }

    #[test]
    fn handle_event_reasoning_item_added_then_done_emits_signature() {
        let mut state = ResponsesState::default();
        let added = state.handle_event(&json!({
            "type": "response.output_item.added",
            "item": { "type": "reasoning", "id": "rs_1" }
        }));
        assert!(added.is_empty());

        let done = state.handle_event(&json!({
            "type": "response.output_item.done",
            "item": {
                "type": "reasoning",
                "id": "rs_1",
                "encrypted_content": "ZW5jcnlwdGVk",
                "summary": [{ "type": "summary_text", "text": "thought about it" }]
            }
        }));
        assert_eq!(done.len(), 1);
        match done.into_iter().next().unwrap().unwrap() {
            ResponseEvent::ThinkingDelta(text, Some(sig)) => {
                assert!(text.is_empty());
                assert_eq!(sig, "rs_1|ZW5jcnlwdGVk");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn reconcile_arguments_prefix_extension() {
        assert_eq!(reconcile_arguments("{\"a\":1", "{\"a\":1}"), "}");
    }

    #[test]
    fn reconcile_arguments_identical_yields_nothing_missing() {
        assert_eq!(reconcile_arguments("{}", "{}"), "");
    }

    #[test]
    fn reconcile_arguments_non_prefix_replaces_whole_value() {
        assert_eq!(reconcile_arguments("{\"a\":1}", "{\"b\":2}"), "{\"b\":2}");
    }

    #[test]
    fn handle_event_output_item_added_emits_tool_call_start() {
        let mut state = ResponsesState::default();
        let ev = json!({
            "type": "response.output_item.added",
            "item": { "type": "function_call", "id": "item_1", "call_id": "call_1", "name": "ls", "arguments": "" }
        });
        let events = state.handle_event(&ev);
        assert_eq!(events.len(), 1);
        match events.into_iter().next().unwrap().unwrap() {
            ResponseEvent::ToolCall { index, name, .. } => {
                assert_eq!(index, 0);
                assert_eq!(name, "ls");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn handle_event_completed_with_tool_calls_yields_tool_use_stop_reason() {
        let mut state = ResponsesState::default();
        state.handle_event(&json!({
            "type": "response.output_item.added",
            "item": { "type": "function_call", "id": "item_1", "call_id": "call_1", "name": "ls", "arguments": "" }
        }));
        let events = state.handle_event(&json!({
            "type": "response.completed",
            "response": { "status": "completed", "usage": { "input_tokens": 10, "output_tokens": 5 } }
        }));
        let done = events.into_iter().find_map(|e| match e.ok()? {
            ResponseEvent::Done(reason) => Some(reason),
            _ => None,
        });
        assert_eq!(done, Some(StopReason::ToolUse));
    }

    #[test]
    fn handle_event_incomplete_status_maps_to_length() {
        let mut state = ResponsesState::default();
        let events = state.handle_event(&json!({
            "type": "response.done",
            "response": { "status": "incomplete" }
        }));
        let done = events.into_iter().find_map(|e| match e.ok()? {
            ResponseEvent::Done(reason) => Some(reason),
            _ => None,
        });
        assert_eq!(done, Some(StopReason::Length));
    }
}
