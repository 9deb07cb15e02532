// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! GitHub Copilot driver wrappers.
//!
//! Copilot proxies three distinct wire protocols (Chat Completions, Responses,
//! Anthropic Messages) behind the same OAuth device-flow credential. None of
//! these wrappers know how to obtain or refresh that credential — they accept
//! a [`CopilotTokenSource`] (implemented by `sven-auth`) and call it before
//! every request, mirroring the upstream client's "rebuild the HTTP client
//! per call" approach so a refreshed token always takes effect immediately.

use async_trait::async_trait;

use crate::{
    anthropic::AnthropicProvider,
    catalog::ModelCatalogEntry,
    openai::OpenAiProvider,
    openai_compat::AuthStyle,
    provider::ResponseStream,
    responses::OpenAIResponsesProvider,
    CompletionRequest, Message, Role,
};

/// Static headers Copilot requires on every request, identifying this client
/// as a compatible editor integration.
pub const COPILOT_HEADERS: &[(&str, &str)] = &[
    ("User-Agent", "GitHubCopilotChat/0.35.0"),
    ("Editor-Version", "vscode/1.107.0"),
    ("Editor-Plugin-Version", "copilot-chat/0.35.0"),
    ("Copilot-Integration-Id", "vscode-chat"),
];

/// Supplies a currently-valid Copilot access token, refreshing it as needed.
///
/// Implemented by `sven-auth`'s device-flow credential store. Kept as a
/// trait here (rather than a direct dependency) so `sven-model` never has to
/// know how OAuth tokens are obtained or persisted.
#[async_trait]
pub trait CopilotTokenSource: Send + Sync {
    /// Returns a valid (non-expired) Copilot API token, refreshing first if
    /// the cached one has expired.
    async fn valid_token(&self) -> anyhow::Result<String>;

    /// GitHub Enterprise domain, if this account authenticated against one.
    fn enterprise_domain(&self) -> Option<&str> {
        None
    }
}

/// Extract the API host Copilot embeds in the token itself.
///
/// Token format: `tid=...;exp=...;proxy-ep=proxy.individual.githubcopilot.com;...`.
/// The `proxy-ep` segment names the streaming proxy host; the matching REST
/// API host is the same name with `proxy.` replaced by `api.`.
pub fn base_url_from_token(token: &str, enterprise_domain: Option<&str>) -> String {
    for segment in token.split(';') {
        if let Some(proxy_host) = segment.strip_prefix("proxy-ep=") {
            let api_host = proxy_host.replacen("proxy.", "api.", 1);
            return format!("https://{api_host}");
        }
    }
    match enterprise_domain {
        Some(domain) => format!("https://copilot-api.{domain}"),
        None => "https://api.individual.githubcopilot.com".to_string(),
    }
}

/// `X-Initiator`: `"user"` when the turn is a direct user message, `"agent"`
/// when it follows assistant/tool activity (a continuation the agent itself
/// initiated).
fn infer_initiator(messages: &[Message]) -> &'static str {
    match messages.last() {
        Some(m) if m.role == Role::User => "user",
        Some(_) => "agent",
        None => "user",
    }
}

fn has_vision_input(messages: &[Message]) -> bool {
    messages
        .iter()
        .filter(|m| m.role == Role::User || m.role == Role::Tool)
        .any(|m| !m.image_urls().is_empty())
}

/// Per-request headers that depend on the conversation so far.
fn build_dynamic_headers(messages: &[Message]) -> Vec<(String, String)> {
    let mut headers = vec![
        ("X-Initiator".to_string(), infer_initiator(messages).to_string()),
        ("Openai-Intent".to_string(), "conversation-edits".to_string()),
    ];
    if has_vision_input(messages) {
        headers.push(("Copilot-Vision-Request".to_string(), "true".to_string()));
    }
    headers
}

fn static_headers() -> Vec<(String, String)> {
    COPILOT_HEADERS.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

// ─── Chat Completions ─────────────────────────────────────────────────────────

/// Copilot-proxied Chat Completions models.
pub struct CopilotProvider {
    model: String,
    tokens: Box<dyn CopilotTokenSource>,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    driver_options: serde_json::Value,
}

impl CopilotProvider {
    pub fn new(
        model: String,
        tokens: Box<dyn CopilotTokenSource>,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
        driver_options: serde_json::Value,
    ) -> Self {
        Self { model, tokens, max_tokens, temperature, driver_options }
    }
}

#[async_trait]
impl crate::ModelProvider for CopilotProvider {
    fn name(&self) -> &str {
        "github-copilot"
    }
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn list_models(&self) -> anyhow::Result<Vec<ModelCatalogEntry>> {
        Ok(crate::catalog::static_catalog()
            .into_iter()
            .filter(|e| e.provider == "github-copilot")
            .collect())
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        let token = self.tokens.valid_token().await?;
        let base_url = base_url_from_token(&token, self.tokens.enterprise_domain());
        let mut headers = static_headers();
        headers.extend(build_dynamic_headers(&req.messages));

        let inner = OpenAiProvider::with_headers(
            self.model.clone(),
            Some(token),
            Some(base_url),
            self.max_tokens,
            self.temperature,
            headers,
            self.driver_options.clone(),
        );
        crate::ModelProvider::complete(&inner, req).await
    }
}

// ─── Responses ────────────────────────────────────────────────────────────────

/// Copilot-proxied Responses-API models (GPT-5 / Codex family).
pub struct CopilotResponsesProvider {
    model: String,
    tokens: Box<dyn CopilotTokenSource>,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    driver_options: serde_json::Value,
}

impl CopilotResponsesProvider {
    pub fn new(
        model: String,
        tokens: Box<dyn CopilotTokenSource>,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
        driver_options: serde_json::Value,
    ) -> Self {
        Self { model, tokens, max_tokens, temperature, driver_options }
    }
}

#[async_trait]
impl crate::ModelProvider for CopilotResponsesProvider {
    fn name(&self) -> &str {
        "github-copilot-responses"
    }
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn list_models(&self) -> anyhow::Result<Vec<ModelCatalogEntry>> {
        Ok(crate::catalog::static_catalog()
            .into_iter()
            .filter(|e| e.provider == "github-copilot-responses")
            .collect())
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        let token = self.tokens.valid_token().await?;
        let base_url = base_url_from_token(&token, self.tokens.enterprise_domain());
        let mut headers = static_headers();
        headers.extend(build_dynamic_headers(&req.messages));

        let inner = OpenAIResponsesProvider::with_headers(
            self.model.clone(),
            Some(token),
            Some(base_url),
            self.max_tokens,
            self.temperature,
            headers,
            self.driver_options.clone(),
        );
        crate::ModelProvider::complete(&inner, req).await
    }
}

// ─── Anthropic ────────────────────────────────────────────────────────────────

/// Copilot-proxied Claude models over the Anthropic Messages wire format.
pub struct CopilotAnthropicProvider {
    model: String,
    tokens: Box<dyn CopilotTokenSource>,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
}

impl CopilotAnthropicProvider {
    pub fn new(
        model: String,
        tokens: Box<dyn CopilotTokenSource>,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
    ) -> Self {
        Self { model, tokens, max_tokens, temperature }
    }
}

#[async_trait]
impl crate::ModelProvider for CopilotAnthropicProvider {
    fn name(&self) -> &str {
        "github-copilot-anthropic"
    }
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn list_models(&self) -> anyhow::Result<Vec<ModelCatalogEntry>> {
        Ok(crate::catalog::static_catalog()
            .into_iter()
            .filter(|e| e.provider == "github-copilot-anthropic")
            .collect())
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        let token = self.tokens.valid_token().await?;
        let base_url = base_url_from_token(&token, self.tokens.enterprise_domain());

        // AnthropicProvider doesn't expose an extra-headers hook (Anthropic's
        // wire format needs no dynamic per-turn headers beyond what Copilot
        // itself requires), so the interleaved-thinking beta is always sent;
        // Copilot ignores it for models that don't support it.
        let inner = AnthropicProvider::with_cache(
            self.model.clone(),
            Some(token),
            Some(base_url),
            self.max_tokens,
            self.temperature,
            true,
            false,
            false,
            false,
            false,
            false,
        );
        crate::ModelProvider::complete(&inner, req).await
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
