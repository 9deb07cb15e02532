// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! GitHub Copilot device-code OAuth flow.
//!
//! Exchanges a long-lived GitHub OAuth token (obtained via the device-code
//! flow) for short-lived Copilot API tokens, and implements
//! [`sven_model::copilot::CopilotTokenSource`] so the model layer can pull a
//! fresh token on every request without knowing how it is obtained.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use sven_model::copilot::{base_url_from_token, CopilotTokenSource, COPILOT_HEADERS};

use crate::error::{AuthError, Result};
use crate::store::CredentialStore;

/// GitHub OAuth client id used by VS Code's Copilot extension. Stored
/// base64-obfuscated rather than as a plaintext literal.
const CLIENT_ID_B64: &str = "SXYxLmI1MDdhMDhjODdlY2ZlOTg=";

/// Subtracted from the Copilot-reported `expires_at` (seconds) once
/// converted to milliseconds, so a refresh is triggered slightly early.
const REFRESH_SAFETY_MARGIN_MS: i64 = 5 * 60 * 1000;

fn client_id() -> String {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(CLIENT_ID_B64)
        .expect("CLIENT_ID_B64 is a fixed, valid base64 literal");
    String::from_utf8(bytes).expect("decoded client id is valid UTF-8")
}

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as i64
}

/// Persisted Copilot credentials (`<config>/copilot_auth.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopilotCredentials {
    /// Long-lived GitHub OAuth token; used to refresh the Copilot token.
    pub github_token: String,
    /// Short-lived Copilot API token.
    pub copilot_token: String,
    /// Unix epoch milliseconds, already adjusted by the safety margin.
    pub expires_at: i64,
    pub enterprise_domain: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeviceCodeResponse {
    device_code: String,
    user_code: String,
    verification_uri: String,
    interval: u64,
    expires_in: u64,
}

fn apply_copilot_headers(mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
    for (name, value) in COPILOT_HEADERS {
        req = req.header(*name, *value);
    }
    req
}

async fn start_device_flow(client: &reqwest::Client, domain: &str) -> Result<DeviceCodeResponse> {
    let url = format!("https://{domain}/login/device/code");
    let resp = client
        .post(&url)
        .header("Accept", "application/json")
        .header("User-Agent", "GitHubCopilotChat/0.35.0")
        .json(&serde_json::json!({ "client_id": client_id(), "scope": "read:user" }))
        .send()
        .await?
        .error_for_status()?;
    Ok(resp.json().await?)
}

async fn poll_for_github_token(
    client: &reqwest::Client,
    domain: &str,
    device_code: &str,
    interval_s: u64,
    expires_in_s: u64,
    on_poll: &(dyn Fn() + Send + Sync),
) -> Result<String> {
    let url = format!("https://{domain}/login/oauth/access_token");
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(expires_in_s);
    let mut interval = interval_s.max(1);

    while tokio::time::Instant::now() < deadline {
        on_poll();

        let resp: serde_json::Value = client
            .post(&url)
            .header("Accept", "application/json")
            .header("User-Agent", "GitHubCopilotChat/0.35.0")
            .json(&serde_json::json!({
                "client_id": client_id(),
                "device_code": device_code,
                "grant_type": "urn:ietf:params:oauth:grant-type:device_code",
            }))
            .send()
            .await?
            .json()
            .await?;

        if let Some(token) = resp.get("access_token").and_then(|v| v.as_str()) {
            return Ok(token.to_string());
        }

        match resp.get("error").and_then(|v| v.as_str()) {
            Some("authorization_pending") => {
                tokio::time::sleep(std::time::Duration::from_secs(interval)).await;
            }
            Some("slow_down") => {
                interval += 5;
                tokio::time::sleep(std::time::Duration::from_secs(interval)).await;
            }
            Some("expired_token") => return Err(AuthError::DeviceFlowTimedOut),
            other => return Err(AuthError::DeviceFlowError(other.unwrap_or("unknown").to_string())),
        }
    }
    Err(AuthError::DeviceFlowTimedOut)
}

async fn exchange_for_copilot_token(client: &reqwest::Client, github_token: &str) -> Result<(String, i64)> {
    let req = client
        .get("https://api.github.com/copilot_internal/v2/token")
        .header("Accept", "application/json")
        .header("Authorization", format!("Bearer {github_token}"));
    let resp = apply_copilot_headers(req).send().await?;

    if resp.status().as_u16() == 401 {
        return Err(AuthError::SubscriptionMissing);
    }
    let resp = resp.error_for_status()?;
    let data: serde_json::Value = resp.json().await?;

    let token = data
        .get("token")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AuthError::MalformedResponse("copilot token response missing `token`".into()))?
        .to_string();
    let expires_at_s = data
        .get("expires_at")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| AuthError::MalformedResponse("copilot token response missing `expires_at`".into()))?;

    Ok((token, expires_at_s * 1000 - REFRESH_SAFETY_MARGIN_MS))
}

async fn refresh_copilot_token(client: &reqwest::Client, creds: &CopilotCredentials) -> Result<CopilotCredentials> {
    let (copilot_token, expires_at) = exchange_for_copilot_token(client, &creds.github_token).await?;
    Ok(CopilotCredentials {
        github_token: creds.github_token.clone(),
        copilot_token,
        expires_at,
        enterprise_domain: creds.enterprise_domain.clone(),
    })
}

/// Best-effort: enable every catalog model tagged for a Copilot-proxied
/// provider. Some models require this policy acceptance before they can be
/// used. Failures are swallowed; the login itself has already succeeded.
async fn enable_all_copilot_models(client: &reqwest::Client, token: &str, enterprise_domain: Option<&str>) {
    let base_url = base_url_from_token(token, enterprise_domain);
    let models: Vec<_> = sven_model::catalog::static_catalog()
        .into_iter()
        .filter(|m| m.provider.starts_with("github-copilot"))
        .collect();

    let mut tasks = Vec::with_capacity(models.len());
    for model in models {
        let client = client.clone();
        let base_url = base_url.clone();
        let token = token.to_string();
        tasks.push(tokio::spawn(async move {
            let url = format!("{base_url}/models/{}/policy", model.id);
            let req = client
                .post(&url)
                .header("Content-Type", "application/json")
                .header("Authorization", format!("Bearer {token}"))
                .header("openai-intent", "chat-policy")
                .header("x-interaction-type", "chat-policy");
            let result = apply_copilot_headers(req)
                .json(&serde_json::json!({ "state": "enabled" }))
                .send()
                .await;
            if let Err(e) = result {
                warn!(model = %model.id, error = %e, "failed to enable copilot model policy");
            }
        }));
    }
    for task in tasks {
        let _ = task.await;
    }
}

/// Information the caller should present to the user while the device flow
/// is waiting for authorization.
#[derive(Debug, Clone)]
pub struct DeviceCodePrompt {
    pub verification_uri: String,
    pub user_code: String,
}

/// Drives the Copilot device-code flow and exposes a refreshing
/// [`CopilotTokenSource`] over the persisted credentials.
pub struct CopilotAuth {
    client: reqwest::Client,
    store: Arc<dyn CredentialStore<CopilotCredentials>>,
    enterprise_domain: Option<String>,
}

impl CopilotAuth {
    pub fn new(store: Arc<dyn CredentialStore<CopilotCredentials>>, enterprise_domain: Option<String>) -> Self {
        Self { client: reqwest::Client::new(), store, enterprise_domain }
    }

    /// Run the full device-code login flow, calling `on_prompt` once the
    /// user needs to visit a URL and enter a code. Persists and returns the
    /// resulting credentials.
    pub async fn login(&self, on_prompt: impl Fn(DeviceCodePrompt) + Send + Sync) -> Result<CopilotCredentials> {
        let domain = self.enterprise_domain.clone().unwrap_or_else(|| "github.com".to_string());
        let device = start_device_flow(&self.client, &domain).await?;

        on_prompt(DeviceCodePrompt {
            verification_uri: device.verification_uri.clone(),
            user_code: device.user_code.clone(),
        });

        let github_token = poll_for_github_token(
            &self.client,
            &domain,
            &device.device_code,
            device.interval,
            device.expires_in,
            &|| debug!("polling for github device-code authorization"),
        )
        .await?;

        let (copilot_token, expires_at) = exchange_for_copilot_token(&self.client, &github_token).await?;
        let creds = CopilotCredentials {
            github_token,
            copilot_token: copilot_token.clone(),
            expires_at,
            enterprise_domain: self.enterprise_domain.clone(),
        };
        self.store.save(&creds).await?;

        enable_all_copilot_models(&self.client, &copilot_token, self.enterprise_domain.as_deref()).await;

        Ok(creds)
    }

    async fn refreshed(&self) -> Result<CopilotCredentials> {
        let creds = self.store.load().await.ok_or(AuthError::NotLoggedIn)?;
        if now_ms() + 60_000 < creds.expires_at {
            return Ok(creds);
        }
        match refresh_copilot_token(&self.client, &creds).await {
            Ok(refreshed) => {
                self.store.save(&refreshed).await?;
                Ok(refreshed)
            }
            Err(_) => Err(AuthError::NotLoggedIn),
        }
    }

    pub async fn logout(&self) -> Result<()> {
        self.store.clear().await
    }
}

#[async_trait]
impl CopilotTokenSource for CopilotAuth {
    async fn valid_token(&self) -> anyhow::Result<String> {
        Ok(self.refreshed().await?.copilot_token)
    }

    fn enterprise_domain(&self) -> Option<&str> {
        self.enterprise_domain.as_deref()
    }
}
