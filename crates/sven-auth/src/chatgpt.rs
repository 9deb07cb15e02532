// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! ChatGPT PKCE + loopback OAuth flow.
//!
//! Obtains a refresh/access token pair for the ChatGPT backend-api by
//! running an authorization-code-with-PKCE exchange through a short-lived
//! local HTTP server listening on the official Codex CLI redirect URI.
//! Users without a browser reachable to the loopback port can instead paste
//! the callback URL (or just the `code`/`state` pair) back in.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::warn;

use sven_model::ChatGptCredentials;

use crate::error::{AuthError, Result};
use crate::store::CredentialStore;

const CLIENT_ID: &str = "app_EMoamEEZ73f0CkXaXp7hrann";
const AUTHORIZE_URL: &str = "https://auth.openai.com/oauth/authorize";
const TOKEN_URL: &str = "https://auth.openai.com/oauth/token";
const REDIRECT_URI: &str = "http://localhost:1455/auth/callback";
const SCOPE: &str = "openid profile email offline_access";
const CALLBACK_PORT: u16 = 1455;
const FLOW_TIMEOUT_SECS: u64 = 300;

const SUCCESS_HTML: &str = "<html><body><h1>Signed in</h1><p>You may close this tab and return to the terminal.</p></body></html>";

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as i64
}

fn b64url_no_pad(bytes: &[u8]) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Persisted ChatGPT credentials (`<config>/openai_auth.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredChatGptCredentials {
    pub refresh: String,
    pub access: String,
    /// Unix epoch milliseconds.
    pub expires: i64,
    pub account_id: String,
}

impl From<&StoredChatGptCredentials> for ChatGptCredentials {
    fn from(creds: &StoredChatGptCredentials) -> Self {
        ChatGptCredentials { access_token: creds.access.clone(), account_id: creds.account_id.clone() }
    }
}

struct Pkce {
    verifier: String,
    challenge: String,
}

fn generate_pkce() -> Pkce {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    let verifier = b64url_no_pad(&bytes);
    let challenge = b64url_no_pad(&Sha256::digest(verifier.as_bytes()));
    Pkce { verifier, challenge }
}

fn generate_state() -> String {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn build_authorize_url(pkce: &Pkce, state: &str) -> String {
    let params = [
        ("response_type", "code"),
        ("client_id", CLIENT_ID),
        ("redirect_uri", REDIRECT_URI),
        ("scope", SCOPE),
        ("code_challenge", pkce.challenge.as_str()),
        ("code_challenge_method", "S256"),
        ("state", state),
        ("id_token_add_organizations", "true"),
        ("codex_cli_simplified_flow", "true"),
        ("originator", "sven_cli"),
    ];
    let query: Vec<String> =
        params.iter().map(|(k, v)| format!("{k}={}", urlencode(v))).collect();
    format!("{AUTHORIZE_URL}?{}", query.join("&"))
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(b as char),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

/// Splits a `key=value&key=value` query string into pairs, tolerating a
/// leading `?`.
fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .trim_start_matches('?')
        .split('&')
        .filter(|kv| !kv.is_empty())
        .filter_map(|kv| {
            let mut parts = kv.splitn(2, '=');
            let k = parts.next()?;
            let v = parts.next().unwrap_or("");
            Some((urldecode(k), urldecode(v)))
        })
        .collect()
}

fn urldecode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                if let Ok(byte) = u8::from_str_radix(&s[i + 1..i + 3], 16) {
                    out.push(byte);
                    i += 3;
                    continue;
                }
                out.push(bytes[i]);
                i += 1;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Decodes a JWT's payload segment without verifying its signature, then
/// extracts the ChatGPT account id carried under the OpenAI auth claim.
fn extract_account_id(id_token: &str) -> Option<String> {
    let payload_b64 = id_token.split('.').nth(1)?;
    let mut padded = payload_b64.to_string();
    while padded.len() % 4 != 0 {
        padded.push('=');
    }
    let bytes = base64::engine::general_purpose::URL_SAFE.decode(padded).ok()?;
    let payload: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    payload
        .get("https://api.openai.com/auth")?
        .get("chatgpt_account_id")?
        .as_str()
        .map(str::to_string)
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    id_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

async fn exchange_code_for_tokens(client: &reqwest::Client, code: &str, verifier: &str) -> Result<StoredChatGptCredentials> {
    let resp: TokenResponse = client
        .post(TOKEN_URL)
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", REDIRECT_URI),
            ("client_id", CLIENT_ID),
            ("code_verifier", verifier),
        ])
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    let account_id = resp
        .id_token
        .as_deref()
        .and_then(extract_account_id)
        .ok_or_else(|| AuthError::MalformedResponse("id_token missing chatgpt_account_id claim".into()))?;
    let refresh = resp
        .refresh_token
        .ok_or_else(|| AuthError::MalformedResponse("token response missing refresh_token".into()))?;
    let expires = now_ms() + resp.expires_in.unwrap_or(3600) * 1000;

    Ok(StoredChatGptCredentials { refresh, access: resp.access_token, expires, account_id })
}

async fn refresh_openai_token(client: &reqwest::Client, creds: &StoredChatGptCredentials) -> Result<StoredChatGptCredentials> {
    let resp: TokenResponse = client
        .post(TOKEN_URL)
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", creds.refresh.as_str()),
            ("client_id", CLIENT_ID),
        ])
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    let account_id = resp.id_token.as_deref().and_then(extract_account_id).unwrap_or_else(|| creds.account_id.clone());
    let refresh = resp.refresh_token.unwrap_or_else(|| creds.refresh.clone());
    let expires = now_ms() + resp.expires_in.unwrap_or(3600) * 1000;

    Ok(StoredChatGptCredentials { refresh, access: resp.access_token, expires, account_id })
}

/// Parses a manually-pasted callback value: a full callback URL, a bare
/// `code#state` pair, or a bare code with no state at all.
fn parse_manual_input(input: &str) -> (String, Option<String>) {
    let input = input.trim();
    if let Some(query_start) = input.find('?') {
        let pairs = parse_query(&input[query_start + 1..]);
        let code = pairs.iter().find(|(k, _)| k == "code").map(|(_, v)| v.clone());
        let state = pairs.iter().find(|(k, _)| k == "state").map(|(_, v)| v.clone());
        if let Some(code) = code {
            return (code, state);
        }
    }
    if let Some((code, state)) = input.split_once('#') {
        return (code.to_string(), Some(state.to_string()));
    }
    (input.to_string(), None)
}

async fn handle_callback_connection(mut stream: tokio::net::TcpStream, expected_state: &str) -> Option<(String, String)> {
    let mut buf = [0u8; 4096];
    let n = stream.read(&mut buf).await.ok()?;
    let request = String::from_utf8_lossy(&buf[..n]);
    let request_line = request.lines().next()?;
    let mut parts = request_line.split_whitespace();
    parts.next();
    let target = parts.next()?;

    let (code, state) = target
        .find('?')
        .map(|i| parse_query(&target[i + 1..]))
        .map(|pairs| {
            let code = pairs.iter().find(|(k, _)| k == "code").map(|(_, v)| v.clone());
            let state = pairs.iter().find(|(k, _)| k == "state").map(|(_, v)| v.clone());
            (code, state)
        })
        .unwrap_or((None, None));

    let (body, status) = match (&code, &state) {
        (Some(_), Some(s)) if s == expected_state => (SUCCESS_HTML, "200 OK"),
        (Some(_), Some(_)) => ("state mismatch", "400 Bad Request"),
        _ => ("missing code", "404 Not Found"),
    };
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let _ = stream.write_all(response.as_bytes()).await;

    match (code, state) {
        (Some(code), Some(state)) if state == expected_state => Some((code, state)),
        _ => None,
    }
}

/// Listens on the Codex CLI loopback redirect port for a single successful
/// callback matching `expected_state`. Returns `None` if the port could not
/// be bound (caller should fall back to manual paste only).
async fn run_callback_server(expected_state: String, tx: oneshot::Sender<String>) -> bool {
    let listener = match TcpListener::bind(("127.0.0.1", CALLBACK_PORT)).await {
        Ok(listener) => listener,
        Err(e) => {
            warn!(error = %e, "failed to bind chatgpt oauth loopback port, falling back to manual paste");
            return false;
        }
    };

    tokio::spawn(async move {
        let mut tx = Some(tx);
        loop {
            let Ok((stream, _)) = listener.accept().await else { break };
            if let Some((code, _)) = handle_callback_connection(stream, &expected_state).await {
                if let Some(tx) = tx.take() {
                    let _ = tx.send(code);
                }
                break;
            }
        }
    });
    true
}

/// Drives the ChatGPT PKCE + loopback login flow and exposes a refreshing
/// accessor for the resulting credentials.
pub struct ChatGptAuth {
    client: reqwest::Client,
    store: Arc<dyn CredentialStore<StoredChatGptCredentials>>,
}

impl ChatGptAuth {
    pub fn new(store: Arc<dyn CredentialStore<StoredChatGptCredentials>>) -> Self {
        Self { client: reqwest::Client::new(), store }
    }

    /// Runs the full login flow. `on_authorize_url` is called with the URL
    /// the user should open in a browser; `manual_input` yields a pasted
    /// callback value if the user provides one before the loopback server
    /// receives a request.
    pub async fn login(
        &self,
        on_authorize_url: impl Fn(&str) + Send,
        mut manual_input: oneshot::Receiver<String>,
    ) -> Result<StoredChatGptCredentials> {
        let pkce = generate_pkce();
        let state = generate_state();
        let authorize_url = build_authorize_url(&pkce, &state);
        on_authorize_url(&authorize_url);

        let (server_tx, mut server_rx) = oneshot::channel();
        let server_bound = run_callback_server(state.clone(), server_tx).await;

        let code = tokio::time::timeout(Duration::from_secs(FLOW_TIMEOUT_SECS), async {
            loop {
                tokio::select! {
                    code = &mut server_rx, if server_bound => {
                        if let Ok(code) = code {
                            return Ok(code);
                        }
                    }
                    input = &mut manual_input => {
                        if let Ok(raw) = input {
                            let (code, input_state) = parse_manual_input(&raw);
                            match input_state {
                                Some(s) if s != state => {
                                    return Err(AuthError::StateMismatch);
                                }
                                _ => return Ok(code),
                            }
                        }
                    }
                }
            }
        })
        .await
        .map_err(|_| AuthError::CallbackTimedOut)??;

        let creds = exchange_code_for_tokens(&self.client, &code, &pkce.verifier).await?;
        self.store.save(&creds).await?;
        Ok(creds)
    }

    async fn refreshed(&self) -> Result<StoredChatGptCredentials> {
        let creds = self.store.load().await.ok_or(AuthError::NotLoggedIn)?;
        if now_ms() + 60_000 < creds.expires {
            return Ok(creds);
        }
        let refreshed = refresh_openai_token(&self.client, &creds).await?;
        self.store.save(&refreshed).await?;
        Ok(refreshed)
    }

    /// Returns a valid, already-refreshed credential pair ready to hand to
    /// `ChatGptResponsesProvider::new`.
    pub async fn valid_credentials(&self) -> Result<ChatGptCredentials> {
        Ok((&self.refreshed().await?).into())
    }

    pub async fn logout(&self) -> Result<()> {
        self.store.clear().await
    }
}
