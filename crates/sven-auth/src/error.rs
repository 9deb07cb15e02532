// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("not logged in")]
    NotLoggedIn,

    #[error("GitHub Copilot subscription not found; an active Copilot subscription is required")]
    SubscriptionMissing,

    #[error("device code expired before the user authorized it")]
    DeviceFlowTimedOut,

    #[error("device flow error: {0}")]
    DeviceFlowError(String),

    #[error("OAuth callback timed out waiting for authorization")]
    CallbackTimedOut,

    #[error("OAuth state mismatch")]
    StateMismatch,

    #[error("malformed token response: {0}")]
    MalformedResponse(String),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AuthError>;
