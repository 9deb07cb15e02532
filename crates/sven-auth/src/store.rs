// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Credential persistence.
//!
//! Both OAuth flows read/write their credentials through the same small
//! [`CredentialStore`] trait so tests can substitute an in-memory store
//! instead of touching the filesystem.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::Result;

#[async_trait]
pub trait CredentialStore<T>: Send + Sync
where
    T: Send + Sync,
{
    async fn load(&self) -> Option<T>;
    async fn save(&self, creds: &T) -> Result<()>;
    async fn clear(&self) -> Result<()>;
}

/// Persists credentials as pretty-printed JSON at a fixed path.
///
/// The file is `chmod 600` after every write; credential values are never
/// logged.
pub struct FileCredentialStore<T> {
    path: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T> FileCredentialStore<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), _marker: PhantomData }
    }
}

#[async_trait]
impl<T> CredentialStore<T> for FileCredentialStore<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    async fn load(&self) -> Option<T> {
        let text = tokio::fs::read_to_string(&self.path).await.ok()?;
        serde_json::from_str(&text).ok()
    }

    async fn save(&self, creds: &T) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let text = serde_json::to_string_pretty(creds)?;
        tokio::fs::write(&self.path, text).await?;
        restrict_permissions(&self.path).await?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

/// In-memory store used by tests in place of [`FileCredentialStore`].
#[derive(Default)]
pub struct InMemoryCredentialStore<T> {
    slot: Mutex<Option<T>>,
}

impl<T> InMemoryCredentialStore<T> {
    pub fn new() -> Self {
        Self { slot: Mutex::new(None) }
    }

    pub fn seeded(value: T) -> Self {
        Self { slot: Mutex::new(Some(value)) }
    }
}

#[async_trait]
impl<T> CredentialStore<T> for InMemoryCredentialStore<T>
where
    T: Clone + Send + Sync,
{
    async fn load(&self) -> Option<T> {
        self.slot.lock().unwrap().clone()
    }

    async fn save(&self, creds: &T) -> Result<()> {
        *self.slot.lock().unwrap() = Some(creds.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.slot.lock().unwrap() = None;
        Ok(())
    }
}

/// Default path for the Copilot credential file under a config directory.
pub fn default_copilot_auth_path(config_dir: &Path) -> PathBuf {
    config_dir.join("copilot_auth.json")
}

/// Default path for the ChatGPT credential file under a config directory.
pub fn default_chatgpt_auth_path(config_dir: &Path) -> PathBuf {
    config_dir.join("openai_auth.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct Dummy {
        value: String,
    }

    #[tokio::test]
    async fn file_store_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let store: FileCredentialStore<Dummy> = FileCredentialStore::new(tmp.path().join("creds.json"));
        assert!(store.load().await.is_none());

        let creds = Dummy { value: "x".into() };
        store.save(&creds).await.unwrap();
        assert_eq!(store.load().await, Some(creds));
    }

    #[tokio::test]
    async fn file_store_clear_removes_file() {
        let tmp = tempfile::tempdir().unwrap();
        let store: FileCredentialStore<Dummy> = FileCredentialStore::new(tmp.path().join("creds.json"));
        store.save(&Dummy { value: "x".into() }).await.unwrap();
        store.clear().await.unwrap();
        assert!(store.load().await.is_none());
    }

    #[tokio::test]
    async fn file_store_clear_missing_file_is_ok() {
        let tmp = tempfile::tempdir().unwrap();
        let store: FileCredentialStore<Dummy> = FileCredentialStore::new(tmp.path().join("nope.json"));
        assert!(store.clear().await.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_store_sets_owner_only_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("creds.json");
        let store: FileCredentialStore<Dummy> = FileCredentialStore::new(&path);
        store.save(&Dummy { value: "x".into() }).await.unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[tokio::test]
    async fn in_memory_store_round_trips() {
        let store: InMemoryCredentialStore<Dummy> = InMemoryCredentialStore::new();
        assert!(store.load().await.is_none());
        store.save(&Dummy { value: "y".into() }).await.unwrap();
        assert_eq!(store.load().await, Some(Dummy { value: "y".into() }));
        store.clear().await.unwrap();
        assert!(store.load().await.is_none());
    }
}
