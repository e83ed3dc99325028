//! Persisted ban list.
//!
//! A small JSON file of banned user ids, loaded at startup and rewritten on
//! every addition. Consulted at stream creation; appended by `ban` review
//! decisions.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

#[derive(Debug, Default, Serialize, Deserialize)]
struct BanFile {
    banned_users: BTreeSet<String>,
}

pub struct BanList {
    path: PathBuf,
    inner: RwLock<BanFile>,
}

impl BanList {
    /// Load the ban list, starting empty when the file does not exist yet.
    /// A corrupt file is an error — silently dropping bans is not acceptable.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let inner = match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| anyhow::anyhow!("corrupt ban list {}: {e}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BanFile::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: path.to_path_buf(),
            inner: RwLock::new(inner),
        })
    }

    pub async fn is_banned(&self, user_id: &str) -> bool {
        self.inner.read().await.banned_users.contains(user_id)
    }

    /// Add a user and persist. Idempotent; returns whether the id was new.
    pub async fn ban(&self, user_id: &str) -> anyhow::Result<bool> {
        let mut inner = self.inner.write().await;
        if !inner.banned_users.insert(user_id.to_string()) {
            return Ok(false);
        }
        let json = serde_json::to_vec_pretty(&*inner)?;
        tokio::fs::write(&self.path, json).await?;
        Ok(true)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.banned_users.len()
    }
}
