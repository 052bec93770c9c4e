// SPDX-FileCopyrightText: 2022 Profian Inc. <opensource@profian.com>
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use usage::Condition;

const SPENT: &str = "spent";

/// Data kept by the enclave between sessions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CachedRecord {
    pub data: Value,
    pub condition: Condition,
    pub path: PathBuf,

    /// The client the data was acquired for.
    #[serde(rename = "clientCN")]
    pub client_cn: String,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub expired: bool,
}

impl CachedRecord {
    /// Whether the record must be deleted rather than kept.
    pub fn evictable(&self) -> bool {
        self.expired || self.condition.exhausted()
    }
}

/// On-disk cache of acquired data, one JSON file per data item.
#[derive(Debug)]
pub struct CacheStore {
    dir: PathBuf,
    locks: Mutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>,
}

impl CacheStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(dir.join(SPENT))
            .with_context(|| format!("failed to create cache directory {}", dir.display()))?;

        Ok(Self {
            dir,
            locks: Mutex::default(),
        })
    }

    /// The cache file of a data item.
    pub fn path(&self, data_id: &str) -> PathBuf {
        self.dir.join(data_id.replace('/', "-"))
    }

    /// Locks the given cache files for the rest of a session.
    ///
    /// Locks are always taken in path order, so sessions sharing items
    /// cannot deadlock.
    pub async fn lock_all(&self, paths: &[PathBuf]) -> Vec<OwnedMutexGuard<()>> {
        let mut paths: Vec<&PathBuf> = paths.iter().collect();
        paths.sort();
        paths.dedup();

        let locks: Vec<_> = {
            let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            // Locks nobody holds or waits for.
            map.retain(|_, lock| Arc::strong_count(lock) > 1);
            paths
                .into_iter()
                .map(|path| map.entry(path.clone()).or_default().clone())
                .collect()
        };

        let mut guards = Vec::with_capacity(locks.len());
        for lock in locks {
            guards.push(lock.lock_owned().await);
        }
        guards
    }

    pub async fn read(&self, path: &Path) -> Result<Option<CachedRecord>> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .with_context(|| format!("malformed cache file {}", path.display()))
    }

    /// Persists a record at its own path.
    pub async fn write(&self, record: &CachedRecord) -> Result<()> {
        let bytes = serde_json::to_vec(record)?;
        let tmp = record.path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &record.path)
            .await
            .with_context(|| format!("failed to replace {}", record.path.display()))
    }

    pub async fn remove(&self, path: &Path) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Err(e) if e.kind() != ErrorKind::NotFound => {
                Err(e).with_context(|| format!("failed to remove {}", path.display()))
            }
            _ => Ok(()),
        }
    }

    fn spent_path(&self, jwt: &str) -> PathBuf {
        let digest = Sha256::digest(jwt.trim().as_bytes());
        self.dir.join(SPENT).join(hex::encode(digest))
    }

    /// Remembers that a token's data has been used up.
    ///
    /// The token's own expiration date is kept with it; see
    /// [`CacheStore::prune_spent`].
    pub async fn mark_spent(&self, jwt: &str, expires: Option<NaiveDate>) -> Result<()> {
        let path = self.spent_path(jwt);
        let expires = expires.map(|d| d.to_string()).unwrap_or_default();
        tokio::fs::write(&path, expires)
            .await
            .with_context(|| format!("failed to write {}", path.display()))
    }

    /// Forgets spent tokens that expired before `today`.
    ///
    /// Returns the number of tokens forgotten.
    pub async fn prune_spent(&self, today: NaiveDate) -> Result<usize> {
        let dir = self.dir.join(SPENT);
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("failed to list {}", dir.display()))?;

        let mut pruned = 0;
        while let Some(entry) = entries.next_entry().await? {
            let expires = tokio::fs::read_to_string(entry.path()).await?;
            match expires.trim().parse::<NaiveDate>() {
                Ok(expires) if expires < today => {
                    self.remove(&entry.path()).await?;
                    pruned += 1;
                }
                _ => {}
            }
        }
        Ok(pruned)
    }

    pub async fn is_spent(&self, jwt: &str) -> bool {
        tokio::fs::try_exists(self.spent_path(jwt))
            .await
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    fn record(store: &CacheStore, counter: Option<i64>) -> CachedRecord {
        CachedRecord {
            data: json!({"age": 30}),
            condition: Condition {
                counter,
                ..Default::default()
            },
            path: store.path("https://p/data/personal/1"),
            client_cn: "alice".into(),
            expired: false,
        }
    }

    #[test]
    fn path() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path()).unwrap();
        assert_eq!(
            store.path("https://p/data/personal/1"),
            dir.path().join("https:--p-data-personal-1")
        );
    }

    #[test]
    fn wire() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path()).unwrap();

        let mut record = record(&store, Some(2));
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["clientCN"], "alice");
        assert_eq!(value["condition"]["counter"], 2);
        assert!(value.get("expired").is_none());

        record.expired = true;
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["expired"], true);
    }

    #[test]
    fn evictable() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path()).unwrap();

        assert!(!record(&store, None).evictable());
        assert!(!record(&store, Some(1)).evictable());
        assert!(record(&store, Some(0)).evictable());

        let mut expired = record(&store, None);
        expired.expired = true;
        assert!(expired.evictable());
    }

    #[tokio::test]
    async fn persistence() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path()).unwrap();
        let record = record(&store, Some(3));

        assert_eq!(store.read(&record.path).await.unwrap(), None);
        store.write(&record).await.unwrap();
        assert_eq!(store.read(&record.path).await.unwrap(), Some(record.clone()));

        store.remove(&record.path).await.unwrap();
        assert_eq!(store.read(&record.path).await.unwrap(), None);

        // Removing twice is fine.
        store.remove(&record.path).await.unwrap();
    }

    #[tokio::test]
    async fn malformed() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path()).unwrap();
        let path = store.path("x");
        std::fs::write(&path, b"{").unwrap();
        assert!(store.read(&path).await.is_err());
    }

    #[tokio::test]
    async fn spent() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path()).unwrap();

        assert!(!store.is_spent("a.b.c").await);
        store.mark_spent("a.b.c", None).await.unwrap();
        assert!(store.is_spent("a.b.c").await);
        assert!(!store.is_spent("a.b.d").await);
    }

    #[tokio::test]
    async fn expired_tombstones_are_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path()).unwrap();
        let date = |s: &str| s.parse::<NaiveDate>().unwrap();

        store.mark_spent("old", Some(date("2024-05-31"))).await.unwrap();
        store.mark_spent("today", Some(date("2024-06-01"))).await.unwrap();
        store.mark_spent("forever", None).await.unwrap();

        assert_eq!(store.prune_spent(date("2024-06-01")).await.unwrap(), 1);
        assert!(!store.is_spent("old").await);
        assert!(store.is_spent("today").await);
        assert!(store.is_spent("forever").await);
    }

    #[tokio::test]
    async fn locks() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path()).unwrap();
        let (a, b) = (store.path("a"), store.path("b"));

        let guards = store.lock_all(&[b.clone(), a.clone(), a.clone()]).await;
        assert_eq!(guards.len(), 2);

        let map = store.locks.lock().unwrap();
        assert!(map[&a].try_lock().is_err());
        assert!(map[&b].try_lock().is_err());
        drop(map);

        drop(guards);
        let map = store.locks.lock().unwrap();
        assert!(map[&a].try_lock().is_ok());
        drop(map);

        // Released locks are dropped the next time locks are taken.
        let c = store.path("c");
        let guards = store.lock_all(&[c.clone()]).await;
        let map = store.locks.lock().unwrap();
        assert_eq!(map.keys().collect::<Vec<_>>(), [&c]);
        drop(map);
        drop(guards);
    }
}
