//! File-backed table store implementation.

use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::Mutex;

use crate::error::{Result, StoreError};

/// The tables owned by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    /// Job snapshot blobs, keyed by job id.
    Jobs,
    /// Per-job outcome sets, keyed by job id.
    Outcomes,
    /// Per-job recipient registry sets, keyed by job id.
    Registry,
    /// Accounting feed cursors, keyed by source name.
    Offsets,
    /// Operator configuration overrides, keyed by config key.
    Config,
}

impl Table {
    const fn dir_name(self) -> &'static str {
        match self {
            Self::Jobs => "jobs",
            Self::Outcomes => "outcomes",
            Self::Registry => "registry",
            Self::Offsets => "offsets",
            Self::Config => "config",
        }
    }

    const ALL: [Self; 5] = [
        Self::Jobs,
        Self::Outcomes,
        Self::Registry,
        Self::Offsets,
        Self::Config,
    ];
}

/// A directory-per-table, file-per-key store.
///
/// All mutation goes through a single writer lock so concurrent persistence
/// ticks cannot interleave a temp-file rename with another writer's.
#[derive(Debug)]
pub struct Store {
    root: PathBuf,
    writer: Mutex<()>,
}

impl Store {
    /// Open (and create if necessary) a store rooted at `root`.
    ///
    /// # Errors
    /// I/O errors creating the table directories.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for table in Table::ALL {
            tokio::fs::create_dir_all(root.join(table.dir_name())).await?;
        }
        Ok(Self {
            root,
            writer: Mutex::new(()),
        })
    }

    fn entry_path(&self, table: Table, key: &str) -> Result<PathBuf> {
        if key.is_empty() || !Self::key_is_safe(key) {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(table.dir_name()).join(format!("{key}.bin")))
    }

    /// Keys become file names, so restrict them to a safe alphabet. Email
    /// addresses and config keys pass; path traversal does not.
    fn key_is_safe(key: &str) -> bool {
        key.len() <= 255
            && key
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'@' | b'.' | b'-' | b'_' | b'+'))
    }

    /// Insert or replace the value for `key`.
    ///
    /// # Errors
    /// Serialization or I/O failure. The previous value, if any, survives a
    /// failed write because the rename never happens.
    pub async fn put<T: Serialize>(&self, table: Table, key: &str, value: &T) -> Result<()> {
        let path = self.entry_path(table, key)?;
        let bytes = bincode::serde::encode_to_vec(value, bincode::config::legacy())?;

        let _writer = self.writer.lock().await;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Fetch and decode the value for `key`, or `None` when absent.
    ///
    /// # Errors
    /// I/O failure other than not-found, or a decode failure (corrupt blob).
    pub async fn get<T: DeserializeOwned>(&self, table: Table, key: &str) -> Result<Option<T>> {
        let path = self.entry_path(table, key)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let (value, _) = bincode::serde::decode_from_slice(&bytes, bincode::config::legacy())?;
        Ok(Some(value))
    }

    /// Remove the value for `key`. Removing an absent key is not an error.
    ///
    /// # Errors
    /// I/O failure other than not-found.
    pub async fn delete(&self, table: Table, key: &str) -> Result<()> {
        let path = self.entry_path(table, key)?;
        let _writer = self.writer.lock().await;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// List every key present in `table`.
    ///
    /// # Errors
    /// I/O failure reading the table directory.
    pub async fn keys(&self, table: Table) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut entries = tokio::fs::read_dir(self.root.join(table.dir_name())).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(key) = name.strip_suffix(".bin") {
                keys.push(key.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();

        let mut value = HashMap::new();
        value.insert("alice@example.com".to_string(), 3u32);

        store.put(Table::Outcomes, "job1", &value).await.unwrap();
        let loaded: Option<HashMap<String, u32>> =
            store.get(Table::Outcomes, "job1").await.unwrap();
        assert_eq!(loaded, Some(value));
    }

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        let loaded: Option<String> = store.get(Table::Jobs, "nope").await.unwrap();
        assert_eq!(loaded, None);
    }

    #[tokio::test]
    async fn test_put_is_upsert() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();

        store.put(Table::Config, "max_rcpt", &"100").await.unwrap();
        store.put(Table::Config, "max_rcpt", &"200").await.unwrap();
        let loaded: Option<String> = store.get(Table::Config, "max_rcpt").await.unwrap();
        assert_eq!(loaded.as_deref(), Some("200"));
    }

    #[tokio::test]
    async fn test_delete_and_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();

        store.put(Table::Jobs, "a1", &1u8).await.unwrap();
        store.put(Table::Jobs, "b2", &2u8).await.unwrap();
        assert_eq!(store.keys(Table::Jobs).await.unwrap(), vec!["a1", "b2"]);

        store.delete(Table::Jobs, "a1").await.unwrap();
        store.delete(Table::Jobs, "a1").await.unwrap(); // idempotent
        assert_eq!(store.keys(Table::Jobs).await.unwrap(), vec!["b2"]);
    }

    #[tokio::test]
    async fn test_unsafe_keys_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        assert!(matches!(
            store.put(Table::Jobs, "../escape", &0u8).await,
            Err(StoreError::InvalidKey(_))
        ));
        assert!(matches!(
            store.put(Table::Jobs, "", &0u8).await,
            Err(StoreError::InvalidKey(_))
        ));
    }
}
