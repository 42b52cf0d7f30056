//! Encrypted full-store backups.
//!
//! File layout: `WGRBAK1` magic, 12-byte nonce, AES-256-GCM ciphertext of a
//! JSON snapshot holding every table's rows.

use crate::error::AdapterError;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use wager_core::{WagerStore, TABLES};

const MAGIC: &[u8] = b"WGRBAK1";
const NONCE_LEN: usize = 12;
const KEY_CONTEXT: &str = "wager-platform 2026 backup encryption key";
pub const RESTORE_BATCH_SIZE: usize = 500;

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    created_at: DateTime<Utc>,
    backend: String,
    tables: BTreeMap<String, Vec<serde_json::Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupReceipt {
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub rows: BTreeMap<String, usize>,
    pub bytes: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableRestore {
    pub table: String,
    pub rows_in_backup: usize,
    pub inserted: usize,
    pub error: Option<String>,
}

/// Per-table outcome of a restore; one failing table never stops the others.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestoreReport {
    pub tables: Vec<TableRestore>,
}

impl RestoreReport {
    pub fn is_clean(&self) -> bool {
        self.tables.iter().all(|table| table.error.is_none())
    }

    pub fn failed_tables(&self) -> Vec<&str> {
        self.tables
            .iter()
            .filter(|table| table.error.is_some())
            .map(|table| table.table.as_str())
            .collect()
    }
}

pub struct BackupManager {
    store: Arc<dyn WagerStore>,
    directory: PathBuf,
    cipher: Aes256Gcm,
}

impl BackupManager {
    pub fn new(store: Arc<dyn WagerStore>, directory: impl Into<PathBuf>, passphrase: &str) -> Self {
        let key_bytes = blake3::derive_key(KEY_CONTEXT, passphrase.as_bytes());
        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        Self {
            store,
            directory: directory.into(),
            cipher: Aes256Gcm::new(key),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub async fn create_backup(&self) -> Result<BackupReceipt, AdapterError> {
        let created_at = Utc::now();
        let tables = self.store.export_snapshot().await?;
        let rows = tables
            .iter()
            .map(|(table, rows)| (table.clone(), rows.len()))
            .collect();
        let snapshot = Snapshot {
            created_at,
            backend: self.store.backend_label().to_string(),
            tables,
        };
        let sealed = self.seal(&serde_json::to_vec(&snapshot)?)?;

        tokio::fs::create_dir_all(&self.directory).await?;
        let path = self
            .directory
            .join(format!("backup-{}.bin", created_at.format("%Y%m%dT%H%M%S%.3fZ")));
        tokio::fs::write(&path, &sealed).await?;

        info!(path = %path.display(), bytes = sealed.len(), "backup written");
        Ok(BackupReceipt {
            path,
            created_at,
            rows,
            bytes: sealed.len(),
        })
    }

    /// Restore tables in dependency order, batching inserts and collecting failures.
    pub async fn restore(&self, path: &Path) -> Result<RestoreReport, AdapterError> {
        let sealed = tokio::fs::read(path).await?;
        let snapshot: Snapshot = serde_json::from_slice(&self.open(&sealed)?)?;
        let mut tables = snapshot.tables;
        let mut report = RestoreReport::default();

        for table in TABLES {
            let rows = tables.remove(table).unwrap_or_default();
            let mut outcome = TableRestore {
                table: table.to_string(),
                rows_in_backup: rows.len(),
                ..TableRestore::default()
            };
            for batch in rows.chunks(RESTORE_BATCH_SIZE) {
                match self.store.restore_rows(table, batch.to_vec()).await {
                    Ok(inserted) => outcome.inserted += inserted,
                    Err(err) => {
                        warn!(table, error = %err, "table restore failed; continuing with next table");
                        outcome.error = Some(err.to_string());
                        break;
                    }
                }
            }
            report.tables.push(outcome);
        }
        for (table, rows) in tables {
            report.tables.push(TableRestore {
                error: Some(format!("unknown table '{table}' in backup")),
                rows_in_backup: rows.len(),
                table,
                inserted: 0,
            });
        }

        info!(
            path = %path.display(),
            failed = ?report.failed_tables(),
            "restore finished"
        );
        Ok(report)
    }

    /// Newest backup file in the directory, if any.
    pub async fn latest_backup(&self) -> Result<Option<PathBuf>, AdapterError> {
        let mut entries = match tokio::fs::read_dir(&self.directory).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let mut latest: Option<PathBuf> = None;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with("backup-") && name.ends_with(".bin") {
                let path = entry.path();
                if latest.as_ref().map(|current| path > *current).unwrap_or(true) {
                    latest = Some(path);
                }
            }
        }
        Ok(latest)
    }

    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, AdapterError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|err| AdapterError::Crypto(err.to_string()))?;

        let mut out = Vec::with_capacity(MAGIC.len() + NONCE_LEN + ciphertext.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, AdapterError> {
        let body = sealed
            .strip_prefix(MAGIC)
            .ok_or_else(|| AdapterError::Format("not a wager backup file".to_string()))?;
        if body.len() <= NONCE_LEN {
            return Err(AdapterError::Format("backup file truncated".to_string()));
        }
        let (nonce, ciphertext) = body.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| AdapterError::Crypto("wrong passphrase or corrupted backup".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wager_core::{BalanceAccessor, InMemoryWagerStore};

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("wager-backup-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn backup_restores_into_an_empty_store() {
        let source: Arc<dyn WagerStore> = Arc::new(InMemoryWagerStore::new());
        let balances = BalanceAccessor::new(source.clone(), "USD", 4);
        balances.deposit("alice", 1_234, None).await.unwrap();
        balances.deposit("bob", 99, None).await.unwrap();

        let dir = scratch_dir();
        let receipt = BackupManager::new(source, &dir, "hunter2").create_backup().await.unwrap();
        assert_eq!(receipt.rows["ledger_entries"], 2);

        let target: Arc<dyn WagerStore> = Arc::new(InMemoryWagerStore::new());
        let manager = BackupManager::new(target.clone(), &dir, "hunter2");
        assert_eq!(manager.latest_backup().await.unwrap(), Some(receipt.path.clone()));

        let report = manager.restore(&receipt.path).await.unwrap();
        assert!(report.is_clean());
        assert_eq!(target.account("alice").await.unwrap().balance, 1_234);
        assert_eq!(target.chain("bob").await.unwrap().len(), 1);

        // Restoring twice skips rows that already exist.
        let again = manager.restore(&receipt.path).await.unwrap();
        assert!(again.tables.iter().all(|table| table.inserted == 0));

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn wrong_passphrase_is_rejected() {
        let store: Arc<dyn WagerStore> = Arc::new(InMemoryWagerStore::new());
        let dir = scratch_dir();
        let receipt = BackupManager::new(store.clone(), &dir, "right").create_backup().await.unwrap();

        let err = BackupManager::new(store, &dir, "wrong")
            .restore(&receipt.path)
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Crypto(_)));
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn failing_table_is_reported_without_aborting() {
        let store: Arc<dyn WagerStore> = Arc::new(InMemoryWagerStore::new());
        let dir = scratch_dir();
        let manager = BackupManager::new(store.clone(), &dir, "pw");

        let mut tables = BTreeMap::new();
        tables.insert("slips".to_string(), vec![serde_json::json!({"not": "a slip"})]);
        tables.insert(
            "platform".to_string(),
            vec![serde_json::json!({"float": 5_000})],
        );
        let snapshot = Snapshot {
            created_at: Utc::now(),
            backend: "memory".to_string(),
            tables,
        };
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("backup-handmade.bin");
        let sealed = manager.seal(&serde_json::to_vec(&snapshot).unwrap()).unwrap();
        tokio::fs::write(&path, sealed).await.unwrap();

        let report = manager.restore(&path).await.unwrap();
        assert_eq!(report.failed_tables(), vec!["slips"]);
        assert_eq!(store.platform_float().await.unwrap(), 5_000);
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
