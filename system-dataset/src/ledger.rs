// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A [`ConfigStore`] persisted as a JSON ledger on local disk.

use crate::facilities::ConfigStore;
use crate::params::{RecordUpdate, SystemDatasetRecord};
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use slog::{debug, info, o, Logger};
use std::collections::BTreeMap;
use std::io;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(thiserror::Error, Debug)]
pub enum LedgerError {
    #[error("Failed to access ledger at {path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: io::Error,
    },

    #[error("Failed to parse ledger at {path}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: serde_json::Error,
    },

    #[error("Failed to serialize ledger")]
    Serialize(#[source] serde_json::Error),

    #[error("No system dataset record with id {0}")]
    RecordNotFound(u64),
}

/// Everything kept in the ledger file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct Contents {
    /// Bumped on every commit.
    generation: u64,
    record: SystemDatasetRecord,
    #[serde(default)]
    keyvalue: BTreeMap<String, bool>,
}

impl Default for Contents {
    fn default() -> Self {
        Self {
            generation: 0,
            record: SystemDatasetRecord { id: 1, ..Default::default() },
            keyvalue: BTreeMap::new(),
        }
    }
}

/// Stores the system dataset record and one-shot flags in a single file.
///
/// A missing file reads as a fresh record. Commits write and sync a
/// sibling temporary file, rename it into place and sync the directory, so
/// readers never observe a partial write and a crash keeps either the old
/// or the new contents.
pub struct FileConfigStore {
    log: Logger,
    path: Utf8PathBuf,
    // Serializes read-modify-write cycles.
    lock: Mutex<()>,
}

impl FileConfigStore {
    pub fn new(log: &Logger, path: impl Into<Utf8PathBuf>) -> Self {
        let path = path.into();
        let log = log.new(o!(
            "component" => "FileConfigStore",
            "path" => path.to_string(),
        ));
        Self { log, path, lock: Mutex::new(()) }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    async fn load(&self) -> Result<Contents, LedgerError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(self.log, "No ledger found; using a fresh record");
                return Ok(Contents::default());
            }
            Err(err) => {
                return Err(LedgerError::Io { path: self.path.clone(), err });
            }
        };
        serde_json::from_slice(&bytes)
            .map_err(|err| LedgerError::Parse { path: self.path.clone(), err })
    }

    async fn commit(&self, contents: &mut Contents) -> Result<(), LedgerError> {
        contents.generation += 1;
        let bytes = serde_json::to_vec_pretty(contents)
            .map_err(LedgerError::Serialize)?;
        let io_err = |path: &Utf8Path| {
            let path = path.to_owned();
            move |err| LedgerError::Io { path, err }
        };

        let parent = self.path.parent().filter(|dir| !dir.as_str().is_empty());
        if let Some(parent) = parent {
            tokio::fs::create_dir_all(parent).await.map_err(io_err(parent))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let mut file =
            tokio::fs::File::create(&tmp).await.map_err(io_err(&tmp))?;
        file.write_all(&bytes).await.map_err(io_err(&tmp))?;
        file.sync_all().await.map_err(io_err(&tmp))?;
        drop(file);
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(io_err(&self.path))?;
        // The rename itself is only durable once the directory is synced.
        if let Some(parent) = parent {
            let dir =
                tokio::fs::File::open(parent).await.map_err(io_err(parent))?;
            dir.sync_all().await.map_err(io_err(parent))?;
        }
        info!(
            self.log,
            "Committed ledger";
            "generation" => contents.generation,
        );
        Ok(())
    }

    /// Sets a persistent boolean flag.
    pub async fn set_flag(
        &self,
        key: &str,
        value: bool,
    ) -> Result<(), LedgerError> {
        let _guard = self.lock.lock().await;
        let mut contents = self.load().await?;
        contents.keyvalue.insert(key.to_string(), value);
        self.commit(&mut contents).await
    }
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    async fn get_config(&self) -> anyhow::Result<SystemDatasetRecord> {
        Ok(self.load().await?.record)
    }

    async fn update_config(
        &self,
        id: u64,
        update: &RecordUpdate,
    ) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let mut contents = self.load().await?;
        if contents.record.id != id {
            return Err(LedgerError::RecordNotFound(id).into());
        }
        update.apply(&mut contents.record);
        self.commit(&mut contents).await?;
        Ok(())
    }

    async fn get_flag(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.load().await?.keyvalue.get(key).copied().unwrap_or(false))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;
    use camino_tempfile::tempdir;
    use sysds_test_utils::dev::test_setup_log;

    #[tokio::test]
    async fn missing_ledger_reads_as_fresh_record() {
        let logctx = test_setup_log("missing_ledger_reads_as_fresh_record");
        let dir = tempdir().unwrap();
        let store = FileConfigStore::new(&logctx.log, dir.path().join("l.json"));

        let record = store.get_config().await.unwrap();
        assert_eq!(record, SystemDatasetRecord { id: 1, ..Default::default() });
        assert!(!store.get_flag("run_migration").await.unwrap());
        assert!(!store.path().exists());
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn updates_survive_reopening() {
        let logctx = test_setup_log("updates_survive_reopening");
        let dir = tempdir().unwrap();
        let path = dir.path().join("state/ledger.json");
        let store = FileConfigStore::new(&logctx.log, &path);

        let update = RecordUpdate {
            pool: Some("tank".to_string()),
            pool_set: Some(true),
            uuid: Some("0123456789abcdef0123456789abcdef".to_string()),
            ..Default::default()
        };
        store.update_config(1, &update).await.unwrap();
        store.set_flag("run_migration", true).await.unwrap();
        assert!(!path.with_extension("json.tmp").exists());

        let reopened = FileConfigStore::new(&logctx.log, &path);
        let record = reopened.get_config().await.unwrap();
        assert_eq!(record.pool, "tank");
        assert!(record.pool_set);
        assert!(!record.syslog_usedataset);
        assert_eq!(record.uuid.as_deref(), update.uuid.as_deref());
        assert!(reopened.get_flag("run_migration").await.unwrap());
        assert_eq!(reopened.load().await.unwrap().generation, 2);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn commit_replaces_leftover_temporary_file() {
        let logctx = test_setup_log("commit_replaces_leftover_temporary_file");
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        let tmp = path.with_extension("json.tmp");
        // An earlier commit died after a partial write.
        std::fs::write(&tmp, "{ \"generation\": 9, \"rec").unwrap();
        let store = FileConfigStore::new(&logctx.log, &path);

        store.set_flag("run_migration", true).await.unwrap();
        assert!(!tmp.exists());
        let on_disk: Contents =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(on_disk.generation, 1);
        assert_eq!(on_disk.keyvalue.get("run_migration"), Some(&true));
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn commit_failure_leaves_ledger_untouched() {
        let logctx = test_setup_log("commit_failure_leaves_ledger_untouched");
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        let store = FileConfigStore::new(&logctx.log, &path);
        store.set_flag("run_migration", true).await.unwrap();
        let committed = std::fs::read(&path).unwrap();

        // Nothing can be written where the temporary file belongs.
        let tmp = path.with_extension("json.tmp");
        std::fs::create_dir(&tmp).unwrap();
        let err = store.set_flag("run_migration", false).await.unwrap_err();
        assert_matches!(err, LedgerError::Io { path: p, .. } if p == tmp);
        assert_eq!(std::fs::read(&path).unwrap(), committed);
        assert!(store.get_flag("run_migration").await.unwrap());
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn update_of_unknown_record_fails() {
        let logctx = test_setup_log("update_of_unknown_record_fails");
        let dir = tempdir().unwrap();
        let store = FileConfigStore::new(&logctx.log, dir.path().join("l.json"));

        let err = store
            .update_config(7, &RecordUpdate::default())
            .await
            .unwrap_err();
        assert_matches!(
            err.downcast_ref::<LedgerError>(),
            Some(LedgerError::RecordNotFound(7))
        );
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn corrupt_ledger_is_reported() {
        let logctx = test_setup_log("corrupt_ledger_is_reported");
        let dir = tempdir().unwrap();
        let path = dir.path().join("l.json");
        std::fs::write(&path, "{ not json").unwrap();
        let store = FileConfigStore::new(&logctx.log, &path);

        let err = store.get_config().await.unwrap_err();
        assert_matches!(
            err.downcast_ref::<LedgerError>(),
            Some(LedgerError::Parse { path: p, .. }) if *p == path
        );
        logctx.cleanup_successful();
    }
}
