// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Records exchanged with callers and with the configuration store.

use camino::Utf8PathBuf;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The persisted system dataset configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemDatasetRecord {
    pub id: u64,
    /// Pool hosting the dataset; empty means "use the boot pool".
    pub pool: String,
    /// Whether `pool` was chosen by an operator rather than picked
    /// automatically.
    #[serde(default)]
    pub pool_set: bool,
    pub syslog_usedataset: bool,
    /// Instance id of the active (or only) node.
    pub uuid: Option<String>,
    /// Instance id of the standby node of a failover pair.
    pub uuid_b: Option<String>,
}

/// A partial update of [`SystemDatasetRecord`], applied atomically by the
/// configuration store. `None` fields are left untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecordUpdate {
    pub pool: Option<String>,
    pub pool_set: Option<bool>,
    pub syslog_usedataset: Option<bool>,
    pub uuid: Option<String>,
    pub uuid_b: Option<String>,
}

impl RecordUpdate {
    pub fn apply(&self, record: &mut SystemDatasetRecord) {
        if let Some(pool) = &self.pool {
            record.pool = pool.clone();
        }
        if let Some(pool_set) = self.pool_set {
            record.pool_set = pool_set;
        }
        if let Some(syslog) = self.syslog_usedataset {
            record.syslog_usedataset = syslog;
        }
        if let Some(uuid) = &self.uuid {
            record.uuid = Some(uuid.clone());
        }
        if let Some(uuid_b) = &self.uuid_b {
            record.uuid_b = Some(uuid_b.clone());
        }
    }
}

/// The system dataset configuration as seen by callers: the persisted record
/// resolved against the running system.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SystemDatasetConfig {
    pub id: u64,
    /// The pool currently expected to host the dataset.
    pub pool: String,
    /// Whether an operator chose `pool` explicitly.
    pub pool_set: bool,
    /// Instance id of the node this manager runs on.
    pub uuid: String,
    pub uuid_a: String,
    pub uuid_b: Option<String>,
    /// `<pool>/.system`
    pub basename: String,
    pub syslog: bool,
    /// The stable mount path, present only while the dataset is mounted
    /// there.
    #[schemars(with = "Option<String>")]
    pub path: Option<Utf8PathBuf>,
}

/// A requested configuration change.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, JsonSchema)]
pub struct SystemDatasetUpdate {
    /// Absent leaves the pool unchanged; `null` (or an empty name) asks for
    /// automatic selection.
    #[serde(default, deserialize_with = "deserialize_some")]
    #[schemars(with = "Option<String>")]
    pub pool: Option<Option<String>>,
    /// A pool automatic selection must not pick.
    #[serde(default)]
    pub pool_exclude: Option<String>,
    #[serde(default)]
    pub syslog: Option<bool>,
}

impl SystemDatasetUpdate {
    /// Requests automatic pool selection, avoiding `exclude`.
    pub fn automatic(exclude: Option<&str>) -> Self {
        Self {
            pool: Some(None),
            pool_exclude: exclude.map(str::to_string),
            syslog: None,
        }
    }

    pub fn with_pool(pool: impl Into<String>) -> Self {
        Self { pool: Some(Some(pool.into())), ..Default::default() }
    }
}

// Distinguishes an explicit `null` from an absent field.
fn deserialize_some<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

/// Where the migration orchestrator is in its work.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, JsonSchema)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum OrchestratorState {
    Idle,
    Validating,
    AutoSelecting,
    Applying,
    Migrating { from: String, to: String },
    Finalizing,
    Failed { error: String },
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn update_distinguishes_null_from_absent_pool() {
        let absent: SystemDatasetUpdate =
            serde_json::from_str(r#"{"syslog": true}"#).unwrap();
        assert_eq!(absent.pool, None);
        assert_eq!(absent.syslog, Some(true));

        let null: SystemDatasetUpdate =
            serde_json::from_str(r#"{"pool": null, "pool_exclude": "tank"}"#)
                .unwrap();
        assert_eq!(null, SystemDatasetUpdate::automatic(Some("tank")));

        let named: SystemDatasetUpdate =
            serde_json::from_str(r#"{"pool": "backup"}"#).unwrap();
        assert_eq!(named, SystemDatasetUpdate::with_pool("backup"));
    }

    #[test]
    fn record_update_only_touches_given_fields() {
        let mut record = SystemDatasetRecord {
            id: 1,
            pool: "tank".to_string(),
            pool_set: true,
            syslog_usedataset: true,
            uuid: Some("a".to_string()),
            uuid_b: None,
        };
        RecordUpdate { uuid_b: Some("b".to_string()), ..Default::default() }
            .apply(&mut record);
        assert_eq!(record.pool, "tank");
        assert_eq!(record.uuid.as_deref(), Some("a"));
        assert_eq!(record.uuid_b.as_deref(), Some("b"));
    }
}
