// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Traits for the services the system dataset manager sequences but does not
//! implement itself.
//!
//! Host-backed implementations live in [`crate::host`] and
//! [`crate::ledger`]; in-memory ones in `crate::fakes`.

use crate::params::{RecordUpdate, SystemDatasetRecord};
use async_trait::async_trait;
use linux_utils::filesystem;
use linux_utils::zfs::DatasetProperties;
use std::sync::Arc;

/// Pool and dataset management.
#[async_trait]
pub trait PoolService: Send + Sync + 'static {
    /// Names of the imported pools, in discovery order.
    async fn list_pools(&self) -> anyhow::Result<Vec<String>>;

    /// The boot pool, which always exists.
    fn default_pool_name(&self) -> &str;

    /// Properties of `name`, or `None` if there is no such dataset.
    async fn get_dataset(
        &self,
        name: &str,
    ) -> anyhow::Result<Option<DatasetProperties>>;

    async fn create_dataset(
        &self,
        name: &str,
        properties: &DatasetProperties,
    ) -> anyhow::Result<()>;

    async fn delete_dataset(
        &self,
        name: &str,
        recursive: bool,
        force: bool,
    ) -> anyhow::Result<()>;

    async fn set_properties(
        &self,
        name: &str,
        properties: &DatasetProperties,
    ) -> anyhow::Result<()>;

    /// True if the root dataset of `pool` uses a passphrase key or is locked.
    async fn root_is_locked_or_passphrase(
        &self,
        pool: &str,
    ) -> anyhow::Result<bool> {
        Ok(self.get_dataset(pool).await?.is_some_and(|root| {
            root.is_passphrase_encrypted() || root.is_locked()
        }))
    }
}

/// Start/stop/status control of named services.
#[async_trait]
pub trait ServiceSupervisor: Send + Sync + 'static {
    async fn is_started(&self, service: &str) -> anyhow::Result<bool>;
    async fn is_started_or_enabled(&self, service: &str)
        -> anyhow::Result<bool>;
    async fn start(&self, service: &str) -> anyhow::Result<()>;
    async fn stop(&self, service: &str) -> anyhow::Result<()>;
    async fn restart(&self, service: &str) -> anyhow::Result<()>;
}

/// Durable storage of the system dataset record and of one-shot flags.
#[async_trait]
pub trait ConfigStore: Send + Sync + 'static {
    async fn get_config(&self) -> anyhow::Result<SystemDatasetRecord>;

    /// Atomically applies `update` to record `id`.
    async fn update_config(
        &self,
        id: u64,
        update: &RecordUpdate,
    ) -> anyhow::Result<()>;

    /// Reads a boolean flag, `false` if it was never set.
    async fn get_flag(&self, key: &str) -> anyhow::Result<bool>;
}

#[async_trait]
pub trait EventBus: Send + Sync + 'static {
    async fn publish(
        &self,
        event: &str,
        payload: serde_json::Value,
    ) -> anyhow::Result<()>;
}

/// Awareness of the peer node of a failover pair.
#[async_trait]
pub trait FailoverControl: Send + Sync + 'static {
    async fn is_licensed(&self) -> anyhow::Result<bool>;
    /// True on the standby half ("node B") of a pair.
    async fn is_node_b(&self) -> anyhow::Result<bool>;
    /// True on the node currently serving as the active controller.
    async fn is_master(&self) -> anyhow::Result<bool>;
    async fn reboot_standby(&self) -> anyhow::Result<()>;
}

/// Miscellaneous hooks into the rest of the system.
#[async_trait]
pub trait SystemFacilities: Send + Sync + 'static {
    /// True once the system has finished booting.
    async fn is_ready(&self) -> anyhow::Result<bool>;

    /// True while an identity directory service is enabled.
    async fn directory_service_enabled(&self) -> anyhow::Result<bool>;

    /// Controls whether syslog may write into the system dataset.
    async fn set_syslog_dataset_eligible(
        &self,
        eligible: bool,
    ) -> anyhow::Result<()>;

    /// Stops in-process log consumers that write below the system dataset.
    async fn stop_internal_logging(&self) -> anyhow::Result<()>;

    /// Regenerates the named configuration from current state.
    async fn regenerate_config(&self, name: &str) -> anyhow::Result<()>;

    /// Prepares file-sharing state directories inside the dataset.
    async fn setup_file_sharing(&self) -> anyhow::Result<()>;

    /// Ensures the cluster-events directory and configuration exist.
    async fn init_cluster_events(&self) -> anyhow::Result<()>;
}

/// Everything the manager calls into, bundled for injection.
#[derive(Clone)]
pub struct Collaborators {
    pub pools: Arc<dyn PoolService>,
    pub services: Arc<dyn ServiceSupervisor>,
    pub store: Arc<dyn ConfigStore>,
    pub events: Arc<dyn EventBus>,
    pub failover: Arc<dyn FailoverControl>,
    pub system: Arc<dyn SystemFacilities>,
    pub fs: Arc<dyn filesystem::Api>,
}
