// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Collaborators backed by the running host.

use crate::config::{Config, MountConfig};
use crate::dataset::CTDB_SHARED_VOL;
use crate::facilities::{
    Collaborators, ConfigStore, EventBus, FailoverControl, PoolService,
    ServiceSupervisor, SystemFacilities,
};
use anyhow::bail;
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use linux_utils::filesystem::HostFilesystem;
use linux_utils::host::BoxedExecutor;
use linux_utils::svc::Systemctl;
use linux_utils::zfs::{DatasetProperties, DestroyDatasetErrorVariant, Zfs};
use linux_utils::zpool::Zpool;
use slog::{debug, info, o, Logger};
use std::io;
use std::sync::Arc;

/// Properties fetched for every dataset inspected.
const DATASET_PROPERTIES: &[&str] = &[
    "used",
    "available",
    "mountpoint",
    "readonly",
    "snapdir",
    "quota",
    "acltype",
    "keyformat",
    "keystatus",
];

/// Present in the runtime directory while syslog must not log to the
/// system dataset.
pub const SYSLOG_DATASET_DISABLED: &str = "syslog_dataset_disabled";

const READY_TARGET: &str = "multi-user.target";
const CLUSTER_EVENTS_DIR: &str = "cluster_events";

/// Builds the host collaborators described by `config`.
pub fn host_collaborators(
    log: &Logger,
    config: &Config,
    executor: BoxedExecutor,
    store: Arc<dyn ConfigStore>,
) -> Collaborators {
    Collaborators {
        pools: Arc::new(ZfsPoolService::new(
            log,
            executor.clone(),
            &config.boot_pool,
        )),
        services: Arc::new(SystemdSupervisor::new(log, executor.clone())),
        store,
        events: Arc::new(LogEventBus::new(log)),
        failover: Arc::new(StandaloneFailover::new(config.failover_licensed)),
        system: Arc::new(HostSystem::new(
            log,
            executor.clone(),
            config.paths.clone(),
            config.runtime_dir.clone(),
            config.directory_service.clone(),
        )),
        fs: Arc::new(HostFilesystem::new(log, executor)),
    }
}

/// [`PoolService`] implemented with `zpool` and `zfs`.
pub struct ZfsPoolService {
    log: Logger,
    executor: BoxedExecutor,
    boot_pool: String,
}

impl ZfsPoolService {
    pub fn new(
        log: &Logger,
        executor: BoxedExecutor,
        boot_pool: &str,
    ) -> Self {
        Self {
            log: log.new(o!("component" => "ZfsPoolService")),
            executor,
            boot_pool: boot_pool.to_string(),
        }
    }
}

#[async_trait]
impl PoolService for ZfsPoolService {
    async fn list_pools(&self) -> anyhow::Result<Vec<String>> {
        Ok(Zpool::list(&self.executor)
            .await?
            .into_iter()
            .map(|pool| pool.name().to_string())
            .filter(|name| *name != self.boot_pool)
            .collect())
    }

    fn default_pool_name(&self) -> &str {
        &self.boot_pool
    }

    async fn get_dataset(
        &self,
        name: &str,
    ) -> anyhow::Result<Option<DatasetProperties>> {
        Ok(Zfs::get_properties(&self.executor, name, DATASET_PROPERTIES)
            .await?)
    }

    async fn create_dataset(
        &self,
        name: &str,
        properties: &DatasetProperties,
    ) -> anyhow::Result<()> {
        Zfs::create_dataset(&self.executor, name, properties).await?;
        Ok(())
    }

    async fn delete_dataset(
        &self,
        name: &str,
        recursive: bool,
        force: bool,
    ) -> anyhow::Result<()> {
        let result =
            Zfs::destroy_dataset(&self.executor, name, recursive, force).await;
        match result {
            Ok(()) => Ok(()),
            Err(err)
                if matches!(err.err, DestroyDatasetErrorVariant::NotFound) =>
            {
                debug!(self.log, "Dataset already gone"; "dataset" => name);
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn set_properties(
        &self,
        name: &str,
        properties: &DatasetProperties,
    ) -> anyhow::Result<()> {
        Zfs::set_properties(&self.executor, name, properties).await?;
        Ok(())
    }
}

/// [`ServiceSupervisor`] implemented with `systemctl`.
pub struct SystemdSupervisor {
    log: Logger,
    executor: BoxedExecutor,
}

impl SystemdSupervisor {
    pub fn new(log: &Logger, executor: BoxedExecutor) -> Self {
        Self { log: log.new(o!("component" => "SystemdSupervisor")), executor }
    }

    /// Maps a service name to the systemd unit providing it.
    pub fn unit_for(service: &str) -> &str {
        match service {
            "cifs" => "smbd",
            "syslogd" => "syslog-ng",
            "idmap" => "winbind",
            "webdav" => "apache2",
            other => other,
        }
    }
}

#[async_trait]
impl ServiceSupervisor for SystemdSupervisor {
    async fn is_started(&self, service: &str) -> anyhow::Result<bool> {
        let unit = Self::unit_for(service);
        Ok(Systemctl::is_active(&self.executor, unit).await?)
    }

    async fn is_started_or_enabled(
        &self,
        service: &str,
    ) -> anyhow::Result<bool> {
        let unit = Self::unit_for(service);
        Ok(Systemctl::is_active(&self.executor, unit).await?
            || Systemctl::is_enabled(&self.executor, unit).await?)
    }

    async fn start(&self, service: &str) -> anyhow::Result<()> {
        let unit = Self::unit_for(service);
        debug!(self.log, "Starting unit"; "unit" => unit);
        Ok(Systemctl::start(&self.executor, unit).await?)
    }

    async fn stop(&self, service: &str) -> anyhow::Result<()> {
        let unit = Self::unit_for(service);
        debug!(self.log, "Stopping unit"; "unit" => unit);
        Ok(Systemctl::stop(&self.executor, unit).await?)
    }

    async fn restart(&self, service: &str) -> anyhow::Result<()> {
        let unit = Self::unit_for(service);
        debug!(self.log, "Restarting unit"; "unit" => unit);
        Ok(Systemctl::restart(&self.executor, unit).await?)
    }
}

/// [`EventBus`] that records events in the log.
pub struct LogEventBus {
    log: Logger,
}

impl LogEventBus {
    pub fn new(log: &Logger) -> Self {
        Self { log: log.new(o!("component" => "LogEventBus")) }
    }
}

#[async_trait]
impl EventBus for LogEventBus {
    async fn publish(
        &self,
        event: &str,
        payload: serde_json::Value,
    ) -> anyhow::Result<()> {
        info!(self.log, "Event"; "event" => event, "payload" => %payload);
        Ok(())
    }
}

/// [`FailoverControl`] for a system without a peer controller.
pub struct StandaloneFailover {
    licensed: bool,
}

impl StandaloneFailover {
    pub fn new(licensed: bool) -> Self {
        Self { licensed }
    }
}

#[async_trait]
impl FailoverControl for StandaloneFailover {
    async fn is_licensed(&self) -> anyhow::Result<bool> {
        Ok(self.licensed)
    }

    async fn is_node_b(&self) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn is_master(&self) -> anyhow::Result<bool> {
        Ok(true)
    }

    async fn reboot_standby(&self) -> anyhow::Result<()> {
        bail!("no standby controller is reachable from this node")
    }
}

/// [`SystemFacilities`] of a standalone Linux host.
pub struct HostSystem {
    log: Logger,
    executor: BoxedExecutor,
    paths: MountConfig,
    runtime_dir: Utf8PathBuf,
    directory_service: String,
}

impl HostSystem {
    pub fn new(
        log: &Logger,
        executor: BoxedExecutor,
        paths: MountConfig,
        runtime_dir: Utf8PathBuf,
        directory_service: String,
    ) -> Self {
        Self {
            log: log.new(o!("component" => "HostSystem")),
            executor,
            paths,
            runtime_dir,
            directory_service,
        }
    }

    fn syslog_marker(&self) -> Utf8PathBuf {
        self.runtime_dir.join(SYSLOG_DATASET_DISABLED)
    }
}

async fn create_dir(path: &Utf8Path) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(path).await.map_err(|err| {
        anyhow::Error::new(err).context(format!("creating {path}"))
    })
}

#[async_trait]
impl SystemFacilities for HostSystem {
    async fn is_ready(&self) -> anyhow::Result<bool> {
        Ok(Systemctl::is_active(&self.executor, READY_TARGET).await?)
    }

    async fn directory_service_enabled(&self) -> anyhow::Result<bool> {
        Ok(Systemctl::is_active(&self.executor, &self.directory_service)
            .await?)
    }

    async fn set_syslog_dataset_eligible(
        &self,
        eligible: bool,
    ) -> anyhow::Result<()> {
        let marker = self.syslog_marker();
        if eligible {
            match tokio::fs::remove_file(&marker).await {
                Ok(()) => (),
                Err(err) if err.kind() == io::ErrorKind::NotFound => (),
                Err(err) => {
                    return Err(anyhow::Error::new(err)
                        .context(format!("removing {marker}")));
                }
            }
        } else {
            create_dir(&self.runtime_dir).await?;
            tokio::fs::write(&marker, b"").await.map_err(|err| {
                anyhow::Error::new(err).context(format!("writing {marker}"))
            })?;
        }
        debug!(
            self.log,
            "Set syslog dataset eligibility";
            "eligible" => eligible,
        );
        Ok(())
    }

    async fn stop_internal_logging(&self) -> anyhow::Result<()> {
        // This process only logs to its configured sink, never to the
        // system dataset.
        debug!(self.log, "No internal log consumers to detach");
        Ok(())
    }

    async fn regenerate_config(&self, name: &str) -> anyhow::Result<()> {
        debug!(
            self.log,
            "Configuration regeneration requested";
            "name" => name,
        );
        Ok(())
    }

    async fn setup_file_sharing(&self) -> anyhow::Result<()> {
        create_dir(&self.paths.system.join("samba4").join("private")).await
    }

    async fn init_cluster_events(&self) -> anyhow::Result<()> {
        create_dir(
            &self.paths.system.join(CTDB_SHARED_VOL).join(CLUSTER_EVENTS_DIR),
        )
        .await
    }
}
