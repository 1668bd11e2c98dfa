// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The system dataset lifecycle manager: keeps the dataset mounted at its
//! stable path and moves it between pools.

use crate::config::MountConfig;
use crate::dataset::{self, datasets_for, CORES, CORES_QUOTA_BYTES};
use crate::error::{Error, ValidationError};
use crate::facilities::Collaborators;
use crate::mount::{unmount_mode, MountManager};
use crate::params::{
    OrchestratorState, RecordUpdate, SystemDatasetConfig, SystemDatasetRecord,
    SystemDatasetUpdate,
};
use crate::pool::{
    check_destination_feasible, eligible_pools, pick_automatic_pool,
    resolve_effective_pool,
};
use crate::quiesce::{with_quiesced_services, SYSLOG_SERVICE};
use camino::Utf8Path;
use futures::future::BoxFuture;
use futures::FutureExt;
use linux_utils::filesystem::{PathKind, UnmountError};
use linux_utils::zfs::DatasetProperties;
use serde_json::json;
use slog::{debug, error, info, o, warn, Logger};
use slog_error_chain::InlineErrorChain;
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

/// One-shot flag set after an upgrade; stale cores are purged while set.
pub const RUN_MIGRATION_FLAG: &str = "run_migration";

pub const EVENT_MIGRATED: &str = "system.dataset.migrated";
pub const EVENT_SETUP: &str = "system.dataset.setup";

const CORE_DIR_MODE: u32 = 0o775;

/// Services restarted in the background once new datasets are mounted.
/// Restarting rrdcached brings collectd back with it.
const RESTART_AFTER_MOUNT: [&str; 2] = ["rrdcached", SYSLOG_SERVICE];

// How an update wants the pool changed.
enum PoolRequest {
    Keep,
    Automatic,
    Explicit(String),
}

impl PoolRequest {
    fn from_update(update: &SystemDatasetUpdate) -> Self {
        match &update.pool {
            None => PoolRequest::Keep,
            Some(Some(pool)) if !pool.is_empty() => {
                PoolRequest::Explicit(pool.clone())
            }
            Some(_) => PoolRequest::Automatic,
        }
    }
}

/// Owns the system dataset.
///
/// [`update`](Self::update), [`setup`](Self::setup) and
/// [`migrate`](Self::migrate) are serialized by the `sysdataset_update`
/// lock. Read-only queries do not take it and may observe a migration in
/// progress.
pub struct SystemDatasetManager {
    log: Logger,
    paths: MountConfig,
    collab: Collaborators,
    mounts: MountManager,
    update_lock: Mutex<()>,
    // Held while a missing instance id is generated and persisted.
    uuid_lock: Mutex<()>,
    // Overrides the configured pool for the rest of one setup pass when the
    // configured pool's root dataset is unavailable.
    forced_pool: watch::Sender<Option<String>>,
    state: watch::Sender<OrchestratorState>,
}

impl SystemDatasetManager {
    pub fn new(
        log: &Logger,
        paths: MountConfig,
        collab: Collaborators,
    ) -> Self {
        let log = log.new(o!("component" => "SystemDatasetManager"));
        let mounts =
            MountManager::new(&log, collab.fs.clone(), paths.coredump.clone());
        Self {
            log,
            paths,
            collab,
            mounts,
            update_lock: Mutex::new(()),
            uuid_lock: Mutex::new(()),
            forced_pool: watch::channel(None).0,
            state: watch::channel(OrchestratorState::Idle).0,
        }
    }

    /// The orchestrator's current state.
    pub fn state(&self) -> OrchestratorState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<OrchestratorState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: OrchestratorState) {
        debug!(self.log, "State change"; "state" => ?state);
        self.state.send_replace(state);
    }

    fn finish<T>(&self, result: &Result<T, Error>) {
        match result {
            Ok(_) => self.set_state(OrchestratorState::Idle),
            Err(err) => {
                let error = InlineErrorChain::new(err).to_string();
                warn!(
                    self.log,
                    "System dataset operation failed";
                    "error" => &error,
                );
                self.set_state(OrchestratorState::Failed { error });
            }
        }
    }

    /// Returns the current configuration, resolved against the running
    /// system.
    pub async fn config(&self) -> Result<SystemDatasetConfig, Error> {
        Ok(self.resolve().await?.1)
    }

    async fn resolve(
        &self,
    ) -> Result<(SystemDatasetRecord, SystemDatasetConfig), Error> {
        let c = &self.collab;
        let record = c.store.get_config().await.map_err(|err| {
            Error::facility("read system dataset record", err)
        })?;
        let forced = self.forced_pool.borrow().clone();
        let pool = resolve_effective_pool(
            &record.pool,
            forced.as_deref(),
            c.pools.default_pool_name(),
        )
        .to_string();

        let is_node_b = c
            .failover
            .is_node_b()
            .await
            .map_err(|err| Error::facility("query failover node", err))?;
        let mine = if is_node_b { &record.uuid_b } else { &record.uuid };
        let uuid = match mine.as_deref().filter(|uuid| !uuid.is_empty()) {
            Some(uuid) => uuid.to_string(),
            None => self.generate_uuid(record.id, is_node_b).await?,
        };
        let (uuid_a, uuid_b) = if is_node_b {
            (record.uuid.clone().unwrap_or_default(), Some(uuid.clone()))
        } else {
            (uuid.clone(), record.uuid_b.clone())
        };

        let path = if c.fs.is_mountpoint(&self.paths.system).await? {
            Some(self.paths.system.clone())
        } else {
            None
        };

        let config = SystemDatasetConfig {
            id: record.id,
            basename: dataset::basename(&pool),
            pool,
            pool_set: record.pool_set && !record.pool.is_empty(),
            uuid,
            uuid_a,
            uuid_b,
            syslog: record.syslog_usedataset,
            path,
        };
        Ok((record, config))
    }

    async fn generate_uuid(
        &self,
        id: u64,
        is_node_b: bool,
    ) -> Result<String, Error> {
        let _guard = self.uuid_lock.lock().await;
        // Another caller may have persisted one while we waited.
        let record = self.collab.store.get_config().await.map_err(|err| {
            Error::facility("read system dataset record", err)
        })?;
        let existing = if is_node_b { record.uuid_b } else { record.uuid };
        if let Some(uuid) = existing.filter(|uuid| !uuid.is_empty()) {
            return Ok(uuid);
        }

        let uuid = Uuid::new_v4().simple().to_string();
        let update = if is_node_b {
            RecordUpdate { uuid_b: Some(uuid.clone()), ..Default::default() }
        } else {
            RecordUpdate { uuid: Some(uuid.clone()), ..Default::default() }
        };
        self.collab
            .store
            .update_config(id, &update)
            .await
            .map_err(|err| Error::facility("persist instance id", err))?;
        info!(
            self.log,
            "Generated system dataset instance id";
            "uuid" => &uuid,
            "node_b" => is_node_b,
        );
        Ok(uuid)
    }

    /// Applies a configuration change, relocating the dataset if its pool
    /// changes, and returns the resulting configuration.
    pub async fn update(
        &self,
        update: SystemDatasetUpdate,
    ) -> Result<SystemDatasetConfig, Error> {
        let _guard = self.update_lock.lock().await;
        debug!(self.log, "Acquired lock"; "lock" => "sysdataset_update");
        let result = self.update_locked(update).await;
        self.finish(&result);
        result
    }

    /// Re-synchronizes the mounted dataset with the configuration.
    /// Idempotent.
    pub async fn setup(
        &self,
        exclude_pool: Option<&str>,
    ) -> Result<SystemDatasetConfig, Error> {
        let _guard = self.update_lock.lock().await;
        debug!(self.log, "Acquired lock"; "lock" => "sysdataset_update");
        let result = self.setup_locked(exclude_pool).await;
        self.finish(&result);
        result
    }

    /// Moves the dataset's contents from `from` to `to` and mounts `to` at
    /// the stable path. An empty `from` mounts `to` directly.
    pub async fn migrate(&self, from: &str, to: &str) -> Result<(), Error> {
        let _guard = self.update_lock.lock().await;
        debug!(self.log, "Acquired lock"; "lock" => "sysdataset_update");
        let result = self.migrate_locked(from, to).await;
        self.finish(&result);
        result
    }

    /// Pools the dataset may be placed on, as a name-to-name map.
    pub async fn pool_choices(
        &self,
    ) -> Result<BTreeMap<String, String>, Error> {
        let pools = &self.collab.pools;
        let current = self.config().await?.pool;
        let mut choices =
            BTreeSet::from([pools.default_pool_name().to_string(), current]);
        let imported = pools
            .list_pools()
            .await
            .map_err(|err| Error::facility("list pools", err))?;
        choices.extend(eligible_pools(pools.as_ref(), &imported, None).await?);
        Ok(choices.into_iter().map(|pool| (pool.clone(), pool)).collect())
    }

    /// Reports whether the dataset currently lives on the boot pool.
    pub async fn is_boot_pool(&self) -> Result<bool, Error> {
        let pool = self.config().await?.pool;
        if pool.is_empty() {
            return Err(Error::Call(
                "System dataset pool is not set. This may prevent system \
                 services from functioning properly."
                    .to_string(),
            ));
        }
        Ok(pool == self.collab.pools.default_pool_name())
    }

    // Must be called with `update_lock` held.
    async fn update_locked(
        &self,
        update: SystemDatasetUpdate,
    ) -> Result<SystemDatasetConfig, Error> {
        self.set_state(OrchestratorState::Validating);
        let (record, config) = self.resolve().await?;
        let pools = &self.collab.pools;
        let boot_pool = pools.default_pool_name().to_string();
        let request = PoolRequest::from_update(&update);

        let mut new_pool = match &request {
            PoolRequest::Keep => config.pool.clone(),
            PoolRequest::Automatic => String::new(),
            PoolRequest::Explicit(pool) => pool.clone(),
        };

        if new_pool != config.pool {
            self.check_relocation_policy().await?;
            if !new_pool.is_empty() {
                check_destination_feasible(
                    pools.as_ref(),
                    &config.basename,
                    &new_pool,
                )
                .await?;
            }
        }

        if !new_pool.is_empty() && new_pool != boot_pool {
            let imported = pools
                .list_pools()
                .await
                .map_err(|err| Error::facility("list pools", err))?;
            if !imported.contains(&new_pool) {
                return Err(ValidationError::PoolNotFound(new_pool).into());
            }
            let locked = pools
                .root_is_locked_or_passphrase(&new_pool)
                .await
                .map_err(|err| {
                    Error::facility(format!("inspect pool {new_pool}"), err)
                })?;
            if locked {
                return Err(ValidationError::PoolLocked(new_pool).into());
            }
        } else if new_pool.is_empty() {
            self.set_state(OrchestratorState::AutoSelecting);
            new_pool = self
                .auto_select(update.pool_exclude.as_deref(), &config.basename)
                .await?
                .unwrap_or_default();
        }

        self.set_state(OrchestratorState::Applying);
        let record_update = RecordUpdate {
            pool: match request {
                PoolRequest::Keep => None,
                _ => Some(new_pool.clone()),
            },
            pool_set: match request {
                PoolRequest::Keep => None,
                PoolRequest::Automatic => Some(false),
                PoolRequest::Explicit(_) => Some(true),
            },
            syslog_usedataset: update.syslog,
            ..Default::default()
        };
        self.collab
            .store
            .update_config(record.id, &record_update)
            .await
            .map_err(|err| {
                Error::facility("update system dataset record", err)
            })?;
        let new_config = self.config().await?;
        info!(
            self.log,
            "Updated system dataset configuration";
            "pool" => &new_config.pool,
            "pool_set" => new_config.pool_set,
            "syslog" => new_config.syslog,
        );

        if config.pool != new_config.pool {
            if let Err(err) =
                self.migrate_locked(&config.pool, &new_config.pool).await
            {
                self.restore_pool(&record).await;
                return Err(err);
            }
        }

        self.setup_locked(update.pool_exclude.as_deref()).await?;

        if config.syslog != new_config.syslog {
            self.collab
                .services
                .restart(SYSLOG_SERVICE)
                .await
                .map_err(|err| Error::facility("restart syslogd", err))?;
        }

        self.reboot_standby_if_active().await;
        self.config().await
    }

    // Puts the stored pool back after a failed migration, so the dataset
    // still mounted at the stable path is the configured one.
    async fn restore_pool(&self, previous: &SystemDatasetRecord) {
        let update = RecordUpdate {
            pool: Some(previous.pool.clone()),
            pool_set: Some(previous.pool_set),
            ..Default::default()
        };
        match self.collab.store.update_config(previous.id, &update).await {
            Ok(()) => info!(
                self.log,
                "Restored system dataset pool after failed migration";
                "pool" => &previous.pool,
            ),
            Err(err) => error!(
                self.log,
                "Failed to restore system dataset pool";
                "pool" => &previous.pool,
                "error" => InlineErrorChain::new(&*err),
            ),
        }
    }

    async fn check_relocation_policy(&self) -> Result<(), Error> {
        let system = &self.collab.system;
        let ready = system
            .is_ready()
            .await
            .map_err(|err| Error::facility("query system readiness", err))?;
        if !ready {
            return Ok(());
        }
        let directory_service = system
            .directory_service_enabled()
            .await
            .map_err(|err| Error::facility("query directory service", err))?;
        if directory_service {
            return Err(ValidationError::PolicyViolation.into());
        }
        Ok(())
    }

    /// Picks the first imported pool, in discovery order, that automatic
    /// selection may use and that has room for the dataset named `basename`.
    async fn auto_select(
        &self,
        exclude: Option<&str>,
        basename: &str,
    ) -> Result<Option<String>, Error> {
        let pools = &self.collab.pools;
        let mut candidates = pools
            .list_pools()
            .await
            .map_err(|err| Error::facility("list pools", err))?;
        while let Some(pool) =
            pick_automatic_pool(pools.as_ref(), &candidates, exclude).await?
        {
            match check_destination_feasible(pools.as_ref(), basename, &pool)
                .await
            {
                Ok(()) => {
                    info!(self.log, "Selected pool"; "pool" => &pool);
                    return Ok(Some(pool));
                }
                Err(Error::Validation(reason)) => {
                    debug!(
                        self.log,
                        "Skipping pool";
                        "pool" => &pool,
                        "reason" => %reason,
                    );
                    candidates.retain(|candidate| *candidate != pool);
                }
                Err(err) => return Err(err),
            }
        }
        info!(self.log, "No eligible pool; falling back to the boot pool");
        Ok(None)
    }

    // Must be called with `update_lock` held. Boxed because setup and update
    // may invoke each other.
    fn setup_locked<'a>(
        &'a self,
        exclude_pool: Option<&'a str>,
    ) -> BoxFuture<'a, Result<SystemDatasetConfig, Error>> {
        async move {
            self.forced_pool.send_replace(None);
            let (record, mut config) = self.resolve().await?;
            let pools = &self.collab.pools;
            let boot_pool = pools.default_pool_name().to_string();
            let imported = pools
                .list_pools()
                .await
                .map_err(|err| Error::facility("list pools", err))?;

            if config.pool != boot_pool && !imported.contains(&config.pool) {
                info!(
                    self.log,
                    "Configured pool does not exist, moving system dataset";
                    "pool" => &config.pool,
                );
                return self
                    .update_locked(SystemDatasetUpdate::automatic(exclude_pool))
                    .await;
            }

            if record.pool.is_empty() {
                if let Some(pool) =
                    self.auto_select(exclude_pool, &config.basename).await?
                {
                    info!(
                        self.log,
                        "System dataset pool was not set, moving it to the \
                         first available pool";
                        "pool" => pool,
                    );
                    return self
                        .update_locked(SystemDatasetUpdate::automatic(
                            exclude_pool,
                        ))
                        .await;
                }
            }

            if config.pool != boot_pool {
                let pool = &config.pool;
                let root = pools.get_dataset(pool).await.map_err(|err| {
                    Error::facility(format!("inspect pool {pool}"), err)
                })?;
                if root.map_or(true, |root| root.is_locked()) {
                    info!(
                        self.log,
                        "Root dataset of pool is not available, temporarily \
                         setting up system dataset on the boot pool";
                        "pool" => &config.pool,
                    );
                    self.forced_pool.send_replace(Some(boot_pool.clone()));
                    config = self.config().await?;
                }
            }

            self.set_state(OrchestratorState::Finalizing);
            let system_path = &self.paths.system;
            let mounted_pool = self
                .collab
                .fs
                .mounted_source(system_path)
                .await?
                .map(|source| {
                    source.split('/').next().unwrap_or_default().to_string()
                });

            let mut mounted = None;
            match mounted_pool {
                Some(old) if old != config.pool => {
                    info!(
                        self.log,
                        "Abandoning system dataset";
                        "old_pool" => &old,
                        "new_pool" => &config.pool,
                    );
                    let mode = unmount_mode(self.failover_licensed().await?);
                    let old = old.as_str();
                    let pool = config.pool.as_str();
                    let uuid = config.uuid.as_str();
                    let newly_mounted = with_quiesced_services(
                        &self.log,
                        self.collab.services.clone(),
                        self.collab.system.clone(),
                        move || async move {
                            let mounts = &self.mounts;
                            mounts.ensure_unmounted(old, uuid, mode).await?;
                            self.setup_datasets(pool, uuid).await?;
                            self.mount_tree(pool, uuid, system_path).await
                        },
                    )
                    .await?;
                    mounted = Some(newly_mounted);
                }
                _ => self.setup_datasets(&config.pool, &config.uuid).await?,
            }

            self.ensure_system_path().await?;
            self.disable_acl(&config.basename).await?;

            let mounted = match mounted {
                Some(mounted) => mounted,
                None => {
                    self.mount_tree(&config.pool, &config.uuid, system_path)
                        .await?
                }
            };

            self.setup_core_path().await?;
            self.collab
                .system
                .regenerate_config("glusterd")
                .await
                .map_err(|err| Error::facility("regenerate glusterd", err))?;

            if mounted {
                for service in RESTART_AFTER_MOUNT {
                    self.restart_in_background(service);
                }
                self.collab.system.setup_file_sharing().await.map_err(
                    |err| Error::facility("set up file sharing", err),
                )?;
            }

            self.publish(
                EVENT_SETUP,
                json!({ "pool": &config.pool, "mounted": mounted }),
            )
            .await;
            self.config().await
        }
        .boxed()
    }

    // Must be called with `update_lock` held.
    async fn migrate_locked(&self, from: &str, to: &str) -> Result<(), Error> {
        self.set_state(OrchestratorState::Migrating {
            from: from.to_string(),
            to: to.to_string(),
        });
        info!(self.log, "Migrating system dataset"; "from" => from, "to" => to);
        let config = self.config().await?;
        let uuid = config.uuid.as_str();
        let system_path = &self.paths.system;
        let scratch = &self.paths.scratch;

        self.setup_datasets(to, uuid).await?;

        if from.is_empty() {
            self.mount_tree(to, uuid, system_path).await?;
            self.publish(EVENT_MIGRATED, json!({ "from": from, "to": to }))
                .await;
            return Ok(());
        }

        self.prepare_scratch().await?;
        self.mount_tree(to, uuid, scratch).await?;

        let mode = unmount_mode(self.failover_licensed().await?);
        with_quiesced_services(
            &self.log,
            self.collab.services.clone(),
            self.collab.system.clone(),
            move || async move {
                // Nothing may be torn down until the copy has succeeded.
                self.collab
                    .fs
                    .archive_copy(system_path, scratch)
                    .await
                    .map_err(Error::MigrationCopyFailed)?;

                let teardown = async {
                    self.mounts.ensure_unmounted(from, uuid, mode).await?;
                    self.mounts.ensure_unmounted(to, uuid, mode).await
                };
                if let Err(err) = teardown.await {
                    // Put the old tree back before services restart.
                    self.remount_after_failed_teardown(from, uuid).await;
                    return Err(err);
                }
                self.mount_tree(to, uuid, system_path).await?;

                self.destroy_old_datasets(from).await;
                if let Err(err) = self.collab.fs.remove_dir(scratch).await {
                    warn!(
                        self.log,
                        "Failed to remove scratch directory";
                        "path" => %scratch,
                        "error" => InlineErrorChain::new(&err),
                    );
                }
                Ok::<_, Error>(())
            },
        )
        .await?;

        info!(self.log, "Migrated system dataset"; "from" => from, "to" => to);
        self.publish(EVENT_MIGRATED, json!({ "from": from, "to": to })).await;
        Ok(())
    }

    async fn remount_after_failed_teardown(&self, pool: &str, uuid: &str) {
        let system_path = &self.paths.system;
        match self.mounts.ensure_mounted(pool, uuid, system_path).await {
            Ok(remounted) => info!(
                self.log,
                "Restored system dataset after failed unmount";
                "pool" => pool,
                "remounted" => remounted,
            ),
            Err(err) => error!(
                self.log,
                "Failed to restore system dataset after failed unmount";
                "pool" => pool,
                "error" => InlineErrorChain::new(&err),
            ),
        }
        if let Err(err) = self.bind_coredump().await {
            warn!(
                self.log,
                "Failed to restore coredump path";
                "error" => InlineErrorChain::new(&err),
            );
        }
    }

    async fn failover_licensed(&self) -> Result<bool, Error> {
        self.collab
            .failover
            .is_licensed()
            .await
            .map_err(|err| Error::facility("query failover license", err))
    }

    /// Makes sure every dataset of the tree on `pool` exists with the
    /// expected properties.
    async fn setup_datasets(
        &self,
        pool: &str,
        uuid: &str,
    ) -> Result<(), Error> {
        let pools = &self.collab.pools;
        for spec in datasets_for(pool, uuid) {
            let wanted = spec.properties();
            let existing = pools.get_dataset(&spec.name).await.map_err(|err| {
                Error::facility(format!("inspect {}", spec.name), err)
            })?;
            match existing {
                None => {
                    let name = &spec.name;
                    pools.create_dataset(name, &wanted).await.map_err(
                        |err| Error::facility(format!("create {name}"), err),
                    )?;
                    debug!(self.log, "Created dataset"; "dataset" => name);
                }
                Some(props)
                    if spec.is_cores()
                        && props.used().unwrap_or(0) >= CORES_QUOTA_BYTES =>
                {
                    if let Err(err) =
                        self.replace_dataset(&spec.name, &wanted).await
                    {
                        warn!(
                            self.log,
                            "Failed to replace dataset";
                            "dataset" => &spec.name,
                            "error" => InlineErrorChain::new(&*err),
                        );
                    }
                }
                Some(props) => {
                    let changed: DatasetProperties = wanted
                        .iter()
                        .filter(|(key, value)| props.get(key) != Some(*value))
                        .collect();
                    if !changed.is_empty() {
                        let name = &spec.name;
                        pools.set_properties(name, &changed).await.map_err(
                            |err| {
                                Error::facility(
                                    format!("set properties of {name}"),
                                    err,
                                )
                            },
                        )?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn replace_dataset(
        &self,
        name: &str,
        properties: &DatasetProperties,
    ) -> anyhow::Result<()> {
        let pools = &self.collab.pools;
        pools.delete_dataset(name, true, true).await?;
        pools.create_dataset(name, properties).await?;
        info!(self.log, "Replaced full dataset"; "dataset" => name);
        Ok(())
    }

    async fn disable_acl(&self, basename: &str) -> Result<(), Error> {
        let pools = &self.collab.pools;
        let Some(props) = pools.get_dataset(basename).await.map_err(|err| {
            Error::facility(format!("inspect {basename}"), err)
        })?
        else {
            return Ok(());
        };
        if props.get("acltype") != Some("off") {
            let off: DatasetProperties =
                [("acltype", "off")].into_iter().collect();
            pools.set_properties(basename, &off).await.map_err(|err| {
                Error::facility(format!("disable ACLs on {basename}"), err)
            })?;
        }
        Ok(())
    }

    /// Mounts the tree and makes sure the cluster-events directory exists.
    async fn mount_tree(
        &self,
        pool: &str,
        uuid: &str,
        target: &Utf8Path,
    ) -> Result<bool, Error> {
        let mounted = self.mounts.ensure_mounted(pool, uuid, target).await?;
        if let Err(err) = self.collab.system.init_cluster_events().await {
            error!(
                self.log,
                "Failed to initialize cluster events directory";
                "error" => InlineErrorChain::new(&*err),
            );
        }
        Ok(mounted)
    }

    async fn ensure_system_path(&self) -> Result<(), Error> {
        let fs = &self.collab.fs;
        let path = &self.paths.system;
        let kind =
            fs.path_kind(path).await.map_err(|err| Error::io(path, err))?;
        match kind {
            PathKind::Directory => return Ok(()),
            PathKind::Other => {
                fs.remove_file(path).await.map_err(|err| Error::io(path, err))?
            }
            PathKind::Missing => (),
        }
        fs.create_dir_all(path).await.map_err(|err| Error::io(path, err))
    }

    /// Clears any scratch mount left by an earlier attempt.
    async fn prepare_scratch(&self) -> Result<(), Error> {
        let fs = &self.collab.fs;
        let scratch = &self.paths.scratch;
        let kind = fs
            .path_kind(scratch)
            .await
            .map_err(|err| Error::io(scratch, err))?;
        if kind == PathKind::Missing {
            return fs
                .create_dir_all(scratch)
                .await
                .map_err(|err| Error::io(scratch, err));
        }
        match fs.unmount_recursive(scratch).await {
            Ok(()) | Err(UnmountError::NotMounted { .. }) => (),
            Err(err) => warn!(
                self.log,
                "Failed to clear scratch mounts";
                "path" => %scratch,
                "error" => InlineErrorChain::new(&err),
            ),
        }
        Ok(())
    }

    /// Applies permissions to the `cores` child, purges stale cores when
    /// requested and binds the coredump path onto it.
    async fn setup_core_path(&self) -> Result<(), Error> {
        let fs = &self.collab.fs;
        let cores = self.paths.system.join(CORES);
        let kind =
            fs.path_kind(&cores).await.map_err(|err| Error::io(&cores, err))?;
        if kind == PathKind::Missing {
            return Ok(());
        }
        fs.set_mode(&cores, CORE_DIR_MODE)
            .await
            .map_err(|err| Error::io(&cores, err))?;

        let purge = self
            .collab
            .store
            .get_flag(RUN_MIGRATION_FLAG)
            .await
            .map_err(|err| Error::facility("read run_migration flag", err))?;
        if purge {
            self.purge_cores(&cores).await;
        }
        self.bind_coredump().await
    }

    async fn bind_coredump(&self) -> Result<(), Error> {
        let fs = &self.collab.fs;
        let cores = self.paths.system.join(CORES);
        self.mounts.unmount_coredump().await;
        let coredump = &self.paths.coredump;
        fs.create_dir_all(coredump)
            .await
            .map_err(|err| Error::io(coredump, err))?;
        if let Err(err) = fs.bind_mount(&cores, coredump).await {
            warn!(
                self.log,
                "Failed to bind coredump path";
                "path" => %coredump,
                "error" => InlineErrorChain::new(&err),
            );
        }
        Ok(())
    }

    async fn purge_cores(&self, cores: &Utf8Path) {
        let fs = &self.collab.fs;
        let result = async {
            for core in fs.read_dir(cores).await? {
                fs.remove_file(&core).await?;
            }
            Ok::<_, std::io::Error>(())
        }
        .await;
        if let Err(err) = result {
            warn!(
                self.log,
                "Failed to clear old core files";
                "error" => InlineErrorChain::new(&err),
            );
        }
    }

    async fn destroy_old_datasets(&self, pool: &str) {
        let basename = dataset::basename(pool);
        if let Err(err) =
            self.collab.pools.delete_dataset(&basename, true, false).await
        {
            warn!(
                self.log,
                "Failed to destroy old system dataset";
                "dataset" => &basename,
                "error" => InlineErrorChain::new(&*err),
            );
        }
    }

    fn restart_in_background(&self, service: &'static str) {
        let services = self.collab.services.clone();
        let log = self.log.clone();
        tokio::spawn(async move {
            if let Err(err) = services.restart(service).await {
                warn!(
                    log,
                    "Failed to restart service";
                    "service" => service,
                    "error" => InlineErrorChain::new(&*err),
                );
            }
        });
    }

    async fn reboot_standby_if_active(&self) {
        let failover = &self.collab.failover;
        let active = async {
            Ok::<_, anyhow::Error>(
                failover.is_licensed().await? && failover.is_master().await?,
            )
        }
        .await;
        let result = match active {
            Ok(true) => failover.reboot_standby().await,
            Ok(false) => return,
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            debug!(
                self.log,
                "Failed to reboot standby controller after system dataset \
                 change";
                "error" => InlineErrorChain::new(&*err),
            );
        }
    }

    async fn publish(&self, event: &str, payload: serde_json::Value) {
        if let Err(err) = self.collab.events.publish(event, payload).await {
            warn!(
                self.log,
                "Failed to publish event";
                "event" => event,
                "error" => InlineErrorChain::new(&*err),
            );
        }
    }
}
