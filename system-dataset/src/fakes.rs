// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory collaborators, for tests.

use crate::facilities::{
    Collaborators, ConfigStore, EventBus, FailoverControl, PoolService,
    ServiceSupervisor, SystemFacilities,
};
use crate::params::{RecordUpdate, SystemDatasetRecord};
use anyhow::{anyhow, bail};
use async_trait::async_trait;
use linux_utils::fakes::filesystem::Filesystem;
use linux_utils::zfs::DatasetProperties;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PoolOp {
    Create { name: String },
    Delete { name: String, recursive: bool, force: bool },
    SetProperties { name: String, properties: DatasetProperties },
}

#[derive(Default)]
struct PoolsInner {
    pools: Vec<String>,
    datasets: BTreeMap<String, DatasetProperties>,
    ops: Vec<PoolOp>,
}

/// Pools and datasets kept in memory. A pool is represented by its root
/// dataset, whose `available` property bounds what may be moved onto it.
pub struct FakePools {
    boot_pool: String,
    inner: Mutex<PoolsInner>,
}

impl FakePools {
    pub fn new(boot_pool: &str) -> Self {
        let pools =
            Self { boot_pool: boot_pool.to_string(), inner: Default::default() };
        pools.add_pool(boot_pool, 16 << 30);
        pools
    }

    /// Imports a pool with `available` free bytes.
    pub fn add_pool(&self, name: &str, available: u64) {
        let mut inner = self.inner.lock().unwrap();
        if name != self.boot_pool {
            inner.pools.push(name.to_string());
        }
        let props = [
            ("used", "0".to_string()),
            ("available", available.to_string()),
        ]
        .into_iter()
        .collect();
        inner.datasets.insert(name.to_string(), props);
    }

    pub fn lock_pool(&self, name: &str) {
        self.set_property(name, "keystatus", "unavailable");
    }

    pub fn set_property(&self, dataset: &str, key: &str, value: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .datasets
            .entry(dataset.to_string())
            .or_default()
            .insert(key, value);
    }

    /// Adds a dataset already using `used` bytes.
    pub fn add_dataset(&self, name: &str, used: u64) {
        self.set_property(name, "used", &used.to_string());
    }

    pub fn pool_names(&self) -> Vec<String> {
        self.inner.lock().unwrap().pools.clone()
    }

    pub fn dataset(&self, name: &str) -> Option<DatasetProperties> {
        self.inner.lock().unwrap().datasets.get(name).cloned()
    }

    /// Datasets at or below `name`.
    pub fn datasets_under(&self, name: &str) -> Vec<String> {
        let prefix = format!("{name}/");
        self.inner
            .lock()
            .unwrap()
            .datasets
            .keys()
            .filter(|ds| *ds == name || ds.starts_with(&prefix))
            .cloned()
            .collect()
    }

    pub fn ops(&self) -> Vec<PoolOp> {
        self.inner.lock().unwrap().ops.clone()
    }
}

#[async_trait]
impl PoolService for FakePools {
    async fn list_pools(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.pool_names())
    }

    fn default_pool_name(&self) -> &str {
        &self.boot_pool
    }

    async fn get_dataset(
        &self,
        name: &str,
    ) -> anyhow::Result<Option<DatasetProperties>> {
        Ok(self.dataset(name))
    }

    async fn create_dataset(
        &self,
        name: &str,
        properties: &DatasetProperties,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.ops.push(PoolOp::Create { name: name.to_string() });
        if inner.datasets.contains_key(name) {
            bail!("cannot create '{name}': dataset already exists");
        }
        let Some((parent, _)) = name.rsplit_once('/') else {
            bail!("cannot create '{name}': missing dataset name");
        };
        if !inner.datasets.contains_key(parent) {
            bail!("cannot create '{name}': parent does not exist");
        }
        let mut props = properties.clone();
        props.insert("used", "0");
        inner.datasets.insert(name.to_string(), props);
        Ok(())
    }

    async fn delete_dataset(
        &self,
        name: &str,
        recursive: bool,
        force: bool,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.ops.push(PoolOp::Delete {
            name: name.to_string(),
            recursive,
            force,
        });
        if !inner.datasets.contains_key(name) {
            bail!("cannot open '{name}': dataset does not exist");
        }
        let prefix = format!("{name}/");
        let has_children =
            inner.datasets.keys().any(|ds| ds.starts_with(&prefix));
        if has_children && !recursive {
            bail!("cannot destroy '{name}': filesystem has children");
        }
        inner.datasets.retain(|ds, _| ds != name && !ds.starts_with(&prefix));
        Ok(())
    }

    async fn set_properties(
        &self,
        name: &str,
        properties: &DatasetProperties,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.ops.push(PoolOp::SetProperties {
            name: name.to_string(),
            properties: properties.clone(),
        });
        let dataset = inner.datasets.get_mut(name).ok_or_else(|| {
            anyhow!("cannot open '{name}': dataset does not exist")
        })?;
        for (key, value) in properties.iter() {
            dataset.insert(key, value);
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServiceOp {
    Start(String),
    Stop(String),
    Restart(String),
}

#[derive(Default)]
struct SupervisorInner {
    running: BTreeSet<String>,
    enabled: BTreeSet<String>,
    failing: BTreeSet<String>,
    ops: Vec<ServiceOp>,
}

/// A service supervisor that records every request.
#[derive(Default)]
pub struct FakeSupervisor {
    inner: Mutex<SupervisorInner>,
}

impl FakeSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_running(&self, service: &str) {
        self.inner.lock().unwrap().running.insert(service.to_string());
    }

    pub fn set_enabled(&self, service: &str) {
        self.inner.lock().unwrap().enabled.insert(service.to_string());
    }

    /// Makes every start, stop and restart of `service` fail.
    pub fn fail(&self, service: &str) {
        self.inner.lock().unwrap().failing.insert(service.to_string());
    }

    pub fn is_running(&self, service: &str) -> bool {
        self.inner.lock().unwrap().running.contains(service)
    }

    pub fn ops(&self) -> Vec<ServiceOp> {
        self.inner.lock().unwrap().ops.clone()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                ServiceOp::Stop(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    pub fn started(&self) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                ServiceOp::Start(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    fn record(&self, op: ServiceOp) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let (ServiceOp::Start(name)
        | ServiceOp::Stop(name)
        | ServiceOp::Restart(name)) = &op;
        let name = name.clone();
        let failing = inner.failing.contains(&name);
        match &op {
            ServiceOp::Stop(_) if !failing => {
                inner.running.remove(&name);
            }
            ServiceOp::Start(_) | ServiceOp::Restart(_) if !failing => {
                inner.running.insert(name.clone());
            }
            _ => (),
        }
        inner.ops.push(op);
        if failing {
            bail!("service {name} failed");
        }
        Ok(())
    }
}

#[async_trait]
impl ServiceSupervisor for FakeSupervisor {
    async fn is_started(&self, service: &str) -> anyhow::Result<bool> {
        Ok(self.is_running(service))
    }

    async fn is_started_or_enabled(
        &self,
        service: &str,
    ) -> anyhow::Result<bool> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.running.contains(service) || inner.enabled.contains(service))
    }

    async fn start(&self, service: &str) -> anyhow::Result<()> {
        self.record(ServiceOp::Start(service.to_string()))
    }

    async fn stop(&self, service: &str) -> anyhow::Result<()> {
        self.record(ServiceOp::Stop(service.to_string()))
    }

    async fn restart(&self, service: &str) -> anyhow::Result<()> {
        self.record(ServiceOp::Restart(service.to_string()))
    }
}

/// A configuration store holding one record in memory.
pub struct FakeStore {
    record: Mutex<SystemDatasetRecord>,
    flags: Mutex<BTreeMap<String, bool>>,
    updates: AtomicUsize,
}

impl FakeStore {
    pub fn new(record: SystemDatasetRecord) -> Self {
        Self {
            record: Mutex::new(record),
            flags: Mutex::new(BTreeMap::new()),
            updates: AtomicUsize::new(0),
        }
    }

    pub fn record(&self) -> SystemDatasetRecord {
        self.record.lock().unwrap().clone()
    }

    pub fn set_flag(&self, key: &str, value: bool) {
        self.flags.lock().unwrap().insert(key.to_string(), value);
    }

    /// Number of updates applied so far.
    pub fn updates(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }
}

impl Default for FakeStore {
    fn default() -> Self {
        Self::new(SystemDatasetRecord { id: 1, ..Default::default() })
    }
}

#[async_trait]
impl ConfigStore for FakeStore {
    async fn get_config(&self) -> anyhow::Result<SystemDatasetRecord> {
        Ok(self.record())
    }

    async fn update_config(
        &self,
        id: u64,
        update: &RecordUpdate,
    ) -> anyhow::Result<()> {
        let mut record = self.record.lock().unwrap();
        if record.id != id {
            bail!("no system dataset record with id {id}");
        }
        update.apply(&mut record);
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_flag(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.flags.lock().unwrap().get(key).copied().unwrap_or(false))
    }
}

/// An event bus remembering everything published on it.
#[derive(Default)]
pub struct FakeEvents {
    published: Mutex<Vec<(String, serde_json::Value)>>,
}

impl FakeEvents {
    pub fn published(&self) -> Vec<(String, serde_json::Value)> {
        self.published.lock().unwrap().clone()
    }

    pub fn named(&self, event: &str) -> Vec<serde_json::Value> {
        self.published()
            .into_iter()
            .filter(|(name, _)| name == event)
            .map(|(_, payload)| payload)
            .collect()
    }
}

#[async_trait]
impl EventBus for FakeEvents {
    async fn publish(
        &self,
        event: &str,
        payload: serde_json::Value,
    ) -> anyhow::Result<()> {
        self.published.lock().unwrap().push((event.to_string(), payload));
        Ok(())
    }
}

/// Failover state for a single node, or for either half of a pair.
#[derive(Default)]
pub struct FakeFailover {
    pub licensed: AtomicBool,
    pub node_b: AtomicBool,
    pub master: AtomicBool,
    reboots: AtomicUsize,
}

impl FakeFailover {
    pub fn standby_reboots(&self) -> usize {
        self.reboots.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FailoverControl for FakeFailover {
    async fn is_licensed(&self) -> anyhow::Result<bool> {
        Ok(self.licensed.load(Ordering::SeqCst))
    }

    async fn is_node_b(&self) -> anyhow::Result<bool> {
        Ok(self.node_b.load(Ordering::SeqCst))
    }

    async fn is_master(&self) -> anyhow::Result<bool> {
        Ok(self.master.load(Ordering::SeqCst))
    }

    async fn reboot_standby(&self) -> anyhow::Result<()> {
        self.reboots.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// System hooks that record what was asked of them.
pub struct FakeSystem {
    pub ready: AtomicBool,
    pub directory_service: AtomicBool,
    syslog_eligible: AtomicBool,
    calls: Mutex<Vec<String>>,
}

impl Default for FakeSystem {
    fn default() -> Self {
        Self {
            ready: AtomicBool::new(true),
            directory_service: AtomicBool::new(false),
            syslog_eligible: AtomicBool::new(true),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl FakeSystem {
    pub fn syslog_eligible(&self) -> bool {
        self.syslog_eligible.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }
}

#[async_trait]
impl SystemFacilities for FakeSystem {
    async fn is_ready(&self) -> anyhow::Result<bool> {
        Ok(self.ready.load(Ordering::SeqCst))
    }

    async fn directory_service_enabled(&self) -> anyhow::Result<bool> {
        Ok(self.directory_service.load(Ordering::SeqCst))
    }

    async fn set_syslog_dataset_eligible(
        &self,
        eligible: bool,
    ) -> anyhow::Result<()> {
        self.syslog_eligible.store(eligible, Ordering::SeqCst);
        self.record(format!("syslog_eligible={eligible}"));
        Ok(())
    }

    async fn stop_internal_logging(&self) -> anyhow::Result<()> {
        self.record("stop_internal_logging");
        Ok(())
    }

    async fn regenerate_config(&self, name: &str) -> anyhow::Result<()> {
        self.record(format!("regenerate_config:{name}"));
        Ok(())
    }

    async fn setup_file_sharing(&self) -> anyhow::Result<()> {
        self.record("setup_file_sharing");
        Ok(())
    }

    async fn init_cluster_events(&self) -> anyhow::Result<()> {
        self.record("init_cluster_events");
        Ok(())
    }
}

/// A whole fake host: every collaborator, kept reachable for assertions.
pub struct FakeHost {
    pub pools: Arc<FakePools>,
    pub services: Arc<FakeSupervisor>,
    pub store: Arc<FakeStore>,
    pub events: Arc<FakeEvents>,
    pub failover: Arc<FakeFailover>,
    pub system: Arc<FakeSystem>,
    pub fs: Arc<Filesystem>,
}

impl FakeHost {
    pub fn new(boot_pool: &str) -> Self {
        Self {
            pools: Arc::new(FakePools::new(boot_pool)),
            services: Arc::new(FakeSupervisor::new()),
            store: Arc::new(FakeStore::default()),
            events: Arc::new(FakeEvents::default()),
            failover: Arc::new(FakeFailover::default()),
            system: Arc::new(FakeSystem::default()),
            fs: Arc::new(Filesystem::new()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            pools: self.pools.clone(),
            services: self.services.clone(),
            store: self.store.clone(),
            events: self.events.clone(),
            failover: self.failover.clone(),
            system: self.system.clone(),
            fs: self.fs.clone(),
        }
    }
}
