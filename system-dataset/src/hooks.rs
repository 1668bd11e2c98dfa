// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reactions to pool lifecycle events.

use crate::error::Error;
use crate::manager::SystemDatasetManager;
use crate::params::SystemDatasetUpdate;
use futures::future::BoxFuture;
use futures::FutureExt;
use slog::{error, info, o, Logger};
use slog_error_chain::InlineErrorChain;
use std::fmt;
use std::sync::Arc;

/// A pool lifecycle event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolEvent {
    PostCreate,
    PostImport,
    PreExport,
}

impl fmt::Display for PoolEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PoolEvent::PostCreate => "pool.post_create",
            PoolEvent::PostImport => "pool.post_import",
            PoolEvent::PreExport => "pool.pre_export",
        };
        f.write_str(name)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum HookError {
    #[error("{hook} hook failed for pool {pool}")]
    Setup {
        hook: &'static str,
        pool: String,
        #[source]
        err: Error,
    },

    #[error("Unable to move the system dataset off pool {pool}")]
    Relocation {
        pool: String,
        #[source]
        err: Error,
    },
}

type Callback = for<'a> fn(
    &'a SystemDatasetManager,
    &'a str,
) -> BoxFuture<'a, Result<(), HookError>>;

/// One entry of the hook table.
pub struct Hook {
    pub event: PoolEvent,
    /// Lower runs first among hooks for the same event.
    pub order: i32,
    /// Whether a failure aborts the event rather than being logged.
    pub raise_error: bool,
    pub name: &'static str,
    callback: Callback,
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hook")
            .field("event", &self.event)
            .field("order", &self.order)
            .field("raise_error", &self.raise_error)
            .field("name", &self.name)
            .finish()
    }
}

/// The system dataset's pool hooks, fixed at startup.
pub struct HookRegistry {
    log: Logger,
    manager: Arc<SystemDatasetManager>,
    hooks: Vec<Hook>,
}

impl HookRegistry {
    pub fn new(log: &Logger, manager: Arc<SystemDatasetManager>) -> Self {
        let mut hooks = vec![
            Hook {
                event: PoolEvent::PostCreate,
                order: 0,
                raise_error: false,
                name: "sysdataset.pool_post_create",
                callback: pool_post_create,
            },
            // Runs ahead of every other import hook, since they may need the
            // system dataset in place.
            Hook {
                event: PoolEvent::PostImport,
                order: -10000,
                raise_error: false,
                name: "sysdataset.pool_post_import",
                callback: pool_post_import,
            },
            Hook {
                event: PoolEvent::PreExport,
                order: 40,
                raise_error: true,
                name: "sysdataset.pool_pre_export",
                callback: pool_pre_export,
            },
        ];
        hooks.sort_by_key(|hook| hook.order);
        Self { log: log.new(o!("component" => "HookRegistry")), manager, hooks }
    }

    /// Hooks registered for `event`, in the order they run.
    pub fn hooks(&self, event: PoolEvent) -> impl Iterator<Item = &Hook> {
        self.hooks.iter().filter(move |hook| hook.event == event)
    }

    /// Runs every hook registered for `event` on `pool`.
    pub async fn dispatch(
        &self,
        event: PoolEvent,
        pool: &str,
    ) -> Result<(), HookError> {
        for hook in self.hooks(event) {
            info!(
                self.log,
                "Running pool hook";
                "hook" => hook.name,
                "event" => %event,
                "pool" => pool,
            );
            let result = (hook.callback)(self.manager.as_ref(), pool).await;
            if let Err(err) = result {
                if hook.raise_error {
                    return Err(err);
                }
                error!(
                    self.log,
                    "Pool hook failed";
                    "hook" => hook.name,
                    "pool" => pool,
                    "error" => InlineErrorChain::new(&err),
                );
            }
        }
        Ok(())
    }
}

// Moves the dataset off the boot pool onto the first real pool.
fn pool_post_create<'a>(
    manager: &'a SystemDatasetManager,
    pool: &'a str,
) -> BoxFuture<'a, Result<(), HookError>> {
    let setup_err = |err| HookError::Setup {
        hook: "pool_post_create",
        pool: pool.to_string(),
        err,
    };
    async move {
        if manager.is_boot_pool().await.map_err(setup_err)? {
            manager.setup(None).await.map_err(setup_err)?;
        }
        Ok(())
    }
    .boxed()
}

fn pool_post_import<'a>(
    manager: &'a SystemDatasetManager,
    pool: &'a str,
) -> BoxFuture<'a, Result<(), HookError>> {
    async move {
        manager.setup(None).await.map_err(|err| HookError::Setup {
            hook: "pool_post_import",
            pool: pool.to_string(),
            err,
        })?;
        Ok(())
    }
    .boxed()
}

fn pool_pre_export<'a>(
    manager: &'a SystemDatasetManager,
    pool: &'a str,
) -> BoxFuture<'a, Result<(), HookError>> {
    let relocation_err =
        |err| HookError::Relocation { pool: pool.to_string(), err };
    async move {
        let config = manager.config().await.map_err(relocation_err)?;
        if config.pool == pool {
            manager
                .update(SystemDatasetUpdate::automatic(Some(pool)))
                .await
                .map_err(relocation_err)?;
        }
        Ok(())
    }
    .boxed()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::MountConfig;
    use crate::fakes::{FakeHost, FakeStore};
    use crate::params::{OrchestratorState, SystemDatasetRecord};
    use assert_matches::assert_matches;
    use sysds_test_utils::dev::test_setup_log;

    const GIB: u64 = 1 << 30;
    const BOOT: &str = "boot-pool";

    fn registry(log: &Logger, host: &FakeHost) -> HookRegistry {
        let manager = SystemDatasetManager::new(
            log,
            MountConfig::default(),
            host.collaborators(),
        );
        HookRegistry::new(log, Arc::new(manager))
    }

    fn on_tank() -> FakeHost {
        let mut host = FakeHost::new(BOOT);
        host.store = Arc::new(FakeStore::new(SystemDatasetRecord {
            id: 1,
            pool: "tank".to_string(),
            pool_set: true,
            ..Default::default()
        }));
        host.pools.add_pool("tank", 10 * GIB);
        host.pools.add_pool("backup", 10 * GIB);
        host
    }

    #[tokio::test]
    async fn hooks_run_in_priority_order() {
        let logctx = test_setup_log("hooks_run_in_priority_order");
        let host = FakeHost::new(BOOT);
        let hooks = registry(&logctx.log, &host);

        let order: Vec<_> = hooks.hooks.iter().map(|hook| hook.order).collect();
        assert_eq!(order, [-10000, 0, 40]);
        let export: Vec<_> = hooks.hooks(PoolEvent::PreExport).collect();
        assert_eq!(export.len(), 1);
        assert!(export[0].raise_error);
        assert!(hooks.hooks(PoolEvent::PostImport).all(|h| !h.raise_error));
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn pre_export_moves_dataset_off_the_pool() {
        let logctx = test_setup_log("pre_export_moves_dataset_off_the_pool");
        let host = on_tank();
        let hooks = registry(&logctx.log, &host);
        hooks.manager.setup(None).await.unwrap();

        // Exporting an unrelated pool leaves the dataset alone.
        hooks.dispatch(PoolEvent::PreExport, "backup").await.unwrap();
        assert_eq!(host.store.record().pool, "tank");

        hooks.dispatch(PoolEvent::PreExport, "tank").await.unwrap();
        let config = hooks.manager.config().await.unwrap();
        assert_eq!(config.pool, "backup");
        assert!(!config.pool_set);
        assert!(host.pools.datasets_under("tank/.system").is_empty());
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn failed_relocation_aborts_export() {
        let logctx = test_setup_log("failed_relocation_aborts_export");
        let host = on_tank();
        let hooks = registry(&logctx.log, &host);
        hooks.manager.setup(None).await.unwrap();
        host.fs.fail_next_copy("rsync: connection unexpectedly closed");

        let err =
            hooks.dispatch(PoolEvent::PreExport, "tank").await.unwrap_err();
        assert_matches!(
            err,
            HookError::Relocation { pool, err: Error::MigrationCopyFailed(_) }
                if pool == "tank"
        );
        assert_eq!(hooks.manager.config().await.unwrap().pool, "tank");
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn post_create_only_moves_off_the_boot_pool() {
        let logctx = test_setup_log("post_create_only_moves_off_the_boot_pool");
        let host = FakeHost::new(BOOT);
        let hooks = registry(&logctx.log, &host);
        hooks.manager.setup(None).await.unwrap();
        assert!(hooks.manager.is_boot_pool().await.unwrap());

        host.pools.add_pool("tank", 10 * GIB);
        hooks.dispatch(PoolEvent::PostCreate, "tank").await.unwrap();
        assert_eq!(hooks.manager.config().await.unwrap().pool, "tank");

        host.pools.add_pool("backup", 10 * GIB);
        hooks.dispatch(PoolEvent::PostCreate, "backup").await.unwrap();
        assert_eq!(hooks.manager.config().await.unwrap().pool, "tank");
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn post_import_failure_is_logged() {
        let logctx = test_setup_log("post_import_failure_is_logged");
        let host = FakeHost::new(BOOT);
        host.fs.fail_mounts_of("boot-pool/.system");
        let hooks = registry(&logctx.log, &host);

        hooks.dispatch(PoolEvent::PostImport, "tank").await.unwrap();
        assert_matches!(
            hooks.manager.state(),
            OrchestratorState::Failed { .. }
        );
        logctx.cleanup_successful();
    }
}
