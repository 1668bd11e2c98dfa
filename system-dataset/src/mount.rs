// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mounting and unmounting the system dataset tree.

use crate::dataset::datasets_for;
use crate::error::Error;
use camino::{Utf8Path, Utf8PathBuf};
use linux_utils::filesystem::{self, PathKind, UnmountError, UnmountMode};
use slog::{debug, info, o, warn, Logger};
use slog_error_chain::InlineErrorChain;
use std::sync::Arc;

const ZFS_FSTYPE: &str = "zfs";

/// How to detach datasets: lazily on a failover-licensed system, so an
/// in-flight failover is not disrupted, forcibly otherwise.
pub fn unmount_mode(failover_licensed: bool) -> UnmountMode {
    if failover_licensed {
        UnmountMode::Lazy
    } else {
        UnmountMode::Force
    }
}

/// Mounts and unmounts the datasets returned by [`datasets_for`].
pub struct MountManager {
    log: Logger,
    fs: Arc<dyn filesystem::Api>,
    coredump: Utf8PathBuf,
}

impl MountManager {
    pub fn new(
        log: &Logger,
        fs: Arc<dyn filesystem::Api>,
        coredump: Utf8PathBuf,
    ) -> Self {
        Self { log: log.new(o!("component" => "MountManager")), fs, coredump }
    }

    /// Mounts every dataset of the tree on `pool` below `target`, root
    /// first, skipping those already mounted.
    ///
    /// Returns true if anything was newly mounted. A failed mount stops the
    /// walk but leaves earlier mounts in place.
    pub async fn ensure_mounted(
        &self,
        pool: &str,
        uuid: &str,
        target: &Utf8Path,
    ) -> Result<bool, Error> {
        let mut mounted_any = false;
        for spec in datasets_for(pool, uuid) {
            let mountpoint = spec.mountpoint(target);
            if self.fs.is_mountpoint(&mountpoint).await? {
                continue;
            }
            let kind = self
                .fs
                .path_kind(&mountpoint)
                .await
                .map_err(|err| Error::io(&mountpoint, err))?;
            if kind != PathKind::Directory {
                self.fs
                    .create_dir_all(&mountpoint)
                    .await
                    .map_err(|err| Error::io(&mountpoint, err))?;
            }
            self.fs.mount(&spec.name, ZFS_FSTYPE, &mountpoint).await?;
            debug!(
                self.log,
                "Mounted dataset";
                "dataset" => &spec.name,
                "mountpoint" => %mountpoint,
            );
            mounted_any = true;
        }
        if mounted_any {
            info!(
                self.log,
                "Mounted system dataset";
                "pool" => pool,
                "target" => %target,
            );
        }
        Ok(mounted_any)
    }

    /// Unmounts every dataset of the tree on `pool`, children first.
    ///
    /// Datasets that are not mounted are skipped. A busy dataset fails the
    /// walk with [`Error::UnmountBusy`], listing the processes holding it
    /// where they can be found.
    pub async fn ensure_unmounted(
        &self,
        pool: &str,
        uuid: &str,
        mode: UnmountMode,
    ) -> Result<(), Error> {
        self.unmount_coredump().await;

        for spec in datasets_for(pool, uuid).into_iter().rev() {
            match self.fs.unmount(&spec.name, Some(mode)).await {
                Ok(()) => {
                    debug!(
                        self.log,
                        "Unmounted dataset";
                        "dataset" => &spec.name,
                    );
                }
                Err(UnmountError::NotMounted { .. }) => continue,
                Err(UnmountError::Busy { stderr, .. }) => {
                    let mountpoint =
                        self.fs.mountpoint_of(&spec.name).await.ok().flatten();
                    let processes = match &mountpoint {
                        Some(path) => self.fs.processes_using(path).await,
                        None => vec![],
                    };
                    warn!(
                        self.log,
                        "Dataset is busy";
                        "dataset" => &spec.name,
                        "stderr" => stderr,
                        "processes" => ?processes,
                    );
                    return Err(Error::UnmountBusy {
                        dataset: spec.name,
                        mountpoint,
                        processes,
                    });
                }
                Err(err) => {
                    return Err(Error::Unmount { dataset: spec.name, err });
                }
            }
        }
        Ok(())
    }

    /// Detaches the coredump bind mount, which pins the `cores` child.
    pub async fn unmount_coredump(&self) {
        match self.fs.unmount(self.coredump.as_str(), None).await {
            Ok(()) | Err(UnmountError::NotMounted { .. }) => (),
            Err(err) => {
                warn!(
                    self.log,
                    "Failed to unmount coredump path";
                    "path" => %self.coredump,
                    "error" => InlineErrorChain::new(&err),
                );
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;
    use linux_utils::fakes::filesystem::{Filesystem, FsOp};
    use linux_utils::filesystem::{Api, ProcessUsage};
    use sysds_test_utils::dev::test_setup_log;

    const UUID: &str = "6d2b7bf3c1d54f7e9b3f1b1e2a6c4d10";

    fn manager(log: &Logger) -> (Arc<Filesystem>, MountManager) {
        let fs = Arc::new(Filesystem::new());
        let mounts = MountManager::new(
            log,
            fs.clone(),
            "/var/lib/systemd/coredump".into(),
        );
        (fs, mounts)
    }

    fn mount_ops(fs: &Filesystem) -> usize {
        fs.ops().iter().filter(|op| matches!(op, FsOp::Mount { .. })).count()
    }

    #[tokio::test]
    async fn ensure_mounted_is_idempotent() {
        let logctx = test_setup_log("ensure_mounted_is_idempotent");
        let (fs, mounts) = manager(&logctx.log);
        let target = Utf8Path::new("/var/db/system");

        assert!(mounts.ensure_mounted("tank", UUID, target).await.unwrap());
        let after_first = mount_ops(&fs);
        assert_eq!(after_first, datasets_for("tank", UUID).len());
        assert_eq!(
            fs.mounted_source(target).await.unwrap().as_deref(),
            Some("tank/.system")
        );

        assert!(!mounts.ensure_mounted("tank", UUID, target).await.unwrap());
        assert_eq!(mount_ops(&fs), after_first);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn failed_mount_keeps_earlier_mounts() {
        let logctx = test_setup_log("failed_mount_keeps_earlier_mounts");
        let (fs, mounts) = manager(&logctx.log);
        let target = Utf8Path::new("/var/db/system");
        fs.fail_mounts_of("tank/.system/samba4");

        let err =
            mounts.ensure_mounted("tank", UUID, target).await.unwrap_err();
        assert_matches!(
            err,
            Error::Mount(e) if e.source_name == "tank/.system/samba4"
        );
        assert_eq!(
            fs.sources_under(target),
            vec!["tank/.system".to_string(), "tank/.system/cores".to_string()]
        );
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn unmount_walks_the_tree_in_reverse() {
        let logctx = test_setup_log("unmount_walks_the_tree_in_reverse");
        let (fs, mounts) = manager(&logctx.log);
        let target = Utf8Path::new("/var/db/system");
        mounts.ensure_mounted("tank", UUID, target).await.unwrap();

        mounts
            .ensure_unmounted("tank", UUID, UnmountMode::Force)
            .await
            .unwrap();
        assert!(fs.sources_under(target).is_empty());

        let unmounted: Vec<String> = fs
            .ops()
            .into_iter()
            .filter_map(|op| match op {
                FsOp::Unmount { target, mode: Some(UnmountMode::Force) } => {
                    Some(target)
                }
                _ => None,
            })
            .collect();
        let mut expected: Vec<String> =
            datasets_for("tank", UUID).into_iter().map(|d| d.name).collect();
        expected.reverse();
        assert_eq!(unmounted, expected);

        // A second pass finds nothing mounted and still succeeds.
        mounts
            .ensure_unmounted("tank", UUID, UnmountMode::Lazy)
            .await
            .unwrap();
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn busy_unmount_reports_processes() {
        let logctx = test_setup_log("busy_unmount_reports_processes");
        let (fs, mounts) = manager(&logctx.log);
        let target = Utf8Path::new("/var/db/system");
        mounts.ensure_mounted("tank", UUID, target).await.unwrap();
        let syslog = format!("tank/.system/syslog-{UUID}");
        let holder = ProcessUsage {
            pid: 812,
            name: "syslog-ng".to_string(),
            paths: vec![target.join(format!("syslog-{UUID}/log/messages"))],
        };
        fs.set_busy(&syslog, vec![holder.clone()]);

        let err = mounts
            .ensure_unmounted("tank", UUID, UnmountMode::Force)
            .await
            .unwrap_err();
        assert_matches!(
            err,
            Error::UnmountBusy { dataset, mountpoint, processes } => {
                assert_eq!(dataset, syslog);
                assert_eq!(
                    mountpoint,
                    Some(target.join(format!("syslog-{UUID}")))
                );
                assert_eq!(processes, vec![holder]);
            }
        );
        // Children after the busy one in reverse order were already detached;
        // the root stays mounted.
        assert!(fs.is_mountpoint(target).await.unwrap());
        logctx.cleanup_successful();
    }

    #[test]
    fn licensed_systems_unmount_lazily() {
        assert_eq!(unmount_mode(true), UnmountMode::Lazy);
        assert_eq!(unmount_mode(false), UnmountMode::Force);
    }
}
