// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mount table inspection, mount/unmount, and the few filesystem primitives
//! needed to relocate a mounted tree.

use crate::host::{command, BoxedExecutor, ExecutionError};
use crate::{MOUNT, RSYNC, UMOUNT};
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use slog::{debug, Logger};
use std::io;
use std::os::unix::fs::PermissionsExt;

pub const MOUNT_TABLE: &str = "/proc/self/mounts";

#[derive(thiserror::Error, Debug)]
#[error("Failed to read mount table {path}: {err}")]
pub struct MountTableError {
    path: Utf8PathBuf,
    #[source]
    err: io::Error,
}

/// Error returned by [`Api::mount`] and [`Api::bind_mount`].
#[derive(thiserror::Error, Debug)]
#[error("Failed to mount {source_name} at {mountpoint}: {err}")]
pub struct MountError {
    pub source_name: String,
    pub mountpoint: Utf8PathBuf,
    #[source]
    pub err: ExecutionError,
}

/// Error returned by [`Api::unmount`].
#[derive(thiserror::Error, Debug)]
pub enum UnmountError {
    #[error("{target} is not mounted")]
    NotMounted { target: String },

    #[error("Unable to unmount {target}: target is busy")]
    Busy { target: String, stderr: String },

    #[error("Unable to unmount {target}: {err}")]
    Other {
        target: String,
        #[source]
        err: ExecutionError,
    },
}

impl UnmountError {
    fn classify(target: &str, err: ExecutionError) -> Self {
        let target = target.to_string();
        match err.stderr() {
            Some(stderr)
                if stderr.contains("not mounted")
                    || stderr.contains("no mount point specified") =>
            {
                UnmountError::NotMounted { target }
            }
            Some(stderr) if stderr.contains("target is busy") => {
                UnmountError::Busy { target, stderr: stderr.to_string() }
            }
            _ => UnmountError::Other { target, err },
        }
    }
}

/// Error returned by [`Api::archive_copy`].
#[derive(thiserror::Error, Debug)]
#[error("Failed to copy {source_path} to {dest}: {err}")]
pub struct CopyError {
    pub source_path: Utf8PathBuf,
    pub dest: Utf8PathBuf,
    #[source]
    pub err: ExecutionError,
}

/// How hard to try when detaching a filesystem.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnmountMode {
    /// `umount -f`
    Force,
    /// `umount -l`: detach now, clean up once no longer busy.
    Lazy,
}

impl UnmountMode {
    fn flag(&self) -> &'static str {
        match self {
            UnmountMode::Force => "-f",
            UnmountMode::Lazy => "-l",
        }
    }
}

/// One row of the mount table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub mountpoint: Utf8PathBuf,
    pub fstype: String,
}

/// A process holding a path open, reported when an unmount is refused.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProcessUsage {
    pub pid: u32,
    pub name: String,
    pub paths: Vec<Utf8PathBuf>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PathKind {
    Missing,
    Directory,
    Other,
}

// The mount table escapes whitespace and backslashes as three-digit octal.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            if let Some(value) = std::str::from_utf8(&bytes[i + 1..i + 4])
                .ok()
                .and_then(|oct| u8::from_str_radix(oct, 8).ok())
            {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Parses the contents of `/proc/self/mounts`.
pub fn parse_mount_table(contents: &str) -> Vec<MountEntry> {
    contents
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = unescape_mount_field(fields.next()?);
            let mountpoint = unescape_mount_field(fields.next()?);
            let fstype = fields.next()?.to_string();
            Some(MountEntry {
                source,
                mountpoint: Utf8PathBuf::from(mountpoint),
                fstype,
            })
        })
        .collect()
}

/// The filesystem primitives the system dataset relies on.
///
/// The host implementation is [`HostFilesystem`]; tests use
/// [`crate::fakes::filesystem::Filesystem`].
#[async_trait]
pub trait Api: Send + Sync {
    /// Returns the current mount table, in mount order.
    async fn mounts(&self) -> Result<Vec<MountEntry>, MountTableError>;

    /// Returns the source of the topmost filesystem mounted at `path`.
    async fn mounted_source(
        &self,
        path: &Utf8Path,
    ) -> Result<Option<String>, MountTableError> {
        Ok(self
            .mounts()
            .await?
            .into_iter()
            .rev()
            .find(|entry| entry.mountpoint == path)
            .map(|entry| entry.source))
    }

    /// Returns where `source` is currently mounted, if anywhere.
    async fn mountpoint_of(
        &self,
        source: &str,
    ) -> Result<Option<Utf8PathBuf>, MountTableError> {
        Ok(self
            .mounts()
            .await?
            .into_iter()
            .rev()
            .find(|entry| entry.source == source)
            .map(|entry| entry.mountpoint))
    }

    async fn is_mountpoint(
        &self,
        path: &Utf8Path,
    ) -> Result<bool, MountTableError> {
        Ok(self.mounted_source(path).await?.is_some())
    }

    async fn mount(
        &self,
        source: &str,
        fstype: &str,
        mountpoint: &Utf8Path,
    ) -> Result<(), MountError>;

    async fn bind_mount(
        &self,
        source: &Utf8Path,
        mountpoint: &Utf8Path,
    ) -> Result<(), MountError>;

    /// Unmounts `target`, which may be either a mountpoint or a mounted
    /// source. `None` requests a plain unmount.
    async fn unmount(
        &self,
        target: &str,
        mode: Option<UnmountMode>,
    ) -> Result<(), UnmountError>;

    /// Unmounts `path` and everything mounted beneath it.
    async fn unmount_recursive(
        &self,
        path: &Utf8Path,
    ) -> Result<(), UnmountError>;

    /// Best-effort list of processes holding files under `path`.
    async fn processes_using(&self, path: &Utf8Path) -> Vec<ProcessUsage>;

    /// Copies the contents of `source` into `dest`, preserving ownership,
    /// permissions and timestamps.
    async fn archive_copy(
        &self,
        source: &Utf8Path,
        dest: &Utf8Path,
    ) -> Result<(), CopyError>;

    async fn path_kind(&self, path: &Utf8Path) -> io::Result<PathKind>;
    async fn create_dir_all(&self, path: &Utf8Path) -> io::Result<()>;
    async fn remove_file(&self, path: &Utf8Path) -> io::Result<()>;
    async fn remove_dir(&self, path: &Utf8Path) -> io::Result<()>;
    async fn set_mode(&self, path: &Utf8Path, mode: u32) -> io::Result<()>;
    async fn read_dir(&self, path: &Utf8Path) -> io::Result<Vec<Utf8PathBuf>>;
}

/// [`Api`] backed by the running host.
pub struct HostFilesystem {
    log: Logger,
    executor: BoxedExecutor,
}

impl HostFilesystem {
    pub fn new(log: &Logger, executor: BoxedExecutor) -> Self {
        Self { log: log.new(slog::o!("component" => "HostFilesystem")), executor }
    }
}

fn scan_processes(path: &Utf8Path) -> Vec<ProcessUsage> {
    let Ok(procs) = std::fs::read_dir("/proc") else {
        return vec![];
    };
    let mut usages = vec![];
    for entry in procs.flatten() {
        let Some(pid) =
            entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok())
        else {
            continue;
        };
        let base = entry.path();
        let mut links =
            vec![base.join("cwd"), base.join("root"), base.join("exe")];
        if let Ok(fds) = std::fs::read_dir(base.join("fd")) {
            links.extend(fds.flatten().map(|fd| fd.path()));
        }
        let mut paths: Vec<Utf8PathBuf> = links
            .iter()
            .filter_map(|link| std::fs::read_link(link).ok())
            .filter_map(|target| Utf8PathBuf::from_path_buf(target).ok())
            .filter(|target| target.starts_with(path))
            .collect();
        if paths.is_empty() {
            continue;
        }
        paths.sort();
        paths.dedup();
        let name = std::fs::read_to_string(base.join("comm"))
            .map(|comm| comm.trim().to_string())
            .unwrap_or_default();
        usages.push(ProcessUsage { pid, name, paths });
    }
    usages
}

#[async_trait]
impl Api for HostFilesystem {
    async fn mounts(&self) -> Result<Vec<MountEntry>, MountTableError> {
        let contents =
            tokio::fs::read_to_string(MOUNT_TABLE).await.map_err(|err| {
                MountTableError { path: MOUNT_TABLE.into(), err }
            })?;
        Ok(parse_mount_table(&contents))
    }

    async fn mount(
        &self,
        source: &str,
        fstype: &str,
        mountpoint: &Utf8Path,
    ) -> Result<(), MountError> {
        let mut cmd = command(MOUNT);
        cmd.args(["-t", fstype, source, mountpoint.as_str()]);
        self.executor.execute_async(&mut cmd).await.map_err(|err| {
            MountError {
                source_name: source.to_string(),
                mountpoint: mountpoint.to_owned(),
                err,
            }
        })?;
        Ok(())
    }

    async fn bind_mount(
        &self,
        source: &Utf8Path,
        mountpoint: &Utf8Path,
    ) -> Result<(), MountError> {
        let mut cmd = command(MOUNT);
        cmd.args(["--bind", source.as_str(), mountpoint.as_str()]);
        self.executor.execute_async(&mut cmd).await.map_err(|err| {
            MountError {
                source_name: source.to_string(),
                mountpoint: mountpoint.to_owned(),
                err,
            }
        })?;
        Ok(())
    }

    async fn unmount(
        &self,
        target: &str,
        mode: Option<UnmountMode>,
    ) -> Result<(), UnmountError> {
        let mut cmd = command(UMOUNT);
        if let Some(mode) = mode {
            cmd.arg(mode.flag());
        }
        cmd.arg(target);
        self.executor
            .execute_async(&mut cmd)
            .await
            .map_err(|err| UnmountError::classify(target, err))?;
        Ok(())
    }

    async fn unmount_recursive(
        &self,
        path: &Utf8Path,
    ) -> Result<(), UnmountError> {
        let mut cmd = command(UMOUNT);
        cmd.args(["-R", path.as_str()]);
        self.executor
            .execute_async(&mut cmd)
            .await
            .map_err(|err| UnmountError::classify(path.as_str(), err))?;
        Ok(())
    }

    async fn processes_using(&self, path: &Utf8Path) -> Vec<ProcessUsage> {
        let path = path.to_owned();
        match tokio::task::spawn_blocking(move || scan_processes(&path)).await
        {
            Ok(usages) => usages,
            Err(err) => {
                debug!(self.log, "process scan did not complete"; "error" => %err);
                vec![]
            }
        }
    }

    async fn archive_copy(
        &self,
        source: &Utf8Path,
        dest: &Utf8Path,
    ) -> Result<(), CopyError> {
        // The trailing slash copies the contents of `source` rather than the
        // directory itself.
        let mut cmd = command(RSYNC);
        cmd.args(["-az", &format!("{source}/"), dest.as_str()]);
        self.executor.execute_async(&mut cmd).await.map_err(|err| {
            CopyError {
                source_path: source.to_owned(),
                dest: dest.to_owned(),
                err,
            }
        })?;
        Ok(())
    }

    async fn path_kind(&self, path: &Utf8Path) -> io::Result<PathKind> {
        match tokio::fs::symlink_metadata(path).await {
            Ok(meta) if meta.is_dir() => Ok(PathKind::Directory),
            Ok(_) => Ok(PathKind::Other),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Ok(PathKind::Missing)
            }
            Err(err) => Err(err),
        }
    }

    async fn create_dir_all(&self, path: &Utf8Path) -> io::Result<()> {
        tokio::fs::create_dir_all(path).await
    }

    async fn remove_file(&self, path: &Utf8Path) -> io::Result<()> {
        tokio::fs::remove_file(path).await
    }

    async fn remove_dir(&self, path: &Utf8Path) -> io::Result<()> {
        tokio::fs::remove_dir(path).await
    }

    async fn set_mode(&self, path: &Utf8Path, mode: u32) -> io::Result<()> {
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .await
    }

    async fn read_dir(&self, path: &Utf8Path) -> io::Result<Vec<Utf8PathBuf>> {
        let mut entries = tokio::fs::read_dir(path).await?;
        let mut paths = vec![];
        while let Some(entry) = entries.next_entry().await? {
            let path = Utf8PathBuf::from_path_buf(entry.path()).map_err(
                |path| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("non UTF-8 path: {}", path.display()),
                    )
                },
            )?;
            paths.push(path);
        }
        Ok(paths)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::host::{FakeExecutor, Input, Output, OutputExt, StaticHandler};
    use assert_matches::assert_matches;
    use sysds_test_utils::dev::test_setup_log;

    #[test]
    fn parse_mount_table_unescapes_fields() {
        let table = "\
tank/.system /var/db/system zfs rw,relatime,xattr,noacl 0 0
tank/.system/cores /var/db/system/cores zfs rw,relatime 0 0
/dev/sda1 /mnt/with\\040space ext4 rw 0 0
";
        let entries = parse_mount_table(table);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].source, "tank/.system");
        assert_eq!(entries[1].mountpoint, "/var/db/system/cores");
        assert_eq!(entries[1].fstype, "zfs");
        assert_eq!(entries[2].mountpoint, "/mnt/with space");
    }

    #[tokio::test]
    async fn unmount_errors_are_classified() {
        let logctx = test_setup_log("unmount_errors_are_classified");
        let executor = FakeExecutor::new(logctx.log.clone());
        let mut handler = StaticHandler::new();
        handler.expect(
            Input::shell(format!("{UMOUNT} -f tank/.system/cores")),
            Output::failure().set_stderr(
                "umount: tank/.system/cores: no mount point specified.",
            ),
        );
        handler.expect(
            Input::shell(format!("{UMOUNT} -l tank/.system")),
            Output::failure()
                .set_stderr("umount: /var/db/system: target is busy."),
        );
        handler.expect(
            Input::shell(format!("{UMOUNT} /var/lib/systemd/coredump")),
            Output::failure().set_stderr("umount: permission denied"),
        );
        handler.register(&executor);
        let fs = HostFilesystem::new(&logctx.log, executor.as_executor());

        assert_matches!(
            fs.unmount("tank/.system/cores", Some(UnmountMode::Force)).await,
            Err(UnmountError::NotMounted { .. })
        );
        assert_matches!(
            fs.unmount("tank/.system", Some(UnmountMode::Lazy)).await,
            Err(UnmountError::Busy { target, .. }) if target == "tank/.system"
        );
        assert_matches!(
            fs.unmount("/var/lib/systemd/coredump", None).await,
            Err(UnmountError::Other { .. })
        );

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn archive_copy_copies_directory_contents() {
        let logctx = test_setup_log("archive_copy_copies_directory_contents");
        let executor = FakeExecutor::new(logctx.log.clone());
        let mut handler = StaticHandler::new();
        handler.expect_ok(format!(
            "{RSYNC} -az /var/db/system/ /tmp/system.new"
        ));
        handler.register(&executor);
        let fs = HostFilesystem::new(&logctx.log, executor.as_executor());

        fs.archive_copy(
            Utf8Path::new("/var/db/system"),
            Utf8Path::new("/tmp/system.new"),
        )
        .await
        .unwrap();

        logctx.cleanup_successful();
    }
}
