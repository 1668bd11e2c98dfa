// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::filesystem::{
    Api, CopyError, MountEntry, MountError, MountTableError, PathKind,
    ProcessUsage, UnmountError, UnmountMode,
};
use crate::host::{output_to_exec_error, Output, OutputExt};
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::sync::Mutex;

const BIND: &str = "bind";
const ROOT_SOURCE: &str = "rootfs";

/// An operation observed by the fake, in the order it happened.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FsOp {
    Mount { source: String, mountpoint: Utf8PathBuf },
    Bind { source: Utf8PathBuf, mountpoint: Utf8PathBuf },
    Unmount { target: String, mode: Option<UnmountMode> },
    UnmountRecursive { path: Utf8PathBuf },
    Copy { source: Utf8PathBuf, dest: Utf8PathBuf },
}

#[derive(Default)]
struct Inner {
    mounts: Vec<MountEntry>,
    dirs: BTreeSet<Utf8PathBuf>,
    // Keyed by the mounted source owning the file, then the path relative to
    // wherever that source is mounted.
    files: BTreeMap<(String, Utf8PathBuf), Vec<u8>>,
    modes: BTreeMap<Utf8PathBuf, u32>,
    busy: BTreeMap<String, Vec<ProcessUsage>>,
    failing_mounts: BTreeSet<String>,
    failing_copy: Option<String>,
    ops: Vec<FsOp>,
}

impl Inner {
    /// Finds the source that owns `path` and the path relative to it,
    /// following bind mounts back to their origin.
    fn resolve(&self, path: &Utf8Path) -> (String, Utf8PathBuf) {
        let owner = self
            .mounts
            .iter()
            .filter(|entry| path.starts_with(&entry.mountpoint))
            .max_by_key(|entry| entry.mountpoint.components().count());
        match owner {
            Some(entry) => {
                let rel = path
                    .strip_prefix(&entry.mountpoint)
                    .map(Utf8Path::to_owned)
                    .unwrap_or_default();
                if entry.fstype == BIND {
                    self.resolve(&Utf8PathBuf::from(&entry.source).join(rel))
                } else {
                    (entry.source.clone(), rel)
                }
            }
            None => (
                ROOT_SOURCE.to_string(),
                path.strip_prefix("/")
                    .map(Utf8Path::to_owned)
                    .unwrap_or_else(|_| path.to_owned()),
            ),
        }
    }

    /// Every path at which a file is currently visible.
    fn visible_files(&self) -> Vec<(Utf8PathBuf, Vec<u8>)> {
        let mut visible = vec![];
        for ((owner, rel), data) in &self.files {
            if owner == ROOT_SOURCE {
                let full = Utf8Path::new("/").join(rel);
                if self.resolve(&full).0 == ROOT_SOURCE {
                    visible.push((full, data.clone()));
                }
                continue;
            }
            for entry in self.mounts.iter().filter(|e| &e.source == owner) {
                visible.push((entry.mountpoint.join(rel), data.clone()));
            }
        }
        visible
    }

    fn write(&mut self, path: &Utf8Path, data: Vec<u8>) {
        let key = self.resolve(path);
        self.files.insert(key, data);
    }
}

/// A fake implementation of [`Api`], keeping the mount table, directories and
/// file contents in memory.
///
/// File contents belong to whichever mounted source covers their path, so
/// they disappear from view when that source is unmounted and reappear
/// wherever it is mounted next.
#[derive(Default)]
pub struct Filesystem {
    inner: Mutex<Inner>,
}

impl Filesystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_file(&self, path: impl AsRef<Utf8Path>, data: &[u8]) {
        self.inner.lock().unwrap().write(path.as_ref(), data.to_vec());
    }

    pub fn read_file(&self, path: impl AsRef<Utf8Path>) -> Option<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        let key = inner.resolve(path.as_ref());
        inner.files.get(&key).cloned()
    }

    pub fn add_dir(&self, path: impl AsRef<Utf8Path>) {
        let mut inner = self.inner.lock().unwrap();
        for ancestor in path.as_ref().ancestors() {
            inner.dirs.insert(ancestor.to_owned());
        }
    }

    /// Makes unmounting `source` fail as busy, reporting `processes`.
    pub fn set_busy(&self, source: &str, processes: Vec<ProcessUsage>) {
        self.inner.lock().unwrap().busy.insert(source.to_string(), processes);
    }

    pub fn fail_mounts_of(&self, source: &str) {
        self.inner.lock().unwrap().failing_mounts.insert(source.to_string());
    }

    /// Makes the next [`Api::archive_copy`] fail with `stderr`.
    pub fn fail_next_copy(&self, stderr: &str) {
        self.inner.lock().unwrap().failing_copy = Some(stderr.to_string());
    }

    pub fn ops(&self) -> Vec<FsOp> {
        self.inner.lock().unwrap().ops.clone()
    }

    pub fn mount_table(&self) -> Vec<MountEntry> {
        self.inner.lock().unwrap().mounts.clone()
    }

    /// Sources mounted at or below `path`, in mount order.
    pub fn sources_under(&self, path: impl AsRef<Utf8Path>) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .mounts
            .iter()
            .filter(|entry| entry.mountpoint.starts_with(path.as_ref()))
            .map(|entry| entry.source.clone())
            .collect()
    }

    pub fn mode_of(&self, path: impl AsRef<Utf8Path>) -> Option<u32> {
        self.inner.lock().unwrap().modes.get(path.as_ref()).copied()
    }

    fn mount_entry(
        &self,
        source: String,
        fstype: &str,
        mountpoint: &Utf8Path,
        op: FsOp,
    ) -> Result<(), MountError> {
        let mut inner = self.inner.lock().unwrap();
        inner.ops.push(op);
        let is_dir = inner.dirs.contains(mountpoint)
            || inner.mounts.iter().any(|e| e.mountpoint == mountpoint);
        if inner.failing_mounts.contains(&source) || !is_dir {
            let stderr = if is_dir {
                format!("mount: {mountpoint}: cannot mount {source}")
            } else {
                format!("mount: {mountpoint}: mount point does not exist.")
            };
            return Err(MountError {
                source_name: source,
                mountpoint: mountpoint.to_owned(),
                err: output_to_exec_error(
                    "mount".to_string(),
                    &Output::failure().set_stderr(stderr),
                ),
            });
        }
        inner.mounts.push(MountEntry {
            source,
            mountpoint: mountpoint.to_owned(),
            fstype: fstype.to_string(),
        });
        Ok(())
    }
}

#[async_trait]
impl Api for Filesystem {
    async fn mounts(&self) -> Result<Vec<MountEntry>, MountTableError> {
        Ok(self.mount_table())
    }

    async fn mount(
        &self,
        source: &str,
        fstype: &str,
        mountpoint: &Utf8Path,
    ) -> Result<(), MountError> {
        let op = FsOp::Mount {
            source: source.to_string(),
            mountpoint: mountpoint.to_owned(),
        };
        self.mount_entry(source.to_string(), fstype, mountpoint, op)
    }

    async fn bind_mount(
        &self,
        source: &Utf8Path,
        mountpoint: &Utf8Path,
    ) -> Result<(), MountError> {
        let op = FsOp::Bind {
            source: source.to_owned(),
            mountpoint: mountpoint.to_owned(),
        };
        self.mount_entry(source.to_string(), BIND, mountpoint, op)
    }

    async fn unmount(
        &self,
        target: &str,
        mode: Option<UnmountMode>,
    ) -> Result<(), UnmountError> {
        let mut inner = self.inner.lock().unwrap();
        inner.ops.push(FsOp::Unmount { target: target.to_string(), mode });
        let Some(index) = inner.mounts.iter().rposition(|entry| {
            entry.source == target || entry.mountpoint == target
        }) else {
            return Err(UnmountError::NotMounted { target: target.to_string() });
        };
        if inner.busy.contains_key(&inner.mounts[index].source) {
            return Err(UnmountError::Busy {
                target: target.to_string(),
                stderr: format!("umount: {target}: target is busy."),
            });
        }
        inner.mounts.remove(index);
        Ok(())
    }

    async fn unmount_recursive(
        &self,
        path: &Utf8Path,
    ) -> Result<(), UnmountError> {
        let mut inner = self.inner.lock().unwrap();
        inner.ops.push(FsOp::UnmountRecursive { path: path.to_owned() });
        let before = inner.mounts.len();
        inner.mounts.retain(|entry| !entry.mountpoint.starts_with(path));
        if inner.mounts.len() == before {
            return Err(UnmountError::NotMounted { target: path.to_string() });
        }
        Ok(())
    }

    async fn processes_using(&self, path: &Utf8Path) -> Vec<ProcessUsage> {
        let inner = self.inner.lock().unwrap();
        inner
            .mounts
            .iter()
            .filter(|entry| entry.mountpoint.starts_with(path))
            .filter_map(|entry| inner.busy.get(&entry.source))
            .flatten()
            .cloned()
            .collect()
    }

    async fn archive_copy(
        &self,
        source: &Utf8Path,
        dest: &Utf8Path,
    ) -> Result<(), CopyError> {
        let mut inner = self.inner.lock().unwrap();
        inner.ops.push(FsOp::Copy {
            source: source.to_owned(),
            dest: dest.to_owned(),
        });
        if let Some(stderr) = inner.failing_copy.take() {
            return Err(CopyError {
                source_path: source.to_owned(),
                dest: dest.to_owned(),
                err: output_to_exec_error(
                    "rsync".to_string(),
                    &Output::failure().set_stderr(stderr),
                ),
            });
        }
        for (path, data) in inner.visible_files() {
            if let Ok(rel) = path.strip_prefix(source) {
                let target = dest.join(rel);
                inner.write(&target, data);
            }
        }
        Ok(())
    }

    async fn path_kind(&self, path: &Utf8Path) -> io::Result<PathKind> {
        let inner = self.inner.lock().unwrap();
        if inner.dirs.contains(path)
            || inner.mounts.iter().any(|e| e.mountpoint == path)
        {
            return Ok(PathKind::Directory);
        }
        if inner.files.contains_key(&inner.resolve(path)) {
            return Ok(PathKind::Other);
        }
        Ok(PathKind::Missing)
    }

    async fn create_dir_all(&self, path: &Utf8Path) -> io::Result<()> {
        self.add_dir(path);
        Ok(())
    }

    async fn remove_file(&self, path: &Utf8Path) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let key = inner.resolve(path);
        match inner.files.remove(&key) {
            Some(_) => Ok(()),
            None => Err(io::Error::from(io::ErrorKind::NotFound)),
        }
    }

    async fn remove_dir(&self, path: &Utf8Path) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.mounts.iter().any(|e| e.mountpoint == path) {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("{path} is a mountpoint"),
            ));
        }
        if inner.dirs.remove(path) {
            Ok(())
        } else {
            Err(io::Error::from(io::ErrorKind::NotFound))
        }
    }

    async fn set_mode(&self, path: &Utf8Path, mode: u32) -> io::Result<()> {
        self.inner.lock().unwrap().modes.insert(path.to_owned(), mode);
        Ok(())
    }

    async fn read_dir(&self, path: &Utf8Path) -> io::Result<Vec<Utf8PathBuf>> {
        let inner = self.inner.lock().unwrap();
        let mut entries: BTreeSet<Utf8PathBuf> = inner
            .visible_files()
            .into_iter()
            .map(|(file, _)| file)
            .filter(|file| file.parent() == Some(path))
            .collect();
        entries.extend(
            inner.dirs.iter().filter(|d| d.parent() == Some(path)).cloned(),
        );
        Ok(entries.into_iter().collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn files_follow_their_mounted_source() {
        let fs = Filesystem::new();
        let live = Utf8Path::new("/var/db/system");
        let scratch = Utf8Path::new("/tmp/system.new");
        fs.add_dir("/var/db/system");
        fs.add_dir("/tmp/system.new");
        fs.mount("tank/.system", "zfs", live).await.unwrap();
        fs.write_file("/var/db/system/configs/a.db", b"a");

        fs.mount("backup/.system", "zfs", scratch).await.unwrap();
        fs.archive_copy(live, scratch).await.unwrap();

        fs.unmount("tank/.system", None).await.unwrap();
        assert_eq!(fs.read_file("/var/db/system/configs/a.db"), None);
        fs.unmount("backup/.system", None).await.unwrap();
        fs.mount("backup/.system", "zfs", live).await.unwrap();
        assert_eq!(
            fs.read_file("/var/db/system/configs/a.db"),
            Some(b"a".to_vec())
        );
    }
}
