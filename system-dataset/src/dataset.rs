// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The fixed layout of datasets making up the system dataset.

use camino::{Utf8Path, Utf8PathBuf};
use linux_utils::zfs::DatasetProperties;

/// Name of the system dataset below each pool's root.
pub const SYSTEM_DATASET: &str = ".system";

/// The child holding core dumps.
pub const CORES: &str = "cores";

/// Quota placed on [`CORES`], in bytes. A child found using this much is
/// recreated.
pub const CORES_QUOTA_BYTES: u64 = 1 << 30;

/// The shared clustering volume.
pub const CTDB_SHARED_VOL: &str = "ctdb_shared_vol";

/// One dataset of the system dataset tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatasetSpec {
    /// Full ZFS name, e.g. `tank/.system/cores`.
    pub name: String,
    /// Path of the mountpoint relative to the tree's mount path; empty for
    /// the root.
    pub label: String,
}

impl DatasetSpec {
    pub fn is_root(&self) -> bool {
        self.label.is_empty()
    }

    pub fn is_cores(&self) -> bool {
        self.label == CORES
    }

    /// Where this dataset is mounted when the tree is mounted at `base`.
    pub fn mountpoint(&self, base: &Utf8Path) -> Utf8PathBuf {
        if self.is_root() {
            base.to_owned()
        } else {
            base.join(&self.label)
        }
    }

    /// Properties every system dataset is created with.
    pub fn properties(&self) -> DatasetProperties {
        let mut props: DatasetProperties = [
            ("mountpoint", "legacy"),
            ("readonly", "off"),
            ("snapdir", "hidden"),
        ]
        .into_iter()
        .collect();
        if self.is_cores() {
            props.insert("quota", CORES_QUOTA_BYTES.to_string());
        }
        props
    }
}

/// `<pool>/.system`
pub fn basename(pool: &str) -> String {
    format!("{pool}/{SYSTEM_DATASET}")
}

/// Returns the datasets of the system dataset tree on `pool` for the node
/// identified by `uuid`, root first.
///
/// Mounting walks this list in order; unmounting walks it in reverse so that
/// children are detached before their parent.
pub fn datasets_for(pool: &str, uuid: &str) -> Vec<DatasetSpec> {
    let root = basename(pool);
    let children = [
        CORES.to_string(),
        "samba4".to_string(),
        format!("syslog-{uuid}"),
        format!("rrd-{uuid}"),
        format!("configs-{uuid}"),
        "webui".to_string(),
        "services".to_string(),
        "glusterd".to_string(),
        CTDB_SHARED_VOL.to_string(),
    ];
    std::iter::once(DatasetSpec { name: root.clone(), label: String::new() })
        .chain(children.into_iter().map(|label| DatasetSpec {
            name: format!("{root}/{label}"),
            label,
        }))
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn children_do_not_depend_on_the_pool() {
        let uuid = "0123456789abcdef0123456789abcdef";
        let tank = datasets_for("tank", uuid);
        let backup = datasets_for("backup", uuid);
        assert_eq!(tank.len(), 10);
        assert_eq!(tank.len(), backup.len());
        for (a, b) in tank.iter().zip(&backup) {
            assert_eq!(a.label, b.label);
            assert_eq!(
                a.name.strip_prefix("tank/"),
                b.name.strip_prefix("backup/")
            );
        }
        assert!(tank[0].is_root());
        assert_eq!(tank[0].name, "tank/.system");
        assert!(tank.iter().skip(1).all(|d| !d.is_root()));
        let rrd = format!("tank/.system/rrd-{uuid}");
        assert!(tank.iter().any(|d| d.name == rrd));
    }

    #[test]
    fn mountpoints_hang_off_the_base_path() {
        let base = Utf8Path::new("/var/db/system");
        let specs = datasets_for("tank", "abc");
        assert_eq!(specs[0].mountpoint(base), "/var/db/system");
        assert_eq!(specs[1].mountpoint(base), "/var/db/system/cores");
        assert_eq!(
            specs.last().unwrap().mountpoint(base),
            "/var/db/system/ctdb_shared_vol"
        );
    }

    #[test]
    fn only_cores_carries_a_quota() {
        for spec in datasets_for("tank", "abc") {
            let props = spec.properties();
            assert_eq!(props.get("mountpoint"), Some("legacy"));
            assert_eq!(props.get("snapdir"), Some("hidden"));
            assert_eq!(props.get("quota").is_some(), spec.is_cores());
        }
    }
}
