// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Utilities for poking at ZFS.

use crate::host::{command, BoxedExecutor, ExecutionError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const ZFS: &str = "/usr/sbin/zfs";

#[derive(thiserror::Error, Debug)]
pub enum DestroyDatasetErrorVariant {
    #[error("Dataset not found")]
    NotFound,
    #[error(transparent)]
    Other(ExecutionError),
}

/// Error returned by [`Zfs::destroy_dataset`].
#[derive(thiserror::Error, Debug)]
#[error("Could not destroy dataset {name}: {err}")]
pub struct DestroyDatasetError {
    name: String,
    #[source]
    pub err: DestroyDatasetErrorVariant,
}

/// Error returned by [`Zfs::create_dataset`].
#[derive(thiserror::Error, Debug)]
#[error("Failed to create dataset {name}: {err}")]
pub struct CreateDatasetError {
    name: String,
    #[source]
    err: ExecutionError,
}

/// Error returned by [`Zfs::set_properties`]
#[derive(thiserror::Error, Debug)]
#[error("Failed to set properties {properties} on dataset {name}: {err}")]
pub struct SetPropertiesError {
    name: String,
    properties: String,
    #[source]
    err: ExecutionError,
}

/// Error returned by [`Zfs::get_properties`].
#[derive(thiserror::Error, Debug)]
#[error("Failed to get properties of dataset {name}: {err}")]
pub struct GetPropertiesError {
    name: String,
    #[source]
    err: ExecutionError,
}

/// Native and user properties of a single dataset, as reported by
/// `zfs get -Hp`.
///
/// Properties reported as `-` are omitted.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetProperties(BTreeMap<String, String>);

impl DatasetProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn insert(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> &mut Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn get_bytes(&self, name: &str) -> Option<u64> {
        self.get(name).and_then(|v| v.parse().ok())
    }

    /// Bytes consumed by the dataset and its descendants.
    pub fn used(&self) -> Option<u64> {
        self.get_bytes("used")
    }

    /// Bytes available to the dataset and its descendants.
    pub fn available(&self) -> Option<u64> {
        self.get_bytes("available")
    }

    /// True if the dataset is encrypted with a passphrase-format key.
    pub fn is_passphrase_encrypted(&self) -> bool {
        self.get("keyformat") == Some("passphrase")
    }

    /// True if the dataset is encrypted and its key is not loaded.
    pub fn is_locked(&self) -> bool {
        self.get("keystatus") == Some("unavailable")
    }

    fn parse(stdout: &str) -> Self {
        let props = stdout
            .lines()
            .filter_map(|line| {
                let (name, value) = line.split_once('\t')?;
                if value == "-" {
                    return None;
                }
                Some((name.to_string(), value.to_string()))
            })
            .collect();
        Self(props)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)>
    for DatasetProperties
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

fn is_not_found(err: &ExecutionError) -> bool {
    err.stderr().is_some_and(|stderr| stderr.contains("does not exist"))
}

/// Wraps commands for interacting with ZFS.
pub struct Zfs {}

impl Zfs {
    /// Returns the requested properties of `name`, or `None` if the dataset
    /// does not exist.
    pub async fn get_properties(
        executor: &BoxedExecutor,
        name: &str,
        properties: &[&str],
    ) -> Result<Option<DatasetProperties>, GetPropertiesError> {
        let mut cmd = command(ZFS);
        cmd.args(["get", "-Hp", "-o", "property,value"])
            .arg(properties.join(","))
            .arg(name);

        match executor.execute_async(&mut cmd).await {
            Ok(output) => Ok(Some(DatasetProperties::parse(
                &String::from_utf8_lossy(&output.stdout),
            ))),
            Err(err) if is_not_found(&err) => Ok(None),
            Err(err) => {
                Err(GetPropertiesError { name: name.to_string(), err })
            }
        }
    }

    /// Creates a new filesystem named `name` with the given properties.
    pub async fn create_dataset(
        executor: &BoxedExecutor,
        name: &str,
        properties: &DatasetProperties,
    ) -> Result<(), CreateDatasetError> {
        let mut cmd = command(ZFS);
        cmd.arg("create");
        for (key, value) in properties.iter() {
            cmd.arg("-o").arg(format!("{key}={value}"));
        }
        cmd.arg(name);
        executor
            .execute_async(&mut cmd)
            .await
            .map_err(|err| CreateDatasetError { name: name.to_string(), err })?;
        Ok(())
    }

    /// Destroys a dataset.
    pub async fn destroy_dataset(
        executor: &BoxedExecutor,
        name: &str,
        recursive: bool,
        force: bool,
    ) -> Result<(), DestroyDatasetError> {
        let mut cmd = command(ZFS);
        cmd.arg("destroy");
        if recursive {
            cmd.arg("-r");
        }
        if force {
            cmd.arg("-f");
        }
        cmd.arg(name);
        executor.execute_async(&mut cmd).await.map_err(|err| {
            let variant = if is_not_found(&err) {
                DestroyDatasetErrorVariant::NotFound
            } else {
                DestroyDatasetErrorVariant::Other(err)
            };
            DestroyDatasetError { name: name.to_string(), err: variant }
        })?;
        Ok(())
    }

    pub async fn set_properties(
        executor: &BoxedExecutor,
        name: &str,
        properties: &DatasetProperties,
    ) -> Result<(), SetPropertiesError> {
        let assignments: Vec<String> =
            properties.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let mut cmd = command(ZFS);
        cmd.arg("set").args(&assignments).arg(name);
        executor.execute_async(&mut cmd).await.map_err(|err| {
            SetPropertiesError {
                name: name.to_string(),
                properties: assignments.join(","),
                err,
            }
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::host::{FakeExecutor, Input, Output, OutputExt, StaticHandler};
    use assert_matches::assert_matches;
    use sysds_test_utils::dev::test_setup_log;

    #[test]
    fn parse_properties_skips_unset_values() {
        let props = DatasetProperties::parse(
            "used\t1073741824\navailable\t2147483648\nkeyformat\t-\nkeystatus\t-\n",
        );
        assert_eq!(props.used(), Some(1 << 30));
        assert_eq!(props.available(), Some(2 << 30));
        assert_eq!(props.get("keyformat"), None);
        assert!(!props.is_locked());
        assert!(!props.is_passphrase_encrypted());
    }

    #[tokio::test]
    async fn get_properties_of_missing_dataset_is_none() {
        let logctx = test_setup_log("get_properties_of_missing_dataset_is_none");
        let executor = FakeExecutor::new(logctx.log.clone());
        let mut handler = StaticHandler::new();
        handler.expect(
            Input::shell(format!(
                "{ZFS} get -Hp -o property,value used,available tank/.system"
            )),
            Output::failure().set_stderr(
                "cannot open 'tank/.system': dataset does not exist\n",
            ),
        );
        handler.register(&executor);

        let props = Zfs::get_properties(
            &executor.as_executor(),
            "tank/.system",
            &["used", "available"],
        )
        .await
        .unwrap();
        assert_eq!(props, None);

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn create_and_destroy_command_lines() {
        let logctx = test_setup_log("create_and_destroy_command_lines");
        let executor = FakeExecutor::new(logctx.log.clone());
        let mut handler = StaticHandler::new();
        handler.expect_ok(format!(
            "{ZFS} create -o mountpoint=legacy -o quota=1G tank/.system/cores"
        ));
        handler.expect(
            Input::shell(format!("{ZFS} destroy -r -f tank/.system")),
            Output::failure()
                .set_stderr("cannot open 'tank/.system': dataset does not exist"),
        );
        handler.register(&executor);
        let executor = executor.as_executor();

        let props: DatasetProperties =
            [("mountpoint", "legacy"), ("quota", "1G")].into_iter().collect();
        Zfs::create_dataset(&executor, "tank/.system/cores", &props)
            .await
            .unwrap();
        let err = Zfs::destroy_dataset(&executor, "tank/.system", true, true)
            .await
            .unwrap_err();
        assert_matches!(err.err, DestroyDatasetErrorVariant::NotFound);

        logctx.cleanup_successful();
    }
}
