// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Listing imported ZFS pools.

use crate::host::{command, BoxedExecutor, ExecutionError};
use std::str::FromStr;

pub const ZPOOL: &str = "/usr/sbin/zpool";

// Columns requested from `zpool list`, in order.
const LIST_COLUMNS: &str = "name,free,health";

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("Unexpected `zpool list` output: {0}")]
pub struct ParseError(String);

#[derive(thiserror::Error, Debug)]
pub enum ListError {
    #[error("Failed to list pools")]
    Execution(#[source] ExecutionError),

    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// Health of a pool as reported by `zpool list`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ZpoolHealth {
    Online,
    Degraded,
    Faulted,
    Offline,
    Removed,
    Unavailable,
}

impl FromStr for ZpoolHealth {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let health = match s {
            "ONLINE" => ZpoolHealth::Online,
            "DEGRADED" => ZpoolHealth::Degraded,
            "FAULTED" => ZpoolHealth::Faulted,
            "OFFLINE" => ZpoolHealth::Offline,
            "REMOVED" => ZpoolHealth::Removed,
            "UNAVAIL" => ZpoolHealth::Unavailable,
            other => {
                return Err(ParseError(format!("unknown health {other:?}")))
            }
        };
        Ok(health)
    }
}

/// One line of `zpool list`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ZpoolInfo {
    name: String,
    free: u64,
    health: ZpoolHealth,
}

impl ZpoolInfo {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unallocated bytes in the pool.
    pub fn free(&self) -> u64 {
        self.free
    }

    pub fn health(&self) -> ZpoolHealth {
        self.health
    }
}

impl FromStr for ZpoolInfo {
    type Err = ParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut columns = line.split('\t');
        let mut column = |name: &str| {
            columns.next().filter(|value| !value.is_empty()).ok_or_else(|| {
                ParseError(format!("{name} missing in {line:?}"))
            })
        };
        let name = column("name")?.to_string();
        let free = column("free")?;
        let free = free.parse().map_err(|_| {
            ParseError(format!("free space {free:?} of {name} is not a number"))
        })?;
        let health = column("health")?.parse()?;
        Ok(ZpoolInfo { name, free, health })
    }
}

pub struct Zpool {}

impl Zpool {
    /// Lists the imported pools, in the order `zpool list` reports them.
    pub async fn list(
        executor: &BoxedExecutor,
    ) -> Result<Vec<ZpoolInfo>, ListError> {
        let mut cmd = command(ZPOOL);
        cmd.args(["list", "-Hpo", LIST_COLUMNS]);

        let output = executor
            .execute_async(&mut cmd)
            .await
            .map_err(ListError::Execution)?;
        let pools = String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(str::parse)
            .collect::<Result<Vec<ZpoolInfo>, _>>()?;
        Ok(pools)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::host::{FakeExecutor, Input, Output, OutputExt, StaticHandler};
    use assert_matches::assert_matches;
    use sysds_test_utils::dev::test_setup_log;

    #[test]
    fn parse_reports_the_missing_column() {
        let err = "tank\t4000".parse::<ZpoolInfo>().unwrap_err();
        assert_eq!(err, ParseError("health missing in \"tank\\t4000\"".into()));

        let err = "tank\tlots\tONLINE".parse::<ZpoolInfo>().unwrap_err();
        assert!(err.0.contains("not a number"), "{err}");

        let err = "tank\t1\tSLEEPY".parse::<ZpoolInfo>().unwrap_err();
        assert!(err.0.contains("SLEEPY"), "{err}");
    }

    #[tokio::test]
    async fn list_preserves_discovery_order() {
        let logctx = test_setup_log("list_preserves_discovery_order");
        let executor = FakeExecutor::new(logctx.log.clone());
        let mut handler = StaticHandler::new();
        handler.expect(
            Input::shell(format!("{ZPOOL} list -Hpo name,free,health")),
            Output::success()
                .set_stdout("tank\t90\tONLINE\nbackup\t200\tDEGRADED\n"),
        );
        handler.register(&executor);

        let pools = Zpool::list(&executor.as_executor()).await.unwrap();
        let names: Vec<_> = pools.iter().map(|p| p.name()).collect();
        assert_eq!(names, ["tank", "backup"]);
        assert_eq!(pools[0].free(), 90);
        assert_eq!(pools[1].health(), ZpoolHealth::Degraded);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn list_failure_is_an_execution_error() {
        let logctx = test_setup_log("list_failure_is_an_execution_error");
        let executor = FakeExecutor::new(logctx.log.clone());
        let mut handler = StaticHandler::new();
        handler.expect_fail(format!("{ZPOOL} list -Hpo name,free,health"));
        handler.register(&executor);

        let err = Zpool::list(&executor.as_executor()).await.unwrap_err();
        assert_matches!(err, ListError::Execution(_));
        logctx.cleanup_successful();
    }
}
