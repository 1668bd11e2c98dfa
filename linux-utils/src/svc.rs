// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Utilities for controlling systemd units.

use crate::host::{command, BoxedExecutor, ExecutionError};

pub const SYSTEMCTL: &str = "/usr/bin/systemctl";

#[derive(thiserror::Error, Debug)]
#[error("Failed to {action} unit {unit}: {err}")]
pub struct UnitError {
    action: &'static str,
    unit: String,
    #[source]
    err: ExecutionError,
}

/// Wraps `systemctl` for a single host.
pub struct Systemctl {}

impl Systemctl {
    /// Runs a `systemctl` query whose answer is its exit status.
    ///
    /// A command that runs and exits non-zero answers "no"; only a failure
    /// to run `systemctl` at all is an error.
    async fn query(
        executor: &BoxedExecutor,
        verb: &'static str,
        unit: &str,
    ) -> Result<bool, UnitError> {
        let mut cmd = command(SYSTEMCTL);
        cmd.args([verb, "--quiet", unit]);
        match executor.execute_async(&mut cmd).await {
            Ok(_) => Ok(true),
            Err(ExecutionError::CommandFailure(_)) => Ok(false),
            Err(err) => {
                Err(UnitError { action: verb, unit: unit.to_string(), err })
            }
        }
    }

    pub async fn is_active(
        executor: &BoxedExecutor,
        unit: &str,
    ) -> Result<bool, UnitError> {
        Self::query(executor, "is-active", unit).await
    }

    pub async fn is_enabled(
        executor: &BoxedExecutor,
        unit: &str,
    ) -> Result<bool, UnitError> {
        Self::query(executor, "is-enabled", unit).await
    }

    async fn act(
        executor: &BoxedExecutor,
        action: &'static str,
        unit: &str,
    ) -> Result<(), UnitError> {
        let mut cmd = command(SYSTEMCTL);
        cmd.args([action, unit]);
        executor
            .execute_async(&mut cmd)
            .await
            .map_err(|err| UnitError { action, unit: unit.to_string(), err })?;
        Ok(())
    }

    pub async fn start(
        executor: &BoxedExecutor,
        unit: &str,
    ) -> Result<(), UnitError> {
        Self::act(executor, "start", unit).await
    }

    pub async fn stop(
        executor: &BoxedExecutor,
        unit: &str,
    ) -> Result<(), UnitError> {
        Self::act(executor, "stop", unit).await
    }

    pub async fn restart(
        executor: &BoxedExecutor,
        unit: &str,
    ) -> Result<(), UnitError> {
        Self::act(executor, "restart", unit).await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::host::{FakeExecutor, StaticHandler};
    use sysds_test_utils::dev::test_setup_log;

    #[tokio::test]
    async fn inactive_unit_is_not_an_error() {
        let logctx = test_setup_log("inactive_unit_is_not_an_error");
        let executor = FakeExecutor::new(logctx.log.clone());
        let mut handler = StaticHandler::new();
        handler.expect_fail(format!("{SYSTEMCTL} is-active --quiet smbd"));
        handler.expect_ok(format!("{SYSTEMCTL} is-enabled --quiet smbd"));
        handler.register(&executor);
        let executor = executor.as_executor();

        assert!(!Systemctl::is_active(&executor, "smbd").await.unwrap());
        assert!(Systemctl::is_enabled(&executor, "smbd").await.unwrap());

        logctx.cleanup_successful();
    }
}
