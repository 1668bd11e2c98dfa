// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Pausing the services that hold the system dataset open.

use crate::error::Error;
use crate::facilities::{ServiceSupervisor, SystemFacilities};
use slog::{debug, error, info, o, warn, Logger};
use slog_error_chain::InlineErrorChain;
use std::future::Future;
use std::sync::Arc;

pub const SYSLOG_SERVICE: &str = "syslogd";

/// Services stopped around every guarded operation.
const ALWAYS_RESTART: [&str; 3] = ["collectd", "rrdcached", SYSLOG_SERVICE];

/// Stops dependent services for the lifetime of the guard.
///
/// Obtain one with [`QuiesceGuard::enter`] and hand it back with
/// [`QuiesceGuard::release`], which restores syslog's access to the dataset
/// and starts every captured service in the reverse of the order it was
/// stopped. Restarting is async, so it cannot happen in `Drop`; a guard
/// dropped without being released logs an error and restarts its services
/// from a background task.
pub struct QuiesceGuard {
    log: Logger,
    services: Arc<dyn ServiceSupervisor>,
    system: Arc<dyn SystemFacilities>,
    stop_order: Vec<String>,
    released: bool,
}

impl QuiesceGuard {
    /// Captures the services to restart, points syslog away from the
    /// dataset and stops the captured services in order.
    ///
    /// If any step fails the guard is released before the error is
    /// returned, so nothing is left stopped.
    pub async fn enter(
        log: &Logger,
        services: Arc<dyn ServiceSupervisor>,
        system: Arc<dyn SystemFacilities>,
    ) -> Result<QuiesceGuard, Error> {
        let log = log.new(o!("component" => "QuiesceGuard"));
        let stop_order = restart_candidates(services.as_ref()).await?;
        let mut guard = QuiesceGuard {
            log,
            services,
            system,
            stop_order,
            released: false,
        };
        info!(
            guard.log,
            "Quiescing services";
            "services" => ?guard.stop_order,
        );
        if let Err(err) = guard.quiesce().await {
            if let Err(release_err) = guard.release_inner().await {
                warn!(
                    guard.log,
                    "Failed to restore services after failed quiesce";
                    "error" => InlineErrorChain::new(&release_err),
                );
            }
            return Err(err);
        }
        Ok(guard)
    }

    /// Services in the order they were stopped.
    pub fn stop_order(&self) -> &[String] {
        &self.stop_order
    }

    async fn quiesce(&self) -> Result<(), Error> {
        self.system
            .set_syslog_dataset_eligible(false)
            .await
            .map_err(|err| Error::facility("disable syslog dataset", err))?;
        self.services
            .restart(SYSLOG_SERVICE)
            .await
            .map_err(|err| Error::facility("restart syslogd", err))?;
        self.system
            .stop_internal_logging()
            .await
            .map_err(|err| Error::facility("stop internal logging", err))?;
        for service in &self.stop_order {
            debug!(self.log, "Stopping service"; "service" => service);
            self.services.stop(service).await.map_err(|err| {
                Error::facility(format!("stop {service}"), err)
            })?;
        }
        Ok(())
    }

    /// Restores syslog's access to the dataset and restarts the captured
    /// services in reverse order.
    ///
    /// Every service is started even if an earlier one fails; the first
    /// failure is returned.
    pub async fn release(mut self) -> Result<(), Error> {
        self.release_inner().await
    }

    async fn release_inner(&mut self) -> Result<(), Error> {
        self.released = true;
        let mut first_err = None;
        if let Err(err) = self.system.set_syslog_dataset_eligible(true).await {
            first_err = Some(Error::facility("restore syslog dataset", err));
        }
        for service in self.stop_order.iter().rev() {
            debug!(self.log, "Starting service"; "service" => service);
            if let Err(err) = self.services.start(service).await {
                error!(
                    self.log,
                    "Failed to restart service";
                    "service" => service,
                    "error" => InlineErrorChain::new(&*err),
                );
                first_err.get_or_insert_with(|| {
                    Error::facility(format!("start {service}"), err)
                });
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for QuiesceGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        error!(
            self.log,
            "QuiesceGuard dropped without release";
            "services" => ?self.stop_order,
        );
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let log = self.log.clone();
        let services = self.services.clone();
        let system = self.system.clone();
        let stop_order = std::mem::take(&mut self.stop_order);
        handle.spawn(async move {
            if let Err(err) = system.set_syslog_dataset_eligible(true).await {
                warn!(
                    log,
                    "Failed to restore syslog dataset";
                    "error" => InlineErrorChain::new(&*err),
                );
            }
            for service in stop_order.iter().rev() {
                if let Err(err) = services.start(service).await {
                    error!(
                        log,
                        "Failed to restart service";
                        "service" => service,
                        "error" => InlineErrorChain::new(&*err),
                    );
                }
            }
        });
    }
}

/// Builds the list of services to stop, in stop order.
async fn restart_candidates(
    services: &dyn ServiceSupervisor,
) -> Result<Vec<String>, Error> {
    let started = |name: &'static str| async move {
        services
            .is_started(name)
            .await
            .map_err(|err| Error::facility(format!("query {name}"), err))
    };

    let mut restart: Vec<String> =
        ALWAYS_RESTART.iter().map(|s| s.to_string()).collect();
    if started("cifs").await? {
        restart.insert(0, "cifs".to_string());
    }
    if started("glusterd").await? {
        restart.insert(0, "glusterd".to_string());
    }
    if services
        .is_started_or_enabled("webdav")
        .await
        .map_err(|err| Error::facility("query webdav", err))?
    {
        restart.push("webdav".to_string());
    }
    for name in ["open-vm-tools", "idmap"] {
        if started(name).await? {
            restart.push(name.to_string());
        }
    }
    Ok(restart)
}

/// Runs `op` with dependent services quiesced, releasing the guard on every
/// exit path.
///
/// An error from `op` takes precedence over one from releasing the guard.
pub async fn with_quiesced_services<F, Fut, T>(
    log: &Logger,
    services: Arc<dyn ServiceSupervisor>,
    system: Arc<dyn SystemFacilities>,
    op: F,
) -> Result<T, Error>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let guard = QuiesceGuard::enter(log, services, system).await?;
    let result = op().await;
    let released = guard.release().await;
    let value = result?;
    released?;
    Ok(value)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fakes::{FakeSupervisor, FakeSystem, ServiceOp};
    use assert_matches::assert_matches;
    use sysds_test_utils::dev::test_setup_log;

    fn reversed(mut names: Vec<String>) -> Vec<String> {
        names.reverse();
        names
    }

    #[tokio::test]
    async fn candidates_follow_running_services() {
        let logctx = test_setup_log("candidates_follow_running_services");
        let services = Arc::new(FakeSupervisor::new());
        services.set_running("cifs");
        services.set_running("glusterd");
        services.set_enabled("webdav");
        services.set_running("idmap");
        let system = Arc::new(FakeSystem::default());

        let guard =
            QuiesceGuard::enter(&logctx.log, services.clone(), system.clone())
                .await
                .unwrap();
        assert_eq!(
            guard.stop_order(),
            [
                "glusterd",
                "cifs",
                "collectd",
                "rrdcached",
                "syslogd",
                "webdav",
                "idmap"
            ]
        );
        assert!(!system.syslog_eligible());
        guard.release().await.unwrap();
        assert!(system.syslog_eligible());
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn restarts_in_reverse_even_when_op_fails() {
        let logctx = test_setup_log("restarts_in_reverse_even_when_op_fails");
        let services = Arc::new(FakeSupervisor::new());
        services.set_running("cifs");
        services.set_running("open-vm-tools");
        let system = Arc::new(FakeSystem::default());

        let result: Result<(), Error> = with_quiesced_services(
            &logctx.log,
            services.clone(),
            system.clone(),
            || async { Err(Error::Call("copy exploded".to_string())) },
        )
        .await;
        assert_matches!(result, Err(Error::Call(msg)) if msg == "copy exploded");

        let stopped = services.stopped();
        assert_eq!(
            stopped,
            ["cifs", "collectd", "rrdcached", "syslogd", "open-vm-tools"]
        );
        assert_eq!(services.started(), reversed(stopped));
        assert!(system.syslog_eligible());

        // Syslog is moved off the dataset before anything is stopped.
        assert_eq!(
            services.ops().first(),
            Some(&ServiceOp::Restart("syslogd".to_string()))
        );
        assert_eq!(
            system.calls()[..2],
            ["syslog_eligible=false", "stop_internal_logging"]
        );
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn failed_start_does_not_skip_the_rest() {
        let logctx = test_setup_log("failed_start_does_not_skip_the_rest");
        let services = Arc::new(FakeSupervisor::new());
        let system = Arc::new(FakeSystem::default());

        let guard =
            QuiesceGuard::enter(&logctx.log, services.clone(), system.clone())
                .await
                .unwrap();
        services.fail("rrdcached");
        let err = guard.release().await.unwrap_err();
        assert_matches!(err, Error::Facility { op, .. } if op == "start rrdcached");
        assert_eq!(services.started(), ["syslogd", "rrdcached", "collectd"]);
        assert!(services.is_running("collectd"));
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn failed_quiesce_restarts_everything() {
        let logctx = test_setup_log("failed_quiesce_restarts_everything");
        let services = Arc::new(FakeSupervisor::new());
        services.set_running("rrdcached");
        services.fail("rrdcached");
        let system = Arc::new(FakeSystem::default());

        let err = QuiesceGuard::enter(&logctx.log, services.clone(), system)
            .await
            .err()
            .unwrap();
        assert_matches!(err, Error::Facility { op, .. } if op == "stop rrdcached");
        assert_eq!(services.stopped(), ["collectd", "rrdcached"]);
        assert_eq!(services.started(), ["syslogd", "rrdcached", "collectd"]);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn dropped_guard_restarts_in_background() {
        let logctx = test_setup_log("dropped_guard_restarts_in_background");
        let services = Arc::new(FakeSupervisor::new());
        let system = Arc::new(FakeSystem::default());

        let guard =
            QuiesceGuard::enter(&logctx.log, services.clone(), system.clone())
                .await
                .unwrap();
        drop(guard);
        for _ in 0..100 {
            if services.started().len() == ALWAYS_RESTART.len() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(services.started(), ["syslogd", "rrdcached", "collectd"]);
        assert!(system.syslog_eligible());
        logctx.cleanup_successful();
    }
}
