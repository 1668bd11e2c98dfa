// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::host::error::ExecutionError;
use crate::host::input::Input;
use crate::host::output::{output_to_exec_error, Output, OutputExt};

use async_trait::async_trait;
use itertools::Itertools;
use slog::{debug, info, warn, Logger};
use std::collections::VecDeque;
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// The trait object every wrapper takes.
pub type BoxedExecutor = Arc<dyn Executor>;

/// Runs host commands on behalf of the wrappers in this crate.
///
/// [`HostExecutor`] spawns real processes; [`FakeExecutor`] answers from a
/// test-supplied handler. Both fail with
/// [`ExecutionError::CommandFailure`] when the command exits unsuccessfully.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute_async(
        &self,
        command: &mut tokio::process::Command,
    ) -> Result<Output, ExecutionError>;
}

// Numbers commands so the start and finish log lines can be correlated.
struct CommandLog {
    log: Logger,
    next_id: AtomicU64,
}

impl CommandLog {
    fn new(log: Logger) -> Self {
        Self { log, next_id: AtomicU64::new(0) }
    }

    fn started(&self, input: &Input) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        info!(
            self.log,
            "Running host command";
            "id" => id,
            "command" => %input,
        );
        if !input.envs.is_empty() {
            let envs =
                input.envs.iter().map(|(k, v)| format!("{k}={v}")).join(" ");
            debug!(
                self.log,
                "Host command environment";
                "id" => id,
                "envs" => envs,
            );
        }
        id
    }

    fn finished(
        &self,
        id: u64,
        input: &Input,
        output: Output,
    ) -> Result<Output, ExecutionError> {
        let status = output
            .status
            .code()
            .map_or_else(|| "signal".to_string(), |code| code.to_string());
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(
                self.log,
                "Host command failed";
                "id" => id,
                "status" => status,
                "stderr" => stderr.trim_end(),
            );
            return Err(output_to_exec_error(input.to_string(), &output));
        }
        info!(self.log, "Host command succeeded"; "id" => id);
        if !output.stdout.is_empty() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            debug!(
                self.log,
                "Host command output";
                "id" => id,
                "stdout" => stdout.trim_end(),
            );
        }
        Ok(output)
    }
}

/// Spawns commands on the running host.
pub struct HostExecutor {
    commands: CommandLog,
}

impl HostExecutor {
    pub fn new(log: Logger) -> Arc<Self> {
        Arc::new(Self { commands: CommandLog::new(log) })
    }

    pub fn as_executor(self: Arc<Self>) -> BoxedExecutor {
        self
    }
}

#[async_trait]
impl Executor for HostExecutor {
    async fn execute_async(
        &self,
        command: &mut tokio::process::Command,
    ) -> Result<Output, ExecutionError> {
        let input = Input::from(command.as_std());
        let id = self.commands.started(&input);
        let output = command.output().await.map_err(|err| {
            warn!(
                self.commands.log,
                "Could not start host command";
                "id" => id,
                "error" => %err,
            );
            ExecutionError::ExecutionStart { command: input.to_string(), err }
        })?;
        self.commands.finished(id, &input, output)
    }
}

/// Answers a command run through a [`FakeExecutor`].
pub type BoxedWaitFn = Box<dyn FnMut(&Input) -> Output + Send + Sync>;

/// An executor that never spawns anything; every command is answered by a
/// handler, successfully by default.
pub struct FakeExecutor {
    commands: CommandLog,
    handler: Mutex<BoxedWaitFn>,
}

impl FakeExecutor {
    pub fn new(log: Logger) -> Arc<FakeExecutor> {
        Arc::new(Self {
            commands: CommandLog::new(log),
            handler: Mutex::new(Box::new(|_| Output::success())),
        })
    }

    pub fn set_wait_handler(&self, handler: BoxedWaitFn) {
        *self.handler.lock().unwrap() = handler;
    }

    pub fn as_executor(self: Arc<Self>) -> BoxedExecutor {
        self
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    async fn execute_async(
        &self,
        command: &mut tokio::process::Command,
    ) -> Result<Output, ExecutionError> {
        let input = Input::from(command.as_std());
        let id = self.commands.started(&input);
        let output = (self.handler.lock().unwrap())(&input);
        self.commands.finished(id, &input, output)
    }
}

/// Renders `command` the way it is logged and reported in errors.
pub fn command_to_string(command: &Command) -> String {
    Input::from(command).to_string()
}

/// A script of the commands a test expects, in order, with their canned
/// outputs. Panics on an unexpected command, and on drop if expected
/// commands never ran.
#[derive(Default)]
pub struct StaticHandler {
    expected: VecDeque<(Input, Output)>,
    seen: usize,
}

impl StaticHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs this script as `executor`'s handler.
    pub fn register(mut self, executor: &FakeExecutor) {
        executor.set_wait_handler(Box::new(move |input| self.answer(input)));
    }

    pub fn expect(&mut self, input: Input, output: Output) {
        self.expected.push_back((input, output));
    }

    /// Expects `command`, written like a shell command line, to succeed
    /// without output.
    pub fn expect_ok<S: AsRef<str>>(&mut self, command: S) {
        self.expect(Input::shell(command), Output::success())
    }

    /// Expects `command` to exit with status 1 without output.
    pub fn expect_fail<S: AsRef<str>>(&mut self, command: S) {
        self.expect(Input::shell(command), Output::failure())
    }

    fn answer(&mut self, observed: &Input) -> Output {
        let Some((input, output)) = self.expected.pop_front() else {
            panic!(
                "Unexpected command after {} expected ones: {observed}",
                self.seen
            );
        };
        self.seen += 1;
        // The locale environment is the same for every wrapper, so only the
        // command line is compared.
        assert_eq!(
            (&observed.program, &observed.args),
            (&input.program, &input.args),
            "Command #{} differs from the script",
            self.seen,
        );
        output
    }
}

impl Drop for StaticHandler {
    fn drop(&mut self) {
        let Some((next, _)) = self.expected.front() else {
            return;
        };
        let message = format!(
            "{} scripted command(s) never ran; next was: {next}",
            self.expected.len()
        );
        if std::thread::panicking() {
            eprintln!("{message}");
        } else {
            panic!("{message}");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::host::command;
    use assert_matches::assert_matches;
    use sysds_test_utils::dev::test_setup_log;

    #[tokio::test]
    async fn scripted_commands_are_answered_in_order() {
        let logctx = test_setup_log("scripted_commands_are_answered_in_order");
        let executor = FakeExecutor::new(logctx.log.clone());
        let mut handler = StaticHandler::new();
        handler.expect(
            Input::shell("/usr/sbin/zpool list -Hpo name"),
            Output::success().set_stdout("tank\n"),
        );
        handler.expect(
            Input::shell("/usr/sbin/zfs destroy tank/.system"),
            Output::failure().set_stderr("dataset is busy"),
        );
        handler.register(&executor);
        let executor = executor.as_executor();

        let mut list = command("/usr/sbin/zpool");
        list.args(["list", "-Hpo", "name"]);
        let output = executor.execute_async(&mut list).await.unwrap();
        assert_eq!(output.stdout, b"tank\n");

        let mut destroy = command("/usr/sbin/zfs");
        destroy.args(["destroy", "tank/.system"]);
        let err = executor.execute_async(&mut destroy).await.unwrap_err();
        assert_matches!(err, ExecutionError::CommandFailure(_));
        assert_eq!(err.stderr(), Some("dataset is busy"));
        logctx.cleanup_successful();
    }

    #[test]
    fn rendered_command_lines_split_back_into_arguments() {
        let mut cmd = Command::new("/usr/bin/rsync");
        cmd.args(["-aAX", "/var/db/system/", "/tmp/system new/"]);
        let rendered = command_to_string(&cmd);
        assert!(rendered.starts_with("/usr/bin/rsync -aAX /var/db/system/ "));
        assert_eq!(Input::shell(&rendered), Input::from(&cmd));
    }
}
