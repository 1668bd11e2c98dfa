// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Running host commands through an injectable executor.

mod error;
mod executor;
mod input;
mod output;

pub use error::{CommandFailureInfo, ExecutionError};
pub use executor::{
    command_to_string, BoxedExecutor, Executor, FakeExecutor, HostExecutor,
    StaticHandler,
};
pub use input::Input;
pub use output::{output_to_exec_error, Output, OutputExt};

/// Builds a command with the stable locale every wrapper relies on when
/// matching on stderr.
pub fn command(program: &str) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.env_clear();
    cmd.env("LC_ALL", "C.UTF-8");
    cmd
}
