// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::error::{CommandFailureInfo, ExecutionError};
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

pub type Output = std::process::Output;

/// Builders for canned command outputs in tests.
pub trait OutputExt: Sized {
    /// Exit status 0, no output.
    fn success() -> Self;
    /// Exit status 1, no output.
    fn failure() -> Self;
    fn set_stdout<S: AsRef<str>>(self, stdout: S) -> Self;
    fn set_stderr<S: AsRef<str>>(self, stderr: S) -> Self;
}

fn exited_with(code: i32) -> Output {
    // `from_raw` takes a wait status, which keeps the exit code in the
    // second byte.
    Output {
        status: ExitStatus::from_raw(code << 8),
        stdout: Vec::new(),
        stderr: Vec::new(),
    }
}

impl OutputExt for Output {
    fn success() -> Self {
        exited_with(0)
    }

    fn failure() -> Self {
        exited_with(1)
    }

    fn set_stdout<S: AsRef<str>>(mut self, stdout: S) -> Self {
        self.stdout = stdout.as_ref().into();
        self
    }

    fn set_stderr<S: AsRef<str>>(mut self, stderr: S) -> Self {
        self.stderr = stderr.as_ref().into();
        self
    }
}

/// Wraps the output of a command that exited unsuccessfully.
pub fn output_to_exec_error(
    command: String,
    output: &Output,
) -> ExecutionError {
    let text = |bytes: &[u8]| String::from_utf8_lossy(bytes).into_owned();
    ExecutionError::CommandFailure(Box::new(CommandFailureInfo {
        command,
        status: output.status,
        stdout: text(&output.stdout),
        stderr: text(&output.stderr),
    }))
}
