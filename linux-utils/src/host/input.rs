// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::VecDeque;
use std::ffi::OsStr;
use std::fmt;
use std::process::Command;

/// A command line, decoded from a [`Command`] for logging, error reports
/// and matching in tests.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Input {
    pub program: String,
    pub args: VecDeque<String>,
    /// Variables set explicitly on the command.
    pub envs: Vec<(String, String)>,
}

impl Input {
    /// Parses `line` with shell word splitting.
    ///
    /// # Panics
    ///
    /// On an empty or unbalanced line. Meant for test scripts only.
    pub fn shell<S: AsRef<str>>(line: S) -> Self {
        let line = line.as_ref();
        let mut words: VecDeque<String> = shlex::split(line)
            .unwrap_or_else(|| panic!("unbalanced quoting in {line:?}"))
            .into();
        let program =
            words.pop_front().unwrap_or_else(|| panic!("empty command line"));
        Self { program, args: words, envs: Vec::new() }
    }
}

fn lossy(s: &OsStr) -> String {
    s.to_string_lossy().into_owned()
}

impl From<&Command> for Input {
    fn from(command: &Command) -> Self {
        Self {
            program: lossy(command.get_program()),
            args: command.get_args().map(lossy).collect(),
            envs: command
                .get_envs()
                .filter_map(|(key, value)| Some((lossy(key), lossy(value?))))
                .collect(),
        }
    }
}

impl fmt::Display for Input {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let words = std::iter::once(&self.program).chain(&self.args);
        for (i, word) in words.enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            match shlex::try_quote(word) {
                Ok(quoted) => f.write_str(&quoted)?,
                Err(_) => write!(f, "{word:?}")?,
            }
        }
        Ok(())
    }
}
