// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Errors raised by the system dataset lifecycle manager.

use camino::Utf8PathBuf;
use linux_utils::filesystem::{
    CopyError, MountError, MountTableError, ProcessUsage, UnmountError,
};

/// A requested configuration change that was refused before anything on the
/// host was touched.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error(
        "System dataset location may not be moved while the directory \
         service is enabled"
    )]
    PolicyViolation,

    #[error("Pool {0:?} not found")]
    PoolNotFound(String),

    #[error(
        "Insufficient disk space available on {pool} ({available} bytes). \
         Need {required} bytes"
    )]
    InsufficientSpace { pool: String, available: u64, required: u64 },

    #[error(
        "The system dataset cannot be placed on pool {0:?}: its root dataset \
         is encrypted with a passphrase or is locked"
    )]
    PoolLocked(String),
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Invalid system dataset configuration")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    MountTable(#[from] MountTableError),

    #[error(transparent)]
    Mount(#[from] MountError),

    #[error(
        "Unable to unmount {dataset}: target is busy ({} process(es) using \
         {})",
        processes.len(),
        mountpoint.as_deref().map(|p| p.as_str()).unwrap_or("an unknown path")
    )]
    UnmountBusy {
        dataset: String,
        mountpoint: Option<Utf8PathBuf>,
        processes: Vec<ProcessUsage>,
    },

    #[error("Unable to unmount {dataset}")]
    Unmount {
        dataset: String,
        #[source]
        err: UnmountError,
    },

    #[error("Failed to copy the system dataset to its new location")]
    MigrationCopyFailed(#[source] CopyError),

    #[error("{0}")]
    Call(String),

    #[error("{op} failed")]
    Facility {
        op: String,
        #[source]
        err: anyhow::Error,
    },

    #[error("I/O error on {path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
}

impl Error {
    pub(crate) fn facility(op: impl Into<String>, err: anyhow::Error) -> Self {
        Error::Facility { op: op.into(), err }
    }

    pub(crate) fn io(path: impl Into<Utf8PathBuf>, err: std::io::Error) -> Self {
        Error::Io { path: path.into(), err }
    }

    /// Returns the validation failure behind this error, if that is what it
    /// is.
    pub fn as_validation(&self) -> Option<&ValidationError> {
        match self {
            Error::Validation(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_error_names_the_blocking_path() {
        let err = Error::UnmountBusy {
            dataset: "tank/.system/syslog-abc".to_string(),
            mountpoint: Some("/var/db/system/syslog-abc".into()),
            processes: vec![ProcessUsage {
                pid: 42,
                name: "syslog-ng".to_string(),
                paths: vec!["/var/db/system/syslog-abc/log/messages".into()],
            }],
        };
        assert_eq!(
            err.to_string(),
            "Unable to unmount tank/.system/syslog-abc: target is busy \
             (1 process(es) using /var/db/system/syslog-abc)"
        );
    }
}
