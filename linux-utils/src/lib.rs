// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wrappers around Linux storage and service-management commands.

pub mod filesystem;
pub mod host;
pub mod svc;
pub mod zfs;
pub mod zpool;

#[cfg(any(test, feature = "testing"))]
pub mod fakes;

pub use host::ExecutionError;

pub const MOUNT: &str = "/usr/bin/mount";
pub const UMOUNT: &str = "/usr/bin/umount";
pub const RSYNC: &str = "/usr/bin/rsync";
