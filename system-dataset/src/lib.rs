// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Lifecycle management of the system dataset: the per-node ZFS dataset tree
//! holding logs, metrics, configuration and core dumps, kept mounted at a
//! stable path and relocatable between pools.

pub mod config;
pub mod dataset;
pub mod error;
pub mod facilities;
pub mod hooks;
pub mod host;
pub mod ledger;
pub mod manager;
pub mod mount;
pub mod params;
pub mod pool;
pub mod quiesce;

#[cfg(any(test, feature = "testing"))]
pub mod fakes;

pub use error::{Error, ValidationError};
pub use manager::SystemDatasetManager;
pub use params::{
    OrchestratorState, SystemDatasetConfig, SystemDatasetRecord,
    SystemDatasetUpdate,
};
