// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Executable program to inspect and manage the system dataset

use anyhow::{anyhow, Context};
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand, ValueEnum};
use linux_utils::host::HostExecutor;
use schemars::schema_for;
use serde::Serialize;
use slog::{info, Logger};
use std::sync::Arc;
use system_dataset::config::Config;
use system_dataset::hooks::{HookRegistry, PoolEvent};
use system_dataset::host::host_collaborators;
use system_dataset::ledger::FileConfigStore;
use system_dataset::{
    SystemDatasetConfig, SystemDatasetManager, SystemDatasetUpdate,
};

#[derive(Debug, Parser)]
#[clap(name = "sysdataset", about = "Manage the system dataset")]
struct Args {
    /// Path to the configuration file.
    #[clap(
        short,
        long,
        env = "SYSDATASET_CONFIG",
        default_value = "/etc/sysdataset/config.toml",
        action
    )]
    config: Utf8PathBuf,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the current configuration.
    Config,
    /// Change the configuration, relocating the dataset if needed.
    Update {
        /// Move the dataset to this pool.
        #[clap(long, conflicts_with = "auto", action)]
        pool: Option<String>,
        /// Let the first eligible pool be picked.
        #[clap(long, action)]
        auto: bool,
        /// A pool automatic selection must not pick.
        #[clap(long, action)]
        exclude: Option<String>,
        /// Whether syslog should log to the dataset.
        #[clap(long, action)]
        syslog: Option<bool>,
    },
    /// Make sure the dataset is mounted where the configuration says.
    Setup {
        #[clap(long, action)]
        exclude: Option<String>,
    },
    /// Copy the dataset from one pool to another and mount the copy.
    Migrate {
        /// Source pool; omit to mount the destination directly.
        #[clap(long, default_value = "", action)]
        from: String,
        #[clap(long, action)]
        to: String,
    },
    /// List the pools the dataset may be placed on.
    PoolChoices,
    /// Report whether the dataset is on the boot pool.
    IsBootPool,
    /// Run the hooks for a pool lifecycle event.
    Hook {
        #[clap(value_enum, action)]
        event: HookEvent,
        pool: String,
    },
    /// Print the JSON schema of the update request and configuration.
    Schema,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum HookEvent {
    PostCreate,
    PostImport,
    PreExport,
}

impl From<HookEvent> for PoolEvent {
    fn from(event: HookEvent) -> Self {
        match event {
            HookEvent::PostCreate => PoolEvent::PostCreate,
            HookEvent::PostImport => PoolEvent::PostImport,
            HookEvent::PreExport => PoolEvent::PreExport,
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_config(config: &SystemDatasetConfig) -> anyhow::Result<()> {
    print_json(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if let Command::Schema = args.command {
        return print_json(&serde_json::json!({
            "update": schema_for!(SystemDatasetUpdate),
            "config": schema_for!(SystemDatasetConfig),
        }));
    }

    let config = Config::from_file(&args.config)?;
    let log = config
        .log
        .to_logger("sysdataset")
        .map_err(|err| anyhow!("initializing logger: {err}"))?;
    let manager = Arc::new(build_manager(&log, &config));

    match args.command {
        Command::Config => print_config(&manager.config().await?),
        Command::Update { pool, auto, exclude, syslog } => {
            let mut update = if auto {
                SystemDatasetUpdate::automatic(exclude.as_deref())
            } else {
                SystemDatasetUpdate {
                    pool: pool.map(Some),
                    pool_exclude: exclude,
                    ..Default::default()
                }
            };
            update.syslog = syslog;
            print_config(&manager.update(update).await?)
        }
        Command::Setup { exclude } => {
            print_config(&manager.setup(exclude.as_deref()).await?)
        }
        Command::Migrate { from, to } => {
            manager.migrate(&from, &to).await?;
            print_config(&manager.config().await?)
        }
        Command::PoolChoices => print_json(&manager.pool_choices().await?),
        Command::IsBootPool => print_json(&manager.is_boot_pool().await?),
        Command::Hook { event, pool } => {
            let hooks = HookRegistry::new(&log, manager.clone());
            hooks
                .dispatch(event.into(), &pool)
                .await
                .with_context(|| format!("running {event:?} hooks"))?;
            info!(log, "Hooks complete"; "pool" => pool);
            Ok(())
        }
        Command::Schema => Ok(()),
    }
}

fn build_manager(log: &Logger, config: &Config) -> SystemDatasetManager {
    let executor = HostExecutor::new(log.clone()).as_executor();
    let store = Arc::new(FileConfigStore::new(log, &config.ledger));
    let collab = host_collaborators(log, config, executor, store);
    SystemDatasetManager::new(log, config.paths.clone(), collab)
}
