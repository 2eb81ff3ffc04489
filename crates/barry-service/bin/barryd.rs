// Copyright (c) Barry contributors
// SPDX-License-Identifier: Apache-2.0

//! The barry tiered-backup daemon binary.

use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use barry_core::{log_history::DEFAULT_HISTORY_SIZE, Log, LogHistory};
use barry_service::{
    alert::{AlertSender, LogAlertSender, SmtpAlertSender},
    engine::Engine,
    server,
    AppConfig,
};
use barry_swift::SwiftClient;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "barry tiered-backup daemon")]
struct Args {
    /// Path of the TOML configuration file.
    #[arg(short, long, default_value = "/etc/barry/barry.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon (default).
    Run,
    /// Parse and validate the configuration, then exit.
    CheckConfig,
    /// Restore the catalog and API keys from the self-backup container, then exit.
    SelfRestore,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();
    let config = AppConfig::load(&args.config)?;

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::CheckConfig => {
            config.check_paths()?;
            println!("configuration OK");
            Ok(())
        }
        Command::SelfRestore => {
            let store = connect_store(&config).await?;
            Engine::self_restore(&config, store).await?;
            println!("catalog and API keys restored");
            Ok(())
        }
    }
}

async fn connect_store(config: &AppConfig) -> anyhow::Result<Arc<SwiftClient>> {
    let store = Arc::new(SwiftClient::new(config.swift.clone()));
    store
        .connect()
        .await
        .context("unable to authenticate with the object store")?;
    Ok(store)
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
    let store = connect_store(&config).await?;
    let alert_sender: Arc<dyn AlertSender> = match &config.smtp {
        Some(smtp) => Arc::new(SmtpAlertSender::new(smtp)?),
        None => Arc::new(LogAlertSender),
    };
    let log = Log::new(Arc::new(LogHistory::new(DEFAULT_HISTORY_SIZE)));

    let engine = Engine::new(config, store, alert_sender, log).await?;

    let cancel = CancellationToken::new();
    let tasks = engine.spawn_tasks(&cancel);
    let api = tokio::spawn(server::serve(engine.clone(), cancel.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("unable to listen for the shutdown signal")?;
    tracing::info!("shutdown signal received");
    cancel.cancel();

    for task in tasks {
        let _ = task.await;
    }
    api.await??;
    Ok(())
}
