// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use fedmesh_node::NodeError;
use fedmesh_store::ObjectStore;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(cli: Cli) -> Result<(), NodeError> {
    let config = fedmesh_config::from_env()?;

    match cli.command {
        Commands::Bootstrap => fedmesh_node::run_bootstrap(config).await,
        Commands::Client => fedmesh_node::run_client(config).await,
        Commands::Trainer => fedmesh_node::run_trainer(config).await,

        Commands::ShowConfig => {
            let rendered = serde_json::to_string_pretty(&config)
                .map_err(|e| NodeError::Internal(e.to_string()))?;
            println!("{rendered}");
            Ok(())
        }

        Commands::UploadDataset { file, chunk_bytes } => {
            let store = Arc::new(ObjectStore::new(config.require_store()?));
            let (manifest_url, chunks) = store.upload_dataset_as_chunks(&file, chunk_bytes).await?;
            println!("chunks: {chunks}");
            println!("manifest: {manifest_url}");
            Ok(())
        }

        Commands::UploadModel { file } => {
            let store = Arc::new(ObjectStore::new(config.require_store()?));
            let bytes = tokio::fs::read(&file)
                .await
                .map_err(|e| NodeError::Internal(format!("{}: {e}", file.display())))?;
            let hash = store.upload(bytes).await?;
            println!("modelHash: {hash}");
            Ok(())
        }
    }
}

/// Logs go to stderr; `RUST_LOG` wins over `--verbose`.
fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}
