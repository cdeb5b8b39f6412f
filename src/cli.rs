// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// fedmesh — decentralized federated-learning coordinator.
///
/// One binary, three roles.  A node keeps its role for its whole lifetime:
///
/// * `bootstrap` — the rendezvous point other nodes dial at startup
/// * `client`    — originates a training round for a funded task
/// * `trainer`   — contributes compute to advertised rounds
///
/// All node configuration comes from the environment (OPERATOR_ID,
/// CONTRACT_ID, BOOTSTRAP_ADDR, OBJECT_STORE_*, …); run `show-config` to see
/// what the current environment resolves to.
#[derive(Parser, Debug)]
#[command(name = "fedmesh", version, about)]
pub struct Cli {
    /// Log to stderr at debug level (RUST_LOG overrides).
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the bootstrap rendezvous node (fixed overlay port, admin HTTP on
    /// 9000).
    Bootstrap,

    /// Run a client node (HTTP control surface on 9001 for the UI).
    Client,

    /// Run a trainer node.
    Trainer,

    /// Print the configuration resolved from the environment and exit.
    /// Secrets are omitted.
    ShowConfig,

    /// Split a CSV dataset into chunks, upload them, and print the manifest
    /// URL and chunk count to pass to the funding wallet.
    UploadDataset {
        /// Path to the CSV file (first line is the header).
        file: PathBuf,

        /// Target chunk size in bytes; rows are never split.
        #[arg(long, default_value_t = fedmesh_store::DEFAULT_CHUNK_BYTES)]
        chunk_bytes: usize,
    },

    /// Upload a model artifact and print its content hash.
    UploadModel {
        /// Path to the executable model artifact.
        file: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }
}
