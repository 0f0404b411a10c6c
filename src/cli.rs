use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::core::Engine;

#[derive(Parser)]
#[command(name = "doclineage")]
#[command(about = "Lineage declared in Python docstrings, reconciled into OpenMetadata")]
#[command(version)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Dry run: print the extracted lineage model
    Scan {
        /// Root of the source tree
        #[arg(default_value = ".")]
        root: PathBuf,

        /// Write the model here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Write a run report
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Offline: write the catalog operations a run would apply
    Plan {
        /// Root of the source tree
        #[arg(default_value = ".")]
        root: PathBuf,

        /// Intent file (defaults to requestsPath from the config)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Write a run report
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Online: create missing services, pipelines, tasks and edges
    Apply {
        /// Root of the source tree
        #[arg(default_value = ".")]
        root: PathBuf,

        /// Write a run report
        #[arg(long)]
        report: Option<PathBuf>,

        /// Exit non-zero if any file or entity failed (useful for CI)
        #[arg(long)]
        strict: bool,
    },
}

impl Cli {
    pub async fn execute(self, engine: Engine) -> Result<()> {
        match self.command {
            Commands::Scan { root, output, report } => engine.scan(&root, output, report).await,
            Commands::Plan { root, output, report } => engine.plan(&root, output, report).await,
            Commands::Apply { root, report, strict } => engine.apply(&root, report, strict).await,
        }
    }
}
