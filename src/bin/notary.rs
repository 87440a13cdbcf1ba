//! Command line access to workflow catalogs and notarized process records.
//!
//! ```bash
//! notary validate
//! notary export bottling 0190f0c2a3b47d5e8f0123456789abcd
//! notary merkle bottling 0190f0c2a3b47d5e8f0123456789abcd
//! notary resolve bottling /01/09506000134352/10/LOT-1/21/0190f0c2a3b47d5e8f0123456789abcd
//! ```
use anyhow::Context;
use clap::{Parser, Subcommand};
use process_notary::ProcessService;
use process_notary::catalog::Catalog;
use process_notary::config::NotaryConfig;
use process_notary::logging::init_tracing;
use process_notary::types::ProcessId;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "notary")]
#[command(version)]
#[command(about = "Inspect workflow catalogs and notarized process records")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// YAML configuration file
    #[arg(long, short, global = true, env = "NOTARY_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate every workflow in the catalog
    Validate,

    /// Print the notarized export of a process as JSON
    Export { workflow: String, process: String },

    /// Print only the Merkle object of a process
    Merkle { workflow: String, process: String },

    /// Decode a GS1 Digital Link path and print the matching process id
    Resolve { workflow: String, path: String },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = NotaryConfig::load(cli.config.as_deref()).context("loading configuration")?;
    init_tracing(&config.log_filter);

    let catalog = Catalog::open(&config.workflows_dir).context("loading workflow catalog")?;
    let snapshot = catalog.snapshot()?;

    match cli.command {
        Commands::Validate => {
            for key in snapshot.keys() {
                println!("ok  {key}");
            }
            println!("{} workflow(s) valid", snapshot.len());
        }
        Commands::Export { workflow, process } => {
            let workflow = snapshot.get(&workflow)?;
            let id: ProcessId = process.parse().context("parsing process id")?;
            let service = ProcessService::from_config(&config)?;
            let export = service.export_notarized(&workflow, &id)?;
            println!("{}", serde_json::to_string_pretty(&export)?);
        }
        Commands::Merkle { workflow, process } => {
            let workflow = snapshot.get(&workflow)?;
            let id: ProcessId = process.parse().context("parsing process id")?;
            let service = ProcessService::from_config(&config)?;
            let merkle = service.export_merkle(&workflow, &id)?;
            println!("{}", serde_json::to_string_pretty(&merkle)?);
        }
        Commands::Resolve { workflow, path } => {
            let workflow = snapshot.get(&workflow)?;
            let service = ProcessService::from_config(&config)?;
            let process = service.resolve_digital_link(&workflow, &path)?;
            println!("{}", process.id);
        }
    }
    Ok(())
}
