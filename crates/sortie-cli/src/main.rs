//! Sortie CLI
//!
//! Inspect the module catalog, see how a command would be understood and
//! dry-run its plan against an authorized scope.
//!
//! # Usage
//! ```bash
//! sortie modules
//! sortie resolve scan 10.0.0.0/24 then scan any discovered web server
//! sortie plan --scope 10.0.0.0/24 scan 10.0.0.5
//! sortie --oracle oracle.toml resolve find the web servers on 10.0.0.0/24
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use sortie_core::CoreConfig;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

/// Sortie - natural-language driven assessment orchestration
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Core configuration file (TOML)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Module catalog (TOML); the built-in catalog when omitted
    #[arg(long, value_name = "FILE", global = true)]
    catalog: Option<PathBuf>,

    /// Oracle provider configuration (TOML or JSON)
    #[arg(long, value_name = "FILE", global = true)]
    oracle: Option<PathBuf>,

    /// Enable verbose debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List the modules in the catalog
    Modules {
        /// Full descriptors as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show how a command is understood
    Resolve {
        #[arg(required = true, trailing_var_arg = true)]
        text: Vec<String>,

        /// Skip the oracle and use the rule matcher only
        #[arg(long)]
        offline: bool,
    },

    /// Resolve a command and check it against the scope without running it
    Plan {
        /// Authorized targets: IPs, CIDR networks, host names, *.domain
        #[arg(short, long = "scope", value_name = "TARGET", required = true)]
        scope: Vec<String>,

        #[arg(long)]
        offline: bool,

        #[arg(required = true, trailing_var_arg = true)]
        text: Vec<String>,
    },

    /// Validate a workflow file against the catalog
    Workflow {
        file: PathBuf,
    },

    /// Print the effective core configuration
    Config,
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = CoreConfig::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Commands::Modules { json } => {
            let registry = commands::load_registry(cli.catalog.as_deref())?;
            if json {
                let descriptors = registry.descriptors();
                let descriptors: Vec<&sortie_core::ModuleDescriptor> = descriptors.iter().map(|d| d.as_ref()).collect();
                println!("{}", serde_json::to_string_pretty(&descriptors)?);
            } else {
                println!("{}", commands::render_modules(&registry));
            }
        }
        Commands::Resolve { text, offline } => {
            let registry = commands::load_registry(cli.catalog.as_deref())?;
            let oracle = commands::load_oracle(cli.oracle.as_deref())?;
            let resolution = commands::resolve(&config, &registry, oracle, &text.join(" "), offline).await?;
            println!("{}", serde_json::to_string_pretty(&resolution)?);
        }
        Commands::Plan { scope, offline, text } => {
            let registry = commands::load_registry(cli.catalog.as_deref())?;
            let oracle = commands::load_oracle(cli.oracle.as_deref())?;
            let scope = sortie_core::AuthorizedScope::from_specifiers(&scope).context("parsing --scope")?;
            let resolution = commands::resolve(&config, &registry, oracle, &text.join(" "), offline).await?;
            let plan = commands::plan(&registry, &resolution, &scope);
            println!("{}", serde_json::to_string_pretty(&plan)?);
        }
        Commands::Workflow { file } => {
            let registry = commands::load_registry(cli.catalog.as_deref())?;
            let definition = commands::check_workflow(&registry, &file)?;
            println!(
                "{}: {} step(s), {:?} policy",
                definition.name,
                definition.steps.len(),
                definition.policy
            );
        }
        Commands::Config => {
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}
