//! Autoflow CLI - run and inspect multi-agent workflows locally.
//!
//! A thin driver over autoflow-core: every command builds the same engine
//! the library exposes and prints what it did.

use autoflow_cli::commands;
use clap::{Parser, Subcommand};

/// Autoflow CLI - multi-agent workflow orchestration
#[derive(Parser)]
#[command(name = "autoflow", version, about = "Autoflow CLI - multi-agent workflow orchestration")]
pub struct Cli {
    /// Path to the SQLite database file (overrides the config file)
    #[arg(long, env = "AUTOFLOW_DB_PATH")]
    db: Option<String>,

    /// Engine configuration YAML
    #[arg(long, env = "AUTOFLOW_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a YAML workflow
    Run {
        /// Path to the workflow YAML file
        file: String,
        /// Print lifecycle events as they happen
        #[arg(long, short)]
        verbose: bool,
    },

    /// Parse, layer and validate a workflow without running it
    Validate {
        /// Path to the workflow YAML file
        file: String,
    },

    /// Print a workflow's execution order as numbered groups
    Plan {
        /// Path to the workflow YAML file
        file: String,
    },

    /// List the provider catalog, or the ranked providers for a role
    Providers {
        /// planner | executor | verifier | auditor | synthesizer
        #[arg(long)]
        role: Option<String>,
    },

    /// Print the audit trail of a workflow run
    Audit {
        /// Workflow ID
        workflow_id: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "autoflow_core=info,autoflow_cli=info".into()),
        )
        .init();

    // API keys and AUTOFLOW_* overrides may live in .env files.
    commands::load_dotenv();

    let result = match cli.command {
        Some(Commands::Run { file, verbose }) => {
            match commands::init_state(cli.config.as_deref(), cli.db.as_deref()).await {
                Ok(state) => commands::workflow::run(&state, &file, verbose).await,
                Err(e) => Err(e),
            }
        }
        Some(Commands::Validate { file }) => commands::workflow::validate(&file).await,
        Some(Commands::Plan { file }) => commands::workflow::plan(&file).await,
        Some(Commands::Providers { role }) => {
            match commands::init_state(cli.config.as_deref(), cli.db.as_deref()).await {
                Ok(state) => commands::providers::list(&state, role.as_deref()).await,
                Err(e) => Err(e),
            }
        }
        Some(Commands::Audit { workflow_id }) => {
            match commands::init_state(cli.config.as_deref(), cli.db.as_deref()).await {
                Ok(state) => commands::audit::show(&state, &workflow_id).await,
                Err(e) => Err(e),
            }
        }
        None => {
            use clap::CommandFactory;
            Cli::command().print_help().ok();
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
