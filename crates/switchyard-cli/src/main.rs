//! Switchyard CLI — inspect, exercise and watch compiled workflow runtimes.
//!
//! Wires the same `EngineContext` a serving layer would, from a YAML config
//! file, and exposes it through a handful of operator commands.

mod commands;

use clap::{Parser, Subcommand};

/// Switchyard CLI — workflow runtime engine
#[derive(Parser)]
#[command(name = "switchyard", version, about = "Switchyard CLI — workflow runtime engine")]
pub struct Cli {
    /// Path to the engine configuration file
    #[arg(long, env = "SWITCHYARD_CONFIG", default_value = "switchyard.yaml")]
    config: String,

    /// Path to the SQLite checkpoint database (overrides the config file)
    #[arg(long, env = "SWITCHYARD_DB_PATH")]
    db: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// List discovered plugin manifests
    Plugins,

    /// Build a workflow through the runtime cache and print its topology
    Inspect {
        /// Workflow ID
        workflow_id: String,
    },

    /// Send messages to a workflow
    Chat {
        /// Workflow ID
        workflow_id: String,
        /// Conversation thread ID
        #[arg(long, default_value = "cli")]
        thread: String,
        /// Send one message and exit instead of starting a session
        #[arg(long, short = 'm')]
        message: Option<String>,
    },

    /// Rebuild workflows as their definition files change
    Watch {
        /// Poll interval of the file watcher in milliseconds
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "switchyard_core=info,switchyard=info".into()),
        )
        .init();

    let result = if let Some(command) = cli.command {
        let ctx = commands::init_context(&cli.config, cli.db.as_deref());
        let outcome = match command {
            Commands::Plugins => commands::plugins::list(&ctx).await,
            Commands::Inspect { workflow_id } => commands::inspect::run(&ctx, &workflow_id).await,
            Commands::Chat {
                workflow_id,
                thread,
                message,
            } => commands::chat::run(&ctx, &workflow_id, &thread, message.as_deref()).await,
            Commands::Watch { interval_ms } => commands::watch::run(&ctx, interval_ms).await,
        };
        ctx.shutdown().await;
        outcome
    } else {
        use clap::CommandFactory;
        Cli::command().print_help().ok();
        println!();
        Ok(())
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
