//! schemahero: apply job entry point
//!
//! Runs inside apply pods created for approved migrations:
//!
//! ```text
//! schemahero apply --driver postgres --ddl /input/ddl.sql --uri postgres://...
//! schemahero apply --driver postgres --ddl /input/ddl.sql --vault-uri-ref /vault/secrets/schemaherouri
//! schemahero apply --driver cassandra --ddl /input/ddl.sql --host 10.0.0.1 --keyspace app
//! ```
//!
//! Exits non-zero when the DDL cannot be applied, so the pod restarts.

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use schemahero::apply::{self, ApplyArgs};
use schemahero::config::Config;
use schemahero::plugin::{self, codec, PluginManager};
use schemahero::utils::bootstrap::init_tracing;

#[derive(Parser)]
#[command(name = "schemahero", about = "Declarative database schema management")]
struct Cli {
    /// Configuration file.
    #[arg(long, short, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply a DDL file to a database.
    Apply(ApplyArgs),
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    match cli.command {
        Command::Apply(args) => {
            codec::register_payload_types();
            let plugins = plugin::global::init(PluginManager::from_config(&config.plugins)?);
            if let Err(e) = plugins.discover_plugins().await {
                warn!(error = %e, "Plugin discovery failed");
            }

            let result = apply::run(&args, &plugins).await;
            plugins.cleanup().await;
            match result {
                Ok(applied) => {
                    info!(driver = %args.driver, statements = applied, "Apply finished");
                    Ok(())
                }
                Err(e) => {
                    error!(driver = %args.driver, error = %e, "Apply failed");
                    Err(e.into())
                }
            }
        }
    }
}
