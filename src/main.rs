mod args;

use std::sync::Arc;

use args::{ApiKeyCommands, Cli, Commands};
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use mcp_gateway::{env, server, Registry};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let registry = Arc::new(Registry::open(env::database_url())?);

    match cli.command {
        Commands::Serve { port, host } => server::run(registry, host, port).await,

        Commands::ApiKey { command } => match command {
            ApiKeyCommands::Issue { name } => {
                let secret = registry
                    .issue_api_key(&name)
                    .map_err(|e| anyhow::anyhow!("{e}"))?;
                println!("{secret}");
                eprintln!("store this secret now; only its hash is kept");
                Ok(())
            }
            ApiKeyCommands::Revoke { name } => {
                let revoked = registry
                    .revoke_api_key(&name)
                    .map_err(|e| anyhow::anyhow!("{e}"))?;
                if revoked {
                    println!("revoked '{name}'");
                } else {
                    println!("no active key named '{name}'");
                }
                Ok(())
            }
            ApiKeyCommands::List => {
                for key in registry
                    .list_api_keys()
                    .map_err(|e| anyhow::anyhow!("{e}"))?
                {
                    println!(
                        "{}  {}  active={}  last_used={}",
                        key.name,
                        &key.hash[..16],
                        key.active,
                        key.last_used.as_deref().unwrap_or("never")
                    );
                }
                Ok(())
            }
        },
    }
}

fn init_tracing() {
    let default = if env::is_production() { "info" } else { "debug" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
