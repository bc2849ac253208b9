use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "mcp-gateway")]
#[command(version)]
#[command(about = "Reverse proxy and process supervisor for MCP servers", long_about = None)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Run the gateway server
    Serve {
        /// Override the listen port from the settings store
        #[arg(short, long)]
        port: Option<u16>,

        /// Override the listen host from the settings store
        #[arg(long)]
        host: Option<String>,
    },

    /// Manage management-API keys
    ApiKey {
        #[command(subcommand)]
        command: ApiKeyCommands,
    },
}

#[derive(Subcommand)]
pub(crate) enum ApiKeyCommands {
    /// Issue a new key; the secret is printed exactly once
    Issue {
        /// Human label for the key (e.g. "ci", "dashboard")
        name: String,
    },

    /// Deactivate every active key with the given name
    Revoke { name: String },

    /// List issued keys (hashes only)
    List,
}
