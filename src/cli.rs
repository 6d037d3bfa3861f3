use clap::{Parser, Subcommand};

use crate::McpCatalog;

#[derive(Parser)]
#[command(name = "inboxpilot")]
#[command(about = "Microsoft Graph notification relay, mail tools and knowledge store", long_about = None)]
#[command(version)]
pub(crate) struct Cli {
    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    pub(crate) log_json: bool,

    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run the webhook receiver and operator endpoints.
    Serve {
        /// Bind host (overrides WEBHOOK_HOST)
        #[arg(long)]
        host: Option<String>,
        /// Bind port (overrides WEBHOOK_PORT)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Run an MCP tool server on stdio.
    Mcp {
        #[arg(long, value_enum)]
        server: McpCatalog,
    },

    /// Manage Graph change-notification subscriptions.
    Subscriptions {
        #[command(subcommand)]
        command: SubscriptionCommand,
    },

    /// Vector store servers and collections.
    Vector {
        #[command(subcommand)]
        command: VectorCommand,
    },

    /// Run the local OAuth consent flow and store the user token.
    Connect {
        /// Provider (only google is supported)
        provider: String,
        /// Bind address
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        /// Bind port
        #[arg(long, default_value_t = 8787)]
        port: u16,
        /// Redirect base URL (defaults to http://<bind>:<port>)
        #[arg(long)]
        redirect_base: Option<String>,
    },

    /// Inspect or edit the JSON config file.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand)]
pub(crate) enum SubscriptionCommand {
    /// Create a subscription for an arbitrary resource.
    Create {
        /// Graph resource path, e.g. users/{id}/mailFolders('Inbox')/messages
        #[arg(long)]
        resource: String,
        /// Comma-separated change types
        #[arg(long, default_value = "created")]
        change_type: String,
        /// Webhook path joined to WEBHOOK_BASE_URL; defaults to the email path
        #[arg(long)]
        webhook_path: Option<String>,
        /// Lifetime in hours
        #[arg(long)]
        expiration_hours: Option<i64>,
    },
    /// List subscriptions known to the provider.
    List,
    /// Extend a subscription's expiration.
    Renew {
        id: String,
        #[arg(long)]
        expiration_hours: Option<i64>,
    },
    /// Delete a subscription.
    Delete { id: String },
    /// Subscribe to new inbox messages.
    SetupEmail {
        /// Mailbox user id or UPN; defaults to me
        #[arg(long)]
        user_id: Option<String>,
    },
    /// Subscribe to all chat and channel messages.
    SetupTeams,
}

#[derive(Subcommand)]
pub(crate) enum VectorCommand {
    /// Start one Chroma server per collection and wait for them.
    Launch {
        /// Chroma executable
        #[arg(long, default_value = "chroma")]
        program: String,
        /// Seconds to wait for each heartbeat
        #[arg(long, default_value_t = 30)]
        wait_secs: u64,
    },
    /// Create both collections if missing.
    Init,
    /// Add one document.
    Add {
        /// Collection key or name (outlookEmail, teamsChat)
        #[arg(long)]
        collection: String,
        #[arg(long)]
        text: String,
        /// Record id (generated when omitted)
        #[arg(long)]
        id: Option<String>,
        /// Metadata as a JSON object
        #[arg(long)]
        metadata: Option<String>,
    },
    /// Similarity query.
    Query {
        #[arg(long)]
        collection: String,
        query: String,
        #[arg(short = 'n', long, default_value_t = 5)]
        limit: usize,
        /// Metadata filter as a JSON object
        #[arg(long = "where")]
        filter: Option<String>,
    },
    /// Record counts per collection.
    Stats,
    /// Drop and recreate a collection.
    Reset {
        #[arg(long)]
        collection: String,
        /// Required; the collection's records are discarded
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
pub(crate) enum ConfigCommand {
    /// Print resolved settings; secrets are masked.
    Show,
    /// Write a key into the config file.
    Set { key: String, value: String },
}
