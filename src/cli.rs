use clap::{Parser, Subcommand};

/// gitauth: personal access tokens and SSH keys for git clients
#[derive(Parser)]
#[command(name = "gitauth", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the credential service
    Serve {
        /// Port to bind (defaults to GITAUTH_PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Validate configuration and hash support, then exit
    CheckConfig,

    /// Manage personal access tokens
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },

    /// Manage SSH public keys
    SshKey {
        #[command(subcommand)]
        command: SshKeyCommands,
    },
}

#[derive(Subcommand)]
pub enum TokenCommands {
    /// Create a token; the secret is printed once
    Create {
        #[arg(long)]
        user: String,
        #[arg(long, default_value = "")]
        label: String,
        #[arg(long, value_delimiter = ',')]
        scopes: Option<Vec<String>>,
        /// RFC 3339 expiry, e.g. 2027-01-01T00:00:00Z
        #[arg(long)]
        expires_at: Option<String>,
        /// Revoke active tokens with the same label first
        #[arg(long)]
        replace: bool,
    },
    /// List a user's tokens
    List {
        #[arg(long)]
        user: String,
    },
    /// Revoke a token
    Revoke {
        #[arg(long)]
        user: String,
        #[arg(long)]
        token_id: String,
    },
    /// Introspect a secret read from stdin
    Introspect,
}

#[derive(Subcommand)]
pub enum SshKeyCommands {
    /// Register a public key (OpenSSH line, or @path to read a file)
    Add {
        #[arg(long)]
        user: String,
        #[arg(long, default_value = "")]
        name: String,
        #[arg(long)]
        key: String,
    },
    /// List a user's keys
    List {
        #[arg(long)]
        user: String,
    },
    /// Remove a key
    Remove {
        #[arg(long)]
        user: String,
        #[arg(long)]
        key_id: String,
    },
    /// Resolve a fingerprint to its owner
    Lookup { fingerprint: String },
}
