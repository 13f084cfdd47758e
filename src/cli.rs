use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "harambee-core")]
#[command(about = "Harambee Core - M-Pesa donation confirmation engine", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server (default)
    Serve,

    /// Database management commands
    #[command(subcommand)]
    Db(DbCommands),

    /// Validate configuration and, in live mode, test provider credentials
    Config,
}

#[derive(Subcommand)]
pub enum DbCommands {
    /// Run database migrations
    Migrate,
}
