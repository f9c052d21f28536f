//! CLI arguments for the mirrorfs binaries.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// CLI arguments for the server binary.
#[derive(Parser, Debug)]
#[clap(name = "mirrorfs-server")]
#[clap(about = "Central file mirror server with lock-serialised writes", long_about = None)]
pub struct ServerArgs {
    /// Port to listen on
    #[clap(short, long, default_value = "50051")]
    pub port: u16,

    /// Host to bind to
    #[clap(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Storage directory for files
    #[clap(long, default_value = "./mount/server", value_name = "DIR")]
    pub mount: PathBuf,
}

/// CLI arguments for the client binary.
#[derive(Parser, Debug)]
#[clap(name = "mirrorfs-client")]
#[clap(about = "Mirror client: one-shot transfers or a watching sync loop", long_about = None)]
pub struct ClientArgs {
    /// Server address (host:port or full URL)
    #[clap(long, default_value = "localhost:50051")]
    pub server: String,

    /// Client identifier
    #[clap(long = "id", value_name = "ID")]
    pub client_id: String,

    /// Local mirror directory
    #[clap(long, default_value = "./mount/client", value_name = "DIR")]
    pub mount: PathBuf,

    /// Seconds between reconciliation passes (watch mode)
    #[clap(long, default_value = "1", value_name = "SECS")]
    pub sync_interval: u64,

    /// Deadline in seconds for one watcher event round-trip (watch mode)
    #[clap(long, default_value = "30", value_name = "SECS")]
    pub event_timeout: u64,

    #[clap(subcommand)]
    pub command: ClientCommand,
}

#[derive(Subcommand, Debug)]
pub enum ClientCommand {
    /// Store a file on the server
    Store { file: String },
    /// Fetch a file from the server into the mirror
    Fetch { file: String },
    /// Delete a file from the server
    Delete { file: String },
    /// Watch the mirror directory and keep it in sync
    Watch,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_args_parse() {
        let args = ClientArgs::parse_from([
            "mirrorfs-client",
            "--id",
            "a",
            "--server",
            "localhost:9999",
            "store",
            "notes.txt",
        ]);
        assert_eq!(args.client_id, "a");
        assert_eq!(args.server, "localhost:9999");
        assert!(matches!(args.command, ClientCommand::Store { ref file } if file == "notes.txt"));
        assert_eq!(args.sync_interval, 1);
        assert_eq!(args.event_timeout, 30);
    }

    #[test]
    fn test_server_args_defaults() {
        let args = ServerArgs::parse_from(["mirrorfs-server"]);
        assert_eq!(args.port, 50051);
        assert_eq!(args.host, "127.0.0.1");
    }
}
