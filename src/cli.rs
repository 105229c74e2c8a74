//! Command-line interface definitions for `mcp-proxy-router`.
//!
//! Defines the top-level [`Cli`] struct parsed by `clap` and the [`Command`]
//! subcommand enum. Running without a subcommand starts the proxy server.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Aggregating MCP proxy router
///
/// Exposes the union of tools, prompts, and resources from many downstream
/// MCP servers as one endpoint while keeping only a bounded number of them
/// running. Run without a subcommand to start the server.
#[derive(Parser, Debug)]
#[command(name = "mcp-proxy-router")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to the settings file (JSON)
    #[arg(short, long, env = "MCP_PROXY_SETTINGS", global = true)]
    pub settings: Option<PathBuf>,

    /// Path of the active-set config document (overrides settings)
    #[arg(long, env = "MCP_CONFIG_PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Port the upstream endpoint listens on (overrides settings)
    #[arg(short, long, env = "PORT")]
    pub port: Option<u16>,

    /// Minimum log level: trace, debug, info, warn, or error
    #[arg(
        long,
        default_value = "info",
        env = "MCP_PROXY_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log output format: "text" for human-readable, "json" for structured
    #[arg(long, env = "MCP_PROXY_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand to run (defaults to server mode when omitted)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Top-level subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the proxy server (default when no subcommand is given)
    #[command(about = "Start the proxy server")]
    Serve,

    /// Queue a catalogued server into the active set config
    ///
    /// Validates the server against the catalog and appends it to the
    /// config document; a running proxy picks the change up through its
    /// file watcher.
    #[command(about = "Add a catalogued server to the active set")]
    Add {
        /// Catalog name of the server
        name: String,

        /// Launch argument as NAME=VALUE (repeatable)
        #[arg(long = "arg", value_name = "NAME=VALUE")]
        args: Vec<String>,
    },

    /// Persist credential values into the catalog for one server
    #[command(about = "Store auth values for a catalogued server")]
    StoreAuth {
        /// Catalog name of the server
        name: String,

        /// Credential as KEY=VALUE (repeatable)
        #[arg(required = true, value_name = "KEY=VALUE")]
        pairs: Vec<String>,
    },
}

/// Split a `KEY=VALUE` argument
///
/// # Errors
///
/// Returns a message when no `=` is present or the key is empty.
pub fn parse_key_val(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("'{raw}' is not of the form KEY=VALUE")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn parse_key_val_accepts_values_with_equals() {
        assert_eq!(
            parse_key_val("TOKEN=abc=def").unwrap(),
            ("TOKEN".to_string(), "abc=def".to_string())
        );
    }

    #[test]
    fn parse_key_val_rejects_malformed() {
        assert!(parse_key_val("noequals").is_err());
        assert!(parse_key_val("=value").is_err());
    }

    #[test]
    fn add_subcommand_parses_args() {
        let cli = Cli::try_parse_from([
            "mcp-proxy-router",
            "add",
            "files",
            "--arg",
            "root=/tmp",
        ])
        .unwrap();
        match cli.command {
            Some(Command::Add { name, args }) => {
                assert_eq!(name, "files");
                assert_eq!(args, vec!["root=/tmp".to_string()]);
            }
            other => panic!("expected add command, got {other:?}"),
        }
    }

    #[test]
    fn store_auth_requires_pairs() {
        assert!(Cli::try_parse_from(["mcp-proxy-router", "store-auth", "git"]).is_err());
        let cli =
            Cli::try_parse_from(["mcp-proxy-router", "store-auth", "git", "GIT_TOKEN=x"]).unwrap();
        assert!(matches!(cli.command, Some(Command::StoreAuth { .. })));
    }
}
