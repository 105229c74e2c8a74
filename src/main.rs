//! MCP Proxy Router - one MCP endpoint over many downstream servers

use std::collections::HashMap;
use std::process::ExitCode;

use clap::Parser;
use clap::error::ErrorKind;
use tracing::error;

use mcp_proxy_router::{
    cli::{Cli, Command, parse_key_val},
    config::Settings,
    config_store::{ConfigStore, ServerEntry},
    registry::Registry,
    setup_tracing,
    upstream::ProxyServer,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(1),
            };
        }
    };

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::from(2);
    }

    let settings = match load_settings(&cli) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(2);
        }
    };

    match cli.command {
        Some(Command::Add { name, args }) => run_add(&settings, &name, &args).await,
        Some(Command::StoreAuth { name, pairs }) => run_store_auth(&settings, &name, &pairs).await,
        Some(Command::Serve) | None => run_server(settings).await,
    }
}

/// Load settings and apply CLI overrides
fn load_settings(cli: &Cli) -> mcp_proxy_router::Result<Settings> {
    let mut settings = Settings::load(cli.settings.as_ref())?;
    if let Some(config) = &cli.config {
        settings.paths.config_path = config.clone();
    }
    if let Some(port) = cli.port {
        settings.server.port = port;
    }
    Ok(settings)
}

/// Run the proxy server
async fn run_server(settings: Settings) -> ExitCode {
    let server = match ProxyServer::new(settings) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "Failed to assemble proxy");
            return ExitCode::from(2);
        }
    };

    match server.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Proxy server failed");
            ExitCode::from(2)
        }
    }
}

/// Validate a catalogued server and queue it into the config document
async fn run_add(settings: &Settings, name: &str, raw_args: &[String]) -> ExitCode {
    let mut user_args = HashMap::new();
    for raw in raw_args {
        match parse_key_val(raw) {
            Ok((key, value)) => {
                user_args.insert(key, value);
            }
            Err(e) => {
                eprintln!("{e}");
                return ExitCode::from(1);
            }
        }
    }

    let registry = registry_from(settings);

    let entry = match registry.get(name).await {
        Ok(Some(entry)) => entry,
        Ok(None) => {
            let known = registry.known_names().await.unwrap_or_default();
            eprintln!("Unknown server '{name}'. Known servers: {}", known.join(", "));
            return ExitCode::from(2);
        }
        Err(e) => {
            eprintln!("Failed to load catalog: {e}");
            return ExitCode::from(2);
        }
    };

    let missing_args = entry.missing_arguments(&user_args);
    if !missing_args.is_empty() {
        eprintln!("Server '{name}' needs arguments:");
        for req in missing_args {
            match &req.example {
                Some(example) => {
                    eprintln!("  --arg {}=<value>   {} (e.g. {example})", req.name, req.description);
                }
                None => eprintln!("  --arg {}=<value>   {}", req.name, req.description),
            }
        }
        return ExitCode::from(2);
    }

    let missing_auth = entry.unsatisfied_auth();
    if !missing_auth.is_empty() {
        eprintln!("Server '{name}' requires credentials:");
        for req in missing_auth {
            eprintln!("  {}   {}", req.name, req.description);
        }
        eprintln!("Store them with: mcp-proxy-router store-auth {name} KEY=VALUE");
        return ExitCode::from(2);
    }

    let launch = match entry.build_launch(&user_args) {
        Ok(launch) => launch,
        Err(e) => {
            eprintln!("Failed to build launch spec: {e}");
            return ExitCode::from(2);
        }
    };

    let store = ConfigStore::new(settings.paths.config_path.clone());
    let mut config = match store.load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to read {}: {e}", settings.paths.config_path.display());
            return ExitCode::from(2);
        }
    };

    if config.servers.iter().any(|s| s.name == name) {
        println!("Server '{name}' is already in the active set");
        return ExitCode::SUCCESS;
    }

    config.servers.push(ServerEntry {
        name: name.to_string(),
        transport: launch,
    });
    config.active_mcp_queue.push(name.to_string());

    if let Err(e) = store.persist(&config) {
        eprintln!("Failed to write {}: {e}", settings.paths.config_path.display());
        return ExitCode::from(2);
    }

    println!(
        "Queued '{name}' into {}; a running proxy applies it via the config watcher",
        settings.paths.config_path.display()
    );
    ExitCode::SUCCESS
}

/// Persist credentials into the catalog
async fn run_store_auth(settings: &Settings, name: &str, raw_pairs: &[String]) -> ExitCode {
    let mut pairs = Vec::new();
    for raw in raw_pairs {
        match parse_key_val(raw) {
            Ok(pair) => pairs.push(pair),
            Err(e) => {
                eprintln!("{e}");
                return ExitCode::from(1);
            }
        }
    }

    let registry = registry_from(settings);
    match registry.store_auth(name, &pairs).await {
        Ok(()) => {
            println!("Stored {} value(s) for '{name}'", pairs.len());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Failed to store auth for '{name}': {e}");
            ExitCode::from(2)
        }
    }
}

fn registry_from(settings: &Settings) -> Registry {
    Registry::new(
        settings.paths.catalog_path.clone(),
        settings.paths.index_path.clone(),
        settings.paths.cache_ttl,
        None,
    )
}
