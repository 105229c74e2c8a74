//! Persistence for the active server set (`config.json`)
//!
//! The on-disk document records which backends are live and their LRU order:
//!
//! ```json
//! {
//!   "servers": [
//!     { "name": "git", "transport": { "type": "command", "command": "npx", "args": ["-y", "mcp-git"] } }
//!   ],
//!   "active_mcp_queue": ["git"]
//! }
//! ```
//!
//! Two input dialects are accepted on read: the internal `servers` array
//! above, and the standard `mcpServers` map used by desktop MCP clients.
//! Writes always use the internal dialect and are atomic (temp + rename).
//!
//! A filesystem watcher turns external edits into reload events. The proxy
//! itself writes this file on admit/evict, so consumers must diff the parsed
//! document against their own state (`same_servers`) before reacting -
//! reacting on timing alone would loop on our own writes.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::{Error, Result};

/// Quiet period after a filesystem event before the file is re-read.
const DEBOUNCE: Duration = Duration::from_millis(300);

/// Launch specification for one backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TransportSpec {
    /// Subprocess over stdio
    Command {
        /// Program to execute
        command: String,
        /// Program arguments
        #[serde(default)]
        args: Vec<String>,
        /// Environment overrides
        #[serde(default)]
        env: HashMap<String, String>,
    },
    /// Remote server, SSE dialect
    Sse {
        /// Endpoint URL
        url: String,
        /// Extra request headers
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    /// Remote server, Streamable HTTP dialect
    StreamableHttp {
        /// Endpoint URL
        url: String,
        /// Extra request headers
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

impl TransportSpec {
    /// Get transport type name
    #[must_use]
    pub fn transport_type(&self) -> &'static str {
        match self {
            Self::Command { .. } => "command",
            Self::Sse { .. } => "sse",
            Self::StreamableHttp { .. } => "streamable-http",
        }
    }
}

/// One backend in the persisted active set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEntry {
    /// Backend name
    pub name: String,
    /// Resolved launch specification
    pub transport: TransportSpec,
}

/// The persisted active set document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveConfig {
    /// Live backends with their launch specs
    #[serde(default)]
    pub servers: Vec<ServerEntry>,
    /// Backend names ordered cold to hot (ascending last-use)
    #[serde(default)]
    pub active_mcp_queue: Vec<String>,
}

/// Reads and writes the active set document at a fixed path
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    /// Create a store for the given path
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The path this store reads and writes
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load and normalize the document. A missing file is an empty config.
    ///
    /// # Errors
    ///
    /// Returns an error when the file exists but cannot be read or parsed;
    /// callers are expected to retain their last good config in that case.
    pub fn load(&self) -> Result<ActiveConfig> {
        if !self.path.exists() {
            return Ok(ActiveConfig::default());
        }
        let text = fs::read_to_string(&self.path)?;
        parse_config(&text)
    }

    /// Persist the document atomically (write to temp, then rename)
    ///
    /// # Errors
    ///
    /// Returns an error if the temp file cannot be written or renamed.
    pub fn persist(&self, config: &ActiveConfig) -> Result<()> {
        let text = serde_json::to_string_pretty(config)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, text)?;
        fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), servers = config.servers.len(), "Persisted active set");
        Ok(())
    }
}

/// Parse either accepted dialect into the internal form
///
/// # Errors
///
/// Returns an error for invalid JSON or an entry with neither `command`
/// nor `url`.
pub fn parse_config(text: &str) -> Result<ActiveConfig> {
    let value: Value = serde_json::from_str(text)?;

    if let Some(map) = value.get("mcpServers").and_then(Value::as_object) {
        let mut servers = Vec::with_capacity(map.len());
        for (name, spec) in map {
            servers.push(ServerEntry {
                name: name.clone(),
                transport: parse_standard_entry(name, spec)?,
            });
        }
        let active_mcp_queue = value
            .get("active_mcp_queue")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        return Ok(ActiveConfig {
            servers,
            active_mcp_queue,
        });
    }

    serde_json::from_value(value).map_err(Error::from)
}

/// Normalize one `mcpServers` map entry
fn parse_standard_entry(name: &str, spec: &Value) -> Result<TransportSpec> {
    if let Some(command) = spec.get("command").and_then(Value::as_str) {
        let args = spec
            .get("args")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        let env = spec
            .get("env")
            .and_then(Value::as_object)
            .map(|o| {
                o.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        return Ok(TransportSpec::Command {
            command: command.to_string(),
            args,
            env,
        });
    }

    if let Some(url) = spec.get("url").and_then(Value::as_str) {
        let headers = spec
            .get("headers")
            .and_then(Value::as_object)
            .map(|o| {
                o.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        let kind = spec.get("type").and_then(Value::as_str);
        let sse = match kind {
            Some("sse") => true,
            Some(_) => false,
            None => url.ends_with("/sse"),
        };
        return Ok(if sse {
            TransportSpec::Sse {
                url: url.to_string(),
                headers,
            }
        } else {
            TransportSpec::StreamableHttp {
                url: url.to_string(),
                headers,
            }
        });
    }

    Err(Error::Config(format!(
        "Server '{name}' has neither 'command' nor 'url'"
    )))
}

/// Semantic equality on the server set: same names with the same launch specs.
///
/// Queue order is deliberately ignored - touches reorder the in-memory queue
/// without persisting, so the queue on disk may lag behind.
#[must_use]
pub fn same_servers(a: &ActiveConfig, b: &ActiveConfig) -> bool {
    if a.servers.len() != b.servers.len() {
        return false;
    }
    let mut left: Vec<&ServerEntry> = a.servers.iter().collect();
    let mut right: Vec<&ServerEntry> = b.servers.iter().collect();
    left.sort_by(|x, y| x.name.cmp(&y.name));
    right.sort_by(|x, y| x.name.cmp(&y.name));
    left == right
}

/// Watches the config path and emits parsed documents on external change
pub struct ConfigWatcher {
    handle: tokio::task::JoinHandle<()>,
}

impl ConfigWatcher {
    /// Start watching. Returns the watcher handle and a channel of parsed
    /// configs; the receiver side decides (via [`same_servers`]) whether a
    /// document is actually new.
    ///
    /// # Errors
    ///
    /// Returns an error if the filesystem watcher cannot be installed.
    pub fn start(
        path: PathBuf,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(Self, mpsc::Receiver<ActiveConfig>)> {
        let (cfg_tx, cfg_rx) = mpsc::channel(8);
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel();

        // Watch the parent directory: atomic writes replace the file inode,
        // which silently detaches a watch on the file itself.
        let watch_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        let file_name: Option<OsString> = path.file_name().map(OsString::from);

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let _ = raw_tx.send(res);
            },
            NotifyConfig::default(),
        )
        .map_err(|e| Error::Internal(format!("Failed to create watcher: {e}")))?;

        watcher
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .map_err(|e| Error::Internal(format!("Failed to watch {}: {e}", watch_dir.display())))?;

        let store = ConfigStore::new(path);
        let handle = tokio::spawn(async move {
            // Moved in so the watch stays registered for the task's lifetime
            let _watcher = watcher;

            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    maybe = raw_rx.recv() => {
                        let event = match maybe {
                            None => break,
                            Some(Err(_)) => continue,
                            Some(Ok(event)) => event,
                        };
                        if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                            continue;
                        }
                        let ours = event
                            .paths
                            .iter()
                            .any(|p| p.file_name() == file_name.as_deref());
                        if !ours {
                            continue;
                        }

                        // Debounce and coalesce the burst a rename produces
                        tokio::time::sleep(DEBOUNCE).await;
                        while raw_rx.try_recv().is_ok() {}

                        match store.load() {
                            Ok(config) => {
                                debug!(path = %store.path().display(), "Config file changed");
                                if cfg_tx.send(config).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!(
                                    path = %store.path().display(),
                                    error = %e,
                                    "Config parse error; retaining last good config"
                                );
                            }
                        }
                    }
                }
            }
        });

        Ok((Self { handle }, cfg_rx))
    }

    /// Stop the watcher task
    pub fn stop(&self) {
        self.handle.abort();
    }
}
