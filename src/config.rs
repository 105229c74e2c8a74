//! Process configuration (listen address, cache ceiling, file paths)
//!
//! Distinct from [`crate::config_store`]: this module covers settings that are
//! fixed for the life of the process, while the config store persists the
//! mutable active server set.

use std::{env, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Json},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Upstream server settings
    pub server: ServerSettings,
    /// Live-set cache settings
    pub cache: CacheSettings,
    /// File locations
    pub paths: PathSettings,
    /// Semantic search settings
    pub search: SearchSettings,
}

impl Settings {
    /// Load settings from an optional JSON file, `MCP_PROXY_*` environment
    /// variables, and the spec'd standalone variables (`PORT`,
    /// `MCP_CONFIG_PATH`, `KEEP_SERVER_OPEN`, `OPENAI_API_KEY`).
    ///
    /// # Errors
    ///
    /// Returns an error when the settings file is missing or malformed.
    pub fn load(path: Option<&PathBuf>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Settings file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Json::file(p));
        }

        figment = figment.merge(Env::prefixed("MCP_PROXY_").split("__"));

        let mut settings: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        settings.apply_env_overrides();

        Ok(settings)
    }

    /// Apply the standalone environment variables the deployment contract names
    fn apply_env_overrides(&mut self) {
        if let Ok(port) = env::var("PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }
        if let Ok(path) = env::var("MCP_CONFIG_PATH") {
            if !path.is_empty() {
                self.paths.config_path = PathBuf::from(path);
            }
        }
        if let Ok(keep) = env::var("KEEP_SERVER_OPEN") {
            self.server.keep_server_open = keep == "1";
        }
        if let Ok(key) = env::var("OPENAI_API_KEY") {
            if !key.is_empty() {
                self.search.api_key = Some(key);
            }
        }
    }

    /// The advertised URL of the protected MCP resource
    #[must_use]
    pub fn resource_url(&self) -> String {
        self.server.public_url.clone().unwrap_or_else(|| {
            format!("http://{}:{}/mcp", self.server.host, self.server.port)
        })
    }

    /// The URL of the resource metadata document used in auth challenges
    #[must_use]
    pub fn resource_metadata_url(&self) -> String {
        let base = self.resource_url();
        let base = base.trim_end_matches("/mcp");
        format!("{base}/.well-known/oauth-protected-resource")
    }
}

/// Upstream server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Expected bearer token; when unset, any non-empty bearer passes
    pub bearer_token: Option<String>,
    /// Whether the bearer gate is enabled
    pub auth_enabled: bool,
    /// Keep the session alive after the last client disconnects
    pub keep_server_open: bool,
    /// Keep-alive comment interval on the event stream
    #[serde(with = "humantime_serde")]
    pub keep_alive_interval: Duration,
    /// Externally visible base URL (for auth challenges behind a proxy)
    pub public_url: Option<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9999,
            bearer_token: None,
            auth_enabled: true,
            keep_server_open: false,
            keep_alive_interval: Duration::from_secs(240),
            public_url: None,
        }
    }
}

/// Live-set cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Maximum number of live backends (the LRU ceiling)
    pub max_live: usize,
    /// Per-call timeout toward a backend
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_live: 3,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// File locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    /// Active set document
    pub config_path: PathBuf,
    /// Catalog of known backends
    pub catalog_path: PathBuf,
    /// Enhanced index with embeddings
    pub index_path: PathBuf,
    /// Registry cache TTL
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("config.json"),
            catalog_path: PathBuf::from("mcp-registry.json"),
            index_path: PathBuf::from("enhanced-index.json"),
            cache_ttl: Duration::from_secs(60),
        }
    }
}

/// Semantic search settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    /// Embeddings API key; absence forces the keyword fallback
    pub api_key: Option<String>,
    /// Embeddings endpoint
    pub embeddings_url: String,
    /// Embeddings model
    pub model: String,
    /// Default result count for `search_mcps`
    pub default_limit: usize,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            embeddings_url: "https://api.openai.com/v1/embeddings".to_string(),
            model: "text-embedding-ada-002".to_string(),
            default_limit: 4,
        }
    }
}

/// Expand `${VAR}` patterns from the process environment
#[must_use]
pub fn expand_env_vars(value: &str) -> String {
    let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();
    re.replace_all(value, |caps: &regex::Captures| {
        env::var(&caps[1]).unwrap_or_default()
    })
    .into_owned()
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s")
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms")
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;

        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(serde::de::Error::custom)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(serde::de::Error::custom)
        } else {
            // Assume seconds
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        }
    }
}
