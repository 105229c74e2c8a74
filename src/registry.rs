//! Catalog of known backends and the `search_mcps` query path
//!
//! Two read-only documents feed the catalog: `mcp-registry.json` (launch
//! specs, auth and argument requirements) and `enhanced-index.json` (display
//! metadata, tool summaries, embeddings) produced by the offline indexer.
//! Both are merged by name, cached with a TTL, and invalidated explicitly on
//! admin mutations.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::expand_env_vars;
use crate::config_store::TransportSpec;
use crate::embeddings::{EmbeddingsClient, cosine_similarity};
use crate::{Error, Result};

/// An environment variable a backend needs before launch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRequirement {
    /// Environment variable name
    pub name: String,
    /// Human-readable description of the credential
    #[serde(default)]
    pub description: String,
}

/// A positional launch argument the operator must supply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArgumentRequirement {
    /// Argument name
    pub name: String,
    /// Human-readable description
    #[serde(default)]
    pub description: String,
    /// Whether the argument must be provided
    #[serde(default = "default_true")]
    pub required: bool,
    /// Example value
    #[serde(skip_serializing_if = "Option::is_none")]
    pub example: Option<String>,
    /// Index into the launch argv where the value is spliced
    pub position: usize,
}

fn default_true() -> bool {
    true
}

/// Cached name + description of one backend tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolMeta {
    /// Tool name
    pub name: String,
    /// Tool description
    #[serde(default)]
    pub description: String,
}

/// One known backend, merged from the registry and the enhanced index
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    /// Stable unique identifier
    pub name: String,
    /// Display name for humans
    pub display_name: String,
    /// Description
    pub description: String,
    /// Launch specification with the raw env template attached
    pub launch: TransportSpec,
    /// Credentials required before launch
    pub auth_requirements: Vec<AuthRequirement>,
    /// Positional arguments required before launch
    pub argument_requirements: Vec<ArgumentRequirement>,
    /// Pre-baked launch args
    pub static_args: Vec<String>,
    /// Cached tool metadata from prior indexing (informational only)
    pub tools_meta: Vec<ToolMeta>,
    /// Short use-case strings for keyword scoring
    pub use_cases: Vec<String>,
    /// Indexer-written summary
    pub ai_summary: String,
    /// Embedding vector; empty means "no vector"
    pub embedding: Vec<f32>,
}

impl CatalogEntry {
    /// Auth requirements whose variable resolves to nothing non-empty.
    ///
    /// A requirement is satisfied by a non-empty value in the catalog env
    /// template or, failing that, the process environment.
    #[must_use]
    pub fn unsatisfied_auth(&self) -> Vec<&AuthRequirement> {
        let env = self.env_template();
        self.auth_requirements
            .iter()
            .filter(|req| {
                let from_catalog = env.get(&req.name).is_some_and(|v| !v.is_empty());
                let from_process =
                    std::env::var(&req.name).map(|v| !v.is_empty()).unwrap_or(false);
                !from_catalog && !from_process
            })
            .collect()
    }

    /// Required arguments absent from the supplied values
    #[must_use]
    pub fn missing_arguments(&self, user_args: &HashMap<String, String>) -> Vec<&ArgumentRequirement> {
        self.argument_requirements
            .iter()
            .filter(|req| req.required && !user_args.contains_key(&req.name))
            .collect()
    }

    /// Build the resolved launch spec: user args spliced into the static args
    /// at their declared positions, env and header values expanded.
    ///
    /// # Errors
    ///
    /// Returns an error when a required argument is missing.
    pub fn build_launch(&self, user_args: &HashMap<String, String>) -> Result<TransportSpec> {
        let missing = self.missing_arguments(user_args);
        if !missing.is_empty() {
            let names: Vec<&str> = missing.iter().map(|r| r.name.as_str()).collect();
            return Err(Error::Config(format!(
                "Server '{}' is missing required arguments: {}",
                self.name,
                names.join(", ")
            )));
        }

        match &self.launch {
            TransportSpec::Command { command, env, .. } => {
                let mut args = self.static_args.clone();

                let mut placements: Vec<(&ArgumentRequirement, &String)> = self
                    .argument_requirements
                    .iter()
                    .filter_map(|req| user_args.get(&req.name).map(|v| (req, v)))
                    .collect();
                placements.sort_by_key(|(req, _)| req.position);
                for (req, value) in placements {
                    let at = req.position.min(args.len());
                    args.insert(at, value.clone());
                }

                let env = env
                    .iter()
                    .map(|(k, v)| {
                        let resolved = if v.is_empty() {
                            std::env::var(k).unwrap_or_default()
                        } else {
                            expand_env_vars(v)
                        };
                        (k.clone(), resolved)
                    })
                    .collect();

                Ok(TransportSpec::Command {
                    command: command.clone(),
                    args,
                    env,
                })
            }
            TransportSpec::Sse { url, headers } => Ok(TransportSpec::Sse {
                url: url.clone(),
                headers: expand_headers(headers),
            }),
            TransportSpec::StreamableHttp { url, headers } => Ok(TransportSpec::StreamableHttp {
                url: url.clone(),
                headers: expand_headers(headers),
            }),
        }
    }

    fn env_template(&self) -> &HashMap<String, String> {
        static EMPTY: std::sync::OnceLock<HashMap<String, String>> = std::sync::OnceLock::new();
        match &self.launch {
            TransportSpec::Command { env, .. } => env,
            _ => EMPTY.get_or_init(HashMap::new),
        }
    }
}

fn expand_headers(headers: &HashMap<String, String>) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(k, v)| (k.clone(), expand_env_vars(v)))
        .collect()
}

/// One `search_mcps` result
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    /// Backend name
    pub name: String,
    /// Display name
    pub display_name: String,
    /// Match score in [0, 1]
    pub similarity: f64,
    /// 1 - similarity
    pub distance: f64,
    /// One-line summary for the calling agent
    pub summary: String,
}

// ============================================================================
// Raw file shapes
// ============================================================================

/// One entry of `mcp-registry.json`
#[derive(Debug, Clone, Deserialize)]
struct RawRegistryEntry {
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    remote: Option<String>,
    #[serde(rename = "remoteTransport")]
    remote_transport: Option<String>,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    description: String,
    #[serde(rename = "displayName")]
    display_name: Option<String>,
    #[serde(rename = "authRequirements", default)]
    auth_requirements: Vec<AuthRequirement>,
    #[serde(rename = "argumentRequirements", default)]
    argument_requirements: Vec<ArgumentRequirement>,
}

/// `enhanced-index.json`
#[derive(Debug, Default, Deserialize)]
struct EnhancedIndex {
    #[serde(default)]
    servers: Vec<IndexedServer>,
}

/// One entry of the enhanced index
#[derive(Debug, Clone, Deserialize)]
struct IndexedServer {
    name: String,
    #[serde(rename = "displayName")]
    display_name: Option<String>,
    #[serde(rename = "originalDescription")]
    original_description: Option<String>,
    #[serde(rename = "aiSummary")]
    ai_summary: Option<String>,
    #[serde(rename = "aiUseCases", default)]
    ai_use_cases: Vec<String>,
    #[serde(rename = "toolDescriptions", default)]
    tool_descriptions: Vec<ToolMeta>,
    #[serde(default)]
    embedding: Vec<f32>,
}

// ============================================================================
// Registry
// ============================================================================

struct CacheSlot {
    catalog: Arc<Vec<CatalogEntry>>,
    loaded_at: Instant,
}

/// Read-through catalog with a TTL cache and semantic search
pub struct Registry {
    catalog_path: PathBuf,
    index_path: PathBuf,
    ttl: Duration,
    embedder: Option<EmbeddingsClient>,
    // Held across the load so concurrent misses produce a single read
    cache: Mutex<Option<CacheSlot>>,
}

impl Registry {
    /// Create a registry over the two catalog documents
    #[must_use]
    pub fn new(
        catalog_path: impl Into<PathBuf>,
        index_path: impl Into<PathBuf>,
        ttl: Duration,
        embedder: Option<EmbeddingsClient>,
    ) -> Self {
        Self {
            catalog_path: catalog_path.into(),
            index_path: index_path.into(),
            ttl,
            embedder,
            cache: Mutex::new(None),
        }
    }

    /// The merged catalog, from cache when fresh
    ///
    /// # Errors
    ///
    /// Returns an error when the registry file cannot be read or parsed.
    pub async fn catalog(&self) -> Result<Arc<Vec<CatalogEntry>>> {
        let mut cache = self.cache.lock().await;

        if let Some(slot) = cache.as_ref() {
            if slot.loaded_at.elapsed() < self.ttl {
                return Ok(Arc::clone(&slot.catalog));
            }
        }

        let catalog = Arc::new(self.load_catalog()?);
        *cache = Some(CacheSlot {
            catalog: Arc::clone(&catalog),
            loaded_at: Instant::now(),
        });
        Ok(catalog)
    }

    /// Drop the cache so the next read hits the files
    pub async fn invalidate(&self) {
        *self.cache.lock().await = None;
    }

    /// Look up one entry by name
    ///
    /// # Errors
    ///
    /// Returns an error when the catalog cannot be loaded.
    pub async fn get(&self, name: &str) -> Result<Option<CatalogEntry>> {
        Ok(self
            .catalog()
            .await?
            .iter()
            .find(|e| e.name == name)
            .cloned())
    }

    /// All known backend names, sorted
    ///
    /// # Errors
    ///
    /// Returns an error when the catalog cannot be loaded.
    pub async fn known_names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.catalog().await?.iter().map(|e| e.name.clone()).collect();
        names.sort();
        Ok(names)
    }

    /// Which backend claims a tool name, per the indexed tool metadata
    ///
    /// # Errors
    ///
    /// Returns an error when the catalog cannot be loaded.
    pub async fn find_server_for_tool(&self, tool: &str) -> Result<Option<String>> {
        Ok(self
            .catalog()
            .await?
            .iter()
            .find(|e| e.tools_meta.iter().any(|t| t.name == tool))
            .map(|e| e.name.clone()))
    }

    /// Search the catalog. Cosine similarity over embeddings when available,
    /// weighted keyword scoring otherwise. `limit` is clamped to 1..=10.
    ///
    /// # Errors
    ///
    /// Returns an error when the catalog cannot be loaded.
    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let limit = limit.clamp(1, 10);
        let catalog = self.catalog().await?;

        if let Some(embedder) = &self.embedder {
            if catalog.iter().any(|e| !e.embedding.is_empty()) {
                match embedder.embed(query).await {
                    Ok(query_vec) => {
                        return Ok(rank(&catalog, limit, |entry| {
                            if entry.embedding.is_empty() {
                                None
                            } else {
                                let sim = cosine_similarity(&query_vec, &entry.embedding);
                                Some(f64::from(sim).clamp(0.0, 1.0))
                            }
                        }));
                    }
                    Err(e) => {
                        warn!(error = %e, "Query embedding failed; using keyword fallback");
                    }
                }
            }
        }

        Ok(rank(&catalog, limit, |entry| {
            Some(keyword_score(entry, query))
        }))
    }

    /// Persist auth values into the registry file's env template
    ///
    /// # Errors
    ///
    /// Returns an error when the server is unknown or the file cannot be
    /// rewritten.
    pub async fn store_auth(&self, name: &str, pairs: &[(String, String)]) -> Result<()> {
        let text = fs::read_to_string(&self.catalog_path)?;
        let mut doc: Value = serde_json::from_str(&text)?;

        let entry = doc
            .get_mut(name)
            .ok_or_else(|| Error::ServerNotFound(name.to_string()))?;
        let env = entry
            .as_object_mut()
            .ok_or_else(|| Error::Config(format!("Malformed registry entry for '{name}'")))?
            .entry("env")
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        let env = env
            .as_object_mut()
            .ok_or_else(|| Error::Config(format!("Malformed env for '{name}'")))?;

        for (key, value) in pairs {
            env.insert(key.clone(), Value::String(value.clone()));
        }

        let mut tmp = self.catalog_path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, serde_json::to_string_pretty(&doc)?)?;
        fs::rename(&tmp, &self.catalog_path)?;

        self.invalidate().await;
        debug!(server = %name, keys = pairs.len(), "Stored auth values");
        Ok(())
    }

    /// Load and merge both documents
    fn load_catalog(&self) -> Result<Vec<CatalogEntry>> {
        let text = fs::read_to_string(&self.catalog_path)?;
        let raw: HashMap<String, RawRegistryEntry> = serde_json::from_str(&text)?;

        let index: EnhancedIndex = match fs::read_to_string(&self.index_path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                warn!(path = %self.index_path.display(), error = %e, "Malformed enhanced index; ignoring");
                EnhancedIndex::default()
            }),
            Err(_) => EnhancedIndex::default(),
        };
        let indexed: HashMap<&str, &IndexedServer> =
            index.servers.iter().map(|s| (s.name.as_str(), s)).collect();

        let mut entries = Vec::with_capacity(raw.len());
        for (name, entry) in raw {
            let launch = match resolve_launch(&entry) {
                Some(launch) => launch,
                None => {
                    warn!(server = %name, "Catalog entry has neither command nor remote; skipping");
                    continue;
                }
            };

            let meta = indexed.get(name.as_str());
            entries.push(CatalogEntry {
                display_name: meta
                    .and_then(|m| m.display_name.clone())
                    .or_else(|| entry.display_name.clone())
                    .unwrap_or_else(|| name.clone()),
                description: if entry.description.is_empty() {
                    meta.and_then(|m| m.original_description.clone())
                        .unwrap_or_default()
                } else {
                    entry.description.clone()
                },
                ai_summary: meta.and_then(|m| m.ai_summary.clone()).unwrap_or_default(),
                use_cases: meta.map(|m| m.ai_use_cases.clone()).unwrap_or_default(),
                tools_meta: meta.map(|m| m.tool_descriptions.clone()).unwrap_or_default(),
                embedding: meta.map(|m| m.embedding.clone()).unwrap_or_default(),
                static_args: entry.args.clone(),
                auth_requirements: entry.auth_requirements.clone(),
                argument_requirements: entry.argument_requirements.clone(),
                launch,
                name,
            });
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        debug!(count = entries.len(), "Catalog loaded");
        Ok(entries)
    }
}

/// Derive a launch spec from a raw registry entry
fn resolve_launch(entry: &RawRegistryEntry) -> Option<TransportSpec> {
    if let Some(url) = &entry.remote {
        let sse = match entry.remote_transport.as_deref() {
            Some("sse") => true,
            Some(_) => false,
            None => url.ends_with("/sse"),
        };
        return Some(if sse {
            TransportSpec::Sse {
                url: url.clone(),
                headers: entry.headers.clone(),
            }
        } else {
            TransportSpec::StreamableHttp {
                url: url.clone(),
                headers: entry.headers.clone(),
            }
        });
    }

    entry.command.as_ref().map(|command| TransportSpec::Command {
        command: command.clone(),
        args: entry.args.clone(),
        env: entry.env.clone(),
    })
}

/// Score every entry, keep the top `limit`, ties broken by name
fn rank<F>(catalog: &[CatalogEntry], limit: usize, score: F) -> Vec<SearchHit>
where
    F: Fn(&CatalogEntry) -> Option<f64>,
{
    let mut scored: Vec<(&CatalogEntry, f64)> = catalog
        .iter()
        .filter_map(|entry| score(entry).map(|s| (entry, s)))
        .collect();

    scored.sort_by(|(a, sa), (b, sb)| {
        sb.partial_cmp(sa)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.name.cmp(&b.name))
    });

    scored
        .into_iter()
        .take(limit)
        .map(|(entry, similarity)| SearchHit {
            name: entry.name.clone(),
            display_name: entry.display_name.clone(),
            similarity,
            distance: 1.0 - similarity,
            summary: format_summary(entry, similarity),
        })
        .collect()
}

/// Weighted keyword score, normalized to [0, 1]
fn keyword_score(entry: &CatalogEntry, query: &str) -> f64 {
    let q = query.to_lowercase();
    let summary = entry.ai_summary.to_lowercase();
    let mut score: f64 = 0.0;

    if entry.name.to_lowercase() == q {
        score += 100.0;
    }
    if entry.display_name.to_lowercase().contains(&q) {
        score += 50.0;
    }
    if !summary.is_empty() && summary.contains(&q) {
        score += 40.0;
    }
    for use_case in &entry.use_cases {
        if use_case.to_lowercase().contains(&q) {
            score += 30.0;
        }
    }
    for tool in &entry.tools_meta {
        if tool.name.to_lowercase().contains(&q) {
            score += 20.0;
        }
    }
    for tool in &entry.tools_meta {
        if tool.description.to_lowercase().contains(&q) {
            score += 15.0;
        }
    }
    for word in q.split_whitespace().filter(|w| w.len() > 2) {
        if summary.contains(word) {
            score += 10.0;
        }
    }

    (score / 100.0).clamp(0.0, 1.0)
}

/// One-line result summary for the calling agent
fn format_summary(entry: &CatalogEntry, similarity: f64) -> String {
    let pct = (similarity * 100.0).round() as i64;
    let tool_names: Vec<&str> = entry
        .tools_meta
        .iter()
        .take(6)
        .map(|t| t.name.as_str())
        .collect();
    let more = entry.tools_meta.len().saturating_sub(6);

    let mut summary = format!("{} ({pct}% match): {}", entry.display_name, entry.description);
    if !tool_names.is_empty() {
        summary.push_str(&format!(" Tools: {}", tool_names.join(", ")));
        if more > 0 {
            summary.push_str(&format!(" +{more} more"));
        }
    }
    summary
}
