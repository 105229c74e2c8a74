//! Dynamic backend addition (`add_new_mcp`)
//!
//! Validates a catalog candidate, reports what is still missing as a
//! structured outcome the upstream agent can act on, and inserts satisfied
//! candidates through the active set.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::active_set::ActiveSet;
use crate::registry::{ArgumentRequirement, AuthRequirement, Registry};
use crate::Result;

/// Outcome of an add request. Machine-readable first, with a human message
/// where the upstream agent has to gather more input.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum AddOutcome {
    /// The name is not in the catalog
    UnknownServer {
        /// The requested name
        requested: String,
        /// Every name the catalog does know
        known: Vec<String>,
    },
    /// The server is already live; it was touched instead
    AlreadyActive {
        /// The server name
        name: String,
    },
    /// Required launch arguments are missing
    NeedsArguments {
        /// The server name
        name: String,
        /// The missing arguments, in declared order
        requests: Vec<ArgumentRequirement>,
        /// Guidance for the upstream agent
        message: String,
    },
    /// Required credentials are missing
    NeedsAuth {
        /// The server name
        name: String,
        /// The unsatisfied requirements
        requirements: Vec<AuthRequirement>,
        /// Guidance for the upstream agent
        message: String,
    },
    /// The server is now live
    Added {
        /// The server name
        name: String,
        /// Number of tools the live backend reports
        tool_count: usize,
        /// The tool names now available
        tools: Vec<String>,
    },
}

/// Validates candidates and inserts them through the active set
pub struct Adder {
    registry: Arc<Registry>,
    active: Arc<ActiveSet>,
}

impl Adder {
    /// Create an adder over the shared registry and active set
    #[must_use]
    pub fn new(registry: Arc<Registry>, active: Arc<ActiveSet>) -> Self {
        Self { registry, active }
    }

    /// Add a backend by catalog name.
    ///
    /// Requirement failures come back as structured outcomes, not errors;
    /// the active set is left untouched in every non-`Added` case except
    /// `AlreadyActive`, which touches the entry.
    ///
    /// # Errors
    ///
    /// Returns an error when the catalog cannot be loaded or the handshake
    /// of a fully satisfied candidate fails.
    pub async fn add(
        &self,
        name: &str,
        user_args: &HashMap<String, String>,
    ) -> Result<AddOutcome> {
        let Some(entry) = self.registry.get(name).await? else {
            return Ok(AddOutcome::UnknownServer {
                requested: name.to_string(),
                known: self.registry.known_names().await?,
            });
        };

        if self.active.is_active(name).await {
            self.active.touch(name).await;
            return Ok(AddOutcome::AlreadyActive {
                name: name.to_string(),
            });
        }

        let missing_args = entry.missing_arguments(user_args);
        if !missing_args.is_empty() {
            let described: Vec<String> = missing_args
                .iter()
                .map(|req| match &req.example {
                    Some(example) => format!("{} ({}, e.g. {example})", req.name, req.description),
                    None => format!("{} ({})", req.name, req.description),
                })
                .collect();
            let message = format!(
                "Server '{name}' needs {} argument(s) before it can start: {}. \
                 Call add_new_mcp again with an 'arguments' object supplying these values.",
                missing_args.len(),
                described.join("; ")
            );
            return Ok(AddOutcome::NeedsArguments {
                name: name.to_string(),
                requests: missing_args.into_iter().cloned().collect(),
                message,
            });
        }

        let missing_auth = entry.unsatisfied_auth();
        if !missing_auth.is_empty() {
            let described: Vec<String> = missing_auth
                .iter()
                .map(|req| format!("{} ({})", req.name, req.description))
                .collect();
            let message = format!(
                "Server '{name}' requires credentials before it can start: {}. \
                 Store them with 'store-auth {name} KEY=VALUE' or export the \
                 variables, then retry.",
                described.join("; ")
            );
            return Ok(AddOutcome::NeedsAuth {
                name: name.to_string(),
                requirements: missing_auth.into_iter().cloned().collect(),
                message,
            });
        }

        let launch = entry.build_launch(user_args)?;
        let client = self.active.admit_with_launch(name, launch).await?;

        let tools: Vec<String> = client
            .list_tools()
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|t| t.name)
            .collect();
        info!(backend = %name, tools = tools.len(), "Backend added");

        Ok(AddOutcome::Added {
            name: name.to_string(),
            tool_count: tools.len(),
            tools,
        })
    }
}
