//! The bounded live set of backends
//!
//! At most `max_live` backends are materialized at any moment. Every
//! admission or touch moves an entry to the hot end of the queue; eviction
//! happens at the cold end. Touches reorder the in-memory queue only;
//! admissions and evictions persist the queue through the config store and
//! emit a tool-list-changed event.
//!
//! Locking discipline: one mutex guards the queue, and it is never held
//! across transport I/O. Admission reserves a `Starting` placeholder,
//! releases the lock for the handshake, and reacquires it to commit or roll
//! back.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};

use crate::client::{BackendClient, Connector};
use crate::config_store::{ActiveConfig, ConfigStore, ServerEntry, TransportSpec, same_servers};
use crate::registry::Registry;
use crate::{Error, Result};

/// Hard deadline for closing one backend client
const CLOSE_DEADLINE: Duration = Duration::from_secs(2);

/// Change events fanned out to the upstream session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeEvent {
    /// The aggregated tool list changed; clients should re-list
    ToolListChanged,
}

/// Owned event coordinator between the active set and the upstream session
#[derive(Clone)]
pub struct ChangeNotifier {
    tx: broadcast::Sender<ChangeEvent>,
}

impl ChangeNotifier {
    /// Create a notifier with a small bounded buffer; slow subscribers lag
    /// and re-list, they are never waited on
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(32);
        Self { tx }
    }

    /// Subscribe to change events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }

    /// Announce a committed tool-list mutation
    pub fn tool_list_changed(&self) {
        let _ = self.tx.send(ChangeEvent::ToolListChanged);
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifecycle state of one active entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Placeholder reserved while the handshake runs
    Starting,
    /// Handshake complete; serving requests
    Ready,
    /// Handshake failed; about to be removed
    Failed,
    /// Being torn down
    Closing,
}

/// One live backend
struct ActiveEntry {
    name: String,
    launch: TransportSpec,
    state: ClientState,
    client: Option<Arc<BackendClient>>,
    last_used: u64,
}

/// In-memory LRU queue; index 0 is the cold end
#[derive(Default)]
struct Queue {
    entries: Vec<ActiveEntry>,
    tick: u64,
}

impl Queue {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.name == name)
    }

    /// Move a ready entry to the hot end and return its client
    fn touch_ready(&mut self, name: &str) -> Option<Arc<BackendClient>> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.name == name && e.state == ClientState::Ready)?;
        let mut entry = self.entries.remove(pos);
        entry.last_used = self.next_tick();
        let client = entry.client.clone();
        self.entries.push(entry);
        client
    }

    /// Reserve a placeholder at the hot end
    fn push_starting(&mut self, name: &str, launch: TransportSpec) {
        let tick = self.next_tick();
        self.entries.push(ActiveEntry {
            name: name.to_string(),
            launch,
            state: ClientState::Starting,
            client: None,
            last_used: tick,
        });
    }

    /// Flip a placeholder to ready
    fn mark_ready(&mut self, name: &str, client: Arc<BackendClient>) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.name == name) {
            entry.state = ClientState::Ready;
            entry.client = Some(client);
        }
    }

    /// Push a pre-connected entry at the hot end (reload path)
    fn push_ready(&mut self, name: &str, launch: TransportSpec, client: Arc<BackendClient>) {
        let tick = self.next_tick();
        self.entries.push(ActiveEntry {
            name: name.to_string(),
            launch,
            state: ClientState::Ready,
            client: Some(client),
            last_used: tick,
        });
    }

    fn remove(&mut self, name: &str) -> Option<ActiveEntry> {
        let pos = self.entries.iter().position(|e| e.name == name)?;
        let mut entry = self.entries.remove(pos);
        entry.state = ClientState::Closing;
        Some(entry)
    }

    /// Remove the coldest entry, never the one just admitted
    fn pop_coldest_except(&mut self, keep: &str) -> Option<ActiveEntry> {
        let pos = self.entries.iter().position(|e| e.name != keep)?;
        let mut entry = self.entries.remove(pos);
        entry.state = ClientState::Closing;
        Some(entry)
    }

    fn drain(&mut self) -> Vec<ActiveEntry> {
        for entry in &mut self.entries {
            entry.state = ClientState::Closing;
        }
        std::mem::take(&mut self.entries)
    }

    /// Committed entries as the persisted document (cold to hot)
    fn snapshot(&self) -> ActiveConfig {
        let ready: Vec<&ActiveEntry> = self
            .entries
            .iter()
            .filter(|e| e.state == ClientState::Ready)
            .collect();
        ActiveConfig {
            servers: ready
                .iter()
                .map(|e| ServerEntry {
                    name: e.name.clone(),
                    transport: e.launch.clone(),
                })
                .collect(),
            active_mcp_queue: ready.iter().map(|e| e.name.clone()).collect(),
        }
    }

    fn ready_clients(&self) -> Vec<(String, Arc<BackendClient>)> {
        self.entries
            .iter()
            .filter(|e| e.state == ClientState::Ready)
            .filter_map(|e| e.client.clone().map(|c| (e.name.clone(), c)))
            .collect()
    }
}

/// The LRU manager for live backends
pub struct ActiveSet {
    queue: Mutex<Queue>,
    max_live: usize,
    request_timeout: Duration,
    connector: Arc<dyn Connector>,
    registry: Arc<Registry>,
    store: ConfigStore,
    notifier: ChangeNotifier,
}

impl ActiveSet {
    /// Create an empty active set
    #[must_use]
    pub fn new(
        max_live: usize,
        request_timeout: Duration,
        connector: Arc<dyn Connector>,
        registry: Arc<Registry>,
        store: ConfigStore,
        notifier: ChangeNotifier,
    ) -> Self {
        Self {
            queue: Mutex::new(Queue::default()),
            max_live: max_live.max(1),
            request_timeout,
            connector,
            registry,
            store,
            notifier,
        }
    }

    /// The event coordinator shared with the upstream session
    #[must_use]
    pub fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    /// Mark an entry most recently used. In-memory only: persisting here
    /// would trip the config watcher on our own write.
    pub async fn touch(&self, name: &str) -> bool {
        self.queue.lock().await.touch_ready(name).is_some()
    }

    /// Touch-on-use lookup of a ready client
    pub async fn client_for(&self, name: &str) -> Option<Arc<BackendClient>> {
        self.queue.lock().await.touch_ready(name)
    }

    /// Whether a backend is in the queue (starting or ready)
    pub async fn is_active(&self, name: &str) -> bool {
        self.queue.lock().await.contains(name)
    }

    /// Names in queue order, cold to hot
    pub async fn names(&self) -> Vec<String> {
        self.queue
            .lock()
            .await
            .entries
            .iter()
            .map(|e| e.name.clone())
            .collect()
    }

    /// All ready clients in queue order (fan-out path; does not touch)
    pub async fn ready_clients(&self) -> Vec<(String, Arc<BackendClient>)> {
        self.queue.lock().await.ready_clients()
    }

    /// Whether any live backend currently reports a connected transport
    pub async fn any_connected(&self) -> bool {
        self.queue
            .lock()
            .await
            .ready_clients()
            .iter()
            .any(|(_, c)| c.is_connected())
    }

    /// Admit a catalog backend: resolve its entry, verify requirements,
    /// launch, and handshake
    ///
    /// # Errors
    ///
    /// Fails when the backend is unknown, its auth or argument requirements
    /// are unsatisfied, or the handshake fails.
    pub async fn admit(&self, name: &str) -> Result<Arc<BackendClient>> {
        let entry = self
            .registry
            .get(name)
            .await?
            .ok_or_else(|| Error::ServerNotFound(name.to_string()))?;

        let missing_auth = entry.unsatisfied_auth();
        if !missing_auth.is_empty() {
            let vars: Vec<&str> = missing_auth.iter().map(|r| r.name.as_str()).collect();
            return Err(Error::Config(format!(
                "Server '{name}' requires credentials: {}",
                vars.join(", ")
            )));
        }

        let launch = entry.build_launch(&std::collections::HashMap::new())?;
        self.admit_with_launch(name, launch).await
    }

    /// Admit with a pre-built launch spec (the adder supplies user arguments)
    ///
    /// # Errors
    ///
    /// Fails when the backend is mid-admission elsewhere or the handshake
    /// fails.
    pub async fn admit_with_launch(
        &self,
        name: &str,
        launch: TransportSpec,
    ) -> Result<Arc<BackendClient>> {
        // Reserve a placeholder, or return the live client
        {
            let mut queue = self.queue.lock().await;
            if let Some(client) = queue.touch_ready(name) {
                return Ok(client);
            }
            if queue.contains(name) {
                return Err(Error::ServerUnavailable(format!("{name} is starting")));
            }
            queue.push_starting(name, launch.clone());
        }

        // Handshake runs without the lock
        let connected = self
            .connector
            .connect(name, &launch, self.request_timeout)
            .await;

        let (client, evicted, snapshot) = {
            let mut queue = self.queue.lock().await;
            match connected {
                Ok(client) => {
                    queue.mark_ready(name, Arc::clone(&client));
                    let mut evicted = Vec::new();
                    while queue.entries.len() > self.max_live {
                        match queue.pop_coldest_except(name) {
                            Some(old) => evicted.push(old),
                            None => break,
                        }
                    }
                    (client, evicted, queue.snapshot())
                }
                Err(e) => {
                    // starting -> failed -> removed
                    queue.remove(name);
                    warn!(backend = %name, error = %e, "Admission rolled back");
                    return Err(e);
                }
            }
        };

        for old in evicted {
            info!(backend = %old.name, "Evicting coldest backend");
            close_entry(old).await;
        }

        self.persist(&snapshot);
        self.notifier.tool_list_changed();
        info!(backend = %name, "Backend admitted");

        Ok(client)
    }

    /// Forced removal with the same teardown sequence as eviction
    ///
    /// # Errors
    ///
    /// Fails when the backend is not active.
    pub async fn evict(&self, name: &str) -> Result<()> {
        let (entry, snapshot) = {
            let mut queue = self.queue.lock().await;
            let entry = queue
                .remove(name)
                .ok_or_else(|| Error::ServerNotFound(name.to_string()))?;
            (entry, queue.snapshot())
        };

        close_entry(entry).await;
        self.persist(&snapshot);
        self.notifier.tool_list_changed();
        info!(backend = %name, "Backend evicted");

        Ok(())
    }

    /// Apply an externally changed config document.
    ///
    /// A document whose server set (names + launch specs) matches the
    /// current state is swallowed - that is how the proxy's own persisted
    /// writes are told apart from operator edits.
    pub async fn reload_from_disk(&self, config: &ActiveConfig) {
        let current = self.queue.lock().await.snapshot();
        if same_servers(&current, config) {
            debug!("Config change matches current state; ignoring");
            return;
        }

        info!(
            servers = config.servers.len(),
            "Config changed externally; rebuilding active set"
        );

        let old = { self.queue.lock().await.drain() };
        join_all(old.into_iter().map(close_entry)).await;

        // Reconnect the hottest entries of the persisted queue
        let skip = config.active_mcp_queue.len().saturating_sub(self.max_live);
        for name in config.active_mcp_queue.iter().skip(skip) {
            let Some(server) = config.servers.iter().find(|s| &s.name == name) else {
                warn!(backend = %name, "Queued backend missing from servers array; skipping");
                continue;
            };
            match self
                .connector
                .connect(name, &server.transport, self.request_timeout)
                .await
            {
                Ok(client) => {
                    let mut queue = self.queue.lock().await;
                    queue.push_ready(name, server.transport.clone(), client);
                }
                Err(e) => {
                    warn!(backend = %name, error = %e, "Failed to reopen backend on reload");
                }
            }
        }

        self.notifier.tool_list_changed();
    }

    /// Close every live backend in parallel (process shutdown)
    pub async fn shutdown(&self) {
        let old = { self.queue.lock().await.drain() };
        if old.is_empty() {
            return;
        }
        info!(count = old.len(), "Closing backends");
        join_all(old.into_iter().map(close_entry)).await;
    }

    /// Write the queue to disk; persistence failures are logged, not fatal
    fn persist(&self, snapshot: &ActiveConfig) {
        if let Err(e) = self.store.persist(snapshot) {
            warn!(error = %e, "Failed to persist active set");
        }
    }
}

/// Close one entry's client under the hard deadline
async fn close_entry(entry: ActiveEntry) {
    let Some(client) = entry.client else {
        return;
    };
    match tokio::time::timeout(CLOSE_DEADLINE, client.close()).await {
        Ok(Ok(())) => debug!(backend = %entry.name, "Backend closed"),
        Ok(Err(e)) => warn!(backend = %entry.name, error = %e, "Backend close failed"),
        Err(_) => warn!(backend = %entry.name, "Backend close timed out"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn spec(tag: &str) -> TransportSpec {
        TransportSpec::Command {
            command: tag.to_string(),
            args: vec![],
            env: HashMap::new(),
        }
    }

    fn dummy_client(name: &str) -> Arc<BackendClient> {
        Arc::new(BackendClient::new(
            name,
            spec(name),
            Duration::from_secs(1),
        ))
    }

    fn names(queue: &Queue) -> Vec<&str> {
        queue.entries.iter().map(|e| e.name.as_str()).collect()
    }

    // =====================================================================
    // Queue ordering
    // =====================================================================

    #[test]
    fn touch_moves_entry_to_hot_end() {
        let mut q = Queue::default();
        q.push_ready("a", spec("a"), dummy_client("a"));
        q.push_ready("b", spec("b"), dummy_client("b"));
        q.push_ready("c", spec("c"), dummy_client("c"));

        assert!(q.touch_ready("a").is_some());
        assert_eq!(names(&q), vec!["b", "c", "a"]);
    }

    #[test]
    fn touch_is_idempotent() {
        let mut q = Queue::default();
        q.push_ready("a", spec("a"), dummy_client("a"));
        q.push_ready("b", spec("b"), dummy_client("b"));

        q.touch_ready("b");
        let once: Vec<String> = q.entries.iter().map(|e| e.name.clone()).collect();
        q.touch_ready("b");
        let twice: Vec<String> = q.entries.iter().map(|e| e.name.clone()).collect();
        assert_eq!(once, twice);
    }

    #[test]
    fn touch_unknown_returns_none() {
        let mut q = Queue::default();
        assert!(q.touch_ready("ghost").is_none());
    }

    #[test]
    fn touch_ignores_starting_entries() {
        let mut q = Queue::default();
        q.push_starting("a", spec("a"));
        assert!(q.touch_ready("a").is_none());
    }

    #[test]
    fn last_used_ticks_are_monotonic() {
        let mut q = Queue::default();
        q.push_ready("a", spec("a"), dummy_client("a"));
        q.push_ready("b", spec("b"), dummy_client("b"));
        q.touch_ready("a");

        let ticks: Vec<u64> = q.entries.iter().map(|e| e.last_used).collect();
        for pair in ticks.windows(2) {
            assert!(pair[0] < pair[1], "queue order must match ascending last_used");
        }
    }

    // =====================================================================
    // Eviction
    // =====================================================================

    #[test]
    fn pop_coldest_takes_index_zero() {
        let mut q = Queue::default();
        q.push_ready("a", spec("a"), dummy_client("a"));
        q.push_ready("b", spec("b"), dummy_client("b"));

        let evicted = q.pop_coldest_except("b").unwrap();
        assert_eq!(evicted.name, "a");
        assert_eq!(evicted.state, ClientState::Closing);
        assert_eq!(names(&q), vec!["b"]);
    }

    #[test]
    fn pop_coldest_never_evicts_the_kept_entry() {
        let mut q = Queue::default();
        q.push_ready("only", spec("only"), dummy_client("only"));
        assert!(q.pop_coldest_except("only").is_none());
    }

    // =====================================================================
    // State transitions
    // =====================================================================

    #[test]
    fn starting_flips_to_ready() {
        let mut q = Queue::default();
        q.push_starting("a", spec("a"));
        assert_eq!(q.entries[0].state, ClientState::Starting);

        q.mark_ready("a", dummy_client("a"));
        assert_eq!(q.entries[0].state, ClientState::Ready);
        assert!(q.entries[0].client.is_some());
    }

    #[test]
    fn remove_reports_closing_state() {
        let mut q = Queue::default();
        q.push_ready("a", spec("a"), dummy_client("a"));
        let removed = q.remove("a").unwrap();
        assert_eq!(removed.state, ClientState::Closing);
        assert!(q.entries.is_empty());
    }

    // =====================================================================
    // Snapshot
    // =====================================================================

    #[test]
    fn snapshot_orders_queue_by_recency_and_skips_placeholders() {
        let mut q = Queue::default();
        q.push_ready("a", spec("a"), dummy_client("a"));
        q.push_ready("b", spec("b"), dummy_client("b"));
        q.push_starting("c", spec("c"));
        q.touch_ready("a");

        let snapshot = q.snapshot();
        assert_eq!(
            snapshot.active_mcp_queue,
            vec!["b".to_string(), "a".to_string()]
        );
        assert_eq!(snapshot.servers.len(), 2);
        assert!(snapshot.servers.iter().all(|s| s.name != "c"));
    }

    // =====================================================================
    // Notifier
    // =====================================================================

    #[test]
    fn notifier_delivers_to_subscribers() {
        let notifier = ChangeNotifier::new();
        let mut rx = notifier.subscribe();
        notifier.tool_list_changed();
        assert_eq!(rx.try_recv().unwrap(), ChangeEvent::ToolListChanged);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn notifier_without_subscribers_does_not_panic() {
        let notifier = ChangeNotifier::new();
        notifier.tool_list_changed();
    }
}
