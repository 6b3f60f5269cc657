//! Per-connection session lifecycle for the streamable HTTP transport.
//!
//! Each session owns one protocol-server instance (an rmcp service running
//! over an in-process duplex byte pipe), one authenticated API client, and a
//! response demultiplexer that correlates JSON-RPC replies to waiting HTTP
//! requests. The [`SessionStore`] is the only shared mutable structure; every
//! map mutation happens in a synchronous critical section, and capacity is
//! re-checked at registration because two interleaved creation flows can both
//! pass the pre-check.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use rmcp::ServiceExt;

use crate::server::HarvestMcp;
use webharvest_client::CredentialStore;

/// Sessions idle longer than this are evicted by the reaper.
pub(crate) const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(1800);
/// Sweep cadence; shorter than the idle threshold so nothing survives more
/// than threshold + interval past its last activity.
pub(crate) const REAP_INTERVAL: Duration = Duration::from_secs(60);
/// Hard ceiling on the shutdown drain, even if a close hangs.
pub(crate) const SHUTDOWN_CEILING: Duration = Duration::from_secs(10);

const DUPLEX_BUFFER: usize = 64 * 1024;

/// Monotonic time source, injected so store/reaper tests run on a
/// deterministic clock.
pub(crate) trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

pub(crate) struct MonotonicClock {
    t0: std::time::Instant,
}

impl MonotonicClock {
    pub(crate) fn new() -> Self {
        Self {
            t0: std::time::Instant::now(),
        }
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        self.t0.elapsed().as_millis() as u64
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub(crate) enum SessionError {
    #[error("request frame has no id")]
    MissingId,
    #[error("a request with this id is already in flight on this session")]
    DuplicateRequestId,
    #[error("session transport is closed")]
    Closed,
    #[error("no response before the deadline")]
    Deadline,
}

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<serde_json::Value>>>>;

pub(crate) struct Session {
    id: String,
    created_at_ms: u64,
    last_seen_ms: AtomicU64,
    credentials: Arc<CredentialStore>,
    writer: tokio::sync::Mutex<Option<WriteHalf<DuplexStream>>>,
    pending: PendingMap,
    tasks: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("created_at_ms", &self.created_at_ms)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Build the owned server instance and transport for one connection.
    ///
    /// The returned session is not yet visible anywhere; the caller forwards
    /// the client's `initialize` through it and only registers it in the
    /// store once that round-trip succeeds.
    pub(crate) fn open(
        id: String,
        handler: HarvestMcp,
        credentials: Arc<CredentialStore>,
        now_ms: u64,
    ) -> Arc<Session> {
        let (client_io, server_io) = tokio::io::duplex(DUPLEX_BUFFER);
        let (server_read, server_write) = tokio::io::split(server_io);
        let (client_read, client_write) = tokio::io::split(client_io);

        let serve_id = id.clone();
        let serve_task = tokio::spawn(async move {
            match handler.serve((server_read, server_write)).await {
                Ok(running) => {
                    if let Err(e) = running.waiting().await {
                        tracing::debug!(session_id = %serve_id, error = %e, "protocol server exited with error");
                    }
                }
                Err(e) => {
                    tracing::debug!(session_id = %serve_id, error = %e, "protocol server ended during handshake");
                }
            }
        });

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let demux_task = tokio::spawn(demux(BufReader::new(client_read), pending.clone()));

        Arc::new(Session {
            id,
            created_at_ms: now_ms,
            last_seen_ms: AtomicU64::new(now_ms),
            credentials,
            writer: tokio::sync::Mutex::new(Some(client_write)),
            pending,
            tasks: Mutex::new(Some((serve_task, demux_task))),
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn created_at_ms(&self) -> u64 {
        self.created_at_ms
    }

    pub(crate) fn last_seen_ms(&self) -> u64 {
        self.last_seen_ms.load(Ordering::SeqCst)
    }

    pub(crate) fn touch(&self, now_ms: u64) {
        self.last_seen_ms.store(now_ms, Ordering::SeqCst);
    }

    pub(crate) fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn write_frame(&self, msg: &serde_json::Value) -> Result<(), SessionError> {
        let mut buf = serde_json::to_vec(msg).map_err(|_| SessionError::Closed)?;
        buf.push(b'\n');
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(SessionError::Closed)?;
        writer
            .write_all(&buf)
            .await
            .map_err(|_| SessionError::Closed)?;
        writer.flush().await.map_err(|_| SessionError::Closed)?;
        Ok(())
    }

    /// Forward a JSON-RPC request and await its correlated response.
    pub(crate) async fn request(
        &self,
        msg: serde_json::Value,
        deadline: Duration,
    ) -> Result<serde_json::Value, SessionError> {
        let key = msg
            .get("id")
            .map(|id| id.to_string())
            .ok_or(SessionError::MissingId)?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            if pending.contains_key(&key) {
                return Err(SessionError::DuplicateRequestId);
            }
            pending.insert(key.clone(), tx);
        }

        if let Err(e) = self.write_frame(&msg).await {
            self.pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&key);
            return Err(e);
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(SessionError::Closed),
            Err(_) => {
                self.pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&key);
                Err(SessionError::Deadline)
            }
        }
    }

    /// Forward a JSON-RPC notification (or client response); nothing to await.
    pub(crate) async fn notify(&self, msg: &serde_json::Value) -> Result<(), SessionError> {
        self.write_frame(msg).await
    }

    /// Close the owned server instance. Idempotent; failures are logged and
    /// never propagate.
    pub(crate) async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Dropping the writer delivers EOF to the protocol server.
        self.writer.lock().await.take();
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some((serve_task, demux_task)) = tasks {
            serve_task.abort();
            demux_task.abort();
            if let Err(e) = serve_task.await {
                if !e.is_cancelled() {
                    tracing::warn!(session_id = %self.id, error = %e, "protocol server close failed");
                }
            }
            if let Err(e) = demux_task.await {
                if !e.is_cancelled() {
                    tracing::debug!(session_id = %self.id, error = %e, "session demux close failed");
                }
            }
        }
        // Wake anything still waiting so it fails fast instead of timing out.
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        tracing::debug!(session_id = %self.id, "session closed");
    }
}

/// Route frames coming back from the protocol server to their waiting HTTP
/// requests. Server-initiated traffic has nowhere to go on this transport
/// (no server-opened stream) and is dropped.
async fn demux(mut reader: BufReader<ReadHalf<DuplexStream>>, pending: PendingMap) {
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let frame = line.trim();
                if frame.is_empty() {
                    continue;
                }
                let Ok(msg) = serde_json::from_str::<serde_json::Value>(frame) else {
                    tracing::debug!("dropping unparseable frame from protocol server");
                    continue;
                };
                let is_response = msg.get("result").is_some() || msg.get("error").is_some();
                if !is_response {
                    continue;
                }
                let Some(id) = msg.get("id") else { continue };
                let key = id.to_string();
                let waiter = pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&key);
                if let Some(tx) = waiter {
                    let _ = tx.send(msg);
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "session transport read failed");
                break;
            }
        }
    }
    // EOF: drop all waiters so their receivers resolve to Closed.
    pending.lock().unwrap_or_else(|e| e.into_inner()).clear();
}

pub(crate) struct SessionStore {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    max_sessions: usize,
    clock: Arc<dyn Clock>,
}

impl SessionStore {
    pub(crate) fn new(max_sessions: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            max_sessions,
            clock,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    /// Pre-check only; [`SessionStore::register`] re-validates under the
    /// lock.
    pub(crate) fn has_capacity(&self) -> bool {
        self.len() < self.max_sessions
    }

    /// Make a session visible. Fails (returning the session so the caller
    /// can close it) when the ceiling was reached by an interleaved creation.
    pub(crate) fn register(&self, session: Arc<Session>) -> Result<(), Arc<Session>> {
        let mut map = self.lock();
        if map.len() >= self.max_sessions {
            return Err(session);
        }
        map.insert(session.id().to_string(), session);
        Ok(())
    }

    /// Look up a session and mark it active now.
    pub(crate) fn get(&self, id: &str) -> Option<Arc<Session>> {
        let session = self.lock().get(id).cloned()?;
        session.touch(self.clock.now_ms());
        Some(session)
    }

    /// Remove a session from visibility. The caller closes it afterwards, so
    /// no concurrently arriving request can route to a session mid-teardown.
    pub(crate) fn remove(&self, id: &str) -> Option<Arc<Session>> {
        self.lock().remove(id)
    }

    /// Remove every session idle beyond `idle_timeout` and hand them back
    /// for closing.
    pub(crate) fn sweep_expired(&self, idle_timeout: Duration) -> Vec<Arc<Session>> {
        let now = self.clock.now_ms();
        let cutoff = idle_timeout.as_millis() as u64;
        let mut map = self.lock();
        let expired: Vec<String> = map
            .iter()
            .filter(|(_, s)| now.saturating_sub(s.last_seen_ms()) > cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        expired.iter().filter_map(|id| map.remove(id)).collect()
    }

    /// Empty the store, handing every session back for closing (shutdown
    /// drain).
    pub(crate) fn drain(&self) -> Vec<Arc<Session>> {
        self.lock().drain().map(|(_, s)| s).collect()
    }
}

/// Periodic eviction of idle sessions.
pub(crate) fn spawn_reaper(
    store: Arc<SessionStore>,
    interval: Duration,
    idle_timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; harmless, nothing is expired yet.
        loop {
            tick.tick().await;
            let expired = store.sweep_expired(idle_timeout);
            if expired.is_empty() {
                continue;
            }
            tracing::info!(count = expired.len(), "evicting idle sessions");
            for session in expired {
                session.close().await;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Transport};
    use std::sync::atomic::AtomicU64;
    use url::Url;
    use webharvest_client::ApiClient;

    struct ManualClock(AtomicU64);

    impl ManualClock {
        fn advance(&self, ms: u64) {
            self.0.fetch_add(ms, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_ms(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            api_base_url: Url::parse("http://127.0.0.1:9").expect("url"),
            api_key: Some("k".into()),
            debug: false,
            transport: Transport::Http,
            http_host: "127.0.0.1".into(),
            http_port: 0,
            public_url: None,
            oauth_issuer: None,
            oauth_client_id: None,
            allow_anonymous: true,
            max_sessions: 8,
            trust_proxy: false,
        })
    }

    fn open_session(store: &SessionStore, id: &str) -> Arc<Session> {
        let config = test_config();
        let credentials = Arc::new(CredentialStore::new(config.api_key.clone()));
        let api = Arc::new(ApiClient::new(
            reqwest::Client::new(),
            config.api_base_url.clone(),
            credentials.clone(),
        ));
        let handler = HarvestMcp::new(config, api);
        Session::open(id.to_string(), handler, credentials, store.now_ms())
    }

    fn initialize_frame(id: u64) -> serde_json::Value {
        serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "initialize",
            "params": {
                "protocolVersion": "2025-03-26",
                "capabilities": {},
                "clientInfo": { "name": "store-test", "version": "0.0.0" }
            }
        })
    }

    #[tokio::test]
    async fn initialize_round_trips_through_the_owned_server() {
        let store = SessionStore::new(8, Arc::new(ManualClock(AtomicU64::new(0))));
        let session = open_session(&store, "s-1");

        let reply = session
            .request(initialize_frame(0), Duration::from_secs(5))
            .await
            .expect("initialize reply");
        assert!(reply.get("result").is_some(), "got {reply}");

        session
            .notify(&serde_json::json!({"jsonrpc":"2.0","method":"notifications/initialized"}))
            .await
            .expect("initialized notification");

        let tools = session
            .request(
                serde_json::json!({"jsonrpc":"2.0","id":1,"method":"tools/list"}),
                Duration::from_secs(5),
            )
            .await
            .expect("tools/list reply");
        let names: Vec<&str> = tools["result"]["tools"]
            .as_array()
            .expect("tools array")
            .iter()
            .filter_map(|t| t["name"].as_str())
            .collect();
        assert!(names.contains(&"harvest_meta"), "tools: {names:?}");
        assert!(names.contains(&"agent_start"), "tools: {names:?}");

        session.close().await;
    }

    #[tokio::test]
    async fn two_creations_yield_distinct_addressable_sessions() {
        let store = SessionStore::new(8, Arc::new(ManualClock(AtomicU64::new(0))));
        let a = open_session(&store, "s-a");
        let b = open_session(&store, "s-b");
        assert_ne!(a.id(), b.id());
        store.register(a.clone()).unwrap();
        store.register(b.clone()).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.get("s-a").unwrap().id(), "s-a");
        assert_eq!(store.get("s-b").unwrap().id(), "s-b");
        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn lookup_touches_last_activity() {
        let clock = Arc::new(ManualClock(AtomicU64::new(0)));
        let store = SessionStore::new(8, clock.clone());
        let s = open_session(&store, "s-1");
        store.register(s.clone()).unwrap();
        assert_eq!(s.last_seen_ms(), 0);

        clock.advance(5_000);
        store.get("s-1").unwrap();
        assert_eq!(s.last_seen_ms(), 5_000);
        assert_eq!(s.created_at_ms(), 0);
        s.close().await;
    }

    #[tokio::test]
    async fn sweep_evicts_only_idle_sessions_and_closes_once() {
        let clock = Arc::new(ManualClock(AtomicU64::new(0)));
        let store = SessionStore::new(8, clock.clone());
        let idle = open_session(&store, "s-idle");
        store.register(idle.clone()).unwrap();

        clock.advance(30_000);
        let fresh = open_session(&store, "s-fresh");
        store.register(fresh.clone()).unwrap();

        let expired = store.sweep_expired(Duration::from_secs(20));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id(), "s-idle");
        assert_eq!(store.len(), 1);
        assert!(store.get("s-idle").is_none());

        for s in &expired {
            s.close().await;
        }
        assert!(idle.is_closed());
        // Closing again is a no-op, not a fault.
        idle.close().await;
        assert!(idle.is_closed());

        // Nothing left to evict.
        assert!(store.sweep_expired(Duration::from_secs(20)).is_empty());
        fresh.close().await;
    }

    #[tokio::test]
    async fn capacity_is_enforced_at_registration() {
        let store = SessionStore::new(1, Arc::new(ManualClock(AtomicU64::new(0))));
        let a = open_session(&store, "s-a");
        let b = open_session(&store, "s-b");
        store.register(a.clone()).unwrap();
        assert!(!store.has_capacity());
        let rejected = store.register(b).expect_err("over capacity");
        rejected.close().await;
        assert_eq!(store.len(), 1);
        a.close().await;
    }

    #[tokio::test]
    async fn drain_empties_the_store() {
        let store = SessionStore::new(8, Arc::new(ManualClock(AtomicU64::new(0))));
        for id in ["s-1", "s-2", "s-3"] {
            store.register(open_session(&store, id)).unwrap();
        }
        let drained = store.drain();
        assert_eq!(drained.len(), 3);
        assert_eq!(store.len(), 0);
        for s in &drained {
            s.close().await;
            assert!(s.is_closed());
        }
    }

    #[tokio::test]
    async fn requests_after_close_fail_fast() {
        let store = SessionStore::new(8, Arc::new(ManualClock(AtomicU64::new(0))));
        let s = open_session(&store, "s-1");
        s.close().await;
        let err = s
            .request(initialize_frame(0), Duration::from_secs(1))
            .await
            .expect_err("closed session");
        assert_eq!(err, SessionError::Closed);
    }

    #[tokio::test]
    async fn reaper_sweeps_on_its_interval() {
        let clock = Arc::new(ManualClock(AtomicU64::new(0)));
        let store = Arc::new(SessionStore::new(8, clock.clone()));
        let s = open_session(&store, "s-1");
        store.register(s.clone()).unwrap();

        clock.advance(10_000);
        let reaper = spawn_reaper(
            store.clone(),
            Duration::from_millis(10),
            Duration::from_secs(5),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.len(), 0);
        assert!(s.is_closed());
        reaper.abort();
    }
}
