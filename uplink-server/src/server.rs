//! The uplink server.
//!
//! One instance owns the store, the listener registries, and the session and
//! connection tables, all behind a single mutex. Every operation acquires the
//! lock, runs to completion, and releases it before anything awaits, so
//! observers never see a half-applied write and fan-out order is the lock
//! acquisition order. Lifecycle hooks and action handlers run outside the
//! lock and are free to call back into the server.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use anyhow::Result;
use axum::body::Bytes;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use uplink_core::{DiffRecord, EventBus, PathRouter, RunMode, ServerFrame, Store};

use crate::connection::{connection_task, ConnectionHandle};
use crate::error::UplinkError;
use crate::session::{FrameSender, Session, SessionEvent};
use crate::spec::{ActionFn, UplinkSpec};

struct Inner {
    store: Store,
    /// Store key -> subscribed session guids.
    store_bus: EventBus,
    /// Event name -> listening session guids.
    event_bus: EventBus,
    sessions: HashMap<String, Session>,
    connections: HashMap<u64, ConnectionHandle>,
}

pub struct UplinkServer {
    /// Instance id, echoed in every handshake-ack. A client that sees a new
    /// pid knows the server restarted and its caches are void.
    pid: String,
    spec: UplinkSpec,
    store_routes: PathRouter<()>,
    event_routes: PathRouter<()>,
    action_routes: PathRouter<ActionFn>,
    inner: Mutex<Inner>,
    session_events: mpsc::UnboundedSender<SessionEvent>,
    next_connection_id: AtomicU64,
}

impl UplinkServer {
    /// Build a server from its spec and spawn the expiry reaper.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(spec: UplinkSpec) -> Arc<Self> {
        let mut spec = spec;
        spec.prefix = normalize_prefix(&spec.prefix);

        let mut store_routes = PathRouter::new();
        for pattern in &spec.store {
            store_routes.register(pattern.clone(), ());
        }
        let mut event_routes = PathRouter::new();
        for pattern in &spec.events {
            event_routes.register(pattern.clone(), ());
        }
        let mut action_routes = PathRouter::new();
        for (pattern, handler) in &spec.actions {
            action_routes.register(pattern.clone(), handler.clone());
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let server = Arc::new(Self {
            pid: Uuid::new_v4().to_string(),
            spec,
            store_routes,
            event_routes,
            action_routes,
            inner: Mutex::new(Inner {
                store: Store::new(),
                store_bus: EventBus::new(),
                event_bus: EventBus::new(),
                sessions: HashMap::new(),
                connections: HashMap::new(),
            }),
            session_events: events_tx,
            next_connection_id: AtomicU64::new(1),
        });

        tokio::spawn(reaper(Arc::downgrade(&server), events_rx));
        server
    }

    pub fn pid(&self) -> &str {
        &self.pid
    }

    pub fn mode(&self) -> RunMode {
        self.spec.mode
    }

    pub fn prefix(&self) -> &str {
        &self.spec.prefix
    }

    // ────────────────────────────────────────────────────────────────────
    // Serving
    // ────────────────────────────────────────────────────────────────────

    /// Routes for this instance: the socket endpoint at the prefix (without
    /// its trailing slash) and the HTTP fallback under the prefix.
    pub fn router(self: &Arc<Self>) -> Router {
        let trimmed = self.spec.prefix.trim_end_matches('/');
        let ws_path = if trimmed.is_empty() {
            "/".to_string()
        } else {
            trimmed.to_string()
        };
        let wildcard = format!("{}{{*path}}", self.spec.prefix);
        Router::new()
            .route(&ws_path, get(ws_uplink))
            .route(&wildcard, get(get_key).post(post_action))
            .with_state(Arc::clone(self))
    }

    /// Run the bootstrap hook, then serve until the process dies.
    pub async fn serve(self: Arc<Self>, addr: &str) -> Result<()> {
        let app = self.router();
        self.run_bootstrap().await?;
        info!(%addr, pid = %self.pid, prefix = %self.spec.prefix, "uplink listening");
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;
        Ok(())
    }

    /// One-shot startup hook. [`serve`](Self::serve) calls this itself;
    /// embedders mounting [`router`](Self::router) into a larger app call it
    /// once before accepting traffic.
    pub async fn run_bootstrap(self: &Arc<Self>) -> Result<()> {
        (self.spec.bootstrap)(Arc::clone(self)).await
    }

    // ────────────────────────────────────────────────────────────────────
    // Application API
    // ────────────────────────────────────────────────────────────────────

    /// Write `value` under `key` and fan the resulting update record out to
    /// every subscribed session, in one atomic step. Returns the stored
    /// value. On error nothing is stored and nothing is sent.
    pub fn set_store(&self, key: &str, value: Value) -> Result<Value, UplinkError> {
        let mut inner = self.inner.lock();
        let update = inner.store.set(key, value)?;
        let record = DiffRecord {
            k: update.key,
            d: update.diff,
            h: update.previous_hash,
        };
        let Inner {
            sessions,
            store_bus,
            ..
        } = &mut *inner;
        for guid in store_bus.listeners(key) {
            if let Some(session) = sessions.get_mut(&guid) {
                session.emit(ServerFrame::Update(record.clone()));
            }
        }
        debug!(%key, "store updated");
        Ok(update.value)
    }

    /// Current value of `key`, if it was ever written.
    pub fn get_store(&self, key: &str) -> Option<Value> {
        let value = self.inner.lock().store.get(key).cloned();
        if value.is_none() && self.spec.mode.is_dev() {
            warn!(%key, "getStore: key was never set");
        }
        value
    }

    /// Broadcast `params` to every session listening to `name`.
    pub fn emit_event(&self, name: &str, params: Value) {
        let mut inner = self.inner.lock();
        let Inner {
            sessions,
            event_bus,
            ..
        } = &mut *inner;
        let mut delivered = 0;
        for guid in event_bus.listeners(name) {
            if let Some(session) = sessions.get_mut(&guid) {
                session.emit(ServerFrame::Event {
                    event_name: name.to_string(),
                    params: params.clone(),
                });
                delivered += 1;
            }
        }
        debug!(%name, delivered, "event emitted");
    }

    /// Send a `debug` frame to one session. Development mode only; silently
    /// dropped in production.
    pub fn emit_debug(&self, guid: &str, params: Value) {
        if self.spec.mode.is_dev() {
            self.emit_directed(guid, ServerFrame::Debug(params));
        }
    }

    /// Send a `log` frame to one session, queued while it is detached.
    pub fn emit_log(&self, guid: &str, params: Value) {
        self.emit_directed(guid, ServerFrame::Log(params));
    }

    /// Send a `warn` frame to one session, queued while it is detached.
    pub fn emit_warn(&self, guid: &str, params: Value) {
        self.emit_directed(guid, ServerFrame::Warn(params));
    }

    /// Send an `err` frame to one session, queued while it is detached.
    pub fn emit_error(&self, guid: &str, err: impl Into<String>) {
        self.emit_directed(guid, ServerFrame::Err { err: err.into() });
    }

    fn emit_directed(&self, guid: &str, frame: ServerFrame) {
        let mut inner = self.inner.lock();
        if let Some(session) = inner.sessions.get_mut(guid) {
            session.emit(frame);
        }
    }

    // ────────────────────────────────────────────────────────────────────
    // Introspection
    // ────────────────────────────────────────────────────────────────────

    pub fn session_count(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.lock().connections.len()
    }

    pub fn has_session(&self, guid: &str) -> bool {
        self.inner.lock().sessions.contains_key(guid)
    }

    /// Sessions currently subscribed to `key`.
    pub fn subscriber_count(&self, key: &str) -> usize {
        self.inner.lock().store_bus.listener_count(key)
    }

    /// Sessions currently listening to `name`.
    pub fn listener_count(&self, name: &str) -> usize {
        self.inner.lock().event_bus.listener_count(name)
    }

    // ────────────────────────────────────────────────────────────────────
    // Socket protocol
    // ────────────────────────────────────────────────────────────────────

    pub(crate) fn register_connection(&self, tx: FrameSender) -> u64 {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .lock()
            .connections
            .insert(id, ConnectionHandle { guid: None, tx });
        id
    }

    pub(crate) fn send_to_connection(&self, id: u64, frame: ServerFrame) {
        let inner = self.inner.lock();
        if let Some(conn) = inner.connections.get(&id) {
            let _ = conn.tx.send(frame);
        }
    }

    /// Socket closed. Detach the bound session, unless another handshake
    /// already stole it, and start its expiry clock.
    pub(crate) fn handle_disconnect(&self, id: u64) {
        let mut inner = self.inner.lock();
        let Some(conn) = inner.connections.remove(&id) else {
            return;
        };
        let Some(guid) = conn.guid else { return };
        if let Some(session) = inner.sessions.get_mut(&guid) {
            if session.bound_id() == Some(id)
                && session.detach(self.spec.session_timeout, &self.session_events)
            {
                debug!(%guid, connection = id, "session detached");
            }
        }
    }

    /// Bind a session to this connection, creating it if the guid is new.
    /// The ack reports whether the session already existed.
    pub(crate) async fn handshake(
        self: &Arc<Self>,
        conn_id: u64,
        guid: String,
    ) -> Result<(), UplinkError> {
        {
            let inner = self.inner.lock();
            let Some(conn) = inner.connections.get(&conn_id) else {
                return Ok(());
            };
            if conn.guid.is_some() {
                return Err(UplinkError::Validation(
                    "handshake: session already linked.".to_string(),
                ));
            }
        }

        let recovered = self.ensure_session(&guid).await?;

        let mut inner = self.inner.lock();
        let Inner {
            sessions,
            connections,
            ..
        } = &mut *inner;
        let Some(session) = sessions.get_mut(&guid) else {
            // Expired between creation and attach; only possible when the
            // session_created hook outlives the session timeout.
            return Err(UplinkError::Validation(
                "handshake: session expired.".to_string(),
            ));
        };
        // A session can be bound to at most one connection. A handshake from
        // a new connection steals it; the old connection falls back to
        // pre-handshake state.
        if let Some(old_id) = session.bound_id() {
            if old_id != conn_id {
                if let Some(old) = connections.get_mut(&old_id) {
                    old.guid = None;
                }
                debug!(%guid, old_connection = old_id, new_connection = conn_id, "session stolen");
            }
        }
        let Some(conn) = connections.get_mut(&conn_id) else {
            // Socket died while the session_created hook ran. Leave the
            // session detached; its timer is already armed.
            return Ok(());
        };
        conn.guid = Some(guid.clone());
        let tx = conn.tx.clone();
        session.attach(conn_id, tx);
        session.emit(ServerFrame::HandshakeAck {
            pid: self.pid.clone(),
            recovered,
        });
        info!(%guid, connection = conn_id, recovered, "session attached");
        Ok(())
    }

    /// Explicitly end the session bound to this connection.
    pub(crate) async fn unhandshake(self: &Arc<Self>, conn_id: u64) -> Result<(), UplinkError> {
        let guid = {
            let mut inner = self.inner.lock();
            let Some(conn) = inner.connections.get_mut(&conn_id) else {
                return Ok(());
            };
            match conn.guid.take() {
                Some(guid) => guid,
                None => {
                    return Err(UplinkError::Validation(
                        "unhandshake: no active session.".to_string(),
                    ))
                }
            }
        };
        self.expire_session(&guid, None).await;
        self.send_to_connection(conn_id, ServerFrame::UnhandshakeAck {});
        Ok(())
    }

    pub(crate) fn subscribe(&self, conn_id: u64, key: &str) -> Result<(), UplinkError> {
        let mut inner = self.inner.lock();
        let Inner {
            sessions,
            connections,
            store_bus,
            ..
        } = &mut *inner;
        let Some(conn) = connections.get(&conn_id) else {
            return Ok(());
        };
        let Some(guid) = conn.guid.as_deref() else {
            return Err(UplinkError::Validation(
                "subscribeTo: requires handshake.".to_string(),
            ));
        };
        if !self.store_routes.matches(key) {
            return Err(UplinkError::UnknownStoreKey);
        }
        let Some(session) = sessions.get_mut(guid) else {
            return Ok(());
        };
        session.subscribe(key, store_bus, self.spec.mode)?;
        debug!(%guid, %key, "subscribed");
        Ok(())
    }

    pub(crate) fn unsubscribe(&self, conn_id: u64, key: &str) -> Result<(), UplinkError> {
        let mut inner = self.inner.lock();
        let Inner {
            sessions,
            connections,
            store_bus,
            ..
        } = &mut *inner;
        let Some(conn) = connections.get(&conn_id) else {
            return Ok(());
        };
        let Some(guid) = conn.guid.as_deref() else {
            return Err(UplinkError::Validation(
                "unsubscribeFrom: requires handshake.".to_string(),
            ));
        };
        let Some(session) = sessions.get_mut(guid) else {
            return Ok(());
        };
        session.unsubscribe(key, store_bus, self.spec.mode)?;
        debug!(%guid, %key, "unsubscribed");
        Ok(())
    }

    pub(crate) fn listen(&self, conn_id: u64, name: &str) -> Result<(), UplinkError> {
        let mut inner = self.inner.lock();
        let Inner {
            sessions,
            connections,
            event_bus,
            ..
        } = &mut *inner;
        let Some(conn) = connections.get(&conn_id) else {
            return Ok(());
        };
        let Some(guid) = conn.guid.as_deref() else {
            return Err(UplinkError::Validation(
                "listenTo: requires handshake.".to_string(),
            ));
        };
        if !self.event_routes.matches(name) {
            return Err(UplinkError::UnknownEventName);
        }
        let Some(session) = sessions.get_mut(guid) else {
            return Ok(());
        };
        session.listen(name, event_bus, self.spec.mode)?;
        debug!(%guid, event = %name, "listening");
        Ok(())
    }

    pub(crate) fn unlisten(&self, conn_id: u64, name: &str) -> Result<(), UplinkError> {
        let mut inner = self.inner.lock();
        let Inner {
            sessions,
            connections,
            event_bus,
            ..
        } = &mut *inner;
        let Some(conn) = connections.get(&conn_id) else {
            return Ok(());
        };
        let Some(guid) = conn.guid.as_deref() else {
            return Err(UplinkError::Validation(
                "unlistenFrom: requires handshake.".to_string(),
            ));
        };
        let Some(session) = sessions.get_mut(guid) else {
            return Ok(());
        };
        session.unlisten(name, event_bus, self.spec.mode)?;
        debug!(%guid, event = %name, "unlistening");
        Ok(())
    }

    // ────────────────────────────────────────────────────────────────────
    // Session lifecycle
    // ────────────────────────────────────────────────────────────────────

    /// Create the session for `guid` if it does not exist, running the
    /// session_created hook outside the lock. Returns whether the session
    /// already existed. If the hook fails the session is rolled back so a
    /// retry starts clean, unless another connection attached to it while
    /// the hook ran; the session then survives and only the creating
    /// handshake fails.
    pub(crate) async fn ensure_session(self: &Arc<Self>, guid: &str) -> Result<bool, UplinkError> {
        let created_epoch = {
            let mut inner = self.inner.lock();
            if inner.sessions.contains_key(guid) {
                None
            } else {
                let mut session = Session::new(guid.to_string(), self.spec.session_queue_limit);
                session.arm_expiry(self.spec.session_timeout, &self.session_events);
                let epoch = session.epoch;
                inner.sessions.insert(guid.to_string(), session);
                Some(epoch)
            }
        };
        let Some(created_epoch) = created_epoch else {
            return Ok(true);
        };
        info!(%guid, "session created");
        if let Err(err) = (self.spec.session_created)(Arc::clone(self), guid.to_string()).await {
            error!(%guid, %err, "session_created hook failed, rolling back");
            let session = {
                let mut inner = self.inner.lock();
                // Another connection may have attached this session while the
                // hook ran; it owns the session now, so only remove it when
                // still detached with the creation epoch intact.
                let untouched = inner.sessions.get(guid).is_some_and(|session| {
                    !session.is_attached() && session.epoch == created_epoch
                });
                if untouched {
                    inner.sessions.remove(guid)
                } else {
                    None
                }
            };
            if let Some(mut session) = session {
                session.cancel_timer();
            }
            return Err(UplinkError::Handler(err));
        }
        Ok(false)
    }

    /// Tear a session down: drop every registration, forget the session, and
    /// run the session_destroyed hook outside the lock. With an epoch this is
    /// a timer expiry and is ignored when stale; without one it is forced.
    pub(crate) async fn expire_session(self: &Arc<Self>, guid: &str, epoch: Option<u64>) {
        {
            let mut inner = self.inner.lock();
            let stale = match inner.sessions.get(guid) {
                None => true,
                Some(session) => match epoch {
                    Some(epoch) => session.is_attached() || session.epoch != epoch,
                    None => false,
                },
            };
            if stale {
                return;
            }
            let Some(mut session) = inner.sessions.remove(guid) else {
                return;
            };
            session.cancel_timer();
            for key in session.subscriptions.drain() {
                inner.store_bus.remove_listener(&key, guid);
            }
            for name in session.listeners.drain() {
                inner.event_bus.remove_listener(&name, guid);
            }
            if let Some(conn_id) = session.bound_id() {
                if let Some(conn) = inner.connections.get_mut(&conn_id) {
                    conn.guid = None;
                }
            }
            let reason = if epoch.is_some() { "expired" } else { "terminated" };
            info!(%guid, reason, "session ended");
        }
        if let Err(err) = (self.spec.session_destroyed)(Arc::clone(self), guid.to_string()).await {
            error!(%guid, %err, "session_destroyed hook failed");
        }
    }
}

/// Applies expiry timers to the server they belong to. Holding only a weak
/// reference lets the server drop while timers are still pending.
async fn reaper(server: Weak<UplinkServer>, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        let Some(server) = server.upgrade() else { break };
        match event {
            SessionEvent::Expire { guid, epoch } => {
                server.expire_session(&guid, Some(epoch)).await;
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────
// HTTP endpoints
// ────────────────────────────────────────────────────────────────────────

async fn ws_uplink(State(server): State<Arc<UplinkServer>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| connection_task(server, socket))
}

/// GET fallback: read a store key without a session.
async fn get_key(State(server): State<Arc<UplinkServer>>, Path(path): Path<String>) -> Response {
    let key = format!("/{path}");
    debug!(%key, "<<< fetch");
    if !server.store_routes.matches(&key) {
        return UplinkError::UnknownStoreKey.into_http(server.spec.mode);
    }
    let value = server.get_store(&key).unwrap_or(Value::Null);
    Json(value).into_response()
}

/// POST fallback: invoke an action without a socket. The body carries the
/// caller's guid so a session exists (and may accumulate directed frames)
/// even before any socket connects.
async fn post_action(
    State(server): State<Arc<UplinkServer>>,
    Path(path): Path<String>,
    body: Bytes,
) -> Response {
    let path = format!("/{path}");
    match run_action(&server, &path, &body).await {
        Ok(value) => Json(value).into_response(),
        Err(err) => err.into_http(server.spec.mode),
    }
}

async fn run_action(
    server: &Arc<UplinkServer>,
    path: &str,
    body: &[u8],
) -> Result<Value, UplinkError> {
    // Body errors take precedence over an unmatched path.
    let body: Value = serde_json::from_slice(body)
        .map_err(|_| UplinkError::Validation("body: expecting Object.".to_string()))?;
    let Some(body) = body.as_object() else {
        return Err(UplinkError::Validation("body: expecting Object.".to_string()));
    };
    let Some(guid) = body.get("guid").and_then(Value::as_str) else {
        return Err(UplinkError::Validation("guid: expecting String.".to_string()));
    };
    let Some(params) = body.get("params").and_then(Value::as_object) else {
        return Err(UplinkError::Validation("params: expecting Object.".to_string()));
    };

    let handler = server
        .action_routes
        .resolve(path)
        .cloned()
        .ok_or(UplinkError::UnknownAction)?;

    server.ensure_session(guid).await?;

    let mut merged = params.clone();
    merged.insert("guid".to_string(), Value::String(guid.to_string()));
    debug!(%path, %guid, "<<< action");
    let result = handler(Arc::clone(server), Value::Object(merged)).await?;
    Ok(result)
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{trimmed}/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Notify;
    use uplink_core::content_hash;

    fn test_spec() -> UplinkSpec {
        UplinkSpec::new()
            .store(["/count", "/items/*"])
            .events(["tick"])
            .mode(RunMode::Production)
            .session_timeout(Duration::from_millis(40))
    }

    async fn attached(server: &Arc<UplinkServer>, guid: &str) -> (u64, mpsc::UnboundedReceiver<ServerFrame>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = server.register_connection(tx);
        server.handshake(id, guid.to_string()).await.unwrap();
        // Swallow the ack.
        assert!(matches!(
            rx.recv().await.unwrap(),
            ServerFrame::HandshakeAck { .. }
        ));
        (id, rx)
    }

    #[test]
    fn test_normalize_prefix() {
        assert_eq!(normalize_prefix("/uplink/"), "/uplink/");
        assert_eq!(normalize_prefix("uplink"), "/uplink/");
        assert_eq!(normalize_prefix("/api/sync"), "/api/sync/");
        assert_eq!(normalize_prefix("/"), "/");
        assert_eq!(normalize_prefix(""), "/");
    }

    #[tokio::test]
    async fn test_handshake_acks_with_pid_and_recovered_false() {
        let server = UplinkServer::new(test_spec());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = server.register_connection(tx);
        server.handshake(id, "g1".to_string()).await.unwrap();

        match rx.recv().await.unwrap() {
            ServerFrame::HandshakeAck { pid, recovered } => {
                assert_eq!(pid, server.pid());
                assert!(!recovered);
            }
            other => panic!("expected handshake-ack, got {other:?}"),
        }
        assert!(server.has_session("g1"));
        assert_eq!(server.session_count(), 1);
    }

    #[tokio::test]
    async fn test_second_handshake_on_connection_is_rejected() {
        let server = UplinkServer::new(test_spec());
        let (id, _rx) = attached(&server, "g1").await;
        let err = server.handshake(id, "g2".to_string()).await.unwrap_err();
        assert_eq!(err.to_string(), "handshake: session already linked.");
    }

    #[tokio::test]
    async fn test_subscribe_requires_handshake() {
        let server = UplinkServer::new(test_spec());
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = server.register_connection(tx);
        let err = server.subscribe(id, "/count").unwrap_err();
        assert_eq!(err.to_string(), "subscribeTo: requires handshake.");
    }

    #[tokio::test]
    async fn test_subscribe_unknown_key_is_rejected() {
        let server = UplinkServer::new(test_spec());
        let (id, _rx) = attached(&server, "g1").await;
        let err = server.subscribe(id, "/nope").unwrap_err();
        assert_eq!(err.to_string(), "Unknown store key");
    }

    #[tokio::test]
    async fn test_set_store_fans_out_updates() {
        let server = UplinkServer::new(test_spec());
        let (id, mut rx) = attached(&server, "g1").await;
        server.subscribe(id, "/count").unwrap();

        server.set_store("/count", json!({"n": 1})).unwrap();
        match rx.recv().await.unwrap() {
            ServerFrame::Update(record) => {
                assert_eq!(record.k, "/count");
                assert_eq!(record.d, json!({"n": 1}));
                assert_eq!(record.h, content_hash(&json!({})).unwrap());
            }
            other => panic!("expected update, got {other:?}"),
        }

        server.set_store("/count", json!({"n": 2})).unwrap();
        match rx.recv().await.unwrap() {
            ServerFrame::Update(record) => {
                assert_eq!(record.d, json!({"n": 2}));
                assert_eq!(record.h, content_hash(&json!({"n": 1})).unwrap());
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_duplicate_subscribe_errs_in_production() {
        let server = UplinkServer::new(test_spec());
        let (id, _rx) = attached(&server, "g1").await;
        server.subscribe(id, "/count").unwrap();
        let err = server.subscribe(id, "/count").unwrap_err();
        assert!(err.to_string().contains("already subscribed"));
        // Still subscribed exactly once.
        assert_eq!(server.subscriber_count("/count"), 1);
    }

    #[tokio::test]
    async fn test_handshake_steals_session_from_old_connection() {
        let server = UplinkServer::new(test_spec());
        let (id_a, mut rx_a) = attached(&server, "g1").await;
        server.subscribe(id_a, "/count").unwrap();

        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let id_b = server.register_connection(tx_b);
        server.handshake(id_b, "g1".to_string()).await.unwrap();
        match rx_b.recv().await.unwrap() {
            ServerFrame::HandshakeAck { recovered, .. } => assert!(recovered),
            other => panic!("expected handshake-ack, got {other:?}"),
        }

        // Updates follow the session to the new connection.
        server.set_store("/count", json!(1)).unwrap();
        assert!(matches!(
            rx_b.recv().await.unwrap(),
            ServerFrame::Update(_)
        ));
        assert!(rx_a.try_recv().is_err());

        // The old connection dying must not detach the stolen session.
        server.handle_disconnect(id_a);
        server.set_store("/count", json!(2)).unwrap();
        assert!(matches!(
            rx_b.recv().await.unwrap(),
            ServerFrame::Update(_)
        ));
    }

    #[tokio::test]
    async fn test_detached_session_queues_and_flushes_on_reattach() {
        let server = UplinkServer::new(test_spec());
        let (id, _rx) = attached(&server, "g1").await;
        server.subscribe(id, "/count").unwrap();
        server.handle_disconnect(id);

        server.set_store("/count", json!(1)).unwrap();
        server.set_store("/count", json!(2)).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let id2 = server.register_connection(tx);
        server.handshake(id2, "g1".to_string()).await.unwrap();

        // Queued updates flush in order, then the ack for this handshake.
        let mut shadow = json!({});
        for expected in [json!(1), json!(2)] {
            match rx.recv().await.unwrap() {
                ServerFrame::Update(record) => {
                    assert_eq!(content_hash(&shadow).unwrap(), record.h);
                    shadow = uplink_core::apply_patch(&shadow, &record.d);
                    assert_eq!(shadow, expected);
                }
                other => panic!("expected update, got {other:?}"),
            }
        }
        match rx.recv().await.unwrap() {
            ServerFrame::HandshakeAck { recovered, .. } => assert!(recovered),
            other => panic!("expected handshake-ack, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_detached_session_expires_and_runs_hook() {
        let destroyed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&destroyed);
        let spec = test_spec().on_session_destroyed(move |_server, _guid| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        let server = UplinkServer::new(spec);

        let (id, _rx) = attached(&server, "g1").await;
        server.subscribe(id, "/count").unwrap();
        server.handle_disconnect(id);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!server.has_session("g1"));
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(server.subscriber_count("/count"), 0);
    }

    #[tokio::test]
    async fn test_attached_session_never_expires() {
        let server = UplinkServer::new(test_spec());
        let (_id, mut rx) = attached(&server, "g1").await;

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(server.has_session("g1"));

        // Still delivers after the timeout would have fired.
        server.emit_log("g1", json!({"still": "here"}));
        assert!(matches!(rx.recv().await.unwrap(), ServerFrame::Log(_)));
    }

    #[tokio::test]
    async fn test_unhandshake_tears_down_and_acks() {
        let destroyed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&destroyed);
        let spec = test_spec().on_session_destroyed(move |_server, _guid| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        let server = UplinkServer::new(spec);
        let (id, mut rx) = attached(&server, "g1").await;

        server.unhandshake(id).await.unwrap();
        assert!(matches!(
            rx.recv().await.unwrap(),
            ServerFrame::UnhandshakeAck {}
        ));
        assert!(!server.has_session("g1"));
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);

        // The connection is back to pre-handshake state.
        let err = server.subscribe(id, "/count").unwrap_err();
        assert_eq!(err.to_string(), "subscribeTo: requires handshake.");
    }

    #[tokio::test]
    async fn test_unhandshake_without_session_errs() {
        let server = UplinkServer::new(test_spec());
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = server.register_connection(tx);
        let err = server.unhandshake(id).await.unwrap_err();
        assert_eq!(err.to_string(), "unhandshake: no active session.");
    }

    #[tokio::test]
    async fn test_session_created_failure_rolls_back() {
        let spec = test_spec().on_session_created(|_server, _guid| async {
            Err(anyhow::anyhow!("boot refused"))
        });
        let server = UplinkServer::new(spec);
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = server.register_connection(tx);

        let err = server.handshake(id, "g1".to_string()).await.unwrap_err();
        assert!(err.to_string().contains("boot refused"));
        assert!(!server.has_session("g1"));

        // A retry starts from scratch and may succeed if the hook recovers.
        let err = server.handshake(id, "g1".to_string()).await.unwrap_err();
        assert!(err.to_string().contains("boot refused"));
    }

    #[tokio::test]
    async fn test_created_hook_failure_keeps_session_claimed_meanwhile() {
        let gate = Arc::new(Notify::new());
        let hook_gate = Arc::clone(&gate);
        let spec = test_spec()
            .session_timeout(Duration::from_secs(5))
            .on_session_created(move |_server, _guid| {
                let gate = Arc::clone(&hook_gate);
                async move {
                    gate.notified().await;
                    Err(anyhow::anyhow!("boot refused"))
                }
            });
        let server = UplinkServer::new(spec);

        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let id_a = server.register_connection(tx_a);
        let first = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.handshake(id_a, "g1".to_string()).await })
        };
        // The session is inserted before the hook runs, so once it shows up
        // the first handshake is parked inside its hook.
        for _ in 0..100 {
            if server.has_session("g1") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(server.has_session("g1"));

        // A second connection claims the session while the hook is pending.
        let (id_b, mut rx_b) = attached(&server, "g1").await;

        gate.notify_one();
        let err = first.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("boot refused"));

        // Only the failed handshake is refused. The session the second
        // connection attached to stays live and fully registered.
        assert!(server.has_session("g1"));
        server.subscribe(id_b, "/count").unwrap();
        assert_eq!(server.subscriber_count("/count"), 1);
        server.set_store("/count", json!({"n": 7})).unwrap();
        assert!(matches!(rx_b.recv().await.unwrap(), ServerFrame::Update(_)));
    }

    #[tokio::test]
    async fn test_listen_and_emit_event() {
        let server = UplinkServer::new(test_spec());
        let (id, mut rx) = attached(&server, "g1").await;
        server.listen(id, "tick").unwrap();

        server.emit_event("tick", json!({"beat": 1}));
        match rx.recv().await.unwrap() {
            ServerFrame::Event { event_name, params } => {
                assert_eq!(event_name, "tick");
                assert_eq!(params, json!({"beat": 1}));
            }
            other => panic!("expected event, got {other:?}"),
        }

        server.unlisten(id, "tick").unwrap();
        server.emit_event("tick", json!({"beat": 2}));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_listen_unknown_event_is_rejected() {
        let server = UplinkServer::new(test_spec());
        let (id, _rx) = attached(&server, "g1").await;
        let err = server.listen(id, "tock").unwrap_err();
        assert_eq!(err.to_string(), "Unknown event name");
    }

    #[tokio::test]
    async fn test_directed_frames_queue_while_detached() {
        let server = UplinkServer::new(test_spec().session_timeout(Duration::from_secs(5)));
        let (id, _rx) = attached(&server, "g1").await;
        server.handle_disconnect(id);

        server.emit_log("g1", json!({"n": 1}));
        server.emit_warn("g1", json!({"n": 2}));
        // Unknown guids are dropped without error.
        server.emit_log("ghost", json!({}));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let id2 = server.register_connection(tx);
        server.handshake(id2, "g1".to_string()).await.unwrap();

        match rx.recv().await.unwrap() {
            ServerFrame::Log(params) => assert_eq!(params, json!({"n": 1})),
            other => panic!("expected log, got {other:?}"),
        }
        match rx.recv().await.unwrap() {
            ServerFrame::Warn(params) => assert_eq!(params, json!({"n": 2})),
            other => panic!("expected warn, got {other:?}"),
        }
        assert!(matches!(
            rx.recv().await.unwrap(),
            ServerFrame::HandshakeAck { recovered: true, .. }
        ));
    }

    #[tokio::test]
    async fn test_debug_frames_only_in_development() {
        let server = UplinkServer::new(test_spec().mode(RunMode::Production));
        let (_id, mut rx) = attached(&server, "g1").await;
        server.emit_debug("g1", json!({"x": 1}));
        assert!(rx.try_recv().is_err());

        let server = UplinkServer::new(test_spec().mode(RunMode::Development));
        let (_id, mut rx) = attached(&server, "g1").await;
        server.emit_debug("g1", json!({"x": 1}));
        assert!(matches!(rx.recv().await.unwrap(), ServerFrame::Debug(_)));
    }
}
