//! Declarative server description.
//!
//! An [`UplinkSpec`] names everything an uplink instance serves: which store
//! keys are readable, which events exist, which actions are callable, and
//! how sessions live and die. The spec is consumed once at construction and
//! immutable afterwards, so dispatch never takes a lock.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::BoxFuture;
use serde_json::Value;

use uplink_core::RunMode;

use crate::server::UplinkServer;

/// Action handler: invoked with the server and the merged request params.
pub type ActionFn =
    Arc<dyn Fn(Arc<UplinkServer>, Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Session lifecycle hook, invoked with the session guid.
pub type SessionFn =
    Arc<dyn Fn(Arc<UplinkServer>, String) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// One-shot startup hook, run after routes are mounted and before traffic
/// is accepted.
pub type BootstrapFn =
    Arc<dyn Fn(Arc<UplinkServer>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

#[derive(Clone)]
pub struct UplinkSpec {
    /// Glob patterns for readable store keys.
    pub store: Vec<String>,
    /// Glob patterns for emittable event names.
    pub events: Vec<String>,
    /// Action handlers keyed by glob pattern; first match wins.
    pub actions: Vec<(String, ActionFn)>,
    pub session_created: SessionFn,
    pub session_destroyed: SessionFn,
    pub bootstrap: BootstrapFn,
    /// Grace period a detached session survives before it expires.
    pub session_timeout: Duration,
    /// Cap on frames queued for a detached session. `None` is unbounded;
    /// with a cap, the oldest frame is dropped and the receiver falls back
    /// to a full fetch when the hash chain breaks.
    pub session_queue_limit: Option<usize>,
    /// Mount point for the socket endpoint and the HTTP fallback.
    pub prefix: String,
    pub mode: RunMode,
}

impl Default for UplinkSpec {
    fn default() -> Self {
        Self {
            store: Vec::new(),
            events: Vec::new(),
            actions: Vec::new(),
            session_created: noop_session_fn(),
            session_destroyed: noop_session_fn(),
            bootstrap: noop_bootstrap_fn(),
            session_timeout: Duration::from_secs(10),
            session_queue_limit: None,
            prefix: "/uplink/".to_string(),
            mode: RunMode::default(),
        }
    }
}

impl UplinkSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the readable store key patterns.
    pub fn store<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.store = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// Declare the emittable event name patterns.
    pub fn events<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.events = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// Register an action handler under a path pattern.
    pub fn action<F, Fut>(mut self, pattern: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Arc<UplinkServer>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let handler: ActionFn =
            Arc::new(move |server, params| Box::pin(handler(server, params)));
        self.actions.push((pattern.into(), handler));
        self
    }

    pub fn on_session_created<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Arc<UplinkServer>, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.session_created = Arc::new(move |server, guid| Box::pin(hook(server, guid)));
        self
    }

    pub fn on_session_destroyed<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Arc<UplinkServer>, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.session_destroyed = Arc::new(move |server, guid| Box::pin(hook(server, guid)));
        self
    }

    pub fn bootstrap<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Arc<UplinkServer>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.bootstrap = Arc::new(move |server| Box::pin(hook(server)));
        self
    }

    pub fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    pub fn session_queue_limit(mut self, limit: usize) -> Self {
        self.session_queue_limit = Some(limit);
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }
}

fn noop_session_fn() -> SessionFn {
    Arc::new(|_server, _guid| Box::pin(async { Ok(()) }))
}

fn noop_bootstrap_fn() -> BootstrapFn {
    Arc::new(|_server| Box::pin(async { Ok(()) }))
}
