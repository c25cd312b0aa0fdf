use clap::Parser;

/// CLI for the uplink daemon.
#[derive(Debug, Clone, Parser)]
#[command(name = "uplink-server", about = "Real-time state-synchronization daemon (WebSocket + HTTP fallback)")]
pub struct Cli {
    /// Listen address for HTTP/WS endpoints
    #[arg(long, env = "UPLINK_ADDR", default_value = "127.0.0.1:8787")]
    pub listen_addr: String,

    /// Mount prefix for the socket endpoint and HTTP fallback
    #[arg(long, env = "UPLINK_PREFIX", default_value = "/uplink/")]
    pub prefix: String,

    /// Run mode: "development" or "production" (defaults per build profile)
    #[arg(long, env = "UPLINK_MODE")]
    pub mode: Option<String>,

    // ─────────────────────────────────────────────────────────────────────────
    // Session options
    // ─────────────────────────────────────────────────────────────────────────

    /// Grace period before a detached session expires, in milliseconds
    #[arg(long, env = "UPLINK_SESSION_TIMEOUT_MS", default_value = "10000")]
    pub session_timeout_ms: u64,

    /// Cap on frames queued for a detached session (unbounded when omitted)
    #[arg(long, env = "UPLINK_SESSION_QUEUE_LIMIT")]
    pub session_queue_limit: Option<usize>,

    /// Enable debug logging
    #[arg(long, short)]
    pub verbose: bool,
}
