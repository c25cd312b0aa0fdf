//! uplink-server: state-synchronization daemon.
//!
//! The bundled daemon serves a small counter topology, enough to exercise
//! every part of the protocol from a browser or curl: a `/status` key written
//! at startup, per-name counters under `/counters/*` bumped through an
//! action, and a `heartbeat` event on a timer. Real deployments embed
//! [`uplink_server::UplinkServer`] with their own spec instead.

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use serde_json::{json, Value};
use tracing::info;

use uplink_server::cli::Cli;
use uplink_server::{init_tracing, RunMode, UplinkServer, UplinkSpec};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    let server = UplinkServer::new(demo_spec(&cli));
    server.serve(&cli.listen_addr).await
}

fn demo_spec(cli: &Cli) -> UplinkSpec {
    let mode = cli
        .mode
        .as_deref()
        .map(RunMode::from_str)
        .unwrap_or_default();

    let mut spec = UplinkSpec::new()
        .mode(mode)
        .prefix(cli.prefix.clone())
        .session_timeout(Duration::from_millis(cli.session_timeout_ms))
        .store(["/status", "/counters/*"])
        .events(["heartbeat"])
        .action("/counters/increment", |server, params| async move {
            let name = params
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("default")
                .to_string();
            let key = format!("/counters/{name}");
            let current = server
                .get_store(&key)
                .and_then(|v| v.as_i64())
                .unwrap_or(0);
            let stored = server.set_store(&key, json!(current + 1))?;
            Ok(json!({ "counter": name, "value": stored }))
        })
        .on_session_created(|server, guid| async move {
            info!(%guid, "counter session created");
            server.emit_log(&guid, json!({ "msg": "welcome", "pid": server.pid() }));
            Ok(())
        })
        .on_session_destroyed(|_server, guid| async move {
            info!(%guid, "counter session destroyed");
            Ok(())
        })
        .bootstrap(|server| async move {
            server.set_store(
                "/status",
                json!({ "started_at": chrono::Utc::now().to_rfc3339() }),
            )?;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(30));
                loop {
                    ticker.tick().await;
                    server.emit_event(
                        "heartbeat",
                        json!({ "at": chrono::Utc::now().to_rfc3339() }),
                    );
                }
            });
            Ok(())
        });

    if let Some(limit) = cli.session_queue_limit {
        spec = spec.session_queue_limit(limit);
    }
    spec
}
