//! Stand-in for the RenderDoc extension: serves the spool with a few canned methods.
//!
//! Usage: `cargo run -p renderdog-bridge --example echo_host [seconds]` (0 or omitted runs until
//! killed).

use std::{
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Context;
use parking_lot::Mutex;
use renderdog_bridge::{
    BridgeConfig, DiagnosticsQuery, MethodRouter, RemoteError, RemoteHost, required_str,
};
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;

fn router() -> MethodRouter {
    let loaded: Arc<Mutex<Option<PathBuf>>> = Arc::new(Mutex::new(None));
    let status = Arc::clone(&loaded);

    MethodRouter::new()
        .route("ping", |_| Ok(json!({ "pong": true })))
        .route("echo", |args| Ok(args.clone()))
        .route("sleep", |args| {
            let ms = args.get("ms").and_then(Value::as_u64).unwrap_or(100);
            std::thread::sleep(Duration::from_millis(ms));
            Ok(json!({ "slept_ms": ms }))
        })
        .route("get_capture_status", move |_| {
            Ok(match &*status.lock() {
                Some(path) => json!({ "loaded": true, "capture_path": path }),
                None => json!({ "loaded": false }),
            })
        })
        .route("open_capture", move |args| {
            let path = PathBuf::from(required_str(args, "capture_path")?);
            if !path.is_file() {
                return Err(RemoteError::execution_failed(format!(
                    "capture not found: {}",
                    path.display()
                )));
            }
            *loaded.lock() = Some(path.clone());
            Ok(json!({ "loaded": true, "capture_path": path }))
        })
}

fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let run_for = std::env::args()
        .nth(1)
        .map(|s| s.parse::<u64>())
        .transpose()
        .context("argument must be a number of seconds")?
        .unwrap_or(0);

    let config = BridgeConfig::from_env().context("invalid RENDERDOG_BRIDGE_* setting")?;
    let host = RemoteHost::start(config, router()).context("failed to start bridge host")?;
    eprintln!("serving {}", host.store().dir().display());

    let started = Instant::now();
    while run_for == 0 || started.elapsed() < Duration::from_secs(run_for) {
        std::thread::sleep(Duration::from_millis(250));
    }

    let snapshot = host.diagnostics(&DiagnosticsQuery::default());
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    host.stop();
    Ok(())
}
