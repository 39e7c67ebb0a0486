//! Hammers a running bridge host with concurrent calls and reports latency and errors.
//!
//! Usage: `stress_bridge [threads] [requests-per-thread] [method]`, defaults `8 25 ping`.

use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

use anyhow::Context;
use renderdog_bridge::{ClientBridge, DiagnosticsQuery};
use serde_json::json;

fn arg<T: std::str::FromStr>(n: usize, default: T) -> anyhow::Result<T> {
    match std::env::args().nth(n) {
        Some(raw) => raw
            .parse()
            .map_err(|_| anyhow::anyhow!("argument {n} is invalid: {raw}")),
        None => Ok(default),
    }
}

fn percentile(sorted: &[Duration], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((sorted.len() - 1) as f64 * p).round() as usize;
    sorted[rank].as_secs_f64() * 1000.0
}

fn main() -> anyhow::Result<()> {
    let threads: usize = arg(1, 8)?;
    let per_thread: usize = arg(2, 25)?;
    let method: String = arg(3, "ping".to_string())?;

    let bridge = ClientBridge::from_env().context("invalid RENDERDOG_BRIDGE_* setting")?;
    let started = Instant::now();

    let results: Vec<Result<Duration, String>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let bridge = &bridge;
                let method = method.as_str();
                scope.spawn(move || {
                    (0..per_thread)
                        .map(|i| {
                            let call_started = Instant::now();
                            bridge
                                .call(method, json!({ "thread": t, "seq": i }))
                                .map(|_| call_started.elapsed())
                                .map_err(|e| e.code().as_str().to_string())
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap_or_default())
            .collect()
    });
    let wall = started.elapsed();

    let mut latencies: Vec<Duration> = results.iter().filter_map(|r| r.as_ref().ok().copied()).collect();
    latencies.sort();
    let mut errors: BTreeMap<&str, usize> = BTreeMap::new();
    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        *errors.entry(err.as_str()).or_default() += 1;
    }
    let mut top_errors: Vec<_> = errors.into_iter().collect();
    top_errors.sort_by(|a, b| b.1.cmp(&a.1));

    let summary = json!({
        "method": method,
        "threads": threads,
        "requests": results.len(),
        "succeeded": latencies.len(),
        "failed": results.len() - latencies.len(),
        "wall_sec": wall.as_secs_f64(),
        "throughput_rps": results.len() as f64 / wall.as_secs_f64().max(f64::EPSILON),
        "latency_ms": {
            "p50": percentile(&latencies, 0.50),
            "p95": percentile(&latencies, 0.95),
            "p99": percentile(&latencies, 0.99),
            "max": percentile(&latencies, 1.0),
        },
        "top_errors": top_errors,
        "counters": bridge.local_diagnostics(&DiagnosticsQuery::default()).counters,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
