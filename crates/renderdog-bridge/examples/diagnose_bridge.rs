use anyhow::Context;
use renderdog_bridge::{ClientBridge, DiagnosticsQuery};

fn main() -> anyhow::Result<()> {
    let bridge = ClientBridge::from_env().context("invalid RENDERDOG_BRIDGE_* setting")?;
    let report = bridge.diagnostics(&DiagnosticsQuery::default());
    let json = serde_json::to_string_pretty(&report).context("failed to serialize JSON")?;
    println!("{json}");
    Ok(())
}
