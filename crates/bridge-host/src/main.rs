//! Bridge demo host.
//!
//! Runs the trusted and the untrusted side of one bridge in a single
//! process, joined by an in-memory port pair, mounts a counter on the
//! untrusted side and clicks it from the trusted side.
//!
//! ```text
//! bridge-host [--config bridge.toml] [--clicks N]
//! ```
//!
//! Logging is controlled by `BRIDGE_LOG` (default `info`).

use anyhow::{bail, Context, Result};
use bridge_channel::port_pair;
use bridge_exec::{FunctionRepository, FN_NEXT_FRAME};
use bridge_patch::ViewValue;
use bridge_runtime::{BridgeConfig, HostBridge, SecureBridge};
use serde_json::{json, Value};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::info;

mod counter;

use counter::{counter, LogRenderer, BUTTON_NODE};

const DEFAULT_CLICKS: u32 = 3;
const USAGE: &str = "Usage: bridge-host [--config <bridge.toml>] [--clicks <n>]";

struct Args {
    config: Option<PathBuf>,
    clicks: u32,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Args> {
    let mut parsed = Args {
        config: None,
        clicks: DEFAULT_CLICKS,
    };
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let path = args.next().context("--config requires a path")?;
                parsed.config = Some(PathBuf::from(path));
            }
            "--clicks" => {
                let n = args.next().context("--clicks requires a number")?;
                parsed.clicks = n
                    .parse()
                    .with_context(|| format!("invalid click count {n:?}"))?;
            }
            other => bail!("unknown argument {other:?}\n{USAGE}"),
        }
    }
    Ok(parsed)
}

fn load_config(path: Option<&Path>) -> Result<BridgeConfig> {
    match path {
        Some(path) => BridgeConfig::load(path)
            .with_context(|| format!("loading config at {}", path.display())),
        None => Ok(BridgeConfig::default()),
    }
}

fn main() -> Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to create tokio runtime");

    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_env("BRIDGE_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    let args = parse_args(env::args().skip(1))?;
    let config = load_config(args.config.as_deref())?;

    rt.block_on(run(config, args.clicks))
}

async fn run(config: BridgeConfig, clicks: u32) -> Result<()> {
    let (trusted_port, untrusted_port) = port_pair();
    let host = HostBridge::new(
        config.clone(),
        counter::shape(),
        Arc::new(FunctionRepository::standard()),
        LogRenderer,
    )
    .context("preparing trusted side")?
    .serve(trusted_port)
    .context("starting trusted side")?;

    let secure = SecureBridge::mount(&config, untrusted_port, 0, counter)
        .await
        .context("mounting counter on untrusted side")?;

    let mut snapshots = host.snapshots();
    for n in 0..=clicks {
        if n > 0 {
            let raw = json!({
                "type": "click",
                "clientX": 12,
                "clientY": 7,
                "target": {"id": "increment", "innerHTML": "+"},
            });
            host.dispatch(BUTTON_NODE, "click", &raw)?;
        }
        let expected = Some(f64::from(n));
        timeout(
            Duration::from_secs(5),
            snapshots.wait_for(|s| s.get("count").and_then(ViewValue::as_f64) == expected),
        )
        .await
        .context("timed out waiting for replicated snapshot")?
        .context("trusted side stopped")?;
        info!(clicks = n, snapshot = %host.snapshot(), "replicated");
    }

    let tick = secure.exec().call(FN_NEXT_FRAME, Value::Null).await?;
    info!(result = %tick, "exec round trip");

    secure.close();
    secure.join().await?;
    host.join().await?;
    Ok(())
}
