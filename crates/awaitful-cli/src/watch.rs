//! Watch command implementation for awaitful CLI.
//!
//! Runs a headless render loop over one resource and prints each value.

use std::time::Duration;

use awaitful_core::{Context, RenderLoop, Runtime, RuntimeConfig};
use serde_json::Value;

use crate::colors;

/// Print `path` every time it changes, until Ctrl+C.
pub async fn execute(
    path: &str,
    base: &str,
    socket: Option<&str>,
    retry_ms: u64,
) -> anyhow::Result<()> {
    let runtime = Runtime::new(RuntimeConfig {
        retry_delay: Duration::from_millis(retry_ms),
        base_url: Some(base.to_string()),
    });
    let ctx = runtime.context();

    let source = match socket {
        Some(socket) => format!("{base}{socket} {path}"),
        None => format!("{base}{path}"),
    };
    println!(
        "\n{}awaitful watch{} {}{}{}",
        colors::BOLD,
        colors::RESET,
        colors::CYAN,
        source,
        colors::RESET
    );
    println!("{}", "─".repeat(50));

    let path = path.to_string();
    let socket = socket.map(str::to_string);
    let handle = RenderLoop::new("watch", &ctx)
        .on_failure(|error| {
            eprintln!("{}✗ {}{}", colors::RED, error, colors::RESET);
        })
        .spawn(
            move |c: Context| {
                let path = path.clone();
                let socket = socket.clone();
                async move {
                    match socket {
                        Some(socket) => c.ws(&socket).await?.subscribe::<Value>(&path).await,
                        None => c.fetch::<Value>(&path).await,
                    }
                }
            },
            |value: Value| {
                let text = serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string());
                println!("{}●{} {}", colors::GREEN, colors::RESET, text);
            },
        );

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            println!("{}Stopping...{}", colors::DIM, colors::RESET);
        }
        _ = handle.reached(awaitful_core::LoopState::Aborted) => {}
    }

    let stats = handle.stats();
    println!(
        "{}{} passes, {} failures, {} retries{}",
        colors::DIM,
        stats.passes(),
        stats.failures(),
        stats.retries(),
        colors::RESET
    );
    handle.abort();
    handle.join().await;

    Ok(())
}
