//! Add command implementation for awaitful CLI.

use std::time::Duration;

use anyhow::Context as _;
use awaitful_core::{Context, RenderLoop, Runtime, RuntimeConfig};
use awaitful_server::ClientMessage;
use tokio::sync::mpsc;

use crate::colors;

const CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

/// Create a todo and wait until the hub lists it.
pub async fn execute(text: &str, base: &str, socket: &str) -> anyhow::Result<()> {
    let runtime = Runtime::new(RuntimeConfig {
        base_url: Some(base.to_string()),
        ..RuntimeConfig::default()
    });
    let ctx = runtime.context();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let url = socket.to_string();
    let handle = RenderLoop::new("todos", &ctx).spawn(
        move |c: Context| {
            let url = url.clone();
            async move { c.ws(&url).await?.subscribe::<Vec<u64>>("/todos").await }
        },
        move |ids| {
            let _ = tx.send(ids);
        },
    );

    let before = tokio::time::timeout(CONFIRM_TIMEOUT, rx.recv())
        .await
        .context("todo hub did not answer")?
        .context("todo subscription ended")?;

    ctx.ws(socket).await?.send(&ClientMessage::CreateTodo {
        text: text.to_string(),
    })?;

    let created = loop {
        let ids = tokio::time::timeout(CONFIRM_TIMEOUT, rx.recv())
            .await
            .context("todo was not confirmed")?
            .context("todo subscription ended")?;
        if let Some(id) = ids.iter().find(|id| !before.contains(id)) {
            break *id;
        }
    };
    handle.abort();

    println!(
        "{}✓{} created todo {}{}{}",
        colors::GREEN,
        colors::RESET,
        colors::BOLD,
        created,
        colors::RESET
    );
    Ok(())
}
