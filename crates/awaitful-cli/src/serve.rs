//! Serve command implementation for awaitful CLI.
//!
//! Starts the reference backend.

use std::path::PathBuf;

use awaitful_server::ServerConfig;

use crate::colors;

/// Start the reference backend.
pub async fn execute(host: String, port: u16, static_dir: PathBuf) -> anyhow::Result<()> {
    if !static_dir.is_dir() {
        eprintln!(
            "{}Warning:{} static directory {} does not exist; only API routes will answer",
            colors::YELLOW,
            colors::RESET,
            static_dir.display()
        );
    }

    let config = ServerConfig {
        host,
        port,
        static_dir,
    };
    // Fail on a bad address before printing the banner.
    let addr = config.addr()?;

    println!("\n{}awaitful server{}", colors::BOLD, colors::RESET);
    println!("{}", "─".repeat(50));
    println!(
        "{}  ◆ Static:{} {}",
        colors::CYAN,
        colors::RESET,
        config.static_dir.display()
    );
    println!("{}  ◆ Server:{} http://{}", colors::CYAN, colors::RESET, addr);
    println!(
        "{}  ◆ WebSocket:{} ws://{}/wss",
        colors::CYAN,
        colors::RESET,
        addr
    );
    println!("{}", "─".repeat(50));
    println!("{}Press Ctrl+C to stop{}", colors::GREEN, colors::RESET);
    println!();

    awaitful_server::serve(config).await?;

    Ok(())
}
