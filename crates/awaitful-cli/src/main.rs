//! awaitful CLI - reference backend and headless render loops.

mod add;
mod colors;
mod serve;
mod watch;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "awaitful")]
#[command(about = "Reference backend and headless render loops for awaitful components")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the reference backend
    Serve {
        /// Host address to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Port to listen on
        #[arg(short, long, default_value = "3000")]
        port: u16,

        /// Directory to serve static files from
        #[arg(short, long, default_value = "serve")]
        dir: PathBuf,
    },

    /// Print a resource every time it changes
    Watch {
        /// Fetch URL, or subscription path with --socket
        path: String,

        /// Base URL of the backend
        #[arg(long, default_value = "http://127.0.0.1:3000")]
        base: String,

        /// Subscribe through this socket instead of fetching
        #[arg(long)]
        socket: Option<String>,

        /// Milliseconds before a failed resource is retried
        #[arg(long, default_value = "1000")]
        retry_ms: u64,
    },

    /// Create a todo through the backend socket
    Add {
        /// Todo text
        text: String,

        /// Base URL of the backend
        #[arg(long, default_value = "http://127.0.0.1:3000")]
        base: String,

        /// Socket path of the todo hub
        #[arg(long, default_value = "/wss")]
        socket: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Serve { host, port, dir } => {
            serve::execute(host, port, dir).await?;
        }

        Commands::Watch {
            path,
            base,
            socket,
            retry_ms,
        } => {
            watch::execute(&path, &base, socket.as_deref(), retry_ms).await?;
        }

        Commands::Add { text, base, socket } => {
            add::execute(&text, &base, &socket).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_defaults() {
        let cli = Cli::try_parse_from(["awaitful", "watch", "/items"]).unwrap();
        match cli.command {
            Commands::Watch {
                path,
                base,
                socket,
                retry_ms,
            } => {
                assert_eq!(path, "/items");
                assert_eq!(base, "http://127.0.0.1:3000");
                assert_eq!(socket, None);
                assert_eq!(retry_ms, 1000);
            }
            _ => panic!("expected watch"),
        }
    }

    #[test]
    fn test_global_verbose_after_subcommand() {
        let cli = Cli::try_parse_from(["awaitful", "serve", "-p", "8080", "-v"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::Serve { port: 8080, .. }));
    }
}
