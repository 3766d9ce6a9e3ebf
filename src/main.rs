mod calc;
mod db;
mod error;
mod export;
mod ipc;
mod persist;
mod reconcile;
mod store;

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Internal-assessment marks sidecar. Speaks newline-delimited JSON on
/// stdin/stdout; logs go to stderr.
#[derive(Parser)]
#[command(name = "internalsd", version, about)]
struct Cli {
    /// Workspace directory to open at startup
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Log filter, e.g. "info" or "internalsd=debug"
    #[arg(long, env = "INTERNALSD_LOG", default_value = "info")]
    log_filter: String,
}

fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(false)
        .init();

    let mut state = ipc::AppState::default();
    if let Some(path) = cli.workspace.as_deref() {
        if let Err(e) = ipc::select_workspace(&mut state, path) {
            error!(workspace = %path.display(), error = %e, "could not open workspace");
        }
    }
    info!(version = env!("CARGO_PKG_VERSION"), "internalsd ready");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // Can't reply without id.
                let reply = serde_json::json!({
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() }
                });
                let _ = writeln!(stdout, "{}", reply);
                let _ = stdout.flush();
                continue;
            }
        };

        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
}
