mod auth;
mod backup;
mod calc;
mod calendar;
mod config;
mod db;
mod ipc;
mod logging;
mod nav;

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

fn main() {
    let settings = match config::Settings::load() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("{e:#}; falling back to defaults");
            config::Settings::default()
        }
    };
    logging::init(&settings.log);

    let mut state = ipc::AppState::new(settings);
    if let Some(path) = state.settings.workspace.default_path.clone() {
        let path = PathBuf::from(path);
        match db::open_db(&path) {
            Ok(conn) => {
                tracing::info!(workspace = %path.display(), "opened default workspace");
                state.workspace = Some(path);
                state.db = Some(conn);
            }
            Err(e) => tracing::warn!(error = %e, "default workspace could not be opened"),
        }
    }
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "campusd ready");

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
                // No id to reply to.
                tracing::warn!(error = %e, "dropping malformed request line");
                let resp = serde_json::json!({
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() }
                });
                let _ = writeln!(stdout, "{}", resp);
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
    tracing::info!("stdin closed, shutting down");
}
