use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Context;
use serde_json::json;

use crate::metrics::Metrics;
use crate::output::Outputs;
use crate::queue::Queue;
use crate::supervise::{CollectionMonitor, RulesMonitor};

/// Everything the status snapshot reads from.
pub struct StatusState {
    pub queue: Arc<Queue>,
    pub outputs: Arc<Outputs>,
    pub rules: Option<Arc<RulesMonitor>>,
    pub collection: Option<Arc<CollectionMonitor>>,
    pub metrics: Arc<Metrics>,
}

/// Answers newline-delimited JSON requests on the status socket.
pub struct StatusServer {
    path: PathBuf,
    state: Arc<StatusState>,
    stopping: Arc<std::sync::atomic::AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl StatusServer {
    pub fn new(path: &Path, state: StatusState) -> StatusServer {
        StatusServer {
            path: path.to_path_buf(),
            state: Arc::new(state),
            stopping: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            thread: Mutex::new(None),
        }
    }

    pub fn start(&self) -> anyhow::Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)
                .with_context(|| format!("cannot remove stale socket {}", self.path.display()))?;
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("cannot create {}", parent.display()))?;
        }
        let listener = UnixListener::bind(&self.path)
            .with_context(|| format!("cannot bind status socket {}", self.path.display()))?;
        listener
            .set_nonblocking(true)
            .context("cannot make status socket non-blocking")?;

        let state = Arc::clone(&self.state);
        let stopping = Arc::clone(&self.stopping);
        let handle = std::thread::Builder::new()
            .name("status".to_string())
            .spawn(move || {
                while !stopping.load(Ordering::Relaxed) {
                    match listener.accept() {
                        Ok((conn, _)) => {
                            if let Err(err) = serve_connection(conn, &state) {
                                log::debug!("status connection error: {err}");
                            }
                        }
                        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                            std::thread::sleep(Duration::from_millis(100));
                        }
                        Err(err) => {
                            log::warn!("status accept failed: {err}");
                            std::thread::sleep(Duration::from_millis(100));
                        }
                    }
                }
            })?;
        *self.thread.lock().unwrap() = Some(handle);
        Ok(())
    }

    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Relaxed);
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        let _ = std::fs::remove_file(&self.path);
    }
}

fn serve_connection(conn: UnixStream, state: &StatusState) -> std::io::Result<()> {
    conn.set_nonblocking(false)?;
    conn.set_read_timeout(Some(Duration::from_secs(5)))?;
    conn.set_write_timeout(Some(Duration::from_secs(5)))?;
    let mut writer = conn.try_clone()?;
    let reader = BufReader::new(conn);
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let reply = handle_request(&line, state);
        writer.write_all(reply.to_string().as_bytes())?;
        writer.write_all(b"\n")?;
    }
    Ok(())
}

fn handle_request(line: &str, state: &StatusState) -> serde_json::Value {
    let request: serde_json::Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(_) => return json!({"ok": false, "error": "invalid request"}),
    };
    match request.get("op").and_then(|op| op.as_str()) {
        Some("status") => status_snapshot(state),
        Some(other) => json!({"ok": false, "error": format!("unknown op '{other}'")}),
        None => json!({"ok": false, "error": "missing op"}),
    }
}

fn status_snapshot(state: &StatusState) -> serde_json::Value {
    let queue = state.queue.stats();
    let outputs: Vec<serde_json::Value> = state
        .outputs
        .cursor_positions()
        .into_iter()
        .map(|(name, cursor)| json!({"name": name, "cursor": cursor}))
        .collect();
    let rules = match &state.rules {
        Some(monitor) => {
            let mut value = serde_json::to_value(monitor.status()).unwrap_or_default();
            value["monitored"] = json!(true);
            value
        }
        None => json!({"monitored": false}),
    };
    let collection = json!({
        "running": state
            .collection
            .as_ref()
            .map(|monitor| monitor.is_running())
            .unwrap_or(false),
    });
    json!({
        "ok": true,
        "queue": serde_json::to_value(queue).unwrap_or_default(),
        "outputs": outputs,
        "rules": rules,
        "collection": collection,
        "metrics": {
            "events_total": state.metrics.events_total(),
            "events_per_sec": state.metrics.events_per_sec(),
            "malformed_records": state.metrics.malformed_records(),
            "event_gaps": state.metrics.event_gaps(),
            "uptime_seconds": state.metrics.uptime_seconds(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::FiltersEngine;
    use crate::output::OutputsContext;
    use crate::queue::MIN_QUEUE_SIZE;

    fn test_state(dir: &Path) -> StatusState {
        let queue = Arc::new(Queue::open(&dir.join("q.dat"), MIN_QUEUE_SIZE).unwrap());
        let ctx = OutputsContext {
            queue: Arc::clone(&queue),
            user_db: None,
            tree: None,
            engine: Arc::new(FiltersEngine::new()),
            metrics: Arc::new(Metrics::new()),
        };
        let outputs = Arc::new(Outputs::new(
            ctx,
            &dir.join("outconf"),
            &dir.join("outputs"),
            vec![],
        ));
        StatusState {
            queue,
            outputs,
            rules: None,
            collection: None,
            metrics: Arc::new(Metrics::new()),
        }
    }

    fn request(path: &Path, line: &str) -> serde_json::Value {
        let mut conn = UnixStream::connect(path).unwrap();
        conn.write_all(line.as_bytes()).unwrap();
        conn.write_all(b"\n").unwrap();
        let mut reader = BufReader::new(conn);
        let mut reply = String::new();
        reader.read_line(&mut reply).unwrap();
        serde_json::from_str(&reply).unwrap()
    }

    #[test]
    fn status_op_returns_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("status.socket");
        let server = StatusServer::new(&socket, test_state(dir.path()));
        server.start().unwrap();

        let reply = request(&socket, "{\"op\":\"status\"}");
        assert_eq!(reply["ok"], true);
        assert!(reply["queue"]["size"].as_u64().unwrap() > 0);
        assert_eq!(reply["collection"]["running"], false);
        assert_eq!(reply["rules"]["monitored"], false);
        assert!(reply["outputs"].as_array().unwrap().is_empty());
        server.stop();
    }

    #[test]
    fn unknown_op_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("status.socket");
        let server = StatusServer::new(&socket, test_state(dir.path()));
        server.start().unwrap();

        let reply = request(&socket, "{\"op\":\"reboot\"}");
        assert_eq!(reply["ok"], false);
        let reply = request(&socket, "not json");
        assert_eq!(reply["ok"], false);
        server.stop();
    }
}
