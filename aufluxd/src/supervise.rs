use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const RULES_CHECK_INTERVAL: Duration = Duration::from_secs(15);
const COLLECTOR_START_BACKOFF: Duration = Duration::from_secs(1);
const COLLECTOR_MAX_BACKOFF: Duration = Duration::from_secs(60);
const COLLECTOR_HEALTHY_RUN: Duration = Duration::from_secs(60);

/// Spawns and restarts the helper collector binary, forwarding its stderr to
/// the log.
pub struct CollectionMonitor {
    collector_path: PathBuf,
    collector_config: Option<PathBuf>,
    input_socket: PathBuf,
    netlink_only: bool,
    running: Arc<AtomicBool>,
    stopping: Arc<AtomicBool>,
    child_pid: Arc<Mutex<Option<u32>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CollectionMonitor {
    pub fn new(
        collector_path: &Path,
        collector_config: Option<&Path>,
        input_socket: &Path,
        netlink_only: bool,
    ) -> Arc<CollectionMonitor> {
        Arc::new(CollectionMonitor {
            collector_path: collector_path.to_path_buf(),
            collector_config: collector_config.map(|p| p.to_path_buf()),
            input_socket: input_socket.to_path_buf(),
            netlink_only,
            running: Arc::new(AtomicBool::new(false)),
            stopping: Arc::new(AtomicBool::new(false)),
            child_pid: Arc::new(Mutex::new(None)),
            thread: Mutex::new(None),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        if !self.collector_path.exists() {
            log::info!(
                "collector binary {} not found; expecting records on the input socket",
                self.collector_path.display()
            );
            return Ok(());
        }
        let monitor = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("collection".to_string())
            .spawn(move || monitor.run())?;
        *self.thread.lock().unwrap() = Some(handle);
        Ok(())
    }

    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Relaxed);
        if let Some(pid) = *self.child_pid.lock().unwrap() {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid as i32),
                nix::sys::signal::Signal::SIGTERM,
            );
        }
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    fn run(&self) {
        let mut backoff = COLLECTOR_START_BACKOFF;
        while !self.stopping.load(Ordering::Relaxed) {
            let started = Instant::now();
            match self.spawn_collector() {
                Ok(mut child) => {
                    *self.child_pid.lock().unwrap() = Some(child.id());
                    self.running.store(true, Ordering::Relaxed);
                    self.forward_stderr(&mut child);
                    let status = child.wait();
                    self.running.store(false, Ordering::Relaxed);
                    *self.child_pid.lock().unwrap() = None;
                    if self.stopping.load(Ordering::Relaxed) {
                        break;
                    }
                    match status {
                        Ok(status) => {
                            log::warn!("collector exited ({status}); restarting")
                        }
                        Err(err) => log::warn!("collector wait failed: {err}"),
                    }
                    if started.elapsed() > COLLECTOR_HEALTHY_RUN {
                        backoff = COLLECTOR_START_BACKOFF;
                    }
                }
                Err(err) => {
                    log::error!("failed to start collector: {err}");
                }
            }
            if !self.sleep_interruptible(backoff) {
                break;
            }
            backoff = (backoff * 2).min(COLLECTOR_MAX_BACKOFF);
        }
    }

    fn spawn_collector(&self) -> std::io::Result<Child> {
        use std::os::unix::process::CommandExt;

        let mut cmd = Command::new(&self.collector_path);
        cmd.arg("-s").arg(&self.input_socket);
        if let Some(config) = &self.collector_config {
            cmd.arg("-c").arg(config);
        }
        if self.netlink_only {
            cmd.arg("-n");
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        unsafe {
            // the daemon blocks its handled signals process-wide; the
            // collector must not inherit that mask or SIGTERM won't reach it
            cmd.pre_exec(|| {
                let _ = nix::sys::signal::SigSet::all().thread_unblock();
                Ok(())
            });
        }
        log::info!("starting collector {}", self.collector_path.display());
        cmd.spawn()
    }

    fn forward_stderr(&self, child: &mut Child) {
        let Some(stderr) = child.stderr.take() else {
            return;
        };
        let name = self
            .collector_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "collector".to_string());
        let _ = std::thread::Builder::new()
            .name("collector-log".to_string())
            .spawn(move || {
                for line in BufReader::new(stderr).lines() {
                    match line {
                        Ok(line) => log::info!("{name}: {line}"),
                        Err(_) => break,
                    }
                }
            });
    }

    fn sleep_interruptible(&self, total: Duration) -> bool {
        let mut remaining = total;
        while remaining > Duration::ZERO {
            if self.stopping.load(Ordering::Relaxed) {
                return false;
            }
            let step = remaining.min(Duration::from_millis(100));
            std::thread::sleep(step);
            remaining -= step;
        }
        true
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RulesStatus {
    pub desired: usize,
    pub loaded: usize,
    pub missing: usize,
    pub last_error: Option<String>,
}

/// Periodically reconciles the desired audit rule files against the
/// kernel's view (`auditctl -l`), appending missing rules.
pub struct RulesMonitor {
    rules_dir: PathBuf,
    auditctl_path: PathBuf,
    status: Arc<Mutex<RulesStatus>>,
    stopping: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl RulesMonitor {
    pub fn new(rules_dir: &Path, auditctl_path: &Path) -> Arc<RulesMonitor> {
        Arc::new(RulesMonitor {
            rules_dir: rules_dir.to_path_buf(),
            auditctl_path: auditctl_path.to_path_buf(),
            status: Arc::new(Mutex::new(RulesStatus::default())),
            stopping: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        })
    }

    pub fn status(&self) -> RulesStatus {
        self.status.lock().unwrap().clone()
    }

    pub fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        let monitor = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("rules".to_string())
            .spawn(move || monitor.run())?;
        *self.thread.lock().unwrap() = Some(handle);
        Ok(())
    }

    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Relaxed);
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    fn run(&self) {
        loop {
            self.reconcile();
            let mut remaining = RULES_CHECK_INTERVAL;
            while remaining > Duration::ZERO {
                if self.stopping.load(Ordering::Relaxed) {
                    return;
                }
                let step = remaining.min(Duration::from_millis(100));
                std::thread::sleep(step);
                remaining -= step;
            }
        }
    }

    fn reconcile(&self) {
        let desired = match load_desired_rules(&self.rules_dir) {
            Ok(rules) => rules,
            Err(err) => {
                let mut status = self.status.lock().unwrap();
                status.last_error = Some(err.to_string());
                return;
            }
        };
        let kernel = match self.kernel_rules() {
            Ok(rules) => rules,
            Err(err) => {
                let mut status = self.status.lock().unwrap();
                status.desired = desired.len();
                status.last_error = Some(err);
                return;
            }
        };
        let missing = diff_rules(&desired, &kernel);
        if !missing.is_empty() {
            log::info!("loading {} missing audit rules", missing.len());
        }
        let mut errors = None;
        for rule in &missing {
            if let Err(err) = self.apply_rule(rule) {
                log::warn!("failed to load audit rule '{rule}': {err}");
                errors = Some(err);
            }
        }
        let mut status = self.status.lock().unwrap();
        status.desired = desired.len();
        status.loaded = kernel.len();
        status.missing = missing.len();
        status.last_error = errors;
    }

    fn kernel_rules(&self) -> Result<Vec<String>, String> {
        let output = Command::new(&self.auditctl_path)
            .arg("-l")
            .output()
            .map_err(|e| format!("auditctl failed to run: {e}"))?;
        if !output.status.success() {
            return Err(format!("auditctl -l exited with {}", output.status));
        }
        let text = String::from_utf8_lossy(&output.stdout);
        Ok(text
            .lines()
            .map(normalize_rule)
            .filter(|line| !line.is_empty() && *line != "No rules")
            .collect())
    }

    fn apply_rule(&self, rule: &str) -> Result<(), String> {
        let args: Vec<&str> = rule.split_whitespace().collect();
        let output = Command::new(&self.auditctl_path)
            .args(&args)
            .output()
            .map_err(|e| format!("auditctl failed to run: {e}"))?;
        if !output.status.success() {
            return Err(format!(
                "auditctl exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(())
    }
}

/// Read every rules file in the directory; one rule per line, `#` comments.
pub fn load_desired_rules(rules_dir: &Path) -> std::io::Result<Vec<String>> {
    let mut rules = Vec::new();
    let entries = match std::fs::read_dir(rules_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(rules),
        Err(err) => return Err(err),
    };
    let mut paths: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    paths.sort();
    for path in paths {
        let text = std::fs::read_to_string(&path)?;
        for line in text.lines() {
            let rule = normalize_rule(line);
            if rule.is_empty() || rule.starts_with('#') {
                continue;
            }
            rules.push(rule);
        }
    }
    Ok(rules)
}

/// Rules that the kernel does not already carry.
pub fn diff_rules(desired: &[String], kernel: &[String]) -> Vec<String> {
    desired
        .iter()
        .filter(|rule| !kernel.contains(rule))
        .cloned()
        .collect()
}

fn normalize_rule(line: &str) -> String {
    line.split_whitespace().collect::<Vec<&str>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn desired_rules_skip_comments_and_blanks() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("10-base.rules"),
            "# watch execs\n-a always,exit -S execve\n\n  # indented comment\n-w /etc/passwd -p wa\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("20-extra.rules"), "-w /etc/shadow -p wa\n").unwrap();
        let rules = load_desired_rules(dir.path()).unwrap();
        assert_eq!(
            rules,
            [
                "-a always,exit -S execve",
                "-w /etc/passwd -p wa",
                "-w /etc/shadow -p wa",
            ]
        );
    }

    #[test]
    fn missing_rules_are_diffed_after_normalization() {
        let desired = vec![
            "-a always,exit -S execve".to_string(),
            "-w /etc/passwd -p wa".to_string(),
        ];
        let kernel = vec![normalize_rule("-a   always,exit  -S execve")];
        let missing = diff_rules(&desired, &kernel);
        assert_eq!(missing, ["-w /etc/passwd -p wa"]);
    }

    #[test]
    fn missing_rules_dir_is_empty_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let rules = load_desired_rules(&dir.path().join("does-not-exist")).unwrap();
        assert!(rules.is_empty());
    }

    #[test]
    fn absent_collector_binary_is_skipped() {
        let monitor = CollectionMonitor::new(
            Path::new("/does/not/exist"),
            None,
            Path::new("/tmp/input.socket"),
            false,
        );
        monitor.start().unwrap();
        assert!(!monitor.is_running());
        monitor.stop();
    }
}
