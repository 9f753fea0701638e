use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use log::{error, info, warn};

use aufluxd::config::Config;
use aufluxd::filters::FiltersEngine;
use aufluxd::inputs::Inputs;
use aufluxd::lockfile::LockFile;
use aufluxd::metrics::{self, Metrics};
use aufluxd::output::{Outputs, OutputsContext};
use aufluxd::parser::RawEventParser;
use aufluxd::proctree::{ProcessNotify, ProcessTree};
use aufluxd::queue::Queue;
use aufluxd::sink;
use aufluxd::status::{StatusServer, StatusState};
use aufluxd::supervise::{CollectionMonitor, RulesMonitor};
use aufluxd::userdb::UserDb;

const DEFAULT_CONFIG: &str = "/etc/auflux/aufluxd.conf";
const DEFAULT_OUTCONF_DIR: &str = "/etc/auflux/outconf.d";
const DEFAULT_RULES_DIR: &str = "/etc/auflux/rules.d";
const DEFAULT_DATA_DIR: &str = "/var/lib/auflux";
const DEFAULT_RUN_DIR: &str = "/run/auflux";
const DEFAULT_COLLECTOR: &str = "/usr/libexec/auflux/aufluxcollect";
const DEFAULT_AUDITCTL: &str = "/sbin/auditctl";
const DEFAULT_QUEUE_SIZE: u64 = 10 * 1024 * 1024;

#[derive(Parser, Debug)]
#[command(name = "aufluxd")]
#[command(about = "Audit event collection and forwarding daemon")]
struct Args {
    /// Path to config file
    #[arg(short = 'c', long, value_name = "PATH", default_value = DEFAULT_CONFIG)]
    config: PathBuf,
    /// Collect directly from the kernel netlink channel, skipping auditd
    #[arg(short = 'n', long)]
    netlink_only: bool,
}

/// Split the `:`-separated allowed socket dir list, requiring absolute paths
/// and normalizing a trailing slash.
fn parse_socket_dirs(value: &str) -> Result<Vec<String>, String> {
    let mut dirs = Vec::new();
    for part in value.split(':') {
        if part.is_empty() {
            continue;
        }
        if part.len() < 2 || !part.starts_with('/') {
            return Err(format!("invalid allowed socket dir '{part}'"));
        }
        let mut dir = part.to_string();
        if !dir.ends_with('/') {
            dir.push('/');
        }
        dirs.push(dir);
    }
    if dirs.is_empty() {
        return Err("allowed socket dir list is empty".to_string());
    }
    Ok(dirs)
}

fn load_config(path: &Path) -> Config {
    match Config::load(path) {
        Ok(config) => config,
        Err(err) => {
            warn!("config {} not loaded ({err}); using defaults", path.display());
            Config::new()
        }
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = if args.config.exists() {
        Config::load(&args.config)
            .with_context(|| format!("failed to load config {}", args.config.display()))?
    } else {
        warn!(
            "config file {} not found; using defaults",
            args.config.display()
        );
        Config::new()
    };

    let data_dir = PathBuf::from(config.string_or("data_dir", DEFAULT_DATA_DIR));
    let run_dir = PathBuf::from(config.string_or("run_dir", DEFAULT_RUN_DIR));
    let outconf_dir = PathBuf::from(config.string_or("outconf_dir", DEFAULT_OUTCONF_DIR));
    let rules_dir = PathBuf::from(config.string_or("rules_dir", DEFAULT_RULES_DIR));
    let collector_path = PathBuf::from(config.string_or("collector_path", DEFAULT_COLLECTOR));
    let auditctl_path = PathBuf::from(config.string_or("auditctl_path", DEFAULT_AUDITCTL));
    let user_db_dir = PathBuf::from(config.string_or("user_db_dir", "/etc"));
    let collector_config = config
        .get_string("collector_config_path")
        .ok()
        .map(PathBuf::from);

    let queue_file = PathBuf::from(
        config.string_or("queue_file", &data_dir.join("queue.dat").display().to_string()),
    );
    let queue_size = config.u64_or("queue_size", DEFAULT_QUEUE_SIZE);
    let lock_file = PathBuf::from(
        config.string_or("lock_file", &data_dir.join("aufluxd.lock").display().to_string()),
    );
    let cursor_dir = data_dir.join("outputs");
    let input_socket = PathBuf::from(config.string_or(
        "input_socket_path",
        &run_dir.join("input.socket").display().to_string(),
    ));
    let status_socket = PathBuf::from(config.string_or(
        "status_socket_path",
        &run_dir.join("status.socket").display().to_string(),
    ));
    let idle_flush = Duration::from_millis(config.u64_or("idle_flush_ms", 250));
    let max_serial_skew = config.u64_or("max_serial_skew", 0);

    let allowed_socket_dirs = config
        .get_string("allowed_output_socket_dirs")
        .context("required config parameter missing: allowed_output_socket_dirs")?;
    let allowed_socket_dirs = parse_socket_dirs(&allowed_socket_dirs)
        .map_err(|e| anyhow::anyhow!("invalid 'allowed_output_socket_dirs': {e}"))?;

    info!("aufluxd starting");

    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("cannot create data dir {}", data_dir.display()))?;

    let (singleton_lock, unclean) =
        LockFile::acquire(&lock_file).context("failed to acquire singleton lock")?;
    if unclean {
        warn!("previous instance may have crashed; resetting queue as a precaution");
        if queue_file.exists() {
            std::fs::remove_file(&queue_file)
                .with_context(|| format!("failed to remove {}", queue_file.display()))?;
        }
        if let Ok(entries) = std::fs::read_dir(&cursor_dir) {
            for entry in entries.flatten() {
                if let Err(err) = std::fs::remove_file(entry.path()) {
                    error!("failed to remove cursor {}: {err}", entry.path().display());
                }
            }
        }
    }

    // block the handled signals before any thread exists so every thread
    // inherits the mask and only the signal thread sees them
    let mut sigset = nix::sys::signal::SigSet::empty();
    for sig in [
        nix::sys::signal::Signal::SIGINT,
        nix::sys::signal::Signal::SIGTERM,
        nix::sys::signal::Signal::SIGQUIT,
        nix::sys::signal::Signal::SIGHUP,
    ] {
        sigset.add(sig);
    }
    sigset.thread_block().context("failed to block signals")?;

    info!("opening queue {}", queue_file.display());
    let queue = Arc::new(Queue::open(&queue_file, queue_size)?);

    let metrics = Arc::new(Metrics::new());
    let stopping = Arc::new(AtomicBool::new(false));
    let metrics_thread = metrics::start_reporter(Arc::clone(&metrics), Arc::clone(&stopping));

    sink::register_builtin_sinks();

    let user_db = UserDb::new(&user_db_dir);
    user_db
        .start()
        .context("failed to start user database watcher")?;

    let engine = Arc::new(FiltersEngine::new());
    let tree = ProcessTree::new(Arc::clone(&user_db), Arc::clone(&engine));
    tree.populate();
    tree.start().context("failed to start process tree")?;
    let pnotify = ProcessNotify::new(Arc::clone(&tree));
    pnotify
        .start()
        .context("failed to start process connector listener")?;

    let outputs = Arc::new(Outputs::new(
        OutputsContext {
            queue: Arc::clone(&queue),
            user_db: Some(Arc::clone(&user_db)),
            tree: Some(Arc::clone(&tree)),
            engine: Arc::clone(&engine),
            metrics: Arc::clone(&metrics),
        },
        &outconf_dir,
        &cursor_dir,
        allowed_socket_dirs,
    ));
    outputs.start().context("failed to start outputs")?;

    // bind the input socket before the collector starts connecting to it
    let mut inputs =
        Inputs::new(&input_socket).context("failed to initialize the input socket")?;

    let collection = CollectionMonitor::new(
        &collector_path,
        collector_config.as_deref(),
        &input_socket,
        args.netlink_only,
    );
    collection
        .start()
        .context("failed to start collection monitor")?;

    let rules = RulesMonitor::new(&rules_dir, &auditctl_path);
    rules.start().context("failed to start rules monitor")?;

    let status = StatusServer::new(
        &status_socket,
        StatusState {
            queue: Arc::clone(&queue),
            outputs: Arc::clone(&outputs),
            rules: Some(Arc::clone(&rules)),
            collection: Some(Arc::clone(&collection)),
            metrics: Arc::clone(&metrics),
        },
    );
    status.start().context("failed to start status channel")?;

    let autosave_thread = {
        let queue = Arc::clone(&queue);
        std::thread::Builder::new()
            .name("autosave".to_string())
            .spawn(move || queue.autosave(128 * 1024, Duration::from_millis(250)))
            .context("failed to start queue autosave")?
    };

    // signal thread: INT/TERM/QUIT stop the daemon, HUP revalidates the
    // config and reloads the outputs
    let exiting = Arc::new(AtomicBool::new(false));
    let signal_thread = {
        let exiting = Arc::clone(&exiting);
        let outputs = Arc::clone(&outputs);
        let config_path = args.config.clone();
        std::thread::Builder::new()
            .name("signals".to_string())
            .spawn(move || loop {
                match sigset.wait() {
                    Ok(nix::sys::signal::Signal::SIGHUP) => {
                        info!("SIGHUP received; reloading outputs");
                        let config = load_config(&config_path);
                        let dirs = config
                            .get_string("allowed_output_socket_dirs")
                            .map_err(|e| e.to_string())
                            .and_then(|value| parse_socket_dirs(&value));
                        match dirs {
                            Ok(dirs) => outputs.reload(dirs),
                            Err(err) => {
                                error!("config error during reload: {err}; keeping old config")
                            }
                        }
                    }
                    Ok(sig) => {
                        info!("{} received; shutting down", sig.as_str());
                        exiting.store(true, Ordering::Relaxed);
                        return;
                    }
                    Err(nix::errno::Errno::EINTR) => continue,
                    Err(err) => {
                        error!("sigwait failed: {err}");
                        exiting.store(true, Ordering::Relaxed);
                        return;
                    }
                }
            })
            .context("failed to start signal thread")?
    };

    info!("starting input loop");
    let mut parser = RawEventParser::new(
        Arc::clone(&queue),
        Some(Arc::clone(&tree)),
        Arc::clone(&metrics),
        max_serial_skew,
    );
    let mut last_data = Instant::now();
    let mut queue_ok = true;
    while !exiting.load(Ordering::Relaxed) && queue_ok {
        match inputs.handle_data(Duration::from_millis(100), |chunk| {
            if !parser.process_data(chunk) {
                queue_ok = false;
            }
        }) {
            Ok(0) => {
                if last_data.elapsed() >= idle_flush {
                    queue_ok = parser.flush() && queue_ok;
                    last_data = Instant::now();
                }
            }
            Ok(_) => last_data = Instant::now(),
            Err(err) => {
                error!("input loop error: {err}");
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
    parser.flush();
    info!("input loop stopped");

    // leaves-first shutdown: outputs, then the queue and its autosaver,
    // then the enrichment sources, then the monitors
    outputs.stop();
    queue.close();
    let _ = autosave_thread.join();
    tree.stop();
    pnotify.stop();
    user_db.stop();
    status.stop();
    rules.stop();
    collection.stop();
    stopping.store(true, Ordering::Relaxed);
    let _ = metrics_thread.join();
    // wake the signal thread if shutdown came from a queue error
    if !exiting.load(Ordering::Relaxed) {
        exiting.store(true, Ordering::Relaxed);
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::this(),
            nix::sys::signal::Signal::SIGTERM,
        );
    }
    let _ = signal_thread.join();

    singleton_lock.release();
    info!("aufluxd exiting");
    Ok(())
}
