use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::Config;
use crate::event::{EventView, GapReport, EVENT_FLAG_SYSCALL};
use crate::filters::{Bitset256, FiltersEngine, ProcFilterSpec};
use crate::metrics::Metrics;
use crate::proctree::ProcessTree;
use crate::queue::{MsgType, Queue, ReadResult};
use crate::sink::{create_sink, MessageSink};
use crate::tables::RECORD_TYPE_SYSCALL;
use crate::transform::{EventTransformer, WriterConfig};
use crate::userdb::UserDb;

const START_SLEEP_PERIOD: Duration = Duration::from_secs(1);
const MAX_SLEEP_PERIOD: Duration = Duration::from_secs(60);

/// Transport surface an output writes to.
pub trait OutputWriter: Send {
    fn is_open(&self) -> bool;
    fn open(&mut self) -> io::Result<()>;
    fn close(&mut self);
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;
}

pub struct UnixSocketWriter {
    path: PathBuf,
    stream: Option<UnixStream>,
}

impl UnixSocketWriter {
    pub fn new(path: &Path) -> UnixSocketWriter {
        UnixSocketWriter {
            path: path.to_path_buf(),
            stream: None,
        }
    }
}

impl OutputWriter for UnixSocketWriter {
    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn open(&mut self) -> io::Result<()> {
        let stream = UnixStream::connect(&self.path)?;
        stream.set_write_timeout(Some(Duration::from_secs(10)))?;
        self.stream = Some(stream);
        Ok(())
    }

    fn close(&mut self) {
        self.stream = None;
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match self.stream.as_mut() {
            Some(stream) => stream.write_all(data),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "not open")),
        }
    }
}

pub struct StdoutWriter;

impl OutputWriter for StdoutWriter {
    fn is_open(&self) -> bool {
        true
    }

    fn open(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn close(&mut self) {}

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let stdout = io::stdout();
        let mut lock = stdout.lock();
        lock.write_all(data)?;
        lock.flush()
    }
}

/// Per-output persistent cursor: 8-byte little-endian last-committed id,
/// rewritten atomically.
pub struct CursorFile {
    path: PathBuf,
}

impl CursorFile {
    pub fn new(cursor_dir: &Path, name: &str) -> CursorFile {
        CursorFile {
            path: cursor_dir.join(name),
        }
    }

    pub fn read(&self) -> u64 {
        match fs::read(&self.path) {
            Ok(data) if data.len() >= 8 => u64::from_le_bytes(data[..8].try_into().unwrap()),
            _ => 0,
        }
    }

    pub fn write(&self, id: u64) -> io::Result<()> {
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, id.to_le_bytes())?;
        fs::rename(&tmp, &self.path)
    }

    pub fn remove(&self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Extract the syscall name an event describes, if any.
fn event_syscall(event: &EventView) -> Option<String> {
    if event.flags() & EVENT_FLAG_SYSCALL == 0 {
        return None;
    }
    let record = event.record_of_type(RECORD_TYPE_SYSCALL)?;
    let field = record.field_by_name("syscall")?;
    let interp = field.interp_value();
    if interp.is_empty() {
        Some(field.raw_value().to_string())
    } else {
        Some(interp.to_string())
    }
}

struct OutputWorker {
    name: String,
    queue: Arc<Queue>,
    cursor: CursorFile,
    sink: Box<dyn MessageSink>,
    transformer: EventTransformer,
    engine: Arc<FiltersEngine>,
    tree: Option<Arc<ProcessTree>>,
    filter_mask: Bitset256,
    metrics: Arc<Metrics>,
    stopping: Arc<AtomicBool>,
}

impl OutputWorker {
    fn run(mut self) {
        log::info!("output '{}' started", self.name);
        let mut buf = Vec::new();
        while !self.stopping.load(Ordering::Relaxed) {
            let info = match self
                .queue
                .get(&self.name, &mut buf, Some(Duration::from_millis(100)))
            {
                ReadResult::Item(info) => info,
                ReadResult::Timeout => continue,
                ReadResult::Closed => break,
            };
            let delivered = match info.msg_type {
                MsgType::Event => self.handle_event(&buf),
                MsgType::EventsGap => self.handle_gap(&buf),
            };
            if !delivered {
                break;
            }
            self.queue.checkpoint(&self.name, info.id);
            if let Err(err) = self.cursor.write(info.id) {
                log::error!("output '{}': cursor write failed: {err}", self.name);
            }
        }
        log::info!("output '{}' stopped", self.name);
    }

    fn handle_event(&mut self, payload: &[u8]) -> bool {
        let Some(event) = EventView::new(payload) else {
            log::warn!("output '{}': skipping undecodable event", self.name);
            return true;
        };
        if self.is_event_filtered(&event) {
            self.metrics.inc_events_filtered();
            return true;
        }
        self.send(|worker, sink| worker.transformer.process_event(&event, sink))
    }

    fn handle_gap(&mut self, payload: &[u8]) -> bool {
        let Some(gap) = GapReport::decode(payload) else {
            return true;
        };
        self.send(|worker, sink| worker.transformer.process_gap(&gap, sink))
    }

    fn is_event_filtered(&self, event: &EventView) -> bool {
        let Some(tree) = &self.tree else {
            return false;
        };
        if self.filter_mask.none() {
            return false;
        }
        let Some(syscall) = event_syscall(event) else {
            return false;
        };
        let flags = tree.get_info_for_pid(event.pid()).map(|item| item.flags());
        self.engine.is_event_filtered(&syscall, flags, self.filter_mask)
    }

    /// Write one message set, reconnecting with backoff on sink errors.
    /// Returns false when the worker should stop instead.
    fn send<F>(&mut self, mut emit: F) -> bool
    where
        F: FnMut(&OutputWorker, &mut dyn MessageSink) -> io::Result<()>,
    {
        let mut sleep_period = START_SLEEP_PERIOD;
        loop {
            if self.stopping.load(Ordering::Relaxed) {
                return false;
            }
            if !self.sink.is_open() {
                if let Err(err) = self.sink.open() {
                    log::info!(
                        "output '{}': connect failed ({err}); retrying in {}s",
                        self.name,
                        sleep_period.as_secs()
                    );
                    if !self.sleep_interruptible(sleep_period) {
                        return false;
                    }
                    sleep_period = (sleep_period * 2).min(MAX_SLEEP_PERIOD);
                    continue;
                }
                sleep_period = START_SLEEP_PERIOD;
            }
            let mut sink = std::mem::replace(&mut self.sink, Box::new(NullSink));
            let result = emit(self, sink.as_mut());
            self.sink = sink;
            match result {
                Ok(()) => {
                    self.metrics.inc_messages_sent();
                    return true;
                }
                Err(err) => {
                    log::warn!("output '{}': write failed ({err}); reconnecting", self.name);
                    self.metrics.inc_send_errors();
                    self.sink.cancel_message();
                    self.sink.close();
                    if !self.sleep_interruptible(sleep_period) {
                        return false;
                    }
                    sleep_period = (sleep_period * 2).min(MAX_SLEEP_PERIOD);
                }
            }
        }
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
        !self.stopping.load(Ordering::Relaxed)
    }
}

/// Placeholder sink swapped in while a message is being emitted.
struct NullSink;

impl MessageSink for NullSink {
    fn begin_message(&mut self, _tag: &str, _sec: u64, _msec: u32) {}
    fn add_str_field(&mut self, _name: &str, _value: &str) {}
    fn add_i64_field(&mut self, _name: &str, _value: i64) {}
    fn add_u64_field(&mut self, _name: &str, _value: u64) {}
    fn add_bool_field(&mut self, _name: &str, _value: bool) {}
    fn add_timestamp_field(&mut self, _name: &str, _sec: u64, _msec: u32) {}
    fn add_time_field(&mut self, _name: &str, _sec: u64, _msec: u32) {}
    fn end_message(&mut self) -> io::Result<()> {
        Ok(())
    }
    fn cancel_message(&mut self) {}
    fn is_open(&self) -> bool {
        false
    }
    fn open(&mut self) -> io::Result<()> {
        Ok(())
    }
    fn close(&mut self) {}
}

struct OutputHandle {
    stopping: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    config_text: String,
    specs: Vec<ProcFilterSpec>,
}

/// Everything an output worker needs from the rest of the daemon.
#[derive(Clone)]
pub struct OutputsContext {
    pub queue: Arc<Queue>,
    pub user_db: Option<Arc<UserDb>>,
    pub tree: Option<Arc<ProcessTree>>,
    pub engine: Arc<FiltersEngine>,
    pub metrics: Arc<Metrics>,
}

/// Loads per-output config files and supervises one worker thread per
/// output.
pub struct Outputs {
    ctx: OutputsContext,
    outconf_dir: PathBuf,
    cursor_dir: PathBuf,
    allowed_socket_dirs: Mutex<Vec<String>>,
    outputs: Mutex<HashMap<String, OutputHandle>>,
}

impl Outputs {
    pub fn new(
        ctx: OutputsContext,
        outconf_dir: &Path,
        cursor_dir: &Path,
        allowed_socket_dirs: Vec<String>,
    ) -> Outputs {
        Outputs {
            ctx,
            outconf_dir: outconf_dir.to_path_buf(),
            cursor_dir: cursor_dir.to_path_buf(),
            allowed_socket_dirs: Mutex::new(allowed_socket_dirs),
            outputs: Mutex::new(HashMap::new()),
        }
    }

    pub fn start(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.cursor_dir)?;
        let configs = self.read_config_dir();
        let mut outputs = self.outputs.lock().unwrap();
        for (name, text) in configs {
            match self.start_output(&name, &text) {
                Ok(handle) => {
                    outputs.insert(name, handle);
                }
                Err(err) => log::error!("output '{name}' not started: {err}"),
            }
        }
        self.ctx.metrics.set_active_outputs(outputs.len());
        Ok(())
    }

    /// Apply a changed config directory: stop removed or changed outputs,
    /// start new or changed ones.
    pub fn reload(&self, allowed_socket_dirs: Vec<String>) {
        let configs = self.read_config_dir();
        let mut outputs = self.outputs.lock().unwrap();

        let gone: Vec<String> = outputs
            .keys()
            .filter(|name| !configs.contains_key(*name))
            .cloned()
            .collect();
        let changed: Vec<String> = outputs
            .iter()
            .filter(|(name, handle)| {
                configs
                    .get(*name)
                    .map(|text| *text != handle.config_text)
                    .unwrap_or(false)
            })
            .map(|(name, _)| name.clone())
            .collect();
        for name in gone.iter().chain(changed.iter()) {
            if let Some(handle) = outputs.remove(name) {
                log::info!("stopping output '{name}'");
                self.stop_output(name, handle);
            }
        }

        // allowed socket dirs may themselves have changed
        *self.allowed_socket_dirs.lock().unwrap() = allowed_socket_dirs;
        for (name, text) in configs {
            if outputs.contains_key(&name) {
                continue;
            }
            match self.start_output(&name, &text) {
                Ok(handle) => {
                    outputs.insert(name, handle);
                }
                Err(err) => log::error!("output '{name}' not started: {err}"),
            }
        }
        self.ctx.metrics.set_active_outputs(outputs.len());
    }

    pub fn stop(&self) {
        let mut outputs = self.outputs.lock().unwrap();
        for (name, handle) in outputs.drain() {
            self.stop_output(&name, handle);
        }
    }

    pub fn cursor_positions(&self) -> Vec<(String, u64)> {
        let outputs = self.outputs.lock().unwrap();
        outputs
            .keys()
            .map(|name| {
                (
                    name.clone(),
                    self.ctx.queue.cursor_position(name).unwrap_or(0),
                )
            })
            .collect()
    }

    fn read_config_dir(&self) -> HashMap<String, String> {
        let mut configs = HashMap::new();
        let entries = match fs::read_dir(&self.outconf_dir) {
            Ok(entries) => entries,
            Err(err) => {
                log::warn!(
                    "cannot read output config dir {}: {err}",
                    self.outconf_dir.display()
                );
                return configs;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with('.') || name.ends_with(".tmp") {
                continue;
            }
            match fs::read_to_string(&path) {
                Ok(text) => {
                    configs.insert(name.to_string(), text);
                }
                Err(err) => log::warn!("cannot read output config {}: {err}", path.display()),
            }
        }
        configs
    }

    fn start_output(&self, name: &str, text: &str) -> Result<OutputHandle, String> {
        let config = Config::parse(text).map_err(|e| e.to_string())?;
        let writer_config = WriterConfig::load(&config)?;
        let tag = config.string_or("tag", name);
        let format = config.string_or("output_format", "json");

        let writer: Box<dyn OutputWriter> = if config.string_or("output_type", "unix") == "stdout"
        {
            Box::new(StdoutWriter)
        } else {
            let socket = config
                .get_string("output_socket")
                .map_err(|_| "missing 'output_socket'".to_string())?;
            let allowed = self.allowed_socket_dirs.lock().unwrap();
            if !allowed.iter().any(|dir| socket.starts_with(dir.as_str())) {
                return Err(format!(
                    "socket path '{socket}' is not under an allowed output socket dir"
                ));
            }
            Box::new(UnixSocketWriter::new(Path::new(&socket)))
        };

        let sink = create_sink(&format, writer, &config)
            .ok_or_else(|| format!("unknown output_format '{format}'"))?;

        let mut specs = Vec::new();
        let mut filter_mask = Bitset256::new();
        if config.has_key("process_filters") {
            let value = config.get_json("process_filters").map_err(|e| e.to_string())?;
            specs = crate::filters::parse_filter_specs(&value)?;
            filter_mask = self.ctx.engine.add_filter_list(&specs, name);
            if let Some(tree) = &self.ctx.tree {
                tree.update_flags();
            }
        }

        let cursor = CursorFile::new(&self.cursor_dir, name);
        self.ctx.queue.register_cursor(name, cursor.read());

        let transformer = EventTransformer::new(
            Arc::new(writer_config),
            tag,
            self.ctx.user_db.clone(),
        );
        let stopping = Arc::new(AtomicBool::new(false));
        let worker = OutputWorker {
            name: name.to_string(),
            queue: Arc::clone(&self.ctx.queue),
            cursor,
            sink,
            transformer,
            engine: Arc::clone(&self.ctx.engine),
            tree: self.ctx.tree.clone(),
            filter_mask,
            metrics: Arc::clone(&self.ctx.metrics),
            stopping: Arc::clone(&stopping),
        };
        let thread = std::thread::Builder::new()
            .name(format!("output-{name}"))
            .spawn(move || worker.run())
            .map_err(|e| e.to_string())?;

        Ok(OutputHandle {
            stopping,
            thread: Some(thread),
            config_text: text.to_string(),
            specs,
        })
    }

    fn stop_output(&self, name: &str, mut handle: OutputHandle) {
        handle.stopping.store(true, Ordering::Relaxed);
        if let Some(thread) = handle.thread.take() {
            let _ = thread.join();
        }
        if !handle.specs.is_empty() {
            self.ctx.engine.remove_filter_list(&handle.specs, name);
            if let Some(tree) = &self.ctx.tree {
                tree.update_flags();
            }
        }
        // the cursor file stays so a re-added output resumes where it left
        // off; only the live registration goes away
        self.ctx.queue.remove_cursor(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventBuilder;
    use crate::queue::MIN_QUEUE_SIZE;
    use crate::sink::register_builtin_sinks;
    use crate::tables::FieldType;
    use std::io::Read;
    use std::os::unix::net::UnixListener;

    fn push_event(queue: &Arc<Queue>, serial: u64, syscall_interp: &str) {
        let mut builder = EventBuilder::new(Arc::clone(queue));
        builder.begin(1600000000, 0, serial).unwrap();
        builder.set_pid(4242);
        builder.set_flags(EVENT_FLAG_SYSCALL);
        builder
            .add_record(1300, "SYSCALL", "syscall=59 exe=\"/bin/x\"")
            .unwrap();
        builder
            .add_field("syscall", "59", Some(syscall_interp), FieldType::Syscall)
            .unwrap();
        builder
            .add_field("exe", "\"/bin/x\"", None, FieldType::Escaped)
            .unwrap();
        builder.end().unwrap();
    }

    fn read_frames(stream: &mut dyn Read, expect: usize) -> Vec<serde_json::Value> {
        let mut data = Vec::new();
        let mut chunk = [0u8; 4096];
        let mut out = Vec::new();
        while out.len() < expect {
            let n = stream.read(&mut chunk).unwrap();
            if n == 0 {
                break;
            }
            data.extend_from_slice(&chunk[..n]);
            out = crate::sink::test_support::deframe_partial(&data);
        }
        out.into_iter()
            .map(|frame| serde_json::from_slice(&frame).unwrap())
            .collect()
    }

    fn write_output_conf(dir: &Path, name: &str, socket: &Path) {
        let text = format!(
            "output_format = json\noutput_socket = {}\ntag = test\n",
            socket.display()
        );
        fs::write(dir.join(name), text).unwrap();
    }

    #[test]
    fn cursor_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cursor = CursorFile::new(dir.path(), "out1");
        assert_eq!(cursor.read(), 0);
        cursor.write(77).unwrap();
        assert_eq!(cursor.read(), 77);
        cursor.write(78).unwrap();
        assert_eq!(CursorFile::new(dir.path(), "out1").read(), 78);
    }

    #[test]
    fn worker_delivers_and_checkpoints() {
        register_builtin_sinks();
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(Queue::open(&dir.path().join("q.dat"), MIN_QUEUE_SIZE).unwrap());
        let socket = dir.path().join("sock");
        let listener = UnixListener::bind(&socket).unwrap();

        let outconf = dir.path().join("outconf");
        let cursors = dir.path().join("outputs");
        fs::create_dir_all(&outconf).unwrap();
        write_output_conf(&outconf, "main", &socket);

        let ctx = OutputsContext {
            queue: Arc::clone(&queue),
            user_db: None,
            tree: None,
            engine: Arc::new(FiltersEngine::new()),
            metrics: Arc::new(Metrics::new()),
        };
        let outputs = Outputs::new(
            ctx,
            &outconf,
            &cursors,
            vec![dir.path().display().to_string()],
        );
        outputs.start().unwrap();

        push_event(&queue, 1, "execve");
        push_event(&queue, 2, "open");

        let (mut stream, _) = listener.accept().unwrap();
        let msgs = read_frames(&mut stream, 2);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0]["serial"], 1);
        assert_eq!(msgs[1]["serial"], 2);

        // cursor advances once delivery is acknowledged by the write
        let cursor = CursorFile::new(&cursors, "main");
        for _ in 0..50 {
            if cursor.read() >= 2 {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(cursor.read() >= 2);
        outputs.stop();
    }

    #[test]
    fn worker_reconnects_and_redelivers() {
        register_builtin_sinks();
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(Queue::open(&dir.path().join("q.dat"), MIN_QUEUE_SIZE).unwrap());
        let socket = dir.path().join("sock");
        let listener = UnixListener::bind(&socket).unwrap();

        let outconf = dir.path().join("outconf");
        fs::create_dir_all(&outconf).unwrap();
        write_output_conf(&outconf, "main", &socket);

        let ctx = OutputsContext {
            queue: Arc::clone(&queue),
            user_db: None,
            tree: None,
            engine: Arc::new(FiltersEngine::new()),
            metrics: Arc::new(Metrics::new()),
        };
        let outputs = Outputs::new(
            ctx,
            &outconf,
            &dir.path().join("outputs"),
            vec![dir.path().display().to_string()],
        );
        outputs.start().unwrap();

        push_event(&queue, 1, "execve");
        let (mut stream, _) = listener.accept().unwrap();
        let msgs = read_frames(&mut stream, 1);
        assert_eq!(msgs[0]["serial"], 1);
        // drop the connection; the worker must reconnect and keep going
        drop(stream);
        push_event(&queue, 2, "open");

        let (mut stream, _) = listener.accept().unwrap();
        let msgs = read_frames(&mut stream, 1);
        assert_eq!(msgs[0]["serial"], 2);
        outputs.stop();
    }

    #[test]
    fn disallowed_socket_dir_is_rejected() {
        register_builtin_sinks();
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(Queue::open(&dir.path().join("q.dat"), MIN_QUEUE_SIZE).unwrap());
        let outconf = dir.path().join("outconf");
        fs::create_dir_all(&outconf).unwrap();
        write_output_conf(&outconf, "bad", Path::new("/elsewhere/sock"));

        let ctx = OutputsContext {
            queue,
            user_db: None,
            tree: None,
            engine: Arc::new(FiltersEngine::new()),
            metrics: Arc::new(Metrics::new()),
        };
        let outputs = Outputs::new(
            ctx,
            &outconf,
            &dir.path().join("outputs"),
            vec!["/allowed/".to_string()],
        );
        outputs.start().unwrap();
        assert!(outputs.cursor_positions().is_empty());
    }

    #[test]
    fn reload_stops_removed_outputs() {
        register_builtin_sinks();
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(Queue::open(&dir.path().join("q.dat"), MIN_QUEUE_SIZE).unwrap());
        let socket = dir.path().join("sock");
        let _listener = UnixListener::bind(&socket).unwrap();
        let outconf = dir.path().join("outconf");
        fs::create_dir_all(&outconf).unwrap();
        write_output_conf(&outconf, "main", &socket);

        let ctx = OutputsContext {
            queue: Arc::clone(&queue),
            user_db: None,
            tree: None,
            engine: Arc::new(FiltersEngine::new()),
            metrics: Arc::new(Metrics::new()),
        };
        let allowed = vec![dir.path().display().to_string()];
        let outputs = Outputs::new(ctx, &outconf, &dir.path().join("outputs"), allowed.clone());
        outputs.start().unwrap();
        assert_eq!(outputs.cursor_positions().len(), 1);

        fs::remove_file(outconf.join("main")).unwrap();
        outputs.reload(allowed);
        assert!(outputs.cursor_positions().is_empty());
        assert!(queue.cursor_names().is_empty());
        outputs.stop();
    }
}
