use std::sync::Arc;
use std::time::Instant;

use bytes::BytesMut;

use crate::event::{EventBuilder, GapReport, EVENT_FLAG_EXECVE, EVENT_FLAG_SYSCALL};
use crate::metrics::Metrics;
use crate::proctree::{Command, ProcessTree};
use crate::queue::{AllocResult, MsgType, Queue};
use crate::tables::{
    self, arch_to_machine, classify_field, FieldType, Machine, RECORD_TYPE_EOE,
    RECORD_TYPE_EXECVE, RECORD_TYPE_SYSCALL,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EventKey {
    sec: u64,
    msec: u32,
    serial: u64,
}

/// State extracted from the event being accumulated, for the process-tree
/// execve tap.
#[derive(Default)]
struct EventAccum {
    pid: i32,
    ppid: i32,
    uid: i32,
    gid: i32,
    exe: String,
    syscall: String,
    success: bool,
    has_syscall: bool,
    execve_args: Vec<String>,
}

impl EventAccum {
    fn reset(&mut self) {
        self.pid = -1;
        self.ppid = -1;
        self.uid = -1;
        self.gid = -1;
        self.exe.clear();
        self.syscall.clear();
        self.success = false;
        self.has_syscall = false;
        self.execve_args.clear();
    }
}

/// Tokenizes the textual audit stream into structured events.
///
/// Records sharing `(sec,msec,serial)` accumulate into one event; the event
/// seals when the serial changes, an `EOE` record arrives, or the input goes
/// idle. Serial discontinuities are reported as EVENTS_GAP queue records.
pub struct RawEventParser {
    queue: Arc<Queue>,
    builder: EventBuilder,
    tree: Option<Arc<ProcessTree>>,
    metrics: Arc<Metrics>,
    max_serial_skew: u64,
    buf: BytesMut,
    current: Option<EventKey>,
    last_sealed: Option<EventKey>,
    accum: EventAccum,
    malformed_since_report: u64,
    last_malformed_report: Instant,
}

impl RawEventParser {
    pub fn new(
        queue: Arc<Queue>,
        tree: Option<Arc<ProcessTree>>,
        metrics: Arc<Metrics>,
        max_serial_skew: u64,
    ) -> RawEventParser {
        RawEventParser {
            builder: EventBuilder::new(Arc::clone(&queue)),
            queue,
            tree,
            metrics,
            max_serial_skew,
            buf: BytesMut::with_capacity(64 * 1024),
            current: None,
            last_sealed: None,
            accum: EventAccum::default(),
            malformed_since_report: 0,
            last_malformed_report: Instant::now(),
        }
    }

    /// Feed raw bytes from the input pipe. Returns false once the queue is
    /// closed and parsing cannot continue.
    pub fn process_data(&mut self, data: &[u8]) -> bool {
        self.metrics.add_bytes(data.len() as u64);
        self.buf.extend_from_slice(data);
        while let Some(nl) = self.buf.iter().position(|b| *b == b'\n') {
            let line = self.buf.split_to(nl + 1);
            let line = &line[..nl];
            if line.is_empty() {
                continue;
            }
            match std::str::from_utf8(line) {
                Ok(text) => {
                    if !self.process_line(text) {
                        return false;
                    }
                }
                Err(_) => self.count_malformed(),
            }
        }
        // a record line that never terminates would grow the buffer forever
        if self.buf.len() > 1024 * 1024 {
            log::warn!("discarding {} bytes of unterminated input", self.buf.len());
            self.buf.clear();
            self.count_malformed();
        }
        true
    }

    /// Seal the in-progress event; called on idle and on shutdown.
    pub fn flush(&mut self) -> bool {
        self.seal()
    }

    fn process_line(&mut self, line: &str) -> bool {
        // resync at the record anchor, skipping e.g. audisp node prefixes
        let Some(anchor) = line.find("type=") else {
            self.count_malformed();
            return true;
        };
        let node = line[..anchor]
            .strip_prefix("node=")
            .map(|n| n.trim().trim_end_matches(' '));
        let rest = &line[anchor + 5..];
        let Some((type_name, rest)) = rest.split_once(' ') else {
            self.count_malformed();
            return true;
        };
        let Some(rest) = rest.trim_start().strip_prefix("msg=audit(") else {
            self.count_malformed();
            return true;
        };
        let Some((stamp, body)) = rest.split_once("):") else {
            self.count_malformed();
            return true;
        };
        let Some(key) = parse_stamp(stamp) else {
            self.count_malformed();
            return true;
        };

        let type_code = tables::record_type_code(type_name).unwrap_or(0);

        if self.current.map(|cur| cur != key).unwrap_or(false) && !self.seal() {
            return false;
        }

        if type_code == RECORD_TYPE_EOE {
            // explicit end of event; the terminator itself carries nothing
            return self.seal();
        }

        if self.current.is_none() {
            if !self.begin_event(key) {
                return false;
            }
        }

        self.metrics.inc_records();
        if self
            .add_record(type_code, type_name, node, body.trim_start())
            .is_err()
        {
            return false;
        }
        true
    }

    fn begin_event(&mut self, key: EventKey) -> bool {
        if let Some(last) = self.last_sealed {
            let backward = key.serial < last.serial;
            let skipped = key.serial > last.serial + 1 + self.max_serial_skew;
            if backward || skipped {
                let gap = if backward {
                    GapReport {
                        start_sec: key.sec,
                        start_msec: key.msec,
                        start_serial: key.serial,
                        end_sec: last.sec,
                        end_msec: last.msec,
                        end_serial: last.serial,
                    }
                } else {
                    GapReport {
                        start_sec: last.sec,
                        start_msec: last.msec,
                        start_serial: last.serial + 1,
                        end_sec: key.sec,
                        end_msec: key.msec,
                        end_serial: key.serial - 1,
                    }
                };
                if !self.commit_gap(gap) {
                    return false;
                }
            }
        }
        if self.builder.begin(key.sec, key.msec, key.serial).is_err() {
            return false;
        }
        self.current = Some(key);
        self.accum.reset();
        true
    }

    fn commit_gap(&mut self, gap: GapReport) -> bool {
        log::warn!(
            "audit event gap detected: serials {}..{}",
            gap.start_serial,
            gap.end_serial
        );
        self.metrics.inc_event_gaps();
        let payload = gap.encode();
        match self.queue.allocate(payload.len(), true, None) {
            AllocResult::Slot(mut slot) => {
                slot.write(&payload);
                self.queue.commit(slot, MsgType::EventsGap).is_some()
            }
            _ => false,
        }
    }

    fn add_record(
        &mut self,
        type_code: u32,
        type_name: &str,
        node: Option<&str>,
        body: &str,
    ) -> Result<(), ()> {
        self.builder
            .add_record(type_code, type_name, body)
            .map_err(|_| ())?;
        if let Some(node) = node {
            self.builder
                .add_field("node", node, None, FieldType::Unclassified)
                .map_err(|_| ())?;
        }

        let mut machine = Machine::Unknown;
        for (name, raw) in FieldTokenizer::new(body) {
            let ftype = classify_field(type_code, name);
            let interp = match ftype {
                FieldType::Arch => {
                    machine = arch_to_machine(raw);
                    Some(tables::interpret_arch(raw))
                }
                FieldType::Syscall => {
                    let interp = tables::interpret_syscall(machine, raw);
                    if type_code == RECORD_TYPE_SYSCALL {
                        self.accum.syscall = interp.clone();
                        self.accum.has_syscall = true;
                    }
                    Some(interp)
                }
                FieldType::Exit => tables::interpret_exit(raw),
                FieldType::Mode => Some(tables::interpret_mode(raw)),
                FieldType::Session => Some(tables::interpret_session(raw)),
                // uid/gid names resolve at emit time through the user db;
                // escaped and sockaddr values decode in the transformer
                _ => None,
            };
            if type_code == RECORD_TYPE_SYSCALL {
                self.note_syscall_field(name, raw);
            }
            if type_code == RECORD_TYPE_EXECVE {
                self.note_execve_field(name, raw);
            }
            if name == "pid" && self.builder.pid() == -1 {
                if let Ok(pid) = raw.parse() {
                    self.builder.set_pid(pid);
                }
            }
            self.builder
                .add_field(name, raw, interp.as_deref(), ftype)
                .map_err(|_| ())?;
        }

        if type_code == RECORD_TYPE_EXECVE && !self.accum.execve_args.is_empty() {
            let cmdline = self.build_cmdline();
            self.builder
                .add_field("cmdline", &cmdline, None, FieldType::Unclassified)
                .map_err(|_| ())?;
        }
        Ok(())
    }

    fn note_syscall_field(&mut self, name: &str, raw: &str) {
        match name {
            "pid" => self.accum.pid = raw.parse().unwrap_or(-1),
            "ppid" => self.accum.ppid = raw.parse().unwrap_or(-1),
            "uid" => self.accum.uid = raw.parse().unwrap_or(-1),
            "gid" => self.accum.gid = raw.parse().unwrap_or(-1),
            "exe" => self.accum.exe = raw.to_string(),
            "success" => self.accum.success = raw == "yes",
            _ => {}
        }
    }

    /// Collect `aN` / `aN[M]` argv pieces for cmdline reassembly.
    fn note_execve_field(&mut self, name: &str, raw: &str) {
        let rest = match name.strip_prefix('a') {
            Some(rest) if !rest.is_empty() => rest,
            _ => return,
        };
        let (index, chunked) = match rest.split_once('[') {
            Some((idx, _)) => (idx, true),
            None => (rest, false),
        };
        let Ok(index) = index.parse::<usize>() else {
            return;
        };
        if index >= 4096 {
            return;
        }
        if self.accum.execve_args.len() <= index {
            self.accum.execve_args.resize(index + 1, String::new());
        }
        if chunked {
            self.accum.execve_args[index].push_str(raw);
        } else {
            self.accum.execve_args[index] = raw.to_string();
        }
    }

    fn build_cmdline(&self) -> String {
        let mut out = String::new();
        for arg in &self.accum.execve_args {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(&unescape_arg(arg));
        }
        out
    }

    /// Commit the accumulated event and run the execve tap.
    fn seal(&mut self) -> bool {
        let Some(key) = self.current.take() else {
            return true;
        };
        if !self.builder.in_progress() {
            // the slot was lost to a queue closure mid-event
            return false;
        }
        let mut flags = 0u32;
        if self.accum.has_syscall {
            flags |= EVENT_FLAG_SYSCALL;
        }
        let is_execve = self.accum.has_syscall
            && self.accum.success
            && (self.accum.syscall == "execve" || self.accum.syscall == "execveat");
        if is_execve {
            flags |= EVENT_FLAG_EXECVE;
        }
        self.builder.set_flags(flags);
        match self.builder.end() {
            Ok(_) => {}
            Err(_) => return false,
        }
        self.metrics.inc_events();
        self.last_sealed = Some(key);

        if is_execve && self.accum.pid > 0 {
            if let Some(tree) = &self.tree {
                tree.enqueue(Command::Execve {
                    pid: self.accum.pid,
                    ppid: self.accum.ppid,
                    uid: self.accum.uid,
                    gid: self.accum.gid,
                    exe: unescape_arg(&self.accum.exe),
                    cmdline: self.build_cmdline(),
                });
            }
        }
        true
    }

    fn count_malformed(&mut self) {
        self.metrics.inc_malformed();
        self.malformed_since_report += 1;
        if self.last_malformed_report.elapsed().as_secs() >= 60 {
            log::warn!(
                "dropped {} malformed audit records in the last minute",
                self.malformed_since_report
            );
            self.malformed_since_report = 0;
            self.last_malformed_report = Instant::now();
        }
    }
}

fn parse_stamp(stamp: &str) -> Option<EventKey> {
    // <sec>.<msec>:<serial>
    let (time, serial) = stamp.split_once(':')?;
    let (sec, msec) = time.split_once('.')?;
    Some(EventKey {
        sec: sec.parse().ok()?,
        msec: msec.parse().ok()?,
        serial: serial.parse().ok()?,
    })
}

/// `key=value` tokenizer over a record body. Values may be bare,
/// double-quoted or single-quoted; quotes are preserved in the raw value.
struct FieldTokenizer<'a> {
    rest: &'a str,
}

impl<'a> FieldTokenizer<'a> {
    fn new(body: &'a str) -> FieldTokenizer<'a> {
        FieldTokenizer { rest: body }
    }
}

impl<'a> Iterator for FieldTokenizer<'a> {
    type Item = (&'a str, &'a str);

    fn next(&mut self) -> Option<(&'a str, &'a str)> {
        loop {
            self.rest = self.rest.trim_start_matches(' ');
            if self.rest.is_empty() {
                return None;
            }
            let Some(eq) = self.rest.find('=') else {
                self.rest = "";
                return None;
            };
            // a token without '=' before the next space is noise; skip it
            if let Some(space) = self.rest.find(' ') {
                if space < eq {
                    self.rest = &self.rest[space + 1..];
                    continue;
                }
            }
            let name = &self.rest[..eq];
            let after = &self.rest[eq + 1..];
            let (value, remaining) = match after.as_bytes().first() {
                Some(b'"') => match after[1..].find('"') {
                    Some(close) => after.split_at(close + 2),
                    None => (after, ""),
                },
                Some(b'\'') => match after[1..].find('\'') {
                    Some(close) => after.split_at(close + 2),
                    None => (after, ""),
                },
                _ => match after.find(' ') {
                    Some(space) => (&after[..space], &after[space + 1..]),
                    None => (after, ""),
                },
            };
            self.rest = remaining;
            return Some((name, value));
        }
    }
}

/// Strip surrounding quotes, or decode an even-length hex value.
fn unescape_arg(value: &str) -> String {
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        return value[1..value.len() - 1].to_string();
    }
    if value == "(null)" || value.len() % 2 != 0 || value.is_empty() {
        return value.to_string();
    }
    let mut out = Vec::with_capacity(value.len() / 2);
    let bytes = value.as_bytes();
    for pair in bytes.chunks_exact(2) {
        let hi = (pair[0] as char).to_digit(16);
        let lo = (pair[1] as char).to_digit(16);
        match (hi, lo) {
            (Some(hi), Some(lo)) => out.push((hi * 16 + lo) as u8),
            _ => return value.to_string(),
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}
