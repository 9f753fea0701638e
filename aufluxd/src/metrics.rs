use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

/// Global counters for the daemon.
///
/// Updated from the hot path so all fields are atomic.
pub struct Metrics {
    pub start_time: SystemTime,
    bytes_total: AtomicU64,
    records_total: AtomicU64,
    events_total: AtomicU64,
    malformed_records: AtomicU64,
    event_gaps: AtomicU64,
    queue_full_waits: AtomicU64,
    messages_sent: AtomicU64,
    events_filtered: AtomicU64,
    send_errors: AtomicU64,
    active_outputs: AtomicUsize,
    // per-second rollup
    events_this_sec: AtomicU64,
    events_per_sec: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start_time: SystemTime::now(),
            bytes_total: AtomicU64::new(0),
            records_total: AtomicU64::new(0),
            events_total: AtomicU64::new(0),
            malformed_records: AtomicU64::new(0),
            event_gaps: AtomicU64::new(0),
            queue_full_waits: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            events_filtered: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
            active_outputs: AtomicUsize::new(0),
            events_this_sec: AtomicU64::new(0),
            events_per_sec: AtomicU64::new(0),
        }
    }

    pub fn add_bytes(&self, n: u64) {
        self.bytes_total.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_records(&self) {
        self.records_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_events(&self) {
        self.events_total.fetch_add(1, Ordering::Relaxed);
        self.events_this_sec.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_malformed(&self) {
        self.malformed_records.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_event_gaps(&self) {
        self.event_gaps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_queue_full_waits(&self) {
        self.queue_full_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_messages_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_events_filtered(&self) {
        self.events_filtered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_send_errors(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_active_outputs(&self, n: usize) {
        self.active_outputs.store(n, Ordering::Relaxed);
    }

    /// Called once per second to refresh the events-per-second value.
    pub fn rollup(&self) {
        let per_sec = self.events_this_sec.swap(0, Ordering::Relaxed);
        self.events_per_sec.store(per_sec, Ordering::Relaxed);
    }

    pub fn events_per_sec(&self) -> u64 {
        self.events_per_sec.load(Ordering::Relaxed)
    }

    pub fn events_total(&self) -> u64 {
        self.events_total.load(Ordering::Relaxed)
    }

    pub fn records_total(&self) -> u64 {
        self.records_total.load(Ordering::Relaxed)
    }

    pub fn bytes_total(&self) -> u64 {
        self.bytes_total.load(Ordering::Relaxed)
    }

    pub fn malformed_records(&self) -> u64 {
        self.malformed_records.load(Ordering::Relaxed)
    }

    pub fn event_gaps(&self) -> u64 {
        self.event_gaps.load(Ordering::Relaxed)
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub fn events_filtered(&self) -> u64 {
        self.events_filtered.load(Ordering::Relaxed)
    }

    pub fn send_errors(&self) -> u64 {
        self.send_errors.load(Ordering::Relaxed)
    }

    pub fn queue_full_waits(&self) -> u64 {
        self.queue_full_waits.load(Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().map(|d| d.as_secs()).unwrap_or(0)
    }

    pub fn log_line(&self) -> String {
        format!(
            "metrics: events/s={} events={} records={} bytes={} malformed={} gaps={} sent={} filtered={} send_errors={}",
            self.events_per_sec(),
            self.events_total(),
            self.records_total(),
            self.bytes_total(),
            self.malformed_records(),
            self.event_gaps(),
            self.messages_sent(),
            self.events_filtered(),
            self.send_errors(),
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn the rollup/report thread. Rolls events/s every second and logs a
/// summary line every 10 seconds until `stopping` is set.
pub fn start_reporter(
    metrics: Arc<Metrics>,
    stopping: Arc<std::sync::atomic::AtomicBool>,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("metrics".to_string())
        .spawn(move || {
            let mut ticks = 0u32;
            while !stopping.load(Ordering::Relaxed) {
                std::thread::sleep(std::time::Duration::from_secs(1));
                metrics.rollup();
                ticks += 1;
                if ticks % 10 == 0 {
                    log::info!("{}", metrics.log_line());
                }
            }
        })
        .expect("failed to spawn metrics thread")
}
