use std::collections::{HashMap, VecDeque};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use memmap2::MmapMut;
use serde::Serialize;

pub const MIN_QUEUE_SIZE: u64 = 1024 * 1024;

const MAGIC: u64 = u64::from_le_bytes(*b"AUFLUXQ1");
const VERSION: u32 = 1;
const HEADER_SIZE: u64 = 4096;
const REC_HDR: u64 = 16; // len u32 + msg_type u32 + id u64
const WRAP_LEN: u32 = u32::MAX;

// header field offsets
const H_MAGIC: usize = 0;
const H_VERSION: usize = 8;
const H_SIZE: usize = 16;
const H_HEAD: usize = 24;
const H_TAIL: usize = 32;
const H_WATERMARK: usize = 40;
const H_NEXT_ID: usize = 48;
const H_CLEAN: usize = 56;
const H_COUNT: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MsgType {
    Event = 1,
    EventsGap = 2,
}

impl MsgType {
    pub fn from_u32(v: u32) -> Option<MsgType> {
        match v {
            1 => Some(MsgType::Event),
            2 => Some(MsgType::EventsGap),
            _ => None,
        }
    }
}

/// An uncommitted region of the ring, handed to the event builder.
///
/// The region is exclusively owned by the holder until `commit` or
/// `rollback`; the queue never hands out overlapping regions and the mapping
/// does not move while the queue is alive, so the raw pointer stays valid.
pub struct QueueSlot {
    ptr: *mut u8,
    cap: usize,
    written: usize,
    off: u64,
}

unsafe impl Send for QueueSlot {}

impl QueueSlot {
    pub fn capacity(&self) -> usize {
        self.cap
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn remaining(&self) -> usize {
        self.cap - self.written
    }

    pub fn write(&mut self, bytes: &[u8]) {
        assert!(self.written + bytes.len() <= self.cap, "slot overflow");
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.add(self.written), bytes.len());
        }
        self.written += bytes.len();
    }

    pub fn patch(&mut self, at: usize, bytes: &[u8]) {
        assert!(at + bytes.len() <= self.written, "patch out of range");
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.add(at), bytes.len());
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.written) }
    }
}

pub enum AllocResult {
    Slot(QueueSlot),
    Full,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemInfo {
    pub id: u64,
    pub size: usize,
    pub msg_type: MsgType,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ReadResult {
    Item(ItemInfo),
    Timeout,
    Closed,
}

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    id: u64,
    off: u64,
    len: u32,
    msg_type: u32,
}

#[derive(Debug, Clone, Copy)]
struct CursorState {
    last_read: u64,
    checkpointed: u64,
}

struct Pending {
    off: u64,
    total: u64,
    waste: u64,
}

struct Inner {
    mmap: MmapMut,
    cap: u64,
    head: u64,
    tail: u64,
    next_id: u64,
    index: VecDeque<IndexEntry>,
    cursors: HashMap<String, CursorState>,
    pending: Option<Pending>,
    closed: bool,
    dirty_bytes: u64,
}

/// Disk-backed bounded FIFO with independently named read cursors.
///
/// A single backing file holds a 4 KiB header page followed by a ring of
/// 8-byte-aligned, length-prefixed records. Committed records survive a clean
/// restart; an unclean shutdown resets the queue (the caller detects it via
/// the lock file and removes the backing file, and the header's clean flag
/// catches the case where it could not).
pub struct Queue {
    inner: Mutex<Inner>,
    not_full: Condvar,
    not_empty: Condvar,
}

fn align8(n: u64) -> u64 {
    (n + 7) & !7
}

impl Inner {
    fn data(&self) -> &[u8] {
        &self.mmap[HEADER_SIZE as usize..]
    }

    fn write_data(&mut self, off: u64, bytes: &[u8]) {
        let start = HEADER_SIZE as usize + off as usize;
        self.mmap[start..start + bytes.len()].copy_from_slice(bytes);
    }

    fn data_ptr(&mut self, off: u64) -> *mut u8 {
        unsafe { self.mmap.as_mut_ptr().add(HEADER_SIZE as usize + off as usize) }
    }

    fn read_u32(&self, off: u64) -> u32 {
        let d = self.data();
        u32::from_le_bytes(d[off as usize..off as usize + 4].try_into().unwrap())
    }

    fn read_u64(&self, off: u64) -> u64 {
        let d = self.data();
        u64::from_le_bytes(d[off as usize..off as usize + 8].try_into().unwrap())
    }

    fn is_empty(&self) -> bool {
        self.index.is_empty() && self.pending.is_none()
    }

    /// Where a record of `total` bytes would land, or None if it does not fit.
    /// Returns (offset, wasted bytes at the end of the ring).
    fn placement(&self, total: u64) -> Option<(u64, u64)> {
        if self.is_empty() {
            // an empty ring is normalized to start at the front
            if total <= self.cap {
                return Some((0, 0));
            }
            return None;
        }
        if self.head == self.tail {
            return None; // full
        }
        if self.head > self.tail {
            if self.cap - self.head >= total {
                return Some((self.head, 0));
            }
            // wrap to the front
            if self.tail >= total {
                return Some((0, self.cap - self.head));
            }
            return None;
        }
        if self.tail - self.head >= total {
            return Some((self.head, 0));
        }
        None
    }

    fn reserve(&mut self, total: u64) -> Option<u64> {
        let (off, waste) = self.placement(total)?;
        if self.is_empty() {
            self.head = 0;
            self.tail = 0;
        }
        if waste >= 4 {
            // mark the wrap so scans know to jump back to the region start
            let head = self.head;
            self.write_data(head, &WRAP_LEN.to_le_bytes());
        }
        self.head = off + total;
        if self.head == self.cap {
            self.head = 0;
        }
        self.pending = Some(Pending { off, total, waste });
        Some(off)
    }

    fn min_checkpoint(&self) -> Option<u64> {
        self.cursors.values().map(|c| c.checkpointed).min()
    }

    /// Drop records every registered cursor has checkpointed past.
    fn reclaim(&mut self) -> bool {
        let limit = match self.min_checkpoint() {
            Some(id) => id,
            // With no registered consumers everything already committed is
            // reclaimable.
            None => u64::MAX,
        };
        let mut advanced = false;
        while let Some(front) = self.index.front().copied() {
            if front.id > limit {
                break;
            }
            self.index.pop_front();
            // front.off != tail means the bytes from tail to the end of the
            // ring were wrap waste
            self.tail = front.off + align8(REC_HDR + front.len as u64);
            if self.tail == self.cap {
                self.tail = 0;
            }
            advanced = true;
        }
        if self.index.is_empty() && self.pending.is_none() {
            self.head = 0;
            self.tail = 0;
        } else if self.index.is_empty() {
            if let Some(p) = &self.pending {
                self.tail = p.off;
            }
        }
        advanced
    }

    fn entry_after(&self, id: u64) -> Option<IndexEntry> {
        let idx = self.index.partition_point(|e| e.id <= id);
        self.index.get(idx).copied()
    }

    fn entry_by_id(&self, id: u64) -> Option<IndexEntry> {
        let idx = self.index.partition_point(|e| e.id < id);
        self.index.get(idx).copied().filter(|e| e.id == id)
    }

    fn save_header(&mut self, clean: bool) {
        let cap = self.cap;
        let head = self.head;
        let tail = self.tail;
        let next_id = self.next_id;
        let count = self.index.len() as u64;
        let watermark = self.min_checkpoint().unwrap_or(next_id.saturating_sub(1));
        let mmap = &mut self.mmap;
        mmap[H_MAGIC..H_MAGIC + 8].copy_from_slice(&MAGIC.to_le_bytes());
        mmap[H_VERSION..H_VERSION + 4].copy_from_slice(&VERSION.to_le_bytes());
        mmap[H_SIZE..H_SIZE + 8].copy_from_slice(&(cap + HEADER_SIZE).to_le_bytes());
        mmap[H_HEAD..H_HEAD + 8].copy_from_slice(&head.to_le_bytes());
        mmap[H_TAIL..H_TAIL + 8].copy_from_slice(&tail.to_le_bytes());
        mmap[H_WATERMARK..H_WATERMARK + 8].copy_from_slice(&watermark.to_le_bytes());
        mmap[H_NEXT_ID..H_NEXT_ID + 8].copy_from_slice(&next_id.to_le_bytes());
        mmap[H_CLEAN..H_CLEAN + 4].copy_from_slice(&(clean as u32).to_le_bytes());
        mmap[H_COUNT..H_COUNT + 8].copy_from_slice(&count.to_le_bytes());
    }
}

impl Queue {
    /// Open or create the backing file. `size` is clamped to the minimum.
    pub fn open(path: &Path, size: u64) -> anyhow::Result<Queue> {
        let size = size.max(MIN_QUEUE_SIZE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("failed to open queue file {}", path.display()))?;
        let existing = file
            .metadata()
            .with_context(|| format!("failed to stat queue file {}", path.display()))?
            .len();
        let fresh = existing != size;
        if fresh {
            file.set_len(size)
                .with_context(|| format!("failed to size queue file {}", path.display()))?;
        }
        let mmap = unsafe { MmapMut::map_mut(&file) }
            .with_context(|| format!("failed to map queue file {}", path.display()))?;

        let mut inner = Inner {
            mmap,
            cap: size - HEADER_SIZE,
            head: 0,
            tail: 0,
            next_id: 1,
            index: VecDeque::new(),
            cursors: HashMap::new(),
            pending: None,
            closed: false,
            dirty_bytes: 0,
        };

        if !fresh {
            if let Err(err) = load_existing(&mut inner) {
                log::warn!("queue file {} not recovered ({err}); starting empty", path.display());
                inner.head = 0;
                inner.tail = 0;
                inner.next_id = 1;
                inner.index.clear();
            }
        }

        // mark in-use; a clean close restores the flag
        inner.save_header(false);
        inner.mmap.flush().context("failed to flush queue header")?;

        Ok(Queue {
            inner: Mutex::new(inner),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        })
    }

    /// Register a named cursor, restoring its checkpointed position.
    pub fn register_cursor(&self, name: &str, checkpointed: u64) {
        let mut inner = self.inner.lock().unwrap();
        let checkpointed = checkpointed.min(inner.next_id.saturating_sub(1));
        inner.cursors.insert(
            name.to_string(),
            CursorState {
                last_read: checkpointed,
                checkpointed,
            },
        );
    }

    pub fn remove_cursor(&self, name: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.cursors.remove(name);
        if inner.reclaim() {
            self.not_full.notify_all();
        }
    }

    pub fn cursor_names(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner.cursors.keys().cloned().collect()
    }

    /// Reserve a contiguous region for a new record.
    pub fn allocate(&self, size: usize, blocking: bool, timeout: Option<Duration>) -> AllocResult {
        let total = align8(REC_HDR + size as u64);
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.inner.lock().unwrap();
        assert!(inner.pending.is_none(), "only one outstanding allocation");
        loop {
            if inner.closed {
                return AllocResult::Closed;
            }
            if total <= inner.cap {
                if let Some(off) = inner.reserve(total) {
                    let ptr = inner.data_ptr(off + REC_HDR);
                    return AllocResult::Slot(QueueSlot {
                        ptr,
                        cap: (total - REC_HDR) as usize,
                        written: 0,
                        off,
                    });
                }
            } else {
                return AllocResult::Full;
            }
            if !blocking {
                return AllocResult::Full;
            }
            match deadline {
                None => {
                    inner = self.not_full.wait(inner).unwrap();
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return AllocResult::Full;
                    }
                    let (guard, _) = self.not_full.wait_timeout(inner, deadline - now).unwrap();
                    inner = guard;
                }
            }
        }
    }

    /// Grow an uncommitted slot, preserving its contents.
    pub fn regrow(&self, slot: QueueSlot, new_size: usize) -> AllocResult {
        let saved = slot.as_slice().to_vec();
        self.rollback(slot);
        match self.allocate(new_size, true, None) {
            AllocResult::Slot(mut slot) => {
                slot.write(&saved);
                AllocResult::Slot(slot)
            }
            other => other,
        }
    }

    /// Make an allocated slot visible to readers, in FIFO order.
    pub fn commit(&self, slot: QueueSlot, msg_type: MsgType) -> Option<u64> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return None;
        }
        let pending = inner.pending.take().expect("commit without allocation");
        debug_assert_eq!(pending.off, slot.off);
        let id = inner.next_id;
        inner.next_id += 1;
        let len = slot.written as u32;
        let off = pending.off;
        inner.write_data(off, &len.to_le_bytes());
        inner.write_data(off + 4, &(msg_type as u32).to_le_bytes());
        inner.write_data(off + 8, &id.to_le_bytes());
        inner.index.push_back(IndexEntry {
            id,
            off,
            len,
            msg_type: msg_type as u32,
        });
        inner.dirty_bytes += pending.total + pending.waste;
        drop(inner);
        self.not_empty.notify_all();
        Some(id)
    }

    /// Return an allocated region to the free pool; it is never observed.
    pub fn rollback(&self, slot: QueueSlot) {
        let mut inner = self.inner.lock().unwrap();
        let pending = inner.pending.take().expect("rollback without allocation");
        debug_assert_eq!(pending.off, slot.off);
        if pending.waste > 0 {
            // the record wrapped; the head goes back to where the waste began
            inner.head = inner.cap - pending.waste;
        } else {
            inner.head = pending.off;
        }
        if inner.index.is_empty() {
            inner.head = 0;
            inner.tail = 0;
        }
        drop(inner);
        self.not_full.notify_all();
    }

    pub fn peek(&self, cursor: &str, timeout: Option<Duration>) -> ReadResult {
        self.read_next(cursor, None, timeout)
    }

    /// Copy the next record for `cursor` into `buf` and advance the cursor.
    pub fn get(&self, cursor: &str, buf: &mut Vec<u8>, timeout: Option<Duration>) -> ReadResult {
        self.read_next(cursor, Some(buf), timeout)
    }

    fn read_next(
        &self,
        cursor: &str,
        mut buf: Option<&mut Vec<u8>>,
        timeout: Option<Duration>,
    ) -> ReadResult {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.inner.lock().unwrap();
        loop {
            let state = match inner.cursors.get(cursor) {
                Some(state) => *state,
                None => return ReadResult::Closed,
            };
            if let Some(entry) = inner.entry_after(state.last_read) {
                let msg_type = match MsgType::from_u32(entry.msg_type) {
                    Some(t) => t,
                    None => {
                        // skip records from a future version
                        inner.cursors.get_mut(cursor).unwrap().last_read = entry.id;
                        continue;
                    }
                };
                if let Some(buf) = buf.as_deref_mut() {
                    let start = (entry.off + REC_HDR) as usize;
                    buf.clear();
                    buf.extend_from_slice(&inner.data()[start..start + entry.len as usize]);
                    inner.cursors.get_mut(cursor).unwrap().last_read = entry.id;
                }
                return ReadResult::Item(ItemInfo {
                    id: entry.id,
                    size: entry.len as usize,
                    msg_type,
                });
            }
            if inner.closed {
                return ReadResult::Closed;
            }
            match deadline {
                None => {
                    inner = self.not_empty.wait(inner).unwrap();
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return ReadResult::Timeout;
                    }
                    let (guard, _) = self.not_empty.wait_timeout(inner, deadline - now).unwrap();
                    inner = guard;
                }
            }
        }
    }

    /// Idempotent read of a specific id, used for queue-to-queue forwarding.
    pub fn try_get(&self, id: u64, buf: &mut Vec<u8>) -> Option<ItemInfo> {
        let inner = self.inner.lock().unwrap();
        let entry = inner.entry_by_id(id)?;
        let msg_type = MsgType::from_u32(entry.msg_type)?;
        let start = (entry.off + REC_HDR) as usize;
        buf.clear();
        buf.extend_from_slice(&inner.data()[start..start + entry.len as usize]);
        Some(ItemInfo {
            id: entry.id,
            size: entry.len as usize,
            msg_type,
        })
    }

    /// Record that `cursor` has processed everything up to `id`; space is
    /// reclaimed once all cursors have moved past it.
    pub fn checkpoint(&self, cursor: &str, id: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(state) = inner.cursors.get_mut(cursor) {
            if id > state.checkpointed {
                state.checkpointed = id;
                if id > state.last_read {
                    state.last_read = id;
                }
            }
        }
        if inner.reclaim() {
            self.not_full.notify_all();
        }
    }

    pub fn cursor_position(&self, cursor: &str) -> Option<u64> {
        let inner = self.inner.lock().unwrap();
        inner.cursors.get(cursor).map(|c| c.checkpointed)
    }

    /// Periodically sync the backing file. Runs until `close`; persistent
    /// I/O failure closes the queue.
    pub fn autosave(&self, granularity_bytes: u64, interval: Duration) {
        const MAX_CONSECUTIVE_FAILURES: u32 = 30;
        let mut last_save = Instant::now();
        let mut failures = 0u32;
        loop {
            std::thread::sleep(interval.min(Duration::from_millis(100)));
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return;
            }
            let due = inner.dirty_bytes >= granularity_bytes || last_save.elapsed() >= interval;
            if !due || inner.dirty_bytes == 0 {
                continue;
            }
            inner.save_header(false);
            inner.dirty_bytes = 0;
            match inner.mmap.flush() {
                Ok(()) => failures = 0,
                Err(err) => {
                    failures += 1;
                    log::error!("queue autosave failed: {err}; retrying");
                    if failures >= MAX_CONSECUTIVE_FAILURES {
                        log::error!("queue autosave failing persistently; closing queue");
                        drop(inner);
                        self.close();
                        return;
                    }
                }
            }
            last_save = Instant::now();
        }
    }

    /// Close the queue, waking all waiters with `Closed`.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.closed {
            inner.closed = true;
            inner.save_header(true);
            if let Err(err) = inner.mmap.flush() {
                log::error!("queue flush on close failed: {err}");
            }
        }
        drop(inner);
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock().unwrap();
        QueueStats {
            capacity: inner.cap,
            committed: inner.index.len(),
            head_id: inner.next_id.saturating_sub(1),
            watermark: inner.min_checkpoint().unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct QueueStats {
    #[serde(rename = "size")]
    pub capacity: u64,
    pub committed: usize,
    pub head_id: u64,
    pub watermark: u64,
}

/// Validate the header of an existing file and rebuild the record index.
fn load_existing(inner: &mut Inner) -> anyhow::Result<()> {
    let h = &inner.mmap[..HEADER_SIZE as usize];
    let magic = u64::from_le_bytes(h[H_MAGIC..H_MAGIC + 8].try_into().unwrap());
    let version = u32::from_le_bytes(h[H_VERSION..H_VERSION + 4].try_into().unwrap());
    let size = u64::from_le_bytes(h[H_SIZE..H_SIZE + 8].try_into().unwrap());
    let head = u64::from_le_bytes(h[H_HEAD..H_HEAD + 8].try_into().unwrap());
    let tail = u64::from_le_bytes(h[H_TAIL..H_TAIL + 8].try_into().unwrap());
    let next_id = u64::from_le_bytes(h[H_NEXT_ID..H_NEXT_ID + 8].try_into().unwrap());
    let clean = u32::from_le_bytes(h[H_CLEAN..H_CLEAN + 4].try_into().unwrap());
    let count = u64::from_le_bytes(h[H_COUNT..H_COUNT + 8].try_into().unwrap());

    if magic != MAGIC {
        bail!("bad magic");
    }
    if version != VERSION {
        bail!("unsupported version {version}");
    }
    if size != inner.cap + HEADER_SIZE {
        bail!("size mismatch");
    }
    if clean != 1 {
        bail!("previous instance did not close the queue cleanly");
    }
    if head >= inner.cap || tail >= inner.cap {
        bail!("corrupt head/tail");
    }

    inner.head = head;
    inner.tail = tail;
    inner.next_id = next_id.max(1);

    // walk `count` records starting at the tail
    let mut pos = tail;
    let mut last_id = 0u64;
    for _ in 0..count {
        loop {
            if inner.cap - pos < REC_HDR || inner.read_u32(pos) == WRAP_LEN {
                pos = 0;
                continue;
            }
            break;
        }
        let len = inner.read_u32(pos);
        let msg_type = inner.read_u32(pos + 4);
        let id = inner.read_u64(pos + 8);
        let total = align8(REC_HDR + len as u64);
        if len as u64 > inner.cap || pos + total > inner.cap {
            bail!("corrupt record length at offset {pos}");
        }
        if id <= last_id {
            bail!("record ids not increasing at offset {pos}");
        }
        last_id = id;
        inner.index.push_back(IndexEntry {
            id,
            off: pos,
            len,
            msg_type,
        });
        pos += total;
        if pos == inner.cap {
            pos = 0;
        }
    }
    if pos != head {
        bail!("record scan did not land on the head offset");
    }
    if last_id >= inner.next_id {
        inner.next_id = last_id + 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn temp_queue(size: u64) -> (tempfile::TempDir, Queue) {
        let dir = tempfile::tempdir().unwrap();
        let queue = Queue::open(&dir.path().join("queue.dat"), size).unwrap();
        (dir, queue)
    }

    fn push(queue: &Queue, payload: &[u8]) -> u64 {
        match queue.allocate(payload.len(), true, None) {
            AllocResult::Slot(mut slot) => {
                slot.write(payload);
                queue.commit(slot, MsgType::Event).unwrap()
            }
            _ => panic!("allocate failed"),
        }
    }

    #[test]
    fn round_trip_preserves_payload() {
        let (_dir, queue) = temp_queue(MIN_QUEUE_SIZE);
        queue.register_cursor("out", 0);
        let id = push(&queue, b"hello world");
        let mut buf = Vec::new();
        match queue.get("out", &mut buf, Some(Duration::from_millis(100))) {
            ReadResult::Item(info) => {
                assert_eq!(info.id, id);
                assert_eq!(info.msg_type, MsgType::Event);
                assert_eq!(buf, b"hello world");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn ids_strictly_increase_per_cursor() {
        let (_dir, queue) = temp_queue(MIN_QUEUE_SIZE);
        queue.register_cursor("out", 0);
        for i in 0..10u8 {
            push(&queue, &[i]);
        }
        let mut buf = Vec::new();
        let mut last = 0;
        for _ in 0..10 {
            match queue.get("out", &mut buf, Some(Duration::from_millis(100))) {
                ReadResult::Item(info) => {
                    assert!(info.id > last);
                    last = info.id;
                }
                other => panic!("unexpected: {other:?}"),
            }
        }
        assert_eq!(
            queue.get("out", &mut buf, Some(Duration::from_millis(10))),
            ReadResult::Timeout
        );
    }

    #[test]
    fn rollback_is_never_observed() {
        let (_dir, queue) = temp_queue(MIN_QUEUE_SIZE);
        queue.register_cursor("out", 0);
        match queue.allocate(64, true, None) {
            AllocResult::Slot(mut slot) => {
                slot.write(b"discarded");
                queue.rollback(slot);
            }
            _ => panic!("allocate failed"),
        }
        push(&queue, b"kept");
        let mut buf = Vec::new();
        match queue.get("out", &mut buf, Some(Duration::from_millis(100))) {
            ReadResult::Item(_) => assert_eq!(buf, b"kept"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn independent_cursors_see_all_records() {
        let (_dir, queue) = temp_queue(MIN_QUEUE_SIZE);
        queue.register_cursor("a", 0);
        queue.register_cursor("b", 0);
        let first = push(&queue, b"one");
        let second = push(&queue, b"two");
        let mut buf = Vec::new();
        for cursor in ["a", "b"] {
            for expect in [first, second] {
                match queue.get(cursor, &mut buf, Some(Duration::from_millis(100))) {
                    ReadResult::Item(info) => assert_eq!(info.id, expect),
                    other => panic!("unexpected: {other:?}"),
                }
            }
        }
    }

    #[test]
    fn peek_does_not_advance() {
        let (_dir, queue) = temp_queue(MIN_QUEUE_SIZE);
        queue.register_cursor("out", 0);
        let id = push(&queue, b"x");
        match queue.peek("out", Some(Duration::from_millis(100))) {
            ReadResult::Item(info) => assert_eq!(info.id, id),
            other => panic!("unexpected: {other:?}"),
        }
        match queue.peek("out", Some(Duration::from_millis(100))) {
            ReadResult::Item(info) => assert_eq!(info.id, id),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn try_get_is_idempotent() {
        let (_dir, queue) = temp_queue(MIN_QUEUE_SIZE);
        queue.register_cursor("out", 0);
        let id = push(&queue, b"payload");
        let mut buf = Vec::new();
        assert!(queue.try_get(id, &mut buf).is_some());
        assert_eq!(buf, b"payload");
        assert!(queue.try_get(id, &mut buf).is_some());
        assert!(queue.try_get(id + 1, &mut buf).is_none());
    }

    #[test]
    fn backpressure_blocks_until_checkpoint() {
        let (_dir, queue) = temp_queue(MIN_QUEUE_SIZE);
        let queue = Arc::new(queue);
        queue.register_cursor("slow", 0);

        // fill the queue with large payloads
        let payload = vec![0u8; 200 * 1024];
        let mut ids = Vec::new();
        loop {
            match queue.allocate(payload.len(), false, None) {
                AllocResult::Slot(mut slot) => {
                    slot.write(&payload);
                    ids.push(queue.commit(slot, MsgType::Event).unwrap());
                }
                AllocResult::Full => break,
                AllocResult::Closed => panic!("closed"),
            }
        }
        assert!(ids.len() >= 4);

        // a blocking producer must park until the consumer checkpoints
        let producer = {
            let queue = Arc::clone(&queue);
            let payload = payload.clone();
            std::thread::spawn(move || match queue.allocate(payload.len(), true, None) {
                AllocResult::Slot(mut slot) => {
                    slot.write(&payload);
                    queue.commit(slot, MsgType::Event)
                }
                _ => None,
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        assert!(!producer.is_finished());

        let mut buf = Vec::new();
        for expect in &ids[..2] {
            match queue.get("slow", &mut buf, Some(Duration::from_secs(1))) {
                ReadResult::Item(info) => {
                    assert_eq!(info.id, *expect);
                    queue.checkpoint("slow", info.id);
                }
                other => panic!("unexpected: {other:?}"),
            }
        }
        let committed = producer.join().unwrap();
        assert!(committed.is_some());

        // nothing was lost: the remaining ids plus the new one all arrive
        for expect in &ids[2..] {
            match queue.get("slow", &mut buf, Some(Duration::from_secs(1))) {
                ReadResult::Item(info) => {
                    assert_eq!(info.id, *expect);
                    queue.checkpoint("slow", info.id);
                }
                other => panic!("unexpected: {other:?}"),
            }
        }
        match queue.get("slow", &mut buf, Some(Duration::from_secs(1))) {
            ReadResult::Item(info) => assert_eq!(info.id, committed.unwrap()),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn wraps_and_preserves_fifo_order() {
        let (_dir, queue) = temp_queue(MIN_QUEUE_SIZE);
        queue.register_cursor("out", 0);
        // keep one record in flight at all times so offsets march forward and
        // wrap the ring several times
        let payload = vec![7u8; 300 * 1024];
        let mut buf = Vec::new();
        let mut pending = VecDeque::new();
        pending.push_back(push(&queue, &payload));
        for round in 0..12 {
            pending.push_back(push(&queue, &payload));
            let expect = pending.pop_front().unwrap();
            match queue.get("out", &mut buf, Some(Duration::from_secs(1))) {
                ReadResult::Item(info) => {
                    assert_eq!(info.id, expect, "round {round}");
                    assert_eq!(buf.len(), payload.len());
                    assert!(buf.iter().all(|&b| b == 7));
                    queue.checkpoint("out", info.id);
                }
                other => panic!("unexpected: {other:?}"),
            }
        }
    }

    #[test]
    fn close_wakes_waiters() {
        let (_dir, queue) = temp_queue(MIN_QUEUE_SIZE);
        let queue = Arc::new(queue);
        queue.register_cursor("out", 0);
        let reader = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || {
                let mut buf = Vec::new();
                queue.get("out", &mut buf, None)
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        queue.close();
        assert_eq!(reader.join().unwrap(), ReadResult::Closed);
        assert!(matches!(queue.allocate(8, true, None), AllocResult::Closed));
    }

    #[test]
    fn clean_restart_preserves_committed_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.dat");
        let ids: Vec<u64>;
        {
            let queue = Queue::open(&path, MIN_QUEUE_SIZE).unwrap();
            queue.register_cursor("out", 0);
            ids = (0..3).map(|i| push(&queue, &[i as u8; 32])).collect();
            queue.close();
        }
        let queue = Queue::open(&path, MIN_QUEUE_SIZE).unwrap();
        // the cursor restarts from its checkpoint (none here)
        queue.register_cursor("out", 0);
        let mut buf = Vec::new();
        for expect in &ids {
            match queue.get("out", &mut buf, Some(Duration::from_millis(100))) {
                ReadResult::Item(info) => assert_eq!(info.id, *expect),
                other => panic!("unexpected: {other:?}"),
            }
        }
    }

    #[test]
    fn restart_resumes_after_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.dat");
        let ids: Vec<u64>;
        {
            let queue = Queue::open(&path, MIN_QUEUE_SIZE).unwrap();
            queue.register_cursor("out", 0);
            ids = (0..4).map(|i| push(&queue, &[i as u8; 16])).collect();
            queue.close();
        }
        let queue = Queue::open(&path, MIN_QUEUE_SIZE).unwrap();
        queue.register_cursor("out", ids[1]);
        let mut buf = Vec::new();
        match queue.get("out", &mut buf, Some(Duration::from_millis(100))) {
            ReadResult::Item(info) => assert!(info.id > ids[1]),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unclean_file_is_reset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.dat");
        {
            let queue = Queue::open(&path, MIN_QUEUE_SIZE).unwrap();
            queue.register_cursor("out", 0);
            push(&queue, b"lost");
            // no close: the in-use flag stays set
        }
        let queue = Queue::open(&path, MIN_QUEUE_SIZE).unwrap();
        queue.register_cursor("out", 0);
        let mut buf = Vec::new();
        assert_eq!(
            queue.get("out", &mut buf, Some(Duration::from_millis(10))),
            ReadResult::Timeout
        );
    }

    #[test]
    fn regrow_preserves_written_bytes() {
        let (_dir, queue) = temp_queue(MIN_QUEUE_SIZE);
        queue.register_cursor("out", 0);
        let slot = match queue.allocate(16, true, None) {
            AllocResult::Slot(mut slot) => {
                slot.write(b"0123456789abcdef");
                slot
            }
            _ => panic!("allocate failed"),
        };
        let mut slot = match queue.regrow(slot, 64) {
            AllocResult::Slot(slot) => slot,
            _ => panic!("regrow failed"),
        };
        assert!(slot.capacity() >= 64);
        slot.write(b"-tail");
        queue.commit(slot, MsgType::Event).unwrap();
        let mut buf = Vec::new();
        match queue.get("out", &mut buf, Some(Duration::from_millis(100))) {
            ReadResult::Item(_) => assert_eq!(buf, b"0123456789abcdef-tail"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
