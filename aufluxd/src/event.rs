use std::sync::Arc;

use crate::queue::{AllocResult, MsgType, Queue, QueueSlot};
use crate::tables::FieldType;

/// Event flag: the event contains a SYSCALL record.
pub const EVENT_FLAG_SYSCALL: u32 = 0x1;
/// Event flag: the event describes a successful execve.
pub const EVENT_FLAG_EXECVE: u32 = 0x2;

const EVENT_HDR: usize = 36;
const RECORD_HDR: usize = 16;
const FIELD_HDR: usize = 12;
const INITIAL_SLOT: usize = 8192;

// Event payload layout (all little-endian, offsets relative to payload
// start):
//   0  sec:u64  8 msec:u32  12 pid:i32  16 serial:u64  24 flags:u32
//   28 num_records:u32  32 record_table_off:u32
// Record:
//   +0 type_code:u32  +4 name_len:u16  +6 num_fields:u16  +8 text_len:u32
//   +12 field_table_off:u32, then name, text, fields, field offset table
// Field:
//   +0 name_len:u16  +2 field_type:u16  +4 raw_len:u32  +8 interp_len:u32,
//   then name, raw, interp

/// Serial-number discontinuity report, stored as its own queue record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GapReport {
    pub start_sec: u64,
    pub start_msec: u32,
    pub start_serial: u64,
    pub end_sec: u64,
    pub end_msec: u32,
    pub end_serial: u64,
}

impl GapReport {
    pub fn encode(&self) -> [u8; 48] {
        let mut out = [0u8; 48];
        out[0..8].copy_from_slice(&self.start_sec.to_le_bytes());
        out[8..16].copy_from_slice(&self.end_sec.to_le_bytes());
        out[16..24].copy_from_slice(&self.start_serial.to_le_bytes());
        out[24..32].copy_from_slice(&self.end_serial.to_le_bytes());
        out[32..36].copy_from_slice(&self.start_msec.to_le_bytes());
        out[36..40].copy_from_slice(&self.end_msec.to_le_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> Option<GapReport> {
        if data.len() < 48 {
            return None;
        }
        Some(GapReport {
            start_sec: u64::from_le_bytes(data[0..8].try_into().unwrap()),
            end_sec: u64::from_le_bytes(data[8..16].try_into().unwrap()),
            start_serial: u64::from_le_bytes(data[16..24].try_into().unwrap()),
            end_serial: u64::from_le_bytes(data[24..32].try_into().unwrap()),
            start_msec: u32::from_le_bytes(data[32..36].try_into().unwrap()),
            end_msec: u32::from_le_bytes(data[36..40].try_into().unwrap()),
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum BuildError {
    QueueClosed,
}

/// Assembles one event at a time directly into a queue slot.
pub struct EventBuilder {
    queue: Arc<Queue>,
    slot: Option<QueueSlot>,
    record_offsets: Vec<u32>,
    field_offsets: Vec<u32>,
    record_start: Option<usize>,
}

impl EventBuilder {
    pub fn new(queue: Arc<Queue>) -> Self {
        Self {
            queue,
            slot: None,
            record_offsets: Vec::new(),
            field_offsets: Vec::new(),
            record_start: None,
        }
    }

    pub fn in_progress(&self) -> bool {
        self.slot.is_some()
    }

    pub fn begin(&mut self, sec: u64, msec: u32, serial: u64) -> Result<(), BuildError> {
        assert!(self.slot.is_none(), "begin while an event is in progress");
        let mut slot = match self.queue.allocate(INITIAL_SLOT, true, None) {
            AllocResult::Slot(slot) => slot,
            _ => return Err(BuildError::QueueClosed),
        };
        let mut hdr = [0u8; EVENT_HDR];
        hdr[0..8].copy_from_slice(&sec.to_le_bytes());
        hdr[8..12].copy_from_slice(&msec.to_le_bytes());
        hdr[12..16].copy_from_slice(&(-1i32).to_le_bytes());
        hdr[16..24].copy_from_slice(&serial.to_le_bytes());
        slot.write(&hdr);
        self.slot = Some(slot);
        self.record_offsets.clear();
        self.field_offsets.clear();
        self.record_start = None;
        Ok(())
    }

    pub fn set_pid(&mut self, pid: i32) {
        let slot = self.slot.as_mut().expect("no event in progress");
        slot.patch(12, &pid.to_le_bytes());
    }

    pub fn pid(&self) -> i32 {
        let slot = self.slot.as_ref().expect("no event in progress");
        i32::from_le_bytes(slot.as_slice()[12..16].try_into().unwrap())
    }

    pub fn set_flags(&mut self, flags: u32) {
        let slot = self.slot.as_mut().expect("no event in progress");
        slot.patch(24, &flags.to_le_bytes());
    }

    pub fn add_record(
        &mut self,
        type_code: u32,
        type_name: &str,
        raw_text: &str,
    ) -> Result<(), BuildError> {
        self.finish_record();
        let need = RECORD_HDR + type_name.len() + raw_text.len();
        self.ensure(need)?;
        let slot = self.slot.as_mut().unwrap();
        let off = slot.written();
        self.record_offsets.push(off as u32);
        self.record_start = Some(off);
        let mut hdr = [0u8; RECORD_HDR];
        hdr[0..4].copy_from_slice(&type_code.to_le_bytes());
        hdr[4..6].copy_from_slice(&(type_name.len() as u16).to_le_bytes());
        // num_fields and field_table_off are patched by finish_record
        hdr[8..12].copy_from_slice(&(raw_text.len() as u32).to_le_bytes());
        slot.write(&hdr);
        slot.write(type_name.as_bytes());
        slot.write(raw_text.as_bytes());
        Ok(())
    }

    pub fn add_field(
        &mut self,
        name: &str,
        raw_value: &str,
        interp_value: Option<&str>,
        field_type: FieldType,
    ) -> Result<(), BuildError> {
        assert!(self.record_start.is_some(), "field outside a record");
        let interp = interp_value.unwrap_or("");
        let need = FIELD_HDR + name.len() + raw_value.len() + interp.len();
        self.ensure(need)?;
        let slot = self.slot.as_mut().unwrap();
        self.field_offsets.push(slot.written() as u32);
        let mut hdr = [0u8; FIELD_HDR];
        hdr[0..2].copy_from_slice(&(name.len() as u16).to_le_bytes());
        hdr[2..4].copy_from_slice(&(field_type as u16).to_le_bytes());
        hdr[4..8].copy_from_slice(&(raw_value.len() as u32).to_le_bytes());
        hdr[8..12].copy_from_slice(&(interp.len() as u32).to_le_bytes());
        slot.write(&hdr);
        slot.write(name.as_bytes());
        slot.write(raw_value.as_bytes());
        slot.write(interp.as_bytes());
        Ok(())
    }

    /// Commit the event into the queue. Returns the assigned id.
    pub fn end(&mut self) -> Result<u64, BuildError> {
        self.finish_record();
        let num_records = self.record_offsets.len() as u32;
        let table: Vec<u8> = self
            .record_offsets
            .iter()
            .flat_map(|off| off.to_le_bytes())
            .collect();
        self.ensure(table.len())?;
        let slot = self.slot.as_mut().unwrap();
        let table_off = slot.written() as u32;
        slot.write(&table);
        slot.patch(28, &num_records.to_le_bytes());
        slot.patch(32, &table_off.to_le_bytes());
        let slot = self.slot.take().unwrap();
        self.queue
            .commit(slot, MsgType::Event)
            .ok_or(BuildError::QueueClosed)
    }

    /// Discard the in-progress event.
    pub fn cancel(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.queue.rollback(slot);
        }
        self.record_offsets.clear();
        self.field_offsets.clear();
        self.record_start = None;
    }

    fn finish_record(&mut self) {
        let Some(start) = self.record_start.take() else {
            return;
        };
        let num_fields = self.field_offsets.len() as u16;
        let table: Vec<u8> = self
            .field_offsets
            .iter()
            .flat_map(|off| off.to_le_bytes())
            .collect();
        // field tables are small; the grow path cannot fail for a live slot
        if self.ensure(table.len()).is_err() {
            return;
        }
        let slot = self.slot.as_mut().unwrap();
        let table_off = slot.written() as u32;
        slot.write(&table);
        slot.patch(start + 6, &num_fields.to_le_bytes());
        slot.patch(start + 12, &table_off.to_le_bytes());
        self.field_offsets.clear();
    }

    fn ensure(&mut self, additional: usize) -> Result<(), BuildError> {
        let slot = self.slot.as_mut().expect("no event in progress");
        if slot.remaining() >= additional {
            return Ok(());
        }
        let new_cap = (slot.capacity() * 2).max(slot.written() + additional);
        let slot = self.slot.take().unwrap();
        match self.queue.regrow(slot, new_cap) {
            AllocResult::Slot(slot) => {
                self.slot = Some(slot);
                Ok(())
            }
            _ => Err(BuildError::QueueClosed),
        }
    }
}

/// Zero-copy view over a committed event payload.
#[derive(Clone, Copy)]
pub struct EventView<'a> {
    data: &'a [u8],
}

impl<'a> EventView<'a> {
    pub fn new(data: &'a [u8]) -> Option<EventView<'a>> {
        if data.len() < EVENT_HDR {
            return None;
        }
        let view = EventView { data };
        let table_end = view.record_table_off() as usize + view.num_records() * 4;
        if table_end > data.len() {
            return None;
        }
        Some(view)
    }

    fn u32_at(&self, off: usize) -> u32 {
        u32::from_le_bytes(self.data[off..off + 4].try_into().unwrap())
    }

    fn u64_at(&self, off: usize) -> u64 {
        u64::from_le_bytes(self.data[off..off + 8].try_into().unwrap())
    }

    pub fn sec(&self) -> u64 {
        self.u64_at(0)
    }

    pub fn msec(&self) -> u32 {
        self.u32_at(8)
    }

    pub fn pid(&self) -> i32 {
        i32::from_le_bytes(self.data[12..16].try_into().unwrap())
    }

    pub fn serial(&self) -> u64 {
        self.u64_at(16)
    }

    pub fn flags(&self) -> u32 {
        self.u32_at(24)
    }

    pub fn num_records(&self) -> usize {
        self.u32_at(28) as usize
    }

    fn record_table_off(&self) -> u32 {
        self.u32_at(32)
    }

    pub fn record(&self, idx: usize) -> Option<RecordView<'a>> {
        if idx >= self.num_records() {
            return None;
        }
        let off = self.u32_at(self.record_table_off() as usize + idx * 4) as usize;
        if off + RECORD_HDR > self.data.len() {
            return None;
        }
        Some(RecordView {
            data: self.data,
            off,
        })
    }

    pub fn records(&self) -> impl Iterator<Item = RecordView<'a>> + '_ {
        (0..self.num_records()).filter_map(move |idx| self.record(idx))
    }

    /// First record of the given type, if any.
    pub fn record_of_type(&self, type_code: u32) -> Option<RecordView<'a>> {
        self.records().find(|r| r.type_code() == type_code)
    }
}

#[derive(Clone, Copy)]
pub struct RecordView<'a> {
    data: &'a [u8],
    off: usize,
}

impl<'a> RecordView<'a> {
    fn u16_at(&self, rel: usize) -> u16 {
        let off = self.off + rel;
        u16::from_le_bytes(self.data[off..off + 2].try_into().unwrap())
    }

    fn u32_at(&self, rel: usize) -> u32 {
        let off = self.off + rel;
        u32::from_le_bytes(self.data[off..off + 4].try_into().unwrap())
    }

    pub fn type_code(&self) -> u32 {
        self.u32_at(0)
    }

    pub fn type_name(&self) -> &'a str {
        let start = self.off + RECORD_HDR;
        let end = start + self.u16_at(4) as usize;
        std::str::from_utf8(&self.data[start..end]).unwrap_or("")
    }

    pub fn raw_text(&self) -> &'a str {
        let start = self.off + RECORD_HDR + self.u16_at(4) as usize;
        let end = start + self.u32_at(8) as usize;
        std::str::from_utf8(&self.data[start..end]).unwrap_or("")
    }

    pub fn num_fields(&self) -> usize {
        self.u16_at(6) as usize
    }

    pub fn field(&self, idx: usize) -> Option<FieldView<'a>> {
        if idx >= self.num_fields() {
            return None;
        }
        let table = self.u32_at(12) as usize;
        let field_off =
            u32::from_le_bytes(self.data[table + idx * 4..table + idx * 4 + 4].try_into().unwrap())
                as usize;
        if field_off + FIELD_HDR > self.data.len() {
            return None;
        }
        Some(FieldView {
            data: self.data,
            off: field_off,
        })
    }

    pub fn fields(&self) -> impl Iterator<Item = FieldView<'a>> + '_ {
        (0..self.num_fields()).filter_map(move |idx| self.field(idx))
    }

    /// First field with the given name, in insertion order.
    pub fn field_by_name(&self, name: &str) -> Option<FieldView<'a>> {
        self.fields().find(|f| f.name() == name)
    }
}

#[derive(Clone, Copy)]
pub struct FieldView<'a> {
    data: &'a [u8],
    off: usize,
}

impl<'a> FieldView<'a> {
    fn u16_at(&self, rel: usize) -> u16 {
        let off = self.off + rel;
        u16::from_le_bytes(self.data[off..off + 2].try_into().unwrap())
    }

    fn u32_at(&self, rel: usize) -> u32 {
        let off = self.off + rel;
        u32::from_le_bytes(self.data[off..off + 4].try_into().unwrap())
    }

    pub fn name(&self) -> &'a str {
        let start = self.off + FIELD_HDR;
        let end = start + self.u16_at(0) as usize;
        std::str::from_utf8(&self.data[start..end]).unwrap_or("")
    }

    pub fn field_type(&self) -> FieldType {
        FieldType::from_u16(self.u16_at(2))
    }

    pub fn raw_value(&self) -> &'a str {
        let start = self.off + FIELD_HDR + self.u16_at(0) as usize;
        let end = start + self.u32_at(4) as usize;
        std::str::from_utf8(&self.data[start..end]).unwrap_or("")
    }

    /// Derived interpretation, empty when none was recorded.
    pub fn interp_value(&self) -> &'a str {
        let start =
            self.off + FIELD_HDR + self.u16_at(0) as usize + self.u32_at(4) as usize;
        let end = start + self.u32_at(8) as usize;
        std::str::from_utf8(&self.data[start..end]).unwrap_or("")
    }
}
