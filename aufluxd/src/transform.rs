use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;

use crate::config::Config;
use crate::event::{EventView, FieldView, GapReport, RecordView};
use crate::sink::MessageSink;
use crate::tables::FieldType;
use crate::userdb::UserDb;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldEmitMode {
    Raw,
    Interp,
    Both,
}

impl FieldEmitMode {
    fn emits_raw(self) -> bool {
        matches!(self, FieldEmitMode::Raw | FieldEmitMode::Both)
    }

    fn emits_interp(self) -> bool {
        matches!(self, FieldEmitMode::Interp | FieldEmitMode::Both)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldPrefixMode {
    RecordIndex,
    RecordTypeNumber,
    RecordTypeName,
}

/// Per-output message shaping options.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub msg_per_record: bool,
    pub include_full_raw_text: bool,
    pub raw_text_field_name: String,
    pub field_emit_mode: FieldEmitMode,
    pub field_name_separator: String,
    pub field_prefix_mode: FieldPrefixMode,
    pub timestamp_field_name: String,
    pub serial_field_name: String,
    pub msg_type_field_name: String,
    pub record_count_field_name: String,
    pub record_type_field_name: String,
    pub record_name_field_name: String,
    pub field_name_dedup_index_one_based: bool,
    pub field_name_dedup_index_global: bool,
    pub field_name_dedup_suffix_raw_field: bool,
    pub field_suffix: String,
    pub decode_escaped_field_values: bool,
    pub null_replacement: String,
    pub record_type_name_overrides: HashMap<u32, String>,
    pub field_name_overrides: HashMap<String, String>,
    pub interp_field_names: HashMap<String, String>,
    pub filter_record_types: HashSet<String>,
    pub record_filter_inclusive_mode: bool,
    pub filter_field_names: HashSet<String>,
    pub always_filter_field_names: HashSet<String>,
    pub field_filter_inclusive_mode: bool,
    pub other_fields_mode: bool,
    pub other_fields_field_name: String,
    pub additional_fields: Vec<(String, String)>,
}

impl WriterConfig {
    pub fn default_for(msg_per_record: bool) -> WriterConfig {
        WriterConfig {
            msg_per_record,
            include_full_raw_text: true,
            raw_text_field_name: "raw".to_string(),
            field_emit_mode: FieldEmitMode::Both,
            field_name_separator: "-".to_string(),
            field_prefix_mode: FieldPrefixMode::RecordTypeName,
            timestamp_field_name: "timestamp".to_string(),
            serial_field_name: "serial".to_string(),
            msg_type_field_name: "type".to_string(),
            record_count_field_name: "record-count".to_string(),
            record_type_field_name: if msg_per_record {
                "record-type".to_string()
            } else {
                "record-types".to_string()
            },
            record_name_field_name: if msg_per_record {
                "record-name".to_string()
            } else {
                "record-names".to_string()
            },
            field_name_dedup_index_one_based: true,
            field_name_dedup_index_global: false,
            field_name_dedup_suffix_raw_field: false,
            field_suffix: "-i".to_string(),
            decode_escaped_field_values: true,
            null_replacement: " ".to_string(),
            record_type_name_overrides: HashMap::new(),
            field_name_overrides: HashMap::new(),
            interp_field_names: HashMap::new(),
            filter_record_types: HashSet::new(),
            record_filter_inclusive_mode: false,
            filter_field_names: HashSet::new(),
            always_filter_field_names: HashSet::new(),
            field_filter_inclusive_mode: false,
            other_fields_mode: false,
            other_fields_field_name: "other-fields".to_string(),
            additional_fields: Vec::new(),
        }
    }

    /// Build from an output's config file; unknown values are errors so a
    /// bad reload keeps the previous config.
    pub fn load(config: &Config) -> Result<WriterConfig, String> {
        let msg_per_record = config.bool_or("msg_per_record", false);
        let mut wc = WriterConfig::default_for(msg_per_record);

        wc.include_full_raw_text =
            config.bool_or("include_full_raw_text", wc.include_full_raw_text);
        if config.has_key("field_emit_mode") {
            wc.field_emit_mode = match config.string_or("field_emit_mode", "").as_str() {
                "raw" => FieldEmitMode::Raw,
                "interp" => FieldEmitMode::Interp,
                "both" => FieldEmitMode::Both,
                other => return Err(format!("invalid field_emit_mode '{other}'")),
            };
        }
        if config.has_key("field_prefix_mode") {
            wc.field_prefix_mode = match config.string_or("field_prefix_mode", "").as_str() {
                "index" => FieldPrefixMode::RecordIndex,
                "type_number" => FieldPrefixMode::RecordTypeNumber,
                "type_name" => FieldPrefixMode::RecordTypeName,
                other => return Err(format!("invalid field_prefix_mode '{other}'")),
            };
        }

        let string_keys: [(&str, &mut String); 10] = [
            ("raw_text_field_name", &mut wc.raw_text_field_name),
            ("field_name_separator", &mut wc.field_name_separator),
            ("timestamp_field_name", &mut wc.timestamp_field_name),
            ("serial_field_name", &mut wc.serial_field_name),
            ("msg_type_field_name", &mut wc.msg_type_field_name),
            ("record_count_field_name", &mut wc.record_count_field_name),
            ("record_type_field_name", &mut wc.record_type_field_name),
            ("record_name_field_name", &mut wc.record_name_field_name),
            ("field_suffix", &mut wc.field_suffix),
            ("null_replacement", &mut wc.null_replacement),
        ];
        for (key, slot) in string_keys {
            if config.has_key(key) {
                *slot = config.string_or(key, "");
            }
        }
        if config.has_key("other_fields_field_name") {
            wc.other_fields_field_name = config.string_or("other_fields_field_name", "");
        }

        wc.field_name_dedup_index_one_based = config.bool_or(
            "field_name_dedup_index_one_based",
            wc.field_name_dedup_index_one_based,
        );
        wc.field_name_dedup_index_global = config.bool_or(
            "field_name_dedup_index_global",
            wc.field_name_dedup_index_global,
        );
        wc.field_name_dedup_suffix_raw_field = config.bool_or(
            "field_name_dedup_suffix_raw_field",
            wc.field_name_dedup_suffix_raw_field,
        );
        wc.decode_escaped_field_values = config.bool_or(
            "decode_escaped_field_values",
            wc.decode_escaped_field_values,
        );
        wc.record_filter_inclusive_mode = config.bool_or(
            "record_filter_inclusive_mode",
            wc.record_filter_inclusive_mode,
        );
        wc.field_filter_inclusive_mode = config.bool_or(
            "field_filter_inclusive_mode",
            wc.field_filter_inclusive_mode,
        );
        wc.other_fields_mode = config.bool_or("other_fields_mode", wc.other_fields_mode);

        if config.has_key("record_type_name_overrides") {
            let doc = json_value(config, "record_type_name_overrides")?;
            let obj = doc
                .as_object()
                .ok_or("record_type_name_overrides must be an object")?;
            for (key, value) in obj {
                let code: u32 = key.parse().map_err(|_| {
                    format!("invalid record code '{key}' in record_type_name_overrides")
                })?;
                let name = value
                    .as_str()
                    .ok_or("record_type_name_overrides values must be strings")?;
                wc.record_type_name_overrides.insert(code, name.to_string());
            }
        }
        for (key, target) in [
            ("field_name_overrides", &mut wc.field_name_overrides),
            ("interp_field_names", &mut wc.interp_field_names),
        ] {
            if config.has_key(key) {
                let doc = json_value(config, key)?;
                let obj = doc.as_object().ok_or_else(|| format!("{key} must be an object"))?;
                for (name, value) in obj {
                    let mapped = value
                        .as_str()
                        .ok_or_else(|| format!("{key} values must be strings"))?;
                    target.insert(name.clone(), mapped.to_string());
                }
            }
        }
        for (key, target) in [
            ("filter_record_types", &mut wc.filter_record_types),
            ("filter_field_names", &mut wc.filter_field_names),
            (
                "always_filter_field_names",
                &mut wc.always_filter_field_names,
            ),
        ] {
            if config.has_key(key) {
                let doc = json_value(config, key)?;
                let list = doc.as_array().ok_or_else(|| format!("{key} must be an array"))?;
                for value in list {
                    let name = value
                        .as_str()
                        .ok_or_else(|| format!("{key} entries must be strings"))?;
                    target.insert(name.to_string());
                }
            }
        }
        if config.has_key("additional_fields") {
            let doc = json_value(config, "additional_fields")?;
            let obj = doc
                .as_object()
                .ok_or("additional_fields must be an object")?;
            for (name, value) in obj {
                let text = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                wc.additional_fields.push((name.clone(), text));
            }
            wc.additional_fields.sort();
        }
        Ok(wc)
    }

    fn record_included(&self, name: &str) -> bool {
        if self.filter_record_types.is_empty() && !self.record_filter_inclusive_mode {
            return true;
        }
        self.filter_record_types.contains(name) == self.record_filter_inclusive_mode
    }

    fn field_included(&self, name: &str) -> bool {
        if self.filter_field_names.is_empty() && !self.field_filter_inclusive_mode {
            return true;
        }
        self.filter_field_names.contains(name) == self.field_filter_inclusive_mode
    }
}

fn json_value(config: &Config, key: &str) -> Result<serde_json::Value, String> {
    config.get_json(key).map_err(|e| e.to_string())
}

/// Reshapes queue events into per-output messages.
pub struct EventTransformer {
    config: Arc<WriterConfig>,
    tag: String,
    user_db: Option<Arc<UserDb>>,
}

impl EventTransformer {
    pub fn new(
        config: Arc<WriterConfig>,
        tag: String,
        user_db: Option<Arc<UserDb>>,
    ) -> EventTransformer {
        EventTransformer {
            config,
            tag,
            user_db,
        }
    }

    pub fn process_event(&self, event: &EventView, sink: &mut dyn MessageSink) -> io::Result<()> {
        let cfg = &self.config;
        // resolve names and apply the record filter up front
        let mut records: Vec<(usize, RecordView, String)> = Vec::new();
        let mut type_counts: HashMap<String, usize> = HashMap::new();
        for (idx, rec) in event.records().enumerate() {
            let name = match cfg.record_type_name_overrides.get(&rec.type_code()) {
                Some(over) => over.clone(),
                None => rec.type_name().to_string(),
            };
            if !cfg.record_included(&name) {
                continue;
            }
            *type_counts.entry(name.clone()).or_default() += 1;
            records.push((idx, rec, name));
        }
        if records.is_empty() {
            return Ok(());
        }

        if !cfg.msg_per_record {
            self.begin_message(event, sink);
            sink.add_i64_field(&cfg.record_count_field_name, records.len() as i64);
            let types: Vec<String> = records
                .iter()
                .map(|(_, rec, _)| rec.type_code().to_string())
                .collect();
            sink.add_str_field(&cfg.record_type_field_name, &types.join(","));
            let names: Vec<&str> = records.iter().map(|(_, _, name)| name.as_str()).collect();
            sink.add_str_field(&cfg.record_name_field_name, &names.join(","));
        }

        let mut type_indexes: HashMap<&str, usize> = HashMap::new();
        for (emit_idx, (_, rec, name)) in records.iter().enumerate() {
            let type_idx = {
                let slot = type_indexes.entry(name.as_str()).or_default();
                let current = *slot;
                *slot += 1;
                current
            };
            if cfg.msg_per_record {
                self.begin_message(event, sink);
            }
            self.process_record(
                rec,
                emit_idx,
                name,
                type_idx,
                type_counts[name.as_str()],
                sink,
            );
            if cfg.msg_per_record {
                sink.end_message()?;
            }
        }

        if !cfg.msg_per_record {
            sink.end_message()?;
        }
        Ok(())
    }

    /// Serial discontinuities become their own message type.
    pub fn process_gap(&self, gap: &GapReport, sink: &mut dyn MessageSink) -> io::Result<()> {
        let cfg = &self.config;
        let sep = &cfg.field_name_separator;
        sink.begin_message(&self.tag, gap.end_sec, gap.end_msec);
        sink.add_timestamp_field(&cfg.timestamp_field_name, gap.end_sec, gap.end_msec);
        sink.add_str_field(&cfg.msg_type_field_name, "AUDIT_EVENT_GAP");
        sink.add_time_field(
            &format!("START{sep}{}", cfg.timestamp_field_name),
            gap.start_sec,
            gap.start_msec,
        );
        sink.add_u64_field(
            &format!("START{sep}{}", cfg.serial_field_name),
            gap.start_serial,
        );
        sink.add_time_field(
            &format!("END{sep}{}", cfg.timestamp_field_name),
            gap.end_sec,
            gap.end_msec,
        );
        sink.add_u64_field(&format!("END{sep}{}", cfg.serial_field_name), gap.end_serial);
        sink.end_message()
    }

    fn begin_message(&self, event: &EventView, sink: &mut dyn MessageSink) {
        let cfg = &self.config;
        sink.begin_message(&self.tag, event.sec(), event.msec());
        sink.add_timestamp_field(&cfg.timestamp_field_name, event.sec(), event.msec());
        sink.add_u64_field(&cfg.serial_field_name, event.serial());
        if cfg.msg_per_record {
            sink.add_str_field(&cfg.msg_type_field_name, "AUDIT_EVENT_RECORD");
        } else {
            sink.add_str_field(&cfg.msg_type_field_name, "AUDIT_EVENT");
        }
        for (name, value) in &cfg.additional_fields {
            sink.add_str_field(name, value);
        }
    }

    fn process_record(
        &self,
        rec: &RecordView,
        record_idx: usize,
        record_name: &str,
        record_type_idx: usize,
        record_type_count: usize,
        sink: &mut dyn MessageSink,
    ) {
        let cfg = &self.config;
        let mut prefix = String::new();
        if cfg.msg_per_record {
            sink.add_i64_field(&cfg.record_type_field_name, rec.type_code() as i64);
            sink.add_str_field(&cfg.record_name_field_name, record_name);
        } else {
            match cfg.field_prefix_mode {
                FieldPrefixMode::RecordIndex => {
                    prefix.push_str(&record_idx.to_string());
                }
                FieldPrefixMode::RecordTypeNumber => {
                    prefix.push_str(&rec.type_code().to_string());
                }
                FieldPrefixMode::RecordTypeName => {
                    prefix.push_str(record_name);
                }
            }
            prefix.push_str(&cfg.field_name_separator);
            if cfg.field_prefix_mode != FieldPrefixMode::RecordIndex && record_type_count > 1 {
                let mut idx = if cfg.field_name_dedup_index_global {
                    record_idx
                } else {
                    record_type_idx
                };
                if cfg.field_name_dedup_index_one_based {
                    idx += 1;
                }
                prefix.push_str(&idx.to_string());
                prefix.push_str(&cfg.field_name_separator);
            }
        }

        if cfg.include_full_raw_text {
            sink.add_str_field(
                &format!("{prefix}{}", cfg.raw_text_field_name),
                rec.raw_text(),
            );
        }

        let mut other_fields: Vec<(String, String)> = Vec::new();
        for field in rec.fields() {
            let name = field.name();
            if cfg.always_filter_field_names.contains(name) {
                continue;
            }
            if !cfg.field_included(name) {
                if cfg.other_fields_mode {
                    other_fields.push((name.to_string(), self.raw_emit_value(&field)));
                }
                continue;
            }
            self.process_field(&field, &prefix, sink);
        }
        if !other_fields.is_empty() {
            let mut obj = serde_json::Map::new();
            for (name, value) in other_fields {
                obj.entry(name).or_insert(serde_json::Value::String(value));
            }
            let text = serde_json::Value::Object(obj).to_string();
            sink.add_str_field(
                &format!("{prefix}{}", cfg.other_fields_field_name),
                &text,
            );
        }
    }

    fn raw_emit_value(&self, field: &FieldView) -> String {
        let cfg = &self.config;
        let raw = field.raw_value();
        let escaped = matches!(
            field.field_type(),
            FieldType::Escaped | FieldType::Proctitle
        );
        if escaped && cfg.decode_escaped_field_values {
            unescape(raw, &cfg.null_replacement)
        } else {
            raw.to_string()
        }
    }

    fn interp_for(&self, field: &FieldView) -> Option<String> {
        let recorded = field.interp_value();
        if !recorded.is_empty() {
            return Some(recorded.to_string());
        }
        let raw = field.raw_value();
        match field.field_type() {
            // uid/gid names are resolved at emit time so a late-arriving
            // user db update still takes effect
            FieldType::Uid => {
                if raw == "4294967295" || raw == "-1" {
                    return Some("unset".to_string());
                }
                let db = self.user_db.as_ref()?;
                let name = db.lookup_user(raw.parse().ok()?);
                (!name.is_empty()).then_some(name)
            }
            FieldType::Gid => {
                if raw == "4294967295" || raw == "-1" {
                    return Some("unset".to_string());
                }
                let db = self.user_db.as_ref()?;
                let name = db.lookup_group(raw.parse().ok()?);
                (!name.is_empty()).then_some(name)
            }
            FieldType::Sockaddr => decode_sockaddr(raw),
            _ => None,
        }
    }

    fn process_field(&self, field: &FieldView, prefix: &str, sink: &mut dyn MessageSink) {
        let cfg = &self.config;
        let base_name = match cfg.field_name_overrides.get(field.name()) {
            Some(over) => over.as_str(),
            None => field.name(),
        };
        let raw_value = self.raw_emit_value(field);

        if cfg.field_emit_mode.emits_raw() {
            let mut name = format!("{prefix}{base_name}");
            if cfg.field_emit_mode == FieldEmitMode::Both && cfg.field_name_dedup_suffix_raw_field
            {
                name.push_str(&cfg.field_suffix);
            }
            sink.add_str_field(&name, &raw_value);
        }

        if cfg.field_emit_mode.emits_interp() {
            let Some(interp) = self.interp_for(field) else {
                return;
            };
            // a matching interpretation adds nothing; emit one copy only
            if interp == raw_value {
                return;
            }
            let name = match cfg.interp_field_names.get(field.name()) {
                Some(mapped) => format!("{prefix}{mapped}"),
                None => {
                    let mut name = format!("{prefix}{base_name}");
                    if cfg.field_emit_mode == FieldEmitMode::Both
                        && !cfg.field_name_dedup_suffix_raw_field
                    {
                        name.push_str(&cfg.field_suffix);
                    }
                    name
                }
            };
            sink.add_str_field(&name, &interp);
        }
    }
}

/// Hex-decode an escaped audit value. Odd-length or non-hex input is
/// returned unchanged; decoded NULs become `null_replacement` and bytes
/// outside printable ASCII are re-escaped as `\xXX`.
pub fn decode_hex(hex: &str, null_replacement: &str) -> String {
    if hex.len() % 2 != 0 {
        return hex.to_string();
    }
    let mut out = String::with_capacity(hex.len());
    for pair in hex.as_bytes().chunks_exact(2) {
        let hi = (pair[0] as char).to_digit(16);
        let lo = (pair[1] as char).to_digit(16);
        let (hi, lo) = match (hi, lo) {
            (Some(hi), Some(lo)) => (hi, lo),
            _ => return hex.to_string(),
        };
        let byte = (hi * 16 + lo) as u8;
        if byte == 0 {
            out.push_str(null_replacement);
        } else if (0x20..0x7f).contains(&byte) {
            out.push(byte as char);
        } else {
            out.push_str(&format!("\\x{hi:X}{lo:X}"));
        }
    }
    out
}

/// Unwrap a quoted value, or hex-decode an escaped one.
pub fn unescape(value: &str, null_replacement: &str) -> String {
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        return value[1..value.len() - 1].to_string();
    }
    if value == "(null)" {
        return value.to_string();
    }
    decode_hex(value, null_replacement)
}

/// Render a hex-encoded sockaddr as a readable summary.
fn decode_sockaddr(hex: &str) -> Option<String> {
    if hex.len() < 4 || hex.len() % 2 != 0 {
        return None;
    }
    let mut bytes = Vec::with_capacity(hex.len() / 2);
    for pair in hex.as_bytes().chunks_exact(2) {
        let hi = (pair[0] as char).to_digit(16)?;
        let lo = (pair[1] as char).to_digit(16)?;
        bytes.push((hi * 16 + lo) as u8);
    }
    let family = u16::from_le_bytes([bytes[0], bytes[1]]);
    match family as i32 {
        libc::AF_INET if bytes.len() >= 8 => {
            let port = u16::from_be_bytes([bytes[2], bytes[3]]);
            let addr = format!("{}.{}.{}.{}", bytes[4], bytes[5], bytes[6], bytes[7]);
            Some(format!("inet addr={addr} port={port}"))
        }
        libc::AF_INET6 if bytes.len() >= 24 => {
            let port = u16::from_be_bytes([bytes[2], bytes[3]]);
            let groups: Vec<String> = bytes[8..24]
                .chunks_exact(2)
                .map(|g| format!("{:x}", u16::from_be_bytes([g[0], g[1]])))
                .collect();
            Some(format!("inet6 addr={} port={port}", groups.join(":")))
        }
        libc::AF_UNIX => {
            let path: Vec<u8> = bytes[2..]
                .iter()
                .copied()
                .take_while(|b| *b != 0)
                .collect();
            if path.is_empty() {
                Some("local".to_string())
            } else {
                Some(format!("local path={}", String::from_utf8_lossy(&path)))
            }
        }
        libc::AF_NETLINK if bytes.len() >= 8 => {
            let pid = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
            Some(format!("netlink pid={pid}"))
        }
        other => Some(format!("unknown family ({other})")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventBuilder, EventView};
    use crate::queue::{Queue, ReadResult, MIN_QUEUE_SIZE};
    use crate::sink::test_support::{deframe, BufferWriter};
    use crate::sink::JsonSink;
    use std::time::Duration;

    struct RecordSpec {
        code: u32,
        name: &'static str,
        text: &'static str,
        fields: Vec<(&'static str, &'static str, Option<&'static str>, FieldType)>,
    }

    fn build_event(records: Vec<RecordSpec>) -> (tempfile::TempDir, Vec<u8>) {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(Queue::open(&dir.path().join("q.dat"), MIN_QUEUE_SIZE).unwrap());
        queue.register_cursor("c", 0);
        let mut builder = EventBuilder::new(Arc::clone(&queue));
        builder.begin(1600000000, 123, 42).unwrap();
        builder.set_pid(99);
        for rec in &records {
            builder.add_record(rec.code, rec.name, rec.text).unwrap();
            for (name, raw, interp, ftype) in &rec.fields {
                builder.add_field(name, raw, *interp, *ftype).unwrap();
            }
        }
        builder.end().unwrap();
        let mut buf = Vec::new();
        match queue.get("c", &mut buf, Some(Duration::from_millis(100))) {
            ReadResult::Item(_) => {}
            other => panic!("unexpected: {other:?}"),
        }
        (dir, buf)
    }

    fn syscall_event() -> (tempfile::TempDir, Vec<u8>) {
        build_event(vec![
            RecordSpec {
                code: 1300,
                name: "SYSCALL",
                text: "arch=c000003e syscall=59 uid=0",
                fields: vec![
                    ("arch", "c000003e", Some("x86_64"), FieldType::Arch),
                    ("syscall", "59", Some("execve"), FieldType::Syscall),
                    ("uid", "0", None, FieldType::Uid),
                    ("key", "(null)", None, FieldType::Escaped),
                ],
            },
            RecordSpec {
                code: 1302,
                name: "PATH",
                text: "item=0 name=2F746D702F00666F6F",
                fields: vec![
                    ("item", "0", None, FieldType::Unclassified),
                    ("name", "2F746D702F00666F6F", None, FieldType::Escaped),
                ],
            },
            RecordSpec {
                code: 1302,
                name: "PATH",
                text: "item=1 name=\"/etc\"",
                fields: vec![
                    ("item", "1", None, FieldType::Unclassified),
                    ("name", "\"/etc\"", None, FieldType::Escaped),
                ],
            },
        ])
    }

    fn transform_to_json(
        config: WriterConfig,
        payload: &[u8],
        user_db: Option<Arc<UserDb>>,
    ) -> Vec<serde_json::Value> {
        let (writer, data) = BufferWriter::new();
        let mut sink = JsonSink::new(Box::new(writer));
        let transformer = EventTransformer::new(Arc::new(config), "audit".to_string(), user_db);
        let event = EventView::new(payload).unwrap();
        transformer.process_event(&event, &mut sink).unwrap();
        let captured = data.lock().unwrap();
        deframe(&captured)
            .into_iter()
            .map(|frame| serde_json::from_slice(&frame).unwrap())
            .collect()
    }

    #[test]
    fn one_message_per_event_with_prefixes() {
        let (_dir, payload) = syscall_event();
        let msgs = transform_to_json(WriterConfig::default_for(false), &payload, None);
        assert_eq!(msgs.len(), 1);
        let msg = &msgs[0];
        assert_eq!(msg["timestamp"], "1600000000.123");
        assert_eq!(msg["serial"], 42);
        assert_eq!(msg["type"], "AUDIT_EVENT");
        assert_eq!(msg["record-count"], 3);
        assert_eq!(msg["record-types"], "1300,1302,1302");
        assert_eq!(msg["record-names"], "SYSCALL,PATH,PATH");
        // single SYSCALL record is not dedup-indexed
        assert_eq!(msg["SYSCALL-syscall"], "59");
        assert_eq!(msg["SYSCALL-syscall-i"], "execve");
        // two PATH records pick up one-based dedup indexes
        assert_eq!(msg["PATH-1-item"], "0");
        assert_eq!(msg["PATH-2-item"], "1");
        // escaped values decode, NUL replaced by the default replacement
        assert_eq!(msg["PATH-1-name"], "/tmp/ foo");
        assert_eq!(msg["PATH-2-name"], "/etc");
        assert!(msg.get("PATH-2-name-i").is_none());
    }

    #[test]
    fn one_message_per_record() {
        let (_dir, payload) = syscall_event();
        let msgs = transform_to_json(WriterConfig::default_for(true), &payload, None);
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[0]["type"], "AUDIT_EVENT_RECORD");
        assert_eq!(msgs[0]["record-type"], 1300);
        assert_eq!(msgs[0]["record-name"], "SYSCALL");
        assert_eq!(msgs[0]["syscall"], "59");
        assert_eq!(msgs[1]["record-name"], "PATH");
        assert_eq!(msgs[1]["item"], "0");
        assert_eq!(msgs[2]["item"], "1");
    }

    #[test]
    fn equal_raw_and_interp_emit_once() {
        let (_dir, payload) = build_event(vec![RecordSpec {
            code: 1300,
            name: "SYSCALL",
            text: "",
            fields: vec![("ses", "7", Some("7"), FieldType::Session)],
        }]);
        let msgs = transform_to_json(WriterConfig::default_for(false), &payload, None);
        assert_eq!(msgs[0]["SYSCALL-ses"], "7");
        assert!(msgs[0].get("SYSCALL-ses-i").is_none());
    }

    #[test]
    fn raw_suffix_mode_swaps_suffixed_copy() {
        let (_dir, payload) = build_event(vec![RecordSpec {
            code: 1300,
            name: "SYSCALL",
            text: "",
            fields: vec![("syscall", "59", Some("execve"), FieldType::Syscall)],
        }]);
        let mut config = WriterConfig::default_for(false);
        config.field_name_dedup_suffix_raw_field = true;
        let msgs = transform_to_json(config, &payload, None);
        assert_eq!(msgs[0]["SYSCALL-syscall-i"], "59");
        assert_eq!(msgs[0]["SYSCALL-syscall"], "execve");
    }

    #[test]
    fn interp_only_mode_drops_uninterpreted_fields() {
        let (_dir, payload) = build_event(vec![RecordSpec {
            code: 1300,
            name: "SYSCALL",
            text: "",
            fields: vec![
                ("syscall", "59", Some("execve"), FieldType::Syscall),
                ("a0", "55d0", None, FieldType::Unclassified),
            ],
        }]);
        let mut config = WriterConfig::default_for(false);
        config.field_emit_mode = FieldEmitMode::Interp;
        let msgs = transform_to_json(config, &payload, None);
        assert_eq!(msgs[0]["SYSCALL-syscall"], "execve");
        assert!(msgs[0].get("SYSCALL-a0").is_none());
    }

    #[test]
    fn uid_resolves_through_user_db_at_emit_time() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("passwd"), "root:x:0:0::/root:/bin/sh\n").unwrap();
        std::fs::write(dir.path().join("group"), "root:x:0:\n").unwrap();
        let db = UserDb::new(dir.path());
        db.update();

        let (_qdir, payload) = build_event(vec![RecordSpec {
            code: 1300,
            name: "SYSCALL",
            text: "",
            fields: vec![
                ("uid", "0", None, FieldType::Uid),
                ("auid", "4294967295", None, FieldType::Uid),
                ("gid", "12345", None, FieldType::Gid),
            ],
        }]);
        let msgs = transform_to_json(WriterConfig::default_for(false), &payload, Some(db));
        assert_eq!(msgs[0]["SYSCALL-uid"], "0");
        assert_eq!(msgs[0]["SYSCALL-uid-i"], "root");
        assert_eq!(msgs[0]["SYSCALL-auid-i"], "unset");
        // unknown gid has no interpretation
        assert!(msgs[0].get("SYSCALL-gid-i").is_none());
    }

    #[test]
    fn record_filter_exclusive_drops_listed_types() {
        let (_dir, payload) = syscall_event();
        let mut config = WriterConfig::default_for(false);
        config.filter_record_types.insert("PATH".to_string());
        let msgs = transform_to_json(config, &payload, None);
        assert_eq!(msgs[0]["record-count"], 1);
        assert_eq!(msgs[0]["record-names"], "SYSCALL");
    }

    #[test]
    fn record_filter_inclusive_keeps_only_listed_types() {
        let (_dir, payload) = syscall_event();
        let mut config = WriterConfig::default_for(false);
        config.filter_record_types.insert("PATH".to_string());
        config.record_filter_inclusive_mode = true;
        let msgs = transform_to_json(config, &payload, None);
        assert_eq!(msgs[0]["record-count"], 2);
        assert_eq!(msgs[0]["record-names"], "PATH,PATH");
    }

    #[test]
    fn field_filters_and_other_fields_bundle() {
        let (_dir, payload) = build_event(vec![RecordSpec {
            code: 1300,
            name: "SYSCALL",
            text: "",
            fields: vec![
                ("syscall", "59", Some("execve"), FieldType::Syscall),
                ("a0", "1", None, FieldType::Unclassified),
                ("a1", "2", None, FieldType::Unclassified),
                ("ses", "1", None, FieldType::Session),
            ],
        }]);
        let mut config = WriterConfig::default_for(false);
        config.filter_field_names.insert("syscall".to_string());
        config.field_filter_inclusive_mode = true;
        config.always_filter_field_names.insert("ses".to_string());
        config.other_fields_mode = true;
        let msgs = transform_to_json(config, &payload, None);
        assert_eq!(msgs[0]["SYSCALL-syscall"], "59");
        assert!(msgs[0].get("SYSCALL-a0").is_none());
        let other: serde_json::Value =
            serde_json::from_str(msgs[0]["SYSCALL-other-fields"].as_str().unwrap()).unwrap();
        assert_eq!(other["a0"], "1");
        assert_eq!(other["a1"], "2");
        // always-filtered fields do not even reach the bundle
        assert!(other.get("ses").is_none());
    }

    #[test]
    fn name_overrides_apply() {
        let (_dir, payload) = build_event(vec![RecordSpec {
            code: 1300,
            name: "SYSCALL",
            text: "",
            fields: vec![("syscall", "59", Some("execve"), FieldType::Syscall)],
        }]);
        let mut config = WriterConfig::default_for(false);
        config
            .record_type_name_overrides
            .insert(1300, "Syscall".to_string());
        config
            .field_name_overrides
            .insert("syscall".to_string(), "call_id".to_string());
        config
            .interp_field_names
            .insert("syscall".to_string(), "call_name".to_string());
        let msgs = transform_to_json(config, &payload, None);
        assert_eq!(msgs[0]["record-names"], "Syscall");
        assert_eq!(msgs[0]["Syscall-call_id"], "59");
        assert_eq!(msgs[0]["Syscall-call_name"], "execve");
    }

    #[test]
    fn additional_fields_attach_to_every_message() {
        let (_dir, payload) = syscall_event();
        let mut config = WriterConfig::default_for(true);
        config
            .additional_fields
            .push(("Computer".to_string(), "host01".to_string()));
        let msgs = transform_to_json(config, &payload, None);
        assert_eq!(msgs.len(), 3);
        for msg in msgs {
            assert_eq!(msg["Computer"], "host01");
        }
    }

    #[test]
    fn gap_message_shape() {
        let (writer, data) = BufferWriter::new();
        let mut sink = JsonSink::new(Box::new(writer));
        let transformer = EventTransformer::new(
            Arc::new(WriterConfig::default_for(false)),
            "audit".to_string(),
            None,
        );
        let gap = GapReport {
            start_sec: 1600000001,
            start_msec: 500,
            start_serial: 102,
            end_sec: 1600000009,
            end_msec: 900,
            end_serial: 199,
        };
        transformer.process_gap(&gap, &mut sink).unwrap();
        let frames = deframe(&data.lock().unwrap());
        let msg: serde_json::Value = serde_json::from_slice(&frames[0]).unwrap();
        assert_eq!(msg["type"], "AUDIT_EVENT_GAP");
        assert_eq!(msg["START-serial"], 102);
        assert_eq!(msg["END-serial"], 199);
        assert_eq!(msg["START-timestamp"], "1600000001.500");
        assert_eq!(msg["END-timestamp"], "1600000009.900");
    }

    #[test]
    fn decode_hex_behavior() {
        assert_eq!(decode_hex("2F746D70", " "), "/tmp");
        // odd length and non-hex pass through unchanged
        assert_eq!(decode_hex("2F746D7", " "), "2F746D7");
        assert_eq!(decode_hex("zz55", " "), "zz55");
        // NULs replaced, non-printables re-escaped
        assert_eq!(decode_hex("410042", "_"), "A_B");
        assert_eq!(decode_hex("41095A", " "), "A\\x09Z");
        assert_eq!(decode_hex("41FF", " "), "A\\xFF");
    }

    #[test]
    fn unescape_behavior() {
        assert_eq!(unescape("\"/bin/ls\"", " "), "/bin/ls");
        assert_eq!(unescape("(null)", " "), "(null)");
        assert_eq!(unescape("2F746D70", " "), "/tmp");
        assert_eq!(unescape("odd", " "), "odd");
    }

    #[test]
    fn sockaddr_decoding() {
        // AF_INET 127.0.0.1:8080
        assert_eq!(
            decode_sockaddr("02001F907F000001").as_deref(),
            Some("inet addr=127.0.0.1 port=8080")
        );
        // AF_UNIX path
        let mut hex = String::from("0100");
        for b in b"/run/x.sock" {
            hex.push_str(&format!("{b:02X}"));
        }
        assert_eq!(
            decode_sockaddr(&hex).as_deref(),
            Some("local path=/run/x.sock")
        );
        assert_eq!(decode_sockaddr("zz"), None);
    }

    #[test]
    fn writer_config_loads_from_output_config() {
        let text = concat!(
            "msg_per_record = false\n",
            "field_emit_mode = interp\n",
            "field_prefix_mode = type_number\n",
            "include_full_raw_text = off\n",
            "field_suffix = _i\n",
            "timestamp_field_name = Timestamp\n",
            "record_type_name_overrides = {\"1300\": \"Syscall\"}\n",
            "field_name_overrides = {\"uid\": \"user_id\"}\n",
            "filter_record_types = [\"PROCTITLE\"]\n",
            "always_filter_field_names = [\"ses\"]\n",
            "additional_fields = {\"Computer\": \"h1\"}\n",
        );
        let config = Config::parse(text).unwrap();
        let wc = WriterConfig::load(&config).unwrap();
        assert!(!wc.msg_per_record);
        assert_eq!(wc.field_emit_mode, FieldEmitMode::Interp);
        assert_eq!(wc.field_prefix_mode, FieldPrefixMode::RecordTypeNumber);
        assert!(!wc.include_full_raw_text);
        assert_eq!(wc.field_suffix, "_i");
        assert_eq!(wc.timestamp_field_name, "Timestamp");
        assert_eq!(wc.record_type_name_overrides[&1300], "Syscall");
        assert_eq!(wc.field_name_overrides["uid"], "user_id");
        assert!(wc.filter_record_types.contains("PROCTITLE"));
        assert!(wc.always_filter_field_names.contains("ses"));
        assert_eq!(
            wc.additional_fields,
            [("Computer".to_string(), "h1".to_string())]
        );
    }

    #[test]
    fn writer_config_rejects_bad_modes() {
        let config = Config::parse("field_emit_mode = banana\n").unwrap();
        assert!(WriterConfig::load(&config).is_err());
    }
}
