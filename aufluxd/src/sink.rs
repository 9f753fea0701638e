use std::collections::HashMap;
use std::io;
use std::sync::Mutex;

use once_cell::sync::Lazy;

use crate::config::Config;
use crate::output::OutputWriter;

/// Capability surface of a framed message encoder bound to an output.
///
/// `begin_message` starts a new message, `add_*` append fields,
/// `end_message` frames and writes the result, `cancel_message` discards the
/// partial message.
pub trait MessageSink: Send {
    fn begin_message(&mut self, tag: &str, sec: u64, msec: u32);
    fn add_str_field(&mut self, name: &str, value: &str);
    fn add_i64_field(&mut self, name: &str, value: i64);
    fn add_u64_field(&mut self, name: &str, value: u64);
    fn add_bool_field(&mut self, name: &str, value: bool);
    fn add_timestamp_field(&mut self, name: &str, sec: u64, msec: u32);
    fn add_time_field(&mut self, name: &str, sec: u64, msec: u32);
    fn end_message(&mut self) -> io::Result<()>;
    fn cancel_message(&mut self);

    fn is_open(&self) -> bool;
    fn open(&mut self) -> io::Result<()>;
    fn close(&mut self);
}

/// `<sec>` or `<sec>.<msec>` with milliseconds zero-padded.
pub fn format_time(sec: u64, msec: u32) -> String {
    if msec > 0 {
        format!("{sec}.{msec:03}")
    } else {
        format!("{sec}")
    }
}

fn frame_and_write(writer: &mut dyn OutputWriter, payload: &[u8]) -> io::Result<()> {
    let mut framed = Vec::with_capacity(payload.len() + 12);
    framed.extend_from_slice(format!("{}\n", payload.len()).as_bytes());
    framed.extend_from_slice(payload);
    writer.write_all(&framed)
}

/// Streaming JSON object encoder; field order follows insertion order.
pub struct JsonSink {
    writer: Box<dyn OutputWriter>,
    buf: String,
    active: bool,
}

impl JsonSink {
    pub fn new(writer: Box<dyn OutputWriter>) -> JsonSink {
        JsonSink {
            writer,
            buf: String::new(),
            active: false,
        }
    }

    fn push_name(&mut self, name: &str) {
        if self.buf.len() > 1 {
            self.buf.push(',');
        }
        self.buf.push_str(&serde_json::to_string(name).unwrap_or_default());
        self.buf.push(':');
    }
}

impl MessageSink for JsonSink {
    fn begin_message(&mut self, _tag: &str, _sec: u64, _msec: u32) {
        self.buf.clear();
        self.buf.push('{');
        self.active = true;
    }

    fn add_str_field(&mut self, name: &str, value: &str) {
        self.push_name(name);
        self.buf
            .push_str(&serde_json::to_string(value).unwrap_or_default());
    }

    fn add_i64_field(&mut self, name: &str, value: i64) {
        self.push_name(name);
        self.buf.push_str(&value.to_string());
    }

    fn add_u64_field(&mut self, name: &str, value: u64) {
        self.push_name(name);
        self.buf.push_str(&value.to_string());
    }

    fn add_bool_field(&mut self, name: &str, value: bool) {
        self.push_name(name);
        self.buf.push_str(if value { "true" } else { "false" });
    }

    fn add_timestamp_field(&mut self, name: &str, sec: u64, msec: u32) {
        self.push_name(name);
        self.buf.push('"');
        self.buf.push_str(&format_time(sec, msec));
        self.buf.push('"');
    }

    fn add_time_field(&mut self, name: &str, sec: u64, msec: u32) {
        self.add_timestamp_field(name, sec, msec);
    }

    fn end_message(&mut self) -> io::Result<()> {
        if !self.active {
            return Ok(());
        }
        self.buf.push('}');
        self.active = false;
        let payload = std::mem::take(&mut self.buf);
        frame_and_write(self.writer.as_mut(), payload.as_bytes())
    }

    fn cancel_message(&mut self) {
        self.buf.clear();
        self.active = false;
    }

    fn is_open(&self) -> bool {
        self.writer.is_open()
    }

    fn open(&mut self) -> io::Result<()> {
        self.writer.open()
    }

    fn close(&mut self) {
        self.writer.close();
    }
}

/// Fluentd-forward MessagePack encoder: `[tag, time, {fields}]`.
///
/// `time` is a u32 of seconds, or an 8-byte fixext (seconds + nanoseconds,
/// both big-endian) when event-time is enabled.
pub struct MsgPackSink {
    writer: Box<dyn OutputWriter>,
    head: Vec<u8>,
    fields: Vec<u8>,
    num_fields: u32,
    use_ext_time: bool,
    active: bool,
}

impl MsgPackSink {
    pub fn new(writer: Box<dyn OutputWriter>, use_ext_time: bool) -> MsgPackSink {
        MsgPackSink {
            writer,
            head: Vec::new(),
            fields: Vec::new(),
            num_fields: 0,
            use_ext_time,
            active: false,
        }
    }

    fn push_name(&mut self, name: &str) {
        let _ = rmp::encode::write_str(&mut self.fields, name);
        self.num_fields += 1;
    }
}

impl MessageSink for MsgPackSink {
    fn begin_message(&mut self, tag: &str, sec: u64, msec: u32) {
        self.head.clear();
        self.fields.clear();
        self.num_fields = 0;
        self.active = true;
        let _ = rmp::encode::write_array_len(&mut self.head, 3);
        let _ = rmp::encode::write_str(&mut self.head, tag);
        if self.use_ext_time {
            let _ = rmp::encode::write_ext_meta(&mut self.head, 8, 0);
            self.head.extend_from_slice(&(sec as u32).to_be_bytes());
            self.head.extend_from_slice(&(msec * 1_000_000).to_be_bytes());
        } else {
            let _ = rmp::encode::write_u32(&mut self.head, sec as u32);
        }
    }

    fn add_str_field(&mut self, name: &str, value: &str) {
        self.push_name(name);
        let _ = rmp::encode::write_str(&mut self.fields, value);
    }

    fn add_i64_field(&mut self, name: &str, value: i64) {
        self.push_name(name);
        let _ = rmp::encode::write_sint(&mut self.fields, value);
    }

    fn add_u64_field(&mut self, name: &str, value: u64) {
        self.push_name(name);
        let _ = rmp::encode::write_uint(&mut self.fields, value);
    }

    fn add_bool_field(&mut self, name: &str, value: bool) {
        self.push_name(name);
        let _ = rmp::encode::write_bool(&mut self.fields, value);
    }

    fn add_timestamp_field(&mut self, name: &str, sec: u64, msec: u32) {
        self.push_name(name);
        let _ = rmp::encode::write_str(&mut self.fields, &format_time(sec, msec));
    }

    fn add_time_field(&mut self, name: &str, sec: u64, msec: u32) {
        self.add_timestamp_field(name, sec, msec);
    }

    fn end_message(&mut self) -> io::Result<()> {
        if !self.active {
            return Ok(());
        }
        self.active = false;
        let mut payload = std::mem::take(&mut self.head);
        let _ = rmp::encode::write_map_len(&mut payload, self.num_fields);
        payload.extend_from_slice(&self.fields);
        self.fields.clear();
        self.num_fields = 0;
        frame_and_write(self.writer.as_mut(), &payload)
    }

    fn cancel_message(&mut self) {
        self.head.clear();
        self.fields.clear();
        self.num_fields = 0;
        self.active = false;
    }

    fn is_open(&self) -> bool {
        self.writer.is_open()
    }

    fn open(&mut self) -> io::Result<()> {
        self.writer.open()
    }

    fn close(&mut self) {
        self.writer.close();
    }
}

pub type SinkFactory = fn(Box<dyn OutputWriter>, &Config) -> Box<dyn MessageSink>;

static SINK_FACTORIES: Lazy<Mutex<HashMap<String, SinkFactory>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

pub fn register_sink_factory(name: &str, factory: SinkFactory) {
    SINK_FACTORIES
        .lock()
        .unwrap()
        .insert(name.to_string(), factory);
}

pub fn create_sink(
    name: &str,
    writer: Box<dyn OutputWriter>,
    config: &Config,
) -> Option<Box<dyn MessageSink>> {
    let factory = *SINK_FACTORIES.lock().unwrap().get(name)?;
    Some(factory(writer, config))
}

/// Install the built-in sink factories; called once from the entry point
/// before any output worker starts.
pub fn register_builtin_sinks() {
    register_sink_factory("json", |writer, _config| Box::new(JsonSink::new(writer)));
    register_sink_factory("msgpack", |writer, config| {
        let ext_time = config.bool_or("msgpack_ext_time", false);
        Box::new(MsgPackSink::new(writer, ext_time))
    });
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn json_message_is_length_framed() {
        let (writer, data) = BufferWriter::new();
        let mut sink = JsonSink::new(Box::new(writer));
        sink.begin_message("audit", 1600000000, 250);
        sink.add_timestamp_field("timestamp", 1600000000, 250);
        sink.add_u64_field("serial", 42);
        sink.add_str_field("type", "AUDIT_EVENT");
        sink.add_str_field("exe", "/bin/echo \"hi\"");
        sink.end_message().unwrap();

        let frames = deframe(&data.lock().unwrap());
        assert_eq!(frames.len(), 1);
        let value: serde_json::Value = serde_json::from_slice(&frames[0]).unwrap();
        assert_eq!(value["timestamp"], "1600000000.250");
        assert_eq!(value["serial"], 42);
        assert_eq!(value["type"], "AUDIT_EVENT");
        assert_eq!(value["exe"], "/bin/echo \"hi\"");
        // field order is insertion order
        let text = std::str::from_utf8(&frames[0]).unwrap();
        assert!(text.find("timestamp").unwrap() < text.find("serial").unwrap());
    }

    #[test]
    fn json_cancel_discards_partial_message() {
        let (writer, data) = BufferWriter::new();
        let mut sink = JsonSink::new(Box::new(writer));
        sink.begin_message("audit", 1, 0);
        sink.add_str_field("dropped", "yes");
        sink.cancel_message();
        sink.begin_message("audit", 2, 0);
        sink.add_str_field("kept", "yes");
        sink.end_message().unwrap();

        let frames = deframe(&data.lock().unwrap());
        assert_eq!(frames.len(), 1);
        let value: serde_json::Value = serde_json::from_slice(&frames[0]).unwrap();
        assert!(value.get("dropped").is_none());
        assert_eq!(value["kept"], "yes");
    }

    #[test]
    fn msgpack_message_shape() {
        let (writer, data) = BufferWriter::new();
        let mut sink = MsgPackSink::new(Box::new(writer), false);
        sink.begin_message("audit.events", 1600000000, 0);
        sink.add_str_field("type", "AUDIT_EVENT");
        sink.add_u64_field("serial", 7);
        sink.end_message().unwrap();

        let frames = deframe(&data.lock().unwrap());
        assert_eq!(frames.len(), 1);
        let payload = &frames[0];
        // fixarray of 3
        assert_eq!(payload[0], 0x93);
        // fixstr "audit.events"
        assert_eq!(payload[1], 0xa0 | 12);
        assert_eq!(&payload[2..14], b"audit.events");
        // uint32 time
        assert_eq!(payload[14], 0xce);
        assert_eq!(&payload[15..19], &1600000000u32.to_be_bytes());
        // fixmap of 2
        assert_eq!(payload[19], 0x82);
    }

    #[test]
    fn msgpack_ext_time_encodes_seconds_and_nanos() {
        let (writer, data) = BufferWriter::new();
        let mut sink = MsgPackSink::new(Box::new(writer), true);
        sink.begin_message("t", 1600000000, 250);
        sink.end_message().unwrap();

        let frames = deframe(&data.lock().unwrap());
        let payload = &frames[0];
        // fixext8 with type 0 follows the tag
        let tag_end = 1 + 1 + 1; // fixarray + fixstr(1) + byte
        assert_eq!(payload[tag_end], 0xd7);
        assert_eq!(payload[tag_end + 1], 0x00);
        assert_eq!(
            &payload[tag_end + 2..tag_end + 6],
            &1600000000u32.to_be_bytes()
        );
        assert_eq!(
            &payload[tag_end + 6..tag_end + 10],
            &250_000_000u32.to_be_bytes()
        );
    }

    #[test]
    fn factory_registry_creates_sinks() {
        register_builtin_sinks();
        let config = Config::parse("msgpack_ext_time = true\n").unwrap();
        let (writer, _) = BufferWriter::new();
        assert!(create_sink("json", Box::new(writer), &config).is_some());
        let (writer, _) = BufferWriter::new();
        assert!(create_sink("msgpack", Box::new(writer), &config).is_some());
        let (writer, _) = BufferWriter::new();
        assert!(create_sink("nope", Box::new(writer), &config).is_none());
    }
}
