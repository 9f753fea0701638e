use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{msg}: Line {line}")]
    Parse { line: usize, msg: String },
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("key not found: {0}")]
    MissingKey(String),
    #[error("invalid value for '{key}': {msg}")]
    BadValue { key: String, msg: String },
}

fn parse_err(line: usize, msg: impl Into<String>) -> ConfigError {
    ConfigError::Parse {
        line,
        msg: msg.into(),
    }
}

/// Key/value daemon configuration.
///
/// The file format is line oriented: `key = value`, where a value is a bare
/// token, a double-quoted string with `\"` escapes, a raw string
/// `R"DELIM(...)DELIM"`, or a JSON object/array that may span multiple lines
/// (accumulated until it parses). `#` starts a comment at the beginning of a
/// line or after a complete value.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Config {
    map: HashMap<String, String>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut map = HashMap::new();
        let lines: Vec<&str> = text.lines().collect();
        let mut i = 0usize;
        while i < lines.len() {
            let line_num = i + 1;
            let line = lines[i];
            i += 1;

            let trimmed = line.trim_start_matches([' ', '\t']);
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let eq = line
                .find('=')
                .ok_or_else(|| parse_err(line_num, "Invalid parameter (missing '=')"))?;
            let key = line[..eq].trim_matches([' ', '\t']).to_string();
            let val = line[eq + 1..].trim_matches([' ', '\t']);

            let val = if let Some(rest) = val.strip_prefix('"') {
                parse_quoted(rest, line_num)?
            } else if val.len() > 3 && val.starts_with("R\"") {
                parse_raw_quoted(val, line_num)?
            } else if val.starts_with('{') || val.starts_with('[') {
                // JSON values may continue over multiple lines; keep
                // accumulating until the text parses.
                let mut nval = val.to_string();
                while serde_json::from_str::<serde_json::Value>(&nval).is_err() {
                    match lines.get(i) {
                        Some(next) => {
                            nval.push_str(next);
                            i += 1;
                        }
                        None => {
                            return Err(parse_err(line_num, "Incomplete or invalid JSON value"));
                        }
                    }
                }
                nval
            } else {
                parse_bare(val, line_num)?
            };

            map.insert(key, val);
        }
        Ok(Self { map })
    }

    pub fn has_key(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.map.keys()
    }

    pub fn get_string(&self, name: &str) -> Result<String, ConfigError> {
        self.map
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::MissingKey(name.to_string()))
    }

    pub fn get_bool(&self, name: &str) -> Result<bool, ConfigError> {
        let val = self.get_string(name)?;
        Ok(matches!(val.as_str(), "on" | "yes" | "true"))
    }

    pub fn get_i64(&self, name: &str) -> Result<i64, ConfigError> {
        let val = self.get_string(name)?;
        val.parse().map_err(|_| ConfigError::BadValue {
            key: name.to_string(),
            msg: format!("not an integer: '{val}'"),
        })
    }

    pub fn get_u64(&self, name: &str) -> Result<u64, ConfigError> {
        let val = self.get_string(name)?;
        val.parse().map_err(|_| ConfigError::BadValue {
            key: name.to_string(),
            msg: format!("not an unsigned integer: '{val}'"),
        })
    }

    pub fn get_f64(&self, name: &str) -> Result<f64, ConfigError> {
        let val = self.get_string(name)?;
        val.parse().map_err(|_| ConfigError::BadValue {
            key: name.to_string(),
            msg: format!("not a number: '{val}'"),
        })
    }

    pub fn get_json(&self, name: &str) -> Result<serde_json::Value, ConfigError> {
        let val = self.get_string(name)?;
        serde_json::from_str(&val).map_err(|e| ConfigError::BadValue {
            key: name.to_string(),
            msg: e.to_string(),
        })
    }

    /// Convenience accessors with defaults, for optional keys.
    pub fn string_or(&self, name: &str, default: &str) -> String {
        self.get_string(name).unwrap_or_else(|_| default.to_string())
    }

    pub fn bool_or(&self, name: &str, default: bool) -> bool {
        if self.has_key(name) {
            self.get_bool(name).unwrap_or(default)
        } else {
            default
        }
    }

    pub fn u64_or(&self, name: &str, default: u64) -> u64 {
        if self.has_key(name) {
            self.get_u64(name).unwrap_or(default)
        } else {
            default
        }
    }

    /// Serialize to the same format `parse` accepts.
    pub fn serialize(&self) -> String {
        let mut keys: Vec<&String> = self.map.keys().collect();
        keys.sort();
        let mut out = String::new();
        for key in keys {
            let val = &self.map[key.as_str()];
            if val.starts_with('{') || val.starts_with('[') {
                let _ = writeln!(out, "{key} = {val}");
            } else if !val.is_empty()
                && !val.starts_with('"')
                && !val.starts_with("R\"")
                && !val.contains([' ', '\t', '"', '#'])
            {
                let _ = writeln!(out, "{key} = {val}");
            } else {
                let _ = writeln!(out, "{key} = \"{}\"", val.replace('"', "\\\""));
            }
        }
        out
    }
}

fn parse_quoted(rest: &str, line_num: usize) -> Result<String, ConfigError> {
    // `rest` is everything after the opening quote. `\"` embeds a quote.
    let mut out = String::with_capacity(rest.len());
    let mut close = None;
    let mut chars = rest.char_indices().peekable();
    while let Some((idx, c)) = chars.next() {
        if c == '\\' && matches!(chars.peek(), Some((_, '"'))) {
            out.push('"');
            chars.next();
        } else if c == '"' {
            close = Some(idx);
            break;
        } else {
            out.push(c);
        }
    }
    let close = close.ok_or_else(|| parse_err(line_num, "Value is missing close quote '\"'"))?;
    let tail = rest[close + 1..].trim_matches([' ', '\t']);
    if !tail.is_empty() && !tail.starts_with('#') {
        return Err(parse_err(line_num, "Invalid characters following value"));
    }
    Ok(out)
}

fn parse_raw_quoted(val: &str, line_num: usize) -> Result<String, ConfigError> {
    // R"DELIM(value)DELIM"
    let err = || parse_err(line_num, "Invalid raw string value");
    let open = val[2..].find('(').ok_or_else(err)? + 2;
    let delim = &val[2..open];
    let suffix = format!("){delim}\"");
    if !val.ends_with(&suffix) {
        return Err(err());
    }
    let start = open + 1;
    let end = val.len() - suffix.len();
    if start > end {
        return Err(err());
    }
    Ok(val[start..end].to_string())
}

fn parse_bare(val: &str, line_num: usize) -> Result<String, ConfigError> {
    match val.find([' ', '\t']) {
        None => Ok(val.to_string()),
        Some(ws) => {
            let tail = val[ws..].trim_matches([' ', '\t']);
            if !tail.is_empty() && !tail.starts_with('#') {
                return Err(parse_err(
                    line_num,
                    "White space in value (may need to be quoted with '\"')",
                ));
            }
            Ok(val[..ws].to_string())
        }
    }
}
