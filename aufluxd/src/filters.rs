use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use regex::Regex;

pub const FILTER_BITSET_SIZE: usize = 256;

/// Fixed-width bitset identifying filter specs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Bitset256([u64; 4]);

impl Bitset256 {
    pub fn new() -> Bitset256 {
        Bitset256::default()
    }

    pub fn set(&mut self, bit: usize) {
        assert!(bit < FILTER_BITSET_SIZE);
        self.0[bit / 64] |= 1 << (bit % 64);
    }

    pub fn test(&self, bit: usize) -> bool {
        bit < FILTER_BITSET_SIZE && self.0[bit / 64] & (1 << (bit % 64)) != 0
    }

    pub fn none(&self) -> bool {
        self.0.iter().all(|w| *w == 0)
    }

    pub fn or_with(&mut self, other: Bitset256) {
        for (w, o) in self.0.iter_mut().zip(other.0) {
            *w |= o;
        }
    }

    pub fn and(&self, other: Bitset256) -> Bitset256 {
        let mut out = Bitset256::new();
        for ((w, a), b) in out.0.iter_mut().zip(self.0).zip(other.0) {
            *w = a & b;
        }
        out
    }

    pub fn ones(&self) -> impl Iterator<Item = usize> + '_ {
        (0..FILTER_BITSET_SIZE).filter(move |bit| self.test(*bit))
    }
}

/// One process filter rule. Specs are deduplicated by structural equality
/// across outputs; each unique spec owns one bit position.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcFilterSpec {
    /// Anchored regex the process exe must match; empty matches anything.
    pub exe_pattern: String,
    /// Anchored regex the process cmdline must match; empty matches anything.
    pub args_pattern: String,
    /// User name the process uid must resolve to; empty matches anything.
    pub user: String,
    /// How far up the ancestry the rule applies; 0 is the process itself.
    pub depth: u32,
    /// Syscall names the rule filters; `*` matches every syscall.
    pub syscalls: Vec<String>,
}

/// Parse the per-output `process_filters` JSON list.
pub fn parse_filter_specs(value: &serde_json::Value) -> Result<Vec<ProcFilterSpec>, String> {
    let items = value.as_array().ok_or("process_filters must be an array")?;
    let mut specs = Vec::with_capacity(items.len());
    for (idx, item) in items.iter().enumerate() {
        let obj = item
            .as_object()
            .ok_or_else(|| format!("process_filters[{idx}] must be an object"))?;
        let get_str = |key: &str| -> Result<String, String> {
            match obj.get(key) {
                None => Ok(String::new()),
                Some(serde_json::Value::String(s)) => Ok(s.clone()),
                Some(_) => Err(format!("process_filters[{idx}].{key} must be a string")),
            }
        };
        let exe_pattern = get_str("exe")?;
        let args_pattern = get_str("args")?;
        let user = get_str("user")?;
        for (key, pattern) in [("exe", &exe_pattern), ("args", &args_pattern)] {
            if !pattern.is_empty() {
                anchored(pattern)
                    .map_err(|e| format!("process_filters[{idx}].{key}: {e}"))?;
            }
        }
        let depth = match obj.get("depth") {
            None => 0,
            Some(v) => v
                .as_u64()
                .ok_or_else(|| format!("process_filters[{idx}].depth must be an integer"))?
                as u32,
        };
        let syscalls = match obj.get("syscalls") {
            None => vec!["*".to_string()],
            Some(serde_json::Value::Array(list)) => {
                let mut out = Vec::with_capacity(list.len());
                for entry in list {
                    match entry.as_str() {
                        Some(s) => out.push(s.to_string()),
                        None => {
                            return Err(format!(
                                "process_filters[{idx}].syscalls must contain strings"
                            ))
                        }
                    }
                }
                out
            }
            Some(_) => return Err(format!("process_filters[{idx}].syscalls must be an array")),
        };
        specs.push(ProcFilterSpec {
            exe_pattern,
            args_pattern,
            user,
            depth,
            syscalls,
        });
    }
    Ok(specs)
}

fn anchored(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{pattern})$"))
}

/// Fields an engine match inspects, copied out of a process tree item.
pub struct ProcMatch<'a> {
    pub exe: &'a str,
    pub cmdline: &'a str,
    pub user: &'a str,
}

struct CompiledSpec {
    bit: usize,
    outputs: HashSet<String>,
    exe: Option<Regex>,
    args: Option<Regex>,
}

#[derive(Default)]
struct EngineInner {
    next_bit: usize,
    free_bits: Vec<usize>,
    filters: HashMap<ProcFilterSpec, CompiledSpec>,
    bit_syscalls: HashMap<usize, Vec<String>>,
}

/// Assigns bit positions to unique filter specs and answers per-event
/// filtering queries against precomputed process flags.
#[derive(Default)]
pub struct FiltersEngine {
    inner: Mutex<EngineInner>,
}

impl FiltersEngine {
    pub fn new() -> FiltersEngine {
        FiltersEngine::default()
    }

    /// Register an output's filter list; returns the mask of bits owned by
    /// that output.
    pub fn add_filter_list(&self, specs: &[ProcFilterSpec], output_name: &str) -> Bitset256 {
        let mut inner = self.inner.lock().unwrap();
        let mut mask = Bitset256::new();
        for spec in specs {
            if let Some(existing) = inner.filters.get_mut(spec) {
                existing.outputs.insert(output_name.to_string());
                mask.set(existing.bit);
                continue;
            }
            let bit = match pop_lowest(&mut inner.free_bits) {
                Some(bit) => bit,
                None => {
                    let bit = inner.next_bit;
                    if bit >= FILTER_BITSET_SIZE {
                        log::error!("filter bit positions exhausted; dropping spec");
                        continue;
                    }
                    inner.next_bit += 1;
                    bit
                }
            };
            let exe = compile_or_none(&spec.exe_pattern);
            let args = compile_or_none(&spec.args_pattern);
            let mut outputs = HashSet::new();
            outputs.insert(output_name.to_string());
            inner.bit_syscalls.insert(bit, spec.syscalls.clone());
            inner.filters.insert(
                spec.clone(),
                CompiledSpec {
                    bit,
                    outputs,
                    exe,
                    args,
                },
            );
            mask.set(bit);
        }
        mask
    }

    /// Drop an output's claim on its specs; bits with no remaining outputs
    /// are freed for reuse.
    pub fn remove_filter_list(&self, specs: &[ProcFilterSpec], output_name: &str) {
        let mut inner = self.inner.lock().unwrap();
        for spec in specs {
            let remove = match inner.filters.get_mut(spec) {
                Some(existing) => {
                    existing.outputs.remove(output_name);
                    existing.outputs.is_empty()
                }
                None => false,
            };
            if remove {
                if let Some(existing) = inner.filters.remove(spec) {
                    inner.bit_syscalls.remove(&existing.bit);
                    inner.free_bits.push(existing.bit);
                }
            }
        }
    }

    /// Bits of every spec that matches `process` at ancestry height `height`.
    pub fn get_flags(&self, process: &ProcMatch, height: u32) -> Bitset256 {
        let inner = self.inner.lock().unwrap();
        let mut flags = Bitset256::new();
        for (spec, compiled) in inner.filters.iter() {
            if height > spec.depth {
                continue;
            }
            if let Some(exe) = &compiled.exe {
                if !exe.is_match(process.exe) {
                    continue;
                }
            }
            if let Some(args) = &compiled.args {
                if !args.is_match(process.cmdline) {
                    continue;
                }
            }
            if !spec.user.is_empty() && spec.user != process.user {
                continue;
            }
            flags.set(compiled.bit);
        }
        flags
    }

    /// True when some bit in `process_flags & output_mask` filters `syscall`.
    pub fn is_event_filtered(
        &self,
        syscall: &str,
        process_flags: Option<Bitset256>,
        output_mask: Bitset256,
    ) -> bool {
        if syscall.is_empty() || output_mask.none() {
            return false;
        }
        let Some(flags) = process_flags else {
            return false;
        };
        let hits = flags.and(output_mask);
        if hits.none() {
            return false;
        }
        let inner = self.inner.lock().unwrap();
        for bit in hits.ones() {
            if let Some(syscalls) = inner.bit_syscalls.get(&bit) {
                if syscalls.iter().any(|s| s == "*" || s == syscall) {
                    return true;
                }
            }
        }
        false
    }
}

fn compile_or_none(pattern: &str) -> Option<Regex> {
    if pattern.is_empty() {
        return None;
    }
    match anchored(pattern) {
        Ok(re) => Some(re),
        Err(err) => {
            log::error!("invalid filter pattern '{pattern}': {err}");
            None
        }
    }
}

fn pop_lowest(free: &mut Vec<usize>) -> Option<usize> {
    let idx = free
        .iter()
        .enumerate()
        .min_by_key(|(_, bit)| **bit)
        .map(|(idx, _)| idx)?;
    Some(free.swap_remove(idx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(exe: &str, syscalls: &[&str]) -> ProcFilterSpec {
        ProcFilterSpec {
            exe_pattern: exe.to_string(),
            args_pattern: String::new(),
            user: String::new(),
            depth: 0,
            syscalls: syscalls.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn proc_match<'a>(exe: &'a str, cmdline: &'a str, user: &'a str) -> ProcMatch<'a> {
        ProcMatch { exe, cmdline, user }
    }

    #[test]
    fn parse_specs_from_json() {
        let value = json!([
            {"exe": "/usr/bin/telemetryd", "user": "telemetry", "depth": 2,
             "syscalls": ["execve", "open"]},
            {"args": ".*--quiet.*"}
        ]);
        let specs = parse_filter_specs(&value).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].exe_pattern, "/usr/bin/telemetryd");
        assert_eq!(specs[0].depth, 2);
        assert_eq!(specs[0].syscalls, ["execve", "open"]);
        assert_eq!(specs[1].syscalls, ["*"]);
        assert_eq!(specs[1].depth, 0);
    }

    #[test]
    fn parse_rejects_bad_patterns() {
        let value = json!([{"exe": "("}]);
        assert!(parse_filter_specs(&value).is_err());
    }

    #[test]
    fn shared_spec_gets_one_bit() {
        let engine = FiltersEngine::new();
        let s = spec("/bin/true", &["*"]);
        let mask_a = engine.add_filter_list(std::slice::from_ref(&s), "a");
        let mask_b = engine.add_filter_list(std::slice::from_ref(&s), "b");
        assert_eq!(mask_a, mask_b);
        assert_eq!(mask_a.ones().count(), 1);
    }

    #[test]
    fn bit_reuse_after_removal() {
        let engine = FiltersEngine::new();
        let first = spec("/bin/a", &["*"]);
        let second = spec("/bin/b", &["*"]);
        let mask_first = engine.add_filter_list(std::slice::from_ref(&first), "out");
        engine.add_filter_list(std::slice::from_ref(&second), "out");
        engine.remove_filter_list(std::slice::from_ref(&first), "out");
        // nothing consumed the freed bit, so re-adding restores it
        let mask_again = engine.add_filter_list(std::slice::from_ref(&first), "out");
        assert_eq!(mask_first, mask_again);
    }

    #[test]
    fn removal_respects_remaining_outputs() {
        let engine = FiltersEngine::new();
        let s = spec("/bin/shared", &["execve"]);
        engine.add_filter_list(std::slice::from_ref(&s), "a");
        let mask = engine.add_filter_list(std::slice::from_ref(&s), "b");
        engine.remove_filter_list(std::slice::from_ref(&s), "a");
        let flags = engine.get_flags(&proc_match("/bin/shared", "", ""), 0);
        assert!(engine.is_event_filtered("execve", Some(flags), mask));
    }

    #[test]
    fn matching_honors_depth_and_user() {
        let engine = FiltersEngine::new();
        let s = ProcFilterSpec {
            exe_pattern: "/usr/bin/agent".to_string(),
            args_pattern: String::new(),
            user: "svc".to_string(),
            depth: 1,
            syscalls: vec!["*".to_string()],
        };
        engine.add_filter_list(std::slice::from_ref(&s), "out");
        let hit = engine.get_flags(&proc_match("/usr/bin/agent", "", "svc"), 0);
        assert!(!hit.none());
        let at_depth = engine.get_flags(&proc_match("/usr/bin/agent", "", "svc"), 1);
        assert!(!at_depth.none());
        let too_deep = engine.get_flags(&proc_match("/usr/bin/agent", "", "svc"), 2);
        assert!(too_deep.none());
        let wrong_user = engine.get_flags(&proc_match("/usr/bin/agent", "", "root"), 0);
        assert!(wrong_user.none());
    }

    #[test]
    fn args_pattern_matches_cmdline() {
        let engine = FiltersEngine::new();
        let s = ProcFilterSpec {
            exe_pattern: String::new(),
            args_pattern: ".*--daemon.*".to_string(),
            user: String::new(),
            depth: 0,
            syscalls: vec!["*".to_string()],
        };
        engine.add_filter_list(std::slice::from_ref(&s), "out");
        assert!(!engine
            .get_flags(&proc_match("/bin/x", "/bin/x --daemon --verbose", ""), 0)
            .none());
        assert!(engine
            .get_flags(&proc_match("/bin/x", "/bin/x --verbose", ""), 0)
            .none());
    }

    #[test]
    fn empty_mask_or_missing_process_never_filters() {
        let engine = FiltersEngine::new();
        let s = spec("/bin/a", &["*"]);
        let mask = engine.add_filter_list(std::slice::from_ref(&s), "out");
        let flags = engine.get_flags(&proc_match("/bin/a", "", ""), 0);
        assert!(!engine.is_event_filtered("open", Some(flags), Bitset256::new()));
        assert!(!engine.is_event_filtered("open", None, mask));
        assert!(!engine.is_event_filtered("", Some(flags), mask));
    }

    #[test]
    fn syscall_set_limits_filtering() {
        let engine = FiltersEngine::new();
        let s = spec("/bin/a", &["open", "close"]);
        let mask = engine.add_filter_list(std::slice::from_ref(&s), "out");
        let flags = engine.get_flags(&proc_match("/bin/a", "", ""), 0);
        assert!(engine.is_event_filtered("open", Some(flags), mask));
        assert!(!engine.is_event_filtered("execve", Some(flags), mask));
    }
}
