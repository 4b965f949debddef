//! Header/value table for the line-oriented wire protocol
//!
//! Requests and responses carry `Header: value` pairs after the opcode
//! line; this table lets handlers pull fields out in any order with a
//! typed default.

use std::collections::HashMap;

/// A parsed set of `Header: value` pairs.
#[derive(Clone, Debug, Default)]
pub struct Properties {
    entries: HashMap<String, String>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `Header: value` lines. Lines without a separator are skipped;
    /// whitespace around both halves is trimmed.
    pub fn load(lines: &str) -> Self {
        let mut entries = HashMap::new();
        for line in lines.lines() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            if let Some((key, value)) = line.split_once(':') {
                entries.insert(key.trim().to_string(), value.trim().to_string());
            }
        }
        Self { entries }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn get_str<'a>(&'a self, key: &str) -> Option<&'a str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn get_i64(&self, key: &str, default: i64) -> i64 {
        self.entries
            .get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn get_u16(&self, key: &str, default: u16) -> u16 {
        self.entries
            .get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn get_usize(&self, key: &str, default: usize) -> usize {
        self.entries
            .get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
