//! INI-style configuration registry.
//!
//! A registry is a `section.key = value` store loaded from a single file.
//! Values are fetched with typed getters that fall back to a default when
//! the key is absent; unknown keys are simply ignored so services can share
//! one file with the core.

use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot open configuration file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("mandatory section [{0}] is missing")]
    MissingSection(String),
}

#[derive(Debug, Default, Clone)]
pub struct Registry {
    sections: HashMap<String, HashMap<String, String>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self::parse(&text))
    }

    /// Parses `[section]` headers and `key = value` lines. `;` and `#` start
    /// comments; anything malformed is skipped.
    pub fn parse(text: &str) -> Self {
        let mut reg = Self::new();
        let mut section = String::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                section = name.trim().to_owned();
                reg.sections.entry(section.clone()).or_default();
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                reg.sections
                    .entry(section.clone())
                    .or_default()
                    .insert(key.trim().to_owned(), value.trim().to_owned());
            }
        }
        reg
    }

    pub fn set(&mut self, section: &str, key: &str, value: &str) {
        self.sections
            .entry(section.to_owned())
            .or_default()
            .insert(key.to_owned(), value.to_owned());
    }

    pub fn has_section(&self, section: &str) -> bool {
        self.sections.contains_key(section)
    }

    pub fn get_str(&self, section: &str, key: &str, default: &str) -> String {
        self.sections
            .get(section)
            .and_then(|s| s.get(key))
            .cloned()
            .unwrap_or_else(|| default.to_owned())
    }

    pub fn get_int(&self, section: &str, key: &str, default: i64) -> i64 {
        self.sections
            .get(section)
            .and_then(|s| s.get(key))
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn get_bool(&self, section: &str, key: &str, default: bool) -> bool {
        self.sections
            .get(section)
            .and_then(|s| s.get(key))
            .and_then(|v| match v.to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => Some(true),
                "false" | "no" | "off" | "0" => Some(false),
                _ => None,
            })
            .unwrap_or(default)
    }

    /// Parses sizes with an optional `KB`/`MB`/`GB` suffix ("10 MB").
    pub fn get_data_size(&self, section: &str, key: &str, default: u64) -> u64 {
        let Some(v) = self.sections.get(section).and_then(|s| s.get(key)) else {
            return default;
        };
        parse_data_size(v).unwrap_or(default)
    }
}

fn parse_data_size(v: &str) -> Option<u64> {
    let v = v.trim();
    let split = v.find(|c: char| !c.is_ascii_digit()).unwrap_or(v.len());
    let num: u64 = v[..split].parse().ok()?;
    let mult = match v[split..].trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" => 1 << 10,
        "M" | "MB" => 1 << 20,
        "G" | "GB" => 1 << 30,
        _ => return None,
    };
    Some(num * mult)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sections_and_values() {
        let reg = Registry::parse(
            "; comment\n\
             [task_server]\n\
             max_threads = 8\n\
             log_requests=false\n\
             log_thread_buf_size = 2 MB\n\
             \n\
             [other]\n\
             key=value\n",
        );
        assert!(reg.has_section("task_server"));
        assert_eq!(reg.get_int("task_server", "max_threads", 20), 8);
        assert!(!reg.get_bool("task_server", "log_requests", true));
        assert_eq!(
            reg.get_data_size("task_server", "log_thread_buf_size", 0),
            2 << 20
        );
        assert_eq!(reg.get_str("other", "key", ""), "value");
    }

    #[test]
    fn defaults_apply_for_missing_keys() {
        let reg = Registry::parse("[task_server]\n");
        assert_eq!(reg.get_int("task_server", "jiffies_per_sec", 100), 100);
        assert_eq!(reg.get_int("nope", "x", 7), 7);
        assert!(reg.get_bool("task_server", "log_requests", true));
    }

    #[test]
    fn data_size_suffixes() {
        assert_eq!(parse_data_size("512"), Some(512));
        assert_eq!(parse_data_size("4KB"), Some(4096));
        assert_eq!(parse_data_size("1 GB"), Some(1 << 30));
        assert_eq!(parse_data_size("zzz"), None);
    }
}
