//! Layered, dotted-path configuration (spec C1).
//!
//! Built by overlaying, in order: hard-coded defaults, a file located under
//! the runtime home, then environment overrides for a small enumerated set
//! of knobs (`KIWI_*`). Addressed by dotted paths like
//! `server.api.tls.enabled`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use toml::Value;

use crate::error::KiwiError;

const DEFAULT_TOML: &str = r#"
[home_dir]
[remote]
base_url = "https://kiwi.example.com"
modules_path = "/manifest.json"

[server]
host = "127.0.0.1"
port = 8013

[server.api]
enabled = true

[server.api.tls]
enabled = false

[server.daemon]
foreground = false

[server.cyclops]
enabled = true
schedule = []

[log]
path = "logs/kiwi.log"

[log.rotation]
size = 10485760
backups = 5
"#;

/// The small, enumerated set of environment variables the runtime
/// recognizes, mapped to their dotted config path (spec §4.1).
const ENV_KNOBS: &[(&str, &str)] = &[
    ("KIWI_HOME_DIR", "home_dir"),
    ("KIWI_MODULES_DIR", "modules_dir"),
    ("KIWI_RUNTIME_DIR", "runtime_dir"),
    ("KIWI_REMOTE_BASE_URL", "remote.base_url"),
    ("KIWI_REMOTE_MODULES_PATH", "remote.modules_path"),
    ("KIWI_SERVER_HOST", "server.host"),
    ("KIWI_SERVER_PORT", "server.port"),
    ("KIWI_SERVER_API_ENABLED", "server.api.enabled"),
    ("KIWI_SERVER_API_TLS_ENABLED", "server.api.tls.enabled"),
    ("KIWI_SERVER_API_TLS_CERT", "server.api.tls.cert"),
    ("KIWI_SERVER_API_TLS_KEY", "server.api.tls.key"),
    ("KIWI_SERVER_API_TLS_CA_CHAIN", "server.api.tls.ca_chain"),
    ("KIWI_SERVER_DAEMON_FOREGROUND", "server.daemon.foreground"),
    ("KIWI_SERVER_CYCLOPS_ENABLED", "server.cyclops.enabled"),
];

#[derive(Clone, Debug)]
pub struct Config {
    root: Value,
}

impl Config {
    /// Build the layered configuration: defaults, then an optional file
    /// overlay, then environment overrides.
    pub fn load(home_dir: &Path, file_path: Option<&Path>) -> anyhow::Result<Self> {
        let mut root: Value = toml::from_str(DEFAULT_TOML)
            .context("internal error: built-in default configuration does not parse")?;

        set_path(&mut root, "home_dir", Value::String(home_dir.display().to_string()));
        set_path(
            &mut root,
            "modules_dir",
            Value::String(home_dir.join("modules").display().to_string()),
        );
        set_path(
            &mut root,
            "runtime_dir",
            Value::String(home_dir.join("runtime").display().to_string()),
        );

        if let Some(path) = file_path {
            if path.is_file() {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                let overlay: Value = toml::from_str(&text)
                    .map_err(|e| KiwiError::ConfigMalformed(e.to_string()))
                    .with_context(|| format!("parsing config file {}", path.display()))?;
                merge(&mut root, overlay);
            }
        }

        let mut config = Self { root };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        for (var, path) in ENV_KNOBS {
            if let Ok(value) = std::env::var(var) {
                set_path(&mut self.root, path, coerce(&value));
            }
        }
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        get_path(&self.root, path)
    }

    pub fn get_str(&self, path: &str) -> Option<String> {
        self.get(path).and_then(|v| v.as_str()).map(str::to_owned)
    }

    pub fn get_bool(&self, path: &str) -> Option<bool> {
        self.get(path).and_then(Value::as_bool)
    }

    pub fn get_i64(&self, path: &str) -> Option<i64> {
        self.get(path).and_then(Value::as_integer)
    }

    pub fn get_path_buf(&self, path: &str) -> Option<PathBuf> {
        self.get_str(path).map(PathBuf::from)
    }

    pub fn set(&mut self, path: &str, value: Value) {
        set_path(&mut self.root, path, value);
    }

    /// Canonical textual dump: stable key order, stable indentation. Used
    /// for `--dump-config` and satisfies the round-trip property in spec §8.
    pub fn dump(&self) -> String {
        toml::to_string_pretty(&sorted(&self.root)).unwrap_or_default()
    }

    pub fn home_dir(&self) -> PathBuf {
        self.get_path_buf("home_dir").unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn modules_dir(&self) -> PathBuf {
        self.get_path_buf("modules_dir").unwrap_or_else(|| self.home_dir().join("modules"))
    }

    pub fn runtime_dir(&self) -> PathBuf {
        self.get_path_buf("runtime_dir").unwrap_or_else(|| self.home_dir().join("runtime"))
    }

    pub fn pid_file(&self) -> PathBuf {
        self.home_dir().join("PID")
    }

    pub fn crash_dir(&self) -> PathBuf {
        self.home_dir().join("crash")
    }

    pub fn schedule_file(&self) -> PathBuf {
        self.home_dir().join("server").join("cyclops").join("schedule")
    }
}

fn get_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = current.as_table()?.get(segment)?;
    }
    Some(current)
}

fn set_path(root: &mut Value, path: &str, value: Value) {
    let segments: Vec<&str> = path.split('.').collect();
    let mut current = root;
    for segment in &segments[..segments.len() - 1] {
        if !matches!(current, Value::Table(_)) {
            *current = Value::Table(Default::default());
        }
        let table = current.as_table_mut().expect("just ensured table");
        current = table
            .entry(segment.to_string())
            .or_insert_with(|| Value::Table(Default::default()));
    }
    if !matches!(current, Value::Table(_)) && segments.len() > 1 {
        // leaf's parent must be a table; nothing to do here, leaf insert below
    }
    let last = segments[segments.len() - 1];
    if let Value::Table(table) = current {
        table.insert(last.to_string(), value);
    }
}

fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Table(base_table), Value::Table(overlay_table)) => {
            for (key, value) in overlay_table {
                match base_table.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base_table.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Coerce an environment variable's string value into the most specific
/// TOML scalar it looks like (bool, integer, then string).
fn coerce(value: &str) -> Value {
    if let Ok(b) = value.parse::<bool>() {
        return Value::Boolean(b);
    }
    if let Ok(i) = value.parse::<i64>() {
        return Value::Integer(i);
    }
    Value::String(value.to_owned())
}

/// Recursively sort table keys so `dump()` is stable across runs.
fn sorted(value: &Value) -> Value {
    match value {
        Value::Table(table) => {
            let mut sorted_table = toml::value::Table::new();
            let mut keys: Vec<&String> = table.keys().collect();
            keys.sort();
            for key in keys {
                sorted_table.insert(key.clone(), sorted(&table[key]));
            }
            Value::Table(sorted_table)
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
        other => other.clone(),
    }
}

/// Parse a `key=value` file into a mapping, ignoring `#`-prefixed lines.
/// Used both for module-private config files read via `Helper::parse_config`
/// and for env files.
pub fn parse_key_value_file(path: &Path) -> anyhow::Result<HashMap<String, String>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading key=value file {}", path.display()))?;
    Ok(parse_key_value_str(&text))
}

pub fn parse_key_value_str(text: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            map.insert(key.trim().to_owned(), value.trim().to_owned());
        }
    }
    map
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_are_present() {
        let config = Config::load(Path::new("/tmp/kiwi-test-home"), None).unwrap();
        assert_eq!(Some("127.0.0.1".to_owned()), config.get_str("server.host"));
        assert_eq!(Some(8013), config.get_i64("server.port"));
        assert_eq!(Some(false), config.get_bool("server.api.tls.enabled"));
    }

    #[test]
    fn file_overlay_wins_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("kiwi.toml");
        std::fs::write(&file_path, "[server]\nport = 9999\n").unwrap();

        let config = Config::load(dir.path(), Some(&file_path)).unwrap();
        assert_eq!(Some(9999), config.get_i64("server.port"));
        // Untouched defaults survive the overlay.
        assert_eq!(Some("127.0.0.1".to_owned()), config.get_str("server.host"));
    }

    #[test]
    fn env_override_wins_over_file() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("KIWI_SERVER_PORT", "4242");
        let config = Config::load(dir.path(), None).unwrap();
        std::env::remove_var("KIWI_SERVER_PORT");
        assert_eq!(Some(4242), config.get_i64("server.port"));
    }

    #[test]
    fn set_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::load(dir.path(), None).unwrap();
        config.set("server.cyclops.enabled", Value::Boolean(false));
        assert_eq!(Some(false), config.get_bool("server.cyclops.enabled"));
    }

    #[test]
    fn dump_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path(), None).unwrap();
        let dumped = config.dump();

        let dump_path = dir.path().join("dumped.toml");
        std::fs::write(&dump_path, &dumped).unwrap();
        let reloaded = Config::load(dir.path(), Some(&dump_path)).unwrap();

        assert_eq!(config.get_i64("server.port"), reloaded.get_i64("server.port"));
        assert_eq!(config.get_str("server.host"), reloaded.get_str("server.host"));
    }

    #[test]
    fn key_value_file_ignores_comments() {
        let map = parse_key_value_str("# comment\nfoo=bar\n\nbaz = qux # trailing is part of value here? no\n");
        assert_eq!(Some(&"bar".to_owned()), map.get("foo"));
        assert_eq!(Some(&"qux # trailing is part of value here? no".to_owned()), map.get("baz"));
    }
}
