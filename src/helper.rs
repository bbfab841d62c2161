//! The Helper façade injected into every module invocation (spec C2).
//!
//! `HelperState` is the host-side state backing the host functions linked
//! into the guest's imports by `abi.rs` — the guest never sees this type,
//! only the ABI surface it drives. This split exists because a WASM export
//! cannot accept a host object as a parameter (spec §0 ABI resolution);
//! instead the guest calls back into the host through imported functions,
//! and each of those functions is a thin wrapper around a `HelperState`
//! method below.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;

use crate::bridge::client::{RpcRequest, RpcResponse};
use crate::config::Config;

#[derive(Clone)]
pub struct HelperState {
    pub module_name: String,
    pub module_desc: String,
    pub module_home: PathBuf,
    pub config: Arc<Config>,
    pub auto_yes: bool,
    http: reqwest::Client,
}

impl HelperState {
    pub fn new(module_name: &str, module_desc: &str, module_home: PathBuf, config: Arc<Config>, auto_yes: bool) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&module_home)
            .with_context(|| format!("creating module home {}", module_home.display()))?;
        Ok(Self {
            module_name: module_name.to_owned(),
            module_desc: module_desc.to_owned(),
            module_home,
            config,
            auto_yes,
            http: reqwest::Client::new(),
        })
    }

    /// Runtime-scoped line print.
    pub fn say(&self, msg: &str) {
        println!("{}", msg);
    }

    /// Blocking interactive prompt. `--yes` pre-answers `y` to every prompt
    /// (spec §6 CLI).
    pub fn ask(&self, prompt: &str, choices: &[String], default: Option<&str>) -> String {
        if self.auto_yes {
            return default.unwrap_or_else(|| choices.first().map(String::as_str).unwrap_or("y")).to_owned();
        }

        loop {
            print!("{} [{}] ", prompt, choices.join("/"));
            std::io::stdout().flush().ok();

            let mut line = String::new();
            if std::io::stdin().read_line(&mut line).is_err() {
                return default.unwrap_or_default().to_owned();
            }
            let answer = line.trim();
            if answer.is_empty() {
                if let Some(d) = default {
                    return d.to_owned();
                }
                continue;
            }
            if choices.iter().any(|c| c == answer) {
                return answer.to_owned();
            }
        }
    }

    /// `key=value` file into a mapping, `#`-prefixed lines ignored.
    pub fn parse_config(&self, path: &Path) -> anyhow::Result<HashMap<String, String>> {
        crate::config::parse_key_value_file(path)
    }

    /// Synchronous local invocation of a peer module; returns `(exit_code,
    /// captured_stdout)` (spec §4.2).
    pub fn module(&self, name: &str, argline: &str, foreground: bool) -> anyhow::Result<(i32, String)> {
        let rt = tokio::runtime::Handle::try_current();
        let fut = crate::loader::run(self.config.clone(), name, argline, true, foreground, self.auto_yes);
        match rt {
            Ok(handle) => tokio::task::block_in_place(|| handle.block_on(fut)),
            Err(_) => futures::executor::block_on(fut),
        }
    }

    /// Issue an RPC to the same-named module on the configured server (spec
    /// §4.5, client side).
    pub fn request(&self, req: RpcRequest) -> anyhow::Result<RpcResponse> {
        let rt = tokio::runtime::Handle::try_current();
        let fut = crate::bridge::client::send(&self.config, &self.module_name, req);
        match rt {
            Ok(handle) => tokio::task::block_in_place(|| handle.block_on(fut)),
            Err(_) => futures::executor::block_on(fut),
        }
    }

    pub fn logger_info(&self, msg: &str) {
        tracing::info!(module = %self.module_name, "{}", msg);
    }

    pub fn logger_warn(&self, msg: &str) {
        tracing::warn!(module = %self.module_name, "{}", msg);
    }

    pub fn logger_error(&self, msg: &str) {
        tracing::error!(module = %self.module_name, "{}", msg);
    }

    /// Persist a detailed trace under `module_home/crash.log`.
    pub fn write_crashlog(&self, kind: &str, message: &str, frames: &[String]) -> anyhow::Result<PathBuf> {
        crate::crashlog::write(&self.module_home, kind, message, frames)
    }

    // -- utility statics (spec §4.2) --

    pub fn get(&self, url: &str) -> anyhow::Result<String> {
        let rt = tokio::runtime::Handle::try_current();
        let fut = async { Ok::<_, anyhow::Error>(self.http.get(url).send().await?.text().await?) };
        match rt {
            Ok(handle) => tokio::task::block_in_place(|| handle.block_on(fut)),
            Err(_) => futures::executor::block_on(fut),
        }
    }

    pub fn sha(bytes: &[u8]) -> String {
        crate::manifest::sha256_hex(bytes)
    }

    pub fn join(parts: &[&str]) -> String {
        let mut path = PathBuf::new();
        for part in parts {
            path.push(part);
        }
        path.to_string_lossy().into_owned()
    }

    pub fn ensure_directory(path: &Path) -> anyhow::Result<()> {
        std::fs::create_dir_all(path)?;
        Ok(())
    }

    /// Atomic overwrite of a destination file's contents.
    pub fn overwrite(dst_file: &Path, new_bytes: &[u8]) -> anyhow::Result<()> {
        let rt = tokio::runtime::Handle::try_current();
        let fut = crate::catalog::atomic_write(dst_file, new_bytes);
        match rt {
            Ok(handle) => tokio::task::block_in_place(|| handle.block_on(fut)),
            Err(_) => futures::executor::block_on(fut),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn state() -> HelperState {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(Config::load(dir.path(), None).unwrap());
        HelperState::new("helloworld", "greets people", dir.path().join("modules/helloworld"), config, true).unwrap()
    }

    #[test]
    fn ask_auto_answers_when_yes_is_set() {
        let helper = state();
        assert_eq!("y", helper.ask("update?", &["y".to_owned(), "n".to_owned()], Some("y")));
    }

    #[test]
    fn join_behaves_like_path_join() {
        assert_eq!("a/b/c", HelperState::join(&["a", "b", "c"]));
    }

    #[test]
    fn sha_matches_manifest_hashing() {
        assert_eq!(crate::manifest::sha256_hex(b"x"), HelperState::sha(b"x"));
    }
}
