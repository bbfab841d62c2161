//! Crash capture (spec §3 Lifecycle, §4.2 `write_crashlog`, §8 "Crash
//! capture" scenario).

use std::path::{Path, PathBuf};

use chrono::Utc;

/// Persist a detailed trace under `module_home/crash.log`. Written with the
/// same write-temp-then-rename discipline as the Catalog (spec Invariant 4
/// applies here too: a reader mid-write must never see a torn file).
pub fn write(module_home: &Path, kind: &str, message: &str, frames: &[String]) -> anyhow::Result<PathBuf> {
    let path = module_home.join("crash.log");

    let mut body = format!(
        "{} - {}: {}\n",
        Utc::now().format("%Y-%m-%d %H:%M:%S%.3fZ"),
        kind,
        message
    );
    for frame in frames {
        body.push_str("  at ");
        body.push_str(frame);
        body.push('\n');
    }

    match tokio::runtime::Handle::try_current() {
        Ok(handle) => tokio::task::block_in_place(|| handle.block_on(crate::catalog::atomic_write(&path, body.as_bytes())))?,
        Err(_) => futures::executor::block_on(crate::catalog::atomic_write(&path, body.as_bytes()))?,
    }

    Ok(path)
}

/// One-line stderr summary shown to the operator; the full trace lives in
/// the crashlog (spec §7 propagation policy).
pub fn one_line_summary(module_name: &str, message: &str) -> String {
    format!("module '{}' crashed with the following exception: {}", module_name, message)
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn write_produces_readable_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "module-crash", "boom", &["kiwi_main (client.wasm)".to_owned()]).unwrap();
        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.contains("boom"));
        assert!(text.contains("kiwi_main"));
    }
}
