//! Module metadata: the remote manifest shape, the local module descriptor,
//! and content hashing (spec §3 Data model, §4.3).
//!
//! Modules are WASM files plus arbitrary private data (spec §0 in
//! SPEC_FULL.md). Because a compiled guest has no Python-style docstring or
//! class attribute to introspect, description and dependencies are carried
//! in a small companion file, `module.toml`, written alongside `client.wasm`
//! / `server.wasm`. This is the Open Question resolution recorded in
//! DESIGN.md for "description extracted from the module's documentation
//! string; dependencies from a declared attribute".

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const CLIENT_ENTRY_FILE: &str = "client.wasm";
pub const SERVER_ENTRY_FILE: &str = "server.wasm";
pub const MANIFEST_FILE: &str = "module.toml";

/// The companion descriptor written into every module directory.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct ModuleDescriptor {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub kiwi_dependencies: Vec<String>,
}

impl ModuleDescriptor {
    pub fn read(module_dir: &Path) -> anyhow::Result<Self> {
        let path = module_dir.join(MANIFEST_FILE);
        if !path.is_file() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)?;
        Ok(toml::from_str(&text)?)
    }
}

/// `{ modules: [ { name, files: [ { path, sha256 } ] } ] }` — the JSON index
/// fetched from `remote.base_url` + `remote.modules_path` (spec §4.3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteManifest {
    pub modules: Vec<RemoteModuleEntry>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteModuleEntry {
    pub name: String,
    pub files: Vec<RemoteFileEntry>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteFileEntry {
    pub path: String,
    pub sha256: String,
}

impl RemoteManifest {
    pub fn entry(&self, name: &str) -> Option<&RemoteModuleEntry> {
        self.modules.iter().find(|m| m.name == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.modules.iter().map(|m| m.name.clone()).collect()
    }
}

impl RemoteModuleEntry {
    pub fn file_map(&self) -> BTreeMap<String, String> {
        self.files.iter().map(|f| (f.path.clone(), f.sha256.clone())).collect()
    }
}

/// SHA-256 of raw bytes, not text-normalized (spec §3 Invariant).
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Scan a module directory's files, `module.toml` included, into a
/// `{relpath: hash}` map, used to compare against the remote manifest. The
/// remote manifest distributes `module.toml` like any other file (catalog.rs
/// downloads it through the same `files` list), so the local scan has to
/// hash it too or every installed module reads back as perpetually stale.
pub fn local_file_hashes(module_dir: &Path) -> anyhow::Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    if !module_dir.is_dir() {
        return Ok(out);
    }
    collect_hashes(module_dir, module_dir, &mut out)?;
    Ok(out)
}

fn collect_hashes(root: &Path, dir: &Path, out: &mut BTreeMap<String, String>) -> anyhow::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_hashes(root, &path, out)?;
        } else {
            let rel = path.strip_prefix(root)?.to_string_lossy().replace('\\', "/");
            let bytes = std::fs::read(&path)?;
            out.insert(rel, sha256_hex(&bytes));
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        let a = sha256_hex(b"hello world");
        let b = sha256_hex(b"hello world");
        assert_eq!(a, b);
        assert_ne!(a, sha256_hex(b"hello worlds"));
    }

    #[test]
    fn descriptor_defaults_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = ModuleDescriptor::read(dir.path()).unwrap();
        assert!(descriptor.description.is_empty());
        assert!(descriptor.kiwi_dependencies.is_empty());
    }

    #[test]
    fn local_hashes_include_the_descriptor_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE), "description = \"x\"\n").unwrap();
        std::fs::write(dir.path().join(CLIENT_ENTRY_FILE), b"\0asm").unwrap();

        let hashes = local_file_hashes(dir.path()).unwrap();
        assert_eq!(2, hashes.len());
        assert!(hashes.contains_key(CLIENT_ENTRY_FILE));
        assert!(hashes.contains_key(MANIFEST_FILE));
    }
}
