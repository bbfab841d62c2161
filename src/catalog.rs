//! The module catalog and fetch/update subsystem (spec C3).
//!
//! Reconciles a local module tree against a remote manifest with per-module
//! versioning. Grounded in the teacher's `emplacer.rs` (cache-path
//! resolution, atomic write helper) generalized from a single bindle source
//! to a flat JSON manifest, and in `original_source/runtime/client.py`
//! (fetch/update CLI semantics and result reporting).

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::config::Config;
use crate::manifest::{local_file_hashes, ModuleDescriptor, RemoteManifest, MANIFEST_FILE};

pub struct Catalog {
    modules_dir: PathBuf,
    base_url: String,
    modules_path: String,
}

#[derive(Debug, Default)]
pub struct FetchReport {
    pub fetched: Vec<String>,
    pub updatable: Vec<String>,
    pub failed: Vec<String>,
}

impl Catalog {
    pub fn new(config: &Config) -> Self {
        Self {
            modules_dir: config.modules_dir(),
            base_url: config.get_str("remote.base_url").unwrap_or_default(),
            modules_path: config.get_str("remote.modules_path").unwrap_or_default(),
        }
    }

    /// Enumerate immediate subdirectories of `modules_dir` that contain a
    /// client entry file, lexicographically ordered.
    pub fn installed(&self) -> anyhow::Result<Vec<String>> {
        if !self.modules_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.modules_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() && path.join(crate::manifest::CLIENT_ENTRY_FILE).is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn module_dir(&self, name: &str) -> PathBuf {
        self.modules_dir.join(name)
    }

    pub fn description(&self, name: &str) -> String {
        ModuleDescriptor::read(&self.module_dir(name)).map(|d| d.description).unwrap_or_default()
    }

    /// Fetch soft-fails: a caller who can't reach the remote is told only
    /// locals are visible (spec §4.3).
    pub async fn remote_manifest(&self) -> anyhow::Result<RemoteManifest> {
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), self.modules_path);
        let body = reqwest::get(&url)
            .await
            .with_context(|| format!("fetching remote manifest from {}", url))?
            .error_for_status()
            .with_context(|| format!("remote manifest request to {} failed", url))?
            .text()
            .await
            .context("reading remote manifest body")?;
        serde_json::from_str(&body).context("remote manifest was not valid JSON")
    }

    /// `fetch(names, force_update)` — see spec §4.3 for the full algorithm.
    pub async fn fetch(&self, names: &[String], force_update: bool, for_update: bool) -> anyhow::Result<FetchReport> {
        let manifest = self.remote_manifest().await?;

        let resolved_names: Vec<String> = if names.is_empty() || names.iter().any(|n| n == "all") {
            if for_update {
                self.installed()?
            } else {
                manifest.names()
            }
        } else {
            names.to_vec()
        };

        let mut report = FetchReport::default();
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: Vec<String> = resolved_names;

        while let Some(name) = queue.pop() {
            if !visited.insert(name.clone()) {
                continue;
            }

            let entry = match manifest.entry(&name) {
                Some(entry) => entry,
                None => {
                    report.failed.push(name);
                    continue;
                }
            };

            let remote_files = entry.file_map();
            let module_dir = self.module_dir(&name);
            let local_files = local_file_hashes(&module_dir)?;
            let installed = !local_files.is_empty();

            let differing: Vec<&String> = remote_files
                .iter()
                .filter(|(path, hash)| local_files.get(*path) != Some(*hash))
                .map(|(path, _)| path)
                .collect();

            let should_download = !installed || (!differing.is_empty() && force_update);
            let is_updatable = installed && !differing.is_empty() && !force_update;

            if should_download {
                for path in remote_files.keys() {
                    if !installed || local_files.get(path) != remote_files.get(path) {
                        self.download_file(&name, &module_dir, path).await?;
                    }
                }
                report.fetched.push(name.clone());
            } else if is_updatable {
                report.updatable.push(name.clone());
            }

            // Dependency closure: recursively apply to declared dependencies
            // of every fetched module, tolerating cycles via the visited set.
            if should_download {
                let descriptor = ModuleDescriptor::read(&module_dir).unwrap_or_default();
                for dep in descriptor.kiwi_dependencies {
                    if dep != name && !visited.contains(&dep) {
                        queue.push(dep);
                    }
                }
            }
        }

        Ok(report)
    }

    async fn download_file(&self, module_name: &str, module_dir: &Path, relpath: &str) -> anyhow::Result<()> {
        let url = format!(
            "{}/modules/{}/{}",
            self.base_url.trim_end_matches('/'),
            module_name,
            relpath
        );
        let bytes = reqwest::get(&url)
            .await
            .with_context(|| format!("fetching {}", url))?
            .error_for_status()
            .with_context(|| format!("fetch of {} failed", url))?
            .bytes()
            .await
            .with_context(|| format!("reading body of {}", url))?;

        let dest = module_dir.join(relpath);
        atomic_write(&dest, &bytes).await
    }

    pub fn remove(&self, name: &str) -> anyhow::Result<()> {
        let dir = self.module_dir(name);
        if dir.is_dir() {
            std::fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    /// `[x]`/`[ ]`/`[?]` classification for `--list-modules` (spec §9: this is
    /// an explicit UI behavior, not an error).
    pub fn classify(&self, installed: &[String], remote: &[String]) -> Vec<(String, char)> {
        let installed_set: HashSet<&String> = installed.iter().collect();
        let remote_set: HashSet<&String> = remote.iter().collect();

        let mut rows: Vec<(String, char)> = remote
            .iter()
            .map(|name| (name.clone(), if installed_set.contains(name) { 'x' } else { ' ' }))
            .collect();

        let mut unknown: Vec<&String> = installed.iter().filter(|n| !remote_set.contains(n)).collect();
        unknown.sort();
        for name in unknown {
            rows.push((name.clone(), '?'));
        }

        rows
    }
}

/// Write-temp-then-rename, directory-creating (spec §3 lifecycle, §8 Invariant
/// 4). The temp file lives alongside the destination so the rename stays on
/// one filesystem.
pub async fn atomic_write(dest: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let dir = dest.parent().ok_or_else(|| anyhow::anyhow!("{} has no parent directory", dest.display()))?;
    tokio::fs::create_dir_all(dir).await?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("creating temp file in {}", dir.display()))?;
    std::io::Write::write_all(&mut tmp, bytes)?;
    tmp.persist(dest).map_err(|e| anyhow::anyhow!("persisting {}: {}", dest.display(), e.error))?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn make_config(home: &Path) -> Config {
        Config::load(home, None).unwrap()
    }

    #[tokio::test]
    async fn atomic_write_creates_dirs_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("a").join("b").join(MANIFEST_FILE);
        atomic_write(&dest, b"description = \"x\"").await.unwrap();
        assert_eq!("description = \"x\"", std::fs::read_to_string(&dest).unwrap());
    }

    #[test]
    fn installed_lists_only_dirs_with_client_entry() {
        let home = tempfile::tempdir().unwrap();
        let config = make_config(home.path());
        let modules_dir = config.modules_dir();
        std::fs::create_dir_all(modules_dir.join("real")).unwrap();
        std::fs::write(modules_dir.join("real").join(crate::manifest::CLIENT_ENTRY_FILE), b"\0asm").unwrap();
        std::fs::create_dir_all(modules_dir.join("empty")).unwrap();

        let catalog = Catalog::new(&config);
        let installed = catalog.installed().unwrap();
        assert_eq!(vec!["real".to_owned()], installed);
    }

    #[test]
    fn classify_marks_unknown_locals_with_question_mark() {
        let home = tempfile::tempdir().unwrap();
        let config = make_config(home.path());
        let catalog = Catalog::new(&config);

        let rows = catalog.classify(
            &["helloworld".to_owned(), "orphan".to_owned()],
            &["helloworld".to_owned(), "journal".to_owned()],
        );

        assert_eq!(("helloworld".to_owned(), 'x'), rows[0]);
        assert_eq!(("journal".to_owned(), ' '), rows[1]);
        assert_eq!(("orphan".to_owned(), '?'), rows[2]);
    }
}
