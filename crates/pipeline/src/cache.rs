//! Keyed persistence with hierarchical fallback lookup.
//!
//! Two independent stores under one root, with different update policies:
//!
//! - the *dependency* store is keyed by {architecture, branch, manifest
//!   checksum}; restore degrades exact → branch → global → cold, save
//!   overwrites the exact key in place;
//! - the *fuzz-state* store is keyed by {fixed tag, execution timestamp};
//!   every campaign attempt appends a fresh entry and nothing is ever
//!   deleted, so the corpus is monotonically non-decreasing across runs and
//!   a crash discovery survives the run being marked failed.
//!
//! A torn save never corrupts a live entry: saves stage into a temporary
//! sibling and swap in, and restore simply prefers the newest *complete*
//! entry, degrading to an older one or a cold state otherwise.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::PipelineError;

/// Dependency-store key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyKey {
    pub arch: String,
    pub branch: String,
    /// Hex SHA-256 of the dependency manifest (lockfile).
    pub checksum: String,
}

impl DependencyKey {
    /// Key for the current architecture, a branch, and a lockfile's content.
    pub fn for_manifest(branch: &str, lockfile: &Path) -> Result<Self, PipelineError> {
        let bytes = fs::read(lockfile).map_err(|e| {
            PipelineError::infra(format!("reading manifest {}: {e}", lockfile.display()))
        })?;
        Ok(Self {
            arch: std::env::consts::ARCH.to_string(),
            branch: branch.to_string(),
            checksum: hex::encode(Sha256::digest(&bytes)),
        })
    }
}

/// How a dependency restore was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreOutcome {
    /// Exact {arch, branch, checksum} hit; dependency resolution can be
    /// skipped entirely.
    Exact,
    /// Newest entry for the branch, manifest changed.
    Branch,
    /// Newest entry for the architecture, any branch.
    Global,
    /// Nothing usable; empty state.
    Cold,
}

impl std::fmt::Display for RestoreOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestoreOutcome::Exact => write!(f, "exact"),
            RestoreOutcome::Branch => write!(f, "branch"),
            RestoreOutcome::Global => write!(f, "global"),
            RestoreOutcome::Cold => write!(f, "cold"),
        }
    }
}

/// Sidecar describing one stored entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryManifest {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub files: u64,
}

const MANIFEST_FILE: &str = "manifest.json";
const DATA_DIR: &str = "data";

/// Both keyed stores, rooted at one directory.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn deps_root(&self) -> PathBuf {
        self.root.join("deps")
    }

    fn fuzz_root(&self, tag: &str) -> PathBuf {
        self.root.join("fuzz").join(tag)
    }

    fn dep_entry_dir(&self, key: &DependencyKey) -> PathBuf {
        self.deps_root()
            .join(&key.arch)
            .join(&key.branch)
            .join(&key.checksum)
    }

    /// Restore dependency state into `dest`, trying progressively looser
    /// keys: exact → branch-only → global → cold. `dest` always exists on
    /// return; cold means it is empty.
    pub fn restore_dependencies(
        &self,
        key: &DependencyKey,
        dest: &Path,
    ) -> Result<RestoreOutcome, PipelineError> {
        ensure_empty_dir(dest)?;

        let exact = self.dep_entry_dir(key);
        if is_complete_entry(&exact) {
            copy_tree(&exact.join(DATA_DIR), dest)?;
            info!(checksum = %key.checksum, "dependency cache hit (exact)");
            return Ok(RestoreOutcome::Exact);
        }

        let branch_dir = self.deps_root().join(&key.arch).join(&key.branch);
        if let Some(entry) = newest_entry(&branch_dir) {
            copy_tree(&entry.join(DATA_DIR), dest)?;
            info!(branch = %key.branch, "dependency cache hit (branch)");
            return Ok(RestoreOutcome::Branch);
        }

        let arch_dir = self.deps_root().join(&key.arch);
        if let Some(entry) = newest_entry_nested(&arch_dir) {
            copy_tree(&entry.join(DATA_DIR), dest)?;
            info!(arch = %key.arch, "dependency cache hit (global)");
            return Ok(RestoreOutcome::Global);
        }

        debug!("dependency cache cold");
        Ok(RestoreOutcome::Cold)
    }

    /// Save dependency state, overwriting the exact key in place.
    pub fn save_dependencies(
        &self,
        key: &DependencyKey,
        src: &Path,
    ) -> Result<(), PipelineError> {
        let live = self.dep_entry_dir(key);
        let staged = stage_entry(&live, src)?;
        swap_in(&staged, &live)?;
        info!(checksum = %key.checksum, "dependency cache saved");
        Ok(())
    }

    /// Restore the most recent fuzz-state entry under `tag` into `dest`.
    /// Returns the entry name, or None for a cold start.
    pub fn restore_fuzz(
        &self,
        tag: &str,
        dest: &Path,
    ) -> Result<Option<String>, PipelineError> {
        ensure_empty_dir(dest)?;
        match newest_entry(&self.fuzz_root(tag)) {
            Some(entry) => {
                copy_tree(&entry.join(DATA_DIR), dest)?;
                let name = entry
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                info!(tag, entry = %name, "fuzz state restored");
                Ok(Some(name))
            }
            None => {
                debug!(tag, "fuzz state cold");
                Ok(None)
            }
        }
    }

    /// Append a fresh timestamped fuzz-state entry. Prior entries are never
    /// touched; the precondition is "a campaign was attempted", nothing more.
    pub fn save_fuzz(&self, tag: &str, src: &Path) -> Result<String, PipelineError> {
        let now = Utc::now();
        let short_id = &Uuid::new_v4().simple().to_string()[..8];
        let name = format!("{}-{}", now.format("%Y%m%dT%H%M%S%3f"), short_id);
        let live = self.fuzz_root(tag).join(&name);
        let staged = stage_entry(&live, src)?;
        swap_in(&staged, &live)?;
        info!(tag, entry = %name, "fuzz state saved");
        Ok(name)
    }

    /// Scoped acquisition-then-guaranteed-release around a fuzz campaign:
    /// restore into `work_dir`, run `work`, then save `work_dir` back on
    /// every exit path. The save leg is unconditional, not best-effort;
    /// a save error surfaces after `work`'s own outcome is preserved in `T`.
    pub async fn with_fuzz_state<T, F, Fut>(
        &self,
        tag: &str,
        work_dir: &Path,
        work: F,
    ) -> Result<T, PipelineError>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        self.restore_fuzz(tag, work_dir)?;
        let result = work(work_dir.to_path_buf()).await;
        match self.save_fuzz(tag, work_dir) {
            Ok(_) => Ok(result),
            Err(e) => {
                warn!(tag, error = %e, "fuzz state save failed after campaign");
                Err(e)
            }
        }
    }
}

/// An entry is complete once its manifest landed; staged entries have none.
fn is_complete_entry(dir: &Path) -> bool {
    dir.join(MANIFEST_FILE).is_file()
}

/// Newest complete entry directly under `dir`, by manifest timestamp.
fn newest_entry(dir: &Path) -> Option<PathBuf> {
    let mut best: Option<(DateTime<Utc>, PathBuf)> = None;
    for entry in fs::read_dir(dir).ok()? {
        let path = entry.ok()?.path();
        if !is_complete_entry(&path) {
            continue;
        }
        let manifest: EntryManifest =
            serde_json::from_slice(&fs::read(path.join(MANIFEST_FILE)).ok()?).ok()?;
        if best.as_ref().is_none_or(|(t, _)| manifest.created_at > *t) {
            best = Some((manifest.created_at, path));
        }
    }
    best.map(|(_, p)| p)
}

/// Newest complete entry two levels under `dir` (branch/checksum layout).
fn newest_entry_nested(dir: &Path) -> Option<PathBuf> {
    let mut best: Option<(DateTime<Utc>, PathBuf)> = None;
    let branches = fs::read_dir(dir).ok()?;
    for branch in branches.flatten() {
        if let Some(candidate) = newest_entry(&branch.path()) {
            let manifest: EntryManifest = serde_json::from_slice(
                &fs::read(candidate.join(MANIFEST_FILE)).ok()?,
            )
            .ok()?;
            if best.as_ref().is_none_or(|(t, _)| manifest.created_at > *t) {
                best = Some((manifest.created_at, candidate));
            }
        }
    }
    best.map(|(_, p)| p)
}

/// Stage `src` as a temporary sibling of `live`, manifest written last.
fn stage_entry(live: &Path, src: &Path) -> Result<PathBuf, PipelineError> {
    let parent = live
        .parent()
        .ok_or_else(|| PipelineError::infra("cache entry has no parent directory"))?;
    fs::create_dir_all(parent).map_err(io_infra(parent))?;

    let staged = parent.join(format!(
        ".staging-{}",
        Uuid::new_v4().simple()
    ));
    let data = staged.join(DATA_DIR);
    fs::create_dir_all(&data).map_err(io_infra(&data))?;
    let files = copy_tree(src, &data)?;

    let manifest = EntryManifest {
        id: Uuid::new_v4(),
        created_at: Utc::now(),
        files,
    };
    let manifest_path = staged.join(MANIFEST_FILE);
    fs::write(
        &manifest_path,
        serde_json::to_vec_pretty(&manifest)
            .map_err(|e| PipelineError::infra(format!("encoding cache manifest: {e}")))?,
    )
    .map_err(io_infra(&manifest_path))?;
    Ok(staged)
}

/// Replace `live` with `staged`.
fn swap_in(staged: &Path, live: &Path) -> Result<(), PipelineError> {
    if live.exists() {
        fs::remove_dir_all(live).map_err(io_infra(live))?;
    }
    fs::rename(staged, live).map_err(io_infra(live))?;
    Ok(())
}

fn ensure_empty_dir(dir: &Path) -> Result<(), PipelineError> {
    if dir.exists() {
        fs::remove_dir_all(dir).map_err(io_infra(dir))?;
    }
    fs::create_dir_all(dir).map_err(io_infra(dir))?;
    Ok(())
}

/// Recursive copy; returns the number of files copied.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<u64, PipelineError> {
    fs::create_dir_all(dst).map_err(io_infra(dst))?;
    let mut files = 0;
    let entries = fs::read_dir(src).map_err(io_infra(src))?;
    for entry in entries {
        let entry = entry.map_err(io_infra(src))?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        if from.is_dir() {
            files += copy_tree(&from, &to)?;
        } else {
            fs::copy(&from, &to).map_err(io_infra(&from))?;
            files += 1;
        }
    }
    Ok(files)
}

/// Count files in a tree; zero for a missing directory.
pub fn count_files(dir: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .map(|e| {
            let path = e.path();
            if path.is_dir() { count_files(&path) } else { 1 }
        })
        .sum()
}

fn io_infra(path: &Path) -> impl FnOnce(std::io::Error) -> PipelineError + '_ {
    move |e| PipelineError::infra(format!("cache io at {}: {e}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_file(dir: &Path, name: &str, content: &str) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join(name), content).unwrap();
    }

    fn key(branch: &str, checksum: &str) -> DependencyKey {
        DependencyKey {
            arch: "x86_64".to_string(),
            branch: branch.to_string(),
            checksum: checksum.to_string(),
        }
    }

    #[test]
    fn test_exact_hit_after_save() {
        let tmp = TempDir::new().unwrap();
        let store = CacheStore::new(tmp.path().join("cache"));
        let src = tmp.path().join("src");
        write_file(&src, "registry.bin", "deps");

        let k = key("main", "abc123");
        store.save_dependencies(&k, &src).unwrap();

        let dest = tmp.path().join("restored");
        let outcome = store.restore_dependencies(&k, &dest).unwrap();
        assert_eq!(outcome, RestoreOutcome::Exact);
        assert_eq!(fs::read_to_string(dest.join("registry.bin")).unwrap(), "deps");
    }

    #[test]
    fn test_fallback_order_exact_branch_global_cold() {
        let tmp = TempDir::new().unwrap();
        let store = CacheStore::new(tmp.path().join("cache"));
        let dest = tmp.path().join("restored");

        // Cold: nothing stored at all.
        let outcome = store.restore_dependencies(&key("main", "new"), &dest).unwrap();
        assert_eq!(outcome, RestoreOutcome::Cold);
        assert_eq!(count_files(&dest), 0);

        // Global: entry exists only under another branch.
        let src = tmp.path().join("src-other");
        write_file(&src, "old.bin", "other-branch");
        store.save_dependencies(&key("feature-x", "aaa"), &src).unwrap();
        let outcome = store.restore_dependencies(&key("main", "new"), &dest).unwrap();
        assert_eq!(outcome, RestoreOutcome::Global);

        // Branch: entry under the right branch, wrong checksum.
        let src = tmp.path().join("src-main");
        write_file(&src, "main.bin", "main-branch");
        store.save_dependencies(&key("main", "bbb"), &src).unwrap();
        let outcome = store.restore_dependencies(&key("main", "new"), &dest).unwrap();
        assert_eq!(outcome, RestoreOutcome::Branch);
        assert!(dest.join("main.bin").exists());

        // Exact beats both.
        store.save_dependencies(&key("main", "new"), &src).unwrap();
        let outcome = store.restore_dependencies(&key("main", "new"), &dest).unwrap();
        assert_eq!(outcome, RestoreOutcome::Exact);
    }

    #[test]
    fn test_dependency_save_overwrites_in_place() {
        let tmp = TempDir::new().unwrap();
        let store = CacheStore::new(tmp.path().join("cache"));
        let k = key("main", "abc");

        let src = tmp.path().join("v1");
        write_file(&src, "lock.bin", "first");
        store.save_dependencies(&k, &src).unwrap();

        let src = tmp.path().join("v2");
        write_file(&src, "lock.bin", "second");
        store.save_dependencies(&k, &src).unwrap();

        let dest = tmp.path().join("restored");
        store.restore_dependencies(&k, &dest).unwrap();
        assert_eq!(fs::read_to_string(dest.join("lock.bin")).unwrap(), "second");
        // One live entry per key, not an append series.
        let entries = fs::read_dir(
            tmp.path().join("cache/deps/x86_64/main"),
        )
        .unwrap()
        .count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn test_fuzz_save_appends_and_restore_prefers_newest() {
        let tmp = TempDir::new().unwrap();
        let store = CacheStore::new(tmp.path().join("cache"));

        let src = tmp.path().join("corpus-a");
        write_file(&src, "seed-1", "a");
        let first = store.save_fuzz("fuzz-state", &src).unwrap();

        let src = tmp.path().join("corpus-b");
        write_file(&src, "seed-1", "a");
        write_file(&src, "seed-2", "b");
        let second = store.save_fuzz("fuzz-state", &src).unwrap();
        assert_ne!(first, second);

        let dest = tmp.path().join("restored");
        let name = store.restore_fuzz("fuzz-state", &dest).unwrap().unwrap();
        assert_eq!(name, second);
        assert_eq!(count_files(&dest), 2);

        // Both entries still on disk; nothing superseded is deleted.
        let entries = fs::read_dir(tmp.path().join("cache/fuzz/fuzz-state"))
            .unwrap()
            .count();
        assert_eq!(entries, 2);
    }

    #[test]
    fn test_fuzz_corpus_never_shrinks_across_runs() {
        let tmp = TempDir::new().unwrap();
        let store = CacheStore::new(tmp.path().join("cache"));

        let seed = tmp.path().join("seed");
        write_file(&seed, "input-1", "x");
        store.save_fuzz("fuzz-state", &seed).unwrap();

        // A campaign restores, discovers a crash input, saves regardless of
        // the run being marked failed.
        let work = tmp.path().join("work");
        store.restore_fuzz("fuzz-state", &work).unwrap();
        write_file(&work, "crash-deadbeef", "boom");
        store.save_fuzz("fuzz-state", &work).unwrap();

        let dest = tmp.path().join("next-run");
        store.restore_fuzz("fuzz-state", &dest).unwrap();
        assert!(dest.join("input-1").exists(), "pre-campaign corpus kept");
        assert!(dest.join("crash-deadbeef").exists(), "crash input kept");
    }

    #[tokio::test]
    async fn test_with_fuzz_state_saves_on_every_exit_path() {
        let tmp = TempDir::new().unwrap();
        let store = CacheStore::new(tmp.path().join("cache"));
        let work = tmp.path().join("work");

        // The work closure reports failure in its T; save must still run.
        let outcome: &str = store
            .with_fuzz_state("fuzz-state", &work, |dir| async move {
                write_file(&dir, "found-by-failed-run", "boom");
                "campaign failed"
            })
            .await
            .unwrap();
        assert_eq!(outcome, "campaign failed");

        let dest = tmp.path().join("restored");
        store.restore_fuzz("fuzz-state", &dest).unwrap().unwrap();
        assert!(dest.join("found-by-failed-run").exists());
    }

    #[test]
    fn test_incomplete_entry_is_skipped() {
        let tmp = TempDir::new().unwrap();
        let store = CacheStore::new(tmp.path().join("cache"));

        // A torn save: data present, manifest missing.
        let torn = tmp.path().join("cache/fuzz/fuzz-state/20990101T000000000-dead");
        write_file(&torn.join("data"), "seed", "x");

        let dest = tmp.path().join("restored");
        assert!(store.restore_fuzz("fuzz-state", &dest).unwrap().is_none());

        // A complete older entry is preferred over the torn newer one.
        let src = tmp.path().join("src");
        write_file(&src, "seed-good", "y");
        store.save_fuzz("fuzz-state", &src).unwrap();
        let name = store.restore_fuzz("fuzz-state", &dest).unwrap().unwrap();
        assert!(!name.starts_with("20990101"));
        assert!(dest.join("seed-good").exists());
    }

    #[test]
    fn test_manifest_checksum_changes_with_content() {
        let tmp = TempDir::new().unwrap();
        let lock = tmp.path().join("Cargo.lock");
        fs::write(&lock, "v1").unwrap();
        let k1 = DependencyKey::for_manifest("main", &lock).unwrap();
        fs::write(&lock, "v2").unwrap();
        let k2 = DependencyKey::for_manifest("main", &lock).unwrap();
        assert_ne!(k1.checksum, k2.checksum);
        assert_eq!(k1.branch, "main");
    }
}
