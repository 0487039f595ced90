//! Disk cache tier
//!
//! Entries live at `{root}/{xx}/{yy}/{fingerprint}.cache` as JSON,
//! written temp-then-rename so readers never observe a partial file.
//! Corrupt or truncated entries are deleted and reported as misses.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::entry::CacheEntry;
use super::fingerprint::Fingerprint;
use crate::error::{HarvestError, HarvestResult};

pub struct DiskTier {
    root: PathBuf,
}

impl DiskTier {
    pub fn new(root: PathBuf) -> HarvestResult<Self> {
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &Fingerprint) -> PathBuf {
        let (a, b) = key.shard();
        self.root.join(a).join(b).join(format!("{key}.cache"))
    }

    /// Read an entry; corrupt files are removed on the way out.
    pub fn read(&self, key: &Fingerprint, allow_stale: bool) -> Option<(CacheEntry, bool)> {
        let path = self.path_for(key);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(_) => return None,
        };
        let entry: CacheEntry = match serde_json::from_slice(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(key = %key, error = %e, "corrupt cache entry, deleting");
                let _ = fs::remove_file(&path);
                return None;
            }
        };
        let fresh = !entry.is_expired();
        if fresh || allow_stale {
            Some((entry, fresh))
        } else {
            debug!(key = %key, "expired cache entry, deleting");
            let _ = fs::remove_file(&path);
            None
        }
    }

    /// Atomically persist an entry.
    pub fn write(&self, key: &Fingerprint, entry: &CacheEntry) -> HarvestResult<()> {
        let path = self.path_for(key);
        let parent = path
            .parent()
            .ok_or_else(|| HarvestError::internal("cache path without parent"))?;
        fs::create_dir_all(parent)?;

        let encoded = serde_json::to_vec(entry)?;
        let tmp = path.with_extension("cache.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&encoded)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn remove(&self, key: &Fingerprint) {
        let _ = fs::remove_file(self.path_for(key));
    }

    /// Delete entries whose TTL elapsed; returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let mut removed = 0;
        for path in walk_cache_files(&self.root) {
            let Ok(raw) = fs::read(&path) else { continue };
            match serde_json::from_slice::<CacheEntry>(&raw) {
                Ok(entry) if entry.is_expired() => {
                    if fs::remove_file(&path).is_ok() {
                        removed += 1;
                    }
                }
                Ok(_) => {}
                Err(_) => {
                    // Corrupt entries go too.
                    if fs::remove_file(&path).is_ok() {
                        removed += 1;
                    }
                }
            }
        }
        removed
    }
}

fn walk_cache_files(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().is_some_and(|e| e == "cache") {
                files.push(path);
            }
        }
    }
    files
}
