//! Snapshot store
//!
//! Gzip-compressed page content under
//! `{root}/{xx}/{yy}/{snapshot_id}.snap`, with per-URL JSON indexes in
//! `{root}/index/{url_hash}.idx`. Ids are random 128-bit values in
//! lowercase base32; every path is derived from the id and checked
//! against the storage root after normalization, so no caller-supplied
//! string ever lands in a path segment.

use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use tracing::warn;

use crate::error::{HarvestError, HarvestResult};

const BASE32_ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";
const ID_LEN: usize = 26;

/// Encode 128 random bits as 26 base32 characters.
fn encode_id(value: u128) -> String {
    let mut out = String::with_capacity(ID_LEN);
    let mut v = value;
    for _ in 0..ID_LEN {
        out.push(BASE32_ALPHABET[(v & 0x1f) as usize] as char);
        v >>= 5;
    }
    out
}

/// Snapshot record kept in the per-URL index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub snapshot_id: String,
    pub url: String,
    pub taken_at: DateTime<Utc>,
    pub structural_hash: String,
    pub text_hash: String,
    pub content_bytes: u64,
    pub metadata: serde_json::Value,
}

/// Hash a URL into the index filename.
#[must_use]
pub fn url_hash(url: &str) -> String {
    hex::encode(&Sha256::digest(url.as_bytes())[..16])
}

pub struct SnapshotStore {
    root: PathBuf,
    index_dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: PathBuf) -> HarvestResult<Self> {
        let index_dir = root.join("index");
        fs::create_dir_all(&index_dir)?;
        Ok(Self { root, index_dir })
    }

    /// Validate an id and derive its storage path, enforcing the root
    /// prefix after normalization.
    fn path_for(&self, id: &str) -> HarvestResult<PathBuf> {
        if id.len() != ID_LEN || !id.bytes().all(|b| BASE32_ALPHABET.contains(&b)) {
            return Err(HarvestError::SnapshotNotFound(id.to_string()));
        }
        let path = self
            .root
            .join(&id[0..2])
            .join(&id[2..4])
            .join(format!("{id}.snap"));
        // The id alphabet excludes separators, but verify anyway: no
        // parent/root components and the storage root must prefix the
        // normalized path.
        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
            || !path.starts_with(&self.root)
        {
            return Err(HarvestError::SnapshotNotFound(id.to_string()));
        }
        Ok(path)
    }

    fn index_path(&self, url: &str) -> PathBuf {
        self.index_dir.join(format!("{}.idx", url_hash(url)))
    }

    fn load_index(&self, url: &str) -> Vec<SnapshotRecord> {
        let path = self.index_path(url);
        let Ok(raw) = fs::read(&path) else {
            return Vec::new();
        };
        match serde_json::from_slice::<Vec<SnapshotRecord>>(&raw) {
            Ok(mut records) => {
                records.sort_by_key(|r| r.taken_at);
                records
            }
            Err(e) => {
                warn!(url = %url, error = %e, "corrupt snapshot index, quarantining");
                let _ = fs::rename(&path, path.with_extension("idx.quarantine"));
                Vec::new()
            }
        }
    }

    fn save_index(&self, url: &str, records: &[SnapshotRecord]) -> HarvestResult<()> {
        let path = self.index_path(url);
        let tmp = path.with_extension("idx.tmp");
        let encoded = serde_json::to_vec(records)?;
        fs::write(&tmp, &encoded)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Persist a snapshot; returns its record.
    pub fn write(
        &self,
        url: &str,
        content: &[u8],
        structural_hash: &str,
        text_hash: &str,
        metadata: serde_json::Value,
    ) -> HarvestResult<SnapshotRecord> {
        let id = encode_id(rand::random::<u128>());
        let path = self.path_for(&id)?;
        let parent = path
            .parent()
            .ok_or_else(|| HarvestError::internal("snapshot path without parent"))?;
        fs::create_dir_all(parent)?;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(content)?;
        let compressed = encoder.finish()?;

        // create_new gives the single-writer guarantee for this id.
        let tmp = path.with_extension("snap.tmp");
        {
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&tmp)?;
            file.write_all(&compressed)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;

        let record = SnapshotRecord {
            snapshot_id: id,
            url: url.to_string(),
            taken_at: Utc::now(),
            structural_hash: structural_hash.to_string(),
            text_hash: text_hash.to_string(),
            content_bytes: content.len() as u64,
            metadata,
        };

        let mut records = self.load_index(url);
        records.push(record.clone());
        self.save_index(url, &records)?;
        Ok(record)
    }

    /// Read and decompress snapshot content.
    pub fn read(&self, id: &str) -> HarvestResult<Vec<u8>> {
        let path = self.path_for(id)?;
        let compressed = fs::read(&path)
            .map_err(|_| HarvestError::SnapshotNotFound(id.to_string()))?;
        let mut decoder = GzDecoder::new(&compressed[..]);
        let mut content = Vec::new();
        match decoder.read_to_end(&mut content) {
            Ok(_) => Ok(content),
            Err(e) => {
                warn!(id = %id, error = %e, "corrupt snapshot, quarantining");
                let _ = fs::rename(&path, path.with_extension("snap.quarantine"));
                Err(HarvestError::CorruptArtifact(format!("snapshot {id}")))
            }
        }
    }

    /// Snapshots for a URL, oldest first.
    pub fn list(&self, url: &str) -> Vec<SnapshotRecord> {
        self.load_index(url)
    }

    /// Latest snapshot for a URL.
    pub fn latest(&self, url: &str) -> Option<SnapshotRecord> {
        self.load_index(url).into_iter().next_back()
    }

    /// Earliest retained snapshot (the baseline).
    pub fn baseline(&self, url: &str) -> Option<SnapshotRecord> {
        self.load_index(url).into_iter().next()
    }

    /// Find a record by id across tracked URLs.
    pub fn find(&self, id: &str) -> Option<SnapshotRecord> {
        let entries = fs::read_dir(&self.index_dir).ok()?;
        for entry in entries.flatten() {
            let Ok(raw) = fs::read(entry.path()) else {
                continue;
            };
            if let Ok(records) = serde_json::from_slice::<Vec<SnapshotRecord>>(&raw) {
                if let Some(record) = records.into_iter().find(|r| r.snapshot_id == id) {
                    return Some(record);
                }
            }
        }
        None
    }

    /// Delete one snapshot and its index entry.
    pub fn delete(&self, id: &str) -> HarvestResult<()> {
        let record = self
            .find(id)
            .ok_or_else(|| HarvestError::SnapshotNotFound(id.to_string()))?;
        let path = self.path_for(id)?;
        let _ = fs::remove_file(path);
        let records: Vec<SnapshotRecord> = self
            .load_index(&record.url)
            .into_iter()
            .filter(|r| r.snapshot_id != id)
            .collect();
        self.save_index(&record.url, &records)?;
        Ok(())
    }

    /// Every URL with at least one snapshot.
    pub fn tracked_urls(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.index_dir) else {
            return Vec::new();
        };
        let mut urls: Vec<String> = entries
            .flatten()
            .filter(|e| e.path().extension().is_some_and(|x| x == "idx"))
            .filter_map(|e| {
                let raw = fs::read(e.path()).ok()?;
                let records: Vec<SnapshotRecord> = serde_json::from_slice(&raw).ok()?;
                records.first().map(|r| r.url.clone())
            })
            .collect();
        urls.sort();
        urls.dedup();
        urls
    }

    /// Keep at most `retain` snapshots per URL, dropping the oldest
    /// beyond the baseline.
    pub fn prune(&self, url: &str, retain: usize) -> HarvestResult<usize> {
        let records = self.load_index(url);
        if records.len() <= retain || retain == 0 {
            return Ok(0);
        }
        // The baseline (earliest) is kept; trim the middle.
        let excess = records.len() - retain;
        let mut kept: Vec<SnapshotRecord> = Vec::with_capacity(retain);
        let mut removed = 0usize;
        for (i, record) in records.into_iter().enumerate() {
            if i == 0 || i > excess {
                kept.push(record);
            } else {
                if let Ok(path) = self.path_for(&record.snapshot_id) {
                    let _ = fs::remove_file(path);
                }
                removed += 1;
            }
        }
        self.save_index(url, &kept)?;
        Ok(removed)
    }
}
