// SPDX-License-Identifier: MIT OR Apache-2.0
//! Content-addressed object store.
//!
//! Objects are typed, immutable blobs keyed by the SHA-256 of their
//! contents, laid out as `<root>/<type>/<hex-hash>`. Writes go to a `.tmp`
//! sibling first and are renamed into place, so readers never observe a
//! partial object and concurrent puts of the same content are safe.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use acp_hash::sha256_hex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Object kinds
// ---------------------------------------------------------------------------

/// The closed set of object types the store accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ObjectKind {
    /// Full run transcript.
    Transcript,
    /// Canonical byte form of a hashed value.
    CanonicalBytes,
    /// Manifest of a delegation bundle.
    BundleManifest,
    /// Per-step execution proof.
    StepProof,
}

impl ObjectKind {
    /// All kinds, for status iteration.
    pub const ALL: [ObjectKind; 4] = [
        ObjectKind::Transcript,
        ObjectKind::CanonicalBytes,
        ObjectKind::BundleManifest,
        ObjectKind::StepProof,
    ];

    /// Directory name for this kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transcript => "transcript",
            Self::CanonicalBytes => "canonical-bytes",
            Self::BundleManifest => "bundle-manifest",
            Self::StepProof => "step-proof",
        }
    }

    /// Parse a directory name back into a kind.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "transcript" => Some(Self::Transcript),
            "canonical-bytes" => Some(Self::CanonicalBytes),
            "bundle-manifest" => Some(Self::BundleManifest),
            "step-proof" => Some(Self::StepProof),
            _ => None,
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum CasError {
    /// The addressed object does not exist.
    #[error("object not found: {kind}/{hash}")]
    NotFound {
        /// Object type.
        kind: ObjectKind,
        /// Requested hash.
        hash: String,
    },

    /// Stored bytes no longer hash to the object's key.
    #[error("integrity error: {kind}/{hash} hashes to {actual}")]
    Integrity {
        /// Object type.
        kind: ObjectKind,
        /// Expected hash (the key).
        hash: String,
        /// Hash the stored bytes actually produce.
        actual: String,
    },

    /// The requested type is not in the enumerated set.
    #[error("invalid object type: {value}")]
    InvalidType {
        /// The rejected type string.
        value: String,
    },

    /// Underlying filesystem failure.
    #[error("cas io error")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Options and status
// ---------------------------------------------------------------------------

/// Eviction policy for the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Never evict.
    #[default]
    None,
    /// Evict least-recently-used objects first.
    Lru,
    /// Evict oldest-first until total size fits the cap.
    SizeCap,
}

/// Store construction options.
#[derive(Debug, Clone)]
pub struct CasOptions {
    /// Eviction policy.
    pub eviction: EvictionPolicy,
    /// Size cap in bytes (consulted by `lru` and `size_cap`).
    pub max_bytes: u64,
    /// LRU entries older than this window are evictable regardless of size.
    pub retention: Duration,
}

impl Default for CasOptions {
    fn default() -> Self {
        Self {
            eviction: EvictionPolicy::None,
            max_bytes: 1024 * 1024 * 1024,
            retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// Per-type object counts.
pub type CasCounts = BTreeMap<ObjectKind, usize>;

/// Extended status snapshot.
#[derive(Debug, Clone)]
pub struct CasStatusEx {
    /// Per-type object counts.
    pub counts: CasCounts,
    /// Total bytes across all live objects.
    pub total_bytes: u64,
    /// Stray (non-object) files relative to live objects; 0.0 when clean.
    pub fragmentation: f64,
    /// Configured eviction policy.
    pub eviction: EvictionPolicy,
    /// Configured size cap in bytes.
    pub max_bytes: u64,
}

/// Access bookkeeping for one object.
#[derive(Debug, Clone, Copy)]
struct AccessRecord {
    /// Monotone counter position of the last access; lower = older.
    seq: u64,
    /// Wall time of the last access, for the retention window.
    at: Instant,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// On-disk content-addressed store.
///
/// # Examples
///
/// ```no_run
/// use acp_cas::{Cas, CasOptions, ObjectKind};
///
/// let cas = Cas::open("/var/lib/acp/cas", CasOptions::default()).unwrap();
/// let hash = cas.put(ObjectKind::Transcript, b"payload").unwrap();
/// assert_eq!(cas.get(ObjectKind::Transcript, &hash).unwrap(), b"payload");
/// ```
#[derive(Debug)]
pub struct Cas {
    root: PathBuf,
    options: CasOptions,
    /// LRU index; exclusive lock during eviction.
    index: Mutex<LruIndex>,
}

#[derive(Debug, Default)]
struct LruIndex {
    access: HashMap<(ObjectKind, String), AccessRecord>,
    next_seq: u64,
}

impl LruIndex {
    fn touch(&mut self, kind: ObjectKind, hash: &str) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.access.insert(
            (kind, hash.to_string()),
            AccessRecord {
                seq,
                at: Instant::now(),
            },
        );
    }
}

impl Cas {
    /// Open (creating if needed) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`CasError::Io`] if the type directories cannot be created.
    pub fn open(root: impl Into<PathBuf>, options: CasOptions) -> Result<Self, CasError> {
        let root = root.into();
        for kind in ObjectKind::ALL {
            std::fs::create_dir_all(root.join(kind.as_str()))?;
        }
        Ok(Self {
            root,
            options,
            index: Mutex::new(LruIndex::default()),
        })
    }

    /// The store root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, kind: ObjectKind, hash: &str) -> PathBuf {
        self.root.join(kind.as_str()).join(hash)
    }

    /// Store `bytes` under its content hash. Idempotent: an existing object
    /// is never rewritten.
    ///
    /// # Errors
    ///
    /// Returns [`CasError::Io`] on filesystem failure.
    pub fn put(&self, kind: ObjectKind, bytes: &[u8]) -> Result<String, CasError> {
        let hash = sha256_hex(bytes);
        let path = self.object_path(kind, &hash);

        if !path.exists() {
            // Write-to-temp then rename keeps readers away from partial
            // objects; concurrent writers of the same content race benignly.
            let tmp = self
                .root
                .join(kind.as_str())
                .join(format!("{hash}.tmp"));
            std::fs::write(&tmp, bytes)?;
            std::fs::rename(&tmp, &path)?;
            debug!(kind = %kind, hash = %hash, len = bytes.len(), "cas put");
        }

        self.index
            .lock()
            .expect("lru index poisoned")
            .touch(kind, &hash);

        if self.options.eviction == EvictionPolicy::SizeCap {
            self.evict_size_cap()?;
        }
        Ok(hash)
    }

    /// Fetch the object bytes for `hash`.
    ///
    /// # Errors
    ///
    /// - [`CasError::NotFound`] when no object has that hash.
    /// - [`CasError::Io`] on other filesystem failures.
    pub fn get(&self, kind: ObjectKind, hash: &str) -> Result<Vec<u8>, CasError> {
        let path = self.object_path(kind, hash);
        let bytes = std::fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CasError::NotFound {
                    kind,
                    hash: hash.to_string(),
                }
            } else {
                CasError::Io(e)
            }
        })?;
        self.index
            .lock()
            .expect("lru index poisoned")
            .touch(kind, hash);
        Ok(bytes)
    }

    /// Re-hash the stored bytes and compare against the key.
    ///
    /// # Errors
    ///
    /// - [`CasError::NotFound`] when no object has that hash.
    /// - [`CasError::Integrity`] when the stored bytes hash differently.
    pub fn verify(&self, kind: ObjectKind, hash: &str) -> Result<(), CasError> {
        let bytes = self.get(kind, hash)?;
        let actual = sha256_hex(&bytes);
        if actual != hash {
            return Err(CasError::Integrity {
                kind,
                hash: hash.to_string(),
                actual,
            });
        }
        Ok(())
    }

    /// Per-type live object counts.
    ///
    /// # Errors
    ///
    /// Returns [`CasError::Io`] if a type directory cannot be read.
    pub fn status(&self) -> Result<CasCounts, CasError> {
        let mut counts = CasCounts::new();
        for kind in ObjectKind::ALL {
            counts.insert(kind, self.live_objects(kind)?.len());
        }
        Ok(counts)
    }

    /// Extended status: counts, bytes, fragmentation, configured limits.
    ///
    /// # Errors
    ///
    /// Returns [`CasError::Io`] if a type directory cannot be read.
    pub fn status_ex(&self) -> Result<CasStatusEx, CasError> {
        let mut counts = CasCounts::new();
        let mut total_bytes = 0u64;
        let mut live = 0usize;
        let mut stray = 0usize;

        for kind in ObjectKind::ALL {
            let mut count = 0usize;
            for entry in std::fs::read_dir(self.root.join(kind.as_str()))? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if is_object_name(&name) {
                    count += 1;
                    total_bytes += entry.metadata()?.len();
                } else {
                    stray += 1;
                }
            }
            live += count;
            counts.insert(kind, count);
        }

        let fragmentation = if live == 0 {
            if stray == 0 { 0.0 } else { 1.0 }
        } else {
            stray as f64 / live as f64
        };

        Ok(CasStatusEx {
            counts,
            total_bytes,
            fragmentation,
            eviction: self.options.eviction,
            max_bytes: self.options.max_bytes,
        })
    }

    /// Remove stray files (anything whose name is not a 64-hex hash, which
    /// covers abandoned `.tmp` writes). Returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns [`CasError::Io`] if a directory cannot be read or a stray
    /// cannot be removed.
    pub fn gc(&self) -> Result<usize, CasError> {
        let mut removed = 0usize;
        for kind in ObjectKind::ALL {
            for entry in std::fs::read_dir(self.root.join(kind.as_str()))? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if !is_object_name(&name) {
                    std::fs::remove_file(entry.path())?;
                    removed += 1;
                    warn!(kind = %kind, file = %name, "cas gc removed stray file");
                }
            }
        }
        Ok(removed)
    }

    /// Evict least-recently-used objects until total size is at most
    /// `target_bytes`. Entries outside the retention window go first
    /// regardless of size pressure. Returns evicted hashes in eviction
    /// order.
    ///
    /// Ordering is deterministic: oldest access first, ties broken by
    /// hex-ascending hash; objects the index has never seen sort oldest.
    ///
    /// # Errors
    ///
    /// Returns [`CasError::Io`] on filesystem failure.
    pub fn evict_lru(&self, target_bytes: u64) -> Result<Vec<String>, CasError> {
        // Exclusive lock for the whole sweep: nothing may touch the index
        // while entries are being removed.
        let mut index = self.index.lock().expect("lru index poisoned");

        let mut entries: Vec<(ObjectKind, String, u64, Option<AccessRecord>)> = Vec::new();
        let mut total = 0u64;
        for kind in ObjectKind::ALL {
            for (hash, len) in self.live_objects(kind)? {
                let record = index.access.get(&(kind, hash.clone())).copied();
                total += len;
                entries.push((kind, hash, len, record));
            }
        }

        // Oldest first; never-seen entries (seq = 0 sentinel) lead, then
        // ascending hash for stability.
        entries.sort_by(|a, b| {
            let sa = a.3.map_or(0, |r| r.seq + 1);
            let sb = b.3.map_or(0, |r| r.seq + 1);
            sa.cmp(&sb).then_with(|| a.1.cmp(&b.1))
        });

        let now = Instant::now();
        let mut evicted = Vec::new();
        for (kind, hash, len, record) in entries {
            let expired = record
                .is_none_or(|r| now.duration_since(r.at) > self.options.retention);
            if total <= target_bytes && !expired {
                break;
            }
            std::fs::remove_file(self.object_path(kind, &hash))?;
            index.access.remove(&(kind, hash.clone()));
            total = total.saturating_sub(len);
            warn!(kind = %kind, hash = %hash, "cas evicted object");
            evicted.push(hash);
        }
        Ok(evicted)
    }

    /// Enforce `total ≤ max_bytes` using the LRU order.
    ///
    /// # Errors
    ///
    /// Returns [`CasError::Io`] on filesystem failure.
    pub fn evict_size_cap(&self) -> Result<Vec<String>, CasError> {
        self.evict_lru(self.options.max_bytes)
    }

    /// Live `(hash, size)` pairs for one kind.
    fn live_objects(&self, kind: ObjectKind) -> Result<Vec<(String, u64)>, CasError> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(self.root.join(kind.as_str()))? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_object_name(&name) {
                out.push((name, entry.metadata()?.len()));
            }
        }
        Ok(out)
    }
}

/// Parse and validate an external type string.
///
/// # Errors
///
/// Returns [`CasError::InvalidType`] for anything outside the enumerated set.
pub fn parse_object_kind(value: &str) -> Result<ObjectKind, CasError> {
    ObjectKind::parse(value).ok_or_else(|| CasError::InvalidType {
        value: value.to_string(),
    })
}

/// A valid object filename is exactly 64 lowercase hex characters.
fn is_object_name(name: &str) -> bool {
    name.len() == 64
        && name
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp(options: CasOptions) -> (tempfile::TempDir, Cas) {
        let dir = tempfile::tempdir().unwrap();
        let cas = Cas::open(dir.path(), options).unwrap();
        (dir, cas)
    }

    #[test]
    fn put_then_get_round_trips() {
        let (_dir, cas) = open_temp(CasOptions::default());
        let hash = cas.put(ObjectKind::Transcript, b"hello").unwrap();
        assert_eq!(cas.get(ObjectKind::Transcript, &hash).unwrap(), b"hello");
    }

    #[test]
    fn put_is_idempotent() {
        let (_dir, cas) = open_temp(CasOptions::default());
        let a = cas.put(ObjectKind::StepProof, b"proof").unwrap();
        let b = cas.put(ObjectKind::StepProof, b"proof").unwrap();
        assert_eq!(a, b);
        assert_eq!(cas.status().unwrap()[&ObjectKind::StepProof], 1);
    }

    #[test]
    fn same_bytes_under_different_kinds_coexist() {
        let (_dir, cas) = open_temp(CasOptions::default());
        let a = cas.put(ObjectKind::Transcript, b"x").unwrap();
        let b = cas.put(ObjectKind::StepProof, b"x").unwrap();
        assert_eq!(a, b);
        assert_eq!(cas.status().unwrap()[&ObjectKind::Transcript], 1);
        assert_eq!(cas.status().unwrap()[&ObjectKind::StepProof], 1);
    }

    #[test]
    fn get_missing_is_not_found() {
        let (_dir, cas) = open_temp(CasOptions::default());
        let err = cas.get(ObjectKind::Transcript, &"0".repeat(64)).unwrap_err();
        assert!(matches!(err, CasError::NotFound { .. }));
    }

    #[test]
    fn verify_detects_corruption() {
        let (dir, cas) = open_temp(CasOptions::default());
        let hash = cas.put(ObjectKind::BundleManifest, b"manifest").unwrap();
        cas.verify(ObjectKind::BundleManifest, &hash).unwrap();

        // Corrupt the file on disk behind the store's back.
        let path = dir.path().join("bundle-manifest").join(&hash);
        std::fs::write(&path, b"tampered").unwrap();

        let err = cas.verify(ObjectKind::BundleManifest, &hash).unwrap_err();
        assert!(matches!(err, CasError::Integrity { .. }));
    }

    #[test]
    fn gc_removes_tmp_strays_only() {
        let (dir, cas) = open_temp(CasOptions::default());
        let hash = cas.put(ObjectKind::Transcript, b"keep").unwrap();
        std::fs::write(dir.path().join("transcript").join("garbage.tmp"), b"x").unwrap();
        std::fs::write(dir.path().join("transcript").join("short"), b"y").unwrap();

        assert_eq!(cas.gc().unwrap(), 2);
        assert!(cas.get(ObjectKind::Transcript, &hash).is_ok());
    }

    #[test]
    fn invalid_type_rejected() {
        assert!(matches!(
            parse_object_kind("blob"),
            Err(CasError::InvalidType { .. })
        ));
        assert_eq!(
            parse_object_kind("step-proof").unwrap(),
            ObjectKind::StepProof
        );
    }

    #[test]
    fn status_ex_reports_bytes_and_fragmentation() {
        let (dir, cas) = open_temp(CasOptions::default());
        cas.put(ObjectKind::Transcript, b"12345").unwrap();
        std::fs::write(dir.path().join("transcript").join("stray.tmp"), b"x").unwrap();

        let status = cas.status_ex().unwrap();
        assert_eq!(status.total_bytes, 5);
        assert!((status.fragmentation - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn lru_eviction_is_oldest_first() {
        let (_dir, cas) = open_temp(CasOptions {
            eviction: EvictionPolicy::Lru,
            max_bytes: 1024,
            retention: Duration::from_secs(3600),
        });
        let first = cas.put(ObjectKind::Transcript, b"aaaa").unwrap();
        let second = cas.put(ObjectKind::Transcript, b"bbbb").unwrap();
        // Refresh `first`, making `second` the LRU entry.
        cas.get(ObjectKind::Transcript, &first).unwrap();

        let evicted = cas.evict_lru(4).unwrap();
        assert_eq!(evicted, vec![second.clone()]);
        assert!(cas.get(ObjectKind::Transcript, &first).is_ok());
        assert!(matches!(
            cas.get(ObjectKind::Transcript, &second),
            Err(CasError::NotFound { .. })
        ));
    }

    #[test]
    fn size_cap_enforced_on_put() {
        let (_dir, cas) = open_temp(CasOptions {
            eviction: EvictionPolicy::SizeCap,
            max_bytes: 8,
            retention: Duration::from_secs(3600),
        });
        cas.put(ObjectKind::Transcript, b"11111111").unwrap();
        cas.put(ObjectKind::Transcript, b"22222222").unwrap();

        let status = cas.status_ex().unwrap();
        assert!(status.total_bytes <= 8, "cap exceeded: {}", status.total_bytes);
    }

    #[test]
    fn retention_window_overrides_size() {
        let (_dir, cas) = open_temp(CasOptions {
            eviction: EvictionPolicy::Lru,
            max_bytes: 1024,
            retention: Duration::ZERO,
        });
        cas.put(ObjectKind::Transcript, b"old").unwrap();
        // Plenty of room, but the zero retention window expires everything.
        let evicted = cas.evict_lru(1024).unwrap();
        assert_eq!(evicted.len(), 1);
    }

    #[test]
    fn eviction_tie_break_is_hash_ascending() {
        let (_dir, cas) = open_temp(CasOptions {
            eviction: EvictionPolicy::None,
            max_bytes: 0,
            retention: Duration::from_secs(3600),
        });
        let mut hashes = vec![
            cas.put(ObjectKind::Transcript, b"one").unwrap(),
            cas.put(ObjectKind::Transcript, b"two").unwrap(),
            cas.put(ObjectKind::Transcript, b"three").unwrap(),
        ];
        // Target 0 evicts everything; the sweep order follows access order
        // with hash-ascending tie-breaks, and the evicted set is exact.
        let evicted = cas.evict_lru(0).unwrap();
        assert_eq!(evicted.len(), 3);
        let mut sorted = evicted.clone();
        sorted.sort();
        hashes.sort();
        assert_eq!(sorted, hashes);
    }
}
