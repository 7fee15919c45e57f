//! File identity resolver: (device, inode) → binary identifier
//!
//! The identifier keys the symbol table tier, so it must depend only on file
//! contents: the GNU build id when the ELF carries one, a hash of the file
//! otherwise. Only the ELF headers and the build-id note are read for
//! identified binaries (`object::ReadCache` pages in what the parser touches).
//!
//! Mapped files are assumed immutable, so a record is never revalidated; it
//! only leaves the cache through eviction.

use anyhow::{Context, Result};
use log::debug;
use object::{Object, ReadCache};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::fs::File;
use std::hash::Hasher;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use super::gcache::{GCache, GCacheDebugInfo};
use super::options::GCacheOptions;
use super::proc_maps::host_path;
use crate::domain::FileKey;
use crate::metrics::{CacheTier, MetricsSink, ResolutionFailure};

/// Files larger than this are neither hashed nor parsed
pub const MAX_BINARY_SIZE: u64 = 1 << 30;

/// Content-derived identity of a binary
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BinaryId {
    /// Lowercase hex of the GNU build id note
    BuildId(Arc<str>),
    /// Hash of the whole file (no build id present)
    ContentHash(u64),
    /// The running kernel (`/proc/kallsyms`)
    Kernel,
    /// File could not be read
    Unknown,
}

impl BinaryId {
    #[must_use]
    pub fn is_unknown(&self) -> bool {
        matches!(self, BinaryId::Unknown)
    }
}

impl fmt::Display for BinaryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BinaryId::BuildId(id) => write!(f, "build-id:{id}"),
            BinaryId::ContentHash(hash) => write!(f, "hash:{hash:016x}"),
            BinaryId::Kernel => f.write_str("kernel"),
            BinaryId::Unknown => f.write_str("unknown"),
        }
    }
}

/// Resolved identity of one mapped file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileIdentity {
    pub id: BinaryId,
    /// Path inside the mount namespace of the process that first mapped it
    ///
    /// Only meaningful together with the root of a process that maps the
    /// file now; the identity itself never pins a process root.
    pub path: Arc<str>,
}

/// Cache tier mapping (device, inode) to [`FileIdentity`]
pub struct FileIdentityResolver {
    cache: Mutex<GCache<FileKey, Arc<FileIdentity>>>,
    metrics: Arc<dyn MetricsSink>,
}

impl FileIdentityResolver {
    #[must_use]
    pub fn new(options: GCacheOptions, metrics: Arc<dyn MetricsSink>) -> Self {
        Self { cache: Mutex::new(GCache::new(options)), metrics }
    }

    /// Identify the file mapped as `path` by a process rooted at `root`
    ///
    /// Never fails: unreadable files yield [`BinaryId::Unknown`], which is
    /// cached like any other answer.
    pub fn resolve(&self, file: FileKey, path: &Arc<str>, root: &Path) -> Arc<FileIdentity> {
        if let Some(identity) = self.lock().get(&file) {
            self.metrics.cache_access(CacheTier::FileIdentity, true);
            return identity;
        }
        self.metrics.cache_access(CacheTier::FileIdentity, false);

        let full_path = host_path(root, path);
        let id = match compute_binary_id(&full_path) {
            Ok(id) => id,
            Err(e) => {
                debug!("Cannot identify {}: {e:#}", full_path.display());
                self.metrics.resolution_failure(ResolutionFailure::UnreadableBinary);
                BinaryId::Unknown
            }
        };
        debug!("{file} {path} -> {id}");

        let identity = Arc::new(FileIdentity { id, path: path.clone() });
        self.lock().put(file, identity.clone());
        identity
    }

    pub fn next_round(&self) -> usize {
        self.lock().next_round()
    }

    #[must_use]
    pub fn debug_info(&self) -> GCacheDebugInfo {
        self.lock().debug_info()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GCache<FileKey, Arc<FileIdentity>>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Compute the identifier of the file at `path`
///
/// # Errors
/// Returns an error if the file cannot be opened or is too large to hash
pub fn compute_binary_id(path: &Path) -> Result<BinaryId> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let len = file.metadata().context("Failed to stat binary")?.len();

    let cache = ReadCache::new(file);
    if let Ok(obj) = object::File::parse(&cache) {
        if let Ok(Some(build_id)) = obj.build_id() {
            if !build_id.is_empty() {
                return Ok(BinaryId::BuildId(hex(build_id).into()));
            }
        }
    }

    if len > MAX_BINARY_SIZE {
        anyhow::bail!("{} is too large to hash ({len} bytes)", path.display());
    }
    let file = File::open(path).with_context(|| format!("Failed to reopen {}", path.display()))?;
    Ok(BinaryId::ContentHash(hash_contents(file)?))
}

fn hash_contents(file: File) -> Result<u64> {
    let mut reader = BufReader::with_capacity(64 * 1024, file);
    let mut hasher = DefaultHasher::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf).context("Failed to read binary")?;
        if n == 0 {
            break;
        }
        hasher.write(&buf[..n]);
    }
    Ok(hasher.finish())
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}
