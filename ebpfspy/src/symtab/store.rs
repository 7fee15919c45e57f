//! Symbol table store
//!
//! Symbol tables are keyed by [`BinaryId`], not by path or pid: a binary
//! mapped by a thousand processes, or reachable through several (device,
//! inode) pairs, is parsed once. Parsing runs outside the tier lock; two
//! concurrent misses on the same identifier may both parse, and the last
//! insert wins.

use anyhow::{Context, Result};
use log::{debug, warn};
use object::{Object, ReadCache};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use super::file_identity::{BinaryId, MAX_BINARY_SIZE};
use super::gcache::{GCache, GCacheDebugInfo};
use super::options::GCacheOptions;
use super::proc_maps::host_path;
use super::symbol_table::SymbolTable;
use crate::metrics::{CacheTier, MetricsSink, ResolutionFailure};

const DEBUG_ROOT: &str = "/usr/lib/debug";

pub struct SymbolTableStore {
    cache: Mutex<GCache<BinaryId, Arc<SymbolTable>>>,
    empty: Arc<SymbolTable>,
    parse_count: AtomicU64,
    metrics: Arc<dyn MetricsSink>,
}

impl SymbolTableStore {
    #[must_use]
    pub fn new(options: GCacheOptions, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            cache: Mutex::new(GCache::new(options)),
            empty: Arc::new(SymbolTable::empty()),
            parse_count: AtomicU64::new(0),
            metrics,
        }
    }

    /// Symbol table of binary `id`, parsing it from `path` under `root` on a
    /// miss
    ///
    /// `root` must belong to a process that maps the binary right now: a
    /// table evicted long after its first mapper exited is rebuilt through
    /// whichever process still uses it. Unknown binaries share one empty
    /// table. A binary that cannot be opened through `root` is not cached, so
    /// the next caller retries with its own root. Parse failures are cached as
    /// empty tables, so a broken binary is not re-read every round.
    pub fn get_or_build(&self, id: &BinaryId, path: &str, root: &Path) -> Arc<SymbolTable> {
        if id.is_unknown() {
            return self.empty.clone();
        }
        if let Some(table) = self.cached(id) {
            return table;
        }

        let full_path = host_path(root, path);
        let cache = match open_bounded(&full_path) {
            Ok(cache) => cache,
            Err(e) => {
                debug!("Cannot open {} for {id}: {e:#}", full_path.display());
                self.metrics.resolution_failure(ResolutionFailure::UnreadableBinary);
                return self.empty.clone();
            }
        };
        let table = match parse_symbol_table(&cache, id, path, root) {
            Ok(table) => table,
            Err(e) => {
                debug!("No symbols for {path} ({id}): {e:#}");
                self.metrics.resolution_failure(ResolutionFailure::SymbolTableParse);
                SymbolTable::empty()
            }
        };
        self.insert(id, table)
    }

    /// Table stored under `id`, built with `build` on a miss
    pub fn get_or_insert_with<F>(&self, id: &BinaryId, build: F) -> Arc<SymbolTable>
    where
        F: FnOnce() -> SymbolTable,
    {
        match self.cached(id) {
            Some(table) => table,
            None => self.insert(id, build()),
        }
    }

    fn cached(&self, id: &BinaryId) -> Option<Arc<SymbolTable>> {
        let table = self.lock().get(id);
        self.metrics.cache_access(CacheTier::SymbolTable, table.is_some());
        table
    }

    fn insert(&self, id: &BinaryId, table: SymbolTable) -> Arc<SymbolTable> {
        let table = Arc::new(table);
        self.parse_count.fetch_add(1, Ordering::Relaxed);
        debug!("Built symbol table for {id}: {} symbols", table.len());

        self.lock().put(id.clone(), table.clone());
        table
    }

    /// Number of tables built since creation
    #[must_use]
    pub fn parse_count(&self) -> u64 {
        self.parse_count.load(Ordering::Relaxed)
    }

    pub fn next_round(&self) -> usize {
        self.lock().next_round()
    }

    #[must_use]
    pub fn debug_info(&self) -> GCacheDebugInfo {
        self.lock().debug_info()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GCache<BinaryId, Arc<SymbolTable>>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Parse binary `id` mapped as `path` by a process rooted at `root`,
/// pulling symbols from a separate debug file when the binary itself has been
/// stripped
///
/// # Errors
/// Returns an error if the binary cannot be opened or parsed
pub fn load_symbol_table(id: &BinaryId, path: &str, root: &Path) -> Result<SymbolTable> {
    let cache = open_bounded(&host_path(root, path))?;
    parse_symbol_table(&cache, id, path, root)
}

fn parse_symbol_table(
    cache: &ReadCache<File>,
    id: &BinaryId,
    path: &str,
    root: &Path,
) -> Result<SymbolTable> {
    let obj = object::File::parse(cache).with_context(|| format!("Failed to parse {path}"))?;

    let mut table = SymbolTable::from_object(&obj);
    if obj.section_by_name(".symtab").is_some() {
        return Ok(table);
    }

    for candidate in debug_file_candidates(id, path, root, &obj) {
        let Ok(debug_cache) = open_bounded(&candidate) else {
            continue;
        };
        match object::File::parse(&debug_cache) {
            Ok(debug_obj) => {
                debug!("Using debug file {} for {path}", candidate.display());
                table = table.with_symbols_from(SymbolTable::from_object(&debug_obj));
                break;
            }
            Err(e) => warn!("Ignoring unparsable debug file {}: {e}", candidate.display()),
        }
    }
    Ok(table)
}

fn open_bounded(path: &Path) -> Result<ReadCache<File>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let len = file.metadata().context("Failed to stat binary")?.len();
    if len > MAX_BINARY_SIZE {
        anyhow::bail!("{} is too large to parse ({len} bytes)", path.display());
    }
    Ok(ReadCache::new(file))
}

/// Where a separate debug file for binary `id` at `path` may live, in
/// lookup order
fn debug_file_candidates<'data, O: Object<'data>>(
    id: &BinaryId,
    path: &str,
    root: &Path,
    obj: &O,
) -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    if let BinaryId::BuildId(build_id) = id {
        if build_id.len() > 2 {
            let (dir, rest) = build_id.split_at(2);
            let path = format!("{DEBUG_ROOT}/.build-id/{dir}/{rest}.debug");
            candidates.push(host_path(root, &path));
        }
    }

    if let Ok(Some((link, _crc))) = obj.gnu_debuglink() {
        let link = String::from_utf8_lossy(link);
        let binary_dir = Path::new(path).parent().unwrap_or_else(|| Path::new("/"));
        let binary_dir = binary_dir.to_string_lossy();
        let binary_dir = binary_dir.trim_end_matches('/');

        for candidate in [
            format!("{binary_dir}/{link}"),
            format!("{binary_dir}/.debug/{link}"),
            format!("{DEBUG_ROOT}{binary_dir}/{link}"),
        ] {
            candidates.push(host_path(root, &candidate));
        }
    }

    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{test_metrics, SymtabMetrics};
    use crate::symtab::file_identity::compute_binary_id;
    use std::io::Write;

    fn store(metrics: Arc<SymtabMetrics>) -> SymbolTableStore {
        SymbolTableStore::new(GCacheOptions { size: 4, keep_rounds: 2 }, metrics)
    }

    fn own_exe() -> (BinaryId, String) {
        let exe = std::env::current_exe().unwrap();
        (compute_binary_id(&exe).unwrap(), exe.to_str().unwrap().to_string())
    }

    #[test]
    fn test_table_built_once_per_binary_id() {
        let metrics = test_metrics();
        let store = store(metrics.clone());
        let (id, path) = own_exe();

        let first = store.get_or_build(&id, &path, Path::new("/"));
        let second = store.get_or_build(&id, &path, Path::new("/"));

        assert!(Arc::ptr_eq(&first, &second));
        assert!(!first.is_empty());
        assert_eq!(store.parse_count(), 1);
        assert_eq!(metrics.snapshot().symbol_table, (1, 1));
    }

    #[test]
    fn test_unknown_binary_is_never_parsed() {
        let store = store(test_metrics());
        assert!(store.get_or_build(&BinaryId::Unknown, "/gone", Path::new("/")).is_empty());
        assert_eq!(store.parse_count(), 0);
    }

    #[test]
    fn test_parse_failure_is_cached_as_empty() {
        let metrics = test_metrics();
        let store = store(metrics.clone());
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"definitely not ELF").unwrap();
        let id = compute_binary_id(file.path()).unwrap();
        let path = file.path().to_str().unwrap();

        assert!(store.get_or_build(&id, path, Path::new("/")).is_empty());
        assert!(store.get_or_build(&id, path, Path::new("/")).is_empty());
        assert_eq!(store.parse_count(), 1);
        assert_eq!(metrics.failures(ResolutionFailure::SymbolTableParse), 1);
    }

    #[test]
    fn test_open_failure_is_retried_under_another_root() {
        let metrics = test_metrics();
        let store = store(metrics.clone());
        let (id, path) = own_exe();
        let gone = tempfile::tempdir().unwrap();

        // The binary is not reachable under the first root
        assert!(store.get_or_build(&id, &path, gone.path()).is_empty());
        assert_eq!(store.parse_count(), 0);
        assert_eq!(store.debug_info().len, 0);
        assert_eq!(metrics.failures(ResolutionFailure::UnreadableBinary), 1);

        let table = store.get_or_build(&id, &path, Path::new("/"));
        assert!(!table.is_empty());
        assert_eq!(store.parse_count(), 1);
    }

    #[test]
    fn test_get_or_insert_with() {
        let store = store(test_metrics());
        let table = store.get_or_insert_with(&BinaryId::Kernel, SymbolTable::empty);
        let again = store.get_or_insert_with(&BinaryId::Kernel, || unreachable!());
        assert!(Arc::ptr_eq(&table, &again));
    }

    #[test]
    fn test_build_id_debug_path() {
        let id = BinaryId::BuildId(Arc::from("abcdef0123"));
        let exe = std::fs::read(std::env::current_exe().unwrap()).unwrap();
        let obj = object::File::parse(&*exe).unwrap();

        let candidates = debug_file_candidates(&id, "/usr/bin/app", Path::new("/proc/9/root"), &obj);
        assert_eq!(
            candidates.first(),
            Some(&PathBuf::from("/proc/9/root/usr/lib/debug/.build-id/ab/cdef0123.debug"))
        );
    }
}
