//! Process memory map tracker
//!
//! Keeps one [`ProcessMemoryMap`] per pid. A map is a snapshot: it is never
//! patched, only replaced by a full rebuild when the layout is known to have
//! changed (exec) or suspected to have changed (an address falls outside every
//! mapping). Replacing the `Arc` discards the old map and its resolution memo
//! in one step, so readers holding the old map finish against a consistent
//! snapshot.
//!
//! A pid whose layout cannot be read is remembered as gone until the next
//! round, so the frames of an exited process do not each re-read procfs.

use anyhow::Result;
use log::debug;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use super::gcache::{GCache, GCacheDebugInfo};
use super::options::GCacheOptions;
use super::proc_maps::{MapsProvider, MemoryMapping};
use super::resolver::ResolvedFrame;
use crate::domain::Pid;
use crate::metrics::{CacheTier, MetricsSink, ResolutionFailure};

/// Resolved names memoized per map before the memo is reset
const MAX_MEMO_ENTRIES: usize = 16 * 1024;

/// Snapshot of one process's executable mappings
#[derive(Debug)]
pub struct ProcessMemoryMap {
    pub pid: Pid,
    /// Distinguishes successive snapshots of the same pid
    pub generation: u64,
    /// Command name, used as the root frame of the process's stacks
    pub comm: Arc<str>,
    /// Root of the process's mount namespace as seen from the agent
    pub root: PathBuf,
    mappings: Vec<MemoryMapping>,
    memo: Mutex<HashMap<u64, ResolvedFrame>>,
}

impl ProcessMemoryMap {
    #[must_use]
    pub fn new(
        pid: Pid,
        generation: u64,
        comm: Arc<str>,
        root: PathBuf,
        mut mappings: Vec<MemoryMapping>,
    ) -> Self {
        mappings.sort_by_key(|m| m.start);
        Self { pid, generation, comm, root, mappings, memo: Mutex::new(HashMap::new()) }
    }

    /// Mapping containing `addr`
    #[must_use]
    pub fn find(&self, addr: u64) -> Option<&MemoryMapping> {
        let idx = self.mappings.partition_point(|m| m.start <= addr);
        let mapping = self.mappings.get(idx.checked_sub(1)?)?;
        mapping.contains(addr).then_some(mapping)
    }

    #[must_use]
    pub fn mappings(&self) -> &[MemoryMapping] {
        &self.mappings
    }

    /// Frame previously resolved for `addr` in this snapshot
    #[must_use]
    pub fn memoized(&self, addr: u64) -> Option<ResolvedFrame> {
        self.memo.lock().unwrap_or_else(PoisonError::into_inner).get(&addr).cloned()
    }

    pub fn memoize(&self, addr: u64, frame: ResolvedFrame) {
        let mut memo = self.memo.lock().unwrap_or_else(PoisonError::into_inner);
        if memo.len() >= MAX_MEMO_ENTRIES {
            memo.clear();
        }
        memo.insert(addr, frame);
    }
}

/// Where an address landed in a process's layout
#[derive(Debug, Clone)]
pub enum MapLookup {
    Mapped {
        map: Arc<ProcessMemoryMap>,
        mapping: MemoryMapping,
        file_offset: u64,
    },
    /// Outside every mapping even after a rebuild
    Unmapped { map: Arc<ProcessMemoryMap> },
    /// Layout could not be read
    ProcessGone,
}

/// Cache tier mapping pid to [`ProcessMemoryMap`]
pub struct ProcessMapTracker {
    cache: Mutex<GCache<Pid, Arc<ProcessMemoryMap>>>,
    /// Pids whose layout could not be read this round
    gone: Mutex<HashSet<Pid>>,
    provider: Arc<dyn MapsProvider>,
    generation: AtomicU64,
    metrics: Arc<dyn MetricsSink>,
}

impl ProcessMapTracker {
    #[must_use]
    pub fn new(
        options: GCacheOptions,
        provider: Arc<dyn MapsProvider>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            cache: Mutex::new(GCache::new(options)),
            gone: Mutex::new(HashSet::new()),
            provider,
            generation: AtomicU64::new(0),
            metrics,
        }
    }

    /// Current map of `pid`, building it on a miss
    ///
    /// The flag is `true` when the map was built by this call.
    ///
    /// # Errors
    /// Returns an error if the process's maps cannot be read, now or earlier
    /// in this round
    pub fn map_for(&self, pid: Pid) -> Result<(Arc<ProcessMemoryMap>, bool)> {
        if self.gone().contains(&pid) {
            anyhow::bail!("{pid} is gone");
        }
        if let Some(map) = self.lock().get(&pid) {
            self.metrics.cache_access(CacheTier::ProcessMap, true);
            return Ok((map, false));
        }
        self.metrics.cache_access(CacheTier::ProcessMap, false);
        Ok((self.rebuild(pid)?, true))
    }

    /// Read the layout of `pid` afresh and replace any cached map
    ///
    /// # Errors
    /// Returns an error if the process's maps cannot be read
    pub fn rebuild(&self, pid: Pid) -> Result<Arc<ProcessMemoryMap>> {
        let mappings = match self.provider.read_maps(pid) {
            Ok(mappings) => mappings,
            Err(e) => {
                self.lock().remove(&pid);
                self.gone().insert(pid);
                return Err(e);
            }
        };
        let comm = self.provider.read_comm(pid).unwrap_or_else(|e| {
            debug!("No comm for {pid}: {e:#}");
            pid.0.to_string()
        });
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let map = Arc::new(ProcessMemoryMap::new(
            pid,
            generation,
            comm.into(),
            self.provider.process_root(pid),
            mappings,
        ));
        debug!("{pid} map generation {generation}: {} executable mappings", map.mappings.len());

        self.lock().put(pid, map.clone());
        Ok(map)
    }

    /// Locate `addr` in `pid`'s layout, rebuilding once on a miss
    pub fn lookup(&self, pid: Pid, addr: u64) -> MapLookup {
        match self.map_for(pid) {
            Ok((map, fresh)) => self.locate(map, fresh, addr),
            Err(e) => {
                debug!("Cannot read maps of {pid}: {e:#}");
                self.metrics.resolution_failure(ResolutionFailure::ProcessGone);
                MapLookup::ProcessGone
            }
        }
    }

    /// Locate `addr` in `map`; unless `fresh`, a miss rebuilds the map and
    /// retries once
    pub fn locate(&self, map: Arc<ProcessMemoryMap>, fresh: bool, addr: u64) -> MapLookup {
        if let Some(lookup) = Self::mapped(&map, addr) {
            return lookup;
        }
        if fresh {
            return MapLookup::Unmapped { map };
        }

        debug!("{} address 0x{addr:x} outside known mappings, rebuilding", map.pid);
        match self.rebuild(map.pid) {
            Ok(map) => Self::mapped(&map, addr).unwrap_or(MapLookup::Unmapped { map }),
            Err(e) => {
                debug!("Cannot rebuild maps of {}: {e:#}", map.pid);
                self.metrics.resolution_failure(ResolutionFailure::ProcessGone);
                MapLookup::ProcessGone
            }
        }
    }

    fn mapped(map: &Arc<ProcessMemoryMap>, addr: u64) -> Option<MapLookup> {
        let mapping = map.find(addr)?.clone();
        let file_offset = mapping.file_offset(addr);
        Some(MapLookup::Mapped { map: map.clone(), mapping, file_offset })
    }

    /// Drop the map of `pid` (exec or exit)
    pub fn invalidate(&self, pid: Pid) {
        self.gone().remove(&pid);
        if self.lock().remove(&pid).is_some() {
            debug!("Invalidated memory map of {pid}");
        }
    }

    /// Cached map of `pid`, without building one
    #[must_use]
    pub fn cached(&self, pid: Pid) -> Option<Arc<ProcessMemoryMap>> {
        self.lock().get(&pid)
    }

    #[must_use]
    pub fn provider(&self) -> &Arc<dyn MapsProvider> {
        &self.provider
    }

    pub fn next_round(&self) -> usize {
        self.gone().clear();
        self.lock().next_round()
    }

    #[must_use]
    pub fn debug_info(&self) -> GCacheDebugInfo {
        self.lock().debug_info()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GCache<Pid, Arc<ProcessMemoryMap>>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn gone(&self) -> std::sync::MutexGuard<'_, HashSet<Pid>> {
        self.gone.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::FileKey;
    use crate::metrics::test_metrics;
    use std::sync::atomic::AtomicUsize;

    /// Provider whose layout can be swapped, counting reads
    struct SwappableMaps {
        layout: Mutex<Option<Vec<MemoryMapping>>>,
        reads: AtomicUsize,
    }

    impl SwappableMaps {
        fn new(layout: Vec<MemoryMapping>) -> Self {
            Self { layout: Mutex::new(Some(layout)), reads: AtomicUsize::new(0) }
        }

        fn set(&self, layout: Option<Vec<MemoryMapping>>) {
            *self.layout.lock().unwrap() = layout;
        }
    }

    impl MapsProvider for SwappableMaps {
        fn read_maps(&self, _pid: Pid) -> Result<Vec<MemoryMapping>> {
            self.reads.fetch_add(1, Ordering::Relaxed);
            self.layout.lock().unwrap().clone().ok_or_else(|| anyhow::anyhow!("no such process"))
        }

        fn read_comm(&self, _pid: Pid) -> Result<String> {
            Ok("app".to_string())
        }

        fn process_root(&self, _pid: Pid) -> PathBuf {
            PathBuf::from("/")
        }

        fn read_kallsyms(&self) -> Result<String> {
            anyhow::bail!("unsupported")
        }
    }

    fn mapping(start: u64, end: u64, inode: u64) -> MemoryMapping {
        MemoryMapping {
            start,
            end,
            offset: 0x1000,
            file: FileKey { dev: 1, inode },
            path: Some(Arc::from("/usr/bin/app")),
        }
    }

    fn tracker(provider: Arc<SwappableMaps>) -> ProcessMapTracker {
        ProcessMapTracker::new(
            GCacheOptions { size: 16, keep_rounds: 2 },
            provider,
            test_metrics(),
        )
    }

    #[test]
    fn test_lookup_mapped_address() {
        let provider = Arc::new(SwappableMaps::new(vec![mapping(0x1000, 0x2000, 7)]));
        let tracker = tracker(provider.clone());

        match tracker.lookup(Pid(1), 0x1010) {
            MapLookup::Mapped { file_offset, mapping, .. } => {
                assert_eq!(file_offset, 0x1010);
                assert_eq!(mapping.file.inode, 7);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(tracker.lookup(Pid(1), 0x1020), MapLookup::Mapped { .. }));
        assert_eq!(provider.reads.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_miss_rebuilds_once() {
        let provider = Arc::new(SwappableMaps::new(vec![mapping(0x1000, 0x2000, 7)]));
        let tracker = tracker(provider.clone());
        let (before, _) = tracker.map_for(Pid(1)).unwrap();

        provider.set(Some(vec![mapping(0x9000, 0xa000, 8)]));
        match tracker.lookup(Pid(1), 0x9010) {
            MapLookup::Mapped { map, mapping, .. } => {
                assert_eq!(mapping.file.inode, 8);
                assert!(map.generation > before.generation);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(provider.reads.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_unmapped_after_rebuild() {
        let provider = Arc::new(SwappableMaps::new(vec![mapping(0x1000, 0x2000, 7)]));
        let tracker = tracker(provider.clone());
        tracker.map_for(Pid(1)).unwrap();

        assert!(matches!(tracker.lookup(Pid(1), 0x5000), MapLookup::Unmapped { .. }));
        assert_eq!(provider.reads.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_fresh_map_miss_does_not_rebuild() {
        let provider = Arc::new(SwappableMaps::new(vec![mapping(0x1000, 0x2000, 7)]));
        let tracker = tracker(provider.clone());

        assert!(matches!(tracker.lookup(Pid(1), 0x5000), MapLookup::Unmapped { .. }));
        assert_eq!(provider.reads.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_gone_process() {
        let provider = Arc::new(SwappableMaps::new(Vec::new()));
        provider.set(None);
        let tracker = tracker(provider);
        assert!(matches!(tracker.lookup(Pid(1), 0x1000), MapLookup::ProcessGone));
    }

    #[test]
    fn test_gone_process_is_read_once_per_round() {
        let provider = Arc::new(SwappableMaps::new(Vec::new()));
        provider.set(None);
        let tracker = tracker(provider.clone());

        for addr in [0x1000, 0x2000, 0x3000] {
            assert!(matches!(tracker.lookup(Pid(1), addr), MapLookup::ProcessGone));
        }
        assert_eq!(provider.reads.load(Ordering::Relaxed), 1);

        tracker.next_round();
        assert!(tracker.map_for(Pid(1)).is_err());
        assert_eq!(provider.reads.load(Ordering::Relaxed), 2);

        // An exec within the round makes the layout worth reading again
        provider.set(Some(vec![mapping(0x1000, 0x2000, 7)]));
        tracker.invalidate(Pid(1));
        assert!(matches!(tracker.lookup(Pid(1), 0x1010), MapLookup::Mapped { .. }));
        assert_eq!(provider.reads.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_invalidate_discards_map_and_memo() {
        let provider = Arc::new(SwappableMaps::new(vec![mapping(0x1000, 0x2000, 7)]));
        let tracker = tracker(provider);
        let (map, _) = tracker.map_for(Pid(1)).unwrap();
        map.memoize(0x1010, ResolvedFrame { name: Arc::from("main"), known: true });

        tracker.invalidate(Pid(1));
        assert!(tracker.cached(Pid(1)).is_none());

        let (rebuilt, fresh) = tracker.map_for(Pid(1)).unwrap();
        assert!(fresh);
        assert_eq!(rebuilt.memoized(0x1010), None);
        assert_eq!(&*rebuilt.comm, "app");
    }

    #[test]
    fn test_find_between_mappings() {
        let map = ProcessMemoryMap::new(
            Pid(1),
            1,
            Arc::from("app"),
            PathBuf::from("/"),
            vec![mapping(0x3000, 0x4000, 2), mapping(0x1000, 0x2000, 1)],
        );
        assert_eq!(map.find(0x1000).map(|m| m.file.inode), Some(1));
        assert_eq!(map.find(0x2800), None);
        assert_eq!(map.find(0x3fff).map(|m| m.file.inode), Some(2));
        assert_eq!(map.find(0x0fff), None);
    }
}
