//! Address resolver
//!
//! Composes the three cache tiers into `(pid, address) → name`:
//!
//! ```text
//! pid ──► ProcessMapTracker ──► mapping, file offset
//!                                   │
//!          (dev, inode) ──► FileIdentityResolver ──► BinaryId
//!                                                      │
//!                             SymbolTableStore ◄───────┘
//!                                   │
//!                   file offset → vaddr → symbol name
//! ```
//!
//! Resolution never fails. Whatever step breaks, the frame degrades to a
//! placeholder carrying what is known (`[unknown]`, `0x<addr>`,
//! `<path>+0x<offset>`). Results are memoized in the process map, so they live
//! exactly as long as the layout they were computed against.

use log::{debug, warn};
use serde::Serialize;
use std::sync::Arc;

use super::file_identity::{BinaryId, FileIdentityResolver};
use super::gcache::GCacheDebugInfo;
use super::kallsyms::parse_kallsyms;
use super::options::{CacheOptions, PlaceholderOptions};
use super::proc_maps::{MapsProvider, MemoryMapping};
use super::process_map::{MapLookup, ProcessMapTracker, ProcessMemoryMap};
use super::store::SymbolTableStore;
use super::symbol_table::SymbolTable;
use crate::domain::Pid;
use crate::metrics::{MetricsSink, ResolutionFailure};

/// Label used for addresses outside every mapping
pub const UNKNOWN_FRAME: &str = "[unknown]";

/// Entry counts and round of each tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResolverDebugInfo {
    pub build_id: TierInfo,
    pub same_file: TierInfo,
    pub pid: TierInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TierInfo {
    pub len: usize,
    pub capacity: usize,
    pub round: u64,
}

impl From<GCacheDebugInfo> for TierInfo {
    fn from(info: GCacheDebugInfo) -> Self {
        Self { len: info.len, capacity: info.capacity, round: info.round }
    }
}

/// Name given to one frame, and whether it is a real symbol name rather
/// than a placeholder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFrame {
    pub name: Arc<str>,
    pub known: bool,
}

impl ResolvedFrame {
    fn known(name: Arc<str>) -> Self {
        Self { name, known: true }
    }

    fn placeholder(name: Arc<str>) -> Self {
        Self { name, known: false }
    }
}

pub struct AddressResolver {
    maps: ProcessMapTracker,
    identities: FileIdentityResolver,
    store: SymbolTableStore,
    placeholders: PlaceholderOptions,
    metrics: Arc<dyn MetricsSink>,
}

impl AddressResolver {
    #[must_use]
    pub fn new(
        cache: CacheOptions,
        placeholders: PlaceholderOptions,
        provider: Arc<dyn MapsProvider>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            maps: ProcessMapTracker::new(cache.pid, provider, metrics.clone()),
            identities: FileIdentityResolver::new(cache.same_file, metrics.clone()),
            store: SymbolTableStore::new(cache.build_id, metrics.clone()),
            placeholders,
            metrics,
        }
    }

    /// Resolve a user-space address of `pid` to a symbol name or placeholder
    pub fn resolve(&self, pid: Pid, addr: u64) -> Arc<str> {
        self.resolve_frame(pid, addr).name
    }

    /// Like [`resolve`](Self::resolve), telling symbol names from placeholders
    pub fn resolve_frame(&self, pid: Pid, addr: u64) -> ResolvedFrame {
        let (map, fresh) = match self.maps.map_for(pid) {
            Ok(found) => found,
            Err(e) => {
                debug!("Cannot read maps of {pid}: {e:#}");
                self.metrics.resolution_failure(ResolutionFailure::ProcessGone);
                return ResolvedFrame::placeholder(self.unmapped_placeholder(addr));
            }
        };
        if let Some(frame) = map.memoized(addr) {
            return frame;
        }

        let (map, frame) = match self.maps.locate(map, fresh, addr) {
            MapLookup::Mapped { map, mapping, file_offset } => {
                let frame = self.resolve_in_file(&map, &mapping, file_offset);
                (map, frame)
            }
            MapLookup::Unmapped { map } => {
                self.metrics.resolution_failure(ResolutionFailure::UnmappedAddress);
                (map, ResolvedFrame::placeholder(self.unmapped_placeholder(addr)))
            }
            MapLookup::ProcessGone => {
                return ResolvedFrame::placeholder(self.unmapped_placeholder(addr))
            }
        };

        map.memoize(addr, frame.clone());
        frame
    }

    fn resolve_in_file(
        &self,
        map: &ProcessMemoryMap,
        mapping: &MemoryMapping,
        file_offset: u64,
    ) -> ResolvedFrame {
        let Some(path) = &mapping.path else {
            self.metrics.resolution_failure(ResolutionFailure::UnmappedAddress);
            return ResolvedFrame::placeholder(Arc::from(UNKNOWN_FRAME));
        };

        if mapping.is_file_backed() {
            let identity = self.identities.resolve(mapping.file, path, &map.root);
            // Opened through this process: the one that first mapped the
            // binary may be long gone
            let table = self.store.get_or_build(&identity.id, path, &map.root);
            if let Some(name) =
                table.file_offset_to_vaddr(file_offset).and_then(|vaddr| table.lookup(vaddr))
            {
                return ResolvedFrame::known(name.clone());
            }
        }

        self.metrics.resolution_failure(ResolutionFailure::UnknownSymbol);
        ResolvedFrame::placeholder(self.module_placeholder(path, file_offset))
    }

    /// Resolve a kernel address against kallsyms
    pub fn resolve_kernel(&self, addr: u64) -> Arc<str> {
        self.resolve_kernel_frame(addr).name
    }

    pub fn resolve_kernel_frame(&self, addr: u64) -> ResolvedFrame {
        let table = self.store.get_or_insert_with(&BinaryId::Kernel, || {
            match self.maps.provider().read_kallsyms() {
                Ok(text) => parse_kallsyms(&text),
                Err(e) => {
                    warn!("Kernel symbols unavailable: {e:#}");
                    SymbolTable::empty()
                }
            }
        });

        if let Some(name) = table.lookup(addr) {
            return ResolvedFrame::known(name.clone());
        }
        self.metrics.resolution_failure(ResolutionFailure::UnknownSymbol);
        ResolvedFrame::placeholder(self.unmapped_placeholder(addr))
    }

    /// Command name of `pid`, if its layout is readable
    pub fn process_name(&self, pid: Pid) -> Option<Arc<str>> {
        self.maps.map_for(pid).ok().map(|(map, _)| map.comm.clone())
    }

    /// Whether `pid` still exists
    #[must_use]
    pub fn process_alive(&self, pid: Pid) -> bool {
        self.maps.provider().read_comm(pid).is_ok()
    }

    /// Forget the layout of `pid` (the process exec'd or exited)
    pub fn invalidate(&self, pid: Pid) {
        self.maps.invalidate(pid);
    }

    /// Advance every tier by one round, returning the number of evictions
    pub fn next_round(&self) -> usize {
        self.maps.next_round() + self.identities.next_round() + self.store.next_round()
    }

    /// Number of symbol tables parsed so far
    #[must_use]
    pub fn parse_count(&self) -> u64 {
        self.store.parse_count()
    }

    #[must_use]
    pub fn debug_info(&self) -> ResolverDebugInfo {
        ResolverDebugInfo {
            build_id: self.store.debug_info().into(),
            same_file: self.identities.debug_info().into(),
            pid: self.maps.debug_info().into(),
        }
    }

    fn unmapped_placeholder(&self, addr: u64) -> Arc<str> {
        if self.placeholders.unknown_symbol_address {
            Arc::from(format!("0x{addr:x}"))
        } else {
            Arc::from(UNKNOWN_FRAME)
        }
    }

    fn module_placeholder(&self, path: &Arc<str>, file_offset: u64) -> Arc<str> {
        if self.placeholders.unknown_symbol_module_offset {
            Arc::from(format!("{path}+0x{file_offset:x}"))
        } else {
            path.clone()
        }
    }
}
