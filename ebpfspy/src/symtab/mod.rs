//! Address symbolization
//!
//! Three generationally cached tiers turn a sampled `(pid, address)` into a
//! function name:
//!
//! - [`process_map`]: pid → executable mappings (`/proc/<pid>/maps`)
//! - [`file_identity`]: (device, inode) → build id or content hash
//! - [`store`]: binary identifier → [`symbol_table::SymbolTable`]
//!
//! [`resolver::AddressResolver`] composes them. All tiers advance their round
//! together, once per collection cycle.

pub mod file_identity;
pub mod gcache;
pub mod kallsyms;
pub mod options;
pub mod proc_maps;
pub mod process_map;
pub mod resolver;
pub mod store;
pub mod symbol_table;

pub use file_identity::{BinaryId, FileIdentity, FileIdentityResolver};
pub use gcache::{GCache, GCacheDebugInfo};
pub use options::{CacheOptions, GCacheOptions, PlaceholderOptions};
pub use proc_maps::{MapsProvider, MemoryMapping, ProcFs};
pub use process_map::{MapLookup, ProcessMapTracker, ProcessMemoryMap};
pub use resolver::{AddressResolver, ResolvedFrame, ResolverDebugInfo, TierInfo, UNKNOWN_FRAME};
pub use store::SymbolTableStore;
pub use symbol_table::{Symbol, SymbolTable};
