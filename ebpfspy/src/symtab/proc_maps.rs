//! Memory mapping utilities for process address space analysis
//!
//! Parses `/proc/<pid>/maps` into the executable, file-backed segments the
//! resolver needs to turn a runtime address into a file offset:
//!
//! ```text
//! 55d1c5a3e000-55d1c5a40000 r-xp 00002000 fd:01 1234567    /usr/bin/cat
//! └── start ──┘ └── end ──┘ perms └offset┘ dev   inode      path
//!
//! file_offset = address - start + offset
//! ```
//!
//! All procfs access goes through [`MapsProvider`] so that tests can supply
//! synthetic layouts.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::domain::{FileKey, Pid};

/// One executable segment of a process's address space
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMapping {
    pub start: u64,
    pub end: u64,
    /// File offset of `start`
    pub offset: u64,
    pub file: FileKey,
    /// Path as seen inside the process's mount namespace, or a pseudo path
    /// such as `[vdso]`
    pub path: Option<Arc<str>>,
}

impl MemoryMapping {
    /// Check if an address falls within this mapping
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Offset of `addr` in the mapped file
    #[must_use]
    pub fn file_offset(&self, addr: u64) -> u64 {
        addr - self.start + self.offset
    }

    /// Backed by a regular file (as opposed to anonymous memory or `[vdso]`)
    #[must_use]
    pub fn is_file_backed(&self) -> bool {
        self.file.inode != 0 && self.path.as_deref().is_some_and(|p| p.starts_with('/'))
    }
}

/// Parse the contents of `/proc/<pid>/maps`, keeping executable mappings
///
/// The result is sorted by start address. Malformed lines are skipped.
#[must_use]
pub fn parse_maps(maps: &str) -> Vec<MemoryMapping> {
    let mut mappings: Vec<MemoryMapping> = maps.lines().filter_map(parse_line).collect();
    mappings.sort_by_key(|m| m.start);
    mappings
}

fn parse_line(line: &str) -> Option<MemoryMapping> {
    let mut rest = line;
    let mut fields = [""; 5];
    for field in &mut fields {
        let trimmed = rest.trim_start();
        let end = trimmed.find(char::is_whitespace).unwrap_or(trimmed.len());
        *field = &trimmed[..end];
        rest = &trimmed[end..];
    }
    let [range, perms, offset, dev, inode] = fields;

    if perms.as_bytes().get(2) != Some(&b'x') {
        return None;
    }

    let (start, end) = range.split_once('-')?;
    let start = u64::from_str_radix(start, 16).ok()?;
    let end = u64::from_str_radix(end, 16).ok()?;
    let offset = u64::from_str_radix(offset, 16).ok()?;
    let (major, minor) = dev.split_once(':')?;
    let dev = (u64::from_str_radix(major, 16).ok()? << 32) | u64::from_str_radix(minor, 16).ok()?;
    let inode = inode.parse().ok()?;

    let path = rest.trim();
    let path = path.strip_suffix(" (deleted)").unwrap_or(path);
    let path = (!path.is_empty()).then(|| Arc::from(path));

    Some(MemoryMapping { start, end, offset, file: FileKey { dev, inode }, path })
}

/// Source of per-process memory layout information
pub trait MapsProvider: Send + Sync {
    /// Executable mappings of `pid`, sorted by start address
    ///
    /// # Errors
    /// Returns an error if the process is gone or inaccessible
    fn read_maps(&self, pid: Pid) -> Result<Vec<MemoryMapping>>;

    /// Command name of `pid`
    ///
    /// # Errors
    /// Returns an error if the process is gone or inaccessible
    fn read_comm(&self, pid: Pid) -> Result<String>;

    /// Directory the process's absolute paths are relative to
    fn process_root(&self, pid: Pid) -> PathBuf;

    /// Contents of the kernel symbol table
    ///
    /// # Errors
    /// Returns an error if kallsyms is unavailable
    fn read_kallsyms(&self) -> Result<String>;
}

/// [`MapsProvider`] backed by procfs
#[derive(Debug, Clone)]
pub struct ProcFs {
    proc_root: PathBuf,
}

impl ProcFs {
    #[must_use]
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self { proc_root: proc_root.into() }
    }
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl MapsProvider for ProcFs {
    fn read_maps(&self, pid: Pid) -> Result<Vec<MemoryMapping>> {
        let maps_path = self.proc_root.join(pid.0.to_string()).join("maps");
        let maps = fs::read_to_string(&maps_path)
            .with_context(|| format!("Failed to read {}", maps_path.display()))?;
        Ok(parse_maps(&maps))
    }

    fn read_comm(&self, pid: Pid) -> Result<String> {
        let comm_path = self.proc_root.join(pid.0.to_string()).join("comm");
        let comm = fs::read_to_string(&comm_path)
            .with_context(|| format!("Failed to read {}", comm_path.display()))?;
        Ok(comm.trim_end_matches('\n').to_string())
    }

    fn process_root(&self, pid: Pid) -> PathBuf {
        self.proc_root.join(pid.0.to_string()).join("root")
    }

    fn read_kallsyms(&self) -> Result<String> {
        let path = self.proc_root.join("kallsyms");
        fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))
    }
}

/// Join an absolute in-process path onto a process root
#[must_use]
pub fn host_path(root: &Path, path: &str) -> PathBuf {
    root.join(path.trim_start_matches('/'))
}
