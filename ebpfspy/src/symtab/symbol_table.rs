//! Per-binary symbol tables
//!
//! A [`SymbolTable`] holds the function symbols of one binary sorted by
//! address, plus its loadable segments so that a file offset taken from
//! `/proc/<pid>/maps` can be turned into the virtual address the symbols are
//! expressed in:
//!
//! ```text
//! PT_LOAD  offset 0x1000  vaddr 0x401000  filesz 0x5000
//! file offset 0x1234 → vaddr 0x401000 + (0x1234 - 0x1000) = 0x401234
//! ```
//!
//! Tables are immutable once built and shared through `Arc`.

use object::{Object, ObjectSegment, ObjectSymbol, SymbolKind};
use rustc_demangle::demangle;
use std::sync::Arc;

/// One function symbol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub start: u64,
    /// Exclusive end address
    pub end: u64,
    pub name: Arc<str>,
}

/// One loadable segment (file offset → virtual address)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub vaddr: u64,
    pub offset: u64,
    pub filesz: u64,
}

#[derive(Debug, Default)]
pub struct SymbolTable {
    symbols: Vec<Symbol>,
    segments: Vec<Segment>,
}

impl SymbolTable {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a table from unsorted symbols
    ///
    /// Symbols with a zero size extend up to the next symbol's start; the
    /// last one extends to the end of the segment holding it, or without
    /// segments to the end of the address space. When several symbols share
    /// an address the largest one is kept.
    #[must_use]
    pub fn from_symbols(mut symbols: Vec<Symbol>, mut segments: Vec<Segment>) -> Self {
        symbols.sort_by(|a, b| a.start.cmp(&b.start).then(b.end.cmp(&a.end)));
        symbols.dedup_by_key(|s| s.start);

        for i in 0..symbols.len() {
            let start = symbols[i].start;
            if symbols[i].end <= start {
                let next = symbols
                    .get(i + 1)
                    .map_or_else(|| segment_end(&segments, start), |s| s.start);
                symbols[i].end = next.max(start.saturating_add(1));
            }
        }

        segments.sort_by_key(|s| s.offset);
        Self { symbols, segments }
    }

    /// Extract function symbols and PT_LOAD segments from a parsed binary
    ///
    /// Both `.symtab` and `.dynsym` are read; stripped binaries still export
    /// their dynamic symbols.
    pub fn from_object<'data, O: Object<'data>>(obj: &O) -> Self {
        let segments = obj
            .segments()
            .map(|seg| {
                let (offset, filesz) = seg.file_range();
                Segment { vaddr: seg.address(), offset, filesz }
            })
            .filter(|seg| seg.filesz > 0)
            .collect();

        let mut symbols = function_symbols(obj.symbols());
        symbols.extend(function_symbols(obj.dynamic_symbols()));
        Self::from_symbols(symbols, segments)
    }

    /// Merge `other`'s symbols into this table, keeping this table's segments
    ///
    /// Used when symbols come from a separate debug file.
    #[must_use]
    pub fn with_symbols_from(self, other: SymbolTable) -> Self {
        let mut symbols = self.symbols;
        symbols.extend(other.symbols);
        Self::from_symbols(symbols, self.segments)
    }

    /// Name of the symbol covering `vaddr`
    #[must_use]
    pub fn lookup(&self, vaddr: u64) -> Option<&Arc<str>> {
        let idx = self.symbols.partition_point(|s| s.start <= vaddr);
        let symbol = self.symbols.get(idx.checked_sub(1)?)?;
        (vaddr < symbol.end).then_some(&symbol.name)
    }

    /// Translate an offset in the binary into the address symbols use
    ///
    /// Tables without segments (kernel symbols) use addresses directly.
    #[must_use]
    pub fn file_offset_to_vaddr(&self, offset: u64) -> Option<u64> {
        if self.segments.is_empty() {
            return None;
        }
        self.segments
            .iter()
            .find(|seg| offset >= seg.offset && offset - seg.offset < seg.filesz)
            .map(|seg| seg.vaddr + (offset - seg.offset))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }
}

/// End address of the segment whose addresses contain `vaddr`
fn segment_end(segments: &[Segment], vaddr: u64) -> u64 {
    segments
        .iter()
        .find(|seg| vaddr >= seg.vaddr && vaddr - seg.vaddr < seg.filesz)
        .map_or(u64::MAX, |seg| seg.vaddr + seg.filesz)
}

fn function_symbols<'data, S>(symbols: impl Iterator<Item = S>) -> Vec<Symbol>
where
    S: ObjectSymbol<'data>,
{
    symbols
        .filter(|sym| sym.kind() == SymbolKind::Text && sym.is_definition() && sym.address() != 0)
        .filter_map(|sym| {
            let name = sym.name().ok().filter(|n| !n.is_empty())?;
            Some(Symbol {
                start: sym.address(),
                end: sym.address().saturating_add(sym.size()),
                name: demangle_name(name).into(),
            })
        })
        .collect()
}

/// Demangle a symbol name, dropping the Rust hash suffix
///
/// Names that are not Rust symbols are returned unchanged.
#[must_use]
pub fn demangle_name(name: &str) -> String {
    format!("{:#}", demangle(name))
}
