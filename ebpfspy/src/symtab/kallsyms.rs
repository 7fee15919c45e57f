//! Kernel symbols from `/proc/kallsyms`
//!
//! ```text
//! ffffffff81000000 T _stext
//! ffffffffc0a01000 t nf_hook_slow	[nf_tables]
//! ```
//!
//! Only text symbols are kept. With `kptr_restrict` in effect every address
//! reads as zero; the table is then empty and kernel frames degrade to
//! placeholders.
//!
//! kallsyms carries no sizes. Each symbol runs up to the next one, core
//! kernel text stops at `_etext`, and the highest symbol is unbounded.

use super::symbol_table::{Symbol, SymbolTable};

/// End of the core kernel text; module text lives above it
const TEXT_END: &str = "_etext";

/// Parse kallsyms text into a table addressed by kernel virtual address
#[must_use]
pub fn parse_kallsyms(text: &str) -> SymbolTable {
    let mut symbols: Vec<Symbol> = text.lines().filter_map(parse_line).collect();

    if let Some(etext) = symbols.iter().find(|s| &*s.name == TEXT_END).map(|s| s.start) {
        symbols.retain(|s| &*s.name != TEXT_END);
        symbols.sort_by_key(|s| s.start);
        for i in 0..symbols.len() {
            if symbols[i].start < etext {
                let next = symbols.get(i + 1).map_or(etext, |s| s.start.min(etext));
                symbols[i].end = next;
            }
        }
    }
    SymbolTable::from_symbols(symbols, Vec::new())
}

fn parse_line(line: &str) -> Option<Symbol> {
    let mut fields = line.split_whitespace();
    let addr = u64::from_str_radix(fields.next()?, 16).ok()?;
    let kind = fields.next()?;
    let name = fields.next()?;

    if addr == 0 || !matches!(kind, "T" | "t" | "W" | "w") {
        return None;
    }
    Some(Symbol { start: addr, end: addr, name: name.into() })
}
