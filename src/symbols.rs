//! Symbolic name substitution for key columns.
//!
//! `options +names` replaces integer keys with their textual aliases. Name
//! tables come from an external provider per symbol class; protocol numbers
//! have a built-in table. Lookups go through a bounded LRU so a provider
//! backed by something expensive is only consulted once per hot value.

use crate::protocol::protocol_name;

use lru::LruCache;

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// What an integer key column denotes, for symbol table selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum SymClass {
    Port,
    Protocol,
    As,
    Tag,
    Interface,
    /// No symbolic form; always rendered as a decimal literal.
    Plain,
}

const SYM_CLASSES: usize = 5;

impl SymClass {
    fn slot(self) -> Option<usize> {
        match self {
            SymClass::Port => Some(0),
            SymClass::Protocol => Some(1),
            SymClass::As => Some(2),
            SymClass::Tag => Some(3),
            SymClass::Interface => Some(4),
            SymClass::Plain => None,
        }
    }
}

/// Maps an integer to its textual alias.
pub trait SymbolSource: Send + Sync {
    fn lookup(&self, value: u32) -> Option<String>;
}

/// Symbol source over an in-memory map.
#[derive(Debug, Clone, Default)]
pub struct MapSymbols {
    map: HashMap<u32, String>,
}

impl MapSymbols {
    pub fn new() -> MapSymbols {
        MapSymbols::default()
    }

    pub fn insert(&mut self, value: u32, name: &str) -> &mut Self {
        self.map.insert(value, name.to_string());
        self
    }
}

impl FromIterator<(u32, String)> for MapSymbols {
    fn from_iter<I: IntoIterator<Item = (u32, String)>>(iter: I) -> MapSymbols {
        MapSymbols {
            map: iter.into_iter().collect(),
        }
    }
}

impl SymbolSource for MapSymbols {
    fn lookup(&self, value: u32) -> Option<String> {
        self.map.get(&value).cloned()
    }
}

const RESOLVE_CACHE: usize = 4096;

/// Per-class symbol tables with a shared lookup cache.
pub struct SymbolResolver {
    sources: [Option<Arc<dyn SymbolSource>>; SYM_CLASSES],
    cache: LruCache<(u8, u32), Option<String>>,
}

impl fmt::Debug for SymbolResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bound: Vec<usize> = (0..SYM_CLASSES)
            .filter(|&i| self.sources[i].is_some())
            .collect();
        f.debug_struct("SymbolResolver")
            .field("bound_slots", &bound)
            .field("cached", &self.cache.len())
            .finish()
    }
}

impl Default for SymbolResolver {
    fn default() -> Self {
        SymbolResolver::new()
    }
}

impl SymbolResolver {
    /// Resolver with only the built-in protocol table bound.
    pub fn new() -> SymbolResolver {
        SymbolResolver {
            sources: [None, None, None, None, None],
            cache: LruCache::new(NonZeroUsize::new(RESOLVE_CACHE).unwrap()),
        }
    }

    /// Bind a symbol table for one class, replacing any previous binding.
    pub fn bind(&mut self, class: SymClass, source: Arc<dyn SymbolSource>) {
        if let Some(slot) = class.slot() {
            self.sources[slot] = Some(source);
            self.cache.clear();
        }
    }

    /// Alias for `value` in `class`, or `None` to fall back to the decimal
    /// literal.
    pub fn resolve(&mut self, class: SymClass, value: u32) -> Option<String> {
        let slot = class.slot()?;
        let cache_key = (slot as u8, value);
        if let Some(hit) = self.cache.get(&cache_key) {
            return hit.clone();
        }

        let resolved = match &self.sources[slot] {
            Some(source) => source.lookup(value),
            None if class == SymClass::Protocol => u8::try_from(value)
                .ok()
                .and_then(protocol_name)
                .map(str::to_string),
            None => None,
        };
        self.cache.put(cache_key, resolved.clone());
        resolved
    }
}
