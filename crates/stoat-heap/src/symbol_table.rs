//! Symbol interning
//!
//! Symbols are unique per heap: interning the same text twice yields the
//! same block, so symbol equality is position equality. The table is a
//! content-addressed index kept outside the byte region; its entries act
//! as collection roots, so interned symbols survive a GC and the table
//! is rewritten to the destination positions. Adopting a serialized
//! image rebuilds the table by scanning the image's Symbol blocks.

use std::hash::{Hash, Hasher};

use rustc_hash::{FxHashMap, FxHasher};

use crate::heap::Heap;
use crate::val::{HeapPos, Type};

/// Content-addressed index of a heap's Symbol blocks.
#[derive(Default)]
pub(crate) struct SymbolTable {
    /// Hash buckets; same-hash symbols share a bucket.
    buckets: FxHashMap<u64, Vec<HeapPos>>,
    len: usize,
}

impl SymbolTable {
    pub(crate) fn hash_bytes(bytes: &[u8]) -> u64 {
        let mut hasher = FxHasher::default();
        bytes.hash(&mut hasher);
        hasher.finish()
    }

    pub(crate) fn insert(&mut self, hash: u64, pos: HeapPos) {
        self.buckets.entry(hash).or_default().push(pos);
        self.len += 1;
    }

    pub(crate) fn lookup(&self, hash: u64) -> &[HeapPos] {
        self.buckets.get(&hash).map_or(&[], Vec::as_slice)
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn clear(&mut self) {
        self.buckets.clear();
        self.len = 0;
    }

    /// Applies `f` to every entry; the collector uses this to forward
    /// the table to destination positions.
    pub(crate) fn rewrite(&mut self, mut f: impl FnMut(HeapPos) -> HeapPos) {
        for bucket in self.buckets.values_mut() {
            for pos in bucket.iter_mut() {
                *pos = f(*pos);
            }
        }
    }

    pub(crate) fn positions(&self) -> impl Iterator<Item = HeapPos> + '_ {
        self.buckets.values().flatten().copied()
    }
}

impl Heap {
    /// Returns the existing symbol with this text, or allocates one.
    /// `None` means the allocation failed.
    pub fn intern(&mut self, name: &str) -> Option<HeapPos> {
        let hash = SymbolTable::hash_bytes(name.as_bytes());
        if let Some(pos) = self.find_symbol_hashed(hash, name) {
            return Some(pos);
        }
        // The allocation may run a collection through the failure
        // handler; the content hash stays valid either way.
        let pos = self.alloc_block(name.len() as u32, Type::Symbol)?;
        self.data_mut(pos).copy_from_slice(name.as_bytes());
        self.symbols.insert(hash, pos);
        Some(pos)
    }

    /// Returns the existing symbol with this text, if any.
    pub fn find_symbol(&self, name: &str) -> Option<HeapPos> {
        self.find_symbol_hashed(SymbolTable::hash_bytes(name.as_bytes()), name)
    }

    fn find_symbol_hashed(&self, hash: u64, name: &str) -> Option<HeapPos> {
        self.symbols
            .lookup(hash)
            .iter()
            .copied()
            .find(|&p| self.data(p) == name.as_bytes())
    }

    /// Number of interned symbols.
    pub fn symbol_count(&self) -> usize {
        self.symbols.len()
    }

    /// Calls `f` once per interned symbol; stops early on false.
    pub fn visit_symbols<F: FnMut(HeapPos) -> bool>(&self, mut f: F) {
        for pos in self.symbols.positions() {
            if !f(pos) {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::val::Value;

    #[test]
    fn interning_is_idempotent() {
        let mut heap = Heap::new(4096);
        let a = heap.intern("point").unwrap();
        let b = heap.intern("point").unwrap();
        assert_eq!(a, b);
        assert_eq!(heap.symbol_count(), 1);
        assert_eq!(heap.type_of(Value::Object(a)), Type::Symbol);
        assert_eq!(heap.get_string(a), "point");
    }

    #[test]
    fn distinct_text_distinct_symbols() {
        let mut heap = Heap::new(4096);
        let a = heap.intern("x").unwrap();
        let b = heap.intern("y").unwrap();
        assert_ne!(a, b);
        assert_eq!(heap.symbol_count(), 2);
        assert_eq!(heap.find_symbol("x"), Some(a));
        assert_eq!(heap.find_symbol("z"), None);
    }

    #[test]
    fn symbols_differ_from_equal_strings() {
        let mut heap = Heap::new(4096);
        let sym = heap.intern("name").unwrap();
        let s = heap.alloc_string("name").unwrap();
        assert_ne!(sym, s);
        assert_eq!(heap.type_of(Value::Object(s)), Type::String);
    }
}
