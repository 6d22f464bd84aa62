//! Copying garbage collector
//!
//! Cheney-style two-space collection: every block reachable from the
//! source heap's root (plus the symbol table and the registered root
//! cells) is copied into a destination heap, a forwarding word is left
//! in the source block, and references are rewritten as the worklist
//! drains. On completion the two heaps exchange byte regions, so the
//! caller's heap stays the live one and the destination holds the
//! exhausted old region.
//!
//! The scan runs as an explicit worklist of `(dst, src)` block pairs
//! rather than a raw pointer chase: a freshly copied payload still
//! encodes its values relative to the *source* slots, so each slot is
//! decoded against its source position and written back against its
//! destination position in one step.
//!
//! While a collection runs the mutator must not touch either heap;
//! afterwards, any `Value::Object` that was not held in a registered
//! root is stale.

use std::collections::VecDeque;

use tracing::debug;

use crate::block;
use crate::heap::{Heap, HEADER_SIZE};
use crate::val::{self, HeapPos, Type, Value};

/// Counters reported by a collection.
#[derive(Debug, Default, Clone)]
pub struct GcStats {
    /// Live blocks copied to the destination.
    pub blocks_copied: usize,
    /// Bytes copied, block spans included.
    pub bytes_copied: usize,
    /// Bytes reclaimed relative to the pre-collection `used`.
    pub reclaimed: usize,
}

/// Collects `heap` into a temporary destination of equal capacity.
pub fn collect(heap: &mut Heap) -> GcStats {
    let mut scratch = Heap::new(heap.capacity());
    collect_into(heap, &mut scratch)
}

/// Collects `from` into the caller-supplied `to`, which is reset first.
///
/// On return `from` holds the compacted live data and `to` holds the
/// old, now-empty region. Panics if `to` cannot hold the live set; the
/// equal-capacity temporary used by [`collect`] never can't.
pub fn collect_into(from: &mut Heap, to: &mut Heap) -> GcStats {
    #[cfg(debug_assertions)]
    assert_quiescent(from);

    to.reset();
    let used_before = from.used();
    let mut gc = Gc {
        stats: GcStats::default(),
        pending: VecDeque::new(),
    };

    // Roots: the heap root, every interned symbol, every registered cell.
    let new_root = gc.move_value(from, to, from.root());
    to.set_root(new_root);

    let mut symbols = std::mem::take(&mut from.symbols);
    symbols.rewrite(|p| gc.move_block(from, to, p));
    from.symbols = symbols;

    let mut roots = std::mem::take(&mut from.roots);
    for cell in roots.iter_mut().flatten() {
        *cell = gc.move_value(from, to, *cell);
    }
    from.roots = roots;

    // Drain the scan worklist; moving children appends further entries.
    while let Some((dst, src)) = gc.pending.pop_front() {
        let (size, ty, hdr) = block::read_header(to.bytes(), dst);
        for i in 0..size / 4 {
            let src_slot = src + hdr + 4 * i;
            let dst_slot = dst + hdr + 4 * i;
            // The copied slot still encodes relative to its source
            // position; inline encodings pass through untouched.
            let raw = to.read_u32(dst_slot);
            if let Value::Object(p) = val::decode(raw, src_slot) {
                let moved = gc.move_block(from, to, p);
                to.store_val(dst_slot, Value::Object(moved));
            }
        }
        if ty == Type::Dict {
            resort_dict(to, dst + hdr, size / 8);
        }
    }

    from.reset_bytes();
    from.swap_with(to);

    let mut stats = gc.stats;
    stats.reclaimed = used_before - from.used();
    debug!(
        blocks = stats.blocks_copied,
        bytes = stats.bytes_copied,
        reclaimed = stats.reclaimed,
        "collection complete"
    );
    stats
}

struct Gc {
    stats: GcStats,
    /// Copied-but-unscanned blocks as `(dst, src)` position pairs.
    pending: VecDeque<(u32, u32)>,
}

impl Gc {
    fn move_value(&mut self, from: &mut Heap, to: &mut Heap, v: Value) -> Value {
        match v {
            Value::Object(p) => Value::Object(self.move_block(from, to, p)),
            inline => inline,
        }
    }

    /// Moves one block, reusing the forwarding address when it already
    /// moved; this is what preserves reference identity across the GC.
    fn move_block(&mut self, from: &mut Heap, to: &mut Heap, src: HeapPos) -> HeapPos {
        if let Some(dst) = block::forwarding(from.bytes(), src.0) {
            return HeapPos(dst);
        }
        let (size, ty, _) = block::read_header(from.bytes(), src.0);
        let span = block::span_for(size);
        let dst = to
            .bump(span)
            .unwrap_or_else(|| panic!("destination heap too small for live block at {:#x}", src.0));
        let (s, d) = (src.0 as usize, dst as usize);
        let copied: &[u8] = &from.bytes()[s..s + span as usize];
        to.bytes_mut()[d..d + span as usize].copy_from_slice(copied);
        block::set_forwarding(from.bytes_mut(), src.0, dst);
        if ty.contains_vals() && size > 0 {
            self.pending.push_back((dst, src.0));
        }
        self.stats.blocks_copied += 1;
        self.stats.bytes_copied += span as usize;
        HeapPos(dst)
    }
}

/// Dict entries sort by descending key position; positions changed, so
/// every dict re-sorts once its slots hold destination values.
fn resort_dict(to: &mut Heap, payload: u32, capacity: u32) {
    let mut entries: Vec<(Value, Value)> = (0..capacity)
        .map(|i| {
            (
                to.load_val(payload + 8 * i),
                to.load_val(payload + 8 * i + 4),
            )
        })
        .collect();
    entries.sort_by_key(|(k, _)| {
        std::cmp::Reverse(match k {
            Value::Object(p) => p.0,
            _ => 0,
        })
    });
    for (i, (k, v)) in entries.into_iter().enumerate() {
        to.store_val(payload + 8 * i as u32, k);
        to.store_val(payload + 8 * i as u32 + 4, v);
    }
}

/// Every forwarding slot must be clear outside a collection.
#[cfg(debug_assertions)]
fn assert_quiescent(heap: &Heap) {
    let mut pos = HEADER_SIZE;
    while pos < heap.used() as u32 {
        assert!(
            !block::is_forwarded(heap.bytes(), pos),
            "block at {pos:#x} carries a forwarding address outside a collection"
        );
        pos = block::next_pos(heap.bytes(), pos);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_heap_collects_to_empty() {
        let mut heap = Heap::new(4096);
        let stats = collect(&mut heap);
        assert_eq!(heap.used(), HEADER_SIZE as usize);
        assert_eq!(stats.blocks_copied, 0);
        assert_eq!(heap.root(), Value::Null);
    }

    #[test]
    fn unreachable_garbage_is_dropped() {
        let mut heap = Heap::new(4096);
        for _ in 0..10 {
            heap.alloc_string("garbage").unwrap();
        }
        let before = heap.used();
        let stats = collect(&mut heap);
        // Nothing rooted, nothing interned: only the header remains.
        assert_eq!(heap.used(), HEADER_SIZE as usize);
        assert_eq!(stats.reclaimed, before - heap.used());
        assert!(heap.valid());
    }

    #[test]
    fn inline_root_survives_unchanged() {
        let mut heap = Heap::new(4096);
        heap.set_root(Value::Int(-77));
        collect(&mut heap);
        assert_eq!(heap.root(), Value::Int(-77));
    }

    #[test]
    fn forwarding_is_clear_after_collection() {
        let mut heap = Heap::new(4096);
        let s = heap.alloc_string("kept").unwrap();
        heap.set_root(Value::Object(s));
        collect(&mut heap);
        // A second collection's quiescence check would catch leftovers.
        collect(&mut heap);
        assert_eq!(heap.get_string(heap.root_object().unwrap()), "kept");
    }
}
