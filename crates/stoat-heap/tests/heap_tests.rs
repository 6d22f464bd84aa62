//! Heap container tests
//!
//! Exercises construction, bump allocation, block enumeration, resize,
//! reset, and the serialize/adopt round trip against the public API.

use proptest::prelude::*;
use stoat_heap::{Heap, HeapError, Type, Value, HEADER_SIZE};

#[test]
fn empty_heap() {
    let heap = Heap::new(10_000);
    assert!(heap.valid());
    assert_eq!(heap.capacity(), 10_000);
    assert_eq!(heap.used(), HEADER_SIZE as usize);
    assert_eq!(heap.remaining(), 10_000 - HEADER_SIZE as usize);
    assert_eq!(heap.root(), Value::Null);
    assert_eq!(heap.root_object(), None);

    assert!(!Heap::thread_current_set());
    {
        let _guard = heap.enter();
        assert!(heap.is_current());
    }
    assert!(!Heap::thread_current_set());

    heap.visit(|_| panic!("visitor should not be called"));
}

#[test]
fn alloc_fills_heap_exactly() {
    let mut heap = Heap::new(10_000);

    let first = heap.alloc(123).unwrap();
    assert!(heap.contains(first));
    assert_eq!(heap.data(first).len(), 123);

    // 2-byte header plus a padding byte for the odd payload.
    assert_eq!(heap.used(), HEADER_SIZE as usize + 126);

    // A second blob sized to the remaining capacity (minus its 4-byte
    // large-form header) fills the heap exactly.
    let rest = heap.remaining() as u32 - 4;
    let second = heap.alloc(rest).unwrap();
    assert!(heap.contains(second));
    assert_eq!(heap.used(), 10_000);
    assert_eq!(heap.remaining(), 0);

    let mut sizes = Vec::new();
    heap.visit_all(|b| {
        assert_eq!(b.block_type(), Type::Blob);
        sizes.push(b.data_size());
        true
    });
    assert_eq!(sizes, vec![123, rest]);

    assert_eq!(heap.alloc(1), None);
}

#[test]
fn many_sizes_keep_their_payloads() {
    let mut heap = Heap::new(40_000);
    let count = 100u32;

    let mut blobs = Vec::new();
    for i in 0..count {
        let size = 10 + i;
        let pos = heap.alloc(size).unwrap();
        heap.data_mut(pos).fill(i as u8);
        blobs.push((pos, size, i as u8));
    }

    for &(pos, size, pattern) in &blobs {
        let data = heap.data(pos);
        assert_eq!(data.len(), size as usize);
        assert!(data.iter().all(|&b| b == pattern), "pattern {pattern} damaged");
    }

    let mut i = 0;
    heap.visit_all(|b| {
        assert_eq!(b.pos(), blobs[i].0);
        assert_eq!(b.data_size(), blobs[i].1);
        i += 1;
        true
    });
    assert_eq!(i as u32, count);
}

#[test]
fn visit_all_stops_early() {
    let mut heap = Heap::new(4096);
    for _ in 0..5 {
        heap.alloc(16).unwrap();
    }
    let mut seen = 0;
    heap.visit_all(|_| {
        seen += 1;
        seen < 2
    });
    assert_eq!(seen, 2);
}

#[test]
fn visit_is_subset_of_visit_all() {
    let mut heap = Heap::new(8192);
    let live = heap.alloc_string("live").unwrap();
    heap.alloc_string("garbage").unwrap();
    let arr = heap.alloc_array(&[Value::Object(live)]).unwrap();
    heap.set_root(Value::Object(arr));

    let mut reachable = Vec::new();
    heap.visit(|b| {
        reachable.push(b.pos());
        true
    });
    let mut all = Vec::new();
    heap.visit_all(|b| {
        all.push(b.pos());
        true
    });

    assert_eq!(reachable.len(), 2, "array and one string");
    assert_eq!(all.len(), 3);
    assert!(reachable.iter().all(|p| all.contains(p)));
}

#[test]
fn resize_moves_only_the_end() {
    let mut heap = Heap::new(4096);
    let blob = heap.alloc(100).unwrap();
    heap.data_mut(blob).fill(0xAB);

    assert!(!heap.resize(heap.used() - 1));
    assert!(!heap.resize(8192), "owned storage cannot grow");
    assert!(heap.resize(heap.used()));
    assert_eq!(heap.remaining(), 0);
    assert!(heap.data(blob).iter().all(|&b| b == 0xAB));
}

#[test]
fn serialize_and_adopt_round_trip() {
    let mut heap = Heap::new(16_384);
    let name = heap.intern("name").unwrap();
    let title = heap.alloc_string("stoat").unwrap();
    let dict = heap.alloc_dict(4).unwrap();
    assert!(heap.dict_set(dict, name, Value::Object(title)));
    let arr = heap
        .alloc_array(&[Value::Object(dict), Value::Int(99), Value::Bool(true), Value::Nullish])
        .unwrap();
    heap.set_root(Value::Object(arr));

    let image = heap.as_bytes().to_vec();
    let used = heap.used();

    let adopted = Heap::adopt(image.into_boxed_slice(), used).unwrap();
    assert!(adopted.valid());
    assert_eq!(adopted.used(), used);
    assert_eq!(adopted.symbol_count(), 1);

    let root = adopted.root_object().unwrap();
    assert_eq!(adopted.array_len(root), 4);
    assert_eq!(adopted.array_get(root, 1), Value::Int(99));
    assert_eq!(adopted.array_get(root, 2), Value::Bool(true));
    assert_eq!(adopted.array_get(root, 3), Value::Nullish);

    let dict2 = adopted.array_get(root, 0).as_object().unwrap();
    let name2 = adopted.find_symbol("name").unwrap();
    let title2 = adopted.dict_get(dict2, name2).unwrap().as_object().unwrap();
    assert_eq!(adopted.get_string(title2), "stoat");

    // Identical image, identical logical graph: serialize again.
    assert_eq!(adopted.as_bytes(), heap.as_bytes());
}

#[test]
fn adopt_rejects_truncated_image() {
    let mut heap = Heap::new(4096);
    heap.alloc(100).unwrap();
    let image = heap.as_bytes().to_vec();
    // Claim a used size that cuts the blob in half.
    let err = Heap::adopt(image.into_boxed_slice(), heap.used() - 10).unwrap_err();
    assert!(matches!(err, HeapError::CorruptBlock { .. }));
}

#[test]
fn alloc_failure_handler_can_grow() {
    fn grow_handler(heap: &mut Heap, needed: u32) -> bool {
        // Growing an owned heap is refused, so this handler can only
        // decline; the allocation must then fail cleanly.
        let _ = needed;
        heap.resize(heap.capacity() * 2)
    }

    let mut heap = Heap::new(256);
    heap.set_alloc_failure_handler(Some(grow_handler));
    assert_eq!(heap.alloc(1000), None);
    assert!(heap.valid());
}

proptest! {
    #[test]
    fn blob_payloads_round_trip(payload in prop::collection::vec(any::<u8>(), 0..512)) {
        let mut heap = Heap::new(8192);
        let pos = heap.alloc_blob(&payload).unwrap();
        prop_assert_eq!(heap.blob_bytes(pos), &payload[..]);
    }

    #[test]
    fn int_values_round_trip(i in stoat_heap::MIN_INT..=stoat_heap::MAX_INT) {
        let mut heap = Heap::new(4096);
        let arr = heap.alloc_array(&[Value::Int(i)]).unwrap();
        prop_assert_eq!(heap.array_get(arr, 0), Value::Int(i));
    }
}
