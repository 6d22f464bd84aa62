//! Typed object constructors and accessors
//!
//! Every constructor returns `None` when allocation fails after the
//! failure handler declines. Constructors taking `Value` arguments share
//! the allocation hazard documented on [`Heap::alloc`]: if the failure
//! handler runs a collection, unrooted object values passed in are stale.
//!
//! Accessors assert the block has the expected type; passing a position
//! of the wrong type is a programming error.

use crate::block;
use crate::heap::Heap;
use crate::val::{HeapPos, Type, Value};

impl Heap {
    /// Asserts the block type and returns `(payload_pos, data_size)`.
    fn typed_payload(&self, pos: HeapPos, want: Type) -> (u32, u32) {
        assert!(self.contains(pos), "invalid block position {:#x}", pos.0);
        let (size, ty, hdr) = block::read_header(self.bytes(), pos.0);
        assert!(ty == want, "expected {want:?} block at {:#x}, found {ty:?}", pos.0);
        (pos.0 + hdr, size)
    }

    // -----------------------------------------------------------------------
    // Float
    // -----------------------------------------------------------------------

    /// Allocates a double-width float.
    pub fn alloc_float(&mut self, v: f64) -> Option<HeapPos> {
        let pos = self.alloc_block(8, Type::Float)?;
        self.data_mut(pos).copy_from_slice(&v.to_le_bytes());
        Some(pos)
    }

    /// Allocates a single-width float.
    pub fn alloc_float32(&mut self, v: f32) -> Option<HeapPos> {
        let pos = self.alloc_block(4, Type::Float)?;
        self.data_mut(pos).copy_from_slice(&v.to_le_bytes());
        Some(pos)
    }

    /// Reads a Float block, widening the single form.
    pub fn float_value(&self, pos: HeapPos) -> f64 {
        let (payload, size) = self.typed_payload(pos, Type::Float);
        let at = payload as usize;
        match size {
            4 => f32::from_le_bytes(self.bytes()[at..at + 4].try_into().unwrap()) as f64,
            8 => f64::from_le_bytes(self.bytes()[at..at + 8].try_into().unwrap()),
            _ => unreachable!("float payload is 4 or 8 bytes"),
        }
    }

    // -----------------------------------------------------------------------
    // BigInt
    // -----------------------------------------------------------------------

    /// Allocates a BigInt holding `v` in minimal two's-complement bytes.
    pub fn alloc_bigint(&mut self, v: i64) -> Option<HeapPos> {
        let bytes = v.to_le_bytes();
        let mut len = 8;
        while len > 1 {
            let (last, next) = (bytes[len - 1], bytes[len - 2]);
            let redundant = (last == 0x00 && next & 0x80 == 0) || (last == 0xFF && next & 0x80 != 0);
            if !redundant {
                break;
            }
            len -= 1;
        }
        self.alloc_bigint_bytes(&bytes[..len])
    }

    /// Allocates a BigInt from raw little-endian two's-complement bytes.
    pub fn alloc_bigint_bytes(&mut self, bytes: &[u8]) -> Option<HeapPos> {
        assert!(!bytes.is_empty(), "bigint needs at least one byte");
        let pos = self.alloc_block(bytes.len() as u32, Type::BigInt)?;
        self.data_mut(pos).copy_from_slice(bytes);
        Some(pos)
    }

    /// Reads a BigInt block as an i64, sign-extending. Values wider than
    /// eight bytes are truncated to their low 64 bits.
    pub fn bigint_value(&self, pos: HeapPos) -> i64 {
        let bytes = self.bigint_bytes(pos);
        let fill = if bytes[bytes.len() - 1] & 0x80 != 0 { 0xFF } else { 0x00 };
        let mut buf = [fill; 8];
        let n = bytes.len().min(8);
        buf[..n].copy_from_slice(&bytes[..n]);
        i64::from_le_bytes(buf)
    }

    /// The raw two's-complement bytes of a BigInt block.
    pub fn bigint_bytes(&self, pos: HeapPos) -> &[u8] {
        self.typed_payload(pos, Type::BigInt);
        self.data(pos)
    }

    // -----------------------------------------------------------------------
    // String / Blob
    // -----------------------------------------------------------------------

    /// Allocates a String block holding `s` (UTF-8, no terminator).
    pub fn alloc_string(&mut self, s: &str) -> Option<HeapPos> {
        let pos = self.alloc_block(s.len() as u32, Type::String)?;
        self.data_mut(pos).copy_from_slice(s.as_bytes());
        Some(pos)
    }

    /// Reads a String or Symbol block's text.
    pub fn get_string(&self, pos: HeapPos) -> &str {
        assert!(self.contains(pos), "invalid block position {:#x}", pos.0);
        let (_, ty, _) = block::read_header(self.bytes(), pos.0);
        assert!(
            matches!(ty, Type::String | Type::Symbol),
            "expected text block at {:#x}, found {ty:?}",
            pos.0
        );
        std::str::from_utf8(self.data(pos)).expect("heap text is UTF-8")
    }

    /// Allocates a Blob holding a copy of `bytes`.
    pub fn alloc_blob(&mut self, bytes: &[u8]) -> Option<HeapPos> {
        let pos = self.alloc(bytes.len() as u32)?;
        self.data_mut(pos).copy_from_slice(bytes);
        Some(pos)
    }

    /// Reads a Blob block's bytes.
    pub fn blob_bytes(&self, pos: HeapPos) -> &[u8] {
        self.typed_payload(pos, Type::Blob);
        self.data(pos)
    }

    // -----------------------------------------------------------------------
    // Array
    // -----------------------------------------------------------------------

    /// Allocates a fixed-length array of nulls.
    pub fn alloc_array_of_nulls(&mut self, count: u32) -> Option<HeapPos> {
        self.alloc_block(count * 4, Type::Array)
    }

    /// Allocates a fixed-length array holding `vals`.
    pub fn alloc_array(&mut self, vals: &[Value]) -> Option<HeapPos> {
        let pos = self.alloc_block(vals.len() as u32 * 4, Type::Array)?;
        let (payload, _) = self.typed_payload(pos, Type::Array);
        for (i, v) in vals.iter().enumerate() {
            self.store_val(payload + 4 * i as u32, *v);
        }
        Some(pos)
    }

    /// Number of slots in an Array.
    pub fn array_len(&self, pos: HeapPos) -> u32 {
        let (_, size) = self.typed_payload(pos, Type::Array);
        size / 4
    }

    /// Reads array slot `i`.
    pub fn array_get(&self, pos: HeapPos, i: u32) -> Value {
        let (payload, size) = self.typed_payload(pos, Type::Array);
        assert!(i < size / 4, "array index {i} out of bounds");
        self.load_val(payload + 4 * i)
    }

    /// Writes array slot `i`.
    pub fn array_set(&mut self, pos: HeapPos, i: u32, v: Value) {
        let (payload, size) = self.typed_payload(pos, Type::Array);
        assert!(i < size / 4, "array index {i} out of bounds");
        self.store_val(payload + 4 * i, v);
    }

    // -----------------------------------------------------------------------
    // Vector
    // -----------------------------------------------------------------------

    /// Allocates an empty Vector able to hold `capacity` values.
    /// Slot 0 of the payload stores the current size.
    pub fn alloc_vector(&mut self, capacity: u32) -> Option<HeapPos> {
        let pos = self.alloc_block((capacity + 1) * 4, Type::Vector)?;
        let (payload, _) = self.typed_payload(pos, Type::Vector);
        self.store_val(payload, Value::Int(0));
        Some(pos)
    }

    /// Maximum number of values the Vector can hold.
    pub fn vector_capacity(&self, pos: HeapPos) -> u32 {
        let (_, size) = self.typed_payload(pos, Type::Vector);
        size / 4 - 1
    }

    /// Current number of values in the Vector.
    pub fn vector_len(&self, pos: HeapPos) -> u32 {
        let (payload, _) = self.typed_payload(pos, Type::Vector);
        self.load_val(payload).as_int().expect("vector size slot") as u32
    }

    /// Reads element `i`.
    pub fn vector_get(&self, pos: HeapPos, i: u32) -> Value {
        let (payload, _) = self.typed_payload(pos, Type::Vector);
        assert!(i < self.vector_len(pos), "vector index {i} out of bounds");
        self.load_val(payload + 4 * (1 + i))
    }

    /// Writes element `i`.
    pub fn vector_set(&mut self, pos: HeapPos, i: u32, v: Value) {
        let (payload, _) = self.typed_payload(pos, Type::Vector);
        assert!(i < self.vector_len(pos), "vector index {i} out of bounds");
        self.store_val(payload + 4 * (1 + i), v);
    }

    /// Appends a value; false when the Vector is full.
    pub fn vector_append(&mut self, pos: HeapPos, v: Value) -> bool {
        let (payload, size) = self.typed_payload(pos, Type::Vector);
        let (len, cap) = (self.vector_len(pos), size / 4 - 1);
        if len >= cap {
            return false;
        }
        self.store_val(payload + 4 * (1 + len), v);
        self.store_val(payload, Value::int(len as i32 + 1));
        true
    }

    /// Inserts a value at `index`, shifting later elements up; false
    /// when the Vector is full. Elements shift one slot at a time so
    /// their self-relative references stay correct.
    pub fn vector_insert(&mut self, pos: HeapPos, index: u32, v: Value) -> bool {
        let (payload, size) = self.typed_payload(pos, Type::Vector);
        let (len, cap) = (self.vector_len(pos), size / 4 - 1);
        assert!(index <= len, "vector insert index {index} out of bounds");
        if len >= cap {
            return false;
        }
        for i in (index..len).rev() {
            let moved = self.load_val(payload + 4 * (1 + i));
            self.store_val(payload + 4 * (2 + i), moved);
        }
        self.store_val(payload + 4 * (1 + index), v);
        self.store_val(payload, Value::int(len as i32 + 1));
        true
    }

    // -----------------------------------------------------------------------
    // Dict
    // -----------------------------------------------------------------------
    //
    // Entries are (key, value) val pairs sorted by descending key block
    // position, with null-keyed free entries packed at the tail. Null
    // sorts last because the reserved position 0 is below every real
    // block position. The order is re-established after every
    // collection, when key positions change.

    /// Allocates an empty Dict able to hold `capacity` entries.
    pub fn alloc_dict(&mut self, capacity: u32) -> Option<HeapPos> {
        self.alloc_block(capacity * 8, Type::Dict)
    }

    /// Maximum number of entries.
    pub fn dict_capacity(&self, pos: HeapPos) -> u32 {
        let (_, size) = self.typed_payload(pos, Type::Dict);
        size / 8
    }

    fn dict_key_pos(&self, payload: u32, i: u32) -> u32 {
        match self.load_val(payload + 8 * i) {
            Value::Object(p) => p.0,
            _ => 0,
        }
    }

    /// Binary search for `target` among the descending key positions:
    /// returns the entry index and whether it matched.
    fn dict_search(&self, payload: u32, cap: u32, target: u32) -> (u32, bool) {
        let (mut lo, mut hi) = (0, cap);
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.dict_key_pos(payload, mid) > target {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        (lo, lo < cap && self.dict_key_pos(payload, lo) == target)
    }

    /// Number of live entries.
    pub fn dict_count(&self, pos: HeapPos) -> u32 {
        let (payload, size) = self.typed_payload(pos, Type::Dict);
        let (mut lo, mut hi) = (0, size / 8);
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.dict_key_pos(payload, mid) != 0 {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// True when no free entry remains.
    pub fn dict_is_full(&self, pos: HeapPos) -> bool {
        let (payload, size) = self.typed_payload(pos, Type::Dict);
        let cap = size / 8;
        cap == 0 || self.dict_key_pos(payload, cap - 1) != 0
    }

    /// Looks up a Symbol key.
    pub fn dict_get(&self, pos: HeapPos, key: HeapPos) -> Option<Value> {
        let (payload, size) = self.typed_payload(pos, Type::Dict);
        let (i, found) = self.dict_search(payload, size / 8, key.0);
        found.then(|| self.load_val(payload + 8 * i + 4))
    }

    /// True when the key is present.
    pub fn dict_contains(&self, pos: HeapPos, key: HeapPos) -> bool {
        self.dict_get(pos, key).is_some()
    }

    /// The `i`-th live entry in sorted order, as `(key, value)`.
    pub fn dict_entry(&self, pos: HeapPos, i: u32) -> (Value, Value) {
        let (payload, _) = self.typed_payload(pos, Type::Dict);
        assert!(i < self.dict_count(pos), "dict entry {i} out of bounds");
        (
            self.load_val(payload + 8 * i),
            self.load_val(payload + 8 * i + 4),
        )
    }

    fn dict_write(&mut self, pos: HeapPos, key: HeapPos, value: Value, insert_only: bool) -> bool {
        assert!(
            self.type_of(Value::Object(key)) == Type::Symbol,
            "dict keys must be symbols"
        );
        let (payload, size) = self.typed_payload(pos, Type::Dict);
        let cap = size / 8;
        let (i, found) = self.dict_search(payload, cap, key.0);
        if found {
            if insert_only {
                return false;
            }
            self.store_val(payload + 8 * i + 4, value);
            return true;
        }
        if i >= cap || self.dict_key_pos(payload, cap - 1) != 0 {
            return false; // full
        }
        // Shift [i..count) up one entry, slot by slot.
        let count = self.dict_count(pos);
        for j in (i..count).rev() {
            let k = self.load_val(payload + 8 * j);
            let v = self.load_val(payload + 8 * j + 4);
            self.store_val(payload + 8 * (j + 1), k);
            self.store_val(payload + 8 * (j + 1) + 4, v);
        }
        self.store_val(payload + 8 * i, Value::Object(key));
        self.store_val(payload + 8 * i + 4, value);
        true
    }

    /// Inserts or updates an entry; false when the Dict is full.
    pub fn dict_set(&mut self, pos: HeapPos, key: HeapPos, value: Value) -> bool {
        self.dict_write(pos, key, value, false)
    }

    /// Inserts an entry; false on duplicate key or full Dict.
    pub fn dict_insert(&mut self, pos: HeapPos, key: HeapPos, value: Value) -> bool {
        self.dict_write(pos, key, value, true)
    }

    /// Updates an existing entry; false when the key is absent.
    pub fn dict_replace(&mut self, pos: HeapPos, key: HeapPos, value: Value) -> bool {
        let (payload, size) = self.typed_payload(pos, Type::Dict);
        let (i, found) = self.dict_search(payload, size / 8, key.0);
        if found {
            self.store_val(payload + 8 * i + 4, value);
        }
        found
    }

    /// Removes an entry with a compacting shift; false when absent.
    pub fn dict_remove(&mut self, pos: HeapPos, key: HeapPos) -> bool {
        let (payload, size) = self.typed_payload(pos, Type::Dict);
        let cap = size / 8;
        let (i, found) = self.dict_search(payload, cap, key.0);
        if !found {
            return false;
        }
        let count = self.dict_count(pos);
        for j in i + 1..count {
            let k = self.load_val(payload + 8 * j);
            let v = self.load_val(payload + 8 * j + 4);
            self.store_val(payload + 8 * (j - 1), k);
            self.store_val(payload + 8 * (j - 1) + 4, v);
        }
        self.store_val(payload + 8 * (count - 1), Value::Null);
        self.store_val(payload + 8 * (count - 1) + 4, Value::Null);
        true
    }

    // -----------------------------------------------------------------------
    // Numeric coercion
    // -----------------------------------------------------------------------

    /// Coerces Bool, Int, BigInt and Float values to f64; anything else
    /// yields zero.
    pub fn as_f64(&self, v: Value) -> f64 {
        match v {
            Value::Bool(b) => b as i32 as f64,
            Value::Int(i) => i as f64,
            Value::Object(p) => match self.type_of(v) {
                Type::Float => self.float_value(p),
                Type::BigInt => self.bigint_value(p) as f64,
                _ => 0.0,
            },
            _ => 0.0,
        }
    }

    /// Coerces Bool, Int, BigInt and Float values to i64; anything else
    /// yields zero. Floats truncate toward zero.
    pub fn as_i64(&self, v: Value) -> i64 {
        match v {
            Value::Bool(b) => b as i64,
            Value::Int(i) => i as i64,
            Value::Object(p) => match self.type_of(v) {
                Type::Float => self.float_value(p) as i64,
                Type::BigInt => self.bigint_value(p),
                _ => 0,
            },
            _ => 0,
        }
    }
}
