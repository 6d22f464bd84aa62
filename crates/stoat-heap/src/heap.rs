//! The heap container
//!
//! A `Heap` owns one contiguous byte region holding a fixed header, a
//! bump allocator, and a graph of blocks reachable from a single root
//! value. All references inside the region are 32-bit self-relative
//! offsets, so the serialized image (`as_bytes`) can be memory-mapped,
//! shipped over a wire, or adopted back with [`Heap::adopt`].
//!
//! ## Layout
//!
//! ```text
//! offset 0:  u32 magic = 0xD217904A
//! offset 4:  u32 root value (self-relative, measured from offset 4)
//! offset 8:  packed blocks up to `used`
//! ```
//!
//! ## Moving hazard
//!
//! Allocation may invoke the registered alloc-failure handler, which
//! typically runs the copying collector. Any `Value::Object` held across
//! a failing or handler-visiting allocation is stale unless it lives in
//! a registered root.

use std::cell::Cell;
use std::collections::VecDeque;

use rustc_hash::FxHashSet;
use tracing::{debug, trace};

use crate::block::{self, Block};
use crate::error::{HeapError, HeapResult};
use crate::symbol_table::SymbolTable;
use crate::val::{self, HeapPos, Type, Value};

/// Magic number identifying a serialized heap image.
pub const MAGIC: u32 = 0xD217_904A;

/// Size of the fixed heap header in bytes.
pub const HEADER_SIZE: u32 = 8;

/// Byte offset of the root value inside the header.
const ROOT_POS: u32 = 4;

/// Largest capacity a heap may have.
pub const MAX_CAPACITY: usize = 1 << 31;

/// Callback invoked when the heap cannot satisfy an allocation.
///
/// Receives the heap and the number of bytes needed. Returning `true`
/// means "retry the allocation" (the handler grew the heap or ran a
/// collection); returning `false` fails the allocation.
pub type AllocFailureHandler = fn(&mut Heap, u32) -> bool;

// Identity of the heap currently entered on this thread. Compared, never
// dereferenced; the `CurrentHeap` guard borrows the heap for the
// duration, so the pointer cannot dangle while set.
thread_local! {
    static CURRENT: Cell<*const Heap> = const { Cell::new(std::ptr::null()) };
}

enum Storage {
    Owned(Box<[u8]>),
    Raw { base: *mut u8, len: usize },
}

impl Storage {
    fn len(&self) -> usize {
        match self {
            Storage::Owned(b) => b.len(),
            Storage::Raw { len, .. } => *len,
        }
    }

    fn bytes(&self) -> &[u8] {
        match self {
            Storage::Owned(b) => b,
            // SAFETY: the `from_raw_parts`/`adopt_raw` contract guarantees
            // `base` is valid for reads and writes of `len` bytes with
            // exclusive access for the heap's lifetime.
            Storage::Raw { base, len } => unsafe { std::slice::from_raw_parts(*base, *len) },
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        match self {
            Storage::Owned(b) => b,
            // SAFETY: same contract as `bytes`.
            Storage::Raw { base, len } => unsafe { std::slice::from_raw_parts_mut(*base, *len) },
        }
    }

    fn is_owned(&self) -> bool {
        matches!(self, Storage::Owned(_))
    }
}

/// Identifier of a registered external root cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RootId(u32);

/// An owning reference to a heap value, valid across collections.
///
/// A handle wraps a registered root cell: the collector rewrites the
/// cell when the referenced block moves. Release it with
/// [`Handle::release`] (or through [`Heap::with_root`], which releases
/// on scope exit) before the heap is dropped.
#[derive(Debug)]
pub struct Handle {
    id: RootId,
}

impl Handle {
    /// The current (collector-maintained) value.
    pub fn get(&self, heap: &Heap) -> Value {
        heap.root_value(self.id)
    }

    /// Replaces the held value.
    pub fn set(&self, heap: &mut Heap, v: Value) {
        heap.update_root(self.id, v);
    }

    /// The referenced block position, if the held value is an object.
    pub fn object(&self, heap: &Heap) -> Option<HeapPos> {
        self.get(heap).as_object()
    }

    /// Unregisters the underlying root cell.
    pub fn release(self, heap: &mut Heap) {
        heap.unregister_root(self.id);
    }
}

/// Scoped current-heap registration; see [`Heap::enter`].
pub struct CurrentHeap<'a> {
    heap: &'a Heap,
    prev: *const Heap,
}

impl Drop for CurrentHeap<'_> {
    fn drop(&mut self) {
        CURRENT.with(|c| {
            assert!(
                std::ptr::eq(c.get(), self.heap),
                "exiting a heap that is not current"
            );
            c.set(self.prev);
        });
    }
}

/// A self-contained object memory: header, bump allocator, and block
/// graph in one relocatable byte region.
pub struct Heap {
    storage: Storage,
    /// Current capacity; `resize` moves this, never the base.
    end: u32,
    /// Bump cursor, equal to the used byte count.
    cur: u32,
    fail_handler: Option<AllocFailureHandler>,
    pub(crate) roots: Vec<Option<Value>>,
    free_roots: Vec<u32>,
    pub(crate) symbols: SymbolTable,
}

// SAFETY: a Heap is single-owner; the raw-storage constructors require
// exclusive access to the region, and the thread-current slot only holds
// a heap while a `CurrentHeap` guard borrows it, which prevents moving
// the heap to another thread mid-registration.
unsafe impl Send for Heap {}

impl Heap {
    // -----------------------------------------------------------------------
    // Construction
    // -----------------------------------------------------------------------

    /// Creates an empty heap with self-allocated storage of `capacity`
    /// bytes.
    pub fn new(capacity: usize) -> Heap {
        assert!(
            (HEADER_SIZE as usize..=MAX_CAPACITY).contains(&capacity),
            "heap capacity out of range: {capacity}"
        );
        let storage = Storage::Owned(vec![0u8; capacity].into_boxed_slice());
        let mut heap = Heap::with_storage(storage, capacity as u32);
        heap.reset_bytes();
        heap
    }

    /// Creates an empty heap over caller-provided memory.
    ///
    /// # Safety
    ///
    /// `base` must be valid for reads and writes of `capacity` bytes,
    /// and the region must not be accessed by anything else for the
    /// heap's lifetime.
    pub unsafe fn from_raw_parts(base: *mut u8, capacity: usize) -> Heap {
        assert!((HEADER_SIZE as usize..=MAX_CAPACITY).contains(&capacity));
        let storage = Storage::Raw {
            base,
            len: capacity,
        };
        let mut heap = Heap::with_storage(storage, capacity as u32);
        heap.reset_bytes();
        heap
    }

    /// Adopts a previously serialized heap image.
    ///
    /// Verifies the magic number and the root position, and rebuilds the
    /// symbol table by scanning the image's Symbol blocks.
    pub fn adopt(storage: Box<[u8]>, used: usize) -> HeapResult<Heap> {
        let capacity = storage.len() as u32;
        let heap = Heap::with_storage(Storage::Owned(storage), capacity);
        heap.validate(used)
    }

    /// Adopts a previously serialized heap image living in
    /// caller-provided memory.
    ///
    /// # Safety
    ///
    /// Same contract as [`Heap::from_raw_parts`].
    pub unsafe fn adopt_raw(base: *mut u8, used: usize, capacity: usize) -> HeapResult<Heap> {
        assert!(capacity <= MAX_CAPACITY);
        let storage = Storage::Raw {
            base,
            len: capacity,
        };
        let heap = Heap::with_storage(storage, capacity as u32);
        heap.validate(used)
    }

    fn with_storage(storage: Storage, end: u32) -> Heap {
        Heap {
            storage,
            end,
            cur: 0,
            fail_handler: None,
            roots: Vec::new(),
            free_roots: Vec::new(),
            symbols: SymbolTable::default(),
        }
    }

    fn validate(mut self, used: usize) -> HeapResult<Heap> {
        if used < HEADER_SIZE as usize || used > self.end as usize {
            return Err(HeapError::BadMagic);
        }
        self.cur = used as u32;
        if self.read_u32(0) != MAGIC {
            return Err(HeapError::BadMagic);
        }
        if let Value::Object(p) = self.root() {
            if p.0 < HEADER_SIZE || p.0 >= self.cur {
                return Err(HeapError::BadRootPosition(p.0));
            }
        }
        // Walk the blocks: verify they tile the used region with no
        // forwarding left behind, and re-intern every Symbol.
        let mut pos = HEADER_SIZE;
        while pos < self.cur {
            if self.cur - pos < 4 || block::is_forwarded(self.bytes(), pos) {
                return Err(HeapError::CorruptBlock { pos });
            }
            let (data_size, ty, _) = block::read_header(self.bytes(), pos);
            let next = pos + block::span_for(data_size);
            if next > self.cur {
                return Err(HeapError::CorruptBlock { pos });
            }
            if ty == Type::Symbol {
                let hash = SymbolTable::hash_bytes(self.data(HeapPos(pos)));
                self.symbols.insert(hash, HeapPos(pos));
            }
            pos = next;
        }
        debug!(
            used = self.cur,
            capacity = self.end,
            symbols = self.symbols.len(),
            "adopted heap image"
        );
        Ok(self)
    }

    // -----------------------------------------------------------------------
    // Attributes
    // -----------------------------------------------------------------------

    /// Current capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.end as usize
    }

    /// Bytes in use, header included.
    #[inline]
    pub fn used(&self) -> usize {
        self.cur as usize
    }

    /// Bytes of capacity left.
    #[inline]
    pub fn remaining(&self) -> usize {
        (self.end - self.cur) as usize
    }

    /// Alias for [`Heap::remaining`].
    #[inline]
    pub fn available(&self) -> usize {
        self.remaining()
    }

    /// True when the header is intact and the root is in range.
    pub fn valid(&self) -> bool {
        self.cur >= HEADER_SIZE
            && self.cur <= self.end
            && self.read_u32(0) == MAGIC
            && match self.root() {
                Value::Object(p) => p.0 >= HEADER_SIZE && p.0 < self.cur,
                _ => true,
            }
    }

    /// True when `pos` lies inside the allocated region.
    #[inline]
    pub fn contains(&self, pos: HeapPos) -> bool {
        pos.0 >= HEADER_SIZE && pos.0 < self.cur
    }

    /// The serializable image: header plus every allocated block.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes()[..self.cur as usize]
    }

    // -----------------------------------------------------------------------
    // Root
    // -----------------------------------------------------------------------

    /// The heap's root value.
    pub fn root(&self) -> Value {
        self.load_val(ROOT_POS)
    }

    /// Sets the heap's root value.
    pub fn set_root(&mut self, v: Value) {
        self.store_val(ROOT_POS, v);
    }

    /// The root as a block position, or `None` when the root is inline.
    pub fn root_object(&self) -> Option<HeapPos> {
        self.root().as_object()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Resets the heap to the empty state: the bump cursor returns to
    /// the header, the root becomes null, the symbol table empties, and
    /// every registered root cell is nulled. All prior positions are
    /// invalid afterwards.
    pub fn reset(&mut self) {
        self.reset_bytes();
        self.symbols.clear();
        for cell in self.roots.iter_mut().flatten() {
            *cell = Value::Null;
        }
    }

    /// Rewinds the byte region only; the collector uses this on the
    /// exhausted source heap, whose root cells and symbol table have
    /// already been rewritten to destination positions.
    pub(crate) fn reset_bytes(&mut self) {
        self.cur = HEADER_SIZE;
        self.write_u32(0, MAGIC);
        self.write_u32(ROOT_POS, 0);
    }

    /// Changes the heap's capacity by moving the end pointer; the base
    /// never moves and no block is invalidated.
    ///
    /// Returns false when shrinking below `used`, or when growing a
    /// self-allocated heap (its backing cannot be extended in place).
    /// Growing a raw-memory heap requires the caller to have made the
    /// additional bytes writable.
    pub fn resize(&mut self, new_size: usize) -> bool {
        if new_size < self.cur as usize || new_size > MAX_CAPACITY {
            return false;
        }
        if new_size > self.end as usize && self.storage.is_owned() {
            return false;
        }
        if let Storage::Raw { len, .. } = &mut self.storage {
            *len = new_size;
        }
        self.end = new_size as u32;
        true
    }

    /// Sets or clears the allocation-failure handler.
    pub fn set_alloc_failure_handler(&mut self, handler: Option<AllocFailureHandler>) {
        self.fail_handler = handler;
    }

    // -----------------------------------------------------------------------
    // Allocation
    // -----------------------------------------------------------------------

    /// Allocates `size` bytes as a Blob block and returns its position,
    /// or `None` once the failure handler declines.
    ///
    /// If the handler runs a collection, every unrooted `Value::Object`
    /// held by the caller is stale afterwards, even when the allocation
    /// succeeds on retry.
    pub fn alloc(&mut self, size: u32) -> Option<HeapPos> {
        self.alloc_block(size, Type::Blob)
    }

    /// Allocates a zero-filled block of the given type and payload size.
    pub(crate) fn alloc_block(&mut self, data_size: u32, ty: Type) -> Option<HeapPos> {
        assert!(data_size <= block::MAX_DATA_SIZE, "block too large");
        let span = block::span_for(data_size);
        let pos = self.raw_alloc(span)?;
        let at = pos as usize;
        self.bytes_mut()[at..at + span as usize].fill(0);
        block::write_header(self.bytes_mut(), pos, data_size, ty);
        Some(HeapPos(pos))
    }

    /// Bump allocation with the failure-handler retry loop.
    fn raw_alloc(&mut self, size: u32) -> Option<u32> {
        loop {
            if let Some(pos) = self.bump(size) {
                return Some(pos);
            }
            let handler = self.fail_handler?;
            trace!(needed = size, "allocation failed, invoking failure handler");
            if !handler(self, size) {
                return None;
            }
        }
    }

    /// Bump allocation without the handler; the collector fills
    /// destination heaps through this.
    pub(crate) fn bump(&mut self, size: u32) -> Option<u32> {
        let new_cur = self.cur.checked_add(size)?;
        if new_cur <= self.end {
            let pos = self.cur;
            self.cur = new_cur;
            Some(pos)
        } else {
            None
        }
    }

    // -----------------------------------------------------------------------
    // Access
    // -----------------------------------------------------------------------

    pub(crate) fn bytes(&self) -> &[u8] {
        self.storage.bytes()
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        self.storage.bytes_mut()
    }

    pub(crate) fn read_u32(&self, at: u32) -> u32 {
        let at = at as usize;
        u32::from_le_bytes(self.bytes()[at..at + 4].try_into().unwrap())
    }

    pub(crate) fn write_u32(&mut self, at: u32, v: u32) {
        let at = at as usize;
        self.bytes_mut()[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }

    /// Decodes the value slot at byte offset `at`.
    pub(crate) fn load_val(&self, at: u32) -> Value {
        debug_assert!(at >= ROOT_POS && at + 4 <= self.cur, "val slot {at:#x} out of range");
        val::decode(self.read_u32(at), at)
    }

    /// Encodes `v` into the value slot at byte offset `at`.
    pub(crate) fn store_val(&mut self, at: u32, v: Value) {
        debug_assert!(at >= ROOT_POS && at + 4 <= self.cur, "val slot {at:#x} out of range");
        if let Value::Object(p) = v {
            debug_assert!(self.contains(p), "value references {:#x} outside heap", p.0);
        }
        self.write_u32(at, val::encode(v, at));
    }

    fn check_block_pos(&self, pos: HeapPos) {
        assert!(
            self.contains(pos) && pos.0 & 1 == 0,
            "invalid block position {:#x}",
            pos.0
        );
    }

    /// A read-only view of the block at `pos`.
    pub fn block_at(&self, pos: HeapPos) -> Block<'_> {
        self.check_block_pos(pos);
        Block::new(self, pos)
    }

    /// The payload bytes of the block at `pos`.
    pub fn data(&self, pos: HeapPos) -> &[u8] {
        self.check_block_pos(pos);
        let (size, _, hdr) = block::read_header(self.bytes(), pos.0);
        let start = (pos.0 + hdr) as usize;
        &self.bytes()[start..start + size as usize]
    }

    /// Mutable payload bytes of the block at `pos`.
    pub fn data_mut(&mut self, pos: HeapPos) -> &mut [u8] {
        self.check_block_pos(pos);
        let (size, _, hdr) = block::read_header(self.bytes(), pos.0);
        let start = (pos.0 + hdr) as usize;
        &mut self.bytes_mut()[start..start + size as usize]
    }

    /// The type of a value: inline types from the bits alone, object
    /// types from the referenced block's header.
    pub fn type_of(&self, v: Value) -> Type {
        match v {
            Value::Null | Value::Nullish => Type::Null,
            Value::Bool(_) => Type::Bool,
            Value::Int(_) => Type::Int,
            Value::Object(p) => {
                self.check_block_pos(p);
                let (_, ty, _) = block::read_header(self.bytes(), p.0);
                ty
            }
        }
    }

    // -----------------------------------------------------------------------
    // External roots
    // -----------------------------------------------------------------------

    /// Registers a root cell holding `v`. The collector rewrites the
    /// cell whenever the referenced block moves.
    pub fn register_root(&mut self, v: Value) -> RootId {
        if let Some(i) = self.free_roots.pop() {
            self.roots[i as usize] = Some(v);
            RootId(i)
        } else {
            self.roots.push(Some(v));
            RootId(self.roots.len() as u32 - 1)
        }
    }

    /// Reads a registered root cell.
    pub fn root_value(&self, id: RootId) -> Value {
        self.roots[id.0 as usize].expect("root cell not registered")
    }

    /// Replaces a registered root cell's value.
    pub fn update_root(&mut self, id: RootId, v: Value) {
        let cell = self.roots[id.0 as usize]
            .as_mut()
            .expect("root cell not registered");
        *cell = v;
    }

    /// Unregisters a root cell. Registration and unregistration must
    /// pair; unregistering twice panics.
    pub fn unregister_root(&mut self, id: RootId) {
        assert!(
            self.roots[id.0 as usize].take().is_some(),
            "root cell not registered"
        );
        self.free_roots.push(id.0);
    }

    /// Wraps a value in a [`Handle`] backed by a registered root cell.
    pub fn make_handle(&mut self, v: Value) -> Handle {
        Handle {
            id: self.register_root(v),
        }
    }

    /// Runs `f` with a handle on `v`, unregistering it on exit.
    pub fn with_root<R>(&mut self, v: Value, f: impl FnOnce(&mut Heap, &Handle) -> R) -> R {
        let handle = self.make_handle(v);
        let result = f(self, &handle);
        handle.release(self);
        result
    }

    // -----------------------------------------------------------------------
    // Current heap
    // -----------------------------------------------------------------------

    /// Makes this heap the thread's current heap while the returned
    /// guard lives; the previous occupant is restored on drop.
    pub fn enter(&self) -> CurrentHeap<'_> {
        let prev = CURRENT.with(|c| {
            let prev = c.get();
            c.set(self as *const Heap);
            prev
        });
        CurrentHeap { heap: self, prev }
    }

    /// True when this heap is the thread's current heap.
    pub fn is_current(&self) -> bool {
        CURRENT.with(|c| std::ptr::eq(c.get(), self))
    }

    /// True when any heap is current on this thread.
    pub fn thread_current_set() -> bool {
        CURRENT.with(|c| !c.get().is_null())
    }

    // -----------------------------------------------------------------------
    // Visitors
    // -----------------------------------------------------------------------

    /// Calls `f` once for every block reachable from the root, stopping
    /// early when it returns false. Traversal order matches the
    /// collector's: a block is visited before its children, breadth
    /// first.
    pub fn visit<F: FnMut(Block<'_>) -> bool>(&self, mut f: F) {
        let mut seen: FxHashSet<u32> = FxHashSet::default();
        let mut queue: VecDeque<u32> = VecDeque::new();

        let mut process = |heap: &Heap,
                           v: Value,
                           seen: &mut FxHashSet<u32>,
                           queue: &mut VecDeque<u32>,
                           f: &mut F|
         -> bool {
            if let Value::Object(p) = v {
                if seen.insert(p.0) {
                    if !f(Block::new(heap, p)) {
                        return false;
                    }
                    let (size, ty, _) = block::read_header(heap.bytes(), p.0);
                    if ty.contains_vals() && size > 0 {
                        queue.push_back(p.0);
                    }
                }
            }
            true
        };

        if !process(self, self.root(), &mut seen, &mut queue, &mut f) {
            return;
        }
        while let Some(pos) = queue.pop_front() {
            let (size, _, hdr) = block::read_header(self.bytes(), pos);
            for i in 0..size / 4 {
                let v = self.load_val(pos + hdr + 4 * i);
                if !process(self, v, &mut seen, &mut queue, &mut f) {
                    return;
                }
            }
        }
    }

    /// Calls `f` once for every block between the header and `used`, in
    /// allocation order, reachable or not. Stops early when it returns
    /// false.
    pub fn visit_all<F: FnMut(Block<'_>) -> bool>(&self, mut f: F) {
        let mut pos = HEADER_SIZE;
        while pos < self.cur {
            let next = block::next_pos(self.bytes(), pos);
            if !f(Block::new(self, HeapPos(pos))) {
                break;
            }
            pos = next;
        }
    }

    // -----------------------------------------------------------------------
    // Collector plumbing
    // -----------------------------------------------------------------------

    /// Exchanges the byte regions of two heaps, leaving handler, roots,
    /// and symbol table with their original owners.
    pub(crate) fn swap_with(&mut self, other: &mut Heap) {
        std::mem::swap(&mut self.storage, &mut other.storage);
        std::mem::swap(&mut self.end, &mut other.end);
        std::mem::swap(&mut self.cur, &mut other.cur);
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("capacity", &self.capacity())
            .field("used", &self.used())
            .field("root", &self.root())
            .finish()
    }
}
