//! The Store: owns a heap, a symbol table, GC roots and the GC lock, and
//! exposes allocation, lookup, mutation and iteration (§4.2).
//!
//! Grounded on `examples/original_source/sling/frame/object.h`'s `Store`
//! declaration for the operation surface, and on `decoder.cc`'s proxy
//! replacement dance for `bind_id_slot`. Two details depart from the
//! original's raw-pointer implementation because this crate is
//! `#![forbid(unsafe_code)]`:
//!
//! - A local/global handle still encodes a byte offset, but a frame whose
//!   identity must survive a resize (proxy replacement, `update_frame`
//!   growing the slot count) is handled through a small forwarding table
//!   (`Store::forward`) rather than by mutating bytes at a fixed address.
//!   Every accessor chases this table before touching the heap; it is
//!   flattened back into the heap itself (and cleared) as a side effect of
//!   the next GC, so the indirection never accumulates unbounded hops.
//! - External roots are `Rc<RefCell<Root>>` (see `heap::gc`) instead of a
//!   callback interface over raw stack frames.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::handle::Handle;
use crate::heap::gc::{self, GcLock, GcLockGuard, Root, RootHandle, RootSet};
use crate::heap::symtab::{hash_name, SymbolTable};
use crate::heap::{Header, Heap, Kind, Slot};

pub use crate::heap::gc::Root as StoreRoot;

/// Tuning knobs for a [`Store`], in place of a config file — matches the
/// teacher's convention of CLI flags plus `Default`-implementing structs,
/// not an on-disk format.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub initial_heap_capacity: usize,
    pub initial_buckets: usize,
    pub fill_factor: f32,
    pub fingerprint_seed: u64,
    pub resolve_hop_limit: u32,
}

impl Default for StoreOptions {
    fn default() -> Self {
        StoreOptions {
            initial_heap_capacity: 4096,
            initial_buckets: 16,
            fill_factor: 0.75,
            fingerprint_seed: 0x9E37_79B9_7F4A_7C15,
            resolve_hop_limit: 64,
        }
    }
}

/// Frozen global store plus writable local heap, symbol table, roots and GC
/// lock (§4.2, §5). A `Store` with no parent is usable either as a
/// standalone store or, once frozen, as the shared global parent of any
/// number of local stores.
pub struct Store {
    parent: Option<Rc<Store>>,
    heap: Heap,
    symtab: SymbolTable,
    roots: RootSet,
    gc_lock: RefCell<GcLock>,
    forward: RefCell<HashMap<u32, u32>>,
    frozen: bool,
    next_gc_threshold: usize,
    options: StoreOptions,
}

impl Store {
    pub fn new(options: StoreOptions) -> Self {
        Store {
            parent: None,
            heap: Heap::with_capacity(options.initial_heap_capacity),
            symtab: SymbolTable::with_capacity(options.initial_buckets, options.fill_factor),
            roots: RootSet::new(),
            gc_lock: RefCell::new(GcLock::new()),
            forward: RefCell::new(HashMap::new()),
            frozen: false,
            next_gc_threshold: options.initial_heap_capacity,
            options,
        }
    }

    /// A local store inheriting read access to `parent`, which MUST already
    /// be frozen (§4.2 "Global + local").
    pub fn with_parent(parent: Rc<Store>, options: StoreOptions) -> Self {
        assert!(parent.frozen, "parent store for a local store must be frozen");
        let mut store = Store::new(options);
        store.parent = Some(parent);
        store
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    /// Registers an externally held handle (or vector of handles) as a GC
    /// root (§4.2 "External roots", §5 point 2).
    pub fn add_root(&mut self, root: Root) -> RootHandle {
        self.roots.register(root)
    }

    /// Acquires the GC lock for the returned guard's lifetime, deferring any
    /// collection a nested allocation would otherwise trigger (§5 point 3).
    pub fn gc_lock(&self) -> GcLockGuard<'_> {
        GcLockGuard::new(&self.gc_lock)
    }

    /// Manual, non-RAII counterpart to [`gc_lock`](Self::gc_lock): a
    /// `GcLockGuard` borrows the whole store for its lifetime, which a
    /// caller that also needs `&mut Store` in the protected span (e.g. the
    /// unifier's `construct`, recursing through several allocating calls
    /// that write handles into its own external graph buffer) can't hold
    /// alongside further mutation. `suspend_gc`/`resume_gc` take `&self`
    /// only for the instant of the call, so they compose with that. Callers
    /// must pair every `suspend_gc` with a `resume_gc`, including on early
    /// return.
    pub fn suspend_gc(&self) {
        self.gc_lock.borrow_mut().lock();
    }

    pub fn resume_gc(&self) {
        self.gc_lock.borrow_mut().unlock();
    }

    // -- dispatch ------------------------------------------------------------

    /// Resolves `h` to the `(Heap, offset)` it actually lives in, chasing
    /// the forwarding table for local refs. Returns `None` for non-ref
    /// handles, or a global ref with no parent store.
    fn heap_offset(&self, h: Handle) -> Option<(&Heap, usize)> {
        if h.is_global_ref() {
            self.parent.as_ref().map(|p| (&p.heap, h.ref_offset() as usize))
        } else if h.is_local_ref() {
            let forward = self.forward.borrow();
            let off = chase(&forward, h).ref_offset() as usize;
            Some((&self.heap, off))
        } else {
            None
        }
    }

    fn local_offset(&self, h: Handle) -> usize {
        let forward = self.forward.borrow();
        chase(&forward, h).ref_offset() as usize
    }

    // -- read accessors (object.rs's required surface) ------------------------

    pub fn kind_of(&self, h: Handle) -> Option<Kind> {
        self.heap_offset(h).map(|(heap, off)| heap.header_at(off).kind)
    }

    pub fn frame_size(&self, h: Handle) -> usize {
        self.heap_offset(h).map(|(heap, off)| heap.header_at(off).size as usize).unwrap_or(0)
    }

    pub fn frame_slot(&self, h: Handle, i: usize) -> Slot {
        self.heap_offset(h)
            .map(|(heap, off)| heap.frame_slot(off, i))
            .unwrap_or(Slot { name: Handle::nil(), value: Handle::nil() })
    }

    pub fn frame_slots(&self, h: Handle) -> Vec<Slot> {
        self.heap_offset(h).map(|(heap, off)| heap.frame_slots(off)).unwrap_or_default()
    }

    pub fn string_bytes(&self, h: Handle) -> &[u8] {
        self.heap_offset(h).map(|(heap, off)| heap.string_bytes(off)).unwrap_or(&[])
    }

    pub fn string_qualifier(&self, h: Handle) -> Handle {
        self.heap_offset(h).map(|(heap, off)| heap.string_qualifier(off)).unwrap_or(Handle::nil())
    }

    pub fn symbol_name(&self, h: Handle) -> Handle {
        self.heap_offset(h).map(|(heap, off)| heap.symbol_name(off)).unwrap_or(Handle::nil())
    }

    pub fn symbol_name_text(&self, h: Handle) -> String {
        let name = self.symbol_name(h);
        String::from_utf8_lossy(self.string_bytes(name)).into_owned()
    }

    pub fn symbol_value(&self, h: Handle) -> Handle {
        self.heap_offset(h).map(|(heap, off)| heap.symbol_value(off)).unwrap_or(Handle::nil())
    }

    pub fn array_len(&self, h: Handle) -> usize {
        self.heap_offset(h).map(|(heap, off)| heap.header_at(off).size as usize).unwrap_or(0)
    }

    pub fn array_element(&self, h: Handle, i: usize) -> Handle {
        self.heap_offset(h).map(|(heap, off)| heap.array_element(off, i)).unwrap_or(Handle::nil())
    }

    pub(crate) fn is_proxy(&self, h: Handle) -> bool {
        self.kind_of(h) == Some(Kind::Frame) && self.frame_size(h) == 1 && self.frame_slot(h, 0).name.is_id()
    }

    /// Follows `is` chains to their terminal handle, bounded by
    /// `options.resolve_hop_limit` and a visited-set cycle guard (§4.2).
    pub fn resolve(&self, handle: Handle) -> Handle {
        let mut h = handle;
        let mut seen = std::collections::HashSet::new();
        for _ in 0..self.options.resolve_hop_limit {
            if !h.is_ref() || h.is_special() {
                return h;
            }
            if !seen.insert(h) {
                return h;
            }
            if self.kind_of(h) != Some(Kind::Frame) {
                return h;
            }
            match self.frame_slots(h).into_iter().find(|s| s.name.is_is()) {
                Some(slot) => h = slot.value,
                None => return h,
            }
        }
        h
    }

    /// Deterministic digest over the recursively reachable structure,
    /// seeded by `options.fingerprint_seed` (§4.2).
    pub fn fingerprint(&self, handle: Handle) -> u64 {
        let mut seen = std::collections::HashSet::new();
        self.fingerprint_inner(handle, &mut seen)
    }

    fn fingerprint_inner(&self, h: Handle, seen: &mut std::collections::HashSet<Handle>) -> u64 {
        let seed = self.options.fingerprint_seed;
        if h.is_nil() {
            return mix(seed, 0, 0);
        }
        if let Some(v) = h.as_int() {
            return mix(seed, 1, v as u64);
        }
        if let Some(v) = h.as_float() {
            return mix(seed, 2, v.to_bits() as u64);
        }
        if !h.is_ref() || h.is_special() {
            return mix(seed, 3, h.raw() as u64);
        }
        if !seen.insert(h) {
            return mix(seed, 9, 0);
        }
        match self.kind_of(h) {
            Some(Kind::String) => mix_bytes(seed, 4, self.string_bytes(h)),
            Some(Kind::Symbol) => mix(seed, 5, self.fingerprint_inner(self.symbol_name(h), seen)),
            Some(Kind::Array) => {
                let n = self.array_len(h);
                let mut acc = seed;
                for i in 0..n {
                    acc = mix(acc, 6, self.fingerprint_inner(self.array_element(h, i), seen));
                }
                acc
            }
            Some(Kind::Frame) => {
                let mut acc = seed;
                for slot in self.frame_slots(h) {
                    let name_fp = self.fingerprint_inner(slot.name, seen);
                    let value_fp = self.fingerprint_inner(slot.value, seen);
                    acc ^= mix(name_fp, 7, value_fp);
                }
                acc
            }
            None => mix(seed, 8, 0),
        }
    }

    // -- lookup ----------------------------------------------------------

    fn find_local_symbol(&self, hash: u64, name: &[u8]) -> Option<Handle> {
        let mut cur = self.symtab.bucket_head(hash);
        while !cur.is_nil() {
            let off = self.local_offset(cur);
            let name_h = self.heap.symbol_name(off);
            if self.string_bytes(name_h) == name {
                return Some(cur);
            }
            cur = self.heap.symbol_next(off);
        }
        None
    }

    /// Returns the symbol handle for `name`, creating an unbound local
    /// symbol if it isn't found locally or in the frozen parent. On a
    /// frozen store a missing name cannot be created, so this degrades to
    /// `lookup_existing`'s nil-on-absence behaviour.
    pub fn lookup(&mut self, name: &[u8]) -> Handle {
        let hash = hash_name(name);
        if let Some(h) = self.find_local_symbol(hash, name) {
            return h;
        }
        if let Some(parent) = self.parent.clone() {
            if let Some(h) = parent.find_local_symbol(hash, name) {
                return Handle::global_ref(h.ref_offset());
            }
        }
        if self.frozen {
            return Handle::nil();
        }
        self.create_local_symbol(name)
    }

    /// Returns nil (without creating anything) if `name` is absent or bound
    /// to nothing; otherwise the symbol handle (§4.2).
    pub fn lookup_existing(&self, name: &[u8]) -> Handle {
        let hash = hash_name(name);
        if let Some(h) = self.find_local_symbol(hash, name) {
            if !self.symbol_value(h).is_nil() {
                return h;
            }
            return Handle::nil();
        }
        if let Some(parent) = &self.parent {
            if let Some(h) = parent.find_local_symbol(hash, name) {
                if !parent.symbol_value(h).is_nil() {
                    return Handle::global_ref(h.ref_offset());
                }
            }
        }
        Handle::nil()
    }

    fn create_local_symbol(&mut self, name: &[u8]) -> Handle {
        self.maybe_collect();
        let _guard = GcLockGuard::new(&self.gc_lock);
        if self.symtab.should_grow() {
            self.grow_symtab();
        }
        let name_handle = self.allocate_string(name, Handle::nil());
        let offset = self.heap.alloc(Header { kind: Kind::Symbol, size: 0 });
        self.heap.set_symbol_name(offset, name_handle);
        self.heap.set_symbol_value(offset, Handle::nil());
        let hash = hash_name(name);
        let head = self.symtab.bucket_head(hash);
        self.heap.set_symbol_next(offset, head);
        self.symtab.set_bucket_head(hash, Handle::local_ref(offset as u32));
        self.symtab.note_insert();
        let new_symbol = Handle::local_ref(offset as u32);
        #[cfg(feature = "strict")]
        self.assert_symbol_chain_contains(hash, name, new_symbol);
        new_symbol
    }

    /// `strict`-only: walks the bucket chain for `hash` and confirms `symbol`
    /// appears in it exactly once with the expected name bytes (SPEC_FULL §A
    /// "extra runtime invariant assertions").
    #[cfg(feature = "strict")]
    fn assert_symbol_chain_contains(&self, hash: u64, name: &[u8], symbol: Handle) {
        let mut cur = self.symtab.bucket_head(hash);
        let mut hits = 0;
        while !cur.is_nil() {
            let off = self.local_offset(cur);
            if cur == symbol {
                hits += 1;
                let name_h = self.heap.symbol_name(off);
                assert_eq!(self.string_bytes(name_h), name, "symbol table entry has wrong name bytes");
            }
            cur = self.heap.symbol_next(off);
        }
        assert_eq!(hits, 1, "newly inserted symbol must appear exactly once in its bucket chain");
    }

    fn grow_symtab(&mut self) {
        let old_buckets = self.symtab.grow();
        for head in old_buckets {
            let mut cur = head;
            while !cur.is_nil() {
                let off = self.local_offset(cur);
                let next = self.heap.symbol_next(off);
                let name_h = self.heap.symbol_name(off);
                let name_bytes = self.string_bytes(name_h).to_vec();
                let hash = hash_name(&name_bytes);
                let new_head = self.symtab.bucket_head(hash);
                self.heap.set_symbol_next(off, new_head);
                self.symtab.set_bucket_head(hash, cur);
                cur = next;
            }
        }
    }

    /// Localizes a foreign (global-scope) symbol into this store's own
    /// symbol table, creating it if absent, so binding an `id` slot never
    /// mutates another store's table (§4.3 "foreign symbols are
    /// localised").
    fn localize_symbol(&mut self, symbol: Handle) -> Handle {
        if symbol.is_local_ref() {
            return symbol;
        }
        if symbol.is_global_ref() {
            let name = self.symbol_name(symbol);
            let bytes = self.string_bytes(name).to_vec();
            let hash = hash_name(&bytes);
            if let Some(h) = self.find_local_symbol(hash, &bytes) {
                return h;
            }
            return self.create_local_symbol(&bytes);
        }
        symbol
    }

    // -- allocation --------------------------------------------------------

    fn maybe_collect(&mut self) {
        if self.frozen {
            return;
        }
        if self.gc_lock.borrow().is_locked() {
            return;
        }
        if self.heap.len() < self.next_gc_threshold {
            return;
        }
        self.normalize_forwarding();
        gc::collect(&mut self.heap, &mut self.roots, self.symtab.bucket_heads_mut(), &mut []);
        self.next_gc_threshold = (self.heap.len() * 2).max(self.options.initial_heap_capacity);
    }

    /// Flattens every pending proxy-replacement / resize redirect directly
    /// into the heap (rewriting every stored reference) and into the roots
    /// and symbol table bucket heads, then clears the table. Called before
    /// every collection so `heap::gc::collect` — which knows nothing about
    /// `forward` — sees a fully-resolved graph.
    fn normalize_forwarding(&mut self) {
        if self.forward.borrow().is_empty() {
            return;
        }
        let forward = self.forward.borrow();
        let mut offset = 0usize;
        let len = self.heap.len();
        while offset < len {
            let header = self.heap.header_at(offset);
            match header.kind {
                Kind::Frame => {
                    let n = header.size as usize;
                    for i in 0..n {
                        let mut slot = self.heap.frame_slot(offset, i);
                        slot.name = chase(&forward, slot.name);
                        slot.value = chase(&forward, slot.value);
                        self.heap.set_frame_slot(offset, i, slot);
                    }
                }
                Kind::String => {
                    let q = chase(&forward, self.heap.string_qualifier(offset));
                    self.heap.set_string_qualifier(offset, q);
                }
                Kind::Symbol => {
                    let name = chase(&forward, self.heap.symbol_name(offset));
                    let value = chase(&forward, self.heap.symbol_value(offset));
                    let next = chase(&forward, self.heap.symbol_next(offset));
                    self.heap.set_symbol_name(offset, name);
                    self.heap.set_symbol_value(offset, value);
                    self.heap.set_symbol_next(offset, next);
                }
                Kind::Array => {
                    let n = header.size as usize;
                    for i in 0..n {
                        let e = chase(&forward, self.heap.array_element(offset, i));
                        self.heap.set_array_element(offset, i, e);
                    }
                }
            }
            offset += header.byte_len();
        }
        self.roots.for_each_mut(&mut |h| chase(&forward, h));
        for h in self.symtab.bucket_heads_mut() {
            *h = chase(&forward, *h);
        }
        drop(forward);
        self.forward.borrow_mut().clear();
    }

    pub fn allocate_string(&mut self, bytes: &[u8], qualifier: Handle) -> Handle {
        if self.frozen {
            return Handle::error();
        }
        self.maybe_collect();
        let _guard = GcLockGuard::new(&self.gc_lock);
        let offset = self.heap.alloc(Header { kind: Kind::String, size: bytes.len() as u32 });
        self.heap.set_string_bytes(offset, bytes);
        self.heap.set_string_qualifier(offset, qualifier);
        Handle::local_ref(offset as u32)
    }

    pub fn allocate_array(&mut self, elements: &[Handle]) -> Handle {
        if self.frozen {
            return Handle::error();
        }
        self.maybe_collect();
        let _guard = GcLockGuard::new(&self.gc_lock);
        let offset = self.heap.alloc(Header { kind: Kind::Array, size: elements.len() as u32 });
        for (i, h) in elements.iter().enumerate() {
            self.heap.set_array_element(offset, i, *h);
        }
        Handle::local_ref(offset as u32)
    }

    /// Allocates a frame and, for each `id` slot, binds (or replaces a
    /// proxy for) the named symbol (§4.2, §9 "Late binding / proxies").
    pub fn allocate_frame(&mut self, slots: &[Slot]) -> Handle {
        if self.frozen {
            return Handle::error();
        }
        self.maybe_collect();
        let _guard = GcLockGuard::new(&self.gc_lock);
        let offset = self.heap.alloc(Header { kind: Kind::Frame, size: slots.len() as u32 });
        for (i, slot) in slots.iter().enumerate() {
            self.heap.set_frame_slot(offset, i, *slot);
        }
        let frame = Handle::local_ref(offset as u32);
        self.rebind_id_slots(offset, frame);
        frame
    }

    /// Overwrites an existing frame's payload. Preserves `handle` as the
    /// identity callers keep using even when the new slot count forces a
    /// reallocation — the old and new storage are linked through `forward`
    /// rather than by returning a different handle (§8 "preserves
    /// handle(F)").
    pub fn update_frame(&mut self, handle: Handle, slots: &[Slot]) -> Handle {
        if self.frozen || !handle.is_local_ref() {
            return Handle::error();
        }
        let root = self.roots.register(Root::Cell(handle));
        self.maybe_collect();
        let _guard = GcLockGuard::new(&self.gc_lock);
        let current = match &*root.borrow() {
            Root::Cell(h) => *h,
            _ => handle,
        };
        let offset = self.local_offset(current);
        let old_size = self.heap.header_at(offset).size as usize;
        if slots.len() == old_size {
            for (i, slot) in slots.iter().enumerate() {
                self.heap.set_frame_slot(offset, i, *slot);
            }
            self.rebind_id_slots(offset, current);
        } else {
            let new_offset = self.heap.alloc(Header { kind: Kind::Frame, size: slots.len() as u32 });
            for (i, slot) in slots.iter().enumerate() {
                self.heap.set_frame_slot(new_offset, i, *slot);
            }
            self.forward.borrow_mut().insert(current.ref_offset(), new_offset as u32);
            self.rebind_id_slots(new_offset, current);
        }
        current
    }

    fn rebind_id_slots(&mut self, frame_offset: usize, frame: Handle) {
        let n = self.heap.header_at(frame_offset).size as usize;
        for i in 0..n {
            let slot = self.heap.frame_slot(frame_offset, i);
            if slot.name.is_id() {
                self.bind_id_slot(frame_offset, i, slot.value, frame);
            }
        }
    }

    /// The proxy-replacement dance from `decoder.cc`'s `DecodeFrame`,
    /// generalised: localize a foreign symbol if needed, then either bind
    /// an unbound symbol or redirect an existing proxy's storage at `frame`.
    fn bind_id_slot(&mut self, frame_offset: usize, slot_index: usize, symbol_in_slot: Handle, frame: Handle) {
        let local_symbol = self.localize_symbol(symbol_in_slot);
        if local_symbol != symbol_in_slot {
            self.heap.set_frame_slot(frame_offset, slot_index, Slot { name: Handle::id(), value: local_symbol });
        }
        let sym_off = self.local_offset(local_symbol);
        let current = self.heap.symbol_value(sym_off);
        if current.is_nil() {
            self.heap.set_symbol_value(sym_off, frame);
            return;
        }
        if current != frame && self.is_proxy(current) {
            self.forward.borrow_mut().insert(current.ref_offset(), frame.ref_offset());
        }
        self.heap.set_symbol_value(sym_off, frame);
    }

    /// Appends a slot (duplicate names are allowed — §3.2 "slots are
    /// unordered... order of insertion is preserved").
    pub fn add(&mut self, frame: Handle, name: Handle, value: Handle) -> Handle {
        if self.frozen || !frame.is_local_ref() {
            return Handle::error();
        }
        let mut slots = self.frame_slots(frame);
        slots.push(Slot { name, value });
        self.update_frame(frame, &slots)
    }

    /// Overwrites the first slot named `name`, appending one if absent.
    pub fn set(&mut self, frame: Handle, name: Handle, value: Handle) -> Handle {
        if self.frozen || !frame.is_local_ref() {
            return Handle::error();
        }
        let mut slots = self.frame_slots(frame);
        match slots.iter_mut().find(|s| s.name == name) {
            Some(s) => s.value = value,
            None => slots.push(Slot { name, value }),
        }
        self.update_frame(frame, &slots)
    }

    /// Deduplicates byte-identical (and qualifier-identical) strings,
    /// redirecting every current reference at one canonical copy (§4.2,
    /// §8's "equal bytes -> equal handle" property). `buckets` sizes the
    /// dedup hash table; it does not change the result.
    pub fn coalesce_strings(&mut self, buckets: usize) {
        if self.frozen {
            return;
        }
        self.maybe_collect();
        let _guard = GcLockGuard::new(&self.gc_lock);
        let mut canon: HashMap<(Handle, Vec<u8>), u32> = HashMap::with_capacity(buckets.max(1));
        let mut offset = 0usize;
        let len = self.heap.len();
        while offset < len {
            let header = self.heap.header_at(offset);
            if header.kind == Kind::String {
                let qualifier = self.heap.string_qualifier(offset);
                let bytes = self.heap.string_bytes(offset).to_vec();
                let key = (qualifier, bytes);
                match canon.get(&key) {
                    Some(&canon_offset) => {
                        if canon_offset != offset as u32 {
                            self.forward.borrow_mut().insert(offset as u32, canon_offset);
                        }
                    }
                    None => {
                        canon.insert(key, offset as u32);
                    }
                }
            }
            offset += header.byte_len();
        }
        drop(canon);
        self.normalize_forwarding();
    }

    /// Transitions to immutable (§4.2). Flattens any pending forwards and
    /// runs one final collection first, so a frozen store's heap never
    /// needs the forwarding table again.
    pub fn freeze(&mut self) {
        if self.frozen {
            return;
        }
        self.normalize_forwarding();
        gc::collect(&mut self.heap, &mut self.roots, self.symtab.bucket_heads_mut(), &mut []);
        self.frozen = true;
    }
}

fn chase(forward: &HashMap<u32, u32>, h: Handle) -> Handle {
    if !h.is_local_ref() {
        return h;
    }
    let mut off = h.ref_offset();
    let mut hops = 0;
    while let Some(&next) = forward.get(&off) {
        off = next;
        hops += 1;
        if hops > 10_000 {
            break;
        }
    }
    Handle::local_ref(off)
}

/// splitmix64-style combinator; deterministic and dependency-free, matching
/// the teacher's own hand-rolled hashing style (`heap::symtab::hash_name`).
fn mix(seed: u64, tag: u64, value: u64) -> u64 {
    let mut h = seed ^ tag.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    h ^= value;
    h = h.wrapping_mul(0xFF51_AFD7_ED55_8CCD);
    h ^= h >> 33;
    h
}

fn mix_bytes(seed: u64, tag: u64, bytes: &[u8]) -> u64 {
    let mut acc = mix(seed, tag, bytes.len() as u64);
    for chunk in bytes.chunks(8) {
        let mut buf = [0u8; 8];
        buf[..chunk.len()].copy_from_slice(chunk);
        acc = mix(acc, tag, u64::from_le_bytes(buf));
    }
    acc
}

/// Staging area for a single frame: accumulate slots, then `create()` a new
/// frame or `update()` an existing one (§6 embedding contract, B.2).
pub struct Builder<'s> {
    store: &'s mut Store,
    handle: Option<Handle>,
    slots: RootHandle,
}

impl<'s> Builder<'s> {
    /// Like the decoder's reference table, `slots` is a registered GC root
    /// (§5 point 2): building a frame can span several allocating calls
    /// (e.g. repeated `add_text`), and a collection triggered midway must be
    /// able to rewrite the handles already staged here.
    pub fn new(store: &'s mut Store) -> Self {
        let slots = store.add_root(Root::Slots(Vec::new()));
        Builder { store, handle: None, slots }
    }

    pub fn for_frame(store: &'s mut Store, handle: Handle) -> Self {
        let initial = store.frame_slots(handle);
        let slots = store.add_root(Root::Slots(initial));
        Builder { store, handle: Some(handle), slots }
    }

    fn with_slots<R>(&self, f: impl FnOnce(&mut Vec<Slot>) -> R) -> R {
        match &mut *self.slots.borrow_mut() {
            Root::Slots(v) => f(v),
            _ => unreachable!("Builder::slots is always a Root::Slots"),
        }
    }

    fn slots_snapshot(&self) -> Vec<Slot> {
        self.with_slots(|v| v.clone())
    }

    /// True if `update()` would allocate a new frame rather than overwrite
    /// one: no handle staged yet, or the staged handle is nil or a proxy.
    pub fn is_new(&self) -> bool {
        match self.handle {
            None => true,
            Some(h) => h.is_nil() || self.store.is_proxy(h),
        }
    }

    pub fn add(&mut self, name: Handle, value: Handle) -> &mut Self {
        self.with_slots(|v| v.push(Slot { name, value }));
        self
    }

    pub fn set(&mut self, name: Handle, value: Handle) -> &mut Self {
        self.with_slots(|v| match v.iter_mut().find(|s| s.name == name) {
            Some(s) => s.value = value,
            None => v.push(Slot { name, value }),
        });
        self
    }

    pub fn add_id(&mut self, symbol: Handle) -> &mut Self {
        self.add(Handle::id(), symbol)
    }

    pub fn add_isa(&mut self, ty: Handle) -> &mut Self {
        self.add(Handle::isa(), ty)
    }

    pub fn add_is(&mut self, other: Handle) -> &mut Self {
        self.add(Handle::is(), other)
    }

    pub fn add_int(&mut self, name: Handle, value: i32) -> &mut Self {
        let h = Handle::integer(value).unwrap_or_else(|| Handle::float(value as f32));
        self.add(name, h)
    }

    pub fn add_float(&mut self, name: Handle, value: f32) -> &mut Self {
        self.add(name, Handle::float(value))
    }

    pub fn add_bool(&mut self, name: Handle, value: bool) -> &mut Self {
        self.add(name, if value { Handle::true_() } else { Handle::false_() })
    }

    pub fn add_text(&mut self, name: Handle, text: &str) -> &mut Self {
        let h = self.store.allocate_string(text.as_bytes(), Handle::nil());
        self.add(name, h)
    }

    /// Copies every slot of `other` (e.g. a template frame) onto this one.
    pub fn add_from(&mut self, other: Handle) -> &mut Self {
        let incoming = self.store.frame_slots(other);
        self.with_slots(|v| v.extend(incoming));
        self
    }

    pub fn delete(&mut self, name: Handle) -> &mut Self {
        self.with_slots(|v| v.retain(|s| s.name != name));
        self
    }

    pub fn remove(&mut self, name: Handle, value: Handle) -> &mut Self {
        self.with_slots(|v| v.retain(|s| !(s.name == name && s.value == value)));
        self
    }

    /// Drops every slot whose value is nil.
    pub fn prune(&mut self) -> &mut Self {
        self.with_slots(|v| v.retain(|s| !s.value.is_nil()));
        self
    }

    pub fn reset(&mut self, handle: Handle) {
        let fresh = self.store.frame_slots(handle);
        self.with_slots(|v| *v = fresh);
        self.handle = Some(handle);
    }

    pub fn clear(&mut self) {
        self.handle = None;
        self.with_slots(|v| v.clear());
    }

    pub fn create(&mut self) -> Handle {
        let snapshot = self.slots_snapshot();
        self.store.allocate_frame(&snapshot)
    }

    pub fn update(&mut self) -> Handle {
        let snapshot = self.slots_snapshot();
        match self.handle {
            Some(h) if h.is_local_ref() => self.store.update_frame(h, &snapshot),
            _ => self.store.allocate_frame(&snapshot),
        }
    }
}

/// Pre-resolves and caches frequently used slot-name symbol handles so
/// hot-path code doesn't repeatedly pay for `Store::lookup` (B.3).
#[derive(Default)]
pub struct NameTable {
    extra: HashMap<String, Handle>,
}

impl NameTable {
    pub fn new() -> Self {
        NameTable::default()
    }

    pub fn id(&self) -> Handle {
        Handle::id()
    }

    pub fn isa(&self) -> Handle {
        Handle::isa()
    }

    pub fn is(&self) -> Handle {
        Handle::is()
    }

    pub fn lookup(&mut self, store: &mut Store, name: &str) -> Handle {
        if let Some(&h) = self.extra.get(name) {
            return h;
        }
        let h = store.lookup(name.as_bytes());
        self.extra.insert(name.to_string(), h);
        h
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_creates_unbound_symbol_then_finds_it_again() {
        let mut store = Store::new(StoreOptions::default());
        let a = store.lookup(b"foo");
        let b = store.lookup(b"foo");
        assert_eq!(a, b);
        assert!(store.symbol_value(a).is_nil());
        assert!(store.lookup_existing(b"foo").is_nil());
    }

    #[test]
    fn allocate_frame_binds_id_slot() {
        let mut store = Store::new(StoreOptions::default());
        let sym = store.lookup(b"Foo");
        let frame = store.allocate_frame(&[
            Slot { name: Handle::id(), value: sym },
            Slot { name: Handle::isa(), value: Handle::integer(1).unwrap() },
        ]);
        assert_eq!(store.symbol_value(sym), frame);
        assert_eq!(store.frame_size(frame), 2);
    }

    #[test]
    fn allocate_frame_replaces_existing_proxy_in_place() {
        let mut store = Store::new(StoreOptions::default());
        let sym = store.lookup(b"P");
        let proxy = store.allocate_frame(&[Slot { name: Handle::id(), value: sym }]);
        assert_eq!(store.symbol_value(sym), proxy);

        // A frame referencing the proxy before the real definition shows up.
        let holder = store.allocate_frame(&[Slot { name: Handle::isa(), value: proxy }]);

        let real = store.allocate_frame(&[
            Slot { name: Handle::id(), value: sym },
            Slot { name: Handle::isa(), value: Handle::integer(9).unwrap() },
        ]);

        assert_eq!(store.symbol_value(sym), real);
        // The holder's stored proxy handle now reads the real frame's slots.
        let observed = store.frame_slot(holder, 0).value;
        assert_eq!(store.frame_size(observed), 2);
        assert_eq!(store.frame_slot(observed, 1).value.as_int(), Some(9));
    }

    #[test]
    fn update_frame_preserves_handle_across_a_resize() {
        let mut store = Store::new(StoreOptions::default());
        let frame = store.allocate_frame(&[Slot { name: Handle::isa(), value: Handle::integer(1).unwrap() }]);
        let grown = store.update_frame(
            frame,
            &[
                Slot { name: Handle::isa(), value: Handle::integer(1).unwrap() },
                Slot { name: Handle::isa(), value: Handle::integer(2).unwrap() },
            ],
        );
        assert_eq!(grown, frame);
        assert_eq!(store.frame_size(frame), 2);
    }

    #[test]
    fn coalesce_strings_unifies_equal_byte_strings() {
        let mut store = Store::new(StoreOptions::default());
        let a = store.allocate_string(b"hello", Handle::nil());
        let b = store.allocate_string(b"hello", Handle::nil());
        let frame = store.allocate_frame(&[
            Slot { name: Handle::isa(), value: a },
            Slot { name: Handle::is(), value: b },
        ]);
        store.coalesce_strings(16);
        let s1 = store.frame_slot(frame, 0).value;
        let s2 = store.frame_slot(frame, 1).value;
        assert_eq!(s1, s2);
    }

    #[test]
    fn gc_reclaims_unreachable_frames_and_preserves_rooted_one() {
        let mut store = Store::new(StoreOptions { initial_heap_capacity: 16, ..StoreOptions::default() });
        let mut keep = Handle::nil();
        for i in 0..64 {
            let f = store.allocate_frame(&[Slot { name: Handle::isa(), value: Handle::integer(i).unwrap() }]);
            if i == 42 {
                keep = f;
            }
        }
        let root = store.add_root(Root::Cell(keep));
        store.maybe_collect();
        let current = match &*root.borrow() {
            Root::Cell(h) => *h,
            _ => unreachable!(),
        };
        assert_eq!(store.frame_slot(current, 0).value.as_int(), Some(42));
    }

    #[test]
    fn builder_create_then_update_round_trip() {
        let mut store = Store::new(StoreOptions::default());
        let handle = {
            let mut b = Builder::new(&mut store);
            b.add_isa(Handle::integer(1).unwrap());
            b.create()
        };
        {
            let mut b = Builder::for_frame(&mut store, handle);
            assert!(!b.is_new());
            b.add_is(Handle::integer(2).unwrap());
            let updated = b.update();
            assert_eq!(updated, handle);
        }
        assert_eq!(store.frame_size(handle), 2);
    }
}
