//! Read-only façade wrappers pairing a [`Handle`](crate::handle::Handle)
//! with the [`Store`] it lives in, so callers don't have to remember which
//! datum kind a handle denotes and call the right `Store` accessor
//! themselves.
//!
//! Transliterated from `examples/original_source/sling/frame/object.h`'s
//! `Object`/`Frame`/`String`/`Symbol`/`Array` classes (supplemented feature
//! B.1 in `SPEC_FULL.md`) — the original's own unifier and collaborators use
//! exactly this style of wrapper rather than bare handles plus `Store`
//! method calls.

use crate::handle::Handle;
use crate::heap::Kind;
use crate::store::Store;

/// A handle paired with the store that can dereference it. Cheap to copy
/// (it's just a reference and a `u32`).
#[derive(Clone, Copy)]
pub struct Object<'s> {
    pub(crate) store: &'s Store,
    pub(crate) handle: Handle,
}

impl<'s> Object<'s> {
    pub fn new(store: &'s Store, handle: Handle) -> Self {
        Object { store, handle }
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn store(&self) -> &'s Store {
        self.store
    }

    pub fn is_nil(&self) -> bool {
        self.handle.is_nil()
    }

    pub fn is_error(&self) -> bool {
        self.handle.is_error()
    }

    pub fn is_int(&self) -> bool {
        self.handle.is_int()
    }

    pub fn is_float(&self) -> bool {
        self.handle.is_float()
    }

    pub fn is_ref(&self) -> bool {
        self.handle.is_ref()
    }

    pub fn as_int(&self) -> Option<i32> {
        self.handle.as_int()
    }

    pub fn as_float(&self) -> Option<f32> {
        self.handle.as_float()
    }

    pub fn as_bool(&self) -> Option<bool> {
        self.handle.as_int().map(|v| v != 0)
    }

    fn kind(&self) -> Option<Kind> {
        if !self.handle.is_ref() || self.handle.is_special() {
            return None;
        }
        self.store.kind_of(self.handle)
    }

    pub fn is_frame(&self) -> bool {
        matches!(self.kind(), Some(Kind::Frame))
    }

    pub fn is_string(&self) -> bool {
        matches!(self.kind(), Some(Kind::String))
    }

    pub fn is_symbol(&self) -> bool {
        matches!(self.kind(), Some(Kind::Symbol))
    }

    pub fn is_array(&self) -> bool {
        matches!(self.kind(), Some(Kind::Array))
    }

    pub fn as_frame(&self) -> Option<FrameRef<'s>> {
        self.is_frame().then_some(FrameRef { obj: *self })
    }

    pub fn as_string(&self) -> Option<StringRef<'s>> {
        self.is_string().then_some(StringRef { obj: *self })
    }

    pub fn as_symbol(&self) -> Option<SymbolRef<'s>> {
        self.is_symbol().then_some(SymbolRef { obj: *self })
    }

    pub fn as_array(&self) -> Option<ArrayRef<'s>> {
        self.is_array().then_some(ArrayRef { obj: *self })
    }

    /// A 64-bit digest over the recursively reachable structure rooted
    /// here; delegates to `Store::fingerprint`.
    pub fn fingerprint(&self) -> u64 {
        self.store.fingerprint(self.handle)
    }

    /// Follows `is` chains to their terminal handle.
    pub fn resolved(&self) -> Object<'s> {
        Object::new(self.store, self.store.resolve(self.handle))
    }
}

impl std::fmt::Debug for Object<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(fr) = self.as_frame() {
            write!(f, "{:?}", fr)
        } else if let Some(s) = self.as_string() {
            write!(f, "{:?}", s)
        } else if let Some(s) = self.as_symbol() {
            write!(f, "{:?}", s)
        } else if let Some(a) = self.as_array() {
            write!(f, "{:?}", a)
        } else {
            write!(f, "{:?}", self.handle)
        }
    }
}

/// A frame: the primary data-model citizen (§3.2, glossary).
#[derive(Clone, Copy)]
pub struct FrameRef<'s> {
    obj: Object<'s>,
}

impl<'s> FrameRef<'s> {
    pub fn handle(&self) -> Handle {
        self.obj.handle
    }

    pub fn size(&self) -> usize {
        self.obj.store.frame_size(self.obj.handle)
    }

    pub fn name(&self, i: usize) -> Handle {
        self.obj.store.frame_slot(self.obj.handle, i).name
    }

    pub fn value(&self, i: usize) -> Handle {
        self.obj.store.frame_slot(self.obj.handle, i).value
    }

    pub fn slot(&self, i: usize) -> (Handle, Handle) {
        let s = self.obj.store.frame_slot(self.obj.handle, i);
        (s.name, s.value)
    }

    pub fn slots(&self) -> impl Iterator<Item = (Handle, Handle)> + 's {
        let store = self.obj.store;
        let handle = self.obj.handle;
        let n = store.frame_size(handle);
        (0..n).map(move |i| {
            let s = store.frame_slot(handle, i);
            (s.name, s.value)
        })
    }

    /// First slot value with name `name`, if any.
    pub fn get(&self, name: Handle) -> Option<Handle> {
        self.slots().find(|(n, _)| *n == name).map(|(_, v)| v)
    }

    pub fn get_int(&self, name: Handle) -> Option<i32> {
        self.get(name).and_then(|h| h.as_int())
    }

    pub fn get_float(&self, name: Handle) -> Option<f32> {
        self.get(name).and_then(|h| h.as_float())
    }

    pub fn get_bool(&self, name: Handle) -> Option<bool> {
        self.get(name).map(|h| h.is_true() || (h.is_int() && h.as_int() != Some(0)))
    }

    pub fn get_frame(&self, name: Handle) -> Option<FrameRef<'s>> {
        self.get(name)
            .and_then(|h| Object::new(self.obj.store, h).as_frame())
    }

    pub fn get_string(&self, name: Handle) -> Option<StringRef<'s>> {
        self.get(name)
            .and_then(|h| Object::new(self.obj.store, h).as_string())
    }

    pub fn get_symbol(&self, name: Handle) -> Option<SymbolRef<'s>> {
        self.get(name)
            .and_then(|h| Object::new(self.obj.store, h).as_symbol())
    }

    pub fn get_text(&self, name: Handle) -> Option<String> {
        self.get_string(name).map(|s| s.text())
    }

    /// Handles of every `id` slot's value (the symbols bound to this
    /// frame). Usually zero or one, but nothing stops several.
    pub fn ids(&self) -> impl Iterator<Item = Handle> + 's {
        self.slots()
            .filter(|(n, _)| n.is_id())
            .map(|(_, v)| v)
            .collect::<Vec<_>>()
            .into_iter()
    }

    pub fn id(&self) -> Option<Handle> {
        self.ids().next()
    }

    pub fn is_public(&self) -> bool {
        self.slots().any(|(n, _)| n.is_id())
    }

    pub fn is_anonymous(&self) -> bool {
        !self.is_public()
    }

    /// A proxy is exactly one `id` slot and nothing else (§3.2).
    pub fn is_proxy(&self) -> bool {
        self.size() == 1 && self.name(0).is_id()
    }

    /// True if any slot's name is `isa` and its value equals `ty` (or, for a
    /// symbol-valued `isa`, resolves to `ty`).
    pub fn is_a(&self, ty: Handle) -> bool {
        self.slots().any(|(n, v)| n.is_isa() && v == ty)
    }

    /// True if any `is` slot's value equals `other` (possibly through
    /// resolution).
    pub fn is_(&self, other: Handle) -> bool {
        self.slots().any(|(n, v)| n.is_is() && self.obj.store.resolve(v) == self.obj.store.resolve(other))
    }

    pub fn resolve(&self) -> Handle {
        self.obj.store.resolve(self.obj.handle)
    }
}

impl std::fmt::Debug for FrameRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        for (i, (n, v)) in self.slots().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{:?}: {:?}", n, v)?;
        }
        write!(f, "}}")
    }
}

/// An immutable, optionally-qualified byte string.
#[derive(Clone, Copy)]
pub struct StringRef<'s> {
    obj: Object<'s>,
}

impl<'s> StringRef<'s> {
    pub fn handle(&self) -> Handle {
        self.obj.handle
    }

    pub fn bytes(&self) -> &'s [u8] {
        self.obj.store.string_bytes(self.obj.handle)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(self.bytes()).into_owned()
    }

    pub fn qualifier(&self) -> Handle {
        self.obj.store.string_qualifier(self.obj.handle)
    }

    pub fn is_qualified(&self) -> bool {
        !self.qualifier().is_nil()
    }
}

impl std::fmt::Debug for StringRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.text())
    }
}

/// A named binding in the store's symbol table.
#[derive(Clone, Copy)]
pub struct SymbolRef<'s> {
    obj: Object<'s>,
}

impl<'s> SymbolRef<'s> {
    pub fn handle(&self) -> Handle {
        self.obj.handle
    }

    pub fn name(&self) -> String {
        self.obj.store.symbol_name_text(self.obj.handle)
    }

    pub fn value(&self) -> Handle {
        self.obj.store.symbol_value(self.obj.handle)
    }

    pub fn is_bound(&self) -> bool {
        !self.value().is_nil()
    }

    pub fn is_unbound(&self) -> bool {
        !self.is_bound()
    }
}

impl std::fmt::Debug for SymbolRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "'{}", self.name())
    }
}

/// A fixed-length vector of handles.
#[derive(Clone, Copy)]
pub struct ArrayRef<'s> {
    obj: Object<'s>,
}

impl<'s> ArrayRef<'s> {
    pub fn handle(&self) -> Handle {
        self.obj.handle
    }

    pub fn len(&self) -> usize {
        self.obj.store.array_len(self.obj.handle)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, i: usize) -> Handle {
        self.obj.store.array_element(self.obj.handle, i)
    }

    pub fn iter(&self) -> impl Iterator<Item = Handle> + 's {
        let store = self.obj.store;
        let handle = self.obj.handle;
        let n = store.array_len(handle);
        (0..n).map(move |i| store.array_element(handle, i))
    }
}

impl std::fmt::Debug for ArrayRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, h) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{:?}", h)?;
        }
        write!(f, "]")
    }
}
