//! The typed feature-structure unifier (§3.3, §4.4): a secondary, flat
//! slot-array graph built from store frames, used to compile and construct
//! knowledge-graph schemata by unification.
//!
//! Transliterated from `examples/original_source/sling/schema/
//! feature-structure.{h,cc}`. The graph is a `Vec<Slot>` partitioned into
//! nodes, each a one-slot header (kind + payload) optionally followed by
//! content slots, exactly as the original's `Slots graph_` buffer — reusing
//! `crate::heap::Slot` rather than inventing a parallel pair type, since the
//! shape (name handle, value handle) is identical.
//!
//! A child reference from a content slot's value to another node is an
//! [`Handle::index`] handle, never a local/global ref — this is what keeps
//! the feature-structure graph from being mistaken for store data (§3.3).
//!
//! `Unify`'s `-1` sentinel (base spec §7, §8) becomes `Option<usize>::None`
//! here: idiomatic for a node-index result the caller is expected to check,
//! the same substitution `DuplicateFramePolicy` made for the codec's boolean
//! switch (`src/codec/decoder.rs`).

use std::collections::HashMap;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::handle::Handle;
use crate::heap::{Kind, Slot};
use crate::store::Store;

const HEADER_SLOTS: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
enum NodeKind {
    Forward = 0,
    Reference = 1,
    Value = 2,
    Content = 3,
    Unifying = 4,
    Trimming = 5,
}

/// Pluggable type-subsumption collaborator for `isa:` slot unification and
/// post-unification role-alias pruning (§4.4 "Type unification").
///
/// With no `TypeSystem` set, `isa:` sets unify by plain union (no
/// subsumption) and `prune_roles` is a no-op.
pub trait TypeSystem {
    /// True if `supertype` subsumes (is a more general type than) `subtype`.
    fn subsumes(&self, supertype: Handle, subtype: Handle) -> bool;

    /// Role map for `ty`: a frame whose slots map an inherited role name to
    /// its overriding name in `ty`. Nil if `ty` declares no role aliases.
    fn role_map(&self, ty: Handle) -> Handle;
}

/// A diagnostic surfaced by the unifier for conditions the base spec (§9)
/// requires callers be told about but that are not unification failures —
/// currently only the partial-unification cycle break. The crate carries no
/// logging dependency (§A), so this is returned to the caller rather than
/// written to a log sink; the CLI prints it with `eprintln!` the way the
/// teacher's own tools report non-fatal conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Diagnostic {
    /// `unify` revisited a node still mid-merge and broke the recursion by
    /// forwarding to it directly instead of unifying further (§4.4, §9
    /// "Recursive unification"). `node` is the index of the `Unifying` node
    /// the second attempt forwarded onto.
    PartialCycleBreak { node: usize },
}

/// The working graph for one compilation/unification session, plus the
/// store it imports frames from and constructs results back into (§3.3,
/// §4.4).
pub struct FeatureStructure<'s> {
    store: &'s mut Store,
    graph: Vec<Slot>,
    directory: HashMap<Handle, usize>,
    types: Option<Box<dyn TypeSystem>>,
    diagnostics: Vec<Diagnostic>,
}

impl<'s> FeatureStructure<'s> {
    /// Initializes an empty feature structure.
    pub fn new(store: &'s mut Store) -> Self {
        FeatureStructure { store, graph: Vec::new(), directory: HashMap::new(), types: None, diagnostics: Vec::new() }
    }

    /// Initializes a feature structure from a previously snapshotted
    /// [`template`](Self::template) frame.
    pub fn from_template(store: &'s mut Store, template: Handle) -> Self {
        let graph = store.frame_slots(template);
        let mut fs = FeatureStructure { store, graph, directory: HashMap::new(), types: None, diagnostics: Vec::new() };
        fs.rebuild_directory();
        fs
    }

    /// Drains and returns every diagnostic recorded since the last call
    /// (§9 "MUST...surface a diagnostic when it fires").
    pub fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.diagnostics)
    }

    pub fn set_type_system(&mut self, types: Box<dyn TypeSystem>) {
        self.types = Some(types);
    }

    // -- node allocation ---------------------------------------------------

    /// Reserves space for a new node with `num_slots` content slots and
    /// returns its node index. The header is left zeroed; callers use this
    /// only as the building block for `allocate_content_node`/
    /// `allocate_value_node`.
    pub fn allocate_node(&mut self, num_slots: usize) -> usize {
        let node = self.graph.len();
        self.graph.resize(node + HEADER_SLOTS + num_slots, Slot { name: Handle::nil(), value: Handle::nil() });
        node
    }

    pub fn allocate_content_node(&mut self, num_slots: usize) -> usize {
        let node = self.allocate_node(num_slots);
        self.set_header(node, NodeKind::Content, Handle::integer(0).unwrap());
        node
    }

    pub fn allocate_value_node(&mut self, value: Handle) -> usize {
        let node = self.allocate_node(0);
        self.set_header(node, NodeKind::Value, value);
        node
    }

    /// Appends a slot to `node`. Assumes `node` was allocated with enough
    /// spare capacity (§4.4's node layout keeps "extra unused slots" for
    /// exactly this).
    pub fn add_slot(&mut self, node: usize, name: Handle, value: Handle) {
        let size = self.node_size(node);
        self.graph[node + HEADER_SLOTS + size] = Slot { name, value };
        self.graph[node].value = Handle::integer(size as i32 + 1).unwrap();
    }

    /// Adds an empty (nil-valued) slot and returns its absolute index in the
    /// graph buffer, for callers that want to fill it in afterwards.
    pub fn add_empty_slot(&mut self, node: usize, name: Handle) -> usize {
        let index = node + HEADER_SLOTS + self.node_size(node);
        self.add_slot(node, name, Handle::nil());
        index
    }

    /// Imports `frame` as a REFERENCE node (non-destructive), reusing the
    /// existing node if the same handle was imported already. `frame` may be
    /// public or anonymous (§4.4 `add_frame` imposes no such restriction).
    pub fn add_frame(&mut self, frame: Handle) -> usize {
        assert!(frame.is_ref() && self.store.kind_of(frame) == Some(Kind::Frame), "add_frame requires a frame handle");
        self.reference(frame)
    }

    // -- node/header accessors ----------------------------------------------

    fn kind_of(&self, node: usize) -> NodeKind {
        NodeKind::try_from(self.graph[node].name.as_int().expect("node header name is always an int kind tag") as u8)
            .expect("node header kind tag is always valid")
    }

    fn header_payload(&self, node: usize) -> Handle {
        self.graph[node].value
    }

    fn set_header(&mut self, node: usize, kind: NodeKind, payload: Handle) {
        self.graph[node] = Slot { name: Handle::integer(kind as u8 as i32).unwrap(), value: payload };
    }

    /// Changes only the kind tag, preserving whatever payload is already
    /// there (used for CONTENT <-> UNIFYING/TRIMMING transitions, which
    /// reinterpret the same payload slot rather than replace it).
    fn set_kind(&mut self, node: usize, kind: NodeKind) {
        self.graph[node].name = Handle::integer(kind as u8 as i32).unwrap();
    }

    fn node_size(&self, node: usize) -> usize {
        self.header_payload(node).as_int().expect("CONTENT/UNIFYING node payload is a slot count") as usize
    }

    fn node_slot(&self, node: usize, index: usize) -> Slot {
        self.graph[node + HEADER_SLOTS + index]
    }

    fn set_node_slot(&mut self, node: usize, index: usize, slot: Slot) {
        self.graph[node + HEADER_SLOTS + index] = slot;
    }

    /// Forwards `from` to `to`: `from` becomes a redirect, read transparently
    /// by `follow`.
    fn forward(&mut self, from: usize, to: usize) {
        self.set_header(from, NodeKind::Forward, Handle::index(to as u32).expect("node index fits in 30 bits"));
    }

    /// Resolves a node index by following forwarding pointers to the end of
    /// the chain (§3.3 "Forward").
    fn follow(&self, mut node: usize) -> usize {
        while self.kind_of(node) == NodeKind::Forward {
            node = self.header_payload(node).as_index().expect("FORWARD payload is always an index") as usize;
        }
        node
    }

    // -- atomicity / emptiness -----------------------------------------------

    /// A handle is atomic (a simple value, for unification purposes) unless
    /// it is a handle to an anonymous frame (§3.3 "A feature structure can
    /// either be atomic or complex").
    fn atomic(&self, handle: Handle) -> bool {
        if !handle.is_ref() || handle.is_nil() {
            return true;
        }
        if self.store.kind_of(handle) != Some(Kind::Frame) {
            return true;
        }
        self.store.frame_slots(handle).iter().any(|s| s.name.is_id())
    }

    /// Whether `node` carries no information: an empty content/unifying
    /// node, a nil value node, a forwarded node, or a reference to a proxy
    /// or to a frame with no non-`id` slots.
    fn empty(&self, node: usize) -> bool {
        match self.kind_of(node) {
            NodeKind::Forward => true,
            NodeKind::Reference => {
                let handle = self.header_payload(node);
                if self.store.is_proxy(handle) {
                    return true;
                }
                if self.store.kind_of(handle) != Some(Kind::Frame) {
                    return false;
                }
                if self.store.frame_slots(handle).iter().any(|s| s.name.is_id()) {
                    return false;
                }
                self.store.frame_slots(handle).iter().all(|s| s.name.is_id())
            }
            NodeKind::Value => self.header_payload(node).is_nil(),
            NodeKind::Content | NodeKind::Unifying => self.node_size(node) == 0,
            NodeKind::Trimming => false,
        }
    }

    // -- importing store frames --------------------------------------------

    fn reference(&mut self, handle: Handle) -> usize {
        if let Some(&idx) = self.directory.get(&handle) {
            return idx;
        }
        let node = self.allocate_node(0);
        self.set_header(node, NodeKind::Reference, handle);
        self.directory.insert(handle, node);
        node
    }

    /// Copies a store frame's non-`id` slots into a fresh CONTENT node,
    /// referencing (not recursively copying) any non-atomic slot value, then
    /// sorts the result by rank (§4.4 "Rank order for slot names").
    fn copy_frame(&mut self, handle: Handle) -> usize {
        let slots = self.store.frame_slots(handle);
        let node = self.allocate_content_node(slots.len());
        for s in &slots {
            if s.name.is_id() {
                continue;
            }
            if self.atomic(s.value) {
                self.add_slot(node, s.name, s.value);
            } else {
                let idx = self.reference(s.value);
                self.add_slot(node, s.name, Handle::index(idx as u32).expect("node index fits in 30 bits"));
            }
        }
        self.sort_node(node);
        node
    }

    fn sort_node(&mut self, node: usize) {
        let size = self.node_size(node);
        let begin = node + HEADER_SLOTS;
        self.graph[begin..begin + size].sort_by(|a, b| {
            if a.name != b.name {
                a.name.rank().cmp(&b.name.rank())
            } else {
                a.value.rank().cmp(&b.value.rank())
            }
        });
    }

    /// Ensures `node` is a private (mutable) copy: a REFERENCE node is
    /// lazily copied into CONTENT the first time it needs to participate in
    /// a merge; CONTENT/UNIFYING nodes are already private.
    fn ensure_copy(&mut self, node: usize) -> usize {
        match self.kind_of(node) {
            NodeKind::Unifying | NodeKind::Content => node,
            NodeKind::Reference => {
                let handle = self.header_payload(node);
                let copy = self.copy_frame(handle);
                self.forward(node, copy);
                copy
            }
            other => unreachable!("ensure_copy called on a {other:?} node"),
        }
    }

    // -- unification ---------------------------------------------------------

    /// Unifies nodes `n1` and `n2`, returning the merged node's index, or
    /// `None` on failure (§4.4 "Unification algorithm", §8 commutativity and
    /// idempotence properties).
    pub fn unify(&mut self, n1: usize, n2: usize) -> Option<usize> {
        let n1 = self.follow(n1);
        let n2 = self.follow(n2);
        if n1 == n2 {
            return Some(n1);
        }
        if self.empty(n2) {
            self.forward(n2, n1);
            return Some(n1);
        }
        if self.empty(n1) {
            self.forward(n1, n2);
            return Some(n2);
        }

        let kind1 = self.kind_of(n1);
        let kind2 = self.kind_of(n2);
        if kind1 == NodeKind::Value {
            if kind2 != NodeKind::Value || self.header_payload(n1) != self.header_payload(n2) {
                return None;
            }
            self.forward(n2, n1);
            return Some(n1);
        } else if kind2 == NodeKind::Value {
            return None;
        }

        // Recursive cycle guard: a node already mid-unification forwards the
        // new attempt to itself instead of recursing further. This is a
        // deliberate partial-unification heuristic, not a full fixed-point
        // solve (§4.4, §9 "Recursive unification").
        if kind1 == NodeKind::Unifying {
            self.diagnostics.push(Diagnostic::PartialCycleBreak { node: n1 });
            self.forward(n2, n1);
            return Some(n1);
        }
        if kind2 == NodeKind::Unifying {
            self.diagnostics.push(Diagnostic::PartialCycleBreak { node: n2 });
            self.forward(n1, n2);
            return Some(n2);
        }

        let c1 = self.ensure_copy(n1);
        let c2 = self.ensure_copy(n2);
        self.set_kind(c1, NodeKind::Unifying);
        self.set_kind(c2, NodeKind::Unifying);
        let num1 = self.node_size(c1);
        let num2 = self.node_size(c2);

        let node = self.allocate_content_node(num1 + num2);
        let isa_rank = Handle::isa().rank();

        let mut s1 = 0usize;
        let mut s2 = 0usize;
        while s1 < num1 && s2 < num2 {
            let rank1 = self.node_slot(c1, s1).name.rank();
            let rank2 = self.node_slot(c2, s2).name.rank();
            if rank1 < rank2 {
                let slot = self.node_slot(c1, s1);
                s1 += 1;
                self.add_slot(node, slot.name, slot.value);
            } else if rank2 < rank1 {
                let slot = self.node_slot(c2, s2);
                s2 += 1;
                self.add_slot(node, slot.name, slot.value);
            } else if rank1 == isa_rank {
                let t1 = s1;
                let t2 = s2;
                while s1 < num1 && self.node_slot(c1, s1).name.is_isa() {
                    s1 += 1;
                }
                while s2 < num2 && self.node_slot(c2, s2).name.is_isa() {
                    s2 += 1;
                }
                let types1: Vec<Slot> = (t1..s1).map(|i| self.node_slot(c1, i)).collect();
                let types2: Vec<Slot> = (t2..s2).map(|i| self.node_slot(c2, i)).collect();
                let types = self.types.take();
                self.unify_types_with(&types1, &types2, node, types.as_deref());
                self.types = types;
            } else {
                let slot1 = self.node_slot(c1, s1);
                s1 += 1;
                let slot2 = self.node_slot(c2, s2);
                s2 += 1;
                debug_assert_eq!(slot1.name, slot2.name);

                let complex1 = slot1.value.is_index();
                let complex2 = slot2.value.is_index();
                let value = if complex1 && complex2 {
                    let i1 = slot1.value.as_index().unwrap() as usize;
                    let i2 = slot2.value.as_index().unwrap() as usize;
                    match self.unify(i1, i2) {
                        Some(r) => Handle::index(r as u32).unwrap(),
                        None => return None,
                    }
                } else if complex1 {
                    let simple = self.allocate_value_node(slot2.value);
                    let i1 = slot1.value.as_index().unwrap() as usize;
                    match self.unify(i1, simple) {
                        Some(r) => Handle::index(r as u32).unwrap(),
                        None => return None,
                    }
                } else if complex2 {
                    let simple = self.allocate_value_node(slot1.value);
                    let i2 = slot2.value.as_index().unwrap() as usize;
                    match self.unify(simple, i2) {
                        Some(r) => Handle::index(r as u32).unwrap(),
                        None => return None,
                    }
                } else if slot1.value == slot2.value {
                    slot1.value
                } else if slot1.value.is_nil() {
                    slot2.value
                } else if slot2.value.is_nil() {
                    slot1.value
                } else {
                    return None;
                };
                self.add_slot(node, slot1.name, value);
            }
        }
        while s1 < num1 {
            let slot = self.node_slot(c1, s1);
            s1 += 1;
            self.add_slot(node, slot.name, slot.value);
        }
        while s2 < num2 {
            let slot = self.node_slot(c2, s2);
            s2 += 1;
            self.add_slot(node, slot.name, slot.value);
        }

        self.forward(c1, node);
        self.forward(c2, node);
        Some(node)
    }

    fn subsumed_by(&self, ty: Handle, set: &[Slot], types: Option<&dyn TypeSystem>) -> bool {
        match types {
            Some(ts) => set.iter().any(|s| ts.subsumes(ty, s.value)),
            None => false,
        }
    }

    /// Merges two sorted `isa:` slot runs, keeping a type unless it is
    /// subsumed by a type on the other side (§4.4 "Type unification").
    fn unify_types_with(&mut self, types1: &[Slot], types2: &[Slot], result: usize, types: Option<&dyn TypeSystem>) {
        let mut i = 0usize;
        let mut j = 0usize;
        while i < types1.len() && j < types2.len() {
            let t1 = types1[i].value;
            let t2 = types2[j].value;
            if t1.raw() < t2.raw() {
                if !self.subsumed_by(t1, types2, types) {
                    self.add_slot(result, Handle::isa(), t1);
                }
                i += 1;
            } else if t2.raw() < t1.raw() {
                if !self.subsumed_by(t2, types1, types) {
                    self.add_slot(result, Handle::isa(), t2);
                }
                j += 1;
            } else {
                self.add_slot(result, Handle::isa(), t1);
                i += 1;
                j += 1;
            }
        }
        while i < types1.len() {
            let t1 = types1[i].value;
            if !self.subsumed_by(t1, types2, types) {
                self.add_slot(result, Handle::isa(), t1);
            }
            i += 1;
        }
        while j < types2.len() {
            let t2 = types2[j].value;
            if !self.subsumed_by(t2, types1, types) {
                self.add_slot(result, Handle::isa(), t2);
            }
            j += 1;
        }
    }

    /// Deletes slots whose names appear as keys in any of `node`'s types'
    /// role maps (§4.4 "Role aliasing / prune_roles"). A no-op with no
    /// `TypeSystem` set.
    fn prune_roles(&mut self, node: usize) {
        let types = self.types.take();
        if let Some(types) = &types {
            self.prune_roles_with(node, types.as_ref());
        }
        self.types = types;
    }

    fn prune_roles_with(&mut self, node: usize, types: &dyn TypeSystem) {
        let isa_rank = Handle::isa().rank();
        let size = self.node_size(node);
        let mut deleted = vec![false; size];
        let mut i = 0usize;
        while i < size {
            let rank = self.node_slot(node, i).name.rank();
            if rank < isa_rank {
                i += 1;
                continue;
            }
            if rank > isa_rank {
                break;
            }
            let ty = self.node_slot(node, i).value;
            i += 1;
            let rolemap = types.role_map(ty);
            if rolemap.is_nil() {
                continue;
            }
            let role_slots = self.store.frame_slots(rolemap);
            if role_slots.is_empty() {
                continue;
            }
            // Merge-run the role map (sorted by rank, like the node itself)
            // against the remaining slots, marking role-name matches deleted.
            let mut t = i;
            let mut r = 0usize;
            while t < size && r < role_slots.len() {
                let t_rank = self.node_slot(node, t).name.rank();
                let r_rank = role_slots[r].name.rank();
                if t_rank < r_rank {
                    t += 1;
                } else if t_rank > r_rank {
                    r += 1;
                } else {
                    deleted[t] = true;
                    t += 1;
                }
            }
        }
        if deleted.iter().any(|&d| d) {
            let mut kept = Vec::with_capacity(size);
            for idx in 0..size {
                if !deleted[idx] {
                    kept.push(self.node_slot(node, idx));
                }
            }
            for (idx, slot) in kept.iter().enumerate() {
                self.set_node_slot(node, idx, *slot);
            }
            self.graph[node].value = Handle::integer(kept.len() as i32).unwrap();
        }
    }

    // -- construction --------------------------------------------------------

    /// Reifies the graph rooted at `node` back into store frames. In
    /// destructive mode, a CONTENT node that was copied from an imported
    /// REFERENCE overwrites that original frame rather than allocating a new
    /// one (§4.4 "Construct").
    pub fn construct(&mut self, node: usize, destructive: bool) -> Handle {
        // `construct_node` stores placeholder handles straight into `self.graph`
        // (an external buffer the GC doesn't scan) before recursing into
        // children that allocate further frames; a collection triggered by one
        // of those nested allocations would leave an already-placed placeholder
        // stale. The graph is rebuilt per construction rather than kept as a
        // long-lived root, so the whole walk instead runs with collection
        // deferred (§5 point 3), the same trade the teacher's own short
        // raw-pointer iteration scopes make.
        self.store.suspend_gc();
        let result = if destructive {
            let mut origin: HashMap<usize, Handle> = HashMap::new();
            for (&handle, &idx) in self.directory.iter() {
                origin.insert(self.follow(idx), handle);
            }
            self.construct_node(node, Some(&origin))
        } else {
            self.construct_node(node, None)
        };
        self.store.resume_gc();
        result
    }

    fn construct_node(&mut self, node: usize, origin: Option<&HashMap<usize, Handle>>) -> Handle {
        let node = self.follow(node);
        match self.kind_of(node) {
            NodeKind::Reference | NodeKind::Value => return self.header_payload(node),
            NodeKind::Content => {}
            other => unreachable!("construct_node on a {other:?} node"),
        }

        self.prune_roles(node);

        let original = origin.and_then(|m| m.get(&node)).copied();
        let size = self.node_size(node);
        let placeholder = match original {
            Some(h) => h,
            None => self.store.allocate_frame(&vec![Slot { name: Handle::nil(), value: Handle::nil() }; size]),
        };
        // Mark this node as already constructed before recursing into its
        // children, so a self-referential content node (a genuine cycle,
        // not the transient UNIFYING-break kind) terminates rather than
        // looping (§4.4, §9 "Cyclic heap graphs").
        self.set_header(node, NodeKind::Reference, placeholder);

        let mut slots = Vec::with_capacity(size);
        for i in 0..size {
            let mut slot = self.node_slot(node, i);
            if slot.value.is_index() {
                slot.value = self.construct_node(slot.value.as_index().unwrap() as usize, origin);
            }
            slots.push(slot);
        }
        self.store.update_frame(placeholder, &slots);
        placeholder
    }

    // -- compaction / trimming -----------------------------------------------

    /// Copies every node reachable from `root` into a fresh buffer in DFS
    /// order, dropping unreferenced nodes, and returns the new root index
    /// (always zero, per §4.4 "Compact").
    pub fn compact(&mut self, root: usize) -> usize {
        let mut target: Vec<Slot> = Vec::new();
        let new_root = self.transfer(root, &mut target);
        self.graph = target;
        self.rebuild_directory();
        #[cfg(feature = "strict")]
        self.assert_directory_consistent();
        new_root
    }

    /// `strict`-only: every `directory` entry must point at a live REFERENCE
    /// node carrying exactly that handle (SPEC_FULL §A "asserting the
    /// feature-structure directory is consistent after `compact`").
    #[cfg(feature = "strict")]
    fn assert_directory_consistent(&self) {
        for (&handle, &node) in self.directory.iter() {
            assert_eq!(self.kind_of(node), NodeKind::Reference, "directory entry for {handle:?} does not point at a REFERENCE node");
            assert_eq!(self.header_payload(node), handle, "directory entry for {handle:?} points at a node for a different handle");
        }
    }

    fn transfer(&mut self, node: usize, target: &mut Vec<Slot>) -> usize {
        let node = self.follow(node);
        let dest = target.len();
        match self.kind_of(node) {
            NodeKind::Reference => {
                let payload = self.header_payload(node);
                if payload.is_index() {
                    return payload.as_index().unwrap() as usize;
                }
                target.push(Slot { name: Handle::integer(NodeKind::Reference as u8 as i32).unwrap(), value: payload });
                self.set_header(node, NodeKind::Reference, Handle::index(dest as u32).unwrap());
            }
            NodeKind::Value => {
                let payload = self.header_payload(node);
                target.push(Slot { name: Handle::integer(NodeKind::Value as u8 as i32).unwrap(), value: payload });
                self.set_header(node, NodeKind::Reference, Handle::index(dest as u32).unwrap());
            }
            NodeKind::Content => {
                let size = self.node_size(node);
                target.push(Slot {
                    name: Handle::integer(NodeKind::Content as u8 as i32).unwrap(),
                    value: Handle::integer(size as i32).unwrap(),
                });
                let t = target.len();
                target.resize(t + size, Slot { name: Handle::nil(), value: Handle::nil() });
                self.set_header(node, NodeKind::Reference, Handle::index(dest as u32).unwrap());
                for i in 0..size {
                    let slot = self.node_slot(node, i);
                    if slot.value.is_index() {
                        let idx = slot.value.as_index().unwrap() as usize;
                        let v = self.transfer(idx, target);
                        target[t + i] = Slot { name: slot.name, value: Handle::index(v as u32).unwrap() };
                    } else {
                        target[t + i] = slot;
                    }
                }
            }
            other => unreachable!("transfer on a {other:?} node"),
        }
        dest
    }

    fn rebuild_directory(&mut self) {
        self.directory.clear();
        let mut node = 0usize;
        while node < self.graph.len() {
            match self.kind_of(node) {
                NodeKind::Reference => {
                    let payload = self.header_payload(node);
                    self.directory.insert(payload, node);
                    node += HEADER_SLOTS;
                }
                NodeKind::Content => {
                    node += HEADER_SLOTS + self.node_size(node);
                }
                _ => node += HEADER_SLOTS,
            }
        }
    }

    /// Recursively removes nodes whose only remaining slots are `isa:`
    /// (empty after role-pruning), along with slot edges pointing at them.
    /// Returns whether `node` itself ended up empty (§4.4 "Compact / Trim").
    pub fn trim(&mut self, node: usize) -> bool {
        let node = self.follow(node);
        if self.kind_of(node) != NodeKind::Content {
            return false;
        }
        self.set_kind(node, NodeKind::Trimming);

        let size = self.node_size(node);
        let begin = node + HEADER_SLOTS;
        let mut next = begin;
        let mut empty = true;
        for s in 0..size {
            let slot = self.graph[begin + s];
            let mut prune = false;
            if !slot.name.is_isa() {
                if slot.value.is_index() {
                    prune = self.trim(slot.value.as_index().unwrap() as usize);
                }
                if !prune {
                    empty = false;
                }
            }
            if !prune {
                self.graph[next] = slot;
                next += 1;
            }
        }

        self.set_kind(node, NodeKind::Content);
        self.graph[node].value = Handle::integer((next - begin) as i32).unwrap();
        empty
    }

    /// Snapshots the current buffer as a raw frame, for caching compiled
    /// schemata (§4.4 "template"). Reload with [`from_template`](Self::from_template).
    pub fn template(&mut self) -> Handle {
        self.store.allocate_frame(&self.graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreOptions;

    fn frame_from(store: &mut Store, slots: &[(Handle, Handle)]) -> Handle {
        let slots: Vec<Slot> = slots.iter().map(|&(name, value)| Slot { name, value }).collect();
        store.allocate_frame(&slots)
    }

    #[test]
    fn unify_simple_atomic_values_succeeds_when_equal() {
        let mut store = Store::new(StoreOptions::default());
        let a = frame_from(&mut store, &[(Handle::isa(), Handle::integer(1).unwrap())]);
        let b = frame_from(&mut store, &[(Handle::isa(), Handle::integer(1).unwrap())]);
        let mut fs = FeatureStructure::new(&mut store);
        let n1 = fs.add_frame(a);
        let n2 = fs.add_frame(b);
        let unified = fs.unify(n1, n2).expect("equal values should unify");
        let handle = fs.construct(unified, false);
        assert_eq!(store.frame_size(handle), 1);
    }

    #[test]
    fn unify_with_an_empty_node_returns_the_other_node() {
        let mut store = Store::new(StoreOptions::default());
        let a = frame_from(&mut store, &[(Handle::isa(), Handle::integer(1).unwrap())]);
        let mut fs = FeatureStructure::new(&mut store);
        let n1 = fs.add_frame(a);
        let empty_node = fs.allocate_content_node(0);
        let unified = fs.unify(n1, empty_node).expect("unify with empty should succeed");
        let handle = fs.construct(unified, false);
        assert_eq!(store.frame_slot(handle, 0).value.as_int(), Some(1));
    }

    #[test]
    fn unify_merges_disjoint_slots() {
        let mut store = Store::new(StoreOptions::default());
        let a = frame_from(&mut store, &[(Handle::isa(), Handle::integer(7).unwrap())]);
        let b = frame_from(&mut store, &[(Handle::isa(), Handle::integer(9).unwrap())]);
        // Use distinct non-isa names so neither isa-merge nor value-merge
        // collapses them: wheels vs color, as in the base spec's scenario.
        let wheels = Handle::integer(100).unwrap(); // stand-in slot name handle
        let color = Handle::integer(200).unwrap();
        let a = store.add(a, wheels, Handle::integer(4).unwrap());
        let b = store.add(b, color, Handle::integer(5).unwrap());

        let mut fs = FeatureStructure::new(&mut store);
        let n1 = fs.add_frame(a);
        let n2 = fs.add_frame(b);
        let unified = fs.unify(n1, n2).expect("disjoint slots should unify");
        let handle = fs.construct(unified, false);

        let frame = crate::object::Object::new(&store, handle).as_frame().unwrap();
        assert_eq!(frame.get_int(wheels), Some(4));
        assert_eq!(frame.get_int(color), Some(5));
    }

    #[test]
    fn unification_failure_on_conflicting_atoms_returns_none() {
        let mut store = Store::new(StoreOptions::default());
        let name = Handle::integer(42).unwrap();
        let a = frame_from(&mut store, &[(name, Handle::integer(1).unwrap())]);
        let b = frame_from(&mut store, &[(name, Handle::integer(2).unwrap())]);
        let mut fs = FeatureStructure::new(&mut store);
        let n1 = fs.add_frame(a);
        let n2 = fs.add_frame(b);
        assert!(fs.unify(n1, n2).is_none());
    }

    #[test]
    fn unification_with_types_keeps_the_more_specific_subtype() {
        struct VehicleTypes;
        impl TypeSystem for VehicleTypes {
            fn subsumes(&self, supertype: Handle, subtype: Handle) -> bool {
                supertype.as_int() == Some(1) && subtype.as_int() == Some(2)
            }
            fn role_map(&self, _ty: Handle) -> Handle {
                Handle::nil()
            }
        }

        let mut store = Store::new(StoreOptions::default());
        let vehicle = Handle::integer(1).unwrap(); // stand-in for a `Vehicle` type handle
        let car = Handle::integer(2).unwrap(); // stand-in for a `Car` type handle
        let wheels = Handle::integer(100).unwrap();
        let color = Handle::integer(200).unwrap();

        let a = frame_from(&mut store, &[(Handle::isa(), vehicle), (wheels, Handle::integer(4).unwrap())]);
        let b = frame_from(&mut store, &[(Handle::isa(), car), (color, Handle::integer(9).unwrap())]);

        let mut fs = FeatureStructure::new(&mut store);
        fs.set_type_system(Box::new(VehicleTypes));
        let n1 = fs.add_frame(a);
        let n2 = fs.add_frame(b);
        let unified = fs.unify(n1, n2).unwrap();
        let handle = fs.construct(unified, false);

        let frame = crate::object::Object::new(&store, handle).as_frame().unwrap();
        let types: Vec<Handle> = frame.slots().filter(|(n, _)| n.is_isa()).map(|(_, v)| v).collect();
        assert_eq!(types, vec![car], "Vehicle must be dropped because Car subsumes it");
        assert_eq!(frame.get_int(wheels), Some(4));
        assert_eq!(frame.get_int(color), Some(9));
    }

    #[test]
    fn partial_cycle_terminates_via_the_unifying_mark() {
        let mut store = Store::new(StoreOptions::default());
        let mate = Handle::integer(300).unwrap();

        // A = {mate: B}, B = {mate: A}.
        let a_sym = store.lookup(b"A");
        let b_sym = store.lookup(b"B");
        let a = store.allocate_frame(&[Slot { name: Handle::id(), value: a_sym }]);
        let b = store.allocate_frame(&[Slot { name: Handle::id(), value: b_sym }, Slot { name: mate, value: a }]);
        store.set(a, mate, b);

        let mut fs = FeatureStructure::new(&mut store);
        let n1 = fs.add_frame(a);

        // A fresh anonymous {mate: {mate: self}}.
        let inner = fs.allocate_content_node(1);
        let outer = fs.allocate_content_node(1);
        fs.add_slot(inner, mate, Handle::index(outer as u32).unwrap());
        fs.add_slot(outer, mate, Handle::index(inner as u32).unwrap());

        // Must terminate (not loop forever) and produce a node.
        let unified = fs.unify(n1, outer);
        assert!(unified.is_some());
    }

    #[test]
    fn compact_drops_unreferenced_nodes_and_preserves_shape() {
        let mut store = Store::new(StoreOptions::default());
        let name = Handle::integer(9).unwrap();
        let a = frame_from(&mut store, &[(name, Handle::integer(5).unwrap())]);
        let mut fs = FeatureStructure::new(&mut store);
        let n1 = fs.add_frame(a);
        // Allocate an orphan node that nothing points to.
        let _orphan = fs.allocate_content_node(0);
        let root = fs.compact(n1);
        let handle = fs.construct(root, false);
        assert_eq!(store.frame_slot(handle, 0).value.as_int(), Some(5));
    }

    #[test]
    fn trim_removes_isa_only_subnodes() {
        let mut store = Store::new(StoreOptions::default());
        let mut fs = FeatureStructure::new(&mut store);
        let empty_sub = fs.allocate_content_node(1);
        fs.add_slot(empty_sub, Handle::isa(), Handle::integer(1).unwrap());
        let root = fs.allocate_content_node(1);
        let role = Handle::integer(50).unwrap();
        fs.add_slot(root, role, Handle::index(empty_sub as u32).unwrap());

        let was_empty = fs.trim(root);
        // The sub-node is isa-only (empty), so its slot edge should be
        // removed from root, and root itself becomes empty.
        assert!(was_empty);
        let handle = fs.construct(root, false);
        assert_eq!(store.frame_size(handle), 0);
    }

    #[test]
    fn partial_cycle_break_is_recorded_as_a_diagnostic() {
        let mut store = Store::new(StoreOptions::default());
        let mate = Handle::integer(301).unwrap();
        let mut fs = FeatureStructure::new(&mut store);

        let left_inner = fs.allocate_content_node(1);
        let left_outer = fs.allocate_content_node(1);
        fs.add_slot(left_inner, mate, Handle::index(left_outer as u32).unwrap());
        fs.add_slot(left_outer, mate, Handle::index(left_inner as u32).unwrap());

        let right_inner = fs.allocate_content_node(1);
        let right_outer = fs.allocate_content_node(1);
        fs.add_slot(right_inner, mate, Handle::index(right_outer as u32).unwrap());
        fs.add_slot(right_outer, mate, Handle::index(right_inner as u32).unwrap());

        assert!(fs.unify(left_outer, right_outer).is_some());
        let diagnostics = fs.take_diagnostics();
        assert!(!diagnostics.is_empty(), "the cycle break must surface a diagnostic");
        assert!(fs.take_diagnostics().is_empty(), "take_diagnostics drains the buffer");
    }

    #[test]
    fn template_round_trips_through_from_template() {
        let mut store = Store::new(StoreOptions::default());
        let a = frame_from(&mut store, &[(Handle::isa(), Handle::integer(3).unwrap())]);
        let mut fs = FeatureStructure::new(&mut store);
        let n1 = fs.add_frame(a);
        let _ = n1;
        let snapshot = fs.template();

        let mut fs2 = FeatureStructure::from_template(&mut store, snapshot);
        // The reloaded graph's node 0 is the same reference node that was
        // templated.
        let handle = fs2.construct(0, false);
        assert_eq!(store.frame_slot(handle, 0).value.as_int(), Some(3));
    }
}
