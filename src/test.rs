//! Cross-module integration scenarios, colocated at the crate root the way
//! the teacher keeps its own top-level `test.rs`. Each test exercises the
//! store, codec and unifier together rather than one module in isolation.

use crate::codec::decoder::{Decoder, DuplicateFramePolicy};
use crate::codec::encoder::Encoder;
use crate::heap::Slot;
use crate::store::{Store, StoreOptions};
use crate::unify::FeatureStructure;
use crate::Handle;

fn new_store() -> Store {
    Store::new(StoreOptions::default())
}

#[test]
fn proxy_is_replaced_in_place_once_the_real_frame_arrives() {
    let mut store = new_store();
    let name = store.lookup(b"Widget");

    // Forward reference through a bare id-only proxy frame.
    let proxy = store.allocate_frame(&[Slot { name: Handle::id(), value: name }]);
    let holder = store.allocate_frame(&[Slot { name: Handle::isa(), value: proxy }]);

    let real = store.allocate_frame(&[
        Slot { name: Handle::id(), value: name },
        Slot { name: Handle::isa(), value: Handle::integer(7).unwrap() },
    ]);

    assert_eq!(store.symbol_value(name), real);
    let seen_through_holder = store.frame_slot(holder, 0).value;
    assert_eq!(store.frame_size(seen_through_holder), 2);
    assert_eq!(store.frame_slot(seen_through_holder, 1).value.as_int(), Some(7));
}

#[test]
fn cyclic_graph_round_trips_through_the_wire_codec() {
    let mut store = new_store();
    let a_name = store.lookup(b"A");
    let b_name = store.lookup(b"B");

    let a = store.allocate_frame(&[Slot { name: Handle::id(), value: a_name }]);
    let b = store.allocate_frame(&[Slot { name: Handle::id(), value: b_name }, Slot { name: Handle::isa(), value: a }]);
    store.set(a, Handle::isa(), b);

    let mut bytes = Vec::new();
    Encoder::new(&store).encode(&mut bytes, a).unwrap();

    let mut target = new_store();
    let mut decoder = Decoder::new(&mut target, DuplicateFramePolicy::AlwaysDecode);
    let decoded_a = decoder.decode(&mut &bytes[..]).unwrap();

    let isa_slot = target.frame_slots(decoded_a).into_iter().find(|s| s.name.is_isa()).unwrap();
    let decoded_b = isa_slot.value;
    assert_eq!(target.frame_size(decoded_b), 2);
    let back_to_a = target
        .frame_slots(decoded_b)
        .into_iter()
        .find(|s| s.name.is_isa())
        .unwrap()
        .value;
    assert_eq!(back_to_a, decoded_a, "the cycle must resolve back to the same handle");
}

#[test]
fn unreachable_frames_are_reclaimed_while_a_rooted_one_survives_gc() {
    let mut store = Store::new(StoreOptions { initial_heap_capacity: 32, ..StoreOptions::default() });
    let mut root = None;
    for i in 0..200 {
        let f = store.allocate_frame(&[Slot { name: Handle::isa(), value: Handle::integer(i).unwrap() }]);
        if i == 100 {
            // Registered the moment it's created, so no collection triggered
            // by the remaining allocations below can reclaim it first.
            root = Some(store.add_root(crate::store::StoreRoot::Cell(f)));
        }
    }
    let root = root.unwrap();
    let current = match &*root.borrow() {
        crate::store::StoreRoot::Cell(h) => *h,
        _ => unreachable!(),
    };
    assert_eq!(store.frame_slot(current, 0).value.as_int(), Some(100));
}

#[test]
fn typed_unification_prefers_the_more_specific_subtype_and_merges_roles() {
    struct Types;
    impl crate::unify::TypeSystem for Types {
        fn subsumes(&self, supertype: Handle, subtype: Handle) -> bool {
            supertype.as_int() == Some(1) && subtype.as_int() == Some(2)
        }
        fn role_map(&self, _ty: Handle) -> Handle {
            Handle::nil()
        }
    }

    let mut store = new_store();
    let vehicle = Handle::integer(1).unwrap();
    let car = Handle::integer(2).unwrap();
    let wheels = Handle::integer(100).unwrap();
    let color = Handle::integer(200).unwrap();

    let a = store.allocate_frame(&[Slot { name: Handle::isa(), value: vehicle }, Slot { name: wheels, value: Handle::integer(4).unwrap() }]);
    let b = store.allocate_frame(&[Slot { name: Handle::isa(), value: car }, Slot { name: color, value: Handle::integer(9).unwrap() }]);

    let mut fs = FeatureStructure::new(&mut store);
    fs.set_type_system(Box::new(Types));
    let n1 = fs.add_frame(a);
    let n2 = fs.add_frame(b);
    let unified = fs.unify(n1, n2).expect("compatible types must unify");
    let result = fs.construct(unified, false);

    let frame = crate::object::Object::new(&store, result).as_frame().unwrap();
    assert_eq!(frame.get_int(wheels), Some(4));
    assert_eq!(frame.get_int(color), Some(9));
    let types: Vec<Handle> = frame.slots().filter(|(n, _)| n.is_isa()).map(|(_, v)| v).collect();
    assert_eq!(types, vec![car]);
}

#[test]
fn unification_fails_on_conflicting_atomic_slot_values() {
    let mut store = new_store();
    let speed = Handle::integer(300).unwrap();
    let a = store.allocate_frame(&[Slot { name: speed, value: Handle::integer(10).unwrap() }]);
    let b = store.allocate_frame(&[Slot { name: speed, value: Handle::integer(20).unwrap() }]);

    let mut fs = FeatureStructure::new(&mut store);
    let n1 = fs.add_frame(a);
    let n2 = fs.add_frame(b);
    assert!(fs.unify(n1, n2).is_none());
}

#[test]
fn partial_cycle_between_two_structures_still_terminates() {
    let mate = Handle::integer(400).unwrap();
    let mut store = new_store();
    let mut fs = FeatureStructure::new(&mut store);

    let left_inner = fs.allocate_content_node(1);
    let left_outer = fs.allocate_content_node(1);
    fs.add_slot(left_inner, mate, Handle::index(left_outer as u32).unwrap());
    fs.add_slot(left_outer, mate, Handle::index(left_inner as u32).unwrap());

    let right_inner = fs.allocate_content_node(1);
    let right_outer = fs.allocate_content_node(1);
    fs.add_slot(right_inner, mate, Handle::index(right_outer as u32).unwrap());
    fs.add_slot(right_outer, mate, Handle::index(right_inner as u32).unwrap());

    // Unifying two independently-cyclic structures must not loop forever;
    // the UNIFYING mark breaks the recursion once either side revisits
    // itself mid-merge.
    let unified = fs.unify(left_outer, right_outer);
    assert!(unified.is_some());
}
