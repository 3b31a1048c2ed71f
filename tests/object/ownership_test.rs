/*!
 * Ownership Forest Tests
 * Cascading destruction, reparenting and cycle refusal
 */

use ntweb_kernel::{Handle, ObjectManager, ObjectType};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;

/// Build a forest where node `i` is owned by `parents[i]` (an earlier node) or the root
fn build_forest(om: &ObjectManager, parents: &[Option<usize>]) -> Vec<Handle> {
    let mut handles = Vec::with_capacity(parents.len());
    for (i, parent) in parents.iter().enumerate() {
        let owner = parent
            .filter(|p| *p < i)
            .map(|p| handles[p])
            .unwrap_or(Handle::NULL);
        handles.push(om.set_object(i, ObjectType::FILE, owner));
    }
    handles
}

fn descendants(om: &ObjectManager, root: Handle) -> HashSet<Handle> {
    let mut found = HashSet::new();
    let mut stack = vec![root];
    while let Some(h) = stack.pop() {
        if found.insert(h) {
            stack.extend(om.owned_handles(h));
        }
    }
    found
}

#[test]
fn test_destroy_cascades_depth_first() {
    let om = ObjectManager::new();
    let process = om.set_object((), ObjectType::PROCESS, Handle::NULL);
    let file = om.set_object(1u8, ObjectType::FILE, process);
    let child = om.set_object(2u8, ObjectType::FILE, file);
    let other = om.set_object(3u8, ObjectType::FILE, Handle::NULL);

    assert!(om.is_owned_by(child, process));
    assert_eq!(om.destroy_handle(process), Ok(true));

    assert!(!om.contains(process));
    assert!(!om.contains(file));
    assert!(!om.contains(child));
    assert!(om.contains(other));
}

#[test]
fn test_deep_chain_destroys_leaf_first() {
    const DEPTH: usize = 200_000;
    let om = ObjectManager::new();
    let order = Arc::new(Mutex::new(Vec::with_capacity(DEPTH)));

    let mut chain = Vec::with_capacity(DEPTH);
    let mut owner = Handle::NULL;
    for depth in 0..DEPTH {
        let order = Arc::clone(&order);
        owner = om.set_object_with_destructor(Arc::new(depth), ObjectType::FILE, owner, move |d: Arc<usize>| {
            order.lock().push(*d);
            Ok(())
        });
        chain.push(owner);
    }

    assert_eq!(om.destroy_handle(chain[0]), Ok(true));
    assert!(om.is_empty());
    let order = order.lock();
    assert_eq!(order.len(), DEPTH);
    assert!(order.windows(2).all(|pair| pair[0] > pair[1]));
}

#[test]
fn test_reparent_moves_between_owned_sets() {
    let om = ObjectManager::new();
    let a = om.set_object((), ObjectType::PROCESS, Handle::NULL);
    let b = om.set_object((), ObjectType::PROCESS, Handle::NULL);
    let h = om.set_object(0u8, ObjectType::FILE, a);

    assert!(om.set_handle_owner(h, b));
    assert_eq!(om.owner(h), Some(b));
    assert!(om.owned_handles(b).contains(&h));
    assert!(!om.owned_handles(a).contains(&h));

    assert_eq!(om.destroy_handle(a), Ok(true));
    assert!(om.contains(h));
}

#[test]
fn test_reparent_refuses_cycles_and_unknown_handles() {
    let om = ObjectManager::new();
    let a = om.set_object((), ObjectType::FILE, Handle::NULL);
    let b = om.set_object((), ObjectType::FILE, a);

    assert!(!om.set_handle_owner(a, b));
    assert!(!om.set_handle_owner(a, a));
    assert!(!om.set_handle_owner(Handle(999), a));
    assert!(!om.set_handle_owner(a, Handle(999)));
    assert!(om.set_handle_owner(b, Handle::NULL));
    assert_eq!(om.owner(b), Some(Handle::NULL));
}

proptest! {
    #[test]
    fn prop_owner_chains_end_at_root(parents in prop::collection::vec(prop::option::of(0usize..40), 1..40)) {
        let om = ObjectManager::new();
        let handles = build_forest(&om, &parents);
        for h in &handles {
            let mut cursor = *h;
            let mut steps = 0;
            while !cursor.is_null() {
                cursor = om.owner(cursor).unwrap_or(Handle::NULL);
                steps += 1;
                prop_assert!(steps <= handles.len());
            }
        }
    }

    #[test]
    fn prop_destroy_removes_exactly_the_subtree(
        parents in prop::collection::vec(prop::option::of(0usize..40), 1..40),
        pick in any::<prop::sample::Index>(),
    ) {
        let om = ObjectManager::new();
        let handles = build_forest(&om, &parents);
        let target = handles[pick.index(handles.len())];
        let doomed = descendants(&om, target);

        prop_assert_eq!(om.destroy_handle(target), Ok(true));
        for h in &handles {
            prop_assert_eq!(om.contains(*h), !doomed.contains(h));
        }
    }
}
