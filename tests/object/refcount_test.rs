/*!
 * Reference Counting Tests
 * Duplicate/close bookkeeping and destructor timing
 */

use ntweb_kernel::{Handle, ObjectManager, ObjectType};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[test]
fn test_set_get_close() {
    let om = ObjectManager::new();
    let process = om.set_object((), ObjectType::PROCESS, Handle::NULL);

    let h = om.set_object(String::from("X"), ObjectType::FILE, process);
    assert!(!h.is_null());
    assert_eq!(om.get_object::<String>(h).as_deref().map(String::as_str), Some("X"));

    assert_eq!(om.close_handle(h), Ok(true));
    assert!(om.get_object::<String>(h).is_none());
    assert!(om.owned_handles(process).is_empty());
}

#[test]
fn test_duplicate_returns_same_value() {
    let om = ObjectManager::new();
    let h = om.set_object(7u32, ObjectType::FILE, Handle::NULL);

    assert_eq!(om.duplicate_handle(h), Some(h));
    assert_eq!(om.ref_count(h), Some(2));
    assert_eq!(om.duplicate_handle(Handle(4242)), None);
}

#[test]
fn test_close_unknown_handle_is_false() {
    let om = ObjectManager::new();
    assert_eq!(om.close_handle(Handle(12345)), Ok(false));
}

#[test]
fn test_destructor_runs_once_on_final_close() {
    let om = ObjectManager::new();
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    let h = om.set_object_with_destructor(Arc::new(5u8), ObjectType::FILE, Handle::NULL, move |value| {
        assert_eq!(*value, 5);
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    om.duplicate_handle(h);
    assert_eq!(om.close_handle(h), Ok(true));
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert_eq!(om.close_handle(h), Ok(true));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(om.close_handle(h), Ok(false));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn test_failing_destructor_propagates() {
    let om = ObjectManager::new();
    let h = om.set_object_with_destructor(Arc::new(()), ObjectType::FILE, Handle::NULL, |_| {
        anyhow::bail!("device busy")
    });

    let err = om.destroy_handle(h).unwrap_err();
    assert!(err.to_string().contains("device busy"));
    assert!(!om.contains(h));
}

proptest! {
    #[test]
    fn prop_final_close_destroys(n in 1usize..32) {
        let om = ObjectManager::new();
        let h = om.set_object(0u64, ObjectType::FILE, Handle::NULL);
        for _ in 1..n {
            prop_assert_eq!(om.duplicate_handle(h), Some(h));
        }
        for _ in 1..n {
            prop_assert_eq!(om.close_handle(h), Ok(true));
            prop_assert!(om.get_object::<u64>(h).is_some());
        }
        prop_assert_eq!(om.close_handle(h), Ok(true));
        prop_assert!(om.get_object::<u64>(h).is_none());
        prop_assert!(om.is_empty());
    }
}
