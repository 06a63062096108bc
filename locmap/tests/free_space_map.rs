mod common;

use std::collections::BTreeMap;

use common::{free_space_map, memory_store, SEED};
use locmap::{
    free_space_map::{normalize, required_class, MAX_PAGE_INDEX},
    FreeSpaceMap, FreeSpaceMapError, PAGE_SIZE,
};
use rand::Rng as _;

#[test]
fn find_single_page() {
    let store = memory_store();
    let map = free_space_map(&store, "fsm");
    store
        .execute_inside_atomic_operation(|op| {
            map.update_page_free_space(op, 3, 512)?;
            assert_eq!(map.find_free_page(op, 259)?, Some(3));
            Ok(())
        })
        .unwrap();
}

#[test]
fn find_sparse_page() {
    let store = memory_store();
    let map = free_space_map(&store, "fsm");
    store
        .execute_inside_atomic_operation(|op| {
            map.update_page_free_space(op, 128_956, 512)?;
            assert_eq!(map.find_free_page(op, 259)?, Some(128_956));
            Ok(())
        })
        .unwrap();

    // the first level plus the second-level pages up to the one covering the index.
    let file = map.file_id().unwrap();
    let op = store.begin_atomic_operation();
    assert_eq!(op.filled_up_to(file).unwrap(), 128_956 / 2048 + 2);
}

#[test]
fn find_lowest_qualifying_page() {
    let store = memory_store();
    let map = free_space_map(&store, "fsm");
    store
        .execute_inside_atomic_operation(|op| {
            map.update_page_free_space(op, 3, 1024)?;
            map.update_page_free_space(op, 4, 2029)?;
            map.update_page_free_space(op, 5, 3029)?;
            Ok(())
        })
        .unwrap();

    let op = store.begin_atomic_operation();
    assert_eq!(map.find_free_page(&op, 1024).unwrap(), Some(4));
    assert_eq!(map.find_free_page(&op, 2050).unwrap(), Some(5));
    assert_eq!(map.find_free_page(&op, 10).unwrap(), Some(3));
    assert_eq!(map.find_free_page(&op, 3100).unwrap(), None);
}

#[test]
fn updates_replace_previous_values() {
    let store = memory_store();
    let map = free_space_map(&store, "fsm");
    let mut op = store.begin_atomic_operation();
    map.update_page_free_space(&mut op, 1, 3000).unwrap();
    map.update_page_free_space(&mut op, 9000, 3000).unwrap();
    assert_eq!(map.find_free_page(&op, 2000).unwrap(), Some(1));

    map.update_page_free_space(&mut op, 1, 100).unwrap();
    assert_eq!(map.find_free_page(&op, 2000).unwrap(), Some(9000));
    assert_eq!(map.find_free_page(&op, 50).unwrap(), Some(1));

    map.update_page_free_space(&mut op, 9000, 0).unwrap();
    assert_eq!(map.find_free_page(&op, 2000).unwrap(), None);
}

#[test]
fn empty_map_finds_nothing() {
    let store = memory_store();
    let map = free_space_map(&store, "fsm");
    let op = store.begin_atomic_operation();
    assert_eq!(map.find_free_page(&op, 100).unwrap(), None);
    assert_eq!(map.find_free_page(&op, 0).unwrap(), None);
}

#[test]
fn exists_after_create_and_not_after_delete() {
    let store = memory_store();
    let mut map = FreeSpaceMap::new("fsm");
    let op = store.begin_atomic_operation();
    assert!(!map.exists(&op).unwrap());
    drop(op);

    store
        .execute_inside_atomic_operation(|op| {
            map.create(op)?;
            assert!(map.exists(op)?);
            Ok(())
        })
        .unwrap();

    store
        .execute_inside_atomic_operation(|op| {
            assert!(map.exists(op)?);
            map.delete(op)?;
            assert!(!map.exists(op)?);
            Ok(())
        })
        .unwrap();

    let op = store.begin_atomic_operation();
    assert!(!map.exists(&op).unwrap());
    assert!(!store.file_exists("fsm.fsm").unwrap());
}

#[test]
fn open_preserves_data() {
    let store = memory_store();
    let map = free_space_map(&store, "fsm");
    store
        .execute_inside_atomic_operation(|op| {
            map.update_page_free_space(op, 7, 2048)?;
            map.update_page_free_space(op, 12, PAGE_SIZE as u32)
        })
        .unwrap();

    let mut reopened = FreeSpaceMap::new("fsm");
    store
        .execute_inside_atomic_operation(|op| {
            reopened.open(op)?;
            assert_eq!(reopened.find_free_page(op, 3000)?, Some(12));
            assert_eq!(reopened.find_free_page(op, 1500)?, Some(7));
            assert_eq!(reopened.find_free_page(op, PAGE_SIZE as u32 - 1)?, None);
            Ok(())
        })
        .unwrap();
}

#[test]
fn rename_preserves_data() {
    let store = memory_store();
    let mut map = free_space_map(&store, "fsm");
    store
        .execute_inside_atomic_operation(|op| map.update_page_free_space(op, 10, 1500))
        .unwrap();

    map.rename(&store, "renamed").unwrap();
    assert_eq!(map.full_name(), "renamed.fsm");
    assert!(store.file_exists("renamed.fsm").unwrap());
    assert!(!store.file_exists("fsm.fsm").unwrap());

    let op = store.begin_atomic_operation();
    assert_eq!(map.find_free_page(&op, 1024).unwrap(), Some(10));
}

#[test]
fn page_index_beyond_capacity() {
    let store = memory_store();
    let map = free_space_map(&store, "fsm");
    let mut op = store.begin_atomic_operation();
    map.update_page_free_space(&mut op, MAX_PAGE_INDEX, 1000)
        .unwrap();
    assert_eq!(map.find_free_page(&op, 500).unwrap(), Some(MAX_PAGE_INDEX));

    let err = map
        .update_page_free_space(&mut op, MAX_PAGE_INDEX + 1, 1000)
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<FreeSpaceMapError>(),
        Some(FreeSpaceMapError::PageIndexOutOfRange { .. })
    ));
}

#[test]
fn uncommitted_updates_are_invisible() {
    let store = memory_store();
    let map = free_space_map(&store, "fsm");
    {
        let mut op = store.begin_atomic_operation();
        map.update_page_free_space(&mut op, 5000, 2000).unwrap();
        assert_eq!(map.find_free_page(&op, 1000).unwrap(), Some(5000));
    }
    let op = store.begin_atomic_operation();
    assert_eq!(map.find_free_page(&op, 1000).unwrap(), None);
}

/// The lowest page whose stored class reaches the class required for `required` bytes.
fn model_find(model: &BTreeMap<u64, u32>, required: u32) -> Option<u64> {
    let class = required_class(required);
    model
        .iter()
        .find(|(_, free)| normalize(**free) as u32 >= class)
        .map(|(page, _)| *page)
}

#[test]
fn random_pages() {
    let store = memory_store();
    let map = free_space_map(&store, "fsm");
    let mut rng = common::rng();
    let mut model = BTreeMap::new();

    let test_result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        for page_index in 0..1_000u64 {
            let free = rng.gen_range(0..PAGE_SIZE as u32);
            model.insert(page_index, free);
            store
                .execute_inside_atomic_operation(|op| {
                    map.update_page_free_space(op, page_index, free)
                })
                .unwrap();
        }

        let op = store.begin_atomic_operation();
        for _ in 0..1_000 {
            let required = rng.gen_range(0..PAGE_SIZE as u32);
            let found = map.find_free_page(&op, required).unwrap();
            assert_eq!(found, model_find(&model, required), "required {required}");
            if let Some(page) = found {
                assert!(model[&page] > required);
            }
        }
    }));

    if let Err(cause) = test_result {
        eprintln!("random_pages failed with seed: {:?}", *SEED);
        std::panic::resume_unwind(cause);
    }
}

#[test]
fn random_pages_update() {
    let store = memory_store();
    let map = free_space_map(&store, "fsm");
    let mut rng = common::rng();
    let mut model = BTreeMap::new();

    let test_result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        for round in 0..2 {
            let mut op = store.begin_atomic_operation();
            for _ in 0..1_000 {
                // sparse indices spread over several second-level pages.
                let page_index = rng.gen_range(0..20_000u64);
                let free = rng.gen_range(0..PAGE_SIZE as u32);
                model.insert(page_index, free);
                map.update_page_free_space(&mut op, page_index, free).unwrap();
            }
            op.commit().unwrap();

            let op = store.begin_atomic_operation();
            for _ in 0..1_000 {
                let required = rng.gen_range(0..PAGE_SIZE as u32);
                assert_eq!(
                    map.find_free_page(&op, required).unwrap(),
                    model_find(&model, required),
                    "round {round}, required {required}"
                );
            }
        }
    }));

    if let Err(cause) = test_result {
        eprintln!("random_pages_update failed with seed: {:?}", *SEED);
        std::panic::resume_unwind(cause);
    }
}
