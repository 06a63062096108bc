use std::path::Path;

use lazy_static::lazy_static;
use locmap::{
    AtomicOperation, CollectionPositionMap, FreeSpaceMap, Options, PageStore, PositionEntry,
};

// Required to increase reproducibility
lazy_static! {
    pub static ref SEED: [u8; 16] = {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("no time?")
            .as_nanos()
            .to_le_bytes()[0..16]
            .try_into()
            .unwrap()
    };
}

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[allow(dead_code)]
pub fn rng() -> rand_pcg::Lcg64Xsh32 {
    use rand::SeedableRng as _;
    rand_pcg::Lcg64Xsh32::from_seed(*SEED)
}

pub fn memory_store() -> PageStore {
    init_logging();
    let mut o = Options::new();
    o.metrics(true);
    PageStore::open(&o).unwrap()
}

#[allow(dead_code)]
pub fn directory_store(path: &Path) -> PageStore {
    init_logging();
    let mut o = Options::new();
    o.path(path);
    o.fsync_on_commit(true);
    PageStore::open(&o).unwrap()
}

#[allow(dead_code)]
pub fn position_map(store: &PageStore, name: &str) -> CollectionPositionMap {
    let mut map = CollectionPositionMap::new(name);
    store
        .execute_inside_atomic_operation(|op| map.create(op))
        .unwrap();
    map
}

#[allow(dead_code)]
pub fn free_space_map(store: &PageStore, name: &str) -> FreeSpaceMap {
    let mut map = FreeSpaceMap::new(name);
    store
        .execute_inside_atomic_operation(|op| map.create(op))
        .unwrap();
    map
}

/// Allocate a position and fill it with an entry derived from the position.
#[allow(dead_code)]
pub fn fill(map: &CollectionPositionMap, op: &mut AtomicOperation) -> u64 {
    let position = map.allocate(op).unwrap();
    map.update(position, entry_for(position), op).unwrap();
    position
}

#[allow(dead_code)]
pub fn entry_for(position: u64) -> PositionEntry {
    PositionEntry::new(position + 100, position as u32 * 2, position as i32 + 1)
}
