//! The layout of a free-space map page.
//!
//! A page stores a complete binary max-tree of one-byte cells in heap order: node `1` is the
//! root, the children of node `n` are `2n` and `2n + 1`, and node `n` lives at byte `n - 1`.
//! With [`LEVELS`] levels the tree has `2^LEVELS - 1` nodes, which fills a page but for its
//! last byte, and [`CELLS_PER_PAGE`] leaves.
//!
//! Every inner node holds the maximum of its two children, so the root is the maximum of the
//! whole page and the leftmost leaf holding at least some value is found in `LEVELS - 1` steps.
//!
//! ```text
//!            [120]              level 1
//!           /     \
//!       [80]       [120]        level 2
//!       /  \       /   \
//!    [40] [80]  [90]  [120]     leaves
//! ```

use crate::page::PAGE_SIZE;

/// The number of levels of the tree, root and leaves included.
pub const LEVELS: u32 = PAGE_SIZE.trailing_zeros();

/// The number of leaves of the tree.
pub const CELLS_PER_PAGE: usize = 1 << (LEVELS - 1);

const FIRST_LEAF: usize = CELLS_PER_PAGE;
const ROOT: usize = 1;

/// A view of a page as a free-space segment tree.
pub struct FreeSpacePage<T> {
    inner: T,
}

impl<T: AsRef<[u8]>> FreeSpacePage<T> {
    pub fn new(inner: T) -> Self {
        debug_assert_eq!(inner.as_ref().len(), PAGE_SIZE);
        FreeSpacePage { inner }
    }

    fn node(&self, node: usize) -> u8 {
        self.inner.as_ref()[node - 1]
    }

    /// The largest value stored in any leaf.
    pub fn max(&self) -> u8 {
        self.node(ROOT)
    }

    /// The value stored in a leaf.
    pub fn leaf(&self, index: usize) -> u8 {
        assert!(index < CELLS_PER_PAGE);
        self.node(FIRST_LEAF + index)
    }

    /// Find the leftmost leaf whose value is at least `required`.
    ///
    /// A zero value never qualifies, so a fresh page yields `None` for every request.
    pub fn find(&self, required: u32) -> Option<usize> {
        let required = required.max(1);
        let max = self.max() as u32;
        if max < required {
            return None;
        }

        let mut node = ROOT;
        while node < FIRST_LEAF {
            let left = node << 1;
            if self.node(left) as u32 >= required {
                node = left;
            } else {
                // the parent holds the max of both children, so the right one qualifies.
                debug_assert!(self.node(left + 1) as u32 >= required);
                node = left + 1;
            }
        }

        Some(node - FIRST_LEAF)
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> FreeSpacePage<T> {
    /// Reset every node to zero.
    pub fn init(&mut self) {
        self.inner.as_mut().fill(0);
    }

    fn set_node(&mut self, node: usize, value: u8) {
        self.inner.as_mut()[node - 1] = value;
    }

    /// Store `value` in a leaf and refresh its ancestors. Returns the new page maximum.
    ///
    /// Stops early once an ancestor already holds the value it would be given.
    pub fn update(&mut self, index: usize, value: u8) -> u8 {
        assert!(index < CELLS_PER_PAGE);

        let mut node = FIRST_LEAF + index;
        let mut value = value;
        loop {
            if self.node(node) == value {
                return self.max();
            }
            self.set_node(node, value);
            if node == ROOT {
                return value;
            }

            let sibling = node ^ 1;
            value = value.max(self.node(sibling));
            node >>= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::Page;
    use quickcheck::{QuickCheck, TestResult};

    fn fsm_page() -> FreeSpacePage<Page> {
        FreeSpacePage::new(Page::zeroed())
    }

    #[test]
    fn tree_fits_in_page() {
        assert_eq!(LEVELS, 12);
        assert_eq!(CELLS_PER_PAGE, 2048);
        assert!(2 * CELLS_PER_PAGE - 1 <= PAGE_SIZE);
    }

    #[test]
    fn empty_page_finds_nothing() {
        let page = fsm_page();
        assert_eq!(page.find(0), None);
        assert_eq!(page.find(1), None);
    }

    #[test]
    fn finds_leftmost_qualifying_leaf() {
        let mut page = fsm_page();
        page.update(3, 32);
        page.update(4, 126);
        page.update(5, 189);
        page.update(CELLS_PER_PAGE - 1, 255);

        assert_eq!(page.find(18), Some(3));
        assert_eq!(page.find(65), Some(4));
        assert_eq!(page.find(130), Some(5));
        assert_eq!(page.find(200), Some(CELLS_PER_PAGE - 1));
        assert_eq!(page.find(256), None);
        assert_eq!(page.max(), 255);
    }

    #[test]
    fn lowering_a_leaf_lowers_the_root() {
        let mut page = fsm_page();
        assert_eq!(page.update(10, 200), 200);
        assert_eq!(page.update(11, 100), 200);
        assert_eq!(page.update(10, 50), 100);
        assert_eq!(page.find(60), Some(11));
        assert_eq!(page.update(11, 0), 50);
        assert_eq!(page.update(10, 0), 0);
        assert_eq!(page.find(1), None);
    }

    #[test]
    fn unchanged_update_returns_current_max() {
        let mut page = fsm_page();
        page.update(0, 9);
        page.update(7, 40);
        assert_eq!(page.update(0, 9), 40);
        assert_eq!(page.leaf(0), 9);
    }

    #[test]
    fn matches_linear_scan() {
        fn prop(updates: Vec<(u16, u8)>, queries: Vec<u16>) -> TestResult {
            let mut page = fsm_page();
            let mut model = vec![0u8; CELLS_PER_PAGE];
            for (index, value) in updates {
                let index = index as usize % CELLS_PER_PAGE;
                model[index] = value;
                let max = page.update(index, value);
                if max != *model.iter().max().unwrap() {
                    return TestResult::failed();
                }
            }
            for required in queries {
                let required = required as u32 % 300;
                let expected = model
                    .iter()
                    .position(|&v| v != 0 && v as u32 >= required);
                if page.find(required) != expected {
                    return TestResult::failed();
                }
            }
            TestResult::passed()
        }

        QuickCheck::new()
            .tests(200)
            .quickcheck(prop as fn(Vec<(u16, u8)>, Vec<u16>) -> TestResult);
    }
}
