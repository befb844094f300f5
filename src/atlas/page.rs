// Page free list shared by every image on a device.

use crate::config::AtlasConfig;
use parking_lot::Mutex;

/// Width and height of one atlas page in texels.
pub const PAGE_SIZE: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Page(pub u32);

/// Where a page lives inside the atlas texture array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageOrigin {
    pub layer: u32,
    pub x: u32,
    pub y: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtlasLayout {
    pub pages_per_row: u32,
    pub max_layers: u32,
}

impl AtlasLayout {
    pub fn from_config(config: &AtlasConfig) -> Self {
        Self {
            pages_per_row: config.pages_per_row,
            max_layers: config.max_layers,
        }
    }

    pub fn pages_per_layer(&self) -> u32 {
        self.pages_per_row * self.pages_per_row
    }

    pub fn capacity(&self) -> u32 {
        self.pages_per_layer() * self.max_layers
    }

    /// Side length of one square layer in texels.
    pub fn layer_extent(&self) -> u32 {
        self.pages_per_row * PAGE_SIZE
    }

    pub fn page_origin(&self, page: Page) -> PageOrigin {
        let per_layer = self.pages_per_layer();
        let within = page.0 % per_layer;
        PageOrigin {
            layer: page.0 / per_layer,
            x: (within % self.pages_per_row) * PAGE_SIZE,
            y: (within / self.pages_per_row) * PAGE_SIZE,
        }
    }

    /// Columns and rows of pages needed to cover an extent.
    pub fn page_grid(width: u32, height: u32) -> (u32, u32) {
        (width.div_ceil(PAGE_SIZE), height.div_ceil(PAGE_SIZE))
    }

    pub fn pages_for_extent(width: u32, height: u32) -> usize {
        let (columns, rows) = Self::page_grid(width, height);
        (columns * rows) as usize
    }
}

#[derive(Debug)]
struct FreeList {
    free: Vec<Page>,
    generation: u64,
}

/// Internally locked free list of atlas pages.
///
/// Pages are handed out last-freed-first, so a released page is the next one reused.
/// Fresh pages come out in ascending index order, which fills layer 0 before layer 1.
#[derive(Debug)]
pub struct PageAllocator {
    layout: AtlasLayout,
    inner: Mutex<FreeList>,
}

impl PageAllocator {
    pub fn new(layout: AtlasLayout) -> Self {
        Self {
            layout,
            inner: Mutex::new(FreeList {
                free: Self::fresh_pages(layout),
                generation: 0,
            }),
        }
    }

    fn fresh_pages(layout: AtlasLayout) -> Vec<Page> {
        (0..layout.capacity()).rev().map(Page).collect()
    }

    pub fn layout(&self) -> AtlasLayout {
        self.layout
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    pub fn free_count(&self) -> usize {
        self.inner.lock().free.len()
    }

    /// Take `count` pages, or none at all when fewer are free.
    pub fn allocate(&self, count: usize) -> Option<(Vec<Page>, u64)> {
        let mut inner = self.inner.lock();
        if count > inner.free.len() {
            log::debug!(
                "Atlas exhausted: {} pages requested, {} free",
                count,
                inner.free.len()
            );
            return None;
        }
        let split = inner.free.len() - count;
        let mut pages = inner.free.split_off(split);
        pages.reverse();
        Some((pages, inner.generation))
    }

    /// Return pages taken under `generation`. Pages from before a reset are dropped.
    pub fn release(&self, pages: &[Page], generation: u64) {
        if pages.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        if generation != inner.generation {
            log::trace!("Ignoring release of {} stale pages", pages.len());
            return;
        }
        debug_assert!(pages.iter().all(|page| !inner.free.contains(page)));
        inner.free.extend(pages.iter().rev().copied());
    }

    /// Reclaim every page, e.g. when the owning device goes away.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.free = Self::fresh_pages(self.layout);
        inner.generation += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn layout(pages_per_row: u32, max_layers: u32) -> AtlasLayout {
        AtlasLayout {
            pages_per_row,
            max_layers,
        }
    }

    #[test]
    fn page_origin_walks_rows_then_layers() {
        let layout = layout(4, 2);
        assert_eq!(layout.page_origin(Page(0)), PageOrigin { layer: 0, x: 0, y: 0 });
        assert_eq!(
            layout.page_origin(Page(5)),
            PageOrigin {
                layer: 0,
                x: PAGE_SIZE,
                y: PAGE_SIZE
            }
        );
        assert_eq!(layout.page_origin(Page(16)), PageOrigin { layer: 1, x: 0, y: 0 });
    }

    #[test]
    fn extent_rounds_up_to_whole_pages() {
        assert_eq!(AtlasLayout::pages_for_extent(1, 1), 1);
        assert_eq!(AtlasLayout::pages_for_extent(PAGE_SIZE, PAGE_SIZE), 1);
        assert_eq!(AtlasLayout::pages_for_extent(PAGE_SIZE + 1, 10), 2);
        assert_eq!(AtlasLayout::pages_for_extent(200, 130), 4 * 3);
        assert_eq!(AtlasLayout::pages_for_extent(0, 0), 0);
    }

    #[test]
    fn fresh_pages_come_out_in_order() {
        let allocator = PageAllocator::new(layout(2, 1));
        let (pages, _) = allocator.allocate(3).unwrap();
        assert_eq!(pages, vec![Page(0), Page(1), Page(2)]);
    }

    #[test]
    fn allocation_is_injective() {
        let allocator = PageAllocator::new(layout(4, 2));
        let mut seen = HashSet::new();
        while let Some((pages, _)) = allocator.allocate(3) {
            for page in pages {
                assert!(seen.insert(page), "page {page:?} handed out twice");
            }
        }
        assert_eq!(seen.len() + allocator.free_count(), 32);
    }

    #[test]
    fn exhaustion_leaves_free_list_untouched() {
        let allocator = PageAllocator::new(layout(2, 1));
        let (_held, _) = allocator.allocate(1).unwrap();
        assert_eq!(allocator.free_count(), 3);

        assert!(allocator.allocate(5).is_none());
        assert_eq!(allocator.free_count(), 3);
        let (rest, _) = allocator.allocate(3).unwrap();
        assert_eq!(rest, vec![Page(1), Page(2), Page(3)]);
    }

    #[test]
    fn released_pages_are_reused_first() {
        let allocator = PageAllocator::new(layout(4, 1));
        let (first, generation) = allocator.allocate(2).unwrap();
        let (_second, _) = allocator.allocate(2).unwrap();

        allocator.release(&first, generation);
        let (again, _) = allocator.allocate(2).unwrap();
        assert_eq!(again, first);
    }

    #[test]
    fn reset_reclaims_and_ignores_stale_release() {
        let allocator = PageAllocator::new(layout(2, 1));
        let (pages, generation) = allocator.allocate(4).unwrap();
        assert_eq!(allocator.free_count(), 0);

        allocator.reset();
        assert_eq!(allocator.free_count(), 4);
        assert_eq!(allocator.generation(), generation + 1);

        allocator.release(&pages, generation);
        assert_eq!(allocator.free_count(), 4);
    }
}
