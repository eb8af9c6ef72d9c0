use std::collections::HashMap;

use tracing::debug;

use crate::raster::quantize_scale;
use crate::surface::Snapshot;

#[derive(Debug, Clone)]
struct StoredPage {
    snapshot: Snapshot,
    raster: Snapshot,
    scale_milli: u32,
}

/// Last committed surface of every page visited this session.
///
/// The clean raster the snapshot was drawn over is kept alongside it so a
/// restored page can still be cleared back to the bare page.
#[derive(Debug, Default)]
pub struct PageStore {
    pages: HashMap<usize, StoredPage>,
}

impl PageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores or overwrites the snapshot for `page_index`.
    pub fn commit_current(
        &mut self,
        page_index: usize,
        snapshot: Snapshot,
        raster: Snapshot,
        scale: f32,
    ) {
        debug!(page = page_index + 1, scale, "committing page snapshot");
        self.pages.insert(
            page_index,
            StoredPage {
                snapshot,
                raster,
                scale_milli: quantize_scale(scale),
            },
        );
    }

    /// `None` when the page was never visited.
    pub fn restore(&self, page_index: usize) -> Option<&Snapshot> {
        self.pages.get(&page_index).map(|page| &page.snapshot)
    }

    /// The stored snapshot together with the clean raster it was drawn over.
    pub fn restore_with_raster(&self, page_index: usize) -> Option<(&Snapshot, &Snapshot)> {
        self.pages
            .get(&page_index)
            .map(|page| (&page.snapshot, &page.raster))
    }

    /// Forgets `page_index`, so it is rendered fresh the next time it is needed.
    pub fn evict(&mut self, page_index: usize) -> bool {
        self.pages.remove(&page_index).is_some()
    }

    /// Clean raster for `page_index`, only if it was produced at `scale`.
    pub fn raster_at(&self, page_index: usize, scale: f32) -> Option<&Snapshot> {
        self.pages
            .get(&page_index)
            .filter(|page| page.scale_milli == quantize_scale(scale))
            .map(|page| &page.raster)
    }

    pub fn contains(&self, page_index: usize) -> bool {
        self.pages.contains_key(&page_index)
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Visited page indices, ascending.
    pub fn visited(&self) -> Vec<usize> {
        let mut pages: Vec<usize> = self.pages.keys().copied().collect();
        pages.sort_unstable();
        pages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn snap(value: u8) -> Snapshot {
        Snapshot::new(RgbaImage::from_pixel(2, 2, Rgba([value, value, value, 255])))
    }

    #[test]
    fn unvisited_pages_restore_nothing() {
        let store = PageStore::new();
        assert!(store.restore(0).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn commit_overwrites_previous_snapshot() {
        let mut store = PageStore::new();
        store.commit_current(1, snap(10), snap(255), 1.0);
        store.commit_current(1, snap(20), snap(255), 1.0);
        assert_eq!(store.restore(1), Some(&snap(20)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn raster_is_only_reused_at_the_same_scale() {
        let mut store = PageStore::new();
        store.commit_current(4, snap(1), snap(255), 1.2);
        assert!(store.raster_at(4, 1.2).is_some());
        assert!(store.raster_at(4, 1.5).is_none());
        // the snapshot itself survives a scale change
        assert!(store.restore(4).is_some());
    }

    #[test]
    fn evicted_pages_are_forgotten() {
        let mut store = PageStore::new();
        store.commit_current(0, snap(9), snap(255), 1.0);
        assert_eq!(store.restore_with_raster(0), Some((&snap(9), &snap(255))));
        assert!(store.evict(0));
        assert!(!store.evict(0));
        assert!(store.restore_with_raster(0).is_none());
    }

    #[test]
    fn visited_pages_are_sorted() {
        let mut store = PageStore::new();
        for page in [3, 0, 2] {
            store.commit_current(page, snap(0), snap(0), 1.0);
        }
        assert_eq!(store.visited(), vec![0, 2, 3]);
        assert!(store.contains(2));
    }
}
