use std::collections::VecDeque;

use crate::surface::Snapshot;

/// Undo/redo stack of whole-surface snapshots for the active page.
///
/// `step` points at the snapshot currently shown. Committing truncates
/// everything after the cursor, so an undone future cannot be redone once a
/// new edit lands.
#[derive(Debug, Clone)]
pub struct History {
    entries: VecDeque<Snapshot>,
    step: Option<usize>,
    max_depth: usize,
}

impl History {
    /// `max_depth` of 0 keeps every snapshot.
    pub fn new(max_depth: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            step: None,
            max_depth,
        }
    }

    pub fn commit(&mut self, snapshot: Snapshot) {
        match self.step {
            Some(step) => self.entries.truncate(step + 1),
            None => self.entries.clear(),
        }
        self.entries.push_back(snapshot);
        if self.max_depth > 0 {
            while self.entries.len() > self.max_depth {
                self.entries.pop_front();
            }
        }
        self.step = Some(self.entries.len() - 1);
    }

    /// Moves the cursor back and returns the snapshot to restore.
    pub fn undo(&mut self) -> Option<&Snapshot> {
        match self.step {
            Some(step) if step > 0 => {
                self.step = Some(step - 1);
                self.entries.get(step - 1)
            }
            _ => None,
        }
    }

    /// Moves the cursor forward and returns the snapshot to restore.
    pub fn redo(&mut self) -> Option<&Snapshot> {
        match self.step {
            Some(step) if step + 1 < self.entries.len() => {
                self.step = Some(step + 1);
                self.entries.get(step + 1)
            }
            _ => None,
        }
    }

    pub fn reset(&mut self) {
        self.entries.clear();
        self.step = None;
    }

    pub fn current(&self) -> Option<&Snapshot> {
        self.step.and_then(|step| self.entries.get(step))
    }

    pub fn step(&self) -> Option<usize> {
        self.step
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn can_undo(&self) -> bool {
        matches!(self.step, Some(step) if step > 0)
    }

    pub fn can_redo(&self) -> bool {
        matches!(self.step, Some(step) if step + 1 < self.entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn snap(value: u8) -> Snapshot {
        Snapshot::new(RgbaImage::from_pixel(1, 1, Rgba([value, 0, 0, 255])))
    }

    #[test]
    fn empty_history_has_no_cursor() {
        let mut history = History::new(0);
        assert_eq!(history.step(), None);
        assert!(history.undo().is_none());
        assert!(history.redo().is_none());
        assert!(history.current().is_none());
    }

    #[test]
    fn undo_and_redo_walk_the_cursor() {
        let mut history = History::new(0);
        for value in 0..3 {
            history.commit(snap(value));
        }
        assert_eq!(history.step(), Some(2));
        assert_eq!(history.undo(), Some(&snap(1)));
        assert_eq!(history.undo(), Some(&snap(0)));
        assert!(history.undo().is_none());
        assert_eq!(history.step(), Some(0));
        assert_eq!(history.redo(), Some(&snap(1)));
        assert_eq!(history.redo(), Some(&snap(2)));
        assert!(history.redo().is_none());
    }

    #[test]
    fn commit_after_undo_discards_the_future() {
        let mut history = History::new(0);
        for value in 0..4 {
            history.commit(snap(value));
        }
        history.undo();
        history.undo();
        history.commit(snap(9));

        assert_eq!(history.len(), 3);
        assert!(!history.can_redo());
        assert!(history.redo().is_none());
        assert_eq!(history.current(), Some(&snap(9)));
    }

    #[test]
    fn depth_cap_drops_oldest_entries() {
        let mut history = History::new(3);
        for value in 0..5 {
            history.commit(snap(value));
        }
        assert_eq!(history.len(), 3);
        assert_eq!(history.step(), Some(2));
        history.undo();
        assert_eq!(history.undo(), Some(&snap(2)));
        assert!(!history.can_undo());
    }

    #[test]
    fn reset_empties_the_stack() {
        let mut history = History::new(0);
        history.commit(snap(1));
        history.reset();
        assert!(history.is_empty());
        assert_eq!(history.step(), None);
    }
}
