use super::Heap;
use crate::{block::BlockId, size_class::SizeClass};

impl<R> Heap<R> {
    /// Finds a free block of at least `asize` bytes.
    ///
    /// Starting at the class of `asize`, each class is scanned in full for
    /// its smallest sufficient block. The first class that has one wins, even
    /// if a later class would fit tighter.
    pub(super) fn find_fit(&self, asize: usize) -> Option<BlockId> {
        SizeClass::of(asize)
            .and_larger()
            .find_map(|class| self.best_fit_in(class, asize))
    }

    /// Returns the smallest block of `class` with at least `asize` bytes.
    /// Among equal sizes the one nearest the front of the list is chosen.
    fn best_fit_in(&self, class: SizeClass, asize: usize) -> Option<BlockId> {
        let mut best: Option<(BlockId, usize)> = None;
        for id in self.lists.iter(&self.blocks, class) {
            let size = self.blocks[id].size;
            if size >= asize && best.is_none_or(|(_, best_size)| size < best_size) {
                best = Some((id, size));
            }
        }
        best.map(|(id, _)| id)
    }
}
