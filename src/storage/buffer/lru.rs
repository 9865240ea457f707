use super::replacer::{FrameId, Replacer};
use hashlink::LinkedHashSet;

#[derive(Debug)]
pub struct LruReplacer {
    /// Evictable frames, least recently unpinned at the front
    lru_list: LinkedHashSet<FrameId>,
    /// Maximum number of frames
    max_size: usize,
}

impl LruReplacer {
    pub fn new(max_size: usize) -> Self {
        Self {
            lru_list: LinkedHashSet::with_capacity(max_size),
            max_size,
        }
    }
}

impl Replacer for LruReplacer {
    fn victim(&mut self) -> Option<FrameId> {
        self.lru_list.pop_front()
    }

    fn pin(&mut self, frame_id: FrameId) {
        self.lru_list.remove(&frame_id);
    }

    fn unpin(&mut self, frame_id: FrameId) {
        if !self.lru_list.contains(&frame_id) && self.lru_list.len() < self.max_size {
            self.lru_list.insert(frame_id);
        }
    }

    fn size(&self) -> usize {
        self.lru_list.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_lru_operations() {
        let mut replacer = LruReplacer::new(3);

        // Initially empty
        assert_eq!(replacer.size(), 0);
        assert_eq!(replacer.victim(), None);

        replacer.unpin(1);
        replacer.unpin(2);
        replacer.unpin(3);
        assert_eq!(replacer.size(), 3);

        // First unpinned is first evicted
        assert_eq!(replacer.victim(), Some(1));
        assert_eq!(replacer.victim(), Some(2));
        assert_eq!(replacer.victim(), Some(3));
        assert_eq!(replacer.victim(), None);
    }

    #[test]
    fn test_pin_unpin() {
        let mut replacer = LruReplacer::new(3);

        replacer.unpin(1);
        replacer.unpin(2);
        assert_eq!(replacer.size(), 2);

        replacer.pin(1);
        assert_eq!(replacer.size(), 1);

        // Only frame 2 should be evictable
        assert_eq!(replacer.victim(), Some(2));
        assert_eq!(replacer.victim(), None);

        replacer.unpin(1);
        assert_eq!(replacer.victim(), Some(1));
    }

    #[test]
    fn test_duplicate_unpin_keeps_position() {
        let mut replacer = LruReplacer::new(3);

        replacer.unpin(1);
        replacer.unpin(2);
        replacer.unpin(1);
        assert_eq!(replacer.size(), 2);

        // A repeated unpin does not refresh recency
        assert_eq!(replacer.victim(), Some(1));
    }

    #[test]
    fn test_pin_non_existent() {
        let mut replacer = LruReplacer::new(2);

        replacer.pin(999);
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    fn test_max_size_limit() {
        let mut replacer = LruReplacer::new(2);

        replacer.unpin(1);
        replacer.unpin(2);
        replacer.unpin(3); // Ignored, replacer is at capacity

        assert_eq!(replacer.size(), 2);
        assert_eq!(replacer.victim(), Some(1));
        assert_eq!(replacer.victim(), Some(2));
        assert_eq!(replacer.victim(), None);
    }

    #[test]
    fn test_complex_scenario() {
        let mut replacer = LruReplacer::new(7);

        for frame_id in 1..=6 {
            replacer.unpin(frame_id);
        }
        replacer.unpin(1);
        assert_eq!(replacer.size(), 6);

        assert_eq!(replacer.victim(), Some(1));
        assert_eq!(replacer.victim(), Some(2));
        assert_eq!(replacer.victim(), Some(3));

        replacer.pin(3);
        replacer.pin(4);
        assert_eq!(replacer.size(), 2);

        replacer.unpin(4);

        assert_eq!(replacer.victim(), Some(5));
        assert_eq!(replacer.victim(), Some(6));
        assert_eq!(replacer.victim(), Some(4));
        assert_eq!(replacer.size(), 0);
    }
}
