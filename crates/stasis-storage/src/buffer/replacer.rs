//! LRU-2S page replacement.
//!
//! The replacement queue is one doubly linked list split in two segments:
//!
//! ```text
//!  head                      middle                         tail
//!   │                          │                              │
//!   ▼                          ▼                              ▼
//!  [ protected ... protected ][ probationary ... probationary ]
//! ```
//!
//! A page enters at `middle`, the head of the probationary segment. A hit on
//! a probationary page promotes it to the head of the queue; when the
//! protected segment outgrows its share, its last page slides back across
//! `middle`. Victims are taken from the tail, skipping pinned frames.
//!
//! Links are frame indices into an arena sized to the pool, so moving a
//! node is O(1) and nothing dangles when a frame is rekeyed.

use super::frame::FrameId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Segment {
    Absent,
    Probationary,
    Protected,
}

#[derive(Debug, Clone, Copy)]
struct Node {
    prev: Option<FrameId>,
    next: Option<FrameId>,
    segment: Segment,
}

impl Node {
    const EMPTY: Self = Self {
        prev: None,
        next: None,
        segment: Segment::Absent,
    };
}

/// Two-segment LRU replacement queue over a fixed set of frames.
#[derive(Debug)]
pub struct Lru2sReplacer {
    nodes: Vec<Node>,
    head: Option<FrameId>,
    tail: Option<FrameId>,
    /// First probationary node, `None` when that segment is empty.
    middle: Option<FrameId>,
    protected_len: usize,
    probationary_len: usize,
    protected_capacity: usize,
}

impl Lru2sReplacer {
    /// Creates a replacer for `num_frames` frames whose protected segment
    /// holds at most `protected_capacity` of them.
    pub fn new(num_frames: usize, protected_capacity: usize) -> Self {
        Self {
            nodes: vec![Node::EMPTY; num_frames],
            head: None,
            tail: None,
            middle: None,
            protected_len: 0,
            probationary_len: 0,
            protected_capacity,
        }
    }

    /// Number of frames currently queued.
    pub fn len(&self) -> usize {
        self.protected_len + self.probationary_len
    }

    /// Returns true if no frame is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of frames in the protected segment.
    pub fn protected_len(&self) -> usize {
        self.protected_len
    }

    /// Returns true if `id` is queued.
    pub fn contains(&self, id: FrameId) -> bool {
        self.nodes[id.index()].segment != Segment::Absent
    }

    /// Returns true if `id` sits in the protected segment.
    pub fn is_protected(&self, id: FrameId) -> bool {
        self.nodes[id.index()].segment == Segment::Protected
    }

    /// Queues a newly loaded frame at the head of the probationary segment.
    pub fn insert(&mut self, id: FrameId) {
        if self.contains(id) {
            self.unlink(id);
        }
        self.link_before(id, self.middle, Segment::Probationary);
        self.middle = Some(id);
    }

    /// Records a cache hit on `id`.
    pub fn hit(&mut self, id: FrameId) {
        match self.nodes[id.index()].segment {
            Segment::Absent => self.insert(id),
            Segment::Protected => {
                self.unlink(id);
                self.link_before(id, self.head, Segment::Protected);
            }
            Segment::Probationary => {
                self.unlink(id);
                self.link_before(id, self.head, Segment::Protected);
                if self.protected_len > self.protected_capacity {
                    self.demote_coldest_protected();
                }
            }
        }
    }

    /// Drops `id` from the queue.
    pub fn remove(&mut self, id: FrameId) {
        if self.contains(id) {
            self.unlink(id);
        }
    }

    /// Finds the coldest frame accepted by `evictable`, walking from the
    /// tail. The frame stays queued until the caller removes it.
    pub fn victim(&self, mut evictable: impl FnMut(FrameId) -> bool) -> Option<FrameId> {
        let mut cursor = self.tail;
        while let Some(id) = cursor {
            if evictable(id) {
                return Some(id);
            }
            cursor = self.nodes[id.index()].prev;
        }
        None
    }

    /// Iterates queued frames from head (hottest) to tail (coldest).
    pub fn iter(&self) -> impl Iterator<Item = FrameId> + '_ {
        std::iter::successors(self.head, move |id| self.nodes[id.index()].next)
    }

    fn demote_coldest_protected(&mut self) {
        let coldest = match self.middle {
            Some(m) => self.nodes[m.index()].prev,
            None => self.tail,
        };
        if let Some(id) = coldest {
            debug_assert_eq!(self.nodes[id.index()].segment, Segment::Protected);
            self.nodes[id.index()].segment = Segment::Probationary;
            self.protected_len -= 1;
            self.probationary_len += 1;
            self.middle = Some(id);
        }
    }

    fn link_before(&mut self, id: FrameId, before: Option<FrameId>, segment: Segment) {
        let prev = match before {
            Some(b) => self.nodes[b.index()].prev,
            None => self.tail,
        };
        self.nodes[id.index()] = Node {
            prev,
            next: before,
            segment,
        };
        match prev {
            Some(p) => self.nodes[p.index()].next = Some(id),
            None => self.head = Some(id),
        }
        match before {
            Some(b) => self.nodes[b.index()].prev = Some(id),
            None => self.tail = Some(id),
        }
        match segment {
            Segment::Protected => self.protected_len += 1,
            Segment::Probationary => self.probationary_len += 1,
            Segment::Absent => {}
        }
    }

    fn unlink(&mut self, id: FrameId) {
        let Node {
            prev,
            next,
            segment,
        } = self.nodes[id.index()];
        if self.middle == Some(id) {
            self.middle = next;
        }
        match prev {
            Some(p) => self.nodes[p.index()].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.nodes[n.index()].prev = prev,
            None => self.tail = prev,
        }
        match segment {
            Segment::Protected => self.protected_len -= 1,
            Segment::Probationary => self.probationary_len -= 1,
            Segment::Absent => {}
        }
        self.nodes[id.index()] = Node::EMPTY;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(replacer: &Lru2sReplacer) -> Vec<usize> {
        replacer.iter().map(FrameId::index).collect()
    }

    #[test]
    fn test_insert_goes_to_probationary_head() {
        let mut r = Lru2sReplacer::new(8, 5);
        r.insert(FrameId(0));
        r.insert(FrameId(1));
        r.insert(FrameId(2));
        assert_eq!(ids(&r), vec![2, 1, 0]);
        assert_eq!(r.protected_len(), 0);
        assert_eq!(r.victim(|_| true), Some(FrameId(0)));
    }

    #[test]
    fn test_hit_promotes_and_protects_from_eviction() {
        let mut r = Lru2sReplacer::new(8, 5);
        for i in 0..4 {
            r.insert(FrameId(i));
        }
        r.hit(FrameId(0));
        assert!(r.is_protected(FrameId(0)));
        assert_eq!(ids(&r), vec![0, 3, 2, 1]);

        // A later insert lands behind the protected page.
        r.insert(FrameId(4));
        assert_eq!(ids(&r), vec![0, 4, 3, 2, 1]);
        assert_eq!(r.victim(|_| true), Some(FrameId(1)));
    }

    #[test]
    fn test_protected_overflow_demotes_coldest() {
        let mut r = Lru2sReplacer::new(6, 2);
        for i in 0..4 {
            r.insert(FrameId(i));
        }
        r.hit(FrameId(0));
        r.hit(FrameId(1));
        r.hit(FrameId(2));
        assert_eq!(r.protected_len(), 2);
        assert!(!r.is_protected(FrameId(0)));
        assert_eq!(ids(&r), vec![2, 1, 0, 3]);

        // The demoted page now heads the probationary segment.
        r.insert(FrameId(5));
        assert_eq!(ids(&r), vec![2, 1, 5, 0, 3]);
    }

    #[test]
    fn test_victim_skips_unevictable() {
        let mut r = Lru2sReplacer::new(4, 2);
        for i in 0..4 {
            r.insert(FrameId(i));
        }
        let pinned = [FrameId(0), FrameId(1)];
        assert_eq!(r.victim(|id| !pinned.contains(&id)), Some(FrameId(2)));
        assert_eq!(r.victim(|_| false), None);
    }

    #[test]
    fn test_remove_keeps_links_consistent() {
        let mut r = Lru2sReplacer::new(5, 3);
        for i in 0..5 {
            r.insert(FrameId(i));
        }
        r.hit(FrameId(2));
        r.remove(FrameId(4));
        r.remove(FrameId(0));
        r.remove(FrameId(2));
        assert_eq!(ids(&r), vec![3, 1]);
        assert_eq!(r.len(), 2);
        assert_eq!(r.protected_len(), 0);

        r.remove(FrameId(3));
        r.remove(FrameId(1));
        assert!(r.is_empty());
        assert_eq!(r.victim(|_| true), None);
    }

    #[test]
    fn test_repeated_hits_on_protected() {
        let mut r = Lru2sReplacer::new(4, 3);
        for i in 0..3 {
            r.insert(FrameId(i));
            r.hit(FrameId(i));
        }
        assert_eq!(ids(&r), vec![2, 1, 0]);
        r.hit(FrameId(0));
        assert_eq!(ids(&r), vec![0, 2, 1]);
        assert_eq!(r.protected_len(), 3);
    }
}
