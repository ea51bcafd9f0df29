//! A lazily-resorted binary min-heap keyed by a behavior's topological `order`.
//!
//! Behaviors are pushed onto this queue as their demands fire, and drained in ascending `order`
//! during the run phase. Because `order` can change mid-event (the structure phase may reorder
//! an arbitrary subset of behaviors), a full heap rebuild would be wasteful if requested on every
//! reorder; instead [`BehaviorQueue::needs_resort`] just marks the heap dirty, and the next
//! `pop`/`top` call rebuilds it once in O(n) (Floyd's build-heap) before resuming O(log n)
//! operations.

use crate::behavior::{BehaviorId, BehaviorArena};

#[derive(Default)]
pub(crate) struct BehaviorQueue {
    heap: Vec<BehaviorId>,
    dirty: bool,
}

impl BehaviorQueue {
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Mark the heap ordering invalid. The next `pop`/`top` will rebuild it from scratch.
    pub fn needs_resort(&mut self) {
        self.dirty = true;
    }

    /// Insert `id`. The caller is responsible for idempotency within a single event (guarding
    /// with `enqueued_sequence`), since the queue itself does not deduplicate.
    pub fn push(&mut self, id: BehaviorId, behaviors: &BehaviorArena) {
        self.heap.push(id);
        if !self.dirty {
            self.sift_up(self.heap.len() - 1, behaviors);
        }
    }

    /// Peek the minimum-order behavior without removing it.
    pub fn top(&mut self, behaviors: &BehaviorArena) -> Option<BehaviorId> {
        self.resort_if_dirty(behaviors);
        self.heap.first().copied()
    }

    /// Remove and return the minimum-order behavior.
    pub fn pop(&mut self, behaviors: &BehaviorArena) -> Option<BehaviorId> {
        self.resort_if_dirty(behaviors);
        if self.heap.is_empty() {
            return None;
        }
        let last = self.heap.len() - 1;
        self.heap.swap(0, last);
        let min = self.heap.pop();
        if !self.heap.is_empty() {
            self.sift_down(0, behaviors);
        }
        min
    }

    fn resort_if_dirty(&mut self, behaviors: &BehaviorArena) {
        if !self.dirty {
            return;
        }
        // Floyd's build-heap: sift down from the last parent to the root.
        let n = self.heap.len();
        if n > 1 {
            for i in (0..=(n / 2 - 1)).rev() {
                self.sift_down(i, behaviors);
            }
        }
        self.dirty = false;
    }

    fn order_of(id: BehaviorId, behaviors: &BehaviorArena) -> u64 {
        behaviors.get(id).map(|b| b.order).unwrap_or(u64::MAX)
    }

    fn sift_up(&mut self, mut i: usize, behaviors: &BehaviorArena) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if Self::order_of(self.heap[i], behaviors) < Self::order_of(self.heap[parent], behaviors) {
                self.heap.swap(i, parent);
                i = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut i: usize, behaviors: &BehaviorArena) {
        let n = self.heap.len();
        loop {
            let left = 2 * i + 1;
            let right = 2 * i + 2;
            let mut smallest = i;
            if left < n && Self::order_of(self.heap[left], behaviors) < Self::order_of(self.heap[smallest], behaviors) {
                smallest = left;
            }
            if right < n && Self::order_of(self.heap[right], behaviors) < Self::order_of(self.heap[smallest], behaviors) {
                smallest = right;
            }
            if smallest == i {
                break;
            }
            self.heap.swap(i, smallest);
            i = smallest;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::BehaviorData;

    fn arena_with_orders(orders: &[u64]) -> (BehaviorArena, Vec<BehaviorId>) {
        let mut arena = BehaviorArena::default();
        let ids: Vec<_> = orders
            .iter()
            .map(|&order| {
                let mut data = BehaviorData::new_for_test();
                data.order = order;
                arena.insert(data)
            })
            .collect();
        (arena, ids)
    }

    #[test]
    fn pops_in_ascending_order() {
        let (behaviors, ids) = arena_with_orders(&[5, 1, 3, 2, 4]);
        let mut q = BehaviorQueue::default();
        for &id in &ids {
            q.push(id, &behaviors);
        }
        let mut popped = vec![];
        while let Some(id) = q.pop(&behaviors) {
            popped.push(behaviors.get(id).unwrap().order);
        }
        assert_eq!(popped, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn resort_after_order_changes() {
        let (mut behaviors, ids) = arena_with_orders(&[1, 2, 3]);
        let mut q = BehaviorQueue::default();
        for &id in &ids {
            q.push(id, &behaviors);
        }
        // Mutate order out from under the heap, simulating a mid-event reorder.
        behaviors.get_mut(ids[2]).unwrap().order = 0;
        q.needs_resort();
        assert_eq!(q.pop(&behaviors), Some(ids[2]));
    }
}
