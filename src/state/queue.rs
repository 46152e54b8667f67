//! Pending-request queues.
//!
//! All resources share one fixed node pool. A node is either on the free
//! list (singly linked through `next`) or on exactly one record's pending
//! list (doubly linked, highest priority first). Links are indices into
//! [`StateTable::nodes`], bounds-checked against the pool size on every hop,
//! and traversal never takes more hops than there are nodes.

use super::layout::{NO_INDEX, QueueNode, StateTable};

impl StateTable {
    fn checked_node(&self, idx: i32) -> Option<usize> {
        (idx >= 0 && (idx as usize) < self.pool_size()).then_some(idx as usize)
    }

    /// Take a node off the free list.
    ///
    /// Returns `None` when the pool is exhausted.
    pub fn alloc_node(&mut self) -> Option<usize> {
        let idx = self.checked_node(self.header.free_head)?;
        self.header.free_head = self.nodes[idx].next;
        let node = &mut self.nodes[idx];
        node.next = NO_INDEX;
        node.prev = NO_INDEX;
        node.resource = NO_INDEX;
        Some(idx)
    }

    /// Return a node (already unlinked) to the free list.
    pub fn free_node(&mut self, idx: usize) {
        let head = self.header.free_head;
        self.nodes[idx] = QueueNode {
            index: idx as i32,
            next: head,
            prev: NO_INDEX,
            resource: NO_INDEX,
            ..QueueNode::default()
        };
        self.header.free_head = idx as i32;
    }

    /// Number of nodes on the free list.
    pub fn free_count(&self) -> usize {
        let mut count = 0;
        let mut cur = self.checked_node(self.header.free_head);
        while let Some(idx) = cur {
            if count >= self.pool_size() {
                break;
            }
            count += 1;
            cur = self.checked_node(self.nodes[idx].next);
        }
        count
    }

    /// Insert node `idx` into `resource`'s pending list by priority.
    ///
    /// The node goes after the last node whose priority is greater than or
    /// equal to its own, so equal priorities keep insertion order.
    pub fn enqueue(&mut self, resource: usize, idx: usize) {
        let priority = self.nodes[idx].priority;

        let mut after = None;
        for cur in self.pending(resource) {
            if self.nodes[cur].priority >= priority {
                after = Some(cur);
            }
        }

        match after {
            Some(a) => {
                let next = self.nodes[a].next;
                self.nodes[idx].prev = a as i32;
                self.nodes[idx].next = next;
                self.nodes[a].next = idx as i32;
                if let Some(n) = self.checked_node(next) {
                    self.nodes[n].prev = idx as i32;
                }
            }
            None => {
                let head = self.resources[resource].pending_head;
                self.nodes[idx].prev = NO_INDEX;
                self.nodes[idx].next = head;
                if let Some(h) = self.checked_node(head) {
                    self.nodes[h].prev = idx as i32;
                }
                self.resources[resource].pending_head = idx as i32;
            }
        }
        self.nodes[idx].resource = resource as i32;
    }

    /// Unlink node `idx` from whichever pending list holds it.
    pub fn dequeue(&mut self, idx: usize) {
        let QueueNode {
            next,
            prev,
            resource,
            ..
        } = self.nodes[idx];
        if resource < 0 || resource as usize >= self.resources.len() {
            return;
        }
        let resource = resource as usize;

        match self.checked_node(prev) {
            Some(p) => self.nodes[p].next = next,
            None => {
                if self.resources[resource].pending_head == idx as i32 {
                    self.resources[resource].pending_head = next;
                }
            }
        }
        if let Some(n) = self.checked_node(next) {
            self.nodes[n].prev = prev;
        }

        let node = &mut self.nodes[idx];
        node.next = NO_INDEX;
        node.prev = NO_INDEX;
        node.resource = NO_INDEX;
    }

    /// Node indices of `resource`'s pending list, head first.
    pub fn pending(&self, resource: usize) -> PendingIter<'_> {
        PendingIter {
            next: self.checked_node(self.resources[resource].pending_head),
            remaining: self.pool_size(),
            table: self,
        }
    }

    /// First node of `resource`'s list that has no grant in flight.
    pub fn first_waiting(&self, resource: usize) -> Option<usize> {
        self.pending(resource)
            .find(|&n| !self.nodes[n].notify.in_flight())
    }

    /// Queued node carrying `request_id`, if any.
    pub fn find_pending(&self, request_id: i32) -> Option<usize> {
        if request_id == 0 {
            return None;
        }
        self.nodes[..self.pool_size()]
            .iter()
            .position(|n| n.is_queued() && n.request.request_id == request_id)
    }
}

/// Iterator over one pending list.
pub struct PendingIter<'a> {
    table: &'a StateTable,
    next: Option<usize>,
    remaining: usize,
}

impl Iterator for PendingIter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let cur = self.next?;
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        self.next = self.table.checked_node(self.table.nodes[cur].next);
        Some(cur)
    }
}
