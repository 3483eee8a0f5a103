//! Bounded task table.
//!
//! Tasks live in a slab arena. Hash indexes map task IDs and idempotency keys
//! to arena slots. Two doubly linked lists are threaded through the slots:
//! one holds every task in creation order, the other only terminal tasks,
//! also in creation order. Per-status counters are kept alongside.
//!
//! # Eviction
//!
//! When the table is full, the oldest terminal task (by creation order) is
//! evicted to make room. It is the head of the terminal list, so eviction is
//! O(1). Non-terminal tasks are never evicted: a table full of
//! PENDING/PROCESSING tasks rejects inserts instead.
//!
//! A task joining the terminal list is linked in from the tail, so the cost
//! is the number of younger tasks that finished before it.

use std::collections::HashMap;

use super::{OrderTask, TaskId, TaskStatus};

/// Reason a task could not be inserted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InsertError {
    /// Every slot holds a non-terminal task.
    #[error("task table full: {capacity} non-terminal tasks")]
    Full {
        /// Table capacity.
        capacity: usize,
    },

    /// A task with this idempotency key is already present.
    #[error("idempotency key already present: {0}")]
    DuplicateKey(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Chain {
    Created,
    Terminal,
}

#[derive(Debug, Clone, Copy, Default)]
struct Links {
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug, Default)]
struct List {
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

#[derive(Debug)]
struct Entry {
    seq: u64,
    task: OrderTask,
    created: Links,
    /// `Some` while linked into the terminal list.
    terminal: Option<Links>,
}

const fn status_slot(status: TaskStatus) -> usize {
    match status {
        TaskStatus::Pending => 0,
        TaskStatus::Processing => 1,
        TaskStatus::Completed => 2,
        TaskStatus::Failed => 3,
    }
}

/// Arena-backed, insertion-ordered task table with bounded capacity.
#[derive(Debug)]
pub struct TaskTable {
    slots: Vec<Option<Entry>>,
    free: Vec<usize>,
    by_id: HashMap<TaskId, usize>,
    by_key: HashMap<String, usize>,
    created: List,
    terminal: List,
    counts: [usize; 4],
    next_seq: u64,
    capacity: usize,
}

impl TaskTable {
    /// Create an empty table holding at most `capacity` tasks.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Vec::with_capacity(capacity.min(4096)),
            free: Vec::new(),
            by_id: HashMap::new(),
            by_key: HashMap::new(),
            created: List::default(),
            terminal: List::default(),
            counts: [0; 4],
            next_seq: 0,
            capacity,
        }
    }

    /// Maximum number of tasks.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of tasks held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Returns true if the table holds no tasks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Number of tasks in a terminal status.
    #[must_use]
    pub const fn terminal_len(&self) -> usize {
        self.terminal.len
    }

    /// Look up a task by ID.
    #[must_use]
    pub fn get(&self, task_id: &TaskId) -> Option<&OrderTask> {
        self.by_id.get(task_id).and_then(|slot| self.task_at(*slot))
    }

    /// Look up a task by idempotency key.
    #[must_use]
    pub fn find_by_key(&self, key: &str) -> Option<&OrderTask> {
        self.by_key.get(key).and_then(|slot| self.task_at(*slot))
    }

    /// Iterate tasks in creation order.
    pub fn iter(&self) -> impl Iterator<Item = &OrderTask> {
        std::iter::successors(self.created.head, |slot| {
            self.links(*slot, Chain::Created).next
        })
        .filter_map(|slot| self.task_at(slot))
    }

    /// Count tasks by status. O(1).
    #[must_use]
    pub const fn count_by_status(&self, status: TaskStatus) -> usize {
        self.counts[status_slot(status)]
    }

    /// Insert a new task, evicting the oldest terminal task if full.
    ///
    /// Returns the evicted task, if any.
    pub fn insert(&mut self, task: OrderTask) -> Result<Option<OrderTask>, InsertError> {
        if self.by_key.contains_key(&task.idempotency_key) {
            return Err(InsertError::DuplicateKey(task.idempotency_key));
        }

        let evicted = if self.len() >= self.capacity {
            match self.evict_oldest_terminal() {
                Some(evicted) => Some(evicted),
                None => {
                    return Err(InsertError::Full {
                        capacity: self.capacity,
                    });
                }
            }
        } else {
            None
        };

        let seq = self.next_seq;
        self.next_seq += 1;

        let status = task.status;
        let task_id = task.task_id;
        let key = task.idempotency_key.clone();
        let entry = Entry {
            seq,
            task,
            created: Links::default(),
            terminal: None,
        };

        let slot = if let Some(slot) = self.free.pop() {
            self.slots[slot] = Some(entry);
            slot
        } else {
            self.slots.push(Some(entry));
            self.slots.len() - 1
        };

        self.by_id.insert(task_id, slot);
        self.by_key.insert(key, slot);
        self.counts[status_slot(status)] += 1;
        self.link_after(Chain::Created, slot, self.created.tail);
        if status.is_terminal() {
            self.link_terminal(slot);
        }

        Ok(evicted)
    }

    /// Apply a mutation to a task and return the updated snapshot.
    ///
    /// Keeps the status counters and the terminal list in sync.
    pub fn update<F>(&mut self, task_id: &TaskId, mutate: F) -> Option<OrderTask>
    where
        F: FnOnce(&mut OrderTask),
    {
        let slot = *self.by_id.get(task_id)?;
        let entry = self.slots.get_mut(slot)?.as_mut()?;

        let before = entry.task.status;
        mutate(&mut entry.task);
        let snapshot = entry.task.clone();
        let linked = entry.terminal.is_some();

        self.counts[status_slot(before)] -= 1;
        self.counts[status_slot(snapshot.status)] += 1;

        match (snapshot.is_terminal(), linked) {
            (true, false) => self.link_terminal(slot),
            (false, true) => self.unlink(Chain::Terminal, slot),
            _ => {}
        }

        Some(snapshot)
    }

    /// Remove a task.
    pub fn remove(&mut self, task_id: &TaskId) -> Option<OrderTask> {
        let slot = *self.by_id.get(task_id)?;
        let linked = self.entry(slot)?.terminal.is_some();

        self.unlink(Chain::Created, slot);
        if linked {
            self.unlink(Chain::Terminal, slot);
        }

        let entry = self.slots.get_mut(slot)?.take()?;
        self.by_id.remove(task_id);
        self.by_key.remove(&entry.task.idempotency_key);
        self.counts[status_slot(entry.task.status)] -= 1;
        self.free.push(slot);

        Some(entry.task)
    }

    /// Evict the oldest terminal task by creation order.
    pub fn evict_oldest_terminal(&mut self) -> Option<OrderTask> {
        let slot = self.terminal.head?;
        let task_id = self.task_at(slot)?.task_id;
        self.remove(&task_id)
    }

    // =========================================================================
    // Intrusive lists
    // =========================================================================

    fn entry(&self, slot: usize) -> Option<&Entry> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    fn task_at(&self, slot: usize) -> Option<&OrderTask> {
        self.entry(slot).map(|entry| &entry.task)
    }

    fn seq_at(&self, slot: usize) -> u64 {
        self.entry(slot).map_or(0, |entry| entry.seq)
    }

    fn links(&self, slot: usize, chain: Chain) -> Links {
        self.entry(slot)
            .and_then(|entry| match chain {
                Chain::Created => Some(entry.created),
                Chain::Terminal => entry.terminal,
            })
            .unwrap_or_default()
    }

    fn set_links(&mut self, slot: usize, chain: Chain, links: Option<Links>) {
        if let Some(entry) = self.slots.get_mut(slot).and_then(Option::as_mut) {
            match chain {
                Chain::Created => entry.created = links.unwrap_or_default(),
                Chain::Terminal => entry.terminal = links,
            }
        }
    }

    fn list_mut(&mut self, chain: Chain) -> &mut List {
        match chain {
            Chain::Created => &mut self.created,
            Chain::Terminal => &mut self.terminal,
        }
    }

    /// Link `slot` after `after`, or at the head when `after` is `None`.
    fn link_after(&mut self, chain: Chain, slot: usize, after: Option<usize>) {
        let next = match after {
            Some(prev) => self.links(prev, chain).next,
            None => self.list_mut(chain).head,
        };
        self.set_links(slot, chain, Some(Links { prev: after, next }));

        match after {
            Some(prev) => {
                let links = self.links(prev, chain);
                self.set_links(prev, chain, Some(Links { next: Some(slot), ..links }));
            }
            None => self.list_mut(chain).head = Some(slot),
        }
        match next {
            Some(next) => {
                let links = self.links(next, chain);
                self.set_links(next, chain, Some(Links { prev: Some(slot), ..links }));
            }
            None => self.list_mut(chain).tail = Some(slot),
        }

        self.list_mut(chain).len += 1;
    }

    fn unlink(&mut self, chain: Chain, slot: usize) {
        let Links { prev, next } = self.links(slot, chain);

        match prev {
            Some(prev) => {
                let links = self.links(prev, chain);
                self.set_links(prev, chain, Some(Links { next, ..links }));
            }
            None => self.list_mut(chain).head = next,
        }
        match next {
            Some(next) => {
                let links = self.links(next, chain);
                self.set_links(next, chain, Some(Links { prev, ..links }));
            }
            None => self.list_mut(chain).tail = prev,
        }

        self.set_links(slot, chain, None);
        let list = self.list_mut(chain);
        list.len = list.len.saturating_sub(1);
    }

    /// Insert into the terminal list at its creation-order position.
    fn link_terminal(&mut self, slot: usize) {
        let seq = self.seq_at(slot);
        let mut after = self.terminal.tail;
        while let Some(candidate) = after {
            if self.seq_at(candidate) < seq {
                break;
            }
            after = self.links(candidate, Chain::Terminal).prev;
        }
        self.link_after(Chain::Terminal, slot, after);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::domain::order_task::{OrderOperation, OrderParams};

    fn task(qty: u32) -> OrderTask {
        OrderTask::new(
            OrderOperation::PlaceOrder,
            "primary".to_string(),
            OrderParams::try_from(json!({"symbol": "INFY", "qty": qty})).unwrap(),
        )
    }

    fn finish(table: &mut TaskTable, id: &TaskId) {
        table.update(id, |t| t.mark_completed(json!({"ok": true})));
    }

    #[test]
    fn insert_and_lookup() {
        let mut table = TaskTable::new(4);
        let t = task(1);
        let id = t.task_id;
        let key = t.idempotency_key.clone();

        assert!(table.insert(t).unwrap().is_none());
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(&id).unwrap().task_id, id);
        assert_eq!(table.find_by_key(&key).unwrap().task_id, id);
    }

    #[test]
    fn duplicate_key_is_refused() {
        let mut table = TaskTable::new(4);
        table.insert(task(1)).unwrap();
        let err = table.insert(task(1)).unwrap_err();
        assert!(matches!(err, InsertError::DuplicateKey(_)));
    }

    #[test]
    fn iteration_follows_creation_order() {
        let mut table = TaskTable::new(8);
        let ids: Vec<_> = (0..5)
            .map(|q| {
                let t = task(q);
                let id = t.task_id;
                table.insert(t).unwrap();
                id
            })
            .collect();

        let seen: Vec<_> = table.iter().map(|t| t.task_id).collect();
        assert_eq!(seen, ids);
    }

    #[test]
    fn full_table_evicts_oldest_terminal_first() {
        let mut table = TaskTable::new(3);
        let a = task(1);
        let b = task(2);
        let c = task(3);
        let (a_id, b_id, c_id) = (a.task_id, b.task_id, c.task_id);
        table.insert(a).unwrap();
        table.insert(b).unwrap();
        table.insert(c).unwrap();

        // b and c finish; a is still pending
        finish(&mut table, &c_id);
        finish(&mut table, &b_id);

        let evicted = table.insert(task(4)).unwrap().unwrap();
        assert_eq!(evicted.task_id, b_id);
        assert!(table.get(&a_id).is_some());
        assert!(table.get(&c_id).is_some());
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn full_table_of_active_tasks_rejects() {
        let mut table = TaskTable::new(2);
        table.insert(task(1)).unwrap();
        table.insert(task(2)).unwrap();

        let err = table.insert(task(3)).unwrap_err();
        assert_eq!(err, InsertError::Full { capacity: 2 });
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn removed_slots_are_reused() {
        let mut table = TaskTable::new(4);
        let t = task(1);
        let id = t.task_id;
        table.insert(t).unwrap();
        table.remove(&id).unwrap();
        assert!(table.is_empty());

        let t2 = task(2);
        let id2 = t2.task_id;
        table.insert(t2).unwrap();
        assert_eq!(table.slots.len(), 1);
        assert!(table.get(&id2).is_some());
        assert!(table.get(&id).is_none());
    }

    #[test]
    fn update_tracks_terminal_index() {
        let mut table = TaskTable::new(4);
        let t = task(1);
        let id = t.task_id;
        table.insert(t).unwrap();
        assert_eq!(table.terminal_len(), 0);

        table.update(&id, OrderTask::mark_processing);
        assert_eq!(table.terminal_len(), 0);
        assert_eq!(table.count_by_status(TaskStatus::Processing), 1);

        table.update(&id, |t| t.mark_failed("boom"));
        assert_eq!(table.terminal_len(), 1);
        assert_eq!(table.get(&id).unwrap().error.as_deref(), Some("boom"));
    }

    #[test]
    fn status_counters_follow_every_change() {
        let mut table = TaskTable::new(8);
        let ids: Vec<_> = (0..4)
            .map(|q| {
                let t = task(q);
                let id = t.task_id;
                table.insert(t).unwrap();
                id
            })
            .collect();
        assert_eq!(table.count_by_status(TaskStatus::Pending), 4);

        table.update(&ids[0], OrderTask::mark_processing);
        table.update(&ids[1], OrderTask::mark_processing);
        finish(&mut table, &ids[1]);
        table.update(&ids[2], |t| t.mark_failed("rejected"));
        table.remove(&ids[3]);

        assert_eq!(table.count_by_status(TaskStatus::Pending), 0);
        assert_eq!(table.count_by_status(TaskStatus::Processing), 1);
        assert_eq!(table.count_by_status(TaskStatus::Completed), 1);
        assert_eq!(table.count_by_status(TaskStatus::Failed), 1);
        assert_eq!(table.len(), 3);
        assert_eq!(table.terminal_len(), 2);
    }

    #[test]
    fn out_of_order_completions_evict_in_creation_order() {
        let mut table = TaskTable::new(5);
        let ids: Vec<_> = (0..5)
            .map(|q| {
                let t = task(q);
                let id = t.task_id;
                table.insert(t).unwrap();
                id
            })
            .collect();

        for i in [3, 0, 4, 2, 1] {
            finish(&mut table, &ids[i]);
        }

        let evicted: Vec<_> = (10..15)
            .map(|q| table.insert(task(q)).unwrap().unwrap().task_id)
            .collect();
        assert_eq!(evicted, ids);
        assert_eq!(table.terminal_len(), 0);
        assert_eq!(table.count_by_status(TaskStatus::Pending), 5);
    }

    #[test]
    fn removal_from_the_middle_keeps_order() {
        let mut table = TaskTable::new(8);
        let ids: Vec<_> = (0..4)
            .map(|q| {
                let t = task(q);
                let id = t.task_id;
                table.insert(t).unwrap();
                id
            })
            .collect();

        table.remove(&ids[1]);
        table.remove(&ids[3]);
        let t = task(9);
        let late = t.task_id;
        table.insert(t).unwrap();

        let seen: Vec<_> = table.iter().map(|t| t.task_id).collect();
        assert_eq!(seen, vec![ids[0], ids[2], late]);
    }

    #[test]
    fn eviction_frees_the_key() {
        let mut table = TaskTable::new(1);
        let first = task(1);
        let first_id = first.task_id;
        table.insert(first).unwrap();
        finish(&mut table, &first_id);

        let second = task(2);
        let second_id = second.task_id;
        table.insert(second).unwrap();
        table.update(&second_id, |t| t.mark_failed("x"));

        // The evicted request can be admitted again.
        assert!(table.insert(task(1)).is_ok());
        assert!(table.get(&first_id).is_none());
    }
}
