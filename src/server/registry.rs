use crate::error::Error;
use crate::wire::WorkerRef;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::Hash;

/// Bidirectional map between live workers and their wire references.
///
/// References are small positive integers. A released reference is reused, smallest first,
/// so a long lived connection keeps its numbers short.
pub struct ThreadRegistry<W> {
    by_ref: BTreeMap<WorkerRef, W>,
    by_worker: HashMap<W, WorkerRef>,
    free: BTreeSet<u32>,
    next: u32,
}

impl<W> Default for ThreadRegistry<W> {
    fn default() -> Self {
        Self {
            by_ref: BTreeMap::new(),
            by_worker: HashMap::new(),
            free: BTreeSet::new(),
            next: 1,
        }
    }
}

impl<W: Copy + Eq + Hash> ThreadRegistry<W> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a reference for `worker`, allocating one if the worker is not registered yet.
    pub fn allocate(&mut self, worker: W) -> WorkerRef {
        if let Some(r) = self.by_worker.get(&worker) {
            return *r;
        }

        let num = self.free.pop_first().unwrap_or_else(|| {
            let num = self.next;
            self.next += 1;
            num
        });
        let r = WorkerRef(num);
        self.by_ref.insert(r, worker);
        self.by_worker.insert(worker, r);
        r
    }

    /// Forget a reference. Releasing an unknown reference does nothing.
    pub fn release(&mut self, r: WorkerRef) -> Option<W> {
        let worker = self.by_ref.remove(&r)?;
        self.by_worker.remove(&worker);
        self.free.insert(r.0);
        Some(worker)
    }

    pub fn lookup(&self, r: WorkerRef) -> Result<W, Error> {
        self.by_ref.get(&r).copied().ok_or(Error::RefNotFound(r))
    }

    pub fn ref_of(&self, worker: W) -> Option<WorkerRef> {
        self.by_worker.get(&worker).copied()
    }

    pub fn len(&self) -> usize {
        self.by_ref.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_ref.is_empty()
    }

    /// Drop every entry and start numbering from 1 again.
    pub fn clear(&mut self) {
        self.by_ref.clear();
        self.by_worker.clear();
        self.free.clear();
        self.next = 1;
    }
}
