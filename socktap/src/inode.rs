use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use socktap_common::Domain;
use tracing::debug;

use crate::state::State;

/// Logical socket identity: the kernel open file shared by every descriptor
/// created from the same socket(2), whether by dup(2) or SCM_RIGHTS.
pub struct Inode {
    pub number: u64,
    pub domain: Domain,
    state: ArcSwap<State>,
    aliases: Mutex<HashSet<u64>>,
}

impl Inode {
    pub fn new(domain: Domain, number: u64, state: State) -> Arc<Inode> {
        Arc::new(Inode {
            number,
            domain,
            state: ArcSwap::from_pointee(state),
            aliases: Mutex::new(HashSet::new()),
        })
    }

    pub fn state(&self) -> Arc<State> {
        self.state.load_full()
    }

    /// Single CAS slot for all state transitions; every observer sees a
    /// total order of states. Returns false when `prev` is stale.
    pub fn transition(&self, prev: &Arc<State>, next: Arc<State>) -> bool {
        let old = self.state.compare_and_swap(prev, next);
        Arc::ptr_eq(&*old, prev)
    }

    pub(crate) fn add_alias(&self, id: u64) {
        self.aliases.lock().unwrap().insert(id);
    }

    /// Remove an alias; returns true when it was the last one.
    pub(crate) fn remove_alias(&self, id: u64) -> bool {
        let mut set = self.aliases.lock().unwrap();
        set.remove(&id);
        set.is_empty()
    }
}

/// Process-wide map from kernel inode number to [`Inode`], deduplicating
/// descriptors that alias the same open file.
pub struct InodeTable {
    entries: Mutex<HashMap<u64, Arc<Inode>>>,
}

impl InodeTable {
    pub fn new() -> Arc<InodeTable> {
        Arc::new(InodeTable {
            entries: Mutex::new(HashMap::new()),
        })
    }

    pub fn get(&self, number: u64) -> Option<Arc<Inode>> {
        self.entries.lock().unwrap().get(&number).cloned()
    }

    pub fn insert(&self, inode: &Arc<Inode>) {
        self.entries
            .lock()
            .unwrap()
            .insert(inode.number, Arc::clone(inode));
    }

    pub fn remove(&self, number: u64) {
        if self.entries.lock().unwrap().remove(&number).is_some() {
            debug!("dropped inode {} from table", number);
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_cas() {
        let inode = Inode::new(Domain::V4, 7, State::Passive { bind: None, errno: None });
        let prev = inode.state();
        assert_eq!(prev.tag(), "passive");

        let next = Arc::new(State::Closed);
        assert!(inode.transition(&prev, next));
        assert_eq!(inode.state().tag(), "closed");

        // stale prev loses
        let stale = prev;
        assert!(!inode.transition(&stale, Arc::new(State::Passive { bind: None, errno: None })));
        assert_eq!(inode.state().tag(), "closed");
    }

    #[test]
    fn test_alias_tracking() {
        let inode = Inode::new(Domain::V6, 9, State::Passive { bind: None, errno: None });
        inode.add_alias(1);
        inode.add_alias(2);
        assert!(!inode.remove_alias(1));
        assert!(inode.remove_alias(2));
    }

    #[test]
    fn test_table_dedup() {
        let table = InodeTable::new();
        let a = Inode::new(Domain::V4, 42, State::Passive { bind: None, errno: None });
        table.insert(&a);
        table.insert(&a);
        assert_eq!(table.len(), 1);
        assert!(Arc::ptr_eq(&table.get(42).unwrap(), &a));
        table.remove(42);
        assert!(table.get(42).is_none());
    }
}
