//! Stored references: the bridge between DAP's stateless integer handles and
//! VM Service object ids.
//!
//! DAP hands the client opaque integers (`variablesReference`, `frameId`,
//! `sourceReference`); the VM Service wants object ids scoped to an isolate.
//! The registry maps one to the other. Handles are unique for the lifetime of
//! the session, monotonically increasing, and never reused; all handles owned
//! by a thread are purged together when that thread is torn down or resumed.

use std::collections::HashMap;

use serde_json::Value;

/// Data a stored handle resolves to.
#[derive(Clone, Debug)]
pub enum StoredData {
    /// A stack frame (raw VM `Frame` payload plus its index for
    /// `evaluateInFrame`).
    Frame { frame_index: i64, frame: Value },
    /// The local variables scope of a stored frame.
    FrameLocals { frame_index: i64, frame: Value },
    /// An instance reference whose children may be expanded.
    Instance {
        instance: Value,
        evaluate_name: Option<String>,
    },
    /// One entry of a `Map`: key and value kept as a pair so each side can be
    /// fetched independently without re-running the map lookup.
    MapEntry {
        key: Value,
        value: Value,
        evaluate_name: Option<String>,
    },
    /// A script whose source is served through the DAP `source` request.
    Script {
        isolate_id: String,
        script_id: String,
    },
    /// A presentation-only frame (an asynchronous gap marker). It owns no
    /// scopes; the handle exists so every frame id stays unique.
    Label,
}

#[derive(Debug)]
pub struct StoredRefs {
    next: i64,
    entries: HashMap<i64, (i64, StoredData)>,
}

impl StoredRefs {
    pub fn new() -> Self {
        Self {
            next: 0,
            entries: HashMap::new(),
        }
    }

    /// Allocate a fresh handle owned by `thread_num`.
    pub fn store(&mut self, thread_num: i64, data: StoredData) -> i64 {
        self.next += 1;
        let handle = self.next;
        self.entries.insert(handle, (thread_num, data));
        handle
    }

    pub fn get(&self, handle: i64) -> Option<&(i64, StoredData)> {
        self.entries.get(&handle)
    }

    pub fn owning_thread(&self, handle: i64) -> Option<i64> {
        self.entries.get(&handle).map(|(thread, _)| *thread)
    }

    /// Drop every handle owned by `thread_num`. Handles are never reallocated,
    /// so stale client references resolve to "not found" rather than aliasing
    /// a new object.
    pub fn purge_thread(&mut self, thread_num: i64) {
        self.entries.retain(|_, (owner, _)| *owner != thread_num);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for StoredRefs {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn instance(value: &str) -> StoredData {
        StoredData::Instance {
            instance: json!({"kind": "String", "valueAsString": value}),
            evaluate_name: None,
        }
    }

    #[test]
    fn handles_are_unique_and_monotonic() {
        let mut refs = StoredRefs::new();
        let a = refs.store(1, instance("a"));
        let b = refs.store(1, instance("b"));
        let c = refs.store(2, instance("c"));
        assert!(a < b && b < c);
    }

    #[test]
    fn purging_a_thread_never_recycles_handles() {
        let mut refs = StoredRefs::new();
        let a = refs.store(1, instance("a"));
        let _b = refs.store(2, instance("b"));

        refs.purge_thread(1);
        assert!(refs.get(a).is_none());

        // A new handle must not alias the purged one.
        let d = refs.store(1, instance("d"));
        assert!(d > a);
        assert_eq!(refs.owning_thread(d), Some(1));
    }

    #[test]
    fn clearing_drops_every_thread_but_keeps_handles_monotonic() {
        let mut refs = StoredRefs::new();
        let a = refs.store(1, instance("a"));
        let b = refs.store(2, instance("b"));

        refs.clear();
        assert!(refs.is_empty());
        assert!(refs.get(a).is_none());
        assert!(refs.get(b).is_none());

        // Session teardown clears, but a handle is still never reissued.
        assert!(refs.store(1, instance("c")) > b);
    }

    #[test]
    fn purge_only_affects_the_owning_thread() {
        let mut refs = StoredRefs::new();
        let a = refs.store(1, instance("a"));
        let b = refs.store(2, instance("b"));

        refs.purge_thread(2);
        assert!(refs.get(a).is_some());
        assert!(refs.get(b).is_none());
        assert_eq!(refs.len(), 1);
    }
}
