use std::collections::{BTreeSet, HashMap};

use keystone_types::{NodeId, Oid};
use tracing::debug;

/// What a lock protects within one application.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockKey {
    Object(Oid),
    Binding(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

#[derive(Clone, Debug)]
enum Holders {
    Readers(BTreeSet<NodeId>),
    Writer(NodeId),
}

impl Holders {
    fn contains(&self, node: NodeId) -> bool {
        match self {
            Self::Readers(readers) => readers.contains(&node),
            Self::Writer(writer) => *writer == node,
        }
    }
}

/// Shared lock over the binding names in `(from, to]`.
///
/// A `None` lower bound sorts before every name and a `None` upper bound
/// after every name.
#[derive(Clone, Debug, PartialEq, Eq)]
struct RangeLock {
    node: NodeId,
    app: String,
    from: Option<String>,
    to: Option<String>,
}

impl RangeLock {
    fn covers(&self, name: &str) -> bool {
        self.from.as_deref().map_or(true, |from| name > from) && self.to.as_deref().map_or(true, |to| name <= to)
    }

    /// Whether this range lies inside the release range `[from, to]`.
    fn within(&self, from: Option<&str>, to: Option<&str>) -> bool {
        let lower_ok = match (from, self.from.as_deref()) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(bound), Some(own)) => bound <= own,
        };
        let upper_ok = match (to, self.to.as_deref()) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(bound), Some(own)) => own <= bound,
        };
        lower_ok && upper_ok
    }
}

fn range_covers(from: Option<&str>, to: Option<&str>, name: &str) -> bool {
    from.map_or(true, |from| name > from) && to.map_or(true, |to| name <= to)
}

/// Cross-node lock state for every application on the metaserver.
///
/// Requests never block: a conflicting acquisition returns `false` and the
/// node retries its whole transaction later.
#[derive(Debug, Default)]
pub struct LockTable {
    locks: HashMap<(String, LockKey), Holders>,
    ranges: Vec<RangeLock>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `node` could take `mode` on the key right now.
    pub fn can_acquire(&self, node: NodeId, app: &str, key: &LockKey, mode: LockMode) -> bool {
        let held = self.locks.get(&(app.to_string(), key.clone()));
        let compatible = match (mode, held) {
            (_, None) => true,
            (LockMode::Read, Some(Holders::Readers(_))) => true,
            (LockMode::Write, Some(Holders::Readers(readers))) => readers.iter().all(|r| *r == node),
            (_, Some(Holders::Writer(writer))) => *writer == node,
        };
        if !compatible {
            return false;
        }
        match (mode, key) {
            (LockMode::Write, LockKey::Binding(name)) => !self
                .ranges
                .iter()
                .any(|range| range.node != node && range.app == app && range.covers(name)),
            _ => true,
        }
    }

    /// Take or upgrade a lock. Returns `false` on conflict, leaving the table
    /// unchanged.
    pub fn acquire(&mut self, node: NodeId, app: &str, key: LockKey, mode: LockMode) -> bool {
        if !self.can_acquire(node, app, &key, mode) {
            debug!(%node, app, ?key, ?mode, "lock denied");
            return false;
        }
        let slot = (app.to_string(), key);
        match mode {
            LockMode::Write => {
                self.locks.insert(slot, Holders::Writer(node));
            }
            LockMode::Read => {
                let holders = self.locks.entry(slot).or_insert_with(|| Holders::Readers(BTreeSet::new()));
                // A writer reading its own key keeps the write lock.
                if let Holders::Readers(readers) = holders {
                    readers.insert(node);
                }
            }
        }
        true
    }

    /// Take a shared range lock over the binding names in `(from, to]`.
    pub fn acquire_range(&mut self, node: NodeId, app: &str, from: Option<&str>, to: Option<&str>) -> bool {
        let blocked = self.locks.iter().any(|((lock_app, key), holders)| {
            lock_app == app
                && matches!(holders, Holders::Writer(writer) if *writer != node)
                && matches!(key, LockKey::Binding(name) if range_covers(from, to, name))
        });
        if blocked {
            debug!(%node, app, ?from, ?to, "range lock denied");
            return false;
        }
        let range = RangeLock {
            node,
            app: app.to_string(),
            from: from.map(str::to_string),
            to: to.map(str::to_string),
        };
        if !self.ranges.contains(&range) {
            self.ranges.push(range);
        }
        true
    }

    pub fn release(&mut self, node: NodeId, app: &str, key: LockKey) {
        let slot = (app.to_string(), key);
        let now_empty = match self.locks.get_mut(&slot) {
            Some(Holders::Readers(readers)) => {
                readers.remove(&node);
                readers.is_empty()
            }
            Some(Holders::Writer(writer)) => *writer == node,
            None => false,
        };
        if now_empty {
            self.locks.remove(&slot);
        }
    }

    /// Drop `node`'s range locks that fall inside `[from, to]`.
    pub fn release_range(&mut self, node: NodeId, app: &str, from: Option<&str>, to: Option<&str>) -> usize {
        let before = self.ranges.len();
        self.ranges
            .retain(|range| !(range.node == node && range.app == app && range.within(from, to)));
        before - self.ranges.len()
    }

    /// Drop every lock `node` holds. Returns how many were released.
    pub fn release_all(&mut self, node: NodeId) -> usize {
        let mut released = 0;
        self.locks.retain(|_, holders| match holders {
            Holders::Writer(writer) if *writer == node => {
                released += 1;
                false
            }
            Holders::Writer(_) => true,
            Holders::Readers(readers) => {
                if readers.remove(&node) {
                    released += 1;
                }
                !readers.is_empty()
            }
        });
        let before = self.ranges.len();
        self.ranges.retain(|range| range.node != node);
        released + before - self.ranges.len()
    }

    /// Number of key and range locks `node` holds.
    pub fn held_by(&self, node: NodeId) -> usize {
        self.locks.values().filter(|holders| holders.contains(node)).count()
            + self.ranges.iter().filter(|range| range.node == node).count()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty() && self.ranges.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: NodeId = NodeId(1);
    const B: NodeId = NodeId(2);

    fn obj(n: u64) -> LockKey {
        LockKey::Object(Oid::new(n))
    }

    fn binding(name: &str) -> LockKey {
        LockKey::Binding(name.to_string())
    }

    #[test]
    fn write_excludes_other_nodes() {
        let mut locks = LockTable::new();
        assert!(locks.acquire(A, "mw", obj(42), LockMode::Write));
        assert!(!locks.acquire(B, "mw", obj(42), LockMode::Write));
        assert!(!locks.acquire(B, "mw", obj(42), LockMode::Read));
        assert!(locks.acquire(A, "mw", obj(42), LockMode::Read));

        locks.release(A, "mw", obj(42));
        assert!(locks.acquire(B, "mw", obj(42), LockMode::Write));
    }

    #[test]
    fn apps_do_not_share_locks() {
        let mut locks = LockTable::new();
        assert!(locks.acquire(A, "mw", obj(1), LockMode::Write));
        assert!(locks.acquire(B, "chat", obj(1), LockMode::Write));
    }

    #[test]
    fn readers_share_and_sole_reader_upgrades() {
        let mut locks = LockTable::new();
        assert!(locks.acquire(A, "mw", obj(7), LockMode::Read));
        assert!(locks.acquire(B, "mw", obj(7), LockMode::Read));
        assert!(!locks.acquire(A, "mw", obj(7), LockMode::Write));

        locks.release(B, "mw", obj(7));
        assert!(locks.acquire(A, "mw", obj(7), LockMode::Write));
        assert!(!locks.acquire(B, "mw", obj(7), LockMode::Read));
    }

    #[test]
    fn release_by_non_holder_is_ignored() {
        let mut locks = LockTable::new();
        locks.acquire(A, "mw", obj(3), LockMode::Write);
        locks.release(B, "mw", obj(3));
        assert!(!locks.acquire(B, "mw", obj(3), LockMode::Write));
    }

    #[test]
    fn range_lock_blocks_writes_inside_range() {
        let mut locks = LockTable::new();
        assert!(locks.acquire_range(A, "mw", Some("b"), Some("d")));
        assert!(!locks.acquire(B, "mw", binding("c"), LockMode::Write));
        assert!(!locks.acquire(B, "mw", binding("d"), LockMode::Write));
        assert!(locks.acquire(B, "mw", binding("b"), LockMode::Write));
        assert!(locks.acquire(B, "mw", binding("e"), LockMode::Write));
        assert!(locks.acquire(B, "mw", binding("c"), LockMode::Read));
        assert!(!locks.acquire(A, "mw", binding("c"), LockMode::Write));
    }

    #[test]
    fn open_bounds_cover_everything() {
        let mut locks = LockTable::new();
        assert!(locks.acquire_range(A, "mw", None, None));
        assert!(!locks.acquire(B, "mw", binding(""), LockMode::Write));
        assert!(!locks.acquire(B, "mw", binding("zzz"), LockMode::Write));
    }

    #[test]
    fn range_denied_over_foreign_write() {
        let mut locks = LockTable::new();
        assert!(locks.acquire(B, "mw", binding("m"), LockMode::Write));
        assert!(!locks.acquire_range(A, "mw", Some("a"), None));
        assert!(locks.acquire_range(A, "mw", Some("m"), None));
        assert!(locks.acquire_range(B, "mw", None, None));
    }

    #[test]
    fn release_range_uses_null_bounds() {
        let mut locks = LockTable::new();
        locks.acquire_range(A, "mw", None, Some("c"));
        locks.acquire_range(A, "mw", Some("c"), Some("f"));
        locks.acquire_range(A, "mw", Some("f"), None);

        assert_eq!(locks.release_range(A, "mw", Some("c"), Some("f")), 1);
        assert_eq!(locks.release_range(A, "mw", Some("g"), None), 0);
        assert_eq!(locks.release_range(A, "mw", None, None), 2);
        assert!(locks.is_empty());
    }

    #[test]
    fn release_all_frees_everything_for_node() {
        let mut locks = LockTable::new();
        locks.acquire(A, "mw", obj(1), LockMode::Write);
        locks.acquire(A, "mw", obj(2), LockMode::Read);
        locks.acquire(B, "mw", obj(2), LockMode::Read);
        locks.acquire_range(A, "mw", None, None);
        assert_eq!(locks.held_by(A), 3);

        assert_eq!(locks.release_all(A), 3);
        assert_eq!(locks.held_by(A), 0);
        assert_eq!(locks.held_by(B), 1);
        assert!(locks.acquire(B, "mw", obj(1), LockMode::Write));
        assert!(locks.acquire(B, "mw", binding("x"), LockMode::Write));
    }
}
