//! Striped read/write locks over a dynamic key space.
//!
//! A fixed array of locks is shared by all keys of a shard: a key maps to
//! stripe `xxh3(key) % stripe_count`. Multi-key operations lock every
//! touched stripe once, in ascending stripe index order, so any two callers
//! agree on a total lock order and cannot deadlock.
//!
//! Read locks are recursive: a thread already holding a stripe for reading
//! may take it again even while a writer is queued. Write locks are not
//! reentrant; a caller must request every key of an operation in one call.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use xxhash_rust::xxh3::xxh3_64;

/// Lock mode requested by an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Shared access.
    Read,
    /// Exclusive access.
    Write,
}

/// Fixed-size table of read/write locks.
pub struct StripedLockTable {
    stripes: Box<[RwLock<()>]>,
}

impl StripedLockTable {
    /// Creates a table with `count` stripes (at least one).
    #[must_use]
    pub fn new(count: usize) -> Self {
        let stripes = (0..count.max(1)).map(|_| RwLock::new(())).collect();
        Self { stripes }
    }

    /// Number of stripes.
    #[must_use]
    pub fn stripe_count(&self) -> usize {
        self.stripes.len()
    }

    /// Stripe guarding `key`.
    #[must_use]
    pub fn stripe_index(&self, key: &[u8]) -> usize {
        (xxh3_64(key) % self.stripes.len() as u64) as usize
    }

    /// Distinct stripes touched by `keys`, in ascending order.
    #[must_use]
    pub fn stripes_for<K: AsRef<[u8]>>(&self, keys: &[K]) -> Vec<usize> {
        let mut stripes: Vec<usize> = keys
            .iter()
            .map(|k| self.stripe_index(k.as_ref()))
            .collect();
        stripes.sort_unstable();
        stripes.dedup();
        stripes
    }

    /// Locks the stripes of `keys` for reading.
    pub fn read<K: AsRef<[u8]>>(&self, keys: &[K]) -> ReadGuard<'_> {
        let stripes = self.stripes_for(keys);
        let guards = stripes
            .iter()
            .map(|&i| self.stripes[i].read_recursive())
            .collect();
        ReadGuard {
            table: self,
            stripes,
            _guards: guards,
        }
    }

    /// Locks the stripes of `keys` for writing.
    pub fn write<K: AsRef<[u8]>>(&self, keys: &[K]) -> WriteGuard<'_> {
        let stripes = self.stripes_for(keys);
        self.write_stripes(stripes)
    }

    /// Locks every stripe for writing.
    pub fn write_all(&self) -> WriteGuard<'_> {
        self.write_stripes((0..self.stripes.len()).collect())
    }

    /// Locks the stripes of `keys` in the given mode.
    pub fn acquire<K: AsRef<[u8]>>(&self, keys: &[K], mode: LockMode) -> StripeGuard<'_> {
        match mode {
            LockMode::Read => StripeGuard::Read(self.read(keys)),
            LockMode::Write => StripeGuard::Write(self.write(keys)),
        }
    }

    fn write_stripes(&self, stripes: Vec<usize>) -> WriteGuard<'_> {
        let guards = stripes.iter().map(|&i| self.stripes[i].write()).collect();
        WriteGuard {
            table: self,
            stripes,
            _guards: guards,
        }
    }
}

impl std::fmt::Debug for StripedLockTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripedLockTable")
            .field("stripes", &self.stripes.len())
            .finish()
    }
}

/// Proof that a set of stripes is held.
pub trait HeldStripes {
    /// Table the stripes belong to.
    fn table(&self) -> &StripedLockTable;

    /// Held stripe indexes, ascending.
    fn stripes(&self) -> &[usize];

    /// Returns true if `key` is guarded by a held stripe of `table`.
    fn covers(&self, table: &StripedLockTable, key: &[u8]) -> bool {
        std::ptr::eq(self.table(), table)
            && self
                .stripes()
                .binary_search(&table.stripe_index(key))
                .is_ok()
    }
}

/// Shared hold on a set of stripes. Released on drop.
pub struct ReadGuard<'a> {
    table: &'a StripedLockTable,
    stripes: Vec<usize>,
    _guards: Vec<RwLockReadGuard<'a, ()>>,
}

impl HeldStripes for ReadGuard<'_> {
    fn table(&self) -> &StripedLockTable {
        self.table
    }

    fn stripes(&self) -> &[usize] {
        &self.stripes
    }
}

/// Exclusive hold on a set of stripes. Released on drop.
pub struct WriteGuard<'a> {
    table: &'a StripedLockTable,
    stripes: Vec<usize>,
    _guards: Vec<RwLockWriteGuard<'a, ()>>,
}

impl HeldStripes for WriteGuard<'_> {
    fn table(&self) -> &StripedLockTable {
        self.table
    }

    fn stripes(&self) -> &[usize] {
        &self.stripes
    }
}

/// Either kind of stripe hold.
pub enum StripeGuard<'a> {
    /// Shared.
    Read(ReadGuard<'a>),
    /// Exclusive.
    Write(WriteGuard<'a>),
}

impl HeldStripes for StripeGuard<'_> {
    fn table(&self) -> &StripedLockTable {
        match self {
            Self::Read(g) => g.table(),
            Self::Write(g) => g.table(),
        }
    }

    fn stripes(&self) -> &[usize] {
        match self {
            Self::Read(g) => g.stripes(),
            Self::Write(g) => g.stripes(),
        }
    }
}
