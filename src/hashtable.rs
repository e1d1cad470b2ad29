//! Chained hash table with progressive rehashing.
//!
//! `RehashingMap` keeps two generations of bucket arrays. New entries always
//! go into `newer`. When `newer` reaches its load factor it is handed over to
//! `older` and a fresh `newer` with twice the buckets takes its place; from
//! then on every insert moves at most `REHASH_WORK` entries across. No single
//! operation ever pays for a full resize.
//!
//! Entries live in a slab arena shared by both generations. Chains link arena
//! keys, so moving an entry between generations only relinks it: the entry
//! itself never moves in memory.

use slab::Slab;

/// Average chain length that triggers a resize.
pub const MAX_LOAD_FACTOR: usize = 8;

/// Entries migrated from `older` to `newer` per insert.
pub const REHASH_WORK: usize = 128;

/// Bucket count of the first allocated generation.
const INITIAL_BUCKETS: usize = 4;

struct Node<T> {
    hcode: u64,
    next: Option<usize>,
    item: T,
}

/// Position of a link in a chain: a bucket head or a predecessor's `next`.
///
/// Detaching through a link is O(1) without walking the chain again.
#[derive(Debug, Clone, Copy)]
enum Link {
    Head(usize),
    Next(usize),
}

/// One generation: a power-of-two array of chain heads.
#[derive(Default)]
struct HashTable {
    buckets: Vec<Option<usize>>,
    mask: u64,
    len: usize,
}

impl HashTable {
    fn with_buckets(n: usize) -> Self {
        debug_assert!(n.is_power_of_two(), "bucket count must be a power of two");
        Self {
            buckets: vec![None; n],
            mask: (n - 1) as u64,
            len: 0,
        }
    }

    fn is_initialized(&self) -> bool {
        !self.buckets.is_empty()
    }

    fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn bucket_of(&self, hcode: u64) -> usize {
        (hcode & self.mask) as usize
    }

    /// Push `key` at the head of its bucket.
    fn insert<T>(&mut self, nodes: &mut Slab<Node<T>>, key: usize) {
        let pos = self.bucket_of(nodes[key].hcode);
        nodes[key].next = self.buckets[pos];
        self.buckets[pos] = Some(key);
        self.len += 1;
    }

    /// Find the link pointing at the entry matching `hcode` and `eq`.
    fn find<T, F>(&self, nodes: &Slab<Node<T>>, hcode: u64, eq: &mut F) -> Option<Link>
    where
        F: FnMut(&T) -> bool,
    {
        if !self.is_initialized() {
            return None;
        }

        let pos = self.bucket_of(hcode);
        let mut link = Link::Head(pos);
        let mut cur = self.buckets[pos];
        while let Some(key) = cur {
            let node = &nodes[key];
            if node.hcode == hcode && eq(&node.item) {
                return Some(link);
            }
            link = Link::Next(key);
            cur = node.next;
        }
        None
    }

    fn target<T>(&self, nodes: &Slab<Node<T>>, link: Link) -> Option<usize> {
        match link {
            Link::Head(pos) => self.buckets.get(pos).copied().flatten(),
            Link::Next(prev) => nodes[prev].next,
        }
    }

    /// Unlink the entry `link` points at, returning its arena key.
    fn detach<T>(&mut self, nodes: &mut Slab<Node<T>>, link: Link) -> Option<usize> {
        let key = self.target(nodes, link)?;
        let next = nodes[key].next.take();
        match link {
            Link::Head(pos) => self.buckets[pos] = next,
            Link::Next(prev) => nodes[prev].next = next,
        }
        self.len -= 1;
        Some(key)
    }
}

/// Point-in-time view of a map's generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapStats {
    pub len: usize,
    pub newer_len: usize,
    pub newer_buckets: usize,
    pub older_len: usize,
    pub older_buckets: usize,
    pub migrate_pos: usize,
}

/// Hash map over caller-hashed entries with incremental resizing.
///
/// The map never hashes or compares on its own: callers pass the 64-bit hash
/// code and an equality predicate that tells colliding entries apart. It
/// does not reject duplicates either; callers look up before inserting.
pub struct RehashingMap<T> {
    nodes: Slab<Node<T>>,
    newer: HashTable,
    older: HashTable,
    migrate_pos: usize,
}

impl<T> RehashingMap<T> {
    pub fn new() -> Self {
        Self {
            nodes: Slab::new(),
            newer: HashTable::default(),
            older: HashTable::default(),
            migrate_pos: 0,
        }
    }

    /// Number of live entries across both generations.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether a migration from `older` to `newer` is in progress.
    pub fn is_rehashing(&self) -> bool {
        self.older.is_initialized()
    }

    pub fn stats(&self) -> MapStats {
        MapStats {
            len: self.len(),
            newer_len: self.newer.len,
            newer_buckets: self.newer.bucket_count(),
            older_len: self.older.len,
            older_buckets: self.older.bucket_count(),
            migrate_pos: self.migrate_pos,
        }
    }

    pub fn get<F>(&self, hcode: u64, eq: F) -> Option<&T>
    where
        F: FnMut(&T) -> bool,
    {
        let key = self.locate(hcode, eq)?;
        self.nodes.get(key).map(|node| &node.item)
    }

    pub fn get_mut<F>(&mut self, hcode: u64, eq: F) -> Option<&mut T>
    where
        F: FnMut(&T) -> bool,
    {
        let key = self.locate(hcode, eq)?;
        self.nodes.get_mut(key).map(|node| &mut node.item)
    }

    /// Insert `item` into the newer generation.
    ///
    /// May start a resize, and always performs one bounded round of
    /// migration.
    pub fn insert(&mut self, hcode: u64, item: T) {
        if !self.newer.is_initialized() {
            self.newer = HashTable::with_buckets(INITIAL_BUCKETS);
        }

        let key = self.nodes.insert(Node {
            hcode,
            next: None,
            item,
        });
        self.newer.insert(&mut self.nodes, key);

        if !self.older.is_initialized()
            && self.newer.len >= self.newer.bucket_count() * MAX_LOAD_FACTOR
        {
            self.trigger_rehashing();
        }
        self.help_rehashing();
    }

    /// Detach and return the entry matching `hcode` and `eq`.
    pub fn remove<F>(&mut self, hcode: u64, mut eq: F) -> Option<T>
    where
        F: FnMut(&T) -> bool,
    {
        let key = if let Some(link) = self.newer.find(&self.nodes, hcode, &mut eq) {
            self.newer.detach(&mut self.nodes, link)?
        } else {
            let link = self.older.find(&self.nodes, hcode, &mut eq)?;
            let key = self.older.detach(&mut self.nodes, link)?;
            self.release_drained_older();
            key
        };
        Some(self.nodes.remove(key).item)
    }

    /// Iterate over all entries, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.nodes.iter().map(|(_, node)| &node.item)
    }

    fn locate<F>(&self, hcode: u64, mut eq: F) -> Option<usize>
    where
        F: FnMut(&T) -> bool,
    {
        for table in [&self.newer, &self.older] {
            if let Some(link) = table.find(&self.nodes, hcode, &mut eq) {
                return table.target(&self.nodes, link);
            }
        }
        None
    }

    fn trigger_rehashing(&mut self) {
        let doubled = HashTable::with_buckets(self.newer.bucket_count() * 2);
        self.older = std::mem::replace(&mut self.newer, doubled);
        self.migrate_pos = 0;
    }

    /// Move up to `REHASH_WORK` entries from `older` into `newer`.
    fn help_rehashing(&mut self) {
        let mut work = 0;
        while work < REHASH_WORK
            && self.older.len > 0
            && self.migrate_pos < self.older.bucket_count()
        {
            match self.older.detach(&mut self.nodes, Link::Head(self.migrate_pos)) {
                Some(key) => {
                    self.newer.insert(&mut self.nodes, key);
                    work += 1;
                }
                None => self.migrate_pos += 1,
            }
        }

        self.release_drained_older();
    }

    /// End the migration once `older` holds nothing.
    fn release_drained_older(&mut self) {
        if self.older.len == 0 && self.older.is_initialized() {
            self.older = HashTable::default();
        }
    }
}

impl<T> Default for RehashingMap<T> {
    fn default() -> Self {
        Self::new()
    }
}
