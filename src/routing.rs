use arrayvec::ArrayVec;
use std::time::{Duration, Instant};
use tracing::trace;

use crate::{identity::Identity, key::Key, K_VALUE, NUM_BUCKETS};

/// Contacts at one distance range, most recently seen first.
#[derive(Debug)]
pub struct KBucket {
    nodes: ArrayVec<Identity, { K_VALUE }>,
    last_updated: Instant,
}

impl KBucket {
    fn new() -> Self {
        Self {
            nodes: ArrayVec::new(),
            last_updated: Instant::now(),
        }
    }

    fn position(&self, key: &Key) -> Option<usize> {
        self.nodes.iter().position(|node| node.key == *key)
    }

    /// Moves `node` to the front, dropping the tail entry when the bucket is full.
    fn insert(&mut self, node: Identity) -> UpdateResult {
        let refreshed = match self.position(&node.key) {
            Some(pos) => {
                self.nodes.remove(pos);
                true
            }
            None => false,
        };

        let evicted = if self.nodes.is_full() {
            self.nodes.pop()
        } else {
            None
        };

        self.nodes.insert(0, node);
        self.last_updated = Instant::now();

        match evicted {
            Some(evicted) => UpdateResult::Replaced { evicted },
            None if refreshed => UpdateResult::Refreshed,
            None => UpdateResult::Inserted,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Identity> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateResult {
    Inserted,
    /// The contact was already known and moved to the front.
    Refreshed,
    /// The bucket was full, its least recently seen contact was dropped.
    Replaced { evicted: Identity },
    SelfEntry,
}

#[derive(Debug)]
pub struct RoutingTable {
    local_key: Key,
    kbuckets: Vec<KBucket>,
}

impl RoutingTable {
    pub fn new(local_key: Key) -> Self {
        Self {
            kbuckets: (0..NUM_BUCKETS).map(|_| KBucket::new()).collect(),
            local_key,
        }
    }

    pub fn local_key(&self) -> &Key {
        &self.local_key
    }

    /// Records `node` as the most recently seen contact of its bucket.
    ///
    /// Eviction is unconditional: a full bucket drops its tail entry without
    /// checking whether that contact is still alive.
    pub fn add_contact(&mut self, node: Identity) -> UpdateResult {
        if node.key == self.local_key {
            trace!("Ignoring self entry {node}");
            return UpdateResult::SelfEntry;
        }

        let index = self.local_key.bucket_index(&node.key);
        let result = self.kbuckets[index].insert(node);

        if let UpdateResult::Replaced { evicted } = &result {
            trace!(bucket = index, "Evicted {evicted} in favour of {node}");
        }

        result
    }

    pub fn remove(&mut self, key: &Key) -> Option<Identity> {
        let bucket = &mut self.kbuckets[self.local_key.bucket_index(key)];
        bucket.position(key).map(|pos| bucket.nodes.remove(pos))
    }

    pub fn get(&self, key: &Key) -> Option<&Identity> {
        let bucket = &self.kbuckets[self.local_key.bucket_index(key)];
        bucket.position(key).map(|pos| &bucket.nodes[pos])
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.get(key).is_some()
    }

    pub fn node_count(&self) -> usize {
        self.kbuckets.iter().map(KBucket::len).sum()
    }

    pub fn bucket(&self, index: usize) -> Option<&KBucket> {
        self.kbuckets.get(index)
    }

    /// Up to `limit` known contacts ordered by distance to `target`.
    ///
    /// Buckets are visited front to back and the sort is stable, so equal
    /// distances keep the more recently seen contact first.
    pub fn closest_nodes(&self, target: &Key, limit: usize) -> Vec<Identity> {
        let mut closest = self
            .kbuckets
            .iter()
            .flat_map(KBucket::iter)
            .copied()
            .collect::<Vec<_>>();

        closest.sort_by_key(|node| target.distance(&node.key));
        closest.truncate(limit);
        closest
    }

    /// Indices of non-empty buckets untouched for at least `max_age`.
    pub fn stale_buckets(&self, max_age: Duration) -> Vec<usize> {
        self.kbuckets
            .iter()
            .enumerate()
            .filter(|(_, bucket)| {
                !bucket.is_empty() && bucket.last_updated.elapsed() >= max_age
            })
            .map(|(index, _)| index)
            .collect()
    }

    /// Restarts the staleness clock of bucket `index`.
    pub fn mark_refreshed(&mut self, index: usize) {
        if let Some(bucket) = self.kbuckets.get_mut(index) {
            bucket.last_updated = Instant::now();
        }
    }
}
