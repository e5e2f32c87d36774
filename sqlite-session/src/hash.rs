//! Chained hash table over an entry arena.
//!
//! Entries live in a growable vector and buckets hold the index of the first
//! entry in their chain; each entry links to the next by index. Entries are
//! never removed individually, only all at once by [`BucketTable::clear`].

use crate::error::{Error, Result};

#[derive(Debug)]
struct Slot<E> {
    hash: u32,
    next: Option<usize>,
    entry: E,
}

#[derive(Debug)]
pub(crate) struct BucketTable<E> {
    slots: Vec<Slot<E>>,
    heads: Vec<Option<usize>>,
    min_buckets: usize,
}

impl<E> BucketTable<E> {
    pub(crate) fn new(min_buckets: usize) -> Self {
        Self {
            slots: Vec::new(),
            heads: Vec::new(),
            min_buckets: min_buckets.max(1),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub(crate) fn bucket_count(&self) -> usize {
        self.heads.len()
    }

    /// Returns the first entry in `hash`'s chain matching `pred`.
    pub(crate) fn find<F>(&self, hash: u32, mut pred: F) -> Option<&E>
    where
        F: FnMut(&E) -> bool,
    {
        self.chain(hash).find(|entry| pred(*entry))
    }

    /// Iterates every entry in the chain `hash` falls into. Entries with a
    /// different hash may share the chain; callers compare keys themselves.
    pub(crate) fn chain(&self, hash: u32) -> Chain<'_, E> {
        let next = if self.heads.is_empty() {
            None
        } else {
            self.heads[bucket_of(hash, self.heads.len())]
        };
        Chain { table: self, next }
    }

    /// Grows the table if needed, then links `entry` at the head of its chain.
    ///
    /// Growth happens once the table is at least half full. Failing to grow
    /// an existing table is tolerated (chains just get longer); failing to
    /// allocate the very first bucket array, or the entry itself, is not.
    pub(crate) fn insert(&mut self, hash: u32, entry: E) -> Result<()> {
        if self.slots.len() >= self.heads.len() / 2 {
            if let Err(err) = self.grow() {
                if self.heads.is_empty() {
                    return Err(err);
                }
                tracing::debug!(
                    buckets = self.heads.len(),
                    entries = self.slots.len(),
                    "hash table growth failed; continuing without resize"
                );
            }
        }
        self.slots
            .try_reserve(1)
            .map_err(|_| Error::OutOfMemory)?;
        let bucket = bucket_of(hash, self.heads.len());
        let index = self.slots.len();
        self.slots.push(Slot {
            hash,
            next: self.heads[bucket],
            entry,
        });
        self.heads[bucket] = Some(index);
        Ok(())
    }

    /// Doubles the bucket array (or allocates `min_buckets`) and relinks every
    /// entry in place.
    fn grow(&mut self) -> Result<()> {
        let target = if self.heads.is_empty() {
            self.min_buckets
        } else {
            self.heads.len().saturating_mul(2)
        };
        let mut heads: Vec<Option<usize>> = Vec::new();
        heads
            .try_reserve_exact(target)
            .map_err(|_| Error::OutOfMemory)?;
        heads.resize(target, None);

        // Relink from the oldest entry so each chain keeps newest-first order.
        for index in 0..self.slots.len() {
            let bucket = bucket_of(self.slots[index].hash, target);
            self.slots[index].next = heads[bucket];
            heads[bucket] = Some(index);
        }
        self.heads = heads;
        Ok(())
    }

    /// Iterates entries bucket by bucket, each chain newest-first.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &E> + '_ {
        self.heads.iter().flat_map(move |head| Chain {
            table: self,
            next: *head,
        })
    }

    pub(crate) fn clear(&mut self) {
        self.slots.clear();
        self.heads = Vec::new();
    }
}

fn bucket_of(hash: u32, buckets: usize) -> usize {
    hash as usize % buckets
}

pub(crate) struct Chain<'a, E> {
    table: &'a BucketTable<E>,
    next: Option<usize>,
}

impl<'a, E> Iterator for Chain<'a, E> {
    type Item = &'a E;

    fn next(&mut self) -> Option<Self::Item> {
        let slot = &self.table.slots[self.next?];
        self.next = slot.next;
        Some(&slot.entry)
    }
}

#[inline]
fn append(hash: u32, add: u32) -> u32 {
    (hash << 3) ^ hash ^ add
}

/// Hash of a 64-bit row id, low word first.
pub(crate) fn hash_i64(value: i64) -> u32 {
    let bits = value as u64;
    append(append(0, bits as u32), (bits >> 32) as u32)
}

/// Hash of a fingerprint, seeded with the id of the index it belongs to.
pub(crate) fn hash_bytes(seed: u32, bytes: &[u8]) -> u32 {
    bytes.iter().fold(seed, |hash, byte| {
        hash.wrapping_add(hash << 7).wrapping_add(u32::from(*byte))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_at_half_load() {
        let mut table = BucketTable::new(4);
        table.insert(hash_i64(1), 1).unwrap();
        assert_eq!(table.bucket_count(), 4);
        table.insert(hash_i64(2), 2).unwrap();
        table.insert(hash_i64(3), 3).unwrap();
        assert_eq!(table.bucket_count(), 8);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn finds_entries_after_growth() {
        let mut table = BucketTable::new(2);
        for id in 0..100i64 {
            table.insert(hash_i64(id), id).unwrap();
        }
        assert!(table.bucket_count() >= 200);
        for id in 0..100i64 {
            assert_eq!(table.find(hash_i64(id), |e| *e == id), Some(&id));
        }
        assert_eq!(table.find(hash_i64(1000), |e| *e == 1000), None);
        assert_eq!(table.iter().count(), 100);
    }

    #[test]
    fn colliding_entries_share_a_chain() {
        let mut table = BucketTable::new(8);
        table.insert(7, "a").unwrap();
        table.insert(7, "b").unwrap();
        let chain: Vec<_> = table.chain(7).copied().collect();
        assert_eq!(chain, vec!["b", "a"]);
    }

    #[test]
    fn clear_forgets_everything() {
        let mut table = BucketTable::new(8);
        table.insert(1, ()).unwrap();
        table.clear();
        assert!(table.is_empty());
        assert_eq!(table.bucket_count(), 0);
        assert_eq!(table.chain(1).count(), 0);
    }

    #[test]
    fn byte_hash_depends_on_seed() {
        assert_ne!(hash_bytes(1, b"abc"), hash_bytes(2, b"abc"));
        assert_eq!(hash_bytes(3, b"abc"), hash_bytes(3, b"abc"));
    }
}
