//! In-memory extendible hash directory: a directory of `2^global_depth`
//! slots, each referencing a bucket that owns the keys whose hash ends in the
//! bucket's `local_depth`-bit id. Buckets split incrementally as they fill;
//! the directory doubles only when a split outgrows it. Removal never merges
//! buckets or shrinks the directory.

use crate::sync::Mutex;

/// Width of the hash image in bits; no bucket's local depth can exceed this.
const HASH_BITS: usize = 64;

/// Keys are hashed through their canonical `u64` image.
pub trait Key: Copy + Eq {
    fn to_u64(self) -> u64;
}

impl Key for u64 {
    fn to_u64(self) -> u64 {
        self
    }
}

impl Key for usize {
    fn to_u64(self) -> u64 {
        self as u64
    }
}

pub trait Hasher {
    fn hash(&self, x: u64) -> u64;
}

/// FNV-1 over the little-endian bytes of the value.
#[derive(Default)]
pub struct FNV1;

impl Hasher for FNV1 {
    fn hash(&self, x: u64) -> u64 {
        let mut h: u64 = 0xcbf29ce484222325;
        for i in 0..8 {
            h = (h ^ ((x >> (i * 8)) & 0xff)).wrapping_mul(0x100000001b3);
        }
        h
    }
}

fn low_bits(h: u64, depth: usize) -> u64 {
    debug_assert!(depth <= HASH_BITS);
    if depth == HASH_BITS {
        h
    } else {
        h & ((1u64 << depth) - 1)
    }
}

struct Bucket<K, V> {
    /// Low `local_depth` bits shared by the hashes of every key stored here.
    id: u64,
    local_depth: usize,
    items: Vec<(K, V)>,
}

/// The unsynchronised core. Buckets live in an arena; directory slots hold
/// arena indices. A slot left vacant by a split stays `None` until the first
/// insert that lands on it.
pub(crate) struct Directory<K, V, H = FNV1> {
    hasher: H,
    bucket_size: usize,
    global_depth: usize,
    slots: Vec<Option<usize>>,
    buckets: Vec<Bucket<K, V>>,
    pair_count: usize,
}

impl<K: Key, V: Copy, H: Hasher> Directory<K, V, H> {
    pub(crate) fn new(bucket_size: usize, hasher: H) -> Self {
        assert!(bucket_size >= 1, "bucket_size must be at least 1");
        Directory {
            hasher,
            bucket_size,
            global_depth: 0,
            slots: vec![Some(0)],
            buckets: vec![Bucket {
                id: 0,
                local_depth: 0,
                items: Vec::new(),
            }],
            pair_count: 0,
        }
    }

    fn hash_key(&self, key: K) -> u64 {
        self.hasher.hash(key.to_u64())
    }

    fn slot_of(&self, h: u64) -> usize {
        low_bits(h, self.global_depth) as usize
    }

    pub(crate) fn len(&self) -> usize {
        self.pair_count
    }

    pub(crate) fn find(&self, key: K) -> Option<V> {
        let b = self.slots[self.slot_of(self.hash_key(key))]?;
        self.buckets[b]
            .items
            .iter()
            .find(|&&(k, _)| k == key)
            .map(|&(_, v)| v)
    }

    pub(crate) fn remove(&mut self, key: K) -> bool {
        let slot = self.slot_of(self.hash_key(key));
        let b = match self.slots[slot] {
            Some(b) => b,
            None => return false,
        };
        let items = &mut self.buckets[b].items;
        match items.iter().position(|&(k, _)| k == key) {
            Some(pos) => {
                items.swap_remove(pos);
                self.pair_count -= 1;
                true
            }
            None => false,
        }
    }

    pub(crate) fn insert(&mut self, key: K, value: V) {
        let h = self.hash_key(key);
        let slot = self.slot_of(h);
        let b = match self.slots[slot] {
            Some(b) => b,
            None => {
                // The slot was vacated by an earlier split; a fresh bucket
                // here covers all global_depth bits of the slot index.
                let b = self.buckets.len();
                self.buckets.push(Bucket {
                    id: slot as u64,
                    local_depth: self.global_depth,
                    items: Vec::new(),
                });
                self.slots[slot] = Some(b);
                b
            }
        };

        if let Some(entry) = self.buckets[b].items.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
            return;
        }
        self.buckets[b].items.push((key, value));
        self.pair_count += 1;

        // Split once the bucket reaches capacity. A single entry can never be
        // separated from itself, so it is left alone regardless of capacity.
        let len = self.buckets[b].items.len();
        if len >= self.bucket_size && len > 1 {
            self.split(b);
        }
    }

    /// Carve a sibling off bucket `b`, deepening both until at least one
    /// entry separates, then rewire the directory. Splitting does not change
    /// the pair count. If the bucket's keys agree on all `HASH_BITS` low bits
    /// no bit can separate them; the bucket is restored and left oversized.
    fn split(&mut self, b: usize) {
        let old_id = self.buckets[b].id;
        let old_depth = self.buckets[b].local_depth;

        let mut sibling: Bucket<K, V> = Bucket {
            id: 0,
            local_depth: old_depth,
            items: Vec::new(),
        };

        while sibling.items.is_empty() {
            if self.buckets[b].local_depth == HASH_BITS {
                self.buckets[b].id = old_id;
                self.buckets[b].local_depth = old_depth;
                return;
            }
            self.buckets[b].local_depth += 1;
            sibling.local_depth += 1;
            let new_depth = self.buckets[b].local_depth;

            // Entries whose next hash bit is set move to the sibling.
            let mut i = 0;
            while i < self.buckets[b].items.len() {
                let (k, _) = self.buckets[b].items[i];
                let h = self.hash_key(k);
                if (h >> (new_depth - 1)) & 1 == 1 {
                    sibling.id = low_bits(h, new_depth);
                    let item = self.buckets[b].items.swap_remove(i);
                    sibling.items.push(item);
                } else {
                    i += 1;
                }
            }

            // Everything moved: keep the entries in `b` and carve again.
            if self.buckets[b].items.is_empty() {
                std::mem::swap(&mut self.buckets[b].items, &mut sibling.items);
                self.buckets[b].id = sibling.id;
            }
        }

        let new_depth = self.buckets[b].local_depth;
        let s = self.buckets.len();
        self.buckets.push(sibling);

        if new_depth > self.global_depth {
            // The directory is too shallow for the new local depth: grow it
            // and rebuild every slot from the surviving buckets.
            let factor = 1usize << (new_depth - self.global_depth);
            let new_len = self.slots.len() * factor;
            let old_slots = std::mem::replace(&mut self.slots, vec![None; new_len]);
            self.global_depth = new_depth;

            let mut seen = vec![false; self.buckets.len()];
            for x in old_slots.into_iter().flatten() {
                if !seen[x] {
                    seen[x] = true;
                    self.place(x);
                }
            }
            if !seen[s] {
                self.place(s);
            }
        } else {
            // Clear the slots the old bucket owned, then repopulate them
            // from the two halves.
            let mut i = old_id as usize;
            while i < self.slots.len() {
                self.slots[i] = None;
                i += 1 << old_depth;
            }
            self.place(b);
            self.place(s);
        }
    }

    /// Point every slot whose low `local_depth` bits equal the bucket's id at
    /// the bucket.
    fn place(&mut self, x: usize) {
        let mut i = self.buckets[x].id as usize;
        let stride = 1usize << self.buckets[x].local_depth;
        while i < self.slots.len() {
            self.slots[i] = Some(x);
            i += stride;
        }
    }
}

/// Extendible hash table with every public operation serialised by a mutex.
/// `bucket_size` is the bucket capacity that triggers a split and must be at
/// least 1; lookups rely on the hasher spreading keys, so a degenerate hasher
/// degrades splits into oversized buckets (see [`Directory::split`]).
pub struct ExtendibleHashTable<K, V, H = FNV1> {
    inner: Mutex<Directory<K, V, H>>,
}

impl<K: Key, V: Copy> ExtendibleHashTable<K, V, FNV1> {
    pub fn new(bucket_size: usize) -> Self {
        Self::with_hasher(bucket_size, FNV1)
    }
}

impl<K: Key, V: Copy, H: Hasher> ExtendibleHashTable<K, V, H> {
    pub fn with_hasher(bucket_size: usize, hasher: H) -> Self {
        ExtendibleHashTable {
            inner: Mutex::new(Directory::new(bucket_size, hasher)),
        }
    }

    pub fn find(&self, key: K) -> Option<V> {
        self.inner.lock().unwrap().find(key)
    }

    /// Insert or overwrite. May split the target bucket and double the
    /// directory as a side effect.
    pub fn insert(&self, key: K, value: V) {
        self.inner.lock().unwrap().insert(key, value)
    }

    /// Erase the entry if present. Never merges buckets.
    pub fn remove(&self, key: K) -> bool {
        self.inner.lock().unwrap().remove(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().pair_count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn global_depth(&self) -> usize {
        self.inner.lock().unwrap().global_depth
    }

    /// Local depth of the bucket referenced by the given directory slot, or
    /// `None` for a vacant or out-of-range slot.
    pub fn local_depth(&self, slot: usize) -> Option<usize> {
        let dir = self.inner.lock().unwrap();
        let b = *dir.slots.get(slot)?;
        b.map(|b| dir.buckets[b].local_depth)
    }

    pub fn num_buckets(&self) -> usize {
        self.inner.lock().unwrap().buckets.len()
    }
}


#[cfg(all(test, not(loom)))]
mod tests {
    use super::test_support::*;
    use super::*;
    use rand::{Rng, SeedableRng};
    use std::collections::HashMap as StdHashMap;
    use std::sync::atomic::AtomicBool;

    fn check_invariants<K: Key, V: Copy, H: Hasher>(table: &ExtendibleHashTable<K, V, H>) {
        let dir = table.inner.lock().unwrap();
        assert_eq!(dir.slots.len(), 1usize << dir.global_depth);

        let mut reachable = vec![false; dir.buckets.len()];
        for (slot, b) in dir.slots.iter().enumerate() {
            if let Some(b) = *b {
                reachable[b] = true;
                let bucket = &dir.buckets[b];
                assert!(bucket.local_depth <= dir.global_depth);
                assert_eq!(low_bits(slot as u64, bucket.local_depth), bucket.id);
                for &(k, _) in &bucket.items {
                    assert_eq!(
                        low_bits(dir.hasher.hash(k.to_u64()), bucket.local_depth),
                        bucket.id
                    );
                }
            }
        }
        // Every bucket ever created must still be referenced somewhere.
        assert!(reachable.iter().all(|&r| r));
        assert_eq!(
            dir.pair_count,
            dir.buckets.iter().map(|b| b.items.len()).sum::<usize>()
        );
    }

    #[test]
    fn test_insert_find() {
        let table = ExtendibleHashTable::<X, u64, TestHash>::with_hasher(4, TestHash);
        assert_eq!(table.find(X(1)), None);
        table.insert(X(1), 10);
        assert_eq!(table.find(X(1)), Some(10));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_insert_overwrites() {
        let table = ExtendibleHashTable::<X, u64, TestHash>::with_hasher(4, TestHash);
        table.insert(X(1), 10);
        table.insert(X(1), 12);
        assert_eq!(table.find(X(1)), Some(12));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_remove() {
        let table = ExtendibleHashTable::<X, u64, TestHash>::with_hasher(4, TestHash);
        table.insert(X(1), 10);
        assert!(table.remove(X(1)));
        assert_eq!(table.find(X(1)), None);
        assert!(!table.remove(X(1)));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_remove_never_shrinks_directory() {
        let table = ExtendibleHashTable::<X, u64, TestHash>::with_hasher(2, TestHash);
        for k in 0..8 {
            table.insert(X(k), k);
        }
        let depth = table.global_depth();
        let buckets = table.num_buckets();
        for k in 0..8 {
            assert!(table.remove(X(k)));
        }
        assert_eq!(table.global_depth(), depth);
        assert_eq!(table.num_buckets(), buckets);
        assert_eq!(table.len(), 0);
        check_invariants(&table);
    }

    #[test]
    fn test_split_grows_directory() {
        let table = ExtendibleHashTable::<X, u64, TestHash>::with_hasher(2, TestHash);
        for k in 0..4 {
            table.insert(X(k), k * 100);
        }
        assert!(table.global_depth() >= 2);
        assert!(table.num_buckets() >= 3);
        for k in 0..4 {
            assert_eq!(table.find(X(k)), Some(k * 100));
        }
        check_invariants(&table);
    }

    #[test]
    fn test_split_skips_depths_with_no_separating_bit() {
        // 0 and 8 agree on their low three bits, so one overflow must deepen
        // the bucket all the way to depth 4 before anything separates.
        let table = ExtendibleHashTable::<X, u64, TestHash>::with_hasher(2, TestHash);
        table.insert(X(0), 1);
        table.insert(X(8), 2);
        assert_eq!(table.global_depth(), 4);
        assert_eq!(table.num_buckets(), 2);
        assert_eq!(table.local_depth(0), Some(4));
        assert_eq!(table.local_depth(8), Some(4));
        // Intermediate slots were vacated, not repopulated.
        assert_eq!(table.local_depth(1), None);
        assert_eq!(table.find(X(0)), Some(1));
        assert_eq!(table.find(X(8)), Some(2));
        check_invariants(&table);
    }

    #[test]
    fn test_insert_into_vacated_slot() {
        let table = ExtendibleHashTable::<X, u64, TestHash>::with_hasher(2, TestHash);
        table.insert(X(0), 1);
        table.insert(X(8), 2);
        assert_eq!(table.local_depth(1), None);
        // Lands on a vacant slot and creates a bucket at full depth.
        table.insert(X(1), 3);
        assert_eq!(table.local_depth(1), Some(table.global_depth()));
        assert_eq!(table.num_buckets(), 3);
        assert_eq!(table.find(X(1)), Some(3));
        check_invariants(&table);
    }

    #[test]
    fn test_total_collision_leaves_bucket_oversized() {
        let table = ExtendibleHashTable::<X, u64, BadHash>::with_hasher(2, BadHash);
        table.insert(X(1), 1);
        table.insert(X(2), 2);
        table.insert(X(3), 3);
        // No bit can tell the keys apart; the split gives up and the state
        // stays where it started.
        assert_eq!(table.global_depth(), 0);
        assert_eq!(table.num_buckets(), 1);
        assert_eq!(table.find(X(1)), Some(1));
        assert_eq!(table.find(X(2)), Some(2));
        assert_eq!(table.find(X(3)), Some(3));
        assert_eq!(table.len(), 3);
        check_invariants(&table);
    }

    #[test]
    #[should_panic]
    fn test_zero_bucket_size_rejected() {
        ExtendibleHashTable::<X, u64, TestHash>::with_hasher(0, TestHash);
    }

    #[test]
    fn test_random_ops_match_model() {
        const KEY_SPACE: u64 = 256;
        let mut rng = rand::rngs::StdRng::from_seed([7; 32]);
        let table = ExtendibleHashTable::<X, u64, TestHash>::with_hasher(2, TestHash);
        let mut model = StdHashMap::new();

        for round in 0..2000usize {
            let k = rng.gen_range(0..KEY_SPACE);
            if rng.gen_bool(0.7) {
                let v = rng.gen::<u64>();
                table.insert(X(k), v);
                model.insert(k, v);
            } else {
                assert_eq!(table.remove(X(k)), model.remove(&k).is_some());
            }
            assert_eq!(table.len(), model.len());

            if round % 100 == 0 {
                check_invariants(&table);
                for (&k, &v) in &model {
                    assert_eq!(table.find(X(k)), Some(v));
                }
            }
        }
        check_invariants(&table);
    }

    #[test]
    fn test_threaded_insert_lookup() {
        const ITERATIONS: usize = 20_000;
        const SIZE: u64 = 128;
        let table = ExtendibleHashTable::<X, X, FNV1>::new(4);
        let finished = AtomicBool::new(false);
        crossbeam_utils::thread::scope(|s| {
            s.spawn(|_| {
                let mut rng = rand::rngs::StdRng::from_seed([1; 32]);
                let mut local = StdHashMap::new();

                for _ in 0..ITERATIONS {
                    let k = X(rng.gen_range(1..=SIZE));
                    if local.contains_key(&k) {
                        local.remove(&k);
                        assert!(table.remove(k));
                    } else {
                        local.insert(k, k);
                        table.insert(k, k);
                    }
                }
                finished.store(true, std::sync::atomic::Ordering::SeqCst);
            });
            s.spawn(|_| {
                let mut rng = rand::rngs::StdRng::from_seed([2; 32]);

                while !finished.load(std::sync::atomic::Ordering::Relaxed) {
                    let k = X(rng.gen_range(1..=SIZE));
                    if let Some(value) = table.find(k) {
                        assert_eq!(value, k);
                    }
                }
            });
        })
        .unwrap();
    }
}
