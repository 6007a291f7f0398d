//! Morton filter implementation for 64-bit keys.
//!
//! A Morton filter is a compressed cuckoo filter: the state of many logical
//! buckets is packed into a fixed-width block through a fullness counter
//! array, so the filter reaches high load factors in less memory, while a
//! per-block overflow tracking array lets most negative lookups stop after a
//! single bucket probe. Construct one with [`MortonFilter::new`], then use
//! [`MortonFilter::insert`], [`MortonFilter::likely_contains`] and
//! [`MortonFilter::delete`], or the batched variants for bulk workloads.
//!
//! Lookups may return false positives at a configurable rate but never false
//! negatives for items currently stored. See Breslow and Jayasena, "Morton
//! Filters: Faster, Space-Efficient Cuckoo Filters via Biasing, Compression,
//! and Decoupled Logical Sparsity" (VLDB 2018).

use std::fmt;

use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// A filter never uses fewer blocks than this; construction also keeps the
/// total bucket count even, which the alternate-bucket involution relies on.
const MIN_BLOCKS: u64 = 2;

/// Salt mixed into the seed for the alternate-bucket offset hash.
const OFFSET_SALT: u64 = 0xD6E8_FEB8_6659_FD93;

/// Salt mixed into the seed for the eviction RNG.
const KICKOUT_SALT: u64 = 0x8C4E_FB5A_9D21_7C33;

/// Error returned when constructing or resizing a filter fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterError {
    /// The provided configuration values are invalid or do not fit the block.
    InvalidConfig(&'static str),
    /// A grown table could not absorb the existing fingerprints.
    ResizeFailed(&'static str),
}

impl fmt::Display for FilterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterError::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
            FilterError::ResizeFailed(msg) => write!(f, "resize failed: {msg}"),
        }
    }
}

impl std::error::Error for FilterError {}

/// Configuration options for building a [`MortonFilter`].
///
/// The per-block geometry (buckets per block, fingerprint slots per block)
/// is derived from these values; see
/// [`MortonFilter::report_compression_ratio`] for the ratio the derivation
/// actually achieved.
#[derive(Clone, Copy, Debug)]
pub struct FilterConfig {
    /// Logical capacity of each bucket, in fingerprints (typically 3-8).
    pub slots_per_bucket: u32,
    /// Width of a stored fingerprint in bits (typically 8-16).
    pub fingerprint_bits: u32,
    /// Overflow tracking bits per block; 0 disables overflow tracking and
    /// forces every lookup to probe both candidate buckets.
    pub ota_bits: u32,
    /// Width of a physical block in bits; must be a multiple of 64.
    pub block_bits: u32,
    /// Desired ratio of logical slots to physical fingerprint slots per
    /// block, at least 1.0. Higher ratios admit more load per bucket but
    /// leave the block less storage headroom.
    pub target_compression_ratio: f64,
    /// Maximum number of cuckoo evictions before an insertion gives up.
    pub max_kicks: u32,
    /// Chunk size used by the batched operations.
    pub batch_size: usize,
    /// Seed for the hash family and the eviction RNG.
    pub seed: u64,
    /// Allows [`MortonFilter::resize`] to grow the table in place.
    pub resize_enabled: bool,
    /// Send an item to its alternate bucket when its primary bucket has
    /// room but the primary block ran out of fingerprint slots. When
    /// disabled such items stay in the primary bucket via eviction.
    pub remap_enabled: bool,
    /// Roll back all evictions when an insertion exhausts `max_kicks`, so a
    /// failed insert leaves the filter exactly as it was. When disabled the
    /// last displaced fingerprint is dropped instead.
    pub collision_resolution_enabled: bool,
    /// Maintain a per-bucket fullness bit for fast insert rejection.
    pub block_fullness_array_enabled: bool,
    /// Serialize conflicting updates within a batch. The pipeline applies
    /// batched updates sequentially, so both settings behave identically;
    /// the knob is accepted for configuration parity.
    pub handle_conflicts: bool,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            slots_per_bucket: 3,
            fingerprint_bits: 8,
            ota_bits: 16,
            block_bits: 512,
            target_compression_ratio: 1.5,
            max_kicks: 500,
            batch_size: 128,
            seed: 0xC0FFEE,
            resize_enabled: false,
            remap_enabled: true,
            collision_resolution_enabled: true,
            block_fullness_array_enabled: false,
            handle_conflicts: true,
        }
    }
}

/// Derived per-block layout: field widths and the bit offset of each packed
/// array inside a block.
///
/// A block stores, low bits to high: the fullness counter array (one
/// fixed-width counter per bucket), the overflow tracking array, the
/// optional block fullness array, and the fingerprint storage array.
/// Fingerprints are stored contiguously with no per-bucket padding; counter
/// prefix sums recover which slice of the storage array belongs to which
/// bucket.
#[derive(Clone, Copy, Debug)]
struct BlockGeometry {
    words_per_block: usize,
    buckets_per_block: u64,
    slots_per_bucket: u64,
    counter_bits: u32,
    fingerprint_bits: u32,
    fsa_slots: u64,
    ota_bits: u32,
    bfa_enabled: bool,
    ota_base: u32,
    bfa_base: u32,
    fsa_base: u32,
}

impl BlockGeometry {
    fn derive(config: &FilterConfig) -> Result<Self, FilterError> {
        let w = config.block_bits;
        if w == 0 || w % 64 != 0 || w > 4096 {
            return Err(FilterError::InvalidConfig(
                "block_bits must be a multiple of 64 between 64 and 4096",
            ));
        }
        if !(1..=16).contains(&config.slots_per_bucket) {
            return Err(FilterError::InvalidConfig(
                "slots_per_bucket must be between 1 and 16",
            ));
        }
        if !(2..=32).contains(&config.fingerprint_bits) {
            return Err(FilterError::InvalidConfig(
                "fingerprint_bits must be between 2 and 32",
            ));
        }
        if config.ota_bits > w / 2 {
            return Err(FilterError::InvalidConfig(
                "ota_bits leave no room for fingerprint storage",
            ));
        }
        let ratio = config.target_compression_ratio;
        if !(ratio >= 1.0) || ratio > 8.0 {
            return Err(FilterError::InvalidConfig(
                "target_compression_ratio must be between 1.0 and 8.0",
            ));
        }

        let slots = u64::from(config.slots_per_bucket);
        let f = config.fingerprint_bits;
        let counter_bits = 32 - config.slots_per_bucket.leading_zeros();
        let meta_bits = counter_bits + u32::from(config.block_fullness_array_enabled);
        let budget = u64::from(w - config.ota_bits);

        // Pick the bucket count so that counters, fullness bits and the
        // compressed share of fingerprint slots all fit in one block.
        let per_bucket = f64::from(meta_bits) + (slots as f64 * f64::from(f)) / ratio;
        let mut buckets = (budget as f64 / per_bucket) as u64;
        while buckets > 0 && buckets * u64::from(meta_bits) + u64::from(f) > budget {
            buckets -= 1;
        }
        if buckets == 0 {
            return Err(FilterError::InvalidConfig(
                "block_bits too small for the configured bucket shape",
            ));
        }
        let fsa_slots =
            ((budget - buckets * u64::from(meta_bits)) / u64::from(f)).min(buckets * slots);
        debug_assert!(fsa_slots > 0);

        let fca_bits = (buckets as u32) * counter_bits;
        let ota_base = fca_bits;
        let bfa_base = ota_base + config.ota_bits;
        let fsa_base = bfa_base
            + if config.block_fullness_array_enabled {
                buckets as u32
            } else {
                0
            };
        debug_assert!(u64::from(fsa_base) + fsa_slots * u64::from(f) <= u64::from(w));

        Ok(Self {
            words_per_block: (w / 64) as usize,
            buckets_per_block: buckets,
            slots_per_bucket: slots,
            counter_bits,
            fingerprint_bits: f,
            fsa_slots,
            ota_bits: config.ota_bits,
            bfa_enabled: config.block_fullness_array_enabled,
            ota_base,
            bfa_base,
            fsa_base,
        })
    }

    /// Reads a `width`-bit field starting at bit `bit` of `block`.
    #[inline]
    fn read_field(&self, words: &[u64], block: u64, bit: u32, width: u32) -> u64 {
        let base = block as usize * self.words_per_block;
        let word = base + (bit / 64) as usize;
        let shift = bit % 64;
        let mask = field_mask(width);
        let mut value = (words[word] >> shift) & mask;
        if shift + width > 64 {
            value |= (words[word + 1] << (64 - shift)) & mask;
        }
        value
    }

    /// Writes a `width`-bit field starting at bit `bit` of `block`.
    #[inline]
    fn write_field(&self, words: &mut [u64], block: u64, bit: u32, width: u32, value: u64) {
        let base = block as usize * self.words_per_block;
        let word = base + (bit / 64) as usize;
        let shift = bit % 64;
        let mask = field_mask(width);
        let value = value & mask;
        words[word] = (words[word] & !(mask << shift)) | (value << shift);
        if shift + width > 64 {
            let low = 64 - shift;
            words[word + 1] = (words[word + 1] & !(mask >> low)) | (value >> low);
        }
    }

    #[inline]
    fn counter(&self, words: &[u64], block: u64, bucket: u64) -> u64 {
        self.read_field(
            words,
            block,
            bucket as u32 * self.counter_bits,
            self.counter_bits,
        )
    }

    #[inline]
    fn set_counter(&self, words: &mut [u64], block: u64, bucket: u64, value: u64) {
        self.write_field(
            words,
            block,
            bucket as u32 * self.counter_bits,
            self.counter_bits,
            value,
        );
    }

    /// First storage slot belonging to `bucket`: the prefix sum of the
    /// counters before it.
    #[inline]
    fn bucket_start(&self, words: &[u64], block: u64, bucket: u64) -> u64 {
        let mut start = 0;
        for i in 0..bucket {
            start += self.counter(words, block, i);
        }
        start
    }

    /// Number of fingerprints stored anywhere in the block.
    #[inline]
    fn block_load(&self, words: &[u64], block: u64) -> u64 {
        self.bucket_start(words, block, self.buckets_per_block)
    }

    #[inline]
    fn fingerprint_at(&self, words: &[u64], block: u64, slot: u64) -> u64 {
        self.read_field(
            words,
            block,
            self.fsa_base + slot as u32 * self.fingerprint_bits,
            self.fingerprint_bits,
        )
    }

    #[inline]
    fn set_fingerprint_at(&self, words: &mut [u64], block: u64, slot: u64, fp: u64) {
        self.write_field(
            words,
            block,
            self.fsa_base + slot as u32 * self.fingerprint_bits,
            self.fingerprint_bits,
            fp,
        );
    }

    /// Shifts the occupied slots `[slot, used)` one position up to make room
    /// at `slot`.
    fn open_slot(&self, words: &mut [u64], block: u64, slot: u64, used: u64) {
        let mut j = used;
        while j > slot {
            let moved = self.fingerprint_at(words, block, j - 1);
            self.set_fingerprint_at(words, block, j, moved);
            j -= 1;
        }
    }

    /// Shifts the occupied slots `(slot, used)` one position down and zeroes
    /// the vacated last slot.
    fn close_slot(&self, words: &mut [u64], block: u64, slot: u64, used: u64) {
        for j in slot..used - 1 {
            let moved = self.fingerprint_at(words, block, j + 1);
            self.set_fingerprint_at(words, block, j, moved);
        }
        self.set_fingerprint_at(words, block, used - 1, 0);
    }

    #[inline]
    fn overflow_bit(&self, words: &[u64], block: u64, index: u64) -> bool {
        self.read_field(words, block, self.ota_base + index as u32, 1) != 0
    }

    #[inline]
    fn set_overflow_bit(&self, words: &mut [u64], block: u64, index: u64) {
        self.write_field(words, block, self.ota_base + index as u32, 1, 1);
    }

    #[inline]
    fn fullness_bit(&self, words: &[u64], block: u64, bucket: u64) -> bool {
        self.read_field(words, block, self.bfa_base + bucket as u32, 1) != 0
    }

    #[inline]
    fn set_fullness_bit(&self, words: &mut [u64], block: u64, bucket: u64, full: bool) {
        self.write_field(words, block, self.bfa_base + bucket as u32, 1, u64::from(full));
    }
}

#[inline]
fn field_mask(width: u32) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

/// Outcome of attempting to store a fingerprint in a specific bucket.
#[derive(Debug, Clone, Copy)]
enum PlaceOutcome {
    Placed,
    /// The bucket already holds `slots_per_bucket` fingerprints.
    BucketFull,
    /// The bucket has room but its block ran out of storage slots.
    BlockFull,
}

/// An approximate-membership filter over 64-bit keys with compressed,
/// block-packed bucket storage and biased cuckoo insertion.
///
/// A filter instance is single-writer: the batched operations amortize
/// hashing and prefetching but never run concurrently. Wrap the filter in
/// external synchronization if it must be shared.
pub struct MortonFilter {
    config: FilterConfig,
    geometry: BlockGeometry,
    blocks: Vec<u64>,
    n_blocks: u64,
    /// Bucket count at construction. Resizing appends addressing bits below
    /// this space instead of changing it, which keeps the alternate-bucket
    /// involution stable across resizes.
    base_buckets: u64,
    resize_count: u32,
    items: u64,
    hash_seed: u64,
    offset_seed: u64,
    rng: StdRng,
}

impl MortonFilter {
    /// Builds a filter able to hold about `logical_slots` fingerprints at
    /// the configured compression ratio. The block count is rounded up so
    /// the bucket count stays even.
    pub fn new(logical_slots: u64, config: FilterConfig) -> Result<Self, FilterError> {
        if config.batch_size == 0 {
            return Err(FilterError::InvalidConfig("batch_size must be at least 1"));
        }
        let geometry = BlockGeometry::derive(&config)?;
        let per_block = geometry.buckets_per_block * geometry.slots_per_bucket;
        let mut n_blocks = ((logical_slots + per_block - 1) / per_block).max(MIN_BLOCKS);
        if (n_blocks * geometry.buckets_per_block) % 2 != 0 {
            n_blocks += 1;
        }
        let words = n_blocks
            .checked_mul(geometry.words_per_block as u64)
            .filter(|&n| n <= (usize::MAX / 8) as u64)
            .ok_or(FilterError::InvalidConfig("filter size overflow"))?;

        debug!(
            "morton filter: {} blocks, {} buckets/block, {} slots/block, {}-bit counters, {}-bit fingerprints",
            n_blocks,
            geometry.buckets_per_block,
            geometry.fsa_slots,
            geometry.counter_bits,
            geometry.fingerprint_bits,
        );

        Ok(Self {
            config,
            geometry,
            blocks: vec![0u64; words as usize],
            n_blocks,
            base_buckets: n_blocks * geometry.buckets_per_block,
            resize_count: 0,
            items: 0,
            hash_seed: config.seed,
            offset_seed: config.seed ^ OFFSET_SALT,
            rng: StdRng::seed_from_u64(config.seed ^ KICKOUT_SALT),
        })
    }

    /// Inserts `key`, returning false when the filter could not find room
    /// within the configured eviction budget. Duplicate insertions are
    /// permitted up to the per-bucket capacity.
    pub fn insert(&mut self, key: u64) -> bool {
        let (fp, b1) = self.key_slots(key);
        self.insert_fp(b1, fp)
    }

    /// Returns true when `key` is probably in the set and false when it is
    /// definitely not.
    pub fn likely_contains(&self, key: u64) -> bool {
        let (fp, b1) = self.key_slots(key);
        self.lookup_fp(b1, fp)
    }

    /// Removes one stored occurrence of `key`, returning whether one was
    /// found. Only delete keys that were actually inserted: deleting an
    /// absent key that happens to alias a stored fingerprint would strip
    /// another key's entry. Overflow bits are never cleared by deletion, so
    /// mixed insert/delete workloads slowly lose the single-probe lookup
    /// optimization; rebuild the filter periodically if that matters.
    pub fn delete(&mut self, key: u64) -> bool {
        let (fp, b1) = self.key_slots(key);
        self.delete_fp(b1, fp)
    }

    /// Batched [`insert`](Self::insert): hashes one chunk of keys at a time,
    /// prefetching their blocks, then applies the insertions in order.
    /// Returns a per-key status vector; the batch is not transactional.
    pub fn insert_many(&mut self, keys: &[u64]) -> Vec<bool> {
        let mut status = Vec::with_capacity(keys.len());
        let mut staged = Vec::with_capacity(self.config.batch_size);
        for chunk in keys.chunks(self.config.batch_size) {
            self.stage(chunk, &mut staged);
            for &(fp, b1) in &staged {
                status.push(self.insert_fp(b1, fp));
            }
        }
        status
    }

    /// Batched [`likely_contains`](Self::likely_contains).
    pub fn likely_contains_many(&self, keys: &[u64]) -> Vec<bool> {
        let mut status = Vec::with_capacity(keys.len());
        let mut staged = Vec::with_capacity(self.config.batch_size);
        for chunk in keys.chunks(self.config.batch_size) {
            self.stage(chunk, &mut staged);
            for &(fp, b1) in &staged {
                status.push(self.lookup_fp(b1, fp));
            }
        }
        status
    }

    /// Batched [`delete`](Self::delete).
    pub fn delete_many(&mut self, keys: &[u64]) -> Vec<bool> {
        let mut status = Vec::with_capacity(keys.len());
        let mut staged = Vec::with_capacity(self.config.batch_size);
        for chunk in keys.chunks(self.config.batch_size) {
            self.stage(chunk, &mut staged);
            for &(fp, b1) in &staged {
                status.push(self.delete_fp(b1, fp));
            }
        }
        status
    }

    /// Grows the filter in place by a factor of `2^log2_growth`.
    ///
    /// Every stored fingerprint is re-homed into the grown table; its new
    /// bucket gains `log2_growth` addressing bits recovered from the
    /// fingerprint itself, so membership is preserved exactly. Each resize
    /// spends those fingerprint bits on addressing, raising the false
    /// positive rate accordingly, and re-homing conservatively re-marks
    /// overflow bits, so overflow density can grow slightly across resizes.
    pub fn resize(&mut self, log2_growth: u32) -> Result<(), FilterError> {
        if !self.config.resize_enabled {
            return Err(FilterError::InvalidConfig(
                "resizing is disabled for this filter",
            ));
        }
        if log2_growth == 0 {
            return Ok(());
        }
        let new_count = self.resize_count + log2_growth;
        if new_count >= self.geometry.fingerprint_bits {
            return Err(FilterError::InvalidConfig(
                "resize would exhaust the fingerprint bits",
            ));
        }
        let factor = 1u64
            .checked_shl(log2_growth)
            .ok_or(FilterError::InvalidConfig("filter size overflow"))?;
        let new_n_blocks = self
            .n_blocks
            .checked_mul(factor)
            .ok_or(FilterError::InvalidConfig("filter size overflow"))?;
        let new_words = new_n_blocks
            .checked_mul(self.geometry.words_per_block as u64)
            .filter(|&n| n <= (usize::MAX / 8) as u64)
            .ok_or(FilterError::InvalidConfig("filter size overflow"))?;

        let old_words = std::mem::replace(&mut self.blocks, vec![0u64; new_words as usize]);
        let old_n_blocks = self.n_blocks;
        let old_resize_count = self.resize_count;
        let old_items = self.items;
        self.n_blocks = new_n_blocks;
        self.resize_count = new_count;
        self.items = 0;
        debug!(
            "resizing morton filter: {} -> {} blocks, {} stored fingerprints",
            old_n_blocks, new_n_blocks, old_items,
        );

        if self
            .relocate_all(&old_words, old_n_blocks, old_resize_count)
            .is_err()
        {
            self.blocks = old_words;
            self.n_blocks = old_n_blocks;
            self.resize_count = old_resize_count;
            self.items = old_items;
            return Err(FilterError::ResizeFailed(
                "could not relocate a fingerprint into the grown table",
            ));
        }
        Ok(())
    }

    /// Fraction of overflow tracking bits currently set across the filter.
    pub fn report_ota_occupancy(&self) -> f64 {
        let t = u64::from(self.geometry.ota_bits);
        if t == 0 {
            return 0.0;
        }
        let mut set = 0u64;
        for block in 0..self.n_blocks {
            for index in 0..t {
                if self.geometry.overflow_bit(&self.blocks, block, index) {
                    set += 1;
                }
            }
        }
        set as f64 / (self.n_blocks * t) as f64
    }

    /// Fraction of physical fingerprint slots currently occupied.
    pub fn report_block_occupancy(&self) -> f64 {
        let mut used = 0u64;
        for block in 0..self.n_blocks {
            used += self.geometry.block_load(&self.blocks, block);
        }
        used as f64 / (self.n_blocks * self.geometry.fsa_slots) as f64
    }

    /// Achieved ratio of logical slots to physical slots per block.
    pub fn report_compression_ratio(&self) -> f64 {
        (self.geometry.buckets_per_block * self.geometry.slots_per_bucket) as f64
            / self.geometry.fsa_slots as f64
    }

    /// Estimated false positive probability for a negative lookup at the
    /// current load, overflow density and resize count.
    pub fn estimated_false_positive_rate(&self) -> f64 {
        let g = self.geometry;
        let effective_bits = f64::from(g.fingerprint_bits - self.resize_count);
        let logical_slots = (self.bucket_count() * g.slots_per_bucket) as f64;
        let load = self.items as f64 / logical_slots;
        let buckets_probed = 1.0 + self.report_ota_occupancy();
        1.0 - (1.0 - 0.5f64.powf(effective_bits))
            .powf(load * buckets_probed * g.slots_per_bucket as f64)
    }

    /// Number of fingerprints currently stored.
    pub fn len(&self) -> u64 {
        self.items
    }

    /// Returns true when no fingerprints are stored.
    pub fn is_empty(&self) -> bool {
        self.items == 0
    }

    /// Number of physical fingerprint slots, the hard storage limit.
    pub fn capacity(&self) -> u64 {
        self.n_blocks * self.geometry.fsa_slots
    }

    /// Number of logical buckets.
    pub fn bucket_count(&self) -> u64 {
        self.n_blocks * self.geometry.buckets_per_block
    }

    /// How many doublings the filter has gone through.
    pub fn resize_count(&self) -> u32 {
        self.resize_count
    }

    /// Bytes used by block storage.
    pub fn storage_bytes(&self) -> usize {
        self.blocks.len() * std::mem::size_of::<u64>()
    }

    fn key_slots(&self, key: u64) -> (u64, u64) {
        let h1 = splitmix64(key.wrapping_add(self.hash_seed));
        let fp = self.fingerprint_of(h1);
        (fp, self.primary_bucket(h1, fp))
    }

    /// Fingerprints take the top bits of the primary hash; zero marks an
    /// empty slot, so it maps to 1.
    fn fingerprint_of(&self, h1: u64) -> u64 {
        let fp = h1 >> (64 - self.geometry.fingerprint_bits);
        if fp == 0 {
            1
        } else {
            fp
        }
    }

    fn primary_bucket(&self, h1: u64, fp: u64) -> u64 {
        let r = self.resize_count;
        let q = h1 % self.base_buckets;
        (q << r) | (fp >> (self.geometry.fingerprint_bits - r))
    }

    fn alt_bucket(&self, bucket: u64, fp: u64) -> u64 {
        self.alt_bucket_at(bucket, fp, self.resize_count)
    }

    /// Alternate-bucket involution. The offset is odd and the base bucket
    /// count even, so adding the offset to even buckets and subtracting it
    /// from odd ones maps each bucket pair onto itself. Addressing bits
    /// appended by resizing pass through unchanged.
    fn alt_bucket_at(&self, bucket: u64, fp: u64, resize_count: u32) -> u64 {
        let low_mask = (1u64 << resize_count) - 1;
        let q = bucket >> resize_count;
        let n = self.base_buckets;
        let offset = (splitmix64(fp ^ self.offset_seed) % n) | 1;
        let alt_q = if q & 1 == 0 {
            (q + offset) % n
        } else {
            (q + n - offset) % n
        };
        (alt_q << resize_count) | (bucket & low_mask)
    }

    fn ota_index(&self, bucket: u64) -> u64 {
        splitmix64(bucket) % u64::from(self.geometry.ota_bits)
    }

    /// True when an item mapping primarily to `bucket` may have overflowed
    /// to its alternate. Without overflow tracking this is always true.
    fn overflow_possible(&self, bucket: u64) -> bool {
        let g = self.geometry;
        if g.ota_bits == 0 {
            return true;
        }
        let block = bucket / g.buckets_per_block;
        g.overflow_bit(&self.blocks, block, self.ota_index(bucket))
    }

    fn mark_overflow(&mut self, bucket: u64) {
        let g = self.geometry;
        if g.ota_bits == 0 {
            return;
        }
        let block = bucket / g.buckets_per_block;
        let index = self.ota_index(bucket);
        g.set_overflow_bit(&mut self.blocks, block, index);
    }

    fn find_in_bucket(&self, bucket: u64, fp: u64) -> Option<u64> {
        let g = self.geometry;
        let block = bucket / g.buckets_per_block;
        let in_block = bucket % g.buckets_per_block;
        let count = g.counter(&self.blocks, block, in_block);
        let start = g.bucket_start(&self.blocks, block, in_block);
        (0..count).find(|&j| g.fingerprint_at(&self.blocks, block, start + j) == fp)
    }

    fn bucket_has(&self, bucket: u64, fp: u64) -> bool {
        self.find_in_bucket(bucket, fp).is_some()
    }

    fn lookup_fp(&self, b1: u64, fp: u64) -> bool {
        if self.bucket_has(b1, fp) {
            return true;
        }
        if !self.overflow_possible(b1) {
            return false;
        }
        self.bucket_has(self.alt_bucket(b1, fp), fp)
    }

    fn delete_fp(&mut self, b1: u64, fp: u64) -> bool {
        if self.remove_fp(b1, fp) {
            return true;
        }
        if !self.overflow_possible(b1) {
            return false;
        }
        let b2 = self.alt_bucket(b1, fp);
        self.remove_fp(b2, fp)
    }

    /// Primary-biased insertion: the primary bucket wins whenever it has
    /// room, the alternate is tried next (recording the overflow), and only
    /// then does the filter start evicting.
    fn insert_fp(&mut self, b1: u64, fp: u64) -> bool {
        match self.try_place(b1, fp) {
            PlaceOutcome::Placed => true,
            outcome => {
                if self.config.remap_enabled || matches!(outcome, PlaceOutcome::BucketFull) {
                    let b2 = self.alt_bucket(b1, fp);
                    if matches!(self.try_place(b2, fp), PlaceOutcome::Placed) {
                        self.mark_overflow(b1);
                        return true;
                    }
                }
                self.kickout_insert(fp, b1)
            }
        }
    }

    fn try_place(&mut self, bucket: u64, fp: u64) -> PlaceOutcome {
        let g = self.geometry;
        let block = bucket / g.buckets_per_block;
        let in_block = bucket % g.buckets_per_block;
        if g.bfa_enabled && g.fullness_bit(&self.blocks, block, in_block) {
            // Fast rejection; the counter only decides which kind of full.
            return if g.counter(&self.blocks, block, in_block) == g.slots_per_bucket {
                PlaceOutcome::BucketFull
            } else {
                PlaceOutcome::BlockFull
            };
        }
        if g.counter(&self.blocks, block, in_block) == g.slots_per_bucket {
            return PlaceOutcome::BucketFull;
        }
        if g.block_load(&self.blocks, block) == g.fsa_slots {
            return PlaceOutcome::BlockFull;
        }
        self.place_at(bucket, fp);
        PlaceOutcome::Placed
    }

    /// Stores `fp` at the end of `bucket`'s slice. The caller must have
    /// established that both the bucket and its block have room.
    fn place_at(&mut self, bucket: u64, fp: u64) {
        let g = self.geometry;
        let block = bucket / g.buckets_per_block;
        let in_block = bucket % g.buckets_per_block;
        let count = g.counter(&self.blocks, block, in_block);
        let used = g.block_load(&self.blocks, block);
        debug_assert!(count < g.slots_per_bucket && used < g.fsa_slots);
        let start = g.bucket_start(&self.blocks, block, in_block);
        g.open_slot(&mut self.blocks, block, start + count, used);
        g.set_fingerprint_at(&mut self.blocks, block, start + count, fp);
        g.set_counter(&mut self.blocks, block, in_block, count + 1);
        self.items += 1;
        self.refresh_fullness(block);
    }

    /// Removes the fingerprint at position `slot` of `bucket`'s slice and
    /// returns it.
    fn remove_slot(&mut self, bucket: u64, slot: u64) -> u64 {
        let g = self.geometry;
        let block = bucket / g.buckets_per_block;
        let in_block = bucket % g.buckets_per_block;
        let count = g.counter(&self.blocks, block, in_block);
        debug_assert!(slot < count);
        let used = g.block_load(&self.blocks, block);
        let start = g.bucket_start(&self.blocks, block, in_block);
        let fp = g.fingerprint_at(&self.blocks, block, start + slot);
        g.close_slot(&mut self.blocks, block, start + slot, used);
        g.set_counter(&mut self.blocks, block, in_block, count - 1);
        self.items -= 1;
        self.refresh_fullness(block);
        fp
    }

    fn remove_fp(&mut self, bucket: u64, fp: u64) -> bool {
        match self.find_in_bucket(bucket, fp) {
            Some(slot) => {
                self.remove_slot(bucket, slot);
                true
            }
            None => false,
        }
    }

    /// Picks the eviction victim: a uniformly random slot of `bucket`, or a
    /// uniformly random occupied slot of its block when the bucket itself is
    /// empty (block-level congestion).
    fn choose_victim(&mut self, bucket: u64) -> (u64, u64) {
        let g = self.geometry;
        let block = bucket / g.buckets_per_block;
        let in_block = bucket % g.buckets_per_block;
        let count = g.counter(&self.blocks, block, in_block);
        if count > 0 {
            let slot = self.rng.gen_range(0..count);
            return (bucket, slot);
        }
        let used = g.block_load(&self.blocks, block);
        debug_assert!(used > 0);
        let mut remaining = self.rng.gen_range(0..used);
        let block_first = block * g.buckets_per_block;
        for i in 0..g.buckets_per_block {
            let c = g.counter(&self.blocks, block, i);
            if remaining < c {
                return (block_first + i, remaining);
            }
            remaining -= c;
        }
        // The target index is below the block load, so the loop always
        // returns before reaching this point.
        (bucket, 0)
    }

    /// Random-kickout cuckoo insertion. Each eviction re-homes the victim by
    /// treating its current bucket as its primary, so the victim moves to
    /// that bucket's alternate and the overflow bit of the bucket it left is
    /// set. On exhaustion the eviction log is unwound when collision
    /// resolution is enabled; overflow bits set along the way stay set.
    fn kickout_insert(&mut self, fp: u64, b1: u64) -> bool {
        let mut fp = fp;
        let mut bucket = b1;
        let mut moves: Vec<(u64, u64, u64, u64)> = Vec::new();
        for _ in 0..self.config.max_kicks {
            let (victim_bucket, victim_slot) = self.choose_victim(bucket);
            let victim_fp = self.remove_slot(victim_bucket, victim_slot);
            self.place_at(bucket, fp);
            moves.push((victim_bucket, victim_fp, bucket, fp));
            let dest = self.alt_bucket(victim_bucket, victim_fp);
            self.mark_overflow(victim_bucket);
            if matches!(self.try_place(dest, victim_fp), PlaceOutcome::Placed) {
                return true;
            }
            fp = victim_fp;
            bucket = dest;
        }
        if self.config.collision_resolution_enabled {
            for (victim_bucket, victim_fp, placed_bucket, placed_fp) in moves.into_iter().rev() {
                let undone = self.remove_fp(placed_bucket, placed_fp);
                debug_assert!(undone);
                self.place_at(victim_bucket, victim_fp);
            }
        }
        false
    }

    fn refresh_fullness(&mut self, block: u64) {
        let g = self.geometry;
        if !g.bfa_enabled {
            return;
        }
        let block_full = g.block_load(&self.blocks, block) == g.fsa_slots;
        for i in 0..g.buckets_per_block {
            let full = block_full || g.counter(&self.blocks, block, i) == g.slots_per_bucket;
            g.set_fullness_bit(&mut self.blocks, block, i, full);
        }
    }

    /// Hashes one chunk of keys and prefetches their primary blocks before
    /// the caller applies the operations in order.
    fn stage(&self, chunk: &[u64], staged: &mut Vec<(u64, u64)>) {
        staged.clear();
        for &key in chunk {
            let (fp, b1) = self.key_slots(key);
            self.prefetch_block(b1 / self.geometry.buckets_per_block);
            staged.push((fp, b1));
        }
    }

    #[inline]
    fn prefetch_block(&self, block: u64) {
        #[cfg(target_arch = "x86_64")]
        unsafe {
            use std::arch::x86_64::{_mm_prefetch, _MM_HINT_T0};
            let word = block as usize * self.geometry.words_per_block;
            _mm_prefetch::<_MM_HINT_T0>(self.blocks.as_ptr().add(word) as *const i8);
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            let _ = block;
        }
    }

    /// Walks every bucket of the old table in order and re-inserts its
    /// fingerprints into the grown table through the standard placement
    /// path.
    fn relocate_all(
        &mut self,
        old_words: &[u64],
        old_n_blocks: u64,
        old_resize_count: u32,
    ) -> Result<(), ()> {
        let g = self.geometry;
        let f = g.fingerprint_bits;
        for block in 0..old_n_blocks {
            for in_block in 0..g.buckets_per_block {
                let count = g.counter(old_words, block, in_block);
                if count == 0 {
                    continue;
                }
                let start = g.bucket_start(old_words, block, in_block);
                let old_bucket = block * g.buckets_per_block + in_block;
                for j in 0..count {
                    let fp = g.fingerprint_at(old_words, block, start + j);
                    let dest = ((old_bucket >> old_resize_count) << self.resize_count)
                        | (fp >> (f - self.resize_count));
                    if !self.insert_fp(dest, fp) {
                        return Err(());
                    }
                    // An item that lived in its alternate bucket needs the
                    // overflow bit of its new primary set for lookups to
                    // reach it. The old table cannot say which residents
                    // overflowed, but any overflowed resident left its
                    // primary's bit set, so an unset bit on the old partner
                    // bucket proves this item was home.
                    if g.ota_bits > 0 {
                        let old_partner = self.alt_bucket_at(old_bucket, fp, old_resize_count);
                        let partner_block = old_partner / g.buckets_per_block;
                        let partner_index = self.ota_index(old_partner);
                        if g.overflow_bit(old_words, partner_block, partner_index) {
                            let new_partner = self.alt_bucket(dest, fp);
                            self.mark_overflow(new_partner);
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

impl fmt::Debug for MortonFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MortonFilter {{ blocks: {}, buckets: {}, capacity: {}, items: {} }}",
            self.n_blocks,
            self.bucket_count(),
            self.capacity(),
            self.items,
        )
    }
}

#[inline]
fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E3779B97F4A7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

#[cfg(test)]
impl MortonFilter {
    /// Asserts the structural block invariants: counters within bucket
    /// capacity, block load within slot capacity, a dense non-zero prefix of
    /// stored fingerprints, zeroed vacant slots, fullness bits in sync, and
    /// an accurate item count.
    fn check_invariants(&self) {
        let g = self.geometry;
        let mut total = 0u64;
        for block in 0..self.n_blocks {
            let mut used = 0u64;
            for i in 0..g.buckets_per_block {
                let count = g.counter(&self.blocks, block, i);
                assert!(count <= g.slots_per_bucket, "counter above bucket capacity");
                used += count;
            }
            assert!(used <= g.fsa_slots, "block holds more fingerprints than slots");
            for j in 0..used {
                assert_ne!(
                    g.fingerprint_at(&self.blocks, block, j),
                    0,
                    "occupied slot holds a zero fingerprint"
                );
            }
            for j in used..g.fsa_slots {
                assert_eq!(
                    g.fingerprint_at(&self.blocks, block, j),
                    0,
                    "vacant slot holds a stale fingerprint"
                );
            }
            if g.bfa_enabled {
                let block_full = used == g.fsa_slots;
                for i in 0..g.buckets_per_block {
                    let expect =
                        block_full || g.counter(&self.blocks, block, i) == g.slots_per_bucket;
                    assert_eq!(
                        g.fullness_bit(&self.blocks, block, i),
                        expect,
                        "fullness bit out of sync"
                    );
                }
            }
            total += used;
        }
        assert_eq!(total, self.items, "item count out of sync with stored fingerprints");
    }
}


#[cfg(test)]
mod proptests;
