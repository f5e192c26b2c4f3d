//! Buffer pool configuration.
//!
//! Every bounded-retry count used by the pool lives here. None of them is a
//! correctness invariant; they only trade search effort against the chance of
//! reporting exhaustion.

use crate::error::{BufcoreError, Result};

/// Default number of frames.
pub const DEFAULT_NUM_FRAMES: usize = 1024;

/// Default slots per cuckoo bucket.
pub const DEFAULT_SLOTS_PER_BUCKET: usize = 3;

/// Default number of cuckoo hash functions.
pub const DEFAULT_HASH_FUNCTIONS: usize = 2;

/// Upper bound on the number of cuckoo hash functions.
pub const MAX_HASH_FUNCTIONS: usize = 4;

/// Default number of transit buckets.
pub const DEFAULT_TRANSIT_BUCKETS: usize = 128;

/// Default number of page write lock stripes.
pub const DEFAULT_WRITE_LOCK_STRIPES: usize = 64;

/// Configuration for a [`BufferCore`](crate::storage::BufferCore).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of frames (and control blocks).
    pub num_frames: usize,
    /// Slots per hash bucket.
    pub slots_per_bucket: usize,
    /// Number of independent hash functions.
    pub hash_functions: usize,
    /// Relocation attempts allowed per insert before giving up.
    pub relocation_budget: usize,
    /// Full passes over the frames before the clock scan gives up.
    pub scan_patience_rounds: usize,
    /// Number of transit buckets.
    pub transit_buckets: usize,
    /// In-transit-out identities allowed per transit bucket.
    pub transit_capacity: usize,
    /// Number of page write lock stripes.
    pub write_lock_stripes: usize,
    /// Locked probe passes `grab` makes before its final all-bucket check.
    pub grab_probe_attempts: usize,
    /// Attempts `remove` makes while the page is being written back.
    pub remove_patience: usize,
    /// Seed for the hash functions and the relocation shuffle.
    pub hash_seed: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            num_frames: DEFAULT_NUM_FRAMES,
            slots_per_bucket: DEFAULT_SLOTS_PER_BUCKET,
            hash_functions: DEFAULT_HASH_FUNCTIONS,
            relocation_budget: default_relocation_budget(
                DEFAULT_SLOTS_PER_BUCKET,
                DEFAULT_HASH_FUNCTIONS,
            ),
            scan_patience_rounds: 4,
            transit_buckets: DEFAULT_TRANSIT_BUCKETS,
            transit_capacity: 1,
            write_lock_stripes: DEFAULT_WRITE_LOCK_STRIPES,
            grab_probe_attempts: 8,
            remove_patience: 10,
            hash_seed: 4344,
        }
    }
}

impl PoolConfig {
    /// Creates a default configuration with the given number of frames.
    #[must_use]
    pub fn new(num_frames: usize) -> Self {
        Self {
            num_frames,
            ..Self::default()
        }
    }

    /// Sets the number of frames.
    #[must_use]
    pub fn with_num_frames(mut self, num_frames: usize) -> Self {
        self.num_frames = num_frames;
        self
    }

    /// Sets the slots per bucket and rescales the relocation budget.
    #[must_use]
    pub fn with_slots_per_bucket(mut self, slots: usize) -> Self {
        self.slots_per_bucket = slots;
        self.relocation_budget = default_relocation_budget(slots, self.hash_functions);
        self
    }

    /// Sets the number of hash functions and rescales the relocation budget.
    #[must_use]
    pub fn with_hash_functions(mut self, count: usize) -> Self {
        self.hash_functions = count;
        self.relocation_budget = default_relocation_budget(self.slots_per_bucket, count);
        self
    }

    /// Sets the relocation budget explicitly.
    #[must_use]
    pub fn with_relocation_budget(mut self, budget: usize) -> Self {
        self.relocation_budget = budget;
        self
    }

    /// Sets the number of clock passes before the scan gives up.
    #[must_use]
    pub fn with_scan_patience_rounds(mut self, rounds: usize) -> Self {
        self.scan_patience_rounds = rounds;
        self
    }

    /// Sets the transit table geometry.
    #[must_use]
    pub fn with_transit(mut self, buckets: usize, capacity: usize) -> Self {
        self.transit_buckets = buckets;
        self.transit_capacity = capacity;
        self
    }

    /// Sets the number of page write lock stripes.
    #[must_use]
    pub fn with_write_lock_stripes(mut self, stripes: usize) -> Self {
        self.write_lock_stripes = stripes;
        self
    }

    /// Sets how many locked probes `grab` and `pin` make before giving up
    /// on an entry that keeps moving.
    #[must_use]
    pub fn with_grab_probe_attempts(mut self, attempts: usize) -> Self {
        self.grab_probe_attempts = attempts;
        self
    }

    /// Sets how many times `remove` retries before timing out.
    #[must_use]
    pub fn with_remove_patience(mut self, patience: usize) -> Self {
        self.remove_patience = patience;
        self
    }

    /// Sets the hash seed.
    #[must_use]
    pub fn with_hash_seed(mut self, seed: u64) -> Self {
        self.hash_seed = seed;
        self
    }

    /// Number of hash buckets: the smallest prime giving a load factor of at
    /// most 9/16.
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        next_prime((16 * self.num_frames + 8).div_ceil(9))
    }

    /// Total clock probes allowed per replacement.
    #[must_use]
    pub fn scan_patience(&self) -> usize {
        self.scan_patience_rounds * self.num_frames
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`BufcoreError::Config`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.num_frames == 0 {
            return Err(BufcoreError::Config(
                "Buffer pool must have at least one frame".into(),
            ));
        }
        if self.num_frames >= u32::MAX as usize {
            return Err(BufcoreError::Config(format!(
                "Too many frames: {}",
                self.num_frames
            )));
        }
        if self.slots_per_bucket == 0 {
            return Err(BufcoreError::Config(
                "Hash buckets need at least one slot".into(),
            ));
        }
        if !(1..=MAX_HASH_FUNCTIONS).contains(&self.hash_functions) {
            return Err(BufcoreError::Config(format!(
                "hash_functions must be 1-{MAX_HASH_FUNCTIONS}, got {}",
                self.hash_functions
            )));
        }
        if self.scan_patience_rounds == 0 {
            return Err(BufcoreError::Config(
                "scan_patience_rounds must be greater than 0".into(),
            ));
        }
        if self.transit_buckets == 0 || self.transit_capacity == 0 {
            return Err(BufcoreError::Config(
                "Transit table needs at least one bucket with capacity 1".into(),
            ));
        }
        if self.write_lock_stripes == 0 {
            return Err(BufcoreError::Config(
                "write_lock_stripes must be greater than 0".into(),
            ));
        }
        if self.grab_probe_attempts == 0 {
            return Err(BufcoreError::Config(
                "grab_probe_attempts must be greater than 0".into(),
            ));
        }
        if self.remove_patience == 0 {
            return Err(BufcoreError::Config(
                "remove_patience must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

fn default_relocation_budget(slots: usize, hash_functions: usize) -> usize {
    (slots.saturating_sub(1) * hash_functions.saturating_sub(1) * 10).max(1)
}

fn next_prime(n: usize) -> usize {
    let mut candidate = n.max(2);
    while !is_prime(candidate) {
        candidate += 1;
    }
    candidate
}

fn is_prime(n: usize) -> bool {
    if n < 2 {
        return false;
    }
    let mut d = 2;
    while d * d <= n {
        if n % d == 0 {
            return false;
        }
        d += 1;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PoolConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.relocation_budget, 20);
        assert_eq!(config.scan_patience(), 4 * DEFAULT_NUM_FRAMES);
    }

    #[test]
    fn test_bucket_count_is_prime() {
        assert_eq!(PoolConfig::new(4).bucket_count(), 11);
        assert_eq!(PoolConfig::new(1).bucket_count(), 3);
        let buckets = PoolConfig::new(1000).bucket_count();
        assert!(is_prime(buckets));
        assert!(buckets >= 1778);
    }

    #[test]
    fn test_builder_rescales_budget() {
        let config = PoolConfig::new(8).with_slots_per_bucket(4);
        assert_eq!(config.relocation_budget, 30);
        let config = config.with_hash_functions(3);
        assert_eq!(config.relocation_budget, 60);
        let config = config.with_relocation_budget(5);
        assert_eq!(config.relocation_budget, 5);
        let config = config.with_num_frames(32);
        assert_eq!(config.num_frames, 32);
        assert_eq!(config.relocation_budget, 5);
    }

    #[test]
    fn test_invalid_configs() {
        assert!(PoolConfig::new(0).validate().is_err());
        assert!(PoolConfig::new(4).with_slots_per_bucket(0).validate().is_err());
        assert!(PoolConfig::new(4).with_hash_functions(5).validate().is_err());
        assert!(PoolConfig::new(4).with_transit(0, 1).validate().is_err());
        assert!(PoolConfig::new(4).with_transit(8, 0).validate().is_err());
        assert!(PoolConfig::new(4).with_write_lock_stripes(0).validate().is_err());
        assert!(PoolConfig::new(4).with_scan_patience_rounds(0).validate().is_err());
        assert!(PoolConfig::new(4).with_grab_probe_attempts(0).validate().is_err());
        assert!(PoolConfig::new(4).with_remove_patience(0).validate().is_err());
    }

    #[test]
    fn test_retry_builders() {
        let config = PoolConfig::new(4).with_grab_probe_attempts(3).with_remove_patience(2);
        assert_eq!(config.grab_probe_attempts, 3);
        assert_eq!(config.remove_patience, 2);
        assert!(config.validate().is_ok());
    }
}
