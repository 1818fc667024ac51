//! Deterministic bucketing of users into experiments.

/// Salt mixed into every bucket hash.
///
/// Changing it reshuffles every user in every experiment, so it is versioned and must stay fixed
/// for the lifetime of a deployment's assignment data.
pub const DEFAULT_SALT: &str = "abkit-bucket-v1";

/// A user's position in an experiment, derived from `(testId, userId)`.
///
/// `allocation` decides whether the user is inside the traffic band. `variant` decides the
/// variant inside the band. Both lanes come from the same digest but are independent, so moving the
/// allocation band never moves an included user to a different variant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bucket {
    /// Position in `[0, 1)` compared against the traffic allocation.
    pub allocation: f64,
    /// Position in `[0, 1)` located inside the cumulative variant weights.
    pub variant: f64,
}

/// Maps `(testId, userId)` to a reproducible [`Bucket`].
pub trait BucketHasher {
    /// 64-bit hash of `(test_id, user_id)` driving the allocation decision.
    fn hash(&self, test_id: &str, user_id: &str) -> u64 {
        self.hash_lanes(test_id, user_id).0
    }

    /// Two independent 64-bit lanes for `(test_id, user_id)`.
    fn hash_lanes(&self, test_id: &str, user_id: &str) -> (u64, u64);

    /// Normalized bucket.
    fn bucket(&self, test_id: &str, user_id: &str) -> Bucket {
        let (allocation, variant) = self.hash_lanes(test_id, user_id);
        Bucket {
            allocation: to_unit_interval(allocation),
            variant: to_unit_interval(variant),
        }
    }
}

/// The default hasher: MD5 over `salt ‖ 0x00 ‖ testId ‖ 0x00 ‖ userId`.
#[derive(Debug, Clone)]
pub struct Md5BucketHasher {
    salt: String,
}

impl Md5BucketHasher {
    #[allow(missing_docs)]
    pub fn new(salt: impl Into<String>) -> Md5BucketHasher {
        Md5BucketHasher { salt: salt.into() }
    }
}

impl Default for Md5BucketHasher {
    fn default() -> Self {
        Md5BucketHasher::new(DEFAULT_SALT)
    }
}

impl BucketHasher for Md5BucketHasher {
    fn hash_lanes(&self, test_id: &str, user_id: &str) -> (u64, u64) {
        let mut context = md5::Context::new();
        context.consume(self.salt.as_bytes());
        context.consume([0u8]);
        context.consume(test_id.as_bytes());
        context.consume([0u8]);
        context.consume(user_id.as_bytes());
        let digest = context.compute();

        let mut high = [0u8; 8];
        let mut low = [0u8; 8];
        high.copy_from_slice(&digest[0..8]);
        low.copy_from_slice(&digest[8..16]);
        (u64::from_be_bytes(high), u64::from_be_bytes(low))
    }
}

/// Map a hash to `[0, 1)`, i.e. `hash / 2^64`. Uses the top 53 bits so the result is exact in an
/// `f64` and can never round up to `1.0`.
pub fn to_unit_interval(hash: u64) -> f64 {
    (hash >> 11) as f64 / (1u64 << 53) as f64
}

#[cfg(test)]
pub(crate) struct DeterministicHasher(pub std::collections::HashMap<String, (u64, u64)>);

#[cfg(test)]
impl BucketHasher for DeterministicHasher {
    fn hash_lanes(&self, _test_id: &str, user_id: &str) -> (u64, u64) {
        self.0.get(user_id).copied().unwrap_or((0, 0))
    }
}
