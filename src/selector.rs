//! Variant selection from a bucket: traffic allocation first, then variant weights.
use crate::{
    bucket::Bucket,
    experiment::{Experiment, Variant},
};

/// Pick the variant for `bucket`, or `None` if the bucket falls outside the traffic allocation.
///
/// 1. `bucket.allocation >= trafficAllocationPercent / 100` excludes the user regardless of
///    weights.
/// 2. Otherwise `bucket.variant` is located in the cumulative-weight partition of the variants
///    (declaration order), so variant `i` is chosen with probability `weight_i / Σ weights`.
///
/// The two stages use independent lanes of the bucket. Remapping a single hash proportionally
/// (`allocation / trafficAllocation` as the variant position) would shift the position of every
/// included user whenever the allocation grows, so a not-yet-persisted user near a weight
/// boundary could flip variants. With a separate variant lane, raising the allocation only adds
/// users and never changes the variant of a user that was already included.
pub fn select<'a>(experiment: &'a Experiment, bucket: Bucket) -> Option<&'a Variant> {
    let allocation = experiment.traffic_allocation_percent / 100.0;
    if !(bucket.allocation < allocation) {
        return None;
    }

    let total_weight: f64 = experiment.variants.iter().map(|v| v.weight).sum();
    if !(total_weight > 0.0) {
        return None;
    }

    let target = bucket.variant * total_weight;
    let mut cumulative = 0.0;
    for variant in &experiment.variants {
        cumulative += variant.weight;
        if target < cumulative {
            return Some(variant);
        }
    }

    // Floating-point rounding can leave `target` a hair above the last cumulative sum.
    experiment.variants.last()
}
