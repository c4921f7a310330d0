//! Distribution sampling
//!
//! Each shard independently adds about `p` percent of its own users to a
//! segment. Rows are drawn with Bernoulli sampling at a slightly higher
//! rate (`p + 5`, capped at 100) so that sampling variance rarely leaves
//! the shard short. An oversized draw is cut down to the target count by a
//! uniform random pick, so no id range is favoured.

use crate::domain::{Percentage, UserId};
use rand::seq::index;
use rand::Rng;

/// Extra sampling percentage drawn on top of the requested share.
pub const OVERSAMPLE_MARGIN: u8 = 5;

/// Number of users a shard with `population` users should add.
pub fn target_count(population: u64, percentage: Percentage) -> u64 {
    population * u64::from(percentage.get()) / 100
}

/// Sampling rate (in percent) used for the Bernoulli draw.
pub fn oversample_percent(percentage: Percentage) -> u8 {
    percentage.get().saturating_add(OVERSAMPLE_MARGIN).min(100)
}

/// Pick the users a shard adds to a segment.
///
/// The result keeps the order of `users` and never exceeds [`target_count`].
/// An empty shard yields an empty sample.
pub fn sample_users<R: Rng + ?Sized>(
    users: &[UserId],
    percentage: Percentage,
    rng: &mut R,
) -> Vec<UserId> {
    let target = target_count(users.len() as u64, percentage) as usize;
    if target == 0 {
        return Vec::new();
    }

    let rate = f64::from(oversample_percent(percentage)) / 100.0;
    let drawn: Vec<UserId> = users
        .iter()
        .copied()
        .filter(|_| rng.gen_bool(rate))
        .collect();
    if drawn.len() <= target {
        return drawn;
    }

    let mut picked = index::sample(rng, drawn.len(), target).into_vec();
    picked.sort_unstable();
    picked.into_iter().map(|i| drawn[i]).collect()
}
