use std::collections::BTreeSet;

use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;

use crate::arch::InsnId;

/// Experiment sampling that is uniform over *multisets* of instructions.
///
/// Naively drawing a length and then instructions oversamples short
/// sequences and sequences with repeated instructions. Instead, lengths are
/// weighted by how many multisets exist at that length, and within a length
/// the occurrence pattern (an integer partition of the length) is weighted
/// by how many distinct instantiations it has.

fn binomial(n: u64, k: u64) -> f64 {
    if k > n {
        return 0.0;
    }
    let k = k.min(n - k);
    let mut res = 1.0f64;
    for i in 0..k {
        res *= (n - i) as f64 / (i + 1) as f64;
    }
    res
}

fn factorial(n: u64) -> f64 {
    (1..=n).map(|i| i as f64).product()
}

/// Number of multisets of size `length` over a universe of `num` elements.
fn num_multisets(num: u64, length: u64) -> f64 {
    binomial(num + length - 1, num - 1)
}

/// All integer partitions of `l`, each part sorted ascending.
fn partitions_of(l: usize) -> Vec<Vec<usize>> {
    fn rec(remaining: usize, max_part: usize, prefix: &mut Vec<usize>, out: &mut Vec<Vec<usize>>) {
        if remaining == 0 {
            let mut p = prefix.clone();
            p.reverse();
            out.push(p);
            return;
        }
        for part in (1..=max_part.min(remaining)).rev() {
            prefix.push(part);
            rec(remaining - part, part, prefix, out);
            prefix.pop();
        }
    }
    let mut out = Vec::new();
    rec(l, l, &mut Vec::new(), &mut out);
    out
}

/// The number of distinct instruction sequences (as multisets) matching a
/// pattern, over a universe of `num` instructions.
///
/// Start from the number of k-permutations over the universe (k = number of
/// distinct slots) and divide by the permutations within each group of
/// equally-often-occurring slots, since order only matters between slots
/// with different occurrence counts.
fn pattern_instantiations(num: u64, pattern: &[usize]) -> f64 {
    let k = pattern.len() as u64;
    let num_kperm = binomial(num, k) * factorial(k);
    let mut divisor = 1.0;
    let mut i = 0;
    while i < pattern.len() {
        let mut group = 1u64;
        while i + 1 < pattern.len() && pattern[i + 1] == pattern[i] {
            group += 1;
            i += 1;
        }
        divisor *= factorial(group);
        i += 1;
    }
    num_kperm / divisor
}

fn sample_pattern<R: Rng>(num_insns: usize, length: usize, rng: &mut R) -> Vec<usize> {
    let pats = partitions_of(length);
    let weights: Vec<f64> = pats
        .iter()
        .map(|p| pattern_instantiations(num_insns as u64, p))
        .collect();
    let dist = WeightedIndex::new(&weights).expect("pattern weights are positive");
    pats[dist.sample(rng)].clone()
}

/// Draws one multiset of size `length`, represented as a sorted sequence.
fn sample_multiset<R: Rng>(insns: &[InsnId], length: usize, rng: &mut R) -> Vec<InsnId> {
    let pattern = sample_pattern(insns.len(), length, rng);
    let chosen = rand::seq::index::sample(rng, insns.len(), pattern.len());
    let mut res = Vec::with_capacity(length);
    for (slot, count) in pattern.iter().enumerate() {
        let insn = insns[chosen.index(slot)];
        res.extend(std::iter::repeat(insn).take(*count));
    }
    res.sort();
    res
}

/// Draws one multiset with a length in `[minl, maxl)`, the length weighted
/// by the number of multisets of that length.
fn sample_multiset_in_range<R: Rng>(
    insns: &[InsnId],
    minl: usize,
    maxl: usize,
    rng: &mut R,
) -> Vec<InsnId> {
    let length = if maxl - minl <= 1 {
        minl
    } else {
        let weights: Vec<f64> = (minl..maxl)
            .map(|l| num_multisets(insns.len() as u64, l as u64))
            .collect();
        let dist = WeightedIndex::new(&weights).expect("length weights are positive");
        minl + dist.sample(rng)
    };
    sample_multiset(insns, length, rng)
}

/// Samples `num` distinct multisets with lengths in `[minl, maxl)`.
///
/// For `maxl <= 2` the universe of multisets is just the instruction set,
/// so the request is clamped to its size. Gives up with a warning if the
/// space is too small to produce enough distinct samples.
pub fn sample_experiments<R: Rng>(
    insns: &[InsnId],
    minl: usize,
    maxl: usize,
    num: usize,
    rng: &mut R,
) -> Vec<Vec<InsnId>> {
    assert!(minl >= 1 && maxl > minl);
    let mut num = num;
    if maxl <= 2 && insns.len() < num {
        num = insns.len();
    }
    let mut seen: BTreeSet<Vec<InsnId>> = BTreeSet::new();
    let mut stale_draws = 0usize;
    while seen.len() < num {
        if seen.insert(sample_multiset_in_range(insns, minl, maxl, rng)) {
            stale_draws = 0;
        } else {
            stale_draws += 1;
            if stale_draws > 1000 * num {
                log::warn!(
                    "sample space exhausted after {} distinct experiments (requested {})",
                    seen.len(),
                    num
                );
                break;
            }
        }
    }
    seen.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() <= 1e-6 * b.abs().max(1.0)
    }

    #[test]
    fn binomials() {
        assert_eq!(binomial(5, 2), 10.0);
        assert!(close(binomial(19, 10), 92378.0));
        assert_eq!(binomial(3, 5), 0.0);
    }

    #[test]
    fn partitions_of_five() {
        let pats = partitions_of(5);
        assert_eq!(pats.len(), 7);
        assert!(pats.contains(&vec![1, 1, 1, 1, 1]));
        assert!(pats.contains(&vec![1, 2, 2]));
        assert!(pats.contains(&vec![5]));
    }

    #[test]
    fn instantiation_counts_for_known_patterns() {
        // Universe of 500 instructions, length 5: all-same has 500
        // instantiations, all-distinct collapses to C(500,5) because order
        // within equally-often-occurring slots is insignificant, and
        // (1,2,2) divides out the swap of the two pairs.
        assert!(close(pattern_instantiations(500, &[5]), 500.0));
        assert!(close(pattern_instantiations(500, &[1, 1, 1, 1, 1]), 255244687600.0));
        assert!(close(pattern_instantiations(500, &[1, 2, 2]), 62125500.0));
    }

    #[test]
    fn samples_are_sorted_distinct_multisets_of_requested_length() {
        let insns: Vec<InsnId> = (0..20).map(InsnId).collect();
        let mut rng = StdRng::seed_from_u64(424242);
        let exps = sample_experiments(&insns, 3, 6, 50, &mut rng);
        assert_eq!(exps.len(), 50);
        for e in &exps {
            assert!((3..6).contains(&e.len()));
            assert!(e.windows(2).all(|w| w[0] <= w[1]));
        }
        let distinct: BTreeSet<_> = exps.iter().collect();
        assert_eq!(distinct.len(), exps.len());
    }

    #[test]
    fn small_universe_is_clamped_for_singletons() {
        let insns: Vec<InsnId> = (0..4).map(InsnId).collect();
        let mut rng = StdRng::seed_from_u64(1);
        let exps = sample_experiments(&insns, 1, 2, 100, &mut rng);
        assert_eq!(exps.len(), 4);
    }

    #[test]
    fn sampling_is_deterministic_per_seed() {
        let insns: Vec<InsnId> = (0..10).map(InsnId).collect();
        let a = sample_experiments(&insns, 2, 5, 20, &mut StdRng::seed_from_u64(7));
        let b = sample_experiments(&insns, 2, 5, 20, &mut StdRng::seed_from_u64(7));
        assert_eq!(a, b);
    }
}
