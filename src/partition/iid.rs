//! Uniform (IID) partitioning.

use rand::seq::SliceRandom;
use rand_chacha::ChaCha20Rng;

use super::allocate;

/// Shuffles the indices once and cuts them into contiguous slices proportional to the normalized
/// `sizes`. The floor allocation remainder goes to the first slices with a positive size.
pub(super) fn split(indices: &[usize], sizes: &[f64], rng: &mut ChaCha20Rng) -> Vec<Vec<usize>> {
    let mut shuffled = indices.to_vec();
    shuffled.shuffle(rng);

    let priority = (0..sizes.len()).filter(|&i| sizes[i] > 0.0);
    let lengths = allocate(shuffled.len(), sizes, priority);

    let mut rest = shuffled.as_slice();
    lengths
        .into_iter()
        .map(|len| {
            let (head, tail) = rest.split_at(len.min(rest.len()));
            rest = tail;
            head.to_vec()
        })
        .collect()
}
