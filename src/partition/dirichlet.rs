//! Non-IID partitioning with per-class Dirichlet proportions.
//!
//! For every class, the class samples are shuffled and split across the clients according to a
//! proportion vector drawn from `Dirichlet(alpha * N * s)`, where `s` are the normalized relative
//! sizes. An allocation which leaves a client with fewer than `min_partition_size` samples is
//! rejected as a whole and redrawn, so the accepted draw follows the unmodified distribution.

use std::{cmp::Ordering, collections::BTreeMap};

use rand::{distributions::Distribution, seq::SliceRandom};
use rand_chacha::ChaCha20Rng;
use rand_distr::Dirichlet;
use tracing::{debug, warn};

use super::{allocate, Dataset, Label, PartitionSettings};
use crate::common::ConfigurationError;

pub(super) fn split(
    dataset: &Dataset,
    sizes: &[f64],
    settings: &PartitionSettings,
    rng: &mut ChaCha20Rng,
) -> Result<Vec<Vec<usize>>, ConfigurationError> {
    let clients = sizes.len() as f64;
    let concentration: Vec<f64> = sizes.iter().map(|s| settings.alpha * clients * s).collect();
    let fair_share: Vec<f64> = sizes.iter().map(|s| s * dataset.len() as f64).collect();
    let classes = dataset.indices_by_class();
    let min = settings.min_partition_size.max(1);

    for attempt in 1..=settings.max_redraws {
        match draw_allocation(&classes, &concentration, &fair_share, settings.balance, rng) {
            Some(parts) if parts.iter().all(|p| p.len() >= min) => {
                debug!("accepted Dirichlet allocation after {} draw(s)", attempt);
                return Ok(parts);
            }
            Some(_) => debug!("draw {}: a client holds fewer than {} samples", attempt, min),
            None => debug!("draw {}: degenerate Dirichlet proportions", attempt),
        }
    }

    warn!("no valid Dirichlet allocation after {} draws", settings.max_redraws);
    Err(ConfigurationError::PartitionRedrawsExhausted {
        attempts: settings.max_redraws,
        min,
    })
}

/// Draws one allocation of all classes. Returns `None` if a proportion vector is degenerate.
fn draw_allocation(
    classes: &BTreeMap<Label, Vec<usize>>,
    concentration: &[f64],
    fair_share: &[f64],
    balance: bool,
    rng: &mut ChaCha20Rng,
) -> Option<Vec<Vec<usize>>> {
    let mut parts = vec![Vec::new(); concentration.len()];

    for members in classes.values() {
        let mut members = members.clone();
        members.shuffle(rng);

        let mut proportions = draw_proportions(concentration, rng)?;
        if balance {
            cap_full_clients(&mut proportions, &parts, fair_share);
        }

        let counts = largest_remainder(members.len(), &proportions);
        let mut rest = members.as_slice();
        for (part, count) in parts.iter_mut().zip(counts) {
            let (head, tail) = rest.split_at(count.min(rest.len()));
            part.extend_from_slice(head);
            rest = tail;
        }
    }

    Some(parts)
}

/// Draws a probability vector. Clients with a zero concentration always get zero.
fn draw_proportions(concentration: &[f64], rng: &mut ChaCha20Rng) -> Option<Vec<f64>> {
    let active: Vec<usize> = (0..concentration.len())
        .filter(|&i| concentration[i] > 0.0)
        .collect();

    let mut proportions = vec![0.0; concentration.len()];
    match active.len() {
        0 => return None,
        1 => proportions[active[0]] = 1.0,
        _ => {
            let alpha: Vec<f64> = active.iter().map(|&i| concentration[i]).collect();
            let dirichlet = Dirichlet::new(alpha.as_slice()).ok()?;
            let sample: Vec<f64> = dirichlet.sample(rng);
            let sum: f64 = sample.iter().sum();
            if !sum.is_finite() || sum <= 0.0 || sample.iter().any(|p| !p.is_finite()) {
                return None;
            }
            for (&i, p) in active.iter().zip(sample) {
                proportions[i] = p / sum;
            }
        }
    }
    Some(proportions)
}

/// Zeroes the proportions of clients which already hold their fair share, unless all would be
/// zeroed.
fn cap_full_clients(proportions: &mut [f64], parts: &[Vec<usize>], fair_share: &[f64]) {
    let capped: Vec<f64> = proportions
        .iter()
        .zip(parts.iter().zip(fair_share))
        .map(|(&p, (part, &share))| if part.len() as f64 >= share { 0.0 } else { p })
        .collect();
    let sum: f64 = capped.iter().sum();
    if sum > 0.0 {
        for (p, c) in proportions.iter_mut().zip(capped) {
            *p = c / sum;
        }
    }
}

/// Allocates `total` samples with floor allocation; the remainder goes to the largest residuals
/// first, ties broken by the lower client index.
fn largest_remainder(total: usize, proportions: &[f64]) -> Vec<usize> {
    let residuals: Vec<f64> = proportions
        .iter()
        .map(|p| {
            let exact = p * total as f64;
            exact - exact.floor()
        })
        .collect();
    let mut priority: Vec<usize> = (0..proportions.len()).collect();
    priority.sort_by(|&a, &b| {
        residuals[b]
            .partial_cmp(&residuals[a])
            .unwrap_or(Ordering::Equal)
            .then(a.cmp(&b))
    });
    allocate(total, proportions, priority.into_iter())
}
