//! Partitioning of a labeled dataset across clients.
//!
//! The [`partition()`] function splits the indices of a [`Dataset`] into one disjoint
//! [`Partition`] per client, either uniformly at random (IID) or with a per-class Dirichlet skew
//! (non-IID). Each partition carries its realized ratio `|partition| / |dataset|`, which is the
//! weight of the client during aggregation.
//!
//! Partitioning is fully determined by the dataset, the relative sizes and the
//! [`PartitionSettings`] (including the seed), so the same inputs always yield the same
//! partitions.

mod dirichlet;
mod iid;

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::common::{ClientId, ConfigurationError};

/// A class label.
pub type Label = u32;

#[derive(Debug, Clone, PartialEq)]
/// An immutable ordered sequence of sample indices with their class labels.
pub struct Dataset {
    indices: Vec<usize>,
    labels: Vec<Label>,
    positions: HashMap<usize, usize>,
}

#[allow(clippy::len_without_is_empty)]
impl Dataset {
    /// Creates a dataset from sample indices and their labels.
    ///
    /// # Errors
    /// Fails if the number of indices and labels differ or if an index appears twice.
    pub fn new(indices: Vec<usize>, labels: Vec<Label>) -> Result<Self, ConfigurationError> {
        if indices.len() != labels.len() {
            return Err(ConfigurationError::LabelsMismatch {
                indices: indices.len(),
                labels: labels.len(),
            });
        }
        let mut positions = HashMap::with_capacity(indices.len());
        for (position, &index) in indices.iter().enumerate() {
            if positions.insert(index, position).is_some() {
                return Err(ConfigurationError::DuplicateIndex(index));
            }
        }
        Ok(Self {
            indices,
            labels,
            positions,
        })
    }

    /// Creates a dataset whose sample indices are `0..labels.len()`.
    pub fn from_labels(labels: Vec<Label>) -> Self {
        let indices: Vec<usize> = (0..labels.len()).collect();
        let positions = indices.iter().map(|&i| (i, i)).collect();
        Self {
            indices,
            labels,
            positions,
        }
    }

    /// Gets the number of samples.
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    /// Gets the position of the sample with the given index in this dataset.
    pub fn position(&self, index: usize) -> Option<usize> {
        self.positions.get(&index).copied()
    }

    /// Gets the label of the sample with the given index.
    pub fn label(&self, index: usize) -> Option<Label> {
        self.position(index).map(|position| self.labels[position])
    }

    /// Groups the sample indices by class, in ascending label order. Within a class the indices
    /// keep their dataset order.
    pub fn indices_by_class(&self) -> BTreeMap<Label, Vec<usize>> {
        let mut classes: BTreeMap<Label, Vec<usize>> = BTreeMap::new();
        for (&index, &label) in self.indices.iter().zip(&self.labels) {
            classes.entry(label).or_default().push(index);
        }
        classes
    }
}

#[derive(Debug, Clone, PartialEq)]
/// The disjoint subset of dataset indices owned by one client.
pub struct Partition {
    client_id: ClientId,
    indices: Vec<usize>,
    ratio: f64,
}

#[allow(clippy::len_without_is_empty)]
impl Partition {
    #[cfg(test)]
    pub(crate) fn new(client_id: ClientId, indices: Vec<usize>, ratio: f64) -> Self {
        Self {
            client_id,
            indices,
            ratio,
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    /// Gets the number of samples of this partition.
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// Gets the realized ratio `|partition| / |dataset|`.
    pub fn ratio(&self) -> f64 {
        self.ratio
    }
}

#[derive(Debug, Clone, PartialEq)]
/// The partitions of a dataset, one per client, indexed by [`ClientId`].
pub struct Partitions(Vec<Arc<Partition>>);

#[allow(clippy::len_without_is_empty)]
impl Partitions {
    /// Gets the number of partitions (i.e. clients).
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Gets the partition owned by the given client.
    pub fn get(&self, client_id: ClientId) -> Option<&Arc<Partition>> {
        self.0.get(client_id.index())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Partition>> {
        self.0.iter()
    }

    /// Gets the identifiers of all clients.
    pub fn client_ids(&self) -> Vec<ClientId> {
        self.0.iter().map(|p| p.client_id).collect()
    }

    /// Gets the realized ratios of all partitions, in client order.
    pub fn ratios(&self) -> Vec<f64> {
        self.0.iter().map(|p| p.ratio).collect()
    }

    /// Counts the samples per class in the partition of the given client.
    pub fn class_histogram(&self, client_id: ClientId, dataset: &Dataset) -> BTreeMap<Label, usize> {
        let mut histogram = BTreeMap::new();
        if let Some(partition) = self.get(client_id) {
            for label in partition.indices.iter().filter_map(|&i| dataset.label(i)) {
                *histogram.entry(label).or_insert(0) += 1;
            }
        }
        histogram
    }

    /// Computes the Shannon entropy (in nats) of the class distribution of the given client.
    pub fn class_entropy(&self, client_id: ClientId, dataset: &Dataset) -> f64 {
        let histogram = self.class_histogram(client_id, dataset);
        let total = histogram.values().sum::<usize>() as f64;
        if total == 0.0 {
            return 0.0;
        }
        -histogram
            .values()
            .map(|&count| {
                let p = count as f64 / total;
                p * p.ln()
            })
            .sum::<f64>()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
/// Partitioning parameters.
pub struct PartitionSettings {
    /// Whether to skew the class distribution of each client with Dirichlet draws.
    pub non_iid: bool,
    /// The Dirichlet concentration. Lower values yield more skewed clients.
    pub alpha: f64,
    /// The seed of the random generator.
    pub seed: u64,
    /// The minimal number of samples per client in non-IID mode (at least `1`).
    pub min_partition_size: usize,
    /// The maximal number of Dirichlet allocations drawn in non-IID mode.
    pub max_redraws: u32,
    /// Stops assigning further classes to clients which already hold their share of samples.
    pub balance: bool,
}

impl Default for PartitionSettings {
    fn default() -> Self {
        Self {
            non_iid: false,
            alpha: 0.1,
            seed: 2020,
            min_partition_size: 1,
            max_redraws: 100,
            balance: false,
        }
    }
}

/// Returns `n` equal relative sizes.
pub fn uniform_sizes(n: usize) -> Vec<f64> {
    vec![1.0 / n as f64; n]
}

/// Splits the dataset into `sizes.len()` disjoint partitions.
///
/// The relative `sizes` must be positive but don't need to be normalized. In IID mode they
/// determine the partition lengths, in non-IID mode the expected share of each client. Every
/// partition holds at least one sample.
///
/// # Errors
/// Fails with a [`ConfigurationError`] on invalid sizes or settings, if the dataset is too small
/// for the number of clients, if a size is too small to get a single sample, or if no valid
/// non-IID allocation was found within `max_redraws` draws.
pub fn partition(
    dataset: &Dataset,
    sizes: &[f64],
    settings: &PartitionSettings,
) -> Result<Partitions, ConfigurationError> {
    let sizes = normalize_sizes(sizes)?;
    let min = if settings.non_iid {
        validate_non_iid(settings)?;
        settings.min_partition_size.max(1)
    } else {
        1
    };
    if dataset.len() < sizes.len() * min {
        return Err(ConfigurationError::DatasetTooSmall {
            samples: dataset.len(),
            clients: sizes.len(),
            min,
        });
    }
    let mut rng = ChaCha20Rng::seed_from_u64(settings.seed);

    let parts = if settings.non_iid {
        dirichlet::split(dataset, &sizes, settings, &mut rng)?
    } else {
        iid::split(dataset.indices(), &sizes, &mut rng)
    };
    if let Some(i) = parts.iter().position(Vec::is_empty) {
        return Err(ConfigurationError::EmptyPartition(ClientId::new(i)));
    }

    let total = dataset.len() as f64;
    let partitions = Partitions(
        parts
            .into_iter()
            .enumerate()
            .map(|(i, indices)| {
                let ratio = if total > 0.0 {
                    indices.len() as f64 / total
                } else {
                    0.0
                };
                Arc::new(Partition {
                    client_id: ClientId::new(i),
                    indices,
                    ratio,
                })
            })
            .collect(),
    );

    info!(
        "partitioned {} samples across {} clients ({})",
        dataset.len(),
        partitions.len(),
        if settings.non_iid { "non-IID" } else { "IID" },
    );
    for p in partitions.iter() {
        debug!("{}: {} samples, ratio {:.4}", p.client_id, p.len(), p.ratio);
    }
    Ok(partitions)
}

fn normalize_sizes(sizes: &[f64]) -> Result<Vec<f64>, ConfigurationError> {
    if sizes.is_empty() {
        return Err(ConfigurationError::NoClients);
    }
    if sizes.iter().any(|s| !s.is_finite() || *s <= 0.0) {
        return Err(ConfigurationError::InvalidSizes);
    }
    let sum: f64 = sizes.iter().sum();
    if !sum.is_finite() {
        return Err(ConfigurationError::InvalidSizes);
    }
    Ok(sizes.iter().map(|s| s / sum).collect())
}

fn validate_non_iid(settings: &PartitionSettings) -> Result<(), ConfigurationError> {
    if !(settings.alpha > 0.0) || !settings.alpha.is_finite() {
        return Err(ConfigurationError::InvalidAlpha(settings.alpha));
    }
    if settings.max_redraws == 0 {
        return Err(ConfigurationError::NoRedraws);
    }
    Ok(())
}

/// Distributes `total` items according to normalized `weights` with floor allocation. The
/// remainder is handed out one item at a time in the order given by `priority`.
fn allocate(total: usize, weights: &[f64], priority: impl Iterator<Item = usize>) -> Vec<usize> {
    let mut counts: Vec<usize> = weights
        .iter()
        .map(|w| (w * total as f64).floor() as usize)
        .collect();
    let allocated: usize = counts.iter().sum();
    let remainder = total.saturating_sub(allocated);
    for i in priority.take(remainder) {
        counts[i] += 1;
    }
    counts
}
