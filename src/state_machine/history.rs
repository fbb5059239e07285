//! The per-round record of an experiment.

use serde::Serialize;

use crate::{aggregator::AggregationSummary, common::RoundId, trainer::Metrics};

#[derive(Debug, Clone, PartialEq, Serialize)]
/// The outcome of one round.
pub struct RoundSummary {
    pub round_id: RoundId,
    /// The number of clients selected for training.
    pub selected: usize,
    /// The number of selected clients whose training failed.
    pub failures: usize,
    pub aggregation: AggregationSummary,
    /// The example-weighted average of the clients' training metrics.
    pub train: Option<Metrics>,
    /// The centralized evaluation of the new global model.
    pub test: Option<Metrics>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
/// The summaries of all completed rounds, in round order.
pub struct History {
    rounds: Vec<RoundSummary>,
}

impl History {
    pub fn push(&mut self, summary: RoundSummary) {
        self.rounds.push(summary);
    }

    pub fn rounds(&self) -> &[RoundSummary] {
        &self.rounds
    }

    pub fn len(&self) -> usize {
        self.rounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rounds.is_empty()
    }

    pub fn last(&self) -> Option<&RoundSummary> {
        self.rounds.last()
    }
}

/// Averages metrics weighted by the number of examples they were computed on.
///
/// Returns `None` if there are no examples at all.
pub fn weighted_average(metrics: &[(usize, Metrics)]) -> Option<Metrics> {
    let examples: usize = metrics.iter().map(|(n, _)| n).sum();
    if examples == 0 {
        return None;
    }
    let total = examples as f64;
    let (loss, accuracy) = metrics.iter().fold((0.0, 0.0), |(loss, accuracy), (n, m)| {
        let weight = *n as f64 / total;
        (loss + weight * m.loss, accuracy + weight * m.accuracy)
    });
    Some(Metrics { loss, accuracy })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weighted_average() {
        let metrics = vec![
            (
                10,
                Metrics {
                    loss: 1.0,
                    accuracy: 0.5,
                },
            ),
            (
                30,
                Metrics {
                    loss: 2.0,
                    accuracy: 0.9,
                },
            ),
        ];
        let average = weighted_average(&metrics).unwrap();
        assert!((average.loss - 1.75).abs() < 1e-12);
        assert!((average.accuracy - 0.8).abs() < 1e-12);

        assert_eq!(weighted_average(&[]), None);
        assert_eq!(
            weighted_average(&[(
                0,
                Metrics {
                    loss: 1.0,
                    accuracy: 1.0
                }
            )]),
            None
        );
    }
}
