//! Loading and validation of settings.
//!
//! Values defined in the configuration file can be overridden by environment variables prefixed
//! with `FEDNOVA_`, with `__` separating the section from the key. An example configuration file
//! can be found in the `configs/` directory located in the repository root.

use std::{fmt, path::Path};

use config::{Config, ConfigError, Environment};
use serde::{
    de::{self, Deserializer, Visitor},
    Deserialize,
};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::{aggregator::AggregationSettings, partition::PartitionSettings};

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Validate, Deserialize)]
/// The combined settings.
///
/// Each section in the configuration file corresponds to the identically named settings field.
pub struct Settings {
    #[validate]
    pub experiment: ExperimentSettings,
    #[validate]
    pub data: DataSettings,
    #[validate]
    pub training: TrainingSettings,
    #[validate]
    pub optimizer: OptimizerSettings,
    #[validate]
    pub simulation: SimulationSettings,
    pub log: LoggingSettings,
}

impl Settings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let settings: Settings = Self::load(path)?;
        settings.validate()?;
        Ok(settings)
    }

    fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Config::new();
        config.merge(config::File::from(path.as_ref()))?;
        config.merge(Environment::with_prefix("fednova").separator("__"))?;
        config.try_into()
    }

    /// Gets the partitioner settings, seeded with the experiment seed.
    pub fn partition_settings(&self) -> PartitionSettings {
        PartitionSettings {
            non_iid: self.data.non_iid,
            alpha: self.data.alpha,
            seed: self.experiment.seed,
            min_partition_size: self.data.min_partition_size,
            max_redraws: self.data.max_redraws,
            balance: self.data.balance,
        }
    }
}

#[derive(Debug, Validate, Deserialize, Clone, Copy)]
#[validate(schema(function = "validate_experiment"))]
/// The experiment settings.
pub struct ExperimentSettings {
    /// The number of clients, each owning one data partition.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [experiment]
    /// num_clients = 100
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDNOVA_EXPERIMENT__NUM_CLIENTS=100
    /// ```
    pub num_clients: usize,
    /// The number of federated rounds.
    pub num_rounds: u64,
    /// The seed of the partitioner, the client selection and the simulation.
    pub seed: u64,
    /// The fraction of clients selected per round, `0 < clients_per_round <= 1`. At least one
    /// client is always selected.
    #[serde(default = "default_clients_per_round")]
    pub clients_per_round: f64,
    /// Whether a round tolerates failed clients. If `false`, any client failure fails the round.
    #[serde(default)]
    pub accept_failures: bool,
}

fn default_clients_per_round() -> f64 {
    1.0
}

impl ExperimentSettings {
    fn validate_experiment(&self) -> Result<(), ValidationError> {
        if self.num_clients == 0 || self.num_rounds == 0 {
            return Err(ValidationError::new("no clients or no rounds"));
        }
        if !(0. < self.clients_per_round && self.clients_per_round <= 1.) {
            return Err(ValidationError::new("invalid client fraction"));
        }
        Ok(())
    }
}

/// A wrapper for validate derive.
fn validate_experiment(s: &ExperimentSettings) -> Result<(), ValidationError> {
    s.validate_experiment()
}

#[derive(Debug, Validate, Deserialize, Clone, Copy)]
#[validate(schema(function = "validate_data"))]
/// The data partitioning settings.
pub struct DataSettings {
    /// Whether the partitions are drawn class-wise from a Dirichlet distribution instead of
    /// uniformly.
    pub non_iid: bool,
    /// The Dirichlet concentration. Smaller values give more skewed class distributions.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [data]
    /// non_iid = true
    /// alpha = 0.1
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDNOVA_DATA__ALPHA=0.1
    /// ```
    pub alpha: f64,
    /// The minimal number of samples of every non-IID partition.
    #[serde(default = "default_min_partition_size")]
    pub min_partition_size: usize,
    /// The maximal number of Dirichlet draws before the partitioning fails.
    #[serde(default = "default_max_redraws")]
    pub max_redraws: u32,
    /// Whether clients holding their fair share stop receiving further classes.
    #[serde(default)]
    pub balance: bool,
}

fn default_min_partition_size() -> usize {
    1
}

fn default_max_redraws() -> u32 {
    100
}

impl DataSettings {
    fn validate_data(&self) -> Result<(), ValidationError> {
        if self.non_iid && !(self.alpha.is_finite() && self.alpha > 0.) {
            return Err(ValidationError::new("invalid Dirichlet concentration"));
        }
        if self.max_redraws == 0 {
            return Err(ValidationError::new("no Dirichlet draws"));
        }
        Ok(())
    }
}

/// A wrapper for validate derive.
fn validate_data(s: &DataSettings) -> Result<(), ValidationError> {
    s.validate_data()
}

#[derive(Debug, Validate, Deserialize, Clone, Copy)]
#[validate(schema(function = "validate_training"))]
/// The local training settings.
pub struct TrainingSettings {
    /// The number of local epochs of every client.
    pub local_epochs: u32,
    /// Whether every client draws its number of local epochs per round uniformly from
    /// `var_min_epochs..=var_max_epochs` instead.
    #[serde(default)]
    pub var_local_epochs: bool,
    #[serde(default = "default_var_min_epochs")]
    pub var_min_epochs: u32,
    #[serde(default = "default_var_max_epochs")]
    pub var_max_epochs: u32,
    /// The minibatch size of the local optimizer.
    pub batch_size: usize,
}

fn default_var_min_epochs() -> u32 {
    2
}

fn default_var_max_epochs() -> u32 {
    5
}

impl TrainingSettings {
    fn validate_training(&self) -> Result<(), ValidationError> {
        if self.local_epochs == 0 || self.batch_size == 0 {
            return Err(ValidationError::new("no local epochs or empty batches"));
        }
        if self.var_local_epochs
            && !(1 <= self.var_min_epochs && self.var_min_epochs <= self.var_max_epochs)
        {
            return Err(ValidationError::new("invalid local epoch range"));
        }
        Ok(())
    }
}

/// A wrapper for validate derive.
fn validate_training(s: &TrainingSettings) -> Result<(), ValidationError> {
    s.validate_training()
}

#[derive(Debug, Validate, Deserialize, Clone, Copy, PartialEq)]
#[validate(schema(function = "validate_optimizer"))]
/// The settings of the clients' local optimizer and of the server momentum.
pub struct OptimizerSettings {
    /// The local learning rate, `lr > 0`.
    pub lr: f64,
    /// The local momentum factor, `0 <= momentum < 1`.
    pub momentum: f64,
    /// The server momentum factor, `0 <= gmf < 1`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [optimizer]
    /// gmf = 0.0
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDNOVA_OPTIMIZER__GMF=0.0
    /// ```
    pub gmf: f64,
    /// The proximal coefficient, `mu >= 0`. `0` disables the proximal term.
    pub mu: f64,
    /// The local L2 weight decay, `weight_decay >= 0`.
    #[serde(default)]
    pub weight_decay: f64,
}

impl OptimizerSettings {
    fn validate_optimizer(&self) -> Result<(), ValidationError> {
        if self.lr > 0.
            && self.lr.is_finite()
            && 0. <= self.momentum
            && self.momentum < 1.
            && 0. <= self.gmf
            && self.gmf < 1.
            && 0. <= self.mu
            && self.mu.is_finite()
            && 0. <= self.weight_decay
            && self.weight_decay.is_finite()
        {
            Ok(())
        } else {
            Err(ValidationError::new("invalid optimizer parameter(s)"))
        }
    }
}

/// A wrapper for validate derive.
fn validate_optimizer(s: &OptimizerSettings) -> Result<(), ValidationError> {
    s.validate_optimizer()
}

impl From<OptimizerSettings> for AggregationSettings {
    fn from(optimizer: OptimizerSettings) -> Self {
        Self {
            lr: optimizer.lr,
            momentum: optimizer.momentum,
            prox_mu: optimizer.mu,
            gmf: optimizer.gmf,
        }
    }
}

#[derive(Debug, Validate, Deserialize, Clone, Copy)]
#[validate(schema(function = "validate_simulation"))]
/// The settings of the synthetic classification task.
pub struct SimulationSettings {
    /// The number of training samples, shared among all clients.
    pub num_samples: usize,
    /// The number of classes.
    pub num_classes: usize,
    /// The number of input features.
    pub num_features: usize,
}

impl SimulationSettings {
    fn validate_simulation(&self) -> Result<(), ValidationError> {
        if self.num_samples >= 1 && self.num_classes >= 2 && self.num_features >= 1 {
            Ok(())
        } else {
            Err(ValidationError::new("degenerate synthetic task"))
        }
    }
}

/// A wrapper for validate derive.
fn validate_simulation(s: &SimulationSettings) -> Result<(), ValidationError> {
    s.validate_simulation()
}

#[derive(Debug, Deserialize)]
/// The logging settings.
pub struct LoggingSettings {
    /// A comma-separated list of logging directives. More information about logging directives
    /// can be found [here].
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [log]
    /// filter = "info"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDNOVA_LOG__FILTER=info
    /// ```
    ///
    /// [here]: https://docs.rs/tracing-subscriber/0.2.17/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a valid tracing filter directive")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value)
                .map_err(|_| de::Error::invalid_value(serde::de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}

#[cfg(test)]
pub(crate) mod tests {
    use serial_test::serial;

    use super::*;

    impl Default for ExperimentSettings {
        fn default() -> Self {
            Self {
                num_clients: 4,
                num_rounds: 3,
                seed: 2020,
                clients_per_round: 1.0,
                accept_failures: false,
            }
        }
    }

    impl Default for DataSettings {
        fn default() -> Self {
            Self {
                non_iid: true,
                alpha: 0.5,
                min_partition_size: 1,
                max_redraws: 100,
                balance: false,
            }
        }
    }

    impl Default for TrainingSettings {
        fn default() -> Self {
            Self {
                local_epochs: 2,
                var_local_epochs: false,
                var_min_epochs: 2,
                var_max_epochs: 5,
                batch_size: 16,
            }
        }
    }

    impl Default for OptimizerSettings {
        fn default() -> Self {
            Self {
                lr: 0.05,
                momentum: 0.0,
                gmf: 0.0,
                mu: 0.0,
                weight_decay: 0.0,
            }
        }
    }

    impl Default for SimulationSettings {
        fn default() -> Self {
            Self {
                num_samples: 400,
                num_classes: 4,
                num_features: 6,
            }
        }
    }

    #[test]
    #[serial]
    fn test_settings_new() {
        let settings = Settings::new("configs/config.toml").unwrap();
        assert!(settings.experiment.num_clients > 0);
        assert!(Settings::new("").is_err());
    }

    #[test]
    #[serial]
    fn test_partition_settings() {
        let settings = Settings::new("configs/config.toml").unwrap();
        let partition = settings.partition_settings();
        assert_eq!(partition.seed, settings.experiment.seed);
        assert_eq!(partition.non_iid, settings.data.non_iid);
        assert_eq!(partition.max_redraws, settings.data.max_redraws);
    }

    #[test]
    #[serial]
    fn test_env_overrides_config_file() {
        std::env::set_var("FEDNOVA_EXPERIMENT__NUM_ROUNDS", "7");
        std::env::set_var("FEDNOVA_DATA__ALPHA", "0.25");
        let settings = Settings::new("configs/config.toml");
        std::env::remove_var("FEDNOVA_EXPERIMENT__NUM_ROUNDS");
        std::env::remove_var("FEDNOVA_DATA__ALPHA");

        let settings = settings.unwrap();
        assert_eq!(settings.experiment.num_rounds, 7);
        assert!((settings.data.alpha - 0.25).abs() < f64::EPSILON);
        // untouched keys keep their file values
        assert_eq!(settings.experiment.num_clients, 16);
    }

    #[test]
    #[serial]
    fn test_invalid_env_override_fails_validation() {
        std::env::set_var("FEDNOVA_EXPERIMENT__NUM_ROUNDS", "0");
        let settings = Settings::new("configs/config.toml");
        std::env::remove_var("FEDNOVA_EXPERIMENT__NUM_ROUNDS");

        assert!(matches!(settings, Err(SettingsError::Validation(_))));
    }

    #[test]
    fn test_validate_experiment() {
        assert!(ExperimentSettings::default().validate().is_ok());
        assert!(ExperimentSettings {
            num_clients: 0,
            ..ExperimentSettings::default()
        }
        .validate()
        .is_err());
        assert!(ExperimentSettings {
            num_rounds: 0,
            ..ExperimentSettings::default()
        }
        .validate()
        .is_err());
        assert!(ExperimentSettings {
            clients_per_round: 0.,
            ..ExperimentSettings::default()
        }
        .validate()
        .is_err());
        assert!(ExperimentSettings {
            clients_per_round: 1. + f64::EPSILON,
            ..ExperimentSettings::default()
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_validate_data() {
        assert!(DataSettings::default().validate().is_ok());
        assert!(DataSettings {
            alpha: 0.,
            ..DataSettings::default()
        }
        .validate()
        .is_err());
        // alpha is irrelevant for IID partitions
        assert!(DataSettings {
            non_iid: false,
            alpha: 0.,
            ..DataSettings::default()
        }
        .validate()
        .is_ok());
        assert!(DataSettings {
            max_redraws: 0,
            ..DataSettings::default()
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_validate_training() {
        assert!(TrainingSettings::default().validate().is_ok());
        assert!(TrainingSettings {
            local_epochs: 0,
            ..TrainingSettings::default()
        }
        .validate()
        .is_err());
        assert!(TrainingSettings {
            var_local_epochs: true,
            var_min_epochs: 6,
            ..TrainingSettings::default()
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_validate_optimizer() {
        assert!(OptimizerSettings::default().validate().is_ok());
        assert!(OptimizerSettings {
            lr: 0.,
            ..OptimizerSettings::default()
        }
        .validate()
        .is_err());
        assert!(OptimizerSettings {
            momentum: 1.,
            ..OptimizerSettings::default()
        }
        .validate()
        .is_err());
        assert!(OptimizerSettings {
            gmf: 1.,
            ..OptimizerSettings::default()
        }
        .validate()
        .is_err());
        assert!(OptimizerSettings {
            mu: -0.1,
            ..OptimizerSettings::default()
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_validate_simulation() {
        assert!(SimulationSettings::default().validate().is_ok());
        assert!(SimulationSettings {
            num_classes: 1,
            ..SimulationSettings::default()
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_aggregation_settings() {
        let optimizer = OptimizerSettings {
            mu: 0.01,
            gmf: 0.5,
            ..OptimizerSettings::default()
        };
        let aggregation = AggregationSettings::from(optimizer);
        assert_eq!(aggregation.prox_mu, 0.01);
        assert_eq!(aggregation.gmf, 0.5);
        assert_eq!(aggregation.lr, optimizer.lr);
    }
}
