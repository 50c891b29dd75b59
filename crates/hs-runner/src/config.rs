//! Sweep definition files and their validation.
//!
//! A definition is read once (YAML, or JSON since it is a YAML subset), checked
//! in full, and turned into a [`SweepDefinition`]. Nothing is dispatched from
//! an invalid definition.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hs_optimizer::{GeneratorOptions, ParameterSpace, TrialGenerator};
use hs_types::{config_error, ConfigError, HsResult, Method, Objective, ParameterValue};
use indexmap::IndexMap;
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};

use crate::command::{BoolStyle, CommandTemplate};

fn default_concurrency() -> usize {
    1
}

fn default_exploration_weight() -> f64 {
    0.3
}

fn default_interpreter() -> String {
    "python".to_string()
}

fn default_grace_period_secs() -> u64 {
    10
}

/// Candidate values for one parameter: either a list or a single fixed value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParameterConfig {
    #[serde(default)]
    pub values: Option<Vec<ParameterValue>>,
    #[serde(default)]
    pub value: Option<ParameterValue>,
}

impl ParameterConfig {
    fn candidates(self, name: &str) -> Result<Vec<ParameterValue>, ConfigError> {
        match (self.values, self.value) {
            (Some(values), None) => Ok(values),
            (None, Some(value)) => Ok(vec![value]),
            (Some(_), Some(_)) => Err(config_error!(
                "parameter {name} sets both `values` and `value`"
            )),
            (None, None) => Err(config_error!("parameter {name} needs `values` or `value`")),
        }
    }
}

/// Launch retry policy. Only launch failures are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff_ms: u64,
}

/// The definition file exactly as written.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SweepConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub entity: Option<String>,
    #[serde(default)]
    pub program: Option<String>,
    pub method: Method,
    pub metric: Objective,
    /// Kept as an ordered list so repeated names reach validation.
    #[serde(deserialize_with = "ordered_parameters")]
    pub parameters: Vec<(String, ParameterConfig)>,
    /// Template tokens. Scalars are kept exactly as written, so `1e-4` or
    /// `false` reach the child unchanged.
    #[serde(default)]
    pub command: Option<Vec<String>>,
    #[serde(default)]
    pub defaults: Vec<String>,
    #[serde(default)]
    pub run_cap: Option<usize>,
    #[serde(default)]
    pub max_duration_secs: Option<u64>,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub max_consecutive_failures: Option<usize>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_exploration_weight")]
    pub exploration_weight: f64,
    #[serde(default)]
    pub bool_style: BoolStyle,
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    #[serde(default)]
    pub environment: IndexMap<String, String>,
    #[serde(default)]
    pub run_dir: Option<PathBuf>,
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

fn ordered_parameters<'de, D>(deserializer: D) -> Result<Vec<(String, ParameterConfig)>, D::Error>
where
    D: Deserializer<'de>,
{
    struct OrderedVisitor;

    impl<'de> Visitor<'de> for OrderedVisitor {
        type Value = Vec<(String, ParameterConfig)>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a mapping of parameter names to {values: [...]}")
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut parameters = Vec::with_capacity(map.size_hint().unwrap_or(0));
            while let Some(entry) = map.next_entry::<String, ParameterConfig>()? {
                parameters.push(entry);
            }
            Ok(parameters)
        }
    }

    deserializer.deserialize_map(OrderedVisitor)
}

impl SweepConfig {
    pub fn from_yaml_str(source: &str) -> HsResult<Self> {
        Ok(serde_yaml::from_str(source)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> HsResult<Self> {
        let source = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&source)
    }
}

/// Trial-count and wall-clock limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SweepBudget {
    pub run_cap: Option<usize>,
    pub max_duration: Option<Duration>,
}

/// A fully validated sweep, ready to hand to the controller.
#[derive(Debug, Clone)]
pub struct SweepDefinition {
    pub name: String,
    pub description: Option<String>,
    pub project: Option<String>,
    pub entity: Option<String>,
    pub method: Method,
    pub objective: Objective,
    pub space: ParameterSpace,
    pub template: CommandTemplate,
    pub budget: SweepBudget,
    pub concurrency: usize,
    pub max_consecutive_failures: Option<usize>,
    pub generator: GeneratorOptions,
    pub environment: Vec<(String, String)>,
    pub run_dir: Option<PathBuf>,
    pub grace_period: Duration,
    pub retry: Option<RetryConfig>,
}

impl SweepDefinition {
    pub fn from_yaml_str(source: &str) -> HsResult<Self> {
        Ok(Self::from_config(SweepConfig::from_yaml_str(source)?)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> HsResult<Self> {
        Ok(Self::from_config(SweepConfig::from_path(path)?)?)
    }

    pub fn from_config(config: SweepConfig) -> Result<Self, ConfigError> {
        if config.metric.name.trim().is_empty() {
            return Err(config_error!("metric name must not be empty"));
        }
        if config.concurrency == 0 {
            return Err(config_error!("concurrency must be at least 1"));
        }
        if !(0.0..=1.0).contains(&config.exploration_weight) {
            return Err(config_error!(
                "exploration_weight must be within [0, 1], got {}",
                config.exploration_weight
            ));
        }
        if config.max_consecutive_failures == Some(0) {
            return Err(config_error!("max_consecutive_failures must be at least 1"));
        }
        if matches!(config.retry, Some(RetryConfig { max_attempts: 0, .. })) {
            return Err(config_error!("retry.max_attempts must be at least 1"));
        }

        let mut space = ParameterSpace::new();
        for (name, parameter) in config.parameters {
            let candidates = parameter.candidates(&name)?;
            space.add_parameter(name, candidates)?;
        }
        if space.is_empty() {
            return Err(ConfigError::NoParameters);
        }
        if config.method == Method::Grid && space.size().is_none() {
            return Err(ConfigError::SpaceTooLarge);
        }

        let mut template = match &config.command {
            Some(tokens) => CommandTemplate::parse(tokens),
            None => CommandTemplate::standard(),
        };
        if let Some(program) = &config.program {
            template = template.with_program(program.clone());
        }
        template = template
            .with_interpreter(config.interpreter)
            .with_bool_style(config.bool_style)
            .with_defaults(config.defaults);
        template.validate(&space)?;

        let name = config.name.unwrap_or_else(|| match &config.project {
            Some(project) => format!("{project}-{}", config.method),
            None => format!("{}-sweep", config.method),
        });

        Ok(Self {
            name,
            description: config.description,
            project: config.project,
            entity: config.entity,
            method: config.method,
            objective: config.metric,
            space,
            template,
            budget: SweepBudget {
                run_cap: config.run_cap,
                max_duration: config.max_duration_secs.map(Duration::from_secs),
            },
            concurrency: config.concurrency,
            max_consecutive_failures: config.max_consecutive_failures,
            generator: GeneratorOptions {
                seed: config.seed,
                exploration_weight: config.exploration_weight,
            },
            environment: config.environment.into_iter().collect(),
            run_dir: config.run_dir,
            grace_period: Duration::from_secs(config.grace_period_secs),
            retry: config.retry,
        })
    }

    /// Build the strategy for this sweep's method.
    pub fn trial_generator(&self) -> Result<TrialGenerator, ConfigError> {
        TrialGenerator::new(
            self.space.clone(),
            self.method,
            self.objective.goal,
            self.generator,
        )
    }
}
