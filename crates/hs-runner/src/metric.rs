//! Metric extraction from run output, and the reporter collaborator.

use std::collections::HashMap;
use std::sync::Arc;

use hs_types::{DispatchResult, RunError};
use parking_lot::RwLock;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::dispatch::{CapturedOutput, OutputStream};

/// Sink and lookup for metrics reported by runs.
///
/// Passed explicitly to the collector so a sweep can be driven against a fake
/// or an external tracking service.
pub trait MetricReporter: Send + Sync {
    fn report(&self, run_id: Uuid, name: &str, value: f64);

    /// Most recent value reported for `name` by `run_id`.
    fn latest(&self, run_id: Uuid, name: &str) -> Option<f64>;
}

/// Process-local reporter keeping every reported value.
#[derive(Debug, Default)]
pub struct InMemoryReporter {
    values: RwLock<HashMap<Uuid, HashMap<String, Vec<f64>>>>,
}

impl InMemoryReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn history(&self, run_id: Uuid, name: &str) -> Vec<f64> {
        self.values
            .read()
            .get(&run_id)
            .and_then(|metrics| metrics.get(name))
            .cloned()
            .unwrap_or_default()
    }

    pub fn runs(&self) -> usize {
        self.values.read().len()
    }
}

impl MetricReporter for InMemoryReporter {
    fn report(&self, run_id: Uuid, name: &str, value: f64) {
        self.values
            .write()
            .entry(run_id)
            .or_default()
            .entry(name.to_string())
            .or_default()
            .push(value);
    }

    fn latest(&self, run_id: Uuid, name: &str) -> Option<f64> {
        self.values
            .read()
            .get(&run_id)?
            .get(name)?
            .last()
            .copied()
    }
}

/// Canonical metric key: trimmed, lowercased, inner whitespace as `_`.
pub fn normalize_key(raw: &str) -> String {
    raw.trim()
        .trim_matches(|c| c == '"' || c == '\'')
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .to_lowercase()
}

fn parse_number(raw: &str) -> Option<f64> {
    let token = raw.split_whitespace().next()?;
    let value: f64 = token.parse().ok()?;
    (!value.is_nan()).then_some(value)
}

/// Every `(key, value)` pair a single output line reports.
///
/// Understands JSON object lines (`{"val_loss": 0.41}`), whitespace separated
/// `key=value` tokens, and `Key name: value` segments separated by `,` `;` or
/// `|` (as in `Val loss: 0.4123, Val perplexity: 1.51`).
pub fn parse_line(line: &str) -> Vec<(String, f64)> {
    let trimmed = line.trim();
    if trimmed.starts_with('{') {
        if let Ok(serde_json::Value::Object(object)) = serde_json::from_str(trimmed) {
            return object
                .iter()
                .filter_map(|(k, v)| Some((normalize_key(k), v.as_f64()?)))
                .collect();
        }
    }

    let mut pairs = Vec::new();
    for segment in trimmed.split([',', ';', '|']) {
        if segment.contains('=') {
            // `key = value` and `key=value` tokenize alike.
            let compact = segment.split('=').map(str::trim).collect::<Vec<_>>().join("=");
            for token in compact.split_whitespace() {
                if let Some((key, value)) = token.split_once('=') {
                    if let (false, Some(value)) = (key.is_empty(), parse_number(value)) {
                        pairs.push((normalize_key(key), value));
                    }
                }
            }
        } else if let Some((key, value)) = segment.rsplit_once(':') {
            let key = key.rsplit(':').next().unwrap_or(key);
            let key = normalize_key(key);
            if let (false, Some(value)) = (key.is_empty(), parse_number(value)) {
                pairs.push((key, value));
            }
        }
    }
    pairs
}

/// Pulls the objective metric out of a finished run's output.
#[derive(Clone)]
pub struct MetricCollector {
    reporter: Arc<dyn MetricReporter>,
}

impl MetricCollector {
    pub fn new(reporter: Arc<dyn MetricReporter>) -> Self {
        Self { reporter }
    }

    pub fn reporter(&self) -> &Arc<dyn MetricReporter> {
        &self.reporter
    }

    /// Last value reported for `objective`. The metrics file wins over process
    /// output; the reporter is consulted last for values delivered out of band.
    /// Every parsed metric is forwarded to the reporter.
    pub fn extract(
        &self,
        run_id: Uuid,
        objective: &str,
        output: &CapturedOutput,
    ) -> DispatchResult<f64> {
        let wanted = normalize_key(objective);
        let mut from_file = None;
        let mut from_output = None;

        for line in output.lines() {
            for (key, value) in parse_line(&line.text) {
                trace!(run_id = %run_id, metric = %key, value, "parsed metric");
                self.reporter.report(run_id, &key, value);
                if key == wanted {
                    match line.stream {
                        OutputStream::MetricsFile => from_file = Some(value),
                        OutputStream::Stdout | OutputStream::Stderr => from_output = Some(value),
                    }
                }
            }
        }

        let value = from_file
            .or(from_output)
            .or_else(|| self.reporter.latest(run_id, &wanted));

        match value {
            Some(value) => {
                debug!(run_id = %run_id, metric = %wanted, value, "collected objective");
                Ok(value)
            }
            None => Err(RunError::MissingMetric {
                name: objective.to_string(),
            }),
        }
    }
}

impl std::fmt::Debug for MetricCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricCollector").finish_non_exhaustive()
    }
}
