//! Trial generation strategies.

use std::collections::HashMap;

use hs_types::{ConfigError, Goal, Method, SearchError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::space::{Assignment, ParameterSpace};
use crate::trial::{RunResult, Trial};

/// Random search samples without replacement up to this many combinations.
pub const MAX_DEDUPLICATED_SPACE: usize = 1 << 20;

/// Common trait for all search strategies.
pub trait SearchStrategy: Send {
    /// Produce the next assignment, or `None` once the strategy is exhausted.
    fn next_assignment(&mut self, history: &[RunResult]) -> Option<Assignment>;

    /// Report a completed run so adaptive strategies can learn.
    fn observe(&mut self, _result: &RunResult) {}

    /// Size of the finite trial universe, `None` for unbounded strategies.
    fn total(&self) -> Option<usize>;

    /// Assignments still available, `None` for unbounded strategies.
    fn remaining(&self) -> Option<usize>;

    /// Rewind to the first assignment. Returns false if not restartable.
    fn reset(&mut self) -> bool {
        false
    }

    /// Human-readable strategy name.
    fn name(&self) -> &str;
}

// ---- Grid search ----

/// Exhaustive grid search over the cartesian product, last parameter fastest.
#[derive(Debug, Clone)]
pub struct GridSearch {
    space: ParameterSpace,
    total: usize,
    cursor: usize,
}

impl GridSearch {
    pub fn new(space: ParameterSpace) -> Result<Self, ConfigError> {
        let total = space.size().ok_or(ConfigError::SpaceTooLarge)?;
        Ok(Self {
            space,
            total,
            cursor: 0,
        })
    }
}

impl SearchStrategy for GridSearch {
    fn next_assignment(&mut self, _history: &[RunResult]) -> Option<Assignment> {
        let assignment = self.space.assignment_at(self.cursor)?;
        self.cursor += 1;
        Some(assignment)
    }

    fn total(&self) -> Option<usize> {
        Some(self.total)
    }

    fn remaining(&self) -> Option<usize> {
        Some(self.total - self.cursor)
    }

    fn reset(&mut self) -> bool {
        self.cursor = 0;
        true
    }

    fn name(&self) -> &str {
        "grid"
    }
}

// ---- Random search ----

#[derive(Debug, Clone)]
enum Sampler {
    /// Sparse Fisher-Yates over the index space: `swaps` holds only the
    /// positions that differ from the identity permutation.
    WithoutReplacement {
        total: usize,
        drawn: usize,
        swaps: HashMap<usize, usize>,
    },
    WithReplacement,
}

/// Uniform sampling across the product space.
///
/// Spaces of at most [`MAX_DEDUPLICATED_SPACE`] combinations are sampled
/// without replacement and end once every combination has been drawn. Larger
/// spaces are sampled with replacement and never end on their own.
#[derive(Debug, Clone)]
pub struct RandomSearch {
    space: ParameterSpace,
    rng: StdRng,
    sampler: Sampler,
}

impl RandomSearch {
    pub fn new(space: ParameterSpace, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let sampler = match space.size() {
            Some(total) if total <= MAX_DEDUPLICATED_SPACE => Sampler::WithoutReplacement {
                total,
                drawn: 0,
                swaps: HashMap::new(),
            },
            _ => Sampler::WithReplacement,
        };
        Self {
            space,
            rng,
            sampler,
        }
    }

    pub fn is_without_replacement(&self) -> bool {
        matches!(self.sampler, Sampler::WithoutReplacement { .. })
    }

    fn sample_one(&mut self) -> Option<Assignment> {
        match &mut self.sampler {
            Sampler::WithoutReplacement {
                total,
                drawn,
                swaps,
            } => {
                if *drawn == *total {
                    return None;
                }
                let pick = self.rng.random_range(*drawn..*total);
                let index = swaps.get(&pick).copied().unwrap_or(pick);
                let displaced = swaps.get(drawn).copied().unwrap_or(*drawn);
                swaps.insert(pick, displaced);
                swaps.remove(drawn);
                *drawn += 1;
                self.space.assignment_at(index)
            }
            Sampler::WithReplacement => Some(uniform_assignment(&self.space, &mut self.rng)),
        }
    }
}

fn uniform_assignment(space: &ParameterSpace, rng: &mut StdRng) -> Assignment {
    space
        .parameters()
        .iter()
        .map(|param| {
            let idx = rng.random_range(0..param.values.len());
            (param.name.clone(), param.values[idx].clone())
        })
        .collect()
}

impl SearchStrategy for RandomSearch {
    fn next_assignment(&mut self, _history: &[RunResult]) -> Option<Assignment> {
        self.sample_one()
    }

    fn total(&self) -> Option<usize> {
        match &self.sampler {
            Sampler::WithoutReplacement { total, .. } => Some(*total),
            Sampler::WithReplacement => None,
        }
    }

    fn remaining(&self) -> Option<usize> {
        match &self.sampler {
            Sampler::WithoutReplacement { total, drawn, .. } => Some(total - drawn),
            Sampler::WithReplacement => None,
        }
    }

    fn name(&self) -> &str {
        "random"
    }
}

// ---- Model-guided search ----

/// Extension point for model-guided ("bayes") search.
pub trait TrialProposer: Send {
    /// Propose the next assignment given every result reported so far.
    fn propose(&mut self, space: &ParameterSpace, history: &[RunResult]) -> Assignment;

    /// Incorporate one newly completed result.
    fn update(&mut self, _result: &RunResult) {}

    fn name(&self) -> &str;
}

/// Explore/exploit heuristic over discrete candidates.
///
/// With probability `exploration_weight` (or while nothing comparable has been
/// observed) it draws uniformly. Otherwise it takes the best assignment so far
/// and moves one parameter to a neighbouring candidate.
#[derive(Debug, Clone)]
pub struct PerturbBestProposer {
    goal: Goal,
    exploration_weight: f64,
    rng: StdRng,
}

impl PerturbBestProposer {
    pub fn new(goal: Goal, exploration_weight: f64, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            goal,
            exploration_weight: exploration_weight.clamp(0.0, 1.0),
            rng,
        }
    }

    fn best<'a>(&self, history: &'a [RunResult]) -> Option<&'a RunResult> {
        let mut best: Option<&RunResult> = None;
        for result in history {
            let Some(value) = result.metric() else {
                continue;
            };
            let better = match best.and_then(RunResult::metric) {
                None => true,
                Some(incumbent) => self.goal.improves(value, incumbent),
            };
            if better {
                best = Some(result);
            }
        }
        best
    }
}

impl TrialProposer for PerturbBestProposer {
    fn propose(&mut self, space: &ParameterSpace, history: &[RunResult]) -> Assignment {
        let explore = self.rng.random::<f64>() < self.exploration_weight;
        let base = match self.best(history) {
            Some(best) if !explore => best.trial.parameters.clone(),
            _ => return uniform_assignment(space, &mut self.rng),
        };

        let mut proposal = base;
        if space.is_empty() {
            return proposal;
        }
        let param = &space.parameters()[self.rng.random_range(0..space.len())];
        let len = param.values.len();
        if len > 1 {
            let current = proposal
                .get(&param.name)
                .and_then(|v| space.candidate_index(&param.name, v))
                .unwrap_or(0);
            let next = if current == 0 {
                1
            } else if current == len - 1 || self.rng.random_bool(0.5) {
                current - 1
            } else {
                current + 1
            };
            proposal.insert(param.name.clone(), param.values[next].clone());
        }
        proposal
    }

    fn name(&self) -> &str {
        "perturb_best"
    }
}

/// Model-guided search: delegates every proposal to a [`TrialProposer`].
pub struct ModelGuidedSearch {
    space: ParameterSpace,
    proposer: Box<dyn TrialProposer>,
}

impl ModelGuidedSearch {
    pub fn new(space: ParameterSpace, proposer: Box<dyn TrialProposer>) -> Self {
        Self { space, proposer }
    }
}

impl SearchStrategy for ModelGuidedSearch {
    fn next_assignment(&mut self, history: &[RunResult]) -> Option<Assignment> {
        if self.space.is_empty() {
            return None;
        }
        Some(self.proposer.propose(&self.space, history))
    }

    fn observe(&mut self, result: &RunResult) {
        self.proposer.update(result);
    }

    fn total(&self) -> Option<usize> {
        None
    }

    fn remaining(&self) -> Option<usize> {
        None
    }

    fn name(&self) -> &str {
        "bayes"
    }
}

// ---------------------------------------------------------------------------
// Trial generator
// ---------------------------------------------------------------------------

/// Knobs for the randomized strategies.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeneratorOptions {
    pub seed: Option<u64>,
    /// Exploration weight for model-guided search (ignored for grid/random).
    pub exploration_weight: f64,
}

impl Default for GeneratorOptions {
    fn default() -> Self {
        Self {
            seed: None,
            exploration_weight: 0.3,
        }
    }
}

/// Turns a strategy's assignments into numbered [`Trial`]s.
///
/// The strategy variant is chosen once here; callers never branch on the
/// method again.
pub struct TrialGenerator {
    method: Method,
    strategy: Box<dyn SearchStrategy>,
    issued: usize,
}

impl TrialGenerator {
    pub fn new(
        space: ParameterSpace,
        method: Method,
        goal: Goal,
        options: GeneratorOptions,
    ) -> Result<Self, ConfigError> {
        if space.is_empty() {
            return Err(ConfigError::NoParameters);
        }
        let strategy: Box<dyn SearchStrategy> = match method {
            Method::Grid => Box::new(GridSearch::new(space)?),
            Method::Random => Box::new(RandomSearch::new(space, options.seed)),
            Method::Bayes => {
                let proposer =
                    PerturbBestProposer::new(goal, options.exploration_weight, options.seed);
                Box::new(ModelGuidedSearch::new(space, Box::new(proposer)))
            }
        };
        Ok(Self::from_strategy(method, strategy))
    }

    pub fn from_strategy(method: Method, strategy: Box<dyn SearchStrategy>) -> Self {
        Self {
            method,
            strategy,
            issued: 0,
        }
    }

    pub fn next_trial(&mut self, history: &[RunResult]) -> Option<Trial> {
        let assignment = self.strategy.next_assignment(history)?;
        let trial = Trial::new(self.issued, assignment);
        self.issued += 1;
        debug!(
            strategy = self.strategy.name(),
            trial = trial.number,
            "generated trial"
        );
        Some(trial)
    }

    /// Up to `count` trials; fewer if the strategy runs out.
    pub fn suggest(&mut self, count: usize, history: &[RunResult]) -> Vec<Trial> {
        (0..count)
            .map_while(|_| self.next_trial(history))
            .collect()
    }

    /// Exactly `count` trials, or `ExhaustedSpace` without consuming any.
    pub fn suggest_exact(
        &mut self,
        count: usize,
        history: &[RunResult],
    ) -> Result<Vec<Trial>, SearchError> {
        if let Some(available) = self.strategy.remaining() {
            if available < count {
                return Err(SearchError::ExhaustedSpace {
                    requested: count,
                    available,
                });
            }
        }
        Ok(self.suggest(count, history))
    }

    pub fn observe(&mut self, result: &RunResult) {
        self.strategy.observe(result);
    }

    /// Rewind a restartable strategy. Trial numbering restarts too.
    pub fn restart(&mut self) -> bool {
        let restarted = self.strategy.reset();
        if restarted {
            self.issued = 0;
        }
        restarted
    }

    /// Size of the finite trial universe (`None` if unbounded).
    pub fn size(&self) -> Option<usize> {
        self.strategy.total()
    }

    pub fn remaining(&self) -> Option<usize> {
        self.strategy.remaining()
    }

    pub fn issued(&self) -> usize {
        self.issued
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn strategy_name(&self) -> &str {
        self.strategy.name()
    }
}

impl std::fmt::Debug for TrialGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrialGenerator")
            .field("method", &self.method)
            .field("strategy", &self.strategy.name())
            .field("issued", &self.issued)
            .finish()
    }
}
