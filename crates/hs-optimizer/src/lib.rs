//! # hs-optimizer
//!
//! Parameter spaces and trial generation for Hypersweep.
//!
//! Provides discrete search space definitions, trial generation strategies
//! (grid, random, model-guided), and the per-sweep result bookkeeping used to
//! pick the best trial.

mod search;
mod space;
mod trial;

pub use search::{
    GeneratorOptions, GridSearch, ModelGuidedSearch, PerturbBestProposer, RandomSearch,
    SearchStrategy, TrialGenerator, TrialProposer, MAX_DEDUPLICATED_SPACE,
};
pub use space::{Assignment, ParameterDef, ParameterSpace};
pub use trial::{AbortReason, RunOutcome, RunResult, SweepId, SweepPhase, SweepState, Trial};
